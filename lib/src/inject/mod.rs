//! Span injection
//!
//! Instrumenting an assembly happens at three levels:
//!
//!   - [`AssemblyWalker`] decides which methods to touch (using a [`HookSelector`]), marks the
//!     assembly as processed, and imports the span callees into each module that needs them
//!   - [`SpanInjector`] wraps one method body in a `begin`/`end` span
//!   - [`normalize_exits`] funnels every return of a body through one `call end; ret` tail so
//!     that the span is closed no matter which return was taken
//!
//! The result for a method like
//!
//! ```text,ignore,no_run
//! IL_0000: ldarg.0
//! IL_0001: brfalse.s IL_0004
//! IL_0003: ret
//! IL_0004: ...
//! IL_0010: ret
//! ```
//!
//! is
//!
//! ```text,ignore,no_run
//! IL_0000: ldstr "Profilator->Game.Player.Update"
//! IL_0005: call void [UnityEngine]UnityEngine.Profiling.Profiler::BeginSample(string)
//! IL_000a: ldarg.0
//! IL_000b: brfalse.s IL_000f
//! IL_000d: leave.s IL_001c
//! IL_000f: ...
//! IL_001a: leave.s IL_001c
//! IL_001c: call void [UnityEngine]UnityEngine.Profiling.Profiler::EndSample()
//! IL_0021: ret
//! ```

mod injector;
mod normalizer;
mod selector;
mod settings;
mod walker;

pub use injector::*;
pub use normalizer::*;
pub use selector::*;
pub use settings::*;
pub use walker::*;
