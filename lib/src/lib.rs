//! Inject profiling spans into compiled CIL assemblies
//!
//! Given an assembly, the per-frame callbacks of engine behaviours (`Update`, `LateUpdate`,
//! `FixedUpdate`) get their IL rewritten so that they open a named profiler span on entry and
//! close it on every way out:
//!
//!   - [`metadata`] is the in-memory assembly model and its on-disk container
//!   - [`cil`] decodes method bodies into editable instruction streams and encodes them back
//!   - [`inject`] selects the methods and rewrites their bodies
//!   - [`resolve`] finds referenced assemblies so that base types can be followed across them
//!   - [`symbols`] keeps debug symbols in sync with the rewritten code
//!   - [`batch`] drives all of the above over files on disk

pub mod batch;
pub mod binary_format;
pub mod cil;
mod errors;
pub mod inject;
pub mod metadata;
pub mod resolve;
pub mod symbols;

pub use errors::*;
