use crate::Error;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Prefix of every span label (eg. `Profilator` gives `Profilator->Game.Player.Update`)
    pub label_prefix: String,

    /// Full name of the assembly-level attribute marking an assembly as already instrumented
    pub marker_attribute: String,

    /// Static method called with the span label when a span opens
    ///
    /// The method must take a single `string` and return `void`.
    pub begin: CalleeRef,

    /// Static method called when a span closes
    ///
    /// The method must take no arguments and return `void`.
    pub end: CalleeRef,

    /// Types whose name contains any of these are never instrumented
    ///
    /// This keeps the profiler plumbing itself (and the post-processor, should it end up in a
    /// processed assembly) from getting wrapped in spans.
    pub excluded_type_fragments: Vec<String>,
}

impl Settings {
    pub const DEFAULT_LABEL_PREFIX: &'static str = "Profilator";
    pub const DEFAULT_MARKER_ATTRIBUTE: &'static str = "ProfilerPostProcessedAssemblyAttribute";
    pub const DEFAULT_BEGIN: &'static str = "[UnityEngine]UnityEngine.Profiling.Profiler::BeginSample";
    pub const DEFAULT_END: &'static str = "[UnityEngine]UnityEngine.Profiling.Profiler::EndSample";
    pub const DEFAULT_EXCLUDED_TYPE_FRAGMENTS: [&'static str; 3] =
        ["AssemblyPostProcessor", "RamjetProfiler", "ilspan"];

    pub fn new() -> Settings {
        Settings {
            label_prefix: String::from(Self::DEFAULT_LABEL_PREFIX),
            marker_attribute: String::from(Self::DEFAULT_MARKER_ATTRIBUTE),
            begin: CalleeRef {
                assembly: String::from("UnityEngine"),
                namespace: String::from("UnityEngine.Profiling"),
                type_name: String::from("Profiler"),
                method: String::from("BeginSample"),
            },
            end: CalleeRef {
                assembly: String::from("UnityEngine"),
                namespace: String::from("UnityEngine.Profiling"),
                type_name: String::from("Profiler"),
                method: String::from("EndSample"),
            },
            excluded_type_fragments: Self::DEFAULT_EXCLUDED_TYPE_FRAGMENTS
                .iter()
                .map(|fragment| String::from(*fragment))
                .collect(),
        }
    }

    /// Is this type part of the profiler plumbing?
    pub fn is_excluded_type(&self, type_name: &str) -> bool {
        self.excluded_type_fragments
            .iter()
            .any(|fragment| type_name.contains(fragment.as_str()))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

/// Static method in some assembly, written as `[Assembly]Namespace.Type::Method`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalleeRef {
    pub assembly: String,

    /// Empty for types in the global namespace
    pub namespace: String,
    pub type_name: String,
    pub method: String,
}

impl CalleeRef {
    pub fn parse(name: &str) -> Result<CalleeRef, Error> {
        let malformed = || Error::MalformedCallee(name.to_owned());

        let rest = name.strip_prefix('[').ok_or_else(malformed)?;
        let (assembly, rest) = rest.split_once(']').ok_or_else(malformed)?;
        let (type_full_name, method) = rest.split_once("::").ok_or_else(malformed)?;
        let (namespace, type_name) = match type_full_name.rsplit_once('.') {
            Some((namespace, type_name)) => (namespace, type_name),
            None => ("", type_full_name),
        };

        let parts = [assembly, type_name, method];
        if parts.iter().any(|part| part.is_empty() || part.contains(char::is_whitespace))
            || method.contains(':')
            || type_full_name.split('.').any(str::is_empty)
        {
            return Err(malformed());
        }

        Ok(CalleeRef {
            assembly: assembly.to_owned(),
            namespace: namespace.to_owned(),
            type_name: type_name.to_owned(),
            method: method.to_owned(),
        })
    }

    pub fn type_full_name(&self) -> String {
        if self.namespace.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}.{}", self.namespace, self.type_name)
        }
    }
}

impl fmt::Display for CalleeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}::{}", self.assembly, self.type_full_name(), self.method)
    }
}
