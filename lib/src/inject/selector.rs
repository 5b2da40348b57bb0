use crate::metadata::{MethodDef, TypeSig};

/// Decides which methods get wrapped in spans
pub trait HookSelector {
    /// Should methods of a type with these declared ancestors (nearest first) be considered?
    fn is_hook_host(&self, ancestry: &[String]) -> bool;

    /// Should this method of a hook host be instrumented?
    fn is_hook(&self, method: &MethodDef) -> bool;
}

/// Selects the per-frame callbacks of engine behaviours
///
/// A type is a host if any of its ancestors has a full name containing [`Self::base_fragment`],
/// and a method is a hook if it has a body, takes no parameters, returns `void`, and has one of
/// the [`Self::hook_names`]. Spans close through a shared exit that can't carry a return value,
/// so value-returning methods are never hooks.
#[derive(Debug, Clone)]
pub struct FrameHookSelector {
    pub base_fragment: String,
    pub hook_names: Vec<String>,
}

impl FrameHookSelector {
    pub const DEFAULT_BASE_FRAGMENT: &'static str = "UnityEngine.MonoBehaviour";
    pub const DEFAULT_HOOK_NAMES: [&'static str; 3] = ["Update", "LateUpdate", "FixedUpdate"];

    pub fn new() -> FrameHookSelector {
        FrameHookSelector {
            base_fragment: String::from(Self::DEFAULT_BASE_FRAGMENT),
            hook_names: Self::DEFAULT_HOOK_NAMES
                .iter()
                .map(|name| String::from(*name))
                .collect(),
        }
    }

    pub fn with_base_fragment(base_fragment: impl Into<String>) -> FrameHookSelector {
        FrameHookSelector {
            base_fragment: base_fragment.into(),
            ..FrameHookSelector::new()
        }
    }
}

impl Default for FrameHookSelector {
    fn default() -> Self {
        FrameHookSelector::new()
    }
}

impl HookSelector for FrameHookSelector {
    fn is_hook_host(&self, ancestry: &[String]) -> bool {
        ancestry
            .iter()
            .any(|ancestor| ancestor.contains(self.base_fragment.as_str()))
    }

    fn is_hook(&self, method: &MethodDef) -> bool {
        method.has_body()
            && method.parameter_count() == 0
            && method.signature.return_type == TypeSig::Void
            && self.hook_names.iter().any(|name| *name == method.name)
    }
}
