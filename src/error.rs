use thiserror::Error;

use crate::dom::NodeId;

/// Failures the observer loop recovers from locally. None of them is fatal
/// to a page context; callers log and carry on.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("cross-origin access denied while inspecting {context}")]
    CrossOriginAccessDenied { context: String },

    #[error("messaging failed: {0}")]
    Messaging(String),

    #[error("side effect '{effect}' failed: {reason}")]
    SideEffect { effect: &'static str, reason: String },

    #[error("element {0} is no longer attached to the document")]
    ElementDetached(NodeId),
}

impl ObserverError {
    pub fn side_effect(effect: &'static str, reason: impl Into<String>) -> Self {
        Self::SideEffect {
            effect,
            reason: reason.into(),
        }
    }
}
