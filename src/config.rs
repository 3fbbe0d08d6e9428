use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the usage-limit heuristic looks for its textual marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UsageLimitScope {
    /// Text of the Continue button's nearby ancestors.
    #[default]
    Colocated,
    /// Text of the whole body.
    Document,
}

/// Tunables for the observers. Every field has a default, so a partial JSON
/// object (e.g. inside a scenario file) is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObserverConfig {
    pub debounce_ms: u64,
    /// Settle period after attach during which a Continue button is never clicked.
    pub continue_grace_ms: u64,
    /// Approve a permission modal that is already open when the observer attaches.
    pub modal_click_preexisting: bool,
    /// Minimum gap between two modal approvals.
    pub modal_backoff_ms: u64,
    /// Write marker elements instead of clicking.
    pub inert: bool,
    pub notification_title: String,
    pub notification_message: String,
    pub busy_icon: String,
    pub ping_icon: String,
    pub usage_limit_phrases: Vec<String>,
    pub usage_limit_scope: UsageLimitScope,
    /// How many ancestors above the Continue button count as "co-located".
    pub usage_limit_depth: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            continue_grace_ms: 3000,
            modal_click_preexisting: true,
            modal_backoff_ms: 1000,
            inert: false,
            notification_title: "Claude Response Complete".into(),
            notification_message: "Your Claude response has finished generating.".into(),
            busy_icon: "images/favicon-busy.png".into(),
            ping_icon: "images/favicon-ping.png".into(),
            usage_limit_phrases: vec![
                "usage limit".into(),
                "message limit".into(),
                "out of free messages".into(),
                "limit will reset".into(),
            ],
            usage_limit_scope: UsageLimitScope::default(),
            usage_limit_depth: 3,
        }
    }
}

impl ObserverConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn continue_grace(&self) -> Duration {
        Duration::from_millis(self.continue_grace_ms)
    }

    pub fn modal_backoff(&self) -> Duration {
        Duration::from_millis(self.modal_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_tuned_range() {
        let c = ObserverConfig::default();
        assert!((100..=300).contains(&c.debounce_ms));
        assert!(c.continue_grace() > c.debounce());
        assert!(!c.inert);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: ObserverConfig =
            serde_json::from_str(r#"{"debounceMs": 200, "usageLimitScope": "document"}"#).unwrap();
        assert_eq!(c.debounce_ms, 200);
        assert_eq!(c.usage_limit_scope, UsageLimitScope::Document);
        assert_eq!(c.continue_grace_ms, 3000);
        assert_eq!(c.modal_backoff(), Duration::from_secs(1));
    }
}
