//! Continue-button eligibility.
//!
//! A Continue button is only worth clicking right after the assistant has
//! finished a response that this observer saw running. Buttons that were
//! already on screen while the page settled are left alone, and a visible
//! usage-limit notice vetoes everything.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::classify;
use crate::config::{ObserverConfig, UsageLimitScope};
use crate::dom::{Document, NodeId, NodeIdentity};
use crate::tracker::{ObservedState, Transition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuePhase {
    /// Observer not attached yet.
    Unknown,
    /// Inside the settle window after attach.
    PageLoading,
    Eligible,
}

/// Pluggable veto on clicking a particular Continue button.
pub trait IneligibleOverride: Send {
    fn is_ineligible(&self, doc: &Document, candidate: NodeId) -> bool;
}

/// Looks for a usage-limit phrase in the text of the button's nearby
/// ancestors, i.e. the same message bubble.
#[derive(Debug, Clone)]
pub struct UsageLimitMarker {
    phrases: Vec<String>,
    depth: usize,
}

impl UsageLimitMarker {
    pub fn new(phrases: &[String], depth: usize) -> Self {
        Self {
            phrases: phrases.iter().map(|p| p.to_lowercase()).collect(),
            depth,
        }
    }
}

impl IneligibleOverride for UsageLimitMarker {
    fn is_ineligible(&self, doc: &Document, candidate: NodeId) -> bool {
        doc.ancestors(candidate)
            .take(self.depth)
            .any(|a| mentions_any(&doc.text_content(a), &self.phrases))
    }
}

/// Looks for a usage-limit phrase anywhere in the body.
#[derive(Debug, Clone)]
pub struct DocumentTextMarker {
    phrases: Vec<String>,
}

impl DocumentTextMarker {
    pub fn new(phrases: &[String]) -> Self {
        Self {
            phrases: phrases.iter().map(|p| p.to_lowercase()).collect(),
        }
    }
}

impl IneligibleOverride for DocumentTextMarker {
    fn is_ineligible(&self, doc: &Document, _candidate: NodeId) -> bool {
        doc.body()
            .is_some_and(|b| mentions_any(&doc.text_content(b), &self.phrases))
    }
}

fn mentions_any(text: &str, phrases: &[String]) -> bool {
    let text = text.to_lowercase();
    phrases.iter().any(|p| text.contains(p.as_str()))
}

pub fn override_from_config(config: &ObserverConfig) -> Box<dyn IneligibleOverride> {
    match config.usage_limit_scope {
        UsageLimitScope::Colocated => Box::new(UsageLimitMarker::new(
            &config.usage_limit_phrases,
            config.usage_limit_depth,
        )),
        UsageLimitScope::Document => Box::new(DocumentTextMarker::new(&config.usage_limit_phrases)),
    }
}

/// Outcome of one eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContinueDecision {
    NoCandidate,
    /// Found while the page was still settling.
    PageLoading { deferred: bool },
    UsageLimit,
    ResponseRunning,
    Disabled,
    /// The button itself is disabled; the arm is kept for when it enables.
    ButtonDisabled,
    /// No qualifying RUNNING → STOPPED transition since attach.
    NotArmed { preexisting: bool },
    AlreadyClicked,
    Click(NodeId),
}

impl ContinueDecision {
    pub fn state(&self) -> ObservedState {
        match self {
            Self::Click(_) => ObservedState::ContinueEligible,
            _ => ObservedState::ContinueIneligible,
        }
    }

    /// Short reason for skip decisions.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoCandidate => "no button",
            Self::PageLoading { .. } => "page loading",
            Self::UsageLimit => "usage limit reached",
            Self::ResponseRunning => "response still running",
            Self::Disabled => "auto-continue disabled",
            Self::ButtonDisabled => "button disabled",
            Self::NotArmed { preexisting: true } => "present since page load",
            Self::NotArmed { preexisting: false } => "no completed response since attach",
            Self::AlreadyClicked => "already clicked",
            Self::Click(_) => "eligible",
        }
    }
}

pub struct ContinuePolicy {
    attached_at: Option<Instant>,
    grace: Duration,
    armed: bool,
    preexisting: HashSet<NodeIdentity>,
    veto: Box<dyn IneligibleOverride>,
}

impl ContinuePolicy {
    pub fn new(config: &ObserverConfig) -> Self {
        Self::with_override(config.continue_grace(), override_from_config(config))
    }

    pub fn with_override(grace: Duration, veto: Box<dyn IneligibleOverride>) -> Self {
        Self {
            attached_at: None,
            grace,
            armed: false,
            preexisting: HashSet::new(),
            veto,
        }
    }

    pub fn attach(&mut self, now: Instant) {
        self.attached_at = Some(now);
    }

    pub fn phase(&self, now: Instant) -> ContinuePhase {
        match self.attached_at {
            None => ContinuePhase::Unknown,
            Some(t) if now < t + self.grace => ContinuePhase::PageLoading,
            Some(_) => ContinuePhase::Eligible,
        }
    }

    /// When the settle window closes, if attached.
    pub fn grace_deadline(&self) -> Option<Instant> {
        self.attached_at.map(|t| t + self.grace)
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Feed a genuine response transition. First sightings never get here.
    pub fn on_response_transition(&mut self, transition: &Transition) {
        if transition.is(ObservedState::ButtonRunning, ObservedState::ButtonStopped) {
            self.armed = true;
            self.preexisting.clear();
        } else if transition.is(ObservedState::ButtonStopped, ObservedState::ButtonRunning) {
            self.armed = false;
        }
    }

    /// Decide what to do about the Continue buttons currently in `doc`.
    ///
    /// `response` is the freshest concrete response state; `clicked` holds
    /// identities that were already activated.
    pub fn evaluate(
        &mut self,
        doc: &Document,
        now: Instant,
        response: ObservedState,
        auto_continue_enabled: bool,
        clicked: &HashSet<NodeIdentity>,
    ) -> ContinueDecision {
        let candidates = classify::find_continue_buttons(doc);
        if candidates.is_empty() {
            return ContinueDecision::NoCandidate;
        }

        if self.phase(now) != ContinuePhase::Eligible {
            if self.armed {
                return ContinueDecision::PageLoading { deferred: true };
            }
            self.preexisting
                .extend(candidates.iter().map(|&c| doc.identity(c)));
            return ContinueDecision::PageLoading { deferred: false };
        }

        let mut last = ContinueDecision::AlreadyClicked;
        for &candidate in &candidates {
            let identity = doc.identity(candidate);
            if clicked.contains(&identity) {
                continue;
            }
            last = if self.veto.is_ineligible(doc, candidate) {
                ContinueDecision::UsageLimit
            } else if response == ObservedState::ButtonRunning {
                ContinueDecision::ResponseRunning
            } else if !auto_continue_enabled {
                ContinueDecision::Disabled
            } else if classify::is_disabled(doc, candidate) {
                ContinueDecision::ButtonDisabled
            } else if !self.armed {
                ContinueDecision::NotArmed {
                    preexisting: self.preexisting.contains(&identity),
                }
            } else {
                self.armed = false;
                return ContinueDecision::Click(candidate);
            };
        }
        last
    }
}
