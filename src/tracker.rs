//! Per-concern state tracking.
//!
//! Each concern owns one [`TrackedConcern`]. Re-evaluation feeds it a freshly
//! classified [`ObservedState`]; the tracker decides whether that is a
//! transition, a first sighting, or noise.

use std::fmt;

use serde::Serialize;

use crate::debounce::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcernKind {
    Modal,
    Response,
    Continue,
}

impl ConcernKind {
    pub const ALL: [ConcernKind; 3] = [ConcernKind::Modal, ConcernKind::Response, ConcernKind::Continue];
}

impl fmt::Display for ConcernKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modal => write!(f, "modal"),
            Self::Response => write!(f, "response"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

/// Semantic classification of the document with respect to one concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ObservedState {
    Unknown,
    ButtonRunning,
    ButtonStopped,
    ModalPresent,
    ModalAbsent,
    ContinueEligible,
    ContinueIneligible,
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::ButtonRunning => "RUNNING",
            Self::ButtonStopped => "STOPPED",
            Self::ModalPresent => "PRESENT",
            Self::ModalAbsent => "ABSENT",
            Self::ContinueEligible => "ELIGIBLE",
            Self::ContinueIneligible => "INELIGIBLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub concern: ConcernKind,
    pub from: ObservedState,
    pub to: ObservedState,
}

impl Transition {
    pub fn is(&self, from: ObservedState, to: ObservedState) -> bool {
        self.from == from && self.to == to
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.from, self.to)
    }
}

/// Outcome of feeding one classification into a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Classification was `Unknown`; history is left untouched.
    Unclassified,
    /// Same state as last time.
    Unchanged(ObservedState),
    /// First concrete state ever seen. Never a side-effect trigger.
    FirstTracked(ObservedState),
    Changed(Transition),
}

#[derive(Debug, Clone)]
pub struct TrackedConcern {
    pub kind: ConcernKind,
    pub last_state: ObservedState,
    pub last_effect_fired_for_state: Option<ObservedState>,
    pub pending_timer: Option<TimerHandle>,
}

impl TrackedConcern {
    pub fn new(kind: ConcernKind) -> Self {
        Self {
            kind,
            last_state: ObservedState::Unknown,
            last_effect_fired_for_state: None,
            pending_timer: None,
        }
    }

    pub fn observe(&mut self, new_state: ObservedState) -> Observation {
        if new_state == ObservedState::Unknown {
            return Observation::Unclassified;
        }
        if self.last_state == ObservedState::Unknown {
            self.last_state = new_state;
            return Observation::FirstTracked(new_state);
        }
        if new_state == self.last_state {
            return Observation::Unchanged(new_state);
        }
        let transition = Transition {
            concern: self.kind,
            from: self.last_state,
            to: new_state,
        };
        self.last_state = new_state;
        Observation::Changed(transition)
    }

    /// Claim the right to fire the effect for `state`. Returns false when it
    /// has already been fired for that state.
    pub fn claim_effect(&mut self, state: ObservedState) -> bool {
        if self.last_effect_fired_for_state == Some(state) {
            return false;
        }
        self.last_effect_fired_for_state = Some(state);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ObservedState::*;

    #[test]
    fn first_sighting_is_not_a_transition() {
        let mut t = TrackedConcern::new(ConcernKind::Response);
        assert_eq!(t.observe(ButtonStopped), Observation::FirstTracked(ButtonStopped));
        assert_eq!(t.last_state, ButtonStopped);
    }

    #[test]
    fn unknown_never_overwrites_history() {
        let mut t = TrackedConcern::new(ConcernKind::Response);
        t.observe(ButtonRunning);
        assert_eq!(t.observe(Unknown), Observation::Unclassified);
        assert_eq!(t.last_state, ButtonRunning);
        assert_eq!(t.observe(ButtonRunning), Observation::Unchanged(ButtonRunning));
    }

    #[test]
    fn unknown_before_first_sighting_is_ignored() {
        let mut t = TrackedConcern::new(ConcernKind::Modal);
        assert_eq!(t.observe(Unknown), Observation::Unclassified);
        assert_eq!(t.last_state, Unknown);
    }

    #[test]
    fn genuine_change_is_reported_once() {
        let mut t = TrackedConcern::new(ConcernKind::Response);
        t.observe(ButtonRunning);
        let Observation::Changed(tr) = t.observe(ButtonStopped) else {
            panic!("expected transition");
        };
        assert!(tr.is(ButtonRunning, ButtonStopped));
        assert_eq!(tr.to_string(), "RUNNING → STOPPED");
        assert_eq!(t.observe(ButtonStopped), Observation::Unchanged(ButtonStopped));
    }

    #[test]
    fn effect_claims_are_per_state() {
        let mut t = TrackedConcern::new(ConcernKind::Response);
        assert!(t.claim_effect(ButtonStopped));
        assert!(!t.claim_effect(ButtonStopped));
        assert!(t.claim_effect(ButtonRunning));
        assert!(t.claim_effect(ButtonStopped));
    }
}
