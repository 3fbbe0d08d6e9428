//! The observer loop for one page context.
//!
//! [`ObserverController`] owns the three concerns and everything they need.
//! It is driven from outside: the caller delivers mutation batches, asks for
//! the next timer deadline, and calls [`ObserverController::on_timer`] when
//! it is reached. Re-evaluation always reads the document it is handed at
//! that moment, never a node kept from an earlier batch.

use std::time::Instant;

use crate::classify;
use crate::config::ObserverConfig;
use crate::debounce::{DebounceScheduler, TimerHandle};
use crate::dispatch::{DispatchMode, PageHost, TransitionDispatcher};
use crate::dom::{Document, NodeId};
use crate::eligibility::{ContinueDecision, ContinuePolicy, IneligibleOverride};
use crate::environment::{self, FrameView, ParentAccess};
use crate::journal::Journal;
use crate::mutation::{self, MutationRecord, WatchConfig};
use crate::settings::Settings;
use crate::tracker::{ConcernKind, Observation, ObservedState, TrackedConcern, Transition};

pub struct ObserverController<H> {
    host: H,
    config: ObserverConfig,
    settings: Settings,
    scheduler: DebounceScheduler,
    modal: TrackedConcern,
    response: TrackedConcern,
    continue_button: TrackedConcern,
    /// End of the Continue settle window.
    grace_timer: Option<TimerHandle>,
    policy: ContinuePolicy,
    dispatcher: TransitionDispatcher,
    journal: Journal,
    transitions: Vec<Transition>,
    scope: Option<String>,
    installed: bool,
}

impl<H: PageHost> ObserverController<H> {
    pub fn new(host: H, config: ObserverConfig, settings: Settings) -> Self {
        let mode = if config.inert {
            DispatchMode::Inert
        } else {
            DispatchMode::Live
        };
        Self {
            host,
            policy: ContinuePolicy::new(&config),
            dispatcher: TransitionDispatcher::new(&config, mode),
            config,
            settings,
            scheduler: DebounceScheduler::new(),
            modal: TrackedConcern::new(ConcernKind::Modal),
            response: TrackedConcern::new(ConcernKind::Response),
            continue_button: TrackedConcern::new(ConcernKind::Continue),
            grace_timer: None,
            journal: Journal::new(),
            transitions: Vec::new(),
            scope: None,
            installed: false,
        }
    }

    /// Watch the subtree matching `selector` instead of the whole body.
    pub fn scoped_to(mut self, selector: impl Into<String>) -> Self {
        self.scope = Some(selector.into());
        self
    }

    /// Replace the usage-limit heuristic.
    pub fn with_override(mut self, veto: Box<dyn IneligibleOverride>) -> Self {
        self.policy = ContinuePolicy::with_override(self.config.continue_grace(), veto);
        self
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn dispatcher(&self) -> &TransitionDispatcher {
        &self.dispatcher
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn tracked(&self, kind: ConcernKind) -> &TrackedConcern {
        match kind {
            ConcernKind::Modal => &self.modal,
            ConcernKind::Response => &self.response,
            ConcernKind::Continue => &self.continue_button,
        }
    }

    fn tracked_mut(&mut self, kind: ConcernKind) -> &mut TrackedConcern {
        match kind {
            ConcernKind::Modal => &mut self.modal,
            ConcernKind::Response => &mut self.response,
            ConcernKind::Continue => &mut self.continue_button,
        }
    }

    /// Root the subscriptions are attached to.
    pub fn watch_root(&self, doc: &Document) -> Option<NodeId> {
        match &self.scope {
            Some(selector) => doc
                .query_selector(doc.root(), selector)
                .ok()
                .flatten()
                .or_else(|| doc.body()),
            None => doc.body(),
        }
    }

    /// Initial synchronous scan, then start listening.
    pub fn install(&mut self, doc: &mut Document, now: Instant) {
        self.install_with_parent(doc, ParentAccess::TopLevel, now);
    }

    /// [`install`](Self::install) for a context embedded in another document.
    /// Replay detection also looks at the parent when `parent` allows it.
    pub fn install_with_parent(&mut self, doc: &mut Document, parent: ParentAccess<'_>, now: Instant) {
        if self.installed {
            return;
        }
        if !environment::mark_injected(doc) {
            self.journal
                .info(None, "Observer already injected into this context, skipping");
            return;
        }
        self.journal.info(None, "Setting up response state observer");
        let replay = FrameView {
            doc: &*doc,
            parent,
            frame_id: None,
        }
        .is_replay(&mut self.journal);
        if replay && self.dispatcher.mode() == DispatchMode::Live {
            self.journal
                .info(None, "Replay environment detected, running in test mode");
            self.dispatcher.set_mode(DispatchMode::Inert);
        }
        self.dispatcher.capture_favicon(doc);
        self.policy.attach(now);

        for kind in [ConcernKind::Response, ConcernKind::Modal, ConcernKind::Continue] {
            self.evaluate(kind, doc, now);
        }
        if let Some(deadline) = self.policy.grace_deadline() {
            let delay = deadline.saturating_duration_since(now);
            self.scheduler.schedule(&mut self.grace_timer, now, delay);
        }

        self.installed = true;
        self.journal.info(ConcernKind::Modal, "Modal observer set up");
        self.journal
            .info(ConcernKind::Response, "Response state observer setup complete");
    }

    /// Deliver one batch of mutation records. Returns the concerns that were
    /// (re)scheduled.
    pub fn on_mutations(&mut self, doc: &Document, batch: &[MutationRecord], now: Instant) -> Vec<ConcernKind> {
        if !self.installed || batch.is_empty() {
            return vec![];
        }
        let Some(root) = self.watch_root(doc) else {
            return vec![];
        };
        let mut touched = Vec::new();
        for kind in ConcernKind::ALL {
            let watch = WatchConfig::for_concern(kind);
            let admitted: Vec<MutationRecord> = batch
                .iter()
                .filter(|r| watch.admits(doc, root, r))
                .cloned()
                .collect();
            if !admitted.is_empty() && mutation::is_relevant(doc, &admitted, kind) {
                self.schedule(kind, now);
                touched.push(kind);
            }
        }
        touched
    }

    /// Reschedule every concern, for batches that could not be inspected.
    pub fn schedule_all(&mut self, now: Instant) {
        for kind in ConcernKind::ALL {
            self.schedule(kind, now);
        }
    }

    pub fn schedule(&mut self, kind: ConcernKind, now: Instant) {
        let delay = self.config.debounce();
        let slot = match kind {
            ConcernKind::Modal => &mut self.modal.pending_timer,
            ConcernKind::Response => &mut self.response.pending_timer,
            ConcernKind::Continue => &mut self.continue_button.pending_timer,
        };
        self.scheduler.schedule(slot, now, delay);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    pub fn has_pending_timers(&self) -> bool {
        self.scheduler.pending() > 0
    }

    /// Run every evaluation whose timer is due at `now`. Returns the concerns
    /// that were evaluated, response first.
    pub fn on_timer(&mut self, doc: &mut Document, now: Instant) -> Vec<ConcernKind> {
        let mut due = Vec::new();
        while let Some(handle) = self.scheduler.pop_due(now) {
            if self.grace_timer == Some(handle) {
                self.grace_timer = None;
                due.push(ConcernKind::Continue);
                continue;
            }
            for kind in ConcernKind::ALL {
                let tracked = self.tracked_mut(kind);
                if tracked.pending_timer == Some(handle) {
                    tracked.pending_timer = None;
                    due.push(kind);
                }
            }
        }
        due.sort_by_key(|&k| evaluation_rank(k));
        due.dedup();
        for &kind in &due {
            self.evaluate(kind, doc, now);
        }
        due
    }

    pub fn evaluate(&mut self, kind: ConcernKind, doc: &mut Document, now: Instant) {
        match kind {
            ConcernKind::Response => self.evaluate_response(doc, now),
            ConcernKind::Modal => self.evaluate_modal(doc, now),
            ConcernKind::Continue => self.evaluate_continue(doc, now),
        }
    }

    fn evaluate_response(&mut self, doc: &mut Document, now: Instant) {
        if self
            .dispatcher
            .maybe_revert_favicon(&mut self.host, doc, &mut self.journal)
        {
            self.journal.info(ConcernKind::Response, "Favicon restored");
        }

        match self.response.observe(classify::classify_response(doc)) {
            Observation::Unclassified => {
                self.journal
                    .debug(ConcernKind::Response, "Response button state not recognized");
            }
            Observation::Unchanged(_) => {}
            Observation::FirstTracked(state) => {
                self.journal
                    .info(ConcernKind::Response, format!("Tracking button in state: {state}"));
            }
            Observation::Changed(transition) => {
                self.journal
                    .info(ConcernKind::Response, format!("Response state changed: {transition}"));
                self.journal.info(
                    ConcernKind::Response,
                    format!("Tracking button in state: {}", transition.to),
                );
                self.transitions.push(transition);
                self.dispatcher.dispatch_response(
                    &mut self.host,
                    doc,
                    &mut self.response,
                    &transition,
                    &mut self.journal,
                );
                self.policy.on_response_transition(&transition);
                if transition.is(ObservedState::ButtonRunning, ObservedState::ButtonStopped) {
                    self.schedule(ConcernKind::Continue, now);
                }
            }
        }
    }

    fn evaluate_modal(&mut self, doc: &mut Document, now: Instant) {
        match self.modal.observe(classify::classify_modal(doc)) {
            Observation::Unclassified | Observation::Unchanged(_) => {}
            Observation::FirstTracked(state) => {
                self.journal
                    .debug(ConcernKind::Modal, format!("Tracking modal in state: {state}"));
                if state == ObservedState::ModalPresent && !self.config.modal_click_preexisting {
                    self.journal.info(
                        ConcernKind::Modal,
                        "Permission modal was open before the observer attached, leaving it",
                    );
                    self.dispatcher.skip_modal(doc);
                    return;
                }
            }
            Observation::Changed(transition) => {
                self.journal
                    .info(ConcernKind::Modal, format!("Modal state changed: {transition}"));
                self.transitions.push(transition);
            }
        }
        if self.modal.last_state == ObservedState::ModalPresent
            && !self
                .dispatcher
                .dispatch_modal(&mut self.host, doc, &mut self.journal, now)
        {
            // Re-check when the back-off ends.
            if let Some(until) = self.dispatcher.modal_backoff_until(now) {
                self.scheduler
                    .schedule(&mut self.modal.pending_timer, now, until.saturating_duration_since(now));
            }
        }
    }

    fn evaluate_continue(&mut self, doc: &mut Document, now: Instant) {
        let response = match classify::classify_response(doc) {
            ObservedState::Unknown => self.response.last_state,
            fresh => fresh,
        };
        let decision = self.policy.evaluate(
            doc,
            now,
            response,
            self.settings.auto_continue_enabled,
            self.dispatcher.continue_clicked(),
        );

        match &decision {
            ContinueDecision::NoCandidate => {}
            ContinueDecision::PageLoading { deferred: false } => {
                self.journal.info(ConcernKind::Continue, "Found Continue button");
                self.journal.info(
                    ConcernKind::Continue,
                    "Continue button found during page load, not clicking",
                );
            }
            ContinueDecision::PageLoading { deferred: true } => {
                self.journal.info(ConcernKind::Continue, "Found Continue button");
                self.journal.info(
                    ConcernKind::Continue,
                    "Continue button found during page load, waiting for the page to settle",
                );
            }
            ContinueDecision::Click(_) => {
                self.journal.info(ConcernKind::Continue, "Found Continue button");
            }
            other => {
                self.journal.info(ConcernKind::Continue, "Found Continue button");
                self.journal.info(
                    ConcernKind::Continue,
                    format!(
                        "Continue button found but not in appropriate state for clicking ({})",
                        other.reason()
                    ),
                );
            }
        }

        match self.continue_button.observe(decision.state()) {
            Observation::Changed(transition) => {
                self.journal
                    .debug(ConcernKind::Continue, format!("Continue state changed: {transition}"));
                self.transitions.push(transition);
            }
            Observation::FirstTracked(state) => {
                self.journal
                    .debug(ConcernKind::Continue, format!("Tracking Continue in state: {state}"));
            }
            Observation::Unclassified | Observation::Unchanged(_) => {}
        }

        if let ContinueDecision::Click(button) = decision {
            self.journal.info(
                ConcernKind::Continue,
                "Clicking \"Continue\" button after RUNNING -> STOPPED transition",
            );
            self.dispatcher
                .dispatch_continue(&mut self.host, doc, button, &mut self.journal);
        }
    }

    /// Take a pushed settings snapshot.
    pub fn update_settings(&mut self, settings: Settings) {
        if settings != self.settings {
            self.journal.info(
                None,
                format!(
                    "Settings updated: autoContinueEnabled={}",
                    settings.auto_continue_enabled
                ),
            );
        }
        self.settings = settings;
    }

    /// Call after the host's foreground state changed.
    pub fn on_visibility_change(&mut self, doc: &mut Document) {
        if self
            .dispatcher
            .maybe_revert_favicon(&mut self.host, doc, &mut self.journal)
        {
            self.journal.info(ConcernKind::Response, "Favicon restored");
        }
    }
}

fn evaluation_rank(kind: ConcernKind) -> u8 {
    match kind {
        ConcernKind::Response => 0,
        ConcernKind::Modal => 1,
        ConcernKind::Continue => 2,
    }
}
