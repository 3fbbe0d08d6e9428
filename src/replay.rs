//! Offline replay of a [`Scenario`] against the in-memory document.
//!
//! Time is virtual: `advance` steps jump the clock forward and fire every
//! timer that falls inside the jump, in deadline order. Records queued by a
//! step are delivered as one batch right after it.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::classify;
use crate::dispatch::{self, FaviconState, PageHost};
use crate::dom::{Document, NodeId};
use crate::error::ObserverError;
use crate::journal::Entry;
use crate::messaging::Message;
use crate::observer::ObserverController;
use crate::scenario::{Scenario, Step};
use crate::tracker::Transition;

pub const ASSET_BASE: &str = "chrome-extension://chat-autopilot";

/// Timers further out than this after the last step are not waited for.
const SETTLE_LIMIT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "effect", rename_all = "camelCase")]
pub enum Effect {
    #[serde(rename_all = "camelCase")]
    Click {
        at_ms: u64,
        label: String,
        identity: String,
    },
    #[serde(rename_all = "camelCase")]
    Marker { at_ms: u64, text: String },
    #[serde(rename_all = "camelCase")]
    Favicon { at_ms: u64, href: String },
    #[serde(rename_all = "camelCase")]
    Notification {
        at_ms: u64,
        title: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Message { at_ms: u64, message: Message },
}

/// Page host that applies effects to the in-memory document and records them.
#[derive(Debug, Default)]
pub struct RecordingHost {
    effects: Vec<Effect>,
    foreground: bool,
    clock_ms: u64,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    pub fn set_clock(&mut self, ms: u64) {
        self.clock_ms = ms;
    }
}

impl PageHost for RecordingHost {
    fn activate(&mut self, doc: &mut Document, node: NodeId) -> Result<(), ObserverError> {
        if !doc.is_connected(node) {
            return Err(ObserverError::ElementDetached(node));
        }
        self.effects.push(Effect::Click {
            at_ms: self.clock_ms,
            label: classify::accessible_label(doc, node),
            identity: doc.identity(node).to_string(),
        });
        Ok(())
    }

    fn write_marker(&mut self, doc: &mut Document, marker_id: &str, button_text: &str) -> Result<(), ObserverError> {
        dispatch::write_marker_element(doc, marker_id, button_text);
        self.effects.push(Effect::Marker {
            at_ms: self.clock_ms,
            text: button_text.to_string(),
        });
        Ok(())
    }

    fn set_favicon(&mut self, doc: &mut Document, href: &str) -> Result<(), ObserverError> {
        dispatch::swap_favicon_link(doc, href);
        self.effects.push(Effect::Favicon {
            at_ms: self.clock_ms,
            href: href.to_string(),
        });
        Ok(())
    }

    fn post(&mut self, message: Message) -> Result<(), ObserverError> {
        let at_ms = self.clock_ms;
        self.effects.push(match message {
            Message::ShowNotification { title, message } => Effect::Notification {
                at_ms,
                title: title.unwrap_or_default(),
                message: message.unwrap_or_default(),
            },
            message => Effect::Message { at_ms, message },
        });
        Ok(())
    }

    fn asset_url(&self, path: &str) -> String {
        format!("{ASSET_BASE}/{}", path.trim_start_matches('/'))
    }

    fn is_foreground(&self) -> bool {
        self.foreground
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayReport {
    pub scenario: String,
    pub duration_ms: u64,
    pub effects: Vec<Effect>,
    pub transitions: Vec<Transition>,
    pub log: Vec<Entry>,
    /// Texts of the modal approval markers left in inert mode.
    pub markers: Vec<String>,
    pub continue_markers: Vec<String>,
    pub favicon: FaviconState,
}

impl ReplayReport {
    pub fn notifications(&self) -> usize {
        self.effects
            .iter()
            .filter(|e| matches!(e, Effect::Notification { .. }))
            .count()
    }

    pub fn clicks(&self) -> Vec<&str> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Click { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn favicon_swaps(&self) -> Vec<&str> {
        self.effects
            .iter()
            .filter_map(|e| match e {
                Effect::Favicon { href, .. } => Some(href.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn logged(&self, needle: &str) -> usize {
        self.log.iter().filter(|e| e.line.contains(needle)).count()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "scenario: {} ({}ms)", self.scenario, self.duration_ms);
        let _ = writeln!(out, "effects:");
        for effect in &self.effects {
            let line = match effect {
                Effect::Click { at_ms, label, identity } => {
                    format!("[{at_ms:>6}ms] click \"{label}\" ({identity})")
                }
                Effect::Marker { at_ms, text } => format!("[{at_ms:>6}ms] marker \"{text}\""),
                Effect::Favicon { at_ms, href } => format!("[{at_ms:>6}ms] favicon {href}"),
                Effect::Notification { at_ms, title, .. } => {
                    format!("[{at_ms:>6}ms] notification \"{title}\"")
                }
                Effect::Message { at_ms, message } => format!("[{at_ms:>6}ms] message {message:?}"),
            };
            let _ = writeln!(out, "  {line}");
        }
        let _ = writeln!(out, "transitions:");
        for t in &self.transitions {
            let _ = writeln!(out, "  {}: {t}", t.concern);
        }
        let _ = writeln!(out, "log:");
        for entry in &self.log {
            let concern = entry.concern.map(|c| c.to_string()).unwrap_or_default();
            let _ = writeln!(out, "  {:<9} {}", format!("[{concern}]"), entry.line);
        }
        out
    }
}

struct Replayer {
    doc: Document,
    ctl: ObserverController<RecordingHost>,
    start: Instant,
    now: Instant,
}

impl Replayer {
    fn elapsed_ms(&self) -> u64 {
        self.now.duration_since(self.start).as_millis() as u64
    }

    fn set_now(&mut self, now: Instant) {
        self.now = now;
        let ms = self.elapsed_ms();
        self.ctl.host_mut().set_clock(ms);
    }

    fn deliver(&mut self) {
        let records = self.doc.take_records();
        if records.is_empty() {
            return;
        }
        let touched = self.ctl.on_mutations(&self.doc, &records, self.now);
        debug!(records = records.len(), touched = ?touched, "delivered batch");
    }

    fn run_timers_until(&mut self, end: Instant) {
        while let Some(deadline) = self.ctl.next_deadline().filter(|d| *d <= end) {
            self.set_now(self.now.max(deadline));
            self.ctl.on_timer(&mut self.doc, self.now);
            self.deliver();
        }
        self.set_now(self.now.max(end));
    }
}

/// Replay `scenario`. `inert` forces marker mode on top of the scenario config.
pub fn run(scenario: &Scenario, inert: bool) -> Result<ReplayReport> {
    let mut config = scenario.config.clone();
    config.inert |= inert;

    let mut host = RecordingHost::new();
    host.set_foreground(scenario.foreground);
    let start = Instant::now();
    let mut r = Replayer {
        doc: Document::parse(&scenario.html),
        ctl: ObserverController::new(host, config, scenario.settings),
        start,
        now: start,
    };
    info!(scenario = %scenario.name, steps = scenario.steps.len(), "replaying scenario");

    r.ctl.install(&mut r.doc, start);
    // The subscription starts after the initial scan.
    r.doc.take_records();

    for (i, step) in scenario.steps.iter().enumerate() {
        match step {
            Step::Advance { ms } => {
                let end = r.now + Duration::from_millis(*ms);
                r.run_timers_until(end);
            }
            Step::Visibility { foreground } => {
                r.ctl.host_mut().set_foreground(*foreground);
                r.ctl.on_visibility_change(&mut r.doc);
                r.deliver();
            }
            Step::UpdateSettings { settings } => r.ctl.update_settings(*settings),
            _ => {
                step.apply(&mut r.doc)
                    .with_context(|| format!("Step {} ({}) failed", i + 1, step.name()))?;
                r.deliver();
            }
        }
    }

    // Let pending work settle; timers may schedule follow-ups.
    let limit = r.now + SETTLE_LIMIT;
    while let Some(deadline) = r.ctl.next_deadline().filter(|d| *d <= limit) {
        r.run_timers_until(deadline);
    }

    let report = ReplayReport {
        scenario: scenario.name.clone(),
        duration_ms: r.elapsed_ms(),
        effects: r.ctl.host().effects().to_vec(),
        transitions: r.ctl.transitions().to_vec(),
        log: r.ctl.journal().entries().to_vec(),
        markers: dispatch::marker_texts(&r.doc, dispatch::ALLOW_MARKER_ID),
        continue_markers: dispatch::marker_texts(&r.doc, dispatch::CONTINUE_MARKER_ID),
        favicon: r.ctl.dispatcher().favicon().clone(),
    };
    info!(
        effects = report.effects.len(),
        transitions = report.transitions.len(),
        "replay complete"
    );
    Ok(report)
}
