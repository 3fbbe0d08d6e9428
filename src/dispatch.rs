//! Side effects for confirmed transitions.
//!
//! The dispatcher never decides *whether* something changed; it is handed a
//! transition (or an eligible control) and performs the effect at most once,
//! recording the fact before the effect runs so that a failing effect is
//! not retried on the next evaluation.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::classify::{self, ALLOW_BUTTON_TEXT};
use crate::config::ObserverConfig;
use crate::dom::{Document, NodeId, NodeIdentity};
use crate::error::ObserverError;
use crate::journal::Journal;
use crate::messaging::Message;
use crate::tracker::{ConcernKind, ObservedState, TrackedConcern, Transition};

pub const ALLOW_MARKER_ID: &str = "allow-button-clicked-marker";
pub const CONTINUE_MARKER_ID: &str = "continue-button-clicked-marker";
pub const DEFAULT_FAVICON: &str = "/favicon.ico";

/// The page context the observers act on.
pub trait PageHost {
    /// Activate (click) a control.
    fn activate(&mut self, doc: &mut Document, node: NodeId) -> Result<(), ObserverError>;

    /// Leave an invisible marker instead of clicking, for inert mode.
    fn write_marker(&mut self, doc: &mut Document, marker_id: &str, button_text: &str) -> Result<(), ObserverError> {
        write_marker_element(doc, marker_id, button_text);
        Ok(())
    }

    fn set_favicon(&mut self, doc: &mut Document, href: &str) -> Result<(), ObserverError> {
        swap_favicon_link(doc, href);
        Ok(())
    }

    /// Fire-and-forget message to the background coordinator.
    fn post(&mut self, message: Message) -> Result<(), ObserverError>;

    /// Resolve a packaged asset path to a loadable URL.
    fn asset_url(&self, path: &str) -> String;

    fn is_foreground(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FaviconIcon {
    Original,
    Busy,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaviconState {
    pub is_modified: bool,
    pub current: FaviconIcon,
    pub original_href: Option<String>,
}

impl Default for FaviconState {
    fn default() -> Self {
        Self {
            is_modified: false,
            current: FaviconIcon::Original,
            original_href: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Live,
    /// Write markers instead of clicking.
    Inert,
}

pub struct TransitionDispatcher {
    mode: DispatchMode,
    favicon: FaviconState,
    allow_clicked: HashSet<NodeIdentity>,
    last_allow_at: Option<Instant>,
    modal_backoff: Duration,
    continue_clicked: HashSet<NodeIdentity>,
    notification_title: String,
    notification_message: String,
    busy_icon: String,
    ping_icon: String,
}

impl TransitionDispatcher {
    pub fn new(config: &ObserverConfig, mode: DispatchMode) -> Self {
        Self {
            mode,
            favicon: FaviconState::default(),
            allow_clicked: HashSet::new(),
            last_allow_at: None,
            modal_backoff: config.modal_backoff(),
            continue_clicked: HashSet::new(),
            notification_title: config.notification_title.clone(),
            notification_message: config.notification_message.clone(),
            busy_icon: config.busy_icon.clone(),
            ping_icon: config.ping_icon.clone(),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DispatchMode) {
        self.mode = mode;
    }

    pub fn favicon(&self) -> &FaviconState {
        &self.favicon
    }

    pub fn continue_clicked(&self) -> &HashSet<NodeIdentity> {
        &self.continue_clicked
    }

    /// Remember the page's own favicon so it can be restored later.
    pub fn capture_favicon(&mut self, doc: &Document) {
        self.favicon.original_href = favicon_link(doc)
            .and_then(|link| doc.attr(link, "href"))
            .map(String::from);
    }

    // ── Modal ───────────────────────────────────────────────────────────────

    /// End of the back-off window after the last approval, if `now` is inside it.
    pub fn modal_backoff_until(&self, now: Instant) -> Option<Instant> {
        self.last_allow_at
            .map(|at| at + self.modal_backoff)
            .filter(|&until| now < until)
    }

    /// Approve the open permission modal, once per allow-control instance and
    /// never twice within the back-off window. Returns true when an approval
    /// was performed now.
    pub fn dispatch_modal<H: PageHost>(
        &mut self,
        host: &mut H,
        doc: &mut Document,
        journal: &mut Journal,
        now: Instant,
    ) -> bool {
        let Some(button) = classify::find_allow_button(doc) else {
            journal.debug(ConcernKind::Modal, "Could not find \"Allow for this chat\" button in modal");
            return false;
        };
        if self.allow_clicked.contains(&doc.identity(button)) {
            return false;
        }
        if self.modal_backoff_until(now).is_some() {
            let elapsed = self
                .last_allow_at
                .map(|at| now.saturating_duration_since(at).as_millis())
                .unwrap_or_default();
            journal.debug(
                ConcernKind::Modal,
                format!("Skipping button press, too soon after previous press ({elapsed} ms elapsed)"),
            );
            return false;
        }
        self.allow_clicked.insert(doc.identity(button));
        self.last_allow_at = Some(now);
        journal.info(ConcernKind::Modal, "Found \"Allow for this chat\" button");

        let result = match self.mode {
            DispatchMode::Inert => {
                journal.info(ConcernKind::Modal, "Test mode: Would click \"Allow for this chat\" button");
                let text = doc.text_content(button).trim().to_string();
                let text = if text.is_empty() { ALLOW_BUTTON_TEXT.to_string() } else { text };
                host.write_marker(doc, ALLOW_MARKER_ID, &text)
            }
            DispatchMode::Live => {
                journal.info(ConcernKind::Modal, "Clicking \"Allow for this chat\" button");
                host.activate(doc, button)
            }
        };
        if let Err(e) = result {
            journal.warn(ConcernKind::Modal, format!("Approving modal failed: {e}"));
        }
        true
    }

    /// Mark the current allow control as handled without touching it.
    pub fn skip_modal(&mut self, doc: &Document) {
        if let Some(button) = classify::find_allow_button(doc) {
            self.allow_clicked.insert(doc.identity(button));
        }
    }

    // ── Response toggle ─────────────────────────────────────────────────────

    pub fn dispatch_response<H: PageHost>(
        &mut self,
        host: &mut H,
        doc: &mut Document,
        tracked: &mut TrackedConcern,
        transition: &Transition,
        journal: &mut Journal,
    ) {
        use ObservedState::{ButtonRunning, ButtonStopped};

        if transition.is(ButtonStopped, ButtonRunning) {
            if tracked.claim_effect(ButtonRunning) {
                self.swap_favicon(host, doc, FaviconIcon::Busy, journal);
            }
        } else if transition.is(ButtonRunning, ButtonStopped) && tracked.claim_effect(ButtonStopped) {
            self.swap_favicon(host, doc, FaviconIcon::Ping, journal);
            let message = Message::ShowNotification {
                title: Some(self.notification_title.clone()),
                message: Some(self.notification_message.clone()),
            };
            match host.post(message) {
                Ok(()) => journal.info(ConcernKind::Response, "Notification requested"),
                Err(e) => journal.warn(ConcernKind::Response, format!("Error sending notification: {e}")),
            }
        }
    }

    fn swap_favicon<H: PageHost>(&mut self, host: &mut H, doc: &mut Document, icon: FaviconIcon, journal: &mut Journal) {
        if self.favicon.current == icon {
            return;
        }
        let href = match icon {
            FaviconIcon::Busy => host.asset_url(&self.busy_icon),
            FaviconIcon::Ping => host.asset_url(&self.ping_icon),
            FaviconIcon::Original => self
                .favicon
                .original_href
                .clone()
                .unwrap_or_else(|| DEFAULT_FAVICON.to_string()),
        };
        self.favicon.current = icon;
        self.favicon.is_modified = icon != FaviconIcon::Original;
        match host.set_favicon(doc, &href) {
            Ok(()) => journal.debug(ConcernKind::Response, format!("Favicon set to {href}")),
            Err(e) => journal.warn(ConcernKind::Response, format!("Favicon swap failed: {e}")),
        }
    }

    /// Restore the original favicon once the tab is in front and the send
    /// control is back.
    pub fn maybe_revert_favicon<H: PageHost>(&mut self, host: &mut H, doc: &mut Document, journal: &mut Journal) -> bool {
        if !self.favicon.is_modified || !host.is_foreground() || !classify::is_ready_for_input(doc) {
            return false;
        }
        self.swap_favicon(host, doc, FaviconIcon::Original, journal);
        true
    }

    // ── Continue ────────────────────────────────────────────────────────────

    pub fn dispatch_continue<H: PageHost>(
        &mut self,
        host: &mut H,
        doc: &mut Document,
        button: NodeId,
        journal: &mut Journal,
    ) -> bool {
        if !self.continue_clicked.insert(doc.identity(button)) {
            return false;
        }
        let result = match self.mode {
            DispatchMode::Inert => host.write_marker(doc, CONTINUE_MARKER_ID, classify::CONTINUE_LABEL),
            DispatchMode::Live => host.activate(doc, button),
        };
        if let Err(e) = result {
            journal.warn(ConcernKind::Continue, format!("Clicking Continue failed: {e}"));
        }
        true
    }
}

fn favicon_link(doc: &Document) -> Option<NodeId> {
    let head = doc.head()?;
    doc.query_selector(head, r#"link[rel~="icon"]"#).ok().flatten()
}

/// Point the page's icon link at `href`, creating the link if there is none.
pub fn swap_favicon_link(doc: &mut Document, href: &str) {
    if let Some(link) = favicon_link(doc) {
        doc.set_attribute(link, "href", href);
        return;
    }
    let Some(head) = doc.head() else {
        return;
    };
    let link = doc.create_element("link", &[("rel", "icon"), ("href", href)]);
    doc.append_child(head, link);
}

/// Append a hidden `div#<marker_id>` to the head.
pub fn write_marker_element(doc: &mut Document, marker_id: &str, button_text: &str) -> NodeId {
    let marker = doc.create_element(
        "div",
        &[
            ("id", marker_id),
            ("style", "display: none; position: absolute; top: -9999px; left: -9999px"),
            ("data-button-text", button_text),
        ],
    );
    let parent = doc.head().or(doc.body()).unwrap_or(doc.root());
    doc.append_child(parent, marker);
    marker
}

/// Text of every `marker_id` marker written so far, in document order.
pub fn marker_texts(doc: &Document, marker_id: &str) -> Vec<String> {
    doc.query_selector_all(doc.root(), &format!("#{marker_id}"))
        .unwrap_or_default()
        .into_iter()
        .filter_map(|m| doc.attr(m, "data-button-text").map(String::from))
        .collect()
}
