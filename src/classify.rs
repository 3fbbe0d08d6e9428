//! Element classification.
//!
//! These are signature checks against the chat app's current markup, not
//! semantic parsing: a label, a marker class and an icon fingerprint have to
//! line up exactly, otherwise the answer is `Unknown`.

use crate::dom::{Document, NodeId};
use crate::tracker::{ConcernKind, ObservedState};

pub const MODAL_CLASS: &str = "z-modal";
pub const ALLOW_BUTTON_TEXT: &str = "Allow for this chat";
pub const CONTINUE_LABEL: &str = "Continue";

pub const STOP_LABEL: &str = "Stop response";
pub const RUNNING_MARKER_CLASS: &str = "border-border-300";
pub const RUNNING_ICON_PREFIX: &str = "M128,20A108,108,0,1,0,236,128";

pub const SEND_LABEL: &str = "Send message";
pub const STOPPED_MARKER_CLASS: &str = "bg-accent-main-000";
pub const STOPPED_ICON_PREFIX: &str = "M208.49,120.49a12,12,0";

/// `<button>`, `role="button"` or a button-type `<input>`.
pub fn is_button_like(doc: &Document, node: NodeId) -> bool {
    match doc.tag(node) {
        Some("button") => true,
        Some("input") => matches!(doc.attr(node, "type"), Some("button" | "submit")),
        Some(_) => doc.attr(node, "role") == Some("button"),
        None => false,
    }
}

/// `aria-label` when present, otherwise whitespace-normalized text.
pub fn accessible_label(doc: &Document, node: NodeId) -> String {
    if let Some(label) = doc.attr(node, "aria-label") {
        return label.trim().to_string();
    }
    if doc.tag(node) == Some("input") {
        return doc.attr(node, "value").unwrap_or_default().trim().to_string();
    }
    doc.text_content(node)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn has_icon_fingerprint(doc: &Document, button: NodeId, prefix: &str) -> bool {
    doc.find(button, |d, n| {
        d.tag(n) == Some("path") && d.attr(n, "d").is_some_and(|p| p.starts_with(prefix))
    })
    .is_some()
}

// ── Response toggle ─────────────────────────────────────────────────────────

pub fn classify_response_button(doc: &Document, button: Option<NodeId>) -> ObservedState {
    let Some(button) = button else {
        return ObservedState::Unknown;
    };
    if !doc.is_element(button) {
        return ObservedState::Unknown;
    }
    let label = accessible_label(doc, button);
    if label == STOP_LABEL
        && doc.has_class(button, RUNNING_MARKER_CLASS)
        && has_icon_fingerprint(doc, button, RUNNING_ICON_PREFIX)
    {
        return ObservedState::ButtonRunning;
    }
    if label == SEND_LABEL
        && doc.has_class(button, STOPPED_MARKER_CLASS)
        && has_icon_fingerprint(doc, button, STOPPED_ICON_PREFIX)
    {
        return ObservedState::ButtonStopped;
    }
    ObservedState::Unknown
}

/// Candidate for the response toggle: right label, fingerprint not checked.
pub fn is_response_candidate(doc: &Document, node: NodeId) -> bool {
    is_button_like(doc, node) && matches!(accessible_label(doc, node).as_str(), STOP_LABEL | SEND_LABEL)
}

/// The first connected toggle that classifies to a concrete state.
pub fn find_response_button(doc: &Document) -> Option<NodeId> {
    let body = doc.body()?;
    doc.find_all(body, is_response_candidate)
        .into_iter()
        .find(|&b| classify_response_button(doc, Some(b)) != ObservedState::Unknown)
}

pub fn classify_response(doc: &Document) -> ObservedState {
    classify_response_button(doc, find_response_button(doc))
}

/// The idle send control is back on screen.
pub fn is_ready_for_input(doc: &Document) -> bool {
    find_response_button(doc).is_some_and(|b| {
        classify_response_button(doc, Some(b)) == ObservedState::ButtonStopped && doc.is_rendered(b)
    })
}

// ── Permission modal ────────────────────────────────────────────────────────

fn is_allow_control(doc: &Document, node: NodeId) -> bool {
    is_button_like(doc, node) && doc.text_content(node).contains(ALLOW_BUTTON_TEXT)
}

/// The element (or an ancestor) carries the modal marker class and it
/// contains an "Allow for this chat" control.
pub fn is_target_modal(doc: &Document, node: NodeId) -> bool {
    if !doc.is_element(node) {
        return false;
    }
    let marked = doc.closest(node, |d, n| d.has_class(n, MODAL_CLASS)).is_some();
    marked && doc.find(node, is_allow_control).is_some()
}

/// The "Allow for this chat" control of the first target modal in the body.
pub fn find_allow_button(doc: &Document) -> Option<NodeId> {
    let body = doc.body()?;
    doc.find_all(body, |d, n| d.has_class(n, MODAL_CLASS))
        .into_iter()
        .filter(|&m| is_target_modal(doc, m))
        .find_map(|m| doc.find(m, is_allow_control))
}

pub fn classify_modal(doc: &Document) -> ObservedState {
    if doc.body().is_none() {
        return ObservedState::Unknown;
    }
    match find_allow_button(doc) {
        Some(_) => ObservedState::ModalPresent,
        None => ObservedState::ModalAbsent,
    }
}

// ── Continue button ─────────────────────────────────────────────────────────

pub fn is_continue_button(doc: &Document, node: NodeId) -> bool {
    is_button_like(doc, node) && accessible_label(doc, node) == CONTINUE_LABEL
}

/// `disabled` or `aria-disabled="true"`: activating it would do nothing.
pub fn is_disabled(doc: &Document, node: NodeId) -> bool {
    doc.attr(node, "disabled").is_some() || doc.attr(node, "aria-disabled") == Some("true")
}

/// Rendered Continue buttons in document order.
pub fn find_continue_buttons(doc: &Document) -> Vec<NodeId> {
    let Some(body) = doc.body() else {
        return vec![];
    };
    doc.find_all(body, is_continue_button)
        .into_iter()
        .filter(|&b| doc.is_rendered(b))
        .collect()
}

/// Element pattern used by the mutation filter for each concern.
pub fn pattern_matches(concern: ConcernKind, doc: &Document, node: NodeId) -> bool {
    if !doc.is_element(node) {
        return false;
    }
    match concern {
        ConcernKind::Modal => doc.has_class(node, MODAL_CLASS),
        ConcernKind::Response => is_response_candidate(doc, node),
        ConcernKind::Continue => is_continue_button(doc, node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(body: &str) -> Document {
        Document::parse(&format!("<html><head></head><body>{body}</body></html>"))
    }

    fn running_button() -> &'static str {
        r#"<button aria-label="Stop response" class="h-8 border-border-300 rounded"><svg viewBox="0 0 256 256"><path d="M128,20A108,108,0,1,0,236,128,108.12,108.12,0,0,0,128,20Z"></path></svg></button>"#
    }

    fn stopped_button() -> &'static str {
        r#"<button aria-label="Send message" class="bg-accent-main-000 text-white"><svg viewBox="0 0 256 256"><path d="M208.49,120.49a12,12,0,0,1-17,0L140,69V216a12,12,0,0,1-24,0V69L64.49,120.49a12,12,0,0,1-17-17l72-72a12,12,0,0,1,17,0l72,72A12,12,0,0,1,208.49,120.49Z"></path></svg></button>"#
    }

    #[test]
    fn missing_element_is_unknown() {
        let d = doc("");
        assert_eq!(classify_response_button(&d, None), ObservedState::Unknown);
        assert_eq!(classify_response(&d), ObservedState::Unknown);
    }

    #[test]
    fn running_and_stopped_fingerprints() {
        assert_eq!(classify_response(&doc(running_button())), ObservedState::ButtonRunning);
        assert_eq!(classify_response(&doc(stopped_button())), ObservedState::ButtonStopped);
    }

    #[test]
    fn label_without_fingerprint_is_unknown() {
        let d = doc(r#"<button aria-label="Stop response" class="border-border-300"><svg><path d="M0,0Z"></path></svg></button>"#);
        assert_eq!(classify_response(&d), ObservedState::Unknown);
        let d = doc(r#"<button aria-label="Send message"><svg><path d="M208.49,120.49a12,12,0,0,1"></path></svg></button>"#);
        assert_eq!(classify_response(&d), ObservedState::Unknown);
    }

    #[test]
    fn fingerprint_must_be_a_prefix() {
        let d = doc(r#"<button aria-label="Stop response" class="border-border-300"><svg><path d="M0,0 M128,20A108,108,0,1,0,236,128"></path></svg></button>"#);
        assert_eq!(classify_response(&d), ObservedState::Unknown);
    }

    #[test]
    fn mixed_signals_are_unknown() {
        // Running label, stopped marker class and icon.
        let d = doc(r#"<button aria-label="Stop response" class="bg-accent-main-000"><svg><path d="M208.49,120.49a12,12,0,0,1"></path></svg></button>"#);
        assert_eq!(classify_response(&d), ObservedState::Unknown);
    }

    #[test]
    fn modal_needs_marker_and_allow_control() {
        let d = doc(r#"<div class="z-modal"><button>Deny</button><button>Allow for this chat</button></div>"#);
        assert_eq!(classify_modal(&d), ObservedState::ModalPresent);
        assert_eq!(d.text_content(find_allow_button(&d).unwrap()), "Allow for this chat");

        let d = doc(r#"<div class="z-modal"><button>Dismiss</button></div>"#);
        assert_eq!(classify_modal(&d), ObservedState::ModalAbsent);

        let d = doc(r#"<div class="dialog"><button>Allow for this chat</button></div>"#);
        assert_eq!(classify_modal(&d), ObservedState::ModalAbsent);
    }

    #[test]
    fn modal_marker_may_sit_on_an_ancestor() {
        let d = doc(r#"<div class="z-modal"><section id="inner"><span role="button">Allow for this chat</span></section></div>"#);
        let inner = d.query_selector(d.root(), "#inner").unwrap().unwrap();
        assert!(is_target_modal(&d, inner));
    }

    #[test]
    fn allow_text_only_counts_inside_controls() {
        let d = doc(r#"<div class="z-modal"><p>Allow for this chat</p><button>OK</button></div>"#);
        assert_eq!(classify_modal(&d), ObservedState::ModalAbsent);
    }

    #[test]
    fn continue_matches_label_regardless_of_style() {
        let d = doc(r#"<button class="anything">  Continue </button><button aria-label="Continue"><svg></svg></button><button>Continue later</button><div>Continue</div>"#);
        assert_eq!(find_continue_buttons(&d).len(), 2);
    }

    #[test]
    fn hidden_continue_buttons_are_ignored() {
        let d = doc(r#"<div hidden><button>Continue</button></div>"#);
        assert!(find_continue_buttons(&d).is_empty());
    }

    #[test]
    fn disabled_controls() {
        let d = doc(r#"<button id="a" disabled>Continue</button><button id="b" aria-disabled="true">Continue</button><button id="c" aria-disabled="false">Continue</button>"#);
        let flags: Vec<bool> = find_continue_buttons(&d).iter().map(|&b| is_disabled(&d, b)).collect();
        assert_eq!(flags, vec![true, true, false]);
    }

    #[test]
    fn ready_for_input_tracks_stopped_toggle() {
        assert!(is_ready_for_input(&doc(stopped_button())));
        assert!(!is_ready_for_input(&doc(running_button())));
        let hidden = format!(r#"<div style="display:none">{}</div>"#, stopped_button());
        assert!(!is_ready_for_input(&doc(&hidden)));
    }

    #[test]
    fn patterns_are_per_concern() {
        let d = doc(r#"<div class="z-modal"></div><button aria-label="Send message"></button><button>Continue</button>"#);
        let body = d.body().unwrap();
        let nodes = d.find_all(body, |d, n| d.tag(n) != Some("body"));
        let count = |c| nodes.iter().filter(|&&n| pattern_matches(c, &d, n)).count();
        assert_eq!(count(ConcernKind::Modal), 1);
        assert_eq!(count(ConcernKind::Response), 1);
        assert_eq!(count(ConcernKind::Continue), 1);
    }
}
