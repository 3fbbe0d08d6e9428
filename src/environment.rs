//! Where the observer is running: a real page, a session replay, or an
//! injected frame.

use crate::dom::Document;
use crate::error::ObserverError;
use crate::journal::Journal;

/// Any of these in a document means it is a session replay, not the live app.
pub const REPLAY_SELECTORS: &str = "#replay, .replayer-wrapper, .replayer-mirror";
pub const REPLAY_BODY_ATTR: &str = "data-rrweb-test";

pub const FRAME_ID_ATTR: &str = "data-extension-frame-id";
pub const INJECTED_MARKER_ID: &str = "autopilot-content-script-injected";

pub fn is_replay_document(doc: &Document) -> bool {
    let replayer = doc
        .query_selector(doc.root(), REPLAY_SELECTORS)
        .ok()
        .flatten()
        .is_some();
    let marked = doc
        .body()
        .and_then(|b| doc.attr(b, REPLAY_BODY_ATTR))
        .is_some_and(|v| !v.is_empty());
    replayer || marked
}

/// How a frame reaches its embedding document.
#[derive(Debug, Clone, Copy)]
pub enum ParentAccess<'a> {
    TopLevel,
    SameOrigin(&'a Document),
    CrossOrigin { origin: &'a str },
}

/// One execution context: its own document plus what it can see above it.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub doc: &'a Document,
    pub parent: ParentAccess<'a>,
    /// `data-extension-frame-id` of the `<iframe>` element hosting this frame.
    pub frame_id: Option<&'a str>,
}

impl<'a> FrameView<'a> {
    pub fn top_level(doc: &'a Document) -> Self {
        Self {
            doc,
            parent: ParentAccess::TopLevel,
            frame_id: None,
        }
    }

    pub fn parent_document(&self) -> Result<Option<&'a Document>, ObserverError> {
        match self.parent {
            ParentAccess::TopLevel => Ok(None),
            ParentAccess::SameOrigin(doc) => Ok(Some(doc)),
            ParentAccess::CrossOrigin { origin } => Err(ObserverError::CrossOriginAccessDenied {
                context: format!("parent document ({origin})"),
            }),
        }
    }

    /// Replay detection for this frame, looking at the parent when allowed.
    /// A parent we may not read counts as "not a replay".
    pub fn is_replay(&self, journal: &mut Journal) -> bool {
        if is_replay_document(self.doc) {
            return true;
        }
        match self.parent_document() {
            Ok(Some(parent)) => is_replay_document(parent),
            Ok(None) => false,
            Err(e) => {
                journal.warn(None, format!("Replay check skipped: {e}"));
                false
            }
        }
    }

    /// `"self"` targets whatever frame receives the script.
    pub fn is_target_frame(&self, selector: &str) -> bool {
        selector == "self" || self.frame_id == Some(selector)
    }
}

/// Leave a hidden marker so a second injection into the same frame is a
/// no-op. Returns false when the marker was already there.
pub fn mark_injected(doc: &mut Document) -> bool {
    let selector = format!("#{INJECTED_MARKER_ID}");
    if doc
        .query_selector(doc.root(), &selector)
        .ok()
        .flatten()
        .is_some()
    {
        return false;
    }
    let parent = doc.body().unwrap_or(doc.root());
    let marker = doc.create_element("div", &[("id", INJECTED_MARKER_ID), ("style", "display: none")]);
    doc.append_child(parent, marker);
    true
}
