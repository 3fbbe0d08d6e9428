//! Mutation records, subscription scoping and the relevance filter.
//!
//! The same filter runs in two places:
//! 1. Offline, on records queued by the in-memory [`Document`]
//! 2. Live, on records serialized by the page-side observer that
//!    [`INSTALL_OBSERVER_JS`] installs and [`DRAIN_RECORDS_JS`] drains
//!
//! A batch is only worth a (debounced) re-evaluation when it touches an
//! element the concern cares about; everything else is dropped here.

use serde::Deserialize;

use crate::classify;
use crate::dom::{Document, NodeId};
use crate::tracker::ConcernKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    ChildList,
    Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationRecord {
    pub kind: MutationKind,
    pub target: NodeId,
    pub attribute_name: Option<String>,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
}

impl MutationRecord {
    pub fn child_list(target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) -> Self {
        Self {
            kind: MutationKind::ChildList,
            target,
            attribute_name: None,
            added,
            removed,
        }
    }

    pub fn attribute(target: NodeId, name: &str) -> Self {
        Self {
            kind: MutationKind::Attributes,
            target,
            attribute_name: Some(name.to_string()),
            added: vec![],
            removed: vec![],
        }
    }
}

/// Subscription options, mirroring `MutationObserverInit`.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub child_list: bool,
    pub subtree: bool,
    pub attributes: bool,
    /// Empty means every attribute.
    pub attribute_filter: Vec<String>,
}

impl WatchConfig {
    pub fn for_concern(kind: ConcernKind) -> Self {
        let attribute_filter: &[&str] = match kind {
            ConcernKind::Modal => &["class"],
            ConcernKind::Response => &["aria-label", "class", "disabled"],
            ConcernKind::Continue => &["aria-label", "class", "disabled", "aria-disabled"],
        };
        Self {
            child_list: true,
            subtree: true,
            attributes: true,
            attribute_filter: attribute_filter.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Whether a subscription rooted at `root` would have been notified of `record`.
    pub fn admits(&self, doc: &Document, root: NodeId, record: &MutationRecord) -> bool {
        let kind_ok = match record.kind {
            MutationKind::ChildList => self.child_list,
            MutationKind::Attributes => {
                self.attributes
                    && (self.attribute_filter.is_empty()
                        || record
                            .attribute_name
                            .as_deref()
                            .is_some_and(|a| self.attribute_filter.iter().any(|f| f == a)))
            }
        };
        if !kind_ok {
            return false;
        }
        record.target == root || (self.subtree && doc.contains(root, record.target))
    }
}

/// Decide whether `batch` warrants re-evaluating `concern`.
///
/// Relevant when an added or removed node matches the concern's element
/// pattern (itself or a descendant), or when the record's target is, or sits
/// inside, a matching element.
pub fn is_relevant(doc: &Document, batch: &[MutationRecord], concern: ConcernKind) -> bool {
    let matches = |n: NodeId| classify::pattern_matches(concern, doc, n);
    let subtree_matches = |n: NodeId| doc.find(n, |d, x| classify::pattern_matches(concern, d, x)).is_some();

    batch.iter().any(|record| {
        if record.added.iter().chain(&record.removed).any(|&n| subtree_matches(n)) {
            return true;
        }
        doc.closest(record.target, |_, n| matches(n)).is_some()
    })
}

// ── Live page observer ──────────────────────────────────────────────────────

/// Elements the page observer stamps. Same set as [`classify::is_button_like`].
pub const BUTTON_SELECTOR: &str = r#"button,[role="button"],input[type="button"],input[type="submit"]"#;

/// JavaScript that installs a page-side MutationObserver which stamps every
/// button with a stable `data-autopilot-id` and queues serialized records.
/// Safe to call multiple times - disconnects any previous observer first.
pub const INSTALL_OBSERVER_JS: &str = r#"(function() {
    if (window.__autopilot_observer) {
        window.__autopilot_observer.disconnect();
    }
    window.__autopilot_queue = [];
    window.__autopilot_overflow = false;
    window.__autopilot_next_id = window.__autopilot_next_id || 1;
    var BUTTONS = 'button,[role="button"],input[type="button"],input[type="submit"]';
    function stamp(node) {
        if (!(node instanceof Element)) return;
        var list = node.matches(BUTTONS) ? [node] : [];
        node.querySelectorAll(BUTTONS).forEach(function(b) { list.push(b); });
        list.forEach(function(b) {
            if (!b.hasAttribute('data-autopilot-id')) {
                b.setAttribute('data-autopilot-id', String(window.__autopilot_next_id++));
            }
        });
    }
    function html(node) {
        return node instanceof Element ? node.outerHTML : '';
    }
    function anchor(node) {
        var el = node instanceof Element ? node : node.parentElement;
        if (!el) return '';
        return (el.closest(BUTTONS + ',.z-modal') || el).outerHTML;
    }
    window.__autopilot_observer = new MutationObserver(function(mutations) {
        mutations.forEach(function(m) {
            m.addedNodes.forEach(stamp);
            if (window.__autopilot_queue.length >= 500) {
                window.__autopilot_overflow = true;
                return;
            }
            window.__autopilot_queue.push({
                kind: m.type === 'attributes' ? 'attributes' : 'childList',
                attributeName: m.attributeName,
                target: anchor(m.target),
                added: Array.from(m.addedNodes).map(html).filter(Boolean),
                removed: Array.from(m.removedNodes).map(html).filter(Boolean)
            });
        });
    });
    var target = document.body || document.documentElement;
    if (target) {
        stamp(target);
        window.__autopilot_observer.observe(target, {
            childList: true,
            subtree: true,
            attributes: true,
            attributeFilter: ['aria-label', 'class', 'disabled', 'aria-disabled'],
            characterData: false
        });
    }
    return 'installed';
})()"#;

/// JavaScript that drains the queued records.
/// Returns JSON: {"records": [...], "overflow": bool}
pub const DRAIN_RECORDS_JS: &str = r#"(function() {
    var out = JSON.stringify({
        records: window.__autopilot_queue || [],
        overflow: !!window.__autopilot_overflow
    });
    window.__autopilot_queue = [];
    window.__autopilot_overflow = false;
    return out;
})()"#;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub kind: String,
    #[serde(default)]
    pub attribute_name: Option<String>,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

/// Parsed result of DRAIN_RECORDS_JS.
#[derive(Debug, Default)]
pub struct RawBatch {
    pub records: Vec<RawRecord>,
    /// Records were dropped or could not be decoded; treat every concern as touched.
    pub overflow: bool,
}

impl RawBatch {
    pub fn from_json(json: &str) -> Self {
        #[derive(Deserialize)]
        struct Raw {
            records: Vec<RawRecord>,
            #[serde(default)]
            overflow: bool,
        }

        match serde_json::from_str::<Raw>(json) {
            Ok(raw) => RawBatch {
                records: raw.records,
                overflow: raw.overflow,
            },
            Err(_) => RawBatch {
                records: vec![],
                overflow: true, // assume relevant on parse failure (e.g. page navigated)
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && !self.overflow
    }

    /// Rebuild the serialized records against a detached fragment document so
    /// the regular filter can run on them.
    pub fn into_fragment(self) -> (Document, Vec<MutationRecord>) {
        let mut doc = Document::empty();
        let body = doc.body().unwrap_or(doc.root());
        let mut records = Vec::with_capacity(self.records.len());

        for raw in self.records {
            let target = doc.append_html(body, &raw.target).first().copied().unwrap_or(body);
            let added = raw.added.iter().flat_map(|h| doc.parse_fragment(h)).collect();
            let removed = raw.removed.iter().flat_map(|h| doc.parse_fragment(h)).collect();
            let kind = if raw.kind == "attributes" {
                MutationKind::Attributes
            } else {
                MutationKind::ChildList
            };
            records.push(MutationRecord {
                kind,
                target,
                attribute_name: raw.attribute_name,
                added,
                removed,
            });
        }
        doc.take_records();
        (doc, records)
    }
}
