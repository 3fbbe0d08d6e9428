//! In-memory document model the observers run against.
//!
//! The page is a `scraper::Html` tree edited in place. Tree nodes are never
//! freed: a removed subtree stays addressable (detached) so mutation records
//! can still be inspected after the page has thrown the nodes away, the same
//! way a platform `MutationRecord.removedNodes` keeps them alive.

use std::collections::HashMap;
use std::fmt;

use ego_tree::NodeId as TreeId;
use html5ever::tendril::StrTendril;
use html5ever::{ns, Attribute, LocalName, QualName};
use scraper::node::{Element, Text};
use scraper::{CaseSensitivity, ElementRef, Html, Node};
use serde::Serialize;
use thiserror::Error;

use crate::mutation::MutationRecord;

/// Attribute the live page script stamps onto buttons so that an element
/// keeps one identity across re-parsed snapshots of the page.
pub const AUTOPILOT_ID_ATTR: &str = "data-autopilot-id";

/// Stable handle to a node, in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Identity used by at-most-once ledgers. A synthesized page id survives
/// re-parsing, a node handle only survives within one `Document`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum NodeIdentity {
    Tagged(String),
    Slot(NodeId),
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tagged(id) => write!(f, "#{id}"),
            Self::Slot(node) => write!(f, "{node}"),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("invalid selector '{selector}': {reason}")]
pub struct SelectorError {
    pub selector: String,
    pub reason: String,
}

/// Compile a CSS selector with scraper's parser.
pub fn compile_selector(selector: &str) -> Result<scraper::Selector, SelectorError> {
    scraper::Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct Document {
    html: Html,
    /// Tree id of every node ever created, indexed by `NodeId`.
    tree_ids: Vec<TreeId>,
    handles: HashMap<TreeId, NodeId>,
    root: NodeId,
    records: Vec<MutationRecord>,
}

impl Default for Document {
    fn default() -> Self {
        Self::empty()
    }
}

impl Document {
    /// `<html><head></head><body></body></html>`
    pub fn empty() -> Self {
        Self::parse("<html><head></head><body></body></html>")
    }

    pub fn parse(html: &str) -> Self {
        let mut doc = Self {
            html: Html::parse_document(html),
            tree_ids: Vec::new(),
            handles: HashMap::new(),
            root: NodeId(0),
            records: Vec::new(),
        };
        doc.index_new_nodes();
        doc.root = doc.handle(doc.html.root_element().id());
        doc
    }

    /// Parse `html` as a fragment into detached nodes of this document.
    pub fn parse_fragment(&mut self, html: &str) -> Vec<NodeId> {
        let fragment = Html::parse_fragment(html);
        let fragment_root = self.html.tree.extend_tree(fragment.tree).id();
        self.index_new_nodes();

        // Fragment parsing wraps the content in an `<html>` context element.
        let top: Vec<TreeId> = self
            .html
            .tree
            .get(fragment_root)
            .and_then(|root| root.children().find(|c| c.value().is_element()))
            .map(|context| context.children().map(|c| c.id()).collect())
            .unwrap_or_default();
        for &id in &top {
            if let Some(mut node) = self.html.tree.get_mut(id) {
                node.detach();
            }
        }
        top.into_iter().map(|id| self.handle(id)).collect()
    }

    /// Give a handle to every tree node created since the last call.
    fn index_new_nodes(&mut self) {
        let fresh: Vec<TreeId> = self
            .html
            .tree
            .nodes()
            .skip(self.tree_ids.len())
            .map(|n| n.id())
            .collect();
        for id in fresh {
            self.handles.insert(id, NodeId(self.tree_ids.len()));
            self.tree_ids.push(id);
        }
    }

    fn handle(&self, id: TreeId) -> NodeId {
        self.handles[&id]
    }

    fn tree_node(&self, node: NodeId) -> Option<ego_tree::NodeRef<'_, Node>> {
        self.html.tree.get(self.tree_ids[node.0])
    }

    fn tree_node_mut(&mut self, node: NodeId) -> Option<ego_tree::NodeMut<'_, Node>> {
        self.html.tree.get_mut(self.tree_ids[node.0])
    }

    pub fn element(&self, node: NodeId) -> Option<ElementRef<'_>> {
        self.tree_node(node).and_then(ElementRef::wrap)
    }

    // ── Structure ───────────────────────────────────────────────────────────

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> Option<NodeId> {
        self.children(self.root)
            .into_iter()
            .find(|&c| self.tag(c) == Some("body"))
    }

    pub fn head(&self) -> Option<NodeId> {
        self.children(self.root)
            .into_iter()
            .find(|&c| self.tag(c) == Some("head"))
    }

    /// Parent element, like `parentElement`: the document node above
    /// `<html>` is not reported.
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.tree_node(node)?
            .parent()
            .filter(|p| p.value().is_element())
            .map(|p| self.handle(p.id()))
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree_node(node)
            .map(|n| n.children().map(|c| self.handle(c.id())).collect())
            .unwrap_or_default()
    }

    pub fn is_element(&self, node: NodeId) -> bool {
        self.element(node).is_some()
    }

    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.element(node).map(|e| e.value().name())
    }

    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.element(node).and_then(|e| e.attr(name))
    }

    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.element(node)
            .is_some_and(|e| e.value().has_class(class, CaseSensitivity::CaseSensitive))
    }

    /// Concatenated text of all descendant text nodes, like `textContent`.
    pub fn text_content(&self, node: NodeId) -> String {
        let Some(start) = self.tree_node(node) else {
            return String::new();
        };
        let mut out = String::new();
        for n in start.descendants() {
            if let Node::Text(text) = n.value() {
                out.push_str(text);
            }
        }
        out
    }

    /// Pre-order descendants, excluding `node` itself.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        self.tree_node(node)
            .map(|n| n.descendants().skip(1).map(|d| self.handle(d.id())).collect())
            .unwrap_or_default()
    }

    /// Ancestors from the parent upwards.
    pub fn ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(node), move |&n| self.parent(n))
    }

    /// `node` itself or its nearest ancestor satisfying `pred`.
    pub fn closest(&self, node: NodeId, pred: impl Fn(&Self, NodeId) -> bool) -> Option<NodeId> {
        std::iter::once(node)
            .chain(self.ancestors(node))
            .find(|&n| pred(self, n))
    }

    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        node == ancestor || self.ancestors(node).any(|a| a == ancestor)
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.contains(self.root, node)
    }

    /// First element in the subtree of `from` (inclusive) matching `pred`.
    pub fn find(&self, from: NodeId, pred: impl Fn(&Self, NodeId) -> bool) -> Option<NodeId> {
        std::iter::once(from)
            .chain(self.descendants(from))
            .find(|&n| self.is_element(n) && pred(self, n))
    }

    pub fn find_all(&self, from: NodeId, pred: impl Fn(&Self, NodeId) -> bool) -> Vec<NodeId> {
        std::iter::once(from)
            .chain(self.descendants(from))
            .filter(|&n| self.is_element(n) && pred(self, n))
            .collect()
    }

    /// Whether the element would be rendered: no `hidden`, `aria-hidden` or
    /// `display:none` on it or any ancestor.
    pub fn is_rendered(&self, node: NodeId) -> bool {
        std::iter::once(node)
            .chain(self.ancestors(node))
            .all(|n| !self.hides_subtree(n))
    }

    fn hides_subtree(&self, node: NodeId) -> bool {
        if self.attr(node, "hidden").is_some() || self.attr(node, "aria-hidden") == Some("true") {
            return true;
        }
        self.attr(node, "style").is_some_and(|style| {
            let s = style.to_lowercase();
            s.contains("display:none")
                || s.contains("display: none")
                || s.contains("visibility:hidden")
                || s.contains("visibility: hidden")
        })
    }

    pub fn identity(&self, node: NodeId) -> NodeIdentity {
        match self.attr(node, AUTOPILOT_ID_ATTR) {
            Some(tagged) => NodeIdentity::Tagged(tagged.to_string()),
            None => NodeIdentity::Slot(node),
        }
    }

    pub fn locator(&self, node: NodeId) -> ElementLocator {
        ElementLocator {
            tag: self.tag(node).unwrap_or("*").to_string(),
            autopilot_id: self.attr(node, AUTOPILOT_ID_ATTR).map(String::from),
            id: self.attr(node, "id").map(String::from),
            aria_label: self.attr(node, "aria-label").map(String::from),
            text: self.text_content(node).trim().to_string(),
        }
    }

    // ── Selectors ───────────────────────────────────────────────────────────

    pub fn matches(&self, node: NodeId, selector: &scraper::Selector) -> bool {
        self.element(node).is_some_and(|e| selector.matches(&e))
    }

    pub fn query_selector(&self, from: NodeId, selector: &str) -> Result<Option<NodeId>, SelectorError> {
        let sel = compile_selector(selector)?;
        Ok(self
            .descendants(from)
            .into_iter()
            .find(|&n| self.matches(n, &sel)))
    }

    pub fn query_selector_all(&self, from: NodeId, selector: &str) -> Result<Vec<NodeId>, SelectorError> {
        let sel = compile_selector(selector)?;
        Ok(self
            .descendants(from)
            .into_iter()
            .filter(|&n| self.matches(n, &sel))
            .collect())
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    pub fn create_element(&mut self, tag: &str, attrs: &[(&str, &str)]) -> NodeId {
        let name = QualName::new(None, ns!(html), LocalName::from(tag.to_ascii_lowercase()));
        let element = Element::new(name, attrs.iter().map(|(k, v)| attribute(k, v)).collect());
        let id = self.html.tree.orphan(Node::Element(element)).id();
        self.index_new_nodes();
        self.handle(id)
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        if self.parent(child).is_some() {
            self.remove(child);
        }
        self.attach(parent, child);
        self.records.push(MutationRecord::child_list(parent, vec![child], vec![]));
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        let child_id = self.tree_ids[child.0];
        if let Some(mut p) = self.tree_node_mut(parent) {
            p.append_id(child_id);
        }
    }

    /// Parse `html` and append the resulting nodes under `parent` as a single
    /// child-list mutation. Returns the appended top-level nodes.
    pub fn append_html(&mut self, parent: NodeId, html: &str) -> Vec<NodeId> {
        let nodes = self.parse_fragment(html);
        for &n in &nodes {
            self.attach(parent, n);
        }
        if !nodes.is_empty() {
            self.records
                .push(MutationRecord::child_list(parent, nodes.clone(), vec![]));
        }
        nodes
    }

    /// Detach `node` from its parent. The subtree stays addressable.
    pub fn remove(&mut self, node: NodeId) {
        let Some(parent) = self.parent(node) else {
            return;
        };
        if let Some(mut n) = self.tree_node_mut(node) {
            n.detach();
        }
        self.records.push(MutationRecord::child_list(parent, vec![], vec![node]));
    }

    fn attr_list(&self, node: NodeId) -> Option<Vec<(String, String)>> {
        self.element(node).map(|e| {
            e.value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
    }

    /// Rebuild the element with a new attribute list so scraper's cached
    /// id and class sets match the attributes.
    fn replace_attrs(&mut self, node: NodeId, attrs: &[(String, String)]) {
        let Some(mut tree_node) = self.tree_node_mut(node) else {
            return;
        };
        if let Node::Element(el) = tree_node.value() {
            *el = Element::new(
                el.name.clone(),
                attrs.iter().map(|(k, v)| attribute(k, v)).collect(),
            );
        }
    }

    pub fn set_attribute(&mut self, node: NodeId, name: &str, value: &str) {
        let Some(mut attrs) = self.attr_list(node) else {
            return;
        };
        match attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => attrs.push((name.to_string(), value.to_string())),
        }
        self.replace_attrs(node, &attrs);
        self.records.push(MutationRecord::attribute(node, name));
    }

    pub fn remove_attribute(&mut self, node: NodeId, name: &str) {
        let Some(mut attrs) = self.attr_list(node) else {
            return;
        };
        let before = attrs.len();
        attrs.retain(|(k, _)| k != name);
        if attrs.len() != before {
            self.replace_attrs(node, &attrs);
            self.records.push(MutationRecord::attribute(node, name));
        }
    }

    /// Replace all children with a single text node, like assigning `textContent`.
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        let removed = self.children(node);
        for &r in &removed {
            if let Some(mut n) = self.tree_node_mut(r) {
                n.detach();
            }
        }
        let text_id = self
            .html
            .tree
            .orphan(Node::Text(Text {
                text: StrTendril::from_slice(text),
            }))
            .id();
        self.index_new_nodes();
        let text_node = self.handle(text_id);
        self.attach(node, text_node);
        self.records
            .push(MutationRecord::child_list(node, vec![text_node], removed));
    }

    /// Drain queued mutation records, oldest first.
    pub fn take_records(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn has_pending_records(&self) -> bool {
        !self.records.is_empty()
    }
}

fn attribute(name: &str, value: &str) -> Attribute {
    Attribute {
        name: QualName::new(None, ns!(), LocalName::from(name)),
        value: StrTendril::from_slice(value),
    }
}

// ── Element locator ─────────────────────────────────────────────────────────

/// Stores enough info about an element to locate it in the live browser DOM.
#[derive(Debug, Clone, Serialize)]
pub struct ElementLocator {
    pub tag: String,
    pub autopilot_id: Option<String>,
    pub id: Option<String>,
    pub aria_label: Option<String>,
    pub text: String,
}

impl ElementLocator {
    /// Generate a JavaScript expression that finds this element in the live DOM.
    pub fn to_js_expression(&self) -> String {
        if let Some(tagged) = &self.autopilot_id {
            return format!(
                "document.querySelector('[{}=\"{}\"]')",
                AUTOPILOT_ID_ATTR,
                js_escape(tagged)
            );
        }
        if let Some(id) = &self.id {
            return format!("document.getElementById('{}')", js_escape(id));
        }
        if let Some(label) = &self.aria_label {
            return format!(
                "document.querySelector('{}[aria-label=\"{}\"]')",
                self.tag,
                js_escape(label)
            );
        }
        // Fallback: match by text content
        let text = js_escape(&self.text);
        format!(
            "Array.from(document.querySelectorAll('{}')).find(el => el.textContent.trim() === '{}')",
            self.tag, text
        )
    }
}

pub(crate) fn js_escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
