//! Plain-text transcript of the conversation shown on the page.
//!
//! Messages are the outermost elements matching [`MESSAGE_SELECTOR`]. Each
//! direct child becomes one paragraph; lists keep their bullets or numbers.
//! The cut-off notice under a truncated reply is not part of the text but
//! sets [`Message::hit_max_length`].

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::dom::{Document, NodeId};

pub const MESSAGE_SELECTOR: &str = r#"[data-role], [data-testid="user-message"], .font-claude-message"#;

/// Text of the notice shown under a reply that was cut off.
pub const MAX_LENGTH_PHRASES: &[&str] = &["hit the max length", "hit the maximum length"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Unknown,
}

impl Role {
    fn of(doc: &Document, node: NodeId) -> Self {
        match doc.attr(node, "data-role") {
            Some("user") => return Self::User,
            Some("assistant") => return Self::Assistant,
            _ => {}
        }
        if doc.attr(node, "data-testid") == Some("user-message") {
            Self::User
        } else if doc.has_class(node, "font-claude-message") {
            Self::Assistant
        } else {
            Self::Unknown
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
            Self::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub paragraphs: Vec<String>,
    pub hit_max_length: bool,
}

/// Messages on the page, in document order.
pub fn parse(doc: &Document) -> Vec<Message> {
    let matched = doc
        .query_selector_all(doc.root(), MESSAGE_SELECTOR)
        .unwrap_or_default();
    let set: HashSet<NodeId> = matched.iter().copied().collect();
    matched
        .into_iter()
        .filter(|&n| !doc.ancestors(n).any(|a| set.contains(&a)))
        .map(|n| parse_message(doc, n))
        .collect()
}

fn parse_message(doc: &Document, node: NodeId) -> Message {
    let mut paragraphs = Vec::new();
    let mut hit_max_length = false;
    let children: Vec<NodeId> = doc
        .children(node)
        .into_iter()
        .filter(|&c| doc.is_element(c))
        .collect();

    if children.is_empty() {
        let text = doc.text_content(node).trim().to_string();
        if !text.is_empty() {
            paragraphs.push(text);
        }
    }
    for child in children {
        // Trailing message chrome.
        if doc.has_class(child, "absolute") {
            break;
        }
        if doc.has_class(child, "actions") {
            continue;
        }
        let text = doc.text_content(child);
        if MAX_LENGTH_PHRASES.iter().any(|p| text.contains(p)) {
            hit_max_length = true;
            continue;
        }
        let para = match doc.tag(child) {
            Some("ul") => list_lines(doc, child, false),
            Some("ol") => list_lines(doc, child, true),
            _ => text.trim().to_string(),
        };
        if !para.is_empty() {
            paragraphs.push(para);
        }
    }

    Message {
        role: Role::of(doc, node),
        paragraphs,
        hit_max_length,
    }
}

fn list_lines(doc: &Document, list: NodeId, numbered: bool) -> String {
    let items = doc
        .children(list)
        .into_iter()
        .filter(|&c| doc.tag(c) == Some("li"));
    let mut out = Vec::new();
    for (i, item) in items.enumerate() {
        let leader = if numbered {
            format!("{}. ", i + 1)
        } else {
            "* ".to_string()
        };
        let indent = " ".repeat(leader.len());
        let text = doc.text_content(item);
        let mut lines = text.trim().lines().map(str::trim);
        out.push(format!("{leader}{}", lines.next().unwrap_or_default()));
        out.extend(lines.filter(|l| !l.is_empty()).map(|l| format!("{indent}{l}")));
    }
    out.join("\n")
}

/// Render messages as `Role:` blocks separated by `----`.
pub fn format(messages: &[Message]) -> String {
    let mut out = String::new();
    for (i, message) in messages.iter().enumerate() {
        if i > 0 {
            out.push_str("\n\n----\n\n");
        }
        let _ = write!(out, "{}:\n\n{}", message.role.label(), message.paragraphs.join("\n\n"));
    }
    out
}

/// Whether the last assistant reply stopped at the length limit with no
/// later message.
pub fn ends_truncated(messages: &[Message]) -> bool {
    messages
        .last()
        .is_some_and(|m| m.role == Role::Assistant && m.hit_max_length)
}

/// Write the transcript of `doc` to `path`. Returns the text written, or
/// `None` when the page shows no messages.
pub fn save(doc: &Document, path: &Path) -> Result<Option<String>> {
    let messages = parse(doc);
    debug!(messages = messages.len(), "taking transcript snapshot");
    let text = format(&messages);
    if text.is_empty() {
        return Ok(None);
    }
    fs::write(path, &text).with_context(|| format!("Failed to write transcript {}", path.display()))?;
    info!(path = %path.display(), bytes = text.len(), "saved transcript");
    Ok(Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRUNCATED_PAGE: &str = include_str!("../tests/fixtures/chat_truncated.html");

    #[test]
    fn truncated_fixture() {
        let messages = parse(&Document::parse(TRUNCATED_PAGE));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].paragraphs, vec!["Write the full migration guide."]);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].paragraphs, vec!["Part one covers the schema changes..."]);
        assert!(messages[1].hit_max_length);
        assert!(ends_truncated(&messages));
    }

    #[test]
    fn lists_and_chrome() {
        let doc = Document::parse(
            r#"<html><body>
            <div data-testid="user-message">Plan it</div>
            <div class="font-claude-message">
              <p>Steps:</p>
              <ol><li>Back up</li><li>Migrate</li></ol>
              <ul><li>fast</li><li>safe</li></ul>
              <div class="absolute"><button>Copy</button></div>
              <p>never reached</p>
            </div>
            </body></html>"#,
        );
        let messages = parse(&doc);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].paragraphs, vec!["Plan it"]);
        assert_eq!(
            messages[1].paragraphs,
            vec!["Steps:", "1. Back up\n2. Migrate", "* fast\n* safe"]
        );
        assert!(!ends_truncated(&messages));
        assert_eq!(
            format(&messages),
            "User:\n\nPlan it\n\n----\n\nAssistant:\n\nSteps:\n\n1. Back up\n2. Migrate\n\n* fast\n* safe"
        );
    }

    #[test]
    fn empty_page_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.txt");
        assert!(save(&Document::empty(), &path).unwrap().is_none());
        assert!(!path.exists());

        let text = save(&Document::parse(TRUNCATED_PAGE), &path).unwrap().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), text);
        assert!(text.starts_with("User:\n\nWrite the full migration guide."));
    }
}
