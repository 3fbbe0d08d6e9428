//! Decision log.
//!
//! Every observer decision goes to `tracing` with structured fields. The
//! journal additionally keeps the rendered line so that replays can be
//! asserted on the way the browser harness asserts on console output.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::tracker::ConcernKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct Entry {
    pub level: Level,
    pub concern: Option<ConcernKind>,
    pub line: String,
}

#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<Entry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, concern: impl Into<Option<ConcernKind>>, line: impl Into<String>) {
        let (concern, line) = (concern.into(), line.into());
        match concern {
            Some(c) => info!(concern = %c, "{line}"),
            None => info!("{line}"),
        }
        self.push(Level::Info, concern, line);
    }

    pub fn debug(&mut self, concern: impl Into<Option<ConcernKind>>, line: impl Into<String>) {
        let (concern, line) = (concern.into(), line.into());
        match concern {
            Some(c) => debug!(concern = %c, "{line}"),
            None => debug!("{line}"),
        }
        self.push(Level::Debug, concern, line);
    }

    pub fn warn(&mut self, concern: impl Into<Option<ConcernKind>>, line: impl Into<String>) {
        let (concern, line) = (concern.into(), line.into());
        match concern {
            Some(c) => warn!(concern = %c, "{line}"),
            None => warn!("{line}"),
        }
        self.push(Level::Warn, concern, line);
    }

    fn push(&mut self, level: Level, concern: Option<ConcernKind>, line: String) {
        self.entries.push(Entry { level, concern, line });
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|e| e.line.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.entries.iter().filter(|e| e.line.contains(needle)).count()
    }

    pub fn take(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }
}
