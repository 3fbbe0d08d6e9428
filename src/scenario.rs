use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ObserverConfig;
use crate::dom::{Document, NodeId};
use crate::settings::Settings;

/// One scripted change to the page or its surroundings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Step {
    AppendHtml {
        target: String,
        html: String,
    },
    SetAttribute {
        target: String,
        name: String,
        value: String,
    },
    RemoveAttribute {
        target: String,
        name: String,
    },
    Remove {
        target: String,
    },
    SetText {
        target: String,
        text: String,
    },
    /// Let virtual time pass, firing due timers.
    Advance {
        ms: u64,
    },
    Visibility {
        foreground: bool,
    },
    UpdateSettings {
        settings: Settings,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::AppendHtml { .. } => "appendHtml",
            Step::SetAttribute { .. } => "setAttribute",
            Step::RemoveAttribute { .. } => "removeAttribute",
            Step::Remove { .. } => "remove",
            Step::SetText { .. } => "setText",
            Step::Advance { .. } => "advance",
            Step::Visibility { .. } => "visibility",
            Step::UpdateSettings { .. } => "updateSettings",
        }
    }

    /// Apply a DOM step. Returns false for steps that do not touch the DOM.
    pub fn apply(&self, doc: &mut Document) -> Result<bool> {
        match self {
            Step::AppendHtml { target, html } => {
                let node = resolve(doc, target)?;
                doc.append_html(node, html);
            }
            Step::SetAttribute {
                target,
                name,
                value,
            } => {
                let node = resolve(doc, target)?;
                doc.set_attribute(node, name, value);
            }
            Step::RemoveAttribute { target, name } => {
                let node = resolve(doc, target)?;
                doc.remove_attribute(node, name);
            }
            Step::Remove { target } => {
                let node = resolve(doc, target)?;
                doc.remove(node);
            }
            Step::SetText { target, text } => {
                let node = resolve(doc, target)?;
                doc.set_text(node, text);
            }
            Step::Advance { .. } | Step::Visibility { .. } | Step::UpdateSettings { .. } => {
                return Ok(false)
            }
        }
        Ok(true)
    }
}

/// First element matching `selector` in the connected document.
pub fn resolve(doc: &Document, selector: &str) -> Result<NodeId> {
    doc.query_selector(doc.root(), selector)?
        .with_context(|| format!("No element matches '{selector}'"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Initial page. Either inline or loaded from `htmlFile`.
    #[serde(default)]
    pub html: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_file: Option<PathBuf>,
    #[serde(default)]
    pub config: ObserverConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub foreground: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub description: Option<String>,
    pub step_count: usize,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(s: &Scenario) -> Self {
        Self {
            name: s.name.clone(),
            description: s.description.clone(),
            step_count: s.steps.len(),
        }
    }
}

impl Scenario {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Malformed scenario")
    }

    /// Load a scenario file. A relative `htmlFile` is resolved against the
    /// scenario's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let mut scenario = Self::from_json(&json)
            .with_context(|| format!("Failed to parse scenario {}", path.display()))?;
        if let Some(file) = &scenario.html_file {
            let html_path = match path.parent() {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file.clone(),
            };
            scenario.html = fs::read_to_string(&html_path)
                .with_context(|| format!("Failed to read page {}", html_path.display()))?;
        }
        Ok(scenario)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write scenario {}", path.display()))
    }
}

/// Summaries of every `*.json` scenario in `dir`, sorted by name. Files that
/// do not parse are skipped.
pub fn list(dir: &Path) -> Result<Vec<ScenarioSummary>> {
    let mut summaries = Vec::new();
    if !dir.exists() {
        return Ok(summaries);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Ok(scenario) = Scenario::load(&path) {
                summaries.push(ScenarioSummary::from(&scenario));
            }
        }
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}
