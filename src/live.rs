//! Watching a real chat tab over CDP.
//!
//! The page-side observer installed by [`mutation::INSTALL_OBSERVER_JS`]
//! queues records; this loop drains them on a short poll, runs them through
//! the same [`ObserverController`] the replay harness uses, and re-reads the
//! page HTML whenever an evaluation is due. Effects are queued by
//! [`LiveHost`] and executed as page JavaScript after each tick.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chromiumoxide::Page;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::browser;
use crate::config::ObserverConfig;
use crate::dispatch::{self, PageHost, ALLOW_MARKER_ID, CONTINUE_MARKER_ID};
use crate::dom::{js_escape, Document, NodeId};
use crate::environment::{FrameView, ParentAccess, FRAME_ID_ATTR};
use crate::error::ObserverError;
use crate::journal::Journal;
use crate::messaging::{self, BackgroundClient, Coordinator, FrameInjector, LogNotifier, Message, SenderInfo};
use crate::mutation::{self, RawBatch};
use crate::observer::ObserverController;
use crate::replay::ASSET_BASE;
use crate::settings::Settings;
use crate::transcript;

const VISIBILITY_JS: &str = "document.visibilityState === 'visible'";

/// Minimal modal auto-approver evaluated inside an embedded frame. Each frame
/// runs its own copy; nothing is shared with the top-level observer.
pub const FRAME_MODAL_OBSERVER_JS: &str = r#"(function() {
    if (document.getElementById('autopilot-content-script-injected')) return 'already-installed';
    function approve() {
        var modal = document.querySelector('.z-modal');
        if (!modal) return;
        var button = Array.from(modal.querySelectorAll('button'))
            .find(function(b) { return (b.textContent || '').indexOf('Allow for this chat') !== -1; });
        if (button && !button.hasAttribute('data-autopilot-approved')) {
            button.setAttribute('data-autopilot-approved', '1');
            button.click();
        }
    }
    approve();
    new MutationObserver(function() { approve(); }).observe(document.body, {
        childList: true,
        subtree: true,
        attributes: true,
        attributeFilter: ['class']
    });
    var marker = document.createElement('div');
    marker.id = 'autopilot-content-script-injected';
    marker.style.display = 'none';
    document.body.appendChild(marker);
    return 'installed';
})()"#;

/// Lists `iframe[data-extension-frame-id]` elements with their documents when
/// the page may read them.
const FRAMES_JS: &str = r#"(function() {
    return JSON.stringify(Array.from(document.querySelectorAll('iframe[data-extension-frame-id]')).map(function(f) {
        var entry = { id: f.getAttribute('data-extension-frame-id'), html: null, parentOrigin: null };
        try {
            entry.html = f.contentDocument.documentElement.outerHTML;
        } catch (e) {
            entry.parentOrigin = location.origin;
        }
        return entry;
    }));
})()"#;

/// One embedded frame as seen from the top-level page.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameEntry {
    pub id: String,
    /// Frame markup, absent when the frame is cross-origin.
    pub html: Option<String>,
    pub parent_origin: Option<String>,
}

/// Frames that should get the modal approver for `target` (a frame id or
/// `"self"` for every tagged frame). Replay frames are left alone.
pub fn select_frames(page: &Document, frames: &[FrameEntry], target: &str, journal: &mut Journal) -> Vec<String> {
    let mut selected = Vec::new();
    for entry in frames {
        let doc = entry
            .html
            .as_deref()
            .map(Document::parse)
            .unwrap_or_default();
        let parent = match (&entry.html, entry.parent_origin.as_deref()) {
            (Some(_), _) => ParentAccess::SameOrigin(page),
            (None, origin) => ParentAccess::CrossOrigin {
                origin: origin.unwrap_or("unknown origin"),
            },
        };
        let view = FrameView {
            doc: &doc,
            parent,
            frame_id: Some(entry.id.as_str()),
        };
        if !view.is_target_frame(target) {
            continue;
        }
        if view.is_replay(journal) {
            journal.info(None, format!("Frame '{}' is a replay, not injecting", entry.id));
            continue;
        }
        selected.push(entry.id.clone());
    }
    selected
}

/// Tab id reported to the coordinator, derived from the CDP target id.
pub fn tab_id_from_target(target_id: &str) -> u64 {
    let hex: String = target_id
        .chars()
        .filter(char::is_ascii_hexdigit)
        .take(16)
        .collect();
    u64::from_str_radix(&hex, 16).unwrap_or_else(|_| {
        let mut hasher = DefaultHasher::new();
        target_id.hash(&mut hasher);
        hasher.finish()
    })
}

/// Page host for a live tab: effects become queued scripts.
pub struct LiveHost {
    client: BackgroundClient,
    asset_base: String,
    foreground: bool,
    scripts: Vec<String>,
}

impl LiveHost {
    pub fn new(client: BackgroundClient, asset_base: impl Into<String>) -> Self {
        Self {
            client,
            asset_base: asset_base.into(),
            foreground: true,
            scripts: Vec::new(),
        }
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        self.foreground = foreground;
    }

    /// Scripts queued since the last call, oldest first.
    pub fn take_scripts(&mut self) -> Vec<String> {
        std::mem::take(&mut self.scripts)
    }
}

impl PageHost for LiveHost {
    fn activate(&mut self, doc: &mut Document, node: NodeId) -> Result<(), ObserverError> {
        if !doc.is_connected(node) {
            return Err(ObserverError::ElementDetached(node));
        }
        let expr = doc.locator(node).to_js_expression();
        self.scripts.push(format!(
            "(function() {{ var el = {expr}; if (!el) return 'NOT_FOUND'; el.click(); return 'OK'; }})()"
        ));
        Ok(())
    }

    fn write_marker(&mut self, doc: &mut Document, marker_id: &str, button_text: &str) -> Result<(), ObserverError> {
        dispatch::write_marker_element(doc, marker_id, button_text);
        self.scripts.push(format!(
            "(function() {{ var m = document.createElement('div'); m.id = '{}'; \
             m.style.display = 'none'; m.setAttribute('data-button-text', '{}'); \
             (document.head || document.body).appendChild(m); return 'OK'; }})()",
            js_escape(marker_id),
            js_escape(button_text)
        ));
        Ok(())
    }

    fn set_favicon(&mut self, doc: &mut Document, href: &str) -> Result<(), ObserverError> {
        dispatch::swap_favicon_link(doc, href);
        self.scripts.push(format!(
            "(function() {{ var l = document.querySelector('link[rel~=\"icon\"]'); \
             if (!l) {{ l = document.createElement('link'); l.rel = 'icon'; document.head.appendChild(l); }} \
             l.href = '{}'; return 'OK'; }})()",
            js_escape(href)
        ));
        Ok(())
    }

    fn post(&mut self, message: Message) -> Result<(), ObserverError> {
        self.client.post(message)
    }

    fn asset_url(&self, path: &str) -> String {
        format!("{}/{}", self.asset_base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn is_foreground(&self) -> bool {
        self.foreground
    }
}

/// Runs [`FRAME_MODAL_OBSERVER_JS`] inside `iframe[data-extension-frame-id]`
/// elements of the watched page.
pub struct PageFrameInjector {
    page: Page,
}

impl PageFrameInjector {
    pub fn new(page: Page) -> Self {
        Self { page }
    }
}

impl FrameInjector for PageFrameInjector {
    fn inject<'a>(&'a mut self, _tab_id: u64, frame_selector: &'a str) -> BoxFuture<'a, Result<Vec<Value>, String>> {
        Box::pin(async move {
            let js = format!(
                "(function() {{ var f = document.querySelector('iframe[{FRAME_ID_ATTR}=\"{}\"]'); \
                 if (!f) return JSON.stringify({{ error: 'Frame selector invalid' }}); \
                 try {{ return JSON.stringify({{ results: [f.contentWindow.eval({})] }}); }} \
                 catch (e) {{ return JSON.stringify({{ error: String(e && e.message || e) }}); }} }})()",
                js_escape(frame_selector),
                serde_json::to_string(FRAME_MODAL_OBSERVER_JS).map_err(|e| e.to_string())?
            );
            let raw = browser::eval_string(&self.page, &js).await;
            let value: Value = serde_json::from_str(&raw).map_err(|_| "Script injection failed".to_string())?;
            if let Some(error) = value.get("error").and_then(Value::as_str) {
                return Err(error.to_string());
            }
            Ok(value
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        })
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub url: String,
    pub port: u16,
    pub launch: bool,
    pub config: ObserverConfig,
    pub settings: Settings,
    pub poll: Duration,
    pub asset_base: String,
    /// `data-extension-frame-id` of an iframe that gets its own modal observer,
    /// or `"self"` for every tagged iframe.
    pub frame: Option<String>,
    /// Selector of the subtree to watch instead of the whole body.
    pub scope: Option<String>,
    /// Rewrite this file with the conversation text after each evaluation.
    pub transcript: Option<PathBuf>,
}

impl WatchOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            port: 9222,
            launch: false,
            config: ObserverConfig::default(),
            settings: Settings::default(),
            poll: Duration::from_millis(100),
            asset_base: ASSET_BASE.to_string(),
            frame: None,
            scope: None,
            transcript: None,
        }
    }
}

async fn snapshot(page: &Page) -> Result<Document> {
    let html = page.content().await.context("Failed to get page content")?;
    Ok(Document::parse(&html))
}

async fn run_script(page: &Page, js: &str) -> Result<(), ObserverError> {
    let value = page
        .evaluate(js)
        .await
        .map_err(|e| ObserverError::side_effect("page script", e.to_string()))?;
    if value.into_value::<String>().ok().as_deref() == Some("NOT_FOUND") {
        return Err(ObserverError::side_effect("page script", "element not found in the live DOM"));
    }
    Ok(())
}

async fn run_scripts(page: &Page, host: &mut LiveHost) {
    for js in host.take_scripts() {
        if let Err(e) = run_script(page, &js).await {
            warn!(error = %e, "page effect not applied");
        }
    }
}

async fn inject_frames(page: &Page, doc: &Document, target: &str, client: &BackgroundClient, journal: &mut Journal) {
    let raw = browser::eval_string(page, FRAMES_JS).await;
    let frames: Vec<FrameEntry> = match serde_json::from_str(&raw) {
        Ok(frames) => frames,
        Err(e) => {
            warn!(error = %e, "could not list frames");
            return;
        }
    };
    let selected = select_frames(doc, &frames, target, journal);
    if selected.is_empty() {
        warn!(frame = %target, found = frames.len(), "no frame to inject into");
    }
    for frame in selected {
        match client.inject_into_frame(&frame).await {
            Ok(results) => info!(frame = %frame, results = ?results, "frame observer injected"),
            Err(e) => warn!(frame = %frame, error = %e, "frame injection abandoned"),
        }
    }
}

/// Watch `opts.url` until Ctrl-C.
pub async fn watch(opts: WatchOptions) -> Result<()> {
    let browser = if opts.launch {
        browser::launch(false).await?
    } else {
        browser::connect(opts.port).await?
    };
    let page = browser::open_page(&browser, &opts.url).await?;

    let tab_id = tab_id_from_target(page.target_id().as_ref());
    debug!(tab_id = tab_id, "page target resolved");
    let coordinator = Coordinator::new(LogNotifier, PageFrameInjector::new(page.clone()), opts.settings);
    let client = messaging::spawn_coordinator(
        coordinator,
        SenderInfo {
            tab_id: Some(tab_id),
            frame_id: 0,
        },
    );

    page.evaluate(mutation::INSTALL_OBSERVER_JS)
        .await
        .context("Failed to install page observer")?;
    let mut doc = snapshot(&page).await?;

    let host = LiveHost::new(client.clone(), opts.asset_base.clone());
    let mut ctl = ObserverController::new(host, opts.config.clone(), opts.settings);
    if let Some(scope) = &opts.scope {
        ctl = ctl.scoped_to(scope.clone());
    }
    ctl.install(&mut doc, Instant::now());
    run_scripts(&page, ctl.host_mut()).await;

    if let Some(frame) = &opts.frame {
        inject_frames(&page, &doc, frame, &client, ctl.journal_mut()).await;
    }

    info!(url = %opts.url, "watching; press Ctrl-C to stop");
    let mut interval = tokio::time::interval(opts.poll);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {}
        }
        let now = Instant::now();

        let foreground = page
            .evaluate(VISIBILITY_JS)
            .await
            .ok()
            .and_then(|v| v.into_value::<bool>().ok())
            .unwrap_or(true);
        if foreground != ctl.host().is_foreground() {
            debug!(foreground = foreground, "visibility changed");
            ctl.host_mut().set_foreground(foreground);
            ctl.on_visibility_change(&mut doc);
        }

        let batch = RawBatch::from_json(&browser::eval_string(&page, mutation::DRAIN_RECORDS_JS).await);
        if batch.overflow {
            debug!("record queue overflowed or unreadable, re-evaluating everything");
            // The page may have navigated and lost its observer.
            page.evaluate(mutation::INSTALL_OBSERVER_JS).await.ok();
            ctl.schedule_all(now);
        } else if !batch.is_empty() {
            let (fragment, records) = batch.into_fragment();
            ctl.on_mutations(&fragment, &records, now);
        }

        if ctl.next_deadline().is_some_and(|d| d <= now) {
            match snapshot(&page).await {
                Ok(fresh) => doc = fresh,
                Err(e) => warn!(error = %e, "keeping previous snapshot"),
            }
            ctl.on_timer(&mut doc, now);
            if let Some(path) = &opts.transcript {
                if let Err(e) = transcript::save(&doc, path) {
                    warn!(error = %e, "transcript not saved");
                }
            }
        }
        run_scripts(&page, ctl.host_mut()).await;
    }

    info!("stopped watching");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn host() -> (LiveHost, mpsc::UnboundedReceiver<messaging::Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = BackgroundClient::new(tx, SenderInfo::default());
        (LiveHost::new(client, "https://assets.example/"), rx)
    }

    #[test]
    fn clicks_target_stamped_identity() {
        let (mut host, _rx) = host();
        let mut doc = Document::parse(
            r#"<html><body><button data-autopilot-id="7">Continue</button></body></html>"#,
        );
        let button = crate::classify::find_continue_buttons(&doc)[0];
        host.activate(&mut doc, button).unwrap();
        let scripts = host.take_scripts();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains(r#"[data-autopilot-id="7"]"#));
        assert!(host.take_scripts().is_empty());
    }

    #[test]
    fn favicon_and_marker_touch_snapshot_and_page() {
        let (mut host, _rx) = host();
        let mut doc = Document::empty();
        let href = host.asset_url("/images/favicon-busy.png");
        assert_eq!(href, "https://assets.example/images/favicon-busy.png");
        host.set_favicon(&mut doc, &href).unwrap();
        host.write_marker(&mut doc, ALLOW_MARKER_ID, "Allow for this chat").unwrap();
        host.write_marker(&mut doc, CONTINUE_MARKER_ID, "Continue").unwrap();
        assert_eq!(dispatch::marker_texts(&doc, ALLOW_MARKER_ID), vec!["Allow for this chat".to_string()]);
        assert_eq!(dispatch::marker_texts(&doc, CONTINUE_MARKER_ID), vec!["Continue".to_string()]);
        let scripts = host.take_scripts();
        assert!(scripts[0].contains("favicon-busy.png"));
        assert!(scripts[1].contains(ALLOW_MARKER_ID));
        assert!(scripts[2].contains(CONTINUE_MARKER_ID));
    }

    #[test]
    fn notifications_go_to_the_coordinator() {
        let (mut host, mut rx) = host();
        host.post(Message::ShowNotification {
            title: Some("t".into()),
            message: None,
        })
        .unwrap();
        let envelope = rx.try_recv().unwrap();
        assert!(envelope.reply.is_none());
        assert!(matches!(envelope.message, Message::ShowNotification { .. }));
    }

    fn frame(id: &str, html: Option<&str>) -> FrameEntry {
        FrameEntry {
            id: id.into(),
            html: html.map(str::to_string),
            parent_origin: html.is_none().then(|| "https://claude.ai".to_string()),
        }
    }

    #[test]
    fn frame_selection_by_id_and_self() {
        let page = Document::empty();
        let frames = [
            frame("chat", Some("<html><body></body></html>")),
            frame("other", Some("<html><body></body></html>")),
        ];
        let mut journal = Journal::new();
        assert_eq!(select_frames(&page, &frames, "chat", &mut journal), vec!["chat"]);
        assert_eq!(select_frames(&page, &frames, "self", &mut journal), vec!["chat", "other"]);
        assert!(select_frames(&page, &frames, "missing", &mut journal).is_empty());
    }

    #[test]
    fn replay_frames_are_skipped() {
        let replay_page = Document::parse(r#"<html><body><div id="replay"></div></body></html>"#);
        let frames = [frame("chat", Some("<html><body></body></html>"))];
        let mut journal = Journal::new();
        assert!(select_frames(&replay_page, &frames, "chat", &mut journal).is_empty());
        assert!(journal.contains("is a replay"));

        let replay_frame = [frame("chat", Some(r#"<html><body data-rrweb-test="1"></body></html>"#))];
        assert!(select_frames(&Document::empty(), &replay_frame, "chat", &mut journal).is_empty());
    }

    #[test]
    fn cross_origin_frame_is_still_injected() {
        let frames = [frame("chat", None)];
        let mut journal = Journal::new();
        assert_eq!(select_frames(&Document::empty(), &frames, "chat", &mut journal), vec!["chat"]);
        assert!(journal.contains("cross-origin access denied"));
    }

    #[test]
    fn tab_ids_follow_the_target() {
        let a = tab_id_from_target("8F1E6A2B3C4D5E6F7A8B9C0D1E2F3A4B");
        assert_eq!(a, 0x8F1E_6A2B_3C4D_5E6F);
        assert_ne!(a, tab_id_from_target("0A1E6A2B3C4D5E6F7A8B9C0D1E2F3A4B"));
        assert_eq!(tab_id_from_target("tab"), tab_id_from_target("tab"));
    }

    #[test]
    fn frame_script_is_idempotent_iife() {
        assert!(FRAME_MODAL_OBSERVER_JS.starts_with("(function()"));
        assert!(FRAME_MODAL_OBSERVER_JS.contains("autopilot-content-script-injected"));
        assert!(FRAME_MODAL_OBSERVER_JS.contains("Allow for this chat"));
    }
}
