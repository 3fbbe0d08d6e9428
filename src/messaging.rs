//! Message passing between a page context and the background coordinator.
//!
//! Contexts never share memory. A content context holds a [`BackgroundClient`]
//! and either fires a message and forgets it, or awaits the correlated
//! reply delivered over a oneshot channel.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ObserverError;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Message {
    GetTabInfo,
    #[serde(rename_all = "camelCase")]
    InjectScriptIntoFrame {
        tab_id: Option<u64>,
        frame_selector: Option<String>,
    },
    ShowNotification {
        title: Option<String>,
        message: Option<String>,
    },
    UpdateSettings {
        settings: Settings,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error {
        error: String,
    },
    TabInfo {
        #[serde(rename = "tabId")]
        tab_id: u64,
    },
    Injected {
        success: bool,
        results: Vec<Value>,
    },
    Ack {
        success: bool,
    },
}

impl Response {
    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error { error: msg.into() }
    }

    /// Turn an `{error}` payload into a messaging failure.
    pub fn into_result(self) -> Result<Self, ObserverError> {
        match self {
            Self::Error { error } => Err(ObserverError::Messaging(error)),
            other => Ok(other),
        }
    }
}

/// Who sent a message. Only page contexts with a tab have a `tab_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderInfo {
    pub tab_id: Option<u64>,
    pub frame_id: u64,
}

#[derive(Debug)]
pub struct Envelope {
    pub message: Message,
    pub sender: SenderInfo,
    pub reply: Option<oneshot::Sender<Response>>,
}

/// Shows user-visible notifications.
pub trait Notifier: Send {
    fn notify(&mut self, title: &str, message: &str) -> Result<(), ObserverError>;
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&mut self, title: &str, message: &str) -> Result<(), ObserverError> {
        info!(title = %title, message = %message, "notification");
        Ok(())
    }
}

/// Executes the observer script inside a specific frame of a tab.
pub trait FrameInjector: Send {
    fn inject<'a>(&'a mut self, tab_id: u64, frame_selector: &'a str) -> BoxFuture<'a, Result<Vec<Value>, String>>;
}

/// Injector for contexts without frames: every selector is invalid.
#[derive(Debug, Default)]
pub struct NoFrames;

impl FrameInjector for NoFrames {
    fn inject<'a>(&'a mut self, _tab_id: u64, _frame_selector: &'a str) -> BoxFuture<'a, Result<Vec<Value>, String>> {
        Box::pin(async { Err("Frame selector invalid".to_string()) })
    }
}

/// Background coordinator: answers requests from page contexts and keeps the
/// last pushed settings.
pub struct Coordinator<N, I> {
    notifier: N,
    injector: I,
    settings: Settings,
}

impl<N: Notifier, I: FrameInjector> Coordinator<N, I> {
    pub fn new(notifier: N, injector: I, settings: Settings) -> Self {
        Self {
            notifier,
            injector,
            settings,
        }
    }

    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub async fn handle(&mut self, message: Message, sender: SenderInfo) -> Response {
        debug!(?message, ?sender, "received message");
        match message {
            Message::GetTabInfo => match sender.tab_id {
                Some(tab_id) => Response::TabInfo { tab_id },
                None => Response::error("Tab ID not available"),
            },
            Message::ShowNotification { title, message } => {
                let title = title.unwrap_or_else(|| "Claude Notification".into());
                let message = message.unwrap_or_else(|| "Notification from Claude".into());
                if let Err(e) = self.notifier.notify(&title, &message) {
                    warn!(error = %e, "notification failed");
                }
                Response::Ack { success: true }
            }
            Message::InjectScriptIntoFrame {
                tab_id,
                frame_selector,
            } => {
                let (Some(tab_id), Some(selector)) = (tab_id, frame_selector) else {
                    return Response::error("Missing required parameters");
                };
                match self.injector.inject(tab_id, &selector).await {
                    Ok(results) => {
                        info!(tab_id = tab_id, frame = %selector, "script injected");
                        Response::Injected {
                            success: true,
                            results,
                        }
                    }
                    Err(error) => {
                        warn!(tab_id = tab_id, frame = %selector, error = %error, "script injection failed");
                        Response::Error { error }
                    }
                }
            }
            Message::UpdateSettings { settings } => {
                self.settings = settings;
                Response::Ack { success: true }
            }
        }
    }

    /// Serve envelopes until every client is dropped.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let response = self.handle(envelope.message, envelope.sender).await;
            if let Some(reply) = envelope.reply {
                // The requester may have given up; nothing to do then.
                let _ = reply.send(response);
            }
        }
        debug!("coordinator stopped");
    }
}

/// Content-side handle on the coordinator.
#[derive(Debug, Clone)]
pub struct BackgroundClient {
    tx: mpsc::UnboundedSender<Envelope>,
    sender: SenderInfo,
}

impl BackgroundClient {
    pub fn new(tx: mpsc::UnboundedSender<Envelope>, sender: SenderInfo) -> Self {
        Self { tx, sender }
    }

    /// Fire and forget.
    pub fn post(&self, message: Message) -> Result<(), ObserverError> {
        self.tx
            .send(Envelope {
                message,
                sender: self.sender,
                reply: None,
            })
            .map_err(|_| ObserverError::Messaging("coordinator unreachable".into()))
    }

    pub async fn send(&self, message: Message) -> Result<Response, ObserverError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                message,
                sender: self.sender,
                reply: Some(reply),
            })
            .map_err(|_| ObserverError::Messaging("coordinator unreachable".into()))?;
        rx.await
            .map_err(|_| ObserverError::Messaging("coordinator dropped the request".into()))
    }

    /// Ask the coordinator to run the observer inside the frame marked with
    /// `data-extension-frame-id="<frame_selector>"`.
    pub async fn inject_into_frame(&self, frame_selector: &str) -> Result<Vec<Value>, ObserverError> {
        let tab_id = match self.send(Message::GetTabInfo).await?.into_result()? {
            Response::TabInfo { tab_id } => tab_id,
            other => return Err(ObserverError::Messaging(format!("unexpected reply {other:?}"))),
        };
        match self
            .send(Message::InjectScriptIntoFrame {
                tab_id: Some(tab_id),
                frame_selector: Some(frame_selector.to_string()),
            })
            .await?
            .into_result()?
        {
            Response::Injected { results, .. } => Ok(results),
            other => Err(ObserverError::Messaging(format!("unexpected reply {other:?}"))),
        }
    }
}

/// Spawn a coordinator task and return a client bound to `sender`.
pub fn spawn_coordinator<N, I>(coordinator: Coordinator<N, I>, sender: SenderInfo) -> BackgroundClient
where
    N: Notifier + 'static,
    I: FrameInjector + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(coordinator.run(rx));
    BackgroundClient::new(tx, sender)
}
