//! WebSocket channel for interactive clients.
//!
//! Clients subscribe to progress for one document id (or `"*"` for every
//! run) and may chat over the same socket:
//!
//! ```json
//! {"type": "subscribe", "documentId": "..."}
//! {"type": "unsubscribe", "documentId": "..."}
//! {"type": "chat", "message": "...", "documentId": "..."}
//! ```
//!
//! The server pushes `progress`, `chat`, `subscribed` and `error` messages.
//! Progress comes from the ledger's broadcast channel; a client that falls
//! behind skips the events it missed rather than stalling the pipeline.
//! Chat frames from one socket are answered one at a time, in the order they
//! arrived, by a per-connection worker.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::chat::ChatManager;
use crate::ledger::ProgressEvent;
use crate::server::{AppError, AppState};

/// Subscription key matching every run.
pub const ALL_DOCUMENTS: &str = "*";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsIncoming {
    #[serde(rename_all = "camelCase")]
    Subscribe { document_id: String },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { document_id: String },
    #[serde(rename_all = "camelCase")]
    Chat {
        message: String,
        #[serde(default)]
        document_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WsOutgoing {
    Progress(ProgressEvent),
    #[serde(rename_all = "camelCase")]
    Subscribed { document_id: String },
    #[serde(rename_all = "camelCase")]
    Chat { document_id: String, reply: String },
    Error { code: String, message: String },
}

/// Tracks what a single connection wants to hear about.
#[derive(Debug, Default)]
pub(crate) struct Subscriptions {
    ids: HashSet<String>,
}

impl Subscriptions {
    fn apply(&mut self, msg: &WsIncoming) {
        match msg {
            WsIncoming::Subscribe { document_id } => {
                self.ids.insert(document_id.clone());
            }
            WsIncoming::Unsubscribe { document_id } => {
                self.ids.remove(document_id);
            }
            WsIncoming::Chat { .. } => {}
        }
    }

    fn wants(&self, event: &ProgressEvent) -> bool {
        self.ids.contains(ALL_DOCUMENTS) || self.ids.contains(&event.document_id)
    }
}

pub async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(64);
    let mut progress = state.service.pipeline.ledger().subscribe();
    let mut subscriptions = Subscriptions::default();

    let (chat_tx, chat_rx) = mpsc::channel::<ChatFrame>(16);
    let chat_worker = tokio::spawn(run_chat_worker(
        state.service.chat.clone(),
        state.service.is_production(),
        chat_rx,
        tx.clone(),
    ));

    let sender = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tracing::debug!("websocket connected");

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsIncoming>(text.as_str()) {
                            Ok(WsIncoming::Chat { message, document_id }) => {
                                if chat_tx.send(ChatFrame { message, document_id }).await.is_err() {
                                    break;
                                }
                            }
                            Ok(other) => {
                                subscriptions.apply(&other);
                                if let WsIncoming::Subscribe { document_id } = other {
                                    let _ = tx.send(WsOutgoing::Subscribed { document_id }).await;
                                }
                            }
                            Err(e) => {
                                let err = AppError::bad_request(format!("invalid message: {}", e));
                                let _ = tx.send(error_message(&err)).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
            event = progress.recv() => {
                match event {
                    Ok(event) => {
                        if subscriptions.wants(&event) && tx.send(WsOutgoing::Progress(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "websocket client lagging behind progress events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // let queued turns finish so no session is left with an unanswered user turn
    drop(chat_tx);
    let _ = chat_worker.await;
    drop(tx);
    let _ = sender.await;
    tracing::debug!("websocket disconnected");
}

/// A chat message received on a socket, waiting for its turn.
#[derive(Debug)]
struct ChatFrame {
    message: String,
    document_id: Option<String>,
}

/// Answer chat frames strictly in arrival order. Turns can take seconds, so
/// this runs beside the receive loop and progress keeps flowing meanwhile.
async fn run_chat_worker(
    chat: Arc<ChatManager>,
    production: bool,
    mut frames: mpsc::Receiver<ChatFrame>,
    tx: mpsc::Sender<WsOutgoing>,
) {
    while let Some(frame) = frames.recv().await {
        let outgoing = match chat.send_message(frame.document_id.as_deref(), &frame.message).await {
            Ok(reply) => WsOutgoing::Chat {
                document_id: reply.document_id,
                reply: reply.reply,
            },
            Err(e) => error_message(&AppError::from_chat(&e, production)),
        };
        let _ = tx.send(outgoing).await;
    }
}

fn error_message(err: &AppError) -> WsOutgoing {
    WsOutgoing::Error {
        code: err.code().to_string(),
        message: err.message().to_string(),
    }
}
