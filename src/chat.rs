//! Chat sessions layered over completed pipeline runs.
//!
//! Sessions are keyed by document id and created lazily. Each session sits
//! behind its own `tokio::sync::Mutex`, which is held for the whole turn
//! (append user message, call the model, append reply). Tokio's mutex is
//! fair, so concurrent messages for one document are processed one at a
//! time in arrival order while different documents proceed in parallel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::inference::{CompletionRequest, InferenceClient, InferenceError, Message, Role};

/// Longest accepted chat message, in characters.
pub const MAX_MESSAGE_CHARS: usize = 8_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct ChatSession {
    context: Option<String>,
    turns: Vec<ChatTurn>,
    last_active: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub document_id: String,
    pub reply: String,
    pub turn_count: usize,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("message is longer than {} characters", MAX_MESSAGE_CHARS)]
    MessageTooLong,
    #[error(transparent)]
    Model(#[from] InferenceError),
}

pub struct ChatManager {
    sessions: DashMap<String, Arc<Mutex<ChatSession>>>,
    client: Arc<dyn InferenceClient>,
    ttl: Duration,
    max_history: usize,
}

impl ChatManager {
    pub fn new(client: Arc<dyn InferenceClient>, ttl: Duration, max_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            client,
            ttl,
            max_history: max_history.max(1),
        }
    }

    fn session(&self, document_id: &str) -> Arc<Mutex<ChatSession>> {
        // clone the Arc so the map shard lock is released before awaiting
        self.sessions
            .entry(document_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ChatSession {
                    context: None,
                    turns: Vec::new(),
                    last_active: Instant::now(),
                }))
            })
            .value()
            .clone()
    }

    /// Seed a document's session with its optimized context.
    pub async fn attach_context(&self, document_id: &str, context: String) {
        let session = self.session(document_id);
        let mut session = session.lock().await;
        session.context = Some(context);
        session.last_active = Instant::now();
    }

    /// Send one user message. Without a document id a fresh session is
    /// started and its id returned in the reply.
    pub async fn send_message(
        &self,
        document_id: Option<&str>,
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(ChatError::MessageTooLong);
        }

        let document_id = match document_id.filter(|id| !id.trim().is_empty()) {
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let session = self.session(&document_id);
        let mut session = session.lock().await;

        session.turns.push(ChatTurn {
            role: Role::User,
            message: message.to_string(),
            timestamp: Utc::now(),
        });
        let request = self.request_for(&session);

        let reply = match self.client.complete(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                // leave the session as it was before this turn
                session.turns.pop();
                tracing::warn!(document_id = %document_id, error = %e, "chat turn failed");
                return Err(e.into());
            }
        };

        session.turns.push(ChatTurn {
            role: Role::Assistant,
            message: reply.clone(),
            timestamp: Utc::now(),
        });
        session.last_active = Instant::now();

        Ok(ChatReply {
            document_id,
            reply,
            turn_count: session.turns.len(),
        })
    }

    fn request_for(&self, session: &ChatSession) -> CompletionRequest {
        let mut system = String::from(
            "You are DocuMind, an assistant that helps developers understand a processed document \
             and refine the context files generated from it. Answer concisely.",
        );
        if let Some(context) = &session.context {
            system.push_str("\n\nDocument context:\n");
            system.push_str(context);
        }

        let skip = session.turns.len().saturating_sub(self.max_history);
        let messages = session.turns[skip..]
            .iter()
            .map(|t| Message {
                role: t.role,
                text: t.message.clone(),
            })
            .collect();

        CompletionRequest {
            system: Some(system),
            messages,
            json: false,
        }
    }

    /// Turns recorded for a document, oldest first.
    pub async fn history(&self, document_id: &str) -> Option<Vec<ChatTurn>> {
        let session = self.sessions.get(document_id)?.value().clone();
        let turns = session.lock().await.turns.clone();
        Some(turns)
    }

    /// Drop sessions idle for longer than the TTL. A session is kept while
    /// any caller holds a handle to it, even before that caller has taken
    /// the lock. `retain` holds the shard lock, so no new handle can appear
    /// between the count check and the removal.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| {
            if Arc::strong_count(session) > 1 {
                return true;
            }
            match session.try_lock() {
                Ok(s) => now.saturating_duration_since(s.last_active) <= self.ttl,
                Err(_) => true,
            }
        });
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Echoes the last user message. The first call sleeps, so a later
    /// caller would overtake it without per-session serialization.
    struct EchoModel {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl EchoModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    #[async_trait]
    impl InferenceClient for EchoModel {
        fn model(&self) -> &str {
            "echo"
        }

        async fn complete(&self, request: &CompletionRequest) -> Result<String, InferenceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let last = request.messages.last().map(|m| m.text.clone()).unwrap_or_default();
            if Some(last.as_str()) == self.fail_on {
                return Err(InferenceError::Unavailable("down".into()));
            }
            if n == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(format!("re: {}", last))
        }
    }

    fn manager(model: EchoModel, max_history: usize) -> Arc<ChatManager> {
        Arc::new(ChatManager::new(
            Arc::new(model),
            Duration::from_secs(60),
            max_history,
        ))
    }

    #[tokio::test]
    async fn same_document_turns_are_serialized_in_arrival_order() {
        let chat = manager(EchoModel::new(), 40);
        let first = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message(Some("doc"), "one").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let chat = chat.clone();
            tokio::spawn(async move { chat.send_message(Some("doc"), "two").await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let turns: Vec<String> = chat
            .history("doc")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.message)
            .collect();
        assert_eq!(turns, vec!["one", "re: one", "two", "re: two"]);
    }

    #[tokio::test]
    async fn missing_document_id_starts_a_fresh_session() {
        let chat = manager(EchoModel::new(), 40);
        let reply = chat.send_message(None, "hello").await.unwrap();
        assert_eq!(reply.reply, "re: hello");
        assert_eq!(reply.turn_count, 2);
        assert!(chat.history(&reply.document_id).await.is_some());
    }

    #[tokio::test]
    async fn failed_model_call_leaves_session_unchanged() {
        let chat = manager(
            EchoModel {
                calls: AtomicUsize::new(1),
                fail_on: Some("bad"),
            },
            40,
        );
        chat.send_message(Some("d"), "good").await.unwrap();
        let err = chat.send_message(Some("d"), "bad").await.unwrap_err();
        assert!(matches!(err, ChatError::Model(_)));
        assert_eq!(chat.history("d").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejects_empty_messages() {
        let chat = manager(EchoModel::new(), 40);
        assert!(matches!(
            chat.send_message(Some("d"), "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(chat.is_empty());
    }

    #[tokio::test]
    async fn history_sent_to_model_is_capped_and_context_attached() {
        let chat = manager(
            EchoModel {
                calls: AtomicUsize::new(1),
                fail_on: None,
            },
            3,
        );
        chat.attach_context("d", "the optimized context".into()).await;
        for m in ["a", "b", "c"] {
            chat.send_message(Some("d"), m).await.unwrap();
        }
        let session = chat.session("d");
        let session = session.lock().await;
        let request = chat.request_for(&session);
        assert_eq!(request.messages.len(), 3);
        assert_eq!(request.messages[0].text, "re: b");
        assert!(request.system.unwrap().contains("the optimized context"));
    }

    #[tokio::test]
    async fn sweep_expires_idle_sessions() {
        let chat = manager(EchoModel::new(), 40);
        chat.attach_context("d", "ctx".into()).await;
        assert_eq!(chat.sweep(Instant::now()), 0);
        assert_eq!(chat.sweep(Instant::now() + Duration::from_secs(120)), 1);
        assert!(chat.is_empty());
    }

    #[tokio::test]
    async fn sweep_keeps_a_session_whose_handle_is_held() {
        let chat = manager(EchoModel::new(), 40);
        chat.send_message(Some("d"), "first").await.unwrap();

        // a turn that has fetched the session but not yet locked it
        let held = chat.session("d");
        assert_eq!(chat.sweep(Instant::now() + Duration::from_secs(120)), 0);

        held.lock().await.turns.push(ChatTurn {
            role: Role::User,
            message: "second".into(),
            timestamp: Utc::now(),
        });
        drop(held);
        let history = chat.history("d").await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].message, "second");

        // once released, the idle session expires as usual
        assert_eq!(chat.sweep(Instant::now() + Duration::from_secs(120)), 1);
    }
}
