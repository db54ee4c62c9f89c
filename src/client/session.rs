//! Conversation state machine on top of a [`RelayTransport`].
//!
//! A session holds the ordered message list and allows one exchange at a
//! time. State lives behind a short-lived lock that is never held across an
//! await, so a second `send` issued while the first is in flight observes
//! [`SessionState::AwaitingReply`] and is rejected.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::consumer::StreamConsumer;
use super::transport::{RelayReply, RelayRequest, RelayTransport};
use super::ClientError;
use crate::config::ClientConfig;
use crate::relay::WireMessage;
use crate::state::IdGenerator;
use crate::util::unix_now_millis;

const CANCELLED_TEXT: &str = "Request cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: uuid::Uuid,
    pub role: Role,
    pub text: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeMode {
    /// Reply arrives as a stream of deltas.
    #[default]
    Stream,
    /// Reply arrives as one document.
    Whole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingReply,
}

/// How an accepted exchange ended. Either way the session is idle again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Replied,
    /// The assistant message was flagged failed.
    Failed(ClientError),
}

/// Rejections that leave the conversation untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("an exchange is already in progress")]
    Busy,
    #[error("message is empty")]
    EmptyMessage,
    #[error("no user message to retry")]
    NothingToRetry,
}

/// Receives every visible change to the conversation.
pub trait ReplySink {
    fn on_update(&mut self, message: &ChatMessage);
}

impl<F> ReplySink for F
where
    F: FnMut(&ChatMessage),
{
    fn on_update(&mut self, message: &ChatMessage) {
        self(message);
    }
}

struct Conversation {
    messages: Vec<ChatMessage>,
    state: SessionState,
    mode: ExchangeMode,
    model: Option<String>,
}

impl Conversation {
    fn find_mut(&mut self, id: uuid::Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().rev().find(|message| message.id == id)
    }

    /// History sent upstream: everything except failed or empty replies.
    fn wire_history(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .filter(|message| !message.failed && !message.text.is_empty())
            .map(|message| WireMessage {
                role: message.role.as_str().to_string(),
                content: message.text.clone(),
            })
            .collect()
    }
}

/// Chat session controller.
pub struct ChatSession<T> {
    transport: T,
    conversation: Mutex<Conversation>,
    ids: IdGenerator,
}

impl<T: RelayTransport> ChatSession<T> {
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            conversation: Mutex::new(Conversation {
                messages: Vec::new(),
                state: SessionState::Idle,
                mode: ExchangeMode::Stream,
                model: None,
            }),
            ids: IdGenerator::new(),
        }
    }

    /// Session with mode and model taken from the client config.
    #[must_use]
    pub fn with_config(transport: T, config: &ClientConfig) -> Self {
        let session = Self::new(transport);
        {
            let mut conversation = session.conversation.lock();
            conversation.mode = if config.stream {
                ExchangeMode::Stream
            } else {
                ExchangeMode::Whole
            };
            conversation.model.clone_from(&config.model);
        }
        session
    }

    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.conversation.lock().messages.clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.conversation.lock().state
    }

    #[must_use]
    pub fn mode(&self) -> ExchangeMode {
        self.conversation.lock().mode
    }

    /// Takes effect from the next `send`.
    pub fn set_mode(&self, mode: ExchangeMode) {
        self.conversation.lock().mode = mode;
    }

    pub fn set_model(&self, model: Option<String>) {
        self.conversation.lock().model = model;
    }

    /// Empty the conversation.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] while an exchange is in flight.
    pub fn clear(&self) -> Result<(), SessionError> {
        let mut conversation = self.conversation.lock();
        if conversation.state != SessionState::Idle {
            return Err(SessionError::Busy);
        }
        conversation.messages.clear();
        Ok(())
    }

    fn new_message(&self, role: Role, text: String) -> ChatMessage {
        ChatMessage {
            id: self.ids.next_uuid(),
            role,
            text,
            created_at: unix_now_millis(),
            model: None,
            failed: false,
        }
    }

    /// Append a user message and run one exchange in the configured mode.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] while another exchange is in flight and
    /// [`SessionError::EmptyMessage`] for blank input. Transport and relay
    /// failures are not errors here: they end in a failed assistant message
    /// and [`ExchangeOutcome::Failed`].
    pub async fn send<K: ReplySink>(
        &self,
        text: &str,
        sink: &mut K,
    ) -> Result<ExchangeOutcome, SessionError> {
        let text = text.trim();
        let (user_message, request, placeholder) = {
            let mut conversation = self.conversation.lock();
            if conversation.state != SessionState::Idle {
                return Err(SessionError::Busy);
            }
            if text.is_empty() {
                return Err(SessionError::EmptyMessage);
            }
            let user_message = self.new_message(Role::User, text.to_string());
            conversation.messages.push(user_message.clone());
            let mode = conversation.mode;
            let request = RelayRequest {
                messages: conversation.wire_history(),
                model: conversation.model.clone(),
                stream: mode == ExchangeMode::Stream,
            };
            let placeholder = (mode == ExchangeMode::Stream).then(|| {
                let placeholder = self.new_message(Role::Assistant, String::new());
                conversation.messages.push(placeholder.clone());
                placeholder
            });
            conversation.state = SessionState::AwaitingReply;
            (user_message, request, placeholder)
        };

        sink.on_update(&user_message);
        if let Some(placeholder) = &placeholder {
            sink.on_update(placeholder);
        }
        Ok(self
            .run_exchange(request, placeholder.map(|message| message.id), sink)
            .await)
    }

    /// Re-issue the last user message as a whole-response exchange, dropping
    /// any assistant replies that followed it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Busy`] while an exchange is in flight and
    /// [`SessionError::NothingToRetry`] when there is no user message.
    pub async fn retry<K: ReplySink>(&self, sink: &mut K) -> Result<ExchangeOutcome, SessionError> {
        let request = {
            let mut conversation = self.conversation.lock();
            if conversation.state != SessionState::Idle {
                return Err(SessionError::Busy);
            }
            let last_user = conversation
                .messages
                .iter()
                .rposition(|message| message.role == Role::User)
                .ok_or(SessionError::NothingToRetry)?;
            conversation.messages.truncate(last_user + 1);
            conversation.state = SessionState::AwaitingReply;
            RelayRequest {
                messages: conversation.wire_history(),
                model: conversation.model.clone(),
                stream: false,
            }
        };
        Ok(self.run_exchange(request, None, sink).await)
    }

    async fn run_exchange<K: ReplySink>(
        &self,
        request: RelayRequest,
        pending: Option<uuid::Uuid>,
        sink: &mut K,
    ) -> ExchangeOutcome {
        let mut guard = ExchangeGuard {
            session: self,
            sink,
            pending,
            armed: true,
        };
        let outcome = guard.exchange(request).await;
        guard.armed = false;
        outcome
    }
}

/// Owns the in-flight exchange. Dropping it while armed (the `send` future
/// was dropped mid-await) flags the reply cancelled and returns to idle.
struct ExchangeGuard<'a, T: RelayTransport, K: ReplySink> {
    session: &'a ChatSession<T>,
    sink: &'a mut K,
    /// Assistant message being filled, if one exists yet.
    pending: Option<uuid::Uuid>,
    armed: bool,
}

impl<T: RelayTransport, K: ReplySink> ExchangeGuard<'_, T, K> {
    async fn exchange(&mut self, request: RelayRequest) -> ExchangeOutcome {
        let reply = match self.session.transport.send(request).await {
            Ok(reply) => reply,
            Err(err) => return self.fail(err, None),
        };

        match reply {
            RelayReply::Whole(reply) => {
                let id = self.pending_id();
                self.update(id, |message| {
                    message.text = reply.message;
                    message.model = reply.model;
                });
                self.finish(ExchangeOutcome::Replied)
            }
            RelayReply::Stream(bytes) => {
                let id = self.pending_id();
                let session = self.session;
                let sink = &mut *self.sink;
                let result = StreamConsumer::new()
                    .consume(bytes, |delta| {
                        let snapshot = {
                            let mut conversation = session.conversation.lock();
                            conversation.find_mut(id).map(|message| {
                                message.text.push_str(delta);
                                message.clone()
                            })
                        };
                        if let Some(snapshot) = snapshot {
                            sink.on_update(&snapshot);
                        }
                    })
                    .await;
                match result {
                    Ok(reply) => {
                        let model = reply.model;
                        self.update(id, |message| message.model = model);
                        match reply.failure {
                            None => self.finish(ExchangeOutcome::Replied),
                            Some(failure) => self.fail(
                                ClientError::Interrupted {
                                    reason: failure.reason,
                                    message: failure.message,
                                },
                                Some(id),
                            ),
                        }
                    }
                    Err(err) => self.fail(err, Some(id)),
                }
            }
        }
    }

    /// Id of the assistant message to fill, creating it when missing.
    fn pending_id(&mut self) -> uuid::Uuid {
        if let Some(id) = self.pending {
            return id;
        }
        let message = self.session.new_message(Role::Assistant, String::new());
        let id = message.id;
        self.session.conversation.lock().messages.push(message);
        self.pending = Some(id);
        id
    }

    fn update(&mut self, id: uuid::Uuid, apply: impl FnOnce(&mut ChatMessage)) {
        let snapshot = {
            let mut conversation = self.session.conversation.lock();
            conversation.find_mut(id).map(|message| {
                apply(message);
                message.clone()
            })
        };
        if let Some(snapshot) = snapshot {
            self.sink.on_update(&snapshot);
        }
    }

    fn fail(&mut self, err: ClientError, id: Option<uuid::Uuid>) -> ExchangeOutcome {
        tracing::warn!(error = %err, reason = err.reason().as_str(), "chat exchange failed");
        let id = match id.or(self.pending) {
            Some(id) => id,
            None => self.pending_id(),
        };
        let text = err.display_text();
        self.update(id, |message| {
            message.failed = true;
            if message.text.is_empty() {
                message.text = text;
            }
        });
        self.finish(ExchangeOutcome::Failed(err))
    }

    fn finish(&mut self, outcome: ExchangeOutcome) -> ExchangeOutcome {
        self.session.conversation.lock().state = SessionState::Idle;
        self.armed = false;
        outcome
    }
}

impl<T: RelayTransport, K: ReplySink> Drop for ExchangeGuard<'_, T, K> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::debug!("chat exchange dropped before completion");
        let id = self.pending_id();
        self.update(id, |message| {
            message.failed = true;
            if message.text.is_empty() {
                message.text = CANCELLED_TEXT.to_string();
            }
        });
        self.session.conversation.lock().state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;

    use bytes::Bytes;
    use futures_util::{stream, StreamExt};

    use super::*;
    use crate::client::transport::WholeReply;
    use crate::stream::FailureReason;

    enum Scripted {
        Frames(Vec<&'static str>),
        Whole(&'static str),
        Fail(ClientError),
        Hang,
    }

    #[derive(Clone, Default)]
    struct ScriptedTransport {
        script: Arc<Mutex<VecDeque<Scripted>>>,
        requests: Arc<Mutex<Vec<RelayRequest>>>,
        release: Arc<tokio::sync::Notify>,
    }

    impl ScriptedTransport {
        fn with(script: Vec<Scripted>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                ..Self::default()
            }
        }

        fn requests(&self) -> Vec<RelayRequest> {
            self.requests.lock().clone()
        }
    }

    impl RelayTransport for ScriptedTransport {
        async fn send(&self, request: RelayRequest) -> Result<RelayReply, ClientError> {
            self.requests.lock().push(request);
            let next = self.script.lock().pop_front();
            match next {
                Some(Scripted::Frames(frames)) => {
                    let chunks: Vec<Result<Bytes, ClientError>> = frames
                        .into_iter()
                        .map(|frame| Ok(Bytes::from_static(frame.as_bytes())))
                        .collect();
                    Ok(RelayReply::Stream(stream::iter(chunks).boxed()))
                }
                Some(Scripted::Whole(text)) => Ok(RelayReply::Whole(WholeReply {
                    message: text.to_string(),
                    model: Some("m".to_string()),
                })),
                Some(Scripted::Fail(err)) => Err(err),
                Some(Scripted::Hang) => {
                    self.release.notified().await;
                    Ok(RelayReply::Whole(WholeReply {
                        message: "late".to_string(),
                        model: None,
                    }))
                }
                None => Err(ClientError::Transport("script exhausted".to_string())),
            }
        }
    }

    fn noop(_: &ChatMessage) {}

    #[tokio::test]
    async fn test_streamed_reply_fills_placeholder() {
        let transport = ScriptedTransport::with(vec![Scripted::Frames(vec![
            "data: {\"content\":\"Hel\",\"model\":\"m\"}\n\n",
            "data: {\"content\":\"lo\",\"model\":\"m\"}\n\ndata: [DONE]\n\n",
        ])]);
        let session = ChatSession::new(transport.clone());
        let mut updates = Vec::new();
        let mut sink = |message: &ChatMessage| updates.push(message.text.clone());

        let outcome = session.send("  hi  ", &mut sink).await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Replied);
        assert_eq!(updates, vec!["hi", "", "Hel", "Hello", "Hello"]);

        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].text, "Hello");
        assert_eq!(messages[1].model.as_deref(), Some("m"));
        assert!(!messages[1].failed);
        assert_eq!(session.state(), SessionState::Idle);

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].stream);
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let session = ChatSession::new(ScriptedTransport::default());
        assert_eq!(
            session.send("   ", &mut noop).await,
            Err(SessionError::EmptyMessage)
        );
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_relay_error_appends_failed_reply() {
        let transport = ScriptedTransport::with(vec![Scripted::Fail(ClientError::Relay {
            status: 401,
            reason: FailureReason::Unauthorized,
            message: "Invalid API key".to_string(),
        })]);
        let session = ChatSession::new(transport);
        session.set_mode(ExchangeMode::Whole);

        let outcome = session.send("hi", &mut noop).await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Failed(ClientError::Relay { status: 401, .. })));
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].failed);
        assert_eq!(messages[1].text, "Invalid API key");
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failure_frame_keeps_partial_text() {
        let transport = ScriptedTransport::with(vec![Scripted::Frames(vec![
            "data: {\"content\":\"par\"}\n\n",
            "data: {\"error\":\"reset\",\"reason\":\"unavailable\"}\n\ndata: [DONE]\n\n",
        ])]);
        let session = ChatSession::new(transport);
        let outcome = session.send("hi", &mut noop).await.unwrap();
        assert!(matches!(outcome, ExchangeOutcome::Failed(ClientError::Interrupted { .. })));
        let reply = &session.messages()[1];
        assert!(reply.failed);
        assert_eq!(reply.text, "par");
    }

    #[tokio::test]
    async fn test_retry_reissues_without_duplicating_user_message() {
        let transport = ScriptedTransport::with(vec![
            Scripted::Fail(ClientError::Transport("down".to_string())),
            Scripted::Whole("recovered"),
        ]);
        let session = ChatSession::new(transport.clone());
        session.send("question", &mut noop).await.unwrap();
        assert!(session.messages()[1].failed);

        let outcome = session.retry(&mut noop).await.unwrap();
        assert_eq!(outcome, ExchangeOutcome::Replied);
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, "question");
        assert_eq!(messages[1].text, "recovered");
        assert!(!messages[1].failed);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert!(!requests[1].stream);
        assert_eq!(requests[1].messages.len(), 1);
        assert_eq!(requests[1].messages[0].content, "question");
    }

    #[tokio::test]
    async fn test_retry_without_user_message() {
        let session = ChatSession::new(ScriptedTransport::default());
        assert_eq!(
            session.retry(&mut noop).await,
            Err(SessionError::NothingToRetry)
        );
    }

    #[tokio::test]
    async fn test_second_send_while_awaiting_is_busy() {
        let transport = ScriptedTransport::with(vec![Scripted::Hang]);
        let release = Arc::clone(&transport.release);
        let session = ChatSession::new(transport);
        session.set_mode(ExchangeMode::Whole);

        let mut first_sink = noop;
        let first = session.send("one", &mut first_sink);
        tokio::pin!(first);
        assert!(futures_util::poll!(first.as_mut()).is_pending());
        assert_eq!(session.state(), SessionState::AwaitingReply);

        assert_eq!(session.send("two", &mut noop).await, Err(SessionError::Busy));
        assert_eq!(session.clear(), Err(SessionError::Busy));

        release.notify_one();
        assert_eq!(first.await, Ok(ExchangeOutcome::Replied));
        assert_eq!(session.messages().len(), 2);
        assert!(session.clear().is_ok());
        assert!(session.messages().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_send_flags_message_cancelled() {
        let transport = ScriptedTransport::with(vec![Scripted::Hang]);
        let session = ChatSession::new(transport);
        let mut sink = noop;
        {
            let first = session.send("one", &mut sink);
            tokio::pin!(first);
            assert!(futures_util::poll!(first.as_mut()).is_pending());
        }
        assert_eq!(session.state(), SessionState::Idle);
        let messages = session.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].failed);
        assert_eq!(messages[1].text, CANCELLED_TEXT);
    }

    #[tokio::test]
    async fn test_failed_replies_are_left_out_of_history() {
        let transport = ScriptedTransport::with(vec![
            Scripted::Fail(ClientError::Transport("down".to_string())),
            Scripted::Whole("ok"),
        ]);
        let session = ChatSession::new(transport.clone());
        session.set_mode(ExchangeMode::Whole);
        session.send("first", &mut noop).await.unwrap();
        session.send("second", &mut noop).await.unwrap();
        let requests = transport.requests();
        let contents: Vec<&str> = requests[1]
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_transcript_serializes_and_reloads() {
        let transport = ScriptedTransport::with(vec![Scripted::Whole("pong")]);
        let session = ChatSession::new(transport);
        session.set_mode(ExchangeMode::Whole);
        session.send("ping", &mut noop).await.unwrap();

        let messages = session.messages();
        let json = serde_json::to_value(&messages).unwrap();
        assert_eq!(json[0]["role"], "user");
        assert_eq!(json[0]["id"], messages[0].id.to_string());
        assert_eq!(json[1]["model"], "m");
        let reloaded: Vec<ChatMessage> = serde_json::from_value(json).unwrap();
        assert_eq!(reloaded, messages);
    }
}
