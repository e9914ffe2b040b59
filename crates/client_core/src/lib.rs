use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{ConversationId, Message, MessageId, UserId},
    protocol::{ConversationList, EVENT_SERVER_MESSAGE},
};
use tokio::sync::{broadcast, watch};
use tracing::info;

pub mod backoff;
pub mod config;
pub mod dispatcher;
pub mod encoder;
pub mod error;
pub mod history;
pub mod session;
pub mod store;
pub mod transport;

pub use config::{load_settings, ClientSettings};
pub use error::{HistoryError, SessionError};
pub use history::{AuthFailureHandler, HistorySource, IgnoreAuthFailures, RestHistoryClient};
pub use session::{ConversationSession, SendReceipt, SessionPhase};
pub use transport::{CommandTransport, ConnectionManager, ConnectionState};

use dispatcher::{handler, EventDispatcher, SIGNAL_CONNECT, SIGNAL_DISCONNECT, SIGNAL_ERROR};
use store::MergeStats;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected {
        reason: String,
    },
    ConversationsUpdated {
        count: usize,
    },
    Joined {
        conversation_id: ConversationId,
    },
    /// The log of `conversation_id` changed; re-read it with `messages`.
    LogUpdated {
        conversation_id: ConversationId,
    },
    MessageFailed {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    HistoryLoaded {
        conversation_id: ConversationId,
        stats: MergeStats,
    },
    /// Legacy `{sender, message}` announcement from the server.
    ServerNotice(Value),
    Error(String),
}

/// Client-side sync engine: one websocket shared by every conversation, one
/// retained session per conversation and at most one active conversation.
pub struct SyncClient {
    local_user: UserId,
    ack_timeout: Option<Duration>,
    dispatcher: Arc<EventDispatcher>,
    transport: Arc<ConnectionManager>,
    history: Arc<dyn HistorySource>,
    inner: Mutex<SyncClientState>,
    events: broadcast::Sender<ClientEvent>,
}

struct SyncClientState {
    conversations: ConversationList,
    sessions: HashMap<ConversationId, Arc<ConversationSession>>,
    active: Option<ConversationId>,
}

impl SyncClient {
    pub fn new(
        settings: &ClientSettings,
        local_user: UserId,
        history: Arc<dyn HistorySource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let dispatcher = EventDispatcher::new();
        register_signal_forwarding(&dispatcher, &events);

        let transport = Arc::new(ConnectionManager::new(
            settings.ws_url.clone(),
            settings.reconnect_policy(),
            Arc::clone(&dispatcher),
        ));
        let ack_timeout = Some(settings.ack_timeout()).filter(|timeout| !timeout.is_zero());

        Arc::new(Self {
            local_user,
            ack_timeout,
            dispatcher,
            transport,
            history,
            inner: Mutex::new(SyncClientState {
                conversations: Vec::new(),
                sessions: HashMap::new(),
                active: None,
            }),
            events,
        })
    }

    /// Builds a client talking to the configured REST endpoint.
    pub fn from_settings(
        settings: &ClientSettings,
        auth: Arc<dyn AuthFailureHandler>,
    ) -> Result<Arc<Self>> {
        settings.validate()?;
        let user_id = settings
            .user_id
            .clone()
            .context("user_id is not configured (set APP__USER_ID)")?;
        let history = RestHistoryClient::new(settings.api_base_url.clone(), auth)?;
        Ok(Self::new(settings, UserId::new(user_id), Arc::new(history)))
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Extra handlers (e.g. for events no session consumes) hook in here.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn connect(&self) {
        self.transport.connect();
    }

    /// Leaves the active conversation and closes the socket for good.
    pub fn close(&self) {
        self.deselect_conversation();
        self.transport.close();
        info!("sync client closed");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe_state()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn list_conversations(&self) -> Result<ConversationList, HistoryError> {
        let conversations = self.history.list_conversations().await?;
        {
            let mut state = self.inner.lock();
            for summary in &conversations {
                if let Some(session) = state.sessions.get(&summary.id) {
                    session.set_summary(summary.clone());
                }
            }
            state.conversations = conversations.clone();
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated {
            count: conversations.len(),
        });
        Ok(conversations)
    }

    /// Last listing fetched by [`Self::list_conversations`].
    pub fn conversations(&self) -> ConversationList {
        self.inner.lock().conversations.clone()
    }

    /// Makes `conversation_id` the active conversation: leaves the previous
    /// one and joins this one, connecting if needed. Re-selecting the active
    /// conversation is a no-op.
    pub fn select_conversation(&self, conversation_id: ConversationId) -> Arc<ConversationSession> {
        let (previous, session) = {
            let mut state = self.inner.lock();
            if state.active.as_ref() == Some(&conversation_id) {
                if let Some(session) = state.sessions.get(&conversation_id) {
                    return Arc::clone(session);
                }
            }

            let previous_id = state.active.take();
            let previous = previous_id.and_then(|active| state.sessions.get(&active).cloned());
            let summary = state
                .conversations
                .iter()
                .find(|summary| summary.id == conversation_id)
                .cloned();
            let session = state
                .sessions
                .entry(conversation_id.clone())
                .or_insert_with(|| self.new_session(conversation_id.clone()))
                .clone();
            if let Some(summary) = summary {
                session.set_summary(summary);
            }
            state.active = Some(conversation_id.clone());
            (previous, session)
        };

        if let Some(previous) = previous {
            previous.leave();
        }
        info!(conversation_id = %conversation_id, "conversation selected");
        session.join();
        session
    }

    /// Leaves the active conversation, if any. Its log is retained.
    pub fn deselect_conversation(&self) -> bool {
        let previous = {
            let mut state = self.inner.lock();
            let previous_id = state.active.take();
            previous_id.and_then(|active| state.sessions.get(&active).cloned())
        };
        match previous {
            Some(session) => session.leave(),
            None => false,
        }
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().active.clone()
    }

    pub fn active_session(&self) -> Option<Arc<ConversationSession>> {
        let state = self.inner.lock();
        state
            .active
            .as_ref()
            .and_then(|active| state.sessions.get(active).cloned())
    }

    pub fn session(&self, conversation_id: &ConversationId) -> Option<Arc<ConversationSession>> {
        self.inner.lock().sessions.get(conversation_id).cloned()
    }

    /// Sends `content` to the active conversation.
    pub fn send_message(&self, content: &str) -> Result<SendReceipt, SessionError> {
        let session = self
            .active_session()
            .ok_or(SessionError::NoActiveConversation)?;
        session.send(content)
    }

    pub async fn load_older_history(&self) -> Result<MergeStats> {
        let session = self
            .active_session()
            .ok_or(SessionError::NoActiveConversation)?;
        Ok(session.load_older_history().await?)
    }

    /// Ordered snapshot of a conversation's log; empty if never selected.
    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.session(conversation_id)
            .map(|session| session.messages())
            .unwrap_or_default()
    }

    fn new_session(&self, conversation_id: ConversationId) -> Arc<ConversationSession> {
        ConversationSession::new(
            conversation_id,
            self.local_user.clone(),
            self.transport.clone(),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.history),
            self.events.clone(),
            self.ack_timeout,
        )
    }
}

fn register_signal_forwarding(
    dispatcher: &EventDispatcher,
    events: &broadcast::Sender<ClientEvent>,
) {
    let tx = events.clone();
    dispatcher.on(
        SIGNAL_CONNECT,
        handler(move |_| {
            let _ = tx.send(ClientEvent::Connected);
            Ok(())
        }),
    );

    let tx = events.clone();
    dispatcher.on(
        SIGNAL_DISCONNECT,
        handler(move |payload| {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let _ = tx.send(ClientEvent::Disconnected { reason });
            Ok(())
        }),
    );

    let tx = events.clone();
    dispatcher.on(
        SIGNAL_ERROR,
        handler(move |payload| {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("websocket error")
                .to_string();
            let _ = tx.send(ClientEvent::Error(message));
            Ok(())
        }),
    );

    let tx = events.clone();
    dispatcher.on(
        EVENT_SERVER_MESSAGE,
        handler(move |payload| {
            let _ = tx.send(ClientEvent::ServerNotice(payload.clone()));
            Ok(())
        }),
    );
}

#[cfg(test)]
#[path = "tests/fake_ws_server.rs"]
mod fake_ws_server;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
