use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use shared::{
    domain::{ConversationId, ConversationSummary, Message, MessageId, UserId, WireMessage},
    protocol::{PageMeta, PageRequest, EVENT_MESSAGE_ACK, EVENT_MESSAGE_NEW},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dispatcher::{handler, EventDispatcher, Handler, SIGNAL_CONNECT, SIGNAL_DISCONNECT},
    encoder,
    error::{HistoryError, SessionError},
    history::HistorySource,
    store::{AckOutcome, MergeStats, MessageLog, PushOutcome},
    transport::{CommandTransport, ConnectionState},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// Result of a local send. `transmitted` is false when the socket refused the
/// command; the entry is then already marked failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: MessageId,
    pub transmitted: bool,
}

pub fn new_correlation_id() -> String {
    format!("tmp-{}", Uuid::new_v4())
}

struct SessionState {
    phase: SessionPhase,
    log: MessageLog,
    summary: Option<ConversationSummary>,
    /// Cursor for the next older page; set by the first history load.
    older_pages: Option<PageMeta>,
    join_generation: u64,
    subscriptions: Vec<(&'static str, Handler)>,
}

/// Binds one conversation to the shared transport and owns its message log.
pub struct ConversationSession {
    conversation_id: ConversationId,
    local_user: UserId,
    transport: Arc<dyn CommandTransport>,
    dispatcher: Arc<EventDispatcher>,
    history: Arc<dyn HistorySource>,
    events: broadcast::Sender<ClientEvent>,
    ack_timeout: Option<Duration>,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        transport: Arc<dyn CommandTransport>,
        dispatcher: Arc<EventDispatcher>,
        history: Arc<dyn HistorySource>,
        events: broadcast::Sender<ClientEvent>,
        ack_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conversation_id,
            local_user,
            transport,
            dispatcher,
            history,
            events,
            ack_timeout,
            state: Mutex::new(SessionState {
                phase: SessionPhase::Idle,
                log: MessageLog::new(),
                summary: None,
                older_pages: None,
                join_generation: 0,
                subscriptions: Vec::new(),
            }),
        })
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().log.entries().to_vec()
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.state.lock().log.get(id).cloned()
    }

    pub fn summary(&self) -> Option<ConversationSummary> {
        self.state.lock().summary.clone()
    }

    pub fn set_summary(&self, summary: ConversationSummary) {
        self.state.lock().summary = Some(summary);
    }

    pub fn has_older_history(&self) -> bool {
        self.state
            .lock()
            .older_pages
            .as_ref()
            .is_some_and(|meta| meta.has_more)
    }

    /// Idle → Joining, and → Joined as soon as the transport is connected.
    /// Returns false when the session is already active.
    pub fn join(self: &Arc<Self>) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Idle {
                return false;
            }
            state.phase = SessionPhase::Joining;
            state.subscriptions = self.subscribe();
        }
        info!(conversation_id = %self.conversation_id, "session: joining");
        self.transport.connect();
        self.try_complete_join();
        true
    }

    /// Stops dispatch to this session and tells the server. The log is kept.
    pub fn leave(&self) -> bool {
        let (subscriptions, was_joined) = {
            let mut state = self.state.lock();
            if matches!(state.phase, SessionPhase::Idle | SessionPhase::Leaving) {
                return false;
            }
            let was_joined = state.phase == SessionPhase::Joined;
            state.phase = SessionPhase::Leaving;
            (std::mem::take(&mut state.subscriptions), was_joined)
        };

        for (event, subscription) in &subscriptions {
            self.dispatcher.off(event, subscription);
        }
        if was_joined {
            encoder::send_command(self.transport.as_ref(), encoder::leave(&self.conversation_id));
        }

        self.state.lock().phase = SessionPhase::Idle;
        info!(conversation_id = %self.conversation_id, "session: left");
        true
    }

    /// Optimistically appends a pending entry and transmits it without
    /// waiting for the acknowledgment.
    pub fn send(self: &Arc<Self>, content: &str) -> Result<SendReceipt, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::EmptyContent);
        }

        let correlation_id = new_correlation_id();
        let message_id = MessageId::Local(correlation_id.clone());
        let transmitted = {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Joined {
                return Err(SessionError::NotJoined(self.conversation_id.clone()));
            }
            state.log.insert_pending(Message::pending(
                correlation_id.clone(),
                self.conversation_id.clone(),
                self.local_user.clone(),
                content,
                Utc::now(),
            ));
            let transmitted = encoder::send_command(
                self.transport.as_ref(),
                encoder::chat_message(&self.conversation_id, &correlation_id, content),
            );
            if !transmitted {
                state.log.fail_pending(&message_id);
            }
            transmitted
        };

        self.notify_log_updated();
        if transmitted {
            self.schedule_ack_timeout(message_id.clone());
        } else {
            warn!(
                conversation_id = %self.conversation_id,
                message_id = %message_id,
                "session: send refused by transport"
            );
            self.notify_failed(message_id.clone());
        }

        Ok(SendReceipt {
            message_id,
            transmitted,
        })
    }

    /// Moves a still-pending entry to Failed. Used by the ack timeout.
    pub fn expire_pending(&self, message_id: &MessageId) -> bool {
        let expired = self.state.lock().log.fail_pending(message_id);
        if expired {
            warn!(
                conversation_id = %self.conversation_id,
                message_id = %message_id,
                "session: no acknowledgment before timeout"
            );
            self.notify_failed(message_id.clone());
            self.notify_log_updated();
        }
        expired
    }

    /// Fetches the next older page following the stored cursor, if any.
    pub async fn load_older_history(&self) -> Result<MergeStats, HistoryError> {
        let request = {
            let state = self.state.lock();
            state.older_pages.as_ref().and_then(PageRequest::after)
        };
        let Some(request) = request else {
            return Ok(MergeStats::default());
        };

        let page = self
            .history
            .fetch_page(&self.conversation_id, &request)
            .await?;
        let stats = {
            let mut state = self.state.lock();
            state.older_pages = Some(page.meta);
            state.log.merge_history(page.messages)
        };
        self.notify_log_updated();
        Ok(stats)
    }

    pub fn handle_push(&self, body: &Value) -> anyhow::Result<()> {
        let Some(wire) = self.decode_for_self(body)? else {
            return Ok(());
        };
        let message_id = wire.id.clone();
        let outcome = self.state.lock().log.insert_push(wire);
        match outcome {
            PushOutcome::Duplicate => {
                debug!(conversation_id = %self.conversation_id, %message_id, "session: duplicate push ignored");
            }
            PushOutcome::Inserted { .. } | PushOutcome::Reconciled { .. } => {
                self.notify_log_updated();
            }
        }
        Ok(())
    }

    pub fn handle_ack(&self, body: &Value) -> anyhow::Result<()> {
        let Some(wire) = self.decode_for_self(body)? else {
            return Ok(());
        };
        let outcome = self.state.lock().log.reconcile_ack(&wire);
        match outcome {
            AckOutcome::Reconciled { .. } => self.notify_log_updated(),
            AckOutcome::Unmatched => debug!(
                conversation_id = %self.conversation_id,
                message_id = %wire.id,
                client_id = wire.client_id.as_deref().unwrap_or_default(),
                "session: ack without pending entry dropped"
            ),
        }
        Ok(())
    }

    fn decode_for_self(&self, body: &Value) -> anyhow::Result<Option<WireMessage>> {
        let wire: WireMessage =
            serde_json::from_value(body.clone()).context("malformed message payload")?;
        if wire.conversation_id != self.conversation_id {
            return Ok(None);
        }
        Ok(Some(wire))
    }

    fn subscribe(self: &Arc<Self>) -> Vec<(&'static str, Handler)> {
        let on_push = {
            let session = Arc::downgrade(self);
            handler(move |body| match session.upgrade() {
                Some(session) => session.handle_push(body),
                None => Ok(()),
            })
        };
        let on_ack = {
            let session = Arc::downgrade(self);
            handler(move |body| match session.upgrade() {
                Some(session) => session.handle_ack(body),
                None => Ok(()),
            })
        };
        let on_connect = {
            let session = Arc::downgrade(self);
            handler(move |_| {
                if let Some(session) = session.upgrade() {
                    session.try_complete_join();
                }
                Ok(())
            })
        };
        let on_disconnect = {
            let session: Weak<Self> = Arc::downgrade(self);
            handler(move |_| {
                if let Some(session) = session.upgrade() {
                    session.suspend();
                }
                Ok(())
            })
        };

        let subscriptions = vec![
            (EVENT_MESSAGE_NEW, on_push),
            (EVENT_MESSAGE_ACK, on_ack),
            (SIGNAL_CONNECT, on_connect),
            (SIGNAL_DISCONNECT, on_disconnect),
        ];
        for (event, subscription) in &subscriptions {
            self.dispatcher.on(event, Arc::clone(subscription));
        }
        subscriptions
    }

    /// Joining → Joined once the join command is on the wire.
    fn try_complete_join(self: &Arc<Self>) {
        let generation = {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Joining {
                return;
            }
            if self.transport.state() != ConnectionState::Connected {
                debug!(conversation_id = %self.conversation_id, "session: join deferred until connected");
                return;
            }
            if !encoder::send_command(self.transport.as_ref(), encoder::join(&self.conversation_id)) {
                return;
            }
            state.phase = SessionPhase::Joined;
            state.join_generation += 1;
            state.join_generation
        };

        info!(conversation_id = %self.conversation_id, generation, "session: joined");
        let _ = self.events.send(ClientEvent::Joined {
            conversation_id: self.conversation_id.clone(),
        });
        self.spawn_history_load(generation);
    }

    /// Joined → Joining after the transport dropped; the next connect
    /// re-issues the join.
    fn suspend(&self) {
        let mut state = self.state.lock();
        if state.phase == SessionPhase::Joined {
            state.phase = SessionPhase::Joining;
            info!(conversation_id = %self.conversation_id, "session: waiting to re-join");
        }
    }

    fn spawn_history_load(self: &Arc<Self>, generation: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = session
                .history
                .fetch_page(&session.conversation_id, &PageRequest::latest())
                .await;
            match result {
                Ok(page) => {
                    let stats = {
                        let mut state = session.state.lock();
                        if state.older_pages.is_none() {
                            state.older_pages = Some(page.meta);
                        }
                        state.log.merge_history(page.messages)
                    };
                    debug!(
                        conversation_id = %session.conversation_id,
                        generation,
                        inserted = stats.inserted,
                        reconciled = stats.reconciled,
                        duplicates = stats.duplicates,
                        "session: history merged"
                    );
                    let _ = session.events.send(ClientEvent::HistoryLoaded {
                        conversation_id: session.conversation_id.clone(),
                        stats,
                    });
                    session.notify_log_updated();
                }
                Err(err) => {
                    warn!(conversation_id = %session.conversation_id, error = %err, "session: history fetch failed");
                    let _ = session.events.send(ClientEvent::Error(format!(
                        "failed to load history for conversation {}: {err}",
                        session.conversation_id
                    )));
                }
            }
        });
    }

    fn schedule_ack_timeout(self: &Arc<Self>, message_id: MessageId) {
        let Some(timeout) = self.ack_timeout else {
            return;
        };
        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = session.upgrade() {
                session.expire_pending(&message_id);
            }
        });
    }

    fn notify_log_updated(&self) {
        let _ = self.events.send(ClientEvent::LogUpdated {
            conversation_id: self.conversation_id.clone(),
        });
    }

    fn notify_failed(&self, message_id: MessageId) {
        let _ = self.events.send(ClientEvent::MessageFailed {
            conversation_id: self.conversation_id.clone(),
            message_id,
        });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
