use std::sync::Arc;

use chatlink_core::{
    ChatId, Envelope, EnvelopeKind, Id, LocalId, Message, MessageKind, TimelineDiff, UserId,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::bus::{EventBus, Subscription};
use crate::config::SessionConfig;
use crate::connection::{ConnectionHandle, ConnectionState, Credentials, LinkEvent, LinkStats};
use crate::presence::{PresenceDiff, PresenceTracker};
use crate::rest::{ChatSummary, RestApi};
use crate::store::{TimelineError, TimelineStore};
use crate::transport::Connector;

/// One authenticated realtime session: the connection manager, the timeline
/// store and the presence tracker, wired through a single dispatcher so
/// inbound envelopes are applied in transport order.
pub struct Session {
    credentials: Credentials,
    connection: ConnectionHandle,
    timeline: TimelineStore,
    presence: PresenceTracker,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn start<C, R>(config: &SessionConfig, credentials: Credentials, connector: C, rest: R) -> Self
    where
        C: Connector,
        R: RestApi,
    {
        let events = EventBus::new();
        let inbound = events.subscribe();
        let (connection, link_task) =
            ConnectionHandle::spawn(connector, config.link_settings(), events);
        let timeline = TimelineStore::new(
            Arc::new(rest),
            Arc::new(connection.clone()),
            credentials.user_id.clone(),
            config.store_settings(),
        );
        let presence = PresenceTracker::new(config.presence_settings());
        let dispatcher = tokio::spawn(dispatch(inbound, timeline.clone(), presence.clone()));
        let sweeper = presence.spawn_sweeper(config.sweep_interval());

        Self {
            credentials,
            connection,
            timeline,
            presence,
            tasks: vec![link_task, dispatcher, sweeper],
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.credentials.user_id
    }

    pub fn connect(&self) {
        self.connection.connect(self.credentials.clone());
    }

    pub fn close(&self) {
        self.connection.close();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn stats(&self) -> Option<LinkStats> {
        self.connection.stats().await
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub fn timeline(&self) -> &TimelineStore {
        &self.timeline
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn subscribe_timeline(&self, chat_id: &ChatId) -> Subscription<TimelineDiff> {
        self.timeline.subscribe(chat_id)
    }

    pub fn subscribe_presence(&self) -> Subscription<PresenceDiff> {
        self.presence.subscribe()
    }

    pub fn subscribe_connection_state(&self) -> impl Stream<Item = ConnectionState> + Send + Unpin + use<> {
        self.connection
            .subscribe()
            .filter_map(|event| match event {
                LinkEvent::State(state) => Some(state),
                _ => None,
            })
    }

    /// Raw link events, including call and contact envelopes the store and
    /// tracker do not consume.
    pub fn subscribe_link(&self) -> Subscription<LinkEvent> {
        self.connection.subscribe()
    }

    pub async fn open_chat(&self, chat_id: &ChatId) -> Result<Vec<Message>, TimelineError> {
        self.timeline.load_page(chat_id, None).await
    }

    pub async fn load_older(&self, chat_id: &ChatId) -> Result<Vec<Message>, TimelineError> {
        self.timeline.load_older(chat_id).await
    }

    pub fn close_chat(&self, chat_id: &ChatId) {
        self.timeline.close_chat(chat_id);
    }

    pub async fn submit_message(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
    ) -> Result<Message, TimelineError> {
        self.timeline
            .submit_outbound(chat_id, content, MessageKind::Text, None)
            .await
    }

    pub async fn submit_reply(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
        kind: MessageKind,
        reply_to_id: Option<Id>,
    ) -> Result<Message, TimelineError> {
        self.timeline
            .submit_outbound(chat_id, content, kind, reply_to_id)
            .await
    }

    pub async fn retry_message(
        &self,
        chat_id: &ChatId,
        local_id: &LocalId,
    ) -> Result<Message, TimelineError> {
        self.timeline.retry(chat_id, local_id).await
    }

    pub fn mark_read(&self, chat_id: &ChatId) -> Option<Id> {
        self.timeline.mark_read(chat_id)
    }

    pub async fn refresh_chats(&self) -> Result<Vec<ChatSummary>, TimelineError> {
        self.timeline.refresh_chats().await
    }

    pub fn notify_typing(&self, chat_id: &ChatId, is_typing: bool) {
        self.connection
            .send(Envelope::typing(chat_id.clone(), is_typing));
    }

    pub fn send_call_offer(&self, target: UserId, call_type: Option<String>, offer: Value) {
        self.connection
            .send(Envelope::call_offer(target, call_type, offer));
    }

    pub fn send_call_answer(&self, target: UserId, answer: Value) {
        self.connection.send(Envelope::call_answer(target, answer));
    }

    pub fn send_call_reject(&self, target: UserId) {
        self.connection.send(Envelope::call_reject(target));
    }

    pub fn send_call_end(&self, target: UserId) {
        self.connection.send(Envelope::call_end(target));
    }

    /// Closes the link, waits for the connection task to process the close,
    /// then stops every background task.
    pub async fn shutdown(self) {
        self.connection.close();
        let _ = self.connection.stats().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn dispatch(
    mut events: Subscription<LinkEvent>,
    timeline: TimelineStore,
    presence: PresenceTracker,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Inbound(envelope) => match envelope.kind() {
                EnvelopeKind::ChatMessage | EnvelopeKind::MessageRead => {
                    timeline.apply_envelope(&envelope);
                }
                EnvelopeKind::TypingIndicator | EnvelopeKind::Presence => {
                    presence.apply_envelope(&envelope);
                }
                EnvelopeKind::CallOffer
                | EnvelopeKind::CallAnswer
                | EnvelopeKind::CallReject
                | EnvelopeKind::CallEnd
                | EnvelopeKind::UserJoined
                | EnvelopeKind::UserLeft
                | EnvelopeKind::ContactAdded => {
                    debug!(kind = ?envelope.kind(), "envelope left to link subscribers");
                }
            },
            LinkEvent::QueueOverflow(envelope) | LinkEvent::Undeliverable(envelope) => {
                timeline.mark_undelivered(&envelope);
            }
            LinkEvent::State(_) | LinkEvent::ReconnectExhausted { .. } => {}
        }
    }
}
