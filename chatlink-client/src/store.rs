use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatlink_core::{
    ChatId, ChatTimeline, DEFAULT_RECEIPT_BUFFER, Envelope, Id, LocalId, Message, MessageKind,
    MessageRef, MessageState, OutgoingMessage, Payload, ReadReceipt, ReceiptBuffer, TimelineDiff,
    UserId, now_unix_ms,
};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::{EventBus, Subscription};
use crate::connection::Outbox;
use crate::rest::{ChatSummary, RestApi, RestError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimelineError {
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error("page load cancelled because the chat was closed")]
    Cancelled,
    #[error("no message with local id {0} in this chat")]
    UnknownMessage(LocalId),
    #[error("message is {state:?}; only failed messages can be retried")]
    NotRetryable { state: MessageState },
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub page_size: usize,
    pub rest_timeout: Duration,
    /// Receipts held per buffer while the message they name is unknown.
    pub receipt_buffer_limit: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            rest_timeout: Duration::from_secs(10),
            receipt_buffer_limit: DEFAULT_RECEIPT_BUFFER,
        }
    }
}

type PageKey = (ChatId, Option<Id>);
type PageRequest = Shared<BoxFuture<'static, Result<Vec<Message>, RestError>>>;

struct ChatSlot {
    timeline: Mutex<ChatTimeline>,
    diffs: EventBus<TimelineDiff>,
    generation: AtomicU64,
}

impl ChatSlot {
    fn new(chat_id: ChatId, receipt_limit: usize) -> Self {
        Self {
            timeline: Mutex::new(ChatTimeline::with_receipt_limit(chat_id, receipt_limit)),
            diffs: EventBus::new(),
            generation: AtomicU64::new(0),
        }
    }
}

/// Where each known message lives, plus receipts that arrived without a chat
/// id for a message not seen yet.
struct Registry {
    located: HashMap<MessageRef, ChatId>,
    orphans: ReceiptBuffer,
}

struct StoreInner {
    rest: Arc<dyn RestApi>,
    outbox: Arc<dyn Outbox>,
    self_id: UserId,
    settings: StoreSettings,
    chats: Mutex<HashMap<ChatId, Arc<ChatSlot>>>,
    registry: Mutex<Registry>,
    inflight: Mutex<HashMap<PageKey, PageRequest>>,
}

/// Per-chat timelines fed by REST pages, realtime pushes and local sends.
///
/// Every mutation of a chat happens under that chat's lock and its diffs are
/// published before the lock is released, so subscribers see changes in the
/// order they were applied.
#[derive(Clone)]
pub struct TimelineStore {
    inner: Arc<StoreInner>,
}

impl TimelineStore {
    pub fn new(
        rest: Arc<dyn RestApi>,
        outbox: Arc<dyn Outbox>,
        self_id: UserId,
        settings: StoreSettings,
    ) -> Self {
        let registry = Registry {
            located: HashMap::new(),
            orphans: ReceiptBuffer::new(settings.receipt_buffer_limit),
        };
        Self {
            inner: Arc::new(StoreInner {
                rest,
                outbox,
                self_id,
                settings,
                chats: Mutex::new(HashMap::new()),
                registry: Mutex::new(registry),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self, chat_id: &ChatId) -> Subscription<TimelineDiff> {
        self.slot(chat_id).diffs.subscribe()
    }

    pub fn snapshot(&self, chat_id: &ChatId) -> Vec<Message> {
        lock(&self.slot(chat_id).timeline).snapshot()
    }

    pub fn message(&self, chat_id: &ChatId, reference: &MessageRef) -> Option<Message> {
        lock(&self.slot(chat_id).timeline).get(reference).cloned()
    }

    pub fn unread_count(&self, chat_id: &ChatId) -> usize {
        lock(&self.slot(chat_id).timeline).unread()
    }

    /// Fetches one page older than `before` (or the newest page) and merges
    /// it. Concurrent calls for the same page share one request.
    pub async fn load_page(
        &self,
        chat_id: &ChatId,
        before: Option<Id>,
    ) -> Result<Vec<Message>, TimelineError> {
        let slot = self.slot(chat_id);
        let generation = slot.generation.load(Ordering::Acquire);
        let key = (chat_id.clone(), before);
        let request = self.page_request(&key);

        let outcome = request.clone().await;
        {
            let mut inflight = lock(&self.inner.inflight);
            if inflight
                .get(&key)
                .is_some_and(|current| current.ptr_eq(&request))
            {
                inflight.remove(&key);
            }
        }
        let page = outcome?;

        if slot.generation.load(Ordering::Acquire) != generation {
            debug!(chat_id = %chat_id, "discarding page for closed chat");
            return Err(TimelineError::Cancelled);
        }

        let limit = self.inner.settings.page_size;
        let refs = self.mutate(chat_id, |timeline| {
            timeline.record_page(&page, limit);
            let mut diffs = Vec::new();
            let mut refs = Vec::with_capacity(page.len());
            for message in page {
                refs.push(MessageRef::primary(&message));
                diffs.extend(timeline.merge(message));
            }
            (diffs, refs)
        });
        Ok(self.resolve_all(chat_id, &refs))
    }

    /// Next page behind the oldest loaded message; empty once the server has
    /// nothing older.
    pub async fn load_older(&self, chat_id: &ChatId) -> Result<Vec<Message>, TimelineError> {
        let cursor = {
            let slot = self.slot(chat_id);
            let timeline = lock(&slot.timeline);
            if timeline.history_exhausted() {
                return Ok(Vec::new());
            }
            timeline.cursor().cloned()
        };
        self.load_page(chat_id, cursor).await
    }

    /// Inserts an optimistic entry, relays it to connected peers and persists
    /// it over REST. The returned message is the confirmed entry.
    pub async fn submit_outbound(
        &self,
        chat_id: ChatId,
        content: impl Into<String>,
        kind: MessageKind,
        reply_to_id: Option<Id>,
    ) -> Result<Message, TimelineError> {
        let draft = OutgoingMessage {
            chat_id,
            local_id: LocalId::generate(),
            content: content.into(),
            kind,
            reply_to_id,
        };
        self.deliver(draft).await
    }

    /// Sends a failed message again under the local id it was first sent with.
    pub async fn retry(&self, chat_id: &ChatId, local_id: &LocalId) -> Result<Message, TimelineError> {
        let message = self
            .message(chat_id, &MessageRef::Local(local_id.clone()))
            .ok_or_else(|| TimelineError::UnknownMessage(local_id.clone()))?;
        if message.state != MessageState::Failed {
            return Err(TimelineError::NotRetryable {
                state: message.state,
            });
        }
        self.deliver(OutgoingMessage::from(&message)).await
    }

    async fn deliver(&self, draft: OutgoingMessage) -> Result<Message, TimelineError> {
        let chat_id = draft.chat_id.clone();
        let pending = Message::pending(&draft, self.inner.self_id.clone(), now_unix_ms());
        self.merge_into(&chat_id, vec![pending], false);
        self.inner.outbox.send(Envelope::chat(&draft));

        let posted = self.inner.rest.post_message(&draft);
        match with_timeout(self.inner.settings.rest_timeout, posted).await {
            Ok(mut confirmed) => {
                confirmed.local_id = draft.local_id.clone();
                confirmed.chat_id = chat_id.clone();
                let merged = self.merge_into(&chat_id, vec![confirmed], false);
                merged
                    .into_iter()
                    .next()
                    .ok_or(TimelineError::UnknownMessage(draft.local_id))
            }
            Err(err) => {
                warn!(
                    chat_id = %chat_id,
                    local_id = %draft.local_id,
                    retryable = err.is_retryable(),
                    "message persistence failed: {err}"
                );
                self.mutate(&chat_id, |timeline| {
                    let diffs = timeline
                        .transition(&draft.local_id, MessageState::Failed)
                        .into_iter()
                        .collect();
                    (diffs, ())
                });
                Err(TimelineError::Rest(err))
            }
        }
    }

    /// Routes a realtime envelope into the right chat. Envelopes that do not
    /// concern timelines are ignored.
    pub fn apply_envelope(&self, envelope: &Envelope) {
        match &envelope.payload {
            Payload::NewMessage(record) => {
                let message = Message::from(record.clone());
                let chat_id = message.chat_id.clone();
                self.merge_into(&chat_id, vec![message], true);
            }
            Payload::Chat(frame) => {
                let Some(sender_id) = envelope.origin_user_id.clone() else {
                    debug!(chat_id = %frame.chat_id, "relayed chat frame without sender");
                    return;
                };
                let message = frame.to_message(sender_id, now_unix_ms());
                self.merge_into(&frame.chat_id, vec![message], true);
            }
            Payload::MessageRead(receipt) => self.apply_receipt(receipt),
            _ => {}
        }
    }

    /// An outbound chat envelope was evicted from the queue or could not be
    /// encoded: the peers never saw it, so the draft is marked failed unless
    /// REST already confirmed it.
    pub fn mark_undelivered(&self, envelope: &Envelope) {
        let Payload::Chat(frame) = &envelope.payload else {
            return;
        };
        let Some(local_id) = &frame.local_id else {
            return;
        };
        self.mutate(&frame.chat_id, |timeline| {
            let diffs = timeline
                .transition(local_id, MessageState::Failed)
                .into_iter()
                .collect();
            (diffs, ())
        });
    }

    /// Invalidates in-flight page loads for `chat_id`; their responses are
    /// dropped instead of merged.
    pub fn close_chat(&self, chat_id: &ChatId) {
        self.slot(chat_id).generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Clears the unread counter and sends a read receipt for the newest
    /// incoming message, if there is one.
    pub fn mark_read(&self, chat_id: &ChatId) -> Option<Id> {
        let self_id = &self.inner.self_id;
        let latest = self.mutate(chat_id, |timeline| {
            timeline.clear_unread();
            let latest = timeline
                .latest_incoming(self_id)
                .and_then(|message| message.id.clone());
            (Vec::new(), latest)
        });
        if let Some(id) = &latest {
            self.inner
                .outbox
                .send(Envelope::read_receipt(id.clone(), Some(chat_id.clone())));
        }
        latest
    }

    /// Refreshes the chat list and takes the server's unread counters.
    pub async fn refresh_chats(&self) -> Result<Vec<ChatSummary>, TimelineError> {
        let chats = with_timeout(self.inner.settings.rest_timeout, self.inner.rest.fetch_chats()).await?;
        for chat in &chats {
            self.mutate(&chat.id, |timeline| {
                timeline.set_unread(chat.unread_count);
                (Vec::new(), ())
            });
        }
        Ok(chats)
    }

    fn apply_receipt(&self, receipt: &ReadReceipt) {
        let state = receipt.state();
        let Some(target) = receipt.target() else {
            debug!("receipt without message reference");
            return;
        };
        let chat_id = match &receipt.chat_id {
            Some(chat_id) => chat_id.clone(),
            None => {
                let mut registry = lock(&self.inner.registry);
                match registry.located.get(&target) {
                    Some(chat_id) => chat_id.clone(),
                    None => {
                        debug!(?target, "holding receipt for unseen message");
                        if let Some((evicted, _)) = registry.orphans.hold(target, state) {
                            debug!(?evicted, "receipt buffer full; dropped oldest receipt");
                        }
                        return;
                    }
                }
            }
        };
        self.mutate(&chat_id, |timeline| {
            let dropped = timeline.dropped_receipts();
            let diffs = timeline.apply_receipt(target, state).into_iter().collect();
            if timeline.dropped_receipts() > dropped {
                debug!(%chat_id, "receipt buffer full; dropped oldest receipt");
            }
            (diffs, ())
        });
    }

    fn merge_into(&self, chat_id: &ChatId, messages: Vec<Message>, live: bool) -> Vec<Message> {
        let self_id = &self.inner.self_id;
        let refs = self.mutate(chat_id, |timeline| {
            let mut diffs = Vec::new();
            let mut refs = Vec::with_capacity(messages.len());
            for message in messages {
                refs.push(MessageRef::primary(&message));
                let from_peer = &message.sender_id != self_id;
                let produced = timeline.merge(message);
                let inserted = produced
                    .iter()
                    .any(|diff| matches!(diff, TimelineDiff::Inserted(_)));
                if live && from_peer && inserted {
                    timeline.bump_unread();
                }
                diffs.extend(produced);
            }
            (diffs, refs)
        });
        self.resolve_all(chat_id, &refs)
    }

    fn resolve_all(&self, chat_id: &ChatId, refs: &[MessageRef]) -> Vec<Message> {
        let slot = self.slot(chat_id);
        let timeline = lock(&slot.timeline);
        refs.iter()
            .filter_map(|reference| timeline.get(reference).cloned())
            .collect()
    }

    fn mutate<R>(
        &self,
        chat_id: &ChatId,
        apply: impl FnOnce(&mut ChatTimeline) -> (Vec<TimelineDiff>, R),
    ) -> R {
        let slot = self.slot(chat_id);
        let mut timeline = lock(&slot.timeline);
        let (mut diffs, output) = apply(&mut timeline);
        self.index(chat_id, &mut timeline, &mut diffs);
        for diff in diffs {
            slot.diffs.publish(diff);
        }
        output
    }

    /// Records where the touched messages live and applies any orphaned
    /// receipts that name them.
    fn index(&self, chat_id: &ChatId, timeline: &mut ChatTimeline, diffs: &mut Vec<TimelineDiff>) {
        let mut registry = lock(&self.inner.registry);
        let mut next = 0;
        while next < diffs.len() {
            let refs = match &diffs[next] {
                TimelineDiff::Inserted(message) | TimelineDiff::Updated(message) => {
                    MessageRef::all(message)
                }
                TimelineDiff::Removed { local_id, .. } => {
                    registry
                        .located
                        .remove(&MessageRef::Local(local_id.clone()));
                    Vec::new()
                }
            };
            for reference in refs {
                registry.located.insert(reference.clone(), chat_id.clone());
                let matched = registry.orphans.take(std::slice::from_ref(&reference));
                for state in matched {
                    if let Some(diff) = timeline.apply_receipt(reference.clone(), state) {
                        diffs.push(diff);
                    }
                }
            }
            next += 1;
        }
    }

    fn page_request(&self, key: &PageKey) -> PageRequest {
        let mut inflight = lock(&self.inner.inflight);
        inflight
            .entry(key.clone())
            .or_insert_with(|| {
                let (chat_id, before) = key;
                let fetch =
                    self.inner
                        .rest
                        .fetch_messages(chat_id, self.inner.settings.page_size, before.as_ref());
                with_timeout(self.inner.settings.rest_timeout, fetch)
                    .boxed()
                    .shared()
            })
            .clone()
    }

    fn slot(&self, chat_id: &ChatId) -> Arc<ChatSlot> {
        let mut chats = lock(&self.inner.chats);
        Arc::clone(
            chats
                .entry(chat_id.clone())
                .or_insert_with(|| {
                    Arc::new(ChatSlot::new(
                        chat_id.clone(),
                        self.inner.settings.receipt_buffer_limit,
                    ))
                }),
        )
    }
}

async fn with_timeout<T>(
    limit: Duration,
    request: BoxFuture<'static, Result<T, RestError>>,
) -> Result<T, RestError> {
    tokio::time::timeout(limit, request)
        .await
        .unwrap_or(Err(RestError::Timeout))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
