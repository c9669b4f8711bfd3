use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::message::{Message, MessageState};
use crate::{ChatId, DEFAULT_RECEIPT_BUFFER, Id, LocalId, UserId};

/// Address of a message from outside the timeline: receipts name either the
/// server id or the client's local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageRef {
    Server(Id),
    Local(LocalId),
}

impl MessageRef {
    pub fn primary(message: &Message) -> Self {
        match &message.id {
            Some(id) => MessageRef::Server(id.clone()),
            None => MessageRef::Local(message.local_id.clone()),
        }
    }

    pub fn all(message: &Message) -> Vec<Self> {
        let mut refs = vec![MessageRef::Local(message.local_id.clone())];
        if let Some(id) = &message.id {
            refs.push(MessageRef::Server(id.clone()));
        }
        refs
    }
}

/// Receipts waiting for the message they name. Holds at most `limit`
/// entries; the oldest is dropped to make room.
#[derive(Debug, Clone)]
pub struct ReceiptBuffer {
    held: VecDeque<(MessageRef, MessageState)>,
    limit: usize,
    dropped: u64,
}

impl ReceiptBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            held: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    /// Holds a receipt, returning the one evicted to make room, if any.
    pub fn hold(
        &mut self,
        target: MessageRef,
        state: MessageState,
    ) -> Option<(MessageRef, MessageState)> {
        if self.limit == 0 {
            self.dropped += 1;
            return Some((target, state));
        }
        let evicted = if self.held.len() >= self.limit {
            self.dropped += 1;
            self.held.pop_front()
        } else {
            None
        };
        self.held.push_back((target, state));
        evicted
    }

    /// Removes and returns every held state naming one of `refs`, oldest first.
    pub fn take(&mut self, refs: &[MessageRef]) -> Vec<MessageState> {
        let mut taken = Vec::new();
        self.held.retain(|(reference, state)| {
            if refs.contains(reference) {
                taken.push(*state);
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Receipts evicted over the buffer's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineDiff {
    Inserted(Message),
    Updated(Message),
    /// A duplicate entry was folded into another one.
    Removed { local_id: LocalId, id: Option<Id> },
}

impl TimelineDiff {
    pub fn message(&self) -> Option<&Message> {
        match self {
            TimelineDiff::Inserted(message) | TimelineDiff::Updated(message) => Some(message),
            TimelineDiff::Removed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Tiebreak {
    Server(Id),
    Local(LocalId),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    created_at: i64,
    tiebreak: Tiebreak,
}

impl SortKey {
    fn of(message: &Message) -> Self {
        let tiebreak = match &message.id {
            Some(id) => Tiebreak::Server(id.clone()),
            None => Tiebreak::Local(message.local_id.clone()),
        };
        Self {
            created_at: message.created_at,
            tiebreak,
        }
    }
}

/// Ordered, de-duplicated view of one chat.
///
/// Entries are keyed by `(created_at, server id or local id)`, which keeps the
/// order total and stable. Each message is reachable by its local id and, once
/// known, by its server id; the two indexes never point at different entries.
#[derive(Debug, Clone)]
pub struct ChatTimeline {
    chat_id: ChatId,
    entries: BTreeMap<SortKey, Message>,
    by_local: HashMap<LocalId, SortKey>,
    by_server: HashMap<Id, LocalId>,
    pending_receipts: ReceiptBuffer,
    oldest_loaded: Option<(i64, Id)>,
    history_exhausted: bool,
    unread: usize,
}

impl ChatTimeline {
    pub fn new(chat_id: ChatId) -> Self {
        Self::with_receipt_limit(chat_id, DEFAULT_RECEIPT_BUFFER)
    }

    pub fn with_receipt_limit(chat_id: ChatId, receipt_limit: usize) -> Self {
        Self {
            chat_id,
            entries: BTreeMap::new(),
            by_local: HashMap::new(),
            by_server: HashMap::new(),
            pending_receipts: ReceiptBuffer::new(receipt_limit),
            oldest_loaded: None,
            history_exhausted: false,
            unread: 0,
        }
    }

    pub fn chat_id(&self) -> &ChatId {
        &self.chat_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.values()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, reference: &MessageRef) -> Option<&Message> {
        let local_id = self.resolve(reference)?;
        self.by_local
            .get(&local_id)
            .and_then(|key| self.entries.get(key))
    }

    fn resolve(&self, reference: &MessageRef) -> Option<LocalId> {
        match reference {
            MessageRef::Server(id) => self.by_server.get(id).cloned(),
            MessageRef::Local(local_id) => self
                .by_local
                .contains_key(local_id)
                .then(|| local_id.clone()),
        }
    }

    /// Folds `incoming` into the timeline and reports what changed. Merging a
    /// message already present with the same content yields no diffs.
    pub fn merge(&mut self, incoming: Message) -> Vec<TimelineDiff> {
        let by_server = incoming
            .id
            .as_ref()
            .and_then(|id| self.by_server.get(id).cloned());
        let by_local = self
            .by_local
            .contains_key(&incoming.local_id)
            .then(|| incoming.local_id.clone());

        match (by_server, by_local) {
            (None, None) => vec![self.insert(incoming)],
            (Some(target), None) | (None, Some(target)) => {
                self.update(&target, incoming).into_iter().collect()
            }
            (Some(found), Some(own)) if found == own => {
                self.update(&own, incoming).into_iter().collect()
            }
            (Some(found), Some(own)) => {
                // The server id is already held by another entry (a push that
                // raced the confirmation). Fold it into the entry owning the
                // local id.
                let mut diffs = Vec::new();
                let mut incoming = incoming;
                if let Some(absorbed) = self.detach(&found) {
                    incoming.state = incoming.state.merge(absorbed.state);
                    diffs.push(TimelineDiff::Removed {
                        local_id: absorbed.local_id,
                        id: absorbed.id,
                    });
                }
                diffs.extend(self.update(&own, incoming));
                diffs
            }
        }
    }

    /// Applies a receipt, or holds it until the message it names shows up.
    pub fn apply_receipt(
        &mut self,
        target: MessageRef,
        state: MessageState,
    ) -> Option<TimelineDiff> {
        match self.resolve(&target) {
            Some(local_id) => self.transition(&local_id, state),
            None => {
                self.pending_receipts.hold(target, state);
                None
            }
        }
    }

    pub fn transition(&mut self, local_id: &LocalId, state: MessageState) -> Option<TimelineDiff> {
        let key = self.by_local.get(local_id)?;
        let message = self.entries.get_mut(key)?;
        message.state = message.state.advance(state)?;
        Some(TimelineDiff::Updated(message.clone()))
    }

    pub fn pending_receipts(&self) -> usize {
        self.pending_receipts.len()
    }

    /// Receipts dropped because the pending buffer was full.
    pub fn dropped_receipts(&self) -> u64 {
        self.pending_receipts.dropped()
    }

    /// Records a fetched page: advances the pagination cursor and marks the
    /// history exhausted once the server returns less than a full page.
    pub fn record_page(&mut self, page: &[Message], limit: usize) {
        if page.len() < limit {
            self.history_exhausted = true;
        }
        let oldest = page
            .iter()
            .filter_map(|message| message.id.as_ref().map(|id| (message.created_at, id)))
            .min();
        if let Some((created_at, id)) = oldest {
            let is_older = self
                .oldest_loaded
                .as_ref()
                .is_none_or(|(at, current)| (created_at, id) < (*at, current));
            if is_older {
                self.oldest_loaded = Some((created_at, id.clone()));
            }
        }
    }

    pub fn cursor(&self) -> Option<&Id> {
        self.oldest_loaded.as_ref().map(|(_, id)| id)
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn unread(&self) -> usize {
        self.unread
    }

    pub fn bump_unread(&mut self) {
        self.unread += 1;
    }

    pub fn set_unread(&mut self, unread: usize) {
        self.unread = unread;
    }

    pub fn clear_unread(&mut self) {
        self.unread = 0;
    }

    /// Newest persisted message written by someone other than `self_id`.
    pub fn latest_incoming(&self, self_id: &UserId) -> Option<&Message> {
        self.entries
            .values()
            .rev()
            .find(|message| &message.sender_id != self_id && message.id.is_some())
    }

    fn insert(&mut self, mut message: Message) -> TimelineDiff {
        for state in self.take_pending(&message) {
            message.state = message.state.merge(state);
        }
        self.attach(message.clone());
        TimelineDiff::Inserted(message)
    }

    fn update(&mut self, local_id: &LocalId, incoming: Message) -> Option<TimelineDiff> {
        let mut message = self.detach(local_id)?;
        let before = message.clone();

        if message.id.is_none() {
            message.id = incoming.id.clone();
        }
        let authoritative = incoming.id.is_some() && incoming.id == message.id;
        if authoritative {
            message.created_at = incoming.created_at;
            message.kind = incoming.kind;
            message.reply_to_id = incoming.reply_to_id;
        }
        if incoming.content != message.content && (authoritative || incoming.edited) {
            message.content = incoming.content;
        }
        message.edited |= incoming.edited;
        message.state = message.state.merge(incoming.state);
        for state in self.take_pending(&message) {
            message.state = message.state.merge(state);
        }

        self.attach(message.clone());
        (message != before).then_some(TimelineDiff::Updated(message))
    }

    fn take_pending(&mut self, message: &Message) -> Vec<MessageState> {
        self.pending_receipts.take(&MessageRef::all(message))
    }

    fn attach(&mut self, message: Message) {
        let key = SortKey::of(&message);
        self.by_local.insert(message.local_id.clone(), key.clone());
        if let Some(id) = &message.id {
            self.by_server.insert(id.clone(), message.local_id.clone());
        }
        self.entries.insert(key, message);
    }

    fn detach(&mut self, local_id: &LocalId) -> Option<Message> {
        let key = self.by_local.remove(local_id)?;
        let message = self.entries.remove(&key)?;
        if let Some(id) = &message.id {
            if self.by_server.get(id) == Some(local_id) {
                self.by_server.remove(id);
            }
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;

    fn server_message(id: u64, created_at: i64) -> Message {
        Message {
            id: Some(Id::Num(id)),
            local_id: LocalId::for_server_id(&Id::Num(id)),
            chat_id: Id::Num(42),
            sender_id: Id::Num(2),
            content: format!("message {id}"),
            kind: MessageKind::Text,
            created_at,
            state: MessageState::Sent,
            reply_to_id: None,
            edited: false,
        }
    }

    fn draft(local: &str, created_at: i64) -> Message {
        Message {
            id: None,
            local_id: LocalId::from(local),
            chat_id: Id::Num(42),
            sender_id: Id::Num(1),
            content: "hi".to_owned(),
            kind: MessageKind::Text,
            created_at,
            state: MessageState::Sending,
            reply_to_id: None,
            edited: false,
        }
    }

    fn ids(timeline: &ChatTimeline) -> Vec<Option<Id>> {
        timeline.messages().map(|m| m.id.clone()).collect()
    }

    #[test]
    fn page_and_push_overlap_once() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(server_message(2, 200));
        for message in [server_message(1, 100), server_message(2, 200)] {
            timeline.merge(message);
        }
        assert_eq!(ids(&timeline), vec![Some(Id::Num(1)), Some(Id::Num(2))]);
    }

    #[test]
    fn merge_order_does_not_matter() {
        let batch = [server_message(3, 300), server_message(1, 100), server_message(2, 200)];
        let mut forward = ChatTimeline::new(Id::Num(42));
        let mut backward = ChatTimeline::new(Id::Num(42));
        for message in batch.iter().cloned() {
            forward.merge(message);
        }
        for message in batch.iter().rev().cloned() {
            backward.merge(message);
        }
        assert_eq!(forward.snapshot(), backward.snapshot());
    }

    #[test]
    fn remerge_is_silent() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        assert_eq!(timeline.merge(server_message(1, 100)).len(), 1);
        assert!(timeline.merge(server_message(1, 100)).is_empty());
    }

    #[test]
    fn confirmation_adopts_server_identity() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(draft("L1", 500));
        let mut confirmed = draft("L1", 480);
        confirmed.id = Some(Id::Num(77));
        confirmed.state = MessageState::Sent;

        let diffs = timeline.merge(confirmed);
        let [TimelineDiff::Updated(message)] = diffs.as_slice() else {
            panic!("expected one update, got {diffs:?}");
        };
        assert_eq!(message.id, Some(Id::Num(77)));
        assert_eq!(message.created_at, 480);
        assert_eq!(message.state, MessageState::Sent);
        assert_eq!(timeline.len(), 1);
        assert!(timeline.get(&MessageRef::Server(Id::Num(77))).is_some());
    }

    #[test]
    fn racing_push_is_folded_into_the_draft() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(draft("L1", 500));
        let mut echo = server_message(77, 480);
        echo.sender_id = Id::Num(1);
        timeline.merge(echo);
        timeline.apply_receipt(MessageRef::Server(Id::Num(77)), MessageState::Delivered);
        assert_eq!(timeline.len(), 2);

        let mut confirmed = draft("L1", 480);
        confirmed.id = Some(Id::Num(77));
        confirmed.state = MessageState::Sent;
        let diffs = timeline.merge(confirmed);

        assert!(matches!(diffs.first(), Some(TimelineDiff::Removed { id: Some(Id::Num(77)), .. })));
        assert_eq!(timeline.len(), 1);
        let survivor = timeline.get(&MessageRef::Server(Id::Num(77))).unwrap();
        assert_eq!(survivor.local_id, LocalId::from("L1"));
        assert_eq!(survivor.state, MessageState::Delivered);
    }

    #[test]
    fn early_receipts_apply_on_arrival() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        assert!(timeline.apply_receipt(MessageRef::Server(Id::Num(9)), MessageState::Read).is_none());
        assert!(timeline.apply_receipt(MessageRef::Server(Id::Num(9)), MessageState::Delivered).is_none());
        assert_eq!(timeline.pending_receipts(), 2);

        let diffs = timeline.merge(server_message(9, 900));
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].message().unwrap().state, MessageState::Read);
        assert_eq!(timeline.pending_receipts(), 0);
    }

    #[test]
    fn pending_receipts_are_capped_oldest_first() {
        let mut timeline = ChatTimeline::with_receipt_limit(Id::Num(42), 3);
        for id in 1..=5 {
            timeline.apply_receipt(MessageRef::Server(Id::Num(id)), MessageState::Read);
        }
        assert_eq!(timeline.pending_receipts(), 3);
        assert_eq!(timeline.dropped_receipts(), 2);

        let diffs = timeline.merge(server_message(1, 100));
        assert_eq!(diffs[0].message().unwrap().state, MessageState::Sent);
        let diffs = timeline.merge(server_message(5, 500));
        assert_eq!(diffs[0].message().unwrap().state, MessageState::Read);
        assert_eq!(timeline.pending_receipts(), 2);
    }

    #[test]
    fn zero_sized_buffer_holds_nothing() {
        let mut buffer = ReceiptBuffer::new(0);
        let evicted = buffer.hold(MessageRef::Server(Id::Num(1)), MessageState::Read);
        assert_eq!(evicted, Some((MessageRef::Server(Id::Num(1)), MessageState::Read)));
        assert!(buffer.is_empty());
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn receipts_never_regress() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(server_message(5, 50));
        assert!(timeline.apply_receipt(MessageRef::Server(Id::Num(5)), MessageState::Read).is_some());
        assert!(timeline.apply_receipt(MessageRef::Server(Id::Num(5)), MessageState::Delivered).is_none());
        let mut stale = server_message(5, 50);
        stale.state = MessageState::Sent;
        assert!(timeline.merge(stale).is_empty());
        assert_eq!(
            timeline.get(&MessageRef::Server(Id::Num(5))).unwrap().state,
            MessageState::Read
        );
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(server_message(8, 100));
        timeline.merge(server_message(3, 100));
        timeline.merge(draft("L0", 100));
        assert_eq!(
            ids(&timeline),
            vec![Some(Id::Num(3)), Some(Id::Num(8)), None]
        );
    }

    #[test]
    fn failed_draft_can_be_retried_in_place() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(draft("L1", 10));
        timeline.transition(&LocalId::from("L1"), MessageState::Failed);
        let diffs = timeline.merge(draft("L1", 20));
        assert_eq!(diffs.len(), 1);
        let message = timeline.get(&MessageRef::Local(LocalId::from("L1"))).unwrap();
        assert_eq!(message.state, MessageState::Sending);
        assert_eq!(message.created_at, 10);
    }

    #[test]
    fn short_page_exhausts_history() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        let page = vec![server_message(30, 300), server_message(20, 200)];
        timeline.record_page(&page, 2);
        assert_eq!(timeline.cursor(), Some(&Id::Num(20)));
        assert!(!timeline.history_exhausted());

        timeline.record_page(&[server_message(10, 100)], 2);
        assert_eq!(timeline.cursor(), Some(&Id::Num(10)));
        assert!(timeline.history_exhausted());
    }

    #[test]
    fn latest_incoming_skips_own_and_unsent() {
        let mut timeline = ChatTimeline::new(Id::Num(42));
        timeline.merge(server_message(1, 100));
        let mut own = server_message(2, 200);
        own.sender_id = Id::Num(1);
        timeline.merge(own);
        timeline.merge(draft("L9", 300));
        let latest = timeline.latest_incoming(&Id::Num(1)).unwrap();
        assert_eq!(latest.id, Some(Id::Num(1)));
    }
}
