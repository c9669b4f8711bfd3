#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatlink_client::{
    ChatSummary, Connector, Credentials, LinkEvent, RemoteEnd, RestApi, RestError, SessionConfig,
    Subscription, TransportError, TransportLink,
};
use chatlink_core::{
    ChatId, Envelope, Id, LocalId, Message, MessageKind, MessageRecord, MessageState,
    OutgoingMessage, Payload,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use url::Url;

pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting for the session")
}

pub fn credentials(user: u64) -> Credentials {
    Credentials {
        token: "secret-token".to_owned(),
        user_id: Id::Num(user),
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect_base_delay_ms: 100,
        reconnect_max_delay_ms: 1_000,
        max_reconnect_attempts: 3,
        connect_timeout_ms: 1_000,
        rest_timeout_ms: 2_000,
        page_size: 20,
        typing_ttl_ms: 5_000,
        sweep_interval_ms: 500,
        ..SessionConfig::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Step {
    Accept,
    Refuse,
}

struct ConnectorState {
    plan: Mutex<VecDeque<Step>>,
    fallback: Step,
    opened_at: Mutex<Vec<Instant>>,
    endpoints: Mutex<Vec<Url>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

/// In-memory connector: each open follows the next scripted step, and every
/// accepted link hands its remote end to the test.
#[derive(Clone)]
pub struct ScriptedConnector {
    state: Arc<ConnectorState>,
}

impl ScriptedConnector {
    pub fn new(
        plan: impl IntoIterator<Item = Step>,
        fallback: Step,
    ) -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes_tx, remotes_rx) = mpsc::unbounded_channel();
        let connector = Self {
            state: Arc::new(ConnectorState {
                plan: Mutex::new(plan.into_iter().collect()),
                fallback,
                opened_at: Mutex::new(Vec::new()),
                endpoints: Mutex::new(Vec::new()),
                remotes: remotes_tx,
            }),
        };
        (connector, remotes_rx)
    }

    pub fn opens(&self) -> usize {
        self.state.opened_at.lock().unwrap().len()
    }

    pub fn opened_at(&self) -> Vec<Instant> {
        self.state.opened_at.lock().unwrap().clone()
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.state.endpoints.lock().unwrap().clone()
    }
}

impl Connector for ScriptedConnector {
    fn open(&self, endpoint: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        self.state.opened_at.lock().unwrap().push(Instant::now());
        self.state.endpoints.lock().unwrap().push(endpoint);
        let step = self
            .state
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.state.fallback);
        let result = match step {
            Step::Refuse => Err(TransportError::Connect("connection refused".to_owned())),
            Step::Accept => {
                let (link, remote) = TransportLink::channel();
                let _ = self.state.remotes.send(remote);
                Ok(link)
            }
        };
        futures::future::ready(result).boxed()
    }
}

pub fn push(remote: &RemoteEnd, envelope: &Envelope) {
    remote
        .to_client
        .send(chatlink_client::TransportEvent::Message(envelope.encode().unwrap()))
        .unwrap();
}

pub fn new_message(id: u64, chat: u64, sender: u64, created_at: i64) -> Envelope {
    Envelope::new(Payload::NewMessage(record(id, chat, sender, created_at)))
}

pub fn record(id: u64, chat: u64, sender: u64, created_at: i64) -> MessageRecord {
    MessageRecord {
        id: Id::Num(id),
        chat_id: Id::Num(chat),
        sender_id: Id::Num(sender),
        content: format!("message {id}"),
        kind: MessageKind::Text,
        status: None,
        reply_to_id: None,
        local_id: None,
        is_edited: false,
        created_at,
    }
}

pub async fn next_link_event<F>(events: &mut Subscription<LinkEvent>, mut wanted: F) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    within(async {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
}

pub enum PostReply {
    Assign { id: u64, created_at: i64 },
    Fail(RestError),
}

struct RestState {
    pages: Mutex<HashMap<(ChatId, Option<Id>), Vec<Message>>>,
    fetches: AtomicUsize,
    fetch_gate: Semaphore,
    posts: Mutex<Vec<OutgoingMessage>>,
    post_replies: Mutex<VecDeque<PostReply>>,
    post_gate: Semaphore,
    next_id: AtomicU64,
    chats: Mutex<Vec<ChatSummary>>,
}

/// REST double. Pages and post replies are scripted; fetches and posts can be
/// held until the test releases them.
#[derive(Clone)]
pub struct MockRest {
    state: Arc<RestState>,
}

impl MockRest {
    pub fn new() -> Self {
        Self::with_gates(Semaphore::MAX_PERMITS, Semaphore::MAX_PERMITS)
    }

    pub fn holding_fetches() -> Self {
        Self::with_gates(0, Semaphore::MAX_PERMITS)
    }

    pub fn holding_posts() -> Self {
        Self::with_gates(Semaphore::MAX_PERMITS, 0)
    }

    fn with_gates(fetch_permits: usize, post_permits: usize) -> Self {
        Self {
            state: Arc::new(RestState {
                pages: Mutex::new(HashMap::new()),
                fetches: AtomicUsize::new(0),
                fetch_gate: Semaphore::new(fetch_permits),
                posts: Mutex::new(Vec::new()),
                post_replies: Mutex::new(VecDeque::new()),
                post_gate: Semaphore::new(post_permits),
                next_id: AtomicU64::new(1_000),
                chats: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_page(&self, chat: u64, before: Option<u64>, records: Vec<MessageRecord>) {
        let page = records.into_iter().map(Message::from).collect();
        self.state
            .pages
            .lock()
            .unwrap()
            .insert((Id::Num(chat), before.map(Id::Num)), page);
    }

    pub fn set_chats(&self, chats: Vec<ChatSummary>) {
        *self.state.chats.lock().unwrap() = chats;
    }

    pub fn reply_to_next_post(&self, reply: PostReply) {
        self.state.post_replies.lock().unwrap().push_back(reply);
    }

    pub fn release_fetches(&self) {
        self.state.fetch_gate.add_permits(1);
    }

    pub fn release_posts(&self) {
        self.state.post_gate.add_permits(1);
    }

    pub fn fetches(&self) -> usize {
        self.state.fetches.load(Ordering::SeqCst)
    }

    pub fn posts(&self) -> Vec<OutgoingMessage> {
        self.state.posts.lock().unwrap().clone()
    }
}

impl RestApi for MockRest {
    fn fetch_messages(
        &self,
        chat_id: &ChatId,
        _limit: usize,
        before: Option<&Id>,
    ) -> BoxFuture<'static, Result<Vec<Message>, RestError>> {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        let key = (chat_id.clone(), before.cloned());
        let state = Arc::clone(&self.state);
        async move {
            let _permit = state.fetch_gate.acquire().await.unwrap();
            Ok(state.pages.lock().unwrap().get(&key).cloned().unwrap_or_default())
        }
        .boxed()
    }

    fn post_message(&self, message: &OutgoingMessage) -> BoxFuture<'static, Result<Message, RestError>> {
        self.state.posts.lock().unwrap().push(message.clone());
        let draft = message.clone();
        let state = Arc::clone(&self.state);
        async move {
            let _permit = state.post_gate.acquire().await.unwrap();
            let reply = state.post_replies.lock().unwrap().pop_front();
            let (id, created_at) = match reply {
                Some(PostReply::Fail(err)) => return Err(err),
                Some(PostReply::Assign { id, created_at }) => (id, created_at),
                None => (state.next_id.fetch_add(1, Ordering::SeqCst), 1_000),
            };
            Ok(Message {
                id: Some(Id::Num(id)),
                local_id: LocalId::for_server_id(&Id::Num(id)),
                chat_id: draft.chat_id,
                sender_id: Id::Num(0),
                content: draft.content,
                kind: draft.kind,
                created_at,
                state: MessageState::Sent,
                reply_to_id: draft.reply_to_id,
                edited: false,
            })
        }
        .boxed()
    }

    fn fetch_chats(&self) -> BoxFuture<'static, Result<Vec<ChatSummary>, RestError>> {
        let chats = self.state.chats.lock().unwrap().clone();
        futures::future::ready(Ok(chats)).boxed()
    }
}
