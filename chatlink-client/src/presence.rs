use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatlink_core::{ChatId, Envelope, Payload, UserId};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::bus::{EventBus, Subscription};

#[derive(Debug, Clone)]
pub struct PresenceSettings {
    pub typing_ttl: Duration,
    pub online_ttl: Duration,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            typing_ttl: Duration::from_secs(5),
            online_ttl: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceDiff {
    TypingStarted { chat_id: ChatId, user_id: UserId },
    TypingStopped { chat_id: ChatId, user_id: UserId },
    CameOnline { user_id: UserId },
    WentOffline { user_id: UserId },
}

#[derive(Default)]
struct PresenceBook {
    typing: HashMap<(ChatId, UserId), Instant>,
    online: HashMap<UserId, Instant>,
}

struct PresenceInner {
    book: Mutex<PresenceBook>,
    diffs: EventBus<PresenceDiff>,
    settings: PresenceSettings,
}

/// Ephemeral typing and online state. Every entry carries an expiry; an
/// entry past its expiry is reported absent even before the sweeper evicts it.
#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

impl PresenceTracker {
    pub fn new(settings: PresenceSettings) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                book: Mutex::new(PresenceBook::default()),
                diffs: EventBus::new(),
                settings,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<PresenceDiff> {
        self.inner.diffs.subscribe()
    }

    pub fn apply_envelope(&self, envelope: &Envelope) {
        self.apply_envelope_at(envelope, Instant::now());
    }

    fn apply_envelope_at(&self, envelope: &Envelope, now: Instant) {
        let mut book = self.book();
        let diff = match &envelope.payload {
            Payload::Typing(notice) => {
                let Some(user_id) = notice
                    .user_id
                    .clone()
                    .or_else(|| envelope.origin_user_id.clone())
                else {
                    debug!(chat_id = %notice.chat_id, "typing notice without sender");
                    return;
                };
                let key = (notice.chat_id.clone(), user_id.clone());
                let chat_id = notice.chat_id.clone();
                if notice.is_typing {
                    let expires_at = now + self.inner.settings.typing_ttl;
                    book.typing
                        .insert(key, expires_at)
                        .is_none_or(|previous| previous <= now)
                        .then_some(PresenceDiff::TypingStarted { chat_id, user_id })
                } else {
                    book.typing
                        .remove(&key)
                        .map(|_| PresenceDiff::TypingStopped { chat_id, user_id })
                }
            }
            Payload::UserStatus(status) => {
                let user_id = status.user_id.clone();
                if status.is_online() {
                    let expires_at = now + self.inner.settings.online_ttl;
                    book.online
                        .insert(user_id.clone(), expires_at)
                        .is_none_or(|previous| previous <= now)
                        .then_some(PresenceDiff::CameOnline { user_id })
                } else {
                    book.online
                        .remove(&user_id)
                        .map(|_| PresenceDiff::WentOffline { user_id })
                }
            }
            _ => None,
        };
        if let Some(diff) = diff {
            self.inner.diffs.publish(diff);
        }
    }

    /// Evicts expired entries and returns how many went.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut book = self.book();
        let mut expired = Vec::new();
        book.typing.retain(|(chat_id, user_id), expires_at| {
            let live = *expires_at > now;
            if !live {
                expired.push(PresenceDiff::TypingStopped {
                    chat_id: chat_id.clone(),
                    user_id: user_id.clone(),
                });
            }
            live
        });
        book.online.retain(|user_id, expires_at| {
            let live = *expires_at > now;
            if !live {
                expired.push(PresenceDiff::WentOffline {
                    user_id: user_id.clone(),
                });
            }
            live
        });
        let count = expired.len();
        for diff in expired {
            self.inner.diffs.publish(diff);
        }
        count
    }

    pub fn is_typing(&self, chat_id: &ChatId, user_id: &UserId) -> bool {
        let now = Instant::now();
        self.book()
            .typing
            .get(&(chat_id.clone(), user_id.clone()))
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub fn typing_users(&self, chat_id: &ChatId) -> Vec<UserId> {
        let now = Instant::now();
        let mut users: Vec<UserId> = self
            .book()
            .typing
            .iter()
            .filter(|((chat, _), expires_at)| chat == chat_id && **expires_at > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        let now = Instant::now();
        self.book()
            .online
            .get(user_id)
            .is_some_and(|expires_at| *expires_at > now)
    }

    /// Periodic eviction so expired entries also produce diffs.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = tracker.sweep();
                if evicted > 0 {
                    debug!(evicted, "presence entries expired");
                }
            }
        })
    }

    fn book(&self) -> MutexGuard<'_, PresenceBook> {
        self.inner.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
