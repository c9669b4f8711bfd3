use std::collections::VecDeque;

use chatlink_core::Envelope;

/// FIFO of envelopes accepted while the link is down. With a limit, the
/// oldest entry is evicted to make room for a new one.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    limit: Option<usize>,
}

impl OutboundQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            items: VecDeque::new(),
            limit,
        }
    }

    /// Queues `envelope`, returning whatever had to be evicted for it.
    pub fn enqueue(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = match self.limit {
            Some(0) => return Some(envelope),
            Some(limit) if self.items.len() >= limit => self.items.pop_front(),
            _ => None,
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Puts envelopes that left the queue but never reached the wire back in
    /// front, oldest first. Past the limit the oldest entries are evicted and
    /// returned.
    pub fn requeue_front(&mut self, unsent: impl IntoIterator<Item = Envelope>) -> Vec<Envelope> {
        let unsent: Vec<Envelope> = unsent.into_iter().collect();
        for envelope in unsent.into_iter().rev() {
            self.items.push_front(envelope);
        }
        let mut evicted = Vec::new();
        if let Some(limit) = self.limit {
            while self.items.len() > limit {
                match self.items.pop_front() {
                    Some(envelope) => evicted.push(envelope),
                    None => break,
                }
            }
        }
        evicted
    }

    /// Hands queued envelopes to `transmit` oldest first. On the first
    /// failure the failed envelope and everything behind it stay queued.
    pub fn flush<F, E>(&mut self, mut transmit: F) -> Result<usize, E>
    where
        F: FnMut(&Envelope) -> Result<(), E>,
    {
        let mut sent = 0;
        while let Some(front) = self.items.front() {
            transmit(front)?;
            self.items.pop_front();
            sent += 1;
        }
        Ok(sent)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}
