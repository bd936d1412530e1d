//! Bounded FIFO of messages received before any output sink exists.

use std::collections::VecDeque;

use crate::message::Message;

/// Default number of held messages.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default byte budget (16 MB).
pub const DEFAULT_BYTES: usize = 16_000 * 1024;

/// Result of [`Backlog::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Stored; `evicted` older messages were dropped to make room.
    Held { evicted: usize },
    /// Larger than the byte budget on its own; not stored.
    TooLarge { bytes: usize },
    /// Already drained.
    Closed,
}

struct StoredMsg {
    msg: Message,
    bytes: usize,
}

/// Backlog replayed once to the first output sink.
///
/// When either limit is hit the oldest messages are evicted. After
/// [`Backlog::drain`] the backlog is closed and rejects further pushes,
/// so nothing is ever replayed twice.
pub struct Backlog {
    history: VecDeque<StoredMsg>,
    total_bytes: usize,
    capacity: usize,
    byte_limit: usize,
    evicted: usize,
    drained: bool,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_BYTES)
    }
}

impl Backlog {
    /// Create a backlog with the given limits. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize, byte_limit: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(32),
            total_bytes: 0,
            capacity: capacity.max(1),
            byte_limit,
            evicted: 0,
            drained: false,
        }
    }

    /// Hold a message for later replay.
    ///
    /// A message larger than the whole byte budget is refused and the held
    /// messages are left alone.
    pub fn push(&mut self, msg: Message) -> Push {
        if self.drained {
            return Push::Closed;
        }

        let bytes = msg.approx_bytes();
        if bytes > self.byte_limit {
            return Push::TooLarge { bytes };
        }

        let mut evicted = 0;
        while self.history.len() >= self.capacity
            || self.total_bytes.saturating_add(bytes) > self.byte_limit
        {
            let Some(front) = self.history.pop_front() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(front.bytes);
            evicted += 1;
        }
        self.evicted += evicted;

        self.history.push_back(StoredMsg { msg, bytes });
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        Push::Held { evicted }
    }

    /// Take every held message in arrival order and close the backlog.
    pub fn drain(&mut self) -> Vec<Message> {
        self.drained = true;
        self.total_bytes = 0;
        self.history.drain(..).map(|s| s.msg).collect()
    }

    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.drained
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    #[must_use]
    pub const fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Messages evicted over the backlog's lifetime.
    #[must_use]
    pub const fn evicted(&self) -> usize {
        self.evicted
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::Channel;

    fn stream(text: &str) -> Message {
        Message::new(Channel::Broadcast, "stream").with_payload(json!({ "text": text }))
    }

    #[test]
    fn test_drain_preserves_order_and_closes() {
        let mut backlog = Backlog::default();
        assert_eq!(backlog.push(stream("a")), Push::Held { evicted: 0 });
        assert_eq!(backlog.push(stream("b")), Push::Held { evicted: 0 });

        let drained = backlog.drain();
        assert_eq!(drained, vec![stream("a"), stream("b")]);
        assert!(backlog.is_drained());
        assert_eq!(backlog.push(stream("c")), Push::Closed);
        assert!(backlog.drain().is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut backlog = Backlog::new(2, DEFAULT_BYTES);
        backlog.push(stream("a"));
        backlog.push(stream("b"));
        assert_eq!(backlog.push(stream("c")), Push::Held { evicted: 1 });

        assert_eq!(backlog.evicted(), 1);
        assert_eq!(backlog.drain(), vec![stream("b"), stream("c")]);
    }

    #[test]
    fn test_byte_limit_evicts_oldest() {
        let one = stream("x").approx_bytes();
        let mut backlog = Backlog::new(100, one * 2);
        backlog.push(stream("x"));
        backlog.push(stream("y"));
        assert_eq!(backlog.total_bytes(), one * 2);

        assert_eq!(backlog.push(stream("z")), Push::Held { evicted: 1 });
        assert_eq!(backlog.len(), 2);
    }

    #[test]
    fn test_oversize_message_refused() {
        let small = stream("x");
        let big = stream(&"y".repeat(256));
        let mut backlog = Backlog::new(100, small.approx_bytes() * 2);
        backlog.push(small.clone());

        assert_eq!(
            backlog.push(big.clone()),
            Push::TooLarge {
                bytes: big.approx_bytes()
            }
        );
        assert_eq!(backlog.total_bytes(), small.approx_bytes());
        assert_eq!(backlog.evicted(), 0);
        assert_eq!(backlog.drain(), vec![small]);
    }
}
