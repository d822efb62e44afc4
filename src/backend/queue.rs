use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::protocol::redis::Message;

/// Messages waiting for the writer of one physical connection.
///
/// The lock covers push/pop only; it is never held across I/O.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    inner: Mutex<VecDeque<Message>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message`; returns true when the queue was empty before.
    pub fn push(&self, message: Message) -> bool {
        let mut guard = self.inner.lock();
        let was_empty = guard.is_empty();
        guard.push_back(message);
        was_empty
    }

    pub fn push_front(&self, message: Message) -> bool {
        let mut guard = self.inner.lock();
        let was_empty = guard.is_empty();
        guard.push_front(message);
        was_empty
    }

    /// Push unless `closed` reports true, checked under the queue lock so a
    /// concurrent drain cannot miss the message.
    pub fn push_unless<F>(&self, message: Message, front: bool, closed: F) -> Result<bool, Message>
    where
        F: FnOnce() -> bool,
    {
        let mut guard = self.inner.lock();
        if closed() {
            return Err(message);
        }
        let was_empty = guard.is_empty();
        if front {
            guard.push_front(message);
        } else {
            guard.push_back(message);
        }
        Ok(was_empty)
    }

    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    /// Take everything queued.
    pub fn drain(&self) -> Vec<Message> {
        self.inner.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::redis::{Command, CommandFlags};

    fn msg(key: &'static str) -> Message {
        Message::builder(Command::Get).key(key).build()
    }

    #[test]
    fn reports_empty_transitions() {
        let queue = OutboundQueue::new();
        assert!(queue.push(msg("a")));
        assert!(!queue.push(msg("b")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().to_string(), "GET a");
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
        assert!(queue.push(msg("c")));
    }

    #[test]
    fn priority_jumps_the_line() {
        let queue = OutboundQueue::new();
        queue.push(msg("a"));
        let urgent = Message::builder(Command::Get)
            .key("z")
            .flags(CommandFlags::HIGH_PRIORITY)
            .build();
        queue.push_front(urgent);
        assert_eq!(queue.pop().unwrap().to_string(), "GET z");
    }

    #[test]
    fn closed_queue_hands_message_back() {
        let queue = OutboundQueue::new();
        let rejected = queue.push_unless(msg("a"), false, || true).unwrap_err();
        assert_eq!(rejected.to_string(), "GET a");
        assert!(matches!(queue.push_unless(msg("b"), false, || false), Ok(true)));
    }
}
