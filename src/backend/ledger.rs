use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::redis::Message;

/// Messages written (or being written) to the socket, in write order.
/// Replies always complete the head.
#[derive(Debug, Default)]
pub struct PendingLedger {
    inner: Mutex<VecDeque<Message>>,
}

impl PendingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.inner.lock().push_back(message);
    }

    pub fn pop(&self) -> Option<Message> {
        self.inner.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Message> {
        self.inner.lock().drain(..).collect()
    }

    /// Age of the head, the message that has waited longest.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner.lock().front().map(Message::age)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
