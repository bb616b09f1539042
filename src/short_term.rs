use std::collections::VecDeque;

use crate::types::Message;

/// Bounded, ordered sequence of recent non-system messages.
///
/// Unlike the original `ShortTermMemory` (a `deque(maxlen=N)` that silently
/// evicts the oldest message once full), this buffer never auto-evicts:
/// `add` always appends, and `is_full` merely reports that capacity has been
/// reached so the `MemoryManager` can decide whether to compress. Messages
/// leave only via `clear()` (spec §4.2, Invariant B1).
#[derive(Debug, Default)]
pub struct ShortTermBuffer {
    capacity: usize,
    messages: VecDeque<Message>,
}

impl ShortTermBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            messages: VecDeque::new(),
        }
    }

    pub fn add(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// Defensive copy: detached from internal state.
    pub fn get_messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_full(&self) -> bool {
        self.messages.len() >= self.capacity
    }

    pub fn peek_oldest(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn peek_newest(&self) -> Option<&Message> {
        self.messages.back()
    }

    /// Empties the buffer and returns everything that was in it, in
    /// original order.
    pub fn clear(&mut self) -> Vec<Message> {
        self.messages.drain(..).collect()
    }

    /// Removes and returns the most recently added message, if any. Used by
    /// `rollback_incomplete_exchange` to undo a cancelled tool-use turn.
    pub fn pop_newest(&mut self) -> Option<Message> {
        self.messages.pop_back()
    }
}
