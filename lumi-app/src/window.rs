//! Per-user conversation windows.
//!
//! Each user owns an ordered list of turns capped at `2 × max_history`
//! entries; the oldest entries are evicted first. Windows are created lazily
//! and live for the process lifetime. Operations on one user's window are
//! mutually exclusive through the map's per-shard locks, so unrelated users
//! never wait on each other beyond shard collisions.

use dashmap::DashMap;
use lumi_channels::SenderId;
use lumi_llm::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    NothingToReset,
}

pub struct WindowManager {
    windows: DashMap<SenderId, Vec<ChatMessage>>,
    max_history: usize,
}

impl WindowManager {
    pub fn new(max_history: usize) -> Self {
        Self {
            windows: DashMap::new(),
            max_history: max_history.max(1),
        }
    }

    /// Maximum number of turns a window holds.
    pub fn capacity(&self) -> usize {
        self.max_history * 2
    }

    #[cfg(test)]
    pub fn append(&self, user_id: &SenderId, turn: ChatMessage) {
        let capacity = self.capacity();
        let mut window = self.windows.entry(user_id.clone()).or_default();
        window.push(turn);
        trim_oldest(&mut window, capacity);
    }

    /// Append a user turn and its reply under one lock.
    pub fn append_exchange(&self, user_id: &SenderId, user_turn: ChatMessage, reply: ChatMessage) {
        let capacity = self.capacity();
        let mut window = self.windows.entry(user_id.clone()).or_default();
        window.push(user_turn);
        trim_oldest(&mut window, capacity);
        window.push(reply);
        trim_oldest(&mut window, capacity);
    }

    pub fn get(&self, user_id: &SenderId) -> Vec<ChatMessage> {
        self.windows
            .get(user_id)
            .map(|w| w.value().clone())
            .unwrap_or_default()
    }

    /// The window `append(user_id, turn)` would produce, without storing it.
    pub fn preview_append(&self, user_id: &SenderId, turn: ChatMessage) -> Vec<ChatMessage> {
        let mut window = self.get(user_id);
        window.push(turn);
        trim_oldest(&mut window, self.capacity());
        window
    }

    pub fn reset(&self, user_id: &SenderId) -> ResetOutcome {
        match self.windows.get_mut(user_id) {
            Some(mut window) => {
                window.clear();
                ResetOutcome::Reset
            }
            None => ResetOutcome::NothingToReset,
        }
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }
}

fn trim_oldest(window: &mut Vec<ChatMessage>, capacity: usize) {
    if window.len() > capacity {
        let excess = window.len() - capacity;
        window.drain(..excess);
    }
}
