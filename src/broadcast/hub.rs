// =============================================================================
// User Hub — per-user push channels for alert notifications
// =============================================================================
//
// One channel per user, registered by the alert WebSocket handler. Sends are
// best-effort: a dead channel is purged on the first failed send and the
// remaining recipients are unaffected.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Push messages longer than this are split before sending.
pub const MAX_PUSH_MESSAGE_LEN: usize = 4096;

/// Registry of connected users' push channels.
pub struct UserHub {
    channels: RwLock<HashMap<i64, mpsc::UnboundedSender<String>>>,
}

impl UserHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Register a push channel for `user_id`, replacing any previous one
    /// (one live connection per user).
    pub fn register(&self, user_id: i64) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let old = self.channels.write().insert(user_id, tx);
        if old.is_some() {
            debug!(user_id, "previous push channel replaced");
        }
        info!(user_id, "user push channel registered");
        rx
    }

    pub fn unregister(&self, user_id: i64) {
        if self.channels.write().remove(&user_id).is_some() {
            info!(user_id, "user push channel removed");
        }
    }

    pub fn is_connected(&self, user_id: i64) -> bool {
        self.channels.read().contains_key(&user_id)
    }

    pub fn connected_users(&self) -> Vec<i64> {
        self.channels.read().keys().copied().collect()
    }

    /// Best-effort send; a closed channel is purged and `false` returned.
    pub fn send(&self, user_id: i64, text: String) -> bool {
        let sender = {
            let channels = self.channels.read();
            channels.get(&user_id).cloned()
        };
        let Some(sender) = sender else {
            debug!(user_id, "user not connected — notification dropped");
            return false;
        };
        if sender.send(text).is_err() {
            self.channels.write().remove(&user_id);
            debug!(user_id, "push channel closed — removed");
            return false;
        }
        true
    }

    /// Send `text`, split into platform-sized chunks if needed.
    pub fn send_chunked(&self, user_id: i64, text: &str) {
        for chunk in chunk_message(text, MAX_PUSH_MESSAGE_LEN) {
            if !self.send(user_id, chunk) {
                break;
            }
        }
    }
}

impl Default for UserHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a message at char boundaries, preferring line breaks.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > max_len && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        // A single line longer than the limit is split by chars.
        if line.len() > max_len {
            let mut piece = String::new();
            for c in line.chars() {
                if piece.len() + c.len_utf8() > max_len {
                    chunks.push(std::mem::take(&mut piece));
                }
                piece.push(c);
            }
            current = piece;
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_user_receives_messages() {
        let hub = UserHub::new();
        let mut rx = hub.register(7);
        assert!(hub.send(7, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn dead_channel_is_purged_and_others_unaffected() {
        let hub = UserHub::new();
        let rx1 = hub.register(1);
        let mut rx2 = hub.register(2);
        drop(rx1);

        assert!(!hub.send(1, "gone".into()));
        assert!(!hub.is_connected(1));
        assert!(hub.send(2, "still here".into()));
        assert_eq!(rx2.recv().await.unwrap(), "still here");
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(chunk_message("hi", 4096).len(), 1);
    }

    #[test]
    fn long_messages_split_on_line_boundaries() {
        let text = (0..100)
            .map(|i| format!("line number {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_message(&text, 200);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 200));
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn oversized_single_line_still_splits() {
        let text = "x".repeat(10_000);
        let chunks = chunk_message(&text, 4096);
        assert!(chunks.iter().all(|c| c.len() <= 4096));
        assert_eq!(chunks.concat(), text);
    }
}
