use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

/// Boundary a frontend channel implements to receive dispatched replies and
/// emit inbound turns. `turnstile-telegram` provides the concrete Telegram
/// implementation; this trait is the seam a future adapter plugs into.
#[async_trait]
pub trait FrontendAdapter: Send + Sync {
    /// Send (or edit, if `edit_of` is set) a reply into the conversation
    /// identified by `chat_key`.
    async fn deliver(&self, chat_key: &str, text: &str, edit_of: Option<&str>) -> anyhow::Result<String>;

    /// Start the adapter's long-poll (or equivalent) loop. Never returns
    /// under normal operation.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Bounded recent-message-id dedup ring. Guards against redelivery from
/// frontends whose transport may resend (webhooks with at-least-once
/// delivery, reconnecting long-poll clients, ...).
pub struct DedupRing {
    capacity: usize,
    order: Mutex<VecDeque<String>>,
    seen: Mutex<HashSet<String>>,
}

impl DedupRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Mutex::new(VecDeque::with_capacity(capacity)),
            seen: Mutex::new(HashSet::with_capacity(capacity)),
        }
    }

    /// Returns `true` the first time `message_id` is observed, `false` on
    /// every subsequent observation until it ages out of the ring.
    pub fn observe(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().expect("dedup ring seen set poisoned");
        if seen.contains(message_id) {
            return false;
        }

        let mut order = self.order.lock().expect("dedup ring order queue poisoned");
        order.push_back(message_id.to_string());
        seen.insert(message_id.to_string());

        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        true
    }
}
