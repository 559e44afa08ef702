//! WeightHub - Scale Event Distribution
//!
//! ## Responsibilities
//!
//! - Fan-out of `ScaleData` events to every current subscriber
//! - Subscriber lifecycle (register/unregister)
//!
//! Serial monitors, the demo simulator and the remote scale bridge all
//! publish through the same hub, so a subscriber cannot tell a synthetic
//! reading from a physical one. Events are not retained: a late subscriber
//! only sees readings published after it registered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One live reading from a weighing station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleData {
    pub scale_id: u32,
    pub weight: f64,
    pub connected: bool,
    /// Unix seconds
    pub timestamp: i64,
}

impl ScaleData {
    /// Reading stamped with the current time
    pub fn now(scale_id: u32, weight: f64, connected: bool) -> Self {
        Self {
            scale_id,
            weight,
            connected,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// WeightHub instance
pub struct WeightHub {
    subscribers: RwLock<HashMap<Uuid, mpsc::UnboundedSender<ScaleData>>>,
    subscriber_count: AtomicU64,
}

impl WeightHub {
    /// Create new WeightHub
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            subscriber_count: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber
    pub async fn subscribe(&self) -> (Uuid, mpsc::UnboundedReceiver<ScaleData>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, tx);
        }

        self.subscriber_count.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(subscriber_id = %id, "Weight subscriber registered");

        (id, rx)
    }

    /// Unregister a subscriber
    pub async fn unsubscribe(&self, id: &Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(id).is_some() {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(subscriber_id = %id, "Weight subscriber removed");
        }
    }

    /// Broadcast a reading to all subscribers
    pub async fn publish(&self, data: ScaleData) {
        let subscribers = self.subscribers.read().await;

        for (id, tx) in subscribers.iter() {
            if tx.send(data.clone()).is_err() {
                // Receiver dropped without unsubscribing; its entry is
                // cleaned up on the next unsubscribe call for that id.
                tracing::warn!(subscriber_id = %id, "Failed to deliver scale event");
            }
        }
    }

    /// Get subscriber count
    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Relaxed)
    }
}

impl Default for WeightHub {
    fn default() -> Self {
        Self::new()
    }
}
