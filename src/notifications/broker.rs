//! Process-local realtime pub/sub: `user_id -> [queue]`, a
//! `parking_lot::Mutex`-guarded map generalized to a keyed fan-out.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub receiver: mpsc::UnboundedReceiver<Value>,
}

/// A single per-process map guarded by a mutex: `publish` holds the lock
/// only long enough to snapshot the subscriber list, then releases it
/// before pushing to individual queues, so a slow/blocked subscriber can
/// never stall other publishers.
#[derive(Default)]
pub struct StreamBroker {
    subscribers: Mutex<HashMap<Uuid, Vec<(Uuid, mpsc::UnboundedSender<Value>)>>>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.lock().entry(user_id).or_default().push((id, tx));
        Subscription {
            id,
            user_id,
            receiver: rx,
        }
    }

    /// Remove a subscription and garbage-collect the user's slot if it was
    /// the last one.
    pub fn unsubscribe(&self, user_id: Uuid, subscription_id: Uuid) {
        let mut map = self.subscribers.lock();
        if let Some(list) = map.get_mut(&user_id) {
            list.retain(|(id, _)| *id != subscription_id);
            if list.is_empty() {
                map.remove(&user_id);
            }
        }
    }

    /// Fan `payload` out to every queue currently subscribed for `user_id`.
    /// Returns how many subscribers actually received it (a dead receiver
    /// whose task has dropped is silently skipped, not retried).
    pub fn publish(&self, user_id: Uuid, payload: Value) -> usize {
        let targets: Vec<mpsc::UnboundedSender<Value>> = {
            let map = self.subscribers.lock();
            map.get(&user_id)
                .map(|list| list.iter().map(|(_, tx)| tx.clone()).collect())
                .unwrap_or_default()
        };

        targets
            .into_iter()
            .filter(|tx| tx.send(payload.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self, user_id: Uuid) -> usize {
        self.subscribers.lock().get(&user_id).map(Vec::len).unwrap_or(0)
    }
}
