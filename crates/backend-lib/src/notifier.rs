// ============================
// crates/backend-lib/src/notifier.rs
// ============================
//! Push-based change notification.
//!
//! Pool size changes go out on a `watch` channel so every subscriber sees the
//! latest count. Match creation, partner departure and in-room traffic are
//! pushed to per-user and per-match subscriber lists. Delivery is best
//! effort: a full client buffer drops the message rather than stalling the
//! matchmaker.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use metrics::gauge;
use protv_common::{ServerToClient, UserId};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics::QUEUE_SIZE;

pub type SubscriptionId = u64;

type Subscribers = Vec<(SubscriptionId, mpsc::Sender<ServerToClient>)>;

pub struct ChangeNotifier {
    queue_count: watch::Sender<usize>,
    users: DashMap<UserId, Subscribers>,
    matches: DashMap<Uuid, Subscribers>,
    next_id: AtomicU64,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (queue_count, _) = watch::channel(0);
        Self {
            queue_count,
            users: DashMap::new(),
            matches: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_subscription(&self) -> SubscriptionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish a new pool size; unchanged values do not wake subscribers
    pub fn publish_queue_count(&self, count: usize) {
        gauge!(QUEUE_SIZE).set(count as f64);
        self.queue_count.send_if_modified(|current| {
            if *current == count {
                false
            } else {
                *current = count;
                true
            }
        });
    }

    pub fn queue_count(&self) -> usize {
        *self.queue_count.borrow()
    }

    pub fn subscribe_queue_count(&self) -> watch::Receiver<usize> {
        self.queue_count.subscribe()
    }

    /// Register a connection to receive messages addressed to `user_id`
    pub fn subscribe_user(
        &self,
        user_id: UserId,
        sender: mpsc::Sender<ServerToClient>,
    ) -> SubscriptionId {
        let id = self.next_subscription();
        self.users.entry(user_id).or_default().push((id, sender));
        debug!(%user_id, subscription = id, "user subscribed");
        id
    }

    /// Drop one subscription; returns how many remain for the user
    pub fn unsubscribe_user(&self, user_id: UserId, id: SubscriptionId) -> usize {
        remove_subscription(&self.users, &user_id, id)
    }

    pub fn has_user_subscribers(&self, user_id: UserId) -> bool {
        self.users
            .get(&user_id)
            .is_some_and(|subs| subs.iter().any(|(_, tx)| !tx.is_closed()))
    }

    /// Push to every live connection of a user; returns the number of deliveries
    pub fn notify_user(&self, user_id: UserId, message: ServerToClient) -> usize {
        deliver(&self.users, &user_id, &message)
    }

    pub fn subscribe_match(
        &self,
        match_id: Uuid,
        sender: mpsc::Sender<ServerToClient>,
    ) -> SubscriptionId {
        let id = self.next_subscription();
        self.matches.entry(match_id).or_default().push((id, sender));
        id
    }

    pub fn unsubscribe_match(&self, match_id: Uuid, id: SubscriptionId) -> usize {
        remove_subscription(&self.matches, &match_id, id)
    }

    /// Push to every connection currently inside the match's room
    pub fn publish_to_match(&self, match_id: Uuid, message: ServerToClient) -> usize {
        deliver(&self.matches, &match_id, &message)
    }
}

fn remove_subscription<K>(map: &DashMap<K, Subscribers>, key: &K, id: SubscriptionId) -> usize
where
    K: std::hash::Hash + Eq,
{
    let remaining = match map.get_mut(key) {
        Some(mut subs) => {
            subs.retain(|(sub_id, _)| *sub_id != id);
            subs.len()
        },
        None => return 0,
    };

    if remaining == 0 {
        map.remove_if(key, |_, subs| subs.is_empty());
    }
    remaining
}

fn deliver<K>(map: &DashMap<K, Subscribers>, key: &K, message: &ServerToClient) -> usize
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    let Some(mut subs) = map.get_mut(key) else {
        return 0;
    };

    let mut delivered = 0;
    subs.retain(|(sub_id, tx)| match tx.try_send(message.clone()) {
        Ok(()) => {
            delivered += 1;
            true
        },
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(%key, subscription = sub_id, "client buffer full, dropping message");
            true
        },
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
    delivered
}
