// ============================
// crates/backend-lib/src/matchmaker.rs
// ============================
//! The waiting pool and pairing engine.
//!
//! A single [`MatchmakerActor`] task owns the pool and handles one command at
//! a time, so a ticket can never be claimed by two pairings. Everything else
//! talks to it through a cloneable [`MatchmakerHandle`].
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use protv_common::{
    CloseReason, MatchFilters, MatchRecord, Profile, ServerToClient, UserId, WaitingTicket,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    filter::mutually_compatible,
    metrics::{MATCH_CREATED, MATCH_ENDED, MATCH_ROLLBACK, QUEUE_ENTERED},
    notifier::ChangeNotifier,
    room_id,
    storage::Storage,
    validation::normalize_filters,
};

/// Result of entering the pool
#[derive(Debug, Clone)]
pub struct EnterOutcome {
    pub ticket: WaitingTicket,
    /// Set when the caller was paired immediately
    pub matched: Option<MatchRecord>,
}

/// Message sent *into* the actor
#[derive(Debug)]
pub enum MatchmakerMsg {
    Enter {
        user_id: UserId,
        filters: MatchFilters,
        resp_tx: oneshot::Sender<Result<EnterOutcome, AppError>>,
    },
    Leave {
        user_id: UserId,
        resp_tx: oneshot::Sender<bool>,
    },
    Count {
        resp_tx: oneshot::Sender<usize>,
    },
    Ticket {
        user_id: UserId,
        resp_tx: oneshot::Sender<Option<WaitingTicket>>,
    },
}

/// Handle that other components keep
#[derive(Clone)]
pub struct MatchmakerHandle {
    cmd_tx: mpsc::UnboundedSender<MatchmakerMsg>,
}

impl MatchmakerHandle {
    /// Spawn the actor on the current runtime
    pub fn spawn(
        storage: Arc<dyn Storage>,
        notifier: Arc<ChangeNotifier>,
        sweep_interval: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = MatchmakerActor::new(storage, notifier);
        tokio::spawn(actor.run(cmd_rx, sweep_interval));
        Self { cmd_tx }
    }

    /// Enter the pool, replacing any previous ticket, and try to pair right away
    pub async fn enter(
        &self,
        user_id: UserId,
        filters: MatchFilters,
    ) -> Result<EnterOutcome, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(MatchmakerMsg::Enter {
            user_id,
            filters,
            resp_tx,
        })?;
        resp_rx.await?
    }

    /// Remove the user's ticket; returns whether one existed
    pub async fn leave(&self, user_id: UserId) -> Result<bool, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(MatchmakerMsg::Leave { user_id, resp_tx })?;
        Ok(resp_rx.await?)
    }

    pub async fn count(&self) -> Result<usize, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(MatchmakerMsg::Count { resp_tx })?;
        Ok(resp_rx.await?)
    }

    pub async fn ticket(&self, user_id: UserId) -> Result<Option<WaitingTicket>, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(MatchmakerMsg::Ticket { user_id, resp_tx })?;
        Ok(resp_rx.await?)
    }
}

struct PoolEntry {
    ticket: WaitingTicket,
    profile: Profile,
}

pub struct MatchmakerActor {
    storage: Arc<dyn Storage>,
    notifier: Arc<ChangeNotifier>,
    /// Tickets in arrival order
    pool: VecDeque<PoolEntry>,
}

impl MatchmakerActor {
    pub fn new(storage: Arc<dyn Storage>, notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            storage,
            notifier,
            pool: VecDeque::new(),
        }
    }

    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<MatchmakerMsg>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = cmd_rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = sweep.tick() => self.sweep().await,
            }
        }

        debug!("matchmaker stopped");
    }

    async fn handle(&mut self, msg: MatchmakerMsg) {
        match msg {
            MatchmakerMsg::Enter {
                user_id,
                filters,
                resp_tx,
            } => {
                let result = self.enter(user_id, filters).await;
                let _ = resp_tx.send(result);
            },
            MatchmakerMsg::Leave { user_id, resp_tx } => {
                let _ = resp_tx.send(self.leave(user_id));
            },
            MatchmakerMsg::Count { resp_tx } => {
                let _ = resp_tx.send(self.pool.len());
            },
            MatchmakerMsg::Ticket { user_id, resp_tx } => {
                let ticket = self
                    .pool
                    .iter()
                    .find(|e| e.ticket.user_id == user_id)
                    .map(|e| e.ticket.clone());
                let _ = resp_tx.send(ticket);
            },
        }
    }

    async fn enter(
        &mut self,
        user_id: UserId,
        filters: MatchFilters,
    ) -> Result<EnterOutcome, AppError> {
        let profile = self
            .storage
            .get_profile(user_id)
            .await?
            .ok_or(AppError::ProfileNotFound(user_id))?;

        self.end_stale_matches(user_id).await?;

        self.pool.retain(|e| e.ticket.user_id != user_id);
        let ticket = WaitingTicket::new(user_id, normalize_filters(filters));
        self.pool.push_back(PoolEntry {
            ticket: ticket.clone(),
            profile,
        });
        counter!(QUEUE_ENTERED).increment(1);
        debug!(%user_id, pool = self.pool.len(), "ticket added");

        let matched = self.try_pair(user_id).await;
        self.notifier.publish_queue_count(self.pool.len());

        Ok(EnterOutcome { ticket, matched })
    }

    /// A user going back to the queue is done with any room they never left
    async fn end_stale_matches(&self, user_id: UserId) -> Result<(), AppError> {
        for stale in self.storage.active_matches_for_user(user_id).await? {
            let (record, changed) = self.storage.end_match(stale.id, Utc::now()).await?;
            if !changed {
                continue;
            }
            counter!(MATCH_ENDED).increment(1);
            info!(match_id = %record.id, %user_id, "stale match ended on queue entry");
            self.notifier.publish_to_match(
                record.id,
                ServerToClient::MatchEnded {
                    match_id: record.id,
                    ended_by: user_id,
                    reason: CloseReason::Left,
                },
            );
        }
        Ok(())
    }

    fn leave(&mut self, user_id: UserId) -> bool {
        let before = self.pool.len();
        self.pool.retain(|e| e.ticket.user_id != user_id);
        let removed = self.pool.len() != before;
        if removed {
            debug!(%user_id, "ticket removed");
            self.notifier.publish_queue_count(self.pool.len());
        }
        removed
    }

    /// Pair `user_id` with the earliest compatible ticket, if any.
    ///
    /// Both tickets leave the pool before the match is persisted. If the
    /// insert fails they go back to their original positions.
    async fn try_pair(&mut self, user_id: UserId) -> Option<MatchRecord> {
        let me = self.pool.iter().position(|e| e.ticket.user_id == user_id)?;
        let candidate = {
            let mine = &self.pool[me];
            self.pool.iter().enumerate().position(|(i, other)| {
                i != me
                    && mutually_compatible(
                        &mine.ticket.filters,
                        &mine.profile,
                        &other.ticket.filters,
                        &other.profile,
                    )
            })?
        };

        let (lo, hi) = if me < candidate { (me, candidate) } else { (candidate, me) };
        let hi_entry = self.pool.remove(hi)?;
        let lo_entry = self.pool.remove(lo)?;
        let (initiator, partner) = if me < candidate {
            (&lo_entry, &hi_entry)
        } else {
            (&hi_entry, &lo_entry)
        };

        let record = MatchRecord::new(
            room_id::generate(),
            initiator.ticket.user_id,
            partner.ticket.user_id,
        );

        if let Err(e) = self.storage.insert_match(&record).await {
            warn!(
                user1 = %record.user1_id,
                user2 = %record.user2_id,
                "pairing rolled back: {e}"
            );
            counter!(MATCH_ROLLBACK).increment(1);
            self.pool.insert(lo, lo_entry);
            self.pool.insert(hi, hi_entry);
            return None;
        }

        counter!(MATCH_CREATED).increment(1);
        info!(
            match_id = %record.id,
            room_id = %record.room_id,
            user1 = %record.user1_id,
            user2 = %record.user2_id,
            "match created"
        );

        for (me, partner) in [
            (record.user1_id, record.user2_id),
            (record.user2_id, record.user1_id),
        ] {
            self.notifier.notify_user(
                me,
                ServerToClient::MatchFound {
                    match_id: record.id,
                    room_id: record.room_id.clone(),
                    partner_id: partner,
                },
            );
        }

        Some(record)
    }

    /// Re-run pairing over the whole pool in arrival order
    async fn sweep(&mut self) {
        if self.pool.len() < 2 {
            return;
        }

        let before = self.pool.len();
        let mut i = 0;
        while i < self.pool.len() {
            let user_id = self.pool[i].ticket.user_id;
            if self.try_pair(user_id).await.is_none() {
                i += 1;
            }
        }

        if self.pool.len() != before {
            debug!(paired = before - self.pool.len(), "sweep paired waiting users");
            self.notifier.publish_queue_count(self.pool.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FlatFileStorage;
    use protv_common::School;
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn setup() -> (TempDir, Arc<FlatFileStorage>, Arc<ChangeNotifier>, MatchmakerHandle) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FlatFileStorage::new(dir.path()).unwrap());
        let notifier = Arc::new(ChangeNotifier::new());
        let handle = MatchmakerHandle::spawn(
            storage.clone(),
            notifier.clone(),
            Duration::from_secs(3600),
        );
        (dir, storage, notifier, handle)
    }

    async fn seed(storage: &FlatFileStorage, school: School) -> UserId {
        let profile = Profile {
            id: Uuid::new_v4(),
            full_name: "Pool User".to_string(),
            school,
            major: "Economics".to_string(),
            class_year: 2026,
            interests: Vec::new(),
            avatar_url: None,
        };
        storage.upsert_profile(&profile).await.unwrap();
        profile.id
    }

    #[tokio::test]
    async fn test_enter_requires_profile() {
        let (_dir, _storage, _notifier, handle) = setup().await;
        let result = handle.enter(Uuid::new_v4(), MatchFilters::default()).await;
        assert!(matches!(result, Err(AppError::ProfileNotFound(_))));
        assert_eq!(handle.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reentering_replaces_ticket() {
        let (_dir, storage, notifier, handle) = setup().await;
        let user = seed(&storage, School::Yale).await;
        let yale_only = MatchFilters {
            schools: vec![School::Princeton],
            ..MatchFilters::default()
        };

        handle.enter(user, MatchFilters::default()).await.unwrap();
        handle.enter(user, yale_only.clone()).await.unwrap();

        assert_eq!(handle.count().await.unwrap(), 1);
        assert_eq!(notifier.queue_count(), 1);
        let ticket = handle.ticket(user).await.unwrap().unwrap();
        assert_eq!(ticket.filters, yale_only);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (_dir, storage, _notifier, handle) = setup().await;
        let user = seed(&storage, School::Brown).await;
        handle.enter(user, MatchFilters::default()).await.unwrap();

        assert!(handle.leave(user).await.unwrap());
        assert!(!handle.leave(user).await.unwrap());
        assert_eq!(handle.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_compatible_users_are_paired() {
        let (_dir, storage, notifier, handle) = setup().await;
        let a = seed(&storage, School::Harvard).await;
        let b = seed(&storage, School::Princeton).await;

        let (tx, mut rx) = mpsc::channel(8);
        notifier.subscribe_user(a, tx);

        let first = handle.enter(a, MatchFilters::default()).await.unwrap();
        assert!(first.matched.is_none());

        let harvard = MatchFilters {
            schools: vec![School::Harvard],
            ..MatchFilters::default()
        };
        let second = handle.enter(b, harvard).await.unwrap();
        let record = second.matched.expect("b should be paired with a");
        assert_eq!(record.user1_id, b);
        assert_eq!(record.user2_id, a);
        assert_eq!(handle.count().await.unwrap(), 0);

        match rx.recv().await {
            Some(ServerToClient::MatchFound { partner_id, room_id, .. }) => {
                assert_eq!(partner_id, b);
                assert_eq!(room_id, record.room_id);
            },
            other => panic!("expected MatchFound, got {other:?}"),
        }

        let stored = storage.find_match_by_room(&record.room_id).await.unwrap();
        assert_eq!(stored.map(|m| m.id), Some(record.id));
    }

    #[tokio::test]
    async fn test_earliest_compatible_ticket_wins() {
        let (_dir, storage, _notifier, handle) = setup().await;
        let first = seed(&storage, School::Yale).await;
        let second = seed(&storage, School::Yale).await;
        let late = seed(&storage, School::Yale).await;

        // `second` only wants Cornell, so it never pairs with anyone here
        let only_cornell = MatchFilters {
            schools: vec![School::Cornell],
            ..MatchFilters::default()
        };
        handle.enter(first, MatchFilters::default()).await.unwrap();
        handle.enter(second, only_cornell).await.unwrap();
        assert_eq!(handle.count().await.unwrap(), 2);

        let record = handle
            .enter(late, MatchFilters::default())
            .await
            .unwrap()
            .matched
            .unwrap();
        assert_eq!(record.user1_id, late);
        assert_eq!(record.user2_id, first);
        assert!(handle.ticket(second).await.unwrap().is_some());
        assert_eq!(handle.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entering_queue_ends_stale_match() {
        let (_dir, storage, notifier, handle) = setup().await;
        let a = seed(&storage, School::Dartmouth).await;
        let b = seed(&storage, School::Columbia).await;

        handle.enter(a, MatchFilters::default()).await.unwrap();
        let record = handle
            .enter(b, MatchFilters::default())
            .await
            .unwrap()
            .matched
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        notifier.subscribe_match(record.id, tx);

        handle.enter(a, MatchFilters::default()).await.unwrap();
        let stored = storage.get_match(record.id).await.unwrap().unwrap();
        assert!(!stored.is_active());
        assert!(storage.active_matches_for_user(b).await.unwrap().is_empty());
        assert!(matches!(
            rx.recv().await,
            Some(ServerToClient::MatchEnded { match_id, ended_by, reason: CloseReason::Left })
                if match_id == record.id && ended_by == a
        ));
    }
}
