// ============================
// crates/backend-lib/src/room_session.rs
// ============================
//! Per-connection room session: countdown, video transport, chat, connect,
//! report and skip for one participant of one match.
//!
//! The countdown lives behind a mutex shared with a ticker task so it keeps
//! running while the session waits on the store or the video provider.
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use protv_common::{
    ChatMessage, CloseReason, Connection, MatchRecord, Profile, Report, ServerToClient, UserId,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::RoomSettings,
    error::AppError,
    metrics::{CHAT_SENT, MATCH_ENDED, REPORT_FILED, TRANSPORT_FAILED},
    notifier::ChangeNotifier,
    storage::Storage,
    validation::{validate_chat_body, validate_report_reason},
    video::VideoProvisioner,
    AppState,
};

/// Where every closed room sends the client
pub const QUEUE_ROUTE: &str = "queue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomPhase {
    Initializing,
    InCall,
    Ending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    NotRequested,
    Pending,
    Ready { url: String },
    Failed { reason: String },
}

/// Outcome of one countdown step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Remaining(u32),
    /// Reached zero on this step
    Expired,
    /// Already at zero
    Idle,
}

#[derive(Debug, Clone)]
pub struct Countdown {
    remaining: u32,
    extension: u32,
    extended: bool,
}

impl Countdown {
    pub fn new(start: u32, extension: u32) -> Self {
        Self {
            remaining: start,
            extension,
            extended: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn extended(&self) -> bool {
        self.extended
    }

    pub fn tick(&mut self) -> Tick {
        match self.remaining {
            0 => Tick::Idle,
            1 => {
                self.remaining = 0;
                Tick::Expired
            },
            n => {
                self.remaining = n - 1;
                Tick::Remaining(self.remaining)
            },
        }
    }

    /// Add the extension once; returns the new remaining time
    pub fn extend(&mut self) -> Option<u32> {
        if self.extended {
            return None;
        }
        self.extended = true;
        self.remaining = self.remaining.saturating_add(self.extension);
        Some(self.remaining)
    }
}

/// Drive a countdown once per second, pushing ticks to the client
pub fn spawn_countdown(
    countdown: Arc<Mutex<Countdown>>,
    outbound: mpsc::Sender<ServerToClient>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let tick = countdown.lock().tick();
            let messages = match tick {
                Tick::Remaining(remaining_secs) => vec![ServerToClient::TimerTick { remaining_secs }],
                Tick::Expired => vec![
                    ServerToClient::TimerTick { remaining_secs: 0 },
                    ServerToClient::TimeUp,
                ],
                Tick::Idle => continue,
            };

            for msg in messages {
                if outbound.send(msg).await.is_err() {
                    return;
                }
            }
        }
    })
}

/// Allocate the video room and record the outcome.
///
/// A failure leaves the session usable; the client is told and can still
/// skip or report.
pub async fn provision_transport(
    video: Arc<dyn VideoProvisioner>,
    room_id: String,
    state: Arc<Mutex<TransportState>>,
) -> ServerToClient {
    match video.create_room(&room_id).await {
        Ok(room) => {
            debug!(%room_id, "video transport ready");
            *state.lock() = TransportState::Ready {
                url: room.url.clone(),
            };
            ServerToClient::TransportReady { url: room.url }
        },
        Err(e) => {
            warn!(%room_id, "video transport failed: {e}");
            counter!(TRANSPORT_FAILED).increment(1);
            let message = e.sanitized_message();
            *state.lock() = TransportState::Failed {
                reason: e.to_string(),
            };
            ServerToClient::TransportFailed { message }
        },
    }
}

pub struct RoomSession {
    storage: Arc<dyn Storage>,
    notifier: Arc<ChangeNotifier>,
    video: Arc<dyn VideoProvisioner>,
    me: UserId,
    record: MatchRecord,
    partner: Option<Profile>,
    phase: RoomPhase,
    transport: Arc<Mutex<TransportState>>,
    countdown: Arc<Mutex<Countdown>>,
    connection: Option<Connection>,
    filed_report: Option<Report>,
}

impl RoomSession {
    /// Open the session for `room_id` as `me`.
    ///
    /// Unknown rooms, ended matches and rooms `me` is not part of are all
    /// reported as `MatchNotFound`.
    pub async fn open(state: &AppState, room_id: &str, me: UserId) -> Result<Self, AppError> {
        Self::open_with(
            state.storage.clone(),
            state.notifier.clone(),
            state.video.clone(),
            &state.settings.room,
            room_id,
            me,
        )
        .await
    }

    pub async fn open_with(
        storage: Arc<dyn Storage>,
        notifier: Arc<ChangeNotifier>,
        video: Arc<dyn VideoProvisioner>,
        settings: &RoomSettings,
        room_id: &str,
        me: UserId,
    ) -> Result<Self, AppError> {
        let record = storage
            .find_match_by_room(room_id)
            .await?
            .filter(|m| m.is_active() && m.involves(me))
            .ok_or_else(|| AppError::MatchNotFound(room_id.to_string()))?;

        let partner_id = record
            .counterpart(me)
            .ok_or(AppError::NotParticipant(me))?;
        let partner = storage.get_profile(partner_id).await?;
        let connection = storage.find_connection(me, partner_id).await?;

        debug!(%room_id, user_id = %me, "room session opened");
        Ok(Self {
            storage,
            notifier,
            video,
            me,
            record,
            partner,
            phase: RoomPhase::Initializing,
            transport: Arc::new(Mutex::new(TransportState::NotRequested)),
            countdown: Arc::new(Mutex::new(Countdown::new(
                settings.countdown_secs,
                settings.extension_secs,
            ))),
            connection,
            filed_report: None,
        })
    }

    pub fn match_record(&self) -> &MatchRecord {
        &self.record
    }

    pub fn match_id(&self) -> Uuid {
        self.record.id
    }

    pub fn room_id(&self) -> &str {
        &self.record.room_id
    }

    pub fn partner_id(&self) -> UserId {
        self.record
            .counterpart(self.me)
            .unwrap_or(self.record.user2_id)
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.lock().clone()
    }

    pub fn countdown(&self) -> Arc<Mutex<Countdown>> {
        self.countdown.clone()
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    /// Snapshot sent to the client once the session is open
    pub fn joined_message(&self) -> ServerToClient {
        let countdown = self.countdown.lock();
        ServerToClient::RoomJoined {
            match_record: self.record.clone(),
            partner: self.partner.clone(),
            remaining_secs: countdown.remaining(),
            extended: countdown.extended(),
            connection: self.connection.clone(),
        }
    }

    /// Move into the call. The countdown may start once this returns; the
    /// returned future performs the provisioning call.
    pub fn begin_transport(
        &mut self,
    ) -> impl std::future::Future<Output = ServerToClient> + Send + 'static {
        self.phase = RoomPhase::InCall;
        *self.transport.lock() = TransportState::Pending;
        provision_transport(
            self.video.clone(),
            self.record.room_id.clone(),
            self.transport.clone(),
        )
    }

    fn ensure_open(&self) -> Result<(), AppError> {
        if self.phase == RoomPhase::Ending {
            return Err(AppError::NotInRoom);
        }
        Ok(())
    }

    /// The match may have been ended from another connection since this
    /// session opened; the store is the source of truth.
    async fn ensure_live(&self) -> Result<(), AppError> {
        self.ensure_open()?;
        match self.storage.get_match(self.record.id).await? {
            Some(record) if record.is_active() => Ok(()),
            _ => Err(AppError::MatchEnded(self.record.id)),
        }
    }

    pub async fn extend(&self) -> Result<ServerToClient, AppError> {
        self.ensure_live().await?;
        Ok(match self.countdown.lock().extend() {
            Some(remaining_secs) => {
                debug!(match_id = %self.record.id, remaining_secs, "countdown extended");
                ServerToClient::TimeExtended { remaining_secs }
            },
            None => ServerToClient::ExtendRejected,
        })
    }

    /// Store a chat message and push it to everyone in the room
    pub async fn send_chat(&self, body: &str) -> Result<ChatMessage, AppError> {
        let body = validate_chat_body(body)?;
        self.ensure_live().await?;
        let message = ChatMessage {
            id: Uuid::new_v4(),
            match_id: self.record.id,
            sender_id: self.me,
            body: body.to_string(),
            created_at: Utc::now(),
        };

        self.storage.append_chat_message(&message).await?;
        counter!(CHAT_SENT).increment(1);
        self.notifier.publish_to_match(
            self.record.id,
            ServerToClient::Chat {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    /// Connect with the partner. Returns the connection and whether it is new.
    pub async fn connect(&mut self) -> Result<(Connection, bool), AppError> {
        self.ensure_live().await?;
        if let Some(existing) = &self.connection {
            return Ok((existing.clone(), false));
        }

        let (connection, created) = self
            .storage
            .connect_users(self.me, self.partner_id())
            .await?;
        if created {
            info!(connection_id = %connection.id, match_id = %self.record.id, "users connected");
            self.notifier.publish_to_match(
                self.record.id,
                ServerToClient::ConnectionAccepted {
                    connection: connection.clone(),
                },
            );
        }
        self.connection = Some(connection.clone());
        Ok((connection, created))
    }

    /// Cache a connection the partner created
    pub fn remember_connection(&mut self, connection: Connection) {
        if connection.links(self.me, self.partner_id()) {
            self.connection = Some(connection);
        }
    }

    /// End the match and close the session. Safe to call more than once.
    pub async fn end(&mut self, reason: CloseReason) -> Result<ServerToClient, AppError> {
        let closed = ServerToClient::RoomClosed {
            reason,
            navigate_to: QUEUE_ROUTE.to_string(),
        };
        if self.phase == RoomPhase::Ending {
            return Ok(closed);
        }

        let (record, changed) = self.storage.end_match(self.record.id, Utc::now()).await?;
        self.record = record;
        self.phase = RoomPhase::Ending;

        if changed {
            counter!(MATCH_ENDED).increment(1);
            info!(
                match_id = %self.record.id,
                user_id = %self.me,
                ?reason,
                "match ended"
            );
            // Every connection in the room, the partner's and our own other
            // tabs, closes on this
            self.notifier.publish_to_match(
                self.record.id,
                ServerToClient::MatchEnded {
                    match_id: self.record.id,
                    ended_by: self.me,
                    reason,
                },
            );
            if let Err(e) = self.video.delete_room(&self.record.room_id).await {
                warn!(room_id = %self.record.room_id, "video room teardown failed: {e}");
            }
        }

        Ok(closed)
    }

    /// File a report against the partner, then leave.
    ///
    /// A session files at most one report; retrying after a failed close only
    /// retries the close.
    pub async fn report(&mut self, reason: &str) -> Result<ServerToClient, AppError> {
        self.ensure_open()?;
        let reason = validate_report_reason(reason)?;

        if self.filed_report.is_none() {
            let report = Report {
                id: Uuid::new_v4(),
                reporter_id: self.me,
                reported_user_id: self.partner_id(),
                match_id: Some(self.record.id),
                reason: reason.to_string(),
                created_at: Utc::now(),
            };

            self.storage.insert_report(&report).await?;
            counter!(REPORT_FILED).increment(1);
            info!(match_id = %self.record.id, reporter = %self.me, "report filed");
            self.filed_report = Some(report);
        }

        self.end(CloseReason::Reported).await
    }

    pub fn filed_report(&self) -> Option<&Report> {
        self.filed_report.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_runs_to_zero_once() {
        let mut countdown = Countdown::new(2, 60);
        assert_eq!(countdown.tick(), Tick::Remaining(1));
        assert_eq!(countdown.tick(), Tick::Expired);
        assert_eq!(countdown.tick(), Tick::Idle);
        assert_eq!(countdown.remaining(), 0);
    }

    #[test]
    fn test_extend_only_once() {
        let mut countdown = Countdown::new(60, 60);
        for _ in 0..25 {
            countdown.tick();
        }
        assert_eq!(countdown.remaining(), 35);
        assert_eq!(countdown.extend(), Some(95));
        assert!(countdown.extended());
        assert_eq!(countdown.extend(), None);
        assert_eq!(countdown.remaining(), 95);
    }

    #[test]
    fn test_extend_after_expiry_restarts_countdown() {
        let mut countdown = Countdown::new(1, 60);
        assert_eq!(countdown.tick(), Tick::Expired);
        assert_eq!(countdown.extend(), Some(60));
        assert_eq!(countdown.tick(), Tick::Remaining(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_task_ticks_every_second() {
        let countdown = Arc::new(Mutex::new(Countdown::new(3, 60)));
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn_countdown(countdown.clone(), tx);

        assert!(matches!(
            rx.recv().await,
            Some(ServerToClient::TimerTick { remaining_secs: 2 })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ServerToClient::TimerTick { remaining_secs: 1 })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ServerToClient::TimerTick { remaining_secs: 0 })
        ));
        assert!(matches!(rx.recv().await, Some(ServerToClient::TimeUp)));

        task.abort();
    }
}
