// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! WebSocket Handler Module
//!
//! One `WebSocketHandler` exists per connection. It binds the connection to a
//! user, forwards queue operations to the matchmaker and owns at most one
//! [`RoomSession`] at a time.
//!
//! Two channels feed the connection:
//! - `outbound` goes straight to the socket (direct replies, timer ticks,
//!   transport results).
//! - `events` receives pushes from the change notifier. The connection loop
//!   hands them back to [`WebSocketHandler::handle_event`] so room state can
//!   react (an ended match closes the room) before they are forwarded.
//!
//! Outside a room a connection may follow one match's messages with
//! `WatchMessages`, which is how post-match conversations stay live.

use protv_common::{ClientToServer, CloseReason, ServerToClient, UserId};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::notifier::SubscriptionId;
use crate::room_session::{spawn_countdown, RoomSession, QUEUE_ROUTE};
use crate::AppState;

/// Where a client without a profile is sent
pub const PROFILE_ROUTE: &str = "profile";

struct ActiveRoom {
    session: RoomSession,
    match_sub: SubscriptionId,
    timer: JoinHandle<()>,
    transport: JoinHandle<()>,
}

impl ActiveRoom {
    fn stop(self, state: &AppState) -> RoomSession {
        self.timer.abort();
        self.transport.abort();
        state
            .notifier
            .unsubscribe_match(self.session.match_id(), self.match_sub);
        self.session
    }
}

/// WebSocket handler for processing messages
pub struct WebSocketHandler {
    state: AppState,
    outbound: mpsc::Sender<ServerToClient>,
    events: mpsc::Sender<ServerToClient>,
    user_id: Option<UserId>,
    user_sub: Option<SubscriptionId>,
    count_task: Option<JoinHandle<()>>,
    room: Option<ActiveRoom>,
    watching: Option<(Uuid, SubscriptionId)>,
}

/// Translate a failed operation into what the client is shown
pub fn error_message(err: &AppError) -> ServerToClient {
    let navigate_to = match err {
        AppError::MatchNotFound(_) | AppError::MatchEnded(_) => Some(QUEUE_ROUTE),
        AppError::ProfileNotFound(_) => Some(PROFILE_ROUTE),
        _ => None,
    };

    match navigate_to {
        Some(route) => ServerToClient::Notice {
            code: err.error_code().to_string(),
            message: err.client_message(),
            navigate_to: Some(route.to_string()),
        },
        None => ServerToClient::Error {
            code: err.error_code().to_string(),
            message: err.client_message(),
        },
    }
}

impl WebSocketHandler {
    pub fn new(
        state: AppState,
        outbound: mpsc::Sender<ServerToClient>,
        events: mpsc::Sender<ServerToClient>,
    ) -> Self {
        Self {
            state,
            outbound,
            events,
            user_id: None,
            user_sub: None,
            count_task: None,
            room: None,
            watching: None,
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// The open room session, if any
    pub fn room(&self) -> Option<&RoomSession> {
        self.room.as_ref().map(|r| &r.session)
    }

    async fn send(&self, message: ServerToClient) -> Result<(), AppError> {
        self.outbound.send(message).await?;
        Ok(())
    }

    fn require_user(&self) -> Result<UserId, AppError> {
        self.user_id.ok_or(AppError::NotIdentified)
    }

    fn require_room(&mut self) -> Result<&mut ActiveRoom, AppError> {
        self.room.as_mut().ok_or(AppError::NotInRoom)
    }

    /// Process one client message
    pub async fn handle_message(&mut self, message: ClientToServer) -> Result<(), AppError> {
        debug!(user_id = ?self.user_id, ?message, "client message");
        match message {
            ClientToServer::Identify { user_id } => self.identify(user_id).await,
            ClientToServer::EnterQueue { filters } => {
                let user_id = self.require_user()?;
                self.close_room(CloseReason::Left).await?;
                let outcome = self.state.matchmaker.enter(user_id, filters).await?;
                self.send(ServerToClient::QueueEntered {
                    ticket: outcome.ticket,
                })
                .await
            },
            ClientToServer::LeaveQueue => {
                let user_id = self.require_user()?;
                self.state.matchmaker.leave(user_id).await?;
                self.send(ServerToClient::QueueLeft).await
            },
            ClientToServer::JoinRoom { room_id } => self.join_room(&room_id).await,
            ClientToServer::ExtendTime => {
                self.require_user()?;
                let reply = self.require_room()?.session.extend().await?;
                self.send(reply).await
            },
            ClientToServer::SendChat { body } => {
                self.require_user()?;
                self.require_room()?.session.send_chat(&body).await?;
                Ok(())
            },
            ClientToServer::Connect => {
                self.require_user()?;
                let (connection, created) = self.require_room()?.session.connect().await?;
                // A new connection reaches us through the room broadcast
                if !created {
                    self.send(ServerToClient::ConnectionAccepted { connection })
                        .await?;
                }
                Ok(())
            },
            ClientToServer::Report { reason } => {
                self.require_user()?;
                let closed = self.require_room()?.session.report(&reason).await?;
                self.drop_room();
                self.send(closed).await
            },
            ClientToServer::Skip => {
                self.require_user()?;
                if self.room.is_none() {
                    return self
                        .send(ServerToClient::RoomClosed {
                            reason: CloseReason::Skipped,
                            navigate_to: QUEUE_ROUTE.to_string(),
                        })
                        .await;
                }
                self.close_room(CloseReason::Skipped).await
            },
            ClientToServer::WatchMessages { match_id } => self.watch_messages(match_id).await,
            ClientToServer::UnwatchMessages => {
                self.require_user()?;
                self.unwatch();
                Ok(())
            },
        }
    }

    /// Follow a match's messages outside its room. Allowed while the match
    /// is live or once the pair is connected, like posting.
    async fn watch_messages(&mut self, match_id: Uuid) -> Result<(), AppError> {
        let user_id = self.require_user()?;
        if self.room.is_some() {
            return Err(AppError::Conflict(
                "Room messages already arrive in the room".to_string(),
            ));
        }

        let record = self
            .state
            .storage
            .get_match(match_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))?;
        let partner = record
            .counterpart(user_id)
            .ok_or(AppError::NotParticipant(user_id))?;
        if !record.is_active()
            && self
                .state
                .storage
                .find_connection(user_id, partner)
                .await?
                .is_none()
        {
            return Err(AppError::Conflict(
                "Match has ended and the users are not connected".to_string(),
            ));
        }

        self.unwatch();
        let sub = self
            .state
            .notifier
            .subscribe_match(match_id, self.events.clone());
        self.watching = Some((match_id, sub));

        let messages = self.state.storage.chat_history(match_id).await?;
        debug!(%user_id, %match_id, "watching messages");
        self.send(ServerToClient::MessageHistory { match_id, messages })
            .await
    }

    fn unwatch(&mut self) {
        if let Some((match_id, sub)) = self.watching.take() {
            self.state.notifier.unsubscribe_match(match_id, sub);
        }
    }

    async fn identify(&mut self, user_id: UserId) -> Result<(), AppError> {
        if let Some(current) = self.user_id {
            if current != user_id {
                return Err(AppError::AlreadyIdentified(current));
            }
        } else {
            self.user_id = Some(user_id);
            self.user_sub = Some(
                self.state
                    .notifier
                    .subscribe_user(user_id, self.events.clone()),
            );
            self.count_task = Some(self.spawn_count_forwarder());
            info!(%user_id, "connection identified");
        }

        let waiting = self.state.matchmaker.ticket(user_id).await?;
        self.send(ServerToClient::Identified {
            user_id,
            queue_count: self.state.notifier.queue_count(),
            waiting,
        })
        .await
    }

    /// Push every pool size change to this client
    fn spawn_count_forwarder(&self) -> JoinHandle<()> {
        let mut counts = self.state.notifier.subscribe_queue_count();
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            while counts.changed().await.is_ok() {
                let count = *counts.borrow_and_update();
                if outbound
                    .send(ServerToClient::QueueCount { count })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    async fn join_room(&mut self, room_id: &str) -> Result<(), AppError> {
        let user_id = self.require_user()?;
        if self.room().is_some_and(|s| s.room_id() == room_id) {
            return Ok(());
        }
        self.close_room(CloseReason::Left).await?;
        self.unwatch();

        let mut session = RoomSession::open(&self.state, room_id, user_id).await?;

        // A user in a room is no longer waiting
        self.state.matchmaker.leave(user_id).await?;

        let match_sub = self
            .state
            .notifier
            .subscribe_match(session.match_id(), self.events.clone());
        self.send(session.joined_message()).await?;

        let provisioning = session.begin_transport();
        let timer = spawn_countdown(session.countdown(), self.outbound.clone());
        let outbound = self.outbound.clone();
        let transport = tokio::spawn(async move {
            let result = provisioning.await;
            let _ = outbound.send(result).await;
        });

        info!(%user_id, room_id, match_id = %session.match_id(), "joined room");
        self.room = Some(ActiveRoom {
            session,
            match_sub,
            timer,
            transport,
        });
        Ok(())
    }

    /// End the current match (if any) and tell the client the room is closed
    async fn close_room(&mut self, reason: CloseReason) -> Result<(), AppError> {
        let Some(room) = self.room.as_mut() else {
            return Ok(());
        };
        let closed = room.session.end(reason).await?;
        self.drop_room();
        self.send(closed).await
    }

    fn drop_room(&mut self) {
        if let Some(room) = self.room.take() {
            let session = room.stop(&self.state);
            debug!(match_id = %session.match_id(), "room session closed");
        }
    }

    /// React to a notifier push, then forward it to the client
    pub async fn handle_event(&mut self, event: ServerToClient) -> Result<(), AppError> {
        match &event {
            ServerToClient::MatchEnded {
                match_id,
                ended_by,
                reason,
            } => {
                if self.room().is_some_and(|s| s.match_id() == *match_id) {
                    self.drop_room();
                    // Another tab of ours ended it, or the partner did
                    let message = if self.user_id == Some(*ended_by) {
                        ServerToClient::RoomClosed {
                            reason: *reason,
                            navigate_to: QUEUE_ROUTE.to_string(),
                        }
                    } else {
                        ServerToClient::PartnerLeft {
                            match_id: *match_id,
                        }
                    };
                    return self.send(message).await;
                }
                if !matches!(self.watching, Some((watched, _)) if watched == *match_id) {
                    return Ok(());
                }
            },
            ServerToClient::ConnectionAccepted { connection } => {
                if let Some(room) = self.room.as_mut() {
                    room.session.remember_connection(connection.clone());
                }
            },
            _ => {},
        }
        self.send(event).await
    }

    /// Clean up after the socket closed.
    ///
    /// Leaving a room this way counts as leaving the match. The waiting
    /// ticket is withdrawn once the user has no other live connection.
    pub async fn on_disconnect(&mut self) {
        if let Some(room) = self.room.as_mut() {
            if let Err(e) = room.session.end(CloseReason::Left).await {
                warn!(match_id = %room.session.match_id(), "failed to end match on disconnect: {e}");
            }
        }
        self.drop_room();
        self.unwatch();

        if let Some(task) = self.count_task.take() {
            task.abort();
        }

        if let (Some(user_id), Some(sub)) = (self.user_id, self.user_sub.take()) {
            let remaining = self.state.notifier.unsubscribe_user(user_id, sub);
            if remaining == 0 && !self.state.notifier.has_user_subscribers(user_id) {
                match self.state.matchmaker.leave(user_id).await {
                    Ok(true) => debug!(%user_id, "ticket withdrawn after disconnect"),
                    Ok(false) => {},
                    Err(e) => warn!(%user_id, "failed to withdraw ticket: {e}"),
                }
            }
            info!(%user_id, "connection closed");
        }
    }
}

impl Drop for WebSocketHandler {
    fn drop(&mut self) {
        if let Some(task) = self.count_task.take() {
            task.abort();
        }
        if let Some(room) = self.room.take() {
            room.stop(&self.state);
        }
        self.unwatch();
    }
}
