//! Test utilities shared by the integration tests
//!
//! Builds an `AppState` over a temporary flat-file store with a scripted
//! video provisioner, and wraps a `WebSocketHandler` in a `TestClient` that
//! behaves like one connection of the real router.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use protv_backend_lib::{
    config::Settings,
    error::AppError,
    storage::{FlatFileStorage, Storage},
    video::{VideoProvisioner, VideoRoom},
    websocket::WebSocketHandler,
    AppState,
};
use protv_common::{
    ChatMessage, ClientToServer, Connection, MatchFilters, MatchRecord, Profile, Report, School,
    ServerToClient, UserId,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Video provisioner that records calls and can be told to fail
#[derive(Default)]
pub struct MockProvisioner {
    pub fail: bool,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl MockProvisioner {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl VideoProvisioner for MockProvisioner {
    async fn create_room(&self, name: &str) -> Result<VideoRoom, AppError> {
        if self.fail {
            return Err(AppError::Transport("scripted failure".to_string()));
        }
        self.created.lock().push(name.to_string());
        Ok(VideoRoom {
            name: name.to_string(),
            url: format!("https://video.test/{name}"),
        })
    }

    async fn delete_room(&self, name: &str) -> Result<(), AppError> {
        self.deleted.lock().push(name.to_string());
        Ok(())
    }
}

/// Flat-file store whose match inserts and match endings can be switched off
pub struct FlakyStorage {
    pub inner: FlatFileStorage,
    pub fail_inserts: AtomicBool,
    pub fail_ends: AtomicBool,
}

impl FlakyStorage {
    pub fn new(inner: FlatFileStorage) -> Self {
        Self {
            inner,
            fail_inserts: AtomicBool::new(false),
            fail_ends: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>, AppError> {
        self.inner.get_profile(user_id).await
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), AppError> {
        self.inner.upsert_profile(profile).await
    }

    async fn insert_match(&self, record: &MatchRecord) -> Result<(), AppError> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Internal("insert refused".to_string()));
        }
        self.inner.insert_match(record).await
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRecord>, AppError> {
        self.inner.get_match(match_id).await
    }

    async fn find_match_by_room(&self, room_id: &str) -> Result<Option<MatchRecord>, AppError> {
        self.inner.find_match_by_room(room_id).await
    }

    async fn active_matches_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<MatchRecord>, AppError> {
        self.inner.active_matches_for_user(user_id).await
    }

    async fn latest_match_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<MatchRecord>, AppError> {
        self.inner.latest_match_between(a, b).await
    }

    async fn end_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(MatchRecord, bool), AppError> {
        if self.fail_ends.load(Ordering::SeqCst) {
            return Err(AppError::Internal("end refused".to_string()));
        }
        self.inner.end_match(match_id, at).await
    }

    async fn append_chat_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        self.inner.append_chat_message(message).await
    }

    async fn chat_history(&self, match_id: Uuid) -> Result<Vec<ChatMessage>, AppError> {
        self.inner.chat_history(match_id).await
    }

    async fn connect_users(&self, a: UserId, b: UserId) -> Result<(Connection, bool), AppError> {
        self.inner.connect_users(a, b).await
    }

    async fn find_connection(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Connection>, AppError> {
        self.inner.find_connection(a, b).await
    }

    async fn connections_for_user(&self, user_id: UserId) -> Result<Vec<Connection>, AppError> {
        self.inner.connections_for_user(user_id).await
    }

    async fn insert_report(&self, report: &Report) -> Result<(), AppError> {
        self.inner.insert_report(report).await
    }

    async fn reports_for_match(&self, match_id: Uuid) -> Result<Vec<Report>, AppError> {
        self.inner.reports_for_match(match_id).await
    }
}

pub struct TestEnv {
    pub state: AppState,
    pub storage: Arc<dyn Storage>,
    pub video: Arc<MockProvisioner>,
    pub temp_dir: TempDir,
}

pub fn test_settings(temp_dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.storage.path = temp_dir.path().to_path_buf();
    // Long enough that only explicit pairing attempts run during a test
    settings.matchmaking.sweep_interval_secs = 3600;
    settings
}

/// Sets up a test environment with a temporary store and a working video mock
///
/// Keep `TestEnv::temp_dir` in scope for the whole test.
pub async fn setup() -> TestEnv {
    setup_with(MockProvisioner::default()).await
}

pub async fn setup_with(video: MockProvisioner) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let storage: Arc<dyn Storage> = Arc::new(FlatFileStorage::new(temp_dir.path()).unwrap());
    let video = Arc::new(video);
    let state = AppState::new(storage.clone(), video.clone(), test_settings(&temp_dir));
    TestEnv {
        state,
        storage,
        video,
        temp_dir,
    }
}

/// Store a profile and return it
pub async fn seed_profile(storage: &dyn Storage, school: School, major: &str) -> Profile {
    let profile = Profile {
        id: Uuid::new_v4(),
        full_name: format!("{school} Student"),
        school,
        major: major.to_string(),
        class_year: 2026,
        interests: vec!["tennis".to_string()],
        avatar_url: None,
    };
    storage.upsert_profile(&profile).await.unwrap();
    profile
}

pub fn only_schools(schools: &[School]) -> MatchFilters {
    MatchFilters {
        schools: schools.to_vec(),
        ..MatchFilters::default()
    }
}

/// One simulated WebSocket connection
pub struct TestClient {
    pub handler: WebSocketHandler,
    outbound_rx: mpsc::Receiver<ServerToClient>,
    events_rx: mpsc::Receiver<ServerToClient>,
}

impl TestClient {
    pub fn connect(state: &AppState) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            handler: WebSocketHandler::new(state.clone(), outbound_tx, events_tx),
            outbound_rx,
            events_rx,
        }
    }

    /// Connect and identify, consuming the `Identified` reply
    pub async fn identified(state: &AppState, user_id: UserId) -> Self {
        let mut client = Self::connect(state);
        client
            .send(ClientToServer::Identify { user_id })
            .await
            .unwrap();
        client
            .expect(|m| matches!(m, ServerToClient::Identified { .. }))
            .await;
        client
    }

    pub async fn send(&mut self, message: ClientToServer) -> Result<(), AppError> {
        self.handler.handle_message(message).await
    }

    /// Next message for the client, routing notifier pushes through the
    /// handler the way the connection loop does
    pub async fn recv(&mut self) -> ServerToClient {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                tokio::select! {
                    biased;
                    Some(message) = self.outbound_rx.recv() => return message,
                    Some(event) = self.events_rx.recv() => {
                        self.handler.handle_event(event).await.unwrap();
                    },
                }
            }
        })
        .await
        .expect("timed out waiting for a server message")
    }

    /// Skip messages until one matches
    pub async fn expect<F>(&mut self, pred: F) -> ServerToClient
    where
        F: Fn(&ServerToClient) -> bool,
    {
        loop {
            let message = self.recv().await;
            if pred(&message) {
                return message;
            }
        }
    }

    /// Everything that arrives within `wait`
    pub async fn drain(&mut self, wait: Duration) -> Vec<ServerToClient> {
        let mut messages = Vec::new();
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            tokio::select! {
                biased;
                Some(message) = self.outbound_rx.recv() => messages.push(message),
                Some(event) = self.events_rx.recv() => {
                    self.handler.handle_event(event).await.unwrap();
                },
                _ = tokio::time::sleep_until(deadline) => return messages,
            }
        }
    }

    pub async fn disconnect(mut self) {
        self.handler.on_disconnect().await;
    }
}

/// Pair two fresh users and put both in the room.
///
/// Returns the clients (first entered first) and the match.
pub async fn paired_in_room(env: &TestEnv) -> (TestClient, TestClient, MatchRecord) {
    let a = seed_profile(env.storage.as_ref(), School::Harvard, "Economics").await;
    let b = seed_profile(env.storage.as_ref(), School::Princeton, "History").await;
    let mut client_a = TestClient::identified(&env.state, a.id).await;
    let mut client_b = TestClient::identified(&env.state, b.id).await;

    client_a
        .send(ClientToServer::EnterQueue {
            filters: MatchFilters::default(),
        })
        .await
        .unwrap();
    client_b
        .send(ClientToServer::EnterQueue {
            filters: MatchFilters::default(),
        })
        .await
        .unwrap();

    let room_id = match client_a
        .expect(|m| matches!(m, ServerToClient::MatchFound { .. }))
        .await
    {
        ServerToClient::MatchFound { room_id, .. } => room_id,
        _ => unreachable!(),
    };
    client_b
        .expect(|m| matches!(m, ServerToClient::MatchFound { .. }))
        .await;

    for client in [&mut client_a, &mut client_b] {
        client
            .send(ClientToServer::JoinRoom {
                room_id: room_id.clone(),
            })
            .await
            .unwrap();
        client
            .expect(|m| matches!(m, ServerToClient::RoomJoined { .. }))
            .await;
    }

    let record = env
        .storage
        .find_match_by_room(&room_id)
        .await
        .unwrap()
        .unwrap();
    (client_a, client_b, record)
}
