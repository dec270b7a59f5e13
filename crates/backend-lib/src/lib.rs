// ============================
// crates/backend-lib/src/lib.rs
// ============================
//! Core backend-lib functionality for the `ProTV` matchmaking server.

pub mod config;
pub mod error;
pub mod filter;
pub mod handlers;
pub mod matchmaker;
pub mod metrics;
pub mod notifier;
pub mod room_id;
pub mod room_session;
pub mod storage;
pub mod validation;
pub mod video;
pub mod websocket;
pub mod ws_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::matchmaker::MatchmakerHandle;
use crate::notifier::ChangeNotifier;
use crate::storage::{FlatFileStorage, Storage};
use crate::video::{DailyProvisioner, UnconfiguredProvisioner, VideoProvisioner};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Settings
    pub settings: Arc<Settings>,
    /// Storage backend
    pub storage: Arc<dyn Storage>,
    /// Queue count and per-user / per-match push channels
    pub notifier: Arc<ChangeNotifier>,
    /// Owner of the waiting pool
    pub matchmaker: MatchmakerHandle,
    /// Video room provider
    pub video: Arc<dyn VideoProvisioner>,
}

impl AppState {
    /// Create a new application state and start the matchmaker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        storage: Arc<dyn Storage>,
        video: Arc<dyn VideoProvisioner>,
        settings: Settings,
    ) -> Self {
        let notifier = Arc::new(ChangeNotifier::new());
        let matchmaker =
            MatchmakerHandle::spawn(storage.clone(), notifier.clone(), settings.sweep_interval());

        Self {
            settings: Arc::new(settings),
            storage,
            notifier,
            matchmaker,
            video,
        }
    }

    /// Flat-file storage and the video provider picked from `settings`
    pub fn from_settings(settings: Settings) -> anyhow::Result<Self> {
        let storage = Arc::new(FlatFileStorage::new(&settings.storage.path)?);
        let video = video_provisioner(&settings)?;
        Ok(Self::new(storage, video, settings))
    }
}

/// Daily.co when an API key is configured, otherwise a provisioner that
/// always fails so rooms run in their degraded mode
pub fn video_provisioner(settings: &Settings) -> anyhow::Result<Arc<dyn VideoProvisioner>> {
    match settings.video.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => Ok(Arc::new(DailyProvisioner::new(&settings.video, key)?)),
        None => {
            tracing::warn!("no video API key configured; rooms will run without video");
            Ok(Arc::new(UnconfiguredProvisioner))
        },
    }
}
