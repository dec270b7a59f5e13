// ============================
// crates/backend-lib/src/video.rs
// ============================
//! Video room provisioning.
//!
//! Both participants of a match ask for the same room name. The first call
//! creates the room; the second finds it already there and reuses it.
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::{config::VideoSettings, error::AppError};

/// A provisioned two-party video room
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VideoRoom {
    pub name: String,
    pub url: String,
}

#[async_trait]
pub trait VideoProvisioner: Send + Sync {
    /// Create (or reuse) the room called `name`
    async fn create_room(&self, name: &str) -> Result<VideoRoom, AppError>;

    /// Tear the room down; a room that no longer exists is not an error
    async fn delete_room(&self, name: &str) -> Result<(), AppError>;
}

/// Daily.co REST client
pub struct DailyProvisioner {
    client: Client,
    api_url: String,
    api_key: String,
    max_participants: u32,
    room_expiry_secs: u64,
}

impl DailyProvisioner {
    pub fn new(settings: &VideoSettings, api_key: &str) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            max_participants: settings.max_participants,
            room_expiry_secs: settings.room_expiry_secs,
        })
    }

    fn room_request_body(&self, name: &str) -> serde_json::Value {
        let exp = Utc::now().timestamp() + self.room_expiry_secs as i64;
        json!({
            "name": name,
            "properties": {
                "max_participants": self.max_participants,
                "enable_chat": false,
                "enable_screenshare": false,
                "enable_recording": false,
                "exp": exp,
            }
        })
    }

    async fn get_room(&self, name: &str) -> Result<VideoRoom, AppError> {
        let response = self
            .client
            .get(format!("{}/rooms/{}", self.api_url, name))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(AppError::Transport(format!(
                "room lookup for {name} failed with {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl VideoProvisioner for DailyProvisioner {
    async fn create_room(&self, name: &str) -> Result<VideoRoom, AppError> {
        let response = self
            .client
            .post(format!("{}/rooms", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&self.room_request_body(name))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(room = name, "video room created");
            return Ok(response.json().await?);
        }

        // The partner usually created it a moment ago
        let body = response.text().await.unwrap_or_default();
        if room_already_exists(status, &body) {
            debug!(room = name, %status, "create refused, looking up existing room");
            return self.get_room(name).await;
        }

        warn!(room = name, %status, "video room creation failed: {body}");
        Err(AppError::Transport(format!(
            "room creation failed with {status}: {body}"
        )))
    }

    async fn delete_room(&self, name: &str) -> Result<(), AppError> {
        let response = self
            .client
            .delete(format!("{}/rooms/{}", self.api_url, name))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(AppError::Transport(format!(
                "room deletion failed with {status}"
            )))
        }
    }
}

/// Whether a refused create means the name is already taken.
///
/// The provider answers a duplicate name with 400 and an `info` text
/// saying so; any other 400 is a real rejection of the request.
fn room_already_exists(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::CONFLICT {
        return true;
    }
    if status != StatusCode::BAD_REQUEST {
        return false;
    }

    let info = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("info").and_then(|i| i.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    info.to_ascii_lowercase().contains("already exists")
}

/// Provisioner used when no API key is configured
#[derive(Debug, Default, Clone)]
pub struct UnconfiguredProvisioner;

#[async_trait]
impl VideoProvisioner for UnconfiguredProvisioner {
    async fn create_room(&self, _name: &str) -> Result<VideoRoom, AppError> {
        Err(AppError::Transport(
            "video provider is not configured".to_string(),
        ))
    }

    async fn delete_room(&self, _name: &str) -> Result<(), AppError> {
        Ok(())
    }
}
