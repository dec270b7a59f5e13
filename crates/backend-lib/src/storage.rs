// ============================
// crates/backend-lib/src/storage.rs
// ============================
//! Storage abstraction with flat-file implementation.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use protv_common::{
    ChatMessage, Connection, ConnectionStatus, MatchRecord, MatchStatus, Profile, Report, UserId,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{fs as tokio_fs, io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::error::AppError;

/// Trait for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>, AppError>;

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), AppError>;

    /// Persist a new match. Fails with `Conflict` if the room id is already taken.
    async fn insert_match(&self, record: &MatchRecord) -> Result<(), AppError>;

    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRecord>, AppError>;

    async fn find_match_by_room(&self, room_id: &str) -> Result<Option<MatchRecord>, AppError>;

    async fn active_matches_for_user(&self, user_id: UserId)
        -> Result<Vec<MatchRecord>, AppError>;

    /// Most recent match between two users, active or not
    async fn latest_match_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<MatchRecord>, AppError>;

    /// Transition a match to `ended`.
    ///
    /// Returns the stored record and whether this call changed it; ending an
    /// already ended match leaves `ended_at` untouched.
    async fn end_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(MatchRecord, bool), AppError>;

    async fn append_chat_message(&self, message: &ChatMessage) -> Result<(), AppError>;

    /// Messages of a match in creation order
    async fn chat_history(&self, match_id: Uuid) -> Result<Vec<ChatMessage>, AppError>;

    /// Create an accepted connection between two users, or return the existing one.
    ///
    /// The flag is `true` when a new row was written.
    async fn connect_users(&self, a: UserId, b: UserId) -> Result<(Connection, bool), AppError>;

    async fn find_connection(&self, a: UserId, b: UserId)
        -> Result<Option<Connection>, AppError>;

    async fn connections_for_user(&self, user_id: UserId) -> Result<Vec<Connection>, AppError>;

    async fn insert_report(&self, report: &Report) -> Result<(), AppError>;

    async fn reports_for_match(&self, match_id: Uuid) -> Result<Vec<Report>, AppError>;
}

/// Flat-file implementation of the Storage trait
///
/// ```text
/// <root>/profiles/<user_id>.json
/// <root>/matches/<match_id>.json
/// <root>/rooms/<room_id>            (match id)
/// <root>/active/<user_id>.json      (ids of the user's active matches)
/// <root>/pairs/<lo>_<hi>            (latest match id of the pair)
/// <root>/chat/<match_id>.log        (JSON lines)
/// <root>/connections.log            (JSON lines)
/// <root>/reports.log                (JSON lines)
/// ```
#[derive(Clone)]
pub struct FlatFileStorage {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["profiles", "matches", "rooms", "chat", "active", "pairs"] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn profile_path(&self, user_id: UserId) -> PathBuf {
        self.root.join("profiles").join(format!("{user_id}.json"))
    }

    fn match_path(&self, match_id: Uuid) -> PathBuf {
        self.root.join("matches").join(format!("{match_id}.json"))
    }

    fn room_path(&self, room_id: &str) -> PathBuf {
        self.root.join("rooms").join(room_id)
    }

    fn active_path(&self, user_id: UserId) -> PathBuf {
        self.root.join("active").join(format!("{user_id}.json"))
    }

    fn pair_path(&self, a: UserId, b: UserId) -> PathBuf {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.root.join("pairs").join(format!("{lo}_{hi}"))
    }

    fn chat_path(&self, match_id: Uuid) -> PathBuf {
        self.root.join("chat").join(format!("{match_id}.log"))
    }

    fn connections_path(&self) -> PathBuf {
        self.root.join("connections.log")
    }

    fn reports_path(&self) -> PathBuf {
        self.root.join("reports.log")
    }

    async fn read_connections(&self) -> Result<Vec<Connection>, AppError> {
        read_lines(&self.connections_path()).await
    }

    async fn active_ids(&self, user_id: UserId) -> Result<Vec<Uuid>, AppError> {
        Ok(read_json(&self.active_path(user_id)).await?.unwrap_or_default())
    }

    /// Caller holds `write_lock`
    async fn update_active_ids<F>(&self, user_id: UserId, update: F) -> Result<(), AppError>
    where
        F: FnOnce(&mut Vec<Uuid>) + Send,
    {
        let mut ids = self.active_ids(user_id).await?;
        update(&mut ids);
        let path = self.active_path(user_id);
        if ids.is_empty() {
            match tokio_fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            write_json(&path, &ids).await
        }
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AppError> {
    match tokio_fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a temp file so readers never see a half-written record
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    tokio_fs::write(&tmp, json).await?;
    tokio_fs::rename(&tmp, path).await?;
    Ok(())
}

async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let line = serde_json::to_string(value)?;
    let mut file = tokio_fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, AppError> {
    let content = match tokio_fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(AppError::from))
        .collect()
}

#[async_trait]
impl Storage for FlatFileStorage {
    async fn get_profile(&self, user_id: UserId) -> Result<Option<Profile>, AppError> {
        read_json(&self.profile_path(user_id)).await
    }

    async fn upsert_profile(&self, profile: &Profile) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        write_json(&self.profile_path(profile.id), profile).await
    }

    async fn insert_match(&self, record: &MatchRecord) -> Result<(), AppError> {
        if record.user1_id == record.user2_id {
            return Err(AppError::Conflict(
                "A match needs two distinct users".to_string(),
            ));
        }

        let _guard = self.write_lock.lock().await;
        let room_path = self.room_path(&record.room_id);
        if tokio_fs::try_exists(&room_path).await? {
            return Err(AppError::Conflict(format!(
                "Room {} is already taken",
                record.room_id
            )));
        }

        write_json(&self.match_path(record.id), record).await?;
        tokio_fs::write(&room_path, record.id.to_string()).await?;
        if record.is_active() {
            for user_id in [record.user1_id, record.user2_id] {
                self.update_active_ids(user_id, |ids| ids.push(record.id))
                    .await?;
            }
        }
        tokio_fs::write(
            self.pair_path(record.user1_id, record.user2_id),
            record.id.to_string(),
        )
        .await?;
        Ok(())
    }

    async fn get_match(&self, match_id: Uuid) -> Result<Option<MatchRecord>, AppError> {
        read_json(&self.match_path(match_id)).await
    }

    async fn find_match_by_room(&self, room_id: &str) -> Result<Option<MatchRecord>, AppError> {
        let raw = match tokio_fs::read_to_string(self.room_path(room_id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let match_id = Uuid::parse_str(raw.trim())
            .map_err(|e| AppError::Internal(format!("Corrupt room index {room_id}: {e}")))?;
        self.get_match(match_id).await
    }

    async fn active_matches_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<MatchRecord>, AppError> {
        let mut active = Vec::new();
        for match_id in self.active_ids(user_id).await? {
            if let Some(record) = self.get_match(match_id).await? {
                if record.is_active() && record.involves(user_id) {
                    active.push(record);
                }
            }
        }

        active.sort_by_key(|m| m.created_at);
        Ok(active)
    }

    async fn latest_match_between(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<MatchRecord>, AppError> {
        let raw = match tokio_fs::read_to_string(self.pair_path(a, b)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let match_id = Uuid::parse_str(raw.trim())
            .map_err(|e| AppError::Internal(format!("Corrupt pair index: {e}")))?;
        self.get_match(match_id).await
    }

    async fn end_match(
        &self,
        match_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(MatchRecord, bool), AppError> {
        let _guard = self.write_lock.lock().await;
        let path = self.match_path(match_id);
        let mut record: MatchRecord = read_json(&path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))?;

        if !record.is_active() {
            return Ok((record, false));
        }

        record.status = MatchStatus::Ended;
        record.ended_at = Some(at);
        write_json(&path, &record).await?;
        for user_id in [record.user1_id, record.user2_id] {
            self.update_active_ids(user_id, |ids| ids.retain(|id| *id != match_id))
                .await?;
        }
        Ok((record, true))
    }

    async fn append_chat_message(&self, message: &ChatMessage) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.chat_path(message.match_id), message).await
    }

    async fn chat_history(&self, match_id: Uuid) -> Result<Vec<ChatMessage>, AppError> {
        read_lines(&self.chat_path(match_id)).await
    }

    async fn connect_users(&self, a: UserId, b: UserId) -> Result<(Connection, bool), AppError> {
        if a == b {
            return Err(AppError::Conflict(
                "Cannot connect a user with themselves".to_string(),
            ));
        }

        // Both orderings are checked under the lock so simultaneous requests
        // from either side end up with a single row.
        let _guard = self.write_lock.lock().await;
        if let Some(existing) = self
            .read_connections()
            .await?
            .into_iter()
            .find(|c| c.links(a, b))
        {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let connection = Connection {
            id: Uuid::new_v4(),
            user1_id: a,
            user2_id: b,
            status: ConnectionStatus::Accepted,
            created_at: now,
            updated_at: now,
        };
        append_line(&self.connections_path(), &connection).await?;
        Ok((connection, true))
    }

    async fn find_connection(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Option<Connection>, AppError> {
        Ok(self
            .read_connections()
            .await?
            .into_iter()
            .find(|c| c.links(a, b)))
    }

    async fn connections_for_user(&self, user_id: UserId) -> Result<Vec<Connection>, AppError> {
        let mut connections: Vec<Connection> = self
            .read_connections()
            .await?
            .into_iter()
            .filter(|c| c.involves(user_id))
            .collect();
        connections.sort_by(|x, y| y.updated_at.cmp(&x.updated_at));
        Ok(connections)
    }

    async fn insert_report(&self, report: &Report) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        append_line(&self.reports_path(), report).await
    }

    async fn reports_for_match(&self, match_id: Uuid) -> Result<Vec<Report>, AppError> {
        let reports: Vec<Report> = read_lines(&self.reports_path()).await?;
        Ok(reports
            .into_iter()
            .filter(|r| r.match_id == Some(match_id))
            .collect())
    }
}
