//! SQLite persistence: allow-listed channels and append-only usage records.

use chrono::{DateTime, Utc};
use lumi_channels::{ChannelId, GuildId, SenderId};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Guild id recorded for usage that happened in direct messages.
pub const DIRECT_MESSAGE_GUILD: &str = "DM";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("open store {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[error("create store directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("store task failed: {0}")]
    Task(String),

    #[error("store connection lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedChannel {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub added_by: SenderId,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: SenderId,
    pub guild_id: String,
    pub channel_id: ChannelId,
    pub timestamp: DateTime<Utc>,
    pub message_length: usize,
    pub response_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GuildStats {
    pub total_interactions: u64,
    pub unique_users: u64,
    /// Ties resolve to whichever row the aggregate returns first.
    pub most_active_channel: Option<ChannelId>,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            let conn = Connection::open(&path).map_err(|source| StoreError::Open {
                path: path.clone(),
                source,
            })?;
            ensure_schema(&conn)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    pub async fn is_channel_allowed(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> StoreResult<bool> {
        let guild_id = guild_id.to_string();
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                r#"
SELECT 1
  FROM allowed_channels
 WHERE guild_id = ?1
   AND channel_id = ?2
"#,
                params![guild_id, channel_id],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    pub async fn list_by_guild(&self, guild_id: &GuildId) -> StoreResult<Vec<AllowedChannel>> {
        let guild = guild_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(
                r#"
SELECT guild_id, channel_id, added_by, added_at
  FROM allowed_channels
 WHERE guild_id = ?1
 ORDER BY added_at ASC, rowid ASC
"#,
            )?;
            let rows = stmt.query_map(params![guild], |row| {
                Ok(AllowedChannel {
                    guild_id: GuildId::new(row.get::<_, String>(0)?),
                    channel_id: ChannelId::new(row.get::<_, String>(1)?),
                    added_by: SenderId::new(row.get::<_, String>(2)?),
                    added_at: parse_timestamp(&row.get::<_, String>(3)?),
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Insert or overwrite the row keyed by `(guild_id, channel_id)`.
    pub async fn upsert_allowed_channel(&self, row: AllowedChannel) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO allowed_channels (guild_id, channel_id, added_by, added_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(guild_id, channel_id) DO UPDATE
SET added_by = excluded.added_by,
    added_at = excluded.added_at
"#,
                params![
                    row.guild_id.as_str(),
                    row.channel_id.as_str(),
                    row.added_by.as_str(),
                    row.added_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// Returns the number of rows removed (0 or 1).
    pub async fn delete_allowed_channel(
        &self,
        guild_id: &GuildId,
        channel_id: &ChannelId,
    ) -> StoreResult<usize> {
        let guild_id = guild_id.to_string();
        let channel_id = channel_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                r#"
DELETE FROM allowed_channels
 WHERE guild_id = ?1
   AND channel_id = ?2
"#,
                params![guild_id, channel_id],
            )
        })
        .await
    }

    pub async fn insert_usage(&self, row: UsageRecord) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                r#"
INSERT INTO usage_stats
    (user_id, guild_id, channel_id, timestamp, message_length, response_length)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
                params![
                    row.user_id.as_str(),
                    row.guild_id,
                    row.channel_id.as_str(),
                    row.timestamp.to_rfc3339(),
                    row.message_length as i64,
                    row.response_length as i64,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    pub async fn aggregate_by_guild(&self, guild_id: &GuildId) -> StoreResult<GuildStats> {
        let guild = guild_id.to_string();
        self.with_conn(move |conn| {
            let (total, unique): (i64, i64) = conn.query_row(
                r#"
SELECT COUNT(*), COUNT(DISTINCT user_id)
  FROM usage_stats
 WHERE guild_id = ?1
"#,
                params![guild],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let top: Option<String> = conn
                .query_row(
                    r#"
SELECT channel_id, COUNT(*) AS count
  FROM usage_stats
 WHERE guild_id = ?1
 GROUP BY channel_id
 ORDER BY count DESC
 LIMIT 1
"#,
                    params![guild],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(GuildStats {
                total_interactions: total.max(0) as u64,
                unique_users: unique.max(0) as u64,
                most_active_channel: top.map(ChannelId::new),
            })
        })
        .await
    }
}

fn ensure_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS allowed_channels (
    guild_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    added_by TEXT NOT NULL,
    added_at TEXT NOT NULL,
    PRIMARY KEY (guild_id, channel_id)
);

CREATE TABLE IF NOT EXISTS usage_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    guild_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    message_length INTEGER NOT NULL,
    response_length INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS usage_stats_guild_idx ON usage_stats (guild_id);
"#,
    )
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!(%e, raw, "unparseable stored timestamp; using epoch");
            DateTime::<Utc>::UNIX_EPOCH
        })
}
