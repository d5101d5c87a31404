use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use smartgraph_core::config::{CheckpointBackend, CheckpointConfig};
use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::fs::write_atomic;
use smartgraph_core::types::SessionId;
use smartgraph_memory::MemoryState;

use crate::graph::PipelineState;

/// Current on-disk checkpoint format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Engine progress captured at a save point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub pipeline_state: PipelineState,
    /// Node the engine resumes at; `None` once the run reached a terminal state.
    pub active_node: Option<String>,
    pub memory: MemoryState,
    /// Completed node executions so far.
    #[serde(default)]
    pub cycles: u64,
}

/// A single checkpoint. Each save supersedes the previous one for the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub session_id: SessionId,
    /// Increases by one with every save of the session.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub snapshot: ExecutionSnapshot,
}

/// Durable storage for serialized checkpoints, one record per session.
pub trait CheckpointStore: Send + Sync + 'static {
    /// Replace the record for `session_id` atomically.
    fn put<'a>(&'a self, session_id: &'a str, payload: String) -> BoxFuture<'a, Result<()>>;

    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    /// Returns whether a record existed.
    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Session ids with a stored record, sorted.
    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}

fn store_error(action: &str, e: impl std::fmt::Display) -> SmartGraphError {
    SmartGraphError::Checkpoint(format!("Failed to {}: {}", action, e))
}

/// One pretty-printed JSON file per session: `<dir>/<session>.json`.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", session_id))
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn put<'a>(&'a self, session_id: &'a str, payload: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            write_atomic(&self.path(session_id), payload.as_bytes())
                .await
                .map_err(|e| store_error("write checkpoint", e))
        })
    }

    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(self.path(session_id)).await {
                Ok(content) => Ok(Some(content)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(store_error("read checkpoint", e)),
            }
        })
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.path(session_id)).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(store_error("delete checkpoint", e)),
            }
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut entries = match tokio::fs::read_dir(&self.dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(store_error("list checkpoints", e)),
            };
            let mut ids = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| store_error("list checkpoints", e))?
            {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if !stem.starts_with('.') {
                        ids.push(stem.to_string());
                    }
                }
            }
            ids.sort();
            Ok(ids)
        })
    }
}

/// Checkpoint store backed by SQLite, one row per session.
pub struct SqliteCheckpointStore {
    conn: Mutex<Connection>,
}

impl SqliteCheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| store_error("create checkpoint directory", e))?;
        }
        let conn = Connection::open(path).map_err(|e| store_error("open checkpoint store", e))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| store_error("open checkpoint store", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 session_id TEXT PRIMARY KEY,
                 payload TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )
        .map_err(|e| store_error("initialize checkpoint schema", e))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn put<'a>(&'a self, session_id: &'a str, payload: String) -> BoxFuture<'a, Result<()>> {
        let result = self
            .conn()
            .execute(
                "INSERT OR REPLACE INTO checkpoints (session_id, payload, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![session_id, payload, Utc::now().to_rfc3339()],
            )
            .map(|_| ())
            .map_err(|e| store_error("save checkpoint", e));
        Box::pin(async move { result })
    }

    fn get<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        let result = self
            .conn()
            .query_row(
                "SELECT payload FROM checkpoints WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| store_error("load checkpoint", e));
        Box::pin(async move { result })
    }

    fn remove<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        let result = self
            .conn()
            .execute(
                "DELETE FROM checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .map(|n| n > 0)
            .map_err(|e| store_error("delete checkpoint", e));
        Box::pin(async move { result })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        let result = (|| {
            let conn = self.conn();
            let mut stmt =
                conn.prepare("SELECT session_id FROM checkpoints ORDER BY session_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok::<_, rusqlite::Error>(ids)
        })()
        .map_err(|e| store_error("list checkpoints", e));
        Box::pin(async move { result })
    }
}

/// Saves, loads, and deletes checkpoints. Scheduling is the engine's job.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    sequences: Mutex<HashMap<String, u64>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Build the configured backend under `dir`.
    pub fn from_config(config: &CheckpointConfig, dir: &Path) -> Result<Self> {
        let store: Arc<dyn CheckpointStore> = match config.backend {
            CheckpointBackend::File => Arc::new(FileCheckpointStore::new(dir)),
            CheckpointBackend::Sqlite => {
                Arc::new(SqliteCheckpointStore::open(&dir.join("checkpoints.db"))?)
            }
        };
        Ok(Self::new(store))
    }

    /// Ids reach file names, so anything path-like is rejected.
    fn checked_id(session_id: &SessionId) -> Result<SessionId> {
        SessionId::parse(session_id.as_str())
    }

    /// Write a new checkpoint for the session, superseding the previous one.
    pub async fn save(
        &self,
        session_id: &SessionId,
        snapshot: ExecutionSnapshot,
    ) -> Result<Checkpoint> {
        let id = Self::checked_id(session_id)?;
        let sequence = self.next_sequence(&id).await;

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            session_id: id.clone(),
            sequence,
            timestamp: Utc::now(),
            snapshot,
        };
        let payload = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| store_error("serialize checkpoint", e))?;
        self.store.put(id.as_str(), payload).await?;

        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.0.clone(), sequence);
        debug!(session = %id, sequence, node = ?checkpoint.snapshot.active_node, "Checkpoint saved");
        Ok(checkpoint)
    }

    /// Load the latest checkpoint for a session, if any.
    pub async fn load(&self, session_id: &SessionId) -> Result<Option<Checkpoint>> {
        let id = Self::checked_id(session_id)?;
        let Some(payload) = self.store.get(id.as_str()).await? else {
            return Ok(None);
        };

        let raw: serde_json::Value = serde_json::from_str(&payload)
            .map_err(|e| store_error("parse checkpoint", e))?;
        let version = raw.get("version").and_then(|v| v.as_u64());
        if version != Some(CHECKPOINT_VERSION as u64) {
            return Err(SmartGraphError::Checkpoint(format!(
                "unsupported checkpoint version {} for session {}",
                version.map_or_else(|| "<missing>".to_string(), |v| v.to_string()),
                id
            )));
        }
        let checkpoint: Checkpoint =
            serde_json::from_value(raw).map_err(|e| store_error("parse checkpoint", e))?;

        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.0.clone(), checkpoint.sequence);
        info!(session = %id, sequence = checkpoint.sequence, "Checkpoint loaded");
        Ok(Some(checkpoint))
    }

    /// Delete the session's checkpoint. Returns whether one existed.
    pub async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        let id = Self::checked_id(session_id)?;
        self.sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id.as_str());
        self.store.remove(id.as_str()).await
    }

    /// Session ids with a stored checkpoint.
    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    async fn next_sequence(&self, id: &SessionId) -> u64 {
        let cached = self
            .sequences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id.as_str())
            .copied();
        let last = match cached {
            Some(seq) => seq,
            // An unreadable old record is about to be replaced anyway.
            None => match self.load(id).await {
                Ok(Some(previous)) => previous.sequence,
                _ => 0,
            },
        };
        last + 1
    }
}
