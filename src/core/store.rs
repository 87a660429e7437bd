use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::core::models::CacheEntry;

/// Schema DDL run on open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversation_entries (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS profile_entries (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    version INTEGER NOT NULL
);
";

/// The two named stores in the cache database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Conversation id → message list.
    Conversations,
    /// Profile id → conversation list.
    Profiles,
}

impl StoreKind {
    fn table(self) -> &'static str {
        match self {
            StoreKind::Conversations => "conversation_entries",
            StoreKind::Profiles => "profile_entries",
        }
    }
}

/// A row as it sits on disk, before JSON decoding.
struct RawEntry {
    data: String,
    timestamp: i64,
    version: u32,
}

// ---------------------------------------------------------------------------
// Commands sent from async world → background thread
// ---------------------------------------------------------------------------

enum CacheCmd {
    LoadEntry {
        store: StoreKind,
        key: String,
        reply: oneshot::Sender<Result<Option<RawEntry>, String>>,
    },
    SaveEntry {
        store: StoreKind,
        key: String,
        entry: RawEntry,
        reply: oneshot::Sender<Result<(), String>>,
    },
    DeleteEntry {
        store: StoreKind,
        key: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    ClearStore {
        store: StoreKind,
        reply: oneshot::Sender<Result<(), String>>,
    },
    EntryCount {
        store: StoreKind,
        reply: oneshot::Sender<Result<u32, String>>,
    },
}

// ---------------------------------------------------------------------------
// CacheHandle: Clone + Send + Sync async facade
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CacheHandle {
    tx: mpsc::UnboundedSender<CacheCmd>,
}

impl CacheHandle {
    /// Open (or create) the cache database under `dir`, or the XDG data dir
    /// when `dir` is `None`, and spawn the background thread.
    pub fn open(dir: Option<&Path>) -> Result<Self, String> {
        let db_path = match dir {
            Some(d) => d.to_path_buf(),
            None => Self::resolve_path(),
        };

        std::fs::create_dir_all(&db_path)
            .map_err(|e| format!("Failed to create cache dir: {e}"))?;

        let db_file = db_path.join("cache.db");
        let conn =
            Connection::open(&db_file).map_err(|e| format!("Failed to open cache db: {e}"))?;
        log::info!("Opened message cache at {}", db_file.display());

        Self::spawn(conn)
    }

    /// Throwaway database that lives as long as the handle's thread.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory()
            .map_err(|e| format!("Failed to open in-memory cache db: {e}"))?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| format!("Failed to init cache schema: {e}"))?;

        let (tx, rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("heartline-cache".into())
            .spawn(move || Self::run_loop(conn, rx))
            .map_err(|e| format!("Failed to spawn cache thread: {e}"))?;

        Ok(CacheHandle { tx })
    }

    fn resolve_path() -> PathBuf {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("heartline")
    }

    // -- async methods -------------------------------------------------------

    pub async fn load_entry<T: DeserializeOwned>(
        &self,
        store: StoreKind,
        key: &str,
    ) -> Result<Option<CacheEntry<T>>, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::LoadEntry {
                store,
                key: key.to_string(),
                reply,
            })
            .map_err(|_| "Cache unavailable".to_string())?;
        let raw = rx.await.map_err(|_| "Cache unavailable".to_string())??;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let data: Vec<T> =
            serde_json::from_str(&raw.data).map_err(|e| format!("Cache decode error: {e}"))?;
        Ok(Some(CacheEntry {
            data,
            timestamp: raw.timestamp,
            version: raw.version,
        }))
    }

    pub async fn save_entry<T: Serialize>(
        &self,
        store: StoreKind,
        key: &str,
        entry: &CacheEntry<T>,
    ) -> Result<(), String> {
        let data =
            serde_json::to_string(&entry.data).map_err(|e| format!("Cache encode error: {e}"))?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::SaveEntry {
                store,
                key: key.to_string(),
                entry: RawEntry {
                    data,
                    timestamp: entry.timestamp,
                    version: entry.version,
                },
                reply,
            })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn delete_entry(&self, store: StoreKind, key: &str) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::DeleteEntry {
                store,
                key: key.to_string(),
                reply,
            })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn clear_store(&self, store: StoreKind) -> Result<(), String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::ClearStore { store, reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    pub async fn clear_all(&self) -> Result<(), String> {
        self.clear_store(StoreKind::Conversations).await?;
        self.clear_store(StoreKind::Profiles).await
    }

    pub async fn entry_count(&self, store: StoreKind) -> Result<u32, String> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CacheCmd::EntryCount { store, reply })
            .map_err(|_| "Cache unavailable".to_string())?;
        rx.await.map_err(|_| "Cache unavailable".to_string())?
    }

    // -- background thread ---------------------------------------------------

    fn run_loop(conn: Connection, mut rx: mpsc::UnboundedReceiver<CacheCmd>) {
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                CacheCmd::LoadEntry { store, key, reply } => {
                    let _ = reply.send(Self::do_load_entry(&conn, store, &key));
                }
                CacheCmd::SaveEntry {
                    store,
                    key,
                    entry,
                    reply,
                } => {
                    let _ = reply.send(Self::do_save_entry(&conn, store, &key, &entry));
                }
                CacheCmd::DeleteEntry { store, key, reply } => {
                    let _ = reply.send(Self::do_delete_entry(&conn, store, &key));
                }
                CacheCmd::ClearStore { store, reply } => {
                    let _ = reply.send(Self::do_clear_store(&conn, store));
                }
                CacheCmd::EntryCount { store, reply } => {
                    let _ = reply.send(Self::do_entry_count(&conn, store));
                }
            }
        }
        log::debug!("Cache thread exiting");
    }

    // -- synchronous DB operations -------------------------------------------

    fn do_load_entry(
        conn: &Connection,
        store: StoreKind,
        key: &str,
    ) -> Result<Option<RawEntry>, String> {
        let sql = format!(
            "SELECT data, timestamp, version FROM {} WHERE key = ?1",
            store.table()
        );
        let result = conn.query_row(&sql, [key], |row| {
            Ok(RawEntry {
                data: row.get(0)?,
                timestamp: row.get(1)?,
                version: row.get(2)?,
            })
        });

        match result {
            Ok(entry) => Ok(Some(entry)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(format!("Cache load error: {e}")),
        }
    }

    fn do_save_entry(
        conn: &Connection,
        store: StoreKind,
        key: &str,
        entry: &RawEntry,
    ) -> Result<(), String> {
        // Write-through: the newest write for a key always wins.
        let sql = format!(
            "INSERT OR REPLACE INTO {} (key, data, timestamp, version) VALUES (?1, ?2, ?3, ?4)",
            store.table()
        );
        conn.execute(
            &sql,
            rusqlite::params![key, entry.data, entry.timestamp, entry.version],
        )
        .map_err(|e| format!("Cache insert error: {e}"))?;
        Ok(())
    }

    fn do_delete_entry(conn: &Connection, store: StoreKind, key: &str) -> Result<(), String> {
        let sql = format!("DELETE FROM {} WHERE key = ?1", store.table());
        conn.execute(&sql, [key])
            .map_err(|e| format!("Cache delete error: {e}"))?;
        Ok(())
    }

    fn do_clear_store(conn: &Connection, store: StoreKind) -> Result<(), String> {
        let sql = format!("DELETE FROM {}", store.table());
        conn.execute(&sql, [])
            .map_err(|e| format!("Cache clear error: {e}"))?;
        Ok(())
    }

    fn do_entry_count(conn: &Connection, store: StoreKind) -> Result<u32, String> {
        let sql = format!("SELECT COUNT(*) FROM {}", store.table());
        conn.query_row(&sql, [], |row| row.get(0))
            .map_err(|e| format!("Cache count error: {e}"))
    }
}
