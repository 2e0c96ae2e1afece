//! SQLite session store.
//!
//! One row per session. The cleaned bar series and the session state are
//! stored as JSON text.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{OptionalExtension, params};
use tracing::info;

use crate::domain::bar::Bar;
use crate::domain::error::StepTraderError;
use crate::domain::session::SessionState;
use crate::ports::config_port::ConfigPort;
use crate::ports::session_port::{SessionStore, StoredSession};

pub struct SqliteSessionStore {
    pool: Pool<SqliteConnectionManager>,
}

fn store_err(e: impl std::fmt::Display) -> StepTraderError {
    StepTraderError::SessionStore {
        reason: e.to_string(),
    }
}

impl SqliteSessionStore {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, StepTraderError> {
        let db_path =
            config
                .get_string("session", "path")
                .ok_or_else(|| StepTraderError::ConfigMissing {
                    section: "session".into(),
                    key: "path".into(),
                })?;
        let pool_size = config.get_int("session", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(store_err)?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StepTraderError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(store_err)?;

        let store = Self { pool };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn initialize_schema(&self) -> Result<(), StepTraderError> {
        let conn = self.pool.get().map_err(store_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                bars TEXT NOT NULL,
                state TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_name ON sessions(name);",
        )
        .map_err(store_err)?;
        Ok(())
    }
}

fn decode(id: i64, bars: &str, state: &str) -> Result<StoredSession, StepTraderError> {
    let bars: Vec<Bar> = serde_json::from_str(bars)
        .map_err(|e| store_err(format!("session {id}: failed to decode bars: {e}")))?;
    Ok(StoredSession {
        id,
        bars,
        state: SessionState::from_json(state)?,
    })
}

impl SessionStore for SqliteSessionStore {
    fn create(&self, bars: &[Bar], state: &SessionState) -> Result<i64, StepTraderError> {
        let conn = self.pool.get().map_err(store_err)?;
        let bars_json = serde_json::to_string(bars).map_err(store_err)?;
        conn.execute(
            "INSERT INTO sessions (name, bars, state) VALUES (?1, ?2, ?3)",
            params![state.name, bars_json, state.to_json()?],
        )
        .map_err(store_err)?;
        let id = conn.last_insert_rowid();
        info!(session = id, name = %state.name, bars = bars.len(), "session created");
        Ok(id)
    }

    fn get(&self, id: i64) -> Result<Option<StoredSession>, StepTraderError> {
        let conn = self.pool.get().map_err(store_err)?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT bars, state FROM sessions WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(store_err)?;
        row.map(|(bars, state)| decode(id, &bars, &state))
            .transpose()
    }

    fn update(&self, id: i64, state: &SessionState) -> Result<(), StepTraderError> {
        let conn = self.pool.get().map_err(store_err)?;
        let changed = conn
            .execute(
                "UPDATE sessions SET name = ?1, state = ?2 WHERE id = ?3",
                params![state.name, state.to_json()?, id],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(StepTraderError::SessionNotFound(id));
        }
        Ok(())
    }

    fn search(&self, keyword: Option<&str>) -> Result<Vec<StoredSession>, StepTraderError> {
        let conn = self.pool.get().map_err(store_err)?;
        let pattern = format!("%{}%", keyword.unwrap_or(""));
        let mut stmt = conn
            .prepare(
                "SELECT id, bars, state FROM sessions
                 WHERE name LIKE ?1
                 ORDER BY id DESC",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![pattern], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(store_err)?;

        let mut sessions = Vec::new();
        for row in rows {
            let (id, bars, state) = row.map_err(store_err)?;
            sessions.push(decode(id, &bars, &state)?);
        }
        Ok(sessions)
    }
}
