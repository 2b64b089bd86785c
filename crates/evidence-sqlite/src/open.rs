use crate::schema::{MIG_0001_INIT, SCHEMA_VERSION};
use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

/// The evidence/alert store. One connection; every public method takes the
/// lock once, so each call is atomic with respect to other callers.
pub struct Db {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish_non_exhaustive()
    }
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        apply_pragmas(&conn, true)?;
        migrate(&conn)?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_pragmas(&conn, false)?;
        migrate(&conn)?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // a panic mid-statement leaves SQLite itself consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let cnt: i64 = self.lock().query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type IN ('table','view') AND name=?",
            [name],
            |r| r.get(0),
        )?;
        Ok(cnt > 0)
    }
}

fn apply_pragmas(conn: &Connection, on_disk: bool) -> Result<()> {
    if on_disk {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
    }
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    if current > SCHEMA_VERSION {
        bail!("database schema v{current} is newer than this build (v{SCHEMA_VERSION})");
    }
    if current == 0 {
        conn.execute_batch(MIG_0001_INIT).context("applying schema v1")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_store_has_every_table() {
        let db = Db::open_in_memory().unwrap();
        for t in ["domains", "modules", "runs", "observations", "signals", "latest_signals", "risk_models", "alerts", "job_state"] {
            assert!(db.table_exists(t).unwrap(), "missing {t}");
        }
    }

    #[test]
    fn reopening_a_file_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");
        {
            let db = Db::open_or_create(&path).unwrap();
            db.add_domain("reopen.example", 1).unwrap();
        }
        let db = Db::open_or_create(&path).unwrap();
        assert!(db.domain_by_name("reopen.example").unwrap().is_some());
    }
}
