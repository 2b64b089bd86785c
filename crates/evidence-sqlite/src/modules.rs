use crate::{parse_col, Db, ModuleId, ModuleRecord, Run, RunFinish, RunId};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

fn module_from_row(r: &Row) -> rusqlite::Result<ModuleRecord> {
    let rate_limit: Option<i64> = r.get(4)?;
    Ok(ModuleRecord {
        id: r.get(0)?,
        name: r.get(1)?,
        version: r.get(2)?,
        enabled: r.get::<_, i64>(3)? != 0,
        rate_limit: rate_limit.and_then(|v| u32::try_from(v).ok()),
        last_run: r.get(5)?,
        last_error: r.get(6)?,
    })
}

fn run_from_row(r: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: r.get(0)?,
        module_id: r.get(1)?,
        started_at: r.get(2)?,
        finished_at: r.get(3)?,
        status: parse_col(r, 4)?,
        error_message: r.get(5)?,
        domains_total: r.get(6)?,
        domains_failed: r.get(7)?,
    })
}

impl Db {
    /// Register a module by name, refreshing version, enablement and override.
    pub fn register_module(&self, name: &str, version: &str, enabled: bool, rate_limit: Option<u32>) -> Result<ModuleId> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO modules(name,version,enabled,rate_limit) VALUES (?,?,?,?)
             ON CONFLICT(name) DO UPDATE SET version=excluded.version, enabled=excluded.enabled, rate_limit=excluded.rate_limit",
            params![name, version, enabled as i64, rate_limit.map(i64::from)],
        )?;
        let id = conn.query_row("SELECT id FROM modules WHERE name=?", [name], |r| r.get(0))?;
        Ok(id)
    }

    pub fn module(&self, id: ModuleId) -> Result<Option<ModuleRecord>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id,name,version,enabled,rate_limit,last_run,last_error FROM modules WHERE id=?",
                [id],
                module_from_row,
            )
            .optional()?)
    }

    pub fn modules(&self) -> Result<Vec<ModuleRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id,name,version,enabled,rate_limit,last_run,last_error FROM modules ORDER BY name")?;
        let rows = stmt.query_map([], module_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stamp `last_run`; `last_error` is cleared on a clean batch.
    pub fn record_module_run(&self, id: ModuleId, at_ms: i64, last_error: Option<&str>) -> Result<()> {
        self.lock().execute(
            "UPDATE modules SET last_run=?, last_error=? WHERE id=?",
            params![at_ms, last_error, id],
        )?;
        Ok(())
    }

    pub fn begin_run(&self, module_id: ModuleId, started_at: i64) -> Result<RunId> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO runs(module_id, started_at, status) VALUES (?,?,'running')",
            params![module_id, started_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Finalize a run. Only a `running` row is updated, so a run is closed once;
    /// returns whether this call closed it.
    pub fn finish_run(&self, run_id: RunId, finish: &RunFinish, finished_at: i64) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE runs SET finished_at=?, status=?, error_message=?, domains_total=?, domains_failed=?
             WHERE id=? AND status='running'",
            params![
                finished_at,
                finish.status.as_str(),
                finish.error_message,
                finish.domains_total,
                finish.domains_failed,
                run_id
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn run(&self, run_id: RunId) -> Result<Option<Run>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id,module_id,started_at,finished_at,status,error_message,domains_total,domains_failed FROM runs WHERE id=?",
                [run_id],
                run_from_row,
            )
            .optional()?)
    }

    pub fn latest_run(&self, module_id: ModuleId) -> Result<Option<Run>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id,module_id,started_at,finished_at,status,error_message,domains_total,domains_failed
                 FROM runs WHERE module_id=? ORDER BY id DESC LIMIT 1",
                [module_id],
                run_from_row,
            )
            .optional()?)
    }

    #[cfg(test)]
    pub fn runs_for_module(&self, module_id: ModuleId) -> Result<Vec<Run>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id,module_id,started_at,finished_at,status,error_message,domains_total,domains_failed
             FROM runs WHERE module_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map([module_id], run_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
