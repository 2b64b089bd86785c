use crate::Db;
use anyhow::Result;
use rusqlite::{params, OptionalExtension};

impl Db {
    pub fn job_last_run(&self, job_name: &str) -> Result<Option<i64>> {
        Ok(self
            .lock()
            .query_row("SELECT last_run_at FROM job_state WHERE job_name=?", [job_name], |r| r.get(0))
            .optional()?)
    }

    /// Advance a job watermark. Never moves it backwards.
    pub fn touch_job(&self, job_name: &str, at_ms: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO job_state(job_name,last_run_at,updated_at) VALUES (?,?,?)
             ON CONFLICT(job_name) DO UPDATE SET
               last_run_at=MAX(job_state.last_run_at, excluded.last_run_at),
               updated_at=excluded.updated_at",
            params![job_name, at_ms, at_ms],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_is_monotonic() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.job_last_run("evaluate-alerts").unwrap(), None);
        db.touch_job("evaluate-alerts", 100).unwrap();
        db.touch_job("evaluate-alerts", 50).unwrap();
        assert_eq!(db.job_last_run("evaluate-alerts").unwrap(), Some(100));
        db.touch_job("evaluate-alerts", 150).unwrap();
        assert_eq!(db.job_last_run("evaluate-alerts").unwrap(), Some(150));
        assert_eq!(db.job_last_run("send-alerts").unwrap(), None);
    }
}
