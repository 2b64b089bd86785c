use crate::{Db, DomainId, ModuleId, Signal, StoredObservation};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use threatscope_core::{Observation, FAVICON_HASH_KEY, FAVICON_REUSED_SIGNAL};

fn signal_from_row(r: &Row) -> rusqlite::Result<Signal> {
    Ok(Signal {
        domain_id: r.get(0)?,
        name: r.get(1)?,
        value: r.get(2)?,
        first_seen_at: r.get(3)?,
        computed_at: r.get(4)?,
    })
}

impl Db {
    /// Append one row per observation. Never updates or deduplicates.
    pub fn record_observations(
        &self,
        domain_id: DomainId,
        module_id: ModuleId,
        observations: &[Observation],
        observed_at: i64,
    ) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO observations(domain_id,module_id,key_name,value,observed_at) VALUES (?,?,?,?,?)",
            )?;
            for o in observations {
                stmt.execute(params![domain_id, module_id, o.key, o.value, observed_at])?;
            }
        }
        tx.commit()?;
        Ok(observations.len())
    }

    pub fn observations(&self, domain_id: DomainId, key: &str) -> Result<Vec<StoredObservation>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id,domain_id,module_id,key_name,value,observed_at FROM observations
             WHERE domain_id=? AND key_name=? ORDER BY observed_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![domain_id, key], |r| {
            Ok(StoredObservation {
                id: r.get(0)?,
                domain_id: r.get(1)?,
                module_id: r.get(2)?,
                key: r.get(3)?,
                value: r.get(4)?,
                observed_at: r.get(5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn latest_observation(&self, domain_id: DomainId, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT value FROM observations WHERE domain_id=? AND key_name=?
                 ORDER BY observed_at DESC, id DESC LIMIT 1",
                params![domain_id, key],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Insert-or-refresh in one statement. On conflict only the value and
    /// `computed_at` move; `first_seen_at` keeps its original insert time.
    pub fn upsert_signal(&self, domain_id: DomainId, name: &str, value: &str, at_ms: i64) -> Result<()> {
        self.lock().execute(
            "INSERT INTO signals(domain_id,signal_name,signal_value,first_seen_at,computed_at) VALUES (?,?,?,?,?)
             ON CONFLICT(domain_id,signal_name) DO UPDATE SET
               signal_value=excluded.signal_value,
               computed_at=excluded.computed_at",
            params![domain_id, name, value, at_ms, at_ms],
        )?;
        Ok(())
    }

    /// Insert only if absent; returns whether a row was created.
    pub fn insert_signal_once(&self, domain_id: DomainId, name: &str, value: &str, at_ms: i64) -> Result<bool> {
        let changed = self.lock().execute(
            "INSERT INTO signals(domain_id,signal_name,signal_value,first_seen_at,computed_at) VALUES (?,?,?,?,?)
             ON CONFLICT(domain_id,signal_name) DO NOTHING",
            params![domain_id, name, value, at_ms, at_ms],
        )?;
        Ok(changed == 1)
    }

    /// Flip a stored `true` back to `false`. Absent or already-false rows are
    /// left alone; returns whether a row changed.
    pub fn clear_signal(&self, domain_id: DomainId, name: &str, at_ms: i64) -> Result<bool> {
        let changed = self.lock().execute(
            "UPDATE signals SET signal_value='false', computed_at=?
             WHERE domain_id=? AND signal_name=? AND lower(signal_value)='true'",
            params![at_ms, domain_id, name],
        )?;
        Ok(changed == 1)
    }

    pub fn signal(&self, domain_id: DomainId, name: &str) -> Result<Option<Signal>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT domain_id,signal_name,signal_value,first_seen_at,computed_at
                 FROM latest_signals WHERE domain_id=? AND signal_name=?",
                params![domain_id, name],
                signal_from_row,
            )
            .optional()?)
    }

    /// Latest value per signal name for one domain.
    pub fn latest_signals(&self, domain_id: DomainId) -> Result<Vec<Signal>> {
        let conn = self.lock();
        latest_signals_on(&conn, domain_id)
    }

    /// Mark `domain_id` with `favicon_hash_reused` when its most recent favicon
    /// hash is shared with at least one other domain. Returns whether the
    /// signal was created by this call.
    pub fn derive_favicon_reuse(&self, domain_id: DomainId, at_ms: i64) -> Result<bool> {
        let Some(hash) = self.latest_observation(domain_id, FAVICON_HASH_KEY)? else {
            return Ok(false);
        };
        let sharing: i64 = self.lock().query_row(
            "SELECT COUNT(DISTINCT domain_id) FROM observations WHERE key_name=? AND value=?",
            params![FAVICON_HASH_KEY, hash],
            |r| r.get(0),
        )?;
        if sharing <= 1 {
            return Ok(false);
        }
        self.insert_signal_once(domain_id, FAVICON_REUSED_SIGNAL, "true", at_ms)
    }
}

pub(crate) fn latest_signals_on(conn: &rusqlite::Connection, domain_id: DomainId) -> Result<Vec<Signal>> {
    let mut stmt = conn.prepare(
        "SELECT domain_id,signal_name,signal_value,first_seen_at,computed_at
         FROM latest_signals WHERE domain_id=? ORDER BY signal_name",
    )?;
    let rows = stmt.query_map([domain_id], signal_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
