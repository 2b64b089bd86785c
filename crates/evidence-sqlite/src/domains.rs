use crate::{parse_col, Db, Domain, DomainId, DomainStatus};
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

const DOMAIN_COLUMNS: &str =
    "id, domain, status, risk_score, risk_version, created_at, updated_at, last_seen";

fn domain_from_row(r: &Row) -> rusqlite::Result<Domain> {
    Ok(Domain {
        id: r.get(0)?,
        domain: r.get(1)?,
        status: parse_col(r, 2)?,
        risk_score: r.get(3)?,
        risk_version: r.get(4)?,
        created_at: r.get(5)?,
        updated_at: r.get(6)?,
        last_seen: r.get(7)?,
    })
}

impl Db {
    /// Insert a domain in status `new`; an existing name keeps its row and id.
    pub fn add_domain(&self, domain: &str, at_ms: i64) -> Result<DomainId> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO domains(domain,status,risk_score,created_at,updated_at) VALUES (?,'new',0,?,?)
             ON CONFLICT(domain) DO NOTHING",
            params![domain, at_ms, at_ms],
        )?;
        let id = conn.query_row("SELECT id FROM domains WHERE domain=?", [domain], |r| r.get(0))?;
        Ok(id)
    }

    pub fn domain(&self, id: DomainId) -> Result<Option<Domain>> {
        let sql = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE id=?");
        Ok(self.lock().query_row(&sql, [id], domain_from_row).optional()?)
    }

    pub fn domain_by_name(&self, domain: &str) -> Result<Option<Domain>> {
        let sql = format!("SELECT {DOMAIN_COLUMNS} FROM domains WHERE domain=?");
        Ok(self.lock().query_row(&sql, [domain], domain_from_row).optional()?)
    }

    /// Status changes belong to the analyst workflow; the pipeline only reads them.
    pub fn set_domain_status(&self, id: DomainId, status: DomainStatus, at_ms: i64) -> Result<()> {
        self.lock().execute(
            "UPDATE domains SET status=?, updated_at=? WHERE id=?",
            params![status.as_str(), at_ms, id],
        )?;
        Ok(())
    }

    /// Domains eligible for a module batch: `new` before `triage` before
    /// `investigating`, stalest `updated_at` first, at most `limit` rows.
    pub fn scan_candidates(&self, limit: usize) -> Result<Vec<Domain>> {
        let sql = format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains
             WHERE status IN ('new','triage','investigating')
             ORDER BY CASE status WHEN 'new' THEN 0 WHEN 'triage' THEN 1 ELSE 2 END,
                      updated_at ASC, id ASC
             LIMIT ?"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit as i64], domain_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Drop a domain and, by cascade, its evidence and alerts.
    pub fn remove_domain(&self, id: DomainId) -> Result<bool> {
        let changed = self.lock().execute("DELETE FROM domains WHERE id=?", [id])?;
        Ok(changed == 1)
    }

    pub fn touch_last_seen(&self, id: DomainId, at_ms: i64) -> Result<()> {
        self.lock().execute("UPDATE domains SET last_seen=? WHERE id=?", params![at_ms, id])?;
        Ok(())
    }

    /// Non-ignored domains whose score is at or above `threshold`.
    pub fn domains_scoring_at_least(&self, threshold: i64) -> Result<Vec<Domain>> {
        let sql = format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains
             WHERE status != 'ignored' AND risk_score >= ?
             ORDER BY id ASC"
        );
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([threshold], domain_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(db: &Db, name: &str, status: DomainStatus, updated_at: i64) -> DomainId {
        let id = db.add_domain(name, 0).unwrap();
        db.set_domain_status(id, status, updated_at).unwrap();
        id
    }

    #[test]
    fn add_domain_is_idempotent_by_name() {
        let db = Db::open_in_memory().unwrap();
        let a = db.add_domain("dup.example", 10).unwrap();
        let b = db.add_domain("dup.example", 20).unwrap();
        assert_eq!(a, b);
        let d = db.domain(a).unwrap().unwrap();
        assert_eq!(d.status, DomainStatus::New);
        assert_eq!(d.risk_score, 0);
        assert_eq!(d.created_at, 10);
    }

    #[test]
    fn remove_cascades_to_evidence() {
        let db = Db::open_in_memory().unwrap();
        let d = db.add_domain("gone.example", 0).unwrap();
        db.upsert_signal(d, "has_dns", "true", 1).unwrap();
        assert!(db.remove_domain(d).unwrap());
        assert!(!db.remove_domain(d).unwrap());
        assert!(db.domain(d).unwrap().is_none());
        assert!(db.latest_signals(d).unwrap().is_empty());
    }

    #[test]
    fn candidates_follow_status_then_staleness() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, "inv-old.example", DomainStatus::Investigating, 100);
        seed(&db, "triage-new.example", DomainStatus::Triage, 500);
        seed(&db, "new-fresh.example", DomainStatus::New, 900);
        seed(&db, "triage-old.example", DomainStatus::Triage, 200);
        seed(&db, "new-stale.example", DomainStatus::New, 300);

        let names: Vec<String> = db.scan_candidates(10).unwrap().into_iter().map(|d| d.domain).collect();
        assert_eq!(
            names,
            vec![
                "new-stale.example",
                "new-fresh.example",
                "triage-old.example",
                "triage-new.example",
                "inv-old.example",
            ]
        );
    }

    #[test]
    fn candidates_skip_ignored_and_mitigated_and_respect_limit() {
        let db = Db::open_in_memory().unwrap();
        seed(&db, "ignored.example", DomainStatus::Ignored, 1);
        seed(&db, "mitigated.example", DomainStatus::Mitigated, 2);
        for i in 0..5 {
            seed(&db, &format!("d{i}.example"), DomainStatus::New, 10 + i);
        }
        let picked = db.scan_candidates(3).unwrap();
        assert_eq!(picked.len(), 3);
        assert!(picked.iter().all(|d| d.status == DomainStatus::New));
        assert_eq!(picked[0].domain, "d0.example");
    }

    #[test]
    fn scoring_threshold_query_excludes_ignored() {
        let db = Db::open_in_memory().unwrap();
        let hot = db.add_domain("hot.example", 0).unwrap();
        let ignored = db.add_domain("ignored-hot.example", 0).unwrap();
        db.lock().execute("UPDATE domains SET risk_score=80 WHERE id IN (?,?)", params![hot, ignored]).unwrap();
        db.set_domain_status(ignored, DomainStatus::Ignored, 1).unwrap();
        let found = db.domains_scoring_at_least(70).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, hot);
    }
}
