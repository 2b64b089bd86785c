use crate::{parse_col, Alert, AlertId, Db, DomainId, NewAlert, PendingAlert, Severity, SignalDebut};
use anyhow::Result;
use rusqlite::{params, params_from_iter, types::Value, OptionalExtension, Row};

fn alert_from_row(r: &Row) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: r.get(0)?,
        domain_id: r.get(1)?,
        alert_type: r.get(2)?,
        alert_key: r.get(3)?,
        severity: parse_col(r, 4)?,
        message: r.get(5)?,
        created_at: r.get(6)?,
        sent_at: r.get(7)?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

impl Db {
    /// Insert unless `(domain_id, alert_key)` already exists. The uniqueness is
    /// enforced by the table, so concurrent evaluators still produce one row.
    /// Returns whether a row was created.
    pub fn insert_alert(&self, alert: &NewAlert, created_at: i64) -> Result<bool> {
        let changed = self.lock().execute(
            "INSERT INTO alerts(domain_id,alert_type,alert_key,severity,message,created_at) VALUES (?,?,?,?,?,?)
             ON CONFLICT(domain_id,alert_key) DO NOTHING",
            params![
                alert.domain_id,
                alert.alert_type,
                alert.alert_key,
                alert.severity.as_str(),
                alert.message,
                created_at
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn alerts_for_domain(&self, domain_id: DomainId) -> Result<Vec<Alert>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id,domain_id,alert_type,alert_key,severity,message,created_at,sent_at
             FROM alerts WHERE domain_id=? ORDER BY id",
        )?;
        let rows = stmt.query_map([domain_id], alert_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn alert(&self, id: AlertId) -> Result<Option<Alert>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT id,domain_id,alert_type,alert_key,severity,message,created_at,sent_at FROM alerts WHERE id=?",
                [id],
                alert_from_row,
            )
            .optional()?)
    }

    /// Signals named in `names`, currently `true`, first seen strictly after
    /// `since`, on domains that are not ignored.
    pub fn signal_debuts(&self, names: &[String], since: i64) -> Result<Vec<SignalDebut>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT s.domain_id, d.domain, s.signal_name, s.first_seen_at
             FROM signals s JOIN domains d ON d.id = s.domain_id
             WHERE d.status != 'ignored' AND lower(s.signal_value) = 'true'
               AND s.first_seen_at > ? AND s.signal_name IN ({})
             ORDER BY s.first_seen_at ASC, s.id ASC",
            placeholders(names.len())
        );
        let mut args: Vec<Value> = Vec::with_capacity(names.len() + 1);
        args.push(Value::Integer(since));
        args.extend(names.iter().cloned().map(Value::Text));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |r| {
            Ok(SignalDebut {
                domain_id: r.get(0)?,
                domain: r.get(1)?,
                signal_name: r.get(2)?,
                first_seen_at: r.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Undelivered alerts of the given severities on non-ignored domains, oldest first.
    pub fn pending_alerts(&self, severities: &[Severity], limit: usize) -> Result<Vec<PendingAlert>> {
        if severities.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT a.id,a.domain_id,a.alert_type,a.alert_key,a.severity,a.message,a.created_at,a.sent_at,
                    d.domain, d.risk_score
             FROM alerts a JOIN domains d ON d.id = a.domain_id
             WHERE a.sent_at IS NULL AND d.status != 'ignored' AND a.severity IN ({})
             ORDER BY a.created_at ASC, a.id ASC
             LIMIT ?",
            placeholders(severities.len())
        );
        let mut args: Vec<Value> = severities.iter().map(|s| Value::Text(s.as_str().to_string())).collect();
        args.push(Value::Integer(limit as i64));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), |r| {
            Ok(PendingAlert { alert: alert_from_row(r)?, domain: r.get(8)?, risk_score: r.get(9)? })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stamp `sent_at` on a still-pending alert; returns whether it was pending.
    pub fn mark_alert_sent(&self, id: AlertId, sent_at: i64) -> Result<bool> {
        let changed = self
            .lock()
            .execute("UPDATE alerts SET sent_at=? WHERE id=? AND sent_at IS NULL", params![sent_at, id])?;
        Ok(changed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DomainStatus;

    fn new_alert(domain_id: DomainId, key: &str, severity: Severity) -> NewAlert {
        NewAlert {
            domain_id,
            alert_type: "domain_high_risk".into(),
            alert_key: key.into(),
            severity,
            message: format!("{key} fired"),
        }
    }

    #[test]
    fn duplicate_key_per_domain_is_ignored() {
        let db = Db::open_in_memory().unwrap();
        let a = db.add_domain("a.example", 0).unwrap();
        let b = db.add_domain("b.example", 0).unwrap();
        assert!(db.insert_alert(&new_alert(a, "risk_high", Severity::High), 1).unwrap());
        assert!(!db.insert_alert(&new_alert(a, "risk_high", Severity::Critical), 2).unwrap());
        assert!(db.insert_alert(&new_alert(b, "risk_high", Severity::High), 3).unwrap());
        let rows = db.alerts_for_domain(a).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].severity, Severity::High);
        assert_eq!(rows[0].created_at, 1);
    }

    #[test]
    fn debuts_respect_window_names_and_ignored() {
        let db = Db::open_in_memory().unwrap();
        let live = db.add_domain("live.example", 0).unwrap();
        let gone = db.add_domain("gone.example", 0).unwrap();
        db.set_domain_status(gone, DomainStatus::Ignored, 0).unwrap();
        db.upsert_signal(live, "tls_self_signed", "true", 100).unwrap();
        db.upsert_signal(live, "old_news", "true", 200).unwrap();
        db.upsert_signal(live, "favicon_hash_reused", "true", 50).unwrap();
        db.upsert_signal(gone, "tls_self_signed", "true", 300).unwrap();

        let names = vec!["tls_self_signed".to_string(), "favicon_hash_reused".to_string()];
        let found = db.signal_debuts(&names, 50).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].domain, "live.example");
        assert_eq!(found[0].signal_name, "tls_self_signed");
        assert!(db.signal_debuts(&[], 0).unwrap().is_empty());
    }

    #[test]
    fn debuts_skip_signals_that_read_false() {
        let db = Db::open_in_memory().unwrap();
        let d = db.add_domain("quiet.example", 0).unwrap();
        db.upsert_signal(d, "tls_self_signed", "false", 100).unwrap();
        db.upsert_signal(d, "tls_hostname_mismatch", "TRUE", 100).unwrap();
        let names = vec!["tls_self_signed".to_string(), "tls_hostname_mismatch".to_string()];
        let found = db.signal_debuts(&names, 0).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].signal_name, "tls_hostname_mismatch");
    }

    #[test]
    fn pending_filters_and_orders() {
        let db = Db::open_in_memory().unwrap();
        let d = db.add_domain("p.example", 0).unwrap();
        let quiet = db.add_domain("quiet.example", 0).unwrap();
        db.set_domain_status(quiet, DomainStatus::Ignored, 0).unwrap();
        db.insert_alert(&new_alert(d, "later", Severity::Critical), 20).unwrap();
        db.insert_alert(&new_alert(d, "earlier", Severity::High), 10).unwrap();
        db.insert_alert(&new_alert(d, "noise", Severity::Low), 5).unwrap();
        db.insert_alert(&new_alert(quiet, "muted", Severity::Critical), 1).unwrap();

        let pending = db.pending_alerts(&[Severity::High, Severity::Critical], 10).unwrap();
        let keys: Vec<&str> = pending.iter().map(|p| p.alert.alert_key.as_str()).collect();
        assert_eq!(keys, vec!["earlier", "later"]);
        assert_eq!(pending[0].domain, "p.example");

        assert_eq!(db.pending_alerts(&[Severity::High, Severity::Critical], 1).unwrap().len(), 1);

        let first = pending[0].alert.id;
        assert!(db.mark_alert_sent(first, 30).unwrap());
        assert!(!db.mark_alert_sent(first, 40).unwrap());
        assert_eq!(db.alert(first).unwrap().unwrap().sent_at, Some(30));
        assert_eq!(db.pending_alerts(&[Severity::High, Severity::Critical], 10).unwrap().len(), 1);
    }
}
