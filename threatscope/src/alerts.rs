//! Alert evaluation: score thresholds and first sightings of high-risk
//! signals, both written through the per-domain `alert_key` dedup.

use crate::config::AlertsConfig;
use anyhow::Result;
use evidence_sqlite::{Db, NewAlert, Severity};
use std::sync::Arc;
use threatscope_core::{format_ms, now_ms, DAY_MS};
use tracing::{debug, info, warn};

pub const JOB_NAME: &str = "evaluate-alerts";

/// What happened to one candidate alert. Storage errors stay here instead
/// of escaping the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertInsert {
    Inserted,
    Duplicate,
    SoftFailure(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub disabled: bool,
    /// Lower bound (exclusive) used for the signal pass.
    pub since: Option<i64>,
    pub candidates: Vec<(NewAlert, AlertInsert)>,
}

impl EvaluationReport {
    fn count(&self, want: fn(&AlertInsert) -> bool) -> usize {
        self.candidates.iter().filter(|(_, r)| want(r)).count()
    }

    pub fn inserted(&self) -> usize {
        self.count(|r| matches!(r, AlertInsert::Inserted))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|r| matches!(r, AlertInsert::Duplicate))
    }

    pub fn soft_failures(&self) -> usize {
        self.count(|r| matches!(r, AlertInsert::SoftFailure(_)))
    }
}

#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    db: Arc<Db>,
    cfg: AlertsConfig,
}

impl AlertEvaluator {
    pub fn new(db: Arc<Db>, cfg: AlertsConfig) -> Self {
        AlertEvaluator { db, cfg }
    }

    pub fn evaluate(&self) -> Result<EvaluationReport> {
        self.evaluate_at(now_ms())
    }

    pub fn evaluate_at(&self, now: i64) -> Result<EvaluationReport> {
        let mut report = EvaluationReport::default();
        if !self.cfg.enabled {
            info!("Alerts disabled; evaluation skipped.");
            report.disabled = true;
            return Ok(report);
        }

        for d in self.db.domains_scoring_at_least(self.cfg.high_threshold)? {
            let alert = if d.risk_score >= self.cfg.critical_threshold {
                NewAlert {
                    domain_id: d.id,
                    alert_type: "domain_critical_risk".into(),
                    alert_key: "risk_critical".into(),
                    severity: Severity::Critical,
                    message: format!("Domain {} reached CRITICAL risk score ({}).", d.domain, d.risk_score),
                }
            } else {
                NewAlert {
                    domain_id: d.id,
                    alert_type: "domain_high_risk".into(),
                    alert_key: "risk_high".into(),
                    severity: Severity::High,
                    message: format!("Domain {} reached HIGH risk score ({}).", d.domain, d.risk_score),
                }
            };
            let res = self.insert(&alert, now);
            report.candidates.push((alert, res));
        }

        let since = match self.db.job_last_run(JOB_NAME)? {
            Some(last) => last,
            None => now - self.cfg.lookback_days.max(0) * DAY_MS,
        };
        report.since = Some(since);
        if self.cfg.high_risk_signals.is_empty() {
            info!("No high-risk signals configured; signal pass skipped.");
        }
        for s in self.db.signal_debuts(&self.cfg.high_risk_signals, since)? {
            debug!(domain = %s.domain, signal = %s.signal_name, first_seen = %format_ms(s.first_seen_at), "Signal debut.");
            let alert = NewAlert {
                domain_id: s.domain_id,
                alert_type: "signal_high_risk".into(),
                alert_key: format!("signal_{}", s.signal_name),
                severity: Severity::High,
                message: format!("New high-risk signal first seen: {} on {}.", s.signal_name, s.domain),
            };
            let res = self.insert(&alert, now);
            report.candidates.push((alert, res));
        }

        self.db.touch_job(JOB_NAME, now)?;
        info!(
            inserted = report.inserted(),
            duplicates = report.duplicates(),
            soft_failures = report.soft_failures(),
            "Alert evaluation complete."
        );
        Ok(report)
    }

    pub(crate) fn insert(&self, alert: &NewAlert, now: i64) -> AlertInsert {
        match self.db.insert_alert(alert, now) {
            Ok(true) => {
                debug!(domain_id = alert.domain_id, alert_key = %alert.alert_key, "Alert inserted.");
                AlertInsert::Inserted
            }
            Ok(false) => AlertInsert::Duplicate,
            Err(e) => {
                warn!(domain_id = alert.domain_id, alert_key = %alert.alert_key, error = %e, "Alert insert ignored.");
                AlertInsert::SoftFailure(format!("{e:#}"))
            }
        }
    }
}
