use crate::evidence::latest_signals_on;
use crate::{Db, DomainId, RiskModel, ScoreUpdate, Signal};
use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

impl Db {
    /// Store `version` with `weights` and make it the only active model.
    pub fn publish_risk_model(&self, version: &str, weights: &BTreeMap<String, i64>, at_ms: i64) -> Result<()> {
        let config = serde_json::to_string(weights)?;
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("UPDATE risk_models SET active=0 WHERE active=1", [])?;
        tx.execute(
            "INSERT INTO risk_models(version,config,active,created_at) VALUES (?,?,1,?)
             ON CONFLICT(version) DO UPDATE SET config=excluded.config, active=1",
            params![version, config, at_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn active_risk_model(&self) -> Result<Option<RiskModel>> {
        let conn = self.lock();
        active_model_on(&conn)
    }

    /// Recompute one domain's score against the active model.
    ///
    /// The model, the latest-signal snapshot and the score write happen in one
    /// transaction under one lock, so a concurrent upsert lands either wholly
    /// before or wholly after. Returns `None` (score untouched) when no model
    /// is active.
    pub fn rescore<F>(&self, domain_id: DomainId, at_ms: i64, score: F) -> Result<Option<ScoreUpdate>>
    where
        F: FnOnce(&RiskModel, &[Signal]) -> i64,
    {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let Some(model) = active_model_on(&tx)? else {
            return Ok(None);
        };
        let signals = latest_signals_on(&tx, domain_id)?;
        let value = score(&model, &signals);
        tx.execute(
            "UPDATE domains SET risk_score=?, risk_version=?, updated_at=? WHERE id=?",
            params![value, model.version, at_ms, domain_id],
        )?;
        tx.commit()?;
        Ok(Some(ScoreUpdate { domain_id, score: value, version: model.version }))
    }
}

fn active_model_on(conn: &rusqlite::Connection) -> Result<Option<RiskModel>> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT version, config, created_at FROM risk_models WHERE active=1
             ORDER BY created_at DESC, id DESC LIMIT 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((version, config, created_at)) = row else {
        return Ok(None);
    };
    let weights: BTreeMap<String, i64> = serde_json::from_str(&config)
        .with_context(|| format!("risk model {version} has malformed weights"))?;
    Ok(Some(RiskModel { version, weights, active: true, created_at }))
}
