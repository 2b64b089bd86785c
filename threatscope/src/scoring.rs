use anyhow::Result;
use evidence_sqlite::{Db, DomainId, RiskModel, ScoreUpdate, Signal};
use std::sync::Arc;
use threatscope_core::{is_true, now_ms};
use tracing::debug;

pub const MAX_SCORE: i64 = 100;

/// Weighted sum of the `true` signals the model knows, clamped to `0..=MAX_SCORE`.
pub fn score(model: &RiskModel, signals: &[Signal]) -> i64 {
    signals
        .iter()
        .filter(|s| is_true(&s.value))
        .filter_map(|s| model.weights.get(&s.name))
        .fold(0i64, |acc, w| acc.saturating_add(*w))
        .clamp(0, MAX_SCORE)
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    db: Arc<Db>,
}

impl ScoringEngine {
    pub fn new(db: Arc<Db>) -> Self {
        ScoringEngine { db }
    }

    /// Full recomputation from the latest signals. `None` when no model is active.
    pub fn recalc(&self, domain_id: DomainId) -> Result<Option<ScoreUpdate>> {
        let update = self.db.rescore(domain_id, now_ms(), score)?;
        match &update {
            Some(u) => debug!(domain_id, score = u.score, version = %u.version, "Score recalculated."),
            None => debug!(domain_id, "No active risk model; score unchanged."),
        }
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn setup(weights: &[(&str, i64)]) -> (Arc<Db>, ScoringEngine, DomainId) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let w: BTreeMap<String, i64> = weights.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        db.publish_risk_model("v1", &w, 1).unwrap();
        let d = db.add_domain("score.example", 1).unwrap();
        (db.clone(), ScoringEngine::new(db), d)
    }

    #[test]
    fn fresh_domain_then_self_signed() {
        let (db, engine, d) = setup(&[("tls_self_signed", 20)]);
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 0);
        assert_eq!(db.domain(d).unwrap().unwrap().risk_score, 0);

        db.upsert_signal(d, "tls_self_signed", "true", 2).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 20);
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 20);
        let dom = db.domain(d).unwrap().unwrap();
        assert_eq!((dom.risk_score, dom.risk_version.as_deref()), (20, Some("v1")));
    }

    #[test]
    fn case_insensitive_and_unknown_signals() {
        let (db, engine, d) = setup(&[("a", 5), ("b", 7)]);
        db.upsert_signal(d, "a", "TRUE", 2).unwrap();
        db.upsert_signal(d, "b", "false", 2).unwrap();
        db.upsert_signal(d, "not_weighted", "true", 2).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 5);

        db.upsert_signal(d, "a", "false", 3).unwrap();
        db.upsert_signal(d, "b", "True", 3).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 7);
    }

    #[test]
    fn score_is_clamped() {
        let (db, engine, d) = setup(&[("a", 80), ("b", 80)]);
        db.upsert_signal(d, "a", "true", 2).unwrap();
        db.upsert_signal(d, "b", "true", 2).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, MAX_SCORE);
    }

    #[test]
    fn extreme_weights_saturate_instead_of_overflowing() {
        let (db, engine, d) = setup(&[("a", i64::MAX), ("b", i64::MAX), ("c", i64::MIN), ("e", i64::MIN)]);
        db.upsert_signal(d, "a", "true", 2).unwrap();
        db.upsert_signal(d, "b", "true", 2).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, MAX_SCORE);
        db.upsert_signal(d, "a", "false", 3).unwrap();
        db.upsert_signal(d, "b", "false", 3).unwrap();
        db.upsert_signal(d, "c", "true", 3).unwrap();
        db.upsert_signal(d, "e", "true", 3).unwrap();
        assert_eq!(engine.recalc(d).unwrap().unwrap().score, 0);
    }

    #[test]
    fn no_model_is_a_no_op() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let d = db.add_domain("nomodel.example", 1).unwrap();
        assert!(ScoringEngine::new(db).recalc(d).unwrap().is_none());
    }
}
