//! One scheduler invocation: every enabled module runs its batch
//! concurrently, each probe holding a permit from the shared worker pool.

use crate::registry::LoadedModule;
use crate::scoring::ScoringEngine;
use anyhow::Result;
use evidence_sqlite::{Db, Domain, DomainId, RunFinish, RunId, RunStatus};
use std::sync::Arc;
use threatscope_core::workers::WorkerPool;
use threatscope_core::{now_ms, Probe, ProbeError, ProbeOutput};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const JOB_NAME: &str = "run";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainOutcome {
    Persisted { domain_id: DomainId, observations: usize, signals: usize },
    ProbeFault { domain_id: DomainId, reason: String },
    /// Probed fine but the evidence could not be stored.
    PersistFault { domain_id: DomainId, reason: String },
}

impl DomainOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, DomainOutcome::Persisted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleReport {
    pub module: String,
    pub run_id: Option<RunId>,
    pub status: RunStatus,
    pub error: Option<String>,
    pub outcomes: Vec<DomainOutcome>,
}

impl ModuleReport {
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub modules: Vec<ModuleReport>,
}

impl RunReport {
    pub fn module(&self, name: &str) -> Option<&ModuleReport> {
        self.modules.iter().find(|m| m.module == name)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    db: Arc<Db>,
    scoring: ScoringEngine,
    pool: WorkerPool,
}

impl Scheduler {
    pub fn new(db: Arc<Db>, workers: usize) -> Self {
        let scoring = ScoringEngine::new(db.clone());
        Scheduler { db, scoring, pool: WorkerPool::new(workers) }
    }

    pub async fn run(&self, modules: &[LoadedModule]) -> Result<RunReport> {
        info!(modules = modules.len(), workers = self.pool.size(), "Scheduler run starting.");
        let mut set = JoinSet::new();
        for m in modules.iter().cloned() {
            let this = self.clone();
            set.spawn(async move { this.run_module(m).await });
        }
        let mut report = RunReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => report.modules.push(r),
                Err(e) => error!(error = %e, "Module task aborted."),
            }
        }
        report.modules.sort_by(|a, b| a.module.cmp(&b.module));
        self.db.touch_job(JOB_NAME, now_ms())?;
        Ok(report)
    }

    /// Never fails: a batch fault is recorded on the run and the module row.
    async fn run_module(&self, m: LoadedModule) -> ModuleReport {
        let name = m.name().to_string();
        let run_id = match self.db.begin_run(m.id, now_ms()) {
            Ok(id) => id,
            Err(e) => {
                error!(module = %name, error = %e, "Could not open run record.");
                let msg = e.to_string();
                if let Err(e) = self.db.record_module_run(m.id, now_ms(), Some(&msg)) {
                    warn!(module = %name, error = %e, "Could not record module failure.");
                }
                return ModuleReport { module: name, run_id: None, status: RunStatus::Error, error: Some(msg), outcomes: Vec::new() };
            }
        };

        let mut outcomes = Vec::new();
        let batch = self.run_batch(&m, run_id, &mut outcomes).await;
        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        let (status, error) = match batch {
            Err(e) => (RunStatus::Error, Some(format!("{e:#}"))),
            Ok(()) if failed > 0 => (RunStatus::Partial, None),
            Ok(()) => (RunStatus::Success, None),
        };
        let finish = RunFinish {
            status,
            error_message: error.clone(),
            domains_total: outcomes.len() as i64,
            domains_failed: failed as i64,
        };
        let at = now_ms();
        if let Err(e) = self.db.finish_run(run_id, &finish, at) {
            warn!(module = %name, run_id, error = %e, "Could not finalize run.");
        }
        if let Err(e) = self.db.record_module_run(m.id, at, error.as_deref()) {
            warn!(module = %name, error = %e, "Could not stamp module last_run.");
        }
        match &error {
            Some(msg) => error!(module = %name, run_id, error = %msg, "Module batch failed."),
            None => info!(module = %name, run_id, status = status.as_str(), domains = outcomes.len(), failed, "Module batch finished."),
        }
        ModuleReport { module: name, run_id: Some(run_id), status, error, outcomes }
    }

    async fn run_batch(&self, m: &LoadedModule, run_id: RunId, outcomes: &mut Vec<DomainOutcome>) -> Result<()> {
        let limit = m.effective_rate_limit() as usize;
        let domains = self.db.scan_candidates(limit)?;
        debug!(module = m.name(), run_id, selected = domains.len(), limit, "Domains selected.");

        let mut set: JoinSet<(Domain, Result<ProbeOutput, ProbeError>)> = JoinSet::new();
        for domain in domains {
            let probe = m.probe.clone();
            let pool = self.pool.clone();
            set.spawn(async move {
                let name = domain.domain.clone();
                let res = pool
                    .run(async move {
                        // inner task so a panic is pinned to this domain
                        match tokio::spawn(async move { probe.run(&name).await }).await {
                            Ok(r) => r,
                            Err(e) => Err(ProbeError::Internal(format!("probe task failed: {e}"))),
                        }
                    })
                    .await;
                (domain, res)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (domain, res) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(module = m.name(), error = %e, "Domain task aborted.");
                    continue;
                }
            };
            match res {
                Ok(out) => match self.persist(m, domain.id, &out) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        let reason = format!("{e:#}");
                        warn!(module = m.name(), domain = %domain.domain, error = %reason, "Could not store evidence; domain skipped this run.");
                        outcomes.push(DomainOutcome::PersistFault { domain_id: domain.id, reason });
                    }
                },
                Err(e) => {
                    warn!(module = m.name(), domain = %domain.domain, error = %e, "Probe failed; domain skipped this run.");
                    outcomes.push(DomainOutcome::ProbeFault { domain_id: domain.id, reason: e.to_string() });
                }
            }
        }
        Ok(())
    }

    fn persist(&self, m: &LoadedModule, domain_id: DomainId, out: &ProbeOutput) -> Result<DomainOutcome> {
        let at = now_ms();
        let observations = self.db.record_observations(domain_id, m.id, &out.observations, at)?;
        for s in &out.signals {
            self.db.upsert_signal(domain_id, &s.name, &s.value, at)?;
        }
        // heuristics this pass did not raise no longer hold
        for name in m.probe.heuristics() {
            if out.signal_value(name).is_none() && self.db.clear_signal(domain_id, name, at)? {
                debug!(domain_id, signal = *name, "Heuristic cleared.");
            }
        }
        if self.db.derive_favicon_reuse(domain_id, at)? {
            info!(domain_id, "Favicon hash shared with another domain.");
        }
        self.scoring.recalc(domain_id)?;
        self.db.touch_last_seen(domain_id, at)?;
        Ok(DomainOutcome::Persisted { domain_id, observations, signals: out.signals.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register;
    use async_trait::async_trait;
    use evidence_sqlite::DomainStatus;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeProbe {
        name: &'static str,
        limit: u32,
        fail_on: Vec<&'static str>,
        panic_on: Vec<&'static str>,
        signals: Vec<(&'static str, &'static str)>,
        heuristics: &'static [&'static str],
        raised: Mutex<Vec<&'static str>>,
        remove_on: Option<(Arc<Db>, &'static str)>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Probe for FakeProbe {
        fn name(&self) -> &'static str { self.name }
        fn version(&self) -> &'static str { "0.0.1" }
        fn rate_limit(&self) -> u32 { self.limit }
        fn heuristics(&self) -> &'static [&'static str] { self.heuristics }

        async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
            self.seen.lock().unwrap().push(domain.to_string());
            if let Some((db, name)) = &self.remove_on {
                if *name == domain {
                    let row = db.domain_by_name(domain).unwrap().unwrap();
                    db.remove_domain(row.id).unwrap();
                }
            }
            if self.panic_on.iter().any(|d| *d == domain) {
                panic!("boom on {domain}");
            }
            if self.fail_on.iter().any(|d| *d == domain) {
                return Err(ProbeError::Protocol("connection reset".into()));
            }
            let mut out = ProbeOutput::new();
            out.observe("fake_seen", domain);
            for (k, v) in &self.signals {
                out.signal(*k, *v);
            }
            for h in self.raised.lock().unwrap().iter() {
                out.raise(*h, true);
            }
            Ok(out)
        }
    }

    fn seed(db: &Db, name: &str, status: DomainStatus, updated_at: i64) -> DomainId {
        let id = db.add_domain(name, 0).unwrap();
        db.set_domain_status(id, status, updated_at).unwrap();
        id
    }

    fn load(db: &Db, probe: FakeProbe, rate_override: Option<u32>) -> (LoadedModule, Arc<FakeProbe>) {
        let probe = Arc::new(probe);
        let m = register(db, probe.clone(), true, rate_override).unwrap();
        (m, probe)
    }

    fn seen(p: &FakeProbe) -> Vec<String> {
        let mut v = p.seen.lock().unwrap().clone();
        v.sort();
        v
    }

    #[tokio::test]
    async fn batch_is_capped_by_rate_limit_and_prioritised() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        seed(&db, "t-old.example", DomainStatus::Triage, 1);
        seed(&db, "n-new.example", DomainStatus::New, 5);
        seed(&db, "i-old.example", DomainStatus::Investigating, 0);
        seed(&db, "n-old.example", DomainStatus::New, 2);
        seed(&db, "ignored.example", DomainStatus::Ignored, 0);
        seed(&db, "done.example", DomainStatus::Mitigated, 0);
        let (m, probe) = load(&db, FakeProbe { name: "fake", limit: 3, ..Default::default() }, None);

        let report = Scheduler::new(db.clone(), 2).run(&[m.clone()]).await.unwrap();
        let r = report.module("fake").unwrap();
        assert_eq!(r.status, RunStatus::Success);
        assert_eq!(r.outcomes.len(), 3);
        assert_eq!(seen(&probe), vec!["n-new.example", "n-old.example", "t-old.example"]);

        let run = db.run(r.run_id.unwrap()).unwrap().unwrap();
        assert_eq!((run.status, run.domains_total, run.domains_failed), (RunStatus::Success, 3, 0));
        assert!(run.finished_at.is_some());
        let row = db.module(m.id).unwrap().unwrap();
        assert!(row.last_run.is_some());
        assert!(db.job_last_run(JOB_NAME).unwrap().is_some());
        assert!(db.domain_by_name("n-old.example").unwrap().unwrap().last_seen.is_some());
        assert!(db.domain_by_name("i-old.example").unwrap().unwrap().last_seen.is_none());
    }

    #[tokio::test]
    async fn override_caps_without_touching_probe_default() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        for i in 0..5 {
            seed(&db, &format!("d{i}.example"), DomainStatus::New, i);
        }
        let (m, probe) = load(&db, FakeProbe { name: "fake", limit: 50, ..Default::default() }, Some(2));
        let report = Scheduler::new(db, 4).run(&[m]).await.unwrap();
        assert_eq!(report.module("fake").unwrap().outcomes.len(), 2);
        assert_eq!(seen(&probe), vec!["d0.example", "d1.example"]);
        assert_eq!(probe.rate_limit(), 50);
    }

    #[tokio::test]
    async fn zero_rate_limit_still_scans_one() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        seed(&db, "a.example", DomainStatus::New, 1);
        seed(&db, "b.example", DomainStatus::New, 2);
        let (m, probe) = load(&db, FakeProbe { name: "fake", limit: 0, ..Default::default() }, None);
        Scheduler::new(db, 1).run(&[m]).await.unwrap();
        assert_eq!(seen(&probe), vec!["a.example"]);
    }

    #[tokio::test]
    async fn probe_faults_are_isolated() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let ok = seed(&db, "ok.example", DomainStatus::New, 1);
        let bad = seed(&db, "bad.example", DomainStatus::New, 2);
        seed(&db, "panics.example", DomainStatus::New, 3);
        let (flaky, _) = load(
            &db,
            FakeProbe { name: "flaky", limit: 10, fail_on: vec!["bad.example"], panic_on: vec!["panics.example"], ..Default::default() },
            None,
        );
        let (steady, steady_probe) = load(&db, FakeProbe { name: "steady", limit: 10, ..Default::default() }, None);

        let report = Scheduler::new(db.clone(), 4).run(&[flaky, steady]).await.unwrap();
        let f = report.module("flaky").unwrap();
        assert_eq!(f.status, RunStatus::Partial);
        assert_eq!(f.failed(), 2);
        assert!(f.outcomes.contains(&DomainOutcome::ProbeFault { domain_id: bad, reason: "protocol: connection reset".into() }));
        assert!(f.outcomes.iter().any(|o| matches!(o, DomainOutcome::Persisted { domain_id, .. } if *domain_id == ok)));
        let run = db.run(f.run_id.unwrap()).unwrap().unwrap();
        assert_eq!((run.status, run.domains_total, run.domains_failed), (RunStatus::Partial, 3, 2));

        let s = report.module("steady").unwrap();
        assert_eq!(s.status, RunStatus::Success);
        assert_eq!(seen(&steady_probe).len(), 3);
        assert_eq!(db.observations(bad, "fake_seen").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evidence_lands_and_score_follows() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let weights: BTreeMap<String, i64> = [("tls_self_signed".to_string(), 20)].into_iter().collect();
        db.publish_risk_model("v1", &weights, 0).unwrap();
        let d = seed(&db, "selfsigned.example", DomainStatus::New, 1);
        let (m, _) = load(
            &db,
            FakeProbe { name: "tls_fake", limit: 5, signals: vec![("tls_present", "true"), ("tls_self_signed", "true")], ..Default::default() },
            None,
        );
        let scheduler = Scheduler::new(db.clone(), 2);
        scheduler.run(&[m.clone()]).await.unwrap();

        let dom = db.domain(d).unwrap().unwrap();
        assert_eq!((dom.risk_score, dom.risk_version.as_deref()), (20, Some("v1")));
        let first = db.signal(d, "tls_self_signed").unwrap().unwrap();
        assert_eq!(db.observations(d, "fake_seen").unwrap().len(), 1);

        scheduler.run(&[m]).await.unwrap();
        let again = db.signal(d, "tls_self_signed").unwrap().unwrap();
        assert_eq!(again.first_seen_at, first.first_seen_at);
        assert_eq!(db.domain(d).unwrap().unwrap().risk_score, 20);
        assert_eq!(db.observations(d, "fake_seen").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn storage_fault_skips_only_that_domain() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let gone = seed(&db, "a-gone.example", DomainStatus::New, 1);
        let b = seed(&db, "b-ok.example", DomainStatus::New, 2);
        let c = seed(&db, "c-ok.example", DomainStatus::New, 3);
        let (m, probe) = load(
            &db,
            FakeProbe { name: "fake", limit: 10, remove_on: Some((db.clone(), "a-gone.example")), ..Default::default() },
            None,
        );

        let report = Scheduler::new(db.clone(), 1).run(&[m]).await.unwrap();
        assert_eq!(seen(&probe).len(), 3);
        let r = report.module("fake").unwrap();
        assert_eq!(r.status, RunStatus::Partial);
        assert_eq!(r.error, None);
        assert_eq!(r.failed(), 1);
        assert!(r.outcomes.iter().any(|o| matches!(o, DomainOutcome::PersistFault { domain_id, .. } if *domain_id == gone)));
        let run = db.run(r.run_id.unwrap()).unwrap().unwrap();
        assert_eq!((run.status, run.domains_total, run.domains_failed), (RunStatus::Partial, 3, 1));

        for d in [b, c] {
            assert_eq!(db.observations(d, "fake_seen").unwrap().len(), 1);
            assert!(db.domain(d).unwrap().unwrap().last_seen.is_some());
        }
    }

    #[tokio::test]
    async fn heuristic_that_stops_firing_is_cleared_and_score_drops() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let weights: BTreeMap<String, i64> =
            [("fake_risky".to_string(), 30), ("fake_other".to_string(), 5)].into_iter().collect();
        db.publish_risk_model("v1", &weights, 0).unwrap();
        let d = seed(&db, "flip.example", DomainStatus::New, 1);
        let (m, probe) = load(
            &db,
            FakeProbe {
                name: "fake",
                limit: 5,
                heuristics: &["fake_risky", "fake_other"],
                raised: Mutex::new(vec!["fake_risky"]),
                ..Default::default()
            },
            None,
        );
        let scheduler = Scheduler::new(db.clone(), 1);

        scheduler.run(&[m.clone()]).await.unwrap();
        assert_eq!(db.domain(d).unwrap().unwrap().risk_score, 30);
        let first = db.signal(d, "fake_risky").unwrap().unwrap();
        assert_eq!(first.value, "true");

        probe.raised.lock().unwrap().clear();
        scheduler.run(&[m]).await.unwrap();
        assert_eq!(db.domain(d).unwrap().unwrap().risk_score, 0);
        let cleared = db.signal(d, "fake_risky").unwrap().unwrap();
        assert_eq!(cleared.value, "false");
        assert_eq!(cleared.first_seen_at, first.first_seen_at);
        assert!(db.signal(d, "fake_other").unwrap().is_none());
    }
}
