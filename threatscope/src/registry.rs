//! Static name → constructor table for the closed set of probes.

use crate::config::ModuleConfig;
use anyhow::Result;
use evidence_sqlite::{Db, ModuleId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use threatscope_core::{Probe, ProbeError};
use tracing::{info, warn};

type Factory = fn(&ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError>;

const FACTORIES: &[(&str, Factory)] = &[
    (dns_basic::NAME, build_dns),
    (mx_check::NAME, build_mx),
    (whois_basic::NAME, build_whois),
    (tls_intel::NAME, build_tls),
    (http_fingerprint::NAME, build_http),
];

fn secs(cfg: &ModuleConfig, default: u64) -> Duration {
    Duration::from_secs(cfg.timeout_secs.unwrap_or(default).max(1))
}

fn build_dns(cfg: &ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    Ok(Arc::new(dns_basic::DnsBasic::new(secs(cfg, 5))))
}

fn build_mx(cfg: &ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    Ok(Arc::new(mx_check::MxCheck::new(secs(cfg, 5))))
}

fn build_whois(cfg: &ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    let d = whois_basic::WhoisOptions::default();
    Ok(Arc::new(whois_basic::WhoisBasic::new(whois_basic::WhoisOptions {
        timeout: secs(cfg, d.timeout.as_secs()),
        recent_days_threshold: cfg.recent_days_threshold.unwrap_or(d.recent_days_threshold),
    })))
}

fn build_tls(cfg: &ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    let d = tls_intel::TlsOptions::default();
    Ok(Arc::new(tls_intel::TlsIntel::new(tls_intel::TlsOptions {
        timeout: secs(cfg, d.timeout.as_secs()),
        min_key_bits: cfg.min_key_bits.unwrap_or(d.min_key_bits),
        recent_days: cfg.recent_days.unwrap_or(d.recent_days),
    })))
}

fn build_http(cfg: &ModuleConfig) -> Result<Arc<dyn Probe>, ProbeError> {
    let d = http_fingerprint::HttpOptions::default();
    let probe = http_fingerprint::HttpFingerprint::new(http_fingerprint::HttpOptions {
        timeout: secs(cfg, d.timeout.as_secs()),
        max_redirects: cfg.max_redirects.unwrap_or(d.max_redirects),
        brands: cfg.brands.iter().map(|b| b.trim().to_lowercase()).filter(|b| !b.is_empty()).collect(),
    })?;
    Ok(Arc::new(probe))
}

pub fn known_modules() -> impl Iterator<Item = &'static str> {
    FACTORIES.iter().map(|(name, _)| *name)
}

pub fn build_probe(name: &str, cfg: &ModuleConfig) -> Option<Result<Arc<dyn Probe>, ProbeError>> {
    FACTORIES.iter().find(|(n, _)| *n == name).map(|(_, factory)| factory(cfg))
}

/// A probe bound to its store row. The override sits beside the probe so its
/// own default stays untouched.
#[derive(Clone)]
pub struct LoadedModule {
    pub id: ModuleId,
    pub probe: Arc<dyn Probe>,
    pub rate_limit_override: Option<u32>,
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("name", &self.probe.name())
            .field("rate_limit_override", &self.rate_limit_override)
            .finish()
    }
}

impl LoadedModule {
    pub fn name(&self) -> &'static str {
        self.probe.name()
    }

    pub fn effective_rate_limit(&self) -> u32 {
        self.rate_limit_override.unwrap_or_else(|| self.probe.rate_limit()).max(1)
    }
}

/// Upsert the module row and pair it with the probe.
pub fn register(db: &Db, probe: Arc<dyn Probe>, enabled: bool, rate_limit_override: Option<u32>) -> Result<LoadedModule> {
    let id = db.register_module(probe.name(), probe.version(), enabled, rate_limit_override)?;
    Ok(LoadedModule { id, probe, rate_limit_override })
}

/// Resolve configured modules. Unknown names and probes that fail to build
/// are logged and skipped; disabled modules are recorded but not returned.
pub fn load_modules(db: &Db, modules: &BTreeMap<String, ModuleConfig>) -> Result<Vec<LoadedModule>> {
    let mut loaded = Vec::new();
    for (name, cfg) in modules {
        let probe = match build_probe(name, cfg) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                warn!(module = %name, error = %e, "Module failed to initialise, skipping.");
                continue;
            }
            None => {
                let known: Vec<&str> = known_modules().collect();
                warn!(module = %name, known = ?known, "Unknown module in configuration, skipping.");
                continue;
            }
        };
        let rate_limit_override = match cfg.rate_limit {
            Some(0) => {
                warn!(module = %name, "rate_limit must be positive, using module default.");
                None
            }
            other => other,
        };
        let m = register(db, probe, cfg.enabled, rate_limit_override)?;
        if cfg.enabled {
            info!(module = m.name(), version = m.probe.version(), rate_limit = m.effective_rate_limit(), "Module loaded.");
            loaded.push(m);
        }
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_default_module_has_a_factory() {
        let cfg = crate::config::Config::default();
        for name in cfg.modules.keys() {
            assert!(known_modules().any(|k| k == name), "{name}");
        }
    }

    #[test]
    fn unknown_and_disabled_modules_are_skipped() {
        let db = Db::open_in_memory().unwrap();
        let mut modules = BTreeMap::new();
        modules.insert("dns_basic".to_string(), ModuleConfig { rate_limit: Some(3), ..ModuleConfig::default() });
        modules.insert("mx_check".to_string(), ModuleConfig { enabled: false, ..ModuleConfig::default() });
        modules.insert("no_such_probe".to_string(), ModuleConfig::default());

        let loaded = load_modules(&db, &modules).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name(), "dns_basic");
        assert_eq!(loaded[0].effective_rate_limit(), 3);
        assert_eq!(loaded[0].probe.rate_limit(), 60);

        let rows = db.modules().unwrap();
        assert_eq!(rows.len(), 2);
        let mx = rows.iter().find(|m| m.name == "mx_check").unwrap();
        assert!(!mx.enabled);
    }

    #[test]
    fn zero_override_falls_back_to_default() {
        let db = Db::open_in_memory().unwrap();
        let mut modules = BTreeMap::new();
        modules.insert("whois_basic".to_string(), ModuleConfig { rate_limit: Some(0), ..ModuleConfig::default() });
        let loaded = load_modules(&db, &modules).unwrap();
        assert_eq!(loaded[0].rate_limit_override, None);
        assert_eq!(loaded[0].effective_rate_limit(), 10);
    }
}
