use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "threatscope.yaml";

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub database: PathBuf,
    pub workers: usize,
    pub logging: LoggingConfig,
    pub modules: BTreeMap<String, ModuleConfig>,
    pub scoring: ScoringConfig,
    pub alerts: AlertsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let modules = ["dns_basic", "mx_check", "whois_basic", "tls_intel", "http_fingerprint"]
            .into_iter()
            .map(|name| (name.to_string(), ModuleConfig::default()))
            .collect();
        Config {
            database: PathBuf::from("threatscope.db"),
            workers: 8,
            logging: LoggingConfig::default(),
            modules,
            scoring: ScoringConfig::default(),
            alerts: AlertsConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: "info".into() }
    }
}

/// Per-module switches. Knobs a module does not understand are ignored.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModuleConfig {
    pub enabled: bool,
    pub rate_limit: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub recent_days_threshold: Option<i64>,
    pub min_key_bits: Option<u32>,
    pub recent_days: Option<i64>,
    pub max_redirects: Option<usize>,
    pub brands: Vec<String>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        ModuleConfig {
            enabled: true,
            rate_limit: None,
            timeout_secs: None,
            recent_days_threshold: None,
            min_key_bits: None,
            recent_days: None,
            max_redirects: None,
            brands: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScoringConfig {
    pub version: String,
    pub weights: BTreeMap<String, i64>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let weights = [
            ("whois_recent_registration", 20),
            ("whois_privacy_enabled", 10),
            ("mx_missing", 10),
            ("tls_self_signed", 20),
            ("tls_hostname_mismatch", 20),
            ("tls_weak_key", 15),
            ("http_login_brand_impersonation", 30),
            ("favicon_hash_reused", 25),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        ScoringConfig { version: "v1".into(), weights }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub high_threshold: i64,
    pub critical_threshold: i64,
    pub high_risk_signals: Vec<String>,
    pub lookback_days: i64,
    pub email: EmailConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        AlertsConfig {
            enabled: true,
            high_threshold: 70,
            critical_threshold: 90,
            high_risk_signals: [
                "whois_recent_registration",
                "tls_self_signed",
                "tls_hostname_mismatch",
                "favicon_hash_reused",
                "http_login_brand_impersonation",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            lookback_days: 7,
            email: EmailConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Sendmail,
    Log,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub to: Vec<String>,
    pub from: String,
    pub subject_prefix: String,
    pub batch_size: usize,
    pub transport: TransportKind,
    pub sendmail_path: PathBuf,
}

impl Default for EmailConfig {
    fn default() -> Self {
        EmailConfig {
            enabled: true,
            to: Vec::new(),
            from: "threatscope@localhost".into(),
            subject_prefix: "[ThreatScope]".into(),
            batch_size: 200,
            transport: TransportKind::Sendmail,
            sendmail_path: PathBuf::from("/usr/sbin/sendmail"),
        }
    }
}

/// Load `path`, else `./threatscope.yaml` when present, else defaults.
/// A file that exists but does not parse is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing config {}", path.display()))
}

pub fn parse_config(yaml: &str) -> Result<Config> {
    if yaml.trim().is_empty() {
        return Ok(Config::default());
    }
    let cfg: Config = serde_yaml::from_str(yaml)?;
    Ok(cfg)
}
