//! Core contract and shared types for the threatscope pipeline.
//!
//! Every probe module implements [`Probe`]; the scheduler only ever talks to
//! probes through this trait and persists whatever [`ProbeOutput`] they return.

pub mod workers;

use async_trait::async_trait;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub const DAY_MS: i64 = 86_400_000;

/// Observation key the HTTP probe writes its favicon digest under.
pub const FAVICON_HASH_KEY: &str = "favicon_hash_md5";
/// Derived signal set on every domain whose favicon digest is shared.
pub const FAVICON_REUSED_SIGNAL: &str = "favicon_hash_reused";

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Render Unix milliseconds as RFC 3339 (UTC). Falls back to the raw number.
pub fn format_ms(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| ms.to_string())
}

/// Evidence values are strings; a signal counts as set when it reads `true` in any case.
pub fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

pub fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("empty domain")]
    Empty,
    #[error("invalid domain: {0}")]
    Invalid(String),
}

/// A normalized hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target(pub String);

impl Target {
    /// Lowercase, strip scheme/path/port/trailing dot and validate the label charset.
    pub fn parse(input: &str) -> Result<Self, TargetError> {
        let mut s = input.trim().to_ascii_lowercase();
        for scheme in ["https://", "http://"] {
            if let Some(rest) = s.strip_prefix(scheme) {
                s = rest.to_string();
            }
        }
        if let Some(idx) = s.find(['/', '?', '#']) {
            s.truncate(idx);
        }
        if let Some(idx) = s.find(':') {
            s.truncate(idx);
        }
        let s = s.trim_end_matches('.').to_string();
        if s.is_empty() {
            return Err(TargetError::Empty);
        }
        let labels_ok = s.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
        if !labels_ok || !s.contains('.') || s.len() > 253 {
            return Err(TargetError::Invalid(input.trim().to_string()));
        }
        Ok(Target(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalReading {
    pub name: String,
    pub value: String,
}

/// Raw facts returned by one probe for one domain, in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeOutput {
    pub observations: Vec<Observation>,
    pub signals: Vec<SignalReading>,
}

impl ProbeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output for "nothing there": only the presence signal, set to `false`.
    pub fn absent(presence_signal: &str) -> Self {
        let mut out = Self::new();
        out.flag(presence_signal, false);
        out
    }

    pub fn observe(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.observations.push(Observation { key: key.into(), value: value.into() });
        self
    }

    pub fn signal(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.signals.push(SignalReading { name: name.into(), value: value.into() });
        self
    }

    /// Presence-style signal, recorded as `true` or `false`.
    pub fn flag(&mut self, name: impl Into<String>, value: bool) -> &mut Self {
        self.signal(name, flag(value))
    }

    /// Risk heuristic: recorded only when it fires, so its first sighting
    /// is the moment it became true. The scheduler resets a stored `true`
    /// to `false` when a run stops raising it (see [`Probe::heuristics`]).
    pub fn raise(&mut self, name: impl Into<String>, fired: bool) -> &mut Self {
        if fired {
            self.signal(name, flag(true));
        }
        self
    }

    pub fn signal_value(&self, name: &str) -> Option<&str> {
        self.signals.iter().rev().find(|s| s.name == name).map(|s| s.value.as_str())
    }

    pub fn observed(&self, key: &str) -> Vec<&str> {
        self.observations.iter().filter(|o| o.key == key).map(|o| o.value.as_str()).collect()
    }
}

/// Unexpected faults inside a probe. Absence of data is never one of these.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("internal: {0}")]
    Internal(String),
}

/// A single named, versioned capability that inspects one domain.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Stable key, matches the `modules.name` column.
    fn name(&self) -> &'static str;
    fn version(&self) -> &'static str;
    /// Self-declared default batch budget per scheduler invocation.
    fn rate_limit(&self) -> u32;
    /// Signals this probe only ever [`raise`](ProbeOutput::raise)s.
    fn heuristics(&self) -> &'static [&'static str] {
        &[]
    }
    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn target_normalizes_urls_and_case() {
        assert_eq!(Target::parse("  HTTPS://Example.COM:8443/login?x=1 ").unwrap().as_str(), "example.com");
        assert_eq!(Target::parse("sub.example.org.").unwrap().as_str(), "sub.example.org");
        assert_eq!(Target::parse("www.example.net").unwrap().as_str(), "www.example.net");
    }

    #[test]
    fn target_rejects_garbage() {
        assert_eq!(Target::parse("   "), Err(TargetError::Empty));
        assert!(Target::parse("localhost").is_err());
        assert!(Target::parse("bad_name.com").is_err());
        assert!(Target::parse("-lead.com").is_err());
        assert!(Target::parse("a..b.com").is_err());
    }

    #[test]
    fn truthiness_is_case_insensitive() {
        assert!(is_true("true"));
        assert!(is_true("TRUE"));
        assert!(is_true(" True "));
        assert!(!is_true("1"));
        assert!(!is_true("false"));
        assert!(!is_true(""));
    }

    #[test]
    fn absent_output_only_carries_presence_flag() {
        let out = ProbeOutput::absent("has_dns");
        assert!(out.observations.is_empty());
        assert_eq!(out.signal_value("has_dns"), Some("false"));
    }

    #[test]
    fn output_builders_keep_order() {
        let mut out = ProbeOutput::new();
        out.observe("dns_a", "192.0.2.1").observe("dns_a", "192.0.2.2").flag("has_dns", true);
        assert_eq!(out.observed("dns_a"), vec!["192.0.2.1", "192.0.2.2"]);
        assert_eq!(out.signal_value("has_dns"), Some("true"));
    }

    #[test]
    fn raise_only_records_fired_heuristics() {
        let mut out = ProbeOutput::new();
        out.raise("tls_self_signed", false).raise("tls_expired", true);
        assert_eq!(out.signals.len(), 1);
        assert_eq!(out.signal_value("tls_self_signed"), None);
        assert_eq!(out.signal_value("tls_expired"), Some("true"));
    }

    #[test]
    fn format_ms_renders_rfc3339() {
        assert_eq!(format_ms(0), "1970-01-01T00:00:00Z");
        assert!(now_ms() > 1_600_000_000_000);
    }
}
