//! MX presence and mail-provider inference.

use async_trait::async_trait;
use dns_basic::{resolver, trim_name};
use hickory_resolver::error::ResolveErrorKind;
use std::time::Duration;
use threatscope_core::{Probe, ProbeError, ProbeOutput};
use tracing::debug;

pub const NAME: &str = "mx_check";

#[derive(Debug, Clone)]
pub struct MxCheck {
    timeout: Duration,
}

impl MxCheck {
    pub fn new(timeout: Duration) -> Self {
        MxCheck { timeout }
    }
}

impl Default for MxCheck {
    fn default() -> Self {
        MxCheck::new(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub host: String,
    pub preference: u16,
}

const PROVIDERS: &[(&str, &[&str])] = &[
    ("google", &["google.com", "googlemail.com"]),
    ("microsoft", &["outlook.com", "protection.outlook.com"]),
    ("proofpoint", &["pphosted.com"]),
    ("mimecast", &["mimecast.com"]),
];

/// Best-effort provider name from the MX host list.
pub fn guess_provider<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Option<&'static str> {
    let joined = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect::<Vec<_>>().join(" ");
    PROVIDERS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| joined.contains(n)))
        .map(|(name, _)| *name)
}

pub fn build_output(records: &[MxRecord]) -> ProbeOutput {
    let mut out = ProbeOutput::new();
    for r in records {
        out.observe("mx_host", r.host.as_str());
        out.observe("mx_weight", r.preference.to_string());
    }
    let has_mx = !records.is_empty();
    out.flag("has_mx", has_mx);
    out.flag("mx_missing", !has_mx);
    if let Some(provider) = guess_provider(records.iter().map(|r| r.host.as_str())) {
        out.observe("mx_provider_guess", provider);
        out.signal("mx_provider", provider);
    }
    out
}

#[async_trait]
impl Probe for MxCheck {
    fn name(&self) -> &'static str { NAME }
    fn version(&self) -> &'static str { "1.0.0" }
    fn rate_limit(&self) -> u32 { 60 }

    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
        let records = match resolver(self.timeout).mx_lookup(domain).await {
            Ok(lookup) => {
                let mut v: Vec<MxRecord> = lookup
                    .iter()
                    .map(|mx| MxRecord { host: trim_name(mx.exchange()), preference: mx.preference() })
                    .collect();
                v.sort_by(|a, b| a.preference.cmp(&b.preference).then_with(|| a.host.cmp(&b.host)));
                v
            }
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Vec::new(),
            Err(e) => {
                debug!(domain, error = %e, "MX lookup failed; treating as absent.");
                Vec::new()
            }
        };
        Ok(build_output(&records))
    }
}
