//! DNS presence probe: A, AAAA, CNAME and NS records.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::proto::rr::RecordType;
use hickory_resolver::TokioAsyncResolver;
use std::time::Duration;
use threatscope_core::{Probe, ProbeError, ProbeOutput};
use tracing::debug;

pub const NAME: &str = "dns_basic";

#[derive(Debug, Clone)]
pub struct DnsBasic {
    timeout: Duration,
}

impl DnsBasic {
    pub fn new(timeout: Duration) -> Self {
        DnsBasic { timeout }
    }
}

impl Default for DnsBasic {
    fn default() -> Self {
        DnsBasic::new(Duration::from_secs(5))
    }
}

/// Raw answers, already reduced to display strings without trailing dots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsRecords {
    pub a: Vec<String>,
    pub aaaa: Vec<String>,
    pub cname: Vec<String>,
    pub ns: Vec<String>,
}

impl DnsRecords {
    pub fn into_output(self) -> ProbeOutput {
        let mut out = ProbeOutput::new();
        for v in &self.a { out.observe("dns_a", v.as_str()); }
        for v in &self.aaaa { out.observe("dns_aaaa", v.as_str()); }
        for v in &self.cname { out.observe("dns_cname", v.as_str()); }
        for v in &self.ns { out.observe("dns_ns", v.as_str()); }
        let has_any = !out.observations.is_empty();
        out.flag("has_dns", has_any);
        out
    }
}

pub fn resolver(timeout: Duration) -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;
    opts.attempts = 2;
    TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
}

pub fn trim_name(name: impl ToString) -> String {
    name.to_string().trim_end_matches('.').to_ascii_lowercase()
}

/// Empty answers and lookup failures both mean "no data" for this probe.
fn answers<T>(what: &str, domain: &str, res: Result<Vec<T>, ResolveError>) -> Vec<T> {
    match res {
        Ok(v) => v,
        Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Vec::new(),
        Err(e) => {
            debug!(domain, record = what, error = %e, "DNS lookup failed; treating as absent.");
            Vec::new()
        }
    }
}

#[async_trait]
impl Probe for DnsBasic {
    fn name(&self) -> &'static str { NAME }
    fn version(&self) -> &'static str { "1.0.0" }
    fn rate_limit(&self) -> u32 { 60 }

    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
        let resolver = resolver(self.timeout);
        let (a, aaaa, cname, ns) = tokio::join!(
            resolver.ipv4_lookup(domain),
            resolver.ipv6_lookup(domain),
            resolver.lookup(domain, RecordType::CNAME),
            resolver.ns_lookup(domain),
        );
        let records = DnsRecords {
            a: answers("A", domain, a.map(|l| l.iter().map(|r| r.to_string()).collect())),
            aaaa: answers("AAAA", domain, aaaa.map(|l| l.iter().map(|r| r.to_string()).collect())),
            cname: answers(
                "CNAME",
                domain,
                cname.map(|l| l.iter().filter_map(|r| r.as_cname()).map(|c| trim_name(&c.0)).collect()),
            ),
            ns: answers("NS", domain, ns.map(|l| l.iter().map(|r| trim_name(&r.0)).collect())),
        };
        debug!(domain, a = records.a.len(), ns = records.ns.len(), "DNS probe finished.");
        Ok(records.into_output())
    }
}
