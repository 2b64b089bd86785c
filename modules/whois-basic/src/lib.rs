//! WHOIS lookup over port 43 with IANA referral: registration age,
//! registrar and privacy-service detection.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use threatscope_core::{now_ms, Probe, ProbeError, ProbeOutput, DAY_MS};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const NAME: &str = "whois_basic";
pub const HEURISTICS: &[&str] = &["whois_recent_registration", "whois_privacy_enabled"];
const IANA_SERVER: &str = "whois.iana.org";
const RAW_LIMIT: usize = 8000;
const RESPONSE_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WhoisOptions {
    pub timeout: Duration,
    pub recent_days_threshold: i64,
}

impl Default for WhoisOptions {
    fn default() -> Self {
        WhoisOptions { timeout: Duration::from_secs(10), recent_days_threshold: 30 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WhoisBasic {
    opts: WhoisOptions,
}

impl WhoisBasic {
    pub fn new(opts: WhoisOptions) -> Self {
        WhoisBasic { opts }
    }
}

async fn query(server: &str, q: &str, wait: Duration) -> std::io::Result<String> {
    let mut stream = timeout(wait, TcpStream::connect((server, 43))).await??;
    timeout(wait, stream.write_all(format!("{q}\r\n").as_bytes())).await??;
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = timeout(wait, stream.read(&mut chunk)).await??;
        if n == 0 || buf.len() >= RESPONSE_LIMIT { break; }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn field(text: &str, labels: &[&str]) -> Option<String> {
    text.lines().find_map(|line| {
        let (label, value) = line.trim().split_once(':')?;
        let value = value.trim();
        (!value.is_empty() && labels.iter().any(|l| label.trim().eq_ignore_ascii_case(l))).then(|| value.to_string())
    })
}

/// `refer:` (IANA) or `Registrar WHOIS Server:` (thin registries).
pub fn referral(text: &str) -> Option<String> {
    field(text, &["refer", "whois", "Registrar WHOIS Server"])
        .map(|s| s.trim_start_matches("whois://").trim_end_matches('/').to_ascii_lowercase())
        .filter(|s| !s.is_empty() && !s.contains(' '))
}

pub fn creation_date(text: &str) -> Option<String> {
    field(text, &["Creation Date", "Created On", "created", "Registered on", "Registration Time", "Domain Registration Date"])
}

pub fn registrar(text: &str) -> Option<String> {
    field(text, &["Registrar", "Sponsoring Registrar", "registrar"])
}

fn privacy_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(redacted for privacy|whoisguard|domains by proxy|contact privacy|withheldforprivacy|privacy service|privacyprotect|data protected|identity protection)").ok()
    })
    .as_ref()
}

pub fn privacy_enabled(text: &str) -> bool {
    privacy_re().is_some_and(|re| re.is_match(text))
}

/// Accepts RFC 3339 and plain `YYYY-MM-DD` (also with `.` or `/` separators) prefixes.
pub fn parse_created_ms(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(t) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some((t.unix_timestamp_nanos() / 1_000_000) as i64);
    }
    let day: String = raw.chars().take(10).map(|c| if c == '.' || c == '/' { '-' } else { c }).collect();
    let date = Date::parse(&day, format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.midnight().assume_utc().unix_timestamp() * 1000)
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Turn registry/registrar text into evidence. `now` is Unix milliseconds.
pub fn build_output(server: &str, text: &str, recent_days_threshold: i64, now: i64) -> ProbeOutput {
    if text.trim().is_empty() {
        return ProbeOutput::absent("whois_available");
    }
    let mut out = ProbeOutput::new();
    out.observe("whois_server", server);
    out.observe("whois_raw", truncate_chars(text, RAW_LIMIT));
    out.flag("whois_available", true);

    if let Some(created) = creation_date(text) {
        out.observe("domain_created", created.as_str());
        if let Some(created_ms) = parse_created_ms(&created) {
            let age_days = (now - created_ms).div_euclid(DAY_MS);
            out.observe("domain_age_days", age_days.to_string());
            out.raise("whois_recent_registration", (0..=recent_days_threshold).contains(&age_days));
        }
    }
    if let Some(r) = registrar(text) {
        out.observe("registrar", r);
    }
    out.raise("whois_privacy_enabled", privacy_enabled(text));
    out
}

#[async_trait]
impl Probe for WhoisBasic {
    fn name(&self) -> &'static str { NAME }
    fn version(&self) -> &'static str { "1.0.0" }
    // registries throttle hard
    fn rate_limit(&self) -> u32 { 10 }
    fn heuristics(&self) -> &'static [&'static str] { HEURISTICS }

    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
        let wait = self.opts.timeout;
        let tld = domain.rsplit('.').next().unwrap_or(domain);
        let server = match query(IANA_SERVER, tld, wait).await {
            Ok(text) => referral(&text),
            Err(e) => {
                debug!(domain, error = %e, "IANA referral lookup failed.");
                None
            }
        };
        let Some(server) = server else {
            return Ok(ProbeOutput::absent("whois_available"));
        };

        let mut text = match query(&server, domain, wait).await {
            Ok(t) => t,
            Err(e) => {
                debug!(domain, server = %server, error = %e, "WHOIS query failed.");
                return Ok(ProbeOutput::absent("whois_available"));
            }
        };
        let mut answered_by = server.clone();
        if let Some(registrar_server) = referral(&text).filter(|s| *s != server) {
            match query(&registrar_server, domain, wait).await {
                Ok(more) if !more.trim().is_empty() => {
                    text = format!("{more}\n{text}");
                    answered_by = registrar_server;
                }
                Ok(_) => {}
                Err(e) => debug!(domain, server = %registrar_server, error = %e, "Registrar WHOIS query failed."),
            }
        }
        Ok(build_output(&answered_by, &text, self.opts.recent_days_threshold, now_ms()))
    }
}
