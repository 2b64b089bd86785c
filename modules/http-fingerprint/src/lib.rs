use async_trait::async_trait;
use regex::Regex;
use reqwest::{header::HeaderMap, redirect::Policy, Client};
use std::sync::OnceLock;
use std::time::Duration;
use threatscope_core::{Probe, ProbeError, ProbeOutput, FAVICON_HASH_KEY};
use tracing::debug;
use url::Url;

pub const NAME: &str = "http_fingerprint";
pub const HEURISTICS: &[&str] = &[
    "phishy_title",
    "http_redirect_chain",
    "http_login_form",
    "http_suspicious_server",
    "http_login_brand_impersonation",
];

const USER_AGENT: &str = "Mozilla/5.0 (ThreatScope)";
const BODY_LIMIT: usize = 512 * 1024;
const FAVICON_MIN_BYTES: usize = 100;
const PHISHY_TITLE_WORDS: &[&str] = &["login", "verify", "secure", "account", "update", "confirm", "password", "webmail"];
const SUSPICIOUS_SERVERS: &[&str] = &["openresty", "nginx/1.18.0", "apache/2.4.49"];

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub timeout: Duration,
    pub max_redirects: usize,
    /// Lowercase brand keywords checked against login pages.
    pub brands: Vec<String>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions { timeout: Duration::from_secs(15), max_redirects: 5, brands: Vec::new() }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFingerprint {
    opts: HttpOptions,
    client: Client,
}

impl HttpFingerprint {
    pub fn new(opts: HttpOptions) -> Result<Self, ProbeError> {
        // redirects are walked by hand so every hop is counted
        let client = Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(10).min(opts.timeout))
            .timeout(opts.timeout)
            .user_agent(USER_AGENT)
            .brotli(true)
            .gzip(true)
            .deflate(true)
            .build()
            .map_err(|e| ProbeError::Internal(format!("http client: {e}")))?;
        Ok(HttpFingerprint { opts, client })
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub final_url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub redirects: usize,
}

async fn fetch_page(client: &Client, start: Url, max_redirects: usize) -> Result<Page, ProbeError> {
    let mut url = start;
    let mut redirects = 0;
    loop {
        let resp = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ProbeError::Protocol(e.to_string()))?;
        let status = resp.status();
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| url.join(loc).ok());
        if let (true, Some(next)) = (status.is_redirection(), location) {
            if redirects < max_redirects {
                redirects += 1;
                url = next;
                continue;
            }
        }
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(|e| ProbeError::Protocol(e.to_string()))?;
        let body = String::from_utf8_lossy(&bytes[..bytes.len().min(BODY_LIMIT)]).to_string();
        return Ok(Page { final_url: url, status: status.as_u16(), headers, body, redirects });
    }
}

async fn fetch_favicon(client: &Client, candidates: &[Url]) -> Option<Vec<u8>> {
    for url in candidates {
        let resp = match client.get(url.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %url, error = %e, "Favicon fetch failed.");
                continue;
            }
        };
        if resp.status().as_u16() >= 400 {
            continue;
        }
        match resp.bytes().await {
            Ok(b) if b.len() >= FAVICON_MIN_BYTES => return Some(b.to_vec()),
            _ => continue,
        }
    }
    None
}

fn decode_entities(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

pub fn extract_title(body: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `body`
    let lower = body.to_ascii_lowercase();
    let s = lower.find("<title")?;
    let gt = s + lower[s..].find('>')?;
    let end = gt + 1 + lower[gt + 1..].find("</title>")?;
    let t = body[gt + 1..end].split_whitespace().collect::<Vec<_>>().join(" ");
    let t = decode_entities(&t);
    (!t.is_empty()).then_some(t)
}

pub fn looks_phishy_title(title: &str) -> bool {
    let t = title.to_lowercase();
    PHISHY_TITLE_WORDS.iter().any(|k| t.contains(k))
}

fn regex(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

pub fn has_login_form(body: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    regex(&RE, r#"(?i)type\s*=\s*["']?password"#).is_some_and(|re| re.is_match(body))
}

pub fn is_suspicious_server(server: &str) -> bool {
    let s = server.to_lowercase();
    SUSPICIOUS_SERVERS.iter().any(|b| s.contains(b))
}

/// `<link rel="icon">` hrefs resolved against `base`, then `/favicon.ico`.
pub fn favicon_candidates(base: &Url, body: &str) -> Vec<Url> {
    static LINK: OnceLock<Option<Regex>> = OnceLock::new();
    static HREF: OnceLock<Option<Regex>> = OnceLock::new();
    let mut out: Vec<Url> = Vec::new();
    if let (Some(link), Some(href)) = (
        regex(&LINK, r#"(?i)<link[^>]+rel\s*=\s*["']?(?:shortcut icon|icon)["']?[^>]*>"#),
        regex(&HREF, r#"(?i)href\s*=\s*["']([^"']+)["']"#),
    ) {
        for tag in link.find_iter(body) {
            let resolved = href
                .captures(tag.as_str())
                .and_then(|c| c.get(1))
                .and_then(|m| base.join(m.as_str().trim()).ok());
            if let Some(u) = resolved {
                if !out.contains(&u) {
                    out.push(u);
                }
            }
        }
    }
    if let Ok(fallback) = base.join("/favicon.ico") {
        if !out.contains(&fallback) {
            out.push(fallback);
        }
    }
    out
}

pub fn favicon_hash(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Brand keywords present on a login page served from a domain not carrying that brand.
pub fn impersonated_brand<'a>(domain: &str, title: Option<&str>, body: &str, brands: &'a [String]) -> Option<&'a str> {
    let title = title.unwrap_or("").to_lowercase();
    let body = body.to_lowercase();
    let domain = domain.to_lowercase();
    brands
        .iter()
        .map(|b| b.trim())
        .filter(|b| !b.is_empty())
        .find(|b| {
            let b = b.to_lowercase();
            (title.contains(&b) || body.contains(&b)) && !domain.contains(&b)
        })
}

/// Evidence from a fetched page; favicon hashing is layered on by the probe.
pub fn analyze(domain: &str, page: &Page, brands: &[String]) -> ProbeOutput {
    let mut out = ProbeOutput::new();
    out.flag("http_present", true);
    out.observe("http_status", page.status.to_string())
        .observe("http_final_url", page.final_url.as_str())
        .observe("http_redirect_count", page.redirects.to_string());
    for name in page.headers.keys() {
        if let Some(v) = page.headers.get(name).and_then(|v| v.to_str().ok()) {
            out.observe(format!("http_header_{}", name.as_str()), v);
        }
    }

    let title = extract_title(&page.body);
    if let Some(t) = &title {
        out.observe("http_title", t.as_str());
    }
    let login = has_login_form(&page.body);
    let server = page
        .headers
        .get(reqwest::header::SERVER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    out.raise("phishy_title", title.as_deref().is_some_and(looks_phishy_title))
        .raise("http_redirect_chain", page.redirects >= 2)
        .raise("http_login_form", login)
        .raise("http_suspicious_server", is_suspicious_server(server))
        .raise(
            "http_login_brand_impersonation",
            login && impersonated_brand(domain, title.as_deref(), &page.body, brands).is_some(),
        );
    out
}

#[async_trait]
impl Probe for HttpFingerprint {
    fn name(&self) -> &'static str { NAME }
    fn version(&self) -> &'static str { "1.1.0" }
    fn rate_limit(&self) -> u32 { 30 }
    fn heuristics(&self) -> &'static [&'static str] { HEURISTICS }

    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
        let mut page = None;
        for scheme in ["https", "http"] {
            let start = Url::parse(&format!("{scheme}://{domain}/"))
                .map_err(|e| ProbeError::Protocol(format!("bad url for {domain}: {e}")))?;
            match fetch_page(&self.client, start, self.opts.max_redirects).await {
                Ok(p) => {
                    page = Some(p);
                    break;
                }
                Err(e) => debug!(domain, scheme, error = %e, "HTTP fetch failed."),
            }
        }
        let Some(page) = page else {
            return Ok(ProbeOutput::absent("http_present"));
        };

        let mut out = analyze(domain, &page, &self.opts.brands);
        let icon = fetch_favicon(&self.client, &favicon_candidates(&page.final_url, &page.body)).await;
        match icon {
            Some(bytes) => {
                out.observe(FAVICON_HASH_KEY, favicon_hash(&bytes));
                out.flag("favicon_present", true);
            }
            None => {
                out.flag("favicon_present", false);
            }
        }
        Ok(out)
    }
}
