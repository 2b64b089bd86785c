//! TLS certificate inspection on port 443.
//!
//! The handshake accepts any certificate: the point is to look at what a
//! suspicious host presents, not to trust it.

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use threatscope_core::{format_ms, now_ms, Probe, ProbeError, ProbeOutput, DAY_MS};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const NAME: &str = "tls_intel";
pub const HEURISTICS: &[&str] = &[
    "tls_self_signed",
    "tls_hostname_mismatch",
    "tls_weak_key",
    "tls_recently_issued",
    "tls_expired",
];

#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub timeout: Duration,
    pub min_key_bits: u32,
    pub recent_days: i64,
}

impl Default for TlsOptions {
    fn default() -> Self {
        TlsOptions { timeout: Duration::from_secs(10), min_key_bits: 2048, recent_days: 14 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsIntel {
    opts: TlsOptions,
}

impl TlsIntel {
    pub fn new(opts: TlsOptions) -> Self {
        TlsIntel { opts }
    }
}

/// What we keep from the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFacts {
    pub subject_cn: Option<String>,
    pub issuer_cn: Option<String>,
    pub not_before_ms: i64,
    pub not_after_ms: i64,
    pub sans: Vec<String>,
    pub key_bits: Option<u32>,
    pub rsa_key: bool,
    pub self_signed: bool,
    pub sha256: String,
}

#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn client_config() -> Result<ClientConfig, ProbeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::Internal(format!("tls config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
        .with_no_client_auth();
    Ok(config)
}

async fn fetch_leaf(domain: &str, wait: Duration) -> Result<Option<Vec<u8>>, ProbeError> {
    let connector = TlsConnector::from(Arc::new(client_config()?));
    let server_name = ServerName::try_from(domain.to_owned())
        .map_err(|_| ProbeError::Protocol(format!("invalid server name: {domain}")))?;

    let stream = match timeout(wait, TcpStream::connect((domain, 443))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(domain, error = %e, "TLS connect failed.");
            return Ok(None);
        }
        Err(_) => {
            debug!(domain, "TLS connect timed out.");
            return Ok(None);
        }
    };
    let tls = match timeout(wait, connector.connect(server_name, stream)).await {
        Ok(Ok(t)) => t,
        Ok(Err(e)) => {
            debug!(domain, error = %e, "TLS handshake failed.");
            return Ok(None);
        }
        Err(_) => {
            debug!(domain, "TLS handshake timed out.");
            return Ok(None);
        }
    };
    let (_, conn) = tls.get_ref();
    Ok(conn.peer_certificates().and_then(|c| c.first()).map(|c| c.as_ref().to_vec()))
}

fn first_cn(name: &x509_parser::x509::X509Name<'_>) -> Option<String> {
    name.iter_common_name().next().and_then(|cn| cn.as_str().ok()).map(str::to_owned)
}

pub fn parse_cert(der: &[u8]) -> Option<CertFacts> {
    use x509_parser::prelude::*;
    use x509_parser::public_key::PublicKey;

    let (_, x509) = X509Certificate::from_der(der).ok()?;
    let sans = match x509.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|gn| match gn {
                GeneralName::DNSName(name) => Some(name.to_ascii_lowercase()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let (key_bits, rsa_key) = match x509.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => (Some(rsa.key_size() as u32), true),
        Ok(PublicKey::EC(ec)) => (Some(ec.key_size() as u32), false),
        _ => (None, false),
    };
    Some(CertFacts {
        subject_cn: first_cn(x509.subject()),
        issuer_cn: first_cn(x509.issuer()),
        not_before_ms: x509.validity().not_before.timestamp() * 1000,
        not_after_ms: x509.validity().not_after.timestamp() * 1000,
        sans,
        key_bits,
        rsa_key,
        self_signed: x509.subject().as_raw() == x509.issuer().as_raw(),
        sha256: hex::encode(Sha256::digest(der)),
    })
}

/// `*.example.com` covers exactly one extra label.
pub fn hostname_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .split_once('.')
            .is_some_and(|(label, rest)| !label.is_empty() && rest == suffix),
        None => pattern == host,
    }
}

pub fn covers(facts: &CertFacts, host: &str) -> bool {
    if facts.sans.is_empty() {
        return facts.subject_cn.as_deref().is_some_and(|cn| hostname_matches(cn, host));
    }
    facts.sans.iter().any(|san| hostname_matches(san, host))
}

pub fn build_output(domain: &str, facts: &CertFacts, opts: &TlsOptions, now: i64) -> ProbeOutput {
    let mut out = ProbeOutput::new();
    if let Some(cn) = &facts.subject_cn {
        out.observe("tls_subject_cn", cn.as_str());
    }
    if let Some(cn) = &facts.issuer_cn {
        out.observe("tls_issuer_cn", cn.as_str());
    }
    let age_days = (now - facts.not_before_ms).div_euclid(DAY_MS);
    out.observe("tls_not_before", format_ms(facts.not_before_ms))
        .observe("tls_not_after", format_ms(facts.not_after_ms))
        .observe("tls_cert_age_days", age_days.to_string())
        .observe("tls_sans", facts.sans.join(", "))
        .observe("tls_sans_count", facts.sans.len().to_string())
        .observe("tls_fingerprint_sha256", facts.sha256.as_str());
    if let Some(bits) = facts.key_bits {
        out.observe("tls_key_bits", bits.to_string());
    }

    // min_key_bits is an RSA modulus size
    let weak = facts.rsa_key && facts.key_bits.is_some_and(|b| b < opts.min_key_bits);
    out.flag("tls_present", true)
        .raise("tls_self_signed", facts.self_signed)
        .raise("tls_hostname_mismatch", !covers(facts, domain))
        .raise("tls_weak_key", weak)
        .raise("tls_recently_issued", (0..=opts.recent_days).contains(&age_days))
        .raise("tls_expired", facts.not_after_ms < now);
    out
}

#[async_trait]
impl Probe for TlsIntel {
    fn name(&self) -> &'static str { NAME }
    fn version(&self) -> &'static str { "1.0.0" }
    fn rate_limit(&self) -> u32 { 30 }
    fn heuristics(&self) -> &'static [&'static str] { HEURISTICS }

    async fn run(&self, domain: &str) -> Result<ProbeOutput, ProbeError> {
        let Some(der) = fetch_leaf(domain, self.opts.timeout).await? else {
            return Ok(ProbeOutput::absent("tls_present"));
        };
        match parse_cert(&der) {
            Some(facts) => Ok(build_output(domain, &facts, &self.opts, now_ms())),
            None => {
                debug!(domain, "Unparseable leaf certificate.");
                Ok(ProbeOutput::absent("tls_present"))
            }
        }
    }
}
