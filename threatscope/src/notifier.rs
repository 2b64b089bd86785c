//! Delivery of pending high/critical alerts. An alert is marked sent only
//! after its transport accepts it; anything else stays pending for the
//! next invocation.

use crate::config::{EmailConfig, TransportKind};
use anyhow::{anyhow, Context, Result};
use evidence_sqlite::{AlertId, Db, PendingAlert, Severity};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use threatscope_core::{format_ms, now_ms};
use tracing::{info, warn};

pub const JOB_NAME: &str = "send-alerts";
pub const EMAIL_SEVERITIES: [Severity; 2] = [Severity::High, Severity::Critical];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
}

fn header_value(s: &str) -> String {
    s.replace(['\r', '\n'], " ")
}

impl Message {
    pub fn to_rfc5322(&self) -> String {
        format!(
            "To: {}\r\nFrom: {}\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\n\r\n{}",
            header_value(&self.to.join(", ")),
            header_value(&self.from),
            header_value(&self.subject),
            self.body.replace('\n', "\r\n"),
        )
    }
}

pub trait MailTransport: Send + Sync {
    fn send(&self, msg: &Message) -> Result<()>;
}

/// Pipes the message into `sendmail -t -oi`.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    path: PathBuf,
}

impl SendmailTransport {
    pub fn new(path: PathBuf) -> Self {
        SendmailTransport { path }
    }
}

impl MailTransport for SendmailTransport {
    fn send(&self, msg: &Message) -> Result<()> {
        let mut child = Command::new(&self.path)
            .args(["-t", "-oi"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.path.display()))?;
        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("sendmail stdin unavailable"))?;
            stdin.write_all(msg.to_rfc5322().as_bytes())?;
        }
        let out = child.wait_with_output()?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("sendmail exited with {}: {}", out.status, stderr.trim()));
        }
        Ok(())
    }
}

/// Dry run: the rendered message goes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl MailTransport for LogTransport {
    fn send(&self, msg: &Message) -> Result<()> {
        info!(to = %msg.to.join(","), subject = %msg.subject, body = %msg.body, "Alert email (log transport).");
        Ok(())
    }
}

pub fn transport_for(cfg: &EmailConfig) -> Arc<dyn MailTransport> {
    match cfg.transport {
        TransportKind::Sendmail => Arc::new(SendmailTransport::new(cfg.sendmail_path.clone())),
        TransportKind::Log => Arc::new(LogTransport),
    }
}

pub fn subject(prefix: &str, a: &PendingAlert) -> String {
    format!(
        "{} {} - {} ({})",
        prefix,
        a.alert.severity.as_str().to_uppercase(),
        a.domain,
        a.alert.alert_type
    )
}

pub fn body(a: &PendingAlert) -> String {
    let lines = [
        "ThreatScope Alert".to_string(),
        "----------------".to_string(),
        format!("Domain:      {}", a.domain),
        format!("Severity:    {}", a.alert.severity.as_str().to_uppercase()),
        format!("Alert Type:  {}", a.alert.alert_type),
        format!("Alert Key:   {}", a.alert.alert_key),
        format!("Risk Score:  {}", a.risk_score),
        format!("Created At:  {}", format_ms(a.alert.created_at)),
        String::new(),
        "Details:".to_string(),
        a.alert.message.clone(),
        String::new(),
        "Next Steps:".to_string(),
        "- Review signals for this domain".to_string(),
        "- Decide block / takedown / ignore".to_string(),
        String::new(),
    ];
    lines.join("\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyReport {
    /// Why nothing was attempted, when that is the case.
    pub skipped: Option<&'static str>,
    pub deliveries: Vec<(AlertId, Delivery)>,
}

impl NotifyReport {
    pub fn sent(&self) -> usize {
        self.deliveries.iter().filter(|(_, d)| *d == Delivery::Sent).count()
    }

    pub fn failed(&self) -> usize {
        self.deliveries.len() - self.sent()
    }
}

pub struct Notifier {
    db: Arc<Db>,
    cfg: EmailConfig,
    transport: Arc<dyn MailTransport>,
}

impl Notifier {
    pub fn new(db: Arc<Db>, cfg: EmailConfig) -> Self {
        let transport = transport_for(&cfg);
        Notifier { db, cfg, transport }
    }

    pub fn with_transport(db: Arc<Db>, cfg: EmailConfig, transport: Arc<dyn MailTransport>) -> Self {
        Notifier { db, cfg, transport }
    }

    pub fn send_pending(&self) -> Result<NotifyReport> {
        let mut report = NotifyReport::default();
        if !self.cfg.enabled {
            info!("Email disabled; nothing sent.");
            report.skipped = Some("email disabled");
            return Ok(report);
        }
        if self.cfg.to.is_empty() {
            warn!("No alert recipients configured; nothing sent.");
            report.skipped = Some("no recipients");
            return Ok(report);
        }

        for pending in self.db.pending_alerts(&EMAIL_SEVERITIES, self.cfg.batch_size)? {
            let id = pending.alert.id;
            let msg = Message {
                to: self.cfg.to.clone(),
                from: self.cfg.from.clone(),
                subject: subject(&self.cfg.subject_prefix, &pending),
                body: body(&pending),
            };
            let delivery = match self.transport.send(&msg) {
                Ok(()) => match self.db.mark_alert_sent(id, now_ms()) {
                    Ok(_) => Delivery::Sent,
                    Err(e) => {
                        warn!(alert_id = id, error = %e, "Sent but could not mark; will resend.");
                        Delivery::Failed(format!("{e:#}"))
                    }
                },
                Err(e) => {
                    warn!(alert_id = id, alert_key = %pending.alert.alert_key, error = %e, "Delivery failed; alert stays pending.");
                    Delivery::Failed(format!("{e:#}"))
                }
            };
            report.deliveries.push((id, delivery));
        }

        self.db.touch_job(JOB_NAME, now_ms())?;
        info!(sent = report.sent(), failed = report.failed(), "Notifier batch complete.");
        Ok(report)
    }
}
