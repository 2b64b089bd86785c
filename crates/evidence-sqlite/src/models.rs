use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type DomainId = i64;
pub type ModuleId = i64;
pub type RunId = i64;
pub type AlertId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    New,
    Triage,
    Investigating,
    Mitigated,
    Ignored,
}

impl DomainStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DomainStatus::New => "new",
            DomainStatus::Triage => "triage",
            DomainStatus::Investigating => "investigating",
            DomainStatus::Mitigated => "mitigated",
            DomainStatus::Ignored => "ignored",
        }
    }
}

impl FromStr for DomainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(DomainStatus::New),
            "triage" => Ok(DomainStatus::Triage),
            "investigating" => Ok(DomainStatus::Investigating),
            "mitigated" => Ok(DomainStatus::Mitigated),
            "ignored" => Ok(DomainStatus::Ignored),
            other => Err(format!("unknown domain status: {other}")),
        }
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: DomainId,
    pub domain: String,
    pub status: DomainStatus,
    pub risk_score: i64,
    pub risk_version: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    /// Operator override; `None` means the probe's own default applies.
    pub rate_limit: Option<u32>,
    pub last_run: Option<i64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Partial => "partial",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "partial" => Ok(RunStatus::Partial),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub module_id: ModuleId,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub domains_total: i64,
    pub domains_failed: i64,
}

/// Terminal state written once when a module batch ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub error_message: Option<String>,
    pub domains_total: i64,
    pub domains_failed: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObservation {
    pub id: i64,
    pub domain_id: DomainId,
    pub module_id: ModuleId,
    pub key: String,
    pub value: String,
    pub observed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub domain_id: DomainId,
    pub name: String,
    pub value: String,
    pub first_seen_at: i64,
    pub computed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskModel {
    pub version: String,
    pub weights: BTreeMap<String, i64>,
    pub active: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreUpdate {
    pub domain_id: DomainId,
    pub score: i64,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlert {
    pub domain_id: DomainId,
    pub alert_type: String,
    pub alert_key: String,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub domain_id: DomainId,
    pub alert_type: String,
    pub alert_key: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: i64,
    pub sent_at: Option<i64>,
}

/// An undelivered alert joined with the domain fields the notifier renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAlert {
    pub alert: Alert,
    pub domain: String,
    pub risk_score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalDebut {
    pub domain_id: DomainId,
    pub domain: String,
    pub signal_name: String,
    pub first_seen_at: i64,
}
