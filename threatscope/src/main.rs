use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evidence_sqlite::Db;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use threatscope_core::{format_ms, now_ms, Target};
use tracing::{error, info};

mod alerts;
mod config;
mod logging;
mod notifier;
mod registry;
mod scheduler;
mod scoring;

#[derive(Debug, Parser)]
#[command(name = "threatscope", version, about = "Domain risk scanning pipeline")]
struct Cli {
    /// Config file (YAML). If omitted, loads ./threatscope.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the configured SQLite database path
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Run every enabled module against its batch of domains
    Run,
    /// List registered modules with their most recent run
    Modules,
    /// Insert threshold and new-signal alerts
    EvaluateAlerts,
    /// Deliver pending high/critical alerts
    SendAlerts,
    /// Add a domain to the inventory (status new)
    AddDomain {
        /// Hostname or URL; normalised before insert
        domain: String,
    },
    /// Remove a domain together with its evidence and alerts
    RemoveDomain {
        domain: String,
    },
    /// Store the configured risk model and make it the active one
    PublishModel {
        /// Version label; defaults to scoring.version from config
        #[arg(long)]
        version: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match config::load_config(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            logging::init("info");
            error!(error = %format!("{e:#}"), "Invalid configuration.");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&cfg.logging.level);
    match dispatch(cli, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed.");
            ExitCode::FAILURE
        }
    }
}

fn open_db(cfg: &config::Config, override_path: Option<PathBuf>) -> Result<Arc<Db>> {
    let path = override_path.unwrap_or_else(|| cfg.database.clone());
    Ok(Arc::new(Db::open_or_create(&path)?))
}

fn dispatch(cli: Cli, cfg: config::Config) -> Result<()> {
    match cli.command {
        Commands::Version => {
            println!("threatscope {} (core {})", env!("CARGO_PKG_VERSION"), threatscope_core::version());
        }
        Commands::Run => {
            let db = open_db(&cfg, cli.db)?;
            let modules = registry::load_modules(&db, &cfg.modules)?;
            let scheduler = scheduler::Scheduler::new(db, cfg.workers);
            let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            let report = rt.block_on(scheduler.run(&modules))?;
            for m in &report.modules {
                println!(
                    "{:<18} {:<8} domains={} failed={}{}",
                    m.module,
                    m.status.as_str(),
                    m.outcomes.len(),
                    m.failed(),
                    m.error.as_deref().map(|e| format!(" error={e}")).unwrap_or_default()
                );
            }
        }
        Commands::Modules => {
            let db = open_db(&cfg, cli.db)?;
            for line in module_lines(&db)? {
                println!("{line}");
            }
        }
        Commands::EvaluateAlerts => {
            let db = open_db(&cfg, cli.db)?;
            let report = alerts::AlertEvaluator::new(db, cfg.alerts.clone()).evaluate()?;
            println!(
                "inserted={} duplicates={} soft_failures={}",
                report.inserted(),
                report.duplicates(),
                report.soft_failures()
            );
        }
        Commands::SendAlerts => {
            let db = open_db(&cfg, cli.db)?;
            let report = notifier::Notifier::new(db, cfg.alerts.email.clone()).send_pending()?;
            match report.skipped {
                Some(why) => println!("skipped: {why}"),
                None => println!("sent={} failed={}", report.sent(), report.failed()),
            }
        }
        Commands::AddDomain { domain } => {
            let target = Target::parse(&domain)?;
            let db = open_db(&cfg, cli.db)?;
            let id = db.add_domain(target.as_str(), now_ms())?;
            info!(domain = %target, id, "Domain added.");
            println!("{id}\t{target}");
        }
        Commands::RemoveDomain { domain } => {
            let target = Target::parse(&domain)?;
            let db = open_db(&cfg, cli.db)?;
            let Some(row) = db.domain_by_name(target.as_str())? else {
                anyhow::bail!("unknown domain {target}");
            };
            db.remove_domain(row.id)?;
            info!(domain = %target, id = row.id, "Domain removed.");
        }
        Commands::PublishModel { version } => {
            let version = version.unwrap_or_else(|| cfg.scoring.version.clone());
            let db = open_db(&cfg, cli.db)?;
            db.publish_risk_model(&version, &cfg.scoring.weights, now_ms())?;
            info!(version = %version, weights = cfg.scoring.weights.len(), "Risk model published.");
            println!("active model: {version}");
        }
    }
    Ok(())
}

fn module_lines(db: &Db) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    for m in db.modules()? {
        let run = match db.latest_run(m.id)? {
            Some(r) => format!(
                "{} {} domains={} failed={}",
                format_ms(r.started_at),
                r.status.as_str(),
                r.domains_total,
                r.domains_failed
            ),
            None => "never run".to_string(),
        };
        let state = if m.enabled { "enabled" } else { "disabled" };
        let limit = m.rate_limit.map(|l| format!(" rate_limit={l}")).unwrap_or_default();
        lines.push(format!("{:<18} {:<8} {:<8} {run}{limit}", m.name, m.version, state));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_commands() {
        let cli = Cli::try_parse_from(["threatscope", "--db", "x.db", "add-domain", "HTTPS://Evil.Example/login"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("x.db")));
        assert!(matches!(cli.command, Commands::AddDomain { ref domain } if domain == "HTTPS://Evil.Example/login"));
        assert!(matches!(Cli::try_parse_from(["threatscope", "evaluate-alerts"]).unwrap().command, Commands::EvaluateAlerts));
        assert!(Cli::try_parse_from(["threatscope", "frobnicate"]).is_err());
    }

    #[test]
    fn add_domain_and_publish_model_against_a_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ts.db");
        let cfg = config::Config::default();

        let cli = Cli::try_parse_from(["threatscope", "--db", path.to_str().unwrap(), "add-domain", "Login.Evil.Example."]).unwrap();
        dispatch(cli, cfg.clone()).unwrap();
        let cli = Cli::try_parse_from(["threatscope", "--db", path.to_str().unwrap(), "publish-model"]).unwrap();
        dispatch(cli, cfg.clone()).unwrap();

        let db = Db::open_or_create(&path).unwrap();
        assert!(db.domain_by_name("login.evil.example").unwrap().is_some());
        let model = db.active_risk_model().unwrap().unwrap();
        assert_eq!(model.version, "v1");
        assert_eq!(model.weights, cfg.scoring.weights);

        let cli = Cli::try_parse_from(["threatscope", "--db", path.to_str().unwrap(), "add-domain", "not a domain"]).unwrap();
        assert!(dispatch(cli, cfg.clone()).is_err());

        let cli = Cli::try_parse_from(["threatscope", "--db", path.to_str().unwrap(), "remove-domain", "login.evil.example"]).unwrap();
        dispatch(cli, cfg.clone()).unwrap();
        assert!(db.domain_by_name("login.evil.example").unwrap().is_none());
        let cli = Cli::try_parse_from(["threatscope", "--db", path.to_str().unwrap(), "remove-domain", "login.evil.example"]).unwrap();
        assert!(dispatch(cli, cfg).is_err());
    }

    #[test]
    fn module_listing_shows_latest_run() {
        let db = Db::open_in_memory().unwrap();
        let dns = db.register_module("dns_basic", "1.0.0", true, None).unwrap();
        db.register_module("whois_basic", "1.0.0", false, Some(3)).unwrap();
        db.begin_run(dns, 0).unwrap();
        let lines = module_lines(&db).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("dns_basic"));
        assert!(lines[0].contains("1970-01-01T00:00:00Z running"));
        assert!(lines[1].contains("disabled"));
        assert!(lines[1].contains("never run rate_limit=3"));
    }
}
