pub const SCHEMA_VERSION: i64 = 1;

pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE domains (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  domain          TEXT NOT NULL UNIQUE,
  status          TEXT NOT NULL DEFAULT 'new'
                  CHECK (status IN ('new','triage','investigating','mitigated','ignored')),
  risk_score      INTEGER NOT NULL DEFAULT 0,
  risk_version    TEXT,
  created_at      INTEGER NOT NULL,
  updated_at      INTEGER NOT NULL,
  last_seen       INTEGER
);

CREATE TABLE modules (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  name            TEXT NOT NULL UNIQUE,
  version         TEXT NOT NULL,
  enabled         INTEGER NOT NULL CHECK (enabled IN (0,1)) DEFAULT 1,
  rate_limit      INTEGER CHECK (rate_limit IS NULL OR rate_limit > 0),
  last_run        INTEGER,
  last_error      TEXT
);

CREATE TABLE runs (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  module_id       INTEGER NOT NULL REFERENCES modules(id),
  started_at      INTEGER NOT NULL,
  finished_at     INTEGER,
  status          TEXT NOT NULL CHECK (status IN ('running','success','error','partial')),
  error_message   TEXT,
  domains_total   INTEGER NOT NULL DEFAULT 0,
  domains_failed  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE observations (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  domain_id       INTEGER NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
  module_id       INTEGER NOT NULL REFERENCES modules(id),
  key_name        TEXT NOT NULL,
  value           TEXT NOT NULL,
  observed_at     INTEGER NOT NULL
);

CREATE TABLE signals (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  domain_id       INTEGER NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
  signal_name     TEXT NOT NULL,
  signal_value    TEXT NOT NULL,
  first_seen_at   INTEGER NOT NULL,
  computed_at     INTEGER NOT NULL,
  UNIQUE (domain_id, signal_name)
);

CREATE VIEW latest_signals AS
  SELECT domain_id, signal_name, signal_value, first_seen_at, computed_at
  FROM (
    SELECT s.*,
           ROW_NUMBER() OVER (
             PARTITION BY s.domain_id, s.signal_name
             ORDER BY s.computed_at DESC, s.id DESC
           ) AS rn
    FROM signals s
  )
  WHERE rn = 1;

CREATE TABLE risk_models (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  version         TEXT NOT NULL UNIQUE,
  config          TEXT NOT NULL,
  active          INTEGER NOT NULL CHECK (active IN (0,1)) DEFAULT 0,
  created_at      INTEGER NOT NULL
);

CREATE TABLE alerts (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  domain_id       INTEGER NOT NULL REFERENCES domains(id) ON DELETE CASCADE,
  alert_type      TEXT NOT NULL,
  alert_key       TEXT NOT NULL,
  severity        TEXT NOT NULL CHECK (severity IN ('info','low','medium','high','critical')),
  message         TEXT NOT NULL,
  created_at      INTEGER NOT NULL,
  sent_at         INTEGER,
  UNIQUE (domain_id, alert_key)
);

CREATE TABLE job_state (
  job_name        TEXT PRIMARY KEY,
  last_run_at     INTEGER NOT NULL,
  updated_at      INTEGER NOT NULL
);

CREATE INDEX idx_domains_sched ON domains(status, updated_at);
CREATE INDEX idx_domains_score ON domains(risk_score);
CREATE INDEX idx_runs_module ON runs(module_id, started_at);
CREATE INDEX idx_obs_domain_key ON observations(domain_id, key_name, observed_at);
CREATE INDEX idx_obs_key_value ON observations(key_name, value);
CREATE INDEX idx_signals_first_seen ON signals(signal_name, first_seen_at);
CREATE UNIQUE INDEX idx_risk_models_one_active ON risk_models(active) WHERE active = 1;
CREATE INDEX idx_alerts_pending ON alerts(sent_at, severity, created_at);

PRAGMA user_version = 1;

COMMIT;
"#
;
