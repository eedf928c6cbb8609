//! Application configuration loaded from environment variables.

use std::str::FromStr;

use escrow_protocol::ProtocolConfig;

use crate::errors::{Result, ServiceError};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Payout provider endpoint
    pub payout_url: String,
    /// Where domain notifications are POSTed, if anywhere
    pub notify_webhook_url: Option<String>,
    /// Directory holding uploaded proof artifacts
    pub artifact_dir: String,
    /// Public prefix under which artifacts are served
    pub artifact_base_url: String,
    /// How often (in seconds) the scheduler sweeps leases and resumes payouts
    pub scheduler_interval_secs: u64,
    pub protocol: ProtocolConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ProtocolConfig::default();
        Ok(Config {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./escrow_events.db".to_string()),
            api_port: parse_or(&get, "API_PORT", 3001)?,
            payout_url: get("PAYOUT_URL").ok_or_else(|| {
                ServiceError::Config("PAYOUT_URL environment variable is required".to_string())
            })?,
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL").filter(|v| !v.trim().is_empty()),
            artifact_dir: get("ARTIFACT_DIR").unwrap_or_else(|| "./artifacts".to_string()),
            artifact_base_url: get("ARTIFACT_BASE_URL")
                .unwrap_or_else(|| "http://localhost:3001/files".to_string()),
            scheduler_interval_secs: parse_or(&get, "SCHEDULER_INTERVAL_SECS", 5)?,
            protocol: ProtocolConfig {
                lease_secs: parse_or(&get, "LEASE_SECS", defaults.lease_secs)?,
                max_resubmissions: parse_or(&get, "MAX_RESUBMISSIONS", defaults.max_resubmissions)?,
                escalation_threshold_secs: parse_or(
                    &get,
                    "ESCALATION_THRESHOLD_SECS",
                    defaults.escalation_threshold_secs,
                )?,
                max_payout_attempts: parse_or(
                    &get,
                    "MAX_PAYOUT_ATTEMPTS",
                    defaults.max_payout_attempts,
                )?,
                backoff_base_ms: parse_or(&get, "BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
                backoff_max_ms: parse_or(&get, "BACKOFF_MAX_MS", defaults.backoff_max_ms)?,
                backoff_jitter_ms: parse_or(&get, "BACKOFF_JITTER_MS", defaults.backoff_jitter_ms)?,
                payout_timeout_ms: parse_or(&get, "PAYOUT_TIMEOUT_MS", defaults.payout_timeout_ms)?,
                conflict_retries: parse_or(&get, "CONFLICT_RETRIES", defaults.conflict_retries)?,
            },
        })
    }
}

fn parse_or<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ServiceError::Config(format!("Invalid {key}: '{raw}'"))),
        None => Ok(default),
    }
}
