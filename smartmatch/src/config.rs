//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `config.yaml` and can be changed with `-f` or `SMARTMATCH_CONFIG`.
//!
//! ## Loading Priority
//!
//! Later sources override earlier ones:
//!
//! 1. **YAML config file** (default: `config.yaml`)
//! 2. **Environment variables** prefixed with `SMARTMATCH_`
//! 3. **DATABASE_URL**, which switches `database` to an external PostgreSQL database
//!
//! Nested values use double underscores, e.g. `SMARTMATCH_MATCHING__FANOUT_SIZE=5` or
//! `SMARTMATCH_BACKGROUND_SERVICES__SWEEPER__INTERVAL=10s`.
//!
//! ## Sections
//!
//! - **Database**: `database.type` (`memory` or `external`), `database.url`, `database.pool`
//! - **Matching**: `matching`, the matching config stored on first startup
//! - **Guardrails**: `guardrails`, thresholds for the policy monitor
//! - **Background Services**: `background_services.sweeper`, `background_services.guardrail_monitor`,
//!   `background_services.leader_election`
//! - **Directory**: `directory.snapshot_path`, the provider snapshot served to the engine

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

use crate::errors::Error;
use crate::guardrails::GuardrailThresholds;
use crate::matching_config::MatchingConfig;

/// CLI args: the config file plus what to do with it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "SMARTMATCH_CONFIG", default_value = "config.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the sweeper and guardrail monitor until SIGTERM or Ctrl+C (the default)
    Run,
    /// Print the guardrail report for a period as JSON
    Guardrails {
        /// Start of the period (RFC 3339)
        #[arg(long)]
        from: DateTime<Utc>,
        /// End of the period (RFC 3339), defaults to now
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
    /// Print the fallback queue as JSON
    FallbackQueue,
    /// Validate configuration and exit
    Validate,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Set from `DATABASE_URL`; folded into `database` by [`Config::load`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub database: DatabaseConfig,
    /// Matching config stored on first startup. Later changes go through the operator console.
    pub matching: MatchingConfig,
    pub guardrails: GuardrailThresholds,
    pub background_services: BackgroundServicesConfig,
    pub directory: DirectoryConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Where engine state lives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// In-process storage, lost on restart. Single instance only.
    #[default]
    Memory,
    /// External PostgreSQL database
    External {
        url: String,
        #[serde(default)]
        pool: PoolSettings,
    },
}

impl DatabaseConfig {
    pub fn external_url(&self) -> Option<&str> {
        match self {
            DatabaseConfig::External { url, .. } => Some(url),
            DatabaseConfig::Memory => None,
        }
    }
}

/// Periodic expiry and escalation sweep.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweeperConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

/// Periodic guardrail report over a trailing period.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuardrailMonitorConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How far back each report looks
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Default for GuardrailMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5 * 60),
            period: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl GuardrailMonitorConfig {
    pub fn period(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::MAX)
    }
}

/// Leader election for multi-instance deployments.
///
/// Uses a PostgreSQL advisory lock so only one instance runs the background services. Ignored
/// for in-memory storage, where the single instance always leads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaderElectionConfig {
    /// When false, this instance always runs as leader
    pub enabled: bool,
    /// How often followers retry and the leader checks its connection
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackgroundServicesConfig {
    pub sweeper: SweeperConfig,
    pub guardrail_monitor: GuardrailMonitorConfig,
    pub leader_election: LeaderElectionConfig,
}

/// Provider snapshot served as the directory and geo/price oracle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    /// YAML or JSON snapshot file. Without one the engine sees no providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

impl Config {
    #[allow(clippy::result_large_err)]
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let mut config: Self = Self::figment(args).extract()?;

        // DATABASE_URL wins, keeping any configured pool settings
        if let Some(url) = config.database_url.take() {
            let pool = match &config.database {
                DatabaseConfig::External { pool, .. } => pool.clone(),
                DatabaseConfig::Memory => PoolSettings::default(),
            };
            config.database = DatabaseConfig::External { url, pool };
        }

        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    /// Validate the configuration for consistency and required fields
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: String| Err(Error::Validation { message });

        if let DatabaseConfig::External { url, pool } = &self.database {
            if url.trim().is_empty() {
                return invalid("Config validation: database.url must not be empty".to_string());
            }
            if pool.max_connections == 0 {
                return invalid("Config validation: database.pool.max_connections must be at least 1".to_string());
            }
            if pool.min_connections > pool.max_connections {
                return invalid(format!(
                    "Config validation: database.pool.min_connections ({}) cannot be greater than max_connections ({})",
                    pool.min_connections, pool.max_connections
                ));
            }
        }

        self.matching.validate()?;
        self.guardrails.validate()?;

        let services = &self.background_services;
        for (name, interval) in [
            ("sweeper.interval", services.sweeper.interval),
            ("guardrail_monitor.interval", services.guardrail_monitor.interval),
            ("guardrail_monitor.period", services.guardrail_monitor.period),
            ("leader_election.interval", services.leader_election.interval),
        ] {
            if interval.is_zero() {
                return invalid(format!("Config validation: background_services.{name} must be greater than zero"));
            }
        }

        Ok(())
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // SMARTMATCH_CONFIG names the file itself
            .merge(Env::prefixed("SMARTMATCH_").ignore(&["config"]).split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching_config::ScoringFactor;
    use figment::Jail;

    fn args(config: &str) -> Args {
        Args {
            config: config.to_string(),
            command: None,
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = Config::load(&args("absent.yaml"))?;
            assert_eq!(config.database, DatabaseConfig::Memory);
            assert_eq!(config.matching, MatchingConfig::default());
            assert!(config.background_services.leader_election.enabled);
            assert_eq!(config.background_services.sweeper.interval, Duration::from_secs(30));
            assert!(config.directory.snapshot_path.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_sections() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  type: external
  url: postgres://localhost/smartmatch
  pool:
    max_connections: 4
    acquire_timeout: 5s
matching:
  fanout_size: 5
  response_window: 30m
  weights:
    distance: 0.5
    rating: 0.5
guardrails:
  provider_decline_ratio: 0.8
background_services:
  sweeper:
    interval: 10s
  guardrail_monitor:
    period: 1day
  leader_election:
    enabled: false
directory:
  snapshot_path: providers.yaml
"#,
            )?;

            let config = Config::load(&args("test.yaml"))?;

            match &config.database {
                DatabaseConfig::External { url, pool } => {
                    assert_eq!(url, "postgres://localhost/smartmatch");
                    assert_eq!(pool.max_connections, 4);
                    assert_eq!(pool.acquire_timeout, Duration::from_secs(5));
                    // unset pool fields keep their defaults
                    assert_eq!(pool.idle_timeout, Duration::from_secs(600));
                }
                other => panic!("expected external database, got {other:?}"),
            }
            assert_eq!(config.matching.fanout_size, 5);
            assert_eq!(config.matching.response_window, Duration::from_secs(30 * 60));
            assert_eq!(config.matching.weight(ScoringFactor::Price), 0.0);
            assert_eq!(config.guardrails.provider_decline_ratio, 0.8);
            assert_eq!(config.background_services.sweeper.interval, Duration::from_secs(10));
            assert_eq!(config.background_services.guardrail_monitor.period(), chrono::Duration::days(1));
            assert!(!config.background_services.leader_election.enabled);
            assert_eq!(config.directory.snapshot_path, Some(PathBuf::from("providers.yaml")));
            Ok(())
        });
    }

    #[test]
    fn test_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
matching:
  fanout_size: 5
  max_retries: 4
"#,
            )?;
            jail.set_env("SMARTMATCH_MATCHING__FANOUT_SIZE", "7");
            jail.set_env("SMARTMATCH_ENABLE_OTEL_EXPORT", "true");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.matching.fanout_size, 7);
            assert_eq!(config.matching.max_retries, 4);
            assert!(config.enable_otel_export);
            Ok(())
        });
    }

    #[test]
    fn test_database_url_switches_to_external() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
database:
  type: external
  url: postgres://ignored/db
  pool:
    max_connections: 3
"#,
            )?;
            jail.set_env("DATABASE_URL", "postgres://db.internal/smartmatch");

            let config = Config::load(&args("test.yaml"))?;

            assert_eq!(config.database.external_url(), Some("postgres://db.internal/smartmatch"));
            match config.database {
                DatabaseConfig::External { pool, .. } => assert_eq!(pool.max_connections, 3),
                DatabaseConfig::Memory => panic!("expected external database"),
            }
            assert!(config.database_url.is_none());
            Ok(())
        });
    }

    #[test]
    fn test_unknown_field_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("test.yaml", "matching:\n  fan_out: 3\n")?;
            assert!(Config::load(&args("test.yaml")).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_invalid_values_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "test.yaml",
                r#"
background_services:
  sweeper:
    interval: 0s
"#,
            )?;
            let err = Config::load(&args("test.yaml")).unwrap_err();
            assert!(err.to_string().contains("sweeper.interval"));

            jail.create_file("bad_matching.yaml", "matching:\n  fanout_size: 0\n")?;
            assert!(Config::load(&args("bad_matching.yaml")).is_err());

            jail.create_file(
                "bad_pool.yaml",
                r#"
database:
  type: external
  url: postgres://localhost/db
  pool:
    min_connections: 5
    max_connections: 2
"#,
            )?;
            assert!(Config::load(&args("bad_pool.yaml")).is_err());
            Ok(())
        });
    }
}
