//! Environment-based Configuration for the zkpay orchestrator
//!
//! All settings come from `ZKPAY_*` environment variables. A `.env` file is
//! honoured by the binary (via `dotenv`) before this module reads them.
//!
//! # Environment Variables
//!
//! ## Network & Storage
//! - `ZKPAY_NETWORK` - "mainnet", "testnet", or "devnet" (default: "devnet")
//! - `ZKPAY_DATABASE_PATH` - SQLite file (default: "data/zkpay.db"); ":memory:"
//!   selects the in-memory store
//!
//! ## Scheduling
//! - `ZKPAY_TICK_INTERVAL_SECS` - Scheduler loop period (default: 5)
//! - `ZKPAY_TASK_LEASE_SECS` - How long a claimed task stays invisible (default: 120)
//! - `ZKPAY_PAYOUT_MAX_RETRIES` - Payout retry bound (default: 5)
//! - `ZKPAY_PAYOUT_BACKOFF_BASE_SECS` - First payout backoff, doubled per retry (default: 30)
//! - `ZKPAY_PAYOUT_POLL_SECS` - Bridge status poll period (default: 15)
//!
//! ## Timeouts
//! - `ZKPAY_PROOF_TIMEOUT_SECS` - Proof generation timeout (default: 300)
//! - `ZKPAY_SUBMIT_TIMEOUT_SECS` - Re-check period for unconfirmed submissions (default: 300)
//!
//! ## Logging
//! - `ZKPAY_LOG_LEVEL` - Logging level (debug, info, warn, error)
//! - `ZKPAY_LOG_JSON` - "1"/"0" to force JSON output (default: mainnet only)

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Database path value selecting the in-memory store
pub const MEMORY_DATABASE: &str = ":memory:";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network mismatch: expected {0}, got {1}")]
    NetworkMismatch(String, String),

    #[error("in-memory storage not allowed on {0}")]
    EphemeralStorage(String),
}

/// Network environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            _ => Err(ConfigError::InvalidValue(
                "ZKPAY_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Whether ephemeral storage is acceptable here
    pub fn allows_memory_store(&self) -> bool {
        matches!(self, Network::Devnet | Network::Testnet)
    }
}

/// Knobs of the stage coordinators, scheduler and sweeper
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Scheduler loop period
    pub tick_interval_secs: u64,
    /// Maximum tasks claimed per tick
    pub max_tasks_per_tick: usize,
    /// Claim lease of a scheduler task
    pub task_lease_secs: u64,
    /// Payout retries before the sub-status becomes `failed`
    pub payout_max_retries: u32,
    /// First payout backoff; doubles per retry
    pub payout_backoff_base_secs: u64,
    /// Bridge status poll period
    pub payout_poll_secs: u64,
    /// Proof `in_progress` longer than this is failed by the sweeper
    pub proof_timeout_secs: u64,
    /// `submitted` longer than this gets a fresh confirmation check
    pub submit_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            max_tasks_per_tick: 50,
            task_lease_secs: 120,
            payout_max_retries: 5,
            payout_backoff_base_secs: 30,
            payout_poll_secs: 15,
            proof_timeout_secs: 300,
            submit_timeout_secs: 300,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct ZkPayConfig {
    /// Network environment
    pub network: Network,

    /// SQLite database path, or `:memory:`
    pub database_path: String,

    /// Coordinator and scheduler settings
    pub orchestrator: OrchestratorConfig,

    /// Log level
    pub log_level: String,

    /// Emit JSON logs
    pub log_json: bool,
}

impl ZkPayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("ZKPAY_NETWORK")
            .unwrap_or_else(|_| "devnet".to_string())
            .parse()?;

        let database_path =
            env::var("ZKPAY_DATABASE_PATH").unwrap_or_else(|_| "data/zkpay.db".to_string());
        if database_path.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "ZKPAY_DATABASE_PATH".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            tick_interval_secs: parse_positive("ZKPAY_TICK_INTERVAL_SECS", defaults.tick_interval_secs)?,
            max_tasks_per_tick: defaults.max_tasks_per_tick,
            task_lease_secs: parse_positive("ZKPAY_TASK_LEASE_SECS", defaults.task_lease_secs)?,
            payout_max_retries: parse_var("ZKPAY_PAYOUT_MAX_RETRIES", defaults.payout_max_retries)?,
            payout_backoff_base_secs: parse_positive(
                "ZKPAY_PAYOUT_BACKOFF_BASE_SECS",
                defaults.payout_backoff_base_secs,
            )?,
            payout_poll_secs: parse_positive("ZKPAY_PAYOUT_POLL_SECS", defaults.payout_poll_secs)?,
            proof_timeout_secs: parse_positive("ZKPAY_PROOF_TIMEOUT_SECS", defaults.proof_timeout_secs)?,
            submit_timeout_secs: parse_positive(
                "ZKPAY_SUBMIT_TIMEOUT_SECS",
                defaults.submit_timeout_secs,
            )?,
        };

        let log_level = env::var("ZKPAY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("ZKPAY_LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(network == Network::Mainnet);

        let config = Self {
            network,
            database_path,
            orchestrator,
            log_level,
            log_json,
        };

        if config.uses_memory_store() && !network.allows_memory_store() {
            return Err(ConfigError::EphemeralStorage(format!("{:?}", network)));
        }

        Ok(config)
    }

    /// Whether the configured database is the in-memory store
    pub fn uses_memory_store(&self) -> bool {
        self.database_path == MEMORY_DATABASE
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.network != Network::Mainnet {
            return Err(ConfigError::NetworkMismatch(
                "mainnet".to_string(),
                format!("{:?}", self.network),
            ));
        }

        if self.uses_memory_store() {
            return Err(ConfigError::EphemeralStorage("mainnet".to_string()));
        }

        Ok(())
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let o = &self.orchestrator;
        println!("=== zkpay Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Database: {}", self.database_path);
        println!("Tick Interval: {}s", o.tick_interval_secs);
        println!("Task Lease: {}s", o.task_lease_secs);
        println!(
            "Payout Retries: {} (backoff from {}s, poll every {}s)",
            o.payout_max_retries, o.payout_backoff_base_secs, o.payout_poll_secs
        );
        println!("Proof Timeout: {}s", o.proof_timeout_secs);
        println!("Submit Timeout: {}s", o.submit_timeout_secs);
        println!("Log Level: {} ({})", self.log_level, if self.log_json { "json" } else { "pretty" });
        println!("===========================");
    }
}

fn parse_var<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("not a number: {}", raw))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_positive(var_name: &str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = parse_var(var_name, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            var_name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parsing() {
        assert!(matches!("mainnet".parse::<Network>(), Ok(Network::Mainnet)));
        assert!(matches!("TEST".parse::<Network>(), Ok(Network::Testnet)));
        assert!(matches!("devnet".parse::<Network>(), Ok(Network::Devnet)));
        assert!("invalid".parse::<Network>().is_err());
    }

    #[test]
    fn test_memory_store_restrictions() {
        assert!(Network::Devnet.allows_memory_store());
        assert!(!Network::Mainnet.allows_memory_store());

        let config = ZkPayConfig {
            network: Network::Mainnet,
            database_path: MEMORY_DATABASE.to_string(),
            orchestrator: OrchestratorConfig::default(),
            log_level: "info".to_string(),
            log_json: true,
        };
        assert!(matches!(
            config.validate_for_production(),
            Err(ConfigError::EphemeralStorage(_))
        ));

        let devnet = ZkPayConfig {
            network: Network::Devnet,
            database_path: "data/zkpay.db".to_string(),
            ..config
        };
        assert!(matches!(
            devnet.validate_for_production(),
            Err(ConfigError::NetworkMismatch(_, _))
        ));
    }

    #[test]
    fn test_defaults() {
        let o = OrchestratorConfig::default();
        assert_eq!(o.payout_max_retries, 5);
        assert_eq!(o.payout_backoff_base_secs, 30);
        assert_eq!(o.proof_timeout_secs, 300);
    }
}
