//! Runtime configuration, read from flags or environment variables.

use clap::{Args, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// How regeneration treats the allocations it is about to replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PriorPolicy {
    /// Prior owners stay excluded from their slot (and from the day when
    /// same-day repeats are off), and their prior load still counts.
    #[default]
    Exclude,
    /// Prior allocations are treated as already removed before scoring.
    Release,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    #[arg(long, env = "INVIGIL_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    #[arg(long, env = "INVIGIL_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[arg(long, env = "INVIGIL_PRIOR_ALLOCATIONS", value_enum, default_value_t = PriorPolicy::Exclude)]
    pub prior_allocations: PriorPolicy,

    /// Attempts at committing a regenerated date before giving up on a
    /// concurrently modified snapshot
    #[arg(long, env = "INVIGIL_COMMIT_ATTEMPTS", default_value_t = 3)]
    pub commit_attempts: u32,
}

/// Knobs consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    pub prior_policy: PriorPolicy,
    pub commit_attempts: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            prior_policy: PriorPolicy::Exclude,
            commit_attempts: 3,
        }
    }
}

impl Config {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            prior_policy: self.prior_allocations,
            commit_attempts: self.commit_attempts.max(1),
        }
    }
}
