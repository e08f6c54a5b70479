//! Dispatcher configuration: runner mode, scheduling policy, and the knobs
//! that the three driver modes (`nShot`, `mlperfBench`, `serveRequests`)
//! share.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Execution mode for the runner pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    /// Each `run` spawns an ephemeral worker; no policy is used.
    Task,
    /// Native model execution on pooled, stateful workers.
    Actor,
    /// Accelerator-only (KaaS) execution on pooled workers.
    Kaas,
}

impl std::str::FromStr for RunnerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "actor" => Ok(Self::Actor),
            "kaas" => Ok(Self::Kaas),
            other => Err(ConfigError::UnknownMode(other.to_string())),
        }
    }
}

/// Scheduling policy for `RunnerMode::Actor` / `RunnerMode::Kaas`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Round-robin with no tenant affinity.
    RoundRobin,
    /// Load-balanced across all workers, shared by every tenant.
    Balance,
    /// Per-tenant exclusive sub-pools with fair eviction.
    Exclusive,
}

impl std::str::FromStr for PolicyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rr" | "round_robin" => Ok(Self::RoundRobin),
            "balance" => Ok(Self::Balance),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Configuration shared by every driver mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    pub runner_mode: RunnerMode,
    pub runner_policy: PolicyKind,
    /// Number of GPU workers to allocate (ignored in `Task` mode).
    pub n_runners: usize,
    /// Fuse pre/run/post into a single task (native only, no runner pool).
    pub inline: bool,
    /// Cache the model instance across invocations on task-mode workers.
    pub cache: bool,
    /// Number of clients expected at the barrier socket.
    pub num_clients: usize,
    /// Warmup requests issued before timing begins in `nShot`. Defaults to
    /// `2 * n_runners`, matching the original benchmark's cold-start pass.
    pub warmup_passes: usize,
    /// Path to append `{config, metrics}` JSON records to.
    pub report_path: std::path::PathBuf,
    /// Bounded capacity of the completion queue used by push-mode delivery.
    pub completion_queue_capacity: usize,
    /// Address the client ROUTER-equivalent socket binds to.
    pub bind_addr: String,
    /// Address the barrier ROUTER-equivalent socket binds to.
    pub barrier_addr: String,
}

impl BenchConfig {
    pub fn new(
        runner_mode: RunnerMode,
        runner_policy: PolicyKind,
        n_runners: usize,
    ) -> Result<Self, ConfigError> {
        if n_runners == 0 && runner_mode != RunnerMode::Task {
            return Err(ConfigError::ZeroRunners);
        }
        Ok(Self {
            runner_mode,
            runner_policy,
            n_runners,
            inline: false,
            cache: false,
            num_clients: 1,
            warmup_passes: n_runners.max(1) * 2,
            report_path: std::path::PathBuf::from("results.json"),
            completion_queue_capacity: 1024,
            bind_addr: "127.0.0.1:5555".to_string(),
            barrier_addr: "127.0.0.1:5556".to_string(),
        })
    }

    /// Validate cross-field invariants. Called by every driver before it
    /// does anything observable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache && self.runner_mode == RunnerMode::Task {
            return Err(ConfigError::CacheWithTaskMode);
        }
        if self.n_runners == 0 && self.runner_mode != RunnerMode::Task {
            return Err(ConfigError::ZeroRunners);
        }
        Ok(())
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_inline(mut self, inline: bool) -> Self {
        self.inline = inline;
        self
    }
}
