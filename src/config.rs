use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BatchError, Result};
use crate::scheduler::{AllocationPolicy, QueueMode, ResourceClass, ResourceSpec};
use crate::worker::{CommandRunner, JobRunner, SimulatedRunner};

/// Inventory used when none is given on the command line.
pub const DEFAULT_RESOURCES: &str =
    "cisco/c8k@machine_1,cisco/n9k@machine_2,cisco/xrv@machine_3,hp/5140@machine_4";

pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 2 * 1024 * 1024;

/// How job payloads are executed.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerConfig {
    /// Sleep, then succeed with probability `success_rate`.
    Simulated { duration_ms: u64, success_rate: f64 },
    /// Pipe the payload into `sh -c <command>`.
    Command { command: String },
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::Simulated {
            duration_ms: 10_000,
            success_rate: 0.8,
        }
    }
}

impl RunnerConfig {
    pub fn build(&self) -> Arc<dyn JobRunner> {
        match self {
            RunnerConfig::Simulated {
                duration_ms,
                success_rate,
            } => Arc::new(SimulatedRunner::new(
                Duration::from_millis(*duration_ms),
                *success_rate,
            )),
            RunnerConfig::Command { command } => Arc::new(CommandRunner::new(command.clone())),
        }
    }
}

/// Resource inventory and dispatch policy.
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    pub resources: Vec<ResourceSpec>,
    pub policy: AllocationPolicy,
    pub queue_mode: QueueMode,
    /// Worker tasks; defaults to one per resource.
    pub workers: Option<usize>,
}

impl SchedulerConfig {
    pub fn new(resources: Vec<ResourceSpec>) -> Self {
        Self {
            resources,
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: AllocationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_queue_mode(mut self, queue_mode: QueueMode) -> Self {
        self.queue_mode = queue_mode;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or(self.resources.len()).max(1)
    }

    /// Every class that has at least one resource.
    pub fn classes(&self) -> BTreeSet<ResourceClass> {
        self.resources.iter().map(|r| r.class.clone()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Root of the payload tree (`{vendor}/{model}/{job_id}.txt`).
    pub data_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub scheduler: SchedulerConfig,
    pub runner: RunnerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:8000"
                .parse()
                .expect("default listen address is valid"),
            data_dir: PathBuf::from("./data/tickets"),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            scheduler: SchedulerConfig::new(
                parse_resources(DEFAULT_RESOURCES).expect("default inventory is valid"),
            ),
            runner: RunnerConfig::default(),
        }
    }
}

/// Parse an inventory of the form `vendor/model@id,vendor/model@id`.
pub fn parse_resources(spec: &str) -> Result<Vec<ResourceSpec>> {
    let mut resources: Vec<ResourceSpec> = Vec::new();

    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((class, id)) = item.split_once('@') else {
            return Err(BatchError::InvalidResourceSpec(format!(
                "expected vendor/model@id, got {item:?}"
            )));
        };
        let id = id.trim();
        if id.is_empty() {
            return Err(BatchError::InvalidResourceSpec(format!(
                "missing resource id in {item:?}"
            )));
        }
        if resources.iter().any(|r| r.id == id) {
            return Err(BatchError::InvalidResourceSpec(format!(
                "duplicate resource id {id}"
            )));
        }
        resources.push(ResourceSpec::new(id, class.parse::<ResourceClass>()?));
    }

    Ok(resources)
}
