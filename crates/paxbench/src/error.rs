use std::{path::PathBuf, process::ExitStatus, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{directory::TrialId, input::Role};

/// An [`Input`](crate::input::Input) that can't describe a meaningful trial.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("f must be at least 1")]
    NoFaultTolerance,
    #[error(
        "topology has no clients ({num_client_procs} procs with {num_clients_per_proc} clients each)"
    )]
    NoClients {
        num_client_procs: u32,
        num_clients_per_proc: u32,
    },
    #[error(
        "{num_client_procs} procs with {num_clients_per_proc} clients each is more clients than can be counted"
    )]
    TooManyClients {
        num_client_procs: u32,
        num_clients_per_proc: u32,
    },
    #[error("topology needs {processes} processes, at most {max} are supported")]
    TooManyProcesses { processes: u64, max: u32 },
    #[error("duration must be positive")]
    EmptyDuration,
    #[error("timeout {timeout:?} must exceed duration {duration:?} plus client lag {client_lag:?}")]
    TimeoutTooShort {
        timeout: Duration,
        duration: Duration,
        client_lag: Duration,
    },
    #[error("client_num_keys must be at least 1")]
    NoKeys,
    #[error("monitored trials need a positive prometheus scrape interval")]
    EmptyScrapeInterval,
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to spawn {role} {index}: {source}")]
    Spawn {
        role: Role,
        index: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("{role} {index} exited during startup with {status}")]
    ExitedEarly {
        role: Role,
        index: u32,
        status: ExitStatus,
    },
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cluster unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectionError {
    #[error("failed to read samples from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("skipped {skipped} malformed samples in {path}")]
    Malformed { path: PathBuf, skipped: usize },
    #[error("failed to wait on client {index}: {source}")]
    Wait {
        index: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("client {index} exited with {status}")]
    ClientFailed { index: u32, status: ExitStatus },
    #[error("samples incomplete: {0}")]
    Incomplete(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid csv in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("trial {0} has no persisted input")]
    MissingInput(TrialId),
    #[error("{0} is not a suite directory")]
    NotASuite(PathBuf),
    #[error("{0} has no trial ids left")]
    OutOfIds(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("invalid input: {0}")]
    Config(#[from] ConfigError),
    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisionError),
    #[error("trial exceeded its timeout of {timeout:?} after {elapsed:?}")]
    Timeout { timeout: Duration, elapsed: Duration },
    #[error("collection failed: {0}")]
    Collection(#[from] CollectionError),
    #[error("trial cancelled")]
    Cancelled,
    #[error("failed to persist trial: {0}")]
    Directory(#[from] DirectoryError),
}

/// Coarse classification of a [`TrialError`], as recorded in `failures.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Config,
    Provisioning,
    Timeout,
    Collection,
    Cancelled,
    Directory,
}

impl TrialError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::Config,
            Self::Provisioning(_) => FailureKind::Provisioning,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Collection(_) => FailureKind::Collection,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Directory(_) => FailureKind::Directory,
        }
    }

    /// Whether running the same input again could reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::Cancelled)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("input {index} of suite {suite} is invalid: {source}")]
    InvalidInput {
        suite: String,
        index: usize,
        #[source]
        source: ConfigError,
    },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
