use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    provision::{ClientWorkload, RoleGroup, Topology},
};

/// Most processes a single trial may run, across every role.
pub const MAX_PROCESSES: u32 = 100;

/// The kinds of process a Unanimous BPaxos deployment is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Leader,
    DepServiceNode,
    Acceptor,
    Client,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Leader => "leader",
                Self::DepServiceNode => "dep_service_node",
                Self::Acceptor => "acceptor",
                Self::Client => "client",
            }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetName {
    #[default]
    SingleSwitchNet,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Debug => "debug",
                Self::Info => "info",
                Self::Warn => "warn",
                Self::Error => "error",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderOptions {
    pub resend_dependency_requests_timer_period_ms: u64,
    pub resend_phase1as_timer_period_ms: u64,
    pub resend_phase2as_timer_period_ms: u64,
    pub measure_latencies: bool,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            resend_dependency_requests_timer_period_ms: 1000,
            resend_phase1as_timer_period_ms: 1000,
            resend_phase2as_timer_period_ms: 1000,
            measure_latencies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepServiceNodeOptions {
    pub top_k_dependencies: u32,
    pub measure_latencies: bool,
}

impl Default for DepServiceNodeOptions {
    fn default() -> Self {
        Self {
            top_k_dependencies: 1,
            measure_latencies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptorOptions {
    pub measure_latencies: bool,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            measure_latencies: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub repropose_period_ms: u64,
    pub measure_latencies: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            repropose_period_ms: 10_000,
            measure_latencies: true,
        }
    }
}

/// Everything needed to run one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub net_name: NetName,
    pub f: u32,
    pub num_client_procs: u32,
    pub num_clients_per_proc: u32,
    pub duration: Duration,
    pub timeout: Duration,
    /// How long the cluster gets to settle before clients start.
    pub client_lag: Duration,
    pub profiled: bool,
    pub monitored: bool,
    pub prometheus_scrape_interval: Duration,
    pub leader_options: LeaderOptions,
    pub leader_log_level: LogLevel,
    pub dep_service_node_options: DepServiceNodeOptions,
    pub dep_service_node_log_level: LogLevel,
    pub acceptor_options: AcceptorOptions,
    pub acceptor_log_level: LogLevel,
    pub client_options: ClientOptions,
    pub client_log_level: LogLevel,
    /// Size of the key space clients draw from.
    pub client_num_keys: u32,
}

impl Input {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.f == 0 {
            return Err(ConfigError::NoFaultTolerance);
        }
        if self.num_client_procs == 0 || self.num_clients_per_proc == 0 {
            return Err(ConfigError::NoClients {
                num_client_procs: self.num_client_procs,
                num_clients_per_proc: self.num_clients_per_proc,
            });
        }
        if self
            .num_client_procs
            .checked_mul(self.num_clients_per_proc)
            .is_none()
        {
            return Err(ConfigError::TooManyClients {
                num_client_procs: self.num_client_procs,
                num_clients_per_proc: self.num_clients_per_proc,
            });
        }
        // f + 1 leaders, 2f + 1 dep service nodes and acceptors, then the clients
        let processes = 5 * u64::from(self.f) + 3 + u64::from(self.num_client_procs);
        if processes > u64::from(MAX_PROCESSES) {
            return Err(ConfigError::TooManyProcesses {
                processes,
                max: MAX_PROCESSES,
            });
        }
        if self.duration.is_zero() {
            return Err(ConfigError::EmptyDuration);
        }
        let busy = self.duration.saturating_add(self.client_lag);
        if self.timeout <= busy {
            return Err(ConfigError::TimeoutTooShort {
                timeout: self.timeout,
                duration: self.duration,
                client_lag: self.client_lag,
            });
        }
        if self.client_num_keys == 0 {
            return Err(ConfigError::NoKeys);
        }
        if self.monitored && self.prometheus_scrape_interval.is_zero() {
            return Err(ConfigError::EmptyScrapeInterval);
        }
        Ok(())
    }

    /// Saturates rather than overflowing, as do the other counts, for inputs that
    /// fail [`Input::validate`].
    pub fn num_clients(&self) -> u32 {
        self.num_client_procs
            .saturating_mul(self.num_clients_per_proc)
    }

    pub fn num_leaders(&self) -> u32 {
        self.f.saturating_add(1)
    }

    pub fn num_dep_service_nodes(&self) -> u32 {
        self.f.saturating_mul(2).saturating_add(1)
    }

    pub fn num_acceptors(&self) -> u32 {
        self.f.saturating_mul(2).saturating_add(1)
    }

    /// The processes to provision, in start order.
    pub fn topology(&self) -> Topology {
        Topology {
            net_name: self.net_name,
            profiled: self.profiled,
            roles: vec![
                RoleGroup {
                    role: Role::Leader,
                    count: self.num_leaders(),
                    log_level: self.leader_log_level,
                    flags: option_flags(&self.leader_options),
                },
                RoleGroup {
                    role: Role::DepServiceNode,
                    count: self.num_dep_service_nodes(),
                    log_level: self.dep_service_node_log_level,
                    flags: option_flags(&self.dep_service_node_options),
                },
                RoleGroup {
                    role: Role::Acceptor,
                    count: self.num_acceptors(),
                    log_level: self.acceptor_log_level,
                    flags: option_flags(&self.acceptor_options),
                },
                RoleGroup {
                    role: Role::Client,
                    count: self.num_client_procs,
                    log_level: self.client_log_level,
                    flags: option_flags(&self.client_options),
                },
            ],
            workload: ClientWorkload {
                clients_per_proc: self.num_clients_per_proc,
                num_keys: self.client_num_keys,
                duration: self.duration,
            },
        }
    }
}

/// Renders an options struct as `--options.<field> <value>` flags.
fn option_flags<T: Serialize>(options: &T) -> Vec<String> {
    let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(options) else {
        return Vec::new();
    };
    fields
        .into_iter()
        .flat_map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            [format!("--options.{name}"), value]
        })
        .collect()
}
