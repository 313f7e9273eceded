use std::time::Duration;

use async_trait::async_trait;

use crate::{
    directory::TrialSlot,
    error::{CollectionError, ProvisionError},
    input::{LogLevel, NetName, Role},
    Address,
};
use paxbench_stats::SampleRecorder;

/// The processes one trial needs, as handed to a [`Provisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub net_name: NetName,
    /// Run every role under the configured profiler.
    pub profiled: bool,
    pub roles: Vec<RoleGroup>,
    pub workload: ClientWorkload,
}

impl Topology {
    pub fn count(&self, role: Role) -> u32 {
        self.roles
            .iter()
            .filter(|g| g.role == role)
            .fold(0u32, |total, g| total.saturating_add(g.count))
    }

    pub fn total_processes(&self) -> u32 {
        self.roles
            .iter()
            .fold(0u32, |total, g| total.saturating_add(g.count))
    }

    pub fn group(&self, role: Role) -> Option<&RoleGroup> {
        self.roles.iter().find(|g| g.role == role)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleGroup {
    pub role: Role,
    pub count: u32,
    pub log_level: LogLevel,
    /// Extra command line flags carrying the role's options.
    pub flags: Vec<String>,
}

/// What each client process is asked to do once started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientWorkload {
    pub clients_per_proc: u32,
    pub num_keys: u32,
    pub duration: Duration,
}

/// Brings up the processes of a trial.
///
/// If the returned future is dropped before it completes, anything it already
/// started must be stopped as part of the drop.
#[async_trait]
pub trait Provisioner: Send + Sync {
    type Cluster: Cluster;

    async fn provision(
        &self,
        topology: &Topology,
        slot: &TrialSlot,
    ) -> Result<Self::Cluster, ProvisionError>;
}

/// Live handles on the processes of one trial.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// Tell the client roles to start issuing requests.
    async fn start_clients(&mut self) -> Result<(), ProvisionError>;

    /// Tell the client roles to stop and wait until they have.
    async fn stop_clients(&mut self) -> Result<(), CollectionError>;

    /// Drain every sample the clients produced into `recorder`.
    ///
    /// Samples read before an error is hit must still be recorded. Also called
    /// after [`Cluster::teardown`] to salvage the samples of a failed trial.
    async fn collect(&self, recorder: &SampleRecorder) -> Result<(), CollectionError>;

    /// Prometheus endpoints of every role.
    fn metrics_endpoints(&self) -> Vec<Address>;

    /// Stop every process, whatever state it is in. Called on every exit path and
    /// may be called more than once.
    async fn teardown(&mut self);
}
