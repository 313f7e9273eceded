//! Runs every role of a trial as a process on this machine.

use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use paxbench_stats::{Sample, SampleRecorder};
use serde::{Deserialize, Serialize};
use tokio::{
    process::{Child, Command},
    task::spawn_blocking,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    directory::{read_samples_lossy, TrialSlot},
    error::{CollectionError, ProvisionError},
    input::{Role, MAX_PROCESSES},
    provision::{Cluster, Provisioner, RoleGroup, Topology},
    Address,
};

/// How long clients get to exit on their own once their duration is up.
const CLIENT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Samples more than this far outside the time the clients ran are discarded.
const CLOCK_SLACK: Duration = Duration::from_secs(60);

/// Ports are spread out per trial so trials running side by side don't collide.
const PORTS_PER_TRIAL: u16 = MAX_PROCESSES as u16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Where the protocol binaries live and how to reach them, usually read from a
/// JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub base_port: u16,
    pub metrics_base_port: u16,
    pub leader: RoleCommand,
    pub dep_service_node: RoleCommand,
    pub acceptor: RoleCommand,
    pub client: RoleCommand,
    /// Wraps every role command when a trial is profiled. `{output}` is replaced
    /// with the path of the profile to write.
    #[serde(default)]
    pub profiler: Option<Vec<String>>,
    /// Time the non client roles get to start before they are checked on.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Prometheus endpoints scraped alongside the roles, e.g. node exporters.
    #[serde(default)]
    pub extra_metrics: Vec<Address>,
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_startup_grace_ms() -> u64 {
    1000
}

impl ClusterConfig {
    pub fn command(&self, role: Role) -> &RoleCommand {
        match role {
            Role::Leader => &self.leader,
            Role::DepServiceNode => &self.dep_service_node,
            Role::Acceptor => &self.acceptor,
            Role::Client => &self.client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
}

/// The addresses of every process, written to `cluster.json` for the roles to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub roles: BTreeMap<Role, Vec<Endpoint>>,
}

impl Layout {
    fn new(
        config: &ClusterConfig,
        topology: &Topology,
        trial: u32,
    ) -> Result<Self, ProvisionError> {
        let processes: u64 = topology.roles.iter().map(|g| u64::from(g.count)).sum();
        if processes > u64::from(PORTS_PER_TRIAL) {
            return Err(ProvisionError::Unavailable(format!(
                "{processes} processes don't fit in {PORTS_PER_TRIAL} ports"
            )));
        }
        let offset = (trial % 100) as u16 * PORTS_PER_TRIAL;
        let mut next = 0u16;
        let mut roles = BTreeMap::new();
        for group in &topology.roles {
            let endpoints = (0..group.count)
                .map(|_| {
                    let endpoint = Endpoint {
                        host: config.host.clone(),
                        port: config.base_port.wrapping_add(offset).wrapping_add(next),
                        metrics_port: config
                            .metrics_base_port
                            .wrapping_add(offset)
                            .wrapping_add(next),
                    };
                    next += 1;
                    endpoint
                })
                .collect();
            roles.insert(group.role, endpoints);
        }
        Ok(Self { roles })
    }

    fn endpoint(&self, role: Role, index: u32) -> Option<&Endpoint> {
        self.roles.get(&role)?.get(index as usize)
    }
}

#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    config: ClusterConfig,
}

impl LocalProvisioner {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    type Cluster = LocalCluster;

    async fn provision(
        &self,
        topology: &Topology,
        slot: &TrialSlot,
    ) -> Result<LocalCluster, ProvisionError> {
        let layout = Layout::new(&self.config, topology, slot.id().get())?;
        let layout_path = slot.path().join("cluster.json");
        let contents = serde_json::to_vec_pretty(&layout)
            .map_err(|error| ProvisionError::Unavailable(error.to_string()))?;
        tokio::fs::write(&layout_path, contents)
            .await
            .map_err(|source| ProvisionError::Io {
                path: layout_path.clone(),
                source,
            })?;

        let mut cluster = LocalCluster {
            config: self.config.clone(),
            topology: topology.clone(),
            layout,
            layout_path,
            dir: slot.path().to_owned(),
            servers: Vec::new(),
            clients: Vec::new(),
            clients_started_at: None,
        };
        if topology.profiled && self.config.profiler.is_none() {
            warn!("Trial is profiled but no profiler is configured, running unprofiled");
        }

        // dropping `cluster` on an error kills whatever was already started
        for group in topology.roles.iter().filter(|g| g.role != Role::Client) {
            for index in 0..group.count {
                let process = cluster.spawn(group, index, Vec::new())?;
                cluster.servers.push(process);
            }
        }
        info!(processes = cluster.servers.len(), "Started servers");

        sleep(Duration::from_millis(self.config.startup_grace_ms)).await;
        for process in &mut cluster.servers {
            if let Ok(Some(status)) = process.child.try_wait() {
                return Err(ProvisionError::ExitedEarly {
                    role: process.role,
                    index: process.index,
                    status,
                });
            }
        }
        Ok(cluster)
    }
}

#[derive(Debug)]
struct RoleProcess {
    role: Role,
    index: u32,
    child: Child,
}

#[derive(Debug)]
pub struct LocalCluster {
    config: ClusterConfig,
    topology: Topology,
    layout: Layout,
    layout_path: PathBuf,
    dir: PathBuf,
    servers: Vec<RoleProcess>,
    clients: Vec<RoleProcess>,
    clients_started_at: Option<DateTime<Utc>>,
}

impl LocalCluster {
    fn client_data(&self, index: u32) -> PathBuf {
        self.dir.join(format!("client_{index}_data.csv"))
    }

    fn log_file(&self, role: Role, index: u32, stream: &str) -> Result<File, ProvisionError> {
        let path = self.dir.join(format!("{role}_{index}_{stream}.log"));
        File::create(&path).map_err(|source| ProvisionError::Io { path, source })
    }

    fn spawn(
        &self,
        group: &RoleGroup,
        index: u32,
        extra: Vec<String>,
    ) -> Result<RoleProcess, ProvisionError> {
        let role = group.role;
        let endpoint = self.layout.endpoint(role, index).ok_or_else(|| {
            ProvisionError::Unavailable(format!("no address for {role} {index}"))
        })?;
        let command = self.config.command(role);

        let mut argv = Vec::new();
        if let (true, Some(profiler)) = (self.topology.profiled, &self.config.profiler) {
            let output = self.dir.join(format!("{role}_{index}.perf.data"));
            argv.extend(
                profiler
                    .iter()
                    .map(|arg| arg.replace("{output}", &output.to_string_lossy())),
            );
        }
        argv.push(command.program.clone());
        argv.extend(command.args.iter().cloned());
        argv.extend([
            "--index".to_owned(),
            index.to_string(),
            "--config".to_owned(),
            self.layout_path.to_string_lossy().into_owned(),
            "--log_level".to_owned(),
            group.log_level.to_string(),
            "--prometheus_host".to_owned(),
            endpoint.host.clone(),
            "--prometheus_port".to_owned(),
            endpoint.metrics_port.to_string(),
        ]);
        argv.extend(group.flags.iter().cloned());
        argv.extend(extra);

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProvisionError::Unavailable(format!("empty command for {role}")))?;
        debug!(%role, index, ?argv, "Spawning process");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(self.log_file(role, index, "out")?)
            .stderr(self.log_file(role, index, "err")?)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                role,
                index,
                source,
            })?;
        Ok(RoleProcess { role, index, child })
    }
}

async fn read_client_data(
    path: PathBuf,
) -> (PathBuf, Result<(Vec<Sample>, usize), CollectionError>) {
    let read = {
        let path = path.clone();
        spawn_blocking(move || read_samples_lossy(&path)).await
    };
    let result = match read {
        Ok(Ok(read)) => Ok(read),
        Ok(Err(source)) => Err(CollectionError::Read {
            path: path.clone(),
            source,
        }),
        Err(error) => Err(CollectionError::Incomplete(error.to_string())),
    };
    (path, result)
}

async fn kill(process: &mut RoleProcess) {
    if let Err(error) = process.child.start_kill() {
        debug!(role = %process.role, index = process.index, %error, "Process already gone");
    }
    if let Err(error) = process.child.wait().await {
        warn!(role = %process.role, index = process.index, %error, "Failed to reap process");
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    async fn start_clients(&mut self) -> Result<(), ProvisionError> {
        let Some(group) = self.topology.group(Role::Client).cloned() else {
            return Ok(());
        };
        let workload = self.topology.workload.clone();
        self.clients_started_at = Some(Utc::now());
        for index in 0..group.count {
            let extra = vec![
                "--duration".to_owned(),
                format!("{}s", workload.duration.as_secs_f64()),
                "--num_clients".to_owned(),
                workload.clients_per_proc.to_string(),
                "--num_keys".to_owned(),
                workload.num_keys.to_string(),
                "--output_file".to_owned(),
                self.client_data(index).to_string_lossy().into_owned(),
            ];
            let process = self.spawn(&group, index, extra)?;
            self.clients.push(process);
        }
        info!(clients = self.clients.len(), "Started clients");
        Ok(())
    }

    async fn stop_clients(&mut self) -> Result<(), CollectionError> {
        let mut failure = None;
        for process in &mut self.clients {
            match timeout(CLIENT_EXIT_GRACE, process.child.wait()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => {
                    failure.get_or_insert(CollectionError::ClientFailed {
                        index: process.index,
                        status,
                    });
                }
                Ok(Err(source)) => {
                    failure.get_or_insert(CollectionError::Wait {
                        index: process.index,
                        source,
                    });
                }
                Err(_) => {
                    warn!(index = process.index, "Client outlived its duration, killing it");
                    kill(process).await;
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    async fn collect(&self, recorder: &SampleRecorder) -> Result<(), CollectionError> {
        let reads = (0..self.topology.count(Role::Client))
            .map(|index| read_client_data(self.client_data(index)));
        let span = self.clients_started_at.map(|started| {
            let slack = chrono::Duration::from_std(CLOCK_SLACK)
                .unwrap_or_else(|_| chrono::Duration::zero());
            (started - slack, Utc::now() + slack)
        });
        let mut failure = None;
        for (path, result) in join_all(reads).await {
            match result {
                Ok((mut samples, mut skipped)) => {
                    if let Some((from, to)) = span {
                        let read = samples.len();
                        samples.retain(|s| s.start >= from && s.stop <= to);
                        skipped += read - samples.len();
                    }
                    if skipped > 0 {
                        warn!(?path, skipped, "Skipped malformed or out of range samples");
                        if samples.is_empty() {
                            failure.get_or_insert(CollectionError::Malformed { path, skipped });
                        }
                    }
                    recorder.extend(samples);
                }
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn metrics_endpoints(&self) -> Vec<Address> {
        self.layout
            .roles
            .values()
            .flatten()
            .filter_map(|endpoint| Address::http(&endpoint.host, endpoint.metrics_port).ok())
            .chain(self.config.extra_metrics.iter().cloned())
            .collect()
    }

    async fn teardown(&mut self) {
        for process in self.clients.iter_mut().chain(self.servers.iter_mut()) {
            kill(process).await;
        }
        info!(
            processes = self.clients.len() + self.servers.len(),
            "Tore down cluster"
        );
    }
}

/// Reads a [`ClusterConfig`] from a JSON file.
pub fn read_cluster_config(path: &Path) -> Result<ClusterConfig, ProvisionError> {
    let contents = std::fs::read(path).map_err(|source| ProvisionError::Io {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_slice(&contents)
        .map_err(|error| ProvisionError::Unavailable(format!("{}: {error}", path.display())))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{input::LogLevel, provision::ClientWorkload};

    fn command(program: &str) -> RoleCommand {
        RoleCommand {
            program: program.to_owned(),
            args: Vec::new(),
        }
    }

    fn config() -> ClusterConfig {
        ClusterConfig {
            host: default_host(),
            base_port: 10_000,
            metrics_base_port: 20_000,
            leader: command("leader"),
            dep_service_node: command("dep"),
            acceptor: command("acceptor"),
            client: command("client"),
            profiler: None,
            startup_grace_ms: 0,
            extra_metrics: Vec::new(),
        }
    }

    fn topology() -> Topology {
        let group = |role, count| RoleGroup {
            role,
            count,
            log_level: LogLevel::Info,
            flags: Vec::new(),
        };
        Topology {
            net_name: Default::default(),
            profiled: false,
            roles: vec![
                group(Role::Leader, 2),
                group(Role::DepServiceNode, 3),
                group(Role::Acceptor, 3),
                group(Role::Client, 1),
            ],
            workload: ClientWorkload {
                clients_per_proc: 1,
                num_keys: 10,
                duration: Duration::from_secs(1),
            },
        }
    }

    #[test]
    fn layout_offsets_ports_per_trial() {
        let layout = Layout::new(&config(), &topology(), 3).unwrap();
        assert_eq!(layout.roles[&Role::Leader][0].port, 10_300);
        assert_eq!(layout.roles[&Role::DepServiceNode][0].port, 10_302);
        assert_eq!(layout.roles[&Role::Client][0].metrics_port, 20_308);
        assert_eq!(layout.endpoint(Role::Acceptor, 3), None);
    }

    #[test]
    fn layout_refuses_more_processes_than_ports() {
        let mut topology = topology();
        topology.roles[3].count = u32::from(PORTS_PER_TRIAL) - 8 + 1;
        assert!(matches!(
            Layout::new(&config(), &topology, 1),
            Err(ProvisionError::Unavailable(_))
        ));
        topology.roles[3].count = u32::MAX;
        assert!(Layout::new(&config(), &topology, 1).is_err());

        topology.roles[3].count = u32::from(PORTS_PER_TRIAL) - 8;
        let layout = Layout::new(&config(), &topology, 99).unwrap();
        assert_eq!(layout.roles[&Role::Client].last().unwrap().port, 10_000 + 9_900 + 99);
    }

    #[test]
    fn config_defaults() {
        let config: ClusterConfig = serde_json::from_str(
            r#"{
                "base_port": 10000,
                "metrics_base_port": 20000,
                "leader": {"program": "leader"},
                "dep_service_node": {"program": "dep"},
                "acceptor": {"program": "acceptor"},
                "client": {"program": "client", "args": ["--flag"]},
                "extra_metrics": ["http://node-exporter:9100"]
            }"#,
        )
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.startup_grace_ms, 1000);
        assert_eq!(config.command(Role::Client).args, vec!["--flag"]);
        assert_eq!(
            config.extra_metrics[0].metrics_url(),
            "http://node-exporter:9100/metrics"
        );

        let roundtrip: ClusterConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(roundtrip, config);
    }

    #[test]
    fn config_rejects_bad_metrics_urls() {
        let config = |url: &str| {
            serde_json::from_str::<ClusterConfig>(&format!(
                r#"{{
                    "base_port": 10000,
                    "metrics_base_port": 20000,
                    "leader": {{"program": "leader"}},
                    "dep_service_node": {{"program": "dep"}},
                    "acceptor": {{"program": "acceptor"}},
                    "client": {{"program": "client"}},
                    "extra_metrics": ["{url}"]
                }}"#
            ))
        };
        assert!(config("http://node:9100").is_ok());
        assert!(config("ftp://node:9100").is_err());
        assert!(config("not a url").is_err());
    }
}
