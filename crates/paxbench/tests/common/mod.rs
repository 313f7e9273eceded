#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::future::join_all;
use paxbench::{
    directory::TrialSlot,
    error::{CollectionError, ProvisionError},
    input::{
        AcceptorOptions, ClientOptions, DepServiceNodeOptions, Input, LeaderOptions, LogLevel,
        NetName, Role,
    },
    provision::{Cluster, Provisioner, Topology},
    Address,
};
use paxbench_stats::{Sample, SampleRecorder};
use tokio::time::Instant;

/// The f = 1, 2 x 10 clients, 20 s run, 45 s timeout, 5 s lag trial.
pub fn input() -> Input {
    Input {
        net_name: NetName::SingleSwitchNet,
        f: 1,
        num_client_procs: 2,
        num_clients_per_proc: 10,
        duration: Duration::from_secs(20),
        timeout: Duration::from_secs(45),
        client_lag: Duration::from_secs(5),
        profiled: false,
        monitored: false,
        prometheus_scrape_interval: Duration::from_millis(200),
        leader_options: LeaderOptions::default(),
        leader_log_level: LogLevel::Info,
        dep_service_node_options: DepServiceNodeOptions::default(),
        dep_service_node_log_level: LogLevel::Info,
        acceptor_options: AcceptorOptions::default(),
        acceptor_log_level: LogLevel::Info,
        client_options: ClientOptions::default(),
        client_log_level: LogLevel::Info,
        client_num_keys: 1000,
    }
}

/// What the fake clusters were asked to do, in order.
#[derive(Debug, Default)]
pub struct Events {
    pub provisioned_at: Vec<Instant>,
    pub clients_started_at: Vec<Instant>,
    pub clients_stopped: u32,
    pub collected: u32,
    pub torn_down: u32,
    /// Every call made, in order.
    pub calls: Vec<&'static str>,
}

/// Pretends to provision clusters whose client processes each complete 10 requests
/// per second of the trial, 5 ms apiece.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    calls: AtomicU32,
    /// 1-based provision call that fails.
    pub fail_on_call: Option<u32>,
    /// Clients never acknowledge being stopped.
    pub hang_on_stop: bool,
    pub events: Arc<Mutex<Events>>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on_call(call: u32) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::default()
        }
    }

    pub fn hanging_on_stop() -> Self {
        Self {
            hang_on_stop: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    type Cluster = FakeCluster;

    async fn provision(
        &self,
        topology: &Topology,
        _slot: &TrialSlot,
    ) -> Result<FakeCluster, ProvisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(ProvisionError::Unavailable(format!(
                "provision call {call} refused"
            )));
        }
        self.events
            .lock()
            .unwrap()
            .provisioned_at
            .push(Instant::now());
        self.events.lock().unwrap().calls.push("provision");
        Ok(FakeCluster {
            events: self.events.clone(),
            client_procs: topology.count(Role::Client),
            duration: topology.workload.duration,
            hang_on_stop: self.hang_on_stop,
        })
    }
}

pub struct FakeCluster {
    events: Arc<Mutex<Events>>,
    client_procs: u32,
    duration: Duration,
    hang_on_stop: bool,
}

#[async_trait]
impl Cluster for FakeCluster {
    async fn start_clients(&mut self) -> Result<(), ProvisionError> {
        self.events
            .lock()
            .unwrap()
            .clients_started_at
            .push(Instant::now());
        self.events.lock().unwrap().calls.push("start_clients");
        Ok(())
    }

    async fn stop_clients(&mut self) -> Result<(), CollectionError> {
        if self.hang_on_stop {
            std::future::pending::<()>().await;
        }
        let mut events = self.events.lock().unwrap();
        events.clients_stopped += 1;
        events.calls.push("stop_clients");
        Ok(())
    }

    async fn collect(&self, recorder: &SampleRecorder) -> Result<(), CollectionError> {
        let base = Utc.timestamp_opt(1_600_000_000, 0).unwrap();
        let per_proc = self.duration.as_secs() as i64 * 10;
        let procs = (0..self.client_procs as i64).map(|proc| {
            let recorder = recorder.clone();
            tokio::spawn(async move {
                for k in 0..per_proc {
                    let start = base + chrono::Duration::milliseconds(k * 100 + proc);
                    recorder.record(Sample::new(start, start + chrono::Duration::milliseconds(5)));
                }
            })
        });
        for joined in join_all(procs).await {
            joined.map_err(|e| CollectionError::Incomplete(e.to_string()))?;
        }
        let mut events = self.events.lock().unwrap();
        events.collected += 1;
        events.calls.push("collect");
        Ok(())
    }

    fn metrics_endpoints(&self) -> Vec<Address> {
        Vec::new()
    }

    async fn teardown(&mut self) {
        let mut events = self.events.lock().unwrap();
        events.torn_down += 1;
        events.calls.push("teardown");
    }
}
