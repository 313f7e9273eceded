//! The concrete suites this tool knows how to run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    input::{
        AcceptorOptions, ClientOptions, DepServiceNodeOptions, Input, LeaderOptions, LogLevel,
        NetName,
    },
    output::Output,
    suite::{SuiteDefinition, SummaryRow},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleArgs {
    pub profile: bool,
    pub monitor: bool,
    pub log_level: LogLevel,
    /// Times the whole grid is run.
    pub repeats: u32,
}

impl Default for ScaleArgs {
    fn default() -> Self {
        Self {
            profile: false,
            monitor: false,
            log_level: LogLevel::Info,
            repeats: 3,
        }
    }
}

/// `(num_client_procs, num_clients_per_proc)` pairs tried for a given `f`.
fn client_topologies(f: u32) -> Vec<(u32, u32)> {
    let max_procs = if f == 1 { 4 } else { 7 };
    std::iter::once((1, 1))
        .chain((1..=max_procs).map(|procs| (procs, 10)))
        .collect()
}

pub fn scale_inputs(args: &ScaleArgs) -> Vec<Input> {
    let mut inputs = Vec::new();
    for _ in 0..args.repeats {
        for f in [1, 2] {
            for (num_client_procs, num_clients_per_proc) in client_topologies(f) {
                inputs.push(Input {
                    net_name: NetName::SingleSwitchNet,
                    f,
                    num_client_procs,
                    num_clients_per_proc,
                    duration: Duration::from_secs(20),
                    timeout: Duration::from_secs(45),
                    client_lag: Duration::from_secs(5),
                    profiled: args.profile,
                    monitored: args.monitor,
                    prometheus_scrape_interval: Duration::from_millis(200),
                    leader_options: LeaderOptions::default(),
                    leader_log_level: args.log_level,
                    dep_service_node_options: DepServiceNodeOptions::default(),
                    dep_service_node_log_level: args.log_level,
                    acceptor_options: AcceptorOptions::default(),
                    acceptor_log_level: args.log_level,
                    client_options: ClientOptions::default(),
                    client_log_level: args.log_level,
                    client_num_keys: 1000,
                });
            }
        }
    }
    inputs
}

/// Columns of [`scale_summary`] rows.
pub const SCALE_COLUMNS: [&str; 8] = [
    "f",
    "num_client_procs",
    "num_clients_per_proc",
    "num_clients",
    "median_latency_ms",
    "median_1_second_throughput",
    "p90_1_second_throughput",
    "p95_1_second_throughput",
];

pub fn scale_columns() -> Vec<String> {
    SCALE_COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// The row written to `results.csv` for a scale trial.
pub fn scale_summary(input: &Input, output: &Output) -> SummaryRow {
    SummaryRow::new()
        .with("f", input.f)
        .with("num_client_procs", input.num_client_procs)
        .with("num_clients_per_proc", input.num_clients_per_proc)
        .with("num_clients", input.num_clients())
        .with("median_latency_ms", output.median_latency_ms())
        .with("median_1_second_throughput", output.median_1_second_throughput())
        .with("p90_1_second_throughput", output.p90_1_second_throughput())
        .with("p95_1_second_throughput", output.p95_1_second_throughput())
}

/// Throughput and latency of Unanimous BPaxos as clients are added, for f = 1 and 2.
pub fn unanimous_bpaxos_scale(args: ScaleArgs) -> SuiteDefinition {
    let args_json = serde_json::to_value(&args).unwrap_or_default();
    SuiteDefinition {
        name: "unanimous_bpaxos_scale".to_owned(),
        args: args_json,
        columns: scale_columns(),
        inputs: Box::new(move || scale_inputs(&args)),
        summary: Box::new(scale_summary),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn grid_shape() {
        let inputs = scale_inputs(&ScaleArgs::default());
        // (1 + 4) topologies for f = 1, (1 + 7) for f = 2, three times over
        assert_eq!(inputs.len(), 3 * (5 + 8));
        assert!(inputs.iter().all(|i| i.validate().is_ok()));

        let first: Vec<_> = inputs
            .iter()
            .take(5)
            .map(|i| (i.f, i.num_client_procs, i.num_clients_per_proc))
            .collect();
        assert_eq!(
            first,
            vec![(1, 1, 1), (1, 1, 10), (1, 2, 10), (1, 3, 10), (1, 4, 10)]
        );
        assert_eq!(inputs[12].num_client_procs, 7);
        assert_eq!(inputs[13], inputs[0]);
    }

    #[test]
    fn flags_reach_every_input() {
        let args = ScaleArgs {
            profile: true,
            monitor: true,
            log_level: LogLevel::Debug,
            repeats: 1,
        };
        let inputs = scale_inputs(&args);
        assert_eq!(inputs.len(), 13);
        assert!(inputs
            .iter()
            .all(|i| i.profiled && i.monitored && i.client_log_level == LogLevel::Debug));
    }

    #[test]
    fn summary_columns() {
        let definition = unanimous_bpaxos_scale(ScaleArgs::default());
        assert_eq!(definition.args["repeats"], 3);
        let inputs = (definition.inputs)();
        let output = Output::compute(
            crate::directory::TrialId::new(1),
            &Default::default(),
            None,
            &Default::default(),
        );
        let row = (definition.summary)(&inputs[1], &output);
        assert_eq!(row.names().collect::<Vec<_>>(), SCALE_COLUMNS);
        assert_eq!(definition.columns, SCALE_COLUMNS);
        assert_eq!(row.get("num_clients"), Some("10"));
    }
}
