use std::fmt::Display;

use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::{
    directory::{SuiteDirectory, TrialId},
    error::{FailureKind, SuiteError},
    input::Input,
    output::{AnalysisOptions, Output},
    provision::Provisioner,
    trial::TrialRunner,
};

/// One line of a suite's summary table, columns in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryRow {
    columns: Vec<(String, String)>,
}

impl SummaryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.columns.push((name.into(), value.to_string()));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(_, value)| value.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Display for SummaryRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        write!(f, "}}")
    }
}

pub type InputsFn = Box<dyn Fn() -> Vec<Input> + Send + Sync>;
pub type SummaryFn = Box<dyn Fn(&Input, &Output) -> SummaryRow + Send + Sync>;

/// What a suite runs and how each trial is summarised.
pub struct SuiteDefinition {
    pub name: String,
    /// Arguments the suite was built from, persisted as `args.json`.
    pub args: serde_json::Value,
    /// Columns of the rows `summary` produces, in order.
    pub columns: Vec<String>,
    pub inputs: InputsFn,
    pub summary: SummaryFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuiteOptions {
    /// Trials allowed to run at once.
    pub parallelism: usize,
    /// Extra attempts for an input whose trial failed, each under a new trial id.
    pub retries: u32,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub trial: TrialId,
    /// Position of the input in the suite's grid.
    pub input_index: usize,
    pub attempt: u32,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    /// Successful trials, in grid order.
    pub rows: Vec<(TrialId, SummaryRow)>,
    pub failures: Vec<TrialFailure>,
    /// Inputs never started because the suite was aborted.
    pub skipped: usize,
}

#[derive(Debug, Default)]
struct InputOutcome {
    row: Option<(TrialId, SummaryRow)>,
    failures: Vec<TrialFailure>,
    skipped: bool,
}

pub struct Suite {
    definition: SuiteDefinition,
    options: SuiteOptions,
    analysis: AnalysisOptions,
}

impl Suite {
    pub fn new(definition: SuiteDefinition, options: SuiteOptions) -> Self {
        Self {
            definition,
            options,
            analysis: AnalysisOptions::default(),
        }
    }

    pub fn with_analysis(mut self, analysis: AnalysisOptions) -> Self {
        self.analysis = analysis;
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Runs every input of the suite, writing `args.json`, `inputs.json`,
    /// `results.csv` and `failures.json` into `directory`.
    ///
    /// Trial failures are recorded in the report rather than returned. Once
    /// `abort` reads true no further trials are started. If the directory itself
    /// fails, the rows and failures gathered so far are still written before the
    /// error is returned.
    #[instrument(skip_all, fields(suite = %self.definition.name))]
    pub async fn run_suite<P: Provisioner>(
        &self,
        provisioner: &P,
        directory: &SuiteDirectory,
        abort: watch::Receiver<bool>,
    ) -> Result<SuiteReport, SuiteError> {
        let inputs = (self.definition.inputs)();
        for (index, input) in inputs.iter().enumerate() {
            input
                .validate()
                .map_err(|source| SuiteError::InvalidInput {
                    suite: self.definition.name.clone(),
                    index,
                    source,
                })?;
        }
        directory.write_json("args.json", &self.definition.args)?;
        directory.write_json("inputs.json", &inputs)?;
        info!(
            inputs = inputs.len(),
            parallelism = self.options.parallelism,
            retries = self.options.retries,
            "Starting suite"
        );

        let runner = TrialRunner::new(provisioner, directory, self.analysis.clone())
            .with_abort(abort.clone());
        let total = inputs.len();
        let outcomes: Vec<Result<InputOutcome, SuiteError>> =
            stream::iter(inputs.iter().enumerate())
                .map(|(index, input)| {
                    self.run_input(&runner, directory, &abort, index, total, input)
                })
                .buffered(self.options.parallelism.max(1))
                .collect()
                .await;

        let mut report = SuiteReport::default();
        let mut broken = None;
        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    report.rows.extend(outcome.row);
                    report.failures.extend(outcome.failures);
                    if outcome.skipped {
                        report.skipped += 1;
                    }
                }
                Err(error) => {
                    warn!(%error, "Suite directory failed");
                    broken.get_or_insert(error);
                }
            }
        }

        directory.write_table("results.csv", &self.definition.columns, &report.rows)?;
        directory.write_json("failures.json", &report.failures)?;
        if let Some(error) = broken {
            return Err(error);
        }
        info!(
            succeeded = report.rows.len(),
            failed = report.failures.len(),
            skipped = report.skipped,
            path = ?directory.path(),
            "Finished suite"
        );
        Ok(report)
    }

    async fn run_input<P: Provisioner>(
        &self,
        runner: &TrialRunner<'_, P>,
        directory: &SuiteDirectory,
        abort: &watch::Receiver<bool>,
        index: usize,
        total: usize,
        input: &Input,
    ) -> Result<InputOutcome, SuiteError> {
        let mut outcome = InputOutcome::default();
        for attempt in 0..=self.options.retries {
            if *abort.borrow() {
                outcome.skipped = attempt == 0;
                break;
            }
            let slot = directory.create_trial_slot()?;
            info!(
                trial = %slot.id(),
                attempt,
                "Running input {}/{}",
                index + 1,
                total
            );
            match runner.run(&slot, input).await {
                Ok(output) => {
                    let row = (self.definition.summary)(input, &output);
                    info!(trial = %slot.id(), %row, "Trial succeeded");
                    outcome.row = Some((slot.id(), row));
                    break;
                }
                Err(error) => {
                    warn!(trial = %slot.id(), %error, "Trial failed");
                    outcome.failures.push(TrialFailure {
                        trial: slot.id(),
                        input_index: index,
                        attempt,
                        kind: error.kind(),
                        reason: error.to_string(),
                    });
                    if !error.is_retryable() {
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }
}
