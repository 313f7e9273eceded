//! On-disk home of a suite and its trials.
//!
//! ```text
//! <root>/<timestamp>_<suite name>/
//!     suite.json  args.json  inputs.json  results.csv  failures.json
//!     001/
//!         input.json  data.csv  output.json  status.json  prometheus_data.csv
//!         cluster.json  <role>_<index>_{out,err}.log  <role>_<index>.perf.data
//!     002/
//!     ...
//! ```
//!
//! Every artifact is written to a temporary file and renamed into place, so a
//! reader never sees half of one and writing the same artifact twice is harmless.

use std::{
    fmt::Display,
    fs::{self, File},
    io::{BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, SecondsFormat, Utc};
use paxbench_stats::{Sample, SampleLog};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::{
    error::DirectoryError,
    input::Input,
    output::Output,
    scrape::{MetricsRow, MetricsTable},
    suite::SummaryRow,
    trial::TrialStatus,
};

const MANIFEST: &str = "suite.json";
const INPUT: &str = "input.json";
const DATA: &str = "data.csv";
const OUTPUT: &str = "output.json";
const STATUS: &str = "status.json";
const METRICS: &str = "prometheus_data.csv";

/// Identifier of one trial within a suite. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrialId(u32);

impl TrialId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Display for TrialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

impl FromStr for TrialId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A freshly allocated, exclusively owned trial directory.
#[derive(Debug, Clone)]
pub struct TrialSlot {
    id: TrialId,
    path: PathBuf,
}

impl TrialSlot {
    pub fn id(&self) -> TrialId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub enum Artifact<'a> {
    Input(&'a Input),
    Log(&'a SampleLog),
    Output(&'a Output),
    Status(&'a TrialStatus),
    Metrics(&'a MetricsTable),
}

impl Artifact<'_> {
    fn file_name(&self) -> &'static str {
        match self {
            Self::Input(_) => INPUT,
            Self::Log(_) => DATA,
            Self::Output(_) => OUTPUT,
            Self::Status(_) => STATUS,
            Self::Metrics(_) => METRICS,
        }
    }
}

/// Everything persisted for one trial.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub id: TrialId,
    pub input: Input,
    pub log: SampleLog,
    /// Only trials that finished have an output.
    pub output: Option<Output>,
    pub status: Option<TrialStatus>,
    pub metrics: Option<MetricsTable>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SuiteManifest {
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SuiteDirectory {
    path: PathBuf,
    name: String,
    next_id: AtomicU32,
}

impl SuiteDirectory {
    /// Creates a new, uniquely named suite directory under `root`.
    pub fn create(root: &Path, name: &str) -> Result<Self, DirectoryError> {
        let created_at = Utc::now();
        let path = root.join(format!(
            "{}_{}",
            created_at.format("%Y-%m-%d_%H-%M-%S_%6f"),
            name
        ));
        fs::create_dir_all(root).map_err(io_error(root))?;
        fs::create_dir(&path).map_err(io_error(&path))?;
        write_json(
            &path.join(MANIFEST),
            &SuiteManifest {
                name: name.to_owned(),
                created_at,
            },
        )?;
        debug!(?path, "Created suite directory");
        Ok(Self {
            path,
            name: name.to_owned(),
            next_id: AtomicU32::new(1),
        })
    }

    /// Reopens an existing suite directory. New slots continue after the highest
    /// trial id already on disk.
    pub fn open(path: &Path) -> Result<Self, DirectoryError> {
        let manifest: SuiteManifest = read_json(&path.join(MANIFEST))?
            .ok_or_else(|| DirectoryError::NotASuite(path.to_owned()))?;
        let mut dir = Self {
            path: path.to_owned(),
            name: manifest.name,
            next_id: AtomicU32::new(1),
        };
        let next = dir
            .trial_ids()?
            .last()
            .map_or(1, |id| id.get().saturating_add(1));
        dir.next_id = AtomicU32::new(next);
        Ok(dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trial_path(&self, trial: TrialId) -> PathBuf {
        self.path.join(trial.to_string())
    }

    /// Allocates the next trial id and its directory. Safe to call concurrently.
    pub fn create_trial_slot(&self) -> Result<TrialSlot, DirectoryError> {
        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
                .map(TrialId)
                .map_err(|_| DirectoryError::OutOfIds(self.path.clone()))?;
            let path = self.trial_path(id);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(TrialSlot { id, path }),
                // someone else's directory, e.g. from before a reopen
                Err(error) if error.kind() == ErrorKind::AlreadyExists => continue,
                Err(source) => return Err(DirectoryError::Io { path, source }),
            }
        }
    }

    /// Ids of every trial on disk, in order.
    pub fn trial_ids(&self) -> Result<Vec<TrialId>, DirectoryError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.path).map_err(io_error(&self.path))? {
            let entry = entry.map_err(io_error(&self.path))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<TrialId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn persist(&self, trial: TrialId, artifact: Artifact<'_>) -> Result<(), DirectoryError> {
        let path = self.trial_path(trial).join(artifact.file_name());
        match artifact {
            Artifact::Input(input) => write_json(&path, input),
            Artifact::Output(output) => write_json(&path, output),
            Artifact::Status(status) => write_json(&path, status),
            Artifact::Log(log) => write_atomically(&path, |writer| {
                write_samples(writer, log).map_err(csv_error(&path))
            }),
            Artifact::Metrics(table) => write_atomically(&path, |writer| {
                write_metrics(writer, table).map_err(csv_error(&path))
            }),
        }
    }

    pub fn load(&self, trial: TrialId) -> Result<TrialRecord, DirectoryError> {
        let dir = self.trial_path(trial);
        let input = read_json(&dir.join(INPUT))?.ok_or(DirectoryError::MissingInput(trial))?;

        let data = dir.join(DATA);
        let log = if data.exists() {
            read_samples(&data).map_err(csv_error(&data))?
        } else {
            SampleLog::default()
        };

        let metrics = dir.join(METRICS);
        let metrics = if metrics.exists() {
            Some(read_metrics(&metrics)?)
        } else {
            None
        };

        Ok(TrialRecord {
            id: trial,
            input,
            log,
            output: read_json(&dir.join(OUTPUT))?,
            status: read_json(&dir.join(STATUS))?,
            metrics,
        })
    }

    /// Writes a suite level JSON file such as `args.json`.
    pub fn write_json<T: Serialize + ?Sized>(
        &self,
        file_name: &str,
        value: &T,
    ) -> Result<(), DirectoryError> {
        write_json(&self.path.join(file_name), value)
    }

    /// Writes a summary table, one row per trial, with the trial id first.
    pub fn write_table(
        &self,
        file_name: &str,
        columns: &[String],
        rows: &[(TrialId, SummaryRow)],
    ) -> Result<(), DirectoryError> {
        let path = self.path.join(file_name);
        write_atomically(&path, |writer| {
            write_table(writer, columns, rows).map_err(csv_error(&path))
        })
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DirectoryError + '_ {
    move |source| DirectoryError::Io {
        path: path.to_owned(),
        source,
    }
}

fn csv_error(path: &Path) -> impl FnOnce(csv::Error) -> DirectoryError + '_ {
    move |source| DirectoryError::Csv {
        path: path.to_owned(),
        source,
    }
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<(), DirectoryError>,
) -> Result<(), DirectoryError> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut writer = BufWriter::new(File::create(&tmp).map_err(io_error(&tmp))?);
    write(&mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|error| io_error(&tmp)(error.into_error()))?;
    file.sync_all().map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), DirectoryError> {
    write_atomically(path, |writer| {
        serde_json::to_writer_pretty(&mut *writer, value).map_err(|source| {
            DirectoryError::Json {
                path: path.to_owned(),
                source,
            }
        })?;
        writer.flush().map_err(io_error(path))
    })
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DirectoryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(DirectoryError::Io {
                path: path.to_owned(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| DirectoryError::Json {
            path: path.to_owned(),
            source,
        })
}

/// Writes samples as `start,stop,latency_nanos` rows.
pub fn write_samples<W: Write>(writer: W, log: &SampleLog) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    if log.is_empty() {
        writer.write_record(["start", "stop", "latency_nanos"])?;
    }
    for sample in log.iter() {
        writer.serialize(sample)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_samples(path: &Path) -> csv::Result<SampleLog> {
    csv::Reader::from_path(path)?.deserialize::<Sample>().collect()
}

/// Reads whatever samples parse, returning them with the number of rows skipped.
///
/// Used on files a client may still have been writing when it was stopped.
pub fn read_samples_lossy(path: &Path) -> csv::Result<(Vec<Sample>, usize)> {
    let mut samples = Vec::new();
    let mut skipped = 0;
    for record in csv::Reader::from_path(path)?.deserialize::<Sample>() {
        match record {
            Ok(sample) => samples.push(sample),
            Err(error) if error.is_io_error() => return Err(error),
            Err(_) => skipped += 1,
        }
    }
    Ok((samples, skipped))
}

/// Writes a metrics table with a leading `timestamp` column. Missing values are
/// left empty.
pub fn write_metrics<W: Write>(writer: W, table: &MetricsTable) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let mut header = vec!["timestamp".to_owned()];
    header.extend(table.names().iter().cloned());
    writer.write_record(&header)?;
    for row in table.rows() {
        let mut record = vec![row
            .timestamp
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)];
        record.extend(
            row.values
                .iter()
                .map(|value| value.map(|v| v.to_string()).unwrap_or_default()),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_metrics(path: &Path) -> Result<MetricsTable, DirectoryError> {
    let malformed = |reason: String| DirectoryError::Malformed {
        path: path.to_owned(),
        reason,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_error(path))?;
    let headers = reader.headers().map_err(csv_error(path))?.clone();
    let mut columns = headers.iter();
    if columns.next() != Some("timestamp") {
        return Err(malformed("first column must be timestamp".to_owned()));
    }
    let mut table = MetricsTable::new(columns.map(str::to_owned).collect());

    for record in reader.records() {
        let record = record.map_err(csv_error(path))?;
        let mut fields = record.iter();
        let timestamp = fields.next().unwrap_or_default();
        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|error| malformed(format!("timestamp {timestamp:?}: {error}")))?
            .with_timezone(&Utc);
        let values = fields
            .map(|field| {
                if field.is_empty() {
                    Ok(None)
                } else {
                    field
                        .parse::<f64>()
                        .map(Some)
                        .map_err(|error| malformed(format!("value {field:?}: {error}")))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        table.push_row(MetricsRow { timestamp, values });
    }
    Ok(table)
}

/// Writes `rows` under a `trial` column followed by `columns`. The header is
/// written even without rows, and values a row lacks are left empty.
pub fn write_table<W: Write>(
    writer: W,
    columns: &[String],
    rows: &[(TrialId, SummaryRow)],
) -> csv::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    let mut header = vec!["trial"];
    header.extend(columns.iter().map(String::as_str));
    writer.write_record(&header)?;
    for (trial, row) in rows {
        let mut record = vec![trial.to_string()];
        record.extend(
            columns
                .iter()
                .map(|column| row.get(column).unwrap_or_default().to_owned()),
        );
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}
