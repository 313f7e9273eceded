//! Pure statistics over raw benchmark samples.
//!
//! Nothing in this crate performs I/O or keeps global state, so every derived
//! number can be recomputed from a persisted sample log and will come out the same.

mod bands;
mod samples;
mod series;
mod stats;

pub use bands::{bands, Band};
pub use samples::{Sample, SampleLog, SampleRecorder};
pub use series::{drop_prefix, rate, throughput, Point, TimeSeries, MAX_WINDOWS};
pub use stats::{mean, median, outliers, percentile, std, Summary};
