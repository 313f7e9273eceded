use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single completed client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub latency_nanos: u64,
}

impl Sample {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Self {
        let latency_nanos = (stop - start)
            .num_nanoseconds()
            .and_then(|nanos| u64::try_from(nanos).ok())
            .unwrap_or(0);
        Self {
            start,
            stop,
            latency_nanos,
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_nanos as f64 / 1e6
    }
}

/// The raw samples of one trial.
///
/// Samples are kept in arrival order; use [`SampleLog::sorted`] before anything
/// that cares about time order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleLog {
    samples: Vec<Sample>,
}

impl SampleLog {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sorted by start time, ties broken by stop time.
    pub fn sorted(mut self) -> Self {
        self.samples.sort_by_key(|s| (s.start, s.stop));
        self
    }

    pub fn first_start(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.start).min()
    }

    pub fn last_stop(&self) -> Option<DateTime<Utc>> {
        self.samples.iter().map(|s| s.stop).max()
    }

    pub fn latencies_ms(&self) -> Vec<f64> {
        self.samples.iter().map(Sample::latency_ms).collect()
    }
}

impl FromIterator<Sample> for SampleLog {
    fn from_iter<T: IntoIterator<Item = Sample>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Shared append handle used while a trial is running.
///
/// Clients append concurrently and in no particular order.
#[derive(Debug, Clone, Default)]
pub struct SampleRecorder {
    samples: Arc<Mutex<Vec<Sample>>>,
}

impl SampleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, sample: Sample) {
        self.lock().push(sample);
    }

    pub fn extend(&self, samples: impl IntoIterator<Item = Sample>) {
        self.lock().extend(samples);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of everything recorded so far, leaving the recorder usable.
    pub fn snapshot(&self) -> SampleLog {
        SampleLog::new(self.lock().clone())
    }

    /// Take everything recorded so far.
    pub fn finish(self) -> SampleLog {
        SampleLog::new(std::mem::take(&mut *self.lock()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sample>> {
        // a push never leaves the Vec half written, so poisoning is ignored
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_600_000_000_000 + millis).unwrap()
    }

    #[test]
    fn latency_is_stop_minus_start() {
        let sample = Sample::new(at(0), at(0) + Duration::nanoseconds(1_234_567));
        assert_eq!(sample.latency_nanos, 1_234_567);
        assert_eq!(sample.latency_ms(), 1.234567);
    }

    #[test]
    fn negative_latency_clamps_to_zero() {
        let sample = Sample::new(at(10), at(5));
        assert_eq!(sample.latency_nanos, 0);
    }

    #[test]
    fn sorted_orders_by_start() {
        let log = SampleLog::new(vec![
            Sample::new(at(30), at(31)),
            Sample::new(at(10), at(12)),
            Sample::new(at(20), at(40)),
        ])
        .sorted();
        let starts: Vec<_> = log.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![at(10), at(20), at(30)]);
        assert_eq!(log.first_start(), Some(at(10)));
        assert_eq!(log.last_stop(), Some(at(40)));
    }

    #[test]
    fn recorder_accepts_concurrent_appends() {
        let recorder = SampleRecorder::new();
        let handles: Vec<_> = (0..8)
            .map(|client| {
                let recorder = recorder.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        recorder.record(Sample::new(at(client * 1000 + i), at(client * 1000 + i + 1)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(recorder.len(), 800);
        let snapshot = recorder.snapshot();
        let log = recorder.finish();
        assert_eq!(snapshot, log);
        assert_eq!(log.len(), 800);
    }
}
