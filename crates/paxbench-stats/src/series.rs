use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SampleLog;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub start: DateTime<Utc>,
    pub value: f64,
}

/// Values over contiguous, equally sized windows, indexed by window start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub window: Duration,
    pub points: Vec<Point>,
}

impl TimeSeries {
    fn empty(window: Duration) -> Self {
        Self {
            window,
            points: Vec::new(),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.value).collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Most windows a series is split into. Samples past the last window are not
/// counted, which bounds memory when a log carries a bogus timestamp.
pub const MAX_WINDOWS: usize = 1 << 20;

fn num_windows(span_nanos: i64, window_nanos: i64) -> usize {
    usize::try_from(span_nanos / window_nanos)
        .map_or(MAX_WINDOWS, |n| n.saturating_add(1))
        .min(MAX_WINDOWS)
}

fn window_nanos(window: Duration) -> Option<i64> {
    let nanos = i64::try_from(window.as_nanos()).ok()?;
    (nanos > 0).then_some(nanos)
}

fn offset_nanos(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from)
        .num_nanoseconds()
        .unwrap_or(if to >= from { i64::MAX } else { i64::MIN })
}

fn window_start(anchor: DateTime<Utc>, window_nanos: i64, index: usize) -> DateTime<Utc> {
    anchor + chrono::Duration::nanoseconds(window_nanos.saturating_mul(index as i64))
}

/// Requests completed per second in each window.
///
/// Windows are anchored at the earliest start in the log and run until the last
/// stop. A request counts towards the window its stop falls in. Windows without any
/// completions report zero so the series never has gaps.
pub fn throughput(log: &SampleLog, window: Duration) -> TimeSeries {
    let (Some(window_nanos), Some(anchor), Some(end)) =
        (window_nanos(window), log.first_start(), log.last_stop())
    else {
        return TimeSeries::empty(window);
    };

    let span = offset_nanos(anchor, end).max(0);
    let mut counts = vec![0u64; num_windows(span, window_nanos)];
    for sample in log.iter() {
        let offset = offset_nanos(anchor, sample.stop).max(0);
        let index = usize::try_from(offset / window_nanos).unwrap_or(usize::MAX);
        if let Some(count) = counts.get_mut(index) {
            *count += 1;
        }
    }

    let seconds = window.as_secs_f64();
    let points = counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| Point {
            start: window_start(anchor, window_nanos, i),
            value: count as f64 / seconds,
        })
        .collect();
    TimeSeries { window, points }
}

/// Per second increase of a cumulative counter, over fixed windows.
///
/// The irregular samples are forward filled onto window boundaries anchored at the
/// first sample. A decrease between boundaries means the counter was reset and that
/// window reports zero.
pub fn rate(counter: &[(DateTime<Utc>, f64)], window: Duration) -> TimeSeries {
    let Some(window_nanos) = window_nanos(window) else {
        return TimeSeries::empty(window);
    };
    let mut observed: Vec<_> = counter
        .iter()
        .copied()
        .filter(|(_, value)| value.is_finite())
        .collect();
    observed.sort_by_key(|(timestamp, _)| *timestamp);
    let (Some(&(anchor, first)), Some(&(end, _))) = (observed.first(), observed.last()) else {
        return TimeSeries::empty(window);
    };

    let num_boundaries = num_windows(offset_nanos(anchor, end).max(0), window_nanos);
    let mut filled = Vec::with_capacity(num_boundaries);
    let mut current = first;
    let mut next = 0;
    for b in 0..num_boundaries {
        let boundary = window_start(anchor, window_nanos, b);
        while next < observed.len() && observed[next].0 <= boundary {
            current = observed[next].1;
            next += 1;
        }
        filled.push(current);
    }

    let seconds = window.as_secs_f64();
    let points = filled
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let increase = pair[1] - pair[0];
            Point {
                start: window_start(anchor, window_nanos, i),
                value: if increase < 0. { 0. } else { increase / seconds },
            }
        })
        .collect();
    TimeSeries { window, points }
}

/// Samples that started at least `drop` after the first one did.
pub fn drop_prefix(log: &SampleLog, drop: Duration) -> SampleLog {
    let Some(first) = log.first_start() else {
        return SampleLog::default();
    };
    let Some(cutoff) = chrono::Duration::from_std(drop)
        .ok()
        .and_then(|drop| first.checked_add_signed(drop))
    else {
        return SampleLog::default();
    };
    log.iter().filter(|s| s.start >= cutoff).copied().collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Sample;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_600_000_000_000 + millis).unwrap()
    }

    fn sample(start: i64, stop: i64) -> Sample {
        Sample::new(at(start), at(stop))
    }

    #[test]
    fn empty_log_has_no_windows() {
        assert!(throughput(&SampleLog::default(), Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn zero_window_has_no_windows() {
        let log = SampleLog::new(vec![sample(0, 1)]);
        assert!(throughput(&log, Duration::ZERO).is_empty());
    }

    #[test]
    fn sparse_windows_report_zero() {
        let log = SampleLog::new(vec![
            sample(0, 100),
            sample(50, 300),
            sample(3200, 3500),
        ]);
        let series = throughput(&log, Duration::from_secs(1));
        assert_eq!(series.values(), vec![2., 0., 0., 1.]);
        let starts: Vec<_> = series.points.iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![at(0), at(1000), at(2000), at(3000)]);
    }

    #[test]
    fn bogus_timestamps_cannot_blow_up_the_series() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        let mut samples: Vec<Sample> = (0..20).map(|i| sample(i * 10, i * 10 + 1)).collect();
        samples.push(Sample::new(epoch, epoch));
        let series = throughput(&SampleLog::new(samples), Duration::from_millis(1));
        assert_eq!(series.len(), MAX_WINDOWS);
        assert_eq!(series.values()[0], 1000.);
        assert_eq!(series.values().iter().sum::<f64>(), 1000.);

        let counter = [(epoch, 0.), (at(0), 10.)];
        assert_eq!(rate(&counter, Duration::from_millis(1)).len(), MAX_WINDOWS - 1);
    }

    #[test]
    fn sub_second_windows_scale_to_per_second() {
        let log = SampleLog::new(vec![sample(0, 100), sample(0, 200), sample(0, 300)]);
        let series = throughput(&log, Duration::from_millis(250));
        assert_eq!(series.values(), vec![8., 4.]);
    }

    #[test]
    fn uniform_load_has_flat_throughput() {
        // 1000 requests over 10 seconds, one every 10ms
        let log: SampleLog = (0..1000).map(|i| sample(i * 10, i * 10 + 2)).collect();
        let series = throughput(&log, Duration::from_secs(1));
        assert_eq!(series.len(), 10);
        for value in series.values() {
            assert!((value - 100.).abs() < 1e-9, "{value}");
        }
    }

    #[test]
    fn throughput_ignores_arrival_order() {
        let ordered: SampleLog = (0..50).map(|i| sample(i * 37, i * 37 + 5)).collect();
        let mut shuffled = ordered.samples().to_vec();
        shuffled.reverse();
        let shuffled = SampleLog::new(shuffled);
        let window = Duration::from_millis(500);
        assert_eq!(throughput(&ordered, window), throughput(&shuffled, window));
    }

    #[test]
    fn rate_forward_fills_and_guards_resets() {
        let counter = vec![
            (at(0), 0.),
            (at(500), 50.),
            (at(1000), 100.),
            (at(2200), 300.),
            (at(3000), 10.),
            (at(4000), 110.),
        ];
        let series = rate(&counter, Duration::from_secs(1));
        assert_eq!(series.values(), vec![100., 0., 0., 100.]);
        assert_eq!(series.points[0].start, at(0));
        assert_eq!(series.points[3].start, at(3000));
    }

    #[test]
    fn rate_sorts_its_input() {
        let counter = vec![(at(2000), 40.), (at(0), 0.), (at(1000), 10.)];
        let series = rate(&counter, Duration::from_secs(1));
        assert_eq!(series.values(), vec![10., 30.]);
    }

    #[test]
    fn rate_needs_a_full_window() {
        assert!(rate(&[], Duration::from_secs(1)).is_empty());
        assert!(rate(&[(at(0), 1.)], Duration::from_secs(1)).is_empty());
        assert!(rate(&[(at(0), 1.), (at(999), 5.)], Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn drop_prefix_removes_warmup() {
        let log: SampleLog = (0..10).map(|i| sample(i * 100, i * 100 + 1)).collect();
        let kept = drop_prefix(&log, Duration::from_millis(250));
        assert_eq!(kept.len(), 7);
        assert_eq!(kept.first_start(), Some(at(300)));
        assert_eq!(drop_prefix(&log, Duration::ZERO), log);
    }
}
