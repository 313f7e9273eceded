//! Periodic scraping of the roles' Prometheus endpoints.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::Address;

/// Scraped metrics, one row per scrape and one column per metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsTable {
    names: Vec<String>,
    rows: Vec<MetricsRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRow {
    pub timestamp: DateTime<Utc>,
    /// Indexed like [`MetricsTable::names`].
    pub values: Vec<Option<f64>>,
}

impl MetricsTable {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            rows: Vec::new(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> &[MetricsRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends one scrape. Metrics not seen before become new columns, empty in
    /// earlier rows.
    pub fn push(&mut self, timestamp: DateTime<Utc>, samples: BTreeMap<String, f64>) {
        for name in samples.keys() {
            if !self.names.contains(name) {
                self.names.push(name.clone());
                for row in &mut self.rows {
                    row.values.push(None);
                }
            }
        }
        let values = self
            .names
            .iter()
            .map(|name| samples.get(name).copied())
            .collect();
        self.rows.push(MetricsRow { timestamp, values });
    }

    pub fn push_row(&mut self, mut row: MetricsRow) {
        row.values.resize(self.names.len(), None);
        self.rows.push(row);
    }

    /// The observed values of one metric over time.
    pub fn column(&self, name: &str) -> Vec<(DateTime<Utc>, f64)> {
        let Some(index) = self.names.iter().position(|n| n == name) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| Some((row.timestamp, row.values.get(index).copied().flatten()?)))
            .collect()
    }

    /// Rows scraped at least `drop` after the first one.
    pub fn drop_prefix(&self, drop: Duration) -> Self {
        let cutoff = self.rows.first().and_then(|row| {
            chrono::Duration::from_std(drop)
                .ok()
                .and_then(|drop| row.timestamp.checked_add_signed(drop))
        });
        let rows = match cutoff {
            Some(cutoff) => self
                .rows
                .iter()
                .filter(|row| row.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        Self {
            names: self.names.clone(),
            rows,
        }
    }
}

/// Sums the samples of a Prometheus text exposition per metric name, ignoring
/// labels, comments and non finite values.
pub fn parse_exposition(text: &str) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (name, rest) = match (line.find('{'), line.rfind('}')) {
            (Some(open), Some(close)) if open < close => (&line[..open], &line[close + 1..]),
            _ => match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest),
                None => continue,
            },
        };
        let Some(value) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
        else {
            continue;
        };
        if name.is_empty() || !value.is_finite() {
            continue;
        }
        *totals.entry(name.to_owned()).or_insert(0.) += value;
    }
    totals
}

/// Polls a set of endpoints on a fixed interval until stopped.
#[derive(Debug, Clone)]
pub struct Scraper {
    client: reqwest::Client,
    endpoints: Vec<Address>,
    interval: Duration,
}

impl Scraper {
    pub fn new(endpoints: Vec<Address>, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            interval,
        }
    }

    pub fn spawn(self) -> ScraperHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(endpoints = self.endpoints.len(), interval = ?self.interval, "Starting scraper");
            let mut table = MetricsTable::default();
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let timestamp = Utc::now();
                        let samples = self.scrape().await;
                        if !samples.is_empty() {
                            table.push(timestamp, samples);
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!(scrapes = table.len(), "Stopped scraper");
            table
        });
        ScraperHandle { stop, task }
    }

    async fn scrape(&self) -> BTreeMap<String, f64> {
        let bodies = join_all(self.endpoints.iter().map(|e| self.fetch(e))).await;
        let mut totals = BTreeMap::new();
        for body in bodies.into_iter().flatten() {
            for (name, value) in parse_exposition(&body) {
                *totals.entry(name).or_insert(0.) += value;
            }
        }
        totals
    }

    async fn fetch(&self, endpoint: &Address) -> Option<String> {
        let response = self
            .client
            .get(endpoint.metrics_url())
            .timeout(self.interval.max(Duration::from_secs(1)))
            .send()
            .await;
        match response {
            Ok(response) => match response.text().await {
                Ok(body) => Some(body),
                Err(error) => {
                    debug!(%error, %endpoint, "Failed to read metrics body");
                    None
                }
            },
            Err(error) => {
                debug!(%error, %endpoint, "Failed to scrape endpoint");
                None
            }
        }
    }
}

pub struct ScraperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<MetricsTable>,
}

impl ScraperHandle {
    /// Stops scraping and returns everything scraped so far.
    pub async fn stop(self) -> MetricsTable {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(table) => table,
            Err(error) => {
                warn!(%error, "Scraper task failed");
                MetricsTable::default()
            }
        }
    }
}
