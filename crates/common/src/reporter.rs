//! Test execution records and report sinks

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One executed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub group: String,
    pub name: String,
    pub method: String,
    pub api: String,
    pub body: String,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub error: Option<String>,
}

impl ReportRecord {
    /// Start a record now
    pub fn start(method: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            group: String::new(),
            name: String::new(),
            method: method.into(),
            api: String::new(),
            body: String::new(),
            begin_time: now,
            end_time: now,
            error: None,
        }
    }

    /// Stamp the end time and attach the outcome
    pub fn finish(&mut self, error: Option<String>) {
        self.end_time = Utc::now();
        self.error = error;
    }

    pub fn duration(&self) -> Duration {
        (self.end_time - self.begin_time).to_std().unwrap_or_default()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Aggregated timing for one api
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResult {
    pub name: String,
    pub api: String,
    pub count: usize,
    pub average: Duration,
    pub max: Duration,
    pub min: Duration,
    pub qps: usize,
    pub error: usize,
    pub last_error_message: Option<String>,
}

/// A sink for report records, shared across concurrent test runs
pub trait TestReporter: Send + Sync {
    fn put_record(&self, record: ReportRecord);

    fn records(&self) -> Vec<ReportRecord>;
}

/// Drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardTestReporter;

impl TestReporter for DiscardTestReporter {
    fn put_record(&self, _record: ReportRecord) {}

    fn records(&self) -> Vec<ReportRecord> {
        Vec::new()
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct MemoryTestReporter {
    records: Mutex<Vec<ReportRecord>>,
}

impl MemoryTestReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate records per api, sorted by average duration (slowest first)
    pub fn export_results(&self) -> Vec<ReportResult> {
        let records = self.records.lock();

        let mut grouped: BTreeMap<&str, Vec<&ReportRecord>> = BTreeMap::new();
        for record in records.iter() {
            grouped.entry(record.api.as_str()).or_default().push(record);
        }

        let mut results: Vec<ReportResult> = grouped
            .into_iter()
            .map(|(api, items)| aggregate(api, &items))
            .collect();
        results.sort_by(|a, b| b.average.cmp(&a.average));
        results
    }
}

fn aggregate(api: &str, items: &[&ReportRecord]) -> ReportResult {
    let durations: Vec<Duration> = items.iter().map(|r| r.duration()).collect();
    let total: Duration = durations.iter().sum();
    let count = items.len();

    let first_begin = items.iter().map(|r| r.begin_time).min();
    let last_end = items.iter().map(|r| r.end_time).max();
    let span = match (first_begin, last_end) {
        (Some(begin), Some(end)) => (end - begin).to_std().unwrap_or_default(),
        _ => Duration::ZERO,
    };
    let qps = if span.is_zero() {
        count
    } else {
        (count as f64 / span.as_secs_f64()) as usize
    };

    let errors: Vec<&str> = items.iter().filter_map(|r| r.error_message()).collect();

    ReportResult {
        name: items.last().map(|r| r.name.clone()).unwrap_or_default(),
        api: api.to_string(),
        count,
        average: total / count.max(1) as u32,
        max: durations.iter().copied().max().unwrap_or_default(),
        min: durations.iter().copied().min().unwrap_or_default(),
        qps,
        error: errors.len(),
        last_error_message: errors.last().map(|s| s.to_string()),
    }
}

impl TestReporter for MemoryTestReporter {
    fn put_record(&self, record: ReportRecord) {
        self.records.lock().push(record);
    }

    fn records(&self) -> Vec<ReportRecord> {
        self.records.lock().clone()
    }
}
