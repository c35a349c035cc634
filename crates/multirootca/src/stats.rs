//! Request and error counters of the dispatcher.
//!
//! Counters never block and never fail, so recording them can't get in the
//! way of issuing certificates.
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

/// Counts requests per label and errors overall.
///
/// All labels are registered up front. Requests for labels which are not
/// registered are counted in a separate bucket.
#[derive(Debug)]
pub struct Stats {
    started: Instant,
    label_requests: BTreeMap<String, AtomicU64>,
    unknown_label_requests: AtomicU64,
    total_requests: AtomicU64,
    errors: AtomicU64,
}

/// A point-in-time copy of all [`Stats`] counters.
///
/// Rates are events per second, averaged over the lifetime of the [`Stats`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatsSnapshot {
    pub uptime_seconds: f64,
    pub label_requests: BTreeMap<String, u64>,
    pub label_request_rates: BTreeMap<String, f64>,
    pub unknown_label_requests: u64,
    pub total_requests: u64,
    pub total_request_rate: f64,
    pub errors: u64,
    pub error_rate: f64,
    pub error_percent: f64,
}

impl Stats {
    pub fn new<I, L>(labels: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        Self {
            started: Instant::now(),
            label_requests: labels
                .into_iter()
                .map(|label| (label.into(), AtomicU64::new(0)))
                .collect(),
            unknown_label_requests: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn increment_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_label_requests(&self, label: &str) {
        self.label_requests
            .get(label)
            .unwrap_or(&self.unknown_label_requests)
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// The share of failed requests in percent, `0.0` before the first
    /// request.
    pub fn error_percent(&self) -> f64 {
        error_percent(
            self.errors.load(Ordering::Relaxed),
            self.total_requests.load(Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_after(self.started.elapsed())
    }

    fn snapshot_after(&self, uptime: Duration) -> StatsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let label_requests: BTreeMap<_, _> = self
            .label_requests
            .iter()
            .map(|(label, counter)| (label.clone(), counter.load(Ordering::Relaxed)))
            .collect();

        StatsSnapshot {
            uptime_seconds: uptime.as_secs_f64(),
            label_request_rates: label_requests
                .iter()
                .map(|(label, requests)| (label.clone(), rate(*requests, uptime)))
                .collect(),
            label_requests,
            unknown_label_requests: self.unknown_label_requests.load(Ordering::Relaxed),
            total_requests,
            total_request_rate: rate(total_requests, uptime),
            errors,
            error_rate: rate(errors, uptime),
            error_percent: error_percent(errors, total_requests),
        }
    }
}

/// Mean events per second, `0.0` for an empty interval.
fn rate(events: u64, uptime: Duration) -> f64 {
    let seconds = uptime.as_secs_f64();
    if seconds == 0.0 {
        return 0.0;
    }

    events as f64 / seconds
}

fn error_percent(errors: u64, total_requests: u64) -> f64 {
    if total_requests == 0 {
        return 0.0;
    }

    errors as f64 / total_requests as f64 * 100.0
}
