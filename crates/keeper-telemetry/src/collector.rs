use crate::sampler::ResourceSample;
use chrono::{DateTime, Utc};
use keeper_core::{MetricsSink, RequestOutcome};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Count plus accumulated latency, from which the average is derived.
#[derive(Default)]
struct LatencyCounter {
    total: AtomicU64,
    failed: AtomicU64,
    micros: AtomicU64,
}

impl LatencyCounter {
    fn record(&self, ok: bool, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn average_ms(&self) -> f64 {
        match self.total.load(Ordering::Relaxed) {
            0 => 0.0,
            n => self.micros.load(Ordering::Relaxed) as f64 / n as f64 / 1000.0,
        }
    }
}

/// Overall verdict for the health-check collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Broker request tallies.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestCounts {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub executor_errors: u64,
    pub avg_latency_ms: f64,
}

/// Read-only view of everything the telemetry has observed.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub tokens_minted: u64,
    pub validations: u64,
    pub failed_validations: u64,
    pub avg_validation_ms: f64,
    pub accesses: u64,
    pub failed_accesses: u64,
    pub avg_access_ms: f64,
    pub requests: RequestCounts,
    pub resources: Option<ResourceSample>,
    pub taken_at: DateTime<Utc>,
}

/// Fewer observations than this never degrade the status.
const MIN_OBSERVATIONS: u64 = 10;
const DEGRADED_FAILURE_RATIO: f64 = 0.1;
const UNHEALTHY_FAILURE_RATIO: f64 = 0.5;

fn status_for(total: u64, failed: u64) -> HealthStatus {
    if total < MIN_OBSERVATIONS {
        return HealthStatus::Healthy;
    }
    let ratio = failed as f64 / total as f64;
    if ratio > UNHEALTHY_FAILURE_RATIO {
        HealthStatus::Unhealthy
    } else if ratio > DEGRADED_FAILURE_RATIO {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Lock-free counters for the hot path plus the latest resource sample.
///
/// Implements [`MetricsSink`], so components report into it without
/// depending on this crate.
#[derive(Default)]
pub struct Telemetry {
    tokens_minted: AtomicU64,
    validations: LatencyCounter,
    accesses: LatencyCounter,
    requests: LatencyCounter,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
    executor_errors: AtomicU64,
    resources: RwLock<Option<ResourceSample>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached resource sample.
    pub fn record_sample(&self, sample: ResourceSample) {
        *self.resources.write() = Some(sample);
    }

    /// Assemble a snapshot from counters and the cached sample. Never samples.
    pub fn snapshot(&self) -> HealthSnapshot {
        let validations = self.validations.total.load(Ordering::Relaxed);
        let failed_validations = self.validations.failed.load(Ordering::Relaxed);
        let accesses = self.accesses.total.load(Ordering::Relaxed);
        let failed_accesses = self.accesses.failed.load(Ordering::Relaxed);

        let requests = RequestCounts {
            total: self.requests.total.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.requests.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            executor_errors: self.executor_errors.load(Ordering::Relaxed),
            avg_latency_ms: self.requests.average_ms(),
        };

        let status = [
            status_for(validations, failed_validations),
            status_for(accesses, failed_accesses),
            status_for(requests.total, requests.executor_errors + requests.timed_out),
        ]
        .into_iter()
        .max()
        .unwrap_or(HealthStatus::Healthy);

        HealthSnapshot {
            status,
            tokens_minted: self.tokens_minted.load(Ordering::Relaxed),
            validations,
            failed_validations,
            avg_validation_ms: self.validations.average_ms(),
            accesses,
            failed_accesses,
            avg_access_ms: self.accesses.average_ms(),
            requests,
            resources: self.resources.read().clone(),
            taken_at: Utc::now(),
        }
    }

    /// Serialize the current snapshot as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or(serde_json::Value::Null)
    }
}

impl MetricsSink for Telemetry {
    fn token_minted(&self) {
        self.tokens_minted.fetch_add(1, Ordering::Relaxed);
    }

    fn validation(&self, ok: bool, latency: Duration) {
        self.validations.record(ok, latency);
    }

    fn access(&self, ok: bool, latency: Duration) {
        self.accesses.record(ok, latency);
    }

    fn request(&self, outcome: RequestOutcome, latency: Duration) {
        // `failed` on the request counter means "ran and failed".
        self.requests
            .record(outcome != RequestOutcome::Failed, latency);
        let counter = match outcome {
            RequestOutcome::Succeeded => &self.succeeded,
            RequestOutcome::Failed => return,
            RequestOutcome::Rejected => &self.rejected,
            RequestOutcome::TimedOut => &self.timed_out,
            RequestOutcome::ExecutorError => &self.executor_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
