use std::time::Duration;

/// How a broker request ended, as seen by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The command ran and succeeded.
    Succeeded,
    /// The command ran and reported failure.
    Failed,
    /// Validation refused the request.
    Rejected,
    /// The request's timeout elapsed.
    TimedOut,
    /// The executor could not be reached or could not run the command.
    ExecutorError,
}

/// Observer of component events.
///
/// Components hold an `Arc<dyn MetricsSink>` and report what happened; the
/// sink never influences control flow. Every method defaults to a no-op.
pub trait MetricsSink: Send + Sync {
    /// A capability token was minted.
    fn token_minted(&self) {}

    /// A capability token was resolved, successfully or not.
    fn validation(&self, _ok: bool, _latency: Duration) {}

    /// An access session `begin` completed, successfully or not.
    fn access(&self, _ok: bool, _latency: Duration) {}

    /// A broker request finished.
    fn request(&self, _outcome: RequestOutcome, _latency: Duration) {}
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricsSink for NoopSink {}
