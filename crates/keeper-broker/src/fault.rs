//! Failure injection for exercising callers against an unreliable executor.
//!
//! Only compiled for tests or with the `fault-injection` feature. A broker
//! built without it has no way to install a policy.

use crate::executor::ExecutorOutput;
use keeper_core::{ExecutionError, ExecutionRequest};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// What to simulate for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The executor channel drops before a result arrives.
    ConnectionLost,
    /// The executor never answers; the request's own timeout fires.
    Timeout,
    /// The command runs and exits non-zero without touching the executor.
    CommandFailure { exit_code: i32, message: String },
    /// The real executor runs after an added delay.
    Delay(Duration),
}

impl Fault {
    /// Play the fault out. `None` means continue to the real executor.
    pub(crate) async fn apply(self) -> Option<Result<ExecutorOutput, ExecutionError>> {
        match self {
            Fault::ConnectionLost => Some(Err(ExecutionError::ConnectionLost(
                "simulated connection loss".to_string(),
            ))),
            Fault::Timeout => {
                std::future::pending::<()>().await;
                None
            }
            Fault::CommandFailure { exit_code, message } => Some(Ok(ExecutorOutput {
                exit_code: Some(exit_code),
                stdout: String::new(),
                stderr: message,
            })),
            Fault::Delay(delay) => {
                tokio::time::sleep(delay).await;
                None
            }
        }
    }
}

/// Decides, per request, whether to inject a fault.
pub trait FaultPolicy: Send + Sync {
    fn decide(&self, request: &ExecutionRequest) -> Option<Fault>;
}

/// Never injects anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    fn decide(&self, _request: &ExecutionRequest) -> Option<Fault> {
        None
    }
}

/// Injects the same fault into every request.
#[derive(Debug, Clone)]
pub struct FixedFault(pub Fault);

impl FaultPolicy for FixedFault {
    fn decide(&self, _request: &ExecutionRequest) -> Option<Fault> {
        Some(self.0.clone())
    }
}

/// Injects `fault` into a `rate` fraction of requests.
pub struct RandomFaults {
    rate: f64,
    fault: Fault,
    rng: Mutex<StdRng>,
}

impl RandomFaults {
    /// `rate` is clamped to `0.0..=1.0`. A fixed seed makes runs reproducible.
    pub fn new(rate: f64, fault: Fault, seed: u64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
            fault,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl FaultPolicy for RandomFaults {
    fn decide(&self, _request: &ExecutionRequest) -> Option<Fault> {
        self.rng
            .lock()
            .gen_bool(self.rate)
            .then(|| self.fault.clone())
    }
}
