use crate::executor::{Executor, ExecutorCommand, ExecutorOutput};
#[cfg(any(test, feature = "fault-injection"))]
use crate::fault::{FaultPolicy, NoFaults};
use crate::state::RequestState;
use keeper_core::{
    CallerIdentity, CommandFailure, ExecutionError, ExecutionRequest, ExecutionResult,
    MetricsSink, NoopSink, RequestOutcome, ResourceId, SecretBytes, PROTOCOL_VERSION,
};
use keeper_security::{AuditLog, AuditOutcome, CapabilityStore, CredentialStore, Sanitizer};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Broker-level tallies. `received - rejected` requests reached the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Every call to `submit`.
    pub received: u64,
    /// Refused before any command ran.
    pub rejected: u64,
    /// Handed to the executor.
    pub executed: u64,
    /// Ran and exited zero.
    pub succeeded: u64,
    /// Ran and exited non-zero or was killed.
    pub failed: u64,
    /// Exceeded their own timeout.
    pub timed_out: u64,
    /// The executor could not be reached or could not run the command.
    pub executor_errors: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    executor_errors: AtomicU64,
}

/// Output of a passed validation: what the executor needs beyond the request.
struct Validated {
    resources: BTreeMap<String, ResourceId>,
    secrets: Vec<(String, SecretBytes)>,
}

struct BrokerInner {
    tokens: Arc<CapabilityStore>,
    credentials: Arc<CredentialStore>,
    executor: Arc<dyn Executor>,
    sanitizer: Sanitizer,
    metrics: Arc<dyn MetricsSink>,
    audit: Option<AuditLog>,
    #[cfg(any(test, feature = "fault-injection"))]
    faults: Arc<dyn FaultPolicy>,
    counters: Counters,
    requests: Mutex<HashMap<Uuid, RequestState>>,
}

/// Assembles a [`Broker`].
pub struct BrokerBuilder {
    tokens: Arc<CapabilityStore>,
    credentials: Arc<CredentialStore>,
    executor: Arc<dyn Executor>,
    sanitizer: Sanitizer,
    metrics: Arc<dyn MetricsSink>,
    audit: Option<AuditLog>,
    #[cfg(any(test, feature = "fault-injection"))]
    faults: Arc<dyn FaultPolicy>,
}

impl BrokerBuilder {
    pub fn new(
        tokens: Arc<CapabilityStore>,
        credentials: Arc<CredentialStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            tokens,
            credentials,
            executor,
            sanitizer: Sanitizer::default(),
            metrics: Arc::new(NoopSink),
            audit: None,
            #[cfg(any(test, feature = "fault-injection"))]
            faults: Arc::new(NoFaults),
        }
    }

    pub fn sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Simulate executor failures. Absent from builds without `fault-injection`.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn fault_policy(mut self, policy: Arc<dyn FaultPolicy>) -> Self {
        self.faults = policy;
        self
    }

    pub fn build(self) -> Broker {
        Broker {
            inner: Arc::new(BrokerInner {
                tokens: self.tokens,
                credentials: self.credentials,
                executor: self.executor,
                sanitizer: self.sanitizer,
                metrics: self.metrics,
                audit: self.audit,
                #[cfg(any(test, feature = "fault-injection"))]
                faults: self.faults,
                counters: Counters::default(),
                requests: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Validates execution requests and forwards them to the privileged executor.
///
/// Cheap to clone; every clone shares state. Requests are independent: each
/// runs under its own timeout and none waits on another.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn builder(
        tokens: Arc<CapabilityStore>,
        credentials: Arc<CredentialStore>,
        executor: Arc<dyn Executor>,
    ) -> BrokerBuilder {
        BrokerBuilder::new(tokens, credentials, executor)
    }

    /// Protocol version this broker speaks.
    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Open a channel for `peer`, the identity the transport authenticated.
    pub fn accept(&self, peer: CallerIdentity) -> BrokerChannel {
        info!(peer = %peer, "Broker channel opened");
        BrokerChannel {
            inner: self.inner.clone(),
            peer,
        }
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            received: c.received.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            executor_errors: c.executor_errors.load(Ordering::Relaxed),
        }
    }

    /// State of a request that has not completed yet.
    pub fn request_state(&self, request_id: Uuid) -> Option<RequestState> {
        self.inner.requests.lock().get(&request_id).copied()
    }

    /// Requests between receipt and completion.
    pub fn in_flight(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

/// One caller's connection to the broker, bound to the caller's identity.
pub struct BrokerChannel {
    inner: Arc<BrokerInner>,
    peer: CallerIdentity,
}

impl BrokerChannel {
    pub fn peer(&self) -> &CallerIdentity {
        &self.peer
    }

    /// Validate and run one request.
    ///
    /// `Err` means the exchange itself failed (rejected, timed out, executor
    /// unreachable). A command that ran and failed is `Ok` with a failed result.
    pub async fn submit(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, ExecutionError> {
        let started = Instant::now();
        let inner = &self.inner;
        inner.counters.received.fetch_add(1, Ordering::Relaxed);

        // Nothing else in the request is looked at until the version matches.
        if let Err(e) = check_version(&request) {
            return Err(inner.reject(&request, &self.peer, e, started));
        }

        let tracker = match RequestTracker::enter(inner, request.request_id) {
            Ok(t) => t,
            Err(e) => return Err(inner.reject(&request, &self.peer, e, started)),
        };
        tracker.advance(RequestState::Validating);

        let validated = match inner.validate(&self.peer, &request) {
            Ok(v) => v,
            Err(e) => {
                tracker.advance(RequestState::Rejected);
                let e = inner.reject(&request, &self.peer, e, started);
                tracker.advance(RequestState::Completed);
                return Err(e);
            }
        };

        tracker.advance(RequestState::Executing);
        inner.counters.executed.fetch_add(1, Ordering::Relaxed);
        let result = inner.execute(&request, validated, started).await;

        let (outcome, audit_outcome, counter) = match &result {
            Ok(r) if r.is_success() => (
                RequestOutcome::Succeeded,
                AuditOutcome::Success,
                &inner.counters.succeeded,
            ),
            Ok(_) => (
                RequestOutcome::Failed,
                AuditOutcome::Failed,
                &inner.counters.failed,
            ),
            Err(ExecutionError::Timeout { .. }) => (
                RequestOutcome::TimedOut,
                AuditOutcome::TimedOut,
                &inner.counters.timed_out,
            ),
            Err(_) => (
                RequestOutcome::ExecutorError,
                AuditOutcome::Error,
                &inner.counters.executor_errors,
            ),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        inner.metrics.request(outcome, started.elapsed());
        inner.audit(
            &request,
            &self.peer,
            "execute",
            audit_outcome,
            result.as_ref().err(),
        );
        tracker.advance(RequestState::Completed);

        info!(
            request_id = %request.request_id,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request completed"
        );
        result
    }
}

impl BrokerInner {
    /// Count, log, audit, and report a refused request. Returns `error` back.
    fn reject(
        &self,
        req: &ExecutionRequest,
        peer: &CallerIdentity,
        error: ExecutionError,
        started: Instant,
    ) -> ExecutionError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        warn!(
            request_id = %req.request_id,
            caller = %peer,
            error = %error,
            "Request rejected"
        );
        self.audit(req, peer, "reject", AuditOutcome::Denied, Some(&error));
        self.metrics.request(RequestOutcome::Rejected, started.elapsed());
        error
    }

    /// Checks in order: identity, shape, tokens, credentials. The protocol
    /// version has already been checked by `submit`. Token use is recorded
    /// last, and a failure to record it rejects the request.
    fn validate(
        &self,
        peer: &CallerIdentity,
        req: &ExecutionRequest,
    ) -> Result<Validated, ExecutionError> {
        if &req.caller != peer {
            return Err(ExecutionError::IdentityMismatch {
                channel: peer.to_string(),
                asserted: req.caller.to_string(),
            });
        }

        self.sanitizer
            .check_request(req)
            .map_err(ExecutionError::Malformed)?;

        let mut resources = BTreeMap::new();
        for (name, id) in &req.tokens {
            let resource = self
                .tokens
                .resolve(*id)
                .map_err(|e| ExecutionError::InvalidToken {
                    name: name.clone(),
                    stale: e.requires_remint(),
                    reason: e.to_string(),
                })?;
            resources.insert(name.clone(), resource);
        }

        let mut secrets = Vec::with_capacity(req.credentials.len());
        for cred in &req.credentials {
            if let Some(group) = &cred.access_group {
                if !self.credentials.validate_sharing(group) {
                    return Err(ExecutionError::CredentialUnavailable {
                        owner: cred.owner_id.clone(),
                        reason: format!("sharing domain {group} is not configured"),
                    });
                }
            }
            let secret = self
                .credentials
                .retrieve(&cred.owner_id, cred.access_group.as_deref())
                .map_err(|e| ExecutionError::CredentialUnavailable {
                    owner: cred.owner_id.clone(),
                    reason: e.to_string(),
                })?;
            secrets.push((cred.env_var.clone(), secret));
        }

        // Only count token use once the whole request is known to be valid.
        for (name, id) in &req.tokens {
            self.tokens
                .record_access(*id)
                .map_err(|e| ExecutionError::InvalidToken {
                    name: name.clone(),
                    stale: e.requires_remint(),
                    reason: e.to_string(),
                })?;
        }

        Ok(Validated { resources, secrets })
    }

    async fn execute(
        &self,
        req: &ExecutionRequest,
        validated: Validated,
        started: Instant,
    ) -> Result<ExecutionResult, ExecutionError> {
        let command = ExecutorCommand {
            request_id: req.request_id,
            program: req.command.clone(),
            args: req.args.clone(),
            env: req.env.clone(),
            working_dir: req.working_dir.clone(),
            secret_env: validated.secrets,
            resources: validated.resources,
        };

        #[cfg(any(test, feature = "fault-injection"))]
        let fault = self.faults.decide(req);

        let run = async move {
            #[cfg(any(test, feature = "fault-injection"))]
            if let Some(fault) = fault {
                warn!(request_id = %command.request_id, fault = ?fault, "Injecting fault");
                if let Some(short_circuit) = fault.apply().await {
                    return short_circuit;
                }
            }
            self.executor.execute(command).await
        };

        // Dropping `run` on timeout is what cancels the executor's work.
        match tokio::time::timeout(req.timeout, run).await {
            Err(_) => {
                let timeout_ms = u64::try_from(req.timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(request_id = %req.request_id, timeout_ms, "Request timed out");
                Err(ExecutionError::Timeout { timeout_ms })
            }
            Ok(Err(e)) => {
                error!(request_id = %req.request_id, error = %e, "Executor failed");
                Err(e)
            }
            Ok(Ok(output)) => Ok(into_result(req.request_id, output).with_duration(started.elapsed())),
        }
    }

    fn audit(
        &self,
        req: &ExecutionRequest,
        peer: &CallerIdentity,
        action: &str,
        outcome: AuditOutcome,
        error: Option<&ExecutionError>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        audit.log_action(
            req.request_id,
            self.sanitizer.for_log(peer.as_str()),
            action,
            Some(self.sanitizer.for_log(&req.command)),
            serde_json::json!({
                "tokens": req.tokens.keys().collect::<Vec<_>>(),
                "credentials": req.credentials.iter().map(|c| &c.owner_id).collect::<Vec<_>>(),
                "error": error.map(ToString::to_string),
            }),
            outcome,
        );
    }
}

fn check_version(req: &ExecutionRequest) -> Result<(), ExecutionError> {
    if req.protocol_version == PROTOCOL_VERSION {
        return Ok(());
    }
    Err(ExecutionError::VersionMismatch {
        expected: PROTOCOL_VERSION,
        received: req.protocol_version,
    })
}

fn into_result(request_id: Uuid, output: ExecutorOutput) -> ExecutionResult {
    if output.succeeded() {
        return ExecutionResult::success(request_id, output.exit_code, output.stdout);
    }
    let message = match output.exit_code {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    };
    ExecutionResult::failure(
        request_id,
        output.exit_code,
        CommandFailure {
            message,
            stderr: output.stderr,
        },
    )
}

/// Tracks one request's state in the broker and forgets it when dropped,
/// so a caller abandoning `submit` mid-flight leaves nothing behind.
struct RequestTracker<'a> {
    inner: &'a BrokerInner,
    id: Uuid,
}

impl<'a> RequestTracker<'a> {
    fn enter(inner: &'a BrokerInner, id: Uuid) -> Result<Self, ExecutionError> {
        let mut requests = inner.requests.lock();
        if requests.contains_key(&id) {
            return Err(ExecutionError::Malformed(format!(
                "request {id} is already in flight"
            )));
        }
        requests.insert(id, RequestState::Received);
        Ok(Self { inner, id })
    }

    fn advance(&self, next: RequestState) {
        let mut requests = self.inner.requests.lock();
        if let Some(state) = requests.get_mut(&self.id) {
            match state.advance(next) {
                Ok(s) => *state = s,
                Err(e) => error!(request_id = %self.id, error = %e, "Request state machine violated"),
            }
        }
    }
}

impl Drop for RequestTracker<'_> {
    fn drop(&mut self) {
        self.inner.requests.lock().remove(&self.id);
    }
}
