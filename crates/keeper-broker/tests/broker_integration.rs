#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use keeper_broker::{Broker, Executor, ExecutorCommand, ExecutorOutput, ProcessExecutor};
use keeper_core::{
    CallerIdentity, CredentialRef, ExecutionError, ExecutionRequest, MetricsSink, ResourceId,
    SecretBytes, PROTOCOL_VERSION,
};
use keeper_security::{
    AuthorizedResource, Authorizer, CapabilityStore, CredentialStore, Resolution, ResourceKind,
    ResourceMetadata,
};
use keeper_session::{AccessGrant, AccessSessionManager};
use keeper_telemetry::Telemetry;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blob is the path itself; paths in `moved` report as relocated.
#[derive(Default)]
struct PathAuthorizer {
    moved: Mutex<HashSet<String>>,
}

impl PathAuthorizer {
    fn relocate(&self, path: &str) {
        self.moved.lock().unwrap().insert(path.to_string());
    }
}

impl Authorizer for PathAuthorizer {
    fn authorize(&self, resource: &ResourceId) -> Result<AuthorizedResource, String> {
        Ok(AuthorizedResource {
            bytes: resource.as_str().as_bytes().to_vec(),
            metadata: ResourceMetadata {
                size: 4096,
                kind: ResourceKind::Directory,
                permissions: 0o755,
            },
        })
    }

    fn resolve(&self, bytes: &[u8]) -> Result<Resolution, String> {
        let path = String::from_utf8(bytes.to_vec()).map_err(|e| e.to_string())?;
        let moved = self.moved.lock().unwrap().contains(&path);
        Ok(Resolution {
            resource: ResourceId::new(path),
            moved,
        })
    }
}

#[derive(Default)]
struct CountingGrant {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl AccessGrant for CountingGrant {
    fn start_access(&self, _resource: &ResourceId) -> Result<(), String> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_access(&self, _resource: &ResourceId) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sleeps for `delay`, then reports success with the resolved resources.
struct SlowExecutor {
    delay: Duration,
    runs: AtomicUsize,
}

impl SlowExecutor {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            runs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Executor for SlowExecutor {
    async fn execute(&self, command: ExecutorCommand) -> Result<ExecutorOutput, ExecutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let resources: Vec<_> = command.resources.values().map(ResourceId::as_str).collect();
        Ok(ExecutorOutput {
            exit_code: Some(0),
            stdout: resources.join(","),
            stderr: String::new(),
        })
    }
}

struct Fixture {
    authorizer: Arc<PathAuthorizer>,
    tokens: Arc<CapabilityStore>,
    credentials: Arc<CredentialStore>,
    telemetry: Arc<Telemetry>,
    executor: Arc<SlowExecutor>,
    broker: Broker,
}

fn fixture(delay: Duration) -> Fixture {
    let authorizer = Arc::new(PathAuthorizer::default());
    let telemetry = Arc::new(Telemetry::new());
    let sink: Arc<dyn MetricsSink> = telemetry.clone();
    let tokens = Arc::new(CapabilityStore::in_memory(authorizer.clone()).with_metrics(sink.clone()));
    let credentials = Arc::new(CredentialStore::new());
    let executor = Arc::new(SlowExecutor::new(delay));
    let broker = Broker::builder(tokens.clone(), credentials.clone(), executor.clone())
        .metrics(sink)
        .build();
    Fixture {
        authorizer,
        tokens,
        credentials,
        telemetry,
        executor,
        broker,
    }
}

fn caller() -> CallerIdentity {
    CallerIdentity::new("app.ui")
}

#[tokio::test(start_paused = true)]
async fn timeout_ends_session_cleanly() {
    let fx = fixture(Duration::from_secs(5));
    let grant = Arc::new(CountingGrant::default());
    let sessions = AccessSessionManager::new(grant.clone());

    let resource = ResourceId::new("/tmp/x");
    let token = fx.tokens.mint(&resource).unwrap();
    let handle = sessions.begin(&resource).unwrap();

    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(
            ExecutionRequest::new(caller(), "restic")
                .arg("backup")
                .token("source", token.id)
                .timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();

    assert_eq!(err, ExecutionError::Timeout { timeout_ms: 2000 });
    assert!(err.is_retryable());

    sessions.end(&handle).unwrap();
    assert_eq!(sessions.ref_count(&resource), 0);
    assert_eq!(grant.starts.load(Ordering::SeqCst), 1);
    assert_eq!(grant.stops.load(Ordering::SeqCst), 1);
    assert_eq!(fx.telemetry.snapshot().requests.timed_out, 1);
    assert_eq!(fx.broker.in_flight(), 0);
}

#[tokio::test]
async fn version_mismatch_rejected_before_tokens() {
    let fx = fixture(Duration::ZERO);
    let token = fx.tokens.mint(&"/srv/data".into()).unwrap();
    let before = fx.telemetry.snapshot().validations;

    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(
            ExecutionRequest::new(caller(), "restic")
                .token("source", token.id)
                .protocol_version(PROTOCOL_VERSION + 1),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutionError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            received: PROTOCOL_VERSION + 1,
        }
    );
    assert!(err.is_rejection());
    assert_eq!(fx.telemetry.snapshot().validations, before);
    assert_eq!(fx.executor.runs.load(Ordering::SeqCst), 0);
    assert_eq!(fx.broker.stats().executed, 0);
    assert_eq!(fx.broker.stats().rejected, 1);
}

#[tokio::test]
async fn identity_must_match_channel() {
    let fx = fixture(Duration::ZERO);
    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(ExecutionRequest::new(CallerIdentity::new("app.other"), "restic"))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::IdentityMismatch { .. }));
    assert_eq!(fx.executor.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_token_rejected_then_reminted() {
    let fx = fixture(Duration::ZERO);
    let token = fx.tokens.mint(&"/srv/photos".into()).unwrap();
    fx.authorizer.relocate("/srv/photos");

    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(ExecutionRequest::new(caller(), "restic").token("source", token.id))
        .await
        .unwrap_err();
    match err {
        ExecutionError::InvalidToken { name, stale, .. } => {
            assert_eq!(name, "source");
            assert!(stale);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fx.executor.runs.load(Ordering::SeqCst), 0);

    // The resource is back where it was; the old token stays stale until re-minted.
    fx.authorizer.moved.lock().unwrap().clear();
    let fresh = fx.tokens.remint(token.id).unwrap();
    let result = channel
        .submit(ExecutionRequest::new(caller(), "restic").token("source", fresh.id))
        .await
        .unwrap();
    assert_eq!(result.output(), Some("/srv/photos"));
    assert_eq!(fx.tokens.get(fresh.id).unwrap().access_count, 1);
}

#[tokio::test]
async fn unknown_token_is_not_stale() {
    let fx = fixture(Duration::ZERO);
    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(ExecutionRequest::new(caller(), "restic").token("source", uuid::Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::InvalidToken { stale: false, .. }));
}

#[tokio::test]
async fn credential_group_mismatch_is_unavailable() {
    let fx = fixture(Duration::ZERO);
    fx.credentials
        .store("repo-1", SecretBytes::from("hunter2"), Some("group.backup"))
        .unwrap();
    fx.credentials.configure_sharing("group.other");

    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(
            ExecutionRequest::new(caller(), "restic")
                .credential(CredentialRef::new("repo-1", "RESTIC_PASSWORD").in_group("group.other")),
        )
        .await
        .unwrap_err();
    match &err {
        ExecutionError::CredentialUnavailable { owner, .. } => assert_eq!(owner, "repo-1"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.to_string().contains("hunter2"));

    let err = channel
        .submit(
            ExecutionRequest::new(caller(), "restic")
                .credential(CredentialRef::new("missing", "RESTIC_PASSWORD")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::CredentialUnavailable { .. }));
    assert_eq!(fx.executor.runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_request_does_not_count_token_use() {
    let fx = fixture(Duration::ZERO);
    let token = fx.tokens.mint(&"/srv/data".into()).unwrap();
    let channel = fx.broker.accept(caller());
    let err = channel
        .submit(
            ExecutionRequest::new(caller(), "restic")
                .token("source", token.id)
                .credential(CredentialRef::new("missing", "RESTIC_PASSWORD")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutionError::CredentialUnavailable { .. }));
    assert_eq!(fx.tokens.get(token.id).unwrap().access_count, 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_have_independent_timeouts() {
    let fx = fixture(Duration::from_secs(3));
    let channel = Arc::new(fx.broker.accept(caller()));

    let short = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .submit(ExecutionRequest::new(caller(), "restic").timeout(Duration::from_secs(1)))
                .await
        })
    };
    let long = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .submit(ExecutionRequest::new(caller(), "restic").timeout(Duration::from_secs(10)))
                .await
        })
    };

    assert!(matches!(
        short.await.unwrap(),
        Err(ExecutionError::Timeout { timeout_ms: 1000 })
    ));
    assert!(long.await.unwrap().unwrap().is_success());

    let stats = fx.broker.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.succeeded, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_exit_is_a_failed_result() {
    let tokens = Arc::new(CapabilityStore::in_memory(Arc::new(PathAuthorizer::default())));
    let credentials = Arc::new(CredentialStore::new());
    credentials
        .store("repo-1", SecretBytes::from("hunter2"), None)
        .unwrap();
    let broker = Broker::builder(tokens, credentials, Arc::new(ProcessExecutor::default())).build();
    let channel = broker.accept(caller());

    let result = channel
        .submit(
            ExecutionRequest::new(caller(), "sh")
                .args(["-c", "test \"$RESTIC_PASSWORD\" = hunter2 && echo wrong repo >&2; exit 4"])
                .credential(CredentialRef::new("repo-1", "RESTIC_PASSWORD")),
        )
        .await
        .unwrap();

    assert!(!result.is_success());
    assert_eq!(result.exit_code, Some(4));
    let failure = result.error().unwrap();
    assert!(failure.stderr.contains("wrong repo"));
    assert!(result.output().is_none());
    assert_eq!(broker.stats().failed, 1);
}
