//! Core types and error definitions for Keeper.
//!
//! This crate holds the vocabulary shared by every Keeper component: resource
//! and caller identifiers, the secret container, the transient execution
//! request/result exchanged with the broker, and the error families.
//!
//! # Main types
//!
//! - [`ResourceId`] — Stable logical identity of a filesystem resource.
//! - [`SecretBytes`] — Zeroizing, never-printed secret payload.
//! - [`ExecutionRequest`] — A command plus the tokens and credentials it needs.
//! - [`ExecutionResult`] — Structured outcome of a completed request.
//! - [`KeeperError`] — Umbrella error over the component error families.
//! - [`MetricsSink`] — Observer seam the telemetry crate plugs into.

/// Error families for every component.
pub mod error;
/// Observation hooks for telemetry.
pub mod metrics;

pub use error::{
    AccessError, CapabilityError, CredentialError, ExecutionError, KeeperError, KeeperResult,
};
pub use metrics::{MetricsSink, NoopSink, RequestOutcome};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Interface version spoken by this build of the broker protocol.
pub const PROTOCOL_VERSION: u32 = 3;

/// Identifier of a minted capability token.
pub type TokenId = Uuid;

// --- Identifiers ---

/// Stable logical identity of a filesystem resource (its path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Wraps a path-like identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<&std::path::Path> for ResourceId {
    fn from(p: &std::path::Path) -> Self {
        Self::new(p.to_string_lossy().into_owned())
    }
}

/// Who is asking. Compared against the identity the broker channel was opened with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerIdentity(String);

impl CallerIdentity {
    /// Wraps a caller identifier (bundle id, service name, ...).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Secrets ---

/// Secret payload. Wiped on drop, redacted in `Debug`, and deliberately
/// without `Display` or `Serialize`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes(Zeroizing<Vec<u8>>);

impl SecretBytes {
    /// Takes ownership of the secret bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(bytes.into()))
    }

    /// Borrow the raw secret. Callers must not log the result.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {} bytes])", self.0.len())
    }
}

impl From<&str> for SecretBytes {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

// --- Execution request ---

/// Reference to a stored credential the command needs, and where to deliver it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Owner the credential is stored under.
    pub owner_id: String,
    /// Sharing domain the caller presents.
    #[serde(default)]
    pub access_group: Option<String>,
    /// Environment variable the executor receives the secret through.
    pub env_var: String,
}

impl CredentialRef {
    /// References `owner_id`'s credential, delivered through `env_var`.
    pub fn new(owner_id: impl Into<String>, env_var: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            access_group: None,
            env_var: env_var.into(),
        }
    }

    /// Presents a sharing domain for this credential.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.access_group = Some(group.into());
        self
    }
}

/// A command to run through the broker, with everything it needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique identifier of this request.
    pub request_id: Uuid,
    /// Interface version the caller speaks.
    pub protocol_version: u32,
    /// Asserted caller identity.
    pub caller: CallerIdentity,
    /// Command to run.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the command.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory, if any.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Capability tokens the command needs, by name.
    #[serde(default)]
    pub tokens: BTreeMap<String, TokenId>,
    /// Credentials the command needs.
    #[serde(default)]
    pub credentials: Vec<CredentialRef>,
    /// How long the command may run.
    pub timeout: Duration,
}

impl ExecutionRequest {
    /// Default per-request timeout.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a request for `command` at the current protocol version.
    pub fn new(caller: CallerIdentity, command: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            protocol_version: PROTOCOL_VERSION,
            caller,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            tokens: BTreeMap::new(),
            credentials: Vec::new(),
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets a plain environment variable for the command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Runs the command in `dir`.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// References a capability token under `name`.
    pub fn token(mut self, name: impl Into<String>, token: TokenId) -> Self {
        self.tokens.insert(name.into(), token);
        self
    }

    /// Asks for a stored credential to be delivered to the command.
    pub fn credential(mut self, credential: CredentialRef) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Replaces the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the announced protocol version.
    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }
}

// --- Execution result ---

/// Why a command that did run reported failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    /// Short description of the failure.
    pub message: String,
    /// Captured standard error, possibly truncated.
    #[serde(default)]
    pub stderr: String,
}

/// Either output or a failure, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The command succeeded.
    Success {
        /// Captured standard output, possibly truncated.
        output: String,
    },
    /// The command ran and failed.
    Failure {
        /// Failure payload.
        error: CommandFailure,
    },
}

/// The result of a request that reached the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The request this result answers.
    pub request_id: Uuid,
    /// Process exit code, when the executor reported one.
    pub exit_code: Option<i32>,
    /// Output or failure.
    pub outcome: Outcome,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Creates a successful result.
    pub fn success(request_id: Uuid, exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self {
            request_id,
            exit_code,
            outcome: Outcome::Success {
                output: output.into(),
            },
            duration_ms: 0,
        }
    }

    /// Creates a failed result.
    pub fn failure(request_id: Uuid, exit_code: Option<i32>, error: CommandFailure) -> Self {
        Self {
            request_id,
            exit_code,
            outcome: Outcome::Failure { error },
            duration_ms: 0,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The success flag.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    /// Output, when the command succeeded.
    pub fn output(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Success { output } => Some(output),
            Outcome::Failure { .. } => None,
        }
    }

    /// Failure payload, when the command failed.
    pub fn error(&self) -> Option<&CommandFailure> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { error } => Some(error),
        }
    }
}
