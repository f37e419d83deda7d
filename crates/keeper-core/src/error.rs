use crate::{ResourceId, TokenId};
use thiserror::Error;

/// Convenience alias using the umbrella [`KeeperError`].
pub type KeeperResult<T> = Result<T, KeeperError>;

/// Failures of the capability token store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    /// The host could not produce an authorization blob for the resource.
    #[error("Failed to mint capability for {resource}: {reason}")]
    MintFailed {
        /// Resource the caller asked to authorize.
        resource: ResourceId,
        /// Authorizer-provided reason.
        reason: String,
    },

    /// The token is unknown or its blob cannot be interpreted.
    #[error("Capability token {token} is invalid: {reason}")]
    Invalid {
        /// Token that failed to resolve.
        token: TokenId,
        /// Why resolution failed.
        reason: String,
    },

    /// The token resolved, but the resource changed since mint. Re-mint instead of retrying.
    #[error("Capability token {token} is stale: {resource} changed since it was minted")]
    StaleResource {
        /// Stale token.
        token: TokenId,
        /// Resource identity recorded at mint time.
        resource: ResourceId,
    },

    /// The backing store could not be read or written.
    #[error("Capability store unavailable: {0}")]
    StoreUnavailable(String),
}

impl CapabilityError {
    /// Staleness has a prescribed recovery: mint a fresh token.
    pub fn requires_remint(&self) -> bool {
        matches!(self, CapabilityError::StaleResource { .. })
    }
}

/// Failures of the access session manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccessError {
    /// The platform refused to start access on the 0 to 1 transition.
    #[error("Access to {resource} was denied: {reason}")]
    GrantDenied {
        /// Resource whose grant failed.
        resource: ResourceId,
        /// Platform-provided reason.
        reason: String,
    },

    /// `end` was called for a handle with no matching live `begin`.
    #[error("Unbalanced end of access for {resource}")]
    Imbalanced {
        /// Resource the handle referred to.
        resource: ResourceId,
    },
}

/// Failures of the secure credential store.
///
/// Variants carry identifiers only. Secret payloads never reach an error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// A credential already exists for the owner; use `update` to replace it.
    #[error("Credential for {owner} already exists")]
    Duplicate {
        /// Owner identifier.
        owner: String,
    },

    /// No credential is stored for the owner.
    #[error("Credential for {owner} not found")]
    NotFound {
        /// Owner identifier.
        owner: String,
    },

    /// The presented access group does not match the stored one.
    #[error("Access group mismatch for credential {owner}")]
    AccessGroupMismatch {
        /// Owner identifier.
        owner: String,
        /// Group presented by the caller, if any.
        presented: Option<String>,
    },
}

/// Failures of the privileged execution broker.
///
/// A command that ran and failed is not an `ExecutionError`; it comes back
/// as a failed [`ExecutionResult`](crate::ExecutionResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// Caller speaks a different protocol version. Checked before anything else.
    #[error("Protocol version mismatch: broker speaks {expected}, caller sent {received}")]
    VersionMismatch {
        /// Broker's own version.
        expected: u32,
        /// Version announced by the caller.
        received: u32,
    },

    /// The asserted caller identity differs from the channel's identity.
    #[error("Caller identity mismatch: channel is {channel}, request asserted {asserted}")]
    IdentityMismatch {
        /// Identity bound to the channel.
        channel: String,
        /// Identity asserted in the request.
        asserted: String,
    },

    /// A referenced capability token did not resolve.
    #[error("Capability token '{name}' rejected: {reason}")]
    InvalidToken {
        /// Name the request gave the token.
        name: String,
        /// Whether the token is stale and must be re-minted.
        stale: bool,
        /// Underlying resolution failure.
        reason: String,
    },

    /// A referenced credential could not be made available to the executor.
    #[error("Credential {owner} unavailable: {reason}")]
    CredentialUnavailable {
        /// Owner identifier of the credential.
        owner: String,
        /// Why it is unavailable.
        reason: String,
    },

    /// The request exceeded its timeout while executing.
    #[error("Command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The executor could not run the command at all.
    #[error("Executor failed: {0}")]
    CommandFailed(String),

    /// The channel to the executor dropped.
    #[error("Connection to executor lost: {0}")]
    ConnectionLost(String),

    /// The request is structurally invalid.
    #[error("Malformed request: {0}")]
    Malformed(String),
}

impl ExecutionError {
    /// Timeout and connection-class failures may succeed on a later attempt.
    /// Everything else is permanent for the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout { .. } | ExecutionError::ConnectionLost(_)
        )
    }

    /// Whether the request was refused during validation, before any command ran.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ExecutionError::VersionMismatch { .. }
                | ExecutionError::IdentityMismatch { .. }
                | ExecutionError::InvalidToken { .. }
                | ExecutionError::CredentialUnavailable { .. }
                | ExecutionError::Malformed(_)
        )
    }
}

/// Top-level error type for Keeper.
///
/// Each component family converts into it with `?`.
#[derive(Error, Debug)]
pub enum KeeperError {
    /// Capability token store failure.
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    /// Access session failure.
    #[error("Access error: {0}")]
    Access(#[from] AccessError),

    /// Credential store failure.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Broker failure.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// Configuration parsing or validation failure.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ExecutionError::Timeout { timeout_ms: 10 }.is_retryable());
        assert!(ExecutionError::ConnectionLost("reset".into()).is_retryable());
        assert!(!ExecutionError::Malformed("empty".into()).is_retryable());
        assert!(!ExecutionError::VersionMismatch {
            expected: 1,
            received: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_stale_requires_remint() {
        let stale = CapabilityError::StaleResource {
            token: uuid::Uuid::new_v4(),
            resource: ResourceId::new("/tmp/x"),
        };
        assert!(stale.requires_remint());
        assert!(!CapabilityError::StoreUnavailable("disk".into()).requires_remint());
    }

    #[test]
    fn test_umbrella_conversion() {
        fn fails() -> KeeperResult<()> {
            Err(CredentialError::NotFound {
                owner: "repo-1".into(),
            })?;
            Ok(())
        }
        let err = fails().unwrap_err();
        assert!(matches!(err, KeeperError::Credential(_)));
        assert!(err.to_string().contains("repo-1"));
    }
}
