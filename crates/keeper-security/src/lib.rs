//! Security primitives for Keeper.
//!
//! Durable capability tokens for filesystem resources, custody of repository
//! passwords, request sanitization, and the broker's audit trail.
//!
//! # Main types
//!
//! - [`CapabilityStore`] — Mints, persists, and resolves capability tokens.
//! - [`Authorizer`] — Host authorization primitive injected by the embedding app.
//! - [`TokenPersistence`] — Durable backing for the token store.
//! - [`CredentialStore`] — Secrets keyed by owner with access-group scoping.
//! - [`Sanitizer`] — Execution request shape checks.
//! - [`AuditLog`] — Append-only JSON-lines audit trail.

/// Audit logging module.
pub mod audit;
/// Capability tokens and the token store.
pub mod capability;
/// Secure credential custody.
pub mod credential;
/// Durable token backends.
pub mod persistence;
/// Request sanitization.
pub mod sanitizer;

pub use audit::{AuditLog, AuditOutcome};
pub use capability::{
    AuthorizedResource, Authorizer, CapabilityStore, CapabilityToken, Resolution,
    ResourceKind, ResourceMetadata,
};
pub use credential::{CredentialInfo, CredentialStore};
pub use persistence::{FileTokenPersistence, MemoryTokenPersistence, TokenPersistence};
pub use sanitizer::Sanitizer;
