//! Access sessions for Keeper.
//!
//! Callers bracket every use of a resource with `begin`/`end`. The manager
//! reference-counts those pairs per resource so the platform grant is
//! started on the first `begin` and stopped on the last `end`, no matter how
//! many callers overlap.

/// The reference-counting session arena.
pub mod manager;
/// Handles, records, and the platform grant seam.
pub mod session;

pub use manager::{AccessGuard, AccessSessionManager};
pub use session::{AccessGrant, SessionHandle};
