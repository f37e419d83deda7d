//! Telemetry for Keeper.
//!
//! [`Telemetry`] counts what the other components report through
//! [`keeper_core::MetricsSink`]; [`ResourceSampler`] keeps a cached resource
//! sample fresh in the background. [`Telemetry::snapshot`] combines both
//! without blocking the hot path.

pub mod collector;
pub mod sampler;

pub use collector::{HealthSnapshot, HealthStatus, RequestCounts, Telemetry};
pub use sampler::{ResourceSample, ResourceSampler};
