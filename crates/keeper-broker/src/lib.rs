//! Privileged execution broker for Keeper.
//!
//! An unprivileged caller opens a [`BrokerChannel`] and submits
//! [`ExecutionRequest`](keeper_core::ExecutionRequest)s naming the capability
//! tokens and credentials a command needs. The broker checks the protocol
//! version and caller identity, resolves every token, releases the
//! credentials, and hands the command to an [`Executor`] under the request's
//! own timeout.
//!
//! # Main types
//!
//! - [`Broker`] — Shared validation and dispatch state.
//! - [`BrokerChannel`] — One caller's identity-bound connection.
//! - [`Executor`] — The privileged side; [`ProcessExecutor`] runs local processes.
//! - [`RequestState`] — Per-request lifecycle.

/// Broker, builder, and channels.
pub mod broker;
/// Executors.
pub mod executor;
/// Simulated executor failures.
#[cfg(any(test, feature = "fault-injection"))]
pub mod fault;
/// Request lifecycle.
pub mod state;

pub use broker::{Broker, BrokerBuilder, BrokerChannel, BrokerStats};
pub use executor::{Executor, ExecutorCommand, ExecutorOutput, ProcessExecutor};
#[cfg(any(test, feature = "fault-injection"))]
pub use fault::{Fault, FaultPolicy, FixedFault, NoFaults, RandomFaults};
pub use state::{IllegalTransition, RequestState};
