use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Lifecycle of one broker request.
///
/// `Received → Validating → {Executing | Rejected} → Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    /// Accepted off the channel, nothing checked yet.
    Received,
    /// Identity, shape, tokens, and credentials under check.
    Validating,
    /// Handed to the executor.
    Executing,
    /// Refused during validation.
    Rejected,
    /// Result or error returned to the caller.
    Completed,
}

impl RequestState {
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validating)
                | (Validating, Executing)
                | (Validating, Rejected)
                | (Executing, Completed)
                | (Rejected, Completed)
        )
    }

    /// Move to `next`, or report the illegal transition.
    pub fn advance(self, next: RequestState) -> Result<RequestState, IllegalTransition> {
        if self.can_advance_to(next) {
            Ok(next)
        } else {
            Err(IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(self) -> bool {
        self == RequestState::Completed
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Received => write!(f, "received"),
            RequestState::Validating => write!(f, "validating"),
            RequestState::Executing => write!(f, "executing"),
            RequestState::Rejected => write!(f, "rejected"),
            RequestState::Completed => write!(f, "completed"),
        }
    }
}

/// An attempted move the request lifecycle does not allow.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal request transition {from} -> {to}")]
pub struct IllegalTransition {
    /// State the request was in.
    pub from: RequestState,
    /// State it was asked to move to.
    pub to: RequestState,
}
