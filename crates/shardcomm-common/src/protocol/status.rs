use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of one dispatcher operation.
///
/// Transitions follow a single path per ticket:
///
/// ```text
/// Submitted -> Sending -> Sent -> Received
///                  |        |
///                  |        +--> Timeout
///                  +--> Received | Timeout | Error | BackendUnavailable
/// ```
///
/// `Sending -> Sent` only happens for requests that expect an out-of-band
/// answer; single requests go straight to a terminal state when the
/// exchange completes. `Dropped` is entered when the caller abandons the
/// operation. Once a terminal status is reached the record never changes
/// status again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Accepted by the dispatcher, not yet picked up by the transport.
    Submitted,
    /// The transport began transmitting the request.
    Sending,
    /// Fully sent; an out-of-band answer is still outstanding.
    Sent,
    /// The answer (or the response, for single requests) arrived.
    Received,
    /// The deadline passed before completion.
    Timeout,
    /// The exchange completed with an HTTP-level failure.
    Error,
    /// The caller dropped the operation.
    Dropped,
    /// The peer could not be resolved or connected to.
    BackendUnavailable,
}

impl Status {
    /// True once no further transitions can occur for the ticket.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Received
                | Status::Timeout
                | Status::Error
                | Status::Dropped
                | Status::BackendUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Submitted => "submitted",
            Status::Sending => "sending",
            Status::Sent => "sent",
            Status::Received => "received",
            Status::Timeout => "timeout",
            Status::Error => "error",
            Status::Dropped => "dropped",
            Status::BackendUnavailable => "backend unavailable",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Submitted
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
