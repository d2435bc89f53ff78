//! Shardcomm Protocol Definitions
//!
//! This module defines the core protocol types for the cluster dispatcher:
//! destinations, tickets, the status lifecycle, the request record that
//! tracks one operation from submission to its terminal state, and the
//! correlation header that ties inbound answers back to their tickets.
//!
//! # Type Aliases
//!
//! - [`Ticket`] - process-unique identifier (u64) for one dispatcher request
//! - [`ShardId`] / [`ServerId`] - cluster addressing strings
//! - [`ClientTransactionId`] / [`CoordTransactionId`] - caller-supplied
//!   correlation tags; the empty string and zero act as wildcards in
//!   matching
//!
//! # Ticket Allocation
//!
//! Tickets come from a process-wide monotonic counter and are never zero;
//! zero is reserved as the wildcard in `wait` and `drop` matching.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod correlation;
pub mod destination;
pub mod error;
pub mod result;
pub mod status;


pub use correlation::CoordinatorHeader;
pub use destination::{endpoint_to_url, Destination};
pub use error::{CommError, Result};
pub use result::{CommCallback, CommResult, HttpResult, InboundRequest};
pub use status::Status;

/// Process-unique identifier for one dispatcher request.
///
/// A ticket names one outbound request and is also the key used to
/// correlate inbound answers. Zero is never issued.
pub type Ticket = u64;

/// Identifies a unit of data partition.
pub type ShardId = String;

/// Identifies a database server in the cluster.
pub type ServerId = String;

/// Opaque transaction tag supplied by the client.
pub type ClientTransactionId = String;

/// Numeric transaction tag allocated by the coordinator.
pub type CoordTransactionId = u64;

/// Global counter backing [`next_ticket`].
static TICKET_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Produces a ticket which is unique in this process.
///
/// Tickets are strictly increasing and never zero.
///
/// # Example
///
/// ```
/// use shardcomm_common::protocol::next_ticket;
///
/// let a = next_ticket();
/// let b = next_ticket();
/// assert!(b > a);
/// assert_ne!(a, 0);
/// ```
pub fn next_ticket() -> Ticket {
    loop {
        let ticket = TICKET_COUNTER.fetch_add(1, Ordering::Relaxed);
        if ticket != 0 {
            return ticket;
        }
    }
}
