//! Shardcomm Transport Layer
//!
//! This module provides the shared multi-connection HTTP engine that all
//! dispatcher traffic flows through.
//!
//! # Architecture
//!
//! [`HttpCommunicator::submit`] may be called from any task; it allocates
//! a ticket and enqueues the request. A single driver task drains the
//! queue and runs each exchange as its own task, bounded by a semaphore so
//! at most `max_in_flight` requests are on the wire at once. Completion is
//! reported through per-request [`Callbacks`], fired exactly once per
//! ticket.
//!
//! # Endpoints
//!
//! Submit URLs use `http://` or `https://`; the cluster's `tcp://` and
//! `ssl://` endpoint forms are translated before submission by
//! [`crate::protocol::endpoint_to_url`]. TLS connections validate against
//! the webpki root set.

pub mod driver;

pub use driver::{
    Callbacks, CommunicatorConfig, HttpCommunicator, HttpRequestSpec, SubmitOptions,
    TransportError,
};
