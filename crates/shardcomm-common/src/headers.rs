//! Wire header names used by the dispatcher.
//!
//! The coordinator and the database servers agree on a small set of
//! `X-Arango-*` headers: the correlation header that ties an inbound
//! answer to the ticket that ordered it, the async-answer mode marker,
//! the hybrid-logical-clock timestamp, and the per-shard nolock hint.

/// Correlation header: `<serverId>:<ticket>:<clientTxId>:<coordTxId>`.
pub const COORDINATOR: &str = "X-Arango-Coordinator";

/// Marks a request as ordering an out-of-band answer.
pub const ASYNC_MODE: &str = "X-Arango-Async";

/// Value of [`ASYNC_MODE`] for the store-and-answer pattern.
pub const ASYNC_STORE: &str = "store";

/// Hybrid-logical-clock timestamp, encoded with
/// [`crate::hlc::HybridLogicalClock::encode_time_stamp`].
pub const HLC: &str = "X-Arango-HLC";

/// Tells the receiving server not to lock the named shard.
pub const NOLOCK: &str = "X-Arango-Nolock";

/// HTTP status of the original exchange, echoed on an outgoing answer.
pub const RESPONSE_CODE: &str = "X-Arango-Response-Code";

/// Authorization header.
pub const AUTHORIZATION: &str = "Authorization";

/// Path on the coordinator that receives asynchronous answers.
pub const SHARD_COMM_PATH: &str = "/_api/shard-comm";
