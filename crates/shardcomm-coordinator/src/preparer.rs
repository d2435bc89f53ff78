//! Outbound request preparation.
//!
//! Resolves the destination, copies the caller's headers and injects the
//! dispatcher's own: authorization, the hybrid-logical-clock timestamp,
//! the per-shard nolock hint, and for the store-and-answer pattern the
//! async marker plus the correlation header.

use hyper::body::Bytes;
use hyper::Method;
use shardcomm_common::{
    headers, ClusterTopology, CommResult, CoordinatorHeader, HttpRequestSpec,
    HybridLogicalClock, ServerIdentity, Ticket,
};
use std::collections::{HashMap, HashSet};

use crate::resolver::resolve_destination;

/// Inputs for one prepared request.
pub(crate) struct RequestParams<'a> {
    pub destination: &'a str,
    pub method: Method,
    pub body: Option<Bytes>,
    pub headers: &'a HashMap<String, String>,
    pub client_transaction_id: &'a str,
    pub coord_transaction_id: u64,
    pub single: bool,
    pub ticket: Ticket,
}

/// A record plus, when resolution succeeded, the request to submit.
pub(crate) struct PreparedRequest {
    pub record: CommResult,
    pub request: Option<HttpRequestSpec>,
}

/// Builds the outbound request.
///
/// When resolution fails the record comes back terminal and `request` is
/// `None`; the caller must not touch the transport for it.
pub(crate) fn prepare_request(
    topology: &dyn ClusterTopology,
    identity: &dyn ServerIdentity,
    clock: &HybridLogicalClock,
    nolock_shards: &HashSet<String>,
    log_connection_errors: bool,
    params: RequestParams<'_>,
) -> PreparedRequest {
    let mut record = CommResult {
        client_transaction_id: params.client_transaction_id.to_string(),
        coord_transaction_id: params.coord_transaction_id,
        operation_id: params.ticket,
        single: params.single,
        ..Default::default()
    };

    resolve_destination(
        topology,
        params.destination,
        log_connection_errors,
        &mut record,
    );
    if record.endpoint.is_empty() {
        return PreparedRequest {
            record,
            request: None,
        };
    }

    let mut header_map = params.headers.clone();
    if !record.shard_id.is_empty() && nolock_shards.contains(&record.shard_id) {
        header_map.insert(headers::NOLOCK.to_string(), record.shard_id.clone());
    }
    if !params.single {
        header_map.insert(
            headers::ASYNC_MODE.to_string(),
            headers::ASYNC_STORE.to_string(),
        );
        let correlation = CoordinatorHeader {
            server_id: identity.id(),
            ticket: params.ticket,
            client_transaction_id: params.client_transaction_id.to_string(),
            coord_transaction_id: params.coord_transaction_id,
        };
        header_map.insert(headers::COORDINATOR.to_string(), correlation.to_value());
    }
    header_map.insert(headers::AUTHORIZATION.to_string(), identity.authorization());
    header_map.insert(
        headers::HLC.to_string(),
        HybridLogicalClock::encode_time_stamp(clock.now()),
    );

    PreparedRequest {
        record,
        request: Some(HttpRequestSpec {
            method: params.method,
            headers: header_map,
            body: params.body,
        }),
    }
}
