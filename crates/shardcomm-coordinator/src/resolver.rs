//! Destination resolution.
//!
//! Turns a destination string into (shard id, server id, endpoint) on the
//! record, consulting the topology service for the `shard:` and `server:`
//! forms. The endpoint lands on the record already in HTTP-engine form
//! (`http://` / `https://`). A failed resolution leaves the record
//! terminal in BackendUnavailable with an empty endpoint; nothing is ever
//! submitted for such a record.

use shardcomm_common::{
    endpoint_to_url, ClusterTopology, CommError, CommResult, Destination, Status,
};
use tracing::{debug, error, info};

/// Fills destination fields on `record`, or marks it BackendUnavailable.
///
/// `log_connection_errors` selects the log level for failures: clusters in
/// steady state want them at error level, bootstrapping ones at info.
pub(crate) fn resolve_destination(
    topology: &dyn ClusterTopology,
    destination: &str,
    log_connection_errors: bool,
    record: &mut CommResult,
) {
    let parsed = match Destination::parse(destination) {
        Ok(parsed) => parsed,
        Err(CommError::InvalidDestination(dest)) => {
            let message = format!("did not understand destination '{dest}'");
            fail(record, &message, log_connection_errors);
            return;
        }
        Err(error) => {
            fail(record, &error.to_string(), log_connection_errors);
            return;
        }
    };

    match parsed {
        Destination::Endpoint(endpoint) => {
            match endpoint_to_url(&endpoint, "") {
                Some(url) => record.endpoint = url,
                None => {
                    let message = format!("did not understand destination '{endpoint}'");
                    fail(record, &message, log_connection_errors);
                }
            }
            return;
        }
        Destination::Shard(shard_id) => {
            let responsible = topology.responsible_servers(&shard_id);
            record.shard_id = shard_id;
            match responsible.into_iter().next() {
                Some(server_id) => {
                    debug!(%server_id, "responsible server");
                    record.server_id = server_id;
                }
                None => {
                    let message = format!(
                        "cannot find responsible server for shard '{}'",
                        record.shard_id
                    );
                    fail(record, &message, log_connection_errors);
                    return;
                }
            }
        }
        Destination::Server(server_id) => {
            record.server_id = server_id;
        }
    }

    let endpoint = topology
        .server_endpoint(&record.server_id)
        .and_then(|endpoint| endpoint_to_url(&endpoint, ""));
    match endpoint {
        Some(url) => record.endpoint = url,
        None => {
            let message = format!("did not find endpoint of server '{}'", record.server_id);
            fail(record, &message, log_connection_errors);
        }
    }
}

fn fail(record: &mut CommResult, message: &str, log_connection_errors: bool) {
    record.status = Status::BackendUnavailable;
    record.error_message = message.to_string();
    record.endpoint.clear();
    if log_connection_errors {
        error!("{message}");
    } else {
        info!("{message}");
    }
}
