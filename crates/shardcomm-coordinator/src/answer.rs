//! The async-answer pattern.
//!
//! A request submitted with `single == false` orders an answer: the
//! database server stores the operation, acknowledges the exchange, and
//! later sends the real response as an independent HTTP request back to
//! the coordinator, echoing the correlation header.
//!
//! [`ShardComm::async_answer`] is the database-server side (ship an
//! answer out); [`ShardComm::process_answer`] is the coordinator side
//! (correlate an inbound answer with its ticket and wake the waiter).

use hyper::body::Bytes;
use hyper::Method;
use shardcomm_common::{
    endpoint_to_url, headers, Callbacks, CommError, CoordinatorHeader, HttpRequestSpec,
    HttpResult, HybridLogicalClock, InboundRequest, Status, SubmitOptions, TransportError,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::dispatcher::ShardComm;

/// Why an inbound answer could not be processed.
///
/// Returned to the HTTP layer, which reports the message to the sending
/// server; nothing is propagated beyond that.
#[derive(Error, Debug)]
pub enum AnswerError {
    #[error(transparent)]
    Header(#[from] CommError),

    #[error("operation was already dropped by sender")]
    AlreadyDropped,
}

/// How long a database server keeps trying to deliver one answer.
const ANSWER_DELIVERY_TIMEOUT: Duration = Duration::from_secs(3600);

impl ShardComm {
    /// Sends an answer back to the coordinator named in the correlation
    /// header. Database-server side only.
    ///
    /// `code`, `header_map` and `body` describe the locally computed
    /// response; the dispatcher augments the headers with the echoed
    /// correlation value, the response code, authorization and the clock
    /// timestamp, then PUTs the result to the coordinator's answer
    /// endpoint. Failures are logged, never propagated.
    pub fn async_answer(
        &self,
        coordinator_header: &str,
        code: u16,
        header_map: HashMap<String, String>,
        body: Bytes,
    ) {
        debug!(coordinator_header, "sending answer");
        let coordinator_id = match coordinator_header.split(':').next() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                error!(
                    "could not find coordinator ID in '{}'",
                    headers::COORDINATOR
                );
                return;
            }
        };

        let endpoint = match self.topology.server_endpoint(&coordinator_id) {
            Some(endpoint) if !endpoint.is_empty() => endpoint,
            _ => {
                let message =
                    format!("cannot find endpoint for coordinator '{coordinator_id}'");
                if self.log_connection_errors {
                    error!("{message}");
                } else {
                    info!("{message}");
                }
                return;
            }
        };
        let Some(url) = endpoint_to_url(&endpoint, headers::SHARD_COMM_PATH) else {
            error!(%endpoint, "coordinator endpoint has an unusable scheme");
            return;
        };

        let mut answer_headers = header_map;
        answer_headers.insert(
            headers::COORDINATOR.to_string(),
            coordinator_header.to_string(),
        );
        answer_headers.insert(headers::RESPONSE_CODE.to_string(), code.to_string());
        answer_headers.insert(
            headers::AUTHORIZATION.to_string(),
            self.identity.authorization(),
        );
        answer_headers.insert(
            headers::HLC.to_string(),
            HybridLogicalClock::encode_time_stamp(self.clock.now()),
        );

        let target = coordinator_id.clone();
        let callbacks = Callbacks::new(
            move |result: HttpResult| {
                if result.code >= 400 {
                    warn!(
                        coordinator = %target,
                        code = result.code,
                        "coordinator rejected the answer"
                    );
                }
            },
            move |transport_error: TransportError, _: Option<HttpResult>| {
                error!(
                    coordinator = %coordinator_id,
                    %transport_error,
                    "could not deliver answer to coordinator"
                );
            },
        );

        let submitted = self.communicator.submit(
            url,
            HttpRequestSpec {
                method: Method::PUT,
                headers: answer_headers,
                body: Some(body),
            },
            callbacks,
            SubmitOptions {
                request_timeout: ANSWER_DELIVERY_TIMEOUT,
                ..Default::default()
            },
        );
        if submitted.is_err() {
            debug!("answer discarded, dispatcher is shutting down");
        }
    }

    /// Correlates an inbound answer with the operation that ordered it.
    /// Coordinator side only.
    ///
    /// On success the tracked record gains the answer and its response
    /// code, turns Received, and waiters are woken; a caller callback is
    /// invoked, and a truthy return removes the record from tracking.
    ///
    /// # Errors
    ///
    /// [`AnswerError::Header`] when the correlation header does not parse,
    /// [`AnswerError::AlreadyDropped`] when the ticket is no longer
    /// tracked.
    pub fn process_answer(
        &self,
        coordinator_header: &str,
        answer: InboundRequest,
    ) -> Result<(), AnswerError> {
        debug!(coordinator_header, "inbound answer");
        let correlation = CoordinatorHeader::parse(coordinator_header)?;

        if let Some(tick) = answer
            .header(headers::HLC)
            .and_then(HybridLogicalClock::decode_time_stamp)
        {
            self.clock.observe(tick);
        }

        let answer_code = answer
            .header(headers::RESPONSE_CODE)
            .and_then(|value| value.parse::<u16>().ok());

        let Some(entry) = self.registry.with_entry(correlation.ticket, |entry| {
            let snapshot = {
                let mut record = entry.record.lock();
                record.answer_code = answer_code;
                record.answer = Some(answer);
                record.status = Status::Received;
                record.clone()
            };
            (snapshot, entry.callback.clone())
        }) else {
            return Err(AnswerError::AlreadyDropped);
        };

        let (snapshot, callback) = entry;
        if let Some(callback) = callback {
            if callback(&snapshot) {
                self.registry.remove(correlation.ticket);
            }
        }
        self.registry.notify_all();
        Ok(())
    }
}
