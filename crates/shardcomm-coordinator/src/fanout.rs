//! Fan-out request batches.
//!
//! [`ShardComm::perform_requests`] submits a batch of requests
//! concurrently under one shared coordinator transaction id, waits for
//! whichever completes first, and retries exactly the transient outcomes:
//! connect failures and timeouts whose send never finished. Everything
//! else is final on first contact. A batch of one skips the machinery and
//! runs a single synchronous exchange.

use hyper::body::Bytes;
use hyper::Method;
use shardcomm_common::{next_ticket, CommResult, InboundRequest, Status, Ticket};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::dispatcher::{RequestOptions, ShardComm};

/// One request in a fan-out batch.
#[derive(Debug, Clone)]
pub struct FanoutRequest {
    pub destination: String,
    pub method: Method,
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: HashMap<String, String>,
    /// Filled in by `perform_requests`.
    pub result: Option<CommResult>,
    /// True once this request finished, successfully or for good.
    pub done: bool,
}

impl FanoutRequest {
    pub fn new(destination: &str, method: Method, path: &str) -> Self {
        Self {
            destination: destination.to_string(),
            method,
            path: path.to_string(),
            body: None,
            headers: HashMap::new(),
            result: None,
            done: false,
        }
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Outcome of a fan-out batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutOutcome {
    /// Requests answered with HTTP 200, 201 or 202.
    pub n_good: usize,
    /// Requests that finished, successfully or permanently failed. The
    /// batch timed out if and only if this is less than the batch size.
    pub n_done: usize,
}

/// Bound on the send-phase timeout of one fan-out submission, derived
/// from how long the batch has been running.
pub(crate) fn init_timeout_for(elapsed: Duration) -> Duration {
    elapsed.clamp(Duration::from_secs(1), Duration::from_secs(10))
}

/// Backoff before retrying a transient failure: twice the elapsed batch
/// time, clamped.
pub(crate) fn retry_delay_after(elapsed: Duration) -> Duration {
    (elapsed * 2).clamp(Duration::from_millis(200), Duration::from_secs(10))
}

impl ShardComm {
    /// Performs a batch of requests, retrying transient failures with
    /// exponential backoff until `timeout` elapses.
    ///
    /// Results land in each request's `result` slot. Returns the number
    /// of good answers and the number of finished requests; on exit every
    /// operation still in flight is dropped.
    pub async fn perform_requests(
        &self,
        requests: &mut [FanoutRequest],
        timeout: Duration,
    ) -> FanoutOutcome {
        if requests.is_empty() || timeout.is_zero() {
            return FanoutOutcome {
                n_good: 0,
                n_done: 0,
            };
        }
        if requests.len() == 1 {
            return self.perform_single_request(&mut requests[0], timeout).await;
        }

        // One transaction id spans the whole batch so a single drop call
        // cleans up whatever is still in flight on exit.
        let coord_transaction_id = next_ticket();
        let start = Instant::now();
        let end_time = start + timeout;
        let far_future = end_time + Duration::from_secs(10);
        let mut due_time = vec![start; requests.len()];
        let mut ticket_to_index: HashMap<Ticket, usize> = HashMap::new();
        let mut n_done = 0usize;
        let mut n_good = 0usize;

        loop {
            let now = Instant::now();
            if now > end_time {
                break;
            }
            if n_done >= requests.len() {
                return FanoutOutcome { n_good, n_done };
            }

            // Send whatever is due.
            for index in 0..requests.len() {
                if requests[index].done || now < due_time[index] {
                    continue;
                }
                let remaining = end_time.saturating_duration_since(now);
                let local_init = init_timeout_for(now - start).min(remaining);
                due_time[index] = far_future;
                let request = &requests[index];
                trace!(
                    destination = %request.destination,
                    path = %request.path,
                    "fan-out: sending"
                );
                let ticket = self.async_request(
                    &request.destination,
                    request.method.clone(),
                    &request.path,
                    request.body.clone(),
                    RequestOptions::new(remaining)
                        .with_transaction("", coord_transaction_id)
                        .with_init_timeout(local_init)
                        .with_headers(request.headers.clone()),
                );
                ticket_to_index.insert(ticket, index);
            }

            // How long we can afford to wait before another send is due.
            let mut action_needed = end_time;
            for index in 0..requests.len() {
                if !requests[index].done && due_time[index] < action_needed {
                    action_needed = due_time[index];
                }
            }

            loop {
                let now = Instant::now();
                if now >= action_needed {
                    break;
                }
                let result = self
                    .wait(
                        "",
                        coord_transaction_id,
                        0,
                        "",
                        Some(action_needed.saturating_duration_since(now)),
                    )
                    .await;

                if result.status == Status::Timeout && result.operation_id == 0 {
                    // Nothing completed before the wait deadline.
                    break;
                }
                if result.status == Status::Dropped {
                    // Nothing in flight; doze until the next send is due.
                    let now = Instant::now();
                    if now >= action_needed {
                        break;
                    }
                    let doze = action_needed
                        .saturating_duration_since(now)
                        .min(Duration::from_millis(500));
                    tokio::time::sleep(doze).await;
                    continue;
                }

                let Some(&index) = ticket_to_index.get(&result.operation_id) else {
                    warn!(
                        ticket = result.operation_id,
                        "fan-out: answer for a request we did not send"
                    );
                    continue;
                };
                if requests[index].done {
                    continue;
                }

                if result.status == Status::Received {
                    trace!(
                        destination = %requests[index].destination,
                        code = result.answer_code,
                        "fan-out: got answer"
                    );
                    let good = matches!(result.answer_code, Some(200 | 201 | 202));
                    requests[index].result = Some(result);
                    requests[index].done = true;
                    n_done += 1;
                    if good {
                        n_good += 1;
                    }
                } else if result.status == Status::BackendUnavailable
                    || (result.status == Status::Timeout && !result.send_was_complete)
                {
                    trace!(
                        destination = %requests[index].destination,
                        status = %result.status,
                        "fan-out: transient failure, scheduling retry"
                    );
                    requests[index].result = Some(result);
                    let now = Instant::now();
                    let due = now + retry_delay_after(now - start);
                    if due >= end_time {
                        // No room left for another attempt.
                        requests[index].done = true;
                        n_done += 1;
                    } else {
                        due_time[index] = due;
                        if due < action_needed {
                            action_needed = due;
                        }
                    }
                } else {
                    trace!(
                        destination = %requests[index].destination,
                        status = %result.status,
                        "fan-out: failed for good"
                    );
                    requests[index].result = Some(result);
                    requests[index].done = true;
                    n_done += 1;
                }

                if n_done >= requests.len() {
                    return FanoutOutcome { n_good, n_done };
                }
            }
        }

        debug!(
            n_done,
            total = requests.len(),
            "fan-out: batch timed out"
        );
        self.drop_matching("", coord_transaction_id, 0, "");
        FanoutOutcome { n_good, n_done }
    }

    /// Fast path for a batch of one: a single synchronous exchange, its
    /// response translated into the answer shape the batch contract
    /// promises.
    async fn perform_single_request(
        &self,
        request: &mut FanoutRequest,
        timeout: Duration,
    ) -> FanoutOutcome {
        let coord_transaction_id = next_ticket();
        let mut result = self
            .sync_request(
                "",
                coord_transaction_id,
                &request.destination,
                request.method.clone(),
                &request.path,
                request.body.clone(),
                &request.headers,
                timeout,
            )
            .await;

        if result.status == Status::BackendUnavailable {
            request.result = Some(result);
            return FanoutOutcome {
                n_good: 0,
                n_done: 0,
            };
        }
        // An overloaded backend is a transient condition for the caller
        // even though the exchange itself completed.
        if result.status == Status::Error
            && result.result.as_ref().map(|http| http.code) == Some(503)
        {
            result.status = Status::BackendUnavailable;
            request.result = Some(result);
            return FanoutOutcome {
                n_good: 0,
                n_done: 0,
            };
        }
        let Some(http) = result.result.clone() else {
            request.result = Some(result);
            return FanoutOutcome {
                n_good: 0,
                n_done: 0,
            };
        };

        result.answer = Some(InboundRequest {
            headers: http.headers,
            body: http.body,
        });
        result.answer_code = Some(http.code);
        result.status = Status::Received;
        let n_good = usize::from(matches!(result.answer_code, Some(200 | 201 | 202)));
        request.result = Some(result);
        request.done = true;
        FanoutOutcome { n_good, n_done: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_timeout_is_clamped() {
        assert_eq!(init_timeout_for(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(
            init_timeout_for(Duration::from_secs(4)),
            Duration::from_secs(4)
        );
        assert_eq!(
            init_timeout_for(Duration::from_secs(90)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn retry_delay_is_clamped() {
        assert_eq!(
            retry_delay_after(Duration::ZERO),
            Duration::from_millis(200)
        );
        assert_eq!(
            retry_delay_after(Duration::from_millis(300)),
            Duration::from_millis(600)
        );
        assert_eq!(
            retry_delay_after(Duration::from_secs(30)),
            Duration::from_secs(10)
        );
    }
}
