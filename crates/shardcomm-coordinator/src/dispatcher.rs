//! The dispatcher core.
//!
//! [`ShardComm`] is the façade callers talk to: it resolves destinations,
//! prepares and submits requests through the shared transport, tracks
//! every operation in the ticket registry, and wakes waiters when
//! completions, inbound answers or timeouts arrive.
//!
//! # Notification model
//!
//! The caller-supplied callback is the primitive: transport completions
//! fire it on the driver's task. `wait` and `sync_request` are derived
//! waiters that park on the registry's wakeup (respectively a oneshot
//! signal) until the record they observe turns terminal.
//!
//! # Ownership
//!
//! A `ShardComm` is an explicitly constructed value, usually held in an
//! `Arc` shared between the caller side and the inbound answer endpoint.
//! There is no process-global instance.

use hyper::body::Bytes;
use hyper::Method;
use parking_lot::Mutex;
use shardcomm_common::{
    next_ticket, Callbacks, ClusterTopology, CommCallback, CommResult, HttpCommunicator,
    HttpResult, HybridLogicalClock, ServerIdentity, Status, SubmitOptions, Ticket,
    TransportError,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ShardCommConfig;
use crate::preparer::{prepare_request, RequestParams};
use crate::registry::{dropped_record, timed_out_record, SharedRecord, TicketRegistry, TrackedResponse};

/// Upper bound on one parked interval in [`ShardComm::wait`]; waiters
/// re-inspect the registry at least this often.
const WAIT_SLICE: Duration = Duration::from_secs(60);

/// Per-request options for [`ShardComm::async_request`].
#[derive(Clone)]
pub struct RequestOptions {
    /// Opaque transaction tag from the client; empty means none.
    pub client_transaction_id: String,
    /// Coordinator transaction tag; zero means none.
    pub coord_transaction_id: u64,
    /// Deadline for the whole operation, answer included.
    pub timeout: Duration,
    /// Separate bound on getting the request onto the wire; falls back to
    /// `timeout`. Used by fan-out to retry quickly after a failover.
    pub init_timeout: Option<Duration>,
    /// True when the response to this exchange is the answer; false for
    /// the store-and-answer pattern.
    pub single: bool,
    /// Caller headers, copied before the dispatcher injects its own.
    pub headers: HashMap<String, String>,
    /// Completion callback, fired from the driver task.
    pub callback: Option<CommCallback>,
}

impl RequestOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client_transaction_id: String::new(),
            coord_transaction_id: 0,
            timeout,
            init_timeout: None,
            single: false,
            headers: HashMap::new(),
            callback: None,
        }
    }

    pub fn with_transaction(mut self, client: &str, coord: u64) -> Self {
        self.client_transaction_id = client.to_string();
        self.coord_transaction_id = coord;
        self
    }

    pub fn with_init_timeout(mut self, init_timeout: Duration) -> Self {
        self.init_timeout = Some(init_timeout);
        self
    }

    pub fn single(mut self) -> Self {
        self.single = true;
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_callback(mut self, callback: CommCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

/// The cluster dispatcher.
pub struct ShardComm {
    pub(crate) topology: Arc<dyn ClusterTopology>,
    pub(crate) identity: Arc<dyn ServerIdentity>,
    pub(crate) clock: HybridLogicalClock,
    pub(crate) communicator: Arc<HttpCommunicator>,
    pub(crate) registry: Arc<TicketRegistry>,
    nolock_shards: Mutex<HashSet<String>>,
    pub(crate) log_connection_errors: bool,
    stopping: Arc<AtomicBool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ShardComm {
    /// Creates the dispatcher and starts its background sweep.
    ///
    /// Must be called within a Tokio runtime; the transport driver and the
    /// sweeper are spawned here and joined by [`Self::shutdown`].
    pub fn new(
        config: ShardCommConfig,
        topology: Arc<dyn ClusterTopology>,
        identity: Arc<dyn ServerIdentity>,
    ) -> Arc<Self> {
        let registry = Arc::new(TicketRegistry::new());
        let stopping = Arc::new(AtomicBool::new(false));
        let sweeper = tokio::spawn(sweep_loop(
            registry.clone(),
            stopping.clone(),
            config.sweep_interval,
        ));
        Arc::new(Self {
            topology,
            identity,
            clock: HybridLogicalClock::new(),
            communicator: Arc::new(HttpCommunicator::new(config.communicator)),
            registry,
            nolock_shards: Mutex::new(HashSet::new()),
            log_connection_errors: config.log_connection_errors,
            stopping,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// The hybrid logical clock driving outgoing timestamps. Embedding
    /// servers feed peer ticks back through
    /// [`HybridLogicalClock::observe`].
    pub fn clock(&self) -> &HybridLogicalClock {
        &self.clock
    }

    /// Requests the nolock header for a shard on subsequent requests.
    pub fn mark_nolock_shard(&self, shard_id: &str) {
        self.nolock_shards.lock().insert(shard_id.to_string());
    }

    pub fn clear_nolock_shard(&self, shard_id: &str) {
        self.nolock_shards.lock().remove(shard_id);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Submits one HTTP request asynchronously and returns its ticket.
    ///
    /// The operation is tracked until a [`Self::wait`] or
    /// [`Self::drop_matching`] removes it; completion is observable
    /// through the options' callback, or by waiting on the ticket.
    ///
    /// A destination that cannot be resolved still gets a ticket: the
    /// record is inserted already terminal in BackendUnavailable, waiters
    /// are woken, and a supplied callback runs before this returns.
    pub fn async_request(
        &self,
        destination: &str,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Ticket {
        let RequestOptions {
            client_transaction_id,
            coord_transaction_id,
            timeout,
            init_timeout,
            single,
            headers,
            callback,
        } = options;
        let ticket = next_ticket();

        if self.is_stopping() {
            let record = CommResult {
                client_transaction_id,
                coord_transaction_id,
                operation_id: ticket,
                single,
                status: Status::BackendUnavailable,
                error_message: "dispatcher is shutting down".to_string(),
                ..Default::default()
            };
            return self.finish_immediately(ticket, record, callback, timeout);
        }

        let prepared = {
            let nolock_shards = self.nolock_shards.lock();
            prepare_request(
                self.topology.as_ref(),
                self.identity.as_ref(),
                &self.clock,
                &nolock_shards,
                self.log_connection_errors,
                RequestParams {
                    destination,
                    method,
                    body,
                    headers: &headers,
                    client_transaction_id: &client_transaction_id,
                    coord_transaction_id,
                    single,
                    ticket,
                },
            )
        };

        let Some(spec) = prepared.request else {
            return self.finish_immediately(ticket, prepared.record, callback, timeout);
        };
        let url = format!("{}{}", prepared.record.endpoint, path);

        let now = Instant::now();
        let record: SharedRecord = Arc::new(Mutex::new(prepared.record));
        self.registry.insert(
            ticket,
            TrackedResponse {
                submit_time: now,
                deadline: now + timeout,
                record: record.clone(),
                callback: callback.clone(),
            },
        );

        let connect_timeout = init_timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(timeout);
        let callbacks = self.transport_callbacks(ticket, record.clone(), callback.clone());
        let submitted = self.communicator.submit_with_ticket(
            ticket,
            url,
            spec,
            callbacks,
            SubmitOptions {
                connect_timeout,
                request_timeout: timeout,
            },
        );
        if submitted.is_err() {
            let snapshot = {
                let mut record = record.lock();
                record.status = Status::BackendUnavailable;
                record.error_message = "dispatcher is shutting down".to_string();
                record.clone()
            };
            self.registry.notify_all();
            if let Some(callback) = callback {
                let consumed = callback(&snapshot);
                debug_assert!(consumed);
            }
        } else {
            debug!(ticket, destination, "request submitted");
        }
        ticket
    }

    /// Performs one HTTP request synchronously.
    ///
    /// The operation is not tracked in the registry: the returned record
    /// is the only way to observe it, and `enquire` knows nothing about
    /// it.
    #[allow(clippy::too_many_arguments)]
    pub async fn sync_request(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        destination: &str,
        method: Method,
        path: &str,
        body: Option<Bytes>,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> CommResult {
        let ticket = next_ticket();

        if self.is_stopping() {
            return CommResult {
                client_transaction_id: client_transaction_id.to_string(),
                coord_transaction_id,
                operation_id: ticket,
                single: true,
                status: Status::BackendUnavailable,
                error_message: "dispatcher is shutting down".to_string(),
                ..Default::default()
            };
        }

        let prepared = {
            let nolock_shards = self.nolock_shards.lock();
            prepare_request(
                self.topology.as_ref(),
                self.identity.as_ref(),
                &self.clock,
                &nolock_shards,
                self.log_connection_errors,
                RequestParams {
                    destination,
                    method,
                    body,
                    headers,
                    client_transaction_id,
                    coord_transaction_id,
                    single: true,
                    ticket,
                },
            )
        };

        let Some(spec) = prepared.request else {
            return prepared.record;
        };
        let url = format!("{}{}", prepared.record.endpoint, path);

        let record: SharedRecord = Arc::new(Mutex::new(prepared.record));
        record.lock().status = Status::Sending;

        let (signal_tx, signal_rx) = oneshot::channel();
        let signal = Arc::new(Mutex::new(Some(signal_tx)));

        let success_record = record.clone();
        let success_signal = signal.clone();
        let error_record = record.clone();
        let log_connection_errors = self.log_connection_errors;
        let callbacks = Callbacks::new(
            move |response: HttpResult| {
                success_record.lock().from_response(response);
                if let Some(signal) = success_signal.lock().take() {
                    let _ = signal.send(());
                }
            },
            move |transport_error: TransportError, response: Option<HttpResult>| {
                {
                    let mut record = error_record.lock();
                    record.from_error(&transport_error, response);
                    if record.status == Status::BackendUnavailable {
                        log_connection_failure(&record, log_connection_errors);
                    }
                }
                if let Some(signal) = signal.lock().take() {
                    let _ = signal.send(());
                }
            },
        );

        let submitted = self.communicator.submit_with_ticket(
            ticket,
            url,
            spec,
            callbacks,
            SubmitOptions {
                connect_timeout: timeout,
                request_timeout: timeout,
            },
        );
        if submitted.is_err() {
            let mut result = record.lock().clone();
            result.status = Status::BackendUnavailable;
            result.error_message = "dispatcher is shutting down".to_string();
            return result;
        }

        let _ = signal_rx.await;

        let mut result = record.lock().clone();
        if !result.status.is_terminal() {
            result.status = Status::BackendUnavailable;
            result.error_message = "request was not completed".to_string();
        }
        result
    }

    /// Non-blocking peek at a tracked operation.
    ///
    /// An untracked ticket yields a synthesized Dropped record.
    pub fn enquire(&self, ticket: Ticket) -> CommResult {
        self.registry
            .peek(ticket)
            .unwrap_or_else(|| dropped_record(ticket))
    }

    /// Waits for one matching operation to reach a terminal state and
    /// removes it from tracking.
    ///
    /// With `ticket` zero the wildcard rule applies: empty
    /// `client_transaction_id`, zero `coord_transaction_id` and empty
    /// `shard_id` each match anything, and whichever matching operation
    /// completes first is returned. When nothing matches at all the
    /// result is a synthesized Dropped record; when `timeout` elapses
    /// first, a synthesized Timeout record carrying the requested ticket.
    pub async fn wait(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        ticket: Ticket,
        shard_id: &str,
        timeout: Option<Duration>,
    ) -> CommResult {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let notified = self.registry.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if ticket != 0 {
                if let Some(result) = self.registry.take_if_terminal(ticket) {
                    return result;
                }
                if self.registry.status_of(ticket).is_none() {
                    return dropped_record(ticket);
                }
            } else {
                if let Some(result) = self.registry.take_matching_terminal(
                    client_transaction_id,
                    coord_transaction_id,
                    shard_id,
                ) {
                    return result;
                }
                if !self.registry.has_matching(
                    client_transaction_id,
                    coord_transaction_id,
                    shard_id,
                ) {
                    return dropped_record(0);
                }
            }

            if self.is_stopping() {
                if let Some(entry) = self.registry.remove(ticket) {
                    return entry.record.lock().clone();
                }
                return dropped_record(ticket);
            }

            let mut slice = WAIT_SLICE;
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return timed_out_record(ticket);
                }
                slice = slice.min(remaining);
            }
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    /// Drops every matching operation.
    ///
    /// An operation currently being sent is flagged and collected by its
    /// transport callback; everything else is removed immediately. The
    /// in-flight exchange itself is not aborted, its result is discarded.
    pub fn drop_matching(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        ticket: Ticket,
        shard_id: &str,
    ) {
        self.registry
            .drop_matching(client_transaction_id, coord_transaction_id, ticket, shard_id);
    }

    /// Stops accepting work, wakes waiters, and joins the background
    /// tasks. Exchanges already on the wire run to completion but their
    /// results are discarded.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("dispatcher shutting down");
        self.registry.notify_all();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
            let _ = sweeper.await;
        }
        self.communicator.shutdown().await;
    }

    /// Inserts an already-terminal record, wakes waiters and runs the
    /// callback synchronously. Used when resolution fails or the
    /// dispatcher is stopping.
    fn finish_immediately(
        &self,
        ticket: Ticket,
        record: CommResult,
        callback: Option<CommCallback>,
        timeout: Duration,
    ) -> Ticket {
        debug_assert!(record.status.is_terminal());
        let now = Instant::now();
        let shared: SharedRecord = Arc::new(Mutex::new(record));
        self.registry.insert(
            ticket,
            TrackedResponse {
                submit_time: now,
                deadline: now + timeout,
                record: shared.clone(),
                callback: callback.clone(),
            },
        );
        self.registry.notify_all();
        if let Some(callback) = callback {
            let snapshot = shared.lock().clone();
            let consumed = callback(&snapshot);
            debug_assert!(consumed);
        }
        ticket
    }

    /// Builds the transport callbacks that keep the tracked record
    /// current and wake whoever is observing it.
    fn transport_callbacks(
        &self,
        ticket: Ticket,
        record: SharedRecord,
        caller: Option<CommCallback>,
    ) -> Callbacks {
        let log_connection_errors = self.log_connection_errors;

        let sending_record = record.clone();
        let on_sending = move || {
            let mut record = sending_record.lock();
            if record.status == Status::Submitted {
                record.status = Status::Sending;
            }
        };

        let success_registry = self.registry.clone();
        let success_record = record.clone();
        let success_caller = caller.clone();
        let on_success = move |response: HttpResult| {
            complete(&success_registry, ticket, &success_record, success_caller, |record| {
                record.from_response(response);
            });
        };

        let error_registry = self.registry.clone();
        let on_error = move |transport_error: TransportError, response: Option<HttpResult>| {
            complete(&error_registry, ticket, &record, caller, |record| {
                record.from_error(&transport_error, response);
                if record.status == Status::BackendUnavailable {
                    log_connection_failure(record, log_connection_errors);
                }
            });
        };

        Callbacks::new(on_success, on_error).with_on_sending(on_sending)
    }
}

impl Drop for ShardComm {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

/// Applies a completion to a tracked record and notifies.
///
/// Runs on the transport driver's task. A record flagged as dropped is
/// forgotten: its entry is removed and nobody is woken.
fn complete(
    registry: &TicketRegistry,
    ticket: Ticket,
    record: &SharedRecord,
    caller: Option<CommCallback>,
    update: impl FnOnce(&mut CommResult),
) {
    let (was_dropped, snapshot) = {
        let mut record = record.lock();
        if !record.dropped {
            update(&mut record);
        }
        (record.dropped, record.clone())
    };
    if was_dropped {
        registry.remove(ticket);
        return;
    }
    match caller {
        Some(callback) => {
            let consumed = callback(&snapshot);
            debug_assert!(consumed);
        }
        None => registry.notify_all(),
    }
}

fn log_connection_failure(record: &CommResult, log_connection_errors: bool) {
    let message = format!(
        "cannot create connection to server '{}' at endpoint '{}'",
        record.server_id, record.endpoint
    );
    if log_connection_errors {
        error!("{message}");
    } else {
        info!("{message}");
    }
}

/// Background sweep: transitions Sent operations whose answer deadline
/// elapsed into Timeout, runs their callbacks and wakes waiters.
async fn sweep_loop(registry: Arc<TicketRegistry>, stopping: Arc<AtomicBool>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if stopping.load(Ordering::Relaxed) {
            break;
        }
        let expired = registry.sweep_expired(Instant::now());
        if expired.is_empty() {
            continue;
        }
        for (ticket, snapshot, callback) in expired {
            debug!(ticket, "no answer before the deadline");
            if let Some(callback) = callback {
                if callback(&snapshot) {
                    registry.remove(ticket);
                }
            }
        }
        registry.notify_all();
    }
}
