//! Ticket registry.
//!
//! The single authoritative table of post-submission state: one entry per
//! tracked ticket, guarded by one mutex, with a `Notify` that completion
//! paths broadcast on. Insertion happens on submit; removal on `wait` or
//! `drop` (transport callbacks only update status). The record inside an
//! entry is shared: the object waiters read is the object the callbacks
//! update.

use parking_lot::Mutex;
use shardcomm_common::{CommCallback, CommResult, Status, Ticket};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Shared, mutable record handle.
pub(crate) type SharedRecord = Arc<Mutex<CommResult>>;

/// One tracked operation.
pub(crate) struct TrackedResponse {
    #[allow(dead_code)]
    pub submit_time: Instant,
    /// Answer deadline; Sent records past it are swept to Timeout.
    pub deadline: Instant,
    pub record: SharedRecord,
    pub callback: Option<CommCallback>,
}

/// Ticket -> tracked operation, plus the waiter wakeup.
pub(crate) struct TicketRegistry {
    tracked: Mutex<HashMap<Ticket, TrackedResponse>>,
    something_received: Notify,
}

/// The wildcard matching rule: empty client transaction id, zero
/// coordinator transaction id and empty shard id each match anything.
pub(crate) fn matches(
    client_transaction_id: &str,
    coord_transaction_id: u64,
    shard_id: &str,
    record: &CommResult,
) -> bool {
    (client_transaction_id.is_empty()
        || client_transaction_id == record.client_transaction_id)
        && (coord_transaction_id == 0 || coord_transaction_id == record.coord_transaction_id)
        && (shard_id.is_empty() || shard_id == record.shard_id)
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
            something_received: Notify::new(),
        }
    }

    pub fn insert(&self, ticket: Ticket, entry: TrackedResponse) {
        self.tracked.lock().insert(ticket, entry);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.something_received.notify_waiters();
    }

    /// A wakeup future; create and enable it before inspecting state so a
    /// completion between inspection and await is not lost.
    pub fn notified(&self) -> Notified<'_> {
        self.something_received.notified()
    }

    /// Read-only peek at a tracked record.
    pub fn peek(&self, ticket: Ticket) -> Option<CommResult> {
        self.tracked
            .lock()
            .get(&ticket)
            .map(|entry| entry.record.lock().clone())
    }

    /// Status of a tracked record, `None` when untracked.
    pub fn status_of(&self, ticket: Ticket) -> Option<Status> {
        self.tracked
            .lock()
            .get(&ticket)
            .map(|entry| entry.record.lock().status)
    }

    /// Removes a tracked entry.
    pub fn remove(&self, ticket: Ticket) -> Option<TrackedResponse> {
        self.tracked.lock().remove(&ticket)
    }

    /// Runs `f` against a tracked entry under the registry lock,
    /// returning `None` when the ticket is untracked.
    pub fn with_entry<T>(
        &self,
        ticket: Ticket,
        f: impl FnOnce(&TrackedResponse) -> T,
    ) -> Option<T> {
        self.tracked.lock().get(&ticket).map(f)
    }

    /// Removes and returns the ticket's record if it reached a terminal
    /// status.
    pub fn take_if_terminal(&self, ticket: Ticket) -> Option<CommResult> {
        let mut tracked = self.tracked.lock();
        let terminal = tracked
            .get(&ticket)
            .map(|entry| entry.record.lock().status.is_terminal())?;
        if terminal {
            tracked
                .remove(&ticket)
                .map(|entry| entry.record.lock().clone())
        } else {
            None
        }
    }

    /// True when any tracked record matches the wildcard rule.
    pub fn has_matching(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        shard_id: &str,
    ) -> bool {
        self.tracked.lock().values().any(|entry| {
            matches(
                client_transaction_id,
                coord_transaction_id,
                shard_id,
                &entry.record.lock(),
            )
        })
    }

    /// Removes and returns some matching record that reached a terminal
    /// status, so fan-out consumers observe completions in arrival order.
    pub fn take_matching_terminal(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        shard_id: &str,
    ) -> Option<CommResult> {
        let mut tracked = self.tracked.lock();
        let ticket = tracked.iter().find_map(|(ticket, entry)| {
            let record = entry.record.lock();
            (record.status.is_terminal()
                && matches(
                    client_transaction_id,
                    coord_transaction_id,
                    shard_id,
                    &record,
                ))
            .then_some(*ticket)
        })?;
        tracked
            .remove(&ticket)
            .map(|entry| entry.record.lock().clone())
    }

    /// Drops matching operations: entries in Sending are flagged and left
    /// for the transport callback to collect, everything else is removed.
    pub fn drop_matching(
        &self,
        client_transaction_id: &str,
        coord_transaction_id: u64,
        ticket: Ticket,
        shard_id: &str,
    ) {
        let mut tracked = self.tracked.lock();
        tracked.retain(|entry_ticket, entry| {
            let mut record = entry.record.lock();
            let matched = (ticket != 0 && ticket == *entry_ticket)
                || (ticket == 0
                    && matches(
                        client_transaction_id,
                        coord_transaction_id,
                        shard_id,
                        &record,
                    ));
            if !matched {
                return true;
            }
            // The flag tells a late transport callback to discard its
            // result instead of notifying anyone.
            record.dropped = true;
            record.status == Status::Sending
        });
    }

    /// Sweeps Sent records past their deadline into Timeout.
    ///
    /// Returns the affected entries so the caller can run callbacks and
    /// notify waiters outside the lock.
    pub fn sweep_expired(&self, now: Instant) -> Vec<(Ticket, CommResult, Option<CommCallback>)> {
        let tracked = self.tracked.lock();
        let mut expired = Vec::new();
        for (ticket, entry) in tracked.iter() {
            if entry.deadline > now {
                continue;
            }
            let mut record = entry.record.lock();
            if record.status == Status::Sent {
                record.status = Status::Timeout;
                record.error_message = "timeout".to_string();
                record.send_was_complete = true;
                expired.push((*ticket, record.clone(), entry.callback.clone()));
            }
        }
        expired
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tracked.lock().len()
    }
}

/// Synthesizes the record returned for untracked tickets.
pub(crate) fn dropped_record(ticket: Ticket) -> CommResult {
    CommResult {
        operation_id: ticket,
        status: Status::Dropped,
        ..Default::default()
    }
}

/// Synthesizes the record returned when a wait deadline passes.
pub(crate) fn timed_out_record(ticket: Ticket) -> CommResult {
    CommResult {
        operation_id: ticket,
        status: Status::Timeout,
        ..Default::default()
    }
}
