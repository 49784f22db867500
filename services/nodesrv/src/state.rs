//! Shared node state
//!
//! One value groups everything a connection handler and the executor
//! share: the inbound command queue, the outbound response queue, and
//! the fault list. Completion is signaled through condition-variable
//! style notifies: a handler waits for [`NodeState::wait_for_drain`],
//! which holds exactly when the executor has cleared the batch that
//! handler submitted. Correct under the single-master, single-executor
//! discipline: the master sends one batch at a time by construction.

use tokio::sync::{Mutex, Notify};

use loopsim_model::{DataEntry, ErrorEntry};

/// Queues and signals shared between connection handlers and the
/// executor.
#[derive(Default)]
pub struct NodeState {
    commands: Mutex<Vec<DataEntry>>,
    out_queue: Mutex<Vec<DataEntry>>,
    error_list: Mutex<Vec<ErrorEntry>>,
    submitted: Notify,
    drained: Notify,
}

impl NodeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch to the command queue and wake the executor.
    pub async fn submit_batch(&self, entries: Vec<DataEntry>) {
        {
            let mut commands = self.commands.lock().await;
            commands.extend(entries);
        }
        self.submitted.notify_one();
    }

    /// Wait until the command queue is non-empty, then return a snapshot
    /// of it. The queue itself stays populated until
    /// [`Self::finish_batch`] so handlers observe in-progress work.
    pub async fn wait_for_commands(&self) -> Vec<DataEntry> {
        loop {
            let notified = self.submitted.notified();
            {
                let commands = self.commands.lock().await;
                if !commands.is_empty() {
                    return commands.clone();
                }
            }
            notified.await;
        }
    }

    /// Clear the command queue and release every handler waiting on the
    /// drain condition.
    pub async fn finish_batch(&self) {
        self.commands.lock().await.clear();
        self.drained.notify_waiters();
    }

    /// Block until the command queue is empty.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            {
                let commands = self.commands.lock().await;
                if commands.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Queue a value response for the next reply.
    pub async fn record_response(&self, entry: DataEntry) {
        self.out_queue.lock().await.push(entry);
    }

    /// Queue a fault report for the next reply.
    pub async fn record_error(&self, entry: ErrorEntry) {
        self.error_list.lock().await.push(entry);
    }

    /// Take every queued response and fault, leaving both queues empty.
    pub async fn take_reply(&self) -> (Vec<DataEntry>, Vec<ErrorEntry>) {
        let entries = std::mem::take(&mut *self.out_queue.lock().await);
        let errors = std::mem::take(&mut *self.error_list.lock().await);
        (entries, errors)
    }

    pub async fn pending_commands(&self) -> usize {
        self.commands.lock().await.len()
    }
}
