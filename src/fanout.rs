//! Best-effort push of new log entries and status changes to live
//! subscribers. The store stays the source of truth; a subscriber that falls
//! behind loses events and is expected to catch up through the log cursor.

use crate::store::{LogEntry, LogType, TaskStatus, format_millis};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SUBSCRIBER_BUFFER: usize = 64;

#[derive(Clone, Debug, PartialEq)]
pub enum FanoutEvent {
    Log {
        id: i64,
        message: String,
        log_type: LogType,
        timestamp: i64,
    },
    Status {
        status: TaskStatus,
    },
}

impl FanoutEvent {
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self::Log {
            id: entry.id,
            message: entry.message.clone(),
            log_type: entry.log_type,
            timestamp: entry.timestamp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::Status { .. } => "status",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Log {
                id,
                message,
                log_type,
                timestamp,
            } => json!({
                "id": id,
                "message": message,
                "log_type": log_type,
                "timestamp": format_millis(*timestamp),
            }),
            Self::Status { status } => json!({ "status": status }),
        }
    }
}

pub enum Next {
    Event(FanoutEvent),
    Idle,
    Closed,
}

/// Receiving end for one task. Dropping it unregisters the sender, so
/// streams that end early leave nothing behind in the notifier.
pub struct Subscription {
    rx: Receiver<FanoutEvent>,
    task_id: i64,
    key: u64,
    notifier: Notifier,
}

impl Subscription {
    /// Waits up to `timeout` for the next event. `Closed` means the task
    /// reached a terminal state (or the notifier dropped this subscriber).
    pub fn next_timeout(&self, timeout: Duration) -> Next {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Next::Event(event),
            Err(RecvTimeoutError::Timeout) => Next::Idle,
            Err(RecvTimeoutError::Disconnected) => Next::Closed,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(self.task_id, self.key);
    }
}

struct Subscriber {
    key: u64,
    tx: SyncSender<FanoutEvent>,
}

#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<HashMap<i64, Vec<Subscriber>>>>,
    next_key: Arc<AtomicU64>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, task_id: i64) -> Subscription {
        let (tx, rx) = mpsc::sync_channel(SUBSCRIBER_BUFFER);
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(task_id)
                .or_default()
                .push(Subscriber { key, tx });
        }
        Subscription {
            rx,
            task_id,
            key,
            notifier: self.clone(),
        }
    }

    fn unsubscribe(&self, task_id: i64, key: u64) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        if let Some(senders) = subscribers.get_mut(&task_id) {
            senders.retain(|subscriber| subscriber.key != key);
            if senders.is_empty() {
                subscribers.remove(&task_id);
            }
        }
    }

    /// Never blocks. Full buffers drop the event; gone subscribers are pruned.
    pub fn publish(&self, task_id: i64, event: FanoutEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        let Some(senders) = subscribers.get_mut(&task_id) else {
            return;
        };
        senders.retain(|subscriber| match subscriber.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(task_id, event = event.name(), "fanout-subscriber-lagging");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        if senders.is_empty() {
            subscribers.remove(&task_id);
        }
    }

    pub fn publish_entry(&self, task_id: i64, entry: &LogEntry) {
        self.publish(task_id, FanoutEvent::from_entry(entry));
    }

    /// Drops every subscriber of `task_id`; their receivers see `Closed` after
    /// draining what was already buffered.
    pub fn close(&self, task_id: i64) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.remove(&task_id);
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, task_id: i64) -> usize {
        self.subscribers
            .lock()
            .map(|subscribers| subscribers.get(&task_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}
