//! ==============================================================================
//! ledger.rs - delivery correlation and callback counters
//! ==============================================================================
//!
//! every telemetry send is tracked by its MessageId until the transport
//! confirms it, fails it, or it times out. nothing else in the agent waits
//! on these outcomes, they are for logs and the status api.
//!
//! ==============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::{CorrelationId, DeliveryOutcome, MessageId};

#[derive(Debug)]
struct PendingSend {
    correlation_id: CorrelationId,
    sent_at: Instant,
}

/// Counters for every kind of asynchronous event the agent sees.
#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
    unmatched: AtomicU64,
    report_acks: AtomicU64,
    connection_changes: AtomicU64,
    desired_updates: AtomicU64,
    method_calls: AtomicU64,
    cloud_messages: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub unmatched: u64,
    pub report_acks: u64,
    pub connection_changes: u64,
    pub desired_updates: u64,
    pub method_calls: u64,
    pub cloud_messages: u64,
    pub pending: u64,
}

/// A confirmation matched to its send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub correlation_id: CorrelationId,
    pub latency: Duration,
}

#[derive(Debug, Default)]
pub struct Ledger {
    pending: Mutex<HashMap<MessageId, PendingSend>>,
    counters: Counters,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, PendingSend>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track(&self, id: MessageId, correlation_id: CorrelationId) {
        self.pending().insert(
            id,
            PendingSend {
                correlation_id,
                sent_at: Instant::now(),
            },
        );
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Settle a tracked send. `None` when the id was never tracked or has
    /// already been settled or expired.
    pub fn confirm(&self, id: MessageId, outcome: &DeliveryOutcome) -> Option<Confirmation> {
        let Some(entry) = self.pending().remove(&id) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        match outcome {
            DeliveryOutcome::Ok => self.counters.delivered.fetch_add(1, Ordering::Relaxed),
            DeliveryOutcome::Failed(_) => self.counters.failed.fetch_add(1, Ordering::Relaxed),
        };
        Some(Confirmation {
            correlation_id: entry.correlation_id,
            latency: entry.sent_at.elapsed(),
        })
    }

    /// Drop sends older than `timeout`, oldest first.
    pub fn expire(&self, timeout: Duration) -> Vec<MessageId> {
        let mut pending = self.pending();
        let mut expired: Vec<MessageId> = pending
            .iter()
            .filter(|(_, p)| p.sent_at.elapsed() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in &expired {
            pending.remove(id);
        }
        self.counters
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired
    }

    pub fn record_report_ack(&self) -> u64 {
        self.counters.report_acks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_connection_change(&self) -> u64 {
        self.counters.connection_changes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_desired_update(&self) -> u64 {
        self.counters.desired_updates.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_method_call(&self) -> u64 {
        self.counters.method_calls.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_cloud_message(&self) -> u64 {
        self.counters.cloud_messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let c = &self.counters;
        LedgerSnapshot {
            sent: c.sent.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            unmatched: c.unmatched.load(Ordering::Relaxed),
            report_acks: c.report_acks.load(Ordering::Relaxed),
            connection_changes: c.connection_changes.load(Ordering::Relaxed),
            desired_updates: c.desired_updates.load(Ordering::Relaxed),
            method_calls: c.method_calls.load(Ordering::Relaxed),
            cloud_messages: c.cloud_messages.load(Ordering::Relaxed),
            pending: self.pending().len() as u64,
        }
    }
}
