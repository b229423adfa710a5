//! Risk alerts and the bounded queue they are delivered over.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use rg_types::violation::{Severity, ViolationType};

/// A transient risk notification. Alerts are never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: Uuid,
    pub alert_type: ViolationType,
    pub severity: Severity,
    pub monitor_id: String,
    pub entity_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the alert has been acknowledged by a human operator.
    pub acknowledged: bool,
}

impl RiskAlert {
    pub fn new(
        alert_type: ViolationType,
        severity: Severity,
        monitor_id: &str,
        entity_id: &str,
        message: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            monitor_id: monitor_id.to_string(),
            entity_id: entity_id.to_string(),
            message,
            timestamp: Utc::now(),
            acknowledged: false,
        }
    }

    /// Log the alert at a level matching its severity.
    pub fn log(&self) {
        match self.severity {
            Severity::Critical => error!(
                monitor = %self.monitor_id,
                entity = %self.entity_id,
                kind = %self.alert_type,
                "RISK CRITICAL: {}", self.message
            ),
            Severity::Error => error!(
                monitor = %self.monitor_id,
                entity = %self.entity_id,
                kind = %self.alert_type,
                "RISK ERROR: {}", self.message
            ),
            Severity::Warning => warn!(
                monitor = %self.monitor_id,
                entity = %self.entity_id,
                kind = %self.alert_type,
                "RISK WARNING: {}", self.message
            ),
            Severity::Info => info!(
                monitor = %self.monitor_id,
                entity = %self.entity_id,
                kind = %self.alert_type,
                "RISK INFO: {}", self.message
            ),
        }
    }
}

/// Bounded multi-producer alert queue.
///
/// Producers never block: when the queue is full the newest alert is dropped
/// and a warning is logged.
pub struct AlertQueue {
    tx: Sender<RiskAlert>,
    rx: Receiver<RiskAlert>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an alert. Returns `false` if it was dropped.
    pub fn push(&self, alert: RiskAlert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(alert)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    alert_id = %alert.id,
                    kind = %alert.alert_type,
                    entity = %alert.entity_id,
                    "alert queue full, dropping alert"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Drain up to `limit` alerts without blocking.
    pub fn drain(&self, limit: usize) -> Vec<RiskAlert> {
        self.rx.try_iter().take(limit).collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Number of alerts successfully enqueued.
    pub fn alert_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
