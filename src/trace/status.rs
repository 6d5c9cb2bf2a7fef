//! Shared trace-pipeline status, updated by the consumer/correlator tasks
//! and read back out by the `/trace/status` handler.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

#[derive(Default)]
pub struct TraceStatus {
    consumer_connected: AtomicBool,
    active_traces: AtomicI64,
    exported_total: AtomicU64,
    dropped_total: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TraceStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_consumer_connected(&self, connected: bool) {
        self.consumer_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_active_traces(&self, count: usize) {
        self.active_traces.store(count as i64, Ordering::Relaxed);
    }

    pub fn record_export(&self) {
        self.exported_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        *self.last_error.lock().await = Some(message.into());
    }

    pub async fn snapshot(&self) -> TraceStatusSnapshot {
        TraceStatusSnapshot {
            consumer_connected: self.consumer_connected.load(Ordering::Relaxed),
            active_traces: self.active_traces.load(Ordering::Relaxed),
            exported_total: self.exported_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
            last_error: self.last_error.lock().await.clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TraceStatusSnapshot {
    pub consumer_connected: bool,
    pub active_traces: i64,
    pub exported_total: u64,
    pub dropped_total: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_reflects_recorded_activity() {
        let status = TraceStatus::new();
        status.set_consumer_connected(true);
        status.set_active_traces(3);
        status.record_export();
        status.record_export();
        status.record_drop();
        status.record_error("stream read failed").await;

        let snapshot = status.snapshot().await;
        assert!(snapshot.consumer_connected);
        assert_eq!(snapshot.active_traces, 3);
        assert_eq!(snapshot.exported_total, 2);
        assert_eq!(snapshot.dropped_total, 1);
        assert_eq!(snapshot.last_error.as_deref(), Some("stream read failed"));
    }
}
