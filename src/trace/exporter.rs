//! Trace exporters: where a completed [`Trace`] goes once the correlator
//! judges it done.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::Tracer;
use tokio::sync::{Mutex, Notify};

use crate::trace::model::Trace;
use crate::trace::status::TraceStatus;

#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, trace: &Trace);
}

/// Discards everything. Used in tests and when tracing is disabled.
pub struct NullExporter;

#[async_trait]
impl Exporter for NullExporter {
    async fn export(&self, _trace: &Trace) {}
}

/// Pretty-prints completed traces to stdout via `tracing`.
pub struct ConsoleExporter;

#[async_trait]
impl Exporter for ConsoleExporter {
    async fn export(&self, trace: &Trace) {
        tracing::info!(
            trace_id = %trace.trace_id,
            span_count = trace.spans.len(),
            complete = trace.is_structurally_complete(),
            "trace assembled"
        );
        for span in &trace.spans {
            tracing::debug!(
                trace_id = %trace.trace_id,
                span_id = %span.span_id,
                parent = ?span.parent_span_id,
                agent_id = %span.agent_id,
                operation = %span.operation,
                "span"
            );
        }
    }
}

/// Serializes completed traces as JSON lines to stdout, for pipelines
/// that scrape logs rather than query OTLP.
pub struct JsonExporter;

#[async_trait]
impl Exporter for JsonExporter {
    async fn export(&self, trace: &Trace) {
        match serde_json::to_string(&JsonTrace::from(trace)) {
            Ok(line) => println!("{line}"),
            Err(err) => tracing::warn!(error = %err, "failed to serialize trace for json export"),
        }
    }
}

#[derive(serde::Serialize)]
struct JsonTrace {
    trace_id: String,
    span_count: usize,
    complete: bool,
}

impl From<&Trace> for JsonTrace {
    fn from(trace: &Trace) -> Self {
        JsonTrace {
            trace_id: trace.trace_id.clone(),
            span_count: trace.spans.len(),
            complete: trace.is_structurally_complete(),
        }
    }
}

/// Traces queued for OTLP emission before a stalled collector is allowed
/// to pin unbounded memory.
const QUEUE_CAPACITY: usize = 256;

/// Re-emits each span through an OpenTelemetry tracer backed by an OTLP
/// exporter. `export()` only pushes onto a bounded in-memory queue and
/// returns; a background task drains it against the tracer, so a stalled
/// collector applies backpressure to the queue, not to the correlator.
/// When the queue is full the oldest trace is dropped and counted in the
/// shared [`TraceStatus`].
pub struct OtlpExporter {
    queue: Arc<Mutex<VecDeque<Trace>>>,
    notify: Arc<Notify>,
    status: Arc<TraceStatus>,
}

impl OtlpExporter {
    pub fn new(tracer: Tracer, status: Arc<TraceStatus>) -> Self {
        let queue: Arc<Mutex<VecDeque<Trace>>> = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(Notify::new());

        let drain_queue = queue.clone();
        let drain_notify = notify.clone();
        tokio::spawn(async move {
            loop {
                drain_notify.notified().await;
                loop {
                    let next = drain_queue.lock().await.pop_front();
                    match next {
                        Some(trace) => emit_trace(&tracer, &trace),
                        None => break,
                    }
                }
            }
        });

        Self { queue, notify, status }
    }
}

#[async_trait]
impl Exporter for OtlpExporter {
    async fn export(&self, trace: &Trace) {
        let mut guard = self.queue.lock().await;
        if guard.len() >= QUEUE_CAPACITY {
            guard.pop_front();
            self.status.record_drop();
        }
        guard.push_back(trace.clone());
        drop(guard);
        self.notify.notify_one();
    }
}

fn emit_trace(tracer: &Tracer, trace: &Trace) {
    for span in &trace.spans {
        let mut builder = tracer
            .span_builder(span.operation.clone())
            .with_kind(SpanKind::Internal)
            .with_start_time(span.start_time.into());
        if let Some(end) = span.end_time {
            builder = builder.with_end_time(end.into());
        }
        if let Some(code) = &span.status_code {
            builder = builder.with_status(if code == "error" {
                Status::error(code.clone())
            } else {
                Status::Ok
            });
        }
        builder = builder.with_attributes(vec![
            KeyValue::new("agent_id", span.agent_id.clone()),
            KeyValue::new("trace_id", span.trace_id.clone()),
            KeyValue::new("span_id", span.span_id.clone()),
        ]);
        let _ = builder.start_with_context(tracer, &Context::current());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::model::SpanEvent;
    use chrono::Utc;

    fn trace_with_one_span() -> Trace {
        Trace {
            trace_id: "t1".into(),
            spans: vec![SpanEvent {
                trace_id: "t1".into(),
                span_id: "s1".into(),
                parent_span_id: None,
                agent_id: "a1".into(),
                operation: "call".into(),
                start_time: Utc::now(),
                end_time: None,
                status_code: None,
                attributes: Default::default(),
            }],
            first_seen: Some(Utc::now()),
            last_seen: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn console_exporter_does_not_panic() {
        ConsoleExporter.export(&trace_with_one_span()).await;
    }

    #[tokio::test]
    async fn json_exporter_does_not_panic() {
        JsonExporter.export(&trace_with_one_span()).await;
    }
}
