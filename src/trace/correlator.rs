//! In-memory trace correlator.
//!
//! Owned by a single task: spans arrive from the consumer over an mpsc
//! channel, get grouped by `trace_id`, and are handed to the configured
//! exporter once a trace is judged complete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::trace::exporter::Exporter;
use crate::trace::model::{SpanEvent, Trace};
use crate::trace::status::TraceStatus;

/// A trace with no new spans for this long, and whose root has been
/// seen, is flushed even if some announced parent never showed up.
const QUIET_PERIOD: Duration = Duration::from_secs(5);
/// Hard cap: a trace open this long is flushed regardless of completeness,
/// so a lost span can never pin memory indefinitely.
const MAX_TRACE_AGE: Duration = Duration::from_secs(60);
/// Sweep cadence for quiet-period/max-age checks.
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

pub struct Correlator {
    traces: HashMap<String, Trace>,
    seen_spans: HashSet<(String, String)>,
    exporter: Box<dyn Exporter>,
    status: Arc<TraceStatus>,
}

impl Correlator {
    pub fn new(exporter: Box<dyn Exporter>, status: Arc<TraceStatus>) -> Self {
        Self {
            traces: HashMap::new(),
            seen_spans: HashSet::new(),
            exporter,
            status,
        }
    }

    /// Ingest one span, deduping by `(trace_id, span_id)`. Returns `true`
    /// if this updated an existing trace's `last_seen` with new data.
    pub fn ingest(&mut self, span: SpanEvent, now: DateTime<Utc>) -> bool {
        let key = span.dedup_key();
        if !self.seen_spans.insert(key) {
            return false;
        }
        let trace = self.traces.entry(span.trace_id.clone()).or_insert_with(|| Trace {
            trace_id: span.trace_id.clone(),
            spans: Vec::new(),
            first_seen: Some(now),
            last_seen: Some(now),
        });
        trace.last_seen = Some(now);
        trace.spans.push(span);
        true
    }

    /// Flush every trace that is both structurally complete and past its
    /// quiet period, or past its max age regardless of completeness,
    /// exporting each and dropping it from memory.
    ///
    /// Completeness alone doesn't flush: a late child span can still
    /// arrive referencing an already-"complete" parent chain, so export
    /// waits for the quiet period to elapse too.
    pub async fn sweep(&mut self, now: DateTime<Utc>) {
        let mut ready = Vec::new();
        self.traces.retain(|_, trace| {
            let quiet = trace
                .last_seen
                .map(|t| now - t >= chrono::Duration::from_std(QUIET_PERIOD).unwrap())
                .unwrap_or(false);
            let expired = trace
                .first_seen
                .map(|t| now - t >= chrono::Duration::from_std(MAX_TRACE_AGE).unwrap())
                .unwrap_or(false);
            let complete = trace.is_structurally_complete();

            if (complete && quiet) || expired {
                ready.push(trace.clone());
                false
            } else {
                true
            }
        });

        self.status.set_active_traces(self.traces.len());

        for trace in ready {
            self.exporter.export(&trace).await;
            self.status.record_export();
        }
    }

    pub fn open_trace_count(&self) -> usize {
        self.traces.len()
    }
}

/// Drive a correlator from an inbound span channel until `shutdown` fires.
pub async fn run(mut correlator: Correlator, mut spans: mpsc::Receiver<SpanEvent>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                correlator.sweep(Utc::now()).await;
                tracing::info!("trace correlator shutting down");
                return;
            }
            maybe_span = spans.recv() => {
                match maybe_span {
                    Some(span) => { correlator.ingest(span, Utc::now()); }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                correlator.sweep(Utc::now()).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::exporter::NullExporter;

    fn span(trace_id: &str, span_id: &str, parent: Option<&str>) -> SpanEvent {
        SpanEvent {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: parent.map(|s| s.to_string()),
            agent_id: "a1".to_string(),
            operation: "call".to_string(),
            start_time: Utc::now(),
            end_time: None,
            status_code: None,
            attributes: Default::default(),
        }
    }

    #[test]
    fn duplicate_span_is_ignored() {
        let mut correlator = Correlator::new(Box::new(NullExporter), TraceStatus::new());
        let now = Utc::now();
        assert!(correlator.ingest(span("t1", "s1", None), now));
        assert!(!correlator.ingest(span("t1", "s1", None), now));
    }

    #[tokio::test]
    async fn structurally_complete_trace_waits_out_the_quiet_period() {
        let mut correlator = Correlator::new(Box::new(NullExporter), TraceStatus::new());
        let now = Utc::now();
        correlator.ingest(span("t1", "root", None), now);
        correlator.ingest(span("t1", "child", Some("root")), now);

        correlator.sweep(now).await;
        assert_eq!(correlator.open_trace_count(), 1, "complete but still within the quiet period");

        let after_quiet_period = now + chrono::Duration::seconds(6);
        correlator.sweep(after_quiet_period).await;
        assert_eq!(correlator.open_trace_count(), 0, "complete and quiet, must flush");
    }

    #[tokio::test]
    async fn incomplete_trace_stays_open_until_quiet_period_or_max_age() {
        let mut correlator = Correlator::new(Box::new(NullExporter), TraceStatus::new());
        let now = Utc::now();
        correlator.ingest(span("t1", "child", Some("missing-root")), now);
        correlator.sweep(now).await;
        assert_eq!(correlator.open_trace_count(), 1, "no root yet, should not flush");

        let later = now + chrono::Duration::seconds(70);
        correlator.sweep(later).await;
        assert_eq!(correlator.open_trace_count(), 0, "max age should force a flush");
    }
}
