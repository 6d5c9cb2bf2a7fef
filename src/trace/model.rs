//! Span and trace types shared by the consumer, correlator, and exporters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One span event as published to the `mesh:trace` Redis stream by an
/// agent's SDK runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    pub agent_id: String,
    pub operation: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl SpanEvent {
    pub fn dedup_key(&self) -> (String, String) {
        (self.trace_id.clone(), self.span_id.clone())
    }

    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_none()
    }
}

/// An in-progress or completed correlation of spans sharing a `trace_id`.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub trace_id: String,
    pub spans: Vec<SpanEvent>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Trace {
    pub fn has_root(&self) -> bool {
        self.spans.iter().any(SpanEvent::is_root)
    }

    /// A trace is structurally complete once its root span exists and
    /// every non-root span's parent is present among the collected spans.
    pub fn is_structurally_complete(&self) -> bool {
        if !self.has_root() {
            return false;
        }
        let span_ids: std::collections::HashSet<&str> = self.spans.iter().map(|s| s.span_id.as_str()).collect();
        self.spans
            .iter()
            .filter_map(|s| s.parent_span_id.as_deref())
            .all(|parent| span_ids.contains(parent))
    }
}
