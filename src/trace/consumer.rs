//! Redis stream consumer for the `mesh:trace` stream published by agent
//! SDK runtimes (mirrors the publisher in the agent-side `tracing_publish`
//! component this registry talks to).

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::trace::model::SpanEvent;
use crate::trace::status::TraceStatus;

const CONSUMER_NAME: &str = "mcp-mesh-registry";
const BLOCK_MS: usize = 2000;
const BATCH_SIZE: usize = 50;

pub struct ConsumerConfig {
    pub stream_name: String,
    pub consumer_group: String,
}

/// Ensure the consumer group exists, creating the stream if needed.
async fn ensure_group(conn: &mut ConnectionManager, config: &ConsumerConfig) -> RedisResult<()> {
    let result: RedisResult<()> = conn
        .xgroup_create_mkstream(&config.stream_name, &config.consumer_group, "0")
        .await;
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
        Err(err) => Err(err),
    }
}

/// Read `mesh:trace` via the consumer group, forwarding decoded spans to
/// `tx` and acking each entry once enqueued. `tx` is bounded, so a slow
/// correlator applies backpressure to the read loop rather than to Redis.
pub async fn run(
    mut conn: ConnectionManager,
    config: ConsumerConfig,
    tx: mpsc::Sender<SpanEvent>,
    shutdown: CancellationToken,
    status: Arc<TraceStatus>,
) {
    if let Err(err) = ensure_group(&mut conn, &config).await {
        tracing::error!(error = %err, "failed to create trace consumer group");
        status.record_error(format!("failed to create consumer group: {err}")).await;
        return;
    }
    status.set_consumer_connected(true);

    let options = StreamReadOptions::default()
        .group(&config.consumer_group, CONSUMER_NAME)
        .count(BATCH_SIZE)
        .block(BLOCK_MS);

    loop {
        if shutdown.is_cancelled() {
            tracing::info!("trace consumer shutting down");
            status.set_consumer_connected(false);
            return;
        }

        let reply: RedisResult<StreamReadReply> = conn.xread_options(&[&config.stream_name], &[">"], &options).await;

        match reply {
            Ok(reply) => {
                status.set_consumer_connected(true);
                for stream_key in reply.keys {
                    for entry in stream_key.ids {
                        match decode_span(&entry.map) {
                            Ok(span) => {
                                if tx.send(span).await.is_err() {
                                    status.set_consumer_connected(false);
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, entry_id = %entry.id, "dropping malformed trace entry");
                            }
                        }
                        let _: RedisResult<i32> = conn.xack(&config.stream_name, &config.consumer_group, &[&entry.id]).await;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "trace stream read failed, retrying");
                status.set_consumer_connected(false);
                status.record_error(err.to_string()).await;
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            }
        }
    }
}

fn decode_span(fields: &std::collections::HashMap<String, redis::Value>) -> Result<SpanEvent, String> {
    let payload = fields
        .get("payload")
        .ok_or_else(|| "missing 'payload' field".to_string())?;
    let raw: String = match payload {
        redis::Value::Data(bytes) => String::from_utf8_lossy(bytes).to_string(),
        redis::Value::Status(s) => s.clone(),
        other => return Err(format!("unexpected payload type: {other:?}")),
    };
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_span_rejects_missing_payload() {
        let fields = std::collections::HashMap::new();
        assert!(decode_span(&fields).is_err());
    }

    #[test]
    fn decode_span_parses_json_payload() {
        let mut fields = std::collections::HashMap::new();
        let json = serde_json::json!({
            "trace_id": "t1",
            "span_id": "s1",
            "agent_id": "a1",
            "operation": "call",
            "start_time": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        fields.insert("payload".to_string(), redis::Value::Data(json.into_bytes()));
        let span = decode_span(&fields).unwrap();
        assert_eq!(span.trace_id, "t1");
        assert_eq!(span.span_id, "s1");
    }
}
