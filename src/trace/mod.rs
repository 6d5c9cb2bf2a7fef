//! Distributed trace correlation pipeline: consume spans from the
//! `mesh:trace` Redis stream, correlate by `trace_id`, export completed
//! traces.

pub mod consumer;
pub mod correlator;
pub mod exporter;
pub mod model;
pub mod status;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{RegistryConfig, TraceExporterKind};
use status::TraceStatus;

const SPAN_CHANNEL_CAPACITY: usize = 1024;

/// Build the configured exporter and spawn the consumer + correlator
/// tasks. Returns immediately; the tasks run until `shutdown` fires. The
/// returned [`TraceStatus`] is updated by those tasks and can be polled
/// at any time, including when tracing is disabled (a zeroed snapshot).
pub async fn spawn(config: &RegistryConfig, shutdown: CancellationToken) -> anyhow::Result<Arc<TraceStatus>> {
    let status = TraceStatus::new();

    if !config.tracing_enabled {
        tracing::info!("distributed tracing disabled, trace pipeline not started");
        return Ok(status);
    }

    let exporter: Box<dyn exporter::Exporter> = match config.trace_exporter {
        TraceExporterKind::Console => Box::new(exporter::ConsoleExporter),
        TraceExporterKind::Json => Box::new(exporter::JsonExporter),
        TraceExporterKind::Otlp => {
            let endpoint = config
                .telemetry_endpoint
                .clone()
                .unwrap_or_else(|| "http://localhost:4317".to_string());
            let tracer = build_otlp_tracer(&endpoint)?;
            Box::new(exporter::OtlpExporter::new(tracer, status.clone()))
        }
    };

    let client = redis::Client::open(config.redis_url.clone())?;
    let conn = redis::aio::ConnectionManager::new(client).await?;

    let (tx, rx) = mpsc::channel(SPAN_CHANNEL_CAPACITY);
    let correlator = correlator::Correlator::new(exporter, status.clone());

    let consumer_config = consumer::ConsumerConfig {
        stream_name: config.stream_name.clone(),
        consumer_group: config.consumer_group.clone(),
    };

    let consumer_shutdown = shutdown.clone();
    let consumer_status = status.clone();
    tokio::spawn(consumer::run(conn, consumer_config, tx, consumer_shutdown, consumer_status));
    tokio::spawn(correlator::run(correlator, rx, shutdown));

    Ok(status)
}

fn build_otlp_tracer(endpoint: &str) -> anyhow::Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_otlp::WithExportConfig;

    let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint);

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(exporter)
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(
            opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                "service.name",
                "mcp-mesh-registry",
            )]),
        ))
        .install_batch(opentelemetry_sdk::runtime::Tokio)?;

    Ok(tracer)
}
