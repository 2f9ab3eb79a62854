//! Structured logging and distributed tracing bootstrap.
//!
//! Builds the `tracing-subscriber` stack from the `logging` config section
//! (level, json/console format, stdout/stderr/file sink) and, when tracing is
//! enabled, attaches an OpenTelemetry layer exporting over OTLP/gRPC with
//! W3C TraceContext + Baggage propagation. The helpers at the bottom carry
//! trace context across the proxy boundary in both directions.
use std::sync::Arc;

use eyre::{Result, WrapErr};
use http::HeaderMap;
use once_cell::sync::OnceCell;
use opentelemetry::{
    global, propagation::TextMapCompositePropagator, trace::TracerProvider as _, Context, KeyValue,
};
use opentelemetry_http::{HeaderExtractor, HeaderInjector};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::{BaggagePropagator, TraceContextPropagator},
    trace as sdktrace, Resource,
};
use tracing_subscriber::{
    fmt::writer::BoxMakeWriter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::config::models::{LoggingConfig, TracingConfig};

/// Spans are exported in small batches at a short interval so traces show up
/// promptly on low-traffic gateways.
const EXPORT_BATCH_SIZE: usize = 10;
const EXPORT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

static TRACER_PROVIDER: OnceCell<sdktrace::TracerProvider> = OnceCell::new();

/// Initialize logging and (optionally) the OTLP trace pipeline. Must be
/// called once, before any request is served.
pub fn init_tracing(logging: &LoggingConfig, tracing_cfg: &TracingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .wrap_err_with(|| format!("Invalid log level: {}", logging.level))?;

    let writer = make_writer(&logging.output_path)?;

    let tracer = if tracing_cfg.enable {
        let provider = build_tracer_provider(tracing_cfg)?;
        let tracer = provider.tracer("passage");
        let _ = TRACER_PROVIDER.set(provider);
        Some(tracer)
    } else {
        None
    };

    if logging.format == "console" {
        Registry::default()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(writer)
                    .with_target(true),
            )
            .with(tracer.clone().map(|t| tracing_opentelemetry::layer().with_tracer(t)))
            .init();
    } else {
        Registry::default()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(false)
                    .with_span_list(true)
                    .with_target(true),
            )
            .with(tracer.clone().map(|t| tracing_opentelemetry::layer().with_tracer(t)))
            .init();
    }

    tracing::info!(
        level = %logging.level,
        format = %logging.format,
        tracing_enabled = tracing_cfg.enable,
        "logging initialized"
    );
    Ok(())
}

fn make_writer(output_path: &str) -> Result<BoxMakeWriter> {
    Ok(match output_path {
        "stdout" | "" => BoxMakeWriter::new(std::io::stdout),
        "stderr" => BoxMakeWriter::new(std::io::stderr),
        path => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .wrap_err_with(|| format!("Failed to open log file {path}"))?;
            BoxMakeWriter::new(Arc::new(file))
        }
    })
}

fn build_tracer_provider(cfg: &TracingConfig) -> Result<sdktrace::TracerProvider> {
    let endpoint = if cfg.jaeger_endpoint.starts_with("http://")
        || cfg.jaeger_endpoint.starts_with("https://")
    {
        cfg.jaeger_endpoint.clone()
    } else {
        format!("http://{}", cfg.jaeger_endpoint)
    };

    tracing::info!(endpoint = %endpoint, service = %cfg.service_name, "initializing OTLP gRPC exporter");

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .wrap_err("Failed to create OTLP gRPC exporter")?;

    let batch_config = sdktrace::BatchConfigBuilder::default()
        .with_max_export_batch_size(EXPORT_BATCH_SIZE)
        .with_scheduled_delay(EXPORT_INTERVAL)
        .build();
    let processor =
        sdktrace::BatchSpanProcessor::builder(exporter, opentelemetry_sdk::runtime::Tokio)
            .with_batch_config(batch_config)
            .build();

    let provider = sdktrace::TracerProvider::builder()
        .with_span_processor(processor)
        .with_resource(Resource::new([KeyValue::new(
            "service.name",
            cfg.service_name.clone(),
        )]))
        .build();

    global::set_tracer_provider(provider.clone());
    global::set_text_map_propagator(
        TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]),
    );

    Ok(provider)
}

/// Flush and shut down the tracer pipeline. Best-effort: export failures are
/// logged, not propagated.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "tracer shutdown reported an error");
        }
    }
}

/// Extract the remote parent context (W3C `traceparent`/`tracestate` +
/// `baggage`) from inbound request headers.
pub fn extract_remote_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Inject a context into outbound headers using the global propagator.
pub fn inject_context(cx: &Context, headers: &mut HeaderMap) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(cx, &mut HeaderInjector(headers))
    });
}

/// Inject the context of the currently active span into outbound headers.
pub fn inject_current_context(headers: &mut HeaderMap) {
    use tracing_opentelemetry::OpenTelemetrySpanExt;
    let cx = tracing::Span::current().context();
    inject_context(&cx, headers);
}
