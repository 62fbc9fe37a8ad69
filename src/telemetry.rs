//! Logging setup and optional OTLP trace export for directory runs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use opentelemetry::trace::{Span, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider, SpanExporter,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_NAME: &str = "notnull-instrumenter";
const DEFAULT_LOG_FILTER: &str = "notnull_instrumenter=info,warn";
const RUN_SPAN: &str = "instrument_directory";
const FILE_SPAN: &str = "instrument_file";

// One span per class file; large trees must not drop spans.
const EXPORT_QUEUE_SIZE: usize = 65_536;
const EXPORT_BATCH_SIZE: usize = 4096;
const EXPORT_DELAY: Duration = Duration::from_millis(200);

/// OTLP tracer used for run and file spans.
pub struct Telemetry {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Export spans over OTLP/HTTP to `endpoint`.
    pub fn new(endpoint: &str) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(trace_endpoint(endpoint)?)
            .build()
            .context("build OTLP span exporter")?;
        Self::with_exporter(exporter)
    }

    fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Result<Self> {
        // The processor exports from its own thread, so rayon workers only enqueue.
        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_queue_size(EXPORT_QUEUE_SIZE)
                    .with_max_export_batch_size(EXPORT_BATCH_SIZE)
                    .with_scheduled_delay(EXPORT_DELAY)
                    .build(),
            )
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .with_span_processor(processor)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        Ok(Self {
            tracer: provider.tracer(SERVICE_NAME),
            provider,
        })
    }

    /// Flush pending spans.
    pub fn shutdown(self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|err| anyhow!("failed to shut down tracer provider: {err}"))
    }

    fn span<T>(
        &self,
        name: &'static str,
        attribute: KeyValue,
        parent: &OtelContext,
        f: impl FnOnce() -> T,
    ) -> T {
        let mut span = self.tracer.start_with_context(name, parent);
        span.set_attribute(attribute);
        let _guard = parent.with_span(span).attach();
        f()
    }
}

/// Run `f` inside the span covering a whole directory.
pub fn run_span<T>(telemetry: Option<&Telemetry>, classes_dir: &Path, f: impl FnOnce() -> T) -> T {
    match telemetry {
        Some(telemetry) => telemetry.span(
            RUN_SPAN,
            KeyValue::new("notnull.classes", classes_dir.display().to_string()),
            &OtelContext::current(),
            f,
        ),
        None => f(),
    }
}

/// Run `f` inside a span for one class file, parented to `run` from any thread.
pub(crate) fn file_span<T>(
    telemetry: Option<&Telemetry>,
    run: &OtelContext,
    path: &Path,
    f: impl FnOnce() -> T,
) -> T {
    match telemetry {
        Some(telemetry) => telemetry.span(
            FILE_SPAN,
            KeyValue::new("notnull.path", path.display().to_string()),
            run,
            f,
        ),
        None => f(),
    }
}

/// Trace id of the active span, if one is being exported.
pub fn current_trace_id() -> Option<String> {
    let cx = OtelContext::current();
    let span_context = cx.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Install the stderr subscriber, filtered by `RUST_LOG`.
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Point a bare collector URL or a logs URL at the traces path.
fn trace_endpoint(endpoint: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint).context("parse OTLP endpoint")?;
    let path = url.path().to_string();
    if path == "/" {
        url.set_path("/v1/traces");
    } else if let Some(prefix) = path.strip_suffix("/v1/logs") {
        url.set_path(&format!("{prefix}/v1/traces"));
    }
    Ok(url.to_string())
}
