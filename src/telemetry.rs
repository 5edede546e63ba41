use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use opentelemetry::trace::{Span, TraceContextExt, Tracer, TracerProvider as OtelTracerProvider};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider, SpanExporter,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::callgraph::{MethodId, Scc};

const SIGNAL_PATHS: [&str; 3] = ["/v1/traces", "/v1/logs", "/v1/metrics"];

/// Span export for one analysis run.
pub(crate) struct Telemetry {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    /// Export spans to the OTLP/HTTP collector at `endpoint`.
    pub(crate) fn connect(endpoint: &str) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(traces_endpoint(endpoint)?)
            .build()
            .context("build OTLP span exporter")?;
        Ok(Self::with_exporter(exporter))
    }

    /// Span nested under whatever span is active on the calling thread.
    pub(crate) fn span<T, F>(&self, name: &str, attributes: &[KeyValue], f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.span_under(&OtelContext::current(), name, attributes, f)
    }

    /// Span nested under `parent`. Rayon workers start without the
    /// submitting thread's context, so wave members pass it explicitly.
    pub(crate) fn span_under<T, F>(
        &self,
        parent: &OtelContext,
        name: &str,
        attributes: &[KeyValue],
        f: F,
    ) -> T
    where
        F: FnOnce() -> T,
    {
        let mut span = self.tracer.start_with_context(name.to_string(), parent);
        span.set_attributes(attributes.iter().cloned());
        let _active = parent.with_span(span).attach();
        f()
    }

    pub(crate) fn shutdown(&self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|error| anyhow!("failed to shut down span export: {error}"))
    }

    fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Self {
        // Large queue: one span per SCC per checker on big programs.
        let batch = BatchConfigBuilder::default()
            .with_max_queue_size(65_536)
            .with_max_export_batch_size(4096)
            .with_scheduled_delay(Duration::from_millis(200))
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name("summa").build())
            .with_span_processor(
                BatchSpanProcessor::builder(exporter)
                    .with_batch_config(batch)
                    .build(),
            )
            .build();
        let tracer = provider.tracer("summa");
        opentelemetry::global::set_tracer_provider(provider.clone());
        Self { tracer, provider }
    }
}

/// Collector URL with the traces signal path. A bare base URL gets
/// `/v1/traces` appended; another signal's path is swapped for it.
fn traces_endpoint(endpoint: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint).context("parse OTLP endpoint")?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("OTLP endpoint must be http or https: {endpoint}");
    }
    let path = url.path().trim_end_matches('/').to_string();
    let base = SIGNAL_PATHS
        .iter()
        .find_map(|signal| path.strip_suffix(signal))
        .unwrap_or(&path);
    url.set_path(&format!("{base}/v1/traces"));
    Ok(url.to_string())
}

/// Log to stderr. `RUST_LOG` wins over the default filter; `quiet` keeps warnings only.
pub(crate) fn init_logging(quiet: bool) {
    let fallback = if quiet { "warn" } else { "summa=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

pub(crate) fn with_span<T, F>(
    telemetry: Option<&Telemetry>,
    name: &str,
    attributes: &[KeyValue],
    f: F,
) -> T
where
    F: FnOnce() -> T,
{
    match telemetry {
        Some(telemetry) => telemetry.span(name, attributes, f),
        None => f(),
    }
}

/// Attach an event to the span active on this thread, if any.
pub(crate) fn record_event(name: &'static str, attributes: Vec<KeyValue>) {
    let cx = OtelContext::current();
    let span = cx.span();
    if span.span_context().is_valid() {
        span.add_event(name, attributes);
    }
}

pub(crate) fn active_trace_id() -> Option<String> {
    let cx = OtelContext::current();
    let span_context = cx.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

pub(crate) fn method_attribute(method: &MethodId) -> KeyValue {
    KeyValue::new("summa.method", method.to_string())
}

/// Attributes of an `scc` span: the checker, the first member, and the shape of the cycle.
pub(crate) fn scc_attributes(checker: &'static str, scc: &Scc) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new("summa.checker", checker),
        KeyValue::new("summa.scc.size", scc.members.len() as i64),
        KeyValue::new("summa.scc.recursive", scc.recursive),
    ];
    attributes.extend(scc.members.first().map(method_attribute));
    attributes
}
