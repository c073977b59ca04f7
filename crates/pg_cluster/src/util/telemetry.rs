use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> opentelemetry::trace::TraceId {
    use opentelemetry::trace::TraceContextExt as _;
    use tracing_opentelemetry::OpenTelemetrySpanExt as _;
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}

/// Initialize tracing. `LOG_FORMAT=json` switches the fmt layer to
/// structured output for log shipping; anything else stays human readable.
pub async fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .or(EnvFilter::try_new("info"))
        .unwrap();

    let collector = Registry::default().with(env_filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        collector.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        collector.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}
