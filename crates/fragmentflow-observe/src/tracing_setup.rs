//! Process-wide logging for the orchestrator.
//!
//! Executor, fragment and provider code log through `tracing` with
//! `execution_id`, `node_id` and `provider` fields; this module decides where
//! those events go. Human-readable lines are the default, JSON lines suit log
//! shippers, and spans can additionally be exported through OpenTelemetry.
//!
//! ```no_run
//! use fragmentflow_observe::tracing_setup::{LogOptions, init_tracing};
//!
//! init_tracing(&LogOptions { json: true, ..Default::default() }).unwrap();
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use std::sync::OnceLock;

/// Directives applied when `RUST_LOG` is unset. sqlx logs every statement
/// at info, so it is held to warnings.
pub const DEFAULT_FILTER: &str = "info,fragmentflow_core=info,sqlx=warn";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Emit one JSON object per event instead of formatted text.
    pub json: bool,
    /// Also export spans to stdout through OpenTelemetry.
    pub otel: bool,
    /// Filter directives overriding [`DEFAULT_FILTER`]. `RUST_LOG` still wins.
    pub filter: Option<String>,
}

impl LogOptions {
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(self.filter.as_deref().unwrap_or(DEFAULT_FILTER))
        })
    }
}

/// Install the global subscriber. Node spans report their duration on close.
///
/// Fails if a subscriber is already installed, so embedding applications
/// that set up their own keep it.
pub fn init_tracing(options: &LogOptions) -> Result<(), Box<dyn std::error::Error>> {
    let text_layer = (!options.json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_span_events(FmtSpan::CLOSE)
    });
    let json_layer = options.json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
    });

    let provider = options.otel.then(|| {
        SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build()
    });
    let otel_layer = provider.as_ref().map(|p| {
        tracing_opentelemetry::layer().with_tracer(p.tracer("fragmentflow"))
    });

    tracing_subscriber::registry()
        .with(options.env_filter())
        .with(text_layer)
        .with(json_layer)
        .with(otel_layer)
        .try_init()?;

    if let Some(provider) = provider {
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);
    }
    Ok(())
}

/// Flush exported spans before the process exits. Does nothing without OTel.
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("tracer provider shutdown failed: {e}");
        }
    }
}
