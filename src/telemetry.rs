use std::error::Error;

use opentelemetry::{Context, KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    error::OTelSdkResult, propagation::TraceContextPropagator, resource::Resource,
    trace::SdkTracerProvider,
};
use tonic::codegen::http::HeaderMap;
use tonic::metadata::{Ascii, KeyRef, MetadataKey, MetadataMap, MetadataValue};
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_OTLP_ENDPOINT: &str = "http://127.0.0.1:4317";

/// Keeps the tracer provider alive; flushes and shuts it down on drop.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    pub fn shutdown(mut self) -> OTelSdkResult {
        match self.provider.take() {
            Some(provider) => provider.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(err) = provider.shutdown() {
                tracing::error!(?err, "failed to shutdown tracer provider");
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber: an `EnvFilter` (default `info`), a fmt
/// layer and, unless [`tracing_disabled`], an OTLP span exporter.
///
/// `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME` and
/// `OTEL_SERVICE_INSTANCE_ID` override the collector endpoint, the service
/// name and the instance id.
pub fn init_tracing(
    default_service_name: &str,
    default_instance: Option<String>,
) -> Result<TelemetryGuard, Box<dyn Error>> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);
    if tracing_disabled() {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(fmt_layer)
            .try_init()?;
        return Ok(TelemetryGuard { provider: None });
    }

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());
    let service_name =
        std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| default_service_name.to_string());
    let instance = std::env::var("OTEL_SERVICE_INSTANCE_ID")
        .ok()
        .or(default_instance);

    global::set_text_map_propagator(TraceContextPropagator::new());

    let mut resource = Resource::builder().with_service_name(service_name);
    if let Some(instance) = instance {
        resource = resource.with_attribute(KeyValue::new("service.instance.id", instance));
    }
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;
    let provider = SdkTracerProvider::builder()
        .with_resource(resource.build())
        .with_batch_exporter(exporter)
        .build();

    let tracer = provider.tracer(default_service_name.to_owned());
    let _ = global::set_tracer_provider(provider.clone());

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(TelemetryGuard {
        provider: Some(provider),
    })
}

/// Make the current span a child of the trace carried by an incoming call.
pub fn adopt_remote_parent(metadata: &MetadataMap) {
    let parent = global::get_text_map_propagator(|prop| prop.extract(&MetadataExtractor(metadata)));
    Span::current().set_parent(parent);
}

/// Remote context carried by raw HTTP headers, for the server trace layer.
pub fn extract_remote_context_from_headers(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|prop| prop.extract(&HeaderExtractor(headers)))
}

/// Write the current span's context into outgoing gRPC metadata.
pub fn inject_context(metadata: &mut MetadataMap) {
    global::get_text_map_propagator(|prop| {
        let context = Span::current().context();
        prop.inject_context(&context, &mut MetadataInjector(metadata));
    });
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl opentelemetry::propagation::Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

struct MetadataExtractor<'a>(&'a MetadataMap);

impl opentelemetry::propagation::Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

struct MetadataInjector<'a>(&'a mut MetadataMap);

impl opentelemetry::propagation::Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let (Ok(key), Ok(value)) = (
            key.parse::<MetadataKey<Ascii>>(),
            MetadataValue::<Ascii>::try_from(value.as_str()),
        ) else {
            return;
        };
        self.0.insert(key, value);
    }
}

/// True when `PATHSTORE_DISABLE_TRACING` asks for local logging only.
pub fn tracing_disabled() -> bool {
    std::env::var("PATHSTORE_DISABLE_TRACING")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
