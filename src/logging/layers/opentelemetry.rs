use crate::logging::config::OpenTelemetryConfig;
use crate::logging::layers::BoxLayer;
use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use std::path::Path;
use tracing::Subscriber;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::registry::LookupSpan;
use url::Url;

/// Owns the tracer provider; pending spans are flushed on drop.
pub struct OtlpGuard {
    provider: SdkTracerProvider,
}

impl Drop for OtlpGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("warning: failed to flush OpenTelemetry spans: {}", err);
        }
    }
}

/// Export `task` spans (job id, run id and task kind as attributes) to the
/// OTLP collector at `endpoint`.
pub fn otlp_layer<S>(
    endpoint: &Url,
    config: &OpenTelemetryConfig,
    workspace_root: Option<&Path>,
) -> Result<(BoxLayer<S>, OtlpGuard)>
where
    S: Subscriber + for<'span> LookupSpan<'span> + Send + Sync + 'static,
{
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.as_str())
        .build()
        .context("failed to build OTLP span exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_resource(resource(config, workspace_root))
        .with_sampler(sampler(config.sample_ratio))
        .with_batch_exporter(exporter)
        .build();
    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

    Ok((
        Box::new(OpenTelemetryLayer::new(tracer)),
        OtlpGuard { provider },
    ))
}

fn resource(config: &OpenTelemetryConfig, workspace_root: Option<&Path>) -> Resource {
    let mut attributes = vec![KeyValue::new("service.version", crate::VERSION)];
    if let Some(workspace) = workspace_root {
        attributes.push(KeyValue::new(
            "jobflow.workspace",
            workspace.display().to_string(),
        ));
    }
    Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes(attributes)
        .build()
}

/// Runs are sampled whole: child spans follow the decision of their root.
fn sampler(ratio: f64) -> Sampler {
    if ratio >= 1.0 {
        Sampler::ParentBased(Box::new(Sampler::AlwaysOn))
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
    }
}
