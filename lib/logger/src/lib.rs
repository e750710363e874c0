//! Tracing setup for the control plane. Builds one subscriber out
//! of three pieces: a target filter that keeps http internals quiet
//! on normal runs, an optional stdio layer (standard / pretty /
//! json), and an optional OTLP export layer.

use std::time::Duration;

use anyhow::Context;
use opentelemetry::{KeyValue, global, trace::TracerProvider};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Sampler, Tracer};
use opentelemetry_semantic_conventions::resource::SERVICE_VERSION;
use stevedore_client::entities::logger::{
  LogConfig, LogLevel, StdioLogMode,
};
use tracing::level_filters::LevelFilter;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{
  Layer, Registry, filter::Targets, fmt, layer::SubscriberExt,
  util::SubscriberInitExt,
};

/// Transport dependencies that log every request and handshake at
/// info. On normal runs they only get to surface warnings; debug and
/// trace runs see all of it.
const NOISY_TARGETS: &[&str] = &[
  "hyper",
  "h2",
  "reqwest",
  "rustls",
  "tungstenite",
  "bollard",
];

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let stdio = match (config.stdio, config.pretty) {
    (StdioLogMode::None, _) => None,
    (StdioLogMode::Json, _) => Some(fmt::layer().json().boxed()),
    (StdioLogMode::Standard, true) => Some(
      fmt::layer()
        .pretty()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
    (StdioLogMode::Standard, false) => Some(
      fmt::layer()
        .with_file(false)
        .with_line_number(false)
        .boxed(),
    ),
  };

  let otel = if config.otlp_endpoint.is_empty() {
    None
  } else {
    Some(OpenTelemetryLayer::new(tracer(
      &config.otlp_endpoint,
      config.opentelemetry_service_name.clone(),
    )?))
  };

  Registry::default()
    .with(base_filter(config.level))
    .with(otel)
    .with(stdio)
    .try_init()
    .context("failed to init logger")
}

fn base_filter(level: LogLevel) -> Targets {
  let tracing_level: tracing::Level = level.into();
  let mut filter =
    Targets::new().with_default(LevelFilter::from(tracing_level));
  if !matches!(level, LogLevel::Trace | LogLevel::Debug) {
    for target in NOISY_TARGETS {
      filter = filter.with_target(*target, LevelFilter::WARN);
    }
  }
  filter
}

fn tracer(
  endpoint: &str,
  service_name: String,
) -> anyhow::Result<Tracer> {
  let exporter = opentelemetry_otlp::SpanExporter::builder()
    .with_http()
    .with_endpoint(endpoint)
    .with_timeout(Duration::from_secs(3))
    .build()
    .context("failed to build otlp span exporter")?;
  let provider =
    opentelemetry_sdk::trace::TracerProviderBuilder::default()
      .with_resource(
        opentelemetry_sdk::Resource::builder()
          .with_service_name(service_name.clone())
          .with_attribute(KeyValue::new(
            SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
          ))
          .build(),
      )
      .with_sampler(Sampler::AlwaysOn)
      .with_batch_exporter(exporter)
      .build();
  global::set_tracer_provider(provider.clone());
  Ok(provider.tracer(service_name))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn http_internals_quieted_on_normal_runs() {
    let filter = base_filter(LogLevel::Info);
    assert!(!filter.would_enable("hyper", &tracing::Level::INFO));
    assert!(filter.would_enable("hyper", &tracing::Level::WARN));
    assert!(filter.would_enable(
      "stevedore_core::compose",
      &tracing::Level::INFO
    ));
  }

  #[test]
  fn debug_runs_see_everything() {
    let filter = base_filter(LogLevel::Debug);
    assert!(
      filter.would_enable("hyper", &tracing::Level::DEBUG)
    );
    assert!(
      filter.would_enable("bollard", &tracing::Level::DEBUG)
    );
  }

  #[test]
  fn default_level_still_caps_app_targets() {
    let filter = base_filter(LogLevel::Error);
    assert!(
      !filter.would_enable("stevedore_core", &tracing::Level::WARN)
    );
    assert!(
      filter.would_enable("stevedore_core", &tracing::Level::ERROR)
    );
  }
}
