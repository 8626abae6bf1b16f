//! Logging and metrics export for the per-node daemon
//!
//! Logs are JSON lines filtered by `RUST_LOG`. The drift and reconcile
//! instruments in [`crate::metrics`] are pushed over OTLP when
//! `OTEL_EXPORTER_OTLP_ENDPOINT` is set; without it they record into the
//! global no-op meter.
//!
//! One instance runs per node, so every export is tagged with the node name
//! (`NODE_NAME` from the downward API) and the routing table it manages.

use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE: &str = "vm-route-forge";

/// Default log filter when `RUST_LOG` is unset
const DEFAULT_LOG_FILTER: &str =
    "info,vm_route_forge=debug,route_forge_controller=debug,route_forge_netlink=debug,kube=info";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The OTLP metrics exporter could not be built
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Where and how this node's daemon reports
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// OTLP collector endpoint; metrics stay local when unset
    pub otlp_endpoint: Option<String>,
    /// Node this instance programs routes on
    pub node_name: Option<String>,
    /// Managed routing table id
    pub route_table_id: u32,
    /// Mutations are logged instead of applied
    pub dry_run: bool,
}

impl TelemetryConfig {
    /// Read endpoint and node name from the pod environment
    pub fn from_env(route_table_id: u32, dry_run: bool) -> Self {
        Self {
            otlp_endpoint: non_empty_env("OTEL_EXPORTER_OTLP_ENDPOINT"),
            node_name: non_empty_env("NODE_NAME"),
            route_table_id,
            dry_run,
        }
    }

    fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, SERVICE),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
            KeyValue::new("route_forge.table_id", i64::from(self.route_table_id)),
            KeyValue::new("route_forge.dry_run", self.dry_run),
        ];
        if let Some(node) = &self.node_name {
            attributes.push(KeyValue::new("k8s.node.name", node.clone()));
        }
        Resource::new(attributes)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Install the JSON log subscriber and, if configured, the OTLP meter
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if let Some(endpoint) = &config.otlp_endpoint {
        init_otlp_metrics(endpoint, config.resource())?;
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<(), TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let provider = SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}
