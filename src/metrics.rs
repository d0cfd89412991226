use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AuthLabels {
    pub outcome: AuthOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AuthOutcome {
    Accepted,
    UnknownLogin,
    UnknownKey,
    KeyMismatch,
    StoreError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabels {
    pub verb: String,
    pub outcome: DispatchOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum DispatchOutcome {
    Success,
    SyntaxError,
    PermissionDenied,
    NotFound,
    ExecutionFailure,
    Timeout,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the gateway.
pub struct Metrics {
    // -- auth --
    pub auth_attempts: Family<AuthLabels, Counter>,

    // -- dispatch --
    pub dispatch_total: Family<DispatchLabels, Counter>,
    pub dispatch_duration_seconds: Histogram,
    pub repos_created: Counter,

    // -- gauges --
    pub active_connections: Gauge,
    pub active_channels: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let auth_attempts = Family::<AuthLabels, Counter>::default();
        registry.register(
            "gitgate_auth_attempts",
            "Public-key authentication attempts by outcome",
            auth_attempts.clone(),
        );

        let dispatch_total = Family::<DispatchLabels, Counter>::default();
        registry.register(
            "gitgate_dispatch",
            "Dispatched commands by verb and outcome",
            dispatch_total.clone(),
        );

        let dispatch_duration_seconds = Histogram::new(exponential_buckets(0.005, 2.0, 16));
        registry.register(
            "gitgate_dispatch_duration_seconds",
            "Wall time of dispatched commands in seconds",
            dispatch_duration_seconds.clone(),
        );

        let repos_created = Counter::default();
        registry.register(
            "gitgate_repos_created",
            "Repositories created through the gateway",
            repos_created.clone(),
        );

        let active_connections: Gauge = Gauge::default();
        registry.register(
            "gitgate_active_connections",
            "Currently open SSH connections",
            active_connections.clone(),
        );

        let active_channels: Gauge = Gauge::default();
        registry.register(
            "gitgate_active_channels",
            "Exec channels currently dispatching",
            active_channels.clone(),
        );

        Self {
            auth_attempts,
            dispatch_total,
            dispatch_duration_seconds,
            repos_created,
            active_connections,
            active_channels,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by every subsystem.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the OpenMetrics text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut body = String::new();
        prometheus_client::encoding::text::encode(&mut body, &self.registry)?;
        Ok(body)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
