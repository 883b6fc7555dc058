use std::sync::LazyLock;

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, register_int_gauge_with_registry,
};
use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Registry as PrometheusRegistry,
    TextEncoder,
};
use tracing::error;

use crate::command::server::error::Error;

pub static AUTH_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "auth_attempts_total",
        "Total number of authentication attempts per identity provider",
        &["provider", "result"],
        &METRICS_PROVIDER.registry
    )
    .expect("Failed to register auth_attempts metric")
});

pub static METRICS_PROVIDER: LazyLock<MetricsProvider> =
    LazyLock::new(|| MetricsProvider::new().expect("Unable to create metrics provider"));

pub const TOKEN_REVIEWS_HANDLER: &str = "tokenreviews";

pub struct MetricsProvider {
    registry: PrometheusRegistry,
    pub metric_http_request_in_flight: IntGauge,
    pub metric_http_request_total: IntCounterVec,
    pub metric_http_request_duration: HistogramVec,
    pub metric_http_response_size: HistogramVec,
    pub metric_version: IntGaugeVec,
}

impl MetricsProvider {
    pub fn new() -> Result<Self, Error> {
        let registry = PrometheusRegistry::new();

        let metric_http_request_in_flight = register_int_gauge_with_registry!(
            "tokenreviews_handler_requests_in_flight",
            "A gauge of requests currently being served by the tokenreviews handler.",
            &registry
        )
        .map_err(|error| {
            error!("Unable to create tokenreviews_handler_requests_in_flight metric: {error}");
            Error::Initialization(String::from(
                "Unable to create tokenreviews_handler_requests_in_flight metric",
            ))
        })?;

        let metric_http_request_total = register_int_counter_vec_with_registry!(
            "tokenreviews_handler_requests_total",
            "A counter for requests to the tokenreviews handler.",
            &["code", "method"],
            &registry
        )
        .map_err(|error| {
            error!("Unable to create tokenreviews_handler_requests_total metric: {error}");
            Error::Initialization(String::from(
                "Unable to create tokenreviews_handler_requests_total metric",
            ))
        })?;

        let metric_http_request_duration = register_histogram_vec_with_registry!(
            "request_duration_seconds",
            "A histogram of latencies for requests.",
            &["handler", "method"],
            vec![0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            &registry
        )
        .map_err(|error| {
            error!("Unable to create request_duration_seconds metric: {error}");
            Error::Initialization(String::from(
                "Unable to create request_duration_seconds metric",
            ))
        })?;

        let metric_http_response_size = register_histogram_vec_with_registry!(
            "response_size_bytes",
            "A histogram of response sizes for requests.",
            &["handler"],
            vec![100.0, 200.0, 400.0, 1000.0],
            &registry
        )
        .map_err(|error| {
            error!("Unable to create response_size_bytes metric: {error}");
            Error::Initialization(String::from("Unable to create response_size_bytes metric"))
        })?;

        let metric_version = register_int_gauge_vec_with_registry!(
            "version",
            "Version information about this binary",
            &["version"],
            &registry
        )
        .map_err(|error| {
            error!("Unable to create version metric: {error}");
            Error::Initialization(String::from("Unable to create version metric"))
        })?;

        Ok(Self {
            registry,
            metric_http_request_in_flight,
            metric_http_request_total,
            metric_http_request_duration,
            metric_http_response_size,
            metric_version,
        })
    }

    pub fn record_version(&self, version: &str) {
        self.metric_version.with_label_values(&[version]).set(1);
    }

    pub fn gather(&self) -> Result<(String, Vec<u8>), Error> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|error| Error::Internal(format!("Unable to encode metrics: {error}")))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}
