/// Prometheusメトリクス定義。
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};
use std::sync::Arc;

/// メトリクスコレクター。
#[derive(Debug, Clone)]
pub struct Metrics {
    // カウンター
    pub classifications: IntCounterVec,
    pub degradations: IntCounterVec,
    pub external_calls: IntCounterVec,
    pub external_failures: IntCounterVec,
    pub rate_limit_trips: IntCounterVec,
    pub retries_total: IntCounter,
    pub batches_total: IntCounter,

    // ヒストグラム
    pub classification_duration: Histogram,
    pub external_call_duration: HistogramVec,

    // ゲージ
    pub rate_limited: IntGauge,
}

impl Metrics {
    /// 新しいメトリクスコレクターを作成する。
    ///
    /// # Errors
    /// 同名のメトリクスがすでにレジストリに登録されている場合はエラーを返す。
    pub fn new(registry: &Arc<Registry>) -> Result<Self, prometheus::Error> {
        Ok(Self {
            classifications: register_int_counter_vec_with_registry!(
                "classifier_classifications_total",
                "Classifications completed, by the stage that decided the label",
                &["stage"],
                registry
            )?,
            degradations: register_int_counter_vec_with_registry!(
                "classifier_degradations_total",
                "Stages that failed and fell back to a local result",
                &["stage"],
                registry
            )?,
            external_calls: register_int_counter_vec_with_registry!(
                "classifier_external_calls_total",
                "Attempted calls to external services",
                &["service"],
                registry
            )?,
            external_failures: register_int_counter_vec_with_registry!(
                "classifier_external_failures_total",
                "Failed calls to external services, by failure kind",
                &["service", "kind"],
                registry
            )?,
            rate_limit_trips: register_int_counter_vec_with_registry!(
                "classifier_rate_limit_trips_total",
                "Responses that tripped the sticky rate limit",
                &["service"],
                registry
            )?,
            retries_total: register_int_counter_with_registry!(
                "classifier_retries_total",
                "Total number of external call retries",
                registry
            )?,
            batches_total: register_int_counter_with_registry!(
                "classifier_batches_total",
                "Total number of classification batches",
                registry
            )?,
            classification_duration: register_histogram_with_registry!(
                "classifier_classification_duration_seconds",
                "Duration of a single entity classification",
                registry
            )?,
            external_call_duration: register_histogram_vec_with_registry!(
                "classifier_external_call_duration_seconds",
                "Latency of external service calls",
                &["service"],
                registry
            )?,
            rate_limited: register_int_gauge_with_registry!(
                "classifier_rate_limited",
                "1 once an external service has rate limited this process",
                registry
            )?,
        })
    }

    pub fn record_classification(&self, stage: &str) {
        self.classifications.with_label_values(&[stage]).inc();
    }

    pub fn record_degradation(&self, stage: &str) {
        self.degradations.with_label_values(&[stage]).inc();
    }

    pub fn record_external_call(&self, service: &str, elapsed_secs: f64) {
        self.external_calls.with_label_values(&[service]).inc();
        self.external_call_duration
            .with_label_values(&[service])
            .observe(elapsed_secs);
    }

    pub fn record_external_failure(&self, service: &str, kind: &str) {
        self.external_failures
            .with_label_values(&[service, kind])
            .inc();
    }

    /// レート制限の発生を記録し、ゲージを立てる。
    pub fn record_rate_limit_trip(&self, service: &str) {
        self.rate_limit_trips.with_label_values(&[service]).inc();
        self.rate_limited.set(1);
    }
}
