//! Metrics and observability utilities
//!
//! Metric descriptions and recording helpers with standardized naming.
//! The gateway installs the Prometheus recorder; without one these calls are no-ops.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all PetPal metrics
pub const METRICS_PREFIX: &str = "petpal";

/// Buckets for chat latency (upstream LLM calls are slow)
pub const CHAT_BUCKETS: &[f64] = &[
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
];

/// Buckets for embedding latency
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Chat metrics
    describe_counter!(
        format!("{}_chat_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total chat requests by outcome"
    );

    describe_histogram!(
        format!("{}_chat_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end chat latency in seconds"
    );

    describe_counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Chat-completion API errors by status"
    );

    describe_counter!(
        format!("{}_emotions_detected_total", METRICS_PREFIX),
        Unit::Count,
        "Detected emotion labels"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        Unit::Count,
        "Total documents ingested"
    );

    describe_counter!(
        format!("{}_chunks_stored_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks stored with embeddings"
    );

    describe_counter!(
        format!("{}_chunks_failed_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks that failed to embed or insert"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record chat metrics
pub struct ChatMetrics {
    start: Instant,
}

impl ChatMetrics {
    /// Start tracking a chat request
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Record request completion
    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_chat_requests_total", METRICS_PREFIX),
            "outcome" => outcome.to_string()
        )
        .increment(1);

        histogram!(format!("{}_chat_duration_seconds", METRICS_PREFIX)).record(duration);
    }
}

/// Record a non-200 answer from the chat-completion API
pub fn record_upstream_error(status: u16) {
    counter!(
        format!("{}_upstream_errors_total", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a classified emotion
pub fn record_emotion(label: &str) {
    counter!(
        format!("{}_emotions_detected_total", METRICS_PREFIX),
        "label" => label.to_string()
    )
    .increment(1);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// Helper to record ingestion metrics
pub fn record_ingestion(kind: &str, chunks_stored: usize, chunks_failed: usize) {
    counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        "kind" => kind.to_string()
    )
    .increment(1);

    counter!(format!("{}_chunks_stored_total", METRICS_PREFIX)).increment(chunks_stored as u64);
    counter!(format!("{}_chunks_failed_total", METRICS_PREFIX)).increment(chunks_failed as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [CHAT_BUCKETS, EMBEDDING_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
    }

    #[test]
    fn test_chat_metrics() {
        let metrics = ChatMetrics::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        metrics.finish("ok");
        // No recorder installed: just verify it runs without panic
    }
}
