use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Request metrics
    pub static ref SEGMENT_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("segment_requests_total", "Total number of /segment requests by outcome"),
        &["outcome"]
    ).unwrap();

    pub static ref SEGMENT_BUSY_REJECTIONS: IntCounter = IntCounter::new(
        "segment_busy_rejections_total",
        "Total number of requests rejected because the inference gate was held"
    ).unwrap();

    pub static ref SEGMENT_IN_FLIGHT: IntGauge = IntGauge::new(
        "segment_in_flight",
        "Number of segmentation pipelines currently holding the gate"
    ).unwrap();

    // Latency metrics (in seconds)
    pub static ref SEGMENT_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "segment_duration_seconds",
            "End-to-end segmentation pipeline latency in seconds"
        )
        .buckets(vec![1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0, 300.0, 600.0])
    ).unwrap();

    pub static ref STAGE_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "segment_stage_duration_seconds",
            "Per-stage pipeline latency in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0]),
        &["stage"]
    ).unwrap();

    // Model metrics
    pub static ref INFERENCE_WINDOWS: IntCounter = IntCounter::new(
        "inference_windows_total",
        "Total number of sliding windows run through the network"
    ).unwrap();

    // Storage metrics
    pub static ref OVERLAYS_UPLOADED: IntCounterVec = IntCounterVec::new(
        Opts::new("overlays_uploaded_total", "Total overlay images uploaded by plane"),
        &["plane"]
    ).unwrap();
}

static INIT: Once = Once::new();

/// Initialize metrics registry. Safe to call more than once.
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(SEGMENT_REQUESTS.clone())).unwrap();
        REGISTRY.register(Box::new(SEGMENT_BUSY_REJECTIONS.clone())).unwrap();
        REGISTRY.register(Box::new(SEGMENT_IN_FLIGHT.clone())).unwrap();
        REGISTRY.register(Box::new(SEGMENT_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(STAGE_LATENCY.clone())).unwrap();
        REGISTRY.register(Box::new(INFERENCE_WINDOWS.clone())).unwrap();
        REGISTRY.register(Box::new(OVERLAYS_UPLOADED.clone())).unwrap();

        tracing::info!("Metrics registry initialized with {} collectors", REGISTRY.gather().len());
    });
}

/// Helper struct for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn observe_duration_seconds(&self, histogram: &Histogram) {
        histogram.observe(self.start.elapsed().as_secs_f64());
    }

    pub fn observe_stage(&self, stage: &str) {
        STAGE_LATENCY
            .with_label_values(&[stage])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Export metrics in Prometheus format
pub fn export_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
