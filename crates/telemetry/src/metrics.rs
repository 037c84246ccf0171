use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Recognition Metrics ====
    pub static ref FACEID_RECOGNITIONS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "faceid_recognitions_total",
                "Total number of recognition requests by outcome",
            ),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACEID_ACTIVE_RECOGNITIONS: IntGauge = {
        let metric = IntGauge::new(
            "faceid_active_recognitions",
            "Number of recognitions currently holding a worker permit",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACEID_FRAMES_SCANNED: IntCounter = {
        let metric = IntCounter::new(
            "faceid_frames_scanned_total",
            "Total number of decoded video frames passed to the embedder",
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACEID_FACES_EMBEDDED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "faceid_faces_embedded_total",
                "Total number of embedder calls by source and result",
            ),
            &["source", "result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACEID_SCAN_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "faceid_scan_duration_seconds",
                "Time spent scanning an uploaded video",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Reference Directory Metrics ====
    pub static ref FACEID_REFERENCES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "faceid_reference_records_total",
                "Reference directory records by load status",
            ),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref FACEID_REFERENCE_LOAD_DURATION: HistogramVec = {
        let metric = HistogramVec::new(
            HistogramOpts::new(
                "faceid_reference_load_duration_seconds",
                "Time spent fetching and encoding the reference set",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Login Metrics ====
    pub static ref FACEID_LOGIN_CALLS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("faceid_login_calls_total", "Face-ID login calls by status"),
            &["status"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
