use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, register_histogram_vec, GaugeVec, HistogramVec, IntCounterVec, Opts,
    Registry,
};
use tokio::sync::watch;
use warp::{Filter, Rejection, Reply};

use crate::Outcome;
use crate::VolumeRecord;
use crate::VolumeState;


lazy_static! {
    pub static ref TRANSITION_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("volume_transitions", "volume lifecycle transitions by operation and result"),
        &["operation", "result"]
    )
    .expect("metric can not be created");

    pub static ref BACKEND_OUTCOME_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("backend_command_outcomes", "backend command outcomes by command"),
        &["command", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref RECONCILER_CORRECTION_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("reconciler_corrections", "corrective actions taken by the reconciler"),
        &["case"]
    )
    .expect("metric can not be created");

    pub static ref VOLUMES_BY_STATE_METRIC: GaugeVec = GaugeVec::new(
        Opts::new("volumes_by_state", "volume records per lifecycle state"),
        &["state"]
    )
    .expect("metric can not be created");

    pub static ref TRANSITION_DURATION_METRIC: HistogramVec = register_histogram_vec!(
        "volume_transition_duration_ms",
        "Histogram of volume transition duration in ms",
        &["operation"],
        exponential_buckets(1.0, 2.0, 14).unwrap()
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

fn register_custom_metrics() {
    REGISTRY
        .register(Box::new(TRANSITION_METRIC.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(BACKEND_OUTCOME_METRIC.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(RECONCILER_CORRECTION_METRIC.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(VOLUMES_BY_STATE_METRIC.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(TRANSITION_DURATION_METRIC.clone()))
        .expect("collector can be registered");
}

pub(crate) fn observe_transition(
    operation: &str,
    succeeded: bool,
) {
    let result = if succeeded { "success" } else { "error" };
    TRANSITION_METRIC
        .with_label_values(&[operation, result])
        .inc();
}

pub(crate) fn observe_backend_outcome<T>(
    command: &str,
    outcome: &Outcome<T>,
) {
    let label = match outcome {
        Outcome::Success(_) => "success",
        Outcome::Failure(_) => "failure",
        Outcome::Unknown => "unknown",
    };
    BACKEND_OUTCOME_METRIC
        .with_label_values(&[command, label])
        .inc();
}

pub(crate) fn observe_reconciler_correction(case: &str) {
    RECONCILER_CORRECTION_METRIC.with_label_values(&[case]).inc();
}

const GAUGED_STATES: [VolumeState; 10] = [
    VolumeState::Pending,
    VolumeState::Provisioned,
    VolumeState::Published,
    VolumeState::Staged,
    VolumeState::InUse,
    VolumeState::Unstaging,
    VolumeState::Unpublished,
    VolumeState::Deleting,
    VolumeState::Deleted,
    VolumeState::Error,
];

pub(crate) fn state_counts(records: &[VolumeRecord]) -> [(VolumeState, usize); 10] {
    GAUGED_STATES.map(|state| {
        let count = records.iter().filter(|r| r.state == state).count();
        (state, count)
    })
}

pub(crate) fn observe_volume_states(records: &[VolumeRecord]) {
    for (state, count) in state_counts(records) {
        VOLUMES_BY_STATE_METRIC
            .with_label_values(&[state.as_str()])
            .set(count as f64);
    }
}

pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics();

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);

    let (_, server) =
        warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    server.await;
}

async fn metrics_handler() -> Result<impl Reply, Rejection> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        eprintln!("could not encode custom metrics: {}", e);
    };
    let mut res = match String::from_utf8(buffer.clone()) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    };
    buffer.clear();

    res.push_str(&get_metrics_body());
    Ok(res)
}

/// Export metrics for Prometheus to scrape
pub fn get_metrics_body() -> String {
    let autometrics_response = prometheus_exporter::encode_http_response();
    autometrics_response.into_body()
}
