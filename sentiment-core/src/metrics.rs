use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use sentiment_kafka::consumer::KafkaConsumer;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;

const TOPIC_LABEL: &str = "topic";
const CONSUMER_GROUP_LABEL: &str = "consumer_group";
const STAGE_LABEL: &str = "stage";
const KIND_LABEL: &str = "kind";
const TARGET_LABEL: &str = "target";
const STATUS_LABEL: &str = "status";

// The client library appends `_total` to counters.
// https://github.com/prometheus/client_rust/blob/master/src/registry.rs#L102

// counters
const READ_TOTAL: &str = "sentiment_read";
const PROCESSED_TOTAL: &str = "sentiment_processed";
const DEAD_LETTER_TOTAL: &str = "sentiment_dead_letter";
const RETRY_TOTAL: &str = "sentiment_retry";
const COMMIT_TOTAL: &str = "sentiment_commit";

// gauge
const PENDING: &str = "sentiment_pending";

// timers, in microseconds
const ARCHIVE_TIME: &str = "sentiment_archive_time";
const SCORE_TIME: &str = "sentiment_score_time";
const WRITE_TIME: &str = "sentiment_write_time";
const BATCH_TIME: &str = "sentiment_batch_processing_time";

type Labels = Vec<(String, String)>;

fn timer() -> Family<Labels, Histogram> {
    // 100us .. ~7min
    Family::<Labels, Histogram>::new_with_constructor(|| {
        Histogram::new(exponential_buckets(100.0, 4.0, 12))
    })
}

/// Metrics of the processing pipeline. Each metric is a family keyed by its label values; every
/// series carries the topic and consumer group.
pub struct PipelineMetrics {
    common_labels: Labels,

    // counters
    pub read_total: Family<Labels, Counter>,
    pub processed_total: Family<Labels, Counter>,
    pub dead_letter_total: Family<Labels, Counter>,
    pub retry_total: Family<Labels, Counter>,
    pub commit_total: Family<Labels, Counter>,

    // gauge
    pub pending: Family<Labels, Gauge>,

    // timers
    pub archive_time: Family<Labels, Histogram>,
    pub score_time: Family<Labels, Histogram>,
    pub write_time: Family<Labels, Histogram>,
    pub batch_time: Family<Labels, Histogram>,
}

impl PipelineMetrics {
    pub fn new(registry: &mut Registry, topic: &str, consumer_group: &str) -> Self {
        let metrics = Self {
            common_labels: vec![
                (TOPIC_LABEL.to_string(), topic.to_string()),
                (CONSUMER_GROUP_LABEL.to_string(), consumer_group.to_string()),
            ],
            read_total: Family::default(),
            processed_total: Family::default(),
            dead_letter_total: Family::default(),
            retry_total: Family::default(),
            commit_total: Family::default(),
            pending: Family::default(),
            archive_time: timer(),
            score_time: timer(),
            write_time: timer(),
            batch_time: timer(),
        };

        registry.register(
            READ_TOTAL,
            "Total number of events read from the broker",
            metrics.read_total.clone(),
        );
        registry.register(
            PROCESSED_TOTAL,
            "Total number of events archived, scored and stored",
            metrics.processed_total.clone(),
        );
        registry.register(
            DEAD_LETTER_TOTAL,
            "Total number of events skipped after a terminal failure, by stage and error kind",
            metrics.dead_letter_total.clone(),
        );
        registry.register(
            RETRY_TOTAL,
            "Total number of retried calls, by downstream system",
            metrics.retry_total.clone(),
        );
        registry.register(
            COMMIT_TOTAL,
            "Total number of offset commits, by outcome",
            metrics.commit_total.clone(),
        );
        registry.register(
            PENDING,
            "Messages in the topic not yet committed by the consumer group",
            metrics.pending.clone(),
        );
        registry.register(
            ARCHIVE_TIME,
            "Time taken to archive an event, retries included, in microseconds",
            metrics.archive_time.clone(),
        );
        registry.register(
            SCORE_TIME,
            "Time taken to score an event, retries included, in microseconds",
            metrics.score_time.clone(),
        );
        registry.register(
            WRITE_TIME,
            "Time taken to store a scored event, retries included, in microseconds",
            metrics.write_time.clone(),
        );
        registry.register(
            BATCH_TIME,
            "Time taken to process and commit a batch, in microseconds",
            metrics.batch_time.clone(),
        );
        metrics
    }

    /// The common labels plus `extra`.
    pub fn labels(&self, extra: &[(&str, &str)]) -> Labels {
        let mut labels = self.common_labels.clone();
        labels.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        labels
    }

    pub fn common_labels(&self) -> &Labels {
        &self.common_labels
    }

    /// Counter of retries against `target`, handed to its retry executor.
    pub fn retry_counter(&self, target: &str) -> Counter {
        self.retry_total
            .get_or_create(&self.labels(&[(TARGET_LABEL, target)]))
            .clone()
    }

    pub fn dead_lettered(&self, stage: &str, kind: &str, count: u64) {
        self.dead_letter_total
            .get_or_create(&self.labels(&[(STAGE_LABEL, stage), (KIND_LABEL, kind)]))
            .inc_by(count);
    }

    pub fn committed(&self, success: bool) {
        let status = if success { "success" } else { "failure" };
        self.commit_total
            .get_or_create(&self.labels(&[(STATUS_LABEL, status)]))
            .inc();
    }
}

/// Shared with the HTTP handlers.
#[derive(Clone)]
pub struct MetricsState {
    registry: Arc<Registry>,
    ready: Arc<AtomicBool>,
}

impl MetricsState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flipped once the schemas exist and the consumer has joined the group.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }
}

async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry) {
        error!(?e, "Encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    debug!("Exposing Metrics: {:?}", buffer);
    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )
        .body(Body::from(buffer))
        .map(IntoResponse::into_response)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn readyz(State(state): State<MetricsState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// router for metrics and k8s health endpoints
pub(crate) fn metrics_router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Binds the metrics port, then serves in the background until `cancel` fires.
/// A port that cannot be bound is fatal.
pub async fn start_metrics_server(
    addr: SocketAddr,
    state: MetricsState,
    cancel: CancellationToken,
) -> crate::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Creating listener on {addr:?}: {e}")))?;
    info!(?addr, "Metrics server started");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, metrics_router(state))
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            error!(?e, "Metrics server stopped");
        }
    }))
}

/// Periodically refreshes the pending gauge from the broker.
pub fn start_lag_reader(
    consumer: KafkaConsumer,
    metrics: Arc<PipelineMetrics>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match consumer.pending().await {
                Ok(Some(pending)) => {
                    metrics
                        .pending
                        .get_or_create(metrics.common_labels())
                        .set(pending as i64);
                }
                Ok(None) => {}
                Err(e) => warn!(?e, "Failed to fetch pending messages"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_metrics() -> (MetricsState, PipelineMetrics) {
        let mut registry = Registry::default();
        let metrics = PipelineMetrics::new(&mut registry, "comments", "group");
        (MetricsState::new(registry), metrics)
    }

    #[tokio::test]
    async fn serves_metrics_and_health_endpoints() {
        let (state, metrics) = state_with_metrics();
        metrics
            .read_total
            .get_or_create(metrics.common_labels())
            .inc_by(3);
        metrics.dead_lettered("archive", "storage_unavailable", 1);
        metrics.retry_counter("hbase").inc();

        let cancel = CancellationToken::new();
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr: SocketAddr = ([127, 0, 0, 1], port).into();
        let server = start_metrics_server(addr, state.clone(), cancel.clone())
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let body = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains(r#"sentiment_read_total{topic="comments",consumer_group="group"} 3"#));
        assert!(body.contains(r#"stage="archive",kind="storage_unavailable"} 1"#));
        assert!(body.contains(r#"sentiment_retry_total{topic="comments",consumer_group="group",target="hbase"} 1"#));

        let livez = client
            .get(format!("http://{addr}/livez"))
            .send()
            .await
            .unwrap();
        assert_eq!(livez.status(), StatusCode::NO_CONTENT);

        let readyz = client
            .get(format!("http://{addr}/readyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(readyz.status(), StatusCode::SERVICE_UNAVAILABLE);
        state.set_ready(true);
        let readyz = client
            .get(format!("http://{addr}/readyz"))
            .send()
            .await
            .unwrap();
        assert_eq!(readyz.status(), StatusCode::NO_CONTENT);

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn occupied_port_is_a_metrics_error() {
        let (state, _metrics) = state_with_metrics();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let result = start_metrics_server(addr, state, CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Metrics(_))));
    }
}
