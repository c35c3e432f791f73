//! Consumes user comments from Kafka, archives each raw event in HBase, scores its sentiment with
//! a text-classification model and upserts the result into MySQL.
//!
//! The processor runs the following in a loop until a shutdown signal is received:
//! - Read a batch of events from the broker
//! - Per partition, in offset order: archive, score and store every event
//! - Commit the offsets of the events that reached a terminal outcome

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use prometheus_client::registry::Registry;
use sentiment_kafka::consumer::KafkaConsumer;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use crate::config::Settings;
pub use crate::error::{Error, ErrorClass, Failure, Result};

use crate::archiver::Archiver;
use crate::archiver::hbase::HBaseRestStore;
use crate::config::RetryConfig;
use crate::metrics::{MetricsState, PipelineMetrics, start_lag_reader, start_metrics_server};
use crate::processor::{Pipeline, Processor};
use crate::retry::RetryExecutor;
use crate::scorer::Scorer;
use crate::scorer::http::HttpClassifier;
use crate::writer::ResultWriter;
use crate::writer::mysql::MySqlStore;

pub mod archiver;
pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod retry;
pub mod scorer;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_utils;

const LAG_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Runs the processor until SIGINT/SIGTERM. Returns an error only for failures the process
/// cannot continue from: startup, broker and metrics server errors.
pub async fn run(settings: Settings) -> Result<()> {
    settings.log_summary();

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let mut registry = Registry::default();
    let metrics = Arc::new(PipelineMetrics::new(
        &mut registry,
        &settings.kafka.topic,
        &settings.kafka.consumer_group_id,
    ));
    let metrics_state = MetricsState::new(registry);
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_server =
        match start_metrics_server(metrics_addr, metrics_state.clone(), cancel.clone()).await {
            Ok(server) => server,
            Err(e) => {
                shutdown_handle.abort();
                return Err(e);
            }
        };

    let result_store = Arc::new(MySqlStore::new(&settings.mysql));
    let result = start(
        &settings,
        Arc::clone(&result_store),
        Arc::clone(&metrics),
        &metrics_state,
        cancel.clone(),
    )
    .await;
    if let Err(e) = &result {
        error!(?e, "Processor failed");
    }

    metrics_state.set_ready(false);
    cancel.cancel();
    result_store.close().await;
    if let Err(e) = metrics_server.await {
        error!(?e, "Metrics server task failed");
    }
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }

    info!("Gracefully Exiting...");
    result
}

fn retry_executor(
    target: &'static str,
    config: RetryConfig,
    metrics: &PipelineMetrics,
) -> RetryExecutor {
    RetryExecutor::new(target, config).with_retry_counter(metrics.retry_counter(target))
}

/// Builds the pipeline, creates the schemas, joins the consumer group and runs the processor.
async fn start(
    settings: &Settings,
    result_store: Arc<MySqlStore>,
    metrics: Arc<PipelineMetrics>,
    metrics_state: &MetricsState,
    cancel: CancellationToken,
) -> Result<()> {
    let archiver = Archiver::new(
        Arc::new(HBaseRestStore::new(&settings.hbase)?),
        settings.hbase.column_family.clone(),
        retry_executor("hbase", settings.hbase.retry, &metrics),
    );
    let scorer = Scorer::new(
        Arc::new(HttpClassifier::new(&settings.sentiment)?),
        settings.sentiment.model_name.clone(),
        settings.sentiment.max_length,
        retry_executor("model", settings.sentiment.retry, &metrics),
    );
    let writer = ResultWriter::new(
        result_store,
        retry_executor("mysql", settings.mysql.retry, &metrics),
    );

    tokio::select! {
        _ = cancel.cancelled() => {
            info!("Shutdown requested before the schemas were ready");
            return Ok(());
        }
        ready = ensure_schemas(&archiver, &writer) => ready?,
    }

    let consumer = KafkaConsumer::connect(
        settings.consumer_config(),
        settings.kafka.batch_size,
        settings.kafka.read_timeout,
        cancel.clone(),
    )
    .await?;
    info!(topic = %settings.kafka.topic, "Joined the consumer group");

    let lag_reader = start_lag_reader(
        consumer.clone(),
        Arc::clone(&metrics),
        LAG_CHECK_INTERVAL,
        cancel.clone(),
    );
    metrics_state.set_ready(true);

    let pipeline = Pipeline::new(archiver, scorer, writer, metrics);
    let mut processor = Processor::new(consumer, pipeline, cancel.clone());
    let result = processor.start().await;

    cancel.cancel();
    if let Err(e) = lag_reader.await {
        error!(?e, "Lag reader task failed");
    }
    result
}

/// Failing to create either schema after all retries is fatal.
async fn ensure_schemas(archiver: &Archiver, writer: &ResultWriter) -> Result<()> {
    archiver
        .ensure_schema()
        .await
        .map_err(|f| Error::Startup(format!("Creating the HBase table: {f}")))?;
    writer
        .ensure_schema()
        .await
        .map_err(|f| Error::Startup(format!("Creating the MySQL table: {f}")))?;
    info!("Storage schemas are ready");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
