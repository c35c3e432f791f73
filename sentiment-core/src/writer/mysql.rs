//! [`ResultStore`] on MySQL. Rows are upserted with `INSERT ... ON DUPLICATE KEY UPDATE`.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{
    MySqlConnectOptions, MySqlDatabaseError, MySqlPool, MySqlPoolOptions, MySqlSslMode,
};
use tracing::info;

use super::ResultStore;
use crate::Error;
use crate::config::{AuthPlugin, MySqlConfig};
use crate::message::ProcessedRow;

pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

const CREATE_COMMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS comments (
    id VARCHAR(255) NOT NULL PRIMARY KEY,
    user_id VARCHAR(255) NULL,
    comment TEXT NOT NULL,
    source_channel VARCHAR(255) NOT NULL,
    timestamp DATETIME(3) NOT NULL,
    sentiment_prediction VARCHAR(50) NOT NULL,
    confidence DOUBLE NOT NULL,
    model_name VARCHAR(255) NOT NULL,
    inserted_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
    CONSTRAINT confidence_range CHECK (confidence BETWEEN 0 AND 1)
) CHARACTER SET utf8mb4
"#;

const UPSERT_COMMENT: &str = r#"
INSERT INTO comments
    (id, user_id, comment, source_channel, timestamp, sentiment_prediction, confidence, model_name)
VALUES (?, ?, ?, ?, ?, ?, ?, ?) AS new
ON DUPLICATE KEY UPDATE
    user_id = new.user_id,
    comment = new.comment,
    source_channel = new.source_channel,
    timestamp = new.timestamp,
    sentiment_prediction = new.sentiment_prediction,
    confidence = new.confidence,
    model_name = new.model_name
"#;

// ER_LOCK_WAIT_TIMEOUT, ER_LOCK_DEADLOCK, ER_CON_COUNT_ERROR, ER_SERVER_SHUTDOWN
const TRANSIENT_ERROR_NUMBERS: [u16; 4] = [1205, 1213, 1040, 1053];

/// sqlx negotiates either plugin on its own. Without TLS `caching_sha2_password` needs the RSA
/// key exchange, so that plugin asks for an encrypted connection.
fn ssl_mode(plugin: AuthPlugin) -> MySqlSslMode {
    match plugin {
        AuthPlugin::MysqlNativePassword => MySqlSslMode::Preferred,
        AuthPlugin::CachingSha2Password => MySqlSslMode::Required,
    }
}

/// Transport trouble is retryable, a rejected statement is not. Bad connection options never heal.
fn classify(action: &str, e: sqlx::Error) -> Error {
    match e {
        sqlx::Error::Database(db) => {
            let transient = db
                .try_downcast_ref::<MySqlDatabaseError>()
                .is_some_and(|e| TRANSIENT_ERROR_NUMBERS.contains(&e.number()));
            if transient {
                Error::StorageUnavailable(format!("MySQL {action}: {db}"))
            } else {
                Error::ConstraintViolation(format!("MySQL {action}: {db}"))
            }
        }
        e @ (sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed) => Error::StorageUnavailable(format!("MySQL {action}: {e}")),
        sqlx::Error::Configuration(e) => Error::Config(format!("MySQL {action}: {e}")),
        e => Error::ConstraintViolation(format!("MySQL {action}: {e}")),
    }
}

#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    /// The pool connects lazily, the first query (the schema check at startup) opens it.
    pub fn new(config: &MySqlConfig) -> Self {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database)
            .charset("utf8mb4")
            .ssl_mode(ssl_mode(config.auth_plugin));
        let pool = MySqlPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ResultStore for MySqlStore {
    async fn ensure_schema(&self) -> crate::Result<()> {
        sqlx::query(CREATE_COMMENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| match classify("create table", e) {
                // a schema that cannot be created is an outage, not a bad event
                Error::ConstraintViolation(msg) => Error::Startup(msg),
                other => other,
            })?;
        info!("MySQL comments table is ready");
        Ok(())
    }

    async fn upsert(&self, row: &ProcessedRow) -> crate::Result<()> {
        sqlx::query(UPSERT_COMMENT)
            .bind(row.id.as_str())
            .bind(row.user_id.as_deref())
            .bind(row.comment.as_str())
            .bind(row.source_channel.as_str())
            .bind(row.timestamp.naive_utc())
            .bind(row.sentiment_prediction.as_str())
            .bind(row.confidence)
            .bind(row.model_name.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| classify("upsert", e))?;
        Ok(())
    }
}
