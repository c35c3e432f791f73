//! [`RawStore`] on top of the HBase REST gateway (Stargate). Cells are sent as a base64 CellSet.
//!
//! https://hbase.apache.org/book.html#_rest

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use reqwest::{Client, StatusCode, Url, header};
use serde::Serialize;
use tracing::info;

use super::RawStore;
use crate::Error;
use crate::config::HBaseConfig;
use crate::message::RawRecord;

/// Bound of a single REST call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Row segment of every put. The gateway takes the real keys from the CellSet, and a fixed
/// segment keeps ids such as `schema` or `regions` off the table's admin resources.
const PUT_ROW: &str = "false-row-key";

#[derive(Serialize)]
struct CellSet {
    #[serde(rename = "Row")]
    rows: Vec<CellSetRow>,
}

#[derive(Serialize)]
struct CellSetRow {
    key: String,
    #[serde(rename = "Cell")]
    cells: Vec<Cell>,
}

#[derive(Serialize)]
struct Cell {
    column: String,
    timestamp: i64,
    #[serde(rename = "$")]
    value: String,
}

#[derive(Serialize)]
struct TableSchema<'a> {
    name: &'a str,
    #[serde(rename = "ColumnSchema")]
    column_schema: Vec<ColumnSchema<'a>>,
}

#[derive(Serialize)]
struct ColumnSchema<'a> {
    name: &'a str,
}

impl From<&RawRecord> for CellSet {
    fn from(record: &RawRecord) -> Self {
        let cells = record
            .columns
            .iter()
            .map(|(column, value)| Cell {
                column: BASE64_STANDARD.encode(format!("{}:{column}", record.column_family)),
                timestamp: record.written_at,
                value: BASE64_STANDARD.encode(value),
            })
            .collect();
        CellSet {
            rows: vec![CellSetRow {
                key: BASE64_STANDARD.encode(&record.row_key),
                cells,
            }],
        }
    }
}

fn transport_error(action: &str, e: reqwest::Error) -> Error {
    Error::StorageUnavailable(format!("HBase {action}: {e}"))
}

/// Server-side trouble and throttling are worth retrying, a rejected request is not.
fn status_error(action: &str, status: StatusCode, body: &str) -> Error {
    let message = format!("HBase {action} returned {status}: {body}");
    if status.is_server_error()
        || status == StatusCode::NOT_FOUND
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::StorageUnavailable(message)
    } else {
        Error::InvalidRecord(message)
    }
}

#[derive(Clone)]
pub struct HBaseRestStore {
    client: Client,
    base_url: Url,
    table: String,
    column_family: String,
}

impl HBaseRestStore {
    pub fn new(config: &HBaseConfig) -> crate::Result<Self> {
        let base_url = Url::parse(&config.base_url())
            .map_err(|e| Error::Config(format!("Invalid HBase REST address: {e}")))?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Creating HBase REST client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            table: config.table_name.clone(),
            column_family: config.column_family.clone(),
        })
    }

    /// `/{table}/{segment}`, each segment percent-encoded.
    fn url(&self, segment: &str) -> crate::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push(&self.table)
            .push(segment);
        Ok(url)
    }
}

#[async_trait]
impl RawStore for HBaseRestStore {
    async fn ensure_table(&self) -> crate::Result<()> {
        let url = self.url("schema")?;
        let response = self
            .client
            .get(url.clone())
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| transport_error("schema lookup", e))?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("schema lookup", status, &body));
        }

        let schema = TableSchema {
            name: &self.table,
            column_schema: vec![ColumnSchema {
                name: &self.column_family,
            }],
        };
        let response = self
            .client
            .put(url)
            .header(header::ACCEPT, "application/json")
            .json(&schema)
            .send()
            .await
            .map_err(|e| transport_error("table creation", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // creating the table is never the event's fault
            return Err(Error::StorageUnavailable(format!(
                "HBase table creation returned {status}: {body}"
            )));
        }
        info!(table = %self.table, column_family = %self.column_family, "Created HBase table");
        Ok(())
    }

    async fn put(&self, record: &RawRecord) -> crate::Result<()> {
        let url = self.url(PUT_ROW)?;
        let response = self
            .client
            .put(url)
            .header(header::ACCEPT, "application/json")
            .json(&CellSet::from(record))
            .send()
            .await
            .map_err(|e| transport_error("put", e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("put", status, &body))
    }
}
