use std::future::Future;

use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::row::BufferedRow;

mod http;

pub use http::HttpSink;

/// The remote append-only store, narrowed to the five calls the exporter
/// makes. The destination (project, dataset, table) is bound at
/// construction.
pub trait Sink: Send + Sync + 'static {
    fn dataset_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_;

    fn create_dataset(&self) -> impl Future<Output = Result<(), SinkError>> + Send + '_;

    fn table_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_;

    fn create_table<'a>(
        &'a self,
        schema: &'a TableSchema,
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a;

    /// Insert `rows` as one request. Each row carries its `insertId`.
    fn insert_rows<'a>(
        &'a self,
        rows: &'a [BufferedRow],
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a;
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sink responded {status}: {message}")]
    Status { status: StatusCode, message: String },

    #[error("sink rejected {failed} of {total} rows")]
    InsertErrors { failed: usize, total: usize },

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to decode response body: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("endpoint cannot be used as a base URL: {0}")]
    InvalidEndpoint(Url),
}

impl SinkError {
    /// The resource being created already exists. Another exporter instance
    /// most likely won the race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SinkError::Status { status, .. } if *status == StatusCode::CONFLICT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    Integer,
    String,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub mode: FieldMode,
}

impl FieldSchema {
    pub fn nullable(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_owned(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionType {
    Day,
}

/// Without a `field`, the sink partitions on ingestion time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimePartitioning {
    #[serde(rename = "type")]
    pub partition_type: PartitionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Column layout and partitioning used when the table has to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub fields: Vec<FieldSchema>,
    pub time_partitioning: Option<TimePartitioning>,
}

impl TableSchema {
    /// The layout rows from [`crate::shaper::AuditShaper`] are shaped for.
    pub fn audit_results() -> Self {
        Self {
            fields: vec![
                FieldSchema::nullable("score", FieldType::Integer),
                FieldSchema::nullable("raw_value", FieldType::Integer),
                FieldSchema::nullable("name", FieldType::String),
                FieldSchema::nullable("type", FieldType::String),
                FieldSchema::nullable("url", FieldType::String),
                FieldSchema::nullable("tested_at", FieldType::Timestamp),
            ],
            time_partitioning: Some(TimePartitioning {
                partition_type: PartitionType::Day,
                field: None,
            }),
        }
    }
}
