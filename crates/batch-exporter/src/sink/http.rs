use std::future::Future;
use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{FieldSchema, Sink, SinkError, TableSchema, TimePartitioning};
use crate::config::{Compression, Config, Destination};
use crate::row::{BufferedRow, Row};

/// [`Sink`] over the BigQuery-style REST surface rooted at
/// `{endpoint}/projects/{project}`.
pub struct HttpSink {
    client: Client,
    endpoint: Url,
    destination: Destination,
    compression: Compression,
    headers: Vec<(String, String)>,
}

impl HttpSink {
    pub fn new(config: &Config) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(config.export_timeout).build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            destination: config.destination.clone(),
            compression: config.compression,
            headers: config.export_headers.clone(),
        })
    }

    fn url(&self, tail: &[&str]) -> Result<Url, SinkError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| SinkError::InvalidEndpoint(self.endpoint.clone()))?
            .pop_if_empty()
            .extend(["projects", self.destination.project.as_str()])
            .extend(tail);
        Ok(url)
    }

    fn dataset_url(&self) -> Result<Url, SinkError> {
        self.url(&["datasets", self.destination.dataset.as_str()])
    }

    fn table_url(&self, rest: &[&str]) -> Result<Url, SinkError> {
        let mut tail = vec![
            "datasets",
            self.destination.dataset.as_str(),
            "tables",
            self.destination.table.as_str(),
        ];
        tail.extend_from_slice(rest);
        self.url(&tail)
    }

    async fn exists(&self, url: Url) -> Result<bool, SinkError> {
        let mut req = self.client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        let resp = req.send().await?;
        let status = resp.status();

        match status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = match resp.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        debug!(%status, error = %e, "failed to read error response body");
                        Bytes::new()
                    }
                };
                Err(rejected(status, &body))
            }
        }
    }

    async fn post<T: Serialize>(&self, url: Url, body: &T) -> Result<Bytes, SinkError> {
        let body = serde_json::to_vec(body)?;

        let body = if self.compression == Compression::Gzip {
            compress_gzip(&body)?
        } else {
            body
        };

        let mut req = self
            .client
            .post(url)
            .header("content-type", "application/json");

        if self.compression == Compression::Gzip {
            req = req.header("content-encoding", "gzip");
        }

        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        let resp = req.body(body).send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if status.is_success() {
            Ok(bytes)
        } else {
            Err(rejected(status, &bytes))
        }
    }
}

impl Sink for HttpSink {
    fn dataset_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_ {
        async move { self.exists(self.dataset_url()?).await }
    }

    fn create_dataset(&self) -> impl Future<Output = Result<(), SinkError>> + Send + '_ {
        async move {
            let body = CreateDatasetRequest {
                dataset_reference: DatasetReference {
                    project_id: &self.destination.project,
                    dataset_id: &self.destination.dataset,
                },
            };
            self.post(self.url(&["datasets"])?, &body).await?;
            debug!(dataset = %self.destination.dataset, "created dataset");
            Ok(())
        }
    }

    fn table_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_ {
        async move { self.exists(self.table_url(&[])?).await }
    }

    fn create_table<'a>(
        &'a self,
        schema: &'a TableSchema,
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a {
        async move {
            let body = CreateTableRequest {
                table_reference: TableReference {
                    project_id: &self.destination.project,
                    dataset_id: &self.destination.dataset,
                    table_id: &self.destination.table,
                },
                schema: SchemaBody {
                    fields: &schema.fields,
                },
                time_partitioning: schema.time_partitioning.as_ref(),
            };
            let url = self.url(&["datasets", self.destination.dataset.as_str(), "tables"])?;
            self.post(url, &body).await?;
            debug!(table = %self.destination.table, "created table");
            Ok(())
        }
    }

    fn insert_rows<'a>(
        &'a self,
        rows: &'a [BufferedRow],
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a {
        async move {
            let body = InsertAllRequest {
                rows: rows
                    .iter()
                    .map(|r| InsertRow {
                        insert_id: r.insert_id(),
                        json: r.row(),
                    })
                    .collect(),
            };
            let resp = self.post(self.table_url(&["insertAll"])?, &body).await?;
            check_insert_errors(&resp, rows.len())
        }
    }
}

/// A 200 from `insertAll` may still carry per-row failures.
fn check_insert_errors(body: &[u8], total: usize) -> Result<(), SinkError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    let resp: InsertAllResponse = serde_json::from_slice(body).map_err(SinkError::Decode)?;
    if resp.insert_errors.is_empty() {
        Ok(())
    } else {
        Err(SinkError::InsertErrors {
            failed: resp.insert_errors.len(),
            total,
        })
    }
}

fn rejected(status: StatusCode, body: &[u8]) -> SinkError {
    let message = serde_json::from_slice::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    SinkError::Status { status, message }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateDatasetRequest<'a> {
    dataset_reference: DatasetReference<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Serialize)]
struct SchemaBody<'a> {
    fields: &'a [FieldSchema],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTableRequest<'a> {
    table_reference: TableReference<'a>,
    schema: SchemaBody<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_partitioning: Option<&'a TimePartitioning>,
}

#[derive(Serialize)]
struct InsertAllRequest<'a> {
    rows: Vec<InsertRow<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertRow<'a> {
    insert_id: &'a str,
    json: &'a Row,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
