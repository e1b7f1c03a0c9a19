//! In-process stand-in for the table sink's REST surface.
//!
//! Keeps datasets, tables and inserted rows in memory, drops rows whose
//! `insertId` it has already accepted, and can be told to fail the next N
//! insert requests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::convert::Infallible;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::debug;

/// A row the sink accepted.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertedRow {
    pub table: String,
    pub insert_id: String,
    pub json: Value,
}

/// One request as it arrived, before routing.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub content_encoding: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    datasets: BTreeSet<String>,
    tables: BTreeMap<String, Value>,
    rows: Vec<InsertedRow>,
    seen_ids: HashSet<String>,
    requests: Vec<RecordedRequest>,
    insert_requests: usize,
    fail_inserts: usize,
}

/// Cloning shares the same store.
#[derive(Clone, Default)]
pub struct FakeSink {
    state: Arc<Mutex<State>>,
}

fn dataset_key(project: &str, dataset: &str) -> String {
    format!("{project}:{dataset}")
}

fn table_key(project: &str, dataset: &str, table: &str) -> String {
    format!("{project}:{dataset}.{table}")
}

impl FakeSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` (port 0 picks one) and serve in a background task.
    pub async fn start(&self, addr: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let sink = self.clone();

        tokio::spawn(async move {
            loop {
                let stream = match listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let sink = sink.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let sink = sink.clone();
                        async move { Ok::<_, Infallible>(sink.handle(req).await) }
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(local)
    }

    pub fn with_dataset(self, project: &str, dataset: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .datasets
            .insert(dataset_key(project, dataset));
        self
    }

    pub fn with_table(self, project: &str, dataset: &str, table: &str) -> Self {
        let sink = self.with_dataset(project, dataset);
        sink.state
            .lock()
            .unwrap()
            .tables
            .insert(table_key(project, dataset, table), Value::Null);
        sink
    }

    pub fn fail_next_inserts(&self, n: usize) {
        self.state.lock().unwrap().fail_inserts = n;
    }

    pub fn has_dataset(&self, project: &str, dataset: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .datasets
            .contains(&dataset_key(project, dataset))
    }

    /// The create request body the table was made with, if this sink made it.
    pub fn table(&self, project: &str, dataset: &str, table: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&table_key(project, dataset, table))
            .cloned()
    }

    pub fn rows(&self) -> Vec<InsertedRow> {
        self.state.lock().unwrap().rows.clone()
    }

    /// Every `insertAll` request, failed and duplicate ones included.
    pub fn insert_requests(&self) -> usize {
        self.state.lock().unwrap().insert_requests
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Poll until at least `min_expected` rows landed or `timeout` passes.
    pub async fn wait_for_rows(&self, min_expected: usize, timeout: Duration) -> Vec<InsertedRow> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let rows = self.rows();
            if rows.len() >= min_expected || tokio::time::Instant::now() >= deadline {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let content_encoding = req
            .headers()
            .get("content-encoding")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let headers = req
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
            .collect();
        self.state.lock().unwrap().requests.push(RecordedRequest {
            method: method.to_string(),
            path: path.clone(),
            content_encoding: content_encoding.clone(),
            headers,
        });
        debug!(%method, path, "sink request");

        let raw = req.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        let body = match decode_body(&raw, content_encoding.as_deref()) {
            Ok(body) => body,
            Err(reason) => return error(StatusCode::BAD_REQUEST, &reason),
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some(start) = segments.iter().position(|s| *s == "projects") else {
            return error(StatusCode::NOT_FOUND, &format!("Not found: {path}"));
        };

        match (&method, &segments[start + 1..]) {
            (&Method::POST, [project, "datasets"]) => self.create_dataset(project, &body),
            (&Method::GET, [project, "datasets", dataset]) => {
                self.get_dataset(project, dataset)
            }
            (&Method::POST, [project, "datasets", dataset, "tables"]) => {
                self.create_table(project, dataset, &body)
            }
            (&Method::GET, [project, "datasets", dataset, "tables", table]) => {
                self.get_table(project, dataset, table)
            }
            (&Method::POST, [project, "datasets", dataset, "tables", table, "insertAll"]) => {
                self.insert_all(project, dataset, table, &body)
            }
            _ => error(StatusCode::NOT_FOUND, &format!("Not found: {method} {path}")),
        }
    }

    fn get_dataset(&self, project: &str, dataset: &str) -> Response<Full<Bytes>> {
        if self.has_dataset(project, dataset) {
            ok(json!({ "id": dataset_key(project, dataset) }))
        } else {
            error(
                StatusCode::NOT_FOUND,
                &format!("Not found: Dataset {}", dataset_key(project, dataset)),
            )
        }
    }

    fn create_dataset(&self, project: &str, body: &[u8]) -> Response<Full<Bytes>> {
        let req: CreateDataset = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let key = dataset_key(project, &req.dataset_reference.dataset_id);
        if !self.state.lock().unwrap().datasets.insert(key.clone()) {
            return error(
                StatusCode::CONFLICT,
                &format!("Already Exists: Dataset {key}"),
            );
        }
        ok(json!({ "id": key }))
    }

    fn get_table(&self, project: &str, dataset: &str, table: &str) -> Response<Full<Bytes>> {
        let key = table_key(project, dataset, table);
        if self.state.lock().unwrap().tables.contains_key(&key) {
            ok(json!({ "id": key }))
        } else {
            error(StatusCode::NOT_FOUND, &format!("Not found: Table {key}"))
        }
    }

    fn create_table(&self, project: &str, dataset: &str, body: &[u8]) -> Response<Full<Bytes>> {
        let req: CreateTable = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let mut state = self.state.lock().unwrap();
        if !state.datasets.contains(&dataset_key(project, dataset)) {
            return error(
                StatusCode::NOT_FOUND,
                &format!("Not found: Dataset {}", dataset_key(project, dataset)),
            );
        }
        let key = table_key(project, dataset, &req.table_reference.table_id);
        if state.tables.contains_key(&key) {
            return error(StatusCode::CONFLICT, &format!("Already Exists: Table {key}"));
        }
        let created: Value = serde_json::from_slice(body).unwrap_or_default();
        state.tables.insert(key.clone(), created);
        ok(json!({ "id": key }))
    }

    fn insert_all(
        &self,
        project: &str,
        dataset: &str,
        table: &str,
        body: &[u8],
    ) -> Response<Full<Bytes>> {
        let req: InsertAll = match serde_json::from_slice(body) {
            Ok(req) => req,
            Err(e) => return error(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        let key = table_key(project, dataset, table);
        let mut state = self.state.lock().unwrap();
        state.insert_requests += 1;
        if state.fail_inserts > 0 {
            state.fail_inserts -= 1;
            return error(StatusCode::SERVICE_UNAVAILABLE, "Backend error, try again");
        }
        if !state.tables.contains_key(&key) {
            return error(StatusCode::NOT_FOUND, &format!("Not found: Table {key}"));
        }
        for row in req.rows {
            if state.seen_ids.insert(row.insert_id.clone()) {
                state.rows.push(InsertedRow {
                    table: key.clone(),
                    insert_id: row.insert_id,
                    json: row.json,
                });
            }
        }
        ok(json!({ "kind": "bigquery#tableDataInsertAllResponse" }))
    }
}

fn decode_body(raw: &[u8], encoding: Option<&str>) -> Result<Vec<u8>, String> {
    match encoding {
        None | Some("identity") => Ok(raw.to_vec()),
        Some("gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(raw)
                .read_to_end(&mut out)
                .map_err(|e| format!("bad gzip body: {e}"))?;
            Ok(out)
        }
        Some(other) => Err(format!("unsupported content-encoding: {other}")),
    }
}

fn ok(body: Value) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &body)
}

fn error(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &json!({ "error": { "code": status.as_u16(), "message": message } }),
    )
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDataset {
    dataset_reference: DatasetReference,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference {
    dataset_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTable {
    table_reference: TableReference,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Deserialize)]
struct InsertAll {
    rows: Vec<InsertRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertRow {
    insert_id: String,
    json: Value,
}
