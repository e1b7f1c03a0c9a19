use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::StatusCode;

use crate::row::{BufferedRow, Row, Value};
use crate::sink::{Sink, SinkError, TableSchema};

pub fn status(status: StatusCode, message: &str) -> SinkError {
    SinkError::Status {
        status,
        message: message.to_owned(),
    }
}

pub fn row(n: i64) -> Row {
    Row::builder().field("n", n).build()
}

pub fn n_of(row: &BufferedRow) -> i64 {
    match row.row().get("n") {
        Some(Value::Integer(n)) => *n,
        other => panic!("row has no integer n: {other:?}"),
    }
}

#[derive(Default)]
struct MemoryState {
    dataset: bool,
    table: bool,
    calls: Vec<&'static str>,
    attempts: Vec<Vec<BufferedRow>>,
    delivered: Vec<BufferedRow>,
    seen_ids: HashSet<String>,
    fail_inserts: usize,
    in_flight: usize,
    max_in_flight: usize,
    dataset_check_error: Option<StatusCode>,
    table_create_error: Option<StatusCode>,
}

/// In-memory [`Sink`] that records every call and dedups delivered rows on
/// `insertId` the way the real sink does.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    insert_delay: Option<Duration>,
    check_delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset and table already exist.
    pub fn provisioned() -> Self {
        let sink = Self::new();
        {
            let mut s = sink.state.lock().unwrap();
            s.dataset = true;
            s.table = true;
        }
        sink
    }

    pub fn with_dataset(self) -> Self {
        self.state.lock().unwrap().dataset = true;
        self
    }

    /// Each insert sleeps this long, so overlapping drains would be visible.
    pub fn with_insert_delay(mut self, delay: Duration) -> Self {
        self.insert_delay = Some(delay);
        self
    }

    /// Existence checks sleep this long, so concurrent provisioners both see
    /// "missing" before either creates.
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = Some(delay);
        self
    }

    pub fn failing_next_inserts(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_inserts = n;
        self
    }

    pub fn failing_dataset_check(self, status: StatusCode) -> Self {
        self.state.lock().unwrap().dataset_check_error = Some(status);
        self
    }

    pub fn failing_table_create(self, status: StatusCode) -> Self {
        self.state.lock().unwrap().table_create_error = Some(status);
        self
    }

    pub fn fail_next_inserts(&self, n: usize) {
        self.state.lock().unwrap().fail_inserts = n;
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    /// Every insert request, failed ones included.
    pub fn attempts(&self) -> Vec<Vec<BufferedRow>> {
        self.state.lock().unwrap().attempts.clone()
    }

    /// Rows accepted by the sink, after dedup.
    pub fn delivered(&self) -> Vec<BufferedRow> {
        self.state.lock().unwrap().delivered.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn has_table(&self) -> bool {
        self.state.lock().unwrap().table
    }
}

impl Sink for MemorySink {
    fn dataset_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_ {
        async move {
            let result = {
                let mut s = self.state.lock().unwrap();
                s.calls.push("dataset_exists");
                match s.dataset_check_error {
                    Some(code) => Err(status(code, "dataset check failed")),
                    None => Ok(s.dataset),
                }
            };
            if let Some(d) = self.check_delay {
                tokio::time::sleep(d).await;
            }
            result
        }
    }

    fn create_dataset(&self) -> impl Future<Output = Result<(), SinkError>> + Send + '_ {
        async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("create_dataset");
            if s.dataset {
                return Err(status(StatusCode::CONFLICT, "Already Exists: Dataset"));
            }
            s.dataset = true;
            Ok(())
        }
    }

    fn table_exists(&self) -> impl Future<Output = Result<bool, SinkError>> + Send + '_ {
        async move {
            let exists = {
                let mut s = self.state.lock().unwrap();
                s.calls.push("table_exists");
                s.table
            };
            if let Some(d) = self.check_delay {
                tokio::time::sleep(d).await;
            }
            Ok(exists)
        }
    }

    fn create_table<'a>(
        &'a self,
        _schema: &'a TableSchema,
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a {
        async move {
            let mut s = self.state.lock().unwrap();
            s.calls.push("create_table");
            if let Some(code) = s.table_create_error {
                return Err(status(code, "table create failed"));
            }
            if s.table {
                return Err(status(StatusCode::CONFLICT, "Already Exists: Table"));
            }
            s.table = true;
            Ok(())
        }
    }

    fn insert_rows<'a>(
        &'a self,
        rows: &'a [BufferedRow],
    ) -> impl Future<Output = Result<(), SinkError>> + Send + 'a {
        async move {
            {
                let mut s = self.state.lock().unwrap();
                s.calls.push("insert_rows");
                s.attempts.push(rows.to_vec());
                s.in_flight += 1;
                s.max_in_flight = s.max_in_flight.max(s.in_flight);
            }

            if let Some(d) = self.insert_delay {
                tokio::time::sleep(d).await;
            }

            let mut s = self.state.lock().unwrap();
            s.in_flight -= 1;
            if s.fail_inserts > 0 {
                s.fail_inserts -= 1;
                return Err(status(StatusCode::SERVICE_UNAVAILABLE, "backend error"));
            }
            for r in rows {
                if s.seen_ids.insert(r.insert_id().to_owned()) {
                    s.delivered.push(r.clone());
                }
            }
            Ok(())
        }
    }
}
