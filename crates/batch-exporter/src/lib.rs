//! Buffered batch export of flat result rows to an append-only table sink.
//!
//! Rows are queued in memory and written in bounded batches whenever the
//! queue reaches the batch size or the flush timeout passes. The destination
//! dataset and table are created on first start if missing.

mod buffers;
pub mod config;
pub mod drain;
pub mod event_loop;
pub mod exporter;
pub mod flush_scheduler;
pub mod ingest_listener;
pub mod provisioner;
pub mod row;
pub mod shaper;
pub mod sink;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use exporter::{ExportError, Exporter, ExporterOptions};
pub use row::{BufferedRow, Row, Value};
pub use shaper::{AuditShaper, RecordShaper, ResultEvent};
pub use sink::{HttpSink, Sink, SinkError, TableSchema};
