// Each integration test compiles this module independently via `mod support;`,
// so items used by one test appear unused in others.
#![allow(unused)]

use std::net::SocketAddr;
use std::time::Duration;

use batch_exporter::config::{Compression, Destination};
use batch_exporter::{Config, Exporter, ExporterOptions, HttpSink, ResultEvent};
use fake_sink::FakeSink;
use serde_json::json;

pub const PROJECT: &str = "perf";
pub const DATASET: &str = "audits";
pub const TABLE: &str = "results";
pub const TABLE_KEY: &str = "perf:audits.results";

pub fn install_rustls() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// A running fake sink and the address it listens on.
pub struct TestSink {
    pub sink: FakeSink,
    pub addr: SocketAddr,
}

impl TestSink {
    pub async fn start(sink: FakeSink) -> Self {
        install_rustls();
        let addr = sink
            .start(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("failed to start fake sink");
        Self { sink, addr }
    }

    pub async fn empty() -> Self {
        Self::start(FakeSink::new()).await
    }

    pub async fn provisioned() -> Self {
        Self::start(FakeSink::new().with_table(PROJECT, DATASET, TABLE)).await
    }

    pub fn config(&self) -> Config {
        Config {
            endpoint: format!("http://{}/bigquery/v2", self.addr).parse().unwrap(),
            destination: Destination {
                project: PROJECT.to_owned(),
                dataset: DATASET.to_owned(),
                table: TABLE.to_owned(),
            },
            batch_size: 500,
            batch_timeout: Duration::from_secs(60),
            flush_tick: Duration::from_millis(50),
            export_timeout: Duration::from_secs(5),
            compression: Compression::Gzip,
            export_headers: Vec::new(),
            listener_port: 0,
        }
    }

    pub fn exporter(&self, config: &Config) -> Exporter<HttpSink> {
        let sink = HttpSink::new(config).expect("failed to build sink client");
        Exporter::new(sink, ExporterOptions::from(config))
    }
}

pub fn audit_event(audits: usize) -> ResultEvent {
    let audits: Vec<_> = (0..audits)
        .map(|i| json!({ "id": format!("audit-{i}"), "score": i, "rawValue": format!("{}ms", i * 100) }))
        .collect();
    serde_json::from_value(json!({
        "result": { "advanced": { "url": "https://example.com/", "audits": audits } },
        "test": { "name": "homepage", "url": "https://example.com" }
    }))
    .unwrap()
}
