mod support;

use std::collections::HashSet;
use std::time::Duration;

use batch_exporter::config::Compression;
use batch_exporter::Row;

use support::{TABLE_KEY, TestSink, audit_event};

fn numbered(n: i64) -> Row {
    Row::builder().field("score", n).field("name", "direct").build()
}

#[tokio::test]
async fn size_threshold_sends_full_batches() {
    let harness = TestSink::provisioned().await;
    let mut config = harness.config();
    config.batch_size = 2;
    let exporter = harness.exporter(&config);
    exporter.init().await.unwrap();

    exporter.put_records(vec![numbered(1)]).await.unwrap();
    assert!(harness.sink.rows().is_empty());

    exporter.put_records(vec![numbered(2)]).await.unwrap();
    assert_eq!(harness.sink.rows().len(), 2);

    exporter.put_records(vec![numbered(3)]).await.unwrap();
    assert_eq!(exporter.pending(), 1);

    exporter.close().await.unwrap();
    let rows = harness.sink.rows();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.table == TABLE_KEY));
    let scores: Vec<i64> = rows.iter().map(|r| r.json["score"].as_i64().unwrap()).collect();
    assert_eq!(scores, vec![1, 2, 3]);
}

#[tokio::test]
async fn timer_flushes_idle_buffer() {
    let harness = TestSink::provisioned().await;
    let mut config = harness.config();
    config.batch_timeout = Duration::from_millis(200);
    let exporter = harness.exporter(&config);
    exporter.init().await.unwrap();

    exporter.put_records(vec![numbered(1)]).await.unwrap();
    let rows = harness.sink.wait_for_rows(1, Duration::from_secs(5)).await;

    assert_eq!(rows.len(), 1);
    assert_eq!(exporter.pending(), 0);
    exporter.close().await.unwrap();
}

#[tokio::test]
async fn close_sends_all_pending_rows() {
    let harness = TestSink::provisioned().await;
    let exporter = harness.exporter(&harness.config());
    exporter.init().await.unwrap();

    exporter
        .put_records((1..=5).map(numbered).collect())
        .await
        .unwrap();
    assert!(harness.sink.rows().is_empty());

    exporter.close().await.unwrap();
    assert_eq!(harness.sink.rows().len(), 5);
    assert_eq!(harness.sink.insert_requests(), 1);
}

#[tokio::test]
async fn failed_insert_is_retried_without_duplicates() {
    let harness = TestSink::provisioned().await;
    let mut config = harness.config();
    config.batch_size = 3;
    let exporter = harness.exporter(&config);
    exporter.init().await.unwrap();
    harness.sink.fail_next_inserts(1);

    let err = exporter
        .put_records((1..=3).map(numbered).collect())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"), "{err}");
    assert_eq!(exporter.pending(), 3);

    exporter.close().await.unwrap();

    let rows = harness.sink.rows();
    assert_eq!(rows.len(), 3);
    assert_eq!(harness.sink.insert_requests(), 2);
    let ids: HashSet<&str> = rows.iter().map(|r| r.insert_id.as_str()).collect();
    assert_eq!(ids.len(), 3);
}

#[tokio::test]
async fn shaped_events_land_as_flat_rows() {
    let harness = TestSink::provisioned().await;
    let exporter = harness.exporter(&harness.config());
    exporter.init().await.unwrap();

    exporter.put_event(&audit_event(2)).await.unwrap();
    exporter.close().await.unwrap();

    let rows = harness.sink.rows();
    assert_eq!(rows.len(), 2);
    let second = &rows[1].json;
    assert_eq!(second["type"], "audit-1");
    assert_eq!(second["score"], 1);
    assert_eq!(second["raw_value"], 100);
    assert_eq!(second["name"], "homepage");
    assert_eq!(second["url"], "https://example.com");
    let tested_at = second["tested_at"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(tested_at).is_ok(), "{tested_at}");
}

#[tokio::test]
async fn uncompressed_bodies_and_static_headers() {
    let harness = TestSink::provisioned().await;
    let mut config = harness.config();
    config.compression = Compression::None;
    config.export_headers = vec![("x-api-key".to_owned(), "secret".to_owned())];
    let exporter = harness.exporter(&config);
    exporter.init().await.unwrap();

    exporter.put_records(vec![numbered(7)]).await.unwrap();
    exporter.close().await.unwrap();

    assert_eq!(harness.sink.rows().len(), 1);
    let requests = harness.sink.requests();
    assert!(requests.iter().all(|r| r.content_encoding.is_none()));
    assert!(
        requests
            .iter()
            .all(|r| r.headers.get("x-api-key").map(String::as_str) == Some("secret"))
    );
}

#[tokio::test]
async fn gzip_bodies_are_marked() {
    let harness = TestSink::provisioned().await;
    let exporter = harness.exporter(&harness.config());
    exporter.init().await.unwrap();

    exporter.put_records(vec![numbered(1)]).await.unwrap();
    exporter.close().await.unwrap();

    let insert = harness
        .sink
        .requests()
        .into_iter()
        .find(|r| r.path.ends_with("/insertAll"))
        .expect("insert request sent");
    assert_eq!(insert.content_encoding.as_deref(), Some("gzip"));
    assert_eq!(harness.sink.rows()[0].json["name"], "direct");
}
