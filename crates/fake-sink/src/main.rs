use std::net::SocketAddr;

use fake_sink::FakeSink;
use tracing::info;

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    tracing_subscriber::registry()
        .with(LevelFilter::DEBUG)
        .with(tracing_microjson::JsonLayer::new(std::io::stdout).with_target(true))
        .init();
}

#[tokio::main]
async fn main() {
    setup_logging();

    let port: u16 = std::env::var("FAKE_SINK_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9050);

    let sink = FakeSink::new();
    let addr = sink
        .start(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .expect("failed to bind fake sink listener");
    info!(%addr, "fake sink listening");

    let _ = tokio::signal::ctrl_c().await;
    info!(rows = sink.rows().len(), "fake sink stopping");
}
