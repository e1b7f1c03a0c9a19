use batch_exporter::event_loop::EventLoop;
use batch_exporter::{Config, Exporter, ExporterOptions, HttpSink};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

/// Exceptional init failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("BATCH_EXPORTER_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid BATCH_EXPORTER_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        fatal("failed to install rustls ring provider", &"provider already set");
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));
    let sink = HttpSink::new(&config).unwrap_or_else(|e| fatal("failed to build sink client", &e));
    let exporter = Exporter::new(sink, ExporterOptions::from(&config));

    if let Err(e) = exporter.init().await {
        fatal("failed to provision destination", &e);
    }

    let listener = TcpListener::bind(("127.0.0.1", config.listener_port))
        .await
        .unwrap_or_else(|e| fatal("failed to bind ingest listener", &e));
    info!(port = config.listener_port, "listening for results");

    let mut event_loop = EventLoop::new(exporter, listener);
    if let Err(e) = event_loop.run(shutdown_signal()).await {
        fatal("rows left unexported at shutdown", &e);
    }
}
