use std::future::Future;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::exporter::{ExportError, Exporter};
use crate::ingest_listener::{self, Inbound};
use crate::shaper::ResultEvent;
use crate::sink::Sink;

/// Owns the exporter and the channels feeding it for the binary's select!
/// loop.
///
/// Constructed in `main()` after `init()`, then driven by `run()`. The
/// listener task is aborted on drop.
pub struct EventLoop<S: Sink> {
    exporter: Exporter<S>,
    inbound_rx: mpsc::Receiver<Inbound>,
    events_tx: Option<mpsc::Sender<ResultEvent>>,
    errors_rx: mpsc::Receiver<ExportError>,
    cancel: CancellationToken,
    listener_task: JoinHandle<()>,
    register_task: Option<JoinHandle<()>>,
}

impl<S: Sink> EventLoop<S> {
    /// Spawn the ingest listener on `listener` and subscribe the exporter to
    /// shaped events.
    pub fn new(exporter: Exporter<S>, listener: TcpListener) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(128);
        Self::with_inbound(exporter, listener, inbound_tx, inbound_rx)
    }

    /// Like [`new`](Self::new), with the caller's inbound channel. Anything
    /// holding a clone of `inbound_tx` feeds the loop alongside the listener.
    pub(crate) fn with_inbound(
        exporter: Exporter<S>,
        listener: TcpListener,
        inbound_tx: mpsc::Sender<Inbound>,
        inbound_rx: mpsc::Receiver<Inbound>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel::<ResultEvent>(128);
        let (errors_tx, errors_rx) = mpsc::channel::<ExportError>(16);

        let listener_task = tokio::spawn(ingest_listener::serve(
            listener,
            inbound_tx,
            cancel.clone(),
        ));
        let register_task = exporter.register_with(events_rx, errors_tx);

        Self {
            exporter,
            inbound_rx,
            events_tx: Some(events_tx),
            errors_rx,
            cancel,
            listener_task,
            register_task: Some(register_task),
        }
    }

    /// Multiplex inbound payloads and export errors until `shutdown`
    /// resolves, then drain what is left and close the exporter.
    ///
    /// Returns the final flush's error, if any.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<(), ExportError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("shutdown requested");
                    break;
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    self.forward(inbound).await;
                }
                Some(e) = self.errors_rx.recv() => {
                    error!(error = %e, "export failed");
                }
            }
        }

        self.shutdown().await
    }

    async fn forward(&self, inbound: Inbound) {
        match inbound {
            Inbound::Event(event) => {
                let Some(tx) = &self.events_tx else {
                    return;
                };
                if tx.send(event).await.is_err() {
                    warn!("event subscriber gone, dropping result");
                }
            }
            Inbound::Rows(rows) => {
                let count = rows.len();
                if let Err(e) = self.exporter.put_records(rows).await {
                    warn!(rows = count, error = %e, "failed to export rows");
                }
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), ExportError> {
        self.cancel.cancel();

        // Payloads accepted before the listener stopped still get exported.
        self.inbound_rx.close();
        while let Some(inbound) = self.inbound_rx.recv().await {
            self.forward(inbound).await;
        }

        self.events_tx.take();
        if let Some(task) = self.register_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "event subscriber task failed");
            }
        }
        while let Ok(e) = self.errors_rx.try_recv() {
            error!(error = %e, "export failed");
        }

        let result = self.exporter.close().await;
        if let Err(e) = &result {
            error!(error = %e, pending = self.exporter.pending(), "shutdown flush failed");
        }
        result
    }

    pub fn exporter(&self) -> &Exporter<S> {
        &self.exporter
    }
}

impl<S: Sink> Drop for EventLoop<S> {
    fn drop(&mut self) {
        self.listener_task.abort();
        if let Some(task) = &self.register_task {
            task.abort();
        }
    }
}
