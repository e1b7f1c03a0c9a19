use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::drain::{DrainController, DrainError};
use crate::flush_scheduler::FlushScheduler;
use crate::provisioner::{ProvisionError, Provisioner, ProvisioningState};
use crate::row::Row;
use crate::shaper::{AuditShaper, RecordShaper, ResultEvent};
use crate::sink::{Sink, TableSchema};

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Drain(#[from] DrainError),
}

/// Buffering and flush knobs, separate from how the sink is reached.
#[derive(Debug, Clone)]
pub struct ExporterOptions {
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub flush_tick: Duration,
    pub schema: TableSchema,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            batch_timeout: Duration::from_secs(10),
            flush_tick: Duration::from_secs(1),
            schema: TableSchema::audit_results(),
        }
    }
}

impl From<&Config> for ExporterOptions {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout,
            flush_tick: config.flush_tick,
            ..Self::default()
        }
    }
}

/// Size- or time-triggered batch writer in front of a [`Sink`].
///
/// Call [`init`](Self::init) before putting rows; rows put earlier are held
/// but refuse to dispatch. [`close`](Self::close) stops the timer and
/// flushes what is left.
pub struct Exporter<S> {
    sink: Arc<S>,
    drain: DrainController<S>,
    provisioner: tokio::sync::Mutex<Provisioner>,
    shaper: Arc<dyn RecordShaper>,
    batch_timeout: Duration,
    flush_tick: Duration,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl<S: Sink> Exporter<S> {
    pub fn new(sink: S, options: ExporterOptions) -> Self {
        Self::with_shared_sink(Arc::new(sink), options)
    }

    /// Several exporters over one sink, e.g. instances racing to provision.
    pub fn with_shared_sink(sink: Arc<S>, options: ExporterOptions) -> Self {
        Self {
            drain: DrainController::new(Arc::clone(&sink), options.batch_size),
            sink,
            provisioner: tokio::sync::Mutex::new(Provisioner::new(options.schema)),
            shaper: Arc::new(AuditShaper),
            batch_timeout: options.batch_timeout,
            flush_tick: options.flush_tick,
            scheduler: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_shaper(mut self, shaper: impl RecordShaper + 'static) -> Self {
        self.shaper = Arc::new(shaper);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn pending(&self) -> usize {
        self.drain.pending()
    }

    /// Provision the destination, then start the flush timer.
    ///
    /// Safe to call more than once; later calls reuse the cached state.
    pub async fn init(&self) -> Result<ProvisioningState, ExportError> {
        debug!("initialising exporter");
        let state = self
            .provisioner
            .lock()
            .await
            .ensure_destination_ready(self.sink.as_ref())
            .await?;
        self.drain.mark_provisioned();
        self.start_scheduler();
        info!(?state, "exporter ready");
        Ok(state)
    }

    fn start_scheduler(&self) {
        let mut slot = self.scheduler.lock().unwrap();
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let scheduler = FlushScheduler::new(self.flush_tick, self.batch_timeout);
        *slot = Some(scheduler.spawn(self.drain.clone(), self.cancel.clone()));
    }

    /// Buffer rows. Resolves after the drain they trigger, if any.
    pub async fn put_records(&self, rows: Vec<Row>) -> Result<(), ExportError> {
        Ok(self.drain.enqueue(rows).await?)
    }

    /// Shape `event` and buffer the resulting rows.
    pub async fn put_event(&self, event: &ResultEvent) -> Result<(), ExportError> {
        put_event(&self.drain, self.shaper.as_ref(), event).await
    }

    /// Consume `events` until the channel closes, shaping and buffering each.
    ///
    /// Failures go to `errors` without waiting. If that channel is full or
    /// closed, the error is logged and dropped.
    pub fn register_with(
        &self,
        mut events: mpsc::Receiver<ResultEvent>,
        errors: mpsc::Sender<ExportError>,
    ) -> JoinHandle<()> {
        let drain = self.drain.clone();
        let shaper = Arc::clone(&self.shaper);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Err(e) = put_event(&drain, shaper.as_ref(), &event).await else {
                    continue;
                };
                match errors.try_send(e) {
                    Ok(()) => {}
                    Err(TrySendError::Full(e)) => {
                        warn!(error = %e, "error channel full, dropping export error");
                    }
                    Err(TrySendError::Closed(e)) => {
                        warn!(error = %e, "error channel closed, dropping export error");
                    }
                }
            }
            debug!("event source closed");
        })
    }

    /// Stop the flush timer, wait for any running drain, then flush the rest.
    pub async fn close(&self) -> Result<(), ExportError> {
        self.cancel.cancel();
        let scheduler = self.scheduler.lock().unwrap().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "flush scheduler task failed");
            }
        }
        let pending = self.drain.pending();
        self.drain.flush().await?;
        debug!(rows = pending, "exporter closed");
        Ok(())
    }
}

async fn put_event<S: Sink>(
    drain: &DrainController<S>,
    shaper: &dyn RecordShaper,
    event: &ResultEvent,
) -> Result<(), ExportError> {
    let Some(advanced) = &event.result.advanced else {
        debug!(test = %event.test.name, "result has no advanced section, skipping");
        return Ok(());
    };
    debug!(url = %advanced.url, "received result");
    Ok(drain.enqueue(shaper.shape(event)).await?)
}
