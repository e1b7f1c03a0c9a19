use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::buffers::RowBuffer;
use crate::row::{BufferedRow, Row};
use crate::sink::{Sink, SinkError};

mod dispatcher;

pub use dispatcher::BatchDispatcher;

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("destination is not provisioned yet, holding {pending} rows")]
    NotProvisioned { pending: usize },

    #[error("batch dispatch failed: {0}")]
    Dispatch(#[from] SinkError),
}

enum Begin {
    Started,
    Busy,
    /// Not provisioned and nothing queued.
    Nothing,
}

struct DrainState {
    buffer: RowBuffer,
    draining: bool,
    last_flush: Instant,
    provisioned: bool,
}

struct Inner<S> {
    dispatcher: BatchDispatcher<S>,
    batch_size: usize,
    state: Mutex<DrainState>,
    idle: Notify,
}

/// Owns the row buffer and runs at most one drain at a time.
///
/// Every trigger (size threshold, scheduler tick, shutdown) goes through
/// [`DrainController::drain`]. A call that arrives while a drain is running
/// returns at once; the running drain re-reads the queue after each batch,
/// so rows enqueued meanwhile go out with it.
///
/// Uses `std::sync::Mutex` because the lock is never held across `.await`.
pub struct DrainController<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for DrainController<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Sink> DrainController<S> {
    pub fn new(sink: Arc<S>, batch_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: BatchDispatcher::new(sink),
                batch_size: batch_size.max(1),
                state: Mutex::new(DrainState {
                    buffer: RowBuffer::new(),
                    draining: false,
                    last_flush: Instant::now(),
                    provisioned: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    /// Allow dispatch. Until this is called, drains refuse to send anything.
    pub fn mark_provisioned(&self) {
        self.inner.state.lock().unwrap().provisioned = true;
    }

    pub fn pending(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().unwrap().draining
    }

    /// When the last drain started.
    pub fn last_flush(&self) -> Instant {
        self.inner.state.lock().unwrap().last_flush
    }

    /// Copy of the queued rows, front first.
    pub fn snapshot(&self) -> Vec<BufferedRow> {
        self.inner
            .state
            .lock()
            .unwrap()
            .buffer
            .iter()
            .cloned()
            .collect()
    }

    /// Buffer `rows`. If the queue reaches the batch size, drain and return
    /// the drain's result.
    pub async fn enqueue(&self, rows: Vec<Row>) -> Result<(), DrainError> {
        if rows.is_empty() {
            return Ok(());
        }
        let len = self.inner.state.lock().unwrap().buffer.push_rows(rows);
        if len >= self.inner.batch_size {
            debug!(pending = len, "batch size reached, draining");
            return self.drain().await;
        }
        Ok(())
    }

    /// Dispatch batches until the buffer is empty or a dispatch fails.
    /// No-op if a drain is already running.
    pub async fn drain(&self) -> Result<(), DrainError> {
        match self.try_begin()? {
            Begin::Started => self.run().await,
            Begin::Busy => {
                debug!("drain already in progress");
                Ok(())
            }
            Begin::Nothing => Ok(()),
        }
    }

    /// Like [`drain`](Self::drain), but waits out a running drain and then
    /// runs one of its own, so the buffer is empty (or an error is returned)
    /// when this resolves.
    pub async fn flush(&self) -> Result<(), DrainError> {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            match self.try_begin()? {
                Begin::Started => return self.run().await,
                Begin::Nothing => return Ok(()),
                Begin::Busy => idle.await,
            }
        }
    }

    /// Claim the single drain slot.
    fn try_begin(&self) -> Result<Begin, DrainError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.draining {
            return Ok(Begin::Busy);
        }
        if !state.provisioned {
            if state.buffer.is_empty() {
                return Ok(Begin::Nothing);
            }
            return Err(DrainError::NotProvisioned {
                pending: state.buffer.len(),
            });
        }
        state.draining = true;
        state.last_flush = Instant::now();
        Ok(Begin::Started)
    }

    async fn run(&self) -> Result<(), DrainError> {
        let mut guard = DrainGuard {
            inner: &self.inner,
            in_flight: Vec::new(),
            released: false,
        };

        loop {
            // Emptiness is checked and the slot released under one lock, so an
            // enqueue that lands after this point starts its own drain.
            {
                let mut state = self.inner.state.lock().unwrap();
                guard.in_flight = state.buffer.take_batch(self.inner.batch_size);
                if guard.in_flight.is_empty() {
                    state.draining = false;
                    guard.released = true;
                }
            }
            if guard.released {
                self.inner.idle.notify_waiters();
                return Ok(());
            }

            self.inner.dispatcher.dispatch(&guard.in_flight).await?;
            guard.in_flight.clear();
        }
    }
}

/// Holds the drain slot and the batch currently on the wire.
///
/// Dropped without being released (dispatch error, or the drain future was
/// cancelled): the batch goes back to the front of the buffer and the slot
/// is freed.
struct DrainGuard<'a, S> {
    inner: &'a Inner<S>,
    in_flight: Vec<BufferedRow>,
    released: bool,
}

impl<S> Drop for DrainGuard<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let batch = std::mem::take(&mut self.in_flight);
        let requeued = batch.len();
        {
            let mut state = match self.inner.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.buffer.prepend(batch);
            state.draining = false;
        }
        if requeued > 0 {
            warn!(rows = requeued, "requeued failed batch at front of buffer");
        }
        self.inner.idle.notify_waiters();
    }
}
