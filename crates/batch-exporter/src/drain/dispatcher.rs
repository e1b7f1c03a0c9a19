use std::sync::Arc;

use tracing::{debug, warn};

use crate::row::BufferedRow;
use crate::sink::{Sink, SinkError};

/// Sends one batch as one insert request.
///
/// Putting a failed batch back is the caller's job; this only reports.
pub struct BatchDispatcher<S> {
    sink: Arc<S>,
}

impl<S: Sink> BatchDispatcher<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { sink }
    }

    pub async fn dispatch(&self, batch: &[BufferedRow]) -> Result<(), SinkError> {
        match self.sink.insert_rows(batch).await {
            Ok(()) => {
                debug!(rows = batch.len(), "dispatched rows");
                Ok(())
            }
            Err(e) => {
                warn!(rows = batch.len(), error = %e, "failed to dispatch rows");
                Err(e)
            }
        }
    }
}
