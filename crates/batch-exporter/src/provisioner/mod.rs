use thiserror::Error;
use tracing::{debug, info};

use crate::sink::{Sink, SinkError, TableSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Unknown,
    /// The table was missing; this instance or a racing one created it.
    Created,
    Existing,
}

impl ProvisioningState {
    pub fn is_ready(self) -> bool {
        !matches!(self, ProvisioningState::Unknown)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to check if dataset exists: {0}")]
    DatasetCheck(#[source] SinkError),

    #[error("failed to create dataset: {0}")]
    DatasetCreate(#[source] SinkError),

    #[error("failed to check if table exists: {0}")]
    TableCheck(#[source] SinkError),

    #[error("failed to create table: {0}")]
    TableCreate(#[source] SinkError),
}

/// Makes sure the destination dataset and table exist before anything is
/// dispatched. The outcome is cached: once ready, later calls do not touch
/// the sink.
pub struct Provisioner {
    schema: TableSchema,
    state: ProvisioningState,
}

impl Provisioner {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            state: ProvisioningState::Unknown,
        }
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    pub async fn ensure_destination_ready<S: Sink>(
        &mut self,
        sink: &S,
    ) -> Result<ProvisioningState, ProvisionError> {
        if self.state.is_ready() {
            debug!(state = ?self.state, "destination already provisioned");
            return Ok(self.state);
        }

        ensure_dataset(sink).await?;
        self.state = ensure_table(sink, &self.schema).await?;
        Ok(self.state)
    }
}

async fn ensure_dataset<S: Sink>(sink: &S) -> Result<(), ProvisionError> {
    if sink
        .dataset_exists()
        .await
        .map_err(ProvisionError::DatasetCheck)?
    {
        return Ok(());
    }

    info!("creating dataset");
    match sink.create_dataset().await {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => {
            info!("dataset already exists (concurrent create)");
            Ok(())
        }
        Err(e) => Err(ProvisionError::DatasetCreate(e)),
    }
}

async fn ensure_table<S: Sink>(
    sink: &S,
    schema: &TableSchema,
) -> Result<ProvisioningState, ProvisionError> {
    if sink
        .table_exists()
        .await
        .map_err(ProvisionError::TableCheck)?
    {
        debug!("table already exists");
        return Ok(ProvisioningState::Existing);
    }

    info!(fields = schema.fields.len(), "creating table");
    match sink.create_table(schema).await {
        Ok(()) => {
            info!("created table");
            Ok(ProvisioningState::Created)
        }
        // Another exporter instance created it between our check and create.
        Err(e) if e.is_conflict() => {
            info!("table already exists (concurrent create)");
            Ok(ProvisioningState::Created)
        }
        Err(e) => Err(ProvisionError::TableCreate(e)),
    }
}
