use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, ExtractError, FetchError};
use crate::models::Record;
use crate::orchestrator::RunResult;

/// Performs one network or browser operation against a target.
///
/// Implementations should honour `timeout` and stop early when `cancel`
/// fires, returning [`FetchError::Cancelled`]. The core also enforces both.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        target: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<String, FetchError>> + Send;
}

/// Turns raw page content into a partially-filled record.
pub trait Extractor: Send + Sync + Clone {
    fn extract(&self, raw: &str) -> Result<Record, ExtractError>;
}

/// Receives finished results; format and persistence are its own concern.
pub trait Exporter {
    fn export(&mut self, result: &RunResult) -> Result<(), AppError>;

    /// Flush buffered output once the run is over.
    fn finish(&mut self) -> Result<(), AppError> {
        Ok(())
    }
}

/// An Exporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExporter;

impl Exporter for NullExporter {
    fn export(&mut self, _result: &RunResult) -> Result<(), AppError> {
        Ok(())
    }
}
