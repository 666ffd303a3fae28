//! Request pipeline: fetch, filter, store and announce a single file.

use crate::config::Config;
use crate::filter::{CsvProcessor, FilterSummary};
use crate::location::{LocationError, ObjectLocation};
use crate::model::{FilterRequest, TransformRequest};
use crate::producer::NotificationPublisher;
use crate::storage::{ObjectReader, ObjectStore};
use std::any::Any;
use std::io::{BufWriter, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Failure of a pipeline stage. `Display` is the message returned to callers.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unsupported file type.")]
    UnsupportedFileType { expected: String, actual: String },

    #[error("{0}")]
    UpstreamFetchFailed(String),

    #[error("{0}")]
    Filtering(String),

    #[error("Failed to create scratch file: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("Invalid notification location: {0}")]
    NotificationConstructionFailed(#[from] LocationError),

    #[error("{0}")]
    UpstreamUploadFailed(String),
}

/// Static pipeline settings
#[derive(Debug, Clone)]
pub struct FilterSettings {
    /// Accepted source extension, without the dot
    pub file_extension: String,
    /// Bucket (and optional folder) receiving filtered files
    pub intermediate_bucket: String,
    /// Directory for scratch files
    pub scratch_dir: PathBuf,
}

impl FilterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            file_extension: config.filter.file_extension.clone(),
            intermediate_bucket: config.filter.intermediate_bucket.clone(),
            scratch_dir: config.scratch_dir(),
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutcome {
    /// Where the filtered file was stored
    pub filtered_location: ObjectLocation,
    pub summary: FilterSummary,
}

/// Runs filter requests against the injected collaborators
pub struct FilterService {
    store: Arc<dyn ObjectStore>,
    processor: Arc<dyn CsvProcessor>,
    publisher: Arc<dyn NotificationPublisher>,
    settings: FilterSettings,
}

impl FilterService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        processor: Arc<dyn CsvProcessor>,
        publisher: Arc<dyn NotificationPublisher>,
        settings: FilterSettings,
    ) -> Self {
        Self {
            store,
            processor,
            publisher,
            settings,
        }
    }

    /// Run the whole pipeline for one request.
    ///
    /// Stops at the first failing stage. A notification that cannot be
    /// published is logged and does not fail the run.
    #[instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn handle(&self, request: &FilterRequest) -> Result<FilterOutcome, PipelineError> {
        let start = Instant::now();
        let result = self.run(request).await;

        metrics::histogram!("csv_filter.pipeline.duration_seconds")
            .record(start.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                metrics::counter!("csv_filter.requests.succeeded").increment(1);
                info!(
                    request_id = %request.request_id,
                    filtered_location = %outcome.filtered_location,
                    rows_read = outcome.summary.rows_read,
                    rows_written = outcome.summary.rows_written,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Filter request completed"
                );
            }
            Err(e) => {
                metrics::counter!("csv_filter.requests.failed").increment(1);
                error!(
                    request_id = %request.request_id,
                    error = %e,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Filter request failed"
                );
            }
        }

        result
    }

    async fn run(&self, request: &FilterRequest) -> Result<FilterOutcome, PipelineError> {
        self.validate_file_type(&request.input_url)?;

        let reader = self
            .store
            .fetch(&request.request_id, &request.input_url)
            .await
            .map_err(|e| PipelineError::UpstreamFetchFailed(e.to_string()))?;

        let scratch = ScratchFile::new(&self.settings.scratch_dir);
        let result = self.filter_and_store(request, reader, &scratch).await;
        scratch.release(&request.request_id).await;
        let (filtered_location, summary) = result?;

        let notification = TransformRequest::new(
            request.request_id.clone(),
            filtered_location.clone(),
            request.output_url.clone(),
        );
        self.announce(&notification).await;

        Ok(FilterOutcome {
            filtered_location,
            summary,
        })
    }

    fn validate_file_type(&self, location: &ObjectLocation) -> Result<(), PipelineError> {
        let actual = location.extension().unwrap_or_default();
        if actual != self.settings.file_extension {
            return Err(PipelineError::UnsupportedFileType {
                expected: self.settings.file_extension.clone(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    async fn filter_and_store(
        &self,
        request: &FilterRequest,
        reader: ObjectReader,
        scratch: &ScratchFile,
    ) -> Result<(ObjectLocation, FilterSummary), PipelineError> {
        let summary = self.filter_to_scratch(request, reader, scratch).await?;

        let filtered_location = ObjectLocation::under_prefix(
            &self.settings.intermediate_bucket,
            request.output_url.file_name(),
        )?;

        let body = tokio::fs::File::open(scratch.path())
            .await
            .map_err(PipelineError::Scratch)?;

        self.store
            .store(&request.request_id, Box::pin(body), &filtered_location)
            .await
            .map_err(|e| PipelineError::UpstreamUploadFailed(e.to_string()))?;

        Ok((filtered_location, summary))
    }

    /// Filter the download into the scratch file on a blocking worker.
    ///
    /// Panics in the processor stop at the join boundary and come back as
    /// [`PipelineError::Filtering`].
    async fn filter_to_scratch(
        &self,
        request: &FilterRequest,
        reader: ObjectReader,
        scratch: &ScratchFile,
    ) -> Result<FilterSummary, PipelineError> {
        let file = tokio::fs::File::create(scratch.path())
            .await
            .map_err(PipelineError::Scratch)?
            .into_std()
            .await;

        debug!(
            request_id = %request.request_id,
            scratch = %scratch.path().display(),
            "Created scratch file"
        );

        let processor = Arc::clone(&self.processor);
        let request_id = request.request_id.clone();
        let dimensions = request.dimensions.clone();
        let mut input = SyncIoBridge::new(reader);

        let joined = tokio::task::spawn_blocking(move || {
            let mut output = BufWriter::new(file);
            processor.process(&request_id, &mut input, &mut output, &dimensions)
        })
        .await;

        match joined {
            Ok(Ok(summary)) => Ok(summary),
            Ok(Err(e)) => Err(PipelineError::Filtering(e.to_string())),
            Err(e) => Err(PipelineError::Filtering(join_failure_message(e))),
        }
    }

    async fn announce(&self, notification: &TransformRequest) {
        match self.publisher.publish(notification).await {
            Ok(delivery) => {
                debug!(
                    request_id = %notification.request_id,
                    topic = %delivery.topic,
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "Transform request published"
                );
            }
            Err(e) => {
                metrics::counter!("csv_filter.notifications.failed").increment(1);
                error!(
                    request_id = %notification.request_id,
                    notification = %notification,
                    error = %e,
                    "Failed to publish transform request"
                );
            }
        }
    }
}

fn join_failure_message(err: JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        "filter task was cancelled".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "filter task panicked".to_string()
    }
}

/// Per-run scratch file, unique within the scratch directory
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(format!("csv_filter_{}.csv", Uuid::new_v4())),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file; failures are only logged
    async fn release(&self, request_id: &str) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    request_id = %request_id,
                    scratch = %self.path.display(),
                    error = %e,
                    "Failed to remove scratch file"
                );
            }
        }
    }
}
