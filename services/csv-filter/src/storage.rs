use crate::config::S3Config;
use crate::location::ObjectLocation;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use std::io::Cursor;
use std::pin::Pin;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument, warn};

/// Streaming object body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Errors returned by an [`ObjectStore`]
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to fetch {location}: {message}")]
    Fetch { location: String, message: String },

    #[error("Failed to upload {location}: {message}")]
    Upload { location: String, message: String },

    #[error("Failed to read upload source: {0}")]
    Source(#[from] std::io::Error),
}

/// Blob store holding source and filtered files
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open the object at `location` for streaming reads
    async fn fetch(
        &self,
        request_id: &str,
        location: &ObjectLocation,
    ) -> Result<ObjectReader, StorageError>;

    /// Write everything from `reader` to `location`
    async fn store(
        &self,
        request_id: &str,
        reader: ObjectReader,
        location: &ObjectLocation,
    ) -> Result<(), StorageError>;
}

/// S3-backed [`ObjectStore`]
pub struct S3Store {
    client: S3Client,
    config: S3Config,
}

impl S3Store {
    /// Create a new S3 store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 store initialized"
        );

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Single PutObject for small bodies
    async fn simple_upload(
        &self,
        location: &ObjectLocation,
        body: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(location.bucket())
            .key(location.key())
            .content_type("text/csv")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| upload_error(location, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for bodies above the threshold
    async fn multipart_upload(
        &self,
        location: &ObjectLocation,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), StorageError> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(location.bucket())
            .key(location.key())
            .content_type("text/csv")
            .send()
            .await
            .map_err(|e| upload_error(location, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| upload_error(location, "no upload ID in response"))?
            .to_string();

        match self.upload_parts(location, &upload_id, source).await {
            Ok(completed_parts) => {
                let completed_upload = CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build();

                self.client
                    .complete_multipart_upload()
                    .bucket(location.bucket())
                    .key(location.key())
                    .upload_id(&upload_id)
                    .multipart_upload(completed_upload)
                    .send()
                    .await
                    .map_err(|e| upload_error(location, DisplayErrorContext(&e)))?;

                Ok(())
            }
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(location.bucket())
                    .key(location.key())
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        error = %DisplayErrorContext(&abort_err),
                        upload_id = %upload_id,
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        location: &ObjectLocation,
        upload_id: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size_bytes;
        let mut completed_parts = Vec::new();
        let mut part_number = 1;

        loop {
            let chunk = read_up_to(source, part_size).await?;
            if chunk.is_empty() {
                break;
            }
            let last = chunk.len() < part_size;

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(location.bucket())
                .key(location.key())
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| upload_error(location, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;

            if last {
                break;
            }
        }

        debug!(parts = completed_parts.len(), "Uploaded multipart parts");
        Ok(completed_parts)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(bucket = %location.bucket(), key = %location.key()))]
    async fn fetch(
        &self,
        request_id: &str,
        location: &ObjectLocation,
    ) -> Result<ObjectReader, StorageError> {
        let start = Instant::now();

        debug!(request_id = %request_id, "Requesting csv file from S3");

        let response = self
            .client
            .get_object()
            .bucket(location.bucket())
            .key(location.key())
            .send()
            .await
            .map_err(|e| StorageError::Fetch {
                location: location.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        debug!(
            request_id = %request_id,
            content_length = ?response.content_length(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Fetched object"
        );

        Ok(Box::pin(response.body.into_async_read()))
    }

    #[instrument(skip(self, reader), fields(bucket = %location.bucket(), key = %location.key()))]
    async fn store(
        &self,
        request_id: &str,
        mut reader: ObjectReader,
        location: &ObjectLocation,
    ) -> Result<(), StorageError> {
        let start = Instant::now();
        let threshold = self.config.multipart_threshold_bytes;

        // One byte past the threshold tells us whether multipart is needed
        let head = read_up_to(&mut reader, threshold + 1).await?;
        let size_hint = head.len();

        if head.len() <= threshold {
            self.simple_upload(location, head).await?;
        } else {
            let mut source = Cursor::new(head).chain(reader);
            self.multipart_upload(location, &mut source).await?;
        }

        info!(
            request_id = %request_id,
            location = %location,
            multipart = size_hint > threshold,
            duration_ms = start.elapsed().as_millis() as u64,
            "Upload successful"
        );

        Ok(())
    }
}

fn upload_error(location: &ObjectLocation, message: impl std::fmt::Display) -> StorageError {
    StorageError::Upload {
        location: location.to_string(),
        message: message.to_string(),
    }
}

/// Read until `limit` bytes are buffered or the source is exhausted
async fn read_up_to<R>(source: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = Vec::with_capacity(limit.min(64 * 1024));
    source.take(limit as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
