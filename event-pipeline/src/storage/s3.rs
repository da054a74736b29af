use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as AwsS3SdkClient;
use tracing::info;

use crate::error::{ConfigurationError, WriteError};

use super::ObjectStore;

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

/// Writes partition objects to an S3 (or S3 compatible) bucket.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: AwsS3SdkClient,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: AwsS3SdkClient, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_settings(settings: &S3Settings) -> Self {
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let Some(endpoint) = &settings.endpoint {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if settings.force_path_style || settings.endpoint.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self::new(
            AwsS3SdkClient::from_conf(s3_config_builder.build()),
            settings.bucket.clone(),
        )
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Fail startup early when the bucket is missing or not reachable with our credentials.
    pub async fn check_bucket(&self) -> Result<(), ConfigurationError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| ConfigurationError::Invalid {
                name: "TARGET_CONTAINER",
                reason: format!(
                    "bucket {} is not reachable: {}",
                    self.bucket,
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ),
            })?;

        info!(bucket = %self.bucket, "target bucket reachable");
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), WriteError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(JSON_CONTENT_TYPE)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                WriteError::Backend(format!(
                    "Failed to put object {key} to S3: {}",
                    aws_sdk_s3::error::DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}
