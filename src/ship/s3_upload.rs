// vault-backup/src/ship/s3_upload.rs
use aws_config::SdkConfig;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use std::path::Path;
use tracing::info;

use crate::errors::{BackupError, Result};

/// Loads AWS settings from the default provider chain, pinning the region and
/// endpoint when given.
pub async fn load_sdk_config(region: Option<&str>, endpoint_url: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    if let Some(endpoint_url) = endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    loader.load().await
}

/// Uploads a file to an S3 bucket.
pub async fn upload_file_to_s3(
    sdk_config: &SdkConfig,
    bucket: &str,
    file_path: &Path,
    s3_key: &str,
) -> Result<()> {
    info!(
        "Uploading {} to S3 bucket {} with key {}",
        file_path.display(),
        bucket,
        s3_key
    );

    let client = s3::Client::new(sdk_config);

    let body = ByteStream::from_path(file_path).await.map_err(|e| {
        BackupError::ShipmentFailed(format!(
            "failed to read {} for upload: {}",
            file_path.display(),
            e
        ))
    })?;

    client
        .put_object()
        .bucket(bucket)
        .key(s3_key)
        .body(body)
        .send()
        .await
        .map_err(|e| {
            BackupError::ShipmentFailed(format!(
                "failed to upload {} to s3://{}/{}: {}",
                file_path.display(),
                bucket,
                s3_key,
                DisplayErrorContext(e)
            ))
        })?;

    info!("✅ Uploaded file {} to {}", s3_key, bucket);
    Ok(())
}
