// vault-backup/src/ship/mod.rs
//! Hands a finished archive to whatever encrypts and stores it.

pub(crate) mod encrypt;
pub(crate) mod s3_upload;

use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ShipmentSettings;
use crate::errors::{BackupError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KmsS3Target {
    pub kms_arn: String,
    pub bucket: String,
    pub target_path: String,
    pub context: String,
    pub aws_account_id: Option<String>,
    pub aws_region: Option<String>,
    pub s3_endpoint_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shipper {
    /// Runs `program <archive>` and trusts its exit status.
    Command { program: String },
    /// Encrypts with sops under a KMS key, then uploads to S3.
    KmsS3(KmsS3Target),
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

impl Shipper {
    /// Picks the shipment method. A ship command wins over KMS+S3.
    pub fn from_settings(settings: &ShipmentSettings) -> Result<Self> {
        if let Some(program) = non_empty(&settings.ship_command) {
            return Ok(Shipper::Command { program });
        }

        let kms_arn = non_empty(&settings.kms_arn);
        let bucket = non_empty(&settings.s3_bucket);
        match (kms_arn, bucket) {
            (Some(kms_arn), Some(bucket)) => Ok(Shipper::KmsS3(KmsS3Target {
                kms_arn,
                bucket,
                target_path: settings.target_path.clone(),
                context: settings.context.clone(),
                aws_account_id: non_empty(&settings.aws_account_id),
                aws_region: non_empty(&settings.aws_region),
                s3_endpoint_url: non_empty(&settings.s3_endpoint_url),
            })),
            (kms_arn, bucket) => {
                let mut missing = Vec::new();
                if kms_arn.is_none() {
                    missing.push("KMS_ARN");
                }
                if bucket.is_none() {
                    missing.push("S3_BUCKET");
                }
                Err(BackupError::ShipmentNotConfigured(format!(
                    "missing critical values: {} (or set SHIP_COMMAND)",
                    missing.join(", ")
                )))
            }
        }
    }

    /// Ships `archive`, returning where it went. Cancellation drops the
    /// shipment, killing any child process it started.
    pub async fn ship(&self, archive: &Path, cancel: &CancellationToken) -> Result<String> {
        if !archive.is_file() {
            return Err(BackupError::MissingPath(archive.to_path_buf()));
        }
        let shipment = async {
            match self {
                Shipper::Command { program } => run_ship_command(program, archive).await,
                Shipper::KmsS3(target) => ship_kms_s3(target, archive).await,
            }
        };
        tokio::select! {
            result = shipment => result,
            _ = cancel.cancelled() => {
                info!("Shipment abandoned");
                Err(BackupError::Interrupted)
            }
        }
    }
}

async fn run_ship_command(program: &str, archive: &Path) -> Result<String> {
    info!("Handing {} to {}", archive.display(), program);
    let output = Command::new(program)
        .arg(archive)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackupError::ShipmentFailed(format!("could not run {}: {}", program, e)))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!("{}: {}", program, line);
    }
    if !output.status.success() {
        return Err(BackupError::ShipmentFailed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(format!("{} {}", program, archive.display()))
}

async fn ship_kms_s3(target: &KmsS3Target, archive: &Path) -> Result<String> {
    let destination = encrypted_destination(archive, &target.context, Utc::now());
    if destination.exists() {
        return Err(BackupError::ShipmentFailed(format!(
            "file {} already exists",
            destination.display()
        )));
    }

    let sdk_config = s3_upload::load_sdk_config(
        target.aws_region.as_deref(),
        target.s3_endpoint_url.as_deref(),
    )
    .await;
    let region = sdk_config.region().map(|r| r.to_string());
    let kms_arn = qualify_kms_arn(
        &target.kms_arn,
        region.as_deref(),
        target.aws_account_id.as_deref(),
    )?;

    fs::copy(archive, &destination)?;
    encrypt::encrypt_in_place(&destination, &kms_arn).await?;

    let key = s3_object_key(&target.target_path, &destination);
    s3_upload::upload_file_to_s3(&sdk_config, &target.bucket, &destination, &key).await?;
    Ok(format!("s3://{}/{}", target.bucket, key))
}

/// `<archive>.<UTC timestamp>z.<context>.enc`
pub(crate) fn encrypted_destination(archive: &Path, context: &str, now: DateTime<Utc>) -> PathBuf {
    PathBuf::from(format!(
        "{}.{}z.{}.enc",
        archive.display(),
        now.format("%Y-%m-%dT%H-%M-%S"),
        context
    ))
}

/// Expands `alias/...` and `key/...` into a full KMS ARN.
pub(crate) fn qualify_kms_arn(
    kms_arn: &str,
    region: Option<&str>,
    account_id: Option<&str>,
) -> Result<String> {
    if !(kms_arn.starts_with("alias/") || kms_arn.starts_with("key/")) {
        return Ok(kms_arn.to_string());
    }
    match (region, account_id) {
        (Some(region), Some(account_id)) => {
            Ok(format!("arn:aws:kms:{}:{}:{}", region, account_id, kms_arn))
        }
        (None, _) => Err(BackupError::ShipmentNotConfigured(format!(
            "KMS key {} needs a region; set AWS_REGION",
            kms_arn
        ))),
        (_, None) => Err(BackupError::ShipmentNotConfigured(format!(
            "unable to find account ID to complete KMS ARN {}; set AWS_ACCOUNT_ID",
            kms_arn
        ))),
    }
}

pub(crate) fn s3_object_key(target_path: &str, destination: &Path) -> String {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if target_path.is_empty() || target_path.ends_with('/') {
        format!("{}{}", target_path, name)
    } else {
        format!("{}/{}", target_path, name)
    }
}
