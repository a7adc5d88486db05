// vault-backup/src/ship/encrypt.rs
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, error, trace};
use which::which;

use crate::errors::{BackupError, Result};

fn find_sops_executable() -> Result<PathBuf> {
    which("sops").map_err(|_| {
        BackupError::ShipmentFailed(
            "sops executable not found in PATH. Please ensure sops is installed.".to_string(),
        )
    })
}

pub(crate) fn sops_command(program: &Path, file: &Path, kms_arn: &str) -> Command {
    let mut command = Command::new(program);
    command
        .env("SOPS_KMS_ARN", kms_arn)
        .arg("--in-place")
        .arg("--encrypt")
        .arg(file)
        .arg("--output-type")
        .arg("binary");
    command
}

/// Encrypts `file` in place under the KMS key with sops.
/// The child is killed if this future is dropped.
pub async fn encrypt_in_place(file: &Path, kms_arn: &str) -> Result<()> {
    let sops = find_sops_executable()?;
    let mut command = sops_command(&sops, file, kms_arn);
    trace!("Starting encryption with {:?}", command);

    let output = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackupError::ShipmentFailed(format!("failed to execute sops: {}", e)))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!("{}", line);
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        error!("{}", line);
    }

    if !output.status.success() {
        return Err(BackupError::ShipmentFailed(format!(
            "sops encryption of {} failed with status: {}",
            file.display(),
            output.status
        )));
    }
    debug!("Encrypted {}", file.display());
    Ok(())
}
