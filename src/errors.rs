use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error in {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    #[error("Could not parse database connection string: {0}")]
    ConnectionParse(String),

    #[error("{backend} dump failed (exit code: {}): {stderr}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    DumpFailed {
        backend: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("No shipment method configured: {0}")]
    ShipmentNotConfigured(String),

    #[error("Shipment failed: {0}")]
    ShipmentFailed(String),

    #[error("Required path is missing: {}", .0.display())]
    MissingPath(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Interrupted before the run completed")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, BackupError>;
