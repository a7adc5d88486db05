pub(crate) mod archive;
pub(crate) mod connection;
pub(crate) mod db_dump;
pub(crate) mod fingerprint;
mod logic;

pub use logic::RunOutcome;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::errors::Result;

/// Public entry point for one backup run. Cancelling `cancel` stops the run
/// with `Interrupted` once its scratch directory has been removed.
pub async fn run_backup_flow(app_config: &AppConfig, cancel: &CancellationToken) -> Result<RunOutcome> {
    logic::perform_backup_orchestration(app_config, cancel).await
}
