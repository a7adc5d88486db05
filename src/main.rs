//! Vault Backup Tool
//!
//! Dumps a self-hosted password vault's database and files, and ships an
//! encrypted archive whenever the content changed since the last run.

// vault-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod ship;
#[cfg(test)]
mod test_support;
mod utils;

use anyhow::{Context, Result};
use backup::RunOutcome;
use clap::Parser;
use config::{
    AppConfig, DEFAULT_ENV_FILE, DEFAULT_FINGERPRINT_FILE, DumpTools, ShipmentSettings,
    VaultConfig,
};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The vault service's env file (DATA_FOLDER, DATABASE_URL)
    #[arg(long, env = "VAULT_ENV_FILE", default_value = DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Where the fingerprint of the last shipped backup is kept
    #[arg(long, env = "FINGERPRINT_FILE", default_value = DEFAULT_FINGERPRINT_FILE)]
    fingerprint_file: PathBuf,

    /// Parent directory for the per-run scratch directory
    #[arg(long, env = "BACKUP_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Program that receives the finished archive path and ships it
    #[arg(long, env = "SHIP_COMMAND")]
    ship_command: Option<String>,

    /// The KMS key or alias to encrypt with
    #[arg(long = "kms-arn", short = 'k', env = "KMS_ARN")]
    kms_arn: Option<String>,

    /// The S3 bucket to upload to
    #[arg(long = "s3-bucket", short = 's', env = "S3_BUCKET")]
    s3_bucket: Option<String>,

    /// Place the uploaded file into a specific tree inside the bucket
    #[arg(long, short = 'p', env = "S3_TARGET_PATH", default_value = "")]
    target_path: String,

    /// Endpoint of an S3-compatible store
    #[arg(long, env = "S3_ENDPOINT_URL")]
    s3_endpoint_url: Option<String>,

    /// Account used to complete `alias/...` or `key/...` KMS identifiers
    #[arg(long, env = "AWS_ACCOUNT_ID")]
    aws_account_id: Option<String>,

    /// Encryption context embedded in the uploaded name (default: host name)
    #[arg(long, env = "BACKUP_CONTEXT")]
    context: Option<String>,

    /// pg_dump to use instead of the one found in PATH
    #[arg(long, env = "PG_DUMP_PATH")]
    pg_dump_path: Option<PathBuf>,

    /// mysqldump to use instead of the one found in PATH
    #[arg(long, env = "MYSQLDUMP_PATH")]
    mysqldump_path: Option<PathBuf>,

    /// Ship even if nothing changed
    #[arg(long)]
    force: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable debug logging (also DEBUG=1)
    #[arg(long, short = 'D')]
    debug: bool,

    /// Enable trace logging (also TRACE=1)
    #[arg(long, short = 'T')]
    trace: bool,

    /// Disable coloured logs (also NOCOLOR=1)
    #[arg(long, alias = "nocolour", alias = "nocolor")]
    no_color: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level = utils::logger::resolve_level(args.trace, args.debug, &args.log_level);
    if let Err(e) = utils::logger::init(&level, utils::logger::use_colour(args.no_color)) {
        eprintln!("Failed to initialise logging: {}", e);
    }

    match run_app(args).await {
        Ok(RunOutcome::Unchanged) => {
            info!("✅ No changes, nothing shipped.");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Shipped { destination }) => {
            info!("✅ Backup shipped to {}.", destination);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn default_context() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}

async fn run_app(args: Args) -> Result<RunOutcome> {
    let mut shutdown =
        utils::ShutdownSignal::install().context("Failed to install signal handlers")?;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown.recv().await;
        trigger.cancel();
    });

    let vault = VaultConfig::load_from_env_file(&args.env_file)
        .with_context(|| format!("Failed to load vault settings from {}", args.env_file.display()))?;

    let app_config = AppConfig {
        vault,
        env_file: args.env_file,
        fingerprint_file: args.fingerprint_file,
        work_dir: args.work_dir,
        shipment: ShipmentSettings {
            ship_command: args.ship_command,
            kms_arn: args.kms_arn,
            s3_bucket: args.s3_bucket,
            target_path: args.target_path,
            context: args.context.unwrap_or_else(default_context),
            aws_account_id: args.aws_account_id,
            aws_region: env::var("AWS_REGION")
                .or_else(|_| env::var("AWS_DEFAULT_REGION"))
                .ok(),
            s3_endpoint_url: args.s3_endpoint_url,
        },
        dump_tools: DumpTools {
            pg_dump: args.pg_dump_path,
            mysqldump: args.mysqldump_path,
        },
        force: args.force,
    };
    info!(
        env_file = %app_config.env_file.display(),
        data_folder = %app_config.vault.data_folder.display(),
        "Loaded vault settings"
    );

    backup::run_backup_flow(&app_config, &cancel)
        .await
        .context("Backup run failed")
}
