// vault-backup/src/backup/logic.rs
use std::fs;
use std::path::Path;
use tempfile::{Builder as TempDirBuilder, TempDir};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::archive::{create_tar_gz_archive, stage_vault_files};
use super::connection::ConnectionInfo;
use super::db_dump::dump_database;
use super::fingerprint::Fingerprint;
use crate::config::AppConfig;
use crate::errors::{BackupError, Result};
use crate::ship::Shipper;

/// Staging subtree holding the database dump.
pub const TARGET_DB: &str = "db";
/// Staging subtree holding the copied vault files.
pub const TARGET_FS: &str = "files";
pub const ARCHIVE_NAME: &str = "vault-backup.tar.gz";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Content matched the last shipped fingerprint; nothing was sent.
    Unchanged,
    Shipped { destination: String },
}

/// The per-run scratch directory. Dropping the guard removes it, on success,
/// error and cancellation alike.
fn create_run_dir(work_dir: Option<&Path>) -> Result<TempDir> {
    let mut builder = TempDirBuilder::new();
    builder.prefix("vault-backup-");
    let run_dir = match work_dir {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            builder.tempdir_in(parent)?
        }
        None => builder.tempdir()?,
    };
    info!("📂 Run directory created at: {}", run_dir.path().display());
    Ok(run_dir)
}

/// Dump, stage, fingerprint and, when something changed, archive and ship.
///
/// The fingerprint file is only rewritten after a successful shipment, so a
/// failed, unconfigured or interrupted shipment is retried on the next run.
/// Filesystem stages run on the blocking pool and are awaited to completion,
/// so the run directory outlives every writer into it.
pub async fn perform_backup_orchestration(
    app_config: &AppConfig,
    cancel: &CancellationToken,
) -> Result<RunOutcome> {
    let vault = &app_config.vault;
    info!("🚀 Starting vault backup from {}", vault.data_folder.display());

    if !vault.data_folder.is_dir() {
        return Err(BackupError::MissingPath(vault.data_folder.clone()));
    }
    let connection = ConnectionInfo::parse(&vault.database_url)?;
    let previous = Fingerprint::load_previous(&app_config.fingerprint_file)?;

    let run_dir = create_run_dir(app_config.work_dir.as_deref())?;
    let staging_root = run_dir.path().to_path_buf();

    dump_database(
        &connection,
        &vault.data_folder,
        &staging_root.join(TARGET_DB),
        &app_config.dump_tools,
        cancel,
    )
    .await?;

    let fingerprint = {
        let data_folder = vault.data_folder.clone();
        let root = staging_root.clone();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            stage_vault_files(&data_folder, &root.join(TARGET_FS), &token)?;
            Fingerprint::compute(&root, &[TARGET_DB, TARGET_FS], &token)
        })
        .await??
    };
    let changed = fingerprint.differs_from(previous.as_deref());
    info!(files = fingerprint.len(), changed, "Fingerprint computed");

    if !changed && !app_config.force {
        info!("✓ Nothing changed since the last backup, skipping shipment");
        return Ok(RunOutcome::Unchanged);
    }

    let shipper = Shipper::from_settings(&app_config.shipment)?;
    let archive = {
        let root = staging_root.clone();
        let token = cancel.clone();
        tokio::task::spawn_blocking(move || {
            create_tar_gz_archive(&root, &[TARGET_DB, TARGET_FS], &root.join(ARCHIVE_NAME), &token)
        })
        .await??
    };
    let destination = shipper.ship(&archive, cancel).await?;

    fingerprint.persist(&app_config.fingerprint_file)?;
    info!("🎉 Backup shipped to {}", destination);
    Ok(RunOutcome::Shipped { destination })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DumpTools, ShipmentSettings, VaultConfig};
    use rusqlite::Connection;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _root: TempDir,
        data: PathBuf,
        work: PathBuf,
        fingerprint: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = tempdir().unwrap();
        let data = root.path().join("data");
        fs::create_dir_all(data.join("attachments/cipher-1")).unwrap();
        fs::write(data.join("attachments/cipher-1/file.bin"), b"attachment").unwrap();
        fs::write(data.join("config.json"), b"{\"domain\":\"https://vault\"}").unwrap();
        fs::write(data.join("rsa_key.pem"), b"private").unwrap();
        {
            let conn = Connection::open(data.join("db.sqlite3")).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (uuid TEXT PRIMARY KEY, email TEXT);
                 INSERT INTO users VALUES ('u1', 'a@example.com');",
            )
            .unwrap();
        }
        Fixture {
            work: root.path().join("work"),
            fingerprint: root.path().join("state/fingerprint"),
            data,
            _root: root,
        }
    }

    fn app_config(fx: &Fixture, ship_command: Option<&str>) -> AppConfig {
        AppConfig {
            vault: VaultConfig {
                data_folder: fx.data.clone(),
                database_url: String::new(),
            },
            env_file: PathBuf::from("/.env"),
            fingerprint_file: fx.fingerprint.clone(),
            work_dir: Some(fx.work.clone()),
            shipment: ShipmentSettings {
                ship_command: ship_command.map(str::to_string),
                ..Default::default()
            },
            dump_tools: DumpTools::default(),
            force: false,
        }
    }

    async fn run(config: &AppConfig) -> Result<RunOutcome> {
        perform_backup_orchestration(config, &CancellationToken::new()).await
    }

    fn work_dir_is_empty(fx: &Fixture) -> bool {
        fs::read_dir(&fx.work).map(|mut d| d.next().is_none()).unwrap_or(true)
    }

    #[tokio::test]
    async fn test_second_run_without_changes_skips_shipment() -> anyhow::Result<()> {
        let fx = fixture();
        let config = app_config(&fx, Some("true"));

        let first = run(&config).await?;
        assert!(matches!(first, RunOutcome::Shipped { .. }));
        assert!(fx.fingerprint.is_file());

        // A failing shipper proves the second run never reaches it.
        let second = run(&app_config(&fx, Some("false"))).await?;
        assert_eq!(second, RunOutcome::Unchanged);
        assert!(work_dir_is_empty(&fx));
        Ok(())
    }

    #[tokio::test]
    async fn test_attachment_byte_change_triggers_shipment() -> anyhow::Result<()> {
        let fx = fixture();
        let config = app_config(&fx, Some("true"));
        run(&config).await?;
        let before = fs::read_to_string(&fx.fingerprint)?;

        fs::write(fx.data.join("attachments/cipher-1/file.bin"), b"attachmenT")?;
        let outcome = run(&config).await?;
        assert!(matches!(outcome, RunOutcome::Shipped { .. }));
        assert_ne!(fs::read_to_string(&fx.fingerprint)?, before);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_sends_does_not_abort() -> anyhow::Result<()> {
        let fx = fixture();
        assert!(!fx.data.join("sends").exists());
        let outcome = run(&app_config(&fx, Some("true"))).await?;
        assert!(matches!(outcome, RunOutcome::Shipped { .. }));
        let persisted = fs::read_to_string(&fx.fingerprint)?;
        assert!(persisted.contains("  files/attachments/cipher-1/file.bin"));
        assert!(persisted.contains("  db/db.sqlite3"));
        assert!(!persisted.contains("sends"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unconfigured_shipment_fails_and_keeps_fingerprint() -> anyhow::Result<()> {
        let fx = fixture();
        run(&app_config(&fx, Some("true"))).await?;
        let before = fs::read_to_string(&fx.fingerprint)?;

        fs::write(fx.data.join("config.json"), b"{\"domain\":\"https://other\"}")?;
        let err = run(&app_config(&fx, None))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ShipmentNotConfigured(_)));
        assert_eq!(fs::read_to_string(&fx.fingerprint)?, before);
        assert!(work_dir_is_empty(&fx));
        Ok(())
    }

    #[tokio::test]
    async fn test_unconfigured_shipment_is_fine_when_unchanged() -> anyhow::Result<()> {
        let fx = fixture();
        run(&app_config(&fx, Some("true"))).await?;
        let outcome = run(&app_config(&fx, None)).await?;
        assert_eq!(outcome, RunOutcome::Unchanged);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_shipment_leaves_fingerprint_unwritten() {
        let fx = fixture();
        let err = run(&app_config(&fx, Some("false")))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::ShipmentFailed(_)));
        assert!(!fx.fingerprint.exists());
        assert!(work_dir_is_empty(&fx));
    }

    #[tokio::test]
    async fn test_force_ships_unchanged_content() -> anyhow::Result<()> {
        let fx = fixture();
        run(&app_config(&fx, Some("true"))).await?;
        let mut config = app_config(&fx, Some("true"));
        config.force = true;
        let outcome = run(&config).await?;
        assert!(matches!(outcome, RunOutcome::Shipped { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_dump_failure_aborts_before_staging() {
        let fx = fixture();
        let bogus = fx.data.join("corrupt.sqlite3");
        fs::write(&bogus, vec![0u8; 4096]).unwrap();
        let mut config = app_config(&fx, Some("true"));
        config.vault.database_url = bogus.display().to_string();

        let err = run(&config).await.unwrap_err();
        assert!(matches!(err, BackupError::DumpFailed { .. }));
        assert!(!fx.fingerprint.exists());
        assert!(work_dir_is_empty(&fx));
    }

    #[tokio::test]
    async fn test_missing_data_folder() {
        let fx = fixture();
        let mut config = app_config(&fx, Some("true"));
        config.vault.data_folder = fx.data.join("does-not-exist");
        let err = run(&config).await.unwrap_err();
        assert!(matches!(err, BackupError::MissingPath(_)));
    }

    #[tokio::test]
    async fn test_precancelled_run_leaves_nothing() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = perform_backup_orchestration(&app_config(&fx, Some("true")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::Interrupted));
        assert!(!fx.fingerprint.exists());
        assert!(work_dir_is_empty(&fx));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_during_shipment_cleans_up() -> anyhow::Result<()> {
        let fx = fixture();
        let bin = tempdir()?;
        let ship = crate::test_support::fake_tool(bin.path(), "slow-ship", "exec sleep 30");
        let config = app_config(&fx, Some(&ship.display().to_string()));

        let mut shutdown = crate::utils::ShutdownSignal::install()?;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            shutdown.recv().await;
            trigger.cancel();
        });
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tokio::process::Command::new("kill")
                .arg("-TERM")
                .arg(std::process::id().to_string())
                .status()
                .await;
        });

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            perform_backup_orchestration(&config, &cancel),
        )
        .await?;
        assert!(matches!(result, Err(BackupError::Interrupted)));
        assert!(!fx.fingerprint.exists());
        assert!(work_dir_is_empty(&fx));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_mysqldump_aborts_before_staging() -> anyhow::Result<()> {
        let fx = fixture();
        let bin = tempdir()?;
        let shipped = bin.path().join("shipped");
        let ship = crate::test_support::fake_tool(
            bin.path(),
            "ship",
            &format!("touch '{}'", shipped.display()),
        );
        let mut config = app_config(&fx, Some(&ship.display().to_string()));
        config.vault.database_url = "mysql://u:p@h/db".into();
        config.dump_tools.mysqldump = Some(crate::test_support::fake_tool(
            bin.path(),
            "mysqldump",
            "echo '-- partial dump'\necho 'Access denied' >&2\nexit 3",
        ));

        let err = run(&config).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::DumpFailed {
                backend: "mysql",
                exit_code: Some(3),
                ..
            }
        ));
        assert!(!shipped.exists());
        assert!(!fx.fingerprint.exists());
        assert!(work_dir_is_empty(&fx));
        Ok(())
    }
}
