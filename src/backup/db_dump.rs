// vault-backup/src/backup/db_dump.rs
use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::thread;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use which::which;

use super::connection::{ConnectionInfo, MySqlParams};
use crate::config::DumpTools;
use crate::errors::{BackupError, Result};

pub const SQL_DUMP_FILE: &str = "db.sql";
pub const SQLITE_DUMP_FILE: &str = "db.sqlite3";

const SQLITE_PAGES_PER_STEP: i32 = 100;
const SQLITE_STEP_PAUSE: Duration = Duration::from_millis(50);

fn find_dump_executable(
    configured: Option<&Path>,
    name: &str,
    backend: &'static str,
) -> Result<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    which(name).map_err(|_| BackupError::DumpFailed {
        backend,
        exit_code: None,
        stderr: format!(
            "{} executable not found in PATH. Please ensure the {} client tools are installed.",
            name, backend
        ),
    })
}

/// Writes one dump of the configured database into `output_dir` and returns
/// its path. Nothing is left behind on failure or cancellation.
pub async fn dump_database(
    connection: &ConnectionInfo,
    data_folder: &Path,
    output_dir: &Path,
    tools: &DumpTools,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    info!(
        backend = connection.backend_name(),
        target = %connection.describe(data_folder),
        "Dumping database"
    );

    let dump_path = match connection {
        ConnectionInfo::Postgres { url } => {
            let pg_dump = find_dump_executable(tools.pg_dump.as_deref(), "pg_dump", "postgres")?;
            debug!("Using pg_dump executable at: {}", pg_dump.display());
            let dump_path = output_dir.join(SQL_DUMP_FILE);
            let mut command = pg_dump_command(&pg_dump, url, &dump_path);
            command.stdout(Stdio::null());
            run_dump_tool("postgres", command, &dump_path, cancel).await?;
            dump_path
        }
        ConnectionInfo::MySql(params) => {
            let mysqldump =
                find_dump_executable(tools.mysqldump.as_deref(), "mysqldump", "mysql")?;
            debug!("Using mysqldump executable at: {}", mysqldump.display());
            let dump_path = output_dir.join(SQL_DUMP_FILE);
            let mut command = mysqldump_command(&mysqldump, params);
            command.stdout(Stdio::from(File::create(&dump_path)?));
            run_dump_tool("mysql", command, &dump_path, cancel).await?;
            dump_path
        }
        ConnectionInfo::SqliteFile(_) | ConnectionInfo::SqliteDefault => {
            let source = connection
                .sqlite_path(data_folder)
                .ok_or_else(|| BackupError::MissingPath(data_folder.to_path_buf()))?;
            let dump_path = output_dir.join(SQLITE_DUMP_FILE);
            let target = dump_path.clone();
            let token = cancel.clone();
            tokio::task::spawn_blocking(move || dump_sqlite(&source, &target, &token)).await??;
            dump_path
        }
    };

    let size = fs::metadata(&dump_path)?.len();
    info!(path = %dump_path.display(), bytes = size, "Database dump written");
    Ok(dump_path)
}

pub(crate) fn pg_dump_command(program: &Path, url: &str, dump_path: &Path) -> Command {
    let mut command = Command::new(program);
    command
        .arg("--no-password")
        .arg("--format=plain")
        .arg("-f")
        .arg(dump_path)
        .arg(url);
    command
}

/// The password travels in the child's `MYSQL_PWD`, never on its command line.
pub(crate) fn mysqldump_command(program: &Path, params: &MySqlParams) -> Command {
    let mut command = Command::new(program);
    command
        .env("MYSQL_PWD", &params.password)
        .arg("--host")
        .arg(&params.host)
        .arg("--port")
        .arg(&params.port)
        .arg("--user")
        .arg(&params.user)
        .arg("--single-transaction")
        .arg("--skip-dump-date")
        .arg(&params.database);
    command
}

/// Runs a dump client to completion. On cancellation the child is killed and
/// the partial dump removed.
async fn run_dump_tool(
    backend: &'static str,
    mut command: Command,
    dump_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        let _ = fs::remove_file(dump_path);
        BackupError::DumpFailed {
            backend,
            exit_code: None,
            stderr: format!("failed to start dump client: {}", e),
        }
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = cancel.cancelled() => {
            let _ = fs::remove_file(dump_path);
            return Err(BackupError::Interrupted);
        }
    };
    match output {
        Ok(output) => check_dump_status(backend, &output, dump_path),
        Err(e) => {
            let _ = fs::remove_file(dump_path);
            Err(e.into())
        }
    }
}

fn check_dump_status(backend: &'static str, output: &Output, dump_path: &Path) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let _ = fs::remove_file(dump_path);
    Err(BackupError::DumpFailed {
        backend,
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Online backup through SQLite's own backup API, so the vault can keep
/// writing while the snapshot is taken. Blocking.
fn dump_sqlite(source: &Path, dump_path: &Path, cancel: &CancellationToken) -> Result<()> {
    if !source.is_file() {
        return Err(BackupError::MissingPath(source.to_path_buf()));
    }
    let result = sqlite_online_backup(source, dump_path, cancel);
    if result.is_err() {
        let _ = fs::remove_file(dump_path);
    }
    result
}

fn sqlite_online_backup(source: &Path, dump_path: &Path, cancel: &CancellationToken) -> Result<()> {
    let src = Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(sqlite_failed)?;
    let mut dst = Connection::open(dump_path).map_err(sqlite_failed)?;
    let backup = Backup::new(&src, &mut dst).map_err(sqlite_failed)?;

    loop {
        if cancel.is_cancelled() {
            return Err(BackupError::Interrupted);
        }
        match backup.step(SQLITE_PAGES_PER_STEP).map_err(sqlite_failed)? {
            StepResult::Done => return Ok(()),
            StepResult::More => {}
            _ => thread::sleep(SQLITE_STEP_PAUSE),
        }
    }
}

fn sqlite_failed(e: rusqlite::Error) -> BackupError {
    BackupError::DumpFailed {
        backend: "sqlite",
        exit_code: None,
        stderr: e.to_string(),
    }
}
