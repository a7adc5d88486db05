// vault-backup/src/backup/archive.rs
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::Builder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::errors::{BackupError, Result};

/// Directories copied from the data folder when present.
pub const VAULT_DIRECTORIES: &[&str] = &["attachments", "sends"];
/// Single files copied from the data folder when present.
pub const VAULT_FILES: &[&str] = &["config.json"];
/// Every entry of the data folder starting with this prefix is copied.
pub const RSA_KEY_PREFIX: &str = "rsa_key";

/// Copies the vault's auxiliary state from `data_folder` into `files_dir`.
///
/// Each entry is optional: a vault without sends simply has no `sends/`
/// directory, so absent entries are skipped. Returns the staged paths.
/// Stops with `Interrupted` as soon as `cancel` fires.
pub fn stage_vault_files(
    data_folder: &Path,
    files_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PathBuf>> {
    if !data_folder.is_dir() {
        return Err(BackupError::MissingPath(data_folder.to_path_buf()));
    }
    fs::create_dir_all(files_dir)?;

    let mut names: Vec<String> = VAULT_DIRECTORIES
        .iter()
        .chain(VAULT_FILES)
        .map(|s| s.to_string())
        .collect();
    names.extend(rsa_key_names(data_folder)?);

    let mut staged = Vec::new();
    for name in names {
        let source = data_folder.join(&name);
        if !source.exists() {
            debug!("Skipping absent {}", source.display());
            continue;
        }
        let target = files_dir.join(&name);
        copy_preserving(&source, &target, cancel)?;
        staged.push(target);
    }

    info!(
        count = staged.len(),
        "Staged vault files from {}",
        data_folder.display()
    );
    Ok(staged)
}

fn rsa_key_names(data_folder: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(data_folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(RSA_KEY_PREFIX))
        .collect();
    names.sort();
    Ok(names)
}

/// Copies a file or a directory tree, keeping permission bits and
/// modification times.
fn copy_preserving(source: &Path, target: &Path, cancel: &CancellationToken) -> Result<()> {
    if source.is_file() {
        return copy_file_preserving(source, target);
    }

    for entry in WalkDir::new(source).sort_by_file_name() {
        check_cancelled(cancel)?;
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(source)
            .map_err(|_| BackupError::MissingPath(path.to_path_buf()))?;
        let destination = target.join(relative);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&destination)?;
        } else if file_type.is_file() {
            copy_file_preserving(path, &destination)?;
        } else {
            warn!("Skipping non-regular file {}", path.display());
        }
    }

    // Children first, so filling a directory doesn't bump its restored mtime.
    for entry in WalkDir::new(source).contents_first(true) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| BackupError::MissingPath(entry.path().to_path_buf()))?;
        let destination = target.join(relative);
        let metadata = entry.metadata()?;
        let modified = metadata.modified()?;
        if let Err(e) = File::open(&destination).and_then(|dir| dir.set_modified(modified)) {
            warn!("Could not keep timestamp of {}: {}", entry.path().display(), e);
        }
        fs::set_permissions(&destination, metadata.permissions())?;
    }
    Ok(())
}

pub(crate) fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BackupError::Interrupted);
    }
    Ok(())
}

fn copy_file_preserving(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    // fs::copy carries the permission bits over.
    fs::copy(source, target)?;
    let modified = fs::metadata(source)?.modified()?;
    File::open(target)?.set_modified(modified)?;
    Ok(())
}

/// Creates a gzipped tar archive holding the given subtrees of `staging_root`.
///
/// Entry names are relative to `staging_root` and written in sorted order.
pub fn create_tar_gz_archive(
    staging_root: &Path,
    subtrees: &[&str],
    archive_dest_path: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    if !staging_root.is_dir() {
        return Err(BackupError::MissingPath(staging_root.to_path_buf()));
    }

    info!(
        "Creating tar.gz archive from {} to {}",
        staging_root.display(),
        archive_dest_path.display()
    );

    let archive_file = File::create(archive_dest_path)?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);

    for subtree in subtrees {
        let subtree_root = staging_root.join(subtree);
        if !subtree_root.exists() {
            debug!("Nothing staged under {}", subtree_root.display());
            continue;
        }
        for entry in WalkDir::new(&subtree_root).sort_by_file_name() {
            check_cancelled(cancel)?;
            let entry = entry?;
            let path = entry.path();
            let name = path
                .strip_prefix(staging_root)
                .map_err(|_| BackupError::MissingPath(path.to_path_buf()))?;

            if entry.file_type().is_dir() {
                tar_builder.append_dir(name, path)?;
            } else if entry.file_type().is_file() {
                tar_builder.append_path_with_name(path, name)?;
            }
        }
    }

    let encoder = tar_builder.into_inner()?;
    encoder.finish()?;

    info!(
        "✓ Tar.gz archive created at {} ({} bytes)",
        archive_dest_path.display(),
        fs::metadata(archive_dest_path)?.len()
    );
    Ok(archive_dest_path.to_path_buf())
}
