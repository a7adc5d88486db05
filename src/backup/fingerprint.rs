// vault-backup/src/backup/fingerprint.rs
//! Content fingerprint of a staged backup.
//!
//! Every staged file is hashed on its own and the `(hash, relative path)`
//! pairs are sorted, so the fingerprint depends only on file contents and
//! names. Archive-level details such as gzip headers and entry order never
//! affect it.
//!
//! Two overlapping runs may both read the old fingerprint and both write a new
//! one; the last writer wins. Runs are expected to be serialised by the
//! scheduler.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use super::archive::check_cancelled;
use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// `(sha256 hex, path relative to the staging root)`, sorted.
    entries: Vec<(String, String)>,
}

impl Fingerprint {
    /// Hashes every regular file below the given subtrees of `root`.
    pub fn compute(root: &Path, subtrees: &[&str], cancel: &CancellationToken) -> Result<Self> {
        let mut entries = Vec::new();
        for subtree in subtrees {
            let subtree_root = root.join(subtree);
            if !subtree_root.exists() {
                continue;
            }
            for entry in WalkDir::new(&subtree_root) {
                check_cancelled(cancel)?;
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(entry.path())
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push((sha256_file(entry.path())?, relative));
            }
        }
        entries.sort();
        Ok(Fingerprint { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when `previous` (the persisted rendering) describes other content.
    pub fn differs_from(&self, previous: Option<&str>) -> bool {
        match previous {
            Some(previous) => previous.trim_end() != self.to_string().trim_end(),
            None => true,
        }
    }

    /// Reads the fingerprint persisted by an earlier run, if any.
    pub fn load_previous(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the file at `path` atomically.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut tmp, self.to_string().as_bytes())?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// One `hash  path` line per file, the layout of `sha256sum`.
impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (hash, path) in &self.entries {
            writeln!(f, "{}  {}", hash, path)?;
        }
        Ok(())
    }
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
