// vault-backup/src/config/mod.rs
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, Result};

/// Location of the vault service's env file when none is given.
pub const DEFAULT_ENV_FILE: &str = "/.env";
pub const DEFAULT_DATA_FOLDER: &str = "/data";
pub const DEFAULT_FINGERPRINT_FILE: &str = "/var/lib/vault-backup/fingerprint";

const DATA_FOLDER_KEY: &str = "DATA_FOLDER";
const DATABASE_URL_KEY: &str = "DATABASE_URL";

/// Settings recovered from the vault service's `KEY=value` env file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultConfig {
    /// Always absolute.
    pub data_folder: PathBuf,
    /// Empty when the key is absent, meaning `<data_folder>/db.sqlite3`.
    pub database_url: String,
}

impl VaultConfig {
    /// Reads and parses the env file at `path`.
    pub fn load_from_env_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| BackupError::Config {
            path: path.to_path_buf(),
            reason: format!("cannot read env file: {}", e),
        })?;
        Ok(Self::parse(&content))
    }

    /// Parses env file content. Unrecognised keys are ignored and only the
    /// first line for each key counts.
    pub fn parse(content: &str) -> Self {
        let data_folder = match first_value(content, DATA_FOLDER_KEY) {
            Some(v) if !v.is_empty() => absolutize(v),
            _ => PathBuf::from(DEFAULT_DATA_FOLDER),
        };

        let database_url = first_value(content, DATABASE_URL_KEY)
            .map(unquote)
            .unwrap_or_default()
            .to_string();

        VaultConfig {
            data_folder,
            database_url,
        }
    }
}

/// Everything after the first `=` on the first line starting with `KEY=`.
fn first_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

/// A value opening with `"` is cut at the next `"`, so embedded `=` survive.
fn unquote(value: &str) -> &str {
    match value.strip_prefix('"') {
        Some(inner) => inner.split('"').next().unwrap_or(inner),
        None => value,
    }
}

fn absolutize(value: &str) -> PathBuf {
    if value.starts_with('/') {
        PathBuf::from(value)
    } else {
        PathBuf::from(format!("/{}", value))
    }
}

/// Where and how a changed archive gets shipped. Validation happens only when
/// there is something to ship.
#[derive(Debug, Clone, Default)]
pub struct ShipmentSettings {
    /// External program invoked with the archive path as its only argument.
    pub ship_command: Option<String>,
    pub kms_arn: Option<String>,
    pub s3_bucket: Option<String>,
    /// Prefix inside the bucket.
    pub target_path: String,
    /// Encryption context, embedded in the uploaded object's name.
    pub context: String,
    pub aws_account_id: Option<String>,
    /// From `AWS_REGION` or `AWS_DEFAULT_REGION`; the SDK chain decides otherwise.
    pub aws_region: Option<String>,
    /// Custom endpoint for S3-compatible storage.
    pub s3_endpoint_url: Option<String>,
}

/// Explicit dump client locations; `PATH` is searched when unset.
#[derive(Debug, Clone, Default)]
pub struct DumpTools {
    pub pg_dump: Option<PathBuf>,
    pub mysqldump: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub vault: VaultConfig,
    pub env_file: PathBuf,
    pub fingerprint_file: PathBuf,
    /// Parent for the per-run scratch directory; system temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub shipment: ShipmentSettings,
    pub dump_tools: DumpTools,
    /// Ship even when the fingerprint is unchanged.
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_relative_data_folder_gets_leading_slash() {
        let cfg = VaultConfig::parse("DATA_FOLDER=vault\nDATABASE_URL=\"postgresql://u:p@host/db\"\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/vault"));
        assert_eq!(cfg.database_url, "postgresql://u:p@host/db");
    }

    #[test]
    fn test_missing_data_folder_defaults() {
        let cfg = VaultConfig::parse("DOMAIN=https://vault.example.com\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/data"));
        assert_eq!(cfg.database_url, "");
    }

    #[test]
    fn test_empty_data_folder_defaults() {
        let cfg = VaultConfig::parse("DATA_FOLDER=\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/data"));
    }

    #[test]
    fn test_absolute_data_folder_kept() {
        let cfg = VaultConfig::parse("DATA_FOLDER=/srv/vault\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/srv/vault"));
    }

    #[test]
    fn test_first_matching_line_wins() {
        let cfg = VaultConfig::parse("DATA_FOLDER=/one\nDATA_FOLDER=/two\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/one"));
    }

    #[test]
    fn test_key_must_start_the_line() {
        let cfg = VaultConfig::parse("# DATA_FOLDER=/commented\nMY_DATA_FOLDER=/other\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/data"));
    }

    #[test]
    fn test_unquoted_value_keeps_everything_after_first_equals() {
        let cfg = VaultConfig::parse("DATABASE_URL=mysql://u:p=q@h/db\n");
        assert_eq!(cfg.database_url, "mysql://u:p=q@h/db");
    }

    #[test]
    fn test_quoted_value_takes_first_quoted_segment() {
        let cfg = VaultConfig::parse("DATABASE_URL=\"mysql://u:a=b@h/db\" # trailing\n");
        assert_eq!(cfg.database_url, "mysql://u:a=b@h/db");
    }

    #[test]
    fn test_unterminated_quote_takes_rest() {
        let cfg = VaultConfig::parse("DATABASE_URL=\"/data/custom.sqlite3\n");
        assert_eq!(cfg.database_url, "/data/custom.sqlite3");
    }

    #[test]
    fn test_crlf_lines() {
        let cfg = VaultConfig::parse("DATA_FOLDER=vault\r\nDATABASE_URL=/x.db\r\n");
        assert_eq!(cfg.data_folder, PathBuf::from("/vault"));
        assert_eq!(cfg.database_url, "/x.db");
    }

    #[test]
    fn test_load_from_env_file() -> anyhow::Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "SIGNUPS_ALLOWED=false")?;
        writeln!(file, "DATA_FOLDER=vault")?;
        let cfg = VaultConfig::load_from_env_file(file.path())?;
        assert!(cfg.data_folder.starts_with("/"));
        assert_eq!(cfg.data_folder, PathBuf::from("/vault"));
        Ok(())
    }

    #[test]
    fn test_missing_env_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VaultConfig::load_from_env_file(&dir.path().join("absent.env")).unwrap_err();
        assert!(matches!(err, BackupError::Config { .. }));
    }
}
