//! Output sinks
//!
//! - [`OutputTarget`]: where a dump's `path -> secret` map goes, a JSON
//!   file under a destination directory or stdout.
//! - [`FailureReport`]: the payloads an import could not write, saved
//!   under a content-addressed name so a rerun can use it as input.
//!
//! Files holding secrets are created owner read/write only.

use crate::error::Result;
use crate::vault::SecretData;
use crate::walker::tally::ErrorTally;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File extension for every file this crate writes
pub const EXTENSION: &str = "json";

/// Where an aggregated dump is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// `<dir>/<filename>.json`; `filename` may contain `/` (nested dirs)
    File { dir: PathBuf, filename: String },
    Stdout,
}

/// What a sink wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Written {
    File { path: PathBuf, bytes: u64 },
    Stdout { bytes: u64 },
}

impl Written {
    pub fn bytes(&self) -> u64 {
        match self {
            Written::File { bytes, .. } | Written::Stdout { bytes } => *bytes,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Written::File { path, .. } => path.display().to_string(),
            Written::Stdout { .. } => "stdout".to_string(),
        }
    }
}

impl OutputTarget {
    /// Final file path, if this target writes a file
    pub fn file_path(&self) -> Option<PathBuf> {
        match self {
            OutputTarget::File { dir, filename } => {
                Some(dir.join(format!("{filename}.{EXTENSION}")))
            }
            OutputTarget::Stdout => None,
        }
    }

    /// Serialize and write the map
    pub fn write(&self, secrets: &BTreeMap<String, SecretData>) -> Result<Written> {
        let body = serde_json::to_string_pretty(secrets)?;
        match self.file_path() {
            Some(path) => {
                write_private(&path, body.as_bytes())?;
                info!(path = %path.display(), bytes = body.len(), "Dump written");
                Ok(Written::File {
                    path,
                    bytes: body.len() as u64,
                })
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(body.as_bytes())?;
                stdout.write_all(b"\n")?;
                stdout.flush()?;
                Ok(Written::Stdout {
                    bytes: body.len() as u64,
                })
            }
        }
    }
}

/// Persisted import failures
pub struct FailureReport;

impl FailureReport {
    /// Write the tally's failed payloads to `<dir>/<sha256>.json`
    ///
    /// Returns `None` when there is nothing to report.
    pub fn write(dir: &Path, tally: &ErrorTally) -> Result<Option<PathBuf>> {
        if tally.is_empty() {
            return Ok(None);
        }

        for (signature, count) in tally.signatures() {
            warn!(
                signature = %signature,
                count = count.count,
                sample = %count.sample_path,
                "Import failures"
            );
        }

        let body = serde_json::to_string_pretty(tally.failed())?;
        let digest = Sha256::digest(body.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let path = dir.join(format!("{name}.{EXTENSION}"));

        write_private(&path, body.as_bytes())?;
        warn!(path = %path.display(), failed = tally.len(), "Failed entries saved");
        Ok(Some(path))
    }
}

/// Create parents, then write `data` to a file only the owner can read
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()?;

    // mode() only applies on creation
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
