use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Result;

const TRANSIENT_RETRIES: usize = 3;

/// Serialize `value` as pretty JSON and atomically install it at `path`.
///
/// The bytes land in a sibling temp file first and are renamed into place;
/// on a POSIX filesystem readers never observe partial contents. Parent
/// directories are created as needed.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    write_bytes(path, json.as_bytes())
}

/// Read and parse a JSON file.
///
/// Missing files and malformed contents both yield `None`: a truncated read
/// racing a writer on a non-POSIX filesystem must look like "not present",
/// never like an error the caller has to handle.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Atomically install raw text at `path` (same temp+rename discipline).
pub fn write_text(path: &Path, text: &str) -> Result<()> {
    write_bytes(path, text.as_bytes())
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let mut last_err = None;
    for _ in 0..TRANSIENT_RETRIES {
        match try_install(&tmp, path, bytes) {
            Ok(()) => return Ok(()),
            Err(err) if is_transient(&err) => {
                last_err = Some(err);
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(last_err
        .unwrap_or_else(|| std::io::Error::other("atomic write failed"))
        .into())
}

fn try_install(tmp: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::write(tmp, bytes)?;
    match fs::rename(tmp, path) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(tmp);
            Err(err)
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::AlreadyExists | ErrorKind::ResourceBusy
    )
}

fn temp_path(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    path.with_file_name(format!(
        "{name}.tmp-{}-{nanos}",
        std::process::id()
    ))
}
