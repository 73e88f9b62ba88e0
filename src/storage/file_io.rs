//! JSON persistence helpers
//!
//! Writes go to a sibling temp file that is synced and renamed over the
//! target, so a crash leaves either the old contents or the new ones.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{LedgerError, LedgerResult};

/// Read a JSON document, falling back to `T::default()` when the file is absent
pub fn read_json<T, P>(path: P) -> LedgerResult<T>
where
    T: DeserializeOwned + Default,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => {
            return Err(LedgerError::Storage(format!(
                "Failed to open {}: {}",
                path.display(),
                e
            )))
        }
    };

    serde_json::from_reader(BufReader::new(file))
        .map_err(|e| LedgerError::Storage(format!("Corrupt JSON in {}: {}", path.display(), e)))
}

/// Replace `path` with the JSON form of `data` in one atomic step
pub fn write_json_atomic<T, P>(path: P, data: &T) -> LedgerResult<()>
where
    T: Serialize + ?Sized,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            LedgerError::Storage(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let staging = staging_path(path);
    let result = write_staged(&staging, data)
        .and_then(|_| fs::rename(&staging, path).map_err(|e| {
            LedgerError::Storage(format!("Failed to replace {}: {}", path.display(), e))
        }));

    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_staged<T: Serialize + ?Sized>(staging: &Path, data: &T) -> LedgerResult<()> {
    let file = File::create(staging).map_err(|e| {
        LedgerError::Storage(format!("Failed to create {}: {}", staging.display(), e))
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}
