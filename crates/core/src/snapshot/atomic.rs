use super::error::SnapshotError;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub type RenameFn = fn(&Path, &Path) -> io::Result<()>;

/// Temp-file-then-rename writer.
///
/// Bytes go to a temp file in `scratch_dir`, are fsynced, then renamed over
/// the target; the target's directory is fsynced last. Until the rename
/// succeeds the previous target is never touched. `scratch_dir` must live on
/// the same filesystem as every target.
#[derive(Clone)]
pub struct AtomicWriter {
    scratch_dir: PathBuf,
    rename: RenameFn,
}

impl AtomicWriter {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            rename: |from, to| fs::rename(from, to),
        }
    }

    /// Swaps the rename primitive. Tests use it to inject failures.
    pub fn with_rename(mut self, rename: RenameFn) -> Self {
        self.rename = rename;
        self
    }

    pub fn write(&self, target: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
        fs::create_dir_all(&self.scratch_dir)
            .map_err(|e| SnapshotError::io(&self.scratch_dir, e))?;
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SnapshotError::io(parent, e))?;
        }

        let mut tmp = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".tmp")
            .tempfile_in(&self.scratch_dir)
            .map_err(|e| SnapshotError::io(&self.scratch_dir, e))?;
        tmp.write_all(bytes)
            .map_err(|e| SnapshotError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| SnapshotError::io(tmp.path(), e))?;

        // Dropping `tmp_path` on any error below removes the temp file.
        let tmp_path = tmp.into_temp_path();
        (self.rename)(&tmp_path, target).map_err(|e| SnapshotError::io(target, e))?;
        if let Err(err) = tmp_path.keep() {
            tracing::debug!(error = %err, "temp path already moved");
        }

        sync_parent(target)
    }

    /// Writes `bytes` to `target`, then its lowercase hex SHA-256 plus newline
    /// to `checksum_path`, both atomically.
    pub fn write_with_checksum(
        &self,
        target: &Path,
        checksum_path: &Path,
        bytes: &[u8],
    ) -> Result<(), SnapshotError> {
        self.write(target, bytes)?;
        let digest = format!("{}\n", sha256_hex(bytes));
        self.write(checksum_path, digest.as_bytes())
    }
}

impl std::fmt::Debug for AtomicWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicWriter")
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Reads `target` and checks it against the hex digest in `checksum_path`.
pub fn read_verified(target: &Path, checksum_path: &Path) -> Result<Vec<u8>, SnapshotError> {
    let bytes = match fs::read(target) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SnapshotError::NotFound(target.to_path_buf()))
        }
        Err(e) => return Err(SnapshotError::io(target, e)),
    };
    let expected = match fs::read_to_string(checksum_path) {
        Ok(s) => s.trim().to_lowercase(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SnapshotError::ChecksumMissing(checksum_path.to_path_buf()))
        }
        Err(e) => return Err(SnapshotError::io(checksum_path, e)),
    };

    let actual = sha256_hex(&bytes);
    if actual != expected {
        return Err(SnapshotError::ChecksumMismatch {
            path: target.to_path_buf(),
            expected,
            actual,
        });
    }
    Ok(bytes)
}

#[cfg(unix)]
fn sync_parent(target: &Path) -> Result<(), SnapshotError> {
    let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    File::open(parent)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| SnapshotError::io(parent, e))
}

#[cfg(not(unix))]
fn sync_parent(_target: &Path) -> Result<(), SnapshotError> {
    Ok(())
}
