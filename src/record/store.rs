//! Record Store - crash-safe envelope checkpoints
//!
//! ## Rotation
//!
//! ```text
//! serialize ─► <path>.tmp (fsync) ─► rm <path>.bak ─► <path> → <path>.bak ─► <path>.tmp → <path>
//! ```
//!
//! A crash at any step leaves the previous `<path>`, the `<path>.bak`, or the
//! new complete `<path>` on disk. A leftover `.tmp` is never read.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{export_traces, ExperimentEnvelope, RunStatus};
use crate::{Error, Result};

/// Crash-safe persistence of one experiment envelope.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    trace_export: Option<PathBuf>,
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn persistence(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |source| Error::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

impl RecordStore {
    /// Store writing the envelope to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            trace_export: None,
        }
    }

    /// Also export the traces to a Parquet file on [`RecordStore::finalize`].
    #[must_use]
    pub fn with_trace_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_export = Some(path.into());
        self
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the previous checkpoint.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        with_suffix(&self.path, ".bak")
    }

    /// Path of the in-progress write.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        with_suffix(&self.path, ".tmp")
    }

    /// Write `envelope` to disk, rotating the previous checkpoint to `.bak`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the envelope cannot be encoded and
    /// [`Error::Persistence`] for any write, sync or rename failure.
    pub fn checkpoint(&self, envelope: &ExperimentEnvelope) -> Result<()> {
        let bytes = serde_json::to_vec(envelope)?;
        let temp = self.temp_path();
        let backup = self.backup_path();

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persistence(parent))?;
        }

        let mut file = File::create(&temp).map_err(persistence(&temp))?;
        file.write_all(&bytes).map_err(persistence(&temp))?;
        file.sync_all().map_err(persistence(&temp))?;
        drop(file);

        if self.path.exists() {
            if backup.exists() {
                fs::remove_file(&backup).map_err(persistence(&backup))?;
            }
            fs::rename(&self.path, &backup).map_err(persistence(&self.path))?;
        }
        fs::rename(&temp, &self.path).map_err(persistence(&self.path))?;
        self.sync_parent();

        info!(
            path = %self.path.display(),
            bytes = bytes.len(),
            status = ?envelope.status(),
            "checkpoint written"
        );
        Ok(())
    }

    fn sync_parent(&self) {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "directory sync unavailable");
        }
    }

    /// Stamp the final `status`, checkpoint, and export traces if configured.
    ///
    /// # Errors
    ///
    /// See [`RecordStore::checkpoint`]; export failures surface as
    /// [`Error::Arrow`], [`Error::Parquet`] or [`Error::Persistence`].
    pub fn finalize(&self, envelope: &mut ExperimentEnvelope, status: RunStatus) -> Result<()> {
        envelope.complete(status);
        self.checkpoint(envelope)?;
        if let Some(export) = &self.trace_export {
            let rows = export_traces(envelope.record(), export)?;
            info!(path = %export.display(), rows, "traces exported");
        }
        Ok(())
    }

    /// Read an envelope from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the file cannot be read and
    /// [`Error::Serialization`] if it does not decode.
    pub fn load(path: impl AsRef<Path>) -> Result<ExperimentEnvelope> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(persistence(path))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the latest complete checkpoint: the target, or the `.bak` when
    /// the target is missing or unreadable.
    ///
    /// # Errors
    ///
    /// Returns the target's error when no backup exists, otherwise the
    /// backup's error.
    pub fn recover(&self) -> Result<ExperimentEnvelope> {
        match Self::load(&self.path) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                let backup = self.backup_path();
                if !backup.exists() {
                    return Err(e);
                }
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint unreadable, recovering from backup"
                );
                Self::load(backup)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ResultRecord;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "labsweep-store-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir.join("run.json")
    }

    #[test]
    fn test_suffix_paths() {
        let store = RecordStore::new("/data/run.json");
        assert_eq!(store.temp_path(), PathBuf::from("/data/run.json.tmp"));
        assert_eq!(store.backup_path(), PathBuf::from("/data/run.json.bak"));
    }

    #[test]
    fn test_checkpoint_rotates_backup() {
        let path = scratch("rotate");
        let store = RecordStore::new(&path);
        let mut envelope = ExperimentEnvelope::new("chip", "dev", ResultRecord::default());

        store.checkpoint(&envelope).unwrap();
        assert!(path.exists());
        assert!(!store.backup_path().exists());

        envelope.start();
        store.checkpoint(&envelope).unwrap();
        assert!(store.backup_path().exists());
        assert!(!store.temp_path().exists());

        let backup = RecordStore::load(store.backup_path()).unwrap();
        assert_eq!(backup.status(), RunStatus::Pending);
        assert_eq!(RecordStore::load(&path).unwrap().status(), RunStatus::Running);
    }

    #[test]
    fn test_recover_prefers_target() {
        let path = scratch("recover-target");
        let store = RecordStore::new(&path);
        let mut envelope = ExperimentEnvelope::new("chip", "dev", ResultRecord::default());
        store.checkpoint(&envelope).unwrap();
        envelope.start();
        store.checkpoint(&envelope).unwrap();
        assert_eq!(store.recover().unwrap().status(), RunStatus::Running);
    }

    #[test]
    fn test_load_missing_is_persistence_error() {
        let err = RecordStore::load(scratch("missing")).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
    }
}
