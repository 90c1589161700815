//! Persistence for the time-zero stage position.
//!
//! T0, the stage position corresponding to zero optical delay, must survive
//! process restarts. It is stored as a single scalar in a plain text file
//! under the per-application data directory and rewritten on every update.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{FrogError, FrogResult};

const T0_FILENAME: &str = "T0_um.txt";

/// File-backed store for the T0 calibration point.
#[derive(Clone, Debug)]
pub struct TimeZeroStore {
    path: PathBuf,
}

impl TimeZeroStore {
    /// Store at an explicit file path.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store at the well-known per-application location,
    /// `<data_dir>/<app_name>/T0_um.txt`.
    pub fn at_default_location(app_name: &str) -> FrogResult<Self> {
        let base = dirs::data_dir().ok_or_else(|| {
            FrogError::Configuration("no per-user data directory on this platform".into())
        })?;
        Ok(Self {
            path: base.join(app_name).join(T0_FILENAME),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted T0, or `None` when no calibration has been saved.
    pub fn load(&self) -> FrogResult<Option<f64>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value: f64 = text.trim().parse().map_err(|_| {
            FrogError::Configuration(format!(
                "unparseable T0 value in {}: {:?}",
                self.path.display(),
                text.trim()
            ))
        })?;
        Ok(Some(value))
    }

    /// Persist a new T0 value, creating parent directories as needed.
    pub fn save(&self, t0_um: f64) -> FrogResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{t0_um}"))?;
        debug!(t0_um, path = %self.path.display(), "persisted T0");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_returns_none_when_absent() {
        let dir = tempdir().unwrap();
        let store = TimeZeroStore::new(dir.path().join(T0_FILENAME));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = TimeZeroStore::new(dir.path().join("nested").join(T0_FILENAME));
        store.save(12_345.678).unwrap();
        assert_eq!(store.load().unwrap(), Some(12_345.678));

        // Every update rewrites the file.
        store.save(99.5).unwrap();
        assert_eq!(store.load().unwrap(), Some(99.5));
    }

    #[test]
    fn garbage_content_is_a_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(T0_FILENAME);
        std::fs::write(&path, "not a number").unwrap();
        let store = TimeZeroStore::new(&path);
        assert!(matches!(
            store.load(),
            Err(FrogError::Configuration(_))
        ));
    }

    #[test]
    fn default_location_is_under_app_dir() {
        if let Ok(store) = TimeZeroStore::at_default_location("frog_daq") {
            let path = store.path().to_string_lossy().into_owned();
            assert!(path.contains("frog_daq"));
            assert!(path.ends_with(T0_FILENAME));
        }
    }
}
