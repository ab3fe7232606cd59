use ipm_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Per-node logical clock persisted to a single file.
///
/// The value only moves forward: `current = max(current, observed)`. It is
/// written to disk on every update so it survives restarts.
#[derive(Debug)]
pub struct Epoch {
    path: PathBuf,
    current: i64,
}

impl Epoch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> i64 {
        self.current
    }

    /// Read the persisted value; returns false when no epoch file exists
    pub fn load(&mut self) -> Result<bool> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(Error::file(&self.path, e)),
        };

        self.current = data.trim().parse().map_err(|_| {
            Error::Storage(format!(
                "invalid epoch value in {}: {:?}",
                self.path.display(),
                data.trim()
            ))
        })?;

        debug!(epoch = self.current, "epoch loaded");
        Ok(true)
    }

    /// Advance to `observed` if it is newer; 0 means "now"
    pub fn update(&mut self, observed: i64) -> Result<i64> {
        let observed = if observed == 0 { now_millis() } else { observed };
        if observed > self.current {
            self.current = observed;
        }
        self.store()?;

        debug!(epoch = self.current, "epoch updated");
        Ok(self.current)
    }

    /// A fresh stamp for a local mutation, strictly above everything seen so far
    pub fn tick(&self) -> i64 {
        now_millis().max(self.current + 1)
    }

    fn store(&self) -> Result<()> {
        std::fs::write(&self.path, self.current.to_string()).map_err(|e| Error::file(&self.path, e))
    }
}
