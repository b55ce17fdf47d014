use crate::{Result, types::Snapshot};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Blob store holding the latest snapshot.
pub trait SnapshotStore: Send + Sync {
    fn write(&self, snapshot: &Snapshot) -> Result<()>;

    /// `None` when nothing has been written yet.
    fn read(&self) -> Result<Option<Snapshot>>;
}

/// Keeps the latest snapshot as pretty-printed JSON in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonFileStore {
    fn write(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(snapshot)?;

        // Write to a sibling temp file then rename so readers never see a partial blob
        let temp_path = self.path.with_extension("json.tmp");
        {
            let mut temp_file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            temp_file.write_all(contents.as_bytes())?;
            temp_file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!(path = ?self.path, ips = snapshot.ips.len(), "saved snapshot");
        Ok(())
    }

    fn read(&self) -> Result<Option<Snapshot>> {
        if !self.path.exists() {
            debug!(path = ?self.path, "no persisted snapshot");
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }
}
