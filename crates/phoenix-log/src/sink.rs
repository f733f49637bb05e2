//! The durable file sink behind the diagnostic log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use phoenix_runtime::{DirStore, PersistentStore, WriteMode};

use crate::rotation::rotate;
use crate::{LOG_FILE_NAME, RotationConfig, SinkError};

/// A directory holding the active log file, its backups, and any deferred
/// artifacts.
#[derive(Debug)]
pub(crate) struct FileSink {
    store: DirStore,
    rotation: RotationConfig,
}

impl FileSink {
    /// Open a sink in `dir`, creating the directory if needed.
    pub(crate) fn open(dir: &Path, rotation: RotationConfig) -> Result<Self, SinkError> {
        Ok(Self {
            store: DirStore::create(dir)?,
            rotation,
        })
    }

    pub(crate) fn dir(&self) -> &Path {
        self.store.path()
    }

    /// Whether the directory is still there (the card may have been pulled).
    pub(crate) fn is_available(&self) -> bool {
        self.store.is_available()
    }

    /// Append one line, rotating first if it would push the active file past
    /// the size threshold.
    pub(crate) fn append_line(&self, line: &str) -> Result<(), SinkError> {
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');

        let current = self.active_len()?;
        if current > 0 && current + payload.len() as u64 > self.rotation.max_bytes {
            rotate(self.dir(), &self.rotation)?;
        }

        self.store
            .write(LOG_FILE_NAME, &payload, WriteMode::Append)?;
        Ok(())
    }

    /// Write a named artifact next to the log file.
    pub(crate) fn write_artifact(
        &self,
        name: &str,
        contents: &str,
        mode: WriteMode,
    ) -> Result<(), SinkError> {
        self.store.write(name, contents, mode)?;
        Ok(())
    }

    pub(crate) fn active_path(&self) -> PathBuf {
        self.dir().join(LOG_FILE_NAME)
    }

    fn active_len(&self) -> Result<u64, SinkError> {
        match fs::metadata(self.active_path()) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}
