//! Numbered backup rotation for the active log file.
//!
//! Backups live next to the active file as `phoenix.log.1`, `phoenix.log.2`,
//! ... with `.gz` appended when compressed. Slot 1 is always the newest.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::{LOG_FILE_NAME, RotationConfig, SinkError};

/// Path of backup slot `index` in `dir`.
pub fn backup_path(dir: &Path, index: usize, compressed: bool) -> PathBuf {
    let suffix = if compressed { ".gz" } else { "" };
    dir.join(format!("{LOG_FILE_NAME}.{index}{suffix}"))
}

/// Shift every backup up one slot and move the active file into slot 1.
///
/// The backup that would land past `retention` is deleted. With a retention
/// of zero the active file is simply discarded.
pub fn rotate(dir: &Path, config: &RotationConfig) -> Result<(), SinkError> {
    let active = dir.join(LOG_FILE_NAME);

    if config.retention == 0 {
        remove_if_exists(&active)?;
        debug!(dir = %dir.display(), "discarded active log (no retention)");
        return Ok(());
    }

    for compressed in [false, true] {
        remove_if_exists(&backup_path(dir, config.retention, compressed))?;
    }

    for index in (1..config.retention).rev() {
        for compressed in [false, true] {
            let from = backup_path(dir, index, compressed);
            if from.exists() {
                fs::rename(&from, backup_path(dir, index + 1, compressed))?;
            }
        }
    }

    if config.compress {
        compress_into(&active, &backup_path(dir, 1, true))?;
        fs::remove_file(&active)?;
    } else {
        fs::rename(&active, backup_path(dir, 1, false))?;
    }

    debug!(
        dir = %dir.display(),
        retention = config.retention,
        compress = config.compress,
        "rotated log file"
    );
    Ok(())
}

fn compress_into(src: &Path, dest: &Path) -> io::Result<()> {
    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(File::create(dest)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
