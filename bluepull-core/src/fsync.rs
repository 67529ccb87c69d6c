//! Atomic file persistence.
//!
//! Durable writes go through a write-to-temp-then-rename sequence:
//! write `<path>.tmp`, fsync the file, rename onto `<path>`, fsync the
//! parent directory. A reader racing with a writer sees either the old
//! complete document or the new one, never a torn write.
//!
//! The directory fsync matters: a rename updates the directory entry, and
//! without syncing the directory that entry may not survive a power loss
//! even though the file contents did.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Syncs a file's contents and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Syncs a directory, making its entries durable.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

/// `<path>.tmp`, preserving the original extension.
fn tmp_path_for(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Writes `data` to `path` atomically, creating parent directories as needed.
pub fn atomic_write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_path_for(path);
    let mut file = File::create(&tmp_path)?;
    file.write_all(data)?;
    fsync_file(&file)?;
    drop(file);

    fs::rename(&tmp_path, path)?;

    if let Some(parent) = parent {
        fsync_dir(parent)?;
    }
    Ok(())
}
