use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

/// Exclusive advisory lock on a workspace lock file.
///
/// Holds the lock for as long as the value lives. The holder's request ID is
/// written into the file so that other processes can name it in conflicts.
#[derive(Debug)]
pub struct WorkspaceLockFile {
    file: File,
}

impl WorkspaceLockFile {
    /// Try to take the lock without blocking. `Ok(None)` means another open
    /// file description (usually another process) holds it.
    pub fn try_acquire(lock_path: &Path, holder: &str) -> Result<Option<Self>, StoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(holder.as_bytes())?;
        file.sync_data()?;

        Ok(Some(Self { file }))
    }

    /// Request ID recorded by the current or last holder, if any.
    pub fn read_holder(lock_path: &Path) -> Option<String> {
        std::fs::read_to_string(lock_path)
            .ok()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
    }
}

impl Drop for WorkspaceLockFile {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}
