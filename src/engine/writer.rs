//! Concurrent sparse-file writer
//!
//! Many workers write into one file at distinct offsets. Handles are
//! cached per path behind an RW-lock so the map is only contended on
//! first touch; each handle carries its own mutex held just for the
//! positional-write syscall (`pwrite` on Unix, `seek_write` on
//! Windows). No userspace buffering — bytes go straight to the page
//! cache at their final offset, which makes re-runs idempotent.

use crate::error::Result;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

struct FileHandle {
    mutex: Mutex<()>,
    file: File,
}

impl FileHandle {
    #[cfg(unix)]
    fn write_at(&self, data: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(data, offset)
    }

    #[cfg(windows)]
    fn write_at(&self, data: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < data.len() {
            let n = self
                .file
                .seek_write(&data[written..], offset + written as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "seek_write returned zero",
                ));
            }
            written += n;
        }
        Ok(())
    }
}

/// Path → handle cache with positional-write access
pub struct FileWriter {
    handles: RwLock<HashMap<PathBuf, Arc<FileHandle>>>,
}

impl Default for FileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FileWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        FileWriter {
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Open-or-create the file and truncate it to `size`, producing a
    /// sparse file on POSIX: the metadata size changes, blocks are
    /// allocated only as workers land writes.
    pub fn pre_allocate(&self, path: &Path, size: u64) -> Result<()> {
        let handle = self.get_or_create(path)?;
        let _guard = handle.mutex.lock().unwrap_or_else(|e| e.into_inner());
        handle.file.set_len(size)?;
        Ok(())
    }

    /// Write `data` at an absolute offset. Safe to call from many
    /// threads for the same path; distinct offsets never interleave.
    pub fn write_at(&self, path: &Path, data: &[u8], offset: u64) -> Result<()> {
        let handle = self.get_or_create(path)?;
        let _guard = handle.mutex.lock().unwrap_or_else(|e| e.into_inner());
        handle.write_at(data, offset)?;
        Ok(())
    }

    fn get_or_create(&self, path: &Path) -> Result<Arc<FileHandle>> {
        // fast path: handle already cached
        if let Ok(handles) = self.handles.read()
            && let Some(handle) = handles.get(path)
        {
            return Ok(handle.clone());
        }

        let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
        // re-check: another writer may have opened it while we waited
        if let Some(handle) = handles.get(path) {
            return Ok(handle.clone());
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let handle = Arc::new(FileHandle {
            mutex: Mutex::new(()),
            file,
        });
        handles.insert(path.to_path_buf(), handle.clone());
        Ok(handle)
    }

    /// Drop the handle for `path`, truncating to `final_size` first when
    /// it is nonzero (removes pre-allocation padding), then fsync.
    ///
    /// The truncate/sync/close happen outside the map lock so slow disk
    /// I/O never blocks unrelated writers.
    pub fn close_file(&self, path: &Path, final_size: u64) -> Result<()> {
        let handle = {
            let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
            handles.remove(path)
        };

        let Some(handle) = handle else {
            return Ok(()); // already closed
        };

        let _guard = handle.mutex.lock().unwrap_or_else(|e| e.into_inner());
        if final_size > 0 {
            handle.file.set_len(final_size)?;
        }
        handle.file.sync_all()?;
        Ok(())
    }

    /// Best-effort close of every cached handle, without truncation
    pub fn close_all(&self) {
        let paths: Vec<PathBuf> = match self.handles.read() {
            Ok(handles) => handles.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };

        for path in paths {
            if let Err(e) = self.close_file(&path, 0) {
                tracing::warn!(path = %path.display(), error = %e, "failed to close file handle");
            }
        }
    }
}
