//! Positioned file I/O, advisory locking, and optional memory-mapped reads.
//!
//! Every whisper operation opens exactly one [`StoreFile`] for its duration.
//! Writers hold an exclusive advisory lock and readers a shared one when
//! locking is requested; the lock is released on every exit path when the
//! handle drops.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use memmap2::Mmap;

use crate::error::WhisperError;

/// Advisory lock taken for the whole operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Shared,
    Exclusive,
}

/// Zero chunk size used when densely allocating archive data regions.
const ZERO_CHUNK: usize = 16384;

/// An open whisper file plus its lock state and optional read-only map.
#[derive(Debug)]
pub struct StoreFile {
    file: File,
    path: PathBuf,
    locked: bool,
    map: Option<Mmap>,
}

impl StoreFile {
    /// Opens an existing file. `writable` selects read-write vs read-only;
    /// the lock, when requested, is acquired before any byte is read.
    pub fn open(path: &Path, writable: bool, lock: LockMode) -> Result<Self, WhisperError> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)?;
        let locked = acquire_lock(&file, lock)?;
        Ok(StoreFile {
            file,
            path: path.to_path_buf(),
            locked,
            map: None,
        })
    }

    /// Creates a brand-new file, failing if the path already exists.
    pub fn create_new(path: &Path, lock: LockMode) -> Result<Self, WhisperError> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WhisperError::FileExists(path.to_path_buf()));
            }
            Err(e) => return Err(WhisperError::Io(e)),
        };
        let locked = acquire_lock(&file, lock)?;
        Ok(StoreFile {
            file,
            path: path.to_path_buf(),
            locked,
            map: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64, WhisperError> {
        Ok(self.file.metadata()?.len())
    }

    /// Maps the file read-only for scan-heavy operations. Subsequent
    /// `read_at` calls are served from the map.
    pub fn map_readonly(&mut self) -> Result<(), WhisperError> {
        if self.map.is_none() {
            self.map = Some(unsafe { Mmap::map(&self.file)? });
        }
        Ok(())
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), WhisperError> {
        if let Some(map) = &self.map {
            let start = offset as usize;
            let end = start + buf.len();
            if end > map.len() {
                return Err(WhisperError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "read past end of mapped file",
                )));
            }
            buf.copy_from_slice(&map[start..end]);
            return Ok(());
        }
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        f.read_exact(buf)?;
        Ok(())
    }

    /// Writes the whole buffer at `offset`. Whole points only; callers never
    /// split a 12-byte record across two writes except at the ring boundary.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<(), WhisperError> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(offset))?;
        f.write_all(buf)?;
        Ok(())
    }

    /// Extends the file with zeroes from `start` up to `total_len`.
    ///
    /// Dense allocation writes real zero chunks; sparse allocation seeks to
    /// the last byte and writes a single zero, leaving the filesystem to
    /// materialize the hole.
    pub fn allocate(&self, start: u64, total_len: u64, sparse: bool) -> Result<(), WhisperError> {
        if total_len <= start {
            return Ok(());
        }
        let mut f = &self.file;
        if sparse {
            f.seek(SeekFrom::Start(total_len - 1))?;
            f.write_all(&[0u8])?;
            return Ok(());
        }
        f.seek(SeekFrom::Start(start))?;
        let zeroes = [0u8; ZERO_CHUNK];
        let mut remaining = (total_len - start) as usize;
        while remaining > ZERO_CHUNK {
            f.write_all(&zeroes)?;
            remaining -= ZERO_CHUNK;
        }
        f.write_all(&zeroes[..remaining])?;
        Ok(())
    }

    /// Flushes file data to stable storage.
    pub fn sync_data(&self) -> Result<(), WhisperError> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for StoreFile {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.file.unlock();
        }
    }
}

fn acquire_lock(file: &File, lock: LockMode) -> Result<bool, WhisperError> {
    match lock {
        LockMode::None => Ok(false),
        LockMode::Shared => {
            file.lock_shared()?;
            Ok(true)
        }
        LockMode::Exclusive => {
            file.lock_exclusive()?;
            Ok(true)
        }
    }
}

/// Fsyncs a directory so a rename performed inside it is durable.
pub fn sync_dir(dir: &Path) -> Result<(), WhisperError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

/// Removes a half-created file, ignoring failures; used when `create` hits an
/// I/O error after the file has been opened.
pub fn remove_partial(path: &Path) {
    let _ = fs::remove_file(path);
}
