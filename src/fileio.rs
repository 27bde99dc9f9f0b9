//! Positional file I/O, atomic replace, and the cross-process writer lease.
//!
//! Checkpoint routine: write a temporary file, `sync_data`, then atomically replace the target
//! (rename on Unix, remove+rename on Windows since `rename` there refuses to overwrite).
//! Positional reads/writes use `Seek` + `read_exact`/`write_all` rather than raw
//! `pread`/`pwrite` syscalls, trading a little performance for portability (see DESIGN.md
//! Open Question #2).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::WaxError;

/// Opens (creating if necessary) the container file for read+write positional access.
pub fn open_rw(path: &Path) -> Result<File, WaxError> {
    Ok(OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?)
}

/// Opens the container file read-only. Returns `io` error if it does not exist.
pub fn open_ro(path: &Path) -> Result<File, WaxError> {
    Ok(OpenOptions::new().read(true).open(path)?)
}

/// Reads exactly `len` bytes starting at `offset`.
pub fn pread(file: &mut File, offset: u64, len: usize) -> Result<Vec<u8>, WaxError> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Writes `bytes` starting at `offset`. Does not fsync; callers control durability points.
pub fn pwrite(file: &mut File, offset: u64, bytes: &[u8]) -> Result<(), WaxError> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes)?;
    Ok(())
}

/// Fsyncs file data and metadata.
pub fn fsync(file: &File) -> Result<(), WaxError> {
    file.sync_all()?;
    Ok(())
}

/// Fsyncs file data only (skips metadata when the platform distinguishes them).
pub fn fdatasync(file: &File) -> Result<(), WaxError> {
    file.sync_data()?;
    Ok(())
}

/// Atomically replaces `target` with `bytes`: write to a sibling `.tmp` file, fsync, then
/// rename over the target. On Windows, `rename` cannot overwrite an existing file, so the
/// target is removed first (still after the tmp file is durable on disk).
pub fn atomic_replace(target: &Path, bytes: &[u8]) -> Result<(), WaxError> {
    let tmp_path = tmp_sibling(target);
    {
        let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    #[cfg(target_os = "windows")]
    {
        if target.exists() {
            std::fs::remove_file(target)?;
        }
    }
    std::fs::rename(&tmp_path, target)?;
    Ok(())
}

fn tmp_sibling(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// Advisory, cross-process single-writer lease backed by a sibling lock file created with
/// `create_new` (atomic create-if-absent across platforms). Released on drop.
///
/// This is paired at a higher layer (`session.rs`) with an in-process `parking_lot::Mutex` so
/// a single process never even reaches the filesystem lock contention path for its own
/// concurrent writers.
pub struct WriterLease {
    lock_path: PathBuf,
}

impl WriterLease {
    /// Attempts to acquire the lease for `container_path`. Returns `WriterBusy` if another
    /// process (or a prior crashed process that left the lock file behind) holds it.
    pub fn acquire(container_path: &Path) -> Result<Self, WaxError> {
        let lock_path = lock_path_for(container_path);
        match OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Self { lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(WaxError::LockUnavailable(format!("writer lease held: {}", lock_path.display())))
            }
            Err(e) => Err(WaxError::Io(e)),
        }
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

fn lock_path_for(container_path: &Path) -> PathBuf {
    let mut name = container_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    container_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn positional_read_write_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        let mut f = open_rw(&path).unwrap();
        f.set_len(4096).unwrap();
        pwrite(&mut f, 10, b"hello").unwrap();
        let got = pread(&mut f, 10, 5).unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn atomic_replace_leaves_no_tmp_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        atomic_replace(&path, b"v1").unwrap();
        atomic_replace(&path, b"v2").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"v2");
        assert!(!tmp_sibling(&path).exists());
    }

    #[test]
    fn writer_lease_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.mv2s");
        let lease = WriterLease::acquire(&path).unwrap();
        assert!(WriterLease::acquire(&path).is_err());
        drop(lease);
        assert!(WriterLease::acquire(&path).is_ok());
    }
}
