//! The container file format: dual-buffered headers, a WAL ring, an append-only payload region,
//! and a TOC + footer pair rewritten on every commit.
pub mod commit;
pub mod footer;
pub mod header;
pub mod recovery;
pub mod toc;

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::config::WaxConfig;
use crate::errors::WaxError;
use crate::fileio;
use crate::frame::FrameStore;
use crate::wal::{FsyncPolicy, WalRing};

pub const DEFAULT_WAL_CAPACITY: u64 = 4 * 1024 * 1024;

/// Owns the open file handle and durable-state bookkeeping for one `.mv2s` container.
pub struct ContainerFile {
    pub path: PathBuf,
    pub file: File,
    pub wal_capacity: u64,
    pub header_slot: usize,
    pub generation: u64,
    pub footer_offset: u64,
    pub payload_end: u64,
    pub frame_store: FrameStore,
    pub wal: WalRing,
}

impl ContainerFile {
    /// Opens `path`, creating and initializing a fresh container if it does not exist, or
    /// recovering the latest durable generation if it does.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WaxError> {
        Self::open_with_config(path, &WaxConfig::default())
    }

    /// Like [`Self::open`] but with an explicit [`WaxConfig`] governing WAL capacity and the
    /// fsync policy applied to every commit.
    pub fn open_with_config(path: impl AsRef<Path>, config: &WaxConfig) -> Result<Self, WaxError> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let mut file = fileio::open_rw(&path)?;
        let wal_capacity = config.wal_capacity_bytes;
        let fsync_policy: FsyncPolicy = config.fsync_policy.into();

        let state = if existed && file.metadata()?.len() > 0 {
            recovery::recover(&mut file, wal_capacity, fsync_policy)?
        } else {
            recovery::initialize_new(&mut file, wal_capacity, fsync_policy)?
        };

        Ok(Self {
            path,
            file,
            wal_capacity,
            header_slot: state.header_slot,
            generation: state.header.generation,
            footer_offset: state.header.footer_offset,
            payload_end: state.payload_end,
            frame_store: state.frame_store,
            wal: state.wal,
        })
    }

    pub fn payload_region_start(&self) -> u64 {
        commit::payload_region_start(self.wal_capacity)
    }

    /// Appends `body` to the WAL ring, returning the assigned sequence number. Callers must
    /// apply the corresponding mutation to `self.frame_store` themselves before `commit`.
    pub fn wal_append(&mut self, body: &[u8]) -> Result<u64, WaxError> {
        self.wal.append(&mut self.file, body)
    }

    /// Runs the four-step commit protocol, folding all pending frame mutations into a new
    /// durable generation.
    pub fn commit(&mut self) -> Result<(), WaxError> {
        let region_start = self.payload_region_start();
        let needed = region_start + self.frame_store.next_payload_offset() + 65536;
        if self.file.metadata()?.len() < needed {
            self.file.set_len(needed)?;
        }
        let outcome = commit::commit(
            &mut self.file,
            &mut self.wal,
            &mut self.frame_store,
            Some(self.header_slot),
            self.generation,
            region_start,
            self.payload_end,
        )?;
        self.header_slot = outcome.header_slot;
        self.generation = outcome.generation;
        self.payload_end = outcome.payload_end;
        self.footer_offset = outcome.footer_offset;
        Ok(())
    }

    pub fn read_payload(&mut self, offset: u64, length: u64) -> Result<Vec<u8>, WaxError> {
        let absolute = self.payload_region_start() + offset;
        fileio::pread(&mut self.file, absolute, length as usize)
    }
}
