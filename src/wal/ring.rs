//! The WAL ring buffer: a fixed-capacity region of the container file holding append-only,
//! checksummed records: a true ring with sentinel termination and padding on wrap, rather than
//! a simple length-prefixed append log with no wraparound.

use std::fs::File;

use crate::errors::WaxError;
use crate::fileio;
use crate::wal::record::{RECORD_HEADER_LEN, RecordHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    None,
    EveryBytes(u64),
    Always,
}

pub struct WalRing {
    base_offset: u64,
    capacity: u64,
    pub write_pos: u64,
    pub checkpoint_pos: u64,
    pub last_sequence: u64,
    pub wrap_count: u64,
    pub checkpoint_count: u64,
    pub faulted: bool,
    fsync_policy: FsyncPolicy,
    bytes_since_fsync: u64,
}

impl WalRing {
    #[must_use]
    pub fn new(base_offset: u64, capacity: u64, fsync_policy: FsyncPolicy) -> Self {
        Self {
            base_offset,
            capacity,
            write_pos: base_offset,
            checkpoint_pos: base_offset,
            last_sequence: 0,
            wrap_count: 0,
            checkpoint_count: 0,
            faulted: false,
            fsync_policy,
            bytes_since_fsync: 0,
        }
    }

    fn end_offset(&self) -> u64 {
        self.base_offset + self.capacity
    }

    /// Appends a single record, wrapping and padding the tail as needed. Returns the sequence
    /// number assigned to the record.
    pub fn append(&mut self, file: &mut File, body: &[u8]) -> Result<u64, WaxError> {
        if self.faulted {
            return Err(WaxError::WalCorruption { offset: self.write_pos, reason: "ring is faulted".into() });
        }
        let record_len = RECORD_HEADER_LEN as u64 + body.len() as u64;
        if record_len > self.capacity {
            return Err(WaxError::CapacityExceeded { limit: self.capacity, requested: record_len });
        }

        let remaining_before_end = self.end_offset() - self.write_pos;
        if record_len > remaining_before_end {
            self.write_padding(file, remaining_before_end)?;
            self.write_pos = self.base_offset;
            self.wrap_count += 1;
        }

        let sequence = self.last_sequence + 1;
        let header = RecordHeader::for_body(sequence, 0, body);
        let mut out = header.encode();
        out.extend_from_slice(body);
        fileio::pwrite(file, self.write_pos, &out)?;
        self.write_pos += record_len;
        self.last_sequence = sequence;
        self.bytes_since_fsync += record_len;
        self.maybe_fsync(file)?;
        Ok(sequence)
    }

    /// Appends a batch of records as one durability unit: all records are written, then a
    /// single fsync is issued if the policy calls for one.
    pub fn append_batch(&mut self, file: &mut File, bodies: &[Vec<u8>]) -> Result<Vec<u64>, WaxError> {
        let mut sequences = Vec::with_capacity(bodies.len());
        for body in bodies {
            sequences.push(self.append(file, body)?);
        }
        Ok(sequences)
    }

    fn write_padding(&mut self, file: &mut File, space: u64) -> Result<(), WaxError> {
        if space == 0 {
            return Ok(());
        }
        if space < RECORD_HEADER_LEN as u64 {
            // Not even enough room for a padding header; the ring's capacity accounting
            // guarantees this cannot happen for a well-formed ring, but guard anyway.
            return Err(WaxError::WalCorruption {
                offset: self.write_pos,
                reason: "insufficient space for padding record".into(),
            });
        }
        let pad_body_len = (space - RECORD_HEADER_LEN as u64) as u32;
        let header = RecordHeader::padding(self.last_sequence + 1, pad_body_len);
        let mut out = header.encode();
        out.resize(RECORD_HEADER_LEN + pad_body_len as usize, 0);
        fileio::pwrite(file, self.write_pos, &out)?;
        Ok(())
    }

    fn maybe_fsync(&mut self, file: &File) -> Result<(), WaxError> {
        match self.fsync_policy {
            FsyncPolicy::None => Ok(()),
            FsyncPolicy::Always => {
                self.bytes_since_fsync = 0;
                fileio::fdatasync(file)
            }
            FsyncPolicy::EveryBytes(n) => {
                if self.bytes_since_fsync >= n {
                    self.bytes_since_fsync = 0;
                    fileio::fdatasync(file)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Advances the checkpoint position past all records durably applied to the frame store,
    /// allowing the space they occupied to be reclaimed on the next wrap.
    pub fn checkpoint(&mut self, up_to_pos: u64) {
        self.checkpoint_pos = up_to_pos;
        self.checkpoint_count += 1;
    }

    /// Scans from `self.checkpoint_pos` forward, stopping at the first record whose checksum
    /// fails, whose declared length runs past the ring's capacity, or that is all-zero
    /// (unwritten tail) — that point is "pending mutations" committed to the WAL but not yet
    /// reflected in frame-store state, used during recovery.
    pub fn scan_pending_mutations(&self, file: &mut File) -> Result<Vec<(u64, Vec<u8>)>, WaxError> {
        let mut out = Vec::new();
        let mut pos = self.checkpoint_pos;
        let mut visited_bytes = 0u64;
        while visited_bytes < self.capacity {
            let header_bytes = match fileio::pread(file, pos, RECORD_HEADER_LEN) {
                Ok(b) => b,
                Err(_) => break,
            };
            if header_bytes.iter().all(|&b| b == 0) {
                break;
            }
            let header = match RecordHeader::decode(&header_bytes) {
                Ok(h) => h,
                Err(_) => break,
            };
            let body_len = header.length as u64;
            if pos + RECORD_HEADER_LEN as u64 + body_len > self.end_offset() {
                break;
            }
            let body = fileio::pread(file, pos + RECORD_HEADER_LEN as u64, body_len as usize)?;
            if header.verify(&body).is_err() {
                break;
            }
            let record_len = RECORD_HEADER_LEN as u64 + body_len;
            if !header.is_padding() {
                out.push((header.sequence, body));
            }
            pos += record_len;
            visited_bytes += record_len;
            if pos >= self.end_offset() {
                pos = self.base_offset;
            }
        }
        Ok(out)
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open(path: &std::path::Path) -> File {
        fileio::open_rw(path).unwrap()
    }

    #[test]
    fn append_and_scan_pending_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.bin");
        let mut file = open(&path);
        file.set_len(4096).unwrap();
        let mut ring = WalRing::new(0, 4096, FsyncPolicy::Always);

        ring.append(&mut file, b"first record").unwrap();
        ring.append(&mut file, b"second record").unwrap();

        let pending = ring.scan_pending_mutations(&mut file).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1, b"first record");
        assert_eq!(pending[1].1, b"second record");
    }

    #[test]
    fn checkpoint_clears_scanned_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.bin");
        let mut file = open(&path);
        file.set_len(4096).unwrap();
        let mut ring = WalRing::new(0, 4096, FsyncPolicy::Always);
        ring.append(&mut file, b"one").unwrap();
        let pos_after_one = ring.write_pos;
        ring.append(&mut file, b"two").unwrap();

        ring.checkpoint(pos_after_one);
        let pending = ring.scan_pending_mutations(&mut file).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, b"two");
    }

    #[test]
    fn wraps_with_padding_when_tail_too_small() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.bin");
        let mut file = open(&path);
        let capacity = (RECORD_HEADER_LEN as u64) * 3 + 32;
        file.set_len(capacity).unwrap();
        let mut ring = WalRing::new(0, capacity, FsyncPolicy::Always);

        ring.append(&mut file, b"0123456789012345").unwrap(); // fills most of the ring
        let before_wrap = ring.wrap_count;
        ring.append(&mut file, b"small").unwrap(); // should force a wrap
        assert!(ring.wrap_count > before_wrap);
    }

    #[test]
    fn rejects_record_larger_than_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ring.bin");
        let mut file = open(&path);
        file.set_len(64).unwrap();
        let mut ring = WalRing::new(0, 64, FsyncPolicy::None);
        let big_body = vec![0u8; 128];
        assert!(matches!(ring.append(&mut file, &big_body), Err(WaxError::CapacityExceeded { .. })));
    }
}
