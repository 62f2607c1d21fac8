// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared-memory segment mappings.
//!
//! Segments are files in the object store's segment directory, mapped with
//! `mmap(MAP_SHARED)` so every process that maps one sees the same bytes.
//! The pool is the only place that turns a `(segment, offset, size)` triple
//! into memory; callers get a bounds-checked [`SegmentView`].
//!
//! This module contains `unsafe` code for mmap/munmap. Each mapping is owned
//! by one [`Mapping`] value and unmapped in its `Drop`, so a segment is
//! unmapped exactly once, after the pool entry and every view are gone.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;

use orch_common::constants::SEGMENT_FILE_PREFIX;
use orch_common::id::{ObjStoreID, SegmentID};

use crate::error::{IpcError, IpcResult};

struct Mapping {
    segment_id: SegmentID,
    address: *mut u8,
    len: usize,
}

// The mapping is plain shared memory; access goes through bounds-checked views.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(segment_id: SegmentID, file: &File) -> IpcResult<Self> {
        let len = usize::try_from(file.metadata()?.len()).map_err(|_| IpcError::MapFailed {
            segment_id,
            reason: "segment too large".to_string(),
        })?;
        if len == 0 {
            return Err(IpcError::MapFailed {
                segment_id,
                reason: "segment is empty".to_string(),
            });
        }
        // Safety: fd is valid for the duration of the call; the kernel keeps
        // the mapping alive after the file is closed.
        let address = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if address == libc::MAP_FAILED {
            return Err(IpcError::MapFailed {
                segment_id,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        tracing::debug!(segment_id = %segment_id, len, "mapped segment");
        Ok(Self {
            segment_id,
            address: address as *mut u8,
            len,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // Safety: address/len come from a successful mmap and are unmapped only here.
        unsafe {
            libc::munmap(self.address as *mut libc::c_void, self.len);
        }
        tracing::debug!(segment_id = %self.segment_id, "unmapped segment");
    }
}

struct PoolEntry {
    mapping: Arc<Mapping>,
    holds: usize,
}

/// Bounds-checked window into a mapped segment.
pub struct SegmentView {
    mapping: Arc<Mapping>,
    offset: usize,
    len: usize,
}

impl SegmentView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_id(&self) -> SegmentID {
        self.mapping.segment_id
    }

    /// Offset of the view within its segment.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Start of the view in this process's address space.
    pub fn as_ptr(&self) -> *const u8 {
        // Safety: offset <= mapping.len was checked when the view was made.
        unsafe { self.mapping.address.add(self.offset) }
    }

    fn check(&self, at: usize, len: usize) -> IpcResult<()> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(IpcError::OutOfBounds {
                segment_id: self.segment_id(),
                offset: self.offset.saturating_add(at),
                len,
                segment_size: self.mapping.len,
            }),
        }
    }

    /// Copy `bytes` into the view starting at `at`.
    pub fn write(&mut self, at: usize, bytes: &[u8]) -> IpcResult<()> {
        self.check(at, bytes.len())?;
        // Safety: the destination range lies inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.mapping.address.add(self.offset + at),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `at` out of the view.
    pub fn read(&self, at: usize, len: usize) -> IpcResult<Vec<u8>> {
        self.check(at, len)?;
        let mut out = vec![0u8; len];
        // Safety: the source range lies inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(self.as_ptr().add(at), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        // Safety: the whole view lies inside the mapping.
        unsafe { self.as_slice().to_vec() }
    }

    /// Borrow the view as a slice.
    ///
    /// # Safety
    /// Other processes may write the segment concurrently. The caller must
    /// know the object is finished (immutable) before borrowing.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len)
    }
}

impl std::fmt::Debug for SegmentView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentView")
            .field("segment_id", &self.segment_id())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Maps the segments of one object store into this process.
pub struct MemorySegmentPool {
    objstore_id: ObjStoreID,
    directory: PathBuf,
    entries: Mutex<HashMap<SegmentID, PoolEntry>>,
}

impl MemorySegmentPool {
    pub fn new(objstore_id: ObjStoreID, directory: impl AsRef<Path>) -> Self {
        Self {
            objstore_id,
            directory: directory.as_ref().to_path_buf(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn objstore_id(&self) -> ObjStoreID {
        self.objstore_id
    }

    /// Backing file of a segment.
    pub fn segment_path(&self, segment_id: SegmentID) -> PathBuf {
        self.directory.join(format!(
            "{SEGMENT_FILE_PREFIX}-{}-segment-{segment_id}",
            self.objstore_id
        ))
    }

    /// Create and size the backing file of a segment (object-store side).
    pub fn create_segment(&self, segment_id: SegmentID, size: usize) -> IpcResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.segment_path(segment_id))?;
        file.set_len(size as u64)?;
        tracing::debug!(segment_id = %segment_id, size, "created segment");
        Ok(())
    }

    /// Remove a segment's backing file. Existing mappings stay valid.
    pub fn unlink_segment(&self, segment_id: SegmentID) -> IpcResult<()> {
        match std::fs::remove_file(self.segment_path(segment_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(IpcError::SegmentNotFound(segment_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Return a view of `size` bytes at `offset` in the segment, mapping the
    /// segment on first use. Each successful call takes one hold on the
    /// segment, returned with [`release`](Self::release).
    pub fn resolve(&self, segment_id: SegmentID, offset: usize, size: usize) -> IpcResult<SegmentView> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&segment_id) {
            let view = Self::view(&entry.mapping, offset, size)?;
            entry.holds += 1;
            return Ok(view);
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.segment_path(segment_id))
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(IpcError::SegmentNotFound(segment_id))
            }
            Err(e) => return Err(e.into()),
        };
        let mapping = Arc::new(Mapping::map(segment_id, &file)?);
        let view = Self::view(&mapping, offset, size)?;
        entries.insert(segment_id, PoolEntry { mapping, holds: 1 });
        Ok(view)
    }

    fn view(mapping: &Arc<Mapping>, offset: usize, size: usize) -> IpcResult<SegmentView> {
        match offset.checked_add(size) {
            Some(end) if end <= mapping.len => Ok(SegmentView {
                mapping: Arc::clone(mapping),
                offset,
                len: size,
            }),
            _ => Err(IpcError::OutOfBounds {
                segment_id: mapping.segment_id,
                offset,
                len: size,
                segment_size: mapping.len,
            }),
        }
    }

    /// Drop one hold on a segment. The pool forgets the mapping when the last
    /// hold goes; memory is unmapped when the last view is dropped too.
    /// Returns false if the segment was not held.
    pub fn release(&self, segment_id: SegmentID) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&segment_id) else {
            return false;
        };
        entry.holds -= 1;
        if entry.holds == 0 {
            entries.remove(&segment_id);
            tracing::debug!(segment_id = %segment_id, "released segment");
        }
        true
    }

    pub fn is_mapped(&self, segment_id: SegmentID) -> bool {
        self.entries.lock().contains_key(&segment_id)
    }

    pub fn num_mapped(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn holds(&self, segment_id: SegmentID) -> usize {
        self.entries
            .lock()
            .get(&segment_id)
            .map_or(0, |entry| entry.holds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &Path) -> MemorySegmentPool {
        MemorySegmentPool::new(ObjStoreID::new(3), dir)
    }

    #[test]
    fn test_segment_path() {
        let p = MemorySegmentPool::new(ObjStoreID::new(7), "/dev/shm");
        assert_eq!(
            p.segment_path(SegmentID::new(2)),
            PathBuf::from("/dev/shm/orch-objstore-7-segment-2")
        );
    }

    #[test]
    fn test_write_visible_through_second_view() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let seg = SegmentID::new(0);
        pool.create_segment(seg, 4096).unwrap();

        let mut writer = pool.resolve(seg, 100, 5).unwrap();
        writer.write(0, b"hello").unwrap();

        let reader = pool.resolve(seg, 100, 5).unwrap();
        assert_eq!(reader.to_vec(), b"hello");
        assert_eq!(reader.read(1, 3).unwrap(), b"ell");
        assert_eq!(reader.segment_id(), seg);
        assert_eq!(reader.offset(), 100);
        assert_eq!(pool.num_mapped(), 1);
        assert_eq!(pool.holds(seg), 2);
    }

    #[test]
    fn test_two_pools_share_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = pool(dir.path());
        let worker = pool(dir.path());
        let seg = SegmentID::new(1);
        store.create_segment(seg, 64).unwrap();

        let mut view = store.resolve(seg, 0, 8).unwrap();
        view.write(0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let seen = worker.resolve(seg, 4, 4).unwrap();
        assert_eq!(seen.to_vec(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let seg = SegmentID::new(0);
        pool.create_segment(seg, 16).unwrap();

        assert!(matches!(
            pool.resolve(seg, 10, 7),
            Err(IpcError::OutOfBounds { segment_size: 16, .. })
        ));
        assert!(matches!(
            pool.resolve(seg, usize::MAX, 2),
            Err(IpcError::OutOfBounds { .. })
        ));
        // A failed first resolve leaves nothing mapped.
        assert!(!pool.is_mapped(seg));

        let mut view = pool.resolve(seg, 8, 8).unwrap();
        assert!(view.write(4, b"too long").is_err());
        assert!(view.read(9, 0).is_err());
        assert!(view.read(8, 0).unwrap().is_empty());
    }

    #[test]
    fn test_missing_and_empty_segments() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        assert!(matches!(
            pool.resolve(SegmentID::new(9), 0, 1),
            Err(IpcError::SegmentNotFound(_))
        ));
        assert!(matches!(
            pool.unlink_segment(SegmentID::new(9)),
            Err(IpcError::SegmentNotFound(_))
        ));

        pool.create_segment(SegmentID::new(4), 0).unwrap();
        assert!(matches!(
            pool.resolve(SegmentID::new(4), 0, 0),
            Err(IpcError::MapFailed { .. })
        ));
    }

    #[test]
    fn test_release_counts_holds() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let seg = SegmentID::new(0);
        pool.create_segment(seg, 32).unwrap();

        let _a = pool.resolve(seg, 0, 4).unwrap();
        let _b = pool.resolve(seg, 4, 4).unwrap();
        assert!(pool.release(seg));
        assert!(pool.is_mapped(seg));
        assert!(pool.release(seg));
        assert!(!pool.is_mapped(seg));
        assert!(!pool.release(seg));
    }

    #[test]
    fn test_view_outlives_release_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(dir.path());
        let seg = SegmentID::new(0);
        pool.create_segment(seg, 32).unwrap();

        let mut view = pool.resolve(seg, 0, 4).unwrap();
        view.write(0, b"keep").unwrap();
        pool.release(seg);
        pool.unlink_segment(seg).unwrap();
        assert_eq!(pool.num_mapped(), 0);
        assert_eq!(view.to_vec(), b"keep");
    }
}
