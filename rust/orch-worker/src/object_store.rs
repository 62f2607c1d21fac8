// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker side of the object-store channel.
//!
//! Requests go out on the store's shared request socket; replies come back
//! on this worker's own reply socket. One round trip is in flight at a time
//! and every request carries a fresh sequence number, so a reply is matched
//! to the request that produced it. Mapped buffers are tracked per object so
//! `unmap_object` can return exactly the holds it took.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use orch_common::config::OrchConfig;
use orch_common::id::{ObjStoreID, ObjectID, SegmentID, WorkerID};
use orch_ipc::object_channel::{
    objstore_reply_queue_name, objstore_request_queue_name, ObjHandle, ObjHandleStatus,
    ObjRequest, ObjRequestKind,
};
use orch_ipc::{IpcError, MemorySegmentPool, SegmentView, SocketQueue, SocketSender};

use crate::error::{WorkerError, WorkerResult};

/// A finished object mapped into this process.
#[derive(Debug)]
pub struct ObjectBuffer {
    pub view: SegmentView,
    pub size: usize,
    pub segment_id: SegmentID,
    /// Offset within the buffer where type metadata begins. Never past `size`.
    pub metadata_offset: usize,
}

impl ObjectBuffer {
    pub fn as_ptr(&self) -> *const u8 {
        self.view.as_ptr()
    }

    /// Payload bytes preceding the metadata.
    pub fn data(&self) -> WorkerResult<Vec<u8>> {
        Ok(self.view.read(0, self.metadata_offset)?)
    }

    pub fn metadata(&self) -> WorkerResult<Vec<u8>> {
        let len = self.size.checked_sub(self.metadata_offset).ok_or_else(|| {
            WorkerError::InvalidArgument(format!(
                "metadata offset {} past object size {}",
                self.metadata_offset, self.size
            ))
        })?;
        Ok(self.view.read(self.metadata_offset, len)?)
    }
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    segment_id: SegmentID,
    holds: usize,
}

/// Request channel to an object store. Opening it needs nothing from the
/// scheduler, so a worker can check the store is reachable before it
/// registers.
pub struct ObjStoreRequests {
    address: String,
    sender: SocketSender<ObjRequest>,
}

impl ObjStoreRequests {
    pub fn open(objstore_address: &str, config: &OrchConfig) -> WorkerResult<Self> {
        let sender = SocketSender::connect(
            &config.segment_directory,
            &objstore_request_queue_name(objstore_address),
        )
        .map_err(unavailable)?;
        Ok(Self {
            address: objstore_address.to_string(),
            sender,
        })
    }
}

pub struct ObjectStoreClient {
    worker_id: WorkerID,
    requests: SocketSender<ObjRequest>,
    replies: SocketQueue<ObjHandle>,
    pool: MemorySegmentPool,
    /// Held for a whole round trip; guards the next sequence number.
    round_trip: Mutex<u64>,
    mapped: Mutex<HashMap<ObjectID, Mapping>>,
    /// Sizes of buffers allocated here and not finished yet.
    unfinished: Mutex<HashMap<ObjectID, usize>>,
    reply_timeout: Duration,
}

impl ObjectStoreClient {
    /// Open the store's request channel and create this worker's reply queue.
    pub fn connect(
        worker_id: WorkerID,
        objstore_id: ObjStoreID,
        objstore_address: &str,
        config: &OrchConfig,
    ) -> WorkerResult<Self> {
        let requests = ObjStoreRequests::open(objstore_address, config)?;
        Self::with_requests(worker_id, objstore_id, requests, config)
    }

    /// Create this worker's reply queue on top of an already opened request
    /// channel.
    pub fn with_requests(
        worker_id: WorkerID,
        objstore_id: ObjStoreID,
        requests: ObjStoreRequests,
        config: &OrchConfig,
    ) -> WorkerResult<Self> {
        let replies = SocketQueue::create(
            &config.segment_directory,
            &objstore_reply_queue_name(&requests.address, worker_id),
            config.objstore_queue_capacity,
        )?;
        tracing::info!(
            worker_id = %worker_id,
            objstore_id = %objstore_id,
            objstore_address = %requests.address,
            "connected to object store"
        );
        Ok(Self {
            worker_id,
            requests: requests.sender,
            replies,
            pool: MemorySegmentPool::new(objstore_id, &config.segment_directory),
            round_trip: Mutex::new(0),
            mapped: Mutex::new(HashMap::new()),
            unfinished: Mutex::new(HashMap::new()),
            reply_timeout: config.objstore_reply_timeout(),
        })
    }

    pub fn pool(&self) -> &MemorySegmentPool {
        &self.pool
    }

    fn send(&self, seq: u64, object_id: ObjectID, kind: ObjRequestKind) -> WorkerResult<()> {
        self.requests
            .send(ObjRequest {
                seq,
                worker_id: self.worker_id,
                object_id,
                kind,
            })
            .map_err(unavailable)
    }

    fn request(&self, object_id: ObjectID, kind: ObjRequestKind) -> WorkerResult<ObjHandle> {
        let mut next_seq = self.round_trip.lock();
        *next_seq += 1;
        let seq = *next_seq;
        self.send(seq, object_id, kind)?;
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let handle = self.replies.receive_timeout(remaining).map_err(unavailable)?;
            if handle.seq == seq {
                return Ok(handle);
            }
            // Left over from a round trip that timed out earlier.
            tracing::warn!(
                expected = seq,
                got = handle.seq,
                object_id = %handle.object_id,
                "discarding stale object store reply"
            );
        }
    }

    fn check(handle: ObjHandle, size: usize) -> WorkerResult<ObjHandle> {
        let id = handle.object_id;
        match handle.status {
            ObjHandleStatus::Ok => Ok(handle),
            ObjHandleStatus::AllocationFailed => Err(WorkerError::AllocationFailed {
                object_id: id,
                size,
            }),
            ObjHandleStatus::NotReady => Err(WorkerError::ObjectNotReady(id)),
            ObjHandleStatus::NotFound => Err(WorkerError::ObjectNotFound(id)),
            ObjHandleStatus::AlreadyAllocated => Err(WorkerError::BufferAlreadyAllocated(id)),
            ObjHandleStatus::AlreadyFinished => Err(WorkerError::BufferAlreadyFinished(id)),
            ObjHandleStatus::InvalidMetadataOffset => Err(WorkerError::InvalidArgument(format!(
                "metadata offset past the end of object {id}"
            ))),
        }
    }

    fn map(&self, object_id: ObjectID, handle: &ObjHandle) -> WorkerResult<SegmentView> {
        let view = self
            .pool
            .resolve(handle.segment_id, handle.offset, handle.size)?;
        self.mapped
            .lock()
            .entry(object_id)
            .or_insert(Mapping {
                segment_id: handle.segment_id,
                holds: 0,
            })
            .holds += 1;
        Ok(view)
    }

    /// Ask the store for `size` writable bytes tagged with `object_id`.
    pub fn allocate_buffer(&self, object_id: ObjectID, size: usize) -> WorkerResult<SegmentView> {
        let handle = Self::check(self.request(object_id, ObjRequestKind::Alloc { size })?, size)?;
        tracing::debug!(
            object_id = %object_id,
            segment_id = %handle.segment_id,
            offset = handle.offset,
            size,
            "allocated buffer"
        );
        let view = self.map(object_id, &handle)?;
        self.unfinished.lock().insert(object_id, handle.size);
        Ok(view)
    }

    /// Seal the buffer; it is immutable and readable from here on.
    /// `metadata_offset` may not exceed the allocated size.
    pub fn finish_buffer(
        &self,
        object_id: ObjectID,
        segment_id: SegmentID,
        metadata_offset: usize,
    ) -> WorkerResult<()> {
        if let Some(&size) = self.unfinished.lock().get(&object_id) {
            if metadata_offset > size {
                return Err(WorkerError::InvalidArgument(format!(
                    "metadata offset {metadata_offset} past allocated size {size} of object {object_id}"
                )));
            }
        }
        let kind = ObjRequestKind::Finish {
            segment_id,
            metadata_offset,
        };
        Self::check(self.request(object_id, kind)?, 0)?;
        self.unfinished.lock().remove(&object_id);
        tracing::debug!(object_id = %object_id, metadata_offset, "finished buffer");
        Ok(())
    }

    /// Map the finished object `object_id` (after alias resolution by the store).
    pub fn get_buffer(&self, object_id: ObjectID) -> WorkerResult<ObjectBuffer> {
        let handle = Self::check(self.request(object_id, ObjRequestKind::Get)?, 0)?;
        if handle.metadata_offset > handle.size {
            return Err(WorkerError::InvalidArgument(format!(
                "store reported metadata offset {} past size {} of object {object_id}",
                handle.metadata_offset, handle.size
            )));
        }
        let view = self.map(object_id, &handle)?;
        Ok(ObjectBuffer {
            view,
            size: handle.size,
            segment_id: handle.segment_id,
            metadata_offset: handle.metadata_offset,
        })
    }

    /// Drop every hold this worker took for `object_id`. A no-op when the
    /// object was never mapped.
    pub fn unmap_object(&self, object_id: ObjectID) -> WorkerResult<()> {
        let Some(Mapping { segment_id, holds }) = self.mapped.lock().remove(&object_id) else {
            return Ok(());
        };
        for _ in 0..holds {
            self.pool.release(segment_id);
        }
        tracing::debug!(object_id = %object_id, segment_id = %segment_id, holds, "unmapped object");
        // Release has no reply, so it takes no sequence number of its own.
        self.send(0, object_id, ObjRequestKind::Release { segment_id })
    }

    pub fn is_mapped(&self, object_id: ObjectID) -> bool {
        self.mapped.lock().contains_key(&object_id)
    }

    /// Close and unlink the reply queue.
    pub fn close(&self) {
        self.replies.close();
    }
}

fn unavailable(e: IpcError) -> WorkerError {
    WorkerError::ObjStoreUnavailable(e.to_string())
}
