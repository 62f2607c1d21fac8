// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Messages exchanged with the node-local object store, and the names of
//! the queues that carry them.
//!
//! Workers send [`ObjRequest`]s on the store's shared request queue. The store
//! answers every request except `Release` with exactly one [`ObjHandle`] on
//! the requesting worker's own reply queue, echoing the request's `seq`.
//! Both queues are [`SocketQueue`](crate::socket_queue::SocketQueue)s, so the
//! store and its workers may live in different processes.

use orch_common::constants::QUEUE_PREFIX;
use orch_common::id::{ObjectID, SegmentID, WorkerID};

use crate::error::{IpcError, IpcResult};
use crate::socket_queue::{put_u64, put_u8, FrameReader, WireMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjRequestKind {
    /// Reserve `size` writable bytes for a new object.
    Alloc { size: usize },
    /// Seal an allocated object and record where its metadata starts.
    Finish {
        segment_id: SegmentID,
        metadata_offset: usize,
    },
    /// Locate a finished object, resolving aliases.
    Get,
    /// The worker dropped its mapping of the object. No reply.
    Release { segment_id: SegmentID },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjRequest {
    /// Per-worker request number, echoed in the reply.
    pub seq: u64,
    pub worker_id: WorkerID,
    pub object_id: ObjectID,
    pub kind: ObjRequestKind,
}

impl ObjRequest {
    pub fn expects_reply(&self) -> bool {
        !matches!(self.kind, ObjRequestKind::Release { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjHandleStatus {
    Ok,
    AllocationFailed,
    /// Allocated but not finished yet.
    NotReady,
    NotFound,
    AlreadyAllocated,
    AlreadyFinished,
    /// Finish named a metadata offset past the end of the object.
    InvalidMetadataOffset,
}

impl ObjHandleStatus {
    fn to_wire(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::AllocationFailed => 1,
            Self::NotReady => 2,
            Self::NotFound => 3,
            Self::AlreadyAllocated => 4,
            Self::AlreadyFinished => 5,
            Self::InvalidMetadataOffset => 6,
        }
    }

    fn from_wire(tag: u8) -> IpcResult<Self> {
        Ok(match tag {
            0 => Self::Ok,
            1 => Self::AllocationFailed,
            2 => Self::NotReady,
            3 => Self::NotFound,
            4 => Self::AlreadyAllocated,
            5 => Self::AlreadyFinished,
            6 => Self::InvalidMetadataOffset,
            other => return Err(IpcError::Decode(format!("unknown handle status {other}"))),
        })
    }
}

/// Reply to an [`ObjRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjHandle {
    pub seq: u64,
    pub object_id: ObjectID,
    pub segment_id: SegmentID,
    pub offset: usize,
    pub size: usize,
    pub metadata_offset: usize,
    pub status: ObjHandleStatus,
}

impl ObjHandle {
    /// A reply carrying only a failure status.
    pub fn failed(seq: u64, object_id: ObjectID, status: ObjHandleStatus) -> Self {
        Self {
            seq,
            object_id,
            segment_id: SegmentID::nil(),
            offset: 0,
            size: 0,
            metadata_offset: 0,
            status,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ObjHandleStatus::Ok
    }
}

// Request payload: seq, worker, object, kind tag, two kind-specific words.
impl WireMessage for ObjRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.seq);
        put_u64(out, self.worker_id.value());
        put_u64(out, self.object_id.value());
        let (tag, a, b) = match self.kind {
            ObjRequestKind::Alloc { size } => (0, size as u64, 0),
            ObjRequestKind::Finish {
                segment_id,
                metadata_offset,
            } => (1, segment_id.value(), metadata_offset as u64),
            ObjRequestKind::Get => (2, 0, 0),
            ObjRequestKind::Release { segment_id } => (3, segment_id.value(), 0),
        };
        put_u8(out, tag);
        put_u64(out, a);
        put_u64(out, b);
    }

    fn decode(bytes: &[u8]) -> IpcResult<Self> {
        let mut reader = FrameReader::new(bytes);
        let seq = reader.u64()?;
        let worker_id = WorkerID::new(reader.u64()?);
        let object_id = ObjectID::new(reader.u64()?);
        let tag = reader.u8()?;
        let a = reader.u64()?;
        let b = reader.u64()?;
        reader.finish()?;
        let to_usize =
            |v: u64| usize::try_from(v).map_err(|_| IpcError::Decode(format!("{v} overflows usize")));
        let kind = match tag {
            0 => ObjRequestKind::Alloc { size: to_usize(a)? },
            1 => ObjRequestKind::Finish {
                segment_id: SegmentID::new(a),
                metadata_offset: to_usize(b)?,
            },
            2 => ObjRequestKind::Get,
            3 => ObjRequestKind::Release {
                segment_id: SegmentID::new(a),
            },
            other => return Err(IpcError::Decode(format!("unknown request kind {other}"))),
        };
        Ok(Self {
            seq,
            worker_id,
            object_id,
            kind,
        })
    }
}

impl WireMessage for ObjHandle {
    fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.seq);
        put_u64(out, self.object_id.value());
        put_u64(out, self.segment_id.value());
        put_u64(out, self.offset as u64);
        put_u64(out, self.size as u64);
        put_u64(out, self.metadata_offset as u64);
        put_u8(out, self.status.to_wire());
    }

    fn decode(bytes: &[u8]) -> IpcResult<Self> {
        let mut reader = FrameReader::new(bytes);
        let handle = Self {
            seq: reader.u64()?,
            object_id: ObjectID::new(reader.u64()?),
            segment_id: SegmentID::new(reader.u64()?),
            offset: reader.usize()?,
            size: reader.usize()?,
            metadata_offset: reader.usize()?,
            status: ObjHandleStatus::from_wire(reader.u8()?)?,
        };
        reader.finish()?;
        Ok(handle)
    }
}

/// Request queue of an object store; created by the store.
pub fn objstore_request_queue_name(objstore_address: &str) -> String {
    format!("{QUEUE_PREFIX}:{objstore_address}:obj")
}

/// Reply queue from an object store to one worker; created by the worker.
pub fn objstore_reply_queue_name(objstore_address: &str, worker_id: WorkerID) -> String {
    format!("{QUEUE_PREFIX}:{objstore_address}:worker:{worker_id}:obj")
}

/// Command queue between a worker's RPC service and its execution thread.
pub fn command_queue_name(worker_address: &str) -> String {
    format!("{QUEUE_PREFIX}:{worker_address}:worker")
}
