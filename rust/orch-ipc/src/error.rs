// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! IPC error types.

use orch_common::id::SegmentID;

/// Errors raised by message queues and the segment pool.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("queue {0} is closed")]
    QueueClosed(String),

    #[error("queue {0} is full")]
    QueueFull(String),

    #[error("timed out waiting on queue {0}")]
    TimedOut(String),

    #[error("queue {0} does not exist")]
    QueueNotFound(String),

    #[error("queue {0} was created with a different message type")]
    QueueTypeMismatch(String),

    #[error("queue {0} is already bound by a live receiver")]
    QueueInUse(String),

    #[error("malformed frame: {0}")]
    Decode(String),

    #[error("invalid queue capacity {capacity} for {name}")]
    InvalidCapacity { name: String, capacity: usize },

    #[error("segment {0} not found")]
    SegmentNotFound(SegmentID),

    #[error("range {offset}+{len} out of bounds for segment {segment_id} of size {segment_size}")]
    OutOfBounds {
        segment_id: SegmentID,
        offset: usize,
        len: usize,
        segment_size: usize,
    },

    #[error("failed to map segment {segment_id}: {reason}")]
    MapFailed { segment_id: SegmentID, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IpcResult<T> = Result<T, IpcError>;
