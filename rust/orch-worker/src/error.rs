// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker error types.

use tonic::{Code, Status};

use orch_common::id::ObjectID;
use orch_ipc::IpcError;

/// Errors surfaced by the worker's client operations and command service.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker is not registered with the scheduler")]
    NotRegistered,

    #[error("worker is already registered")]
    AlreadyRegistered,

    #[error("lost connection to the scheduler: {0}")]
    Disconnected(String),

    #[error("scheduler rejected the request: {0}")]
    Rpc(Status),

    #[error("function {function_name} was not registered after {attempts} submission attempts")]
    FunctionNotRegistered { function_name: String, attempts: u32 },

    #[error("alias rejected by the scheduler: {0}")]
    AliasRejected(String),

    #[error("object {0} is not finished yet")]
    ObjectNotReady(ObjectID),

    #[error("object {0} not found in the object store")]
    ObjectNotFound(ObjectID),

    #[error("object store could not allocate {size} bytes for object {object_id}")]
    AllocationFailed { object_id: ObjectID, size: usize },

    #[error("buffer for object {0} was already allocated")]
    BufferAlreadyAllocated(ObjectID),

    #[error("buffer for object {0} was already finished")]
    BufferAlreadyFinished(ObjectID),

    #[error("object store unavailable: {0}")]
    ObjStoreUnavailable(String),

    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

impl WorkerError {
    /// Map a scheduler status. Transport-level codes become `Disconnected`.
    pub fn from_status(status: Status) -> Self {
        match status.code() {
            Code::Unavailable | Code::Cancelled | Code::DeadlineExceeded | Code::Unknown => {
                Self::Disconnected(status.message().to_string())
            }
            _ => Self::Rpc(status),
        }
    }

    /// Like [`from_status`](Self::from_status), but rejections of an alias
    /// request become `AliasRejected`.
    pub fn from_alias_status(status: Status) -> Self {
        match status.code() {
            Code::FailedPrecondition
            | Code::NotFound
            | Code::AlreadyExists
            | Code::InvalidArgument => Self::AliasRejected(status.message().to_string()),
            _ => Self::from_status(status),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::ObjStoreUnavailable(_))
    }
}

impl From<WorkerError> for Status {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::InvalidArgument(msg) => Status::invalid_argument(msg),
            WorkerError::Disconnected(msg) | WorkerError::ObjStoreUnavailable(msg) => {
                Status::unavailable(msg)
            }
            WorkerError::Rpc(status) => status,
            other => Status::internal(other.to_string()),
        }
    }
}
