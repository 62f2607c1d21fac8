// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker runtime.
//!
//! Receives scheduler commands over the `WorkerService`, hands them to the
//! execution thread through the command queue, submits tasks back to the
//! scheduler and moves object data through the node-local object store.

pub mod error;
pub mod options;
pub mod message;
pub mod grpc_service;
pub mod task_submitter;
pub mod object_store;
pub mod worker;
pub mod execution;

// Re-export primary types.
pub use error::{WorkerError, WorkerResult};
pub use execution::{run_execution_loop, ExecutionEnvironment, ExecutionFailure, LoggingEnvironment};
pub use grpc_service::WorkerServiceImpl;
pub use message::WorkerMessage;
pub use object_store::{ObjectBuffer, ObjectStoreClient};
pub use options::WorkerOptions;
pub use task_submitter::SubmitRetryPolicy;
pub use worker::Worker;
