// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Generated protobuf and gRPC types for the worker and scheduler services.
//!
//! `orch.rpc.WorkerService` is served by every worker and called by the
//! scheduler; `orch.rpc.SchedulerService` is the scheduler's surface used by
//! the worker.

pub mod orch {
    /// Package `orch.rpc`.
    pub mod rpc {
        tonic::include_proto!("orch.rpc");
    }
}

pub use orch::rpc;
