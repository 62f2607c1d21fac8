// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduler RPC client library.
//!
//! Provides the [`SchedulerClient`] trait the worker talks through and its
//! tonic-backed implementation [`SchedulerRpcClient`].

pub mod client;
pub mod traits;

pub use client::SchedulerRpcClient;
pub use traits::SchedulerClient;
