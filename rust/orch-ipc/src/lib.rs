// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Inter-process plumbing between the worker, its execution thread and the
//! node-local object store.
//!
//! - [`message_queue::MessageQueue`]: bounded, named FIFO channel within one process
//! - [`socket_queue::SocketQueue`]: the same over a Unix domain socket, across processes
//! - [`segment_pool::MemorySegmentPool`]: shared-memory segment mappings
//! - [`object_channel`]: object-store request/reply messages and queue names

pub mod error;
pub mod message_queue;
pub mod object_channel;
pub mod segment_pool;
pub mod socket_queue;

pub use error::{IpcError, IpcResult};
pub use message_queue::MessageQueue;
pub use segment_pool::{MemorySegmentPool, SegmentView};
pub use socket_queue::{SocketQueue, SocketSender};
