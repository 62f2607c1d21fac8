// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Constants shared by the worker, the object store and the scheduler.

/// Raw value used for nil identifiers.
pub const NIL_ID: u64 = u64::MAX;

/// Prefix of every named message queue.
pub const QUEUE_PREFIX: &str = "queue";

/// Prefix of shared-memory segment files inside the segment directory.
pub const SEGMENT_FILE_PREFIX: &str = "orch-objstore";

