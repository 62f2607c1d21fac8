// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Task submission with bounded retry on unregistered functions.
//!
//! A task may reach the scheduler before the function it calls has been
//! imported everywhere. The scheduler then answers `function_registered =
//! false` and the submitter waits and resubmits. Transport errors are not
//! retried.

use std::time::Duration;

use orch_common::config::OrchConfig;
use orch_common::id::{self, ObjectID};
use orch_proto::rpc;
use orch_scheduler_client::SchedulerClient;

use crate::error::{WorkerError, WorkerResult};

/// How often to resubmit while the target function is unregistered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRetryPolicy {
    /// Resubmissions after the first attempt.
    pub max_retries: u32,
    pub retry_wait: Duration,
}

impl SubmitRetryPolicy {
    pub fn from_config(config: &OrchConfig) -> Self {
        Self {
            max_retries: config.submit_task_max_retries,
            retry_wait: config.submit_task_retry_wait(),
        }
    }
}

impl Default for SubmitRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_wait: Duration::from_millis(500),
        }
    }
}

/// Submit `request`, resubmitting up to `policy.max_retries` times while the
/// scheduler reports the function as unregistered. Returns the result IDs.
pub async fn submit_with_retry(
    scheduler: &dyn SchedulerClient,
    request: rpc::SubmitTaskRequest,
    policy: SubmitRetryPolicy,
) -> WorkerResult<Vec<ObjectID>> {
    let function_name = match &request.task {
        Some(task) if !task.name.is_empty() => task.name.clone(),
        _ => return Err(WorkerError::InvalidArgument("task has no function name".into())),
    };

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let reply = scheduler
            .submit_task(request.clone())
            .await
            .map_err(WorkerError::from_status)?;
        if reply.function_registered {
            tracing::debug!(function = %function_name, attempts, "task submitted");
            return Ok(id::from_wire(&reply.results));
        }
        if attempts > policy.max_retries {
            tracing::warn!(function = %function_name, attempts, "giving up on task submission");
            return Err(WorkerError::FunctionNotRegistered {
                function_name,
                attempts,
            });
        }
        tracing::warn!(
            function = %function_name,
            attempt = attempts,
            "function not registered yet, retrying submission"
        );
        tokio::time::sleep(policy.retry_wait).await;
    }
}
