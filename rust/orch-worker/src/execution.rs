// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Consumer side of the command queue.

use std::collections::HashSet;

use orch_proto::rpc;

use crate::message::{format_failure, WorkerMessage};
use crate::worker::Worker;

/// A command the environment could not carry out.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
}

impl ExecutionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Runs commands pulled off the command queue. Called from the execution
/// thread, so implementations may block and may call back into `worker`.
pub trait ExecutionEnvironment {
    fn execute(&mut self, worker: &Worker, message: WorkerMessage) -> Result<(), ExecutionFailure>;
}

/// How a failed command is reported to the scheduler.
pub fn failure_type(message: &WorkerMessage) -> Option<rpc::FailedType> {
    match message {
        WorkerMessage::ExecuteTask(_) => Some(rpc::FailedType::FailedTask),
        WorkerMessage::RunFunctionOnWorker(_) => Some(rpc::FailedType::FailedFunctionToRun),
        WorkerMessage::ImportRemoteFunction(_) => Some(rpc::FailedType::FailedRemoteFunctionImport),
        WorkerMessage::ImportReusableVariable(_) => {
            Some(rpc::FailedType::FailedReusableVariableImport)
        }
        WorkerMessage::PrintErrorMessage(_) => None,
    }
}

/// Receive and dispatch commands until the queue is closed. Returns the
/// number of commands processed.
///
/// Must run outside the worker's runtime: scheduler calls are driven with
/// [`Worker::block_on`].
pub fn run_execution_loop<E>(worker: &Worker, env: &mut E) -> usize
where
    E: ExecutionEnvironment + ?Sized,
{
    let mut processed = 0;
    while let Some(message) = worker.receive_next_message() {
        processed += 1;
        let is_task = matches!(message, WorkerMessage::ExecuteTask(_));
        let failed_type = failure_type(&message);
        let kind = message.kind();
        let name = message.name().to_string();
        tracing::debug!(kind, name = %name, "executing command");

        if let Err(failure) = env.execute(worker, message) {
            tracing::warn!(kind, name = %name, error = %failure, "command failed");
            if let Some(failed_type) = failed_type {
                worker.notify_failure(failed_type, &name, &failure.message);
            }
        }

        if is_task {
            if let Err(e) = worker.block_on(worker.ready_for_new_task()) {
                if e.is_disconnected() {
                    tracing::error!(error = %e, "lost the scheduler, leaving execution loop");
                    break;
                }
                tracing::warn!(error = %e, "ready_for_new_task failed");
            }
        }
    }
    tracing::info!(processed, "execution loop finished");
    processed
}

/// Environment that only records imports and logs commands. A task fails
/// unless its function was imported first.
#[derive(Debug, Default)]
pub struct LoggingEnvironment {
    functions: HashSet<String>,
    variables: HashSet<String>,
}

impl LoggingEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.contains(name)
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains(name)
    }
}

impl ExecutionEnvironment for LoggingEnvironment {
    fn execute(&mut self, _worker: &Worker, message: WorkerMessage) -> Result<(), ExecutionFailure> {
        match message {
            WorkerMessage::ExecuteTask(task) => {
                if !self.functions.contains(&task.name) {
                    return Err(ExecutionFailure::new(format!(
                        "function {} has not been imported",
                        task.name
                    )));
                }
                tracing::info!(
                    function = %task.name,
                    num_args = task.args.len(),
                    num_results = task.results.len(),
                    "executing task"
                );
            }
            WorkerMessage::ImportRemoteFunction(function) => {
                tracing::info!(function = %function.name, "imported remote function");
                self.functions.insert(function.name);
            }
            WorkerMessage::ImportReusableVariable(variable) => {
                tracing::info!(variable = %variable.name, "imported reusable variable");
                self.variables.insert(variable.name);
            }
            WorkerMessage::RunFunctionOnWorker(function) => {
                tracing::info!(
                    function = %function.name,
                    bytes = function.implementation.len(),
                    "running function on worker"
                );
            }
            WorkerMessage::PrintErrorMessage(failure) => {
                tracing::error!("{}", format_failure(&failure));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use orch_common::mode::Mode;
    use orch_test_utils::wait::wait_for_condition;
    use orch_test_utils::{unique_name, FakeObjectStore, FakeScheduler, SchedulerCall};

    use crate::options::WorkerOptions;

    fn function(name: &str) -> rpc::Function {
        rpc::Function {
            name: name.to_string(),
            implementation: b"code".to_vec(),
        }
    }

    fn task(name: &str) -> WorkerMessage {
        WorkerMessage::ExecuteTask(rpc::Task {
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn test_failure_types() {
        assert_eq!(failure_type(&task("f")), Some(rpc::FailedType::FailedTask));
        assert_eq!(
            failure_type(&WorkerMessage::RunFunctionOnWorker(function("f"))),
            Some(rpc::FailedType::FailedFunctionToRun)
        );
        assert_eq!(
            failure_type(&WorkerMessage::ImportRemoteFunction(function("f"))),
            Some(rpc::FailedType::FailedRemoteFunctionImport)
        );
        assert_eq!(
            failure_type(&WorkerMessage::PrintErrorMessage(rpc::Failure::default())),
            None
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_reports_failures_and_keeps_going() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let objstore_address = unique_name("objstore");
        let _store =
            FakeObjectStore::start_with_scheduler(&objstore_address, dir.path(), 1 << 12, &scheduler);
        let mut options = WorkerOptions::new("127.0.0.1", "unused", Mode::Worker);
        options.command_queue_name = unique_name("queue:exec");
        options.config.segment_directory = dir.path().to_string_lossy().into_owned();
        let worker = Arc::new(Worker::new(options, scheduler.clone()).unwrap());
        worker
            .register_worker("127.0.0.1", &objstore_address, false)
            .await
            .unwrap();

        let queue = worker.command_queue().clone();
        for message in [
            WorkerMessage::ImportRemoteFunction(function("f")),
            task("f"),
            task("g"),
            WorkerMessage::RunFunctionOnWorker(function("setup")),
        ] {
            queue.send(message).unwrap();
        }
        queue.close();

        let handle = {
            let worker = Arc::clone(&worker);
            tokio::task::spawn_blocking(move || {
                let mut env = LoggingEnvironment::new();
                let processed = run_execution_loop(worker.as_ref(), &mut env);
                (processed, env.has_function("f"))
            })
        };
        let (processed, imported) = handle.await.unwrap();
        assert_eq!(processed, 4);
        assert!(imported);
        assert_eq!(
            scheduler.count_calls(|c| matches!(c, SchedulerCall::ReadyForNewTask(_))),
            2
        );

        assert!(wait_for_condition(|| scheduler.failures().len() == 1, 2000).await);
        let failure = &scheduler.failures()[0];
        assert_eq!(failure.failed_type(), rpc::FailedType::FailedTask);
        assert_eq!(failure.name, "g");
        assert!(failure.error_message.contains("not been imported"));
    }
}
