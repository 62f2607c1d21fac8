// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Commands delivered from the worker service to the execution thread.
//!
//! `Die` has no variant: it closes the command queue, and the execution
//! thread sees the end of the stream as `None`.

use orch_proto::rpc;

use crate::error::{WorkerError, WorkerResult};

/// One command for the execution thread, carrying only its own payload.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    ExecuteTask(rpc::Task),
    RunFunctionOnWorker(rpc::Function),
    ImportRemoteFunction(rpc::Function),
    ImportReusableVariable(rpc::ReusableVar),
    PrintErrorMessage(rpc::Failure),
}

impl WorkerMessage {
    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExecuteTask(_) => "ExecuteTask",
            Self::RunFunctionOnWorker(_) => "RunFunctionOnWorker",
            Self::ImportRemoteFunction(_) => "ImportRemoteFunction",
            Self::ImportReusableVariable(_) => "ImportReusableVariable",
            Self::PrintErrorMessage(_) => "PrintErrorMessage",
        }
    }

    /// Name of the task, function or variable the command is about.
    pub fn name(&self) -> &str {
        match self {
            Self::ExecuteTask(task) => &task.name,
            Self::RunFunctionOnWorker(function) | Self::ImportRemoteFunction(function) => {
                &function.name
            }
            Self::ImportReusableVariable(variable) => &variable.name,
            Self::PrintErrorMessage(failure) => &failure.name,
        }
    }

    pub fn execute_task(req: rpc::ExecuteTaskRequest) -> WorkerResult<Self> {
        let task = req.task.ok_or_else(|| missing("task"))?;
        if task.name.is_empty() {
            return Err(WorkerError::InvalidArgument("task has no function name".into()));
        }
        Ok(Self::ExecuteTask(task))
    }

    pub fn run_function_on_worker(req: rpc::RunFunctionOnWorkerRequest) -> WorkerResult<Self> {
        let function = req.function.ok_or_else(|| missing("function"))?;
        if function.implementation.is_empty() {
            return Err(WorkerError::InvalidArgument("function has no implementation".into()));
        }
        Ok(Self::RunFunctionOnWorker(function))
    }

    pub fn import_remote_function(req: rpc::ImportRemoteFunctionRequest) -> WorkerResult<Self> {
        let function = req.function.ok_or_else(|| missing("function"))?;
        if function.name.is_empty() {
            return Err(WorkerError::InvalidArgument("remote function has no name".into()));
        }
        Ok(Self::ImportRemoteFunction(function))
    }

    pub fn import_reusable_variable(req: rpc::ImportReusableVariableRequest) -> WorkerResult<Self> {
        let variable = req.reusable_variable.ok_or_else(|| missing("reusable_variable"))?;
        if variable.name.is_empty() {
            return Err(WorkerError::InvalidArgument("reusable variable has no name".into()));
        }
        if variable.initializer.is_none() {
            return Err(missing("reusable_variable.initializer"));
        }
        Ok(Self::ImportReusableVariable(variable))
    }

    pub fn print_error_message(req: rpc::PrintErrorMessageRequest) -> WorkerResult<Self> {
        req.failure
            .map(Self::PrintErrorMessage)
            .ok_or_else(|| missing("failure"))
    }
}

fn missing(field: &str) -> WorkerError {
    WorkerError::InvalidArgument(format!("missing {field}"))
}

/// Render a failure the way drivers print it.
pub fn format_failure(failure: &rpc::Failure) -> String {
    let what = match failure.failed_type() {
        rpc::FailedType::FailedTask => "task",
        rpc::FailedType::FailedRemoteFunctionImport => "remote function import",
        rpc::FailedType::FailedReusableVariableImport => "reusable variable import",
        rpc::FailedType::FailedReinitializeReusableVariable => "reusable variable reinitialization",
        rpc::FailedType::FailedFunctionToRun => "function to run",
    };
    format!(
        "Error in {what} {} on worker {} ({}):\n{}",
        failure.name, failure.worker_id, failure.worker_address, failure.error_message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(name: &str) -> rpc::Function {
        rpc::Function {
            name: name.to_string(),
            implementation: b"code".to_vec(),
        }
    }

    #[test]
    fn test_execute_task_validation() {
        assert!(WorkerMessage::execute_task(rpc::ExecuteTaskRequest { task: None }).is_err());
        let unnamed = rpc::ExecuteTaskRequest {
            task: Some(rpc::Task::default()),
        };
        assert!(matches!(
            WorkerMessage::execute_task(unnamed),
            Err(WorkerError::InvalidArgument(_))
        ));
        let msg = WorkerMessage::execute_task(rpc::ExecuteTaskRequest {
            task: Some(rpc::Task {
                name: "f".into(),
                ..Default::default()
            }),
        })
        .unwrap();
        assert_eq!(msg.kind(), "ExecuteTask");
        assert_eq!(msg.name(), "f");
    }

    #[test]
    fn test_reusable_variable_needs_initializer() {
        let req = rpc::ImportReusableVariableRequest {
            reusable_variable: Some(rpc::ReusableVar {
                name: "v".into(),
                initializer: None,
                reinitializer: Some(function("re")),
            }),
        };
        assert!(WorkerMessage::import_reusable_variable(req).is_err());

        let req = rpc::ImportReusableVariableRequest {
            reusable_variable: Some(rpc::ReusableVar {
                name: "v".into(),
                initializer: Some(function("init")),
                reinitializer: None,
            }),
        };
        assert!(WorkerMessage::import_reusable_variable(req).is_ok());
    }

    #[test]
    fn test_run_function_needs_implementation() {
        let req = rpc::RunFunctionOnWorkerRequest {
            function: Some(rpc::Function::default()),
        };
        assert!(WorkerMessage::run_function_on_worker(req).is_err());
        let req = rpc::RunFunctionOnWorkerRequest {
            function: Some(function("")),
        };
        assert!(WorkerMessage::run_function_on_worker(req).is_ok());
    }

    #[test]
    fn test_format_failure() {
        let mut failure = rpc::Failure {
            worker_id: 3,
            worker_address: "10.0.0.1:5000".into(),
            name: "f".into(),
            error_message: "boom".into(),
            ..Default::default()
        };
        failure.set_failed_type(rpc::FailedType::FailedRemoteFunctionImport);
        let text = format_failure(&failure);
        assert!(text.contains("remote function import f"));
        assert!(text.ends_with("boom"));
    }
}
