// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! gRPC service implementation for the WorkerService.
//!
//! Every handler validates its request and turns it into a [`WorkerMessage`]
//! on the command queue, acknowledging as soon as the message is queued.
//! `Die` closes the queue and `PrintErrorMessage` prints directly in driver
//! modes, which have no execution thread consuming commands.

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Request, Response, Status};

use orch_common::mode::Mode;
use orch_ipc::message_queue::TrySendError;
use orch_ipc::MessageQueue;
use orch_proto::rpc;

use crate::error::WorkerResult;
use crate::message::{format_failure, WorkerMessage};

/// Where driver modes print scheduler-pushed errors.
pub type ErrorSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn stderr_sink() -> ErrorSink {
    let stderr: Box<dyn Write + Send> = Box::new(std::io::stderr());
    Arc::new(Mutex::new(stderr))
}

/// The gRPC service feeding a worker's command queue.
pub struct WorkerServiceImpl {
    commands: MessageQueue<WorkerMessage>,
    mode: Mode,
    error_sink: ErrorSink,
}

// Handlers return tonic::Status directly.
#[allow(clippy::result_large_err)]
impl WorkerServiceImpl {
    /// Attach to (or create) the command queue `command_queue_name`.
    pub fn new(command_queue_name: &str, capacity: usize, mode: Mode) -> WorkerResult<Self> {
        let commands = MessageQueue::create(command_queue_name, capacity)?;
        Ok(Self {
            commands,
            mode,
            error_sink: stderr_sink(),
        })
    }

    pub fn with_error_sink(mut self, error_sink: ErrorSink) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn command_queue(&self) -> &MessageQueue<WorkerMessage> {
        &self.commands
    }

    /// Queue `message`. A full queue parks the send on the blocking pool so
    /// the scheduler is throttled without stalling the RPC executor.
    async fn enqueue(&self, message: WorkerMessage) -> Result<rpc::AckReply, Status> {
        let kind = message.kind();
        match self.commands.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {
                return Err(Status::unavailable("worker is shutting down"));
            }
            Err(TrySendError::Full(message)) => {
                tracing::debug!(kind, "command queue full, waiting for space");
                let commands = self.commands.clone();
                tokio::task::spawn_blocking(move || commands.send(message))
                    .await
                    .map_err(|e| Status::internal(format!("enqueue task failed: {e}")))?
                    .map_err(|_| Status::unavailable("worker is shutting down"))?;
            }
        }
        tracing::debug!(kind, queued = self.commands.len(), "command queued");
        Ok(rpc::AckReply {})
    }

    pub async fn handle_execute_task(
        &self,
        request: rpc::ExecuteTaskRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.enqueue(WorkerMessage::execute_task(request)?).await
    }

    pub async fn handle_run_function_on_worker(
        &self,
        request: rpc::RunFunctionOnWorkerRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.enqueue(WorkerMessage::run_function_on_worker(request)?)
            .await
    }

    pub async fn handle_import_remote_function(
        &self,
        request: rpc::ImportRemoteFunctionRequest,
    ) -> Result<rpc::AckReply, Status> {
        let message = WorkerMessage::import_remote_function(request)?;
        tracing::debug!(function = message.name(), "ImportRemoteFunction received");
        self.enqueue(message).await
    }

    pub async fn handle_import_reusable_variable(
        &self,
        request: rpc::ImportReusableVariableRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.enqueue(WorkerMessage::import_reusable_variable(request)?)
            .await
    }

    /// Close the command queue. Already queued commands still run.
    pub async fn handle_die(&self, _request: rpc::DieRequest) -> Result<rpc::AckReply, Status> {
        tracing::info!(queue = self.commands.name(), "Die received");
        self.commands.close();
        Ok(rpc::AckReply {})
    }

    pub async fn handle_print_error_message(
        &self,
        request: rpc::PrintErrorMessageRequest,
    ) -> Result<rpc::AckReply, Status> {
        let message = WorkerMessage::print_error_message(request)?;
        if !self.mode.is_driver() {
            return self.enqueue(message).await;
        }
        let WorkerMessage::PrintErrorMessage(failure) = message else {
            return Err(Status::internal("unexpected message kind"));
        };
        if self.mode.prints_errors() {
            let text = format_failure(&failure);
            let mut sink = self.error_sink.lock();
            if let Err(e) = writeln!(sink, "{text}").and_then(|_| sink.flush()) {
                tracing::warn!(error = %e, "failed to print error message");
            }
        } else {
            tracing::debug!(name = %failure.name, "dropping error message in silent mode");
        }
        Ok(rpc::AckReply {})
    }
}

#[tonic::async_trait]
impl rpc::worker_service_server::WorkerService for WorkerServiceImpl {
    async fn execute_task(
        &self,
        request: Request<rpc::ExecuteTaskRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_execute_task(request.into_inner())
            .await
            .map(Response::new)
    }

    async fn run_function_on_worker(
        &self,
        request: Request<rpc::RunFunctionOnWorkerRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_run_function_on_worker(request.into_inner())
            .await
            .map(Response::new)
    }

    async fn import_remote_function(
        &self,
        request: Request<rpc::ImportRemoteFunctionRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_import_remote_function(request.into_inner())
            .await
            .map(Response::new)
    }

    async fn die(
        &self,
        request: Request<rpc::DieRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_die(request.into_inner()).await.map(Response::new)
    }

    async fn import_reusable_variable(
        &self,
        request: Request<rpc::ImportReusableVariableRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_import_reusable_variable(request.into_inner())
            .await
            .map(Response::new)
    }

    async fn print_error_message(
        &self,
        request: Request<rpc::PrintErrorMessageRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        self.handle_print_error_message(request.into_inner())
            .await
            .map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_test_utils::unique_name;

    /// Collects everything written to the error sink.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn service(mode: Mode, capacity: usize) -> (WorkerServiceImpl, Captured) {
        let captured = Captured::default();
        let sink: Box<dyn Write + Send> = Box::new(captured.clone());
        let svc = WorkerServiceImpl::new(&unique_name("queue:svc"), capacity, mode)
            .unwrap()
            .with_error_sink(Arc::new(Mutex::new(sink)));
        (svc, captured)
    }

    fn task(name: &str) -> rpc::ExecuteTaskRequest {
        rpc::ExecuteTaskRequest {
            task: Some(rpc::Task {
                name: name.to_string(),
                ..Default::default()
            }),
        }
    }

    fn failure_request() -> rpc::PrintErrorMessageRequest {
        rpc::PrintErrorMessageRequest {
            failure: Some(rpc::Failure {
                name: "f".into(),
                error_message: "boom".into(),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_commands_are_queued_in_order() {
        let (svc, _) = service(Mode::Worker, 8);
        svc.handle_execute_task(task("a")).await.unwrap();
        svc.handle_import_remote_function(rpc::ImportRemoteFunctionRequest {
            function: Some(rpc::Function {
                name: "b".into(),
                implementation: b"def b(): pass".to_vec(),
            }),
        })
        .await
        .unwrap();
        svc.handle_execute_task(task("c")).await.unwrap();

        let queue = svc.command_queue();
        let kinds: Vec<(&str, String)> = (0..3)
            .filter_map(|_| queue.try_receive())
            .map(|m| (m.kind(), m.name().to_string()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("ExecuteTask", "a".to_string()),
                ("ImportRemoteFunction", "b".to_string()),
                ("ExecuteTask", "c".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_invalid_argument() {
        let (svc, _) = service(Mode::Worker, 8);
        let status = svc
            .handle_execute_task(rpc::ExecuteTaskRequest { task: None })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        let status = svc
            .handle_print_error_message(rpc::PrintErrorMessageRequest { failure: None })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(svc.command_queue().is_empty());
    }

    #[tokio::test]
    async fn test_die_closes_queue() {
        let (svc, _) = service(Mode::Worker, 8);
        svc.handle_execute_task(task("a")).await.unwrap();
        svc.handle_die(rpc::DieRequest {}).await.unwrap();

        let status = svc.handle_execute_task(task("b")).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);

        let queue = svc.command_queue();
        assert_eq!(queue.receive().map(|m| m.name().to_string()), Some("a".into()));
        assert!(queue.receive().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_applies_backpressure() {
        let (svc, _) = service(Mode::Worker, 1);
        let svc = Arc::new(svc);
        svc.handle_execute_task(task("first")).await.unwrap();

        let pending = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.handle_execute_task(task("second")).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        let queue = svc.command_queue().clone();
        let first = tokio::task::spawn_blocking(move || queue.receive())
            .await
            .unwrap();
        assert_eq!(first.map(|m| m.name().to_string()), Some("first".into()));
        pending.await.unwrap().unwrap();
        assert_eq!(svc.command_queue().len(), 1);
    }

    #[tokio::test]
    async fn test_driver_prints_error_immediately() {
        let (svc, captured) = service(Mode::Script, 8);
        svc.handle_print_error_message(failure_request()).await.unwrap();
        assert!(svc.command_queue().is_empty());
        let text = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn test_silent_driver_drops_error() {
        let (svc, captured) = service(Mode::Silent, 8);
        svc.handle_print_error_message(failure_request()).await.unwrap();
        assert!(svc.command_queue().is_empty());
        assert!(captured.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_worker_queues_error_message() {
        let (svc, captured) = service(Mode::Worker, 8);
        svc.handle_print_error_message(failure_request()).await.unwrap();
        assert!(captured.0.lock().is_empty());
        assert!(matches!(
            svc.command_queue().try_receive(),
            Some(WorkerMessage::PrintErrorMessage(_))
        ));
    }
}
