// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Real scheduler RPC client backed by a tonic gRPC stub.
//!
//! Transport errors are returned as-is. The only retry in the worker runtime
//! is the function-registration retry in task submission.

use std::time::Duration;

use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

use orch_proto::rpc;

use crate::traits::SchedulerClient;

type Stub = rpc::scheduler_service_client::SchedulerServiceClient<Channel>;

/// Scheduler client wrapping the tonic-generated stub.
pub struct SchedulerRpcClient {
    stub: Mutex<Stub>,
    rpc_timeout: Option<Duration>,
}

impl SchedulerRpcClient {
    /// Connect to a scheduler at `address` (`host:port` or a full URI).
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        rpc_timeout: Duration,
    ) -> Result<Self, Status> {
        let uri = orch_util::network::to_http_uri(address);
        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Status::invalid_argument(format!("invalid scheduler address {uri}: {e}")))?
            .connect_timeout(connect_timeout);
        let channel = endpoint.connect().await.map_err(|e| {
            Status::unavailable(format!("failed to connect to scheduler at {uri}: {e}"))
        })?;
        tracing::info!(scheduler = %uri, "connected to scheduler");
        Ok(Self::from_channel(channel, Some(rpc_timeout)))
    }

    /// Create from an existing channel (useful for testing).
    pub fn from_channel(channel: Channel, rpc_timeout: Option<Duration>) -> Self {
        Self {
            stub: Mutex::new(Stub::new(channel)),
            rpc_timeout,
        }
    }

    fn request<T>(&self, message: T) -> tonic::Request<T> {
        let mut request = tonic::Request::new(message);
        if let Some(timeout) = self.rpc_timeout {
            request.set_timeout(timeout);
        }
        request
    }
}

/// Implements one scheduler RPC.
///
/// Generated stub methods take `&mut self`, so we lock the Mutex, clone the
/// stub and release the lock before awaiting.
macro_rules! impl_scheduler_rpc {
    ($self:ident, $method:ident, $req:expr) => {{
        let mut stub = $self.stub.lock().clone();
        stub.$method($self.request($req))
            .await
            .map(|resp| resp.into_inner())
    }};
}

#[async_trait::async_trait]
impl SchedulerClient for SchedulerRpcClient {
    async fn submit_task(
        &self,
        req: rpc::SubmitTaskRequest,
    ) -> Result<rpc::SubmitTaskReply, Status> {
        impl_scheduler_rpc!(self, submit_task, req)
    }

    async fn ready_for_new_task(
        &self,
        req: rpc::ReadyForNewTaskRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, ready_for_new_task, req)
    }

    async fn register_worker(
        &self,
        req: rpc::RegisterWorkerRequest,
    ) -> Result<rpc::RegisterWorkerReply, Status> {
        impl_scheduler_rpc!(self, register_worker, req)
    }

    async fn kill_workers(
        &self,
        req: rpc::KillWorkersRequest,
    ) -> Result<rpc::KillWorkersReply, Status> {
        impl_scheduler_rpc!(self, kill_workers, req)
    }

    async fn notify_failure(
        &self,
        req: rpc::NotifyFailureRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, notify_failure, req)
    }

    async fn get_object_id(
        &self,
        req: rpc::GetObjectIdRequest,
    ) -> Result<rpc::GetObjectIdReply, Status> {
        impl_scheduler_rpc!(self, get_object_id, req)
    }

    async fn request_object(
        &self,
        req: rpc::RequestObjectRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, request_object, req)
    }

    async fn add_contained_object_ids(
        &self,
        req: rpc::AddContainedObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, add_contained_object_ids, req)
    }

    async fn alias_object_ids(
        &self,
        req: rpc::AliasObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, alias_object_ids, req)
    }

    async fn increment_ref_count(
        &self,
        req: rpc::IncrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, increment_ref_count, req)
    }

    async fn decrement_ref_count(
        &self,
        req: rpc::DecrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, decrement_ref_count, req)
    }

    async fn wait(&self, req: rpc::WaitRequest) -> Result<rpc::WaitReply, Status> {
        impl_scheduler_rpc!(self, wait, req)
    }

    async fn register_remote_function(
        &self,
        req: rpc::RegisterRemoteFunctionRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, register_remote_function, req)
    }

    async fn export_remote_function(
        &self,
        req: rpc::ExportRemoteFunctionRequest,
    ) -> Result<rpc::ExportRemoteFunctionReply, Status> {
        impl_scheduler_rpc!(self, export_remote_function, req)
    }

    async fn run_function_on_all_workers(
        &self,
        req: rpc::RunFunctionOnAllWorkersRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, run_function_on_all_workers, req)
    }

    async fn export_reusable_variable(
        &self,
        req: rpc::ExportReusableVariableRequest,
    ) -> Result<rpc::AckReply, Status> {
        impl_scheduler_rpc!(self, export_reusable_variable, req)
    }

    async fn scheduler_info(
        &self,
        req: rpc::SchedulerInfoRequest,
    ) -> Result<rpc::SchedulerInfoReply, Status> {
        impl_scheduler_rpc!(self, scheduler_info, req)
    }

    async fn task_info(&self, req: rpc::TaskInfoRequest) -> Result<rpc::TaskInfoReply, Status> {
        impl_scheduler_rpc!(self, task_info, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_invalid_address() {
        let err = SchedulerRpcClient::connect(
            "http://not a uri",
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        // Bind and drop a listener to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let err = SchedulerRpcClient::connect(
            &format!("127.0.0.1:{port}"),
            Duration::from_millis(500),
            Duration::from_millis(500),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_lazy_channel_reports_unavailable() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let channel = Endpoint::from_shared(format!("http://127.0.0.1:{port}"))
            .unwrap()
            .connect_lazy();
        let client = SchedulerRpcClient::from_channel(channel, Some(Duration::from_millis(500)));
        let status = client
            .get_object_id(rpc::GetObjectIdRequest { worker_id: 0 })
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }
}
