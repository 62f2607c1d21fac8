// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Async trait for the scheduler client, enabling both real and fake implementations.

use orch_proto::rpc;
use tonic::Status;

/// Async trait for scheduler RPC operations.
///
/// Implemented by the real gRPC client (`SchedulerRpcClient`) and by the
/// in-memory `FakeScheduler` used in tests. All methods return
/// `Result<Reply, Status>`.
#[async_trait::async_trait]
pub trait SchedulerClient: Send + Sync {
    // ── Tasks ─────────────────────────────────────────────────────
    async fn submit_task(
        &self,
        req: rpc::SubmitTaskRequest,
    ) -> Result<rpc::SubmitTaskReply, Status>;
    async fn ready_for_new_task(
        &self,
        req: rpc::ReadyForNewTaskRequest,
    ) -> Result<rpc::AckReply, Status>;

    // ── Workers ───────────────────────────────────────────────────
    async fn register_worker(
        &self,
        req: rpc::RegisterWorkerRequest,
    ) -> Result<rpc::RegisterWorkerReply, Status>;
    async fn kill_workers(
        &self,
        req: rpc::KillWorkersRequest,
    ) -> Result<rpc::KillWorkersReply, Status>;
    async fn notify_failure(
        &self,
        req: rpc::NotifyFailureRequest,
    ) -> Result<rpc::AckReply, Status>;

    // ── Objects ───────────────────────────────────────────────────
    async fn get_object_id(
        &self,
        req: rpc::GetObjectIdRequest,
    ) -> Result<rpc::GetObjectIdReply, Status>;
    async fn request_object(
        &self,
        req: rpc::RequestObjectRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn add_contained_object_ids(
        &self,
        req: rpc::AddContainedObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn alias_object_ids(
        &self,
        req: rpc::AliasObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn increment_ref_count(
        &self,
        req: rpc::IncrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn decrement_ref_count(
        &self,
        req: rpc::DecrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn wait(&self, req: rpc::WaitRequest) -> Result<rpc::WaitReply, Status>;

    // ── Code export ───────────────────────────────────────────────
    async fn register_remote_function(
        &self,
        req: rpc::RegisterRemoteFunctionRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn export_remote_function(
        &self,
        req: rpc::ExportRemoteFunctionRequest,
    ) -> Result<rpc::ExportRemoteFunctionReply, Status>;
    async fn run_function_on_all_workers(
        &self,
        req: rpc::RunFunctionOnAllWorkersRequest,
    ) -> Result<rpc::AckReply, Status>;
    async fn export_reusable_variable(
        &self,
        req: rpc::ExportReusableVariableRequest,
    ) -> Result<rpc::AckReply, Status>;

    // ── Introspection ─────────────────────────────────────────────
    async fn scheduler_info(
        &self,
        req: rpc::SchedulerInfoRequest,
    ) -> Result<rpc::SchedulerInfoReply, Status>;
    async fn task_info(&self, req: rpc::TaskInfoRequest) -> Result<rpc::TaskInfoReply, Status>;
}
