// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! In-memory scheduler for tests.
//!
//! [`FakeScheduler`] implements [`SchedulerClient`] directly, so a `Worker`
//! can be built against it without a network, and [`FakeSchedulerService`]
//! exposes the same state through the tonic `SchedulerService` for tests of
//! the real client. Every accepted call is recorded as a [`SchedulerCall`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::{Request, Response, Status};

use orch_common::id::{ObjStoreID, ObjectID, WorkerID};
use orch_proto::rpc;
use orch_scheduler_client::SchedulerClient;

/// Captured scheduler calls.
#[derive(Debug, Clone)]
pub enum SchedulerCall {
    SubmitTask(rpc::SubmitTaskRequest),
    ReadyForNewTask(rpc::ReadyForNewTaskRequest),
    RegisterWorker(rpc::RegisterWorkerRequest),
    KillWorkers,
    NotifyFailure(rpc::NotifyFailureRequest),
    GetObjectId(rpc::GetObjectIdRequest),
    RequestObject(rpc::RequestObjectRequest),
    AddContainedObjectIds(rpc::AddContainedObjectIdsRequest),
    AliasObjectIds(rpc::AliasObjectIdsRequest),
    IncrementRefCount(rpc::IncrementRefCountRequest),
    DecrementRefCount(rpc::DecrementRefCountRequest),
    Wait(rpc::WaitRequest),
    RegisterRemoteFunction(rpc::RegisterRemoteFunctionRequest),
    ExportRemoteFunction(rpc::ExportRemoteFunctionRequest),
    RunFunctionOnAllWorkers(rpc::RunFunctionOnAllWorkersRequest),
    ExportReusableVariable(rpc::ExportReusableVariableRequest),
    SchedulerInfo,
    TaskInfo,
}

#[derive(Default)]
struct State {
    next_object_id: u64,
    next_worker_id: u64,
    workers: Vec<(WorkerID, rpc::RegisterWorkerRequest)>,
    idle_workers: Vec<WorkerID>,
    functions: HashMap<String, u64>,
    register_on_attempt: HashMap<String, u32>,
    submit_attempts: HashMap<String, u32>,
    running_tasks: Vec<rpc::TaskStatus>,
    ref_counts: HashMap<ObjectID, i64>,
    aliases: HashMap<ObjectID, ObjectID>,
    contained: HashMap<ObjectID, Vec<ObjectID>>,
    requested: Vec<ObjectID>,
    ready: HashSet<ObjectID>,
    failures: Vec<rpc::Failure>,
    exported_functions: Vec<rpc::Function>,
    exported_variables: Vec<rpc::ReusableVar>,
    run_on_all: Vec<rpc::Function>,
    kill_workers_result: bool,
}

impl State {
    fn is_allocated(&self, id: ObjectID) -> bool {
        !id.is_nil() && id.value() < self.next_object_id
    }

    fn resolve(&self, id: ObjectID) -> ObjectID {
        let mut current = id;
        // Aliases form a forest, so a chain is never longer than the table.
        for _ in 0..=self.aliases.len() {
            match self.aliases.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        current
    }

    fn worker_address(&self, worker_id: WorkerID) -> String {
        self.workers
            .iter()
            .find(|(id, _)| *id == worker_id)
            .map(|(_, req)| req.worker_address.clone())
            .unwrap_or_default()
    }
}

/// In-memory scheduler with knobs for failure injection.
pub struct FakeScheduler {
    objstore_id: ObjStoreID,
    state: Mutex<State>,
    calls: Mutex<Vec<SchedulerCall>>,
    unavailable: AtomicBool,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self {
            objstore_id: ObjStoreID::new(0),
            state: Mutex::new(State {
                kill_workers_result: true,
                ..Default::default()
            }),
            calls: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn objstore_id(&self) -> ObjStoreID {
        self.objstore_id
    }

    /// While set, every call fails with `Unavailable` and is not recorded.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_kill_workers_result(&self, success: bool) {
        self.state.lock().kill_workers_result = success;
    }

    /// Register a function up front, as if a worker had imported it.
    pub fn register_function(&self, name: &str, num_return_vals: u64) {
        self.state
            .lock()
            .functions
            .insert(name.to_string(), num_return_vals);
    }

    /// Make `name` become registered on the `attempt`-th submission (1-based).
    pub fn register_on_attempt(&self, name: &str, attempt: u32) {
        self.state
            .lock()
            .register_on_attempt
            .insert(name.to_string(), attempt);
    }

    pub fn submit_attempts(&self, name: &str) -> u32 {
        self.state
            .lock()
            .submit_attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn ref_count(&self, id: ObjectID) -> i64 {
        self.state.lock().ref_counts.get(&id).copied().unwrap_or(0)
    }

    pub fn resolve(&self, id: ObjectID) -> ObjectID {
        self.state.lock().resolve(id)
    }

    /// Mark an object as present in the local object store.
    pub fn mark_ready(&self, id: ObjectID) {
        self.state.lock().ready.insert(id);
    }

    pub fn is_ready(&self, id: ObjectID) -> bool {
        let state = self.state.lock();
        state.ready.contains(&state.resolve(id))
    }

    pub fn contained(&self, id: ObjectID) -> Vec<ObjectID> {
        self.state
            .lock()
            .contained
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn requested_objects(&self) -> Vec<ObjectID> {
        self.state.lock().requested.clone()
    }

    pub fn failures(&self) -> Vec<rpc::Failure> {
        self.state.lock().failures.clone()
    }

    pub fn exported_functions(&self) -> Vec<rpc::Function> {
        self.state.lock().exported_functions.clone()
    }

    pub fn exported_variables(&self) -> Vec<rpc::ReusableVar> {
        self.state.lock().exported_variables.clone()
    }

    pub fn functions_run_on_all(&self) -> Vec<rpc::Function> {
        self.state.lock().run_on_all.clone()
    }

    pub fn registered_workers(&self) -> Vec<rpc::RegisterWorkerRequest> {
        self.state
            .lock()
            .workers
            .iter()
            .map(|(_, req)| req.clone())
            .collect()
    }

    pub fn num_idle_workers(&self) -> usize {
        self.state.lock().idle_workers.len()
    }

    /// All recorded calls, oldest first.
    pub fn calls(&self) -> Vec<SchedulerCall> {
        self.calls.lock().clone()
    }

    pub fn num_calls(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count_calls(&self, pred: impl Fn(&SchedulerCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: SchedulerCall) -> Result<(), Status> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Status::unavailable("fake scheduler is unavailable"));
        }
        self.calls.lock().push(call);
        Ok(())
    }
}

impl Default for FakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SchedulerClient for FakeScheduler {
    async fn submit_task(
        &self,
        req: rpc::SubmitTaskRequest,
    ) -> Result<rpc::SubmitTaskReply, Status> {
        self.record(SchedulerCall::SubmitTask(req.clone()))?;
        let task = req
            .task
            .ok_or_else(|| Status::invalid_argument("missing task"))?;
        let mut state = self.state.lock();
        let attempt = {
            let counter = state.submit_attempts.entry(task.name.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        if !state.functions.contains_key(&task.name) {
            match state.register_on_attempt.get(&task.name) {
                Some(&at) if attempt >= at => {
                    state.functions.insert(task.name.clone(), 1);
                }
                _ => {
                    return Ok(rpc::SubmitTaskReply {
                        results: Vec::new(),
                        function_registered: false,
                    })
                }
            }
        }
        let num_returns = if req.num_returns > 0 {
            req.num_returns
        } else {
            state.functions.get(&task.name).copied().unwrap_or(1)
        };
        let first = state.next_object_id;
        state.next_object_id += num_returns;
        let results: Vec<u64> = (first..first + num_returns).collect();

        let worker_id = WorkerID::new(req.worker_id);
        let status = rpc::TaskStatus {
            function_name: task.name,
            worker_id: req.worker_id,
            worker_address: state.worker_address(worker_id),
            error_message: String::new(),
        };
        state.running_tasks.push(status);
        Ok(rpc::SubmitTaskReply {
            results,
            function_registered: true,
        })
    }

    async fn ready_for_new_task(
        &self,
        req: rpc::ReadyForNewTaskRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::ReadyForNewTask(req.clone()))?;
        let worker_id = WorkerID::new(req.worker_id);
        let mut state = self.state.lock();
        if !state.idle_workers.contains(&worker_id) {
            state.idle_workers.push(worker_id);
        }
        Ok(rpc::AckReply {})
    }

    async fn register_worker(
        &self,
        req: rpc::RegisterWorkerRequest,
    ) -> Result<rpc::RegisterWorkerReply, Status> {
        self.record(SchedulerCall::RegisterWorker(req.clone()))?;
        let mut state = self.state.lock();
        let worker_id = WorkerID::new(state.next_worker_id);
        state.next_worker_id += 1;
        state.workers.push((worker_id, req));
        Ok(rpc::RegisterWorkerReply {
            worker_id: worker_id.value(),
            objstore_id: self.objstore_id.value(),
        })
    }

    async fn kill_workers(
        &self,
        _req: rpc::KillWorkersRequest,
    ) -> Result<rpc::KillWorkersReply, Status> {
        self.record(SchedulerCall::KillWorkers)?;
        let mut state = self.state.lock();
        let success = state.kill_workers_result;
        if success {
            state.idle_workers.clear();
        }
        Ok(rpc::KillWorkersReply { success })
    }

    async fn notify_failure(
        &self,
        req: rpc::NotifyFailureRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::NotifyFailure(req.clone()))?;
        let failure = req
            .failure
            .ok_or_else(|| Status::invalid_argument("missing failure"))?;
        self.state.lock().failures.push(failure);
        Ok(rpc::AckReply {})
    }

    async fn get_object_id(
        &self,
        req: rpc::GetObjectIdRequest,
    ) -> Result<rpc::GetObjectIdReply, Status> {
        self.record(SchedulerCall::GetObjectId(req))?;
        let mut state = self.state.lock();
        let object_id = state.next_object_id;
        state.next_object_id += 1;
        Ok(rpc::GetObjectIdReply { object_id })
    }

    async fn request_object(
        &self,
        req: rpc::RequestObjectRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::RequestObject(req.clone()))?;
        let id = ObjectID::new(req.object_id);
        let mut state = self.state.lock();
        if !state.is_allocated(id) {
            return Err(Status::not_found(format!("unknown object {id}")));
        }
        state.requested.push(id);
        Ok(rpc::AckReply {})
    }

    async fn add_contained_object_ids(
        &self,
        req: rpc::AddContainedObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::AddContainedObjectIds(req.clone()))?;
        let id = ObjectID::new(req.object_id);
        let contained = orch_common::id::from_wire(&req.contained_object_ids);
        self.state
            .lock()
            .contained
            .entry(id)
            .or_default()
            .extend(contained);
        Ok(rpc::AckReply {})
    }

    async fn alias_object_ids(
        &self,
        req: rpc::AliasObjectIdsRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::AliasObjectIds(req.clone()))?;
        let alias = ObjectID::new(req.alias_object_id);
        let target = ObjectID::new(req.target_object_id);
        let mut state = self.state.lock();
        if alias == target {
            return Err(Status::invalid_argument(format!(
                "cannot alias object {alias} to itself"
            )));
        }
        if !state.is_allocated(alias) || !state.is_allocated(target) {
            return Err(Status::not_found(format!(
                "alias {alias} or target {target} was never allocated"
            )));
        }
        if state.aliases.contains_key(&alias) {
            return Err(Status::already_exists(format!("object {alias} is already an alias")));
        }
        if state.resolve(target) == alias {
            return Err(Status::failed_precondition(format!(
                "aliasing {alias} to {target} would create a cycle"
            )));
        }
        state.aliases.insert(alias, target);
        Ok(rpc::AckReply {})
    }

    async fn increment_ref_count(
        &self,
        req: rpc::IncrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::IncrementRefCount(req.clone()))?;
        let mut state = self.state.lock();
        for id in orch_common::id::from_wire(&req.object_ids) {
            *state.ref_counts.entry(id).or_insert(0) += 1;
        }
        Ok(rpc::AckReply {})
    }

    async fn decrement_ref_count(
        &self,
        req: rpc::DecrementRefCountRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::DecrementRefCount(req.clone()))?;
        let ids = orch_common::id::from_wire(&req.object_ids);
        let mut state = self.state.lock();
        let mut pending: HashMap<ObjectID, i64> = HashMap::new();
        for id in &ids {
            *pending.entry(*id).or_insert(0) += 1;
        }
        for (id, count) in &pending {
            if state.ref_counts.get(id).copied().unwrap_or(0) < *count {
                return Err(Status::failed_precondition(format!(
                    "reference count of object {id} would go negative"
                )));
            }
        }
        for (id, count) in pending {
            if let Some(current) = state.ref_counts.get_mut(&id) {
                *current -= count;
            }
        }
        Ok(rpc::AckReply {})
    }

    async fn wait(&self, req: rpc::WaitRequest) -> Result<rpc::WaitReply, Status> {
        self.record(SchedulerCall::Wait(req.clone()))?;
        let state = self.state.lock();
        let indices = req
            .object_ids
            .iter()
            .enumerate()
            .filter(|(_, id)| state.ready.contains(&state.resolve(ObjectID::new(**id))))
            .map(|(index, _)| index as u64)
            .collect();
        Ok(rpc::WaitReply { indices })
    }

    async fn register_remote_function(
        &self,
        req: rpc::RegisterRemoteFunctionRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::RegisterRemoteFunction(req.clone()))?;
        self.state
            .lock()
            .functions
            .insert(req.function_name, req.num_return_vals);
        Ok(rpc::AckReply {})
    }

    async fn export_remote_function(
        &self,
        req: rpc::ExportRemoteFunctionRequest,
    ) -> Result<rpc::ExportRemoteFunctionReply, Status> {
        self.record(SchedulerCall::ExportRemoteFunction(req.clone()))?;
        let function = req
            .function
            .ok_or_else(|| Status::invalid_argument("missing function"))?;
        self.state.lock().exported_functions.push(function);
        Ok(rpc::ExportRemoteFunctionReply { success: true })
    }

    async fn run_function_on_all_workers(
        &self,
        req: rpc::RunFunctionOnAllWorkersRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::RunFunctionOnAllWorkers(req.clone()))?;
        let function = req
            .function
            .ok_or_else(|| Status::invalid_argument("missing function"))?;
        self.state.lock().run_on_all.push(function);
        Ok(rpc::AckReply {})
    }

    async fn export_reusable_variable(
        &self,
        req: rpc::ExportReusableVariableRequest,
    ) -> Result<rpc::AckReply, Status> {
        self.record(SchedulerCall::ExportReusableVariable(req.clone()))?;
        let variable = req
            .reusable_variable
            .ok_or_else(|| Status::invalid_argument("missing reusable variable"))?;
        self.state.lock().exported_variables.push(variable);
        Ok(rpc::AckReply {})
    }

    async fn scheduler_info(
        &self,
        _req: rpc::SchedulerInfoRequest,
    ) -> Result<rpc::SchedulerInfoReply, Status> {
        self.record(SchedulerCall::SchedulerInfo)?;
        let state = self.state.lock();
        let objects = (0..state.next_object_id)
            .map(ObjectID::new)
            .map(|id| rpc::ObjectInfo {
                object_id: id.value(),
                reference_count: state.ref_counts.get(&id).copied().unwrap_or(0),
                target_object_id: state.resolve(id).value(),
            })
            .collect();
        let mut functions: Vec<rpc::FunctionInfo> = state
            .functions
            .iter()
            .map(|(name, num_return_vals)| rpc::FunctionInfo {
                name: name.clone(),
                num_return_vals: *num_return_vals,
            })
            .collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rpc::SchedulerInfoReply {
            objects,
            avail_workers: state.idle_workers.iter().map(WorkerID::value).collect(),
            functions,
        })
    }

    async fn task_info(&self, _req: rpc::TaskInfoRequest) -> Result<rpc::TaskInfoReply, Status> {
        self.record(SchedulerCall::TaskInfo)?;
        let state = self.state.lock();
        let failed_tasks = state
            .failures
            .iter()
            .filter(|failure| failure.failed_type() == rpc::FailedType::FailedTask)
            .map(|failure| rpc::TaskStatus {
                function_name: failure.name.clone(),
                worker_id: failure.worker_id,
                worker_address: failure.worker_address.clone(),
                error_message: failure.error_message.clone(),
            })
            .collect();
        Ok(rpc::TaskInfoReply {
            failed_tasks,
            running_tasks: state.running_tasks.clone(),
        })
    }
}

/// Serves a [`FakeScheduler`] through the tonic `SchedulerService`.
pub struct FakeSchedulerService(pub Arc<FakeScheduler>);

#[tonic::async_trait]
impl rpc::scheduler_service_server::SchedulerService for FakeSchedulerService {
    async fn submit_task(
        &self,
        request: Request<rpc::SubmitTaskRequest>,
    ) -> Result<Response<rpc::SubmitTaskReply>, Status> {
        SchedulerClient::submit_task(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn register_worker(
        &self,
        request: Request<rpc::RegisterWorkerRequest>,
    ) -> Result<Response<rpc::RegisterWorkerReply>, Status> {
        SchedulerClient::register_worker(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn get_object_id(
        &self,
        request: Request<rpc::GetObjectIdRequest>,
    ) -> Result<Response<rpc::GetObjectIdReply>, Status> {
        SchedulerClient::get_object_id(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn request_object(
        &self,
        request: Request<rpc::RequestObjectRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::request_object(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn add_contained_object_ids(
        &self,
        request: Request<rpc::AddContainedObjectIdsRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::add_contained_object_ids(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn alias_object_ids(
        &self,
        request: Request<rpc::AliasObjectIdsRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::alias_object_ids(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn increment_ref_count(
        &self,
        request: Request<rpc::IncrementRefCountRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::increment_ref_count(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn decrement_ref_count(
        &self,
        request: Request<rpc::DecrementRefCountRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::decrement_ref_count(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn register_remote_function(
        &self,
        request: Request<rpc::RegisterRemoteFunctionRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::register_remote_function(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn notify_failure(
        &self,
        request: Request<rpc::NotifyFailureRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::notify_failure(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn scheduler_info(
        &self,
        request: Request<rpc::SchedulerInfoRequest>,
    ) -> Result<Response<rpc::SchedulerInfoReply>, Status> {
        SchedulerClient::scheduler_info(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn task_info(
        &self,
        request: Request<rpc::TaskInfoRequest>,
    ) -> Result<Response<rpc::TaskInfoReply>, Status> {
        SchedulerClient::task_info(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn wait(
        &self,
        request: Request<rpc::WaitRequest>,
    ) -> Result<Response<rpc::WaitReply>, Status> {
        SchedulerClient::wait(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn kill_workers(
        &self,
        request: Request<rpc::KillWorkersRequest>,
    ) -> Result<Response<rpc::KillWorkersReply>, Status> {
        SchedulerClient::kill_workers(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn run_function_on_all_workers(
        &self,
        request: Request<rpc::RunFunctionOnAllWorkersRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::run_function_on_all_workers(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn export_remote_function(
        &self,
        request: Request<rpc::ExportRemoteFunctionRequest>,
    ) -> Result<Response<rpc::ExportRemoteFunctionReply>, Status> {
        SchedulerClient::export_remote_function(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn export_reusable_variable(
        &self,
        request: Request<rpc::ExportReusableVariableRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::export_reusable_variable(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }

    async fn ready_for_new_task(
        &self,
        request: Request<rpc::ReadyForNewTaskRequest>,
    ) -> Result<Response<rpc::AckReply>, Status> {
        SchedulerClient::ready_for_new_task(self.0.as_ref(), request.into_inner())
            .await
            .map(Response::new)
    }
}
