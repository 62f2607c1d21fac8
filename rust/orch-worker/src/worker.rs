// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! The worker: scheduler client, object-store client and command queue.
//!
//! Scheduler operations are async and return once the scheduler has
//! acknowledged them. Object-store operations block on the reply queue and
//! are meant for the execution thread. Reference counts are never kept here:
//! the scheduler is the single authority and the worker only forwards
//! increments and decrements.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use orch_common::id::{self, ObjStoreID, ObjectID, SegmentID, WorkerID};
use orch_common::mode::Mode;
use orch_ipc::{MessageQueue, SegmentView};
use orch_proto::rpc;
use orch_scheduler_client::{SchedulerClient, SchedulerRpcClient};
use orch_util::backoff::ExponentialBackoff;

use crate::error::{WorkerError, WorkerResult};
use crate::grpc_service::WorkerServiceImpl;
use crate::message::WorkerMessage;
use crate::object_store::{ObjStoreRequests, ObjectBuffer, ObjectStoreClient};
use crate::options::WorkerOptions;
use crate::task_submitter::{submit_with_retry, SubmitRetryPolicy};

struct Registration {
    worker_id: WorkerID,
    objstore_id: ObjStoreID,
    objstore: ObjectStoreClient,
}

struct ServiceHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    _join_handle: JoinHandle<()>,
}

pub struct Worker {
    options: WorkerOptions,
    scheduler: Arc<dyn SchedulerClient>,
    runtime: Handle,
    commands: MessageQueue<WorkerMessage>,
    registration: OnceLock<Registration>,
    connected: AtomicBool,
    service: Mutex<Option<ServiceHandle>>,
    worker_address: OnceLock<String>,
}

impl Worker {
    /// Create a worker talking to `scheduler`. Must be called inside a tokio
    /// runtime; the worker keeps a handle to it for background work.
    pub fn new(options: WorkerOptions, scheduler: Arc<dyn SchedulerClient>) -> WorkerResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| WorkerError::Internal(format!("no tokio runtime: {e}")))?;
        let commands = MessageQueue::create(
            &options.command_queue_name,
            options.config.command_queue_capacity,
        )?;
        tracing::info!(
            mode = %options.mode,
            command_queue = %options.command_queue_name,
            "worker created"
        );
        Ok(Self {
            options,
            scheduler,
            runtime,
            commands,
            registration: OnceLock::new(),
            connected: AtomicBool::new(false),
            service: Mutex::new(None),
            worker_address: OnceLock::new(),
        })
    }

    /// Dial the scheduler at `options.scheduler_address` and create a worker.
    pub async fn connect(options: WorkerOptions) -> WorkerResult<Self> {
        let scheduler = SchedulerRpcClient::connect(
            &options.scheduler_address,
            options.config.scheduler_connect_timeout(),
            options.config.scheduler_rpc_timeout(),
        )
        .await
        .map_err(WorkerError::from_status)?;
        Self::new(options, Arc::new(scheduler))
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    pub fn mode(&self) -> Mode {
        self.options.mode
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// `ip:port` of the worker service, empty until it is started.
    pub fn worker_address(&self) -> &str {
        self.worker_address.get().map_or("", String::as_str)
    }

    /// Nil until registered.
    pub fn worker_id(&self) -> WorkerID {
        self.registration
            .get()
            .map_or_else(WorkerID::nil, |r| r.worker_id)
    }

    /// Nil until registered.
    pub fn objstore_id(&self) -> ObjStoreID {
        self.registration
            .get()
            .map_or_else(ObjStoreID::nil, |r| r.objstore_id)
    }

    pub fn command_queue(&self) -> &MessageQueue<WorkerMessage> {
        &self.commands
    }

    fn registration(&self) -> WorkerResult<&Registration> {
        let registration = self.registration.get().ok_or(WorkerError::NotRegistered)?;
        if !self.connected() {
            return Err(WorkerError::Disconnected("worker has disconnected".into()));
        }
        Ok(registration)
    }

    fn objstore(&self) -> WorkerResult<&ObjectStoreClient> {
        Ok(&self.registration()?.objstore)
    }

    /// Run `future` to completion on the worker's runtime. Must not be
    /// called from inside that runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────

    /// Serve the `WorkerService` on `node_ip_address:port`, feeding this
    /// worker's command queue. Returns the bound address.
    pub async fn start_worker_service(&self) -> WorkerResult<SocketAddr> {
        use orch_proto::rpc::worker_service_server::WorkerServiceServer;

        if self.service.lock().is_some() {
            return Err(WorkerError::Internal("worker service already running".into()));
        }
        let listener =
            tokio::net::TcpListener::bind((self.options.node_ip_address.as_str(), self.options.port))
                .await
                .map_err(|e| {
                    WorkerError::Internal(format!(
                        "failed to bind worker service on {}:{}: {e}",
                        self.options.node_ip_address, self.options.port
                    ))
                })?;
        let addr = listener
            .local_addr()
            .map_err(|e| WorkerError::Internal(format!("no local address: {e}")))?;
        let service = WorkerServiceImpl::new(
            &self.options.command_queue_name,
            self.options.config.command_queue_capacity,
            self.options.mode,
        )?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join_handle = self.runtime.spawn(async move {
            let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
            let result = tonic::transport::Server::builder()
                .add_service(WorkerServiceServer::new(service))
                .serve_with_incoming_shutdown(incoming, async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "worker service stopped with error");
            }
        });

        let worker_address = format!("{}:{}", self.options.node_ip_address, addr.port());
        let _ = self.worker_address.set(worker_address.clone());
        *self.service.lock() = Some(ServiceHandle {
            addr,
            shutdown_tx,
            _join_handle: join_handle,
        });
        tracing::info!(worker_address = %worker_address, "worker service started");
        Ok(addr)
    }

    /// Bound address of the worker service, if running.
    pub fn service_addr(&self) -> Option<SocketAddr> {
        self.service.lock().as_ref().map(|s| s.addr)
    }

    /// One-time handshake with the scheduler. Attaches to the object store's
    /// request queue first, then registers, then creates this worker's reply
    /// queue under the assigned ID.
    pub async fn register_worker(
        &self,
        node_ip_address: &str,
        objstore_address: &str,
        is_driver: bool,
    ) -> WorkerResult<()> {
        if self.registration.get().is_some() {
            return Err(WorkerError::AlreadyRegistered);
        }
        // Fail before the scheduler records a worker we cannot back.
        let requests = ObjStoreRequests::open(objstore_address, &self.options.config)?;
        let reply = self
            .scheduler
            .register_worker(rpc::RegisterWorkerRequest {
                node_ip_address: node_ip_address.to_string(),
                worker_address: self.worker_address().to_string(),
                objstore_address: objstore_address.to_string(),
                is_driver,
            })
            .await
            .map_err(WorkerError::from_status)?;
        let worker_id = WorkerID::new(reply.worker_id);
        let objstore_id = ObjStoreID::new(reply.objstore_id);
        let objstore = ObjectStoreClient::with_requests(
            worker_id,
            objstore_id,
            requests,
            &self.options.config,
        )?;
        self.registration
            .set(Registration {
                worker_id,
                objstore_id,
                objstore,
            })
            .map_err(|_| WorkerError::AlreadyRegistered)?;
        self.connected.store(true, Ordering::SeqCst);
        tracing::info!(
            worker_id = %worker_id,
            objstore_id = %objstore_id,
            is_driver,
            "registered with scheduler"
        );
        Ok(())
    }

    /// Stop the worker service and close the command queue, waking a parked
    /// execution thread. Idempotent.
    pub fn disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(service) = self.service.lock().take() {
            let _ = service.shutdown_tx.send(());
        }
        self.commands.close();
        MessageQueue::<WorkerMessage>::remove(self.commands.name());
        if let Some(registration) = self.registration.get() {
            registration.objstore.close();
        }
        if was_connected {
            tracing::info!(worker_id = %self.worker_id(), "worker disconnected");
        }
    }

    /// Block until the next command. `None` means the queue was closed by
    /// `Die` or `disconnect`.
    pub fn receive_next_message(&self) -> Option<WorkerMessage> {
        self.commands.receive()
    }

    // ─── Tasks ───────────────────────────────────────────────────────

    /// Submit `task` with the configured registration retry policy.
    pub async fn submit_task(&self, task: rpc::Task, num_returns: u64) -> WorkerResult<Vec<ObjectID>> {
        let policy = SubmitRetryPolicy::from_config(&self.options.config);
        self.submit_task_with_policy(task, num_returns, policy).await
    }

    pub async fn submit_task_with_policy(
        &self,
        task: rpc::Task,
        num_returns: u64,
        policy: SubmitRetryPolicy,
    ) -> WorkerResult<Vec<ObjectID>> {
        let worker_id = self.registration()?.worker_id;
        let request = rpc::SubmitTaskRequest {
            worker_id: worker_id.value(),
            task: Some(task),
            num_returns,
        };
        submit_with_retry(self.scheduler.as_ref(), request, policy).await
    }

    /// Tell the scheduler this worker is idle.
    pub async fn ready_for_new_task(&self) -> WorkerResult<()> {
        let worker_id = self.registration()?.worker_id;
        self.scheduler
            .ready_for_new_task(rpc::ReadyForNewTaskRequest {
                worker_id: worker_id.value(),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    // ─── Object IDs and references ───────────────────────────────────

    pub async fn get_objectid(&self) -> WorkerResult<ObjectID> {
        let worker_id = self.registration()?.worker_id;
        let reply = self
            .scheduler
            .get_object_id(rpc::GetObjectIdRequest {
                worker_id: worker_id.value(),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(ObjectID::new(reply.object_id))
    }

    /// Ask the scheduler to bring `object_id` into the local object store.
    pub async fn request_object(&self, object_id: ObjectID) -> WorkerResult<()> {
        let worker_id = self.registration()?.worker_id;
        self.scheduler
            .request_object(rpc::RequestObjectRequest {
                worker_id: worker_id.value(),
                object_id: object_id.value(),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    pub async fn add_contained_objectids(
        &self,
        object_id: ObjectID,
        contained: &[ObjectID],
    ) -> WorkerResult<()> {
        self.registration()?;
        self.scheduler
            .add_contained_object_ids(rpc::AddContainedObjectIdsRequest {
                object_id: object_id.value(),
                contained_object_ids: id::to_wire(contained),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    /// Make `alias` resolve to whatever `target` resolves to.
    pub async fn alias_objectids(&self, alias: ObjectID, target: ObjectID) -> WorkerResult<()> {
        self.registration()?;
        self.scheduler
            .alias_object_ids(rpc::AliasObjectIdsRequest {
                alias_object_id: alias.value(),
                target_object_id: target.value(),
            })
            .await
            .map_err(WorkerError::from_alias_status)?;
        tracing::debug!(alias = %alias, target = %target, "aliased object ids");
        Ok(())
    }

    pub async fn increment_reference_count(&self, object_ids: &[ObjectID]) -> WorkerResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }
        self.registration()?;
        self.scheduler
            .increment_ref_count(rpc::IncrementRefCountRequest {
                object_ids: id::to_wire(object_ids),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    pub async fn decrement_reference_count(&self, object_ids: &[ObjectID]) -> WorkerResult<()> {
        if object_ids.is_empty() {
            return Ok(());
        }
        self.registration()?;
        self.scheduler
            .decrement_ref_count(rpc::DecrementRefCountRequest {
                object_ids: id::to_wire(object_ids),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    // ─── Buffers (blocking) ──────────────────────────────────────────

    pub fn allocate_buffer(&self, object_id: ObjectID, size: usize) -> WorkerResult<SegmentView> {
        self.objstore()?.allocate_buffer(object_id, size)
    }

    pub fn finish_buffer(
        &self,
        object_id: ObjectID,
        segment_id: SegmentID,
        metadata_offset: usize,
    ) -> WorkerResult<()> {
        self.objstore()?
            .finish_buffer(object_id, segment_id, metadata_offset)
    }

    pub fn get_buffer(&self, object_id: ObjectID) -> WorkerResult<ObjectBuffer> {
        self.objstore()?.get_buffer(object_id)
    }

    pub fn unmap_object(&self, object_id: ObjectID) -> WorkerResult<()> {
        self.objstore()?.unmap_object(object_id)
    }

    // ─── Code export ─────────────────────────────────────────────────

    pub async fn register_remote_function(
        &self,
        function_name: &str,
        num_return_vals: u64,
    ) -> WorkerResult<()> {
        let worker_id = self.registration()?.worker_id;
        self.scheduler
            .register_remote_function(rpc::RegisterRemoteFunctionRequest {
                worker_id: worker_id.value(),
                function_name: function_name.to_string(),
                num_return_vals,
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    /// Returns the scheduler's success flag.
    pub async fn export_remote_function(&self, function: rpc::Function) -> WorkerResult<bool> {
        self.registration()?;
        let reply = self
            .scheduler
            .export_remote_function(rpc::ExportRemoteFunctionRequest {
                function: Some(function),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(reply.success)
    }

    pub async fn run_function_on_all_workers(&self, function: rpc::Function) -> WorkerResult<()> {
        self.registration()?;
        self.scheduler
            .run_function_on_all_workers(rpc::RunFunctionOnAllWorkersRequest {
                function: Some(function),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    pub async fn export_reusable_variable(&self, variable: rpc::ReusableVar) -> WorkerResult<()> {
        self.registration()?;
        self.scheduler
            .export_reusable_variable(rpc::ExportReusableVariableRequest {
                reusable_variable: Some(variable),
            })
            .await
            .map_err(WorkerError::from_status)?;
        Ok(())
    }

    // ─── Failures ────────────────────────────────────────────────────

    /// Report a failure to the scheduler without waiting for delivery.
    pub fn notify_failure(&self, failed_type: rpc::FailedType, name: &str, error_message: &str) {
        let Ok(registration) = self.registration() else {
            tracing::warn!(
                name = %name,
                error_message = %error_message,
                "dropping failure report from unregistered worker"
            );
            return;
        };
        let mut failure = rpc::Failure {
            failed_type: 0,
            worker_id: registration.worker_id.value(),
            worker_address: self.worker_address().to_string(),
            name: name.to_string(),
            error_message: error_message.to_string(),
        };
        failure.set_failed_type(failed_type);
        let scheduler = Arc::clone(&self.scheduler);
        let name = name.to_string();
        self.runtime.spawn(async move {
            let request = rpc::NotifyFailureRequest {
                failure: Some(failure),
            };
            if let Err(status) = scheduler.notify_failure(request).await {
                tracing::error!(name = %name, error = %status, "failed to deliver failure report");
            }
        });
    }

    // ─── Introspection ───────────────────────────────────────────────

    pub async fn scheduler_info(&self) -> WorkerResult<rpc::SchedulerInfoReply> {
        self.registration()?;
        self.scheduler
            .scheduler_info(rpc::SchedulerInfoRequest {})
            .await
            .map_err(WorkerError::from_status)
    }

    pub async fn task_info(&self) -> WorkerResult<rpc::TaskInfoReply> {
        self.registration()?;
        self.scheduler
            .task_info(rpc::TaskInfoRequest {})
            .await
            .map_err(WorkerError::from_status)
    }

    /// Indices of `object_ids` currently present in the local object store.
    /// A single snapshot; see [`wait_until`](Self::wait_until) to block.
    pub async fn wait(&self, object_ids: &[ObjectID]) -> WorkerResult<Vec<usize>> {
        self.registration()?;
        if object_ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .scheduler
            .wait(rpc::WaitRequest {
                object_ids: id::to_wire(object_ids),
            })
            .await
            .map_err(WorkerError::from_status)?;
        let mut indices: Vec<usize> = reply
            .indices
            .into_iter()
            .filter_map(|i| usize::try_from(i).ok())
            .filter(|i| *i < object_ids.len())
            .collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    /// Poll [`wait`](Self::wait) with exponential backoff until at least
    /// `num_ready` objects are ready or `timeout` passes. Returns the last
    /// snapshot either way.
    pub async fn wait_until(
        &self,
        object_ids: &[ObjectID],
        num_ready: usize,
        timeout: Duration,
    ) -> WorkerResult<Vec<usize>> {
        let num_ready = num_ready.min(object_ids.len());
        let config = &self.options.config;
        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(config.wait_poll_initial_ms),
            2.0,
            Duration::from_millis(config.wait_poll_max_ms),
        )
        .with_jitter();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let ready = self.wait(object_ids).await?;
            if ready.len() >= num_ready {
                return Ok(ready);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(ready);
            }
            tokio::time::sleep(backoff.next_delay_within(remaining)).await;
        }
    }

    /// Ask the scheduler to kill all idle workers.
    pub async fn kill_workers(&self) -> WorkerResult<bool> {
        self.registration()?;
        let reply = self
            .scheduler
            .kill_workers(rpc::KillWorkersRequest {})
            .await
            .map_err(WorkerError::from_status)?;
        Ok(reply.success)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_test_utils::wait::wait_for_condition;
    use orch_test_utils::{unique_name, FakeObjectStore, FakeScheduler, SchedulerCall};

    struct Fixture {
        worker: Worker,
        scheduler: Arc<FakeScheduler>,
        _store: FakeObjectStore,
        _dir: tempfile::TempDir,
    }

    fn options(dir: &std::path::Path) -> WorkerOptions {
        let mut options = WorkerOptions::new("127.0.0.1", "unused", Mode::Script);
        options.command_queue_name = unique_name("queue:worker");
        options.config.segment_directory = dir.to_string_lossy().into_owned();
        options.config.objstore_reply_timeout_ms = 5_000;
        options
    }

    async fn registered() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let objstore_address = unique_name("objstore");
        let store =
            FakeObjectStore::start_with_scheduler(&objstore_address, dir.path(), 1 << 16, &scheduler);
        let worker = Worker::new(options(dir.path()), scheduler.clone()).unwrap();
        worker
            .register_worker("127.0.0.1", &objstore_address, true)
            .await
            .unwrap();
        Fixture {
            worker,
            scheduler,
            _store: store,
            _dir: dir,
        }
    }

    /// Allocate and finish an object holding `bytes`.
    async fn put(f: &Fixture, bytes: &[u8]) -> ObjectID {
        let id = f.worker.get_objectid().await.unwrap();
        let mut view = f.worker.allocate_buffer(id, bytes.len()).unwrap();
        view.write(0, bytes).unwrap();
        f.worker.finish_buffer(id, view.segment_id(), bytes.len()).unwrap();
        id
    }

    #[tokio::test]
    async fn test_methods_require_registration() {
        let dir = tempfile::tempdir().unwrap();
        let worker = Worker::new(options(dir.path()), Arc::new(FakeScheduler::new())).unwrap();
        assert!(worker.worker_id().is_nil());
        assert!(!worker.connected());
        assert!(matches!(
            worker.get_objectid().await,
            Err(WorkerError::NotRegistered)
        ));
        assert!(matches!(
            worker.get_buffer(ObjectID::new(0)),
            Err(WorkerError::NotRegistered)
        ));
    }

    #[tokio::test]
    async fn test_register_once() {
        let f = registered().await;
        assert!(f.worker.connected());
        assert_eq!(f.worker.worker_id(), WorkerID::new(0));
        assert_eq!(f.worker.objstore_id(), f.scheduler.objstore_id());
        let registered = f.scheduler.registered_workers();
        assert_eq!(registered.len(), 1);
        assert!(registered[0].is_driver);

        let err = f
            .worker
            .register_worker("127.0.0.1", "elsewhere", true)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn test_register_fails_without_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(FakeScheduler::new());
        let worker = Worker::new(options(dir.path()), scheduler.clone()).unwrap();
        let objstore_address = unique_name("late-store");
        let err = worker
            .register_worker("127.0.0.1", &objstore_address, false)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::ObjStoreUnavailable(_)));
        assert!(!worker.connected());
        assert!(scheduler.registered_workers().is_empty());

        // Retrying once the store is up leaves exactly one registration.
        let _store =
            FakeObjectStore::start_with_scheduler(&objstore_address, dir.path(), 1 << 12, &scheduler);
        worker
            .register_worker("127.0.0.1", &objstore_address, false)
            .await
            .unwrap();
        assert!(worker.connected());
        assert_eq!(scheduler.registered_workers().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_down_is_disconnected() {
        let f = registered().await;
        f.scheduler.set_unavailable(true);
        assert!(matches!(
            f.worker.get_objectid().await,
            Err(WorkerError::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn test_reference_counts_mirror_scheduler() {
        let f = registered().await;
        let a = f.worker.get_objectid().await.unwrap();
        let b = f.worker.get_objectid().await.unwrap();

        f.worker.increment_reference_count(&[a, b, a]).await.unwrap();
        f.worker.increment_reference_count(&[a]).await.unwrap();
        f.worker.decrement_reference_count(&[a, b]).await.unwrap();
        assert_eq!(f.scheduler.ref_count(a), 2);
        assert_eq!(f.scheduler.ref_count(b), 0);

        let err = f.worker.decrement_reference_count(&[b]).await.unwrap_err();
        assert!(matches!(err, WorkerError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_empty_reference_batch_sends_nothing() {
        let f = registered().await;
        let before = f.scheduler.num_calls();
        f.worker.increment_reference_count(&[]).await.unwrap();
        f.worker.decrement_reference_count(&[]).await.unwrap();
        assert_eq!(f.scheduler.num_calls(), before);
    }

    #[tokio::test]
    async fn test_alias_chain_reads_target_data() {
        let f = registered().await;
        let target = put(&f, b"shared bytes").await;
        let mid = f.worker.get_objectid().await.unwrap();
        let head = f.worker.get_objectid().await.unwrap();
        f.worker.alias_objectids(mid, target).await.unwrap();
        f.worker.alias_objectids(head, mid).await.unwrap();

        let direct = f.worker.get_buffer(target).unwrap();
        let via_alias = f.worker.get_buffer(head).unwrap();
        assert_eq!(via_alias.view.to_vec(), direct.view.to_vec());
        assert_eq!(via_alias.segment_id, direct.segment_id);
        assert_eq!(via_alias.size, direct.size);
    }

    #[tokio::test]
    async fn test_alias_cycle_is_rejected() {
        let f = registered().await;
        let a = f.worker.get_objectid().await.unwrap();
        let b = f.worker.get_objectid().await.unwrap();
        f.worker.alias_objectids(a, b).await.unwrap();
        assert!(matches!(
            f.worker.alias_objectids(b, a).await,
            Err(WorkerError::AliasRejected(_))
        ));
        assert!(matches!(
            f.worker.alias_objectids(b, ObjectID::new(1000)).await,
            Err(WorkerError::AliasRejected(_))
        ));
    }

    #[tokio::test]
    async fn test_buffer_round_trip() {
        let f = registered().await;
        let id = f.worker.get_objectid().await.unwrap();
        let mut view = f.worker.allocate_buffer(id, 8).unwrap();
        let segment_id = view.segment_id();
        assert!(matches!(
            f.worker.get_buffer(id),
            Err(WorkerError::ObjectNotReady(_))
        ));

        view.write(0, b"datameta").unwrap();
        f.worker.finish_buffer(id, segment_id, 4).unwrap();
        let buffer = f.worker.get_buffer(id).unwrap();
        assert_eq!(
            (buffer.size, buffer.segment_id, buffer.metadata_offset),
            (8, segment_id, 4)
        );
        assert_eq!(buffer.data().unwrap(), b"data");
        assert!(!buffer.as_ptr().is_null());

        f.worker.unmap_object(id).unwrap();
        f.worker.unmap_object(id).unwrap();
    }

    #[tokio::test]
    async fn test_wait_is_a_snapshot() {
        let f = registered().await;
        let ready = put(&f, b"x").await;
        let pending = f.worker.get_objectid().await.unwrap();

        let indices = f.worker.wait(&[pending, ready]).await.unwrap();
        assert_eq!(indices, vec![1]);
        assert_eq!(
            f.scheduler
                .count_calls(|c| matches!(c, SchedulerCall::Wait(_))),
            1
        );
        assert!(f.worker.wait(&[]).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wait_until_polls() {
        let f = registered().await;
        let id = f.worker.get_objectid().await.unwrap();

        let timed_out = f
            .worker
            .wait_until(&[id], 1, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(timed_out.is_empty());
        let polls = f
            .scheduler
            .count_calls(|c| matches!(c, SchedulerCall::Wait(_)));
        assert!(polls > 1);

        let scheduler = Arc::clone(&f.scheduler);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            scheduler.mark_ready(id);
        });
        let ready = f
            .worker
            .wait_until(&[id], 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(ready, vec![0]);
    }

    #[tokio::test]
    async fn test_request_object_and_contained_ids() {
        let f = registered().await;
        let outer = f.worker.get_objectid().await.unwrap();
        let inner = f.worker.get_objectid().await.unwrap();
        f.worker.request_object(outer).await.unwrap();
        f.worker.add_contained_objectids(outer, &[inner]).await.unwrap();
        assert_eq!(f.scheduler.requested_objects(), vec![outer]);
        assert_eq!(f.scheduler.contained(outer), vec![inner]);
    }

    #[tokio::test]
    async fn test_exports_and_introspection() {
        let f = registered().await;
        f.worker.register_remote_function("f", 2).await.unwrap();
        let function = rpc::Function {
            name: "g".into(),
            implementation: b"def g(): pass".to_vec(),
        };
        assert!(f.worker.export_remote_function(function.clone()).await.unwrap());
        f.worker.run_function_on_all_workers(function.clone()).await.unwrap();
        f.worker
            .export_reusable_variable(rpc::ReusableVar {
                name: "v".into(),
                initializer: Some(function.clone()),
                reinitializer: None,
            })
            .await
            .unwrap();
        assert_eq!(f.scheduler.exported_functions(), vec![function.clone()]);
        assert_eq!(f.scheduler.functions_run_on_all(), vec![function]);
        assert_eq!(f.scheduler.exported_variables().len(), 1);

        let info = f.worker.scheduler_info().await.unwrap();
        assert_eq!(info.functions.len(), 1);
        assert_eq!(info.functions[0].num_return_vals, 2);

        let results = f
            .worker
            .submit_task(
                rpc::Task {
                    name: "f".into(),
                    ..Default::default()
                },
                0,
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let tasks = f.worker.task_info().await.unwrap();
        assert_eq!(tasks.running_tasks.len(), 1);
        assert!(tasks.failed_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_ready_for_new_task_and_kill_workers() {
        let f = registered().await;
        f.worker.ready_for_new_task().await.unwrap();
        assert_eq!(f.scheduler.num_idle_workers(), 1);
        assert!(f.worker.kill_workers().await.unwrap());
        assert_eq!(f.scheduler.num_idle_workers(), 0);

        f.scheduler.set_kill_workers_result(false);
        assert!(!f.worker.kill_workers().await.unwrap());
    }

    #[tokio::test]
    async fn test_notify_failure_is_fire_and_forget() {
        let f = registered().await;
        f.worker
            .notify_failure(rpc::FailedType::FailedTask, "f", "division by zero");
        assert!(wait_for_condition(|| f.scheduler.failures().len() == 1, 2000).await);
        let failure = &f.scheduler.failures()[0];
        assert_eq!(failure.failed_type(), rpc::FailedType::FailedTask);
        assert_eq!(failure.error_message, "division by zero");

        // Delivery failure is only logged.
        f.scheduler.set_unavailable(true);
        f.worker
            .notify_failure(rpc::FailedType::FailedTask, "f", "again");
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.scheduler.set_unavailable(false);
        assert_eq!(f.scheduler.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_receiver() {
        let f = registered().await;
        let queue = f.worker.command_queue().clone();
        let receiver = std::thread::spawn(move || queue.receive());
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.worker.disconnect();
        assert!(receiver.join().unwrap().is_none());
        assert!(!f.worker.connected());
        assert!(f.worker.receive_next_message().is_none());
        assert!(matches!(
            f.worker.get_objectid().await,
            Err(WorkerError::Disconnected(_))
        ));
        f.worker.disconnect();
    }
}
