// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! A node-local object store served from a background thread.
//!
//! Serves the object-request socket queue over real file-backed segments in
//! a directory, bump-allocating objects into fixed-size segments. The
//! request socket lives in the same directory. Replies go to each worker's
//! reply queue, which the worker creates at registration.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use orch_common::id::{ObjStoreID, ObjectID, SegmentID, WorkerID};
use orch_ipc::object_channel::{
    objstore_reply_queue_name, objstore_request_queue_name, ObjHandle, ObjHandleStatus,
    ObjRequest, ObjRequestKind,
};
use orch_ipc::{MemorySegmentPool, SocketQueue, SocketSender};

use crate::fake_scheduler::FakeScheduler;

pub type Resolver = Arc<dyn Fn(ObjectID) -> ObjectID + Send + Sync>;
pub type FinishHook = Arc<dyn Fn(ObjectID) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct StoredObject {
    segment_id: SegmentID,
    offset: usize,
    size: usize,
    metadata_offset: usize,
    finished: bool,
}

#[derive(Debug, Default, Clone)]
pub struct StoreStats {
    pub allocs: usize,
    pub finishes: usize,
    pub gets: usize,
    pub releases: usize,
}

struct Store {
    pool: MemorySegmentPool,
    segment_size: usize,
    current_segment: Option<(SegmentID, usize)>,
    next_segment: u64,
    objects: HashMap<ObjectID, StoredObject>,
    resolver: Resolver,
    on_finish: FinishHook,
    stats: Arc<Mutex<StoreStats>>,
}

impl Store {
    fn handle(&mut self, request: &ObjRequest) -> ObjHandle {
        let id = request.object_id;
        let seq = request.seq;
        match request.kind {
            ObjRequestKind::Alloc { size } => {
                self.stats.lock().allocs += 1;
                self.alloc(seq, id, size)
            }
            ObjRequestKind::Finish {
                segment_id,
                metadata_offset,
            } => {
                self.stats.lock().finishes += 1;
                let Some(object) = self.objects.get_mut(&id) else {
                    return ObjHandle::failed(seq, id, ObjHandleStatus::NotFound);
                };
                if object.segment_id != segment_id {
                    return ObjHandle::failed(seq, id, ObjHandleStatus::NotFound);
                }
                if object.finished {
                    return ObjHandle::failed(seq, id, ObjHandleStatus::AlreadyFinished);
                }
                if metadata_offset > object.size {
                    return ObjHandle::failed(seq, id, ObjHandleStatus::InvalidMetadataOffset);
                }
                object.finished = true;
                object.metadata_offset = metadata_offset;
                let object = *object;
                (self.on_finish)(id);
                Self::ok(seq, id, &object)
            }
            ObjRequestKind::Get => {
                self.stats.lock().gets += 1;
                let target = (self.resolver)(id);
                match self.objects.get(&target) {
                    None => ObjHandle::failed(seq, id, ObjHandleStatus::NotFound),
                    Some(object) if !object.finished => {
                        ObjHandle::failed(seq, id, ObjHandleStatus::NotReady)
                    }
                    Some(object) => Self::ok(seq, id, object),
                }
            }
            ObjRequestKind::Release { .. } => {
                self.stats.lock().releases += 1;
                ObjHandle::failed(seq, id, ObjHandleStatus::Ok)
            }
        }
    }

    fn alloc(&mut self, seq: u64, id: ObjectID, size: usize) -> ObjHandle {
        if self.objects.contains_key(&id) {
            return ObjHandle::failed(seq, id, ObjHandleStatus::AlreadyAllocated);
        }
        if size > self.segment_size {
            return ObjHandle::failed(seq, id, ObjHandleStatus::AllocationFailed);
        }
        let (segment_id, offset) = match self.current_segment {
            Some((segment_id, used)) if used + size <= self.segment_size => (segment_id, used),
            _ => {
                let segment_id = SegmentID::new(self.next_segment);
                if let Err(e) = self.pool.create_segment(segment_id, self.segment_size) {
                    tracing::warn!(error = %e, "fake object store failed to create segment");
                    return ObjHandle::failed(seq, id, ObjHandleStatus::AllocationFailed);
                }
                self.next_segment += 1;
                (segment_id, 0)
            }
        };
        self.current_segment = Some((segment_id, offset + size));
        let object = StoredObject {
            segment_id,
            offset,
            size,
            metadata_offset: 0,
            finished: false,
        };
        self.objects.insert(id, object);
        Self::ok(seq, id, &object)
    }

    fn ok(seq: u64, id: ObjectID, object: &StoredObject) -> ObjHandle {
        ObjHandle {
            seq,
            object_id: id,
            segment_id: object.segment_id,
            offset: object.offset,
            size: object.size,
            metadata_offset: object.metadata_offset,
            status: ObjHandleStatus::Ok,
        }
    }
}

/// Reply senders, one connection per worker.
struct ReplySenders {
    segment_dir: PathBuf,
    address: String,
    senders: HashMap<WorkerID, SocketSender<ObjHandle>>,
}

impl ReplySenders {
    fn send(&mut self, worker_id: WorkerID, reply: ObjHandle) {
        // A worker that re-registered has a fresh reply socket.
        for _ in 0..2 {
            let sender = match self.senders.entry(worker_id) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let name = objstore_reply_queue_name(&self.address, worker_id);
                    match SocketSender::connect(&self.segment_dir, &name) {
                        Ok(sender) => entry.insert(sender),
                        Err(e) => {
                            tracing::warn!(error = %e, "no reply queue for worker");
                            return;
                        }
                    }
                }
            };
            match sender.send(reply.clone()) {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(error = %e, worker_id = %worker_id, "reconnecting reply queue");
                    self.senders.remove(&worker_id);
                }
            }
        }
        tracing::warn!(worker_id = %worker_id, "dropping object store reply");
    }
}

/// Object store serving `queue:<address>:obj` until shut down.
pub struct FakeObjectStore {
    address: String,
    requests: SocketQueue<ObjRequest>,
    stats: Arc<Mutex<StoreStats>>,
    thread: Option<JoinHandle<()>>,
}

impl FakeObjectStore {
    /// Start a store whose aliases and readiness follow `scheduler`.
    pub fn start_with_scheduler(
        address: &str,
        segment_dir: &Path,
        segment_size: usize,
        scheduler: &Arc<FakeScheduler>,
    ) -> Self {
        let resolver = {
            let scheduler = Arc::clone(scheduler);
            Arc::new(move |id: ObjectID| scheduler.resolve(id)) as Resolver
        };
        let on_finish = {
            let scheduler = Arc::clone(scheduler);
            Arc::new(move |id: ObjectID| scheduler.mark_ready(id)) as FinishHook
        };
        Self::start(
            address,
            scheduler.objstore_id(),
            segment_dir,
            segment_size,
            resolver,
            on_finish,
        )
    }

    pub fn start(
        address: &str,
        objstore_id: ObjStoreID,
        segment_dir: &Path,
        segment_size: usize,
        resolver: Resolver,
        on_finish: FinishHook,
    ) -> Self {
        let requests = SocketQueue::<ObjRequest>::create(
            segment_dir,
            &objstore_request_queue_name(address),
            1024,
        )
        .unwrap();
        let stats = Arc::new(Mutex::new(StoreStats::default()));
        let mut store = Store {
            pool: MemorySegmentPool::new(objstore_id, segment_dir),
            segment_size,
            current_segment: None,
            next_segment: 0,
            objects: HashMap::new(),
            resolver,
            on_finish,
            stats: Arc::clone(&stats),
        };
        let mut replies = ReplySenders {
            segment_dir: segment_dir.to_path_buf(),
            address: address.to_string(),
            senders: HashMap::new(),
        };
        let thread = {
            let requests = requests.clone();
            std::thread::Builder::new()
                .name("fake-objstore".to_string())
                .spawn(move || {
                    while let Some(request) = requests.receive() {
                        tracing::debug!(?request, "fake object store request");
                        let reply = store.handle(&request);
                        if request.expects_reply() {
                            replies.send(request.worker_id, reply);
                        }
                    }
                })
                .unwrap()
        };
        Self {
            address: address.to_string(),
            requests,
            stats,
            thread: Some(thread),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    /// Stop serving and join the serving thread.
    pub fn shutdown(&mut self) {
        self.requests.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FakeObjectStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
