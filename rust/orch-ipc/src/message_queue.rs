// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Bounded, named FIFO message queue.
//!
//! Queues live in a process-wide registry keyed by name, so independent
//! components in one process (the RPC service and the execution thread) can
//! attach to the same channel without sharing a handle. Creation is
//! attach-or-create. Shutdown is an explicit [`MessageQueue::close`]: queued
//! messages still drain in order, after which receivers observe `None`.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{IpcError, IpcResult};

type Registry = Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

struct State<T> {
    messages: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    name: String,
    capacity: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// Error returned by [`MessageQueue::try_send`]; hands the message back.
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(msg) | Self::Closed(msg) => msg,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full(_))
    }
}

impl<T> fmt::Debug for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("Full(..)"),
            Self::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(_) => f.write_str("queue is full"),
            Self::Closed(_) => f.write_str("queue is closed"),
        }
    }
}

fn check_capacity(name: &str, capacity: usize) -> IpcResult<()> {
    if capacity == 0 {
        return Err(IpcError::InvalidCapacity {
            name: name.to_string(),
            capacity,
        });
    }
    Ok(())
}

/// Handle to a named bounded FIFO queue. Cloning yields another handle to
/// the same queue.
pub struct MessageQueue<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Clone for MessageQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for MessageQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("name", &self.shared.name)
            .field("capacity", &self.shared.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T: Send + 'static> MessageQueue<T> {
    /// Attach to the queue called `name`, creating it with `capacity` slots
    /// if it does not exist yet. An existing queue keeps its original capacity.
    pub fn create(name: &str, capacity: usize) -> IpcResult<Self> {
        check_capacity(name, capacity)?;
        let mut queues = registry().lock();
        if let Some(existing) = queues.get(name) {
            tracing::debug!(queue = name, "attaching to existing queue");
            return Self::downcast(name, Arc::clone(existing));
        }
        let shared = Self::new_shared(name, capacity);
        queues.insert(
            name.to_string(),
            Arc::clone(&shared) as Arc<dyn Any + Send + Sync>,
        );
        tracing::debug!(queue = name, capacity, "created queue");
        Ok(Self { shared })
    }

    /// A queue that is not entered in the registry. Only handles cloned from
    /// the returned one reach it.
    pub fn unregistered(name: &str, capacity: usize) -> IpcResult<Self> {
        check_capacity(name, capacity)?;
        Ok(Self {
            shared: Self::new_shared(name, capacity),
        })
    }

    fn new_shared(name: &str, capacity: usize) -> Arc<Shared<T>> {
        Arc::new(Shared {
            name: name.to_string(),
            capacity,
            state: Mutex::new(State {
                messages: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Attach to an existing queue.
    pub fn open(name: &str) -> IpcResult<Self> {
        let queues = registry().lock();
        match queues.get(name) {
            Some(existing) => Self::downcast(name, Arc::clone(existing)),
            None => Err(IpcError::QueueNotFound(name.to_string())),
        }
    }

    /// Unlink `name` from the registry. Live handles keep working; later
    /// `create` calls make a fresh queue. Returns whether the name existed.
    pub fn remove(name: &str) -> bool {
        registry().lock().remove(name).is_some()
    }

    fn downcast(name: &str, any: Arc<dyn Any + Send + Sync>) -> IpcResult<Self> {
        any.downcast::<Shared<T>>()
            .map(|shared| Self { shared })
            .map_err(|_| IpcError::QueueTypeMismatch(name.to_string()))
    }

    /// Enqueue `msg`, blocking while the queue is full.
    pub fn send(&self, msg: T) -> IpcResult<()> {
        let mut state = self.shared.state.lock();
        while !state.closed && state.messages.len() >= self.shared.capacity {
            self.shared.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(IpcError::QueueClosed(self.shared.name.clone()));
        }
        state.messages.push_back(msg);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Enqueue without blocking.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TrySendError::Closed(msg));
        }
        if state.messages.len() >= self.shared.capacity {
            return Err(TrySendError::Full(msg));
        }
        state.messages.push_back(msg);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Block until a message arrives. Returns `None` once the queue is
    /// closed and drained.
    pub fn receive(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.messages.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Some(msg);
            }
            if state.closed {
                return None;
            }
            self.shared.not_empty.wait(&mut state);
        }
    }

    /// Dequeue without blocking.
    pub fn try_receive(&self) -> Option<T> {
        let msg = self.shared.state.lock().messages.pop_front();
        if msg.is_some() {
            self.shared.not_full.notify_one();
        }
        msg
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> IpcResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let Some(msg) = state.messages.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(msg);
            }
            if state.closed {
                return Err(IpcError::QueueClosed(self.shared.name.clone()));
            }
            if self
                .shared
                .not_empty
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.messages.is_empty()
            {
                return Err(if state.closed {
                    IpcError::QueueClosed(self.shared.name.clone())
                } else {
                    IpcError::TimedOut(self.shared.name.clone())
                });
            }
        }
    }

    /// Close the queue. Pending messages remain receivable; blocked senders
    /// fail and blocked receivers wake once the queue drains.
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        tracing::debug!(queue = %self.shared.name, "queue closed");
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn unique(name: &str) -> String {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        format!("test:{name}:{}", NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn test_fifo_order() {
        let q = MessageQueue::<u32>::create(&unique("fifo"), 8).unwrap();
        for i in 0..5 {
            q.send(i).unwrap();
        }
        let got: Vec<u32> = (0..5).filter_map(|_| q.try_receive()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_attach_or_create_shares_queue() {
        let name = unique("attach");
        let a = MessageQueue::<String>::create(&name, 4).unwrap();
        let b = MessageQueue::<String>::create(&name, 99).unwrap();
        assert_eq!(b.capacity(), 4);
        a.send("hello".to_string()).unwrap();
        assert_eq!(b.receive().as_deref(), Some("hello"));

        let c = MessageQueue::<String>::open(&name).unwrap();
        assert_eq!(c.name(), name);
    }

    #[test]
    fn test_open_missing_queue() {
        let err = MessageQueue::<u8>::open(&unique("missing")).unwrap_err();
        assert!(matches!(err, IpcError::QueueNotFound(_)));
    }

    #[test]
    fn test_unregistered_queue_is_private() {
        let name = unique("private");
        let q = MessageQueue::<u8>::unregistered(&name, 2).unwrap();
        q.send(7).unwrap();
        assert!(matches!(
            MessageQueue::<u8>::open(&name),
            Err(IpcError::QueueNotFound(_))
        ));
        assert_eq!(q.clone().try_receive(), Some(7));
        assert!(MessageQueue::<u8>::unregistered(&name, 0).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let name = unique("typed");
        let _q = MessageQueue::<u32>::create(&name, 2).unwrap();
        let err = MessageQueue::<String>::create(&name, 2).unwrap_err();
        assert!(matches!(err, IpcError::QueueTypeMismatch(_)));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = MessageQueue::<u8>::create(&unique("zero"), 0).unwrap_err();
        assert!(matches!(err, IpcError::InvalidCapacity { capacity: 0, .. }));
    }

    #[test]
    fn test_try_send_full_returns_message() {
        let q = MessageQueue::<u32>::create(&unique("full"), 1).unwrap();
        q.try_send(1).unwrap();
        let err = q.try_send(2).unwrap_err();
        assert!(err.is_full());
        assert_eq!(err.into_inner(), 2);
    }

    #[test]
    fn test_send_blocks_until_space() {
        let q = MessageQueue::<u32>::create(&unique("backpressure"), 1).unwrap();
        q.send(1).unwrap();

        let producer = {
            let q = q.clone();
            thread::spawn(move || q.send(2))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);

        assert_eq!(q.receive(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(q.receive(), Some(2));
    }

    #[test]
    fn test_close_wakes_blocked_receiver() {
        let q = MessageQueue::<u32>::create(&unique("close"), 4).unwrap();
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.receive())
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_close_drains_pending_then_none() {
        let q = MessageQueue::<u32>::create(&unique("drain"), 4).unwrap();
        q.send(7).unwrap();
        q.send(8).unwrap();
        q.close();
        assert!(matches!(q.send(9), Err(IpcError::QueueClosed(_))));
        assert!(matches!(q.try_send(9), Err(TrySendError::Closed(9))));
        assert_eq!(q.receive(), Some(7));
        assert_eq!(q.receive(), Some(8));
        assert_eq!(q.receive(), None);
    }

    #[test]
    fn test_close_fails_blocked_sender() {
        let q = MessageQueue::<u32>::create(&unique("blocked-send"), 1).unwrap();
        q.send(1).unwrap();
        let producer = {
            let q = q.clone();
            thread::spawn(move || q.send(2))
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(matches!(
            producer.join().unwrap(),
            Err(IpcError::QueueClosed(_))
        ));
    }

    #[test]
    fn test_receive_timeout() {
        let q = MessageQueue::<u32>::create(&unique("timeout"), 2).unwrap();
        let err = q.receive_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, IpcError::TimedOut(_)));

        q.send(5).unwrap();
        assert_eq!(q.receive_timeout(Duration::from_millis(20)).unwrap(), 5);

        q.close();
        let err = q.receive_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, IpcError::QueueClosed(_)));
    }

    #[test]
    fn test_remove_keeps_live_handles() {
        let name = unique("remove");
        let old = MessageQueue::<u32>::create(&name, 2).unwrap();
        assert!(MessageQueue::<u32>::remove(&name));
        assert!(!MessageQueue::<u32>::remove(&name));

        old.send(1).unwrap();
        assert_eq!(old.receive(), Some(1));

        let fresh = MessageQueue::<u32>::create(&name, 2).unwrap();
        old.send(2).unwrap();
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let q = MessageQueue::<(usize, usize)>::create(&unique("mpsc"), 4).unwrap();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = q.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        q.send((p, i)).unwrap();
                    }
                })
            })
            .collect();

        let mut last = [None::<usize>; 4];
        for _ in 0..400 {
            let (p, i) = q.receive().unwrap();
            // Per-producer order is preserved.
            if let Some(prev) = last[p] {
                assert!(i > prev);
            }
            last[p] = Some(i);
        }
        for p in producers {
            p.join().unwrap();
        }
        assert!(q.is_empty());
    }
}
