// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Shared test helpers for orch crates.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod fake_object_store;
pub mod fake_scheduler;
pub mod wait;

pub use fake_object_store::FakeObjectStore;
pub use fake_scheduler::{FakeScheduler, FakeSchedulerService, SchedulerCall};

/// Initialize tracing for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

/// Create a temporary directory for test data.
pub fn test_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// A unique name for a test queue or address within this process.
pub fn unique_name(prefix: &str) -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(0);
    format!(
        "{prefix}-{}-{}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    )
}

/// A fake scheduler served over gRPC on a random local port.
pub struct TestSchedulerServer {
    pub addr: SocketAddr,
    pub shutdown_tx: oneshot::Sender<()>,
    pub join_handle: JoinHandle<()>,
}

/// Serve `scheduler` through the tonic `SchedulerService` on 127.0.0.1:0.
pub async fn start_test_scheduler_server(scheduler: Arc<FakeScheduler>) -> TestSchedulerServer {
    use orch_proto::rpc::scheduler_service_server::SchedulerServiceServer;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
        tonic::transport::Server::builder()
            .add_service(SchedulerServiceServer::new(FakeSchedulerService(scheduler)))
            .serve_with_incoming_shutdown(incoming, async {
                shutdown_rx.await.ok();
            })
            .await
            .unwrap();
    });

    TestSchedulerServer {
        addr,
        shutdown_tx,
        join_handle,
    }
}
