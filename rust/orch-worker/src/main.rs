// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker binary entry point.

use std::sync::Arc;

use clap::Parser;
use orch_common::config::OrchConfig;
use orch_common::mode::Mode;
use orch_worker::{run_execution_loop, LoggingEnvironment, Worker, WorkerOptions};

#[derive(Parser, Debug)]
#[command(name = "orch-worker", about = "Task worker")]
struct Args {
    /// Node IP address (defaults to the address used for outbound traffic)
    #[arg(long)]
    node_ip_address: Option<String>,

    /// Scheduler address (host:port)
    #[arg(long)]
    scheduler_address: String,

    /// Object store address
    #[arg(long)]
    objstore_address: String,

    /// SCRIPT_MODE, WORKER_MODE, PYTHON_MODE or SILENT_MODE
    #[arg(long, default_value = "WORKER_MODE")]
    mode: Mode,

    /// Worker service port
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Log directory
    #[arg(long)]
    log_dir: Option<String>,

    /// Base64-encoded JSON config
    #[arg(long)]
    config: Option<String>,

    /// Log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    orch_util::logging::init_orch_logging(
        "orch-worker",
        args.log_dir.as_ref().map(std::path::Path::new),
        i32::from(args.verbose),
    )?;

    let config = match &args.config {
        Some(b64) => OrchConfig::from_base64_json(b64)?,
        None => OrchConfig::from_env()?,
    };
    let node_ip_address = args
        .node_ip_address
        .unwrap_or_else(|| orch_util::network::get_local_ip().to_string());

    let mut options = WorkerOptions::new(&node_ip_address, &args.scheduler_address, args.mode);
    options.port = args.port;
    options.config = config;

    let worker = Arc::new(Worker::connect(options).await?);
    worker.start_worker_service().await?;
    worker
        .register_worker(&node_ip_address, &args.objstore_address, args.mode.is_driver())
        .await?;

    let processed = {
        let worker = Arc::clone(&worker);
        tokio::task::spawn_blocking(move || {
            let mut env = LoggingEnvironment::new();
            run_execution_loop(worker.as_ref(), &mut env)
        })
        .await?
    };
    tracing::info!(processed, "worker exiting");
    worker.disconnect();
    Ok(())
}
