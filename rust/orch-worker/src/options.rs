// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker configuration options.

use orch_common::config::OrchConfig;
use orch_common::mode::Mode;
use orch_ipc::object_channel::command_queue_name;

/// Options for constructing a [`Worker`](crate::worker::Worker).
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub node_ip_address: String,
    pub scheduler_address: String,
    pub mode: Mode,
    /// Port of the worker service; 0 picks an ephemeral port.
    pub port: u16,
    pub command_queue_name: String,
    pub config: OrchConfig,
}

impl WorkerOptions {
    pub fn new(node_ip_address: &str, scheduler_address: &str, mode: Mode) -> Self {
        Self {
            node_ip_address: node_ip_address.to_string(),
            scheduler_address: scheduler_address.to_string(),
            mode,
            port: 0,
            command_queue_name: default_command_queue_name(node_ip_address),
            config: OrchConfig::default(),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self::new("127.0.0.1", "127.0.0.1:10001", Mode::Worker)
    }
}

fn default_command_queue_name(node_ip_address: &str) -> String {
    command_queue_name(&format!("{node_ip_address}:{}", std::process::id()))
}
