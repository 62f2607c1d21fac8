// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Logging setup using the `tracing` ecosystem.

use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Initialize logging for a worker-runtime component.
///
/// Sets up tracing-subscriber with:
/// - Environment filter (`ORCH_LOG_LEVEL`, then `RUST_LOG`, then `verbosity`)
/// - Optional append-mode file output at `<log_dir>/<component>.log`
///
/// Returns an error if the log file cannot be opened. Calling this twice is
/// harmless; the second global subscriber is ignored.
pub fn init_orch_logging(
    component: &str,
    log_dir: Option<&Path>,
    verbosity: i32,
) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_env("ORCH_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbosity)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if let Some(dir) = log_dir {
        let log_file = dir.join(format!("{component}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        let _ = subscriber.with_ansi(false).with_writer(file).try_init();
    } else {
        let _ = subscriber.try_init();
    }

    tracing::info!(component, "logging initialized");
    Ok(())
}

fn level_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=-1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}
