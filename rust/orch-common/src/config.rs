// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Worker runtime configuration.
//!
//! A plain struct with defaults that supports:
//! - Base64-encoded JSON config string from the launcher
//! - Environment variable overrides: `ORCH_<field_name>`

use std::time::Duration;

/// Worker runtime configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchConfig {
    // ─── Task submission ──────────────────────────────────────
    pub submit_task_max_retries: u32,
    pub submit_task_retry_wait_ms: u64,

    // ─── Queues ───────────────────────────────────────────────
    pub command_queue_capacity: usize,
    pub objstore_queue_capacity: usize,
    pub objstore_reply_timeout_ms: u64,

    // ─── Scheduler RPC ────────────────────────────────────────
    pub scheduler_rpc_timeout_ms: u64,
    pub scheduler_connect_timeout_ms: u64,

    // ─── Shared memory ────────────────────────────────────────
    pub segment_directory: String,

    // ─── Wait polling ─────────────────────────────────────────
    pub wait_poll_initial_ms: u64,
    pub wait_poll_max_ms: u64,
}

impl Default for OrchConfig {
    fn default() -> Self {
        Self {
            submit_task_max_retries: 10,
            submit_task_retry_wait_ms: 500,
            command_queue_capacity: 1024,
            objstore_queue_capacity: 1024,
            objstore_reply_timeout_ms: 30_000,
            scheduler_rpc_timeout_ms: 30_000,
            scheduler_connect_timeout_ms: 5_000,
            segment_directory: "/dev/shm".to_string(),
            wait_poll_initial_ms: 1,
            wait_poll_max_ms: 100,
        }
    }
}

impl OrchConfig {
    /// Parse from base64-encoded JSON (as passed on the command line).
    pub fn from_base64_json(b64: &str) -> Result<Self, String> {
        let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
            .map_err(|e| format!("base64 decode error: {e}"))?;
        let json_str =
            String::from_utf8(decoded).map_err(|e| format!("UTF-8 decode error: {e}"))?;
        Self::from_json(&json_str)
    }

    /// Parse from a JSON string, then apply environment overrides.
    pub fn from_json(json: &str) -> Result<Self, String> {
        let map: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(json).map_err(|e| format!("JSON parse error: {e}"))?;

        let mut config = Self::default();

        macro_rules! set_field {
            ($field:ident, u64) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = v;
                }
            };
            ($field:ident, u32) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = u32::try_from(v)
                        .map_err(|_| format!("{} out of range: {v}", stringify!($field)))?;
                }
            };
            ($field:ident, usize) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_u64()) {
                    config.$field = usize::try_from(v)
                        .map_err(|_| format!("{} out of range: {v}", stringify!($field)))?;
                }
            };
            ($field:ident, String) => {
                if let Some(v) = map.get(stringify!($field)).and_then(|v| v.as_str()) {
                    config.$field = v.to_string();
                }
            };
        }

        set_field!(submit_task_max_retries, u32);
        set_field!(submit_task_retry_wait_ms, u64);
        set_field!(command_queue_capacity, usize);
        set_field!(objstore_queue_capacity, usize);
        set_field!(objstore_reply_timeout_ms, u64);
        set_field!(scheduler_rpc_timeout_ms, u64);
        set_field!(scheduler_connect_timeout_ms, u64);
        set_field!(segment_directory, String);
        set_field!(wait_poll_initial_ms, u64);
        set_field!(wait_poll_max_ms, u64);

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated like [`Self::from_json`].
    pub fn from_env() -> Result<Self, String> {
        Self::from_overrides(|key| std::env::var(key).ok())
    }

    /// Defaults plus overrides looked up by `ORCH_<name>` key.
    pub fn from_overrides(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut config = Self::default();
        config.apply_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides of the form `ORCH_<name>`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        macro_rules! env_override {
            ($field:ident, parse) => {
                let env_key = concat!("ORCH_", stringify!($field));
                if let Some(val) = lookup(env_key) {
                    match val.parse() {
                        Ok(v) => self.$field = v,
                        Err(_) => tracing::warn!(key = env_key, value = %val, "ignoring bad config override"),
                    }
                }
            };
            ($field:ident, String) => {
                let env_key = concat!("ORCH_", stringify!($field));
                if let Some(val) = lookup(env_key) {
                    self.$field = val;
                }
            };
        }

        env_override!(submit_task_max_retries, parse);
        env_override!(submit_task_retry_wait_ms, parse);
        env_override!(command_queue_capacity, parse);
        env_override!(objstore_queue_capacity, parse);
        env_override!(objstore_reply_timeout_ms, parse);
        env_override!(scheduler_rpc_timeout_ms, parse);
        env_override!(scheduler_connect_timeout_ms, parse);
        env_override!(segment_directory, String);
        env_override!(wait_poll_initial_ms, parse);
        env_override!(wait_poll_max_ms, parse);
    }

    /// Reject zero capacities and inverted wait-poll bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.command_queue_capacity == 0 || self.objstore_queue_capacity == 0 {
            return Err("queue capacities must be positive".to_string());
        }
        if self.wait_poll_initial_ms > self.wait_poll_max_ms {
            return Err(format!(
                "wait_poll_initial_ms ({}) exceeds wait_poll_max_ms ({})",
                self.wait_poll_initial_ms, self.wait_poll_max_ms
            ));
        }
        Ok(())
    }

    pub fn submit_task_retry_wait(&self) -> Duration {
        Duration::from_millis(self.submit_task_retry_wait_ms)
    }

    pub fn objstore_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.objstore_reply_timeout_ms)
    }

    pub fn scheduler_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_rpc_timeout_ms)
    }

    pub fn scheduler_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler_connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchConfig::default();
        assert_eq!(config.submit_task_max_retries, 10);
        assert_eq!(config.submit_task_retry_wait(), Duration::from_millis(500));
        assert_eq!(config.segment_directory, "/dev/shm");
    }

    #[test]
    fn test_json_parse() {
        let json = r#"{"submit_task_max_retries": 3, "segment_directory": "/tmp/seg"}"#;
        let config = OrchConfig::from_json(json).unwrap();
        assert_eq!(config.submit_task_max_retries, 3);
        assert_eq!(config.segment_directory, "/tmp/seg");
        assert_eq!(config.command_queue_capacity, 1024);
    }

    #[test]
    fn test_base64_json() {
        use base64::Engine;
        let json = r#"{"command_queue_capacity": 8}"#;
        let b64 = base64::engine::general_purpose::STANDARD.encode(json);
        let config = OrchConfig::from_base64_json(&b64).unwrap();
        assert_eq!(config.command_queue_capacity, 8);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = OrchConfig::from_json(r#"{"objstore_queue_capacity": 0}"#).unwrap_err();
        assert!(err.contains("capacities"));
    }

    #[test]
    fn test_rejects_inverted_poll_bounds() {
        let json = r#"{"wait_poll_initial_ms": 50, "wait_poll_max_ms": 10}"#;
        assert!(OrchConfig::from_json(json).is_err());
    }

    #[test]
    fn test_overrides_are_validated() {
        let lookup = |key: &str| match key {
            "ORCH_command_queue_capacity" => Some("0".to_string()),
            _ => None,
        };
        let err = OrchConfig::from_overrides(lookup).unwrap_err();
        assert!(err.contains("capacities"));

        let lookup = |key: &str| match key {
            "ORCH_wait_poll_initial_ms" => Some("5000".to_string()),
            "ORCH_wait_poll_max_ms" => Some("10".to_string()),
            _ => None,
        };
        assert!(OrchConfig::from_overrides(lookup).is_err());
    }

    #[test]
    fn test_overrides_apply_and_ignore_bad_values() {
        let lookup = |key: &str| match key {
            "ORCH_objstore_reply_timeout_ms" => Some("250".to_string()),
            "ORCH_submit_task_max_retries" => Some("many".to_string()),
            "ORCH_segment_directory" => Some("/tmp/orch".to_string()),
            _ => None,
        };
        let config = OrchConfig::from_overrides(lookup).unwrap();
        assert_eq!(config.objstore_reply_timeout(), Duration::from_millis(250));
        assert_eq!(config.submit_task_max_retries, 10);
        assert_eq!(config.segment_directory, "/tmp/orch");
    }

    #[test]
    fn test_invalid_json() {
        assert!(OrchConfig::from_json("not json").is_err());
    }
}
