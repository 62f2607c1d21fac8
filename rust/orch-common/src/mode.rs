// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Operating mode of a worker process.
//!
//! The mode only changes how failures are printed. It never changes the
//! protocol spoken with the scheduler or the object store.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A driver running a script.
    Script,
    /// A worker process fed by the scheduler.
    Worker,
    /// A driver attached to an interactive shell.
    Interactive,
    /// A driver that prints nothing.
    Silent,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "SCRIPT_MODE",
            Self::Worker => "WORKER_MODE",
            Self::Interactive => "PYTHON_MODE",
            Self::Silent => "SILENT_MODE",
        }
    }

    /// Every mode other than `Worker` belongs to a driver.
    pub fn is_driver(&self) -> bool {
        !matches!(self, Self::Worker)
    }

    /// Whether error messages pushed by the scheduler are printed right away.
    pub fn prints_errors(&self) -> bool {
        matches!(self, Self::Script | Self::Interactive)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SCRIPT_MODE" | "SCRIPT" => Ok(Self::Script),
            "WORKER_MODE" | "WORKER" => Ok(Self::Worker),
            "PYTHON_MODE" | "INTERACTIVE_MODE" | "INTERACTIVE" => Ok(Self::Interactive),
            "SILENT_MODE" | "SILENT" => Ok(Self::Silent),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}
