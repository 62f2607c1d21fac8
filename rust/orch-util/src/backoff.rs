// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Delay schedule for polling loops.

use std::time::Duration;

/// Grows a delay geometrically from `initial` and caps it at `max`.
/// Jitter, when enabled, adds up to a quarter of the delay but never
/// exceeds `max`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial: initial.min(max),
            multiplier: multiplier.max(1.0),
            max,
            attempt: 0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delays handed out since creation or the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let mut delay = if scaled.is_finite() && scaled < self.max.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max
        };
        if self.jitter {
            delay = delay.mul_f64(1.0 + rand::random::<f64>() * 0.25).min(self.max);
        }
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Next delay, shortened so a sleep never overshoots `remaining`.
    pub fn next_delay_within(&mut self, remaining: Duration) -> Duration {
        self.next_delay().min(remaining)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
