//! Connection Health Check Module
//!
//! Tracks keepalive round-trip latency for a session and classifies the
//! connection for UI display. Samples are kept in memory only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Connection health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// High latency
    Degraded,
    /// Very high latency
    Unhealthy,
}

/// One latency measurement with its derived classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub latency_ms: u64,
    /// Average over the rolling sample window
    pub avg_latency_ms: u64,
    pub status: HealthStatus,
    pub sampled_at: DateTime<Utc>,
}

/// Health check thresholds
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Latency above this is considered degraded (ms)
    pub degraded_latency_ms: u64,
    /// Average above this is considered degraded (ms)
    pub degraded_avg_ms: u64,
    /// Latency above this is considered unhealthy (ms)
    pub unhealthy_latency_ms: u64,
    /// Average above this is considered unhealthy (ms)
    pub unhealthy_avg_ms: u64,
    /// Number of latency samples to average
    pub latency_sample_count: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_latency_ms: 500,
            degraded_avg_ms: 200,
            unhealthy_latency_ms: 1000,
            unhealthy_avg_ms: 500,
            latency_sample_count: 10,
        }
    }
}

impl HealthThresholds {
    pub fn classify(&self, latency_ms: u64, avg_latency_ms: u64) -> HealthStatus {
        if latency_ms > self.unhealthy_latency_ms || avg_latency_ms > self.unhealthy_avg_ms {
            HealthStatus::Unhealthy
        } else if latency_ms > self.degraded_latency_ms || avg_latency_ms > self.degraded_avg_ms {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Rolling latency window for one session
#[derive(Debug)]
pub struct HealthTracker {
    samples: VecDeque<u64>,
    thresholds: HealthThresholds,
    last: Option<HealthSample>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::with_thresholds(HealthThresholds::default())
    }

    pub fn with_thresholds(thresholds: HealthThresholds) -> Self {
        Self {
            samples: VecDeque::with_capacity(thresholds.latency_sample_count),
            thresholds,
            last: None,
        }
    }

    /// Add a probe result and return the resulting sample
    pub fn record(&mut self, latency_ms: u64) -> HealthSample {
        if self.samples.len() >= self.thresholds.latency_sample_count {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);

        let avg_latency_ms = self.samples.iter().sum::<u64>() / self.samples.len() as u64;
        let sample = HealthSample {
            latency_ms,
            avg_latency_ms,
            status: self.thresholds.classify(latency_ms, avg_latency_ms),
            sampled_at: Utc::now(),
        };
        self.last = Some(sample.clone());
        sample
    }

    pub fn last(&self) -> Option<&HealthSample> {
        self.last.as_ref()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last = None;
    }
}
