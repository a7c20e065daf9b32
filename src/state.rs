//! # Application State Management
//!
//! Shared state that every HTTP handler and call session can reach.
//!
//! ## The Arc<RwLock<T>> Pattern:
//! - **Arc**: Multiple handlers hold a reference to the same data
//! - **RwLock**: Multiple readers OR one writer at a time
//! - Requests read the config concurrently; metrics updates take the write
//!   lock for microseconds at a time.
//!
//! Note that the per-call session state does **not** live here. Each bridged
//! call owns its `CallSession` behind its own mutex; the only call-level fact
//! the rest of the application needs is the active-call count, which is a
//! plain metric below.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, loaded once at startup
    pub config: Arc<RwLock<AppConfig>>,

    /// Performance metrics (constantly being updated by requests)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started. Instant is Copy, so no lock is needed.
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests and call sessions.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Number of calls currently bridged to the AI channel
    pub active_calls: u32,

    /// Total number of calls bridged since server start
    pub total_calls: u64,

    /// Total caller interruptions (barge-ins) handled since server start
    pub interruption_count: u64,

    /// Per-endpoint request statistics, keyed like "GET /health"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads aren't
    /// blocked; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Try to claim a call slot.
    ///
    /// Checking the limit and incrementing the counter happen under one write
    /// lock, so two simultaneous upgrades cannot both squeeze past the limit.
    /// Returns `false` when the bridge is at capacity.
    pub fn try_begin_call(&self, max_concurrent_calls: usize) -> bool {
        let mut metrics = self.metrics.write().unwrap();
        if (metrics.active_calls as usize) >= max_concurrent_calls {
            return false;
        }
        metrics.active_calls += 1;
        metrics.total_calls += 1;
        true
    }

    /// Release a call slot when a bridged call ends.
    pub fn end_call(&self) {
        let mut metrics = self.metrics.write().unwrap();
        // underflow guard
        if metrics.active_calls > 0 {
            metrics.active_calls -= 1;
        }
    }

    pub fn record_interruption(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.interruption_count += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones under a read lock so metrics don't change while being
    /// serialized, and the lock is not held during response generation.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_calls: metrics.active_calls,
            total_calls: metrics.total_calls,
            interruption_count: metrics.interruption_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds for this endpoint.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate as a fraction between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
