//! Connection-Metrics Collector (spec §4.F).
//!
//! Counters, rolling rates, and alert thresholds derived from connection
//! outcomes. Unlike the generic OTLP-exported latency histograms the
//! teacher's HTTP API uses for request timing, this collector's shape is
//! fixed by the spec: specific named counters and specific derived rates,
//! so it is its own small struct rather than routed through a generic
//! metrics-export trait. Internals are atomics plus one mutex-guarded
//! pending-timing table, matching the "internal counters are updated
//! atomically; the pending-timing table is guarded per connection id" rule
//! in spec §5.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// The four disjoint failure reasons the spec names (spec §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureReason {
    AuthRequired,
    AuthInvalid,
    AuthExpired,
    SessionCreateFailed,
}

/// Structured disconnect reason (SPEC_FULL §10.2), elaborating the plain
/// `recordDisconnection` counter with the event that ended the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisconnectReason {
    Normal,
    Timeout,
    AuthFailed,
    ServerShutdown,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AlertThresholds {
    pub min_success_rate: f64,
    pub max_avg_connection_time_ms: f64,
    pub max_timeout_rate: f64,
    pub alert_min_samples: u64,
}

/// A snapshot of an alert condition, returned by `check_alerts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Alert {
    LowSuccessRate { success_rate: f64, threshold: f64 },
    HighAvgConnectionTime { avg_ms: f64, threshold: f64 },
    HighTimeoutRate { timeout_rate: f64, threshold: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub total_timeouts: u64,
    pub active_connections: u64,
    pub peak_connections: u64,
    pub failures_by_reason: HashMap<String, u64>,
    pub disconnections_by_reason: HashMap<String, u64>,
    pub success_rate: f64,
    pub timeout_rate: f64,
    pub min_connection_time_ms: Option<i64>,
    pub max_connection_time_ms: Option<i64>,
    pub avg_connection_time_ms: f64,
}

struct TimingStats {
    min_ms: AtomicI64,
    max_ms: AtomicI64,
    sum_ms: AtomicI64,
    count: AtomicU64,
}

impl Default for TimingStats {
    fn default() -> Self {
        Self {
            min_ms: AtomicI64::new(i64::MAX),
            max_ms: AtomicI64::new(i64::MIN),
            sum_ms: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }
}

impl TimingStats {
    fn record(&self, duration_ms: i64) {
        self.min_ms.fetch_min(duration_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(duration_ms, Ordering::Relaxed);
        self.sum_ms.fetch_add(duration_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn avg(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            0.0
        } else {
            self.sum_ms.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    fn min(&self) -> Option<i64> {
        let v = self.min_ms.load(Ordering::Relaxed);
        (v != i64::MAX).then_some(v)
    }

    fn max(&self) -> Option<i64> {
        let v = self.max_ms.load(Ordering::Relaxed);
        (v != i64::MIN).then_some(v)
    }
}

/// The Metrics Collector (spec §4.F). One instance per process, shared via
/// `Arc` (spec §9 "global mutable state").
pub struct MetricsCollector {
    total_attempts: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    active: AtomicU64,
    peak: AtomicU64,
    failures_by_reason: Mutex<HashMap<FailureReason, u64>>,
    disconnections_by_reason: Mutex<HashMap<DisconnectReason, u64>>,
    pending: Mutex<HashMap<String, DateTime<Utc>>>,
    timing: TimingStats,
    thresholds: AlertThresholds,
}

impl MetricsCollector {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            total_attempts: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            active: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            failures_by_reason: Mutex::new(HashMap::new()),
            disconnections_by_reason: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            timing: TimingStats::default(),
            thresholds,
        }
    }

    pub fn record_attempt(&self, connection_id: &str) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap()
            .insert(connection_id.to_string(), Utc::now());
    }

    fn complete_pending(&self, connection_id: &str) {
        if let Some(started_at) = self.pending.lock().unwrap().remove(connection_id) {
            let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
            self.timing.record(elapsed_ms);
        }
    }

    pub fn record_success(&self, connection_id: &str) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.complete_pending(connection_id);
    }

    pub fn record_failure(&self, connection_id: &str, reason: FailureReason) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_reason.lock().unwrap().entry(reason).or_insert(0) += 1;
        self.complete_pending(connection_id);
    }

    pub fn record_timeout(&self, connection_id: &str) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.complete_pending(connection_id);
    }

    pub fn record_disconnection(&self, reason: DisconnectReason) {
        self.active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(1))
        }).ok();
        *self
            .disconnections_by_reason
            .lock()
            .unwrap()
            .entry(reason)
            .or_insert(0) += 1;
    }

    pub fn set_active(&self, count: u64) {
        self.active.store(count, Ordering::Relaxed);
        self.peak.fetch_max(count, Ordering::Relaxed);
    }

    /// `successRate = successful / (successful + failed)` (spec §4.F, §8
    /// invariant 8). `0.0` with no samples rather than dividing by zero.
    pub fn success_rate(&self) -> f64 {
        let successful = self.successful.load(Ordering::Relaxed) as f64;
        let failed = self.failed.load(Ordering::Relaxed) as f64;
        let denom = successful + failed;
        if denom == 0.0 {
            0.0
        } else {
            successful / denom
        }
    }

    /// `timeoutRate = totalTimeouts / totalConnectionAttempts` (spec §4.F).
    pub fn timeout_rate(&self) -> f64 {
        let attempts = self.total_attempts.load(Ordering::Relaxed) as f64;
        if attempts == 0.0 {
            0.0
        } else {
            self.timeouts.load(Ordering::Relaxed) as f64 / attempts
        }
    }

    fn sample_count(&self) -> u64 {
        self.successful.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }

    /// Each alert requires at least `alert_min_samples` samples to fire
    /// (spec §4.F).
    pub fn check_alerts(&self) -> Vec<Alert> {
        let mut alerts = Vec::new();
        if self.sample_count() < self.thresholds.alert_min_samples {
            return alerts;
        }

        let success_rate = self.success_rate();
        if success_rate < self.thresholds.min_success_rate {
            alerts.push(Alert::LowSuccessRate {
                success_rate,
                threshold: self.thresholds.min_success_rate,
            });
        }

        let avg_ms = self.timing.avg();
        if avg_ms > self.thresholds.max_avg_connection_time_ms {
            alerts.push(Alert::HighAvgConnectionTime {
                avg_ms,
                threshold: self.thresholds.max_avg_connection_time_ms,
            });
        }

        let timeout_rate = self.timeout_rate();
        if timeout_rate > self.thresholds.max_timeout_rate {
            alerts.push(Alert::HighTimeoutRate {
                timeout_rate,
                threshold: self.thresholds.max_timeout_rate,
            });
        }

        alerts
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let failures_by_reason = self
            .failures_by_reason
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, count)| (format!("{reason:?}"), *count))
            .collect();
        let disconnections_by_reason = self
            .disconnections_by_reason
            .lock()
            .unwrap()
            .iter()
            .map(|(reason, count)| (format!("{reason:?}"), *count))
            .collect();

        MetricsSnapshot {
            total_connection_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_connections: self.successful.load(Ordering::Relaxed),
            failed_connections: self.failed.load(Ordering::Relaxed),
            total_timeouts: self.timeouts.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
            peak_connections: self.peak.load(Ordering::Relaxed),
            failures_by_reason,
            disconnections_by_reason,
            success_rate: self.success_rate(),
            timeout_rate: self.timeout_rate(),
            min_connection_time_ms: self.timing.min(),
            max_connection_time_ms: self.timing.max(),
            avg_connection_time_ms: self.timing.avg(),
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.95,
            max_avg_connection_time_ms: 3_000.0,
            max_timeout_rate: 0.05,
            alert_min_samples: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_exact_after_a_finite_sequence_of_events() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        metrics.record_attempt("a");
        metrics.record_success("a");
        metrics.record_attempt("b");
        metrics.record_failure("b", FailureReason::AuthRequired);
        metrics.record_attempt("c");
        metrics.record_success("c");

        assert_eq!(metrics.success_rate(), 2.0 / 3.0);
    }

    #[test]
    fn timeout_rate_divides_by_total_attempts_not_by_completions() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        metrics.record_attempt("a");
        metrics.record_timeout("a");
        metrics.record_attempt("b");
        metrics.record_success("b");

        assert_eq!(metrics.timeout_rate(), 0.5);
    }

    #[test]
    fn peak_never_drops_below_a_historical_active_count() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        metrics.set_active(5);
        metrics.set_active(2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_connections, 2);
        assert_eq!(snapshot.peak_connections, 5);
    }

    #[test]
    fn alerts_do_not_fire_below_the_minimum_sample_count() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        for i in 0..5 {
            let id = format!("conn-{i}");
            metrics.record_attempt(&id);
            metrics.record_failure(&id, FailureReason::AuthInvalid);
        }
        assert!(metrics.check_alerts().is_empty());
    }

    #[test]
    fn low_success_rate_alert_fires_once_min_samples_are_met() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        for i in 0..12 {
            let id = format!("conn-{i}");
            metrics.record_attempt(&id);
            if i < 2 {
                metrics.record_success(&id);
            } else {
                metrics.record_failure(&id, FailureReason::AuthInvalid);
            }
        }
        let alerts = metrics.check_alerts();
        assert!(alerts
            .iter()
            .any(|a| matches!(a, Alert::LowSuccessRate { .. })));
    }

    #[test]
    fn disconnections_by_reason_are_broken_down_independently() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        metrics.record_disconnection(DisconnectReason::Normal);
        metrics.record_disconnection(DisconnectReason::Timeout);
        metrics.record_disconnection(DisconnectReason::Timeout);
        metrics.record_disconnection(DisconnectReason::ServerShutdown);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.disconnections_by_reason.get("Normal"), Some(&1));
        assert_eq!(snapshot.disconnections_by_reason.get("Timeout"), Some(&2));
        assert_eq!(
            snapshot.disconnections_by_reason.get("ServerShutdown"),
            Some(&1)
        );
    }

    #[test]
    fn failures_by_reason_are_broken_down_independently() {
        let metrics = MetricsCollector::new(AlertThresholds::default());
        metrics.record_attempt("a");
        metrics.record_failure("a", FailureReason::AuthExpired);
        metrics.record_attempt("b");
        metrics.record_failure("b", FailureReason::AuthExpired);
        metrics.record_attempt("c");
        metrics.record_failure("c", FailureReason::SessionCreateFailed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failures_by_reason.get("AuthExpired"), Some(&2));
        assert_eq!(
            snapshot.failures_by_reason.get("SessionCreateFailed"),
            Some(&1)
        );
    }
}
