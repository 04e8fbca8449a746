//! Graceful degradation controller: maintains an aggregate picture of
//! dependency health, derives an overall `DegradationMode`, gates individual
//! operations against that mode, and holds a FIFO queue of work deferred
//! while a dependency is impaired.

use dashmap::DashMap;
use serde_json::Value;
use shared_types::DegradationMode;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Point-in-time health reading for one dependency, the raw inputs the
/// per-service degradation level is derived from.
#[derive(Debug, Clone, Copy)]
pub struct ServiceStatus {
    pub available: bool,
    pub response_time: Duration,
    pub error_rate: f64,
    pub cb_open: bool,
}

impl ServiceStatus {
    pub fn healthy() -> Self {
        Self { available: true, response_time: Duration::from_millis(0), error_rate: 0.0, cb_open: false }
    }

    /// Per-service degradation level in `[0,1]`, per the configured
    /// thresholds: unavailable or breaker-open dominates everything else.
    pub fn degradation_level(&self) -> f64 {
        if !self.available || self.cb_open {
            1.0
        } else if self.error_rate >= 0.5 {
            0.8
        } else if self.error_rate >= 0.2 {
            0.5
        } else if self.response_time > Duration::from_secs(5) {
            0.3
        } else {
            0.1 * self.error_rate
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::healthy()
    }
}

/// The kind of operation a caller wants to run, used by the gate to decide
/// whether a disallowed operation should be queued or rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

/// What the gate recommends doing with an operation it won't allow through
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackAction {
    Queue,
    Reject,
}

#[derive(Debug, Clone)]
pub struct GateDecision {
    pub allowed: bool,
    pub fallback: Option<FallbackAction>,
    /// Set when the service was fully degraded but a registered fallback
    /// handler produced a synthetic result instead of failing outright.
    pub fallback_used: bool,
    pub fallback_value: Option<Value>,
}

impl GateDecision {
    fn allow() -> Self {
        Self { allowed: true, fallback: None, fallback_used: false, fallback_value: None }
    }

    fn deny(fallback: FallbackAction) -> Self {
        Self { allowed: false, fallback: Some(fallback), fallback_used: false, fallback_value: None }
    }

    fn synthetic(value: Value) -> Self {
        Self { allowed: true, fallback: None, fallback_used: true, fallback_value: Some(value) }
    }
}

/// One piece of work deferred while the controller is in ReadOnly/Offline
/// mode. Higher `priority` drains first; `attempts` is capped at 3 before
/// the entry is discarded.
#[derive(Debug, Clone)]
pub struct DeferredOp {
    pub service: String,
    pub description: String,
    pub priority: u8,
    pub attempts: u32,
}

const MAX_DEFERRED_ATTEMPTS: u32 = 3;

/// The set of dependencies whose unavailability counts extra heavily toward
/// Offline/Emergency, per the mode-selection formula.
fn critical_services() -> HashSet<&'static str> {
    ["tenant_data", "sms_gateway", "persistence"].into_iter().collect()
}

pub struct DegradationController {
    services: Arc<DashMap<String, ServiceStatus>>,
    fallbacks: Arc<DashMap<String, Arc<dyn Fn() -> Value + Send + Sync>>>,
    deferred: Mutex<VecDeque<DeferredOp>>,
}

impl DegradationController {
    pub fn new() -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            fallbacks: Arc::new(DashMap::new()),
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    pub fn report_status(&self, service: &str, status: ServiceStatus) {
        let level_before = self.services.get(service).map(|s| s.degradation_level());
        self.services.insert(service.to_string(), status);
        let level_after = status.degradation_level();
        if level_before.map(|l| l != level_after).unwrap_or(true) {
            if level_after >= 0.8 {
                warn!(service, level = level_after, "dependency severely degraded");
            } else if level_after > 0.1 {
                info!(service, level = level_after, "dependency degradation level changed");
            }
        }
    }

    /// Registers a synthetic-result producer for a service, consulted by
    /// `can_execute` when that service is fully degraded (`level = 1.0`).
    pub fn register_fallback(&self, service: &str, handler: Arc<dyn Fn() -> Value + Send + Sync>) {
        self.fallbacks.insert(service.to_string(), handler);
    }

    fn level_of(&self, service: &str) -> f64 {
        self.services.get(service).map(|s| s.degradation_level()).unwrap_or(0.0)
    }

    /// Recomputes the aggregate mode from every reported service's
    /// degradation level.
    pub fn current_mode(&self) -> DegradationMode {
        let critical = critical_services();
        let total = self.services.len().max(1);
        let critical_total = self.services.len().max(critical.len());
        let _ = critical_total;

        let c = self
            .services
            .iter()
            .filter(|e| critical.contains(e.key().as_str()) && e.value().degradation_level() > 0.8)
            .count();
        let s = self.services.iter().filter(|e| e.value().degradation_level() > 0.8).count();
        let t = total as f64;

        if c >= 2 || (s as f64) >= 0.7 * t {
            DegradationMode::Emergency
        } else if c >= 1 || (s as f64) >= 0.5 * t {
            DegradationMode::Offline
        } else if (s as f64) >= 0.3 * t {
            DegradationMode::ReadOnly
        } else if s > 0 {
            DegradationMode::Partial
        } else {
            DegradationMode::Full
        }
    }

    /// Whether the engine may still auto-send AI-generated replies in the
    /// current mode.
    pub fn allows_auto_send(&self) -> bool {
        matches!(self.current_mode(), DegradationMode::Full)
    }

    /// Decides whether an operation against `service` may run now.
    pub fn can_execute(&self, service: &str, op: OperationKind, emergency: bool) -> GateDecision {
        let level = self.level_of(service);
        if level >= 1.0 {
            if let Some(handler) = self.fallbacks.get(service) {
                return GateDecision::synthetic(handler());
            }
        }

        match self.current_mode() {
            DegradationMode::Full | DegradationMode::Partial => GateDecision::allow(),
            DegradationMode::ReadOnly => match op {
                OperationKind::Read => GateDecision::allow(),
                OperationKind::Write => GateDecision::deny(FallbackAction::Queue),
            },
            DegradationMode::Offline => GateDecision::deny(FallbackAction::Queue),
            DegradationMode::Emergency => {
                if emergency {
                    GateDecision::allow()
                } else {
                    GateDecision::deny(FallbackAction::Reject)
                }
            }
        }
    }

    pub async fn defer(&self, service: &str, description: &str, priority: u8) {
        let mut queue = self.deferred.lock().await;
        queue.push_back(DeferredOp {
            service: service.to_string(),
            description: description.to_string(),
            priority,
            attempts: 0,
        });
    }

    pub async fn deferred_count(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Drains the deferred queue, highest-priority first, calling `retry_fn`
    /// on each entry. An entry that keeps failing is retried at most
    /// `MAX_DEFERRED_ATTEMPTS` times before being discarded.
    pub async fn drain_deferred<F>(&self, mut retry_fn: F) -> Vec<DeferredOp>
    where
        F: FnMut(&DeferredOp) -> bool,
    {
        let mut queue = self.deferred.lock().await;
        let mut ordered: Vec<DeferredOp> = queue.drain(..).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut discarded = Vec::new();
        for mut op in ordered {
            if retry_fn(&op) {
                continue;
            }
            op.attempts += 1;
            if op.attempts >= MAX_DEFERRED_ATTEMPTS {
                discarded.push(op);
            } else {
                queue.push_back(op);
            }
        }
        discarded
    }

    pub fn snapshot(&self) -> Vec<(String, f64)> {
        self.services.iter().map(|e| (e.key().clone(), e.value().degradation_level())).collect()
    }
}

impl Default for DegradationController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(level: f64) -> ServiceStatus {
        // Constructs a status whose degradation_level() is exactly one of
        // the formula's discrete outputs, keyed off the input thresholds
        // rather than trying to hit an arbitrary float.
        match level {
            l if l >= 1.0 => ServiceStatus { available: false, ..ServiceStatus::healthy() },
            l if l >= 0.8 => ServiceStatus { error_rate: 0.6, ..ServiceStatus::healthy() },
            l if l >= 0.5 => ServiceStatus { error_rate: 0.3, ..ServiceStatus::healthy() },
            l if l >= 0.3 => ServiceStatus { response_time: Duration::from_secs(6), ..ServiceStatus::healthy() },
            _ => ServiceStatus::healthy(),
        }
    }

    #[test]
    fn all_healthy_is_full_mode() {
        let ctrl = DegradationController::new();
        ctrl.report_status("llm", status(0.0));
        ctrl.report_status("sms_gateway", status(0.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Full);
        assert!(ctrl.allows_auto_send());
    }

    #[test]
    fn one_of_four_severely_degraded_is_partial() {
        let ctrl = DegradationController::new();
        ctrl.report_status("llm", status(0.8));
        ctrl.report_status("sms_gateway", status(0.0));
        ctrl.report_status("tenant_data", status(0.0));
        ctrl.report_status("notifications", status(0.0));
        // s=1, t=4 -> 0.25, below the 0.3 ReadOnly threshold -> Partial
        assert_eq!(ctrl.current_mode(), DegradationMode::Partial);
        assert!(!ctrl.allows_auto_send());
    }

    #[test]
    fn two_of_four_severely_degraded_crosses_into_read_only() {
        let ctrl = DegradationController::new();
        ctrl.report_status("llm", status(0.8));
        ctrl.report_status("notifications", status(0.8));
        ctrl.report_status("tenant_data", status(0.0));
        ctrl.report_status("sms_gateway", status(0.0));
        // s=2, t=4 -> 0.5 >= 0.5 threshold for Offline via S, but C (critical
        // count among tenant_data/sms_gateway/persistence) is 0 here, so the
        // S>=0.5*T branch fires Offline.
        assert_eq!(ctrl.current_mode(), DegradationMode::Offline);
    }

    #[test]
    fn one_critical_service_unavailable_forces_offline() {
        let ctrl = DegradationController::new();
        ctrl.report_status("tenant_data", status(1.0));
        ctrl.report_status("llm", status(0.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Offline);
    }

    #[test]
    fn two_critical_services_unavailable_is_emergency() {
        let ctrl = DegradationController::new();
        ctrl.report_status("tenant_data", status(1.0));
        ctrl.report_status("sms_gateway", status(1.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Emergency);
    }

    #[test]
    fn recovery_returns_to_full() {
        let ctrl = DegradationController::new();
        ctrl.report_status("llm", status(0.8));
        ctrl.report_status("sms_gateway", status(0.0));
        ctrl.report_status("tenant_data", status(0.0));
        ctrl.report_status("notifications", status(0.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Partial);
        ctrl.report_status("llm", status(0.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Full);
    }

    #[tokio::test]
    async fn gate_allows_reads_but_queues_writes_in_read_only_mode() {
        let ctrl = DegradationController::new();
        ctrl.report_status("tenant_data", status(0.3));
        ctrl.report_status("llm", status(0.0));
        ctrl.report_status("sms_gateway", status(0.0));
        ctrl.report_status("notifications", status(0.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::ReadOnly);

        let read = ctrl.can_execute("tenant_data", OperationKind::Read, false);
        assert!(read.allowed);
        let write = ctrl.can_execute("tenant_data", OperationKind::Write, false);
        assert!(!write.allowed);
        assert_eq!(write.fallback, Some(FallbackAction::Queue));
    }

    #[tokio::test]
    async fn gate_rejects_non_emergency_ops_in_emergency_mode() {
        let ctrl = DegradationController::new();
        ctrl.report_status("tenant_data", status(1.0));
        ctrl.report_status("sms_gateway", status(1.0));
        assert_eq!(ctrl.current_mode(), DegradationMode::Emergency);

        let normal = ctrl.can_execute("llm", OperationKind::Write, false);
        assert!(!normal.allowed);
        assert_eq!(normal.fallback, Some(FallbackAction::Reject));

        let emergency = ctrl.can_execute("llm", OperationKind::Write, true);
        assert!(emergency.allowed);
    }

    #[tokio::test]
    async fn fallback_handler_produces_synthetic_result_for_fully_degraded_service() {
        let ctrl = DegradationController::new();
        ctrl.report_status("tenant_data", status(1.0));
        ctrl.register_fallback("tenant_data", Arc::new(|| serde_json::json!({"cached": true})));

        let decision = ctrl.can_execute("tenant_data", OperationKind::Read, false);
        assert!(decision.allowed);
        assert!(decision.fallback_used);
        assert_eq!(decision.fallback_value, Some(serde_json::json!({"cached": true})));
    }

    #[tokio::test]
    async fn deferred_queue_drains_highest_priority_first_and_caps_attempts() {
        let ctrl = DegradationController::new();
        ctrl.defer("sms_gateway", "low priority retry", 1).await;
        ctrl.defer("sms_gateway", "high priority retry", 9).await;
        assert_eq!(ctrl.deferred_count().await, 2);

        let mut order = Vec::new();
        for _ in 0..3 {
            let discarded = ctrl
                .drain_deferred(|op| {
                    order.push(op.description.clone());
                    false
                })
                .await;
            if !discarded.is_empty() {
                assert_eq!(discarded.len(), 2);
                break;
            }
        }
        assert_eq!(order[0], "high priority retry");
        assert_eq!(ctrl.deferred_count().await, 0);
    }
}
