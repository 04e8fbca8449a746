//! Tracks how long each active workflow has gone without a customer
//! response, warns as it nears the escalation threshold, and flags expired
//! workflows for the escalation engine to act on. Runs as a periodic
//! background scan, independent from the approval queue's own timeout sweep.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use shared_types::{TimeoutState, WorkflowId, WorkflowTimeout};
use std::sync::Arc;
use tracing::{info, warn};

/// Fraction of the total threshold treated as the warning window, e.g. for a
/// 36h threshold the last 6h (1/6th) triggers a warning.
const WARNING_WINDOW_FRACTION: f64 = 1.0 / 6.0;

pub struct TimeoutMonitor {
    timeout_seconds: i64,
    active: Arc<DashMap<WorkflowId, WorkflowTimeout>>,
}

pub struct TimeoutScanResult {
    pub expired: Vec<WorkflowTimeout>,
    pub warnings: Vec<WorkflowTimeout>,
}

impl TimeoutMonitor {
    pub fn new(timeout_hours: u64) -> Self {
        Self {
            timeout_seconds: (timeout_hours as i64) * 3600,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn register_workflow(&self, workflow_id: WorkflowId, customer_phone: String) {
        let now = Utc::now();
        self.active.insert(
            workflow_id,
            WorkflowTimeout {
                workflow_id,
                customer_phone,
                last_ai_response: now,
                threshold_seconds: self.timeout_seconds,
                state: TimeoutState::Active,
                warning_sent: false,
                escalation_triggered: false,
                created_at: now,
                updated_at: now,
            },
        );
    }

    /// Resets the clock for `workflow_id`: called whenever the AI sends a new
    /// message, since the timeout measures silence since the last outbound
    /// response, not overall conversation age.
    pub fn update_workflow_response(&self, workflow_id: WorkflowId) {
        if let Some(mut entry) = self.active.get_mut(&workflow_id) {
            let now = Utc::now();
            entry.last_ai_response = now;
            entry.updated_at = now;
            entry.state = TimeoutState::Active;
            entry.warning_sent = false;
        }
    }

    pub fn remove_workflow(&self, workflow_id: WorkflowId) {
        self.active.remove(&workflow_id);
    }

    pub fn customer_phone(&self, workflow_id: WorkflowId) -> Option<String> {
        self.active.get(&workflow_id).map(|e| e.customer_phone.clone())
    }

    fn is_warning_threshold(&self, timeout: &WorkflowTimeout, now: DateTime<Utc>) -> bool {
        let elapsed = (now - timeout.last_ai_response).num_seconds();
        let remaining = timeout.threshold_seconds - elapsed;
        let warning_window = (timeout.threshold_seconds as f64 * WARNING_WINDOW_FRACTION) as i64;
        remaining <= warning_window && remaining > 0
    }

    fn is_expired(&self, timeout: &WorkflowTimeout, now: DateTime<Utc>) -> bool {
        let elapsed = (now - timeout.last_ai_response).num_seconds();
        elapsed >= timeout.threshold_seconds
    }

    /// Scans every active workflow, mutating status/flags in place, and
    /// returns the set that crossed into warning or expired this scan.
    pub fn check_timeouts(&self) -> TimeoutScanResult {
        let now = Utc::now();
        let mut expired = Vec::new();
        let mut warnings = Vec::new();

        for mut entry in self.active.iter_mut() {
            if entry.escalation_triggered {
                continue;
            }
            if self.is_expired(&entry, now) {
                entry.state = TimeoutState::Expired;
                entry.updated_at = now;
                expired.push(entry.clone());
            } else if self.is_warning_threshold(&entry, now) && !entry.warning_sent {
                entry.state = TimeoutState::Warning;
                entry.warning_sent = true;
                entry.updated_at = now;
                warnings.push(entry.clone());
            }
        }

        if !expired.is_empty() {
            warn!(count = expired.len(), "workflows crossed the response timeout");
        }
        TimeoutScanResult { expired, warnings }
    }

    /// Marks a workflow as escalated; idempotent, since both a trigger-based
    /// and a timeout-based escalation path may race to call this.
    pub fn mark_workflow_escalated(&self, workflow_id: WorkflowId) {
        if let Some(mut entry) = self.active.get_mut(&workflow_id) {
            entry.escalation_triggered = true;
            entry.state = TimeoutState::Escalated;
            entry.updated_at = Utc::now();
        }
    }

    pub fn get_timeout_statistics(&self) -> TimeoutStatistics {
        let mut stats = TimeoutStatistics::default();
        for entry in self.active.iter() {
            stats.total += 1;
            match entry.state {
                TimeoutState::Active => stats.active += 1,
                TimeoutState::Warning => stats.warning += 1,
                TimeoutState::Expired => stats.expired += 1,
                TimeoutState::Escalated => stats.escalated += 1,
            }
        }
        stats
    }

    /// Removes entries that are both escalated and older than `days_old`
    /// days, so the in-memory registry doesn't grow unbounded across the
    /// lifetime of a long-running process.
    pub fn cleanup_old_timeouts(&self, days_old: i64) {
        let cutoff = Utc::now() - ChronoDuration::days(days_old);
        let stale: Vec<WorkflowId> = self
            .active
            .iter()
            .filter(|e| e.escalation_triggered && e.created_at < cutoff)
            .map(|e| *e.key())
            .collect();
        for id in &stale {
            self.active.remove(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "cleaned up stale escalated timeouts");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutStatistics {
    pub total: usize,
    pub active: usize,
    pub warning: usize,
    pub expired: usize,
    pub escalated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn registers_and_tracks_active_workflow() {
        let monitor = TimeoutMonitor::new(36);
        let id = Uuid::new_v4();
        monitor.register_workflow(id, "+15551112222".to_string());
        let stats = monitor.get_timeout_statistics();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn update_response_resets_warning_flag() {
        let monitor = TimeoutMonitor::new(36);
        let id = Uuid::new_v4();
        monitor.register_workflow(id, "+15551112222".to_string());
        if let Some(mut entry) = monitor.active.get_mut(&id) {
            entry.warning_sent = true;
            entry.state = TimeoutState::Warning;
        }
        monitor.update_workflow_response(id);
        let entry = monitor.active.get(&id).unwrap();
        assert!(!entry.warning_sent);
        assert_eq!(entry.state, TimeoutState::Active);
    }

    #[test]
    fn check_timeouts_detects_expired_workflow() {
        let monitor = TimeoutMonitor::new(1); // 1 hour threshold, easy to force-expire
        let id = Uuid::new_v4();
        monitor.register_workflow(id, "+15551112222".to_string());
        if let Some(mut entry) = monitor.active.get_mut(&id) {
            entry.last_ai_response = Utc::now() - ChronoDuration::hours(2);
        }
        let result = monitor.check_timeouts();
        assert_eq!(result.expired.len(), 1);
        assert_eq!(result.expired[0].workflow_id, id);
    }

    #[test]
    fn escalated_workflows_are_skipped_on_rescan() {
        let monitor = TimeoutMonitor::new(1);
        let id = Uuid::new_v4();
        monitor.register_workflow(id, "+15551112222".to_string());
        monitor.mark_workflow_escalated(id);
        if let Some(mut entry) = monitor.active.get_mut(&id) {
            entry.last_ai_response = Utc::now() - ChronoDuration::hours(2);
        }
        let result = monitor.check_timeouts();
        assert!(result.expired.is_empty());
    }

    #[test]
    fn cleanup_removes_old_escalated_entries_only() {
        let monitor = TimeoutMonitor::new(36);
        let old_id = Uuid::new_v4();
        let recent_id = Uuid::new_v4();
        monitor.register_workflow(old_id, "+15551112222".to_string());
        monitor.register_workflow(recent_id, "+15553334444".to_string());
        monitor.mark_workflow_escalated(old_id);
        monitor.mark_workflow_escalated(recent_id);
        if let Some(mut entry) = monitor.active.get_mut(&old_id) {
            entry.created_at = Utc::now() - ChronoDuration::days(10);
        }
        monitor.cleanup_old_timeouts(7);
        assert!(monitor.active.get(&old_id).is_none());
        assert!(monitor.active.get(&recent_id).is_some());
    }
}
