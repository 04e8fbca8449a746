//! Manager approval queue: holds AI-drafted replies that didn't clear the
//! auto-send bar, records the manager's decision as an audit trail entry,
//! and sweeps entries that sat unactioned past the approval timeout.

use crate::clients::SmsGatewayClient;
use crate::escalation::EscalationEngine;
use crate::store::Store;
use chrono::{Duration as ChronoDuration, Utc};
use shared_types::{
    ApprovalQueueEntry, ApprovalStatus, AuditRecord, EscalationReason, ManagerAction,
    OrchestratorError, QueueEntryId, WorkflowId,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct ApprovalQueue<S: Store> {
    store: Arc<S>,
    timeout_hours: u64,
    sms: Arc<dyn SmsGatewayClient>,
    escalation_engine: Arc<EscalationEngine<S>>,
}

impl<S: Store> ApprovalQueue<S> {
    pub fn new(
        store: Arc<S>,
        timeout_hours: u64,
        sms: Arc<dyn SmsGatewayClient>,
        escalation_engine: Arc<EscalationEngine<S>>,
    ) -> Self {
        Self { store, timeout_hours, sms, escalation_engine }
    }

    pub async fn enqueue(
        &self,
        workflow_id: WorkflowId,
        conversation_id: String,
        customer_phone: String,
        tenant_message: String,
        ai_reply: String,
        confidence: f64,
    ) -> Result<ApprovalQueueEntry, OrchestratorError> {
        let entry = ApprovalQueueEntry {
            id: Uuid::new_v4(),
            workflow_id,
            conversation_id,
            customer_phone,
            tenant_message,
            ai_reply,
            confidence,
            status: ApprovalStatus::Pending,
            manager_action: None,
            final_reply: None,
            actioned_by: None,
            actioned_at: None,
            created_at: Utc::now(),
        };
        self.store
            .insert_approval_entry(&entry)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "insert_approval_entry".to_string(),
                detail: e.to_string(),
            })?;
        info!(queue_entry_id = %entry.id, workflow_id = %workflow_id, "queued reply for manager approval");
        Ok(entry)
    }

    /// Applies a manager's decision, recording both the mutated queue entry
    /// and an immutable audit record of what changed and why.
    ///
    /// Approve/Modify send the final reply text over SMS. Escalate hands the
    /// conversation off to the escalation engine as a manual event rather
    /// than sending anything. Reject sends nothing and expires the entry.
    pub async fn action(
        &self,
        entry_id: QueueEntryId,
        action: ManagerAction,
        modified_reply: Option<String>,
        reason: Option<String>,
        actor: &str,
    ) -> Result<ApprovalQueueEntry, OrchestratorError> {
        let mut entry = self
            .store
            .get_approval_entry(entry_id)
            .await
            .map_err(|e| OrchestratorError::Workflow {
                workflow_id: Uuid::nil(),
                step: "approval_action".to_string(),
                detail: e.to_string(),
            })?;

        if entry.status != ApprovalStatus::Pending {
            return Err(OrchestratorError::BusinessRule {
                rule_name: "approval_already_actioned".to_string(),
                detail: format!("entry {} is already {:?}", entry_id, entry.status),
            });
        }

        if action == ManagerAction::Escalate && reason.is_none() {
            return Err(OrchestratorError::Validation {
                field: "reason".to_string(),
                detail: "an escalate action must supply a reason".to_string(),
            });
        }

        let final_reply = match action {
            ManagerAction::Approve => entry.ai_reply.clone(),
            ManagerAction::Modify => modified_reply
                .clone()
                .ok_or_else(|| OrchestratorError::Validation {
                    field: "modified_reply".to_string(),
                    detail: "a modify action must supply the modified reply text".to_string(),
                })?,
            ManagerAction::Escalate | ManagerAction::Reject => entry.ai_reply.clone(),
        };

        match action {
            ManagerAction::Approve | ManagerAction::Modify => {
                self.sms.send_sms(&entry.customer_phone, &final_reply).await.map_err(|e| {
                    OrchestratorError::ExternalService {
                        service_name: "sms_gateway".to_string(),
                        status_code: None,
                        detail: e.to_string(),
                        retry_after_seconds: None,
                    }
                })?;
            }
            ManagerAction::Escalate => {
                let mapped_reason = reason
                    .as_deref()
                    .map(EscalationReason::from_label)
                    .unwrap_or(EscalationReason::Dissatisfaction);
                self.escalation_engine
                    .escalate_manual(entry.workflow_id, &entry.customer_phone, mapped_reason)
                    .await?;
            }
            ManagerAction::Reject => {}
        }

        entry.status = match action {
            ManagerAction::Approve => ApprovalStatus::Approved,
            ManagerAction::Modify => ApprovalStatus::Modified,
            ManagerAction::Escalate => ApprovalStatus::Escalated,
            ManagerAction::Reject => ApprovalStatus::Expired,
        };
        entry.manager_action = Some(action);
        entry.final_reply = Some(final_reply.clone());
        entry.actioned_by = Some(actor.to_string());
        entry.actioned_at = Some(Utc::now());

        self.store
            .update_approval_entry(&entry)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "update_approval_entry".to_string(),
                detail: e.to_string(),
            })?;

        let audit = AuditRecord {
            id: Uuid::new_v4(),
            queue_entry_id: entry.id,
            action,
            original_reply: entry.ai_reply.clone(),
            final_reply,
            reason,
            actor: actor.to_string(),
            created_at: Utc::now(),
        };
        self.store
            .insert_audit_record(&audit)
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "insert_audit_record".to_string(),
                detail: e.to_string(),
            })?;

        Ok(entry)
    }

    /// Marks pending entries older than `timeout_hours` as expired, so the
    /// orchestrator can escalate them instead of leaving a customer waiting
    /// on a reply nobody will ever approve.
    pub async fn sweep_expired(&self) -> Result<Vec<ApprovalQueueEntry>, OrchestratorError> {
        let pending = self
            .store
            .list_pending_approval_entries()
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "list_pending_approval_entries".to_string(),
                detail: e.to_string(),
            })?;

        let cutoff = Utc::now() - ChronoDuration::hours(self.timeout_hours as i64);
        let mut expired = Vec::new();
        for mut entry in pending {
            if entry.created_at < cutoff {
                entry.status = ApprovalStatus::Expired;
                self.store.update_approval_entry(&entry).await.map_err(|e| {
                    OrchestratorError::DatabaseError {
                        operation: "update_approval_entry".to_string(),
                        detail: e.to_string(),
                    }
                })?;
                expired.push(entry);
            }
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{ClientError, NotificationClient};
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use shared_types::EscalationEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSmsGatewayClient {
        sent: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl RecordingSmsGatewayClient {
        fn new() -> Self {
            Self { sent: std::sync::Mutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl SmsGatewayClient for RecordingSmsGatewayClient {
        async fn send_sms(&self, to: &str, body: &str) -> Result<(), ClientError> {
            self.sent.lock().unwrap().push((to.to_string(), body.to_string()));
            Ok(())
        }

        async fn pause_messaging(&self, _to: &str) -> Result<(), ClientError> {
            Ok(())
        }
    }

    struct NoopNotificationClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationClient for NoopNotificationClient {
        async fn notify_escalation(&self, _event: &EscalationEvent) -> Result<(), ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_queue(
        store: Arc<InMemoryStore>,
    ) -> (ApprovalQueue<InMemoryStore>, Arc<RecordingSmsGatewayClient>) {
        let sms = Arc::new(RecordingSmsGatewayClient::new());
        let notifications = Arc::new(NoopNotificationClient { calls: AtomicUsize::new(0) });
        let escalation_engine = Arc::new(EscalationEngine::new(store.clone(), notifications));
        let queue = ApprovalQueue::new(store, 24, sms.clone(), escalation_engine);
        (queue, sms)
    }

    #[tokio::test]
    async fn enqueue_then_approve_produces_audit_record_and_sends_sms() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, sms) = test_queue(store.clone());

        let entry = queue
            .enqueue(
                Uuid::new_v4(),
                "conv-1".into(),
                "+15551234567".into(),
                "tenant msg".into(),
                "ai reply".into(),
                0.5,
            )
            .await
            .unwrap();

        let actioned = queue
            .action(entry.id, ManagerAction::Approve, None, None, "manager-1")
            .await
            .unwrap();

        assert_eq!(actioned.status, ApprovalStatus::Approved);
        assert_eq!(actioned.final_reply.as_deref(), Some("ai reply"));
        assert_eq!(store.audit_record_count().await, 1);
        assert_eq!(sms.sent.lock().unwrap().as_slice(), &[("+15551234567".to_string(), "ai reply".to_string())]);
    }

    #[tokio::test]
    async fn modify_sends_modified_text() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(
                Uuid::new_v4(),
                "conv-1".into(),
                "+15551234567".into(),
                "tenant msg".into(),
                "ai reply".into(),
                0.5,
            )
            .await
            .unwrap();

        let actioned = queue
            .action(entry.id, ManagerAction::Modify, Some("rewritten reply".into()), None, "manager-1")
            .await
            .unwrap();

        assert_eq!(actioned.status, ApprovalStatus::Modified);
        assert_eq!(sms.sent.lock().unwrap()[0].1, "rewritten reply");
    }

    #[tokio::test]
    async fn modify_requires_modified_reply_text() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, _sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        let result = queue.action(entry.id, ManagerAction::Modify, None, None, "manager-1").await;
        assert!(matches!(result, Err(OrchestratorError::Validation { .. })));
    }

    #[tokio::test]
    async fn escalate_hands_off_to_escalation_engine_without_sending_sms() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        let actioned = queue
            .action(entry.id, ManagerAction::Escalate, None, Some("customer is furious".into()), "manager-1")
            .await
            .unwrap();

        assert_eq!(actioned.status, ApprovalStatus::Escalated);
        assert!(sms.sent.lock().unwrap().is_empty());
        assert_eq!(store.escalation_count().await, 1);
    }

    #[tokio::test]
    async fn escalate_requires_a_reason() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, _sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        let result = queue.action(entry.id, ManagerAction::Escalate, None, None, "manager-1").await;
        assert!(matches!(result, Err(OrchestratorError::Validation { .. })));
    }

    #[tokio::test]
    async fn reject_expires_the_entry_without_sending_anything() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        let actioned = queue.action(entry.id, ManagerAction::Reject, None, Some("not appropriate".into()), "manager-1").await.unwrap();

        assert_eq!(actioned.status, ApprovalStatus::Expired);
        assert!(sms.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cannot_action_an_already_actioned_entry() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, _sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        queue.action(entry.id, ManagerAction::Approve, None, None, "manager-1").await.unwrap();
        let result = queue.action(entry.id, ManagerAction::Approve, None, None, "manager-2").await;
        assert!(matches!(result, Err(OrchestratorError::BusinessRule { .. })));
    }

    #[tokio::test]
    async fn sweep_expired_marks_old_pending_entries() {
        let store = Arc::new(InMemoryStore::new());
        let (queue, _sms) = test_queue(store.clone());
        let entry = queue
            .enqueue(Uuid::new_v4(), "conv-1".into(), "+15551234567".into(), "tenant msg".into(), "ai reply".into(), 0.5)
            .await
            .unwrap();

        {
            let mut stale = store.get_approval_entry(entry.id).await.unwrap();
            stale.created_at = Utc::now() - ChronoDuration::hours(48);
            store.update_approval_entry(&stale).await.unwrap();
        }

        let expired = queue.sweep_expired().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].status, ApprovalStatus::Expired);
    }
}
