//! Escalation engine: turns a trigger-based or timeout-based signal into an
//! `EscalationEvent`, persists it, and notifies the tenant via the
//! notification client.

use crate::clients::{NotificationClient, SmsGatewayClient};
use crate::store::Store;
use shared_types::{EscalationEvent, EscalationKind, EscalationReason, OrchestratorError, Trigger, WorkflowId};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub struct EscalationEngine<S: Store> {
    store: Arc<S>,
    notifications: Arc<dyn NotificationClient>,
    sms: Option<Arc<dyn SmsGatewayClient>>,
}

impl<S: Store> EscalationEngine<S> {
    pub fn new(store: Arc<S>, notifications: Arc<dyn NotificationClient>) -> Self {
        Self { store, notifications, sms: None }
    }

    /// Attaches the SMS gateway client so trigger-based escalations can pause
    /// automated messaging once a human takes over the conversation.
    pub fn with_sms_gateway(mut self, sms: Arc<dyn SmsGatewayClient>) -> Self {
        self.sms = Some(sms);
        self
    }

    pub async fn escalate_from_trigger(
        &self,
        workflow_id: WorkflowId,
        customer_phone: &str,
        trigger: &Trigger,
    ) -> Result<EscalationEvent, OrchestratorError> {
        self.escalate_trigger_based(
            workflow_id,
            customer_phone,
            trigger.reason,
            trigger.confidence,
            Some(trigger.matched_text.clone()),
        )
        .await
    }

    /// Records a trigger-based escalation from an explicit reason/confidence
    /// pair rather than a matched `Trigger`, used when the signal is derived
    /// from something other than regex/keyword detection (e.g. a low-confidence
    /// model reply).
    pub async fn escalate_trigger_based(
        &self,
        workflow_id: WorkflowId,
        customer_phone: &str,
        reason: EscalationReason,
        confidence: f64,
        matched_text: Option<String>,
    ) -> Result<EscalationEvent, OrchestratorError> {
        let event = self
            .record(workflow_id, customer_phone, EscalationKind::TriggerBased, reason, confidence, matched_text)
            .await?;

        if let Some(sms) = &self.sms {
            if let Err(e) = sms.pause_messaging(customer_phone).await {
                tracing::warn!(workflow_id = %workflow_id, error = %e, "failed to pause automated messaging after escalation");
            }
        }

        Ok(event)
    }

    pub async fn escalate_from_timeout(
        &self,
        workflow_id: WorkflowId,
        customer_phone: &str,
    ) -> Result<EscalationEvent, OrchestratorError> {
        self.record(
            workflow_id,
            customer_phone,
            EscalationKind::TimeoutBased,
            EscalationReason::Dissatisfaction,
            1.0,
            None,
        )
        .await
    }

    pub async fn escalate_manual(
        &self,
        workflow_id: WorkflowId,
        customer_phone: &str,
        reason: EscalationReason,
    ) -> Result<EscalationEvent, OrchestratorError> {
        self.record(workflow_id, customer_phone, EscalationKind::Manual, reason, 1.0, None)
            .await
    }

    async fn record(
        &self,
        workflow_id: WorkflowId,
        customer_phone: &str,
        kind: EscalationKind,
        reason: EscalationReason,
        confidence: f64,
        matched_text: Option<String>,
    ) -> Result<EscalationEvent, OrchestratorError> {
        let event = EscalationEvent {
            id: Uuid::new_v4(),
            workflow_id,
            customer_phone: customer_phone.to_string(),
            kind,
            reason,
            confidence,
            matched_text,
            timestamp: chrono::Utc::now(),
            status: "open".to_string(),
        };

        self.store.insert_escalation(&event).await.map_err(|e| OrchestratorError::DatabaseError {
            operation: "insert_escalation".to_string(),
            detail: e.to_string(),
        })?;

        info!(
            workflow_id = %workflow_id,
            reason = ?reason,
            kind = ?kind,
            "workflow escalated"
        );

        if let Err(e) = self.notifications.notify_escalation(&event).await {
            // Notification failure doesn't unwind the escalation itself; the
            // event is already durably recorded and visible to managers.
            tracing::warn!(workflow_id = %workflow_id, error = %e, "failed to notify escalation");
        }

        Ok(event)
    }
}
