//! The collections orchestrator: wires together trigger detection, payment
//! plan extraction/validation, the approval queue, the timeout monitor, and
//! the escalation engine into the single pipeline an inbound SMS drives.

use crate::approval_queue::ApprovalQueue;
use crate::clients::{
    ClientError, LlmClient, LlmCompletionRequest, NotificationClient, SmsGatewayClient, TenantDataClient,
    TenantProfile,
};
use crate::degradation::DegradationController;
use crate::escalation::EscalationEngine;
use crate::payment_plan::{extract_from_ai_response, validate_payment_plan};
use crate::store::Store;
use crate::timeout_monitor::TimeoutMonitor;
use crate::triggers::{detect_triggers, primary_trigger, should_escalate};
use shared_types::{
    AppConfig, CandidateReply, ConversationMessage, EscalationReason, InboundMessage, OrchestratorError,
    RetryRecord, Workflow, WorkflowStatus,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const ESCALATION_CONFIDENCE_THRESHOLD: f64 = 0.7;

pub struct Orchestrator<S: Store> {
    store: Arc<S>,
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    sms: Arc<dyn SmsGatewayClient>,
    tenant_client: Arc<dyn TenantDataClient>,
    approval_queue: Arc<ApprovalQueue<S>>,
    escalation_engine: Arc<EscalationEngine<S>>,
    timeout_monitor: Arc<TimeoutMonitor>,
    degradation: Arc<DegradationController>,
    metrics: Arc<crate::metrics_sink::MetricsSink>,
}

#[derive(Debug)]
pub enum Disposition {
    AutoSent { workflow_id: Uuid },
    QueuedForApproval { workflow_id: Uuid, queue_entry_id: Uuid },
    Escalated { workflow_id: Uuid },
}

impl<S: Store> Orchestrator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        sms: Arc<dyn SmsGatewayClient>,
        notifications: Arc<dyn NotificationClient>,
        tenant_client: Arc<dyn TenantDataClient>,
        metrics: Arc<crate::metrics_sink::MetricsSink>,
    ) -> Self {
        let escalation_engine =
            Arc::new(EscalationEngine::new(store.clone(), notifications).with_sms_gateway(sms.clone()));
        let approval_queue = Arc::new(ApprovalQueue::new(
            store.clone(),
            config.approval_timeout_hours,
            sms.clone(),
            escalation_engine.clone(),
        ));
        let timeout_monitor = Arc::new(TimeoutMonitor::new(config.escalation_timeout_hours));
        let degradation = Arc::new(DegradationController::new());

        Self {
            store,
            config,
            llm,
            sms,
            tenant_client,
            approval_queue,
            escalation_engine,
            timeout_monitor,
            degradation,
            metrics,
        }
    }

    pub fn timeout_monitor(&self) -> Arc<TimeoutMonitor> {
        self.timeout_monitor.clone()
    }

    pub fn degradation(&self) -> Arc<DegradationController> {
        self.degradation.clone()
    }

    pub fn approval_queue(&self) -> Arc<ApprovalQueue<S>> {
        self.approval_queue.clone()
    }

    pub fn escalation_engine(&self) -> Arc<EscalationEngine<S>> {
        self.escalation_engine.clone()
    }

    pub fn metrics_sink(&self) -> Arc<crate::metrics_sink::MetricsSink> {
        self.metrics.clone()
    }

    /// Runs the full ingest pipeline for one inbound SMS: fetch tenant
    /// context and conversation history, detect escalation triggers, draft
    /// (or skip drafting) a reply, extract/validate any payment plan, and
    /// decide whether to auto-send, queue for manager approval, or escalate.
    #[instrument(skip(self, message), fields(tenant_id = %message.tenant_id, conversation_id = %message.conversation_id))]
    pub async fn handle_inbound_message(
        &self,
        message: InboundMessage,
    ) -> Result<Disposition, OrchestratorError> {
        message.validate().map_err(|e| OrchestratorError::Validation {
            field: "inbound_message".to_string(),
            detail: e.to_string(),
        })?;

        let mut workflow = Workflow::new(message.tenant_id.clone(), message.conversation_id.clone());
        workflow.set_status(WorkflowStatus::Processing);
        self.store.insert_workflow(&workflow).await.map_err(|e| {
            OrchestratorError::DatabaseError { operation: "insert_workflow".to_string(), detail: e.to_string() }
        })?;
        self.timeout_monitor.register_workflow(workflow.id, message.phone_number.clone());
        self.metrics.increment_counter("messages_ingested");

        self.store
            .append_conversation_message(&ConversationMessage {
                conversation_id: message.conversation_id.clone(),
                content: message.content.clone(),
                from_customer: true,
                timestamp: message.timestamp,
            })
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "append_conversation_message".to_string(),
                detail: e.to_string(),
            })?;

        if let Err(err) = self.fetch_tenant_context(&message.tenant_id).await {
            workflow.set_status(WorkflowStatus::Failed);
            workflow.error = Some(err.to_string());
            self.store.update_workflow(&workflow).await.ok();
            return Err(err);
        }

        let history = self.store.get_conversation_history(&message.conversation_id).await.map_err(|e| {
            OrchestratorError::DatabaseError {
                operation: "get_conversation_history".to_string(),
                detail: e.to_string(),
            }
        })?;

        self.process_workflow(&mut workflow, &message, history.len()).await
    }

    /// Fetches the tenant's profile via the protected tenant-data client. A
    /// circuit-open failure degrades gracefully when the controller's mode
    /// allows it (ReadOnly/Offline consult the registered fallback or queue
    /// the fetch); anything else is an unrecoverable workflow failure.
    async fn fetch_tenant_context(&self, tenant_id: &str) -> Result<TenantProfile, OrchestratorError> {
        match self.tenant_client.get_tenant_profile(tenant_id).await {
            Ok(profile) => Ok(profile),
            Err(ClientError::CircuitOpen(_)) => {
                let gate = self.degradation.can_execute(
                    "tenant_data",
                    crate::degradation::OperationKind::Read,
                    false,
                );
                if gate.fallback_used {
                    if let Some(value) = gate.fallback_value {
                        if let Ok(profile) = serde_json::from_value::<TenantProfile>(value) {
                            return Ok(profile);
                        }
                    }
                }
                if gate.allowed {
                    warn!(tenant_id, "tenant data unavailable; proceeding with a synthetic profile");
                    Ok(TenantProfile {
                        tenant_id: tenant_id.to_string(),
                        display_name: tenant_id.to_string(),
                        collections_policy: "default".to_string(),
                    })
                } else {
                    Err(OrchestratorError::ServiceUnavailable {
                        service_name: "tenant_data".to_string(),
                        retry_after_seconds: Some(30),
                    })
                }
            }
            Err(e) => Err(OrchestratorError::ExternalService {
                service_name: "tenant_data".to_string(),
                status_code: None,
                detail: e.to_string(),
                retry_after_seconds: None,
            }),
        }
    }

    /// The routing pipeline proper, shared between a fresh inbound message
    /// and a retried workflow: detect triggers, draft a reply, and decide
    /// the disposition.
    async fn process_workflow(
        &self,
        workflow: &mut Workflow,
        message: &InboundMessage,
        _history_len: usize,
    ) -> Result<Disposition, OrchestratorError> {
        let triggers = detect_triggers(&message.content);
        if should_escalate(&triggers, ESCALATION_CONFIDENCE_THRESHOLD) {
            let trigger = primary_trigger(&triggers).expect("should_escalate implies a trigger exists");
            self.escalation_engine
                .escalate_from_trigger(workflow.id, &message.phone_number, trigger)
                .await?;
            self.timeout_monitor.mark_workflow_escalated(workflow.id);
            workflow.set_status(WorkflowStatus::Escalated);
            self.store.update_workflow(workflow).await.map_err(|e| {
                OrchestratorError::DatabaseError { operation: "update_workflow".to_string(), detail: e.to_string() }
            })?;
            self.metrics.increment_counter("workflows_escalated");
            return Ok(Disposition::Escalated { workflow_id: workflow.id });
        }

        let reply = self.draft_reply(message).await?;
        self.metrics.observe("reply_confidence", reply.confidence).await;

        workflow.set_status(WorkflowStatus::PaymentPlanDetected);
        if reply.payment_plan.is_some() {
            self.metrics.increment_counter("payment_plans_detected");
        }

        let disposition = if self.degradation.allows_auto_send() && reply.confidence >= self.config.auto_approval_threshold {
            self.sms
                .send_sms(&message.phone_number, &reply.content)
                .await
                .map_err(|e| OrchestratorError::ExternalService {
                    service_name: "sms_gateway".to_string(),
                    status_code: None,
                    detail: e.to_string(),
                    retry_after_seconds: None,
                })?;
            workflow.set_status(WorkflowStatus::Sent);
            self.timeout_monitor.update_workflow_response(workflow.id);
            self.metrics.increment_counter("replies_auto_sent");
            Disposition::AutoSent { workflow_id: workflow.id }
        } else if reply.confidence < self.config.manual_approval_threshold {
            // A reply this unsure isn't worth putting in front of a manager
            // either; treat low model confidence itself as an escalation
            // signal, synthesized the same way a detected trigger would be.
            self.escalation_engine
                .escalate_trigger_based(
                    workflow.id,
                    &message.phone_number,
                    EscalationReason::Dissatisfaction,
                    1.0 - reply.confidence,
                    None,
                )
                .await?;
            self.timeout_monitor.mark_workflow_escalated(workflow.id);
            workflow.set_status(WorkflowStatus::Escalated);
            self.metrics.increment_counter("workflows_escalated");
            Disposition::Escalated { workflow_id: workflow.id }
        } else {
            let entry = self
                .approval_queue
                .enqueue(
                    workflow.id,
                    message.conversation_id.clone(),
                    message.phone_number.clone(),
                    message.content.clone(),
                    reply.content.clone(),
                    reply.confidence,
                )
                .await?;
            workflow.set_status(WorkflowStatus::AwaitingApproval);

            if let Some(plan) = &reply.payment_plan {
                let report = validate_payment_plan(plan, &self.config);
                if report.is_auto_approvable {
                    workflow.set_status(WorkflowStatus::PaymentPlanApproved);
                } else {
                    workflow.set_status(WorkflowStatus::PaymentPlanNeedsReview);
                }
            }

            self.metrics.increment_counter("replies_queued_for_approval");
            Disposition::QueuedForApproval { workflow_id: workflow.id, queue_entry_id: entry.id }
        };

        self.store.update_workflow(workflow).await.map_err(|e| {
            OrchestratorError::DatabaseError { operation: "update_workflow".to_string(), detail: e.to_string() }
        })?;

        info!(workflow_id = %workflow.id, disposition = ?disposition, "inbound message handled");
        Ok(disposition)
    }

    async fn draft_reply(&self, message: &InboundMessage) -> Result<CandidateReply, OrchestratorError> {
        let request = LlmCompletionRequest {
            prompt: message.content.clone(),
            model: self.config.llm_generation.model.clone(),
            temperature: self.config.llm_generation.temperature,
            max_tokens: self.config.llm_generation.max_tokens,
        };

        let response = self.llm.complete(&request).await.map_err(|e| OrchestratorError::ExternalService {
            service_name: "llm".to_string(),
            status_code: None,
            detail: e.to_string(),
            retry_after_seconds: None,
        })?;

        let payment_plan = extract_from_ai_response(&response.content).map(|plan| {
            let report = validate_payment_plan(&plan, &self.config);
            if !report.is_valid {
                info!(errors = ?report.errors, "extracted payment plan failed validation");
            }
            plan
        });

        Ok(CandidateReply {
            content: response.content,
            confidence: response.confidence,
            language: "en".to_string(),
            model_id: response.model,
            latency_ms: response.latency_ms,
            payment_plan,
            triggers: Vec::new(),
        })
    }

    /// Re-enters a workflow that previously failed or was escalated, e.g.
    /// after a transient dependency outage clears or a manager decides an
    /// escalated conversation deserves another automated pass. Allowed iff
    /// the workflow is `Failed`/`Escalated`, or `force` is set.
    pub async fn retry_workflow(
        &self,
        workflow_id: Uuid,
        reason: String,
        force: bool,
    ) -> Result<Disposition, OrchestratorError> {
        let mut workflow = self.store.get_workflow(workflow_id).await.map_err(|e| OrchestratorError::Workflow {
            workflow_id,
            step: "retry_workflow".to_string(),
            detail: e.to_string(),
        })?;

        if !force && !matches!(workflow.status, WorkflowStatus::Failed | WorkflowStatus::Escalated) {
            return Err(OrchestratorError::BusinessRule {
                rule_name: "retry_requires_failed_or_escalated".to_string(),
                detail: format!("workflow {} is {:?}, not retryable without force", workflow_id, workflow.status),
            });
        }

        let history = self.store.get_conversation_history(&workflow.conversation_id).await.map_err(|e| {
            OrchestratorError::DatabaseError {
                operation: "get_conversation_history".to_string(),
                detail: e.to_string(),
            }
        })?;
        let last_customer_message = history
            .iter()
            .rev()
            .find(|m| m.from_customer)
            .ok_or_else(|| OrchestratorError::BusinessRule {
                rule_name: "retry_requires_history".to_string(),
                detail: format!("workflow {} has no recorded customer message to replay", workflow_id),
            })?;
        let customer_phone = self.timeout_monitor.customer_phone(workflow_id).ok_or_else(|| {
            OrchestratorError::BusinessRule {
                rule_name: "retry_requires_known_phone".to_string(),
                detail: format!("workflow {} has no registered customer phone number", workflow_id),
            }
        })?;

        workflow.set_status(WorkflowStatus::Processing);
        self.store.update_workflow(&workflow).await.map_err(|e| OrchestratorError::DatabaseError {
            operation: "update_workflow".to_string(),
            detail: e.to_string(),
        })?;

        self.store
            .insert_retry_record(&RetryRecord {
                id: Uuid::new_v4(),
                workflow_id,
                reason,
                forced: force,
                created_at: chrono::Utc::now(),
            })
            .await
            .map_err(|e| OrchestratorError::DatabaseError {
                operation: "insert_retry_record".to_string(),
                detail: e.to_string(),
            })?;

        let message = InboundMessage {
            tenant_id: workflow.tenant_id.clone(),
            phone_number: customer_phone,
            content: last_customer_message.content.clone(),
            conversation_id: workflow.conversation_id.clone(),
            timestamp: chrono::Utc::now(),
        };

        let history_len = history.len();
        self.process_workflow(&mut workflow, &message, history_len).await
    }

    /// Periodic sweep invoked by the background scheduler: checks for
    /// timed-out workflows and expired approval-queue entries, escalating
    /// whichever it finds.
    pub async fn run_periodic_sweep(&self) -> Result<(), OrchestratorError> {
        let timeouts = self.timeout_monitor.check_timeouts();
        for timed_out in timeouts.expired {
            self.escalation_engine
                .escalate_from_timeout(timed_out.workflow_id, &timed_out.customer_phone)
                .await?;
            self.timeout_monitor.mark_workflow_escalated(timed_out.workflow_id);
            self.metrics.increment_counter("workflows_timed_out");
        }

        let expired_approvals = self.approval_queue.sweep_expired().await?;
        for entry in expired_approvals {
            self.metrics.increment_counter("approval_entries_expired");
            info!(queue_entry_id = %entry.id, "approval entry expired without manager action");
        }

        self.timeout_monitor.cleanup_old_timeouts(7);
        Ok(())
    }
}
