//! Shared data model for the collections orchestrator: the entities of
//! the domain (workflows, approval queue, payment plans, escalations,
//! circuit-breaker/degradation state) plus the configuration surface and
//! error taxonomy shared between the engine and any ingress adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type ConversationId = String;
pub type TenantId = String;
pub type QueueEntryId = Uuid;
pub type AuditRecordId = Uuid;
pub type EscalationId = Uuid;
pub type CorrelationId = Uuid;

// === Workflow ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Received,
    Processing,
    AwaitingApproval,
    Sent,
    Escalated,
    Failed,
    Completed,
    PaymentPlanDetected,
    PaymentPlanApproved,
    PaymentPlanNeedsReview,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Sent
                | WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Escalated
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    pub conversation_id: ConversationId,
    pub tenant_id: TenantId,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Workflow {
    pub fn new(tenant_id: TenantId, conversation_id: ConversationId) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            tenant_id,
            status: WorkflowStatus::Received,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Transitions `status`, maintaining the `completed_at` invariant:
    /// set iff status is in the terminal set.
    pub fn set_status(&mut self, status: WorkflowStatus) {
        self.status = status;
        self.updated_at = Utc::now();
        if status.is_terminal() {
            self.completed_at.get_or_insert(self.updated_at);
        } else {
            self.completed_at = None;
        }
    }
}

// === Inbound Message ===

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InboundMessage {
    pub tenant_id: TenantId,
    pub phone_number: String,
    pub content: String,
    pub conversation_id: ConversationId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum InboundMessageError {
    #[error("content length {0} is outside the allowed 1..=1600 range")]
    ContentLength(usize),
    #[error("phone number '{0}' is not E.164")]
    InvalidPhoneNumber(String),
}

impl InboundMessage {
    pub fn validate(&self) -> Result<(), InboundMessageError> {
        if self.content.is_empty() || self.content.chars().count() > 1600 {
            return Err(InboundMessageError::ContentLength(self.content.chars().count()));
        }
        if !is_e164(&self.phone_number) {
            return Err(InboundMessageError::InvalidPhoneNumber(self.phone_number.clone()));
        }
        Ok(())
    }
}

fn is_e164(phone: &str) -> bool {
    let mut chars = phone.chars();
    matches!(chars.next(), Some('+'))
        && chars.clone().count() >= 1
        && chars.clone().count() <= 15
        && chars.all(|c| c.is_ascii_digit())
}

// === Escalation reasons / triggers ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Anger,
    LegalRequest,
    Complaint,
    Confusion,
    Dissatisfaction,
}

impl EscalationReason {
    /// Maps a manager-supplied free-form reason string to the closest
    /// known reason, defaulting to `Dissatisfaction` when nothing matches.
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("anger") || lower.contains("angry") || lower.contains("furious") {
            EscalationReason::Anger
        } else if lower.contains("legal") || lower.contains("lawyer") || lower.contains("attorney") {
            EscalationReason::LegalRequest
        } else if lower.contains("complaint") {
            EscalationReason::Complaint
        } else if lower.contains("confus") {
            EscalationReason::Confusion
        } else {
            EscalationReason::Dissatisfaction
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Regex,
    Keyword,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Trigger {
    pub reason: EscalationReason,
    pub confidence: f64,
    pub matched_text: String,
    pub pattern_kind: PatternKind,
}

// === Candidate Reply ===

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CandidateReply {
    pub content: String,
    pub confidence: f64,
    pub language: String,
    pub model_id: String,
    pub latency_ms: u64,
    pub payment_plan: Option<ExtractedPaymentPlan>,
    pub triggers: Vec<Trigger>,
}

// === Approval Queue ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Modified,
    Escalated,
    AutoSent,
    Expired,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManagerAction {
    Approve,
    Modify,
    Escalate,
    Reject,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApprovalQueueEntry {
    pub id: QueueEntryId,
    pub workflow_id: WorkflowId,
    pub conversation_id: ConversationId,
    pub customer_phone: String,
    pub tenant_message: String,
    pub ai_reply: String,
    pub confidence: f64,
    pub status: ApprovalStatus,
    pub manager_action: Option<ManagerAction>,
    pub final_reply: Option<String>,
    pub actioned_by: Option<String>,
    pub actioned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditRecord {
    pub id: AuditRecordId,
    pub queue_entry_id: QueueEntryId,
    pub action: ManagerAction,
    pub original_reply: String,
    pub final_reply: String,
    pub reason: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

// === Payment plan ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentPlanSource {
    TenantMessage,
    AiResponse,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ExtractedPaymentPlan {
    pub weekly_amount: Option<f64>,
    pub duration_weeks: Option<u32>,
    pub start_date: Option<DateTime<Utc>>,
    pub confidence_level: Option<ConfidenceLevel>,
    pub confidence_score: f64,
    pub source: Option<PaymentPlanSource>,
    pub patterns_matched: Vec<String>,
    pub raw_text: String,
}

impl ExtractedPaymentPlan {
    pub fn is_complete(&self) -> bool {
        self.weekly_amount.is_some() && self.duration_weeks.is_some()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
    NeedsReview,
    AutoApproved,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ValidationReport {
    pub status: Option<ValidationStatus>,
    pub is_valid: bool,
    pub is_auto_approvable: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub summary: String,
}

// === Timeout monitor ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutState {
    Active,
    Warning,
    Expired,
    Escalated,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WorkflowTimeout {
    pub workflow_id: WorkflowId,
    pub customer_phone: String,
    pub last_ai_response: DateTime<Utc>,
    pub threshold_seconds: i64,
    pub state: TimeoutState,
    pub warning_sent: bool,
    pub escalation_triggered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// === Conversation history ===

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ConversationMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub from_customer: bool,
    pub timestamp: DateTime<Utc>,
}

// === Workflow retry ===

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RetryRecord {
    pub id: Uuid,
    pub workflow_id: WorkflowId,
    pub reason: String,
    pub forced: bool,
    pub created_at: DateTime<Utc>,
}

// === Escalation events ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    TriggerBased,
    TimeoutBased,
    Manual,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EscalationEvent {
    pub id: EscalationId,
    pub workflow_id: WorkflowId,
    pub customer_phone: String,
    pub kind: EscalationKind,
    pub reason: EscalationReason,
    pub confidence: f64,
    pub matched_text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

// === Circuit breaker / degradation state (mirrored for external inspection) ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    Full,
    Partial,
    ReadOnly,
    Offline,
    Emergency,
}

// === Configuration surface (§6) ===

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DependencyConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
    pub api_key: Option<String>,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_seconds: 30,
            api_key: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DependenciesConfig {
    pub tenant_data: DependencyConfig,
    pub llm: DependencyConfig,
    pub sms_gateway: DependencyConfig,
    pub notifications: DependencyConfig,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            tenant_data: DependencyConfig { timeout_seconds: 60, ..Default::default() },
            llm: DependencyConfig { timeout_seconds: 30, ..Default::default() },
            sms_gateway: DependencyConfig { timeout_seconds: 30, ..Default::default() },
            notifications: DependencyConfig { timeout_seconds: 30, ..Default::default() },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LlmGenerationConfig {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for LlmGenerationConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.7,
            max_tokens: 200,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub auto_approval_threshold: f64,
    pub manual_approval_threshold: f64,
    pub escalation_timeout_hours: u64,
    pub approval_timeout_hours: u64,
    pub max_payment_weeks: u32,
    pub min_weekly_payment: f64,
    pub max_weekly_payment: f64,
    pub cb_failure_threshold: u32,
    pub cb_success_threshold: u32,
    pub cb_timeout_seconds: u64,
    pub cb_half_open_max_calls: u32,
    pub retry_max_attempts: u8,
    pub retry_base_delay_seconds: f64,
    pub retry_max_delay_seconds: f64,
    pub monitor_scan_interval_seconds: u64,
    pub metrics_window_points: usize,
    pub metrics_histogram_capacity: usize,
    pub dependencies: DependenciesConfig,
    pub llm_generation: LlmGenerationConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            auto_approval_threshold: 0.85,
            manual_approval_threshold: 0.60,
            escalation_timeout_hours: 36,
            approval_timeout_hours: 24,
            max_payment_weeks: 12,
            min_weekly_payment: 25.00,
            max_weekly_payment: 1000.00,
            cb_failure_threshold: 5,
            cb_success_threshold: 3,
            cb_timeout_seconds: 60,
            cb_half_open_max_calls: 5,
            retry_max_attempts: 3,
            retry_base_delay_seconds: 1.0,
            retry_max_delay_seconds: 30.0,
            monitor_scan_interval_seconds: 300,
            metrics_window_points: 10_000,
            metrics_histogram_capacity: 1_000,
            dependencies: DependenciesConfig::default(),
            llm_generation: LlmGenerationConfig::default(),
        }
    }
}

impl AppConfig {
    /// Eager validation performed once at load time (ORC_001 field errors).
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.auto_approval_threshold) {
            return Err("auto_approval_threshold must be within [0,1]".into());
        }
        if !(0.0..=1.0).contains(&self.manual_approval_threshold) {
            return Err("manual_approval_threshold must be within [0,1]".into());
        }
        if self.manual_approval_threshold > self.auto_approval_threshold {
            return Err("manual_approval_threshold must be <= auto_approval_threshold".into());
        }
        if self.min_weekly_payment > self.max_weekly_payment {
            return Err("min_weekly_payment must be <= max_weekly_payment".into());
        }
        if self.cb_failure_threshold == 0 || self.cb_success_threshold == 0 {
            return Err("circuit breaker thresholds must be > 0".into());
        }
        if self.retry_max_attempts == 0 {
            return Err("retry_max_attempts must be > 0".into());
        }
        Ok(())
    }
}

// === Error taxonomy (§7) ===

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorErrorCode {
    Validation,
    BusinessRule,
    Workflow,
    ServiceUnavailable,
    ExternalService,
    DegradedService,
    DatabaseError,
    AiServiceTimeout,
    AiServiceRateLimit,
    AiServiceAuthentication,
}

impl OrchestratorErrorCode {
    /// Stable `ORC_NNN` code per the user-visible error surface.
    pub fn code(self) -> &'static str {
        match self {
            OrchestratorErrorCode::Validation => "ORC_001",
            OrchestratorErrorCode::BusinessRule => "ORC_002",
            OrchestratorErrorCode::Workflow => "ORC_003",
            OrchestratorErrorCode::ServiceUnavailable => "ORC_004",
            OrchestratorErrorCode::DegradedService => "ORC_005",
            OrchestratorErrorCode::ExternalService => "ORC_006",
            OrchestratorErrorCode::DatabaseError => "ORC_007",
            OrchestratorErrorCode::AiServiceTimeout => "ORC_008_TIMEOUT",
            OrchestratorErrorCode::AiServiceRateLimit => "ORC_008_RATE_LIMIT",
            OrchestratorErrorCode::AiServiceAuthentication => "ORC_008_AUTH",
        }
    }
}

impl fmt::Display for OrchestratorErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed for field '{field}': {detail}")]
    Validation { field: String, detail: String },

    #[error("business rule '{rule_name}' violated: {detail}")]
    BusinessRule { rule_name: String, detail: String },

    #[error("workflow '{workflow_id}' error at step '{step}': {detail}")]
    Workflow {
        workflow_id: WorkflowId,
        step: String,
        detail: String,
    },

    #[error("service '{service_name}' unavailable")]
    ServiceUnavailable {
        service_name: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("external service '{service_name}' returned an error: {detail}")]
    ExternalService {
        service_name: String,
        status_code: Option<u16>,
        detail: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("service '{service_name}' degraded: {detail}")]
    DegradedService {
        service_name: String,
        fallback_used: String,
        detail: String,
    },

    #[error("database error during '{operation}': {detail}")]
    DatabaseError { operation: String, detail: String },

    #[error("AI service '{provider}' timed out after {timeout_seconds}s")]
    AiServiceTimeout { provider: String, timeout_seconds: f64 },

    #[error("AI service '{provider}' rate limited")]
    AiServiceRateLimit {
        provider: String,
        retry_after_seconds: Option<u64>,
    },

    #[error("AI service '{provider}' authentication failed")]
    AiServiceAuthentication { provider: String },
}

impl OrchestratorError {
    pub fn code(&self) -> OrchestratorErrorCode {
        match self {
            OrchestratorError::Validation { .. } => OrchestratorErrorCode::Validation,
            OrchestratorError::BusinessRule { .. } => OrchestratorErrorCode::BusinessRule,
            OrchestratorError::Workflow { .. } => OrchestratorErrorCode::Workflow,
            OrchestratorError::ServiceUnavailable { .. } => OrchestratorErrorCode::ServiceUnavailable,
            OrchestratorError::ExternalService { .. } => OrchestratorErrorCode::ExternalService,
            OrchestratorError::DegradedService { .. } => OrchestratorErrorCode::DegradedService,
            OrchestratorError::DatabaseError { .. } => OrchestratorErrorCode::DatabaseError,
            OrchestratorError::AiServiceTimeout { .. } => OrchestratorErrorCode::AiServiceTimeout,
            OrchestratorError::AiServiceRateLimit { .. } => OrchestratorErrorCode::AiServiceRateLimit,
            OrchestratorError::AiServiceAuthentication { .. } => {
                OrchestratorErrorCode::AiServiceAuthentication
            }
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            OrchestratorError::ServiceUnavailable { retry_after_seconds, .. }
            | OrchestratorError::ExternalService { retry_after_seconds, .. }
            | OrchestratorError::AiServiceRateLimit { retry_after_seconds, .. } => {
                *retry_after_seconds
            }
            _ => None,
        }
    }
}

/// An error as it would be rendered at the ingress boundary: stable code,
/// correlation id, human message, retry-after hint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ApiError {
    pub error_code: String,
    pub message: String,
    pub correlation_id: CorrelationId,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn from_orchestrator_error(err: &OrchestratorError, correlation_id: CorrelationId) -> Self {
        Self {
            error_code: err.code().code().to_string(),
            message: err.to_string(),
            correlation_id,
            retry_after_seconds: err.retry_after_seconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_completed_at_tracks_terminal_status() {
        let mut wf = Workflow::new("tenant-1".into(), "conv-1".into());
        assert!(wf.completed_at.is_none());
        wf.set_status(WorkflowStatus::Processing);
        assert!(wf.completed_at.is_none());
        wf.set_status(WorkflowStatus::Completed);
        assert!(wf.completed_at.is_some());
    }

    #[test]
    fn inbound_message_validates_content_length_and_phone() {
        let mut msg = InboundMessage {
            tenant_id: "t1".into(),
            phone_number: "+15551112222".into(),
            content: "hello".into(),
            conversation_id: "c1".into(),
            timestamp: Utc::now(),
        };
        assert!(msg.validate().is_ok());

        msg.content = "".into();
        assert_eq!(msg.validate(), Err(InboundMessageError::ContentLength(0)));

        msg.content = "hello".into();
        msg.phone_number = "555-1112222".into();
        assert!(msg.validate().is_err());
    }

    #[test]
    fn app_config_validate_rejects_inverted_thresholds() {
        let mut cfg = AppConfig::default();
        cfg.manual_approval_threshold = 0.9;
        cfg.auto_approval_threshold = 0.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn orchestrator_error_code_round_trips_through_display() {
        let err = OrchestratorError::ServiceUnavailable {
            service_name: "llm".into(),
            retry_after_seconds: Some(5),
        };
        assert_eq!(err.code().code(), "ORC_004");
        assert_eq!(err.retry_after_seconds(), Some(5));
    }
}
