use actix_web::{web, Error, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::ApiContext;
use platform::{correlation_span, extract_correlation_id, record_counter};
use shared_types::{ApiError, InboundMessage, ManagerAction, OrchestratorError};
use tracing::{error, info, Instrument};
use uuid::Uuid;

pub fn configure(cfg: &mut web::ServiceConfig, ctx: ApiContext) {
    let ctx_data = web::Data::new(ctx);

    cfg.app_data(ctx_data)
        .route("/api/v1/ingest", web::post().to(ingest_v1))
        .route("/api/v1/approval/{id}/action", web::post().to(approval_action_v1))
        .route("/api/v1/escalate", web::post().to(escalate_v1))
        .route("/api/v1/workflow/{id}/retry", web::post().to(retry_workflow_v1))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_snapshot));
}

#[derive(Deserialize)]
struct IngestRequest {
    tenant_id: String,
    phone_number: String,
    content: String,
    conversation_id: String,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

#[derive(Serialize)]
struct IngestResponse {
    correlation_id: Uuid,
    disposition: String,
    workflow_id: Uuid,
    queue_entry_id: Option<Uuid>,
}

async fn ingest_v1(
    body: web::Json<IngestRequest>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let correlation_id = extract_correlation_id(body.correlation_id);
    let span = correlation_span(correlation_id, "ingest_v1");

    async move {
        record_counter("http_ingest_requests_total", 1);
        let req = body.into_inner();
        let message = InboundMessage {
            tenant_id: req.tenant_id,
            phone_number: req.phone_number,
            content: req.content,
            conversation_id: req.conversation_id,
            timestamp: Utc::now(),
        };

        match ctx.orchestrator.handle_inbound_message(message).await {
            Ok(disposition) => {
                info!(disposition = ?disposition, "ingest handled");
                let (label, workflow_id, queue_entry_id) = describe_disposition(&disposition);
                Ok(HttpResponse::Ok().json(IngestResponse {
                    correlation_id,
                    disposition: label,
                    workflow_id,
                    queue_entry_id,
                }))
            }
            Err(err) => {
                error!(error = %err, "ingest failed");
                Ok(error_response(&err, correlation_id))
            }
        }
    }
    .instrument(span)
    .await
}

fn describe_disposition(
    disposition: &crate::orchestrator::Disposition,
) -> (String, Uuid, Option<Uuid>) {
    use crate::orchestrator::Disposition::*;
    match disposition {
        AutoSent { workflow_id } => ("auto_sent".to_string(), *workflow_id, None),
        QueuedForApproval { workflow_id, queue_entry_id } => {
            ("queued_for_approval".to_string(), *workflow_id, Some(*queue_entry_id))
        }
        Escalated { workflow_id } => ("escalated".to_string(), *workflow_id, None),
    }
}

#[derive(Deserialize)]
struct ApprovalActionRequest {
    action: ManagerAction,
    #[serde(default)]
    modified_reply: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    actor: String,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

async fn approval_action_v1(
    path: web::Path<Uuid>,
    body: web::Json<ApprovalActionRequest>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let correlation_id = extract_correlation_id(body.correlation_id);
    let span = correlation_span(correlation_id, "approval_action_v1");

    async move {
        record_counter("http_approval_action_requests_total", 1);
        let entry_id = path.into_inner();
        let req = body.into_inner();

        match ctx
            .orchestrator
            .approval_queue()
            .action(entry_id, req.action, req.modified_reply, req.reason, &req.actor)
            .await
        {
            Ok(entry) => Ok(HttpResponse::Ok().json(entry)),
            Err(err) => {
                error!(error = %err, "approval action failed");
                Ok(error_response(&err, correlation_id))
            }
        }
    }
    .instrument(span)
    .await
}

#[derive(Deserialize)]
struct EscalateRequest {
    workflow_id: Uuid,
    customer_phone: String,
    reason: shared_types::EscalationReason,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

async fn escalate_v1(
    body: web::Json<EscalateRequest>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let correlation_id = extract_correlation_id(body.correlation_id);
    let span = correlation_span(correlation_id, "escalate_v1");

    async move {
        record_counter("http_escalate_requests_total", 1);
        let req = body.into_inner();
        // Manual escalation bypasses automated trigger detection entirely,
        // so it goes straight through the escalation queue bookkeeping via
        // the timeout monitor's idempotent mark-escalated path.
        ctx.orchestrator.timeout_monitor().mark_workflow_escalated(req.workflow_id);
        let engine_result = ctx
            .orchestrator
            .escalation_engine()
            .escalate_manual(req.workflow_id, &req.customer_phone, req.reason)
            .await;

        match engine_result {
            Ok(event) => Ok(HttpResponse::Ok().json(event)),
            Err(err) => {
                error!(error = %err, "manual escalation failed");
                Ok(error_response(&err, correlation_id))
            }
        }
    }
    .instrument(span)
    .await
}

#[derive(Deserialize)]
struct RetryWorkflowRequest {
    reason: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    correlation_id: Option<Uuid>,
}

async fn retry_workflow_v1(
    path: web::Path<Uuid>,
    body: web::Json<RetryWorkflowRequest>,
    ctx: web::Data<ApiContext>,
) -> Result<HttpResponse, Error> {
    let correlation_id = extract_correlation_id(body.correlation_id);
    let span = correlation_span(correlation_id, "retry_workflow_v1");

    async move {
        record_counter("http_retry_workflow_requests_total", 1);
        let workflow_id = path.into_inner();
        let req = body.into_inner();

        match ctx.orchestrator.retry_workflow(workflow_id, req.reason, req.force).await {
            Ok(disposition) => {
                info!(disposition = ?disposition, "workflow retried");
                let (label, workflow_id, queue_entry_id) = describe_disposition(&disposition);
                Ok(HttpResponse::Ok().json(IngestResponse {
                    correlation_id,
                    disposition: label,
                    workflow_id,
                    queue_entry_id,
                }))
            }
            Err(err) => {
                error!(error = %err, "workflow retry failed");
                Ok(error_response(&err, correlation_id))
            }
        }
    }
    .instrument(span)
    .await
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    degradation_mode: String,
    app_env: String,
}

async fn health(_req: HttpRequest, ctx: web::Data<ApiContext>) -> HttpResponse {
    record_counter("http_health_checks_total", 1);
    let mode = ctx.orchestrator.degradation().current_mode();
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        degradation_mode: format!("{:?}", mode),
        app_env: ctx.app_env.clone(),
    })
}

#[derive(Serialize)]
struct MetricsSnapshot {
    messages_ingested: u64,
    replies_auto_sent: u64,
    replies_queued_for_approval: u64,
    workflows_escalated: u64,
    workflows_timed_out: u64,
    payment_plans_detected: u64,
    approval_entries_expired: u64,
}

/// Orchestrator-level JSON snapshot of the in-process counters tracked by
/// `MetricsSink`, distinct from the ambient Prometheus scrape endpoint the
/// metrics exporter binds on its own port.
async fn metrics_snapshot(ctx: web::Data<ApiContext>) -> HttpResponse {
    let metrics = ctx.orchestrator.metrics_sink();
    HttpResponse::Ok().json(MetricsSnapshot {
        messages_ingested: metrics.counter_value("messages_ingested"),
        replies_auto_sent: metrics.counter_value("replies_auto_sent"),
        replies_queued_for_approval: metrics.counter_value("replies_queued_for_approval"),
        workflows_escalated: metrics.counter_value("workflows_escalated"),
        workflows_timed_out: metrics.counter_value("workflows_timed_out"),
        payment_plans_detected: metrics.counter_value("payment_plans_detected"),
        approval_entries_expired: metrics.counter_value("approval_entries_expired"),
    })
}

fn error_response(err: &OrchestratorError, correlation_id: Uuid) -> HttpResponse {
    let api_error = ApiError::from_orchestrator_error(err, correlation_id);
    let status = match err {
        OrchestratorError::Validation { .. } => actix_web::http::StatusCode::BAD_REQUEST,
        OrchestratorError::BusinessRule { .. } => actix_web::http::StatusCode::CONFLICT,
        OrchestratorError::Workflow { .. } => actix_web::http::StatusCode::NOT_FOUND,
        OrchestratorError::DegradedService { .. } => actix_web::http::StatusCode::OK,
        OrchestratorError::ServiceUnavailable { .. } | OrchestratorError::ExternalService { .. } => {
            actix_web::http::StatusCode::SERVICE_UNAVAILABLE
        }
        _ => actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
    };
    HttpResponse::build(status).json(api_error)
}
