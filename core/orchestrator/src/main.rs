mod api;
mod approval_queue;
mod circuit_breaker;
mod clients;
mod config;
mod degradation;
mod escalation;
mod metrics_sink;
mod orchestrator;
mod payment_plan;
mod retry;
mod store;
mod timeout_monitor;
mod triggers;

use actix_web::{web, App, HttpServer};
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use clients::{HttpLlmClient, HttpNotificationClient, HttpSmsGatewayClient, HttpTenantDataClient};
use metrics_sink::MetricsSink;
use orchestrator::Orchestrator;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{build_sqlite_pool, SqliteStore};
use tracing::{info, warn};

const SERVICE_NAME: &str = "collections-orchestrator";

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    platform::init_tracing(SERVICE_NAME).expect("tracing initialization must not fail at startup");

    let metrics_bind: SocketAddr = env::var("METRICS_BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
        .parse()
        .expect("METRICS_BIND_ADDR must be a valid socket address");
    if let Err(err) = platform::init_metrics(metrics_bind) {
        warn!(error = %err, "failed to initialize the Prometheus metrics exporter");
    }

    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());
    let config_base_path = env::var("CONFIG_BASE_PATH").unwrap_or_else(|_| "config/base.toml".to_string());
    let app_config = config::load_app_config_with_env(&config_base_path, &app_env).unwrap_or_else(|err| {
        warn!(error = %err, "falling back to default configuration");
        shared_types::AppConfig::default()
    });
    app_config
        .validate()
        .expect("configuration must pass validation before the service starts");

    let db_path = env::var("DATABASE_PATH").unwrap_or_else(|_| "data/orchestrator.sqlite".to_string());
    let pool = build_sqlite_pool(&db_path).expect("failed to build the sqlite connection pool");
    let store = Arc::new(SqliteStore::new(pool).expect("failed to initialize the sqlite store"));

    let breaker_config = CircuitBreakerConfig {
        failure_threshold: app_config.cb_failure_threshold,
        success_threshold: app_config.cb_success_threshold,
        open_timeout_ms: app_config.cb_timeout_seconds * 1000,
        half_open_max_calls: app_config.cb_half_open_max_calls,
    };
    let breaker_registry = CircuitBreakerRegistry::new(breaker_config);

    let llm = Arc::new(HttpLlmClient::new(
        app_config.dependencies.llm.base_url.clone(),
        Duration::from_secs(app_config.dependencies.llm.timeout_seconds),
        breaker_registry.get_or_create("llm"),
    ));
    let sms = Arc::new(HttpSmsGatewayClient::new(
        app_config.dependencies.sms_gateway.base_url.clone(),
        Duration::from_secs(app_config.dependencies.sms_gateway.timeout_seconds),
        breaker_registry.get_or_create("sms_gateway"),
    ));
    let notifications = Arc::new(HttpNotificationClient::new(
        app_config.dependencies.notifications.base_url.clone(),
        Duration::from_secs(app_config.dependencies.notifications.timeout_seconds),
        breaker_registry.get_or_create("notifications"),
    ));
    let tenant_data = Arc::new(HttpTenantDataClient::new(
        app_config.dependencies.tenant_data.base_url.clone(),
        Duration::from_secs(app_config.dependencies.tenant_data.timeout_seconds),
        breaker_registry.get_or_create("tenant_data"),
    ));

    let metrics = Arc::new(MetricsSink::new(
        app_config.metrics_window_points,
        app_config.metrics_histogram_capacity,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        app_config.clone(),
        llm,
        sms,
        notifications,
        tenant_data,
        metrics,
    ));

    spawn_periodic_sweep(orchestrator.clone(), app_config.monitor_scan_interval_seconds);

    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    info!(bind_addr = %bind_addr, app_env = %app_env, "starting collections orchestrator");

    let app_config = Arc::new(app_config);
    HttpServer::new(move || {
        let ctx = api::ApiContext {
            orchestrator: orchestrator.clone(),
            app_config: app_config.clone(),
            app_env: app_env.clone(),
        };
        App::new().configure(|cfg: &mut web::ServiceConfig| api::configure_http(cfg, ctx.clone()))
    })
    .bind(&bind_addr)?
    .run()
    .await
}

/// Periodically sweeps for timed-out workflows and expired approval-queue
/// entries. Runs for the lifetime of the process; errors are logged and the
/// loop continues rather than unwinding, since one failed scan shouldn't
/// take down monitoring for every other workflow.
fn spawn_periodic_sweep(orchestrator: Arc<Orchestrator<SqliteStore>>, interval_seconds: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            ticker.tick().await;
            if let Err(err) = orchestrator.run_periodic_sweep().await {
                warn!(error = %err, "periodic sweep failed");
            }
        }
    });
}
