use actix_web::web;
use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::store::SqliteStore;
use shared_types::AppConfig;

pub mod http;

#[derive(Clone)]
pub struct ApiContext {
    pub orchestrator: Arc<Orchestrator<SqliteStore>>,
    pub app_config: Arc<AppConfig>,
    /// Current application environment (dev, staging, prod).
    pub app_env: String,
}

pub fn configure_http(cfg: &mut web::ServiceConfig, ctx: ApiContext) {
    http::configure(cfg, ctx);
}
