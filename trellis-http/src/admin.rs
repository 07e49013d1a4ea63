//! Runtime admin surface: protection rules, breaker controls, scheduler
//! tasks, and component lifecycle.
//!
//! Mounted by the server when `server.enable_admin` is set. Every mutation
//! delegates to the owning component's thread-safe API, so concurrent
//! evaluations observe either the old or the new rule, never a mix.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use trellis_core::{Error, LifecycleControl};
use trellis_protection::{ProtectionEngine, RateLimitRule};
use trellis_scheduler::Scheduler;

use crate::envelope::{Api, ApiError, ApiResult};

#[derive(Clone)]
pub struct AdminState {
    pub protection: Arc<ProtectionEngine>,
    pub scheduler: Option<Scheduler>,
    pub lifecycle: Option<Arc<dyn LifecycleControl>>,
}

impl AdminState {
    pub fn new(protection: Arc<ProtectionEngine>) -> Self {
        Self {
            protection,
            scheduler: None,
            lifecycle: None,
        }
    }

    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn LifecycleControl>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    fn scheduler(&self) -> Result<&Scheduler, ApiError> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| ApiError(Error::unavailable("scheduler is not installed")))
    }

    fn lifecycle(&self) -> Result<&Arc<dyn LifecycleControl>, ApiError> {
        self.lifecycle
            .as_ref()
            .ok_or_else(|| ApiError(Error::unavailable("lifecycle manager is not installed")))
    }
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/api/rate-limits", get(list_rate_limits))
        .route(
            "/admin/api/rate-limits/{resource}",
            put(upsert_rate_limit).delete(delete_rate_limit),
        )
        .route("/admin/api/circuit-breakers", get(list_circuit_breakers))
        .route(
            "/admin/api/circuit-breakers/{resource}/{action}",
            post(breaker_action),
        )
        .route("/scheduler/tasks", get(list_tasks))
        .route("/scheduler/tasks/{id}/{action}", post(task_action))
        .route("/plugins/status", get(plugin_status))
        .route("/plugins/{name}/restart", post(restart_plugin))
        .with_state(state)
}

async fn list_rate_limits(State(state): State<AdminState>) -> ApiResult<Vec<RateLimitRule>> {
    Ok(Api(state.protection.rate_rules()))
}

async fn upsert_rate_limit(
    State(state): State<AdminState>,
    Path(resource): Path<String>,
    Json(mut rule): Json<RateLimitRule>,
) -> ApiResult<RateLimitRule> {
    // The path is authoritative for which resource the rule governs.
    rule.resource = resource;
    state
        .protection
        .upsert_rate_rule(rule.clone())
        .map_err(|e| ApiError(Error::invalid_argument(e.to_string())))?;
    Ok(Api(rule))
}

async fn delete_rate_limit(
    State(state): State<AdminState>,
    Path(resource): Path<String>,
) -> ApiResult<serde_json::Value> {
    if state.protection.delete_rate_rule(&resource) {
        Ok(Api(serde_json::json!({ "deleted": resource })))
    } else {
        Err(ApiError(Error::not_found(format!(
            "no rate limit rule for resource '{resource}'"
        ))))
    }
}

async fn list_circuit_breakers(State(state): State<AdminState>) -> ApiResult<serde_json::Value> {
    let rules = state.protection.breaker_rules();
    let states = state.protection.breaker_snapshots();
    Ok(Api(serde_json::json!({
        "rules": rules,
        "states": states,
    })))
}

async fn breaker_action(
    State(state): State<AdminState>,
    Path((resource, action)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    match action.as_str() {
        "open" => state.protection.force_open(&resource).map_err(ApiError)?,
        "close" => state.protection.force_close(&resource).map_err(ApiError)?,
        other => {
            return Err(ApiError(Error::invalid_argument(format!(
                "unknown breaker action '{other}', expected open or close"
            ))))
        }
    }
    Ok(Api(serde_json::json!({ "resource": resource, "action": action })))
}

async fn list_tasks(State(state): State<AdminState>) -> ApiResult<Vec<trellis_scheduler::TaskInfo>> {
    Ok(Api(state.scheduler()?.list()))
}

async fn task_action(
    State(state): State<AdminState>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let scheduler = state.scheduler()?;
    match action.as_str() {
        "pause" => scheduler.pause(&id).map_err(ApiError)?,
        "resume" => scheduler.resume(&id).map_err(ApiError)?,
        "cancel" => scheduler.cancel(&id).map_err(ApiError)?,
        other => {
            return Err(ApiError(Error::invalid_argument(format!(
                "unknown task action '{other}', expected pause, resume or cancel"
            ))))
        }
    }
    Ok(Api(serde_json::json!({ "id": id, "action": action })))
}

async fn plugin_status(
    State(state): State<AdminState>,
) -> ApiResult<Vec<trellis_core::ComponentStatusInfo>> {
    Ok(Api(state.lifecycle()?.statuses()))
}

#[derive(Deserialize)]
struct RestartParams {
    #[serde(default)]
    cascade: bool,
}

async fn restart_plugin(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(params): Query<RestartParams>,
) -> ApiResult<serde_json::Value> {
    state
        .lifecycle()?
        .restart(&name, params.cascade)
        .await
        .map_err(ApiError)?;
    Ok(Api(serde_json::json!({ "restarted": name })))
}
