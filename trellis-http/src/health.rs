//! Liveness/readiness probes over the component registry.
//!
//! | Path            | Behavior                                        |
//! |-----------------|-------------------------------------------------|
//! | `/health`       | Aggregated component health, 200 UP / 503 DOWN  |
//! | `/health/live`  | Always 200                                      |
//! | `/health/ready` | 200 once every component is running and healthy |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use trellis_core::{ComponentStatusInfo, HealthState, LifecycleControl};

#[derive(Clone, Default)]
pub struct HealthSource {
    lifecycle: Option<Arc<dyn LifecycleControl>>,
}

impl HealthSource {
    pub fn new(lifecycle: Arc<dyn LifecycleControl>) -> Self {
        Self {
            lifecycle: Some(lifecycle),
        }
    }

    fn statuses(&self) -> Vec<ComponentStatusInfo> {
        self.lifecycle
            .as_ref()
            .map(|l| l.statuses())
            .unwrap_or_default()
    }
}

#[derive(serde::Serialize)]
struct HealthBody {
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    components: Vec<ComponentStatusInfo>,
}

pub fn health_routes(source: HealthSource) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .with_state(source)
}

async fn health(State(source): State<HealthSource>) -> impl IntoResponse {
    let components = source.statuses();
    let up = components
        .iter()
        .all(|c| c.health.state != HealthState::Unhealthy);
    let status = if up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthBody {
            status: if up { "UP" } else { "DOWN" },
            components,
        }),
    )
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness(State(source): State<HealthSource>) -> impl IntoResponse {
    let components = source.statuses();
    let ready = components
        .iter()
        .all(|c| c.status == "running" && c.health.state != HealthState::Unhealthy);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthBody {
            status: if ready { "UP" } else { "DOWN" },
            components,
        }),
    )
}
