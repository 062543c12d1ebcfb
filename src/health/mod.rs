//! Health check endpoints.
//!
//! `/health` answers while the process runs, `/ready` reflects shard
//! readiness and bus connectivity for the orchestrator, `/metrics`
//! renders Prometheus text.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::shard::{GroupStatus, ShardStatus};
use crate::supervisor::Courier;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_ms: u64,
    pub managers: Vec<String>,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub total_events: i64,
    pub managers: Vec<ManagerStatus>,
}

#[derive(Debug, Serialize)]
pub struct ManagerStatus {
    pub identifier: String,
    pub display_name: String,
    pub bus_connected: bool,
    pub error: String,
    pub shard_groups: Vec<GroupStatusView>,
}

#[derive(Debug, Serialize)]
pub struct GroupStatusView {
    pub id: i32,
    pub status: GroupStatus,
    pub error: String,
    pub shards: Vec<ShardStatusView>,
}

#[derive(Debug, Serialize)]
pub struct ShardStatusView {
    pub shard_id: u32,
    pub status: ShardStatus,
    pub latency_ms: u64,
    pub uptime_ms: u64,
    pub events: i64,
}

/// Application state for health endpoints.
#[derive(Clone)]
pub struct AppState {
    pub courier: Arc<Courier>,
}

/// Create the health check router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Always 200 while the process is running.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_ms: state.courier.uptime().as_millis() as u64,
        managers: state
            .courier
            .managers()
            .iter()
            .map(|m| m.ctx.identifier.clone())
            .collect(),
    })
}

/// 200 once every manager with running groups has a ready group and
/// its bus connection is up.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut managers = Vec::new();
    let mut ready = true;

    for manager in state.courier.managers() {
        let bus_connected = manager
            .ctx
            .publisher
            .read()
            .as_ref()
            .map(|p| p.is_connected())
            .unwrap_or(false);

        let mut groups = Vec::new();
        let mut manager_ready = false;
        let mut has_running_groups = false;

        for (group_id, group) in manager.shard_groups() {
            let status = group.ctx.status();
            if !matches!(status, GroupStatus::Closed | GroupStatus::Replaced) {
                has_running_groups = true;
            }
            if status == GroupStatus::Ready {
                manager_ready = true;
            }

            let shards = group
                .shards()
                .iter()
                .map(|shard| ShardStatusView {
                    shard_id: shard.shard_id,
                    status: shard.status(),
                    latency_ms: shard.latency().as_millis() as u64,
                    uptime_ms: shard.start.elapsed().as_millis() as u64,
                    events: shard.events_received(),
                })
                .collect();

            groups.push(GroupStatusView {
                id: group_id,
                status,
                error: group.ctx.error(),
                shards,
            });
        }

        if has_running_groups && !manager_ready {
            ready = false;
        }
        if !bus_connected {
            ready = false;
        }

        managers.push(ManagerStatus {
            identifier: manager.ctx.identifier.clone(),
            display_name: manager.ctx.display_name.clone(),
            bus_connected,
            error: manager.ctx.last_error(),
            shard_groups: groups,
        });
    }

    if managers.is_empty() {
        ready = false;
    }

    let response = ReadyResponse {
        ready,
        total_events: state.courier.total_events(),
        managers,
    };

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    for manager in state.courier.managers() {
        let ready: usize = manager
            .shard_groups()
            .iter()
            .map(|(_, g)| g.shards_ready())
            .sum();
        state
            .courier
            .process
            .metrics
            .set_shards_ready(&manager.ctx.identifier, ready);

        if let Some(publisher) = manager.ctx.publisher.read().clone() {
            state
                .courier
                .process
                .metrics
                .set_bus_connected(publisher.is_connected());
        }
    }

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.courier.process.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serializes() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.3.0",
            uptime_ms: 1234,
            managers: vec!["courier".to_string()],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("courier"));
    }

    #[test]
    fn ready_response_serializes_statuses_as_strings() {
        let response = ReadyResponse {
            ready: true,
            total_events: 10,
            managers: vec![ManagerStatus {
                identifier: "courier".to_string(),
                display_name: "Courier".to_string(),
                bus_connected: true,
                error: String::new(),
                shard_groups: vec![GroupStatusView {
                    id: 0,
                    status: GroupStatus::Ready,
                    error: String::new(),
                    shards: vec![ShardStatusView {
                        shard_id: 0,
                        status: ShardStatus::Ready,
                        latency_ms: 42,
                        uptime_ms: 1000,
                        events: 7,
                    }],
                }],
            }],
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"ready\":true"));
        assert!(json.contains("\"status\":\"ready\""));
    }
}
