//! Request handlers for the shim surface

use super::ApiState;
use crate::metrics::metrics;
use crate::storage::{AlertQuery, EventQuery, StorageError};
use crate::types::{Alert, AlertRule, ChangeEvent, ChangeType};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

fn storage_error(e: StorageError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::Integrity(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({ "error": e.to_string() })))
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /metrics
///
/// Prometheus text format 0.0.4, hand-rendered from the process-global
/// registry.
pub async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics().render(),
    )
}

/// GET /api/v1/status
///
/// Operational snapshot: queue pressure, worker counters, cache stats.
pub async fn status(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "queue": state.queue.stats(),
        "worker": state.worker_stats.snapshot(),
        "cache": state.cache.stats(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChangesQuery {
    #[serde(default)]
    pub change_type: Option<ChangeType>,
    #[serde(default)]
    pub unprocessed: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/changes
pub async fn list_changes(
    State(state): State<ApiState>,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<Vec<ChangeEvent>>, (StatusCode, Json<serde_json::Value>)> {
    let events = state
        .stores
        .changes
        .list_events(&EventQuery {
            since: None,
            change_type: query.change_type,
            unprocessed_only: query.unprocessed.unwrap_or(false),
            limit: query.limit.unwrap_or(100),
        })
        .map_err(storage_error)?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub unresolved: Option<bool>,
    #[serde(default)]
    pub unacknowledged: Option<bool>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// GET /api/v1/alerts
pub async fn list_alerts(
    State(state): State<ApiState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<Alert>>, (StatusCode, Json<serde_json::Value>)> {
    let alerts = state
        .stores
        .changes
        .list_alerts(&AlertQuery {
            unresolved_only: query.unresolved.unwrap_or(false),
            unacknowledged_only: query.unacknowledged.unwrap_or(false),
            limit: query.limit.unwrap_or(100),
        })
        .map_err(storage_error)?;
    Ok(Json(alerts))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeBody {
    pub by: String,
}

/// POST /api/v1/alerts/:id/acknowledge
pub async fn acknowledge_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AcknowledgeBody>,
) -> Result<Json<Alert>, (StatusCode, Json<serde_json::Value>)> {
    let mut alert = state
        .stores
        .changes
        .get_alert(id)
        .map_err(storage_error)?
        .ok_or_else(|| storage_error(StorageError::NotFound(format!("alert {id}"))))?;

    if !alert.is_acknowledged {
        alert.acknowledge(&body.by);
        state
            .stores
            .changes
            .update_alert(&alert)
            .map_err(storage_error)?;
        tracing::info!(alert_id = %id, by = %body.by, "Alert acknowledged");
    }
    Ok(Json(alert))
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// POST /api/v1/alerts/:id/resolve
///
/// Resolving implies acknowledgement.
pub async fn resolve_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<Alert>, (StatusCode, Json<serde_json::Value>)> {
    let mut alert = state
        .stores
        .changes
        .get_alert(id)
        .map_err(storage_error)?
        .ok_or_else(|| storage_error(StorageError::NotFound(format!("alert {id}"))))?;

    if !alert.is_resolved {
        alert.resolve(&body.by, body.notes);
        state
            .stores
            .changes
            .update_alert(&alert)
            .map_err(storage_error)?;
        tracing::info!(alert_id = %id, by = %body.by, "Alert resolved");
    }
    Ok(Json(alert))
}

/// GET /api/v1/alert-rules
pub async fn list_alert_rules(
    State(state): State<ApiState>,
) -> Result<Json<Vec<AlertRule>>, (StatusCode, Json<serde_json::Value>)> {
    let rules = state
        .stores
        .changes
        .list_active_rules()
        .map_err(storage_error)?;
    Ok(Json(rules))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::config::{CacheSettings, IngestionSettings};
    use crate::ingestion::BackpressureQueue;
    use crate::resolution::WorkerStats;
    use crate::storage::Stores;
    use crate::types::AlertSeverity;
    use chrono::Utc;
    use std::sync::Arc;

    fn state() -> (tempfile::TempDir, ApiState) {
        let tmp = tempfile::tempdir().unwrap();
        let stores = Stores::open(tmp.path()).unwrap();
        let api_state = ApiState::new(
            stores,
            Arc::new(BackpressureQueue::new(&IngestionSettings::default())),
            Arc::new(TtlCache::new(&CacheSettings::default())),
            Arc::new(WorkerStats::default()),
        );
        (tmp, api_state)
    }

    fn alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Warning,
            change_event_id: Uuid::new_v4(),
            title: "t".to_string(),
            message: "m".to_string(),
            created_at: Utc::now(),
            asset_id: None,
            dependency_id: None,
            is_acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            is_resolved: false,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            notification_sent: false,
            notification_channels: None,
            auto_clear_eligible: false,
            auto_cleared: false,
        }
    }

    #[tokio::test]
    async fn test_acknowledge_flow() {
        let (_tmp, state) = state();
        let a = alert();
        state.stores.changes.insert_alert(&a).unwrap();

        let result = acknowledge_alert(
            State(state.clone()),
            Path(a.id),
            Json(AcknowledgeBody {
                by: "ops@example.com".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(result.0.is_acknowledged);

        let stored = state.stores.changes.get_alert(a.id).unwrap().unwrap();
        assert_eq!(stored.acknowledged_by.as_deref(), Some("ops@example.com"));
    }

    #[tokio::test]
    async fn test_resolve_implies_acknowledge() {
        let (_tmp, state) = state();
        let a = alert();
        state.stores.changes.insert_alert(&a).unwrap();

        let result = resolve_alert(
            State(state.clone()),
            Path(a.id),
            Json(ResolveBody {
                by: "ops".to_string(),
                notes: Some("fixed".to_string()),
            }),
        )
        .await
        .unwrap();
        assert!(result.0.is_resolved);
        assert!(result.0.is_acknowledged);
        assert_eq!(result.0.resolution_notes.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_unknown_alert_404() {
        let (_tmp, state) = state();
        let err = acknowledge_alert(
            State(state),
            Path(Uuid::new_v4()),
            Json(AcknowledgeBody {
                by: "ops".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_changes_filters() {
        let (_tmp, state) = state();
        state
            .stores
            .changes
            .append_event(&ChangeEvent::new(ChangeType::DependencyCreated, "a"))
            .unwrap();
        state
            .stores
            .changes
            .append_event(&ChangeEvent::new(ChangeType::AssetDiscovered, "b"))
            .unwrap();

        let all = list_changes(
            State(state.clone()),
            Query(ChangesQuery {
                change_type: None,
                unprocessed: None,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(all.0.len(), 2);

        let filtered = list_changes(
            State(state),
            Query(ChangesQuery {
                change_type: Some(ChangeType::AssetDiscovered),
                unprocessed: None,
                limit: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(filtered.0.len(), 1);
    }
}
