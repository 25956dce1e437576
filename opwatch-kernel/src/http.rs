/**
 * API REST OPWATCH - Serveur HTTP principal du kernel
 *
 * RÔLE :
 * Exposer l'état observé du parc à la couche de présentation : arbres de
 * statuts bruts, vues agrégées (scripts, alertes, configuration) et
 * commandes opérateur (refresh, reset, invalidate).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, routes /health, /api/status, /api/nodes, /api/clusters
 * - Les statistiques brutes sortent du store (source de vérité unique)
 * - Les vues agrégées sont recalculées à chaque requête depuis le dernier
 *   snapshot (transformations pures, pas de cache)
 * - ?pretty=1 bascule en JSON indenté, purement cosmétique
 * - Les commandes refresh/reset répondent "OK" dès le déclenchement : le
 *   cycle asynchrone continue en tâche de fond (comportement historique)
 */
use crate::aggregate::{
    self, Alert, ApcuSmaChart, NodeCharts, ScriptAggregate, ScriptRollup,
};
use crate::error::ObserverError;
use crate::models::{ApcuSetting, ConfigValue};
use crate::observer::Observer;
use crate::refresh::RefreshCoordinator;
use crate::state::{StateEvent, Store};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use time::format_description::well_known::Rfc3339;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub observer: Arc<Observer>,
    pub coordinator: Arc<RefreshCoordinator<Observer>>,
    pub started: Instant,
}

#[derive(Debug, Deserialize)]
struct PrettyParams {
    pretty: Option<String>,
}

impl PrettyParams {
    fn enabled(&self) -> bool {
        self.pretty.as_deref() == Some("1")
    }
}

/// Sérialisation JSON avec indentation optionnelle.
fn json_response<T: Serialize>(value: &T, pretty: bool) -> Response {
    let body = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .unwrap_or_else(|_| "{}".to_string());

    (
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct HeartbeatView {
    version: &'static str,
    uptime_seconds: u64,
    last_update: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClustersView {
    clusters: Vec<String>,
    selected: Option<String>,
}

#[derive(Debug, Serialize)]
struct NodeChartsView {
    opcache: NodeCharts,
    apcu: Option<ApcuSmaChart>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/status", get(get_api_status))
        .route("/api/nodes/statistics/opcache", get(get_opcache_statistics))
        .route("/api/nodes/statistics/apcu", get(get_apcu_statistics))
        .route("/api/nodes/statistics/refresh", get(refresh_statistics))
        .route(
            "/api/nodes/{cluster}/{group}/{host}/resetOpcache",
            get(reset_node_opcache),
        )
        .route(
            "/api/nodes/{cluster}/{group}/{host}/invalidate",
            get(invalidate_node_script),
        )
        .route("/api/nodes/{cluster}/{group}/{host}/charts", get(get_node_charts))
        .route("/api/clusters", get(list_clusters))
        .route("/api/clusters/{name}/select", post(select_cluster))
        .route("/api/clusters/{name}/scripts", get(get_cluster_scripts))
        .route(
            "/api/clusters/{name}/groups/{group}/scripts",
            get(get_group_scripts),
        )
        .route("/api/clusters/{name}/alerts", get(get_cluster_alerts))
        .route(
            "/api/clusters/{name}/configuration",
            get(get_cluster_configuration),
        )
        .route(
            "/api/clusters/{name}/apcu/settings",
            get(get_cluster_apcu_settings),
        )
        .with_state(app_state)
}

async fn get_api_status(State(app): State<AppState>) -> Json<HeartbeatView> {
    let last_update = app
        .store
        .snapshot()
        .last_update
        .and_then(|t| t.format(&Rfc3339).ok());
    Json(HeartbeatView {
        version: VERSION,
        uptime_seconds: app.started.elapsed().as_secs(),
        last_update,
    })
}

async fn get_opcache_statistics(
    State(app): State<AppState>,
    Query(params): Query<PrettyParams>,
) -> Response {
    json_response(&app.store.snapshot().opcache, params.enabled())
}

async fn get_apcu_statistics(
    State(app): State<AppState>,
    Query(params): Query<PrettyParams>,
) -> Response {
    json_response(&app.store.snapshot().apcu, params.enabled())
}

/// Déclenche un cycle de refresh et répond immédiatement : le cycle
/// (trigger, attente, re-collecte) continue en tâche de fond.
async fn refresh_statistics(State(app): State<AppState>) -> &'static str {
    let coordinator = app.coordinator.clone();
    tokio::task::spawn(async move {
        if let Err(err) = coordinator.refresh_cluster().await {
            tracing::warn!(%err, "background refresh failed");
        }
    });
    "OK"
}

async fn reset_node_opcache(
    State(app): State<AppState>,
    Path((cluster, group, host)): Path<(String, String, String)>,
) -> Result<&'static str, StatusCode> {
    if !app.observer.knows_node(&cluster, &group, &host) {
        return Err(StatusCode::NOT_FOUND);
    }

    let coordinator = app.coordinator.clone();
    tokio::task::spawn(async move {
        if let Err(err) = coordinator.reset_node(&cluster, &group, &host).await {
            tracing::warn!(%err, "background reset failed");
        }
    });
    Ok("OK")
}

#[derive(Debug, Deserialize)]
struct InvalidateParams {
    script: Option<String>,
}

async fn invalidate_node_script(
    State(app): State<AppState>,
    Path((cluster, group, host)): Path<(String, String, String)>,
    Query(params): Query<InvalidateParams>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let script = params
        .script
        .filter(|s| !s.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "Script not defined".to_string()))?;

    app.observer
        .invalidate_script(&cluster, &group, &host, &script)
        .await
        .map_err(|err| match err {
            ObserverError::UnknownNode { .. } => (StatusCode::NOT_FOUND, err.to_string()),
            ObserverError::Agent(message) => (StatusCode::BAD_GATEWAY, message),
            ObserverError::Transport(message) => (StatusCode::BAD_GATEWAY, message),
        })?;

    Ok(Json(serde_json::json!({ "error": null })))
}

async fn get_node_charts(
    State(app): State<AppState>,
    Path((cluster, group, host)): Path<(String, String, String)>,
) -> Result<Json<NodeChartsView>, StatusCode> {
    let state = app.store.snapshot();

    let opcache = state
        .opcache
        .get(&cluster)
        .and_then(|groups| groups.get(&group))
        .and_then(|hosts| hosts.get(&host))
        .ok_or(StatusCode::NOT_FOUND)?;

    let apcu = state
        .apcu
        .get(&cluster)
        .and_then(|groups| groups.get(&group))
        .and_then(|hosts| hosts.get(&host));

    Ok(Json(NodeChartsView {
        opcache: aggregate::node_charts(opcache),
        apcu: apcu.and_then(aggregate::apcu_sma_chart),
    }))
}

async fn list_clusters(State(app): State<AppState>) -> Json<ClustersView> {
    let state = app.store.snapshot();
    Json(ClustersView {
        clusters: state.opcache.keys().cloned().collect(),
        selected: state.selected_cluster,
    })
}

async fn select_cluster(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> &'static str {
    // pas de validation d'existence : un nom absent dégrade en vues vides
    app.store.dispatch(StateEvent::ClusterSwitched(name));
    "OK"
}

async fn get_cluster_scripts(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Json<ScriptRollup> {
    let state = app.store.snapshot();
    let rollup = state
        .opcache
        .get(&name)
        .map(aggregate::script_rollup)
        .unwrap_or_default();
    Json(rollup)
}

async fn get_group_scripts(
    State(app): State<AppState>,
    Path((name, group)): Path<(String, String)>,
) -> Json<BTreeMap<String, ScriptAggregate>> {
    let state = app.store.snapshot();
    let scripts = state
        .opcache
        .get(&name)
        .map(aggregate::script_rollup)
        .and_then(|mut rollup| rollup.per_group.remove(&group))
        .unwrap_or_default();
    Json(scripts)
}

async fn get_cluster_alerts(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Json<BTreeMap<String, BTreeMap<String, Vec<Alert>>>> {
    let state = app.store.snapshot();
    let alerts = state
        .opcache
        .get(&name)
        .map(aggregate::cluster_alerts)
        .unwrap_or_default();
    Json(alerts)
}

async fn get_cluster_configuration(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Json<BTreeMap<String, BTreeMap<String, BTreeMap<String, ConfigValue>>>> {
    let state = app.store.snapshot();
    let view = state
        .opcache
        .get(&name)
        .map(aggregate::configuration_view)
        .unwrap_or_default();
    Json(view)
}

async fn get_cluster_apcu_settings(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Json<BTreeMap<String, BTreeMap<String, BTreeMap<String, ApcuSetting>>>> {
    let state = app.store.snapshot();
    let view = state
        .apcu
        .get(&name)
        .map(aggregate::apcu_settings_view)
        .unwrap_or_default();
    Json(view)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConf, GroupConf};
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn serve_test_app() -> (String, AppState) {
        let mut groups = BTreeMap::new();
        groups.insert(
            "g1".to_string(),
            GroupConf {
                url_pattern: "http://127.0.0.1:1/{host}".to_string(),
                hosts: vec!["h1".to_string()],
                basic_auth: None,
            },
        );
        let mut clusters = BTreeMap::new();
        clusters.insert("c1".to_string(), ClusterConf { groups });

        let observer = Arc::new(Observer::new(clusters));
        let store = Store::new();
        store.dispatch(StateEvent::OpcacheFetched {
            tree: observer.opcache_snapshot(),
            at: OffsetDateTime::now_utc(),
        });
        let coordinator = Arc::new(RefreshCoordinator::new(
            observer.clone(),
            store.clone(),
            Duration::from_millis(10),
        ));
        let app_state = AppState {
            store,
            observer,
            coordinator,
            started: Instant::now(),
        };

        let router = build_router(app_state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{addr}"), app_state)
    }

    #[tokio::test]
    async fn health_and_heartbeat_respond() {
        let (base, _app) = serve_test_app().await;

        let body = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        let heartbeat: serde_json::Value = reqwest::get(format!("{base}/api/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(heartbeat["version"], VERSION);
    }

    #[tokio::test]
    async fn opcache_statistics_support_pretty_formatting() {
        let (base, _app) = serve_test_app().await;

        let compact = reqwest::get(format!("{base}/api/nodes/statistics/opcache"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(!compact.contains('\n'));

        let pretty = reqwest::get(format!("{base}/api/nodes/statistics/opcache?pretty=1"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(pretty.contains('\n'));
        // même contenu sémantique
        let a: serde_json::Value = serde_json::from_str(&compact).unwrap();
        let b: serde_json::Value = serde_json::from_str(&pretty).unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn cluster_listing_reflects_store_selection() {
        let (base, app) = serve_test_app().await;

        let clusters: serde_json::Value = reqwest::get(format!("{base}/api/clusters"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(clusters["clusters"][0], "c1");
        assert_eq!(clusters["selected"], "c1");

        let client = reqwest::Client::new();
        client
            .post(format!("{base}/api/clusters/elsewhere/select"))
            .send()
            .await
            .unwrap();
        assert_eq!(app.store.selected_cluster(), Some("elsewhere".to_string()));
    }

    #[tokio::test]
    async fn absent_cluster_views_are_empty_not_errors() {
        let (base, _app) = serve_test_app().await;

        let rollup: serde_json::Value =
            reqwest::get(format!("{base}/api/clusters/missing/scripts"))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(rollup["all"], serde_json::json!({}));
        assert_eq!(rollup["per_group"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn reset_of_unknown_node_is_404() {
        let (base, _app) = serve_test_app().await;

        let status = reqwest::get(format!("{base}/api/nodes/c1/g1/ghost/resetOpcache"))
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalidate_requires_a_script_parameter() {
        let (base, _app) = serve_test_app().await;

        let status = reqwest::get(format!("{base}/api/nodes/c1/g1/h1/invalidate"))
            .await
            .unwrap()
            .status();
        assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn node_charts_404_for_unknown_node() {
        let (base, _app) = serve_test_app().await;

        let ok = reqwest::get(format!("{base}/api/nodes/c1/g1/h1/charts"))
            .await
            .unwrap()
            .status();
        assert_eq!(ok, reqwest::StatusCode::OK);

        let missing = reqwest::get(format!("{base}/api/nodes/c1/g1/ghost/charts"))
            .await
            .unwrap()
            .status();
        assert_eq!(missing, reqwest::StatusCode::NOT_FOUND);
    }
}
