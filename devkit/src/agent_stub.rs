/*!
Stub d'agent de nœud PHP pour développement sans parc réel

Reproduit le contrat HTTP de l'agent (command=status/reset/invalidate) sur un
port éphémère. Enregistre les commandes reçues et permet de simuler un nœud
sans extension OPcache.
*/

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Default)]
struct StubState {
    status_body: Mutex<Value>,
    opcache_loaded: AtomicBool,
    reset_count: AtomicUsize,
    invalidated: Mutex<Vec<String>>,
    existing_scripts: Mutex<HashSet<String>>,
}

/// Agent de nœud simulé, écoute sur 127.0.0.1:0.
pub struct StubAgent {
    addr: SocketAddr,
    state: Arc<StubState>,
    server: JoinHandle<()>,
}

impl StubAgent {
    /// Démarre le stub avec le payload de statut donné.
    pub async fn spawn(status_body: Value) -> Result<Self> {
        env_logger::try_init().ok();

        let state = Arc::new(StubState {
            status_body: Mutex::new(status_body),
            opcache_loaded: AtomicBool::new(true),
            ..StubState::default()
        });

        // toute route mène au routeur de commandes, comme le script PHP
        let router = Router::new()
            .fallback(handle_command)
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        log::info!("[STUB] node agent listening on {addr}");
        Ok(Self {
            addr,
            state,
            server,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Remplace le payload de statut renvoyé.
    pub fn set_status(&self, status_body: Value) {
        *self.state.status_body.lock().unwrap() = status_body;
    }

    /// Simule un nœud sans extension OPcache (500 sur toute commande).
    pub fn set_opcache_missing(&self) {
        self.state.opcache_loaded.store(false, Ordering::SeqCst);
    }

    /// Déclare un script "présent sur disque" pour invalidate.
    pub fn add_existing_script(&self, path: &str) {
        self.state
            .existing_scripts
            .lock()
            .unwrap()
            .insert(path.to_string());
    }

    /// Nombre de commandes reset reçues (pour assertions de tests).
    pub fn reset_count(&self) -> usize {
        self.state.reset_count.load(Ordering::SeqCst)
    }

    /// Scripts invalidés, dans l'ordre de réception.
    pub fn invalidated(&self) -> Vec<String> {
        self.state.invalidated.lock().unwrap().clone()
    }
}

impl Drop for StubAgent {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn reply(code: StatusCode, body: &Value, pretty: bool) -> Response {
    let text = if pretty {
        serde_json::to_string_pretty(body)
    } else {
        serde_json::to_string(body)
    }
    .unwrap_or_else(|_| "{}".to_string());

    (code, [(header::CONTENT_TYPE, "application/json")], text).into_response()
}

async fn handle_command(
    State(state): State<Arc<StubState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !state.opcache_loaded.load(Ordering::SeqCst) {
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({"error": "Opcache extension not loaded"}),
            false,
        );
    }

    let pretty = params.get("pretty").map(|v| v == "1").unwrap_or(false);
    let command = params.get("command").map(String::as_str).unwrap_or("");

    match command {
        "" | "status" => {
            let mut body = state.status_body.lock().unwrap().clone();
            // sans scripts=1, l'agent réel n'inclut pas la section scripts
            let with_scripts = params.get("scripts").map(|v| v == "1").unwrap_or(false);
            if !with_scripts {
                if let Some(status) = body.get_mut("status").and_then(Value::as_object_mut) {
                    status.remove("scripts");
                }
            }
            reply(StatusCode::OK, &body, pretty)
        }
        "reset" => {
            state.reset_count.fetch_add(1, Ordering::SeqCst);
            log::info!("[STUB] opcache reset");
            reply(StatusCode::OK, &json!({"error": null}), pretty)
        }
        "invalidate" => {
            let script = params.get("script").cloned().unwrap_or_default();
            if script.is_empty() {
                return reply(
                    StatusCode::BAD_REQUEST,
                    &json!({"error": "Script not defined"}),
                    pretty,
                );
            }
            if !state.existing_scripts.lock().unwrap().contains(&script) {
                return reply(
                    StatusCode::NOT_FOUND,
                    &json!({"error": "Script not found"}),
                    pretty,
                );
            }
            state.invalidated.lock().unwrap().push(script.clone());
            log::info!("[STUB] invalidated {script}");
            reply(StatusCode::OK, &json!({"error": null}), pretty)
        }
        _ => reply(
            StatusCode::BAD_REQUEST,
            &json!({"error": "Invalid command specified"}),
            pretty,
        ),
    }
}
