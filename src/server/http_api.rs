// src/server/http_api.rs

//! The admin HTTP API: provisioning, service listing, and the Prometheus
//! metrics endpoint.

use crate::core::aha::AhaCell;
use crate::core::cell::CellLogic;
use crate::core::errors::AhaError;
use crate::core::metrics::{self, gather_metrics};
use crate::core::registry;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

fn ok_body(result: Value) -> Json<Value> {
    Json(json!({"status": "ok", "result": result}))
}

fn err_body(code: &str, mesg: impl Into<String>) -> Json<Value> {
    Json(json!({"status": "err", "code": code, "mesg": mesg.into()}))
}

fn err_from(e: &AhaError) -> Json<Value> {
    err_body(e.code(), e.to_string())
}

/// Resolves HTTP basic auth against the cell's user database. Admin-only
/// endpoints pass `need_admin`.
fn check_auth(aha: &Arc<AhaCell>, headers: &HeaderMap, need_admin: bool) -> Result<String, Json<Value>> {
    let denied = || err_body("AuthDeny", "authentication required");

    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(denied)?;
    let encoded = value.strip_prefix("Basic ").ok_or_else(denied)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| denied())?;
    let text = String::from_utf8(decoded).map_err(|_| denied())?;
    let (user, passwd) = text.split_once(':').ok_or_else(denied)?;

    let (name, admin) = aha
        .auth_user_passwd(user, passwd)
        .map_err(|e| err_from(&e))?;
    if need_admin && !admin {
        return Err(err_body("AuthDeny", format!("user {name} is not an admin")));
    }
    Ok(name)
}

/// POST /api/v1/aha/provision/service
async fn provision_service(
    State(aha): State<Arc<AhaCell>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    if let Err(resp) = check_auth(&aha, &headers, true) {
        return resp;
    }

    let Ok(body) = serde_json::from_slice::<Value>(&body) else {
        return err_body("SchemaViolation", "request body must be a JSON object");
    };
    let Some(map) = body.as_object() else {
        return err_body("SchemaViolation", "request body must be a JSON object");
    };

    for key in map.keys() {
        if key != "name" && key != "provinfo" {
            return err_body("SchemaViolation", format!("unknown key '{key}'"));
        }
    }

    let name = match map.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return err_body("SchemaViolation", "'name' must be a non-empty string"),
    };

    let provinfo = match map.get("provinfo") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let Some(info) = value.as_object() else {
                return err_body("SchemaViolation", "'provinfo' must be an object");
            };
            for key in ["dmon:port", "https:port"] {
                if let Some(port) = info.get(key) {
                    match port.as_u64() {
                        Some(port) if port <= u16::MAX as u64 => {}
                        _ => {
                            return err_body(
                                "SchemaViolation",
                                format!("'{key}' must be a valid port"),
                            );
                        }
                    }
                }
            }
            Some(value.clone())
        }
    };

    match aha.add_aha_svc_prov(&name, provinfo).await {
        Ok(url) => ok_body(json!({"url": url})),
        Err(e) => err_from(&e),
    }
}

/// GET /api/v1/aha/services
async fn list_services(
    State(aha): State<Arc<AhaCell>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    if let Err(resp) = check_auth(&aha, &headers, true) {
        return resp;
    }

    let mut network = None;
    if !body.is_empty() {
        let Ok(body) = serde_json::from_slice::<Value>(&body) else {
            return err_body("SchemaViolation", "request body must be a JSON object");
        };
        let Some(map) = body.as_object() else {
            return err_body("SchemaViolation", "request body must be a JSON object");
        };
        for key in map.keys() {
            if key != "network" {
                return err_body("SchemaViolation", format!("unknown key '{key}'"));
            }
        }
        match map.get("network") {
            None => {}
            Some(Value::String(netw)) => network = Some(netw.clone()),
            Some(_) => return err_body("SchemaViolation", "'network' must be a string"),
        }
    }

    let result: Vec<Value> = aha
        .get_aha_svcs(network.as_deref())
        .into_iter()
        .map(|rec| {
            json!({
                "name": rec.fullname(),
                "network": rec.network,
                "svcinfo": rec.svcinfo,
            })
        })
        .collect();
    ok_body(json!(result))
}

/// GET /metrics in the Prometheus text format.
async fn metrics_handler(State(aha): State<Arc<AhaCell>>) -> impl IntoResponse {
    metrics::NEXUS_INDX.set(aha.nexus.current_indx() as f64);
    metrics::SERVICES_ONLINE.set(registry::online_svcs(&aha.hive).len() as f64);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

/// Binds and serves the HTTP API, returning the bound address.
pub async fn start(
    aha: Arc<AhaCell>,
    port: u16,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<SocketAddr, AhaError> {
    let app = Router::new()
        .route("/api/v1/aha/provision/service", post(provision_service))
        .route("/api/v1/aha/services", get(list_services))
        .route("/metrics", get(metrics_handler))
        .with_state(aha);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("admin HTTP API listening on http://{bound}");

    tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("HTTP API shutting down.");
        });
        if let Err(e) = serve.await {
            error!("HTTP API server error: {e}");
        }
    });

    Ok(bound)
}
