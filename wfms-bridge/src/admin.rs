// WFMS Bridge - admin HTTP interface
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Local admin interface
//!
//! Read access to health, logs, rules and configuration; write access to the
//! rules and the log level. POST routes require a bearer token when one is
//! configured.

use crate::logging::LogLevel;
use crate::metrics::{encode_metrics, refresh};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use wfms::runtime::DEFAULT_LOG_LIMIT;
use wfms::{Health, LogEntry, RulesEngine, RulesUpdate, RulesView, RuntimeState};
use wfms_gateway::{GatewayConfig, GatewayService};

/// Admin request failure
#[derive(Debug, Error, PartialEq)]
pub enum AdminError {
    #[error("missing or malformed bearer token")]
    Unauthorized,

    #[error("invalid token")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match self {
            AdminError::Unauthorized => StatusCode::UNAUTHORIZED,
            AdminError::Forbidden => StatusCode::FORBIDDEN,
            AdminError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Read-only part of `GET /config`
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub site: String,
    pub uart_port: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub simulated: bool,
}

impl StaticConfig {
    pub fn new(config: &GatewayConfig, simulated: bool) -> Self {
        Self {
            site: config.site.clone(),
            uart_port: config.serial.port.clone(),
            mqtt_host: config.mqtt.host.clone(),
            mqtt_port: config.mqtt.port,
            simulated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigView {
    pub site: String,
    pub uart_port: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub simulated: bool,
    pub log_level: String,
    pub api_auth_enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConfigUpdate {
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
}

/// State shared by the handlers
pub struct AppState {
    rules: Arc<RulesEngine>,
    runtime: Arc<RuntimeState>,
    config: StaticConfig,
    api_token: Option<String>,
    log_level: LogLevel,
}

impl AppState {
    pub fn new(
        rules: Arc<RulesEngine>,
        runtime: Arc<RuntimeState>,
        config: StaticConfig,
        api_token: Option<String>,
        log_level: LogLevel,
    ) -> Self {
        Self {
            rules,
            runtime,
            config,
            api_token,
            log_level,
        }
    }

    /// Wire the admin interface to a running gateway
    pub fn for_service(service: &GatewayService, simulated: bool, log_level: LogLevel) -> Self {
        let config = service.config();
        Self::new(
            service.rules(),
            service.runtime(),
            StaticConfig::new(config, simulated),
            config.admin.api_token.clone(),
            log_level,
        )
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), AdminError> {
        let Some(expected) = self.api_token.as_deref() else {
            return Ok(());
        };
        let provided = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AdminError::Unauthorized)?;
        if provided != expected {
            return Err(AdminError::Forbidden);
        }
        Ok(())
    }

    fn config_view(&self) -> ConfigView {
        ConfigView {
            site: self.config.site.clone(),
            uart_port: self.config.uart_port.clone(),
            mqtt_host: self.config.mqtt_host.clone(),
            mqtt_port: self.config.mqtt_port,
            simulated: self.config.simulated,
            log_level: self.log_level.current().to_string(),
            api_auth_enabled: self.api_token.is_some(),
        }
    }
}

/// Build the admin router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/logs", get(logs_handler))
        .route("/rules", get(get_rules).post(update_rules))
        .route("/config", get(get_config).post(update_config))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(state.runtime.get_health())
}

async fn logs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> Json<Vec<LogEntry>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(state.runtime.get_logs(limit, query.level.as_deref()))
}

async fn get_rules(State(state): State<Arc<AppState>>) -> Json<RulesView> {
    Json(state.rules.config().view())
}

async fn update_rules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RulesView>, AdminError> {
    state.authorize(&headers)?;
    let update: RulesUpdate = serde_json::from_slice(&body)
        .map_err(|e| AdminError::BadRequest(format!("invalid rules body: {}", e)))?;

    let config = state
        .rules
        .apply(&update)
        .map_err(|e| AdminError::BadRequest(e.to_string()))?;

    let view = config.view();
    info!(?view, "rules updated");
    state.runtime.add_log(
        "INFO",
        format!(
            "Rules updated: lock={} cooldownPerActor={}s cooldownGlobal={}s dedupeTtl={}s",
            view.lock, view.cooldown_per_actor, view.cooldown_global, view.dedupe_ttl
        ),
    );
    Ok(Json(view))
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigView> {
    Json(state.config_view())
}

async fn update_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ConfigView>, AdminError> {
    state.authorize(&headers)?;
    let update: ConfigUpdate = serde_json::from_slice(&body)
        .map_err(|e| AdminError::BadRequest(format!("only logLevel can be updated: {}", e)))?;

    if let Some(level) = update.log_level {
        let level = state.log_level.set(&level).map_err(AdminError::BadRequest)?;
        info!(level, "log level changed");
        state
            .runtime
            .add_log("INFO", format!("Log level set to {}", level));
    }
    Ok(Json(state.config_view()))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    refresh(&state.runtime.get_health());
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
        encode_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use wfms::RulesConfig;

    fn state(token: Option<&str>) -> Arc<AppState> {
        let config = StaticConfig::new(&GatewayConfig::default(), true);
        Arc::new(AppState::new(
            Arc::new(RulesEngine::new(RulesConfig::default())),
            Arc::new(RuntimeState::new(100)),
            config,
            token.map(str::to_string),
            LogLevel::detached("info"),
        ))
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_health() {
        let state = state(None);
        state.runtime.set_bus_connected(true);
        state.runtime.inc_commands();

        let Json(health) = health_handler(State(state)).await;
        assert!(health.up);
        assert_eq!(health.counters.commands, 1);
    }

    #[tokio::test]
    async fn test_logs_newest_first() {
        let state = state(None);
        state.runtime.add_log("INFO", "first");
        state.runtime.add_log("WARNING", "second");
        state.runtime.add_log("INFO", "third");

        let query = LogsQuery {
            limit: Some(2),
            level: None,
        };
        let Json(logs) = logs_handler(State(state.clone()), Query(query)).await;
        let messages: Vec<_> = logs.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["third", "second"]);

        let query = LogsQuery {
            limit: None,
            level: Some("warning".to_string()),
        };
        let Json(logs) = logs_handler(State(state), Query(query)).await;
        assert_eq!(logs.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_partial_update() {
        let state = state(None);
        let body = Bytes::from(r#"{"lock": true, "cooldownGlobal": 5}"#);

        let Json(view) = update_rules(State(state.clone()), HeaderMap::new(), body)
            .await
            .unwrap();
        assert!(view.lock);
        assert_eq!(view.cooldown_global, 5);
        assert_eq!(view.cooldown_per_actor, 3);

        let Json(current) = get_rules(State(state.clone())).await;
        assert_eq!(current, view);
        let logs = state.runtime.get_logs(1, None);
        assert!(logs[0].message.starts_with("Rules updated"));
    }

    #[tokio::test]
    async fn test_rules_out_of_range_rejected() {
        let state = state(None);
        let body = Bytes::from(r#"{"cooldownGlobal": 61}"#);

        let result = update_rules(State(state.clone()), HeaderMap::new(), body).await;
        assert!(matches!(result, Err(AdminError::BadRequest(_))));
        assert_eq!(state.rules.config(), RulesConfig::default());

        let body = Bytes::from("not json");
        let result = update_rules(State(state), HeaderMap::new(), body).await;
        assert!(matches!(result, Err(AdminError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_auth() {
        let state = state(Some("s3cret"));
        let body = || Bytes::from(r#"{"lock": true}"#);

        let result = update_rules(State(state.clone()), HeaderMap::new(), body()).await;
        assert_eq!(result.unwrap_err(), AdminError::Unauthorized);

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        let result = update_rules(State(state.clone()), basic, body()).await;
        assert_eq!(result.unwrap_err(), AdminError::Unauthorized);

        let result = update_rules(State(state.clone()), bearer("wrong"), body()).await;
        assert_eq!(result.unwrap_err(), AdminError::Forbidden);
        assert!(!state.rules.config().lock);

        let result = update_rules(State(state.clone()), bearer("s3cret"), body()).await;
        assert!(result.unwrap().0.lock);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AdminError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AdminError::Forbidden.into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AdminError::BadRequest("x".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_config_log_level() {
        let state = state(Some("s3cret"));

        let Json(view) = get_config(State(state.clone())).await;
        assert_eq!(view.site, "lab1");
        assert_eq!(view.mqtt_port, 1883);
        assert_eq!(view.log_level, "info");
        assert!(view.api_auth_enabled);

        let body = Bytes::from(r#"{"logLevel": "DEBUG"}"#);
        let Json(view) = update_config(State(state.clone()), bearer("s3cret"), body)
            .await
            .unwrap();
        assert_eq!(view.log_level, "debug");

        let body = Bytes::from(r#"{"site": "other"}"#);
        let result = update_config(State(state.clone()), bearer("s3cret"), body).await;
        assert!(matches!(result, Err(AdminError::BadRequest(_))));

        let body = Bytes::from(r#"{"logLevel": "chatty"}"#);
        let result = update_config(State(state), bearer("s3cret"), body).await;
        assert!(matches!(result, Err(AdminError::BadRequest(_))));
    }
}
