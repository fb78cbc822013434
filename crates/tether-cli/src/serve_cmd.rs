use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use tether_core::agent::{AGENT_PATH, AgentEndpoint, AgentRequest};
use tether_core::error::TetherError;
use tether_core::settings::Settings;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl From<TetherError> for AppError {
    fn from(err: TetherError) -> Self {
        let status = match &err {
            TetherError::NotFound { .. } => StatusCode::NOT_FOUND,
            TetherError::Protocol(_) | TetherError::Invalid(_) => StatusCode::BAD_REQUEST,
            TetherError::Forbidden(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "agent request failed");
            return Self {
                status,
                message: "internal error".to_owned(),
            };
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(endpoint: AgentEndpoint) -> Router {
    Router::new()
        .route(AGENT_PATH, get(agent))
        .route(AGENT_PATH.trim_end_matches('/'), get(agent))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(endpoint)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(pool: PgPool, settings: Settings, bind: &str, port: u16) -> Result<()> {
    let endpoint = AgentEndpoint::new(Arc::new(pool), Arc::new(settings));
    let app = build_router(endpoint);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("tether serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("tether serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C; shutting down");
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Bootstrap script or `OK` as `text/plain`.
async fn agent(
    State(endpoint): State<AgentEndpoint>,
    Query(request): Query<AgentRequest>,
) -> Result<String, AppError> {
    Ok(endpoint.handle(&request).await?)
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;
    use uuid::Uuid;

    use tether_core::agent::{AgentEndpoint, CallbackTokens};
    use tether_core::settings::Settings;
    use tether_db::models::{ComputingKind, Task, TaskStatus};
    use tether_db::queries::tasks::{self, NewTask};
    use tether_test_utils::{create_test_db, drop_test_db, seed_computing, seed_container};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn settings() -> Settings {
        Settings {
            callback_url: "http://orchestrator:8080".into(),
            ..Settings::default()
        }
    }

    async fn send_request(pool: PgPool, settings: Settings, uri: &str) -> axum::response::Response {
        let app = super::build_router(AgentEndpoint::new(Arc::new(pool), Arc::new(settings)));
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed_task(pool: &PgPool) -> Task {
        let container = seed_container(pool).await;
        let computing = seed_computing(pool, ComputingKind::Remote).await;
        tasks::insert_task(
            pool,
            &NewTask {
                owner_id: Uuid::new_v4(),
                name: "notebook".into(),
                container_id: container.id,
                computing_id: computing.id,
                port: None,
                auth_user: None,
                auth_pass: None,
                extra_binds: None,
                options: Default::default(),
            },
        )
        .await
        .unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_health() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_request(pool.clone(), settings(), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_bootstrap_returns_script() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;

        let uri = format!("/api/v1/agent/?task_id={}&action=bootstrap", task.id);
        let resp = send_request(pool.clone(), settings(), &uri).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .expect("should have content-type header")
            .to_str()
            .unwrap()
            .to_owned();
        assert!(content_type.starts_with("text/plain"), "got: {content_type}");

        let script = body_text(resp).await;
        assert!(script.starts_with("#!/bin/bash"));
        assert!(script.contains(&task.id.to_string()));
        assert!(script.contains("http://orchestrator:8080/api/v1/agent/"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_set_ip_port_marks_running() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;

        for (ip, port) in [("10.1.1.1", 50001), ("10.1.1.2", 50123)] {
            let uri = format!(
                "/api/v1/agent?task_id={}&action=set_ip_port&ip={ip}&port={port}",
                task.id
            );
            let resp = send_request(pool.clone(), settings(), &uri).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_text(resp).await, "OK");
        }

        let stored = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert_eq!(stored.ip.as_deref(), Some("10.1.1.2"));
        assert_eq!(stored.port, Some(50123));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;

        let bad_port = format!(
            "/api/v1/agent/?task_id={}&action=set_ip_port&ip=10.0.0.1&port=http",
            task.id
        );
        let resp = send_request(pool.clone(), settings(), &bad_port).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert!(json["error"].as_str().unwrap().contains("invalid port"));

        let unknown = format!("/api/v1/agent/?task_id={}&action=bootstrap", Uuid::new_v4());
        let resp = send_request(pool.clone(), settings(), &unknown).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = send_request(pool.clone(), settings(), "/api/v1/agent/?action=bootstrap").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let stored = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Created);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn test_signed_callbacks() {
        let (pool, db_name) = create_test_db().await;
        let task = seed_task(&pool).await;
        let tokens = CallbackTokens::new(&[7u8; 32]).unwrap();
        let signed = Settings {
            callback_tokens: Some(tokens.clone()),
            ..settings()
        };

        let unsigned = format!("/api/v1/agent/?task_id={}&action=bootstrap", task.id);
        let resp = send_request(pool.clone(), signed.clone(), &unsigned).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let token = tokens.issue(task.id);
        let uri = format!("{unsigned}&token={token}");
        let resp = send_request(pool.clone(), signed, &uri).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains(&token));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
