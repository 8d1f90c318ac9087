// backupd/src/api/mod.rs
//! Thin HTTP surface over the orchestrator and the history store.

pub(crate) mod auth;
pub(crate) mod error;
pub(crate) mod handlers;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;

use crate::backup::BackupOrchestrator;
use crate::history::HistoryStore;

pub use auth::AuthSettings;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BackupOrchestrator>,
    pub history: Arc<dyn HistoryStore>,
    pub auth: Arc<AuthSettings>,
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/backups", post(handlers::trigger_backup))
        .route("/api/backups/restore", post(handlers::trigger_restore))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    let authenticated = Router::new()
        .route("/api/backups/history", get(handlers::list_history))
        .route("/api/backups/history/:id", get(handlers::get_history))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .route("/health", get(handlers::health))
        .merge(authenticated)
        .with_state(state)
}

#[cfg(all(test, unix))]
mod tests {
    use super::auth::Claims;
    use super::*;
    use crate::backup::OrchestratorDeps;
    use crate::backup::db_dump::test_support::sh_producer;
    use crate::backup::orchestrator::test_support::GatedProducer;
    use crate::backup::remote::test_support::MemoryStore;
    use crate::backup::SnapshotProducer;
    use crate::history::{HistoryRecorder, MemoryHistoryStore};
    use crate::restore::db_restore::test_support::sh_restorer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    const SECRET: &str = "test-secret";

    struct TestApp {
        router: Router,
        remote: Arc<MemoryStore>,
        history: Arc<MemoryHistoryStore>,
        _dir: tempfile::TempDir,
    }

    fn app_with(producer: Arc<dyn SnapshotProducer>) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MemoryStore::default());
        let history = Arc::new(MemoryHistoryStore::new());
        let deps = OrchestratorDeps {
            producer,
            remote: remote.clone(),
            history: HistoryRecorder::new(history.clone(), Duration::from_secs(1)),
            restorer: Arc::new(sh_restorer("cat >/dev/null")),
        };
        let orchestrator = BackupOrchestrator::new(deps, dir.path().to_path_buf(), CancellationToken::new());
        let state = AppState {
            orchestrator: Arc::new(orchestrator),
            history: history.clone(),
            auth: Arc::new(AuthSettings::new(SECRET, "Admin")),
        };
        TestApp {
            router: router(state),
            remote,
            history,
            _dir: dir,
        }
    }

    fn app(script: &str) -> TestApp {
        app_with(Arc::new(sh_producer(script)))
    }

    fn token(user_id: i64, roles: &[&str], exp_offset_secs: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + exp_offset_secs) as usize,
            iat: now as usize,
            user_id,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn admin() -> String {
        token(42, &["Admin"], 3600)
    }

    fn request(method: &str, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(t) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
        }
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = app("printf 'SELECT 1;'");
        let (status, body) = send(&app.router, request("GET", "/health", None, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_or_expired_token_is_unauthorized() {
        let app = app("printf 'SELECT 1;'");
        let (status, _) = send(&app.router, request("POST", "/api/backups", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let expired = token(42, &["Admin"], -3600);
        let (status, _) = send(&app.router, request("POST", "/api/backups", Some(&expired), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app.remote.names().is_empty());
    }

    #[tokio::test]
    async fn test_non_admin_cannot_trigger_backup() {
        let app = app("printf 'SELECT 1;'");
        let user = token(7, &["Examiner"], 3600);
        let (status, _) = send(&app.router, request("POST", "/api/backups", Some(&user), None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(app.history.len().await, 0);
    }

    #[tokio::test]
    async fn test_admin_backup_returns_completed_attempt() {
        let app = app("printf 'SELECT 1;'");
        let (status, body) = send(&app.router, request("POST", "/api/backups", Some(&admin()), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["attempt"]["initiatorKind"], "Manual");
        assert_eq!(body["attempt"]["initiatorId"], 42);
        assert_eq!(body["attempt"]["succeeded"], true);
        assert_eq!(app.remote.names().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_backup_returns_500_with_details() {
        let app = app("echo 'connection refused' >&2; exit 2");
        let (status, body) = send(&app.router, request("POST", "/api/backups", Some(&admin()), None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Backup failed");
        assert!(body["details"].as_str().unwrap().contains("connection refused"));
        assert_eq!(body["attempt"]["succeeded"], false);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_gets_conflict() {
        let producer = Arc::new(GatedProducer::default());
        let app = app_with(producer.clone());

        let first = {
            let router = app.router.clone();
            tokio::spawn(async move { send(&router, request("POST", "/api/backups", Some(&admin()), None)).await })
        };
        producer.started.notified().await;

        let (status, body) = send(&app.router, request("POST", "/api/backups", Some(&admin()), None)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["details"].as_str().unwrap().contains("already in progress"));

        producer.release.notify_one();
        let (status, _) = first.await.unwrap();
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_history_is_readable_by_any_authenticated_user() {
        let app = app("printf 'SELECT 1;'");
        send(&app.router, request("POST", "/api/backups", Some(&admin()), None)).await;

        let user = token(7, &[], 3600);
        let (status, body) = send(&app.router, request("GET", "/api/backups/history?limit=10", Some(&user), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = send(&app.router, request("GET", "/api/backups/history/1", Some(&user), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 1);

        let (status, _) = send(&app.router, request("GET", "/api/backups/history/99", Some(&user), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_restore_round_trip_through_api() {
        let app = app("printf 'SELECT 1;'");
        let (_, body) = send(&app.router, request("POST", "/api/backups", Some(&admin()), None)).await;
        let name = body["attempt"]["artifactName"].as_str().unwrap().to_string();

        let (status, body) = send(
            &app.router,
            request("POST", "/api/backups/restore", Some(&admin()), Some(serde_json::json!({ "artifact_name": name }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["attempt"]["initiatorKind"], "Restore");

        let (status, _) = send(
            &app.router,
            request("POST", "/api/backups/restore", Some(&admin()), Some(serde_json::json!({ "artifact_name": " " }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
