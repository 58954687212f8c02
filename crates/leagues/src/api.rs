use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use common::db::AsyncDb;
use common::explorer::ExplorerClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::pipeline::orchestrator::{Orchestrator, RunReport};
use crate::pipeline::tracker::{run_tracked, RunTrigger};

pub type LeagueOrchestrator = Orchestrator<AsyncDb, ExplorerClient>;

/// Shared application state available to all handlers.
pub struct AppState {
    pub db: AsyncDb,
    pub orchestrator: Arc<LeagueOrchestrator>,
    pub cron_secret: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new().route("/api/health", get(health));

    let protected = Router::new()
        .route("/api/cron/leagues", get(trigger_run).post(trigger_run))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Rejects anything without `Authorization: Bearer <cron secret>`.
async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if constant_time_eq(token.as_bytes(), state.cron_secret.as_bytes()) => {
            next.run(req).await
        }
        _ => {
            metrics::counter!("leagues_trigger_unauthorized_total").increment(1);
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

/// Constant-time comparison so the secret can't be probed byte by byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    tokens: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
        tokens: state.orchestrator.tokens().len(),
    })
}

#[derive(Debug, Deserialize)]
pub struct TriggerQuery {
    pub date: Option<String>,
}

#[derive(Serialize)]
struct TriggerResponse {
    success: bool,
    date: NaiveDate,
    results: RunReport,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(status: StatusCode, error: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error,
        }),
    )
        .into_response()
}

/// `GET|POST /api/cron/leagues[?date=YYYY-MM-DD]`; the date defaults to today (UTC).
async fn trigger_run(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TriggerQuery>,
) -> Response {
    let date = match q.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        None => chrono::Utc::now().date_naive(),
        Some(raw) => match common::types::parse_date(raw) {
            Ok(d) => d,
            Err(_) => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("invalid date {raw:?}, expected YYYY-MM-DD"),
                )
            }
        },
    };

    tracing::info!(%date, "league run triggered over HTTP");
    match run_tracked(&state.db, state.orchestrator.as_ref(), RunTrigger::Http, date).await {
        Ok(results) => (
            StatusCode::OK,
            Json(TriggerResponse {
                success: true,
                date,
                results,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "league run could not start");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classifier::LeagueLadder;
    use crate::pipeline::pager::PagerSettings;
    use axum::body::Body;
    use common::config::Token;
    use common::types::MatchMode;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "s3cret-token";

    async fn test_app(tokens: Vec<Token>) -> (Router, Arc<AppState>) {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let explorer =
            ExplorerClient::new(Duration::from_secs(1), Duration::ZERO, Duration::ZERO).unwrap();
        let orchestrator = Orchestrator::new(
            db.clone(),
            explorer,
            LeagueLadder::standard(),
            tokens,
            PagerSettings {
                page_size: 1000,
                concurrency: 1,
                delay: Duration::ZERO,
            },
        );
        let state = Arc::new(AppState {
            db,
            orchestrator: Arc::new(orchestrator),
            cron_secret: SECRET.to_string(),
            started_at: chrono::Utc::now(),
        });
        (router(state.clone()), state)
    }

    fn token() -> Token {
        Token {
            ticker: "ABC".to_string(),
            chain: "base".to_string(),
            holder_table: "holders_abc".to_string(),
            league_table: "leagues_abc".to_string(),
            contract_address: "0x1".to_string(),
            explorer_url: "http://127.0.0.1:9".to_string(),
            match_mode: MatchMode::LowerBound,
        }
    }

    fn request(method: &str, uri: &str, auth: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn run_count(state: &AppState) -> i64 {
        state
            .db
            .call(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM league_runs", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let (app, _state) = test_app(vec![token()]).await;
        let response = app.oneshot(request("GET", "/api/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["tokens"], 1);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_secret_is_rejected_without_side_effects() {
        let (app, state) = test_app(vec![token()]).await;
        for auth in [None, Some("Bearer wrong"), Some("s3cret-token"), Some("Basic s3cret-token")] {
            let response = app
                .clone()
                .oneshot(request("POST", "/api/cron/leagues", auth))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{auth:?}");
        }
        assert_eq!(run_count(&state).await, 0);
    }

    #[tokio::test]
    async fn test_authorized_trigger_returns_report() {
        let (app, state) = test_app(vec![token()]).await;
        let bearer = format!("Bearer {SECRET}");
        for method in ["GET", "POST"] {
            let response = app
                .clone()
                .oneshot(request(method, "/api/cron/leagues?date=2026-03-09", Some(&bearer)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let json = json_body(response).await;
            assert_eq!(json["success"], true);
            assert_eq!(json["date"], "2026-03-09");
            assert_eq!(json["results"]["ABC"]["status"], "SKIPPED");
        }
        assert_eq!(run_count(&state).await, 2);
    }

    #[tokio::test]
    async fn test_bad_date_is_400() {
        let (app, state) = test_app(vec![token()]).await;
        let response = app
            .oneshot(request(
                "GET",
                "/api/cron/leagues?date=09-03-2026",
                Some(&format!("Bearer {SECRET}")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("09-03-2026"));
        assert_eq!(run_count(&state).await, 0);
    }

    #[tokio::test]
    async fn test_run_that_cannot_start_is_500() {
        let (app, state) = test_app(vec![token()]).await;
        state
            .db
            .call(|conn| {
                conn.execute_batch("DROP TABLE league_runs")?;
                Ok(())
            })
            .await
            .unwrap();
        let response = app
            .oneshot(request("POST", "/api/cron/leagues", Some(&format!("Bearer {SECRET}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["success"], false);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
