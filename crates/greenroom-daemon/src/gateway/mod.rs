//! Gateway wiring: shared state, router, and cross-cutting layers.
//!
//! Authorization is declared per endpoint as the required capability
//! audience:
//!
//! | Endpoint | Auth |
//! |----------|------|
//! | `POST /auth/login` | none |
//! | `POST /interview/sessions`, `GET .../summary|review|state|anti-cheat/tail` | User bearer |
//! | `POST .../token/{acet,aipt,refresh}`, `POST .../start` | session cookie |
//! | `POST .../precheck`, `POST .../anti-cheat` | ACET |
//! | `POST .../next-question` | AIPT (generation-checked) |
//! | `POST .../answer`, `.../code-eval`, `.../finalize` | IST |
//! | `GET .../stream` | WST via `?token=` |
//! | `POST /media/upload` | UPT (one-shot, generation-checked) |

pub mod auth;
pub mod error;

mod authn;
mod interview;
mod media;
mod sessions;
mod stream;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::routing::{get, post};
use greenroom_core::config::Config;
use greenroom_core::service::SessionService;
use greenroom_core::token::TokenAuthority;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

/// Request body cap. Media uploads are the largest legitimate bodies.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Shared gateway state.
#[derive(Clone)]
pub struct AppState {
    /// Domain orchestrator.
    pub service: Arc<SessionService>,
    /// Token authority.
    pub authority: Arc<TokenAuthority>,
    /// Daemon configuration.
    pub config: Arc<Config>,
}

/// Builds the full router.
#[must_use]
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(authn::login))
        .route(
            "/interview/sessions",
            post(sessions::create).get(sessions::list),
        )
        .route("/interview/:id/token/acet", post(sessions::issue_acet))
        .route("/interview/:id/token/aipt", post(sessions::issue_aipt))
        .route("/interview/:id/token/refresh", post(sessions::refresh))
        .route("/interview/:id/precheck", post(interview::precheck))
        .route("/interview/:id/start", post(interview::start))
        .route("/interview/:id/next-question", post(interview::next_question))
        .route("/interview/:id/answer", post(interview::answer))
        .route("/interview/:id/code-eval", post(interview::code_eval))
        .route("/interview/:id/anti-cheat", post(interview::anti_cheat))
        .route(
            "/interview/:id/anti-cheat/tail",
            get(sessions::anti_cheat_tail),
        )
        .route("/interview/:id/finalize", post(interview::finalize))
        .route("/interview/:id/summary", get(sessions::summary))
        .route("/interview/:id/review", get(sessions::review))
        .route("/interview/:id/state", get(sessions::session_state))
        .route("/interview/:id/stream", get(stream::stream))
        .route("/media/upload", post(media::upload))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(cors)
        .with_state(state)
}

/// CORS restricted to the configured origin list, with credentials (the
/// session cookie) allowed.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Liveness probe.
async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"ok": true}))
}
