/**
 * API HTTP DU PANNEAU - surface JSON au-dessus d'un SessionController
 *
 * RÔLE :
 * Expose la vue du panneau et les actions opérateur à un frontend web ou un script.
 *
 * ROUTES :
 * - GET  /health              liveness, sans auth
 * - GET  /panel               instantané complet de la vue
 * - POST /panel/select        {resource}
 * - PUT  /panel/window        {from, to} au format des sélecteurs locaux
 * - POST /panel/storage-state interroge la ressource sélectionnée
 * - POST /panel/fetch         télécharge le clip de la fenêtre courante
 *
 * FONCTIONNEMENT :
 * - les actions tournent dans leur propre tâche tokio; un client qui coupe la
 *   requête ne les interrompt pas, le résultat reste visible via GET /panel
 *
 * SÉCURITÉ :
 * - header x-api-key sur toutes les routes sauf /health, comparé à VSTORE_API_KEY
 * - sans clé configurée, chaque route protégée répond 401
 */

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{error, warn};
use vstore_core::{
    DeviceConnector, PanelView, SelectionError, SessionController, TriggerOutcome, WindowView,
};

/// Valeur attendue du header `x-api-key`.
#[derive(Clone, Default)]
pub struct ApiKeyGuard {
    expected: Option<Arc<str>>,
}

impl ApiKeyGuard {
    pub fn new(expected: Option<String>) -> Self {
        Self {
            expected: expected.filter(|k| !k.is_empty()).map(Into::into),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("VSTORE_API_KEY").ok())
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }
}

async fn require_api_key(
    State(guard): State<ApiKeyGuard>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // health check toujours accessible
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = guard.expected.as_deref() else {
        warn!("VSTORE_API_KEY not set, API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request with missing or wrong api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub struct AppState<C: DeviceConnector, Tz: TimeZone> {
    pub controller: Arc<SessionController<C, Tz>>,
}

impl<C: DeviceConnector, Tz: TimeZone> Clone for AppState<C, Tz> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SelectBody {
    resource: String,
}

#[derive(Debug, Deserialize)]
struct WindowBody {
    from: String,
    to: String,
}

#[derive(Debug, Serialize)]
struct Refusal {
    ok: bool,
    msg: String,
}

fn refusal(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(Refusal { ok: false, msg: msg.into() })).into_response()
}

pub fn build_router<C, Tz>(app_state: AppState<C, Tz>, api_key: ApiKeyGuard) -> Router
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/panel", get(get_panel::<C, Tz>))
        .route("/panel/select", post(select_resource::<C, Tz>))
        .route("/panel/window", put(set_window::<C, Tz>))
        .route("/panel/storage-state", post(get_storage_state::<C, Tz>))
        .route("/panel/fetch", post(fetch_video::<C, Tz>))
        .with_state(app_state)
        .layer(middleware::from_fn_with_state(api_key, require_api_key))
}

// GET /panel
async fn get_panel<C, Tz>(State(app): State<AppState<C, Tz>>) -> Json<PanelView>
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    Json(app.controller.view())
}

// POST /panel/select
async fn select_resource<C, Tz>(
    State(app): State<AppState<C, Tz>>,
    Json(body): Json<SelectBody>,
) -> Response
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    match app.controller.select(&body.resource) {
        Ok(()) => Json(app.controller.view()).into_response(),
        Err(e @ SelectionError::NotConnected) => {
            refusal(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e @ SelectionError::UnknownResource(_)) => {
            refusal(StatusCode::NOT_FOUND, e.to_string())
        }
    }
}

// PUT /panel/window
async fn set_window<C, Tz>(
    State(app): State<AppState<C, Tz>>,
    Json(body): Json<WindowBody>,
) -> Json<WindowView>
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    Json(app.controller.set_window(body.from, body.to))
}

// POST /panel/storage-state
async fn get_storage_state<C, Tz>(State(app): State<AppState<C, Tz>>) -> Response
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    let controller = Arc::clone(&app.controller);
    let action = tokio::spawn(async move { controller.get_storage_state().await });
    match action.await {
        Ok(outcome) => outcome_response(outcome, "storage state query"),
        Err(e) => task_failure(e, "storage state query"),
    }
}

// POST /panel/fetch
async fn fetch_video<C, Tz>(State(app): State<AppState<C, Tz>>) -> Response
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    let controller = Arc::clone(&app.controller);
    let action = tokio::spawn(async move { controller.fetch_video().await });
    match action.await {
        Ok(outcome) => outcome_response(outcome, "fetch"),
        Err(e) => task_failure(e, "fetch"),
    }
}

/// Une action terminée répond 200 avec son état, même en échec.
fn outcome_response<T: Serialize>(outcome: TriggerOutcome<T>, action: &str) -> Response {
    match outcome {
        TriggerOutcome::Settled(state) => (StatusCode::OK, Json(state)).into_response(),
        TriggerOutcome::Ignored => {
            refusal(StatusCode::CONFLICT, format!("{action} already in progress"))
        }
        TriggerOutcome::Stale => refusal(
            StatusCode::CONFLICT,
            format!("{action} result dropped, the selected resource changed"),
        ),
    }
}

fn task_failure(e: tokio::task::JoinError, action: &str) -> Response {
    error!(error = %e, action, "action task aborted");
    refusal(StatusCode::INTERNAL_SERVER_ERROR, format!("{action} aborted"))
}
