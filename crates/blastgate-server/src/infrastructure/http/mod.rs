//! HTTP control surface.
//!
//! Every request authenticates with the `access_token` query parameter;
//! device endpoints also name the device with `instance_id`.  Responses use
//! one JSON envelope:
//!
//! ```json
//! { "status": "success", "message": "Success", "base64": "data:image/svg+xml;base64,…" }
//! ```
//!
//! | Route | Purpose |
//! |---|---|
//! | `GET /` | health |
//! | `GET /instance` | connected identity, or `relogin: true` |
//! | `GET /login` | discard the session and start pairing |
//! | `GET /get_qrcode` | current pairing code (opens a session if needed) |
//! | `GET /logout` | unlink the device and delete its credentials |
//! | `POST /send_message`, `GET /sendMessage` | send one message |
//! | `POST /devices`, `DELETE /devices/{instance_id}` | operator: devices |
//! | `POST /blasts`, `GET`/`DELETE /blasts/{id}`, `POST /blasts/{id}/retry_failed` | operator: blasts |

pub mod dto;
pub mod error;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::ApiError;

use crate::application::lifecycle::LifecycleManager;
use crate::application::orchestrator::BlastOrchestrator;
use crate::application::trigger::BlastTrigger;
use crate::infrastructure::storage::Database;

const DEFAULT_QR_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub lifecycle: LifecycleManager,
    pub orchestrator: Arc<BlastOrchestrator>,
    /// Gate for blasts created with `send_now`.
    pub trigger: Arc<BlastTrigger>,
    access_token: Arc<str>,
    /// How long `/login` and `/get_qrcode` wait for a pairing code.
    pub qr_wait: Duration,
    /// Upper bound on a single `/send_message` send.
    pub send_timeout: Duration,
    /// Pacing range used when a blast request does not give one.
    pub default_delay: (u32, u32),
}

impl AppState {
    pub fn new(
        db: Database,
        lifecycle: LifecycleManager,
        orchestrator: Arc<BlastOrchestrator>,
        access_token: impl Into<Arc<str>>,
    ) -> Self {
        let trigger = Arc::new(BlastTrigger::new(
            db.clone(),
            Arc::new(lifecycle.clone()),
            Arc::clone(&orchestrator),
        ));
        Self {
            db,
            lifecycle,
            orchestrator,
            trigger,
            access_token: access_token.into(),
            qr_wait: DEFAULT_QR_WAIT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            default_delay: (5, 15),
        }
    }

    pub fn with_qr_wait(mut self, qr_wait: Duration) -> Self {
        self.qr_wait = qr_wait;
        self
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn with_default_delay(mut self, min_secs: u32, max_secs: u32) -> Self {
        self.default_delay = (min_secs, max_secs);
        self
    }

    pub(crate) fn token_matches(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| !t.is_empty() && t == &*self.access_token)
    }
}

/// Builds the router with tracing and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/instance", get(handlers::instance))
        .route("/login", get(handlers::login))
        .route("/get_qrcode", get(handlers::get_qrcode))
        .route("/logout", get(handlers::logout))
        .route("/send_message", post(handlers::send_message))
        .route("/sendMessage", get(handlers::send_message_query))
        .route("/devices", post(handlers::create_device))
        .route("/devices/{instance_id}", delete(handlers::delete_device))
        .route("/blasts", post(handlers::create_blast))
        .route(
            "/blasts/{id}",
            get(handlers::get_blast).delete(handlers::delete_blast),
        )
        .route("/blasts/{id}/retry_failed", post(handlers::retry_failed))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
