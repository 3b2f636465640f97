//! Route handlers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use blastgate_core::{
    chat_id_for, BlastId, DeviceKey, JitterPacing, MessagePayload, NewBlast,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::dto::{
    ApiResponse, AuthQuery, BlastView, CreateBlastRequest, CreateDeviceRequest,
    SendMessageQuery, SendMessageRequest,
};
use super::{ApiError, AppState};
use crate::application::lifecycle::PairingState;
use crate::application::orchestrator::DeviceSessions;
use crate::application::trigger::StartOutcome;

type ApiResult = Result<Json<ApiResponse>, ApiError>;

const ALREADY_LOGGED_IN: &str = "It seems that you have logged in successfully";
const QR_UNAVAILABLE: &str = "The system cannot generate a WhatsApp QR code";
const NOT_CONNECTED: &str = "Session not found or disconnected";
const LOGGED_OUT_BEFORE: &str = "This account seems to have logged out before.";

// ── Access checks ─────────────────────────────────────────────────────────────

fn authorize(state: &AppState, query: &AuthQuery) -> Result<(), ApiError> {
    if state.token_matches(query.access_token.as_deref()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Instance id present, token valid, device known; in that order.
fn authorize_instance(state: &AppState, query: &AuthQuery) -> Result<DeviceKey, ApiError> {
    let raw = query
        .instance_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or(ApiError::MissingInstance)?;
    authorize(state, query)?;
    known_device(state, raw)
}

fn known_device(state: &AppState, raw: &str) -> Result<DeviceKey, ApiError> {
    let key = DeviceKey::parse(raw).map_err(|_| ApiError::InstanceNotFound)?;
    if state.db.device_exists(&key)? {
        Ok(key)
    } else {
        Err(ApiError::InstanceNotFound)
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<serde_json::Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::Internal(e.to_string()))
}

// ── Device session endpoints ──────────────────────────────────────────────────

/// GET /
pub async fn health() -> Json<ApiResponse> {
    Json(ApiResponse::success("blastgate server is running"))
}

/// GET /instance
pub async fn instance(State(state): State<AppState>, Query(query): Query<AuthQuery>) -> ApiResult {
    let key = authorize_instance(&state, &query)?;
    let account = state
        .lifecycle
        .connected_session(&key)
        .await
        .and_then(|session| session.account());

    let Some(account) = account else {
        return Ok(Json(ApiResponse::error("Error").with_relogin()));
    };
    Ok(Json(ApiResponse::success("Success").with_data(json!({
        "id": account.jid,
        "name": account.name,
        "phone_number": account.phone_number(),
    }))))
}

/// GET /login
pub async fn login(State(state): State<AppState>, Query(query): Query<AuthQuery>) -> ApiResult {
    let key = authorize_instance(&state, &query)?;
    state.lifecycle.connect(&key, true).await?;
    pairing_code(&state, &key).await
}

/// GET /get_qrcode
pub async fn get_qrcode(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
) -> ApiResult {
    let key = authorize_instance(&state, &query)?;
    if state.lifecycle.is_connected(&key).await {
        return Err(ApiError::Conflict(ALREADY_LOGGED_IN.to_string()));
    }
    state.lifecycle.connect(&key, false).await?;
    pairing_code(&state, &key).await
}

async fn pairing_code(state: &AppState, key: &DeviceKey) -> ApiResult {
    match state
        .lifecycle
        .wait_for_pairing_code(key, state.qr_wait)
        .await?
    {
        PairingState::Code(image) => Ok(Json(ApiResponse::success("Success").with_base64(image))),
        PairingState::Connected(_) => Err(ApiError::Conflict(ALREADY_LOGGED_IN.to_string())),
        PairingState::Unavailable => Err(ApiError::Unavailable(QR_UNAVAILABLE.to_string())),
    }
}

/// GET /logout
pub async fn logout(State(state): State<AppState>, Query(query): Query<AuthQuery>) -> ApiResult {
    let key = authorize_instance(&state, &query)?;
    if state.lifecycle.logout(&key).await? {
        Ok(Json(ApiResponse::success("Success")))
    } else {
        Err(ApiError::Conflict(LOGGED_OUT_BEFORE.to_string()))
    }
}

/// POST /send_message
pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    Json(request): Json<SendMessageRequest>,
) -> ApiResult {
    let key = authorize_instance(&state, &query)?;
    deliver_message(&state, &key, &request).await
}

/// GET /sendMessage
pub async fn send_message_query(
    State(state): State<AppState>,
    Query(query): Query<SendMessageQuery>,
) -> ApiResult {
    let key = authorize_instance(&state, &query.auth)?;
    deliver_message(&state, &key, &query.message).await
}

async fn deliver_message(
    state: &AppState,
    key: &DeviceKey,
    request: &SendMessageRequest,
) -> ApiResult {
    let chat_id = request
        .chat_id
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing chat_id".to_string()))?;
    let chat_id = if chat_id.contains('@') {
        chat_id.to_string()
    } else {
        chat_id_for(chat_id)
    };

    let session = state
        .lifecycle
        .connected_session(key)
        .await
        .ok_or_else(|| ApiError::Conflict(NOT_CONNECTED.to_string()))?;
    let payload = MessagePayload::compose(
        request.text(),
        request.media_url.as_deref(),
        request.filename.as_deref(),
    );

    let receipt = match tokio::time::timeout(
        state.send_timeout,
        session.send_message(&chat_id, &payload),
    )
    .await
    {
        Ok(Ok(receipt)) => receipt,
        Ok(Err(e)) => {
            warn!(instance_id = %key, %chat_id, "send failed: {e}");
            return Err(ApiError::SendFailed(e.to_string()));
        }
        Err(_) => {
            warn!(instance_id = %key, %chat_id, "send timed out");
            return Err(ApiError::SendFailed(format!(
                "timed out after {}s",
                state.send_timeout.as_secs()
            )));
        }
    };

    info!(instance_id = %key, %chat_id, message_id = %receipt.message_id, "message sent");
    Ok(Json(
        ApiResponse::success("Message sent successfully").with_data(json!({
            "chat_id": chat_id,
            "message_id": receipt.message_id,
        })),
    ))
}

// ── Operator endpoints ────────────────────────────────────────────────────────

/// POST /devices
pub async fn create_device(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    Json(request): Json<CreateDeviceRequest>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    authorize(&state, &query)?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Device name must not be empty".to_string()));
    }
    let device = state.db.create_device(name)?;
    info!(instance_id = %device.key, "device created");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Device created").with_data(to_data(&device)?)),
    ))
}

/// DELETE /devices/{instance_id}
pub async fn delete_device(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<AuthQuery>,
) -> ApiResult {
    authorize(&state, &query)?;
    let key = DeviceKey::parse(&instance_id).map_err(|_| ApiError::InstanceNotFound)?;
    if state.lifecycle.delete_device(&key).await? {
        Ok(Json(ApiResponse::success("Device deleted")))
    } else {
        Err(ApiError::InstanceNotFound)
    }
}

/// POST /blasts
pub async fn create_blast(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
    Json(request): Json<CreateBlastRequest>,
) -> Result<(StatusCode, Json<ApiResponse>), ApiError> {
    authorize(&state, &query)?;
    let device_key = known_device(&state, &request.instance_id)?;

    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("Blast name must not be empty".to_string()));
    }
    let media_url = request
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());
    if request.message.trim().is_empty() && media_url.is_none() {
        return Err(ApiError::BadRequest(
            "A message or a media_url is required".to_string(),
        ));
    }

    let mut recipients = Vec::with_capacity(request.recipients.len());
    for raw in &request.recipients {
        let number = raw.trim();
        if !number.chars().any(|c| c.is_ascii_digit()) {
            return Err(ApiError::BadRequest(format!("Invalid recipient: {raw:?}")));
        }
        recipients.push(number.to_string());
    }

    let (default_min, default_max) = state.default_delay;
    let delay_min_secs = request.delay_min_secs.unwrap_or(default_min);
    let delay_max_secs = request.delay_max_secs.unwrap_or(default_max);
    JitterPacing::new(delay_min_secs, delay_max_secs)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let blast = state.db.create_blast(&NewBlast {
        device_key,
        name: name.to_string(),
        message: request.message.clone(),
        media_url: media_url.map(str::to_string),
        delay_min_secs,
        delay_max_secs,
        scheduled_at: request.scheduled_at.unwrap_or_else(Utc::now),
        recipients,
    })?;
    info!(
        blast_id = blast.id,
        device = %blast.device_key,
        total = blast.counters.total,
        "blast created"
    );

    let mut not_connected = false;
    if request.send_now {
        match state.trigger.start_if_ready(&blast, Utc::now()).await? {
            StartOutcome::Started(run) => {
                info!(blast_id = blast.id, recipients = run.len(), "blast started on request");
            }
            StartOutcome::NotDue => {
                info!(blast_id = blast.id, "blast is scheduled later; send_now deferred");
            }
            StartOutcome::DeviceNotConnected => not_connected = true,
        }
    }

    let view = blast_view(&state, blast.id)?;
    if not_connected {
        warn!(blast_id = blast.id, "send_now refused; device not connected");
        return Ok((
            StatusCode::CONFLICT,
            Json(
                ApiResponse::error(format!("{NOT_CONNECTED}; blast {} stays pending", blast.id))
                    .with_data(to_data(&view)?),
            ),
        ));
    }
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Blast created").with_data(to_data(&view)?)),
    ))
}

fn blast_view(state: &AppState, id: BlastId) -> Result<BlastView, ApiError> {
    let blast = state.db.blast(id)?.ok_or(ApiError::BlastNotFound(id))?;
    let recipients = state.db.recipients(id)?;
    Ok(BlastView { blast, recipients })
}

/// GET /blasts/{id}
pub async fn get_blast(
    State(state): State<AppState>,
    Path(id): Path<BlastId>,
    Query(query): Query<AuthQuery>,
) -> ApiResult {
    authorize(&state, &query)?;
    let view = blast_view(&state, id)?;
    Ok(Json(ApiResponse::success("Success").with_data(to_data(&view)?)))
}

/// DELETE /blasts/{id}
pub async fn delete_blast(
    State(state): State<AppState>,
    Path(id): Path<BlastId>,
    Query(query): Query<AuthQuery>,
) -> ApiResult {
    authorize(&state, &query)?;
    if state.db.delete_blast(id)? {
        info!(blast_id = id, "blast deleted");
        Ok(Json(ApiResponse::success("Blast deleted")))
    } else {
        Err(ApiError::BlastNotFound(id))
    }
}

/// POST /blasts/{id}/retry_failed
pub async fn retry_failed(
    State(state): State<AppState>,
    Path(id): Path<BlastId>,
    Query(query): Query<AuthQuery>,
) -> ApiResult {
    authorize(&state, &query)?;
    let run = state.orchestrator.retry_failed(id).await?;
    Ok(Json(
        ApiResponse::success(format!("Retrying {} failed recipients", run.len())).with_data(
            json!({
                "blast_id": id,
                "recipients": run.len(),
            }),
        ),
    ))
}
