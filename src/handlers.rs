use crate::consts::{SERVICE_NAME, SERVICE_VERSION};
use crate::conversation_state::{
    inbound_greeting, open_dialogue, outbound_greeting, say_and_hangup, ConversationState,
};
use crate::db;
use crate::db_types::{CallDirection, LanguagePref};
use crate::error::{handle_error, AppError};
use crate::tasks::{place_outbound_call, OutboundCall};
use crate::twilio_types::{GatherPayload, StatusCallbackPayload, VoiceWebhookPayload};
use crate::types::AppState;
use crate::utils::{mask_phone, parse_twilio_duration, sanitize_phone_number};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const UNKNOWN_CALLER: &str = "Thank you for calling. I'm sorry, but I don't have your information \
                              in our system. Please contact our customer service team. Goodbye.";
const DNC_CALLER: &str = "I apologize, but you've requested not to receive calls. If you need \
                          assistance, please contact our customer service team. Goodbye.";
const TECHNICAL_DIFFICULTIES: &str =
    "I'm experiencing technical difficulties. Please try calling back later. Goodbye.";

#[derive(Deserialize, Debug)]
pub struct SessionQuery {
    pub session_id: i32,
}

#[derive(Deserialize, Debug)]
pub struct OutboundCallRequest {
    pub borrower_id: i32,
}

fn twiml_response(twiml: String) -> (StatusCode, HeaderMap, String) {
    trace!("twiml: '{}'", twiml);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

/// Twilio must always get TwiML back; failures end the call politely.
async fn twiml_or_apology(result: Result<String, AppError>) -> (StatusCode, HeaderMap, String) {
    match result {
        Ok(twiml) => twiml_response(twiml),
        Err(e) => {
            handle_error(e).await;
            twiml_response(say_and_hangup(TECHNICAL_DIFFICULTIES, LanguagePref::En))
        }
    }
}

fn parse_form<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, AppError> {
    serde_urlencoded::from_str::<T>(body).map_err(|e| {
        error!(error=%e, "failed to deserialize Twilio webhook payload");
        AppError::InvalidInput(format!("bad webhook payload: {e}"))
    })
}

pub async fn root() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": SERVICE_VERSION,
    }))
}

pub async fn health_check(State(app_state): State<Arc<AppState>>) -> Json<Value> {
    let database = match db::ping(&app_state.db_pool).await {
        Ok(()) => "healthy".to_string(),
        Err(e) => {
            warn!(error=%e, "database health probe failed");
            format!("unhealthy: {e}")
        }
    };
    Json(json!({
        "status": "healthy",
        "database": database,
        "timestamp": app_state.settings.now().to_string(),
    }))
}

pub async fn voice_incoming(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "incoming call request body");
    twiml_or_apology(start_inbound_call(&app_state, &body).await).await
}

async fn start_inbound_call(app_state: &AppState, body: &str) -> Result<String, AppError> {
    let payload: VoiceWebhookPayload = parse_form(body)?;
    let phone = sanitize_phone_number(&payload.from);
    info!(
        call_sid=%payload.call_sid,
        from=%mask_phone(&phone),
        status=?payload.call_status,
        "incoming call"
    );

    let Some(borrower) = db::get_borrower_by_phone(&app_state.db_pool, &phone).await? else {
        info!(from=%mask_phone(&phone), "caller not found");
        return Ok(say_and_hangup(UNKNOWN_CALLER, LanguagePref::En));
    };
    if borrower.is_dnc {
        info!(borrower_id = borrower.id, "do-not-call borrower called in");
        return Ok(say_and_hangup(DNC_CALLER, borrower.language_pref));
    }

    let session = match db::create_call_session(
        &app_state.db_pool,
        &payload.call_sid,
        Some(borrower.id),
        CallDirection::Inbound,
    )
    .await
    {
        Ok(session) => session,
        // Twilio retried the webhook for a call we already know.
        Err(AppError::Duplicate { .. }) => {
            db::get_call_session_by_sid(&app_state.db_pool, &payload.call_sid)
                .await?
                .ok_or_else(|| AppError::not_found("call session", &payload.call_sid))?
        }
        Err(e) => return Err(e),
    };

    open_dialogue(
        app_state,
        session.id,
        borrower.language_pref,
        &inbound_greeting(&borrower.name),
        "I didn't hear anything. Please call back when you're ready to speak. Goodbye.",
    )
    .await
}

pub async fn voice_continue(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, session_id = query.session_id, "gather request body");
    twiml_or_apology(continue_call(app_state, query.session_id, &body).await).await
}

async fn continue_call(
    app_state: Arc<AppState>,
    session_id: i32,
    body: &str,
) -> Result<String, AppError> {
    let payload: GatherPayload = parse_form(body)?;
    debug!(
        call_sid=%payload.call_sid,
        confidence=?payload.confidence,
        "speech result received"
    );
    let state = ConversationState::load(app_state, session_id).await?;
    state
        .handle_speech(payload.speech_result.as_deref(), payload.confidence)
        .await
}

pub async fn voice_status(
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> Result<Json<Value>, AppError> {
    let payload: StatusCallbackPayload = parse_form(&body)?;
    let status = payload.call_status.session_status();
    info!(
        call_sid=%payload.call_sid,
        twilio_status=?payload.call_status,
        %status,
        "call status update"
    );
    let duration = status
        .is_terminal()
        .then(|| parse_twilio_duration(payload.call_duration.as_deref()));
    let session =
        db::update_call_status(&app_state.db_pool, &payload.call_sid, status, duration).await?;
    Ok(Json(json!({
        "status": "success",
        "session_status": session.status,
    })))
}

pub async fn voice_outbound(
    State(app_state): State<Arc<AppState>>,
    Json(request): Json<OutboundCallRequest>,
) -> Result<Json<OutboundCall>, AppError> {
    let call = place_outbound_call(&app_state, request.borrower_id).await?;
    Ok(Json(call))
}

pub async fn voice_outbound_greeting(
    State(app_state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, session_id = query.session_id, "outbound answer request body");
    twiml_or_apology(greet_outbound_call(&app_state, query.session_id).await).await
}

async fn greet_outbound_call(app_state: &AppState, session_id: i32) -> Result<String, AppError> {
    let session = db::get_call_session(&app_state.db_pool, session_id)
        .await?
        .ok_or_else(|| AppError::not_found("call session", session_id))?;
    let borrower_id = session
        .borrower_id
        .ok_or_else(|| AppError::InvalidInput(format!("session {session_id} has no borrower")))?;
    let borrower = db::get_borrower(&app_state.db_pool, borrower_id)
        .await?
        .ok_or_else(|| AppError::not_found("borrower", borrower_id))?;
    open_dialogue(
        app_state,
        session.id,
        borrower.language_pref,
        &outbound_greeting(&borrower.name),
        "I'll call you back later. Goodbye.",
    )
    .await
}
