use crate::collections::parse_promise_date;
use crate::config::Settings;
use crate::consts::{CALLBACK_DELAY_HOURS, FIRST_GATHER_TIMEOUT_SECS, GATHER_TIMEOUT_SECS};
use crate::db;
use crate::db_types::{BorrowerWithLoan, CallSession, LanguagePref, NewTurn, VerificationState};
use crate::error::AppError;
use crate::nlp::UtteranceContext;
use crate::twilio_types::TwimlBuilder;
use crate::types::{AppState, CallState, Intent, UtteranceAnalysis};
use crate::utils::{
    extract_amount_from_text, mask_name, response_template, text_to_speech_optimized,
    voice_settings, ResponseTemplate,
};

use bigdecimal::BigDecimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use time::Duration;
use tracing::{debug, error, info, warn};

const NO_SPEECH: &str = "No speech detected";

/// Where `<Gather>` posts the caller's speech for a session.
pub fn continue_url(settings: &Settings, session_id: i32) -> String {
    format!(
        "{}/voice/continue?session_id={session_id}",
        settings.app_public_url
    )
}

/// A short spoken message followed by hangup, used wherever the call cannot go on.
pub fn say_and_hangup(text: &str, language: LanguagePref) -> String {
    let (voice, lang) = voice_settings(language);
    TwimlBuilder::new()
        .say(text_to_speech_optimized(text), voice, lang)
        .hangup()
        .build()
}

pub fn inbound_greeting(name: &str) -> String {
    format!(
        "Hello, this call may be recorded for quality and training purposes. \
         Am I speaking with {name}?"
    )
}

pub fn outbound_greeting(name: &str) -> String {
    format!(
        "Hello, this is a call from your loan service provider. This call may be recorded. \
         Am I speaking with {name}? I'm calling regarding your loan account."
    )
}

/// Speak the opening line of a call and ask the caller to confirm who they are. The session
/// moves to VERIFY_IDENTITY and the greeting becomes the first bot turn.
pub async fn open_dialogue(
    app_state: &AppState,
    session_id: i32,
    language: LanguagePref,
    greeting: &str,
    no_input_text: &str,
) -> Result<String, AppError> {
    db::update_call_session(
        &app_state.db_pool,
        session_id,
        CallState::VerifyIdentity.as_str(),
        None,
        None,
    )
    .await?;
    db::append_call_turn(&app_state.db_pool, session_id, &NewTurn::bot(greeting)).await?;
    db::append_transcript(&app_state.db_pool, session_id, &format!("Bot: {greeting}")).await?;

    let (voice, lang) = voice_settings(language);
    Ok(TwimlBuilder::new()
        .say(text_to_speech_optimized(greeting), voice, lang)
        .gather_speech(
            continue_url(&app_state.settings, session_id),
            FIRST_GATHER_TIMEOUT_SECS,
            lang,
        )
        .say(no_input_text, voice, lang)
        .hangup()
        .build())
}

/// One caller turn of an ongoing call, loaded from the session row.
pub struct ConversationState {
    pub session: CallSession,
    pub borrower: BorrowerWithLoan,
    /// Dialogue state the caller's speech answers
    pub state: CallState,
    pub app_state: Arc<AppState>,
}

impl ConversationState {
    pub async fn load(app_state: Arc<AppState>, session_id: i32) -> Result<Self, AppError> {
        let session = db::get_call_session(&app_state.db_pool, session_id)
            .await?
            .ok_or_else(|| AppError::not_found("call session", session_id))?;
        let borrower_id = session.borrower_id.ok_or_else(|| {
            AppError::InvalidInput(format!("session {session_id} has no borrower"))
        })?;
        let borrower = db::get_borrower_with_loan(&app_state.db_pool, borrower_id)
            .await?
            .ok_or_else(|| AppError::not_found("borrower", borrower_id))?;
        let state = session
            .current_state
            .as_deref()
            .and_then(|s| CallState::from_str(s).ok())
            .unwrap_or(CallState::VerifyIdentity);
        Ok(Self {
            session,
            borrower,
            state,
            app_state,
        })
    }

    /// Log the caller's speech, analyze it, act on the intent and return the TwiML reply.
    pub async fn handle_speech(
        &self,
        speech: Option<&str>,
        asr_confidence: Option<f32>,
    ) -> Result<String, AppError> {
        let pool = &self.app_state.db_pool;
        let session_id = self.session.id;
        let speech_text = speech
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(NO_SPEECH);

        let last_bot_message = db::last_bot_message(pool, session_id)
            .await?
            .unwrap_or_default();
        db::append_call_turn(pool, session_id, &NewTurn::caller(speech_text, asr_confidence))
            .await?;
        db::append_transcript(pool, session_id, &format!("Caller: {speech_text}")).await?;

        let context = UtteranceContext {
            borrower: Some(&self.borrower),
            current_state: self.state,
            last_bot_message: &last_bot_message,
        };
        let mut analysis = self
            .app_state
            .nlp
            .analyze_utterance(speech_text, &context)
            .await;
        info!(
            session_id,
            borrower=%mask_name(&self.borrower.name),
            state=%self.state,
            intent=%analysis.intent,
            sentiment=%analysis.sentiment,
            next_state=%analysis.next_state,
            fallback=analysis.fallback_used,
            "caller turn analyzed"
        );

        let verification = verification_update(self.state, &analysis);
        if verification == Some(VerificationState::Failed)
            && analysis.next_state == CallState::Transfer
        {
            analysis.reply_text =
                response_template(ResponseTemplate::VerificationFailed, self.language())
                    .to_string();
        }
        if let Some(template) = self.apply_intent(&analysis, speech_text).await {
            confirm_with_template(&mut analysis, template, self.language());
        }

        let reply = text_to_speech_optimized(&analysis.reply_text);
        let bot_turn = NewTurn {
            intent: Some(analysis.intent.to_string()),
            sentiment: Some(analysis.sentiment.to_string()),
            slots: Some(Value::Object(analysis.slots.clone())),
            confidence: Some(analysis.confidence),
            ..NewTurn::bot(reply.as_str())
        };
        db::append_call_turn(pool, session_id, &bot_turn).await?;
        db::append_transcript(pool, session_id, &format!("Bot: {reply}")).await?;

        let outcome = call_outcome(&analysis);
        db::update_call_session(
            pool,
            session_id,
            analysis.next_state.as_str(),
            verification,
            outcome,
        )
        .await?;

        Ok(render_reply(
            &self.app_state.settings,
            session_id,
            self.language(),
            &reply,
            analysis.next_state,
        ))
    }

    fn language(&self) -> LanguagePref {
        self.borrower.language_pref
    }

    /// Record what the intent asks for. Returns the confirmation to speak when something was
    /// recorded. Failures are logged and the call carries on.
    async fn apply_intent(
        &self,
        analysis: &UtteranceAnalysis,
        speech_text: &str,
    ) -> Option<ResponseTemplate> {
        let pool = &self.app_state.db_pool;
        let borrower_id = self.borrower.id;
        let session_id = Some(self.session.id);
        let res = match analysis.intent {
            Intent::PromiseToPay => {
                let today = self.app_state.settings.now().date();
                let promise_date =
                    parse_promise_date(analysis.slot_str("date").unwrap_or(speech_text), today);
                let amount = analysis
                    .slot_number_text("amount")
                    .and_then(|a| BigDecimal::from_str(&a).ok())
                    .or_else(|| extract_amount_from_text(speech_text))
                    .or_else(|| self.borrower.due_amount.clone());
                let Some(amount) = amount else {
                    warn!(borrower_id, "promise to pay without an amount or a loan; not saved");
                    return None;
                };
                db::save_ptp_promise(pool, borrower_id, session_id, promise_date, &amount)
                    .await
                    .map(|ptp| {
                        debug!(ptp_id = ptp.id, promise_date=%ptp.promise_date, "promise recorded");
                        ResponseTemplate::PaymentConfirmation
                    })
            }
            Intent::DoNotCall => {
                db::mark_borrower_dnc(pool, borrower_id, session_id, analysis.slot_str("reason"))
                    .await
                    .map(|_| ResponseTemplate::DncConfirmed)
            }
            Intent::CallbackLater => {
                let at = self.app_state.settings.now() + Duration::hours(CALLBACK_DELAY_HOURS);
                let reason = analysis
                    .slot_str("reason")
                    .unwrap_or("Customer requested callback");
                db::schedule_callback(pool, borrower_id, session_id, at, Some(reason))
                    .await
                    .map(|_| ResponseTemplate::CallbackScheduled)
            }
            _ => return None,
        };
        match res {
            Ok(template) => Some(template),
            Err(e) => {
                error!(error=%e, intent=%analysis.intent, borrower_id, "failed to record intent");
                None
            }
        }
    }
}

/// Verification moves only while the call is at VERIFY_IDENTITY.
fn verification_update(
    state: CallState,
    analysis: &UtteranceAnalysis,
) -> Option<VerificationState> {
    if state != CallState::VerifyIdentity {
        return None;
    }
    match analysis.intent {
        Intent::Verification => Some(VerificationState::Verified),
        Intent::WrongNumber => Some(VerificationState::Failed),
        _ if analysis.next_state == CallState::Transfer => Some(VerificationState::Failed),
        _ if analysis.next_state != CallState::VerifyIdentity
            && analysis.next_state != CallState::EndCall =>
        {
            Some(VerificationState::Verified)
        }
        _ => None,
    }
}

/// A do-not-call request is always confirmed with the fixed wording. Rule-based replies to a
/// recorded promise or callback are replaced by the confirmation and the call wraps up.
fn confirm_with_template(
    analysis: &mut UtteranceAnalysis,
    template: ResponseTemplate,
    language: LanguagePref,
) {
    let always = template == ResponseTemplate::DncConfirmed;
    if !always && !analysis.fallback_used {
        return;
    }
    analysis.reply_text = response_template(template, language).to_string();
    if template == ResponseTemplate::PaymentConfirmation {
        analysis.next_state = CallState::WrapUp;
    } else {
        analysis.next_state = CallState::EndCall;
    }
}

/// The intent that ended the call, or TRANSFERRED when the caller went to an agent.
fn call_outcome(analysis: &UtteranceAnalysis) -> Option<&'static str> {
    match analysis.next_state {
        CallState::EndCall => Some(analysis.intent.as_str()),
        CallState::Transfer => Some("TRANSFERRED"),
        _ => None,
    }
}

fn render_reply(
    settings: &Settings,
    session_id: i32,
    language: LanguagePref,
    reply: &str,
    next_state: CallState,
) -> String {
    let (voice, lang) = voice_settings(language);
    let twiml = TwimlBuilder::new().say(reply, voice, lang);
    match next_state {
        CallState::EndCall => twiml.hangup().build(),
        CallState::Transfer => match settings.agent_transfer_number.as_deref() {
            Some(number) => twiml
                .say("Please hold while I transfer you.", voice, lang)
                .dial(number)
                .build(),
            None => twiml
                .say(
                    "No agent is available right now. Please contact our customer service team. \
                     Goodbye.",
                    voice,
                    lang,
                )
                .hangup()
                .build(),
        },
        _ => twiml
            .gather_speech(continue_url(settings, session_id), GATHER_TIMEOUT_SECS, lang)
            .say(
                "I didn't hear you. Please call us back when you're ready. Goodbye.",
                voice,
                lang,
            )
            .hangup()
            .build(),
    }
}
