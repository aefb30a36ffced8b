use crate::config::Settings;
use crate::error::AppError;
use crate::nlp::NlpProcessor;
use crate::twilio_types::{TwilioCallResource, TwilioMessageResource};

use serde::{Deserialize, Serialize};
use sqlx::{Pool, Postgres};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

/// Where the dialogue currently is. Persisted in `call_sessions.current_state` between Twilio
/// webhooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Start,
    Consent,
    VerifyIdentity,
    MainMenu,
    CollectDetails,
    WrapUp,
    EndCall,
    Transfer,
}

/// What the caller wants, as recognised from one utterance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Greeting,
    Verification,
    MakePayment,
    PromiseToPay,
    Dispute,
    WrongNumber,
    CallbackLater,
    Hardship,
    TransferAgent,
    DoNotCall,
    Unclear,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let upper = s.trim().to_ascii_uppercase();
                $ty::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == upper)
                    .ok_or_else(|| {
                        AppError::InvalidInput(format!("unknown {} '{}'", stringify!($ty), s))
                    })
            }
        }
    };
}

text_enum!(CallState {
    Start => "START",
    Consent => "CONSENT",
    VerifyIdentity => "VERIFY_IDENTITY",
    MainMenu => "MAIN_MENU",
    CollectDetails => "COLLECT_DETAILS",
    WrapUp => "WRAP_UP",
    EndCall => "END_CALL",
    Transfer => "TRANSFER",
});

text_enum!(Intent {
    Greeting => "GREETING",
    Verification => "VERIFICATION",
    MakePayment => "MAKE_PAYMENT",
    PromiseToPay => "PROMISE_TO_PAY",
    Dispute => "DISPUTE",
    WrongNumber => "WRONG_NUMBER",
    CallbackLater => "CALLBACK_LATER",
    Hardship => "HARDSHIP",
    TransferAgent => "TRANSFER_AGENT",
    DoNotCall => "DO_NOT_CALL",
    Unclear => "UNCLEAR",
});

text_enum!(Sentiment {
    Positive => "POSITIVE",
    Neutral => "NEUTRAL",
    Negative => "NEGATIVE",
});

/// Structured reading of one caller utterance.
#[derive(Clone, Debug, PartialEq)]
pub struct UtteranceAnalysis {
    pub intent: Intent,
    pub sentiment: Sentiment,
    pub slots: serde_json::Map<String, serde_json::Value>,
    pub reply_text: String,
    pub next_state: CallState,
    pub confidence: f32,
    pub fallback_used: bool,
}

impl UtteranceAnalysis {
    pub fn slot_str(&self, key: &str) -> Option<&str> {
        self.slots
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// Numeric slots may arrive as JSON numbers or strings.
    pub fn slot_number_text(&self, key: &str) -> Option<String> {
        match self.slots.get(key)? {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.replace(',', "")),
            _ => None,
        }
    }
}

pub struct AppState {
    pub settings: Settings,
    pub http_client: reqwest::Client,
    pub db_pool: Pool<Postgres>,
    pub nlp: NlpProcessor,
}

impl AppState {
    fn twilio_url(&self, resource: &str) -> String {
        let account_sid = &self.settings.twilio_account_sid;
        format!("https://api.twilio.com/2010-04-01/Accounts/{account_sid}/{resource}")
    }

    /// Place an outbound call whose TwiML is served from `twiml_url`.
    pub async fn create_twilio_call(
        &self,
        to: &str,
        twiml_url: &str,
        status_callback_url: &str,
    ) -> Result<TwilioCallResource, AppError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("To", to),
            ("From", self.settings.twilio_calling_number.as_str()),
            ("Url", twiml_url),
            ("StatusCallback", status_callback_url),
            ("StatusCallbackMethod", "POST"),
        ];
        for event in ["initiated", "ringing", "answered", "completed"] {
            form.push(("StatusCallbackEvent", event));
        }
        let resp = self
            .http_client
            .post(self.twilio_url("Calls.json"))
            .basic_auth(
                &self.settings.twilio_account_sid,
                Some(&self.settings.twilio_auth_token),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send call request to twilio");
                AppError::upstream("twilio", e)
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            error!(%status, body=%body, "twilio rejected call request");
            return Err(AppError::upstream("twilio", format!("{status}: {body}")));
        }
        let call = resp.json::<TwilioCallResource>().await.map_err(|e| {
            error!(error=%e, "failed to parse twilio call resource");
            AppError::upstream("twilio", e)
        })?;
        debug!(call_sid=%call.sid, status=?call.status, "twilio call created");
        Ok(call)
    }

    pub async fn send_twilio_sms(
        &self,
        to: &str,
        body: &str,
    ) -> Result<TwilioMessageResource, AppError> {
        let form = [
            ("From", self.settings.twilio_calling_number.as_str()),
            ("To", to),
            ("Body", body),
        ];
        let resp = self
            .http_client
            .post(self.twilio_url("Messages.json"))
            .basic_auth(
                &self.settings.twilio_account_sid,
                Some(&self.settings.twilio_auth_token),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send sms request to twilio");
                AppError::upstream("twilio", e)
            })?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::upstream("twilio", format!("{status}: {body}")));
        }
        resp.json::<TwilioMessageResource>().await.map_err(|e| {
            error!(error=%e, "failed to parse twilio message resource");
            AppError::upstream("twilio", e)
        })
    }
}
