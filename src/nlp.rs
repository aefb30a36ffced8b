use crate::collections::MONTH_NAMES;
use crate::consts::{
    ANTHROPIC_API_VERSION, ANTHROPIC_MESSAGES_URL, LLM_MAX_TOKENS, LLM_TIMEOUT_SECS,
};
use crate::db_types::{BorrowerWithLoan, LanguagePref};
use crate::error::AppError;
use crate::llm_types::{LlmAnalysis, LlmMessage, LlmPayload, LlmResponse};
use crate::types::{CallState, Intent, Sentiment, UtteranceAnalysis};
use crate::utils::{extract_amount_from_text, format_currency};

use bigdecimal::BigDecimal;
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What the analyzer knows about the call when the caller speaks.
pub struct UtteranceContext<'a> {
    pub borrower: Option<&'a BorrowerWithLoan>,
    pub current_state: CallState,
    pub last_bot_message: &'a str,
}

impl UtteranceContext<'_> {
    fn describe(&self, caller_text: &str) -> String {
        let language = self
            .borrower
            .map(|b| b.language_pref)
            .unwrap_or(LanguagePref::En);
        let zero = BigDecimal::from(0);
        let due_amount = self
            .borrower
            .and_then(|b| b.due_amount.as_ref())
            .unwrap_or(&zero);
        let dpd = self.borrower.and_then(|b| b.days_past_due).unwrap_or(0);
        format!(
            "Current State: {}\n\
             Last Bot Message: {}\n\
             Borrower Language Preference: {}\n\
             Due Amount: {}\n\
             Days Past Due: {}\n\
             Caller Said: \"{}\"",
            self.current_state,
            self.last_bot_message,
            language,
            format_currency(due_amount),
            dpd,
            caller_text,
        )
    }
}

/// Reads caller utterances: an LLM first, keyword rules when the LLM is unavailable or answers
/// with something unusable.
pub struct NlpProcessor {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    rules: FallbackRules,
}

impl NlpProcessor {
    pub fn new(
        api_key: &str,
        model: &str,
        system_prompt: Option<String>,
    ) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LLM_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build llm http client: {e}")))?;
        if api_key.trim().is_empty() {
            warn!("no ANTHROPIC_API_KEY set; utterances will be analyzed with fallback rules");
        }
        Ok(Self {
            http_client,
            api_key: api_key.trim().to_string(),
            model: model.to_string(),
            system_prompt,
            rules: FallbackRules::new()?,
        })
    }

    /// Rules only; no network calls are ever made.
    pub fn rules_only() -> Result<Self, AppError> {
        Self::new("", "", None)
    }

    /// Load the system prompt from disk; a missing file disables the LLM path.
    pub fn load_system_prompt(path: &Path) -> Option<String> {
        match std::fs::read_to_string(path) {
            Ok(prompt) if !prompt.trim().is_empty() => Some(prompt.trim().to_string()),
            Ok(_) => {
                warn!(path=%path.display(), "system prompt file is empty");
                None
            }
            Err(e) => {
                error!(error=%e, path=%path.display(), "failed to read system prompt");
                None
            }
        }
    }

    fn llm_enabled(&self) -> bool {
        !self.api_key.is_empty() && self.system_prompt.is_some()
    }

    pub async fn analyze_utterance(
        &self,
        text: &str,
        context: &UtteranceContext<'_>,
    ) -> UtteranceAnalysis {
        if !self.llm_enabled() {
            debug!("llm unavailable, using fallback analysis");
            return self.rules.analyze(text, context.current_state);
        }
        match self.ask_llm(text, context).await {
            Ok(reply) => match parse_llm_reply(&reply) {
                Some(analysis) => {
                    info!(intent=%analysis.intent, "analyzed utterance");
                    analysis
                }
                None => {
                    let preview: String = reply.chars().take(100).collect();
                    warn!(reply=%preview, "malformed llm reply, using fallback");
                    self.rules.analyze(text, context.current_state)
                }
            },
            Err(e) => {
                error!(error=%e, "llm call failed, using fallback");
                self.rules.analyze(text, context.current_state)
            }
        }
    }

    async fn ask_llm(
        &self,
        text: &str,
        context: &UtteranceContext<'_>,
    ) -> Result<String, AppError> {
        let payload = LlmPayload {
            model: self.model.clone(),
            max_tokens: LLM_MAX_TOKENS,
            temperature: Some(0.1),
            system: self.system_prompt.clone(),
            messages: vec![LlmMessage {
                role: "user".to_string(),
                content: context.describe(text),
            }],
        };
        let resp = self
            .http_client
            .post(ANTHROPIC_MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::upstream("llm", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AppError::upstream("llm", format!("{status}: {body}")));
        }
        let response = resp
            .json::<LlmResponse>()
            .await
            .map_err(|e| AppError::upstream("llm", e))?;
        let reply = response.text();
        debug!(reply=%reply, "llm raw reply");
        Ok(reply)
    }
}

/// Pull the first `{...}` object out of a model reply and normalise it. `None` when the object
/// is missing, unparseable or lacks a required field.
pub fn parse_llm_reply(reply: &str) -> Option<UtteranceAnalysis> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    let raw: LlmAnalysis = serde_json::from_str(&reply[start..=end])
        .map_err(|e| warn!(error=%e, "failed to parse llm json"))
        .ok()?;
    Some(UtteranceAnalysis {
        intent: normalize_intent(&raw.intent),
        sentiment: normalize_sentiment(&raw.sentiment),
        slots: raw.slots,
        reply_text: raw.reply_text,
        next_state: normalize_state(&raw.next_state),
        confidence: raw.confidence.unwrap_or(0.9).clamp(0.0, 1.0),
        fallback_used: false,
    })
}

pub fn normalize_intent(raw: &str) -> Intent {
    raw.parse().unwrap_or(Intent::Unclear)
}

pub fn normalize_sentiment(raw: &str) -> Sentiment {
    raw.parse().unwrap_or(Sentiment::Neutral)
}

/// Only states the model may steer to; anything else returns the caller to the menu.
pub fn normalize_state(raw: &str) -> CallState {
    match raw.parse() {
        Ok(
            state @ (CallState::VerifyIdentity
            | CallState::MainMenu
            | CallState::CollectDetails
            | CallState::WrapUp
            | CallState::EndCall
            | CallState::Transfer),
        ) => state,
        _ => CallState::MainMenu,
    }
}

struct FallbackRules {
    intents: Vec<(Intent, Vec<Regex>)>,
    affirmation: Regex,
    positive: Regex,
    negative: Regex,
    dates: Vec<Regex>,
}

impl FallbackRules {
    fn new() -> Result<Self, AppError> {
        let compile = |patterns: &[&str]| -> Result<Vec<Regex>, AppError> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| AppError::Config(format!("bad pattern {p}: {e}")))
                })
                .collect()
        };
        let one = |pattern: &str| -> Result<Regex, AppError> {
            Ok(compile(&[pattern])?.remove(0))
        };

        // Order matters: the first intent with a matching pattern wins.
        let intents = vec![
            (
                Intent::MakePayment,
                compile(&[
                    r"\b(pay|payment|paying)\b.*\b(now|today|immediately)\b",
                    r"\bupi\b.*\blink\b",
                    r"\bpaid?\b.*\bnow\b",
                ])?,
            ),
            (
                Intent::PromiseToPay,
                compile(&[
                    concat!(
                        r"\b(pay|payment)\b.*\b(tomorrow|monday|tuesday|wednesday|thursday",
                        r"|friday|saturday|sunday|next week|next month|soon)\b",
                    ),
                    r"\bpromise\b.*\bpay\b",
                    r"\bwill pay\b.*\b(on|by)\b",
                ])?,
            ),
            (
                Intent::Dispute,
                compile(&[
                    r"\bnot\s+(mine|my)\b",
                    r"\bdispute\b",
                    r"\bwrong\s+amount\b",
                    r"\bneed\s+(statement|proof|details)\b",
                ])?,
            ),
            (
                Intent::WrongNumber,
                compile(&[
                    r"\bwrong\s+number\b",
                    r"\bnot\s+(me|the|a)\s+(borrower|person)\b",
                    r"\bdon'?t\s+know\b.*\bloan\b",
                ])?,
            ),
            (
                Intent::CallbackLater,
                compile(&[
                    r"\bcall\s+(me\s+)?back\b",
                    r"\blater\b",
                    r"\bnot\s+(a\s+)?good\s+time\b",
                    r"\bbusy\b.*\bnow\b",
                ])?,
            ),
            (
                Intent::Hardship,
                compile(&[
                    r"\bhardship\b",
                    r"\bfinancial\s+(difficulty|problem)\b",
                    r"\bjob\s+loss\b",
                    r"\blost\s+my\s+job\b",
                    r"\bcan'?t\s+afford\b",
                ])?,
            ),
            (
                Intent::TransferAgent,
                compile(&[
                    r"\bagent\b",
                    r"\bmanager\b",
                    r"\bhuman\b",
                    r"\btalk\s+to\s+someone\b",
                ])?,
            ),
            (
                Intent::DoNotCall,
                compile(&[
                    r"\bdo\s+not\s+call\b",
                    r"\bstop\s+calling\b",
                    r"\bdon'?t\s+call\b",
                    r"\bopt\s+out\b",
                ])?,
            ),
        ];

        let day_of_month = format!(
            r"\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({})\b",
            MONTH_NAMES.join("|")
        );
        Ok(Self {
            intents,
            affirmation: one(r"\b(yes|yeah|yep|speaking|correct|that's me|this is|haan|ji)\b")?,
            positive: one(r"\b(yes|okay|ok|sure|definitely|will pay|can pay)\b")?,
            negative: one(r"\b(no|can't|cannot|unable|won't|refuse|angry)\b")?,
            dates: compile(&[
                r"\b\d{4}-\d{2}-\d{2}\b",
                day_of_month.as_str(),
                r"\b(tomorrow|today|monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
                r"\bnext\s+(week|month)\b",
            ])?,
        })
    }

    fn detect_intent(&self, lower: &str, current_state: CallState) -> Option<Intent> {
        let matched = self
            .intents
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|re| re.is_match(lower)))
            .map(|(intent, _)| *intent);
        match matched {
            Some(intent) => Some(intent),
            None if current_state == CallState::VerifyIdentity
                && self.affirmation.is_match(lower) =>
            {
                Some(Intent::Verification)
            }
            None => None,
        }
    }

    fn analyze(&self, text: &str, current_state: CallState) -> UtteranceAnalysis {
        let lower = text.to_lowercase();
        let detected = self.detect_intent(&lower, current_state);
        let (intent, confidence) = match detected {
            Some(intent) => (intent, 0.7),
            None => (Intent::Unclear, 0.5),
        };

        let sentiment = if self.positive.is_match(&lower) {
            Sentiment::Positive
        } else if self.negative.is_match(&lower) {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        };

        let mut slots = serde_json::Map::new();
        if let Some(amount) = extract_amount_from_text(&lower) {
            slots.insert(
                "amount".to_string(),
                serde_json::Value::String(amount.to_string()),
            );
        }
        if let Some(date) = self.dates.iter().find_map(|re| re.find(&lower)) {
            slots.insert(
                "date".to_string(),
                serde_json::Value::String(date.as_str().to_string()),
            );
        }

        let (next_state, reply_text) = fallback_reply(current_state, intent);
        UtteranceAnalysis {
            intent,
            sentiment,
            slots,
            reply_text: reply_text.to_string(),
            next_state,
            confidence,
            fallback_used: true,
        }
    }
}

fn fallback_reply(current_state: CallState, intent: Intent) -> (CallState, &'static str) {
    if current_state == CallState::VerifyIdentity {
        return match intent {
            Intent::Verification => (
                CallState::MainMenu,
                "Thank you. Now, how can I help you with your loan today?",
            ),
            Intent::WrongNumber => (
                CallState::EndCall,
                "I'm sorry for the trouble. We will update our records. Goodbye.",
            ),
            Intent::DoNotCall => (
                CallState::EndCall,
                "I understand. I'll add you to our do-not-call list. Have a good day.",
            ),
            _ => (
                CallState::VerifyIdentity,
                "Sorry, I need to confirm who I'm speaking with. \
                 Could you please confirm your name?",
            ),
        };
    }
    match intent {
        Intent::MakePayment => (
            CallState::CollectDetails,
            "Great! I'll help you make a payment. What amount would you like to pay?",
        ),
        Intent::PromiseToPay => (
            CallState::CollectDetails,
            "I understand. When would you be able to make the payment?",
        ),
        Intent::TransferAgent => (
            CallState::Transfer,
            "I'll transfer you to an agent. Please hold.",
        ),
        Intent::DoNotCall => (
            CallState::EndCall,
            "I understand. I'll add you to our do-not-call list. Have a good day.",
        ),
        Intent::CallbackLater => (
            CallState::EndCall,
            "No problem. We will call you back later. Goodbye.",
        ),
        _ => (
            CallState::MainMenu,
            "I understand. Is there anything else I can help you with today?",
        ),
    }
}
