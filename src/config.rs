use crate::error::AppError;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use time::macros::format_description;
use time::{OffsetDateTime, Time, UtcOffset};

/// Runtime settings read from the environment (and `.env` when present).
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub db_pool_size: u32,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_calling_number: String,
    pub anthropic_api_key: String,
    pub anthropic_model: String,
    pub system_prompt_path: PathBuf,
    pub app_public_url: String,
    pub bind_addr: String,
    pub timezone_offset: UtcOffset,
    pub debug: bool,
    pub calling_hours_start: Time,
    pub calling_hours_end: Time,
    pub max_call_attempts: i64,
    pub agent_transfer_number: Option<String>,
    pub call_log_retention_days: i64,
    pub sms_reminders_enabled: bool,
    pub seed_demo_data: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            db_pool_size: 10,
            twilio_account_sid: String::new(),
            twilio_auth_token: String::new(),
            twilio_calling_number: String::new(),
            anthropic_api_key: String::new(),
            anthropic_model: "claude-3-haiku-20240307".to_string(),
            system_prompt_path: PathBuf::from("prompts/system_prompt_collections.txt"),
            app_public_url: "http://localhost:8000".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            timezone_offset: UtcOffset::from_hms(5, 30, 0).unwrap_or(UtcOffset::UTC),
            debug: false,
            calling_hours_start: Time::from_hms(9, 0, 0).unwrap_or(Time::MIDNIGHT),
            calling_hours_end: Time::from_hms(19, 0, 0).unwrap_or(Time::MIDNIGHT),
            max_call_attempts: 3,
            agent_transfer_number: None,
            call_log_retention_days: 90,
            sms_reminders_enabled: false,
            seed_demo_data: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let defaults = Settings::default();
        let text = |key: &str, default: String| lookup(key).unwrap_or(default);
        let parsed = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let timezone_offset = match parsed("TIMEZONE_OFFSET") {
            Some(raw) => parse_utc_offset(&raw)?,
            None => defaults.timezone_offset,
        };
        let calling_hours_start = match parsed("CALLING_HOURS_START") {
            Some(raw) => parse_clock_time("CALLING_HOURS_START", &raw)?,
            None => defaults.calling_hours_start,
        };
        let calling_hours_end = match parsed("CALLING_HOURS_END") {
            Some(raw) => parse_clock_time("CALLING_HOURS_END", &raw)?,
            None => defaults.calling_hours_end,
        };

        Ok(Self {
            database_url: text("DATABASE_URL", defaults.database_url),
            db_pool_size: parse_number(&lookup, "DB_POOL_SIZE", defaults.db_pool_size)?,
            twilio_account_sid: text("TWILIO_ACCOUNT_SID", defaults.twilio_account_sid),
            twilio_auth_token: text("TWILIO_AUTH_TOKEN", defaults.twilio_auth_token),
            twilio_calling_number: text("TWILIO_CALLING_NUMBER", defaults.twilio_calling_number),
            anthropic_api_key: text("ANTHROPIC_API_KEY", defaults.anthropic_api_key),
            anthropic_model: text("ANTHROPIC_MODEL", defaults.anthropic_model),
            system_prompt_path: parsed("SYSTEM_PROMPT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.system_prompt_path),
            app_public_url: text("APP_PUBLIC_URL", defaults.app_public_url)
                .trim_end_matches('/')
                .to_string(),
            bind_addr: text("BIND_ADDR", defaults.bind_addr),
            timezone_offset,
            debug: parse_flag(&lookup, "DEBUG"),
            calling_hours_start,
            calling_hours_end,
            max_call_attempts: parse_number(
                &lookup,
                "MAX_CALL_ATTEMPTS",
                defaults.max_call_attempts,
            )?,
            agent_transfer_number: parsed("AGENT_TRANSFER_NUMBER"),
            call_log_retention_days: parse_number(
                &lookup,
                "CALL_LOG_RETENTION_DAYS",
                defaults.call_log_retention_days,
            )?,
            sms_reminders_enabled: parse_flag(&lookup, "SMS_REMINDERS_ENABLED"),
            seed_demo_data: parse_flag(&lookup, "SEED_DEMO_DATA"),
        })
    }

    /// Every required variable that is missing, reported together.
    pub fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("DATABASE_URL", &self.database_url),
            ("TWILIO_ACCOUNT_SID", &self.twilio_account_sid),
            ("TWILIO_AUTH_TOKEN", &self.twilio_auth_token),
            ("TWILIO_CALLING_NUMBER", &self.twilio_calling_number),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::Config(format!(
                "Missing required environment variables: {}",
                missing.join(", ")
            )))
        }
    }

    /// Current wall-clock time in the configured offset.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.timezone_offset)
    }

    /// Calling hours are inclusive at both ends, compared at minute resolution.
    pub fn is_calling_hours(&self, at: OffsetDateTime) -> bool {
        let local = at.to_offset(self.timezone_offset).time();
        let minute = (local.hour(), local.minute());
        let start = (
            self.calling_hours_start.hour(),
            self.calling_hours_start.minute(),
        );
        let end = (self.calling_hours_end.hour(), self.calling_hours_end.minute());
        start <= minute && minute <= end
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> bool {
    lookup(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} must be a number, got '{raw}'"))),
        _ => Ok(default),
    }
}

/// `+05:30`, `-04:00`, or `Z`.
pub fn parse_utc_offset(raw: &str) -> Result<UtcOffset, AppError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }
    UtcOffset::parse(
        raw,
        format_description!("[offset_hour sign:mandatory]:[offset_minute]"),
    )
    .map_err(|e| AppError::Config(format!("TIMEZONE_OFFSET '{raw}' is invalid: {e}")))
}

/// `HH:MM` on a 24-hour clock.
pub fn parse_clock_time(key: &str, raw: &str) -> Result<Time, AppError> {
    Time::parse(raw.trim(), format_description!("[hour]:[minute]"))
        .map_err(|e| AppError::Config(format!("{key} '{raw}' is invalid: {e}")))
}
