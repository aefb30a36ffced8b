pub mod collections;
pub mod config;
pub mod conversation_state;
pub mod db;
pub mod db_types;
pub mod error;
pub mod handlers;
pub mod llm_types;
pub mod nlp;
pub mod tasks;
pub mod twilio_types;
pub mod types;
pub mod utils;

pub mod consts {
    pub const SERVICE_NAME: &str = "AI Voice Bot for Loan Collections";
    pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

    pub const TTS_MAX_CHARS: usize = 200;
    /// Seconds of silence before `<Gather>` gives up, on the first prompt and afterwards.
    pub const FIRST_GATHER_TIMEOUT_SECS: u16 = 5;
    pub const GATHER_TIMEOUT_SECS: u16 = 10;

    pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
    pub const ANTHROPIC_API_VERSION: &str = "2023-06-01";
    pub const LLM_MAX_TOKENS: u32 = 500;
    pub const LLM_TIMEOUT_SECS: u64 = 30;

    pub const CALLBACK_DELAY_HOURS: i64 = 24;
    pub const OUTBOUND_BATCH_SIZE: i64 = 10;
    pub const REMINDER_BATCH_SIZE: i64 = 50;

    // sec min hour day-of-month month day-of-week
    pub const OUTBOUND_CALLS_CRON: &str = "0 */30 9-18 * * *";
    pub const DAILY_MAINTENANCE_CRON: &str = "0 0 23 * * *";
    pub const PAYMENT_REMINDERS_CRON: &str = "0 0 10 * * *";
}
