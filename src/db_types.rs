use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::types::time::{Date, OffsetDateTime};
use std::fmt;

macro_rules! pg_enum_display {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
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
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "language_pref", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LanguagePref {
    En,
    Hi,
}
pg_enum_display!(LanguagePref { En => "EN", Hi => "HI" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "loan_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoanStatus {
    Current,
    Overdue,
    Settled,
    WrittenOff,
}
pg_enum_display!(LoanStatus {
    Current => "CURRENT",
    Overdue => "OVERDUE",
    Settled => "SETTLED",
    WrittenOff => "WRITTEN_OFF",
});

impl LoanStatus {
    /// Settled and written-off loans are closed; delinquency is no longer tracked for them.
    pub fn is_closed(&self) -> bool {
        matches!(self, LoanStatus::Settled | LoanStatus::WrittenOff)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "call_direction", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallDirection {
    Inbound,
    Outbound,
}
pg_enum_display!(CallDirection { Inbound => "INBOUND", Outbound => "OUTBOUND" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "call_session_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallSessionStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    NoAnswer,
}
pg_enum_display!(CallSessionStatus {
    Initiated => "INITIATED",
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
    NoAnswer => "NO_ANSWER",
});

impl CallSessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallSessionStatus::Completed | CallSessionStatus::Failed | CallSessionStatus::NoAnswer
        )
    }

    /// INITIATED -> IN_PROGRESS -> {COMPLETED, FAILED, NO_ANSWER}. Terminal states are final and
    /// a session may skip IN_PROGRESS (an unanswered call never starts).
    pub fn can_transition_to(&self, next: CallSessionStatus) -> bool {
        use CallSessionStatus::*;
        match (*self, next) {
            (a, b) if a == b => true,
            (Initiated, _) => true,
            (InProgress, Completed | Failed | NoAnswer) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "verification_state", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationState {
    Pending,
    Verified,
    Failed,
}
pg_enum_display!(VerificationState {
    Pending => "PENDING",
    Verified => "VERIFIED",
    Failed => "FAILED",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "turn_role", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnRole {
    Bot,
    Caller,
}
pg_enum_display!(TurnRole { Bot => "BOT", Caller => "CALLER" });

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "ptp_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PtpStatus {
    Active,
    Fulfilled,
    Broken,
}
pg_enum_display!(PtpStatus {
    Active => "ACTIVE",
    Fulfilled => "FULFILLED",
    Broken => "BROKEN",
});

#[derive(Clone, Copy, Debug, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "callback_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Scheduled,
    Completed,
    Cancelled,
}
pg_enum_display!(CallbackStatus {
    Scheduled => "SCHEDULED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
});

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Borrower {
    pub id: i32,
    pub name: String,
    pub phone_e164: String,
    pub email: Option<String>,
    pub loan_id: String,
    pub language_pref: LanguagePref,
    pub consent_ts: Option<OffsetDateTime>,
    pub is_dnc: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewBorrower {
    pub name: String,
    pub phone_e164: String,
    pub email: Option<String>,
    pub loan_id: String,
    pub language_pref: LanguagePref,
    pub consent_ts: Option<OffsetDateTime>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Loan {
    pub id: i32,
    pub borrower_id: i32,
    pub loan_id: String,
    pub principal: BigDecimal,
    pub due_amount: BigDecimal,
    pub due_date: Date,
    pub status: LoanStatus,
    pub days_past_due: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug)]
pub struct NewLoan {
    pub borrower_id: i32,
    pub loan_id: String,
    pub principal: BigDecimal,
    pub due_amount: BigDecimal,
    pub due_date: Date,
    pub status: LoanStatus,
    pub days_past_due: i32,
}

/// A borrower joined with the loan it is being contacted about. Loan columns are optional
/// because a borrower may not have a loan row yet.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct BorrowerWithLoan {
    pub id: i32,
    pub name: String,
    pub phone_e164: String,
    pub email: Option<String>,
    pub loan_id: String,
    pub language_pref: LanguagePref,
    pub is_dnc: bool,
    pub due_amount: Option<BigDecimal>,
    pub days_past_due: Option<i32>,
    pub due_date: Option<Date>,
    pub loan_status: Option<LoanStatus>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CallSession {
    pub id: i32,
    pub call_sid: String,
    pub borrower_id: Option<i32>,
    pub direction: CallDirection,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub status: CallSessionStatus,
    pub verification_state: VerificationState,
    pub current_state: Option<String>,
    pub outcome: Option<String>,
    pub duration_seconds: Option<i32>,
    pub transcript: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct CallLog {
    pub id: i32,
    pub call_session_id: i32,
    pub turn_no: i32,
    pub role: TurnRole,
    pub text: String,
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub slots: Option<serde_json::Value>,
    pub confidence: Option<f32>,
    pub created_at: OffsetDateTime,
}

/// One turn to be written to `call_logs`.
#[derive(Clone, Debug)]
pub struct NewTurn {
    pub role: TurnRole,
    pub text: String,
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub slots: Option<serde_json::Value>,
    pub confidence: Option<f32>,
}

impl NewTurn {
    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Bot,
            text: text.into(),
            intent: None,
            sentiment: None,
            slots: None,
            confidence: None,
        }
    }

    pub fn caller(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            role: TurnRole::Caller,
            text: text.into(),
            intent: None,
            sentiment: None,
            slots: None,
            confidence,
        }
    }
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct PtpPromise {
    pub id: i32,
    pub borrower_id: i32,
    pub call_session_id: Option<i32>,
    pub promise_date: Date,
    pub amount: BigDecimal,
    pub status: PtpStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DncRequest {
    pub id: i32,
    pub borrower_id: i32,
    pub call_session_id: Option<i32>,
    pub reason: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Callback {
    pub id: i32,
    pub borrower_id: i32,
    pub call_session_id: Option<i32>,
    pub scheduled_at: OffsetDateTime,
    pub reason: Option<String>,
    pub status: CallbackStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i32,
    pub entity: String,
    pub entity_id: i32,
    pub action: String,
    pub meta_json: Option<serde_json::Value>,
    pub created_at: OffsetDateTime,
}

/// Outbound dialing candidate.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct OverdueBorrower {
    pub id: i32,
    pub name: String,
    pub phone_e164: String,
    pub language_pref: LanguagePref,
    pub due_amount: BigDecimal,
    pub days_past_due: i32,
    pub due_date: Date,
    pub call_count: i64,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ReminderCandidate {
    pub id: i32,
    pub name: String,
    pub phone_e164: String,
    pub language_pref: LanguagePref,
    pub due_amount: BigDecimal,
    pub days_past_due: i32,
}

/// A loan whose stored status or days-past-due disagrees with its due date.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct LoanStatusMismatch {
    pub loan_id: String,
    pub status: LoanStatus,
    pub days_past_due: i32,
    pub due_date: Date,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub deleted_logs: u64,
    pub updated_loans: u64,
    pub broken_promises: u64,
}
