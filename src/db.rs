use crate::collections::{derive_loan_status, is_loan_status_stale, is_promise_broken};
use crate::db_types::{
    AuditEntry, Borrower, BorrowerWithLoan, CallDirection, CallLog, CallSession,
    CallSessionStatus, Callback, CallbackStatus, DncRequest, Loan, LoanStatus,
    LoanStatusMismatch, MaintenanceReport, NewBorrower, NewLoan, NewTurn, OverdueBorrower,
    PtpPromise, PtpStatus, ReminderCandidate, VerificationState,
};
use crate::error::AppError;

use bigdecimal::BigDecimal;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::time::{Date, OffsetDateTime};
use sqlx::{Executor, PgPool};
use tracing::{debug, error, info, warn};

const DEMO_SEED_SQL: &str = include_str!("../seeds/demo_seed.sql");

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| {
            error!(error=%e, "failed to connect to database");
            AppError::from(e)
        })
}

pub async fn migrate(pool: &PgPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

/// Load the demo borrowers, loans and call history. Idempotent.
pub async fn seed_demo_data(pool: &PgPool) -> Result<(), AppError> {
    pool.execute(DEMO_SEED_SQL).await?;
    info!("demo seed data loaded");
    Ok(())
}

pub async fn ping(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query("select 1").execute(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// Borrowers and loans

pub async fn create_borrower(pool: &PgPool, new: &NewBorrower) -> Result<Borrower, AppError> {
    let borrower = sqlx::query_as::<_, Borrower>(
        "
        insert into borrowers (
          name,
          phone_e164,
          email,
          loan_id,
          language_pref,
          consent_ts
        ) values (
          $1,
          $2,
          $3,
          $4,
          $5,
          $6
        )
        returning *
        ",
    )
    .bind(&new.name)
    .bind(&new.phone_e164)
    .bind(&new.email)
    .bind(&new.loan_id)
    .bind(new.language_pref)
    .bind(new.consent_ts)
    .fetch_one(pool)
    .await?;
    log_audit(
        pool,
        "borrowers",
        borrower.id,
        "CREATED",
        Some(json!({ "loan_id": borrower.loan_id })),
    )
    .await;
    Ok(borrower)
}

pub async fn create_loan(pool: &PgPool, new: &NewLoan) -> Result<Loan, AppError> {
    let loan = sqlx::query_as::<_, Loan>(
        "
        insert into loans (
          borrower_id,
          loan_id,
          principal,
          due_amount,
          due_date,
          status,
          days_past_due
        ) values (
          $1,
          $2,
          $3,
          $4,
          $5,
          $6,
          $7
        )
        returning *
        ",
    )
    .bind(new.borrower_id)
    .bind(&new.loan_id)
    .bind(&new.principal)
    .bind(&new.due_amount)
    .bind(new.due_date)
    .bind(new.status)
    .bind(new.days_past_due)
    .fetch_one(pool)
    .await?;
    Ok(loan)
}

pub async fn get_borrower(pool: &PgPool, borrower_id: i32) -> Result<Option<Borrower>, AppError> {
    let borrower = sqlx::query_as::<_, Borrower>("select * from borrowers where id = $1")
        .bind(borrower_id)
        .fetch_optional(pool)
        .await?;
    Ok(borrower)
}

const BORROWER_WITH_LOAN: &str = "
    select
      b.id,
      b.name,
      b.phone_e164,
      b.email,
      b.loan_id,
      b.language_pref,
      b.is_dnc,
      l.due_amount,
      l.days_past_due,
      l.due_date,
      l.status as loan_status
    from borrowers b
    left join loans l on l.borrower_id = b.id
";

/// Borrower with their loan, looked up by caller id.
pub async fn get_borrower_by_phone(
    pool: &PgPool,
    phone_e164: &str,
) -> Result<Option<BorrowerWithLoan>, AppError> {
    let sql = format!("{BORROWER_WITH_LOAN} where b.phone_e164 = $1 order by l.id limit 1");
    let borrower = sqlx::query_as::<_, BorrowerWithLoan>(&sql)
        .bind(phone_e164)
        .fetch_optional(pool)
        .await?;
    Ok(borrower)
}

pub async fn get_borrower_with_loan(
    pool: &PgPool,
    borrower_id: i32,
) -> Result<Option<BorrowerWithLoan>, AppError> {
    let sql = format!("{BORROWER_WITH_LOAN} where b.id = $1 order by l.id limit 1");
    let borrower = sqlx::query_as::<_, BorrowerWithLoan>(&sql)
        .bind(borrower_id)
        .fetch_optional(pool)
        .await?;
    Ok(borrower)
}

pub async fn get_loan_by_loan_id(pool: &PgPool, loan_id: &str) -> Result<Option<Loan>, AppError> {
    let loan = sqlx::query_as::<_, Loan>("select * from loans where loan_id = $1")
        .bind(loan_id)
        .fetch_optional(pool)
        .await?;
    Ok(loan)
}

/// Contact-detail change. `None` leaves a column as it is.
pub async fn update_borrower_contact(
    pool: &PgPool,
    borrower_id: i32,
    phone_e164: Option<&str>,
    email: Option<&str>,
) -> Result<Borrower, AppError> {
    let borrower = sqlx::query_as::<_, Borrower>(
        "
        update borrowers
        set phone_e164 = coalesce($2, phone_e164),
            email = coalesce($3, email)
        where id = $1
        returning *
        ",
    )
    .bind(borrower_id)
    .bind(phone_e164)
    .bind(email)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("borrower", borrower_id))?;
    log_audit(
        pool,
        "borrowers",
        borrower_id,
        "CONTACT_UPDATED",
        Some(json!({
            "phone_changed": phone_e164.is_some(),
            "email_changed": email.is_some(),
        })),
    )
    .await;
    Ok(borrower)
}

// ---------------------------------------------------------------------------------------------
// Call sessions

pub async fn create_call_session(
    pool: &PgPool,
    call_sid: &str,
    borrower_id: Option<i32>,
    direction: CallDirection,
) -> Result<CallSession, AppError> {
    let session = sqlx::query_as::<_, CallSession>(
        "
        insert into call_sessions (
          call_sid,
          borrower_id,
          direction,
          started_at,
          status
        ) values (
          $1,
          $2,
          $3,
          now(),
          'INITIATED'
        )
        returning *
        ",
    )
    .bind(call_sid)
    .bind(borrower_id)
    .bind(direction)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        error!(error=%e, call_sid, "failed to create call session");
        AppError::from(e)
    })?;
    log_audit(
        pool,
        "call_sessions",
        session.id,
        "CREATED",
        Some(json!({
            "call_sid": call_sid,
            "borrower_id": borrower_id,
            "direction": direction.as_str(),
        })),
    )
    .await;
    Ok(session)
}

pub async fn get_call_session(
    pool: &PgPool,
    session_id: i32,
) -> Result<Option<CallSession>, AppError> {
    let session = sqlx::query_as::<_, CallSession>("select * from call_sessions where id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await?;
    Ok(session)
}

pub async fn get_call_session_by_sid(
    pool: &PgPool,
    call_sid: &str,
) -> Result<Option<CallSession>, AppError> {
    let session =
        sqlx::query_as::<_, CallSession>("select * from call_sessions where call_sid = $1")
            .bind(call_sid)
            .fetch_optional(pool)
            .await?;
    Ok(session)
}

/// Record dialogue progress. Verification state and outcome are only written when given.
pub async fn update_call_session(
    pool: &PgPool,
    session_id: i32,
    current_state: &str,
    verification_state: Option<VerificationState>,
    outcome: Option<&str>,
) -> Result<CallSession, AppError> {
    sqlx::query_as::<_, CallSession>(
        "
        update call_sessions
        set current_state = $2,
            verification_state = coalesce($3, verification_state),
            outcome = coalesce($4, outcome)
        where id = $1
        returning *
        ",
    )
    .bind(session_id)
    .bind(current_state)
    .bind(verification_state)
    .bind(outcome)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| AppError::not_found("call session", session_id))
}

/// Swap the placeholder SID of an outbound session for the one Twilio assigned.
pub async fn replace_call_sid(
    pool: &PgPool,
    session_id: i32,
    call_sid: &str,
) -> Result<(), AppError> {
    let result = sqlx::query("update call_sessions set call_sid = $2 where id = $1")
        .bind(session_id)
        .bind(call_sid)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("call session", session_id));
    }
    Ok(())
}

/// Apply a telephony status update. Updates that would move a session backwards (for example a
/// late "ringing" after "completed") are ignored and the stored session is returned unchanged.
pub async fn update_call_status(
    pool: &PgPool,
    call_sid: &str,
    status: CallSessionStatus,
    duration_seconds: Option<i32>,
) -> Result<CallSession, AppError> {
    let mut tx = pool.begin().await?;
    let session = sqlx::query_as::<_, CallSession>(
        "select * from call_sessions where call_sid = $1 for update",
    )
    .bind(call_sid)
    .fetch_optional(&mut tx)
    .await?
    .ok_or_else(|| AppError::not_found("call session", call_sid))?;

    if !session.status.can_transition_to(status) {
        warn!(
            call_sid,
            from=%session.status,
            to=%status,
            "ignoring out-of-order call status"
        );
        tx.commit().await?;
        return Ok(session);
    }

    let updated = sqlx::query_as::<_, CallSession>(
        "
        update call_sessions
        set status = $2,
            ended_at = case when $3 then coalesce(ended_at, now()) else ended_at end,
            duration_seconds = coalesce($4, duration_seconds)
        where id = $1
        returning *
        ",
    )
    .bind(session.id)
    .bind(status)
    .bind(status.is_terminal())
    .bind(duration_seconds)
    .fetch_one(&mut tx)
    .await?;
    tx.commit().await?;
    debug!(call_sid, status=%status, "call status updated");
    Ok(updated)
}

/// Append a line to the session's running transcript.
pub async fn append_transcript(
    pool: &PgPool,
    session_id: i32,
    line: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "
        update call_sessions
        set transcript = case
              when transcript is null or transcript = '' then $2
              else transcript || E'\\n' || $2
            end
        where id = $1
        ",
    )
    .bind(session_id)
    .bind(line)
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------------------------
// Call logs

const INSERT_CALL_LOG: &str = "
    insert into call_logs (
      call_session_id,
      turn_no,
      role,
      text,
      intent,
      sentiment,
      slots,
      confidence
    ) values (
      $1,
      $2,
      $3,
      $4,
      $5,
      $6,
      $7,
      $8
    )
    returning *
";

/// Append a turn with the next turn number. The session row is locked while numbering, so
/// concurrent writers for one call cannot produce duplicate or decreasing numbers.
pub async fn append_call_turn(
    pool: &PgPool,
    session_id: i32,
    turn: &NewTurn,
) -> Result<CallLog, AppError> {
    let mut tx = pool.begin().await?;
    let last_turn_no = lock_session_and_last_turn(&mut tx, session_id).await?;
    let log = sqlx::query_as::<_, CallLog>(INSERT_CALL_LOG)
        .bind(session_id)
        .bind(last_turn_no + 1)
        .bind(turn.role)
        .bind(&turn.text)
        .bind(&turn.intent)
        .bind(&turn.sentiment)
        .bind(&turn.slots)
        .bind(turn.confidence)
        .fetch_one(&mut tx)
        .await?;
    tx.commit().await?;
    Ok(log)
}

/// Write a turn with a caller-chosen number, which must exceed every number already logged for
/// the session.
pub async fn log_call_turn(
    pool: &PgPool,
    session_id: i32,
    turn_no: i32,
    turn: &NewTurn,
) -> Result<CallLog, AppError> {
    let mut tx = pool.begin().await?;
    let last_turn_no = lock_session_and_last_turn(&mut tx, session_id).await?;
    if turn_no <= last_turn_no {
        return Err(AppError::TurnOutOfOrder {
            session_id,
            turn_no,
            last_turn_no,
        });
    }
    let log = sqlx::query_as::<_, CallLog>(INSERT_CALL_LOG)
        .bind(session_id)
        .bind(turn_no)
        .bind(turn.role)
        .bind(&turn.text)
        .bind(&turn.intent)
        .bind(&turn.sentiment)
        .bind(&turn.slots)
        .bind(turn.confidence)
        .fetch_one(&mut tx)
        .await?;
    tx.commit().await?;
    Ok(log)
}

async fn lock_session_and_last_turn(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: i32,
) -> Result<i32, AppError> {
    sqlx::query("select id from call_sessions where id = $1 for update")
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found("call session", session_id))?;
    let (last,): (Option<i32>,) =
        sqlx::query_as("select max(turn_no) from call_logs where call_session_id = $1")
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await?;
    Ok(last.unwrap_or(0))
}

pub async fn list_call_turns(pool: &PgPool, session_id: i32) -> Result<Vec<CallLog>, AppError> {
    let logs = sqlx::query_as::<_, CallLog>(
        "select * from call_logs where call_session_id = $1 order by turn_no",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;
    Ok(logs)
}

pub async fn last_bot_message(pool: &PgPool, session_id: i32) -> Result<Option<String>, AppError> {
    let text: Option<(String,)> = sqlx::query_as(
        "
        select text
        from call_logs
        where call_session_id = $1 and role = 'BOT'
        order by turn_no desc
        limit 1
        ",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    Ok(text.map(|(t,)| t))
}

// ---------------------------------------------------------------------------------------------
// Promises, DNC, callbacks

pub async fn save_ptp_promise(
    pool: &PgPool,
    borrower_id: i32,
    session_id: Option<i32>,
    promise_date: Date,
    amount: &BigDecimal,
) -> Result<PtpPromise, AppError> {
    let promise = sqlx::query_as::<_, PtpPromise>(
        "
        insert into ptp_promises (
          borrower_id,
          call_session_id,
          promise_date,
          amount
        ) values (
          $1,
          $2,
          $3,
          $4
        )
        returning *
        ",
    )
    .bind(borrower_id)
    .bind(session_id)
    .bind(promise_date)
    .bind(amount)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        error!(error=%e, borrower_id, "failed to save promise to pay");
        AppError::from(e)
    })?;
    log_audit(
        pool,
        "ptp_promises",
        promise.id,
        "CREATED",
        Some(json!({
            "borrower_id": borrower_id,
            "promise_date": promise_date.to_string(),
            "amount": amount.to_string(),
        })),
    )
    .await;
    Ok(promise)
}

/// Close an active promise as fulfilled or broken.
pub async fn update_ptp_status(
    pool: &PgPool,
    ptp_id: i32,
    status: PtpStatus,
) -> Result<PtpPromise, AppError> {
    let updated = sqlx::query_as::<_, PtpPromise>(
        "
        update ptp_promises
        set status = $2
        where id = $1 and status = 'ACTIVE'
        returning *
        ",
    )
    .bind(ptp_id)
    .bind(status)
    .fetch_optional(pool)
    .await?;
    match updated {
        Some(promise) => {
            log_audit(
                pool,
                "ptp_promises",
                ptp_id,
                "STATUS_CHANGED",
                Some(json!({ "status": status.as_str() })),
            )
            .await;
            Ok(promise)
        }
        None => {
            let current: Option<(PtpStatus,)> =
                sqlx::query_as("select status from ptp_promises where id = $1")
                    .bind(ptp_id)
                    .fetch_optional(pool)
                    .await?;
            match current {
                Some((from,)) => Err(AppError::InvalidTransition {
                    entity: "ptp promise",
                    id: ptp_id,
                    from: from.to_string(),
                    to: status.to_string(),
                }),
                None => Err(AppError::not_found("ptp promise", ptp_id)),
            }
        }
    }
}

pub async fn list_ptp_promises(
    pool: &PgPool,
    borrower_id: i32,
) -> Result<Vec<PtpPromise>, AppError> {
    let promises = sqlx::query_as::<_, PtpPromise>(
        "select * from ptp_promises where borrower_id = $1 order by promise_date, id",
    )
    .bind(borrower_id)
    .fetch_all(pool)
    .await?;
    Ok(promises)
}

/// Opt the borrower out of calls. The flag and the request row are written together so one
/// never exists without the other.
pub async fn mark_borrower_dnc(
    pool: &PgPool,
    borrower_id: i32,
    session_id: Option<i32>,
    reason: Option<&str>,
) -> Result<DncRequest, AppError> {
    let reason = reason
        .filter(|r| !r.trim().is_empty())
        .unwrap_or("Customer request");
    let mut tx = pool.begin().await?;
    let updated = sqlx::query("update borrowers set is_dnc = true where id = $1")
        .bind(borrower_id)
        .execute(&mut tx)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(AppError::not_found("borrower", borrower_id));
    }
    let request = sqlx::query_as::<_, DncRequest>(
        "
        insert into dnc_requests (
          borrower_id,
          call_session_id,
          reason
        ) values (
          $1,
          $2,
          $3
        )
        returning *
        ",
    )
    .bind(borrower_id)
    .bind(session_id)
    .bind(reason)
    .fetch_one(&mut tx)
    .await?;
    tx.commit().await.map_err(|e| {
        error!(error=%e, borrower_id, "failed to commit dnc request");
        AppError::from(e)
    })?;
    log_audit(
        pool,
        "borrowers",
        borrower_id,
        "MARKED_DNC",
        Some(json!({ "reason": reason, "session_id": session_id })),
    )
    .await;
    Ok(request)
}

pub async fn list_dnc_requests(
    pool: &PgPool,
    borrower_id: i32,
) -> Result<Vec<DncRequest>, AppError> {
    let requests = sqlx::query_as::<_, DncRequest>(
        "select * from dnc_requests where borrower_id = $1 order by created_at, id",
    )
    .bind(borrower_id)
    .fetch_all(pool)
    .await?;
    Ok(requests)
}

pub async fn schedule_callback(
    pool: &PgPool,
    borrower_id: i32,
    session_id: Option<i32>,
    scheduled_at: OffsetDateTime,
    reason: Option<&str>,
) -> Result<Callback, AppError> {
    let callback = sqlx::query_as::<_, Callback>(
        "
        insert into callbacks (
          borrower_id,
          call_session_id,
          scheduled_at,
          reason
        ) values (
          $1,
          $2,
          $3,
          $4
        )
        returning *
        ",
    )
    .bind(borrower_id)
    .bind(session_id)
    .bind(scheduled_at)
    .bind(reason)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        error!(error=%e, borrower_id, "failed to schedule callback");
        AppError::from(e)
    })?;
    log_audit(
        pool,
        "callbacks",
        callback.id,
        "SCHEDULED",
        Some(json!({
            "borrower_id": borrower_id,
            "scheduled_at": scheduled_at.to_string(),
            "reason": reason,
        })),
    )
    .await;
    Ok(callback)
}

/// Complete or cancel a scheduled callback.
pub async fn update_callback_status(
    pool: &PgPool,
    callback_id: i32,
    status: CallbackStatus,
) -> Result<Callback, AppError> {
    let updated = sqlx::query_as::<_, Callback>(
        "
        update callbacks
        set status = $2
        where id = $1 and status = 'SCHEDULED'
        returning *
        ",
    )
    .bind(callback_id)
    .bind(status)
    .fetch_optional(pool)
    .await?;
    if let Some(callback) = updated {
        log_audit(
            pool,
            "callbacks",
            callback_id,
            "STATUS_CHANGED",
            Some(json!({ "status": status.as_str() })),
        )
        .await;
        return Ok(callback);
    }
    let current: Option<(CallbackStatus,)> =
        sqlx::query_as("select status from callbacks where id = $1")
            .bind(callback_id)
            .fetch_optional(pool)
            .await?;
    match current {
        Some((from,)) => Err(AppError::InvalidTransition {
            entity: "callback",
            id: callback_id,
            from: from.to_string(),
            to: status.to_string(),
        }),
        None => Err(AppError::not_found("callback", callback_id)),
    }
}

/// Scheduled callbacks that are due, oldest first, skipping borrowers who opted out since.
pub async fn due_callbacks(
    pool: &PgPool,
    now: OffsetDateTime,
    limit: i64,
) -> Result<Vec<Callback>, AppError> {
    let callbacks = sqlx::query_as::<_, Callback>(
        "
        select c.*
        from callbacks c
        join borrowers b on b.id = c.borrower_id
        where c.status = 'SCHEDULED'
          and c.scheduled_at <= $1
          and b.is_dnc = false
        order by c.scheduled_at
        limit $2
        ",
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(callbacks)
}

// ---------------------------------------------------------------------------------------------
// Campaign queries

/// Overdue, callable borrowers that have had fewer than `max_attempts` calls in the last day,
/// most delinquent first. Borrowers in `exclude` are skipped.
pub async fn get_overdue_borrowers(
    pool: &PgPool,
    max_attempts: i64,
    exclude: &[i32],
    limit: i64,
) -> Result<Vec<OverdueBorrower>, AppError> {
    let borrowers = sqlx::query_as::<_, OverdueBorrower>(
        "
        select
          b.id,
          b.name,
          b.phone_e164,
          b.language_pref,
          l.due_amount,
          l.days_past_due,
          l.due_date,
          count(cs.id) as call_count
        from borrowers b
        join loans l on l.borrower_id = b.id
        left join call_sessions cs
          on cs.borrower_id = b.id
          and cs.created_at >= now() - interval '1 day'
        where l.status = 'OVERDUE'
          and b.is_dnc = false
          and l.days_past_due > 0
          and b.id <> all($2)
        group by b.id, l.id
        having count(cs.id) < $1
        order by l.days_past_due desc, l.due_amount desc
        limit $3
        ",
    )
    .bind(max_attempts)
    .bind(exclude)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(borrowers)
}

/// Borrowers in early delinquency (1 to 30 days) who can still be contacted.
pub async fn reminder_candidates(
    pool: &PgPool,
    limit: i64,
) -> Result<Vec<ReminderCandidate>, AppError> {
    let candidates = sqlx::query_as::<_, ReminderCandidate>(
        "
        select
          b.id,
          b.name,
          b.phone_e164,
          b.language_pref,
          l.due_amount,
          l.days_past_due
        from borrowers b
        join loans l on l.borrower_id = b.id
        where l.status = 'OVERDUE'
          and b.is_dnc = false
          and l.days_past_due between 1 and 30
        order by l.days_past_due desc, b.id
        limit $1
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(candidates)
}

// ---------------------------------------------------------------------------------------------
// Audit

/// Append an audit row. Failures are logged and swallowed; auditing never aborts the write it
/// describes.
pub async fn log_audit(
    pool: &PgPool,
    entity: &str,
    entity_id: i32,
    action: &str,
    meta: Option<Value>,
) {
    let res = sqlx::query(
        "
        insert into audit (
          entity,
          entity_id,
          action,
          meta_json
        ) values (
          $1,
          $2,
          $3,
          $4
        )
        ",
    )
    .bind(entity)
    .bind(entity_id)
    .bind(action)
    .bind(meta)
    .execute(pool)
    .await;
    if let Err(e) = res {
        error!(error=%e, entity, entity_id, action, "failed to write audit row");
    }
}

pub async fn list_audit_for_entity(
    pool: &PgPool,
    entity: &str,
    entity_id: i32,
) -> Result<Vec<AuditEntry>, AppError> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "
        select *
        from audit
        where entity = $1 and entity_id = $2
        order by created_at, id
        ",
    )
    .bind(entity)
    .bind(entity_id)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

pub async fn list_audit_between(
    pool: &PgPool,
    from: OffsetDateTime,
    to: OffsetDateTime,
) -> Result<Vec<AuditEntry>, AppError> {
    let entries = sqlx::query_as::<_, AuditEntry>(
        "
        select *
        from audit
        where created_at >= $1 and created_at < $2
        order by created_at, id
        ",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}

// ---------------------------------------------------------------------------------------------
// Consistency and maintenance

/// Borrowers whose `is_dnc` flag disagrees with their DNC request history.
pub async fn dnc_inconsistencies(pool: &PgPool) -> Result<Vec<i32>, AppError> {
    let rows: Vec<(i32,)> = sqlx::query_as(
        "
        select b.id
        from borrowers b
        where b.is_dnc <> exists (
          select 1 from dnc_requests d where d.borrower_id = b.id
        )
        order by b.id
        ",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Open loans whose status or days-past-due no longer match `today`.
pub async fn loan_status_inconsistencies(
    pool: &PgPool,
    today: Date,
) -> Result<Vec<LoanStatusMismatch>, AppError> {
    let open_loans = sqlx::query_as::<_, LoanStatusMismatch>(
        "
        select loan_id, status, days_past_due, due_date
        from loans
        where status not in ('SETTLED', 'WRITTEN_OFF')
        order by loan_id
        ",
    )
    .fetch_all(pool)
    .await?;
    Ok(open_loans
        .into_iter()
        .filter(|l| is_loan_status_stale(l.status, l.days_past_due, l.due_date, today))
        .collect())
}

/// Nightly upkeep in one transaction: purge old call logs, refresh delinquency of open loans
/// and break promises whose date has passed.
pub async fn run_daily_maintenance(
    pool: &PgPool,
    today: Date,
    retention_days: i64,
) -> Result<MaintenanceReport, AppError> {
    let mut tx = pool.begin().await?;

    let deleted_logs = sqlx::query(
        "delete from call_logs where created_at < now() - make_interval(days => $1::int)",
    )
    .bind(retention_days)
    .execute(&mut tx)
    .await?
    .rows_affected();

    let open_loans: Vec<(i32, LoanStatus, i32, Date)> = sqlx::query_as(
        "
        select id, status, days_past_due, due_date
        from loans
        where status not in ('SETTLED', 'WRITTEN_OFF')
        for update
        ",
    )
    .fetch_all(&mut tx)
    .await?;
    let mut updated_loans = 0;
    for (id, status, dpd, due_date) in open_loans {
        let (next_status, next_dpd) = derive_loan_status(status, dpd, due_date, today);
        if (next_status, next_dpd) == (status, dpd) {
            continue;
        }
        updated_loans +=
            sqlx::query("update loans set status = $1, days_past_due = $2 where id = $3")
                .bind(next_status)
                .bind(next_dpd)
                .bind(id)
                .execute(&mut tx)
                .await?
                .rows_affected();
    }

    let active_promises: Vec<(i32, PtpStatus, Date)> = sqlx::query_as(
        "
        select id, status, promise_date
        from ptp_promises
        where status = 'ACTIVE'
        for update
        ",
    )
    .fetch_all(&mut tx)
    .await?;
    let broken: Vec<i32> = active_promises
        .into_iter()
        .filter(|(_, status, promise_date)| is_promise_broken(*status, *promise_date, today))
        .map(|(id, _, _)| id)
        .collect();
    let broken_promises = if broken.is_empty() {
        0
    } else {
        sqlx::query("update ptp_promises set status = 'BROKEN' where id = any($1)")
            .bind(&broken[..])
            .execute(&mut tx)
            .await?
            .rows_affected()
    };

    tx.commit().await?;
    let report = MaintenanceReport {
        deleted_logs,
        updated_loans,
        broken_promises,
    };
    info!(?report, "daily maintenance completed");
    Ok(report)
}
