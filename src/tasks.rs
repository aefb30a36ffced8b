use crate::consts::{
    DAILY_MAINTENANCE_CRON, OUTBOUND_BATCH_SIZE, OUTBOUND_CALLS_CRON, PAYMENT_REMINDERS_CRON,
    REMINDER_BATCH_SIZE,
};
use crate::db;
use crate::db_types::{CallDirection, CallSessionStatus, CallbackStatus, ReminderCandidate};
use crate::error::AppError;
use crate::types::AppState;
use crate::utils::{format_currency, mask_phone};

use chrono::{FixedOffset, Utc};
use cron::Schedule;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct OutboundCall {
    pub status: &'static str,
    pub call_sid: String,
    pub session_id: i32,
}

/// Dial a borrower. The session is created first under a placeholder SID so that Twilio's
/// answer webhook can find it, then re-keyed to the SID Twilio assigns.
pub async fn place_outbound_call(
    app_state: &AppState,
    borrower_id: i32,
) -> Result<OutboundCall, AppError> {
    let pool = &app_state.db_pool;
    let borrower = db::get_borrower(pool, borrower_id)
        .await?
        .ok_or_else(|| AppError::not_found("borrower", borrower_id))?;
    if borrower.is_dnc {
        return Err(AppError::DoNotCall(borrower_id));
    }

    let placeholder_sid = format!("OUTBOUND-{}", Uuid::new_v4());
    let session = db::create_call_session(
        pool,
        &placeholder_sid,
        Some(borrower_id),
        CallDirection::Outbound,
    )
    .await?;

    let base = &app_state.settings.app_public_url;
    let twiml_url = format!("{base}/voice/outbound/greeting?session_id={}", session.id);
    let status_url = format!("{base}/voice/status");
    let call = match app_state
        .create_twilio_call(&borrower.phone_e164, &twiml_url, &status_url)
        .await
    {
        Ok(call) => call,
        Err(e) => {
            if let Err(update_err) =
                db::update_call_status(pool, &placeholder_sid, CallSessionStatus::Failed, None)
                    .await
            {
                error!(error=%update_err, session_id = session.id, "failed to mark session failed");
            }
            return Err(e);
        }
    };
    db::replace_call_sid(pool, session.id, &call.sid).await?;
    info!(
        borrower_id,
        to=%mask_phone(&borrower.phone_e164),
        call_sid=%call.sid,
        "outbound call initiated"
    );
    Ok(OutboundCall {
        status: "success",
        call_sid: call.sid,
        session_id: session.id,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Job {
    OutboundCalls,
    DailyMaintenance,
    PaymentReminders,
}

impl Job {
    pub const ALL: [Job; 3] = [
        Job::OutboundCalls,
        Job::DailyMaintenance,
        Job::PaymentReminders,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Job::OutboundCalls => "outbound_calls",
            Job::DailyMaintenance => "daily_maintenance",
            Job::PaymentReminders => "payment_reminders",
        }
    }

    pub fn schedule(&self) -> Result<Schedule, AppError> {
        let expr = match self {
            Job::OutboundCalls => OUTBOUND_CALLS_CRON,
            Job::DailyMaintenance => DAILY_MAINTENANCE_CRON,
            Job::PaymentReminders => PAYMENT_REMINDERS_CRON,
        };
        Schedule::from_str(expr)
            .map_err(|e| AppError::Config(format!("bad cron expression {expr}: {e}")))
    }
}

pub async fn run_job(app_state: &AppState, job: Job) -> Result<(), AppError> {
    match job {
        Job::OutboundCalls => make_outbound_calls(app_state).await,
        Job::DailyMaintenance => daily_maintenance(app_state).await,
        Job::PaymentReminders => send_payment_reminders(app_state).await,
    }
}

/// Call back borrowers who asked for it, then work through the overdue list.
async fn make_outbound_calls(app_state: &AppState) -> Result<(), AppError> {
    let settings = &app_state.settings;
    let now = settings.now();
    if !settings.is_calling_hours(now) {
        info!("outside calling hours, skipping outbound calls");
        return Ok(());
    }
    let pool = &app_state.db_pool;

    let callbacks = db::due_callbacks(pool, now, OUTBOUND_BATCH_SIZE).await?;
    let mut dialed = Vec::with_capacity(callbacks.len());
    for callback in &callbacks {
        match place_outbound_call(app_state, callback.borrower_id).await {
            Ok(_) => {
                dialed.push(callback.borrower_id);
                if let Err(e) =
                    db::update_callback_status(pool, callback.id, CallbackStatus::Completed).await
                {
                    error!(error=%e, callback_id = callback.id, "failed to close dialed callback");
                }
            }
            Err(e) => warn!(error=%e, callback_id = callback.id, "scheduled callback failed"),
        }
    }

    let remaining = OUTBOUND_BATCH_SIZE - dialed.len() as i64;
    if remaining <= 0 {
        return Ok(());
    }
    let borrowers =
        db::get_overdue_borrowers(pool, settings.max_call_attempts, &dialed, remaining).await?;
    info!(
        callbacks = dialed.len(),
        overdue = borrowers.len(),
        "found borrowers for outbound calling"
    );
    for borrower in borrowers {
        if let Err(e) = place_outbound_call(app_state, borrower.id).await {
            warn!(error=%e, borrower_id = borrower.id, "failed to initiate outbound call");
        }
    }
    Ok(())
}

async fn daily_maintenance(app_state: &AppState) -> Result<(), AppError> {
    let settings = &app_state.settings;
    let report = db::run_daily_maintenance(
        &app_state.db_pool,
        settings.now().date(),
        settings.call_log_retention_days,
    )
    .await?;
    let orphaned = db::dnc_inconsistencies(&app_state.db_pool).await?;
    if !orphaned.is_empty() {
        warn!(borrower_ids=?orphaned, "do-not-call flags disagree with request history");
    }
    debug!(
        deleted_logs = report.deleted_logs,
        updated_loans = report.updated_loans,
        broken_promises = report.broken_promises,
        "maintenance counts"
    );
    Ok(())
}

pub fn reminder_text(candidate: &ReminderCandidate) -> String {
    format!(
        "Dear {}, your loan payment of {} is {} days overdue. Please pay at the earliest \
         to avoid further charges.",
        candidate.name,
        format_currency(&candidate.due_amount),
        candidate.days_past_due
    )
}

async fn send_payment_reminders(app_state: &AppState) -> Result<(), AppError> {
    let candidates = db::reminder_candidates(&app_state.db_pool, REMINDER_BATCH_SIZE).await?;
    let mut sent = 0;
    for candidate in &candidates {
        let to = mask_phone(&candidate.phone_e164);
        if !app_state.settings.sms_reminders_enabled {
            info!(
                to=%to,
                amount=%format_currency(&candidate.due_amount),
                days_past_due = candidate.days_past_due,
                "sms reminders disabled, would send reminder"
            );
            continue;
        }
        match app_state
            .send_twilio_sms(&candidate.phone_e164, &reminder_text(candidate))
            .await
        {
            Ok(message) => {
                sent += 1;
                debug!(to=%to, sid=%message.sid, "reminder sent");
            }
            Err(e) => warn!(error=%e, to=%to, "failed to send reminder"),
        }
    }
    info!(candidates = candidates.len(), sent, "reminder job completed");
    Ok(())
}

/// Background cron jobs. Dropping the handle leaves the jobs running; call `shutdown`.
pub struct Scheduler {
    join_handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(app_state: Arc<AppState>) -> Result<Self, AppError> {
        let offset = FixedOffset::east_opt(app_state.settings.timezone_offset.whole_seconds())
            .ok_or_else(|| AppError::Config("timezone offset out of range".to_string()))?;
        let mut join_handles = Vec::new();
        for job in Job::ALL {
            let schedule = job.schedule()?;
            join_handles.push(tokio::spawn(run_on_schedule(
                app_state.clone(),
                job,
                schedule,
                offset,
            )));
        }
        info!(jobs = join_handles.len(), "background scheduler started");
        Ok(Self { join_handles })
    }

    pub fn shutdown(self) {
        for handle in self.join_handles {
            handle.abort();
        }
        info!("background scheduler stopped");
    }
}

async fn run_on_schedule(
    app_state: Arc<AppState>,
    job: Job,
    schedule: Schedule,
    offset: FixedOffset,
) {
    loop {
        let Some(next) = schedule.upcoming(offset).next() else {
            warn!(job = job.name(), "schedule has no upcoming runs");
            return;
        };
        let wait = (next.with_timezone(&Utc) - Utc::now())
            .to_std()
            .unwrap_or_default();
        debug!(job = job.name(), next=%next, "job scheduled");
        tokio::time::sleep(wait).await;

        info!(job = job.name(), "starting job");
        if let Err(e) = run_job(&app_state, job).await {
            error!(error=%e, job = job.name(), "job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;
    use chrono::{TimeZone, Timelike};
    use crate::db_types::LanguagePref;

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
    }

    #[test]
    fn all_job_schedules_parse() {
        for job in Job::ALL {
            assert!(job.schedule().is_ok(), "{}", job.name());
        }
    }

    #[test]
    fn outbound_calls_run_every_half_hour_in_business_hours() {
        let schedule = Job::OutboundCalls.schedule().unwrap();
        let evening = ist().with_ymd_and_hms(2024, 6, 5, 18, 45, 0).unwrap();
        let runs: Vec<_> = schedule.after(&evening).take(3).collect();
        assert_eq!((runs[0].hour(), runs[0].minute()), (9, 0));
        assert_eq!((runs[1].hour(), runs[1].minute()), (9, 30));
        assert_eq!((runs[2].hour(), runs[2].minute()), (10, 0));
    }

    #[test]
    fn maintenance_runs_at_eleven_pm() {
        let schedule = Job::DailyMaintenance.schedule().unwrap();
        let morning = ist().with_ymd_and_hms(2024, 6, 5, 8, 0, 0).unwrap();
        let next = schedule.after(&morning).next().unwrap();
        assert_eq!((next.hour(), next.minute()), (23, 0));
    }

    #[test]
    fn reminder_text_includes_amount_and_days() {
        let candidate = ReminderCandidate {
            id: 2,
            name: "Priya Patel".to_string(),
            phone_e164: "+919876543211".to_string(),
            language_pref: LanguagePref::Hi,
            due_amount: BigDecimal::from(25000),
            days_past_due: 30,
        };
        let text = reminder_text(&candidate);
        assert!(text.starts_with("Dear Priya Patel"));
        assert!(text.contains("₹25,000.00"));
        assert!(text.contains("30 days overdue"));
    }
}
