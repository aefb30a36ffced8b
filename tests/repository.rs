#![cfg(feature = "db-tests")]

use bigdecimal::BigDecimal;
use loan_voice_bot::db;
use loan_voice_bot::db_types::{
    Borrower, CallDirection, CallSessionStatus, CallbackStatus, LanguagePref, LoanStatus,
    NewBorrower, NewLoan, NewTurn, PtpStatus, TurnRole, VerificationState,
};
use loan_voice_bot::error::AppError;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};

fn new_borrower(n: u32) -> NewBorrower {
    NewBorrower {
        name: format!("Test Borrower {n}"),
        phone_e164: format!("+9190000000{n:02}"),
        email: None,
        loan_id: format!("TEST{n:03}"),
        language_pref: LanguagePref::En,
        consent_ts: None,
    }
}

fn new_loan(borrower: &Borrower, due_in_days: i64, status: LoanStatus, dpd: i32) -> NewLoan {
    NewLoan {
        borrower_id: borrower.id,
        loan_id: borrower.loan_id.clone(),
        principal: BigDecimal::from(50000),
        due_amount: BigDecimal::from(5000),
        due_date: OffsetDateTime::now_utc().date() + Duration::days(due_in_days),
        status,
        days_past_due: dpd,
    }
}

#[sqlx::test]
async fn duplicate_phone_is_rejected(pool: PgPool) {
    db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let mut dup = new_borrower(2);
    dup.phone_e164 = new_borrower(1).phone_e164;
    let err = db::create_borrower(&pool, &dup).await.unwrap_err();
    assert!(
        matches!(
            &err,
            AppError::Duplicate { constraint } if constraint == "borrowers_phone_e164_key"
        ),
        "{err:?}"
    );
}

#[sqlx::test]
async fn duplicate_loan_reference_is_rejected(pool: PgPool) {
    db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let mut dup = new_borrower(2);
    dup.loan_id = new_borrower(1).loan_id;
    let err = db::create_borrower(&pool, &dup).await.unwrap_err();
    assert!(
        matches!(&err, AppError::Duplicate { constraint } if constraint == "borrowers_loan_id_key"),
        "{err:?}"
    );
}

#[sqlx::test]
async fn rows_must_reference_existing_parents(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();

    let mut orphan_loan = new_loan(&borrower, 10, LoanStatus::Current, 0);
    orphan_loan.borrower_id = 9999;
    let err = db::create_loan(&pool, &orphan_loan).await.unwrap_err();
    assert!(matches!(err, AppError::MissingReference { .. }), "{err:?}");

    let today = OffsetDateTime::now_utc().date();
    let err = db::save_ptp_promise(&pool, 9999, None, today, &BigDecimal::from(100))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MissingReference { .. }), "{err:?}");

    let err = db::schedule_callback(
        &pool,
        borrower.id,
        Some(9999),
        OffsetDateTime::now_utc(),
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, AppError::MissingReference { .. }), "{err:?}");

    let err = db::append_call_turn(&pool, 9999, &NewTurn::bot("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }), "{err:?}");

    let err = db::mark_borrower_dnc(&pool, 9999, None, None).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }), "{err:?}");
}

#[sqlx::test]
async fn turns_are_numbered_in_order(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let session =
        db::create_call_session(&pool, "CA_TURNS", Some(borrower.id), CallDirection::Inbound)
            .await
            .unwrap();

    let first = db::append_call_turn(&pool, session.id, &NewTurn::bot("Hello"))
        .await
        .unwrap();
    let second = db::append_call_turn(&pool, session.id, &NewTurn::caller("Yes", Some(0.9)))
        .await
        .unwrap();
    assert_eq!((first.turn_no, second.turn_no), (1, 2));
    assert_eq!(second.role, TurnRole::Caller);

    let err = db::log_call_turn(&pool, session.id, 2, &NewTurn::bot("again"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AppError::TurnOutOfOrder { turn_no: 2, last_turn_no: 2, .. }),
        "{err:?}"
    );

    db::log_call_turn(&pool, session.id, 5, &NewTurn::bot("skip ahead"))
        .await
        .unwrap();
    let next = db::append_call_turn(&pool, session.id, &NewTurn::caller("ok", None))
        .await
        .unwrap();
    assert_eq!(next.turn_no, 6);

    let turns = db::list_call_turns(&pool, session.id).await.unwrap();
    let numbers: Vec<i32> = turns.iter().map(|t| t.turn_no).collect();
    assert_eq!(numbers, vec![1, 2, 5, 6]);
    assert_eq!(
        db::last_bot_message(&pool, session.id).await.unwrap().as_deref(),
        Some("skip ahead")
    );
}

#[sqlx::test]
async fn concurrent_turns_get_distinct_numbers(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let session =
        db::create_call_session(&pool, "CA_RACE", Some(borrower.id), CallDirection::Inbound)
            .await
            .unwrap();

    let session_id = session.id;
    let mut handles = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            db::append_call_turn(&pool, session_id, &NewTurn::bot(format!("turn {i}"))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let numbers: Vec<i32> = db::list_call_turns(&pool, session_id)
        .await
        .unwrap()
        .iter()
        .map(|t| t.turn_no)
        .collect();
    assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
}

#[sqlx::test]
async fn dnc_flag_and_request_are_written_together(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let other = db::create_borrower(&pool, &new_borrower(2)).await.unwrap();

    let request = db::mark_borrower_dnc(&pool, borrower.id, None, Some("  "))
        .await
        .unwrap();
    assert_eq!(request.reason.as_deref(), Some("Customer request"));
    let stored = db::get_borrower(&pool, borrower.id).await.unwrap().unwrap();
    assert!(stored.is_dnc);
    assert_eq!(db::list_dnc_requests(&pool, borrower.id).await.unwrap().len(), 1);
    assert!(db::dnc_inconsistencies(&pool).await.unwrap().is_empty());

    let audit = db::list_audit_for_entity(&pool, "borrowers", borrower.id)
        .await
        .unwrap();
    let actions: Vec<&str> = audit.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["CREATED", "MARKED_DNC"]);

    // A flag set behind the service's back shows up in the consistency check.
    sqlx::query("update borrowers set is_dnc = true where id = $1")
        .bind(other.id)
        .execute(&pool)
        .await
        .unwrap();
    assert_eq!(db::dnc_inconsistencies(&pool).await.unwrap(), vec![other.id]);
}

#[sqlx::test]
async fn call_status_never_moves_backwards(pool: PgPool) {
    let session = db::create_call_session(&pool, "OUTBOUND-tmp", None, CallDirection::Outbound)
        .await
        .unwrap();
    db::replace_call_sid(&pool, session.id, "CA_REAL").await.unwrap();
    assert!(db::get_call_session_by_sid(&pool, "OUTBOUND-tmp")
        .await
        .unwrap()
        .is_none());

    let s = db::update_call_status(&pool, "CA_REAL", CallSessionStatus::InProgress, None)
        .await
        .unwrap();
    assert_eq!(s.status, CallSessionStatus::InProgress);
    assert!(s.ended_at.is_none());

    let s = db::update_call_status(&pool, "CA_REAL", CallSessionStatus::Completed, Some(42))
        .await
        .unwrap();
    assert_eq!(s.status, CallSessionStatus::Completed);
    assert_eq!(s.duration_seconds, Some(42));
    assert!(s.ended_at.is_some());

    let s = db::update_call_status(&pool, "CA_REAL", CallSessionStatus::Initiated, None)
        .await
        .unwrap();
    assert_eq!(s.status, CallSessionStatus::Completed);

    let err = db::update_call_status(&pool, "CA_MISSING", CallSessionStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }));
}

#[sqlx::test]
async fn session_progress_and_transcript(pool: PgPool) {
    let session = db::create_call_session(&pool, "CA_PROGRESS", None, CallDirection::Inbound)
        .await
        .unwrap();
    assert_eq!(session.status, CallSessionStatus::Initiated);
    assert_eq!(session.verification_state, VerificationState::Pending);

    db::update_call_session(&pool, session.id, "MAIN_MENU", Some(VerificationState::Verified), None)
        .await
        .unwrap();
    let s = db::update_call_session(&pool, session.id, "END_CALL", None, Some("DO_NOT_CALL"))
        .await
        .unwrap();
    assert_eq!(s.current_state.as_deref(), Some("END_CALL"));
    assert_eq!(s.verification_state, VerificationState::Verified);
    assert_eq!(s.outcome.as_deref(), Some("DO_NOT_CALL"));

    db::append_transcript(&pool, session.id, "Bot: Hello").await.unwrap();
    db::append_transcript(&pool, session.id, "Caller: Hi").await.unwrap();
    let s = db::get_call_session(&pool, session.id).await.unwrap().unwrap();
    assert_eq!(s.transcript.as_deref(), Some("Bot: Hello\nCaller: Hi"));
}

#[sqlx::test]
async fn promises_and_callbacks_close_once(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let today = OffsetDateTime::now_utc().date();

    let ptp = db::save_ptp_promise(&pool, borrower.id, None, today, &BigDecimal::from(2500))
        .await
        .unwrap();
    assert_eq!(ptp.status, PtpStatus::Active);
    db::update_ptp_status(&pool, ptp.id, PtpStatus::Fulfilled)
        .await
        .unwrap();
    let err = db::update_ptp_status(&pool, ptp.id, PtpStatus::Broken)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }), "{err:?}");

    let callback = db::schedule_callback(
        &pool,
        borrower.id,
        None,
        OffsetDateTime::now_utc() - Duration::hours(1),
        Some("Customer requested callback"),
    )
    .await
    .unwrap();
    let due = db::due_callbacks(&pool, OffsetDateTime::now_utc(), 10)
        .await
        .unwrap();
    assert_eq!(due.len(), 1);

    db::update_callback_status(&pool, callback.id, CallbackStatus::Completed)
        .await
        .unwrap();
    assert!(db::due_callbacks(&pool, OffsetDateTime::now_utc(), 10)
        .await
        .unwrap()
        .is_empty());
    let err = db::update_callback_status(&pool, callback.id, CallbackStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }), "{err:?}");
}

#[sqlx::test]
async fn overdue_queue_skips_dnc_and_recently_called(pool: PgPool) {
    let a = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let b = db::create_borrower(&pool, &new_borrower(2)).await.unwrap();
    let c = db::create_borrower(&pool, &new_borrower(3)).await.unwrap();
    db::create_loan(&pool, &new_loan(&a, -10, LoanStatus::Overdue, 10)).await.unwrap();
    db::create_loan(&pool, &new_loan(&b, -40, LoanStatus::Overdue, 40)).await.unwrap();
    db::create_loan(&pool, &new_loan(&c, -20, LoanStatus::Overdue, 20)).await.unwrap();
    db::mark_borrower_dnc(&pool, c.id, None, None).await.unwrap();

    let queue = db::get_overdue_borrowers(&pool, 3, &[], 10).await.unwrap();
    let ids: Vec<i32> = queue.iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![b.id, a.id]);

    db::create_call_session(&pool, "CA_RECENT", Some(b.id), CallDirection::Outbound)
        .await
        .unwrap();
    let queue = db::get_overdue_borrowers(&pool, 1, &[], 10).await.unwrap();
    let ids: Vec<i32> = queue.iter().map(|q| q.id).collect();
    assert_eq!(ids, vec![a.id]);

    let reminders = db::reminder_candidates(&pool, 50).await.unwrap();
    let ids: Vec<i32> = reminders.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a.id]);
}

#[sqlx::test]
async fn maintenance_refreshes_loans_and_breaks_promises(pool: PgPool) {
    let today = OffsetDateTime::now_utc().date();
    let open = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let settled = db::create_borrower(&pool, &new_borrower(2)).await.unwrap();
    db::create_loan(&pool, &new_loan(&open, -5, LoanStatus::Current, 0)).await.unwrap();
    db::create_loan(&pool, &new_loan(&settled, -50, LoanStatus::Settled, 7)).await.unwrap();

    let stale = db::loan_status_inconsistencies(&pool, today).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].loan_id, open.loan_id);

    let late = db::save_ptp_promise(
        &pool,
        open.id,
        None,
        today - Duration::days(1),
        &BigDecimal::from(500),
    )
    .await
    .unwrap();
    let upcoming = db::save_ptp_promise(
        &pool,
        open.id,
        None,
        today + Duration::days(3),
        &BigDecimal::from(500),
    )
    .await
    .unwrap();

    let session = db::create_call_session(&pool, "CA_OLD", Some(open.id), CallDirection::Inbound)
        .await
        .unwrap();
    let old = db::append_call_turn(&pool, session.id, &NewTurn::bot("old")).await.unwrap();
    db::append_call_turn(&pool, session.id, &NewTurn::bot("new")).await.unwrap();
    sqlx::query("update call_logs set created_at = now() - interval '100 days' where id = $1")
        .bind(old.id)
        .execute(&pool)
        .await
        .unwrap();

    let report = db::run_daily_maintenance(&pool, today, 90).await.unwrap();
    assert_eq!(report.deleted_logs, 1);
    assert_eq!(report.updated_loans, 1);
    assert_eq!(report.broken_promises, 1);

    let loan = db::get_loan_by_loan_id(&pool, &open.loan_id).await.unwrap().unwrap();
    assert_eq!((loan.status, loan.days_past_due), (LoanStatus::Overdue, 5));
    let loan = db::get_loan_by_loan_id(&pool, &settled.loan_id).await.unwrap().unwrap();
    assert_eq!((loan.status, loan.days_past_due), (LoanStatus::Settled, 7));
    assert!(db::loan_status_inconsistencies(&pool, today).await.unwrap().is_empty());

    let promises = db::list_ptp_promises(&pool, open.id).await.unwrap();
    let status_of = |id: i32| promises.iter().find(|p| p.id == id).map(|p| p.status);
    assert_eq!(status_of(late.id), Some(PtpStatus::Broken));
    assert_eq!(status_of(upcoming.id), Some(PtpStatus::Active));
    assert_eq!(db::list_call_turns(&pool, session.id).await.unwrap().len(), 1);
}

#[sqlx::test]
async fn contact_update_refreshes_updated_at_and_is_audited(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    sqlx::query("select pg_sleep(0.01)").execute(&pool).await.unwrap();

    let updated =
        db::update_borrower_contact(&pool, borrower.id, None, Some("amit@example.com"))
            .await
            .unwrap();
    assert_eq!(updated.email.as_deref(), Some("amit@example.com"));
    assert_eq!(updated.phone_e164, borrower.phone_e164);
    assert_eq!(updated.created_at, borrower.created_at);
    assert!(updated.updated_at > borrower.updated_at);

    let audit = db::list_audit_for_entity(&pool, "borrowers", borrower.id)
        .await
        .unwrap();
    let last = audit.last().unwrap();
    assert_eq!(last.action, "CONTACT_UPDATED");
    let meta = last.meta_json.as_ref().unwrap();
    assert_eq!(meta["email_changed"], true);
    assert_eq!(meta["phone_changed"], false);

    let err = db::update_borrower_contact(&pool, 9999, Some("+919000000099"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }), "{err:?}");
}

#[sqlx::test]
async fn every_write_moves_updated_at(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    let loan = db::create_loan(&pool, &new_loan(&borrower, 10, LoanStatus::Current, 0))
        .await
        .unwrap();
    let session =
        db::create_call_session(&pool, "CA_TOUCH", Some(borrower.id), CallDirection::Inbound)
            .await
            .unwrap();
    sqlx::query("select pg_sleep(0.01)").execute(&pool).await.unwrap();

    sqlx::query("update loans set due_amount = due_amount - 100 where id = $1")
        .bind(loan.id)
        .execute(&pool)
        .await
        .unwrap();
    let touched = db::get_loan_by_loan_id(&pool, &loan.loan_id).await.unwrap().unwrap();
    assert!(touched.updated_at > loan.updated_at);
    assert_eq!(touched.created_at, loan.created_at);

    let touched = db::update_call_session(&pool, session.id, "MAIN_MENU", None, None)
        .await
        .unwrap();
    assert!(touched.updated_at > session.updated_at);
}

#[sqlx::test]
async fn audit_rows_are_listed_by_time_window(pool: PgPool) {
    let before = OffsetDateTime::now_utc() - Duration::minutes(1);
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();
    db::mark_borrower_dnc(&pool, borrower.id, None, Some("Stop calling"))
        .await
        .unwrap();
    sqlx::query("update audit set created_at = now() - interval '10 days' where action = 'CREATED'")
        .execute(&pool)
        .await
        .unwrap();
    let after = OffsetDateTime::now_utc() + Duration::minutes(1);

    let recent = db::list_audit_between(&pool, before, after).await.unwrap();
    let actions: Vec<&str> = recent.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["MARKED_DNC"]);

    let older = db::list_audit_between(&pool, before - Duration::days(30), before)
        .await
        .unwrap();
    let actions: Vec<&str> = older.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, vec!["CREATED"]);
}

#[sqlx::test]
async fn session_references_must_exist(pool: PgPool) {
    let borrower = db::create_borrower(&pool, &new_borrower(1)).await.unwrap();

    let err = db::mark_borrower_dnc(&pool, borrower.id, Some(9999), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::MissingReference { .. }), "{err:?}");
    // the flag is rolled back with the rejected request
    let stored = db::get_borrower(&pool, borrower.id).await.unwrap().unwrap();
    assert!(!stored.is_dnc);
    assert!(db::list_dnc_requests(&pool, borrower.id).await.unwrap().is_empty());
    assert!(db::dnc_inconsistencies(&pool).await.unwrap().is_empty());

    let err = sqlx::query(
        "insert into call_logs (call_session_id, turn_no, role, text) values ($1, 1, 'BOT', 'hi')",
    )
    .bind(9999)
    .execute(&pool)
    .await
    .map_err(AppError::from)
    .unwrap_err();
    assert!(matches!(err, AppError::MissingReference { .. }), "{err:?}");
}
