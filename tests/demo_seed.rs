#![cfg(feature = "db-tests")]

use loan_voice_bot::db;
use loan_voice_bot::db_types::{LanguagePref, LoanStatus};
use sqlx::types::time::Date;
use sqlx::PgPool;
use time::Duration;

async fn seeded(pool: &PgPool) {
    db::seed_demo_data(pool).await.unwrap();
}

async fn db_today(pool: &PgPool) -> Date {
    let (today,): (Date,) = sqlx::query_as("select current_date")
        .fetch_one(pool)
        .await
        .unwrap();
    today
}

#[sqlx::test]
async fn dnc_borrower_has_one_request(pool: PgPool) {
    seeded(&pool).await;
    let rajesh = db::get_borrower(&pool, 5).await.unwrap().unwrap();
    assert_eq!(rajesh.name, "Rajesh Singh");
    assert!(rajesh.is_dnc);

    let requests = db::list_dnc_requests(&pool, 5).await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].reason.as_deref(),
        Some("Customer requested no more calls")
    );
    assert!(db::dnc_inconsistencies(&pool).await.unwrap().is_empty());
}

#[sqlx::test]
async fn loan002_is_thirty_days_overdue(pool: PgPool) {
    seeded(&pool).await;
    let loan = db::get_loan_by_loan_id(&pool, "LOAN002").await.unwrap().unwrap();
    assert_eq!(loan.status, LoanStatus::Overdue);
    assert_eq!(loan.days_past_due, 30);
    assert_eq!(loan.due_date, db_today(&pool).await - Duration::days(30));
    assert!(db::loan_status_inconsistencies(&pool, db_today(&pool).await)
        .await
        .unwrap()
        .is_empty());
}

#[sqlx::test]
async fn seeding_twice_is_harmless(pool: PgPool) {
    seeded(&pool).await;
    seeded(&pool).await;
    let (borrowers,): (i64,) = sqlx::query_as("select count(*) from borrowers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(borrowers, 5);

    // Sequences continue after the seeded ids.
    let session = db::create_call_session(
        &pool,
        "CA_AFTER_SEED",
        Some(1),
        loan_voice_bot::db_types::CallDirection::Inbound,
    )
    .await
    .unwrap();
    assert!(session.id > 2);
}

#[sqlx::test]
async fn caller_lookup_joins_the_loan(pool: PgPool) {
    seeded(&pool).await;
    let priya = db::get_borrower_by_phone(&pool, "+919876543211")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(priya.language_pref, LanguagePref::Hi);
    assert_eq!(priya.loan_status, Some(LoanStatus::Overdue));
    assert_eq!(priya.days_past_due, Some(30));
    assert!(db::get_borrower_by_phone(&pool, "+910000000000")
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test]
async fn overdue_queue_excludes_the_dnc_borrower(pool: PgPool) {
    seeded(&pool).await;
    let queue = db::get_overdue_borrowers(&pool, 3, &[], 10).await.unwrap();
    let ids: Vec<i32> = queue.iter().map(|b| b.id).collect();
    assert!(!ids.contains(&5));
    assert!(!ids.contains(&1));
    assert_eq!(ids.first(), Some(&4));
}

#[sqlx::test]
async fn callback_borrower_is_not_redialed_from_the_overdue_queue(pool: PgPool) {
    seeded(&pool).await;
    sqlx::query("update callbacks set scheduled_at = now() - interval '1 hour' where id = 1")
        .execute(&pool)
        .await
        .unwrap();
    let due = db::due_callbacks(&pool, time::OffsetDateTime::now_utc(), 10)
        .await
        .unwrap();
    let dialed: Vec<i32> = due.iter().map(|c| c.borrower_id).collect();
    assert_eq!(dialed, vec![3]);
    db::create_call_session(
        &pool,
        "OUTBOUND-callback",
        Some(3),
        loan_voice_bot::db_types::CallDirection::Outbound,
    )
    .await
    .unwrap();

    let queue = db::get_overdue_borrowers(&pool, 3, &dialed, 9).await.unwrap();
    let ids: Vec<i32> = queue.iter().map(|b| b.id).collect();
    assert!(!ids.contains(&3), "{ids:?}");
    assert!(ids.contains(&4));
}
