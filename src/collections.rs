//! Delinquency and promise-to-pay rules shared by the call flow and the maintenance job.

use crate::db_types::{LoanStatus, PtpStatus};

use once_cell::sync::Lazy;
use regex::Regex;
use time::{Date, Duration, Month, Weekday};

pub const MONTH_NAMES: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("iso date pattern"));
static DAY_OF_MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({})\b",
        MONTH_NAMES.join("|")
    ))
    .expect("day of month pattern")
});

/// Recompute status and days-past-due from the due date. Closed loans keep their status and
/// counter untouched.
pub fn derive_loan_status(
    current: LoanStatus,
    current_dpd: i32,
    due_date: Date,
    today: Date,
) -> (LoanStatus, i32) {
    if current.is_closed() {
        return (current, current_dpd);
    }
    let dpd = days_past_due(due_date, today);
    let status = if dpd > 0 {
        LoanStatus::Overdue
    } else {
        LoanStatus::Current
    };
    (status, dpd)
}

/// Whole days since the due date, never negative.
pub fn days_past_due(due_date: Date, today: Date) -> i32 {
    let days = (today - due_date).whole_days();
    days.clamp(0, i32::MAX as i64) as i32
}

/// Whether the stored status and counter disagree with the due date.
pub fn is_loan_status_stale(status: LoanStatus, dpd: i32, due_date: Date, today: Date) -> bool {
    derive_loan_status(status, dpd, due_date, today) != (status, dpd)
}

/// Resolve a spoken payment date ("by Friday", "15th march", "2024-06-10") against `today`.
/// Explicit dates in the past are ignored. Weekday names mean the next such day strictly after
/// today; anything unrecognised means tomorrow.
pub fn parse_promise_date(text: &str, today: Date) -> Date {
    let lower = text.to_lowercase();
    if let Some(date) = explicit_date(&lower, today) {
        return date;
    }
    if lower.contains("today") {
        return today;
    }
    if lower.contains("tomorrow") {
        return today + Duration::days(1);
    }
    for weekday in WEEKDAYS {
        if lower.contains(weekday_name(weekday)) {
            return next_weekday(today, weekday);
        }
    }
    if lower.contains("next week") {
        return today + Duration::days(7);
    }
    if lower.contains("next month") {
        return today + Duration::days(30);
    }
    today + Duration::days(1)
}

/// `YYYY-MM-DD`, or a day and month name resolved to its next occurrence on or after today.
fn explicit_date(lower: &str, today: Date) -> Option<Date> {
    if let Some(caps) = ISO_DATE.captures(lower) {
        let year = caps[1].parse().ok()?;
        let month = Month::try_from(caps[2].parse::<u8>().ok()?).ok()?;
        let day = caps[3].parse().ok()?;
        return Date::from_calendar_date(year, month, day)
            .ok()
            .filter(|date| *date >= today);
    }
    let caps = DAY_OF_MONTH.captures(lower)?;
    let day: u8 = caps[1].parse().ok()?;
    let month_no = MONTH_NAMES.iter().position(|m| *m == &caps[2])? as u8 + 1;
    let month = Month::try_from(month_no).ok()?;
    match Date::from_calendar_date(today.year(), month, day) {
        Ok(date) if date >= today => Some(date),
        _ => Date::from_calendar_date(today.year() + 1, month, day).ok(),
    }
}

/// An active promise whose date has passed is broken.
pub fn is_promise_broken(status: PtpStatus, promise_date: Date, today: Date) -> bool {
    status == PtpStatus::Active && promise_date < today
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Monday,
    Weekday::Tuesday,
    Weekday::Wednesday,
    Weekday::Thursday,
    Weekday::Friday,
    Weekday::Saturday,
    Weekday::Sunday,
];

fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Monday => "monday",
        Weekday::Tuesday => "tuesday",
        Weekday::Wednesday => "wednesday",
        Weekday::Thursday => "thursday",
        Weekday::Friday => "friday",
        Weekday::Saturday => "saturday",
        Weekday::Sunday => "sunday",
    }
}

fn next_weekday(today: Date, weekday: Weekday) -> Date {
    let ahead = (weekday.number_days_from_monday() as i64
        - today.weekday().number_days_from_monday() as i64)
        .rem_euclid(7);
    let ahead = if ahead == 0 { 7 } else { ahead };
    today + Duration::days(ahead)
}
