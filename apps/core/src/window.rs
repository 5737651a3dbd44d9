use chrono::{DateTime, Duration, FixedOffset, NaiveDate};

/// Selectable booking dates: today plus the following `horizon_days - 1`
/// days, in the salon-local calendar.
///
/// Pure function of `now`; ordering is strictly ascending with no
/// duplicates.
pub fn available_dates(
    now: DateTime<FixedOffset>,
    min_lead_hours: i64,
    horizon_days: u32,
) -> Vec<NaiveDate> {
    let today = now.date_naive();
    let earliest = now + Duration::hours(min_lead_hours);

    (0..i64::from(horizon_days))
        .map(|offset| today + Duration::days(offset))
        .filter(|day| *day != today || today_selectable(today, earliest))
        .collect()
}

/// Whether today should still be offered as a booking date.
///
/// Today stays selectable even when the lead time pushes the earliest
/// bookable instant past midnight — the slot list for it simply comes back
/// short or empty. Only a lead-adjusted instant that lands *before* today
/// (impossible with a non-negative lead) would drop it.
fn today_selectable(today: NaiveDate, earliest: DateTime<FixedOffset>) -> bool {
    earliest.date_naive() >= today
}

// ── Tests ──
