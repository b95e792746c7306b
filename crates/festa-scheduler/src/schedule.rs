use chrono::{DateTime, Duration, Utc};

/// Period of a recurring effect. Non-positive values are clamped to one
/// second so a bad row cannot spin a timer task; values past what a
/// `Duration` holds saturate.
pub fn effect_period(period_secs: i64) -> Duration {
    Duration::try_seconds(period_secs.max(1)).unwrap_or(Duration::MAX)
}

/// `at + period`, saturating at the latest representable instant.
pub fn due_after(at: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    at.checked_add_signed(period).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Next due instant of a recurring effect, evaluated at `now`.
///
/// - never executed: one full period from `now`,
/// - executed before: `last + period`,
/// - `last + period` already behind `now` (process was down): `now`, i.e.
///   fire at once. The occurrence after that is measured from the fire
///   instant, not from the missed slot.
pub fn next_effect_due(
    last_executed: Option<DateTime<Utc>>,
    period: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match last_executed {
        None => due_after(now, period),
        Some(last) => {
            let next = due_after(last, period);
            if next < now {
                now
            } else {
                next
            }
        }
    }
}
