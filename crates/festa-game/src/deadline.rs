use chrono::{DateTime, Datelike, Duration, Utc};

use crate::error::{GameError, Result};

/// Latest year a deadline column can hold; `format_ts` output past it no
/// longer parses back as RFC 3339.
const LAST_STORABLE_YEAR: i32 = 9999;

/// `at + span`, or a validation error naming `what` when the span does not
/// fit a `Duration` or the result cannot be stored.
pub(crate) fn after(
    at: DateTime<Utc>,
    span: Option<Duration>,
    what: &str,
) -> Result<DateTime<Utc>> {
    span.and_then(|span| at.checked_add_signed(span))
        .filter(|deadline| deadline.year() <= LAST_STORABLE_YEAR)
        .ok_or_else(|| GameError::Validation(format!("{what} is too long")))
}
