//! Membership expiry arithmetic.

use crate::model::ExpireType;
use chrono::{DateTime, Months, TimeZone, Utc};

/// Expiry timestamp for a membership approved at `now`.
///
/// Extends from `prior` when it is still in the future, otherwise from `now`,
/// by the calendar months of `expire_type`. Permanent memberships get 0.
/// Month arithmetic clamps to the end of shorter months (Jan 31 + 1 month is
/// the last day of February).
pub fn expire_time(prior: i64, expire_type: ExpireType, now: DateTime<Utc>) -> i64 {
    let Some(months) = expire_type.months() else {
        return 0;
    };

    let start = if prior > now.timestamp() {
        Utc.timestamp_opt(prior, 0).single().unwrap_or(now)
    } else {
        now
    };

    start
        .checked_add_months(Months::new(months))
        .map(|t| t.timestamp())
        .unwrap_or(i64::MAX)
}

/// True if a non-permanent membership expiring at `expire_time` may renew at
/// `now` under a renewal window of `window_secs`. Expired memberships qualify.
pub fn in_renewal_window(expire_time: i64, now: i64, window_secs: i64) -> bool {
    expire_time != 0 && expire_time - now <= window_secs
}

/// True if a non-permanent membership has lapsed.
pub fn is_expired(expire_time: i64, now: i64) -> bool {
    expire_time != 0 && expire_time < now
}
