//! Market clock: IST trading hours and aligned cycle boundaries.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::Duration;

/// All trading-hour decisions run on exchange local time.
pub const MARKET_TZ: Tz = chrono_tz::Asia::Kolkata;

/// Current exchange-local time.
#[must_use]
pub fn now() -> DateTime<Tz> {
    Utc::now().with_timezone(&MARKET_TZ)
}

/// Today's date combined with an exchange-local time of day.
#[must_use]
pub fn today_at(time: NaiveTime) -> DateTime<Tz> {
    let date = now().date_naive();
    match MARKET_TZ.from_local_datetime(&date.and_time(time)).single() {
        Some(ts) => ts,
        // DST does not exist in IST; fall back to the earliest candidate.
        None => MARKET_TZ
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .unwrap_or_else(|| Utc::now().with_timezone(&MARKET_TZ)),
    }
}

/// Delay until the next boundary aligned to `cadence_secs` (e.g. every 5th
/// second of the wall clock), so tick-driven loops stay time-sliced instead
/// of free-running.
#[must_use]
pub fn next_aligned_delay(now: DateTime<Tz>, cadence_secs: u64) -> Duration {
    let cadence_ms = (cadence_secs.max(1) * 1000) as i64;
    let ms = now.timestamp_millis();
    let next = (ms.div_euclid(cadence_ms) + 1) * cadence_ms;
    Duration::from_millis((next - ms) as u64)
}

/// Sleeps until the next aligned cycle boundary.
pub async fn sleep_until_aligned(cadence_secs: u64) {
    tokio::time::sleep(next_aligned_delay(now(), cadence_secs)).await;
}

/// Sleeps until the given exchange-local instant, returning immediately if it
/// has already passed.
pub async fn sleep_until(target: DateTime<Tz>) {
    let delta = target - now();
    if let Ok(delay) = delta.to_std() {
        tokio::time::sleep(delay).await;
    }
}
