// ====================================================================================
// src/clock.rs - 比赛计时投影（由锚点推算剩余时间）
// ====================================================================================
use chrono::{DateTime, Utc};

// 超过一天的流逝时间视为锚点损坏
const MAX_PLAUSIBLE_ELAPSED_SECS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockReading {
    pub display: String,
    pub running: bool,
}

/// Projects the live countdown from a stored anchor.
///
/// A negative or implausibly large elapsed time means the anchor cannot be
/// trusted; `previous` is returned untouched in that case.
pub fn project(
    anchor: DateTime<Utc>,
    seconds_at_anchor: i64,
    now: DateTime<Utc>,
    previous: ClockReading,
) -> ClockReading {
    let elapsed = (now - anchor).num_seconds();
    if elapsed < 0 || elapsed > MAX_PLAUSIBLE_ELAPSED_SECS {
        tracing::warn!(
            anchor = %anchor,
            elapsed,
            "Ignoring corrupt timer anchor"
        );
        return previous;
    }

    let remaining = (seconds_at_anchor - elapsed).max(0);
    ClockReading {
        display: format_clock(remaining),
        running: remaining > 0,
    }
}

pub fn format_clock(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Parses a displayed "m:ss" clock back into seconds.
pub fn parse_clock(display: &str) -> Option<i64> {
    let (minutes, seconds) = display.trim().split_once(':')?;
    let minutes: i64 = minutes.parse().ok()?;
    let seconds: i64 = seconds.parse().ok()?;
    if minutes < 0 || !(0..60).contains(&seconds) {
        return None;
    }
    Some(minutes * 60 + seconds)
}
