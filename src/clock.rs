use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The largest representable expiration, in nanoseconds since the Unix
/// epoch (2262-01-01). Instants past this point, and instants whose
/// nanosecond count does not fit in an `i64`, are clamped here.
pub const MAX_EXPIRATION_NS: i64 = 9_214_646_400_000_000_000;

pub(crate) const MAX_EXPIRATION_MS: i64 = MAX_EXPIRATION_NS / NANOS_PER_MILLI;

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Round `x` toward zero to a multiple of `m`. Returns `x` unchanged
/// when `m <= 0`.
#[inline(always)]
pub(crate) fn truncate(x: i64, m: i64) -> i64 {
    if m <= 0 {
        return x;
    }
    x - x % m
}

#[inline(always)]
pub(crate) fn duration_to_ms(d: Duration) -> i64 {
    (d.as_millis() as u64).min(MAX_EXPIRATION_MS as u64) as i64
}

/// Unix-millisecond count for `t`. Pre-epoch and out-of-range instants
/// clamp to [`MAX_EXPIRATION_MS`].
#[inline]
pub(crate) fn time_to_ms(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => {
            let ns = d.as_nanos();
            if ns > MAX_EXPIRATION_NS as u128 {
                MAX_EXPIRATION_MS
            } else {
                ns as i64 / NANOS_PER_MILLI
            }
        }
        Err(_) => MAX_EXPIRATION_MS,
    }
}

#[inline]
pub(crate) fn ms_to_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

#[inline(always)]
pub(crate) fn now_ms() -> i64 {
    time_to_ms(SystemTime::now())
}

/// Fixed offset from UTC, in seconds east.
///
/// Consulted only by [`Schedule`](crate::Schedule) implementations to
/// interpret the reference instant they are handed; the wheel's own
/// clock is plain Unix-millisecond counts and ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UtcOffset {
    seconds: i32,
}

impl UtcOffset {
    pub const UTC: Self = Self { seconds: 0 };

    pub const fn from_secs(seconds: i32) -> Self {
        Self { seconds }
    }

    pub const fn from_hours(hours: i8) -> Self {
        Self {
            seconds: hours as i32 * 3600,
        }
    }

    pub const fn as_secs(self) -> i32 {
        self.seconds
    }
}

/// An instant paired with the wheel's configured zone offset; the value
/// handed to [`Schedule::next`](crate::Schedule::next).
#[derive(Debug, Clone, Copy)]
pub struct ZonedTime {
    instant: SystemTime,
    offset: UtcOffset,
}

impl ZonedTime {
    pub(crate) fn new(instant: SystemTime, offset: UtcOffset) -> Self {
        Self { instant, offset }
    }

    pub(crate) fn now(offset: UtcOffset) -> Self {
        Self::new(SystemTime::now(), offset)
    }

    pub fn instant(self) -> SystemTime {
        self.instant
    }

    pub fn offset(self) -> UtcOffset {
        self.offset
    }

    pub fn unix_millis(self) -> i64 {
        time_to_ms(self.instant)
    }
}
