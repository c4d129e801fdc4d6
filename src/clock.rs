use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::time::{Duration, Instant};

/// Wall-clock plus monotonic time source.
///
/// The monotonic reading is a duration since an arbitrary epoch fixed at
/// process start; it never jumps with the wall clock. All usage accounting
/// advances on the monotonic reading, while day attribution uses the wall
/// clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
    fn monotonic(&self) -> Duration;
}

/// Production clock backed by the OS.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Resolve a local date + time-of-day in `tz`, skipping forward over DST gaps.
fn resolve_local(tz: Tz, date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let mut candidate = date.and_time(time);
    // A nonexistent local time (spring-forward gap) resolves to the first
    // valid instant after the gap; an ambiguous one takes the earlier offset.
    for _ in 0..240 {
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            chrono::LocalResult::None => {
                candidate = candidate + chrono::Duration::minutes(1);
            }
        }
    }
    // Unreachable for real timezones; fall back to interpreting as UTC.
    Utc.from_utc_datetime(&date.and_time(time))
}

/// The half-open UsageDay window `[start, end)` containing `now`, anchored
/// at `reset_time` local to `tz`.
pub fn day_window(now: DateTime<Utc>, reset_time: NaiveTime, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let local_date = now.with_timezone(&tz).date_naive();
    let today_reset = resolve_local(tz, local_date, reset_time);

    if now < today_reset {
        let prev = local_date
            .checked_sub_days(Days::new(1))
            .expect("date arithmetic underflow");
        (resolve_local(tz, prev, reset_time), today_reset)
    } else {
        let next = local_date
            .checked_add_days(Days::new(1))
            .expect("date arithmetic overflow");
        (today_reset, resolve_local(tz, next, reset_time))
    }
}

/// The next reset instant strictly after `now`.
pub fn next_reset(now: DateTime<Utc>, reset_time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    day_window(now, reset_time, tz).1
}

#[cfg(test)]
pub struct TestClock {
    inner: std::sync::Mutex<(DateTime<Utc>, Duration)>,
}

#[cfg(test)]
impl TestClock {
    pub fn new(wall: DateTime<Utc>) -> Self {
        Self {
            inner: std::sync::Mutex::new((wall, Duration::ZERO)),
        }
    }

    /// Advance wall and monotonic time together.
    pub fn advance(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.0 += chrono::Duration::from_std(by).unwrap();
        inner.1 += by;
    }

    /// Jump the wall clock without touching the monotonic reading.
    pub fn set_wall(&self, wall: DateTime<Utc>) {
        self.inner.lock().unwrap().0 = wall;
    }
}

#[cfg(test)]
impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.inner.lock().unwrap().0
    }

    fn monotonic(&self) -> Duration {
        self.inner.lock().unwrap().1
    }
}
