// Host clock capability
//
// All wall-clock reads go through this trait so tests can replay
// fixtures against a virtual clock.

use chrono::{Local, Offset, Timelike};

use crate::tod::{Tod, TICKS_PER_SEC};

pub trait Clock: Send + Sync {
    /// Current local time of day.
    fn now(&self) -> Tod;

    /// Current local date, `YYYY-MM-DD`.
    fn date(&self) -> String;

    /// Local offset from UTC in whole seconds (host_wall - UTC).
    fn utc_offset_secs(&self) -> i32;
}

/// The host system clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Tod {
        let now = Local::now();
        let secs = now.num_seconds_from_midnight() as i64;
        let sub = (now.nanosecond() as i64 / 100_000).min(TICKS_PER_SEC - 1);
        Tod::from_ticks(secs * TICKS_PER_SEC + sub)
    }

    fn date(&self) -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    fn utc_offset_secs(&self) -> i32 {
        Local::now().offset().fix().local_minus_utc()
    }
}

/// A settable clock for deterministic tests.
#[cfg(test)]
pub struct VirtualClock {
    ticks: std::sync::atomic::AtomicI64,
    date: std::sync::Mutex<String>,
}

#[cfg(test)]
impl VirtualClock {
    pub fn at(t: &str) -> Self {
        VirtualClock {
            ticks: std::sync::atomic::AtomicI64::new(Tod::parse(t).unwrap().ticks()),
            date: std::sync::Mutex::new("2026-01-10".to_string()),
        }
    }

    pub fn set(&self, t: &str) {
        self.ticks.store(
            Tod::parse(t).unwrap().ticks(),
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    pub fn advance_secs(&self, s: f64) {
        self.ticks.fetch_add(
            Tod::from_secs(s).ticks(),
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    pub fn set_date(&self, d: &str) {
        *self.date.lock().unwrap() = d.to_string();
    }
}

#[cfg(test)]
impl Clock for VirtualClock {
    fn now(&self) -> Tod {
        Tod::from_ticks(self.ticks.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn date(&self) -> String {
        self.date.lock().unwrap().clone()
    }

    fn utc_offset_secs(&self) -> i32 {
        36000
    }
}

#[cfg(test)]
impl Clock for std::sync::Arc<VirtualClock> {
    fn now(&self) -> Tod {
        self.as_ref().now()
    }

    fn date(&self) -> String {
        self.as_ref().date()
    }

    fn utc_offset_secs(&self) -> i32 {
        self.as_ref().utc_offset_secs()
    }
}
