// Time of day values
//
// Fixed-precision wall-clock arithmetic at 10 000 ticks per second
// (0.1 ms). All arithmetic is integer ticks; floats only appear at the
// parse/format boundary.

use std::fmt;
use std::ops::{Add, Sub};

/// Resolution of a [`Tod`]: ticks per second.
pub const TICKS_PER_SEC: i64 = 10_000;

const TICKS_PER_MIN: i64 = 60 * TICKS_PER_SEC;

/// A time of day, or a signed duration between two times of day.
///
/// Wall-clock values are non-negative offsets from local midnight;
/// subtraction yields a delta that may be negative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Tod {
    ticks: i64,
}

impl Tod {
    pub const ZERO: Tod = Tod { ticks: 0 };

    pub fn from_ticks(ticks: i64) -> Tod {
        Tod { ticks }
    }

    /// Build from (possibly fractional) seconds, rounding to tick.
    pub fn from_secs(secs: f64) -> Tod {
        Tod {
            ticks: (secs * TICKS_PER_SEC as f64).round() as i64,
        }
    }

    pub fn ticks(&self) -> i64 {
        self.ticks
    }

    pub fn as_secs(&self) -> f64 {
        self.ticks as f64 / TICKS_PER_SEC as f64
    }

    pub fn is_negative(&self) -> bool {
        self.ticks < 0
    }

    pub fn abs(&self) -> Tod {
        Tod {
            ticks: self.ticks.abs(),
        }
    }

    /// Nearest whole-minute boundary.
    pub fn snap_minute(&self) -> Tod {
        let half = TICKS_PER_MIN / 2;
        Tod {
            ticks: ((self.ticks + half).div_euclid(TICKS_PER_MIN)) * TICKS_PER_MIN,
        }
    }

    /// Most recent whole-minute boundary at or before this time.
    pub fn floor_minute(&self) -> Tod {
        Tod {
            ticks: self.ticks.div_euclid(TICKS_PER_MIN) * TICKS_PER_MIN,
        }
    }

    /// Whole minutes since midnight, for minute-roll detection.
    pub fn minute(&self) -> i64 {
        self.ticks.div_euclid(TICKS_PER_MIN)
    }

    /// Parse a time of day string.
    ///
    /// Accepts `HH:MM:SS.fff`, `M:SS.fff`, and bare seconds. Fields are
    /// separated by `:` and fill from the least significant end, so
    /// `1:23.4` is one minute 23.4 s. Fractional digits are taken
    /// verbatim up to four places and zero-padded beyond. Returns None
    /// on malformed input. The sentinels `now`/`0` are resolved by the
    /// caller, not here.
    pub fn parse(text: &str) -> Option<Tod> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let fields: Vec<&str> = text.split(':').collect();
        if fields.len() > 3 {
            return None;
        }

        // seconds field may carry a fraction
        let last = fields[fields.len() - 1];
        let (sec_str, frac_ticks) = match last.split_once('.') {
            Some((s, f)) => {
                if f.is_empty() || !f.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                let mut padded = String::from(f);
                padded.truncate(4);
                while padded.len() < 4 {
                    padded.push('0');
                }
                (s, padded.parse::<i64>().ok()?)
            }
            None => (last, 0),
        };
        if sec_str.is_empty() || !sec_str.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let secs = sec_str.parse::<i64>().ok()?;

        let mut whole = secs;
        if fields.len() >= 2 {
            let m = fields[fields.len() - 2];
            if m.is_empty() || !m.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            whole += 60 * m.parse::<i64>().ok()?;
        }
        if fields.len() == 3 {
            let h = fields[0];
            if h.is_empty() || !h.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            whole += 3600 * h.parse::<i64>().ok()?;
        }
        Some(Tod {
            ticks: whole * TICKS_PER_SEC + frac_ticks,
        })
    }

    fn frac_str(frac: i64, places: u8) -> String {
        match places {
            0 => String::new(),
            1 => format!(".{:01}", frac / 1000),
            2 => format!(".{:02}", frac / 100),
            3 => format!(".{:03}", frac / 10),
            _ => format!(".{:04}", frac),
        }
    }

    /// Zero-padded wall-clock format `HH:MM:SS.ff`, truncating toward
    /// zero. `places` 2 is `.dc` (hundredths), 3 is `.dcm` (ms).
    pub fn rawtime(&self, places: u8) -> String {
        let sign = if self.ticks < 0 { "-" } else { "" };
        let t = self.ticks.abs();
        let secs = t / TICKS_PER_SEC;
        let frac = t % TICKS_PER_SEC;
        format!(
            "{}{:02}:{:02}:{:02}{}",
            sign,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            Self::frac_str(frac, places),
        )
    }

    /// Elapsed format: leading zero components larger than a minute are
    /// suppressed when the magnitude allows (`2:10.51`, `18.00`).
    pub fn elapsed(&self, places: u8) -> String {
        let sign = if self.ticks < 0 { "-" } else { "" };
        let t = self.ticks.abs();
        let secs = t / TICKS_PER_SEC;
        let frac = Self::frac_str(t % TICKS_PER_SEC, places);
        let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
        if h > 0 {
            format!("{}{}:{:02}:{:02}{}", sign, h, m, s, frac)
        } else if m > 0 {
            format!("{}{}:{:02}{}", sign, m, s, frac)
        } else {
            format!("{}{}{}", sign, s, frac)
        }
    }

    /// Plain decimal seconds, truncating toward zero.
    pub fn as_secs_str(&self, places: u8) -> String {
        let sign = if self.ticks < 0 { "-" } else { "" };
        let t = self.ticks.abs();
        format!(
            "{}{}{}",
            sign,
            t / TICKS_PER_SEC,
            Self::frac_str(t % TICKS_PER_SEC, places)
        )
    }

    /// Truncate to millisecond resolution.
    pub fn truncate_ms(&self) -> Tod {
        Tod {
            ticks: (self.ticks / 10) * 10,
        }
    }
}

impl Add for Tod {
    type Output = Tod;
    fn add(self, rhs: Tod) -> Tod {
        Tod {
            ticks: self.ticks + rhs.ticks,
        }
    }
}

impl Sub for Tod {
    type Output = Tod;
    fn sub(self, rhs: Tod) -> Tod {
        Tod {
            ticks: self.ticks - rhs.ticks,
        }
    }
}

impl fmt::Display for Tod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rawtime(2))
    }
}

/// Convert a distance (m) at a rate (km/h) to a duration.
pub fn dist_to_time(dist_m: f64, rate_kmh: f64) -> Tod {
    Tod::from_secs(dist_m / (rate_kmh / 3.6))
}

/// Sector speed in km/h for a length (m) covered in a duration.
pub fn speed_kmh(length_m: f64, duration: Tod) -> f64 {
    let secs = duration.as_secs();
    if secs <= 0.0 {
        return f64::INFINITY;
    }
    length_m / secs * 3.6
}
