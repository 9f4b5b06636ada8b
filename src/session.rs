// Decoder session tracking
//
// One session per configured measurement point: estimates the unit
// clock offset from the top-of-minute trigger pulses, tracks liveness,
// and accumulates the noise score and battery warnings reported for
// that unit. Static geometry stays in the track model; everything here
// is live state.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::tod::{Tod, TICKS_PER_SEC};
use crate::track::TrackModel;

/// Trigger estimates within this window agree (50 ms).
const SYNC_TOLERANCE_TICKS: i64 = 500;

/// Consecutive agreeing triggers required to come online.
const SYNC_SAMPLES: u32 = 2;

/// No events for longer than this marks an online session stale.
const STALE_TIMEOUT_SECS: i64 = 180;

/// Unit drift beyond this is logged.
const LOG_DRIFT_TICKS: i64 = TICKS_PER_SEC / 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Syncing,
    Online,
    Stale,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Offline => "offline",
            SessionState::Syncing => "syncing",
            SessionState::Online => "online",
            SessionState::Stale => "stale",
        }
    }
}

/// Live state for one decoder unit.
#[derive(Debug)]
pub struct DecoderSession {
    pub mpid: u8,
    pub chan: String,
    pub name: String,
    state: SessionState,
    /// Estimated unit clock minus host clock, valid while online.
    offset: Tod,
    /// Candidate offset while syncing.
    pending: Option<Tod>,
    agree: u32,
    /// Rolling per-minute spurious read score, 0..100.
    pub noise: u32,
    spurious: u32,
    pub last_seen: Option<Tod>,
    /// Refids this unit has flagged low battery. Cleared on reset.
    pub low_battery: BTreeSet<String>,
}

impl DecoderSession {
    pub fn new(mpid: u8, chan: String, name: String) -> Self {
        DecoderSession {
            mpid,
            chan,
            name,
            state: SessionState::Offline,
            offset: Tod::ZERO,
            pending: None,
            agree: 0,
            noise: 0,
            spurious: 0,
            last_seen: None,
            low_battery: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current offset estimate when the session is online.
    pub fn offset(&self) -> Option<Tod> {
        match self.state {
            SessionState::Online => Some(self.offset),
            _ => None,
        }
    }

    /// Record any event from this unit for liveness.
    pub fn seen(&mut self, recv_tod: Tod) {
        self.last_seen = Some(recv_tod);
    }

    /// Update the offset estimate from a top-of-minute trigger.
    ///
    /// The estimate is the unit's trigger tod against the host receive
    /// time snapped to the nearest whole minute. Returns the state
    /// after the update.
    pub fn on_trigger(&mut self, unit_tod: Tod, recv_tod: Tod) -> SessionState {
        self.seen(recv_tod);
        let est = unit_tod - recv_tod.snap_minute();
        if est.abs().ticks() > LOG_DRIFT_TICKS {
            info!(
                "Offset: {}@{} exceeds 0.100",
                self.chan,
                est.rawtime(3)
            );
        }
        match self.state {
            SessionState::Offline | SessionState::Stale => {
                self.pending = Some(est);
                self.agree = 1;
                self.state = SessionState::Syncing;
                debug!("{} syncing, first estimate {}", self.chan, est.rawtime(3));
            }
            SessionState::Syncing => {
                let close = self
                    .pending
                    .map_or(false, |p| (est - p).abs().ticks() <= SYNC_TOLERANCE_TICKS);
                if close {
                    self.agree += 1;
                    self.pending = Some(est);
                    if self.agree >= SYNC_SAMPLES {
                        self.offset = est;
                        self.state = SessionState::Online;
                        info!("{} online, offset {}", self.chan, est.rawtime(3));
                    }
                } else {
                    debug!("{} estimate moved, restarting agreement", self.chan);
                    self.pending = Some(est);
                    self.agree = 1;
                }
            }
            SessionState::Online => {
                if (est - self.offset).abs().ticks() > SYNC_TOLERANCE_TICKS {
                    warn!(
                        "{} desync: estimate {} against {}",
                        self.chan,
                        est.rawtime(3),
                        self.offset.rawtime(3)
                    );
                    self.pending = Some(est);
                    self.agree = 1;
                    self.state = SessionState::Syncing;
                } else {
                    self.offset = est;
                }
            }
        }
        self.state
    }

    /// Apply the current offset to a raw unit timestamp. None while the
    /// session is not online; such passings stay out of the reorder
    /// buffer.
    pub fn correct(&self, raw_tod: Tod) -> Option<Tod> {
        self.offset().map(|off| raw_tod - off)
    }

    /// Count a read from outside the configured cohort.
    pub fn note_spurious(&mut self) {
        self.spurious = self.spurious.saturating_add(1);
    }

    /// Fold the past minute's spurious count into the rolling score.
    pub fn fold_minute(&mut self) {
        let sample = self.spurious.min(100);
        self.noise = ((7 * self.noise + 3 * sample) / 10).min(100);
        self.spurious = 0;
    }

    /// Demote an online session whose unit has gone silent.
    pub fn check_stale(&mut self, now: Tod) -> bool {
        if self.state != SessionState::Online {
            return false;
        }
        let silent = self
            .last_seen
            .map_or(true, |t| (now - t).ticks() > STALE_TIMEOUT_SECS * TICKS_PER_SEC);
        if silent {
            warn!("{} stale, no events for {}s", self.chan, STALE_TIMEOUT_SECS);
            self.state = SessionState::Stale;
        }
        silent
    }

    /// Drop an online session back to syncing, keeping its estimate as
    /// the pending candidate.
    pub fn demote(&mut self) {
        if self.state == SessionState::Online {
            self.pending = Some(self.offset);
            self.agree = 1;
            self.state = SessionState::Syncing;
        }
    }

    /// Push the session offline pending resynchronisation. Battery
    /// warnings survive a unit reset; only a system reset clears them.
    pub fn reset(&mut self) {
        self.state = SessionState::Offline;
        self.pending = None;
        self.agree = 0;
        self.offset = Tod::ZERO;
        self.last_seen = None;
    }
}

/// The mutable per-channel session table.
#[derive(Debug)]
pub struct SessionTable {
    sessions: HashMap<u8, DecoderSession>,
    master: Option<u8>,
}

impl SessionTable {
    /// One session per configured track point; `sync` names the
    /// synchronisation master channel if any.
    pub fn new(track: &TrackModel, sync: Option<&str>) -> Self {
        let mut sessions = HashMap::new();
        for p in track.points() {
            sessions.insert(
                p.mpid,
                DecoderSession::new(p.mpid, p.chan.clone(), p.name.clone()),
            );
        }
        let master = sync.and_then(|c| track.mpid(c));
        if let Some(mid) = master {
            info!("Sync master on mpid {}", mid);
        } else {
            warn!("Sync master not configured");
        }
        SessionTable { sessions, master }
    }

    pub fn get(&self, mpid: u8) -> Option<&DecoderSession> {
        self.sessions.get(&mpid)
    }

    pub fn get_mut(&mut self, mpid: u8) -> Option<&mut DecoderSession> {
        self.sessions.get_mut(&mpid)
    }

    pub fn master(&self) -> Option<u8> {
        self.master
    }

    pub fn is_master(&self, mpid: u8) -> bool {
        self.master == Some(mpid)
    }

    /// Sessions in mpid order, for status assembly.
    pub fn ordered(&self) -> Vec<&DecoderSession> {
        let mut v: Vec<&DecoderSession> = self.sessions.values().collect();
        v.sort_by_key(|s| s.mpid);
        v
    }

    /// Minute housekeeping: fold noise scores, demote silent sessions,
    /// and apply the master-stale policy. Returns true while the master
    /// is configured but not online.
    pub fn minute_tick(&mut self, now: Tod) -> bool {
        for s in self.sessions.values_mut() {
            s.fold_minute();
            s.check_stale(now);
        }
        let master_down = match self.master {
            Some(mid) => self
                .sessions
                .get(&mid)
                .map_or(false, |m| m.state() != SessionState::Online),
            None => false,
        };
        if master_down {
            // hold every unit at syncing until the master recovers
            for s in self.sessions.values_mut() {
                s.demote();
            }
        }
        master_down
    }

    /// Push every session offline, keeping battery sets.
    pub fn all_offline(&mut self) {
        for s in self.sessions.values_mut() {
            s.reset();
        }
    }

    /// Clear accumulated battery warnings (system reset only).
    pub fn clear_batteries(&mut self) {
        for s in self.sessions.values_mut() {
            s.low_battery.clear();
        }
    }

    /// All battery-flagged refids across units, deduplicated.
    pub fn battery_warnings(&self) -> Vec<String> {
        let mut set = BTreeSet::new();
        for s in self.sessions.values() {
            set.extend(s.low_battery.iter().cloned());
        }
        set.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> DecoderSession {
        DecoderSession::new(1, "C1".to_string(), "Finish".to_string())
    }

    fn t(s: &str) -> Tod {
        Tod::parse(s).unwrap()
    }

    #[test]
    fn test_two_agreeing_triggers_come_online() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Offline);
        // unit runs 20 ms fast
        s.on_trigger(t("12:00:00.020"), t("12:00:00.140"));
        assert_eq!(s.state(), SessionState::Syncing);
        assert!(s.correct(t("12:00:05")).is_none());
        s.on_trigger(t("12:01:00.021"), t("12:01:00.150"));
        assert_eq!(s.state(), SessionState::Online);
        let corrected = s.correct(t("12:01:30.021")).unwrap();
        assert_eq!(corrected, t("12:01:30.000"));
    }

    #[test]
    fn test_disagreeing_triggers_stay_syncing() {
        let mut s = session();
        s.on_trigger(t("12:00:00.020"), t("12:00:00.100"));
        // second estimate 80 ms away restarts agreement
        s.on_trigger(t("12:01:00.100"), t("12:01:00.200"));
        assert_eq!(s.state(), SessionState::Syncing);
        // two more consistent samples recover
        s.on_trigger(t("12:02:00.101"), t("12:02:00.200"));
        assert_eq!(s.state(), SessionState::Online);
    }

    #[test]
    fn test_desync_drops_to_syncing() {
        let mut s = session();
        s.on_trigger(t("12:00:00.000"), t("12:00:00.100"));
        s.on_trigger(t("12:01:00.000"), t("12:01:00.100"));
        assert_eq!(s.state(), SessionState::Online);
        s.on_trigger(t("12:02:00.500"), t("12:02:00.100"));
        assert_eq!(s.state(), SessionState::Syncing);
        assert!(s.correct(t("12:02:10")).is_none());
    }

    #[test]
    fn test_stale_then_trigger_resyncs() {
        let mut s = session();
        s.on_trigger(t("12:00:00.000"), t("12:00:00.100"));
        s.on_trigger(t("12:01:00.000"), t("12:01:00.100"));
        assert!(s.check_stale(t("12:05:00")));
        assert_eq!(s.state(), SessionState::Stale);
        s.on_trigger(t("12:05:00.000"), t("12:05:00.100"));
        assert_eq!(s.state(), SessionState::Syncing);
    }

    #[test]
    fn test_not_stale_while_active() {
        let mut s = session();
        s.on_trigger(t("12:00:00.000"), t("12:00:00.100"));
        s.on_trigger(t("12:01:00.000"), t("12:01:00.100"));
        s.seen(t("12:02:30"));
        assert!(!s.check_stale(t("12:04:00")));
        assert_eq!(s.state(), SessionState::Online);
    }

    #[test]
    fn test_noise_score_decays() {
        let mut s = session();
        for _ in 0..250 {
            s.note_spurious();
        }
        s.fold_minute();
        assert_eq!(s.noise, 30);
        s.fold_minute();
        s.fold_minute();
        assert!(s.noise < 30);
        // a quiet hour settles back to zero
        for _ in 0..60 {
            s.fold_minute();
        }
        assert_eq!(s.noise, 0);
    }

    #[test]
    fn test_reset_keeps_battery_set() {
        let mut s = session();
        s.low_battery.insert("100232".to_string());
        s.on_trigger(t("12:00:00.000"), t("12:00:00.100"));
        s.reset();
        assert_eq!(s.state(), SessionState::Offline);
        assert!(s.low_battery.contains("100232"));
    }

    #[test]
    fn test_negative_offset_corrects_forward() {
        let mut s = session();
        // unit runs 50 ms slow
        s.on_trigger(t("11:59:59.950"), t("12:00:00.100"));
        s.on_trigger(t("12:00:59.950"), t("12:01:00.100"));
        let corrected = s.correct(t("12:01:10.000")).unwrap();
        assert_eq!(corrected, t("12:01:10.050"));
    }
}
