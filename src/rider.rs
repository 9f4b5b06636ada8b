// Rider state tracking
//
// One history per transponder covering the trailing couple of laps.
// Each released passing is classified against the rider's previous
// accepted passing: the next expected sector around the loop, covered
// at legal speed, keeps the rider in-run and defines splits; anything
// else isolates the passing and restarts the run reference. The start
// gate may stand in for a missing sector start when the gate-sector
// speed fits.

use std::collections::HashMap;

use tracing::debug;

use crate::tod::{Tod, TICKS_PER_SEC};
use crate::track::{SplitKind, TrackModel, SPLIT_KINDS};

/// Gate references older than this no longer define elapsed times.
const MAX_ELAP_SECS: i64 = 600;

/// What a raw record is about, decided at intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subject {
    /// A rider's transponder.
    Rider(String),
    /// A pacing motorcycle's transponder.
    Moto(String),
    /// The start gate system.
    Gate,
    /// A user-inserted marker.
    Marker,
}

impl Subject {
    /// The refid this subject is tracked and published under. System
    /// subjects collapse onto a collective id.
    pub fn refid(&self) -> &str {
        match self {
            Subject::Rider(id) => id,
            Subject::Moto(_) => "moto",
            Subject::Gate => "gate",
            Subject::Marker => "marker",
        }
    }
}

/// Trailing history for one transponder.
#[derive(Debug, Default)]
struct RiderHistory {
    last_mpid: Option<u8>,
    last_tod: Option<Tod>,
    /// Most recent accepted passing per measurement point.
    last_at: HashMap<u8, Tod>,
    in_run: bool,
    /// Gate time or first accepted passing of the current run.
    run_start: Option<Tod>,
    /// Gate time last applied to this rider, via the gate override.
    last_gate: Option<Tod>,
}

/// Result of classifying one passing.
#[derive(Debug, Default)]
pub struct Classification {
    pub in_run: bool,
    /// Defined splits, in emission order.
    pub splits: Vec<(SplitKind, Tod)>,
    pub elap: Option<Tod>,
}

#[derive(Debug, Default)]
pub struct RiderTracker {
    riders: HashMap<String, RiderHistory>,
    /// Most recent accepted gate trigger, delay-corrected.
    gate: Option<Tod>,
}

impl RiderTracker {
    pub fn new() -> Self {
        RiderTracker::default()
    }

    pub fn gate(&self) -> Option<Tod> {
        self.gate
    }

    /// Record an accepted start gate trigger.
    pub fn set_gate(&mut self, tod: Tod) {
        self.gate = Some(tod);
    }

    /// Elapsed time against the gate, when the gate is set, earlier,
    /// and younger than the elapsed cap. Used for markers.
    pub fn gate_elapsed(&self, tod: Tod) -> Option<Tod> {
        self.gate.and_then(|g| {
            let et = tod - g;
            if !et.is_negative() && et.ticks() < MAX_ELAP_SECS * TICKS_PER_SEC {
                Some(et)
            } else {
                None
            }
        })
    }

    /// Classify a released passing and update the rider's history.
    ///
    /// Out-of-order events never touch history: the emission sequence
    /// has already moved past their tod, so they are reported isolated
    /// rather than invalidating splits already published.
    pub fn classify(
        &mut self,
        track: &TrackModel,
        refid: &str,
        mpid: u8,
        tod: Tod,
        out_of_order: bool,
    ) -> Classification {
        if out_of_order {
            debug!("Isolated out-of-order passing {}@{}", refid, tod.rawtime(2));
            return Classification::default();
        }
        let point = match track.point(mpid) {
            Some(p) => p,
            None => return Classification::default(),
        };
        let hist = self.riders.entry(refid.to_string()).or_default();

        let mut matched = false;

        // gate override: the gate trigger may stand in for a missing or
        // contradicting sector start into the point after the gate loop
        if let (Some(gs), Some(g)) = (track.gate(), self.gate) {
            if gs.dst == mpid {
                let consider = match (hist.last_mpid, hist.last_tod) {
                    (Some(lc), Some(lt)) if lc == gs.src => g > lt,
                    _ => true,
                };
                if consider {
                    let ge = tod - g;
                    if ge >= gs.min && ge <= gs.max {
                        debug!("Gate start {}@{}", refid, g.rawtime(2));
                        hist.last_mpid = Some(gs.src);
                        hist.last_tod = Some(g);
                        hist.last_at.insert(gs.src, g);
                        hist.run_start = Some(g);
                        hist.last_gate = Some(g);
                        matched = true;
                    }
                }
            }
        }

        // normal case: the next expected sector around the loop,
        // covered at legal speed; a passing from anywhere else, a
        // skipped sensor included, isolates
        if !matched {
            if let (Some(lc), Some(lt)) = (hist.last_mpid, hist.last_tod) {
                if lc == point.prev {
                    let d = tod - lt;
                    if d >= point.sector_min && d <= point.sector_max {
                        matched = true;
                    }
                }
            }
        }

        let mut cls = Classification {
            in_run: matched,
            ..Default::default()
        };

        if matched {
            hist.in_run = true;
            for kind in SPLIT_KINDS {
                if let Some(def) = point.splits.get(&kind) {
                    if let Some(&src_tod) = hist.last_at.get(&def.src) {
                        let d = tod - src_tod;
                        if d >= def.min && d <= def.max {
                            cls.splits.push((kind, d));
                        }
                    }
                }
            }
            let base = match (hist.run_start, hist.last_gate) {
                (Some(rs), Some(g)) => Some(rs.max(g)),
                (Some(rs), None) => Some(rs),
                (None, g) => g,
            };
            cls.elap = base.and_then(|b| {
                let et = tod - b;
                if !et.is_negative() && et.ticks() < MAX_ELAP_SECS * TICKS_PER_SEC {
                    Some(et)
                } else {
                    None
                }
            });
        } else {
            // fresh or isolated: restart the run reference here
            debug!("Isolated {}@{} mpid {}", refid, tod.rawtime(2), mpid);
            hist.in_run = false;
            hist.run_start = Some(tod);
        }

        hist.last_mpid = Some(mpid);
        hist.last_tod = Some(tod);
        hist.last_at.insert(mpid, tod);
        cls
    }

    /// Age out stale history.
    pub fn prune(&mut self, track: &TrackModel, now: Tod) {
        let window = track.fresh_window();
        self.riders.retain(|_, h| {
            h.last_at.retain(|_, &mut t| now - t <= window);
            h.last_tod.map_or(false, |t| now - t <= window)
        });
    }

    /// Forget everything, including the gate.
    pub fn clear(&mut self) {
        self.riders.clear();
        self.gate = None;
    }

    pub fn rider_count(&self) -> usize {
        self.riders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MpConfig};
    use crate::track::TrackModel;

    fn t(s: &str) -> Tod {
        Tod::parse(s).unwrap()
    }

    /// Single finish-line point, the minimal full-lap setup.
    fn c1_track() -> TrackModel {
        let mut cfg = Config::default();
        cfg.mps.insert(
            "C1".to_string(),
            MpConfig {
                ip: Some("10.0.0.1".to_string()),
                offset: Some(0.0),
                ..Default::default()
            },
        );
        TrackModel::new(&cfg).unwrap()
    }

    /// C1 finish and C4 at 50 m, with a 200 m split back to C4.
    fn c1_c4_track(gatesrc: Option<&str>) -> TrackModel {
        let mut cfg = Config::default();
        cfg.gatesrc = gatesrc.map(|s| s.to_string());
        cfg.mps.insert(
            "C1".to_string(),
            MpConfig {
                ip: Some("10.0.0.1".to_string()),
                offset: Some(0.0),
                t200: Some("C4".to_string()),
                ..Default::default()
            },
        );
        cfg.mps.insert(
            "C4".to_string(),
            MpConfig {
                ip: Some("10.0.0.4".to_string()),
                offset: Some(50.0),
                ..Default::default()
            },
        );
        TrackModel::new(&cfg).unwrap()
    }

    #[test]
    fn test_full_lap_in_run_with_lap_split() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();

        let first = rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        assert!(!first.in_run);
        assert!(first.splits.is_empty());
        assert!(first.elap.is_none());

        // 250 m in 18 s is 50 km/h
        let second = rt.classify(&track, "100000", c1, t("12:00:18.000"), false);
        assert!(second.in_run);
        let lap = second
            .splits
            .iter()
            .find(|(k, _)| *k == SplitKind::Lap)
            .map(|(_, d)| *d)
            .unwrap();
        assert_eq!(lap.as_secs_str(2), "18.00");
        assert_eq!(second.elap.unwrap().elapsed(2), "18.00");
    }

    #[test]
    fn test_slow_lap_isolates() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // 250 m in 30 s is 30 km/h, below minspeed
        let second = rt.classify(&track, "100000", c1, t("12:00:30.000"), false);
        assert!(!second.in_run);
        assert!(second.splits.is_empty());
        assert!(second.elap.is_none());
    }

    #[test]
    fn test_stale_history_is_fresh_entry() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // over two laps at minspeed have passed; not even a slow lap
        let second = rt.classify(&track, "100000", c1, t("12:01:00.000"), false);
        assert!(!second.in_run);
    }

    #[test]
    fn test_sector_between_points() {
        let track = c1_c4_track(None);
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        let c4 = track.mpid("C4").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // C4 is the next expected point after C1; 50 m in 3.6 s is
        // 50 km/h
        let second = rt.classify(&track, "100000", c4, t("12:00:03.600"), false);
        assert!(second.in_run);
        // no split ancestors configured at C4
        assert!(second.splits.is_empty());
        assert_eq!(second.elap.unwrap().elapsed(2), "3.60");
    }

    #[test]
    fn test_skipped_sensor_isolates() {
        // C9 sits between C1 and C4 around the loop
        let mut cfg = Config::default();
        for (chan, off) in [("C1", 0.0), ("C9", 25.0), ("C4", 50.0)] {
            cfg.mps.insert(
                chan.to_string(),
                MpConfig {
                    ip: Some("10.0.0.9".to_string()),
                    offset: Some(off),
                    ..Default::default()
                },
            );
        }
        let track = TrackModel::new(&cfg).unwrap();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        let c4 = track.mpid("C4").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // 50 m in 3.6 s is legal speed, but C4 is not the next
        // expected point after C1, so the missed C9 read isolates
        let cls = rt.classify(&track, "100000", c4, t("12:00:03.600"), false);
        assert!(!cls.in_run);
        assert!(cls.splits.is_empty());
        assert!(cls.elap.is_none());
    }

    #[test]
    fn test_boundary_speed_inclusive() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // 250 m in exactly 10 s is maxspeed on the nose
        let cls = rt.classify(&track, "100000", c1, t("12:00:10.000"), false);
        assert!(cls.in_run);
        let lap = cls
            .splits
            .iter()
            .find(|(k, _)| *k == SplitKind::Lap)
            .map(|(_, d)| *d)
            .unwrap();
        assert_eq!(lap.as_secs_str(2), "10.00");
    }

    #[test]
    fn test_200_split_from_ancestor() {
        let track = c1_c4_track(None);
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        let c4 = track.mpid("C4").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        rt.classify(&track, "100000", c4, t("12:00:03.600"), false);
        // C4 -> C1 is the closing 200 m arc; 14.4 s is 50 km/h
        let third = rt.classify(&track, "100000", c1, t("12:00:18.000"), false);
        assert!(third.in_run);
        let t200 = third
            .splits
            .iter()
            .find(|(k, _)| *k == SplitKind::T200)
            .map(|(_, d)| *d)
            .unwrap();
        assert_eq!(t200.as_secs_str(2), "14.40");
        // the lap split closes on C1 itself
        let lap = third
            .splits
            .iter()
            .find(|(k, _)| *k == SplitKind::Lap)
            .map(|(_, d)| *d)
            .unwrap();
        assert_eq!(lap.as_secs_str(2), "18.00");
    }

    #[test]
    fn test_gate_start_defines_elapsed_not_lap() {
        // gate loop on C4; the next point around is C1
        let track = c1_c4_track(Some("C4"));
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.set_gate(t("12:10:00.000"));
        // 200 m from the gate in 40 s is 18 km/h, inside [9, 22.5]
        let cls = rt.classify(&track, "100000", c1, t("12:10:40.000"), false);
        assert!(cls.in_run);
        assert_eq!(cls.elap.unwrap().elapsed(2), "40.00");
        assert!(cls
            .splits
            .iter()
            .all(|(k, _)| *k != SplitKind::Lap));
    }

    #[test]
    fn test_gate_override_beats_stale_history() {
        let track = c1_c4_track(Some("C4"));
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        let c4 = track.mpid("C4").unwrap();
        // rider rolls slowly over the gate loop, then starts
        rt.classify(&track, "100000", c4, t("12:09:55.000"), false);
        rt.set_gate(t("12:10:00.000"));
        let cls = rt.classify(&track, "100000", c1, t("12:10:40.000"), false);
        assert!(cls.in_run);
        assert_eq!(cls.elap.unwrap().elapsed(2), "40.00");
    }

    #[test]
    fn test_gate_speed_window_rejects() {
        let track = c1_c4_track(Some("C4"));
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.set_gate(t("12:10:00.000"));
        // 200 m in 10 s is 72 km/h, far beyond maxgate
        let cls = rt.classify(&track, "100000", c1, t("12:10:10.000"), false);
        assert!(!cls.in_run);
    }

    #[test]
    fn test_out_of_order_leaves_history_alone() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        // a late-late event ten seconds in the past
        let late = rt.classify(&track, "100000", c1, t("11:59:50.000"), true);
        assert!(!late.in_run);
        // the following lap still matches against 12:00:00
        let lap = rt.classify(&track, "100000", c1, t("12:00:18.000"), false);
        assert!(lap.in_run);
        assert_eq!(lap.elap.unwrap().elapsed(2), "18.00");
    }

    #[test]
    fn test_isolated_then_recovers() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        rt.classify(&track, "100000", c1, t("12:00:30.000"), false); // slow
        let next = rt.classify(&track, "100000", c1, t("12:00:48.000"), false);
        assert!(next.in_run);
        // elapsed restarts from the isolated passing
        assert_eq!(next.elap.unwrap().elapsed(2), "18.00");
    }

    #[test]
    fn test_prune_ages_out() {
        let track = c1_track();
        let mut rt = RiderTracker::new();
        let c1 = track.mpid("C1").unwrap();
        rt.classify(&track, "100000", c1, t("12:00:00.000"), false);
        assert_eq!(rt.rider_count(), 1);
        rt.prune(&track, t("12:05:00.000"));
        assert_eq!(rt.rider_count(), 0);
    }

    #[test]
    fn test_gate_elapsed_caps_at_ten_minutes() {
        let mut rt = RiderTracker::new();
        rt.set_gate(t("12:00:00.000"));
        assert!(rt.gate_elapsed(t("12:05:00")).is_some());
        assert!(rt.gate_elapsed(t("12:10:00.001")).is_none());
        assert!(rt.gate_elapsed(t("11:59:00")).is_none());
    }
}
