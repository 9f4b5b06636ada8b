// Static track geometry
//
// Built once at startup from configuration and never mutated: the
// measurement points around the loop, sector lengths, and the ancestor
// channel feeding each split kind. Live decoder state lives in the
// session table, not here.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tod::{dist_to_time, Tod};

/// The split kinds a measurement point may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplitKind {
    Lap,
    Half,
    Qtr,
    T200,
    T100,
    T50,
}

/// All split kinds, in emission order.
pub const SPLIT_KINDS: [SplitKind; 6] = [
    SplitKind::Lap,
    SplitKind::Half,
    SplitKind::Qtr,
    SplitKind::T200,
    SplitKind::T100,
    SplitKind::T50,
];

impl SplitKind {
    pub fn key(&self) -> &'static str {
        match self {
            SplitKind::Lap => "lap",
            SplitKind::Half => "half",
            SplitKind::Qtr => "qtr",
            SplitKind::T200 => "200",
            SplitKind::T100 => "100",
            SplitKind::T50 => "50",
        }
    }
}

/// A split source: the ancestor point and the legal duration window.
#[derive(Debug, Clone)]
pub struct SplitDef {
    /// mpid of the ancestor measurement point.
    pub src: u8,
    /// Nominal split distance in metres.
    pub len_m: f64,
    /// Duration below this implies speed above maxspeed.
    pub min: Tod,
    /// Duration above this implies speed below minspeed.
    pub max: Tod,
}

/// One measurement point around the loop.
#[derive(Debug, Clone)]
pub struct MeasurementPoint {
    pub chan: String,
    /// 1-based position in mpseq. 0 is reserved for synthetic records.
    pub mpid: u8,
    pub name: String,
    /// Distance from the finish line, metres, in travel direction.
    pub offset_m: f64,
    /// mpid of the previous configured point around the loop.
    pub prev: u8,
    /// mpid of the next configured point around the loop.
    pub next: u8,
    /// Length of the sector ending at this point.
    pub sector_len: f64,
    /// Legal duration window for the sector ending here.
    pub sector_min: Tod,
    pub sector_max: Tod,
    pub splits: HashMap<SplitKind, SplitDef>,
}

/// The entrance sector from the start gate loop to the next point.
#[derive(Debug, Clone)]
pub struct GateSector {
    pub src: u8,
    pub dst: u8,
    pub len_m: f64,
    pub min: Tod,
    pub max: Tod,
}

/// Read-only track geometry.
#[derive(Debug)]
pub struct TrackModel {
    laplen: f64,
    minspeed: f64,
    points: HashMap<u8, MeasurementPoint>,
    by_chan: HashMap<String, u8>,
    gate: Option<GateSector>,
}

impl TrackModel {
    /// Build and validate the track from configuration.
    pub fn new(cfg: &Config) -> Result<TrackModel> {
        if cfg.laplen <= 0.0 {
            return Err(Error::ConfigInvalid(format!(
                "invalid lap length {}",
                cfg.laplen
            )));
        }
        if cfg.minspeed <= 0.0 || cfg.maxspeed <= cfg.minspeed {
            return Err(Error::ConfigInvalid(format!(
                "invalid speed window {}..{}",
                cfg.minspeed, cfg.maxspeed
            )));
        }

        // mpid is the 1-based position of the channel in mpseq
        let mut by_chan: HashMap<String, u8> = HashMap::new();
        for (i, chan) in cfg.mpseq.iter().enumerate() {
            if by_chan.insert(chan.clone(), (i + 1) as u8).is_some() {
                return Err(Error::ConfigInvalid(format!(
                    "channel {} repeated in mpseq",
                    chan
                )));
            }
        }

        let configured = cfg.configured_channels();
        if configured.is_empty() {
            return Err(Error::ConfigInvalid(
                "no measurement points configured".into(),
            ));
        }
        for chan in cfg.mps.keys() {
            if cfg.mps[chan].ip.is_some() && !by_chan.contains_key(chan) {
                return Err(Error::ConfigInvalid(format!(
                    "configured channel {} missing from mpseq",
                    chan
                )));
            }
        }

        // offsets: present, in range, distinct
        let mut offsets: HashMap<String, f64> = HashMap::new();
        for chan in &configured {
            let mp = &cfg.mps[chan];
            let off = mp.offset.ok_or_else(|| {
                Error::ConfigInvalid(format!("channel {} has no offset", chan))
            })?;
            if off < 0.0 || off >= cfg.laplen {
                return Err(Error::ConfigInvalid(format!(
                    "channel {} offset {} outside [0, {})",
                    chan, off, cfg.laplen
                )));
            }
            if offsets.values().any(|&o| o == off) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate offset {} at channel {}",
                    off, chan
                )));
            }
            offsets.insert(chan.clone(), off);
        }

        let sector = |from: &str, to: &str| -> f64 {
            let d = offsets[to] - offsets[from];
            if d > 0.0 {
                d
            } else {
                cfg.laplen + d
            }
        };

        // sector chain around the loop
        let mut points: HashMap<u8, MeasurementPoint> = HashMap::new();
        let n = configured.len();
        for (i, chan) in configured.iter().enumerate() {
            let prev_chan = &configured[(i + n - 1) % n];
            let next_chan = &configured[(i + 1) % n];
            let seclen = if n == 1 {
                cfg.laplen
            } else {
                sector(prev_chan, chan)
            };
            let mpcfg = &cfg.mps[chan];
            let mut splits = HashMap::new();
            // the lap split always closes on the same channel
            splits.insert(
                SplitKind::Lap,
                SplitDef {
                    src: by_chan[chan],
                    len_m: cfg.laplen,
                    min: dist_to_time(cfg.laplen, cfg.maxspeed),
                    max: dist_to_time(cfg.laplen, cfg.minspeed),
                },
            );
            let ancestors = [
                (SplitKind::Half, &mpcfg.half),
                (SplitKind::Qtr, &mpcfg.qtr),
                (SplitKind::T200, &mpcfg.t200),
                (SplitKind::T100, &mpcfg.t100),
                (SplitKind::T50, &mpcfg.t50),
            ];
            for (kind, anc) in ancestors {
                if let Some(src_chan) = anc {
                    if src_chan == chan {
                        return Err(Error::ConfigInvalid(format!(
                            "{} split at {} references itself",
                            kind.key(),
                            chan
                        )));
                    }
                    if !configured.contains(src_chan) {
                        return Err(Error::ConfigInvalid(format!(
                            "{} split at {} references unconfigured {}",
                            kind.key(),
                            chan,
                            src_chan
                        )));
                    }
                    let len = sector(src_chan, chan);
                    splits.insert(
                        kind,
                        SplitDef {
                            src: by_chan[src_chan],
                            len_m: len,
                            min: dist_to_time(len, cfg.maxspeed),
                            max: dist_to_time(len, cfg.minspeed),
                        },
                    );
                }
            }
            points.insert(
                by_chan[chan],
                MeasurementPoint {
                    chan: chan.clone(),
                    mpid: by_chan[chan],
                    name: mpcfg.name.clone().unwrap_or_else(|| chan.clone()),
                    offset_m: offsets[chan],
                    prev: by_chan[prev_chan],
                    next: by_chan[next_chan],
                    sector_len: seclen,
                    sector_min: dist_to_time(seclen, cfg.maxspeed),
                    sector_max: dist_to_time(seclen, cfg.minspeed),
                    splits,
                },
            );
        }

        // entrance sector from the start gate loop
        let mut gate = None;
        if let Some(gchan) = &cfg.gatesrc {
            if let Some(&gid) = by_chan.get(gchan) {
                if points.contains_key(&gid) {
                    if cfg.mingate <= 0.0 || cfg.maxgate <= cfg.mingate {
                        return Err(Error::ConfigInvalid(format!(
                            "invalid gate speed window {}..{}",
                            cfg.mingate, cfg.maxgate
                        )));
                    }
                    let dst = points[&gid].next;
                    let len = points[&dst].sector_len;
                    gate = Some(GateSector {
                        src: gid,
                        dst,
                        len_m: len,
                        min: dist_to_time(len, cfg.maxgate),
                        max: dist_to_time(len, cfg.mingate),
                    });
                }
            }
        }

        Ok(TrackModel {
            laplen: cfg.laplen,
            minspeed: cfg.minspeed,
            points,
            by_chan,
            gate,
        })
    }

    pub fn laplen(&self) -> f64 {
        self.laplen
    }

    /// mpid for a channel id, configured points only.
    pub fn mpid(&self, chan: &str) -> Option<u8> {
        self.by_chan
            .get(chan)
            .copied()
            .filter(|id| self.points.contains_key(id))
    }

    pub fn point(&self, mpid: u8) -> Option<&MeasurementPoint> {
        self.points.get(&mpid)
    }

    pub fn points(&self) -> impl Iterator<Item = &MeasurementPoint> {
        self.points.values()
    }

    pub fn gate(&self) -> Option<&GateSector> {
        self.gate.as_ref()
    }

    /// Forward distance in metres between two configured points.
    pub fn sector(&self, from: u8, to: u8) -> Option<f64> {
        let f = self.points.get(&from)?;
        let t = self.points.get(&to)?;
        if from == to {
            return Some(self.laplen);
        }
        let d = t.offset_m - f.offset_m;
        Some(if d > 0.0 { d } else { self.laplen + d })
    }

    /// Window after which a rider's history is considered gone: two
    /// laps at minimum speed.
    pub fn fresh_window(&self) -> Tod {
        dist_to_time(2.0 * self.laplen, self.minspeed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MpConfig;

    fn full_config() -> Config {
        let mut cfg = Config::default();
        // all nine points, evenly spread except C1 at the finish line
        let offsets = [
            ("C1", 0.0),
            ("C9", 25.0),
            ("C4", 50.0),
            ("C6", 100.0),
            ("C3", 125.0),
            ("C5", 150.0),
            ("C7", 187.5),
            ("C8", 200.0),
            ("C2", 225.0),
        ];
        for (chan, off) in offsets {
            cfg.mps.insert(
                chan.to_string(),
                MpConfig {
                    ip: Some(format!("10.0.0.{}", off as u32 + 1)),
                    offset: Some(off),
                    ..Default::default()
                },
            );
        }
        // C1 carries the common splits back to ancestors
        let c1 = cfg.mps.get_mut("C1").unwrap();
        c1.half = Some("C3".to_string());
        c1.t200 = Some("C4".to_string());
        c1.t100 = Some("C5".to_string());
        c1.t50 = Some("C8".to_string());
        cfg
    }

    #[test]
    fn test_mpid_by_mpseq_position() {
        let track = TrackModel::new(&full_config()).unwrap();
        assert_eq!(track.mpid("C1"), Some(1));
        assert_eq!(track.mpid("C9"), Some(2));
        assert_eq!(track.mpid("C2"), Some(9));
        assert_eq!(track.mpid("C0"), None);
    }

    #[test]
    fn test_sector_lengths_sum_to_laplen() {
        let track = TrackModel::new(&full_config()).unwrap();
        let total: f64 = track.points().map(|p| p.sector_len).sum();
        assert!((total - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_sector_wraps_at_laplen() {
        let track = TrackModel::new(&full_config()).unwrap();
        // C2 (225 m) forward to C1 (0 m) wraps
        let c2 = track.mpid("C2").unwrap();
        let c1 = track.mpid("C1").unwrap();
        assert_eq!(track.sector(c2, c1), Some(25.0));
        assert_eq!(track.sector(c1, c1), Some(250.0));
    }

    #[test]
    fn test_split_ancestors() {
        let track = TrackModel::new(&full_config()).unwrap();
        let c1 = track.point(track.mpid("C1").unwrap()).unwrap();
        let half = &c1.splits[&SplitKind::Half];
        assert_eq!(half.src, track.mpid("C3").unwrap());
        assert!((half.len_m - 125.0).abs() < 1e-9);
        let lap = &c1.splits[&SplitKind::Lap];
        assert_eq!(lap.src, c1.mpid);
        assert!((lap.len_m - 250.0).abs() < 1e-9);
        // 200 m split windows at the configured speed band
        let t200 = &c1.splits[&SplitKind::T200];
        assert_eq!(t200.min, dist_to_time(200.0, 90.0));
        assert_eq!(t200.max, dist_to_time(200.0, 38.0));
    }

    #[test]
    fn test_unconfigured_points_skipped_in_chain() {
        let mut cfg = full_config();
        cfg.mps.get_mut("C9").unwrap().ip = None;
        // C1's half ancestor stays valid; chain hops C1 -> C4 directly
        let track = TrackModel::new(&cfg).unwrap();
        let c4 = track.point(track.mpid("C4").unwrap()).unwrap();
        assert_eq!(c4.prev, track.mpid("C1").unwrap());
        assert!((c4.sector_len - 50.0).abs() < 1e-9);
        assert_eq!(track.mpid("C9"), None);
    }

    #[test]
    fn test_duplicate_offset_rejected() {
        let mut cfg = full_config();
        cfg.mps.get_mut("C9").unwrap().offset = Some(0.0);
        assert!(TrackModel::new(&cfg).is_err());
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let mut cfg = full_config();
        cfg.mps.get_mut("C9").unwrap().offset = Some(250.0);
        assert!(TrackModel::new(&cfg).is_err());
    }

    #[test]
    fn test_self_referencing_ancestor_rejected() {
        let mut cfg = full_config();
        cfg.mps.get_mut("C1").unwrap().half = Some("C1".to_string());
        assert!(TrackModel::new(&cfg).is_err());
    }

    #[test]
    fn test_missing_mpseq_entry_rejected() {
        let mut cfg = full_config();
        cfg.mpseq.retain(|c| c != "C9");
        assert!(TrackModel::new(&cfg).is_err());
    }

    #[test]
    fn test_gate_sector() {
        let mut cfg = full_config();
        cfg.gatesrc = Some("C5".to_string());
        let track = TrackModel::new(&cfg).unwrap();
        let gate = track.gate().unwrap();
        assert_eq!(gate.src, track.mpid("C5").unwrap());
        assert_eq!(gate.dst, track.mpid("C7").unwrap());
        assert!((gate.len_m - 37.5).abs() < 1e-9);
    }

    #[test]
    fn test_fresh_window() {
        let track = TrackModel::new(&full_config()).unwrap();
        // 500 m at 38 km/h is a little over 47 s
        let w = track.fresh_window().as_secs();
        assert!(w > 47.0 && w < 48.0);
    }
}
