// Emission log and replay filtering
//
// A contiguous vector of the day's decorated passings, truncated on
// the daily reset. Replay requests run linear filters over it: index
// and time ranges, mpid and refid sets, and marker intervals.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::intake::EnvReading;
use crate::tod::Tod;
use crate::track::{SplitKind, TrackModel};

/// Soft cap on the day's stored records.
pub const LOG_SOFT_CAP: usize = 200_000;

/// A fully decorated passing as published and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub index: usize,
    pub date: String,
    pub time: String,
    pub mpid: u8,
    pub refid: String,
    pub env: Option<EnvReading>,
    pub moto: Option<String>,
    pub elap: Option<String>,
    pub lap: Option<String>,
    pub half: Option<String>,
    pub qtr: Option<String>,
    #[serde(rename = "200")]
    pub t200: Option<String>,
    #[serde(rename = "100")]
    pub t100: Option<String>,
    #[serde(rename = "50")]
    pub t50: Option<String>,
    pub text: String,
}

impl EmissionRecord {
    /// An undecorated record with every optional property null.
    pub fn bare(date: &str, time: String, mpid: u8, refid: &str, text: &str) -> Self {
        EmissionRecord {
            index: 0,
            date: date.to_string(),
            time,
            mpid,
            refid: refid.to_string(),
            env: None,
            moto: None,
            elap: None,
            lap: None,
            half: None,
            qtr: None,
            t200: None,
            t100: None,
            t50: None,
            text: text.to_string(),
        }
    }

    pub fn set_split(&mut self, kind: SplitKind, value: String) {
        match kind {
            SplitKind::Lap => self.lap = Some(value),
            SplitKind::Half => self.half = Some(value),
            SplitKind::Qtr => self.qtr = Some(value),
            SplitKind::T200 => self.t200 = Some(value),
            SplitKind::T100 => self.t100 = Some(value),
            SplitKind::T50 => self.t50 = Some(value),
        }
    }
}

/// The day's emission store.
#[derive(Debug, Default)]
pub struct EmissionLog {
    records: Vec<EmissionRecord>,
    next_index: usize,
}

impl EmissionLog {
    pub fn new() -> Self {
        EmissionLog::default()
    }

    /// Assign the next daily index to a record and store it. The cap
    /// sheds the oldest stored record; indexes keep counting.
    pub fn push(&mut self, mut rec: EmissionRecord) -> EmissionRecord {
        rec.index = self.next_index;
        self.next_index += 1;
        if self.records.len() >= LOG_SOFT_CAP {
            warn!("Emission log at capacity, shedding oldest record");
            self.records.remove(0);
        }
        self.records.push(rec.clone());
        rec
    }

    pub fn count(&self) -> usize {
        self.next_index
    }

    /// Daily truncation: forget the records and restart the index.
    pub fn clear(&mut self) {
        self.records.clear();
        self.next_index = 0;
    }

    /// Run a replay filter over the store.
    pub fn select(&self, filter: &ReplayFilter) -> Vec<EmissionRecord> {
        let plen = self.records.len();
        let mut out = Vec::new();
        let mut i = 0;
        while i < plen {
            let mut sid = i;
            let mut fid = plen;
            if let Some(markers) = &filter.marker {
                // start of the next matching marker interval
                let mut found = false;
                while i < plen {
                    let r = &self.records[i];
                    i += 1;
                    if r.refid == "marker" && markers.contains(&r.text) {
                        found = true;
                        break;
                    }
                }
                // strictly after the marker record itself
                sid = i;
                if !found {
                    break;
                }
                // interval closes at the next marker of any text
                while i < plen {
                    if self.records[i].refid == "marker" {
                        break;
                    }
                    i += 1;
                }
                fid = i;
            }
            for r in &self.records[sid..fid] {
                if filter.matches(r) {
                    out.push(r.clone());
                }
            }
            if filter.marker.is_none() {
                break;
            }
        }
        out
    }
}

/// Parsed replay request filters; all optional, all must match.
#[derive(Debug, Default)]
pub struct ReplayFilter {
    pub index: Option<(Option<usize>, Option<usize>)>,
    /// Normalized wall-clock strings, comparable lexicographically.
    pub time: Option<(Option<String>, Option<String>)>,
    pub mpid: Option<HashSet<u8>>,
    pub refid: Option<HashSet<String>>,
    pub marker: Option<HashSet<String>>,
}

impl ReplayFilter {
    /// Read filters out of a request body. Unusable values are logged
    /// and ignored so a replay is always attempted. Returns the filter
    /// and the optional reply serial.
    pub fn from_request(req: &Value, track: &TrackModel) -> (ReplayFilter, Option<String>) {
        let mut filter = ReplayFilter::default();
        let obj = match req.as_object() {
            Some(o) => o,
            None => {
                warn!("Invalid replay request object");
                return (filter, None);
            }
        };
        let serial = obj.get("serial").map(|s| match s {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        if let Some(v) = obj.get("refid") {
            filter.refid = str_set(v);
        }
        if let Some(v) = obj.get("marker") {
            filter.marker = str_set(v);
        }
        if let Some(v) = obj.get("mpid") {
            filter.mpid = mpid_set(v, track);
        }
        if let Some(v) = obj.get("time") {
            filter.time = time_range(v);
        }
        if let Some(v) = obj.get("index") {
            filter.index = index_range(v);
        }
        debug!("Replay filter: {:?}", filter);
        (filter, serial)
    }

    fn matches(&self, r: &EmissionRecord) -> bool {
        if let Some((lo, hi)) = &self.index {
            if lo.map_or(false, |lo| r.index < lo) {
                return false;
            }
            if hi.map_or(false, |hi| r.index > hi) {
                return false;
            }
        }
        if let Some((start, end)) = &self.time {
            if start.as_ref().map_or(false, |s| r.time < *s) {
                return false;
            }
            if end.as_ref().map_or(false, |e| r.time > *e) {
                return false;
            }
        }
        if let Some(mpids) = &self.mpid {
            if !mpids.contains(&r.mpid) {
                return false;
            }
        }
        if let Some(refids) = &self.refid {
            if !refids.contains(&r.refid) {
                return false;
            }
        }
        true
    }
}

fn scalar_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_set(v: &Value) -> Option<HashSet<String>> {
    let mut set = HashSet::new();
    match v {
        Value::Array(items) => set.extend(items.iter().filter_map(scalar_str)),
        other => set.extend(scalar_str(other)),
    }
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn mpid_set(v: &Value, track: &TrackModel) -> Option<HashSet<u8>> {
    let one = |item: &Value| -> Option<u8> {
        match item {
            Value::Number(n) => n.as_u64().map(|n| n as u8),
            Value::String(s) => track.mpid(s),
            _ => None,
        }
    };
    let mut set = HashSet::new();
    match v {
        Value::Array(items) => set.extend(items.iter().filter_map(one)),
        other => set.extend(one(other)),
    }
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

fn parse_time(v: &Value) -> Option<String> {
    let text = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Tod::parse(&text).map(|t| t.rawtime(2))
}

fn time_range(v: &Value) -> Option<(Option<String>, Option<String>)> {
    let (mut start, mut end) = match v {
        Value::Array(items) => match items.len() {
            1 => (parse_time(&items[0]), None),
            2 => (parse_time(&items[0]), parse_time(&items[1])),
            _ => {
                debug!("Invalid time range ignored");
                return None;
            }
        },
        other => (parse_time(other), None),
    };
    if let (Some(s), Some(e)) = (&start, &end) {
        if s > e {
            std::mem::swap(&mut start, &mut end);
        }
    }
    if start.is_some() || end.is_some() {
        Some((start, end))
    } else {
        None
    }
}

fn index_range(v: &Value) -> Option<(Option<usize>, Option<usize>)> {
    let one = |item: &Value| item.as_u64().map(|n| n as usize);
    let (mut lo, mut hi) = match v {
        Value::Array(items) => match items.len() {
            1 => (one(&items[0]), None),
            2 => (one(&items[0]), one(&items[1])),
            _ => {
                debug!("Invalid index range ignored");
                return None;
            }
        },
        // single value selects a single record
        other => {
            let n = one(other);
            (n, n)
        }
    };
    if let (Some(l), Some(h)) = (lo, hi) {
        if l > h {
            std::mem::swap(&mut lo, &mut hi);
        }
    }
    if lo.is_some() || hi.is_some() {
        Some((lo, hi))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, MpConfig};

    fn track() -> TrackModel {
        let mut cfg = Config::default();
        for (chan, off) in [("C1", 0.0), ("C4", 50.0)] {
            cfg.mps.insert(
                chan.to_string(),
                MpConfig {
                    ip: Some("10.0.0.9".to_string()),
                    offset: Some(off),
                    ..Default::default()
                },
            );
        }
        TrackModel::new(&cfg).unwrap()
    }

    fn rec(time: &str, mpid: u8, refid: &str, text: &str) -> EmissionRecord {
        EmissionRecord::bare(
            "2026-01-10",
            Tod::parse(time).unwrap().rawtime(2),
            mpid,
            refid,
            text,
        )
    }

    fn sample_log() -> EmissionLog {
        let mut log = EmissionLog::new();
        log.push(rec("10:00:00", 1, "100000", "C1"));
        log.push(rec("10:00:10", 3, "100000", "C4"));
        log.push(rec("10:00:20", 0, "marker", "one"));
        log.push(rec("10:00:30", 1, "100001", "C1"));
        log.push(rec("10:00:40", 1, "100000", "C1"));
        log.push(rec("10:00:50", 0, "marker", "two"));
        log.push(rec("10:01:00", 3, "100001", "C4"));
        log
    }

    #[test]
    fn test_indexes_are_gap_free() {
        let log = sample_log();
        let all = log.select(&ReplayFilter::default());
        let idx: Vec<usize> = all.iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_refid_filter() {
        let log = sample_log();
        let filter = ReplayFilter {
            refid: Some(["100001".to_string()].into()),
            ..Default::default()
        };
        let out = log.select(&filter);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.refid == "100001"));
    }

    #[test]
    fn test_index_range_inclusive() {
        let log = sample_log();
        let filter = ReplayFilter {
            index: Some((Some(1), Some(3))),
            ..Default::default()
        };
        let out = log.select(&filter);
        let idx: Vec<usize> = out.iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![1, 2, 3]);
    }

    #[test]
    fn test_time_range() {
        let log = sample_log();
        let filter = ReplayFilter {
            time: Some((
                Some(Tod::parse("10:00:25").unwrap().rawtime(2)),
                Some(Tod::parse("10:00:45").unwrap().rawtime(2)),
            )),
            ..Default::default()
        };
        let out = log.select(&filter);
        let idx: Vec<usize> = out.iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![3, 4]);
    }

    #[test]
    fn test_marker_interval_strictly_after() {
        let log = sample_log();
        let filter = ReplayFilter {
            marker: Some(["one".to_string()].into()),
            ..Default::default()
        };
        let out = log.select(&filter);
        let idx: Vec<usize> = out.iter().map(|r| r.index).collect();
        // after "one", before "two", excluding both marker records
        assert_eq!(idx, vec![3, 4]);
    }

    #[test]
    fn test_marker_interval_runs_to_end() {
        let log = sample_log();
        let filter = ReplayFilter {
            marker: Some(["two".to_string()].into()),
            ..Default::default()
        };
        let out = log.select(&filter);
        let idx: Vec<usize> = out.iter().map(|r| r.index).collect();
        assert_eq!(idx, vec![6]);
    }

    #[test]
    fn test_unmatched_marker_selects_nothing() {
        let log = sample_log();
        let filter = ReplayFilter {
            marker: Some(["three".to_string()].into()),
            ..Default::default()
        };
        assert!(log.select(&filter).is_empty());
    }

    #[test]
    fn test_from_request_parses_filters() {
        let tr = track();
        let req: Value = serde_json::from_str(
            r#"{"serial": "q1", "refid": ["100000", 42],
                "mpid": ["C4", 1], "index": [0, 10],
                "time": ["10:00:00", "10:01:00"]}"#,
        )
        .unwrap();
        let (filter, serial) = ReplayFilter::from_request(&req, &tr);
        assert_eq!(serial.as_deref(), Some("q1"));
        let refids = filter.refid.unwrap();
        assert!(refids.contains("100000") && refids.contains("42"));
        let mpids = filter.mpid.unwrap();
        assert!(mpids.contains(&3) && mpids.contains(&1));
        assert_eq!(filter.index, Some((Some(0), Some(10))));
    }

    #[test]
    fn test_from_request_single_index() {
        let tr = track();
        let req: Value = serde_json::from_str(r#"{"index": 4}"#).unwrap();
        let (filter, _) = ReplayFilter::from_request(&req, &tr);
        assert_eq!(filter.index, Some((Some(4), Some(4))));
    }

    #[test]
    fn test_clear_resets_index() {
        let mut log = sample_log();
        log.clear();
        assert_eq!(log.count(), 0);
        let r = log.push(rec("11:00:00", 1, "100000", "C1"));
        assert_eq!(r.index, 0);
    }

    #[test]
    fn test_null_fields_serialize_as_null() {
        let r = rec("10:00:00", 1, "100000", "C1");
        let v = serde_json::to_value(&r).unwrap();
        assert!(v["lap"].is_null());
        assert!(v["moto"].is_null());
        assert_eq!(v["200"], Value::Null);
        assert_eq!(v["mpid"], 1);
    }
}
