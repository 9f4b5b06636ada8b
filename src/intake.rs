// Raw passing intake
//
// Inbound records from the UDP listener and the control-plane timer
// topic meet here in one shape before dispatch. The decoder wire
// protocol itself is external; by the time a record reaches the core
// it is already (channel, refid, tod) plus optional extras.

use serde_json::json;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::tod::Tod;

/// Environment reading attached to a passing: (temp C, RH %, hPa).
pub type EnvReading = (f64, f64, f64);

/// One raw record as read off the wire, before clock correction.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Source channel id, `C1`..`C9`.
    pub chan: String,
    /// Transponder id, the trigger refid, or a system id.
    pub refid: String,
    /// Time of day from the decoder's own clock.
    pub tod: Tod,
    /// Host wall time the record was received.
    pub recv: Tod,
    pub env: Option<EnvReading>,
    /// Decoder-reported info, passed through verbatim when present.
    pub info: Option<String>,
    /// The decoder flagged this transponder's battery low.
    pub low_battery: bool,
}

/// A passing with the session offset applied, queued for reordering.
#[derive(Debug, Clone)]
pub struct CorrectedPassing {
    pub mpid: u8,
    pub refid: String,
    /// Corrected time of day.
    pub tod: Tod,
    pub raw_tod: Tod,
    pub recv: Tod,
    pub env: Option<EnvReading>,
    pub info: Option<String>,
    /// Arrived after the reorder window had already passed its tod.
    pub out_of_order: bool,
}

/// Parse a `INDEX;SOURCE;CHANNEL;REFID;TOD` timer line.
///
/// SOURCE names the measurement point channel. TOD accepts the
/// sentinels `now` (host wall time) and `0` (most recent minute
/// boundary, for triggers injected by hand).
pub fn parse_timer_line(line: &str, clock: &dyn Clock) -> Result<RawRecord> {
    let fields: Vec<&str> = line.trim().split(';').collect();
    if fields.len() != 5 {
        return Err(Error::TransientInput(format!(
            "expected 5 timer fields, got {}",
            fields.len()
        )));
    }
    let now = clock.now();
    let tod = match fields[4].trim() {
        "now" => now,
        "0" => now.floor_minute(),
        text => Tod::parse(text)
            .ok_or_else(|| Error::TransientInput(format!("bad timer tod {:?}", text)))?,
    };
    Ok(RawRecord {
        chan: fields[1].trim().to_string(),
        refid: fields[3].trim().to_string(),
        tod,
        recv: now,
        env: None,
        info: None,
        low_battery: false,
    })
}

/// Build the `rawpass` payload published before any correction.
pub fn rawpass_payload(
    rec: &RawRecord,
    mpid: u8,
    name: &str,
    date: &str,
) -> serde_json::Value {
    json!({
        "date": date,
        "env": rec.env,
        "refid": rec.refid,
        "mpid": mpid,
        "name": name,
        "time": rec.tod.rawtime(3),
        "rcv": rec.recv.rawtime(3),
        "info": rec.info,
    })
}
