// Status snapshot assembly
//
// Built at each host top-of-minute boundary (and around resets) from
// coordinator state and published to the status topic.

use serde::Serialize;

use crate::intake::EnvReading;
use crate::session::SessionTable;
use crate::tod::Tod;

/// Per-unit line in the status snapshot.
#[derive(Debug, Serialize)]
pub struct UnitStatus {
    pub mpid: u8,
    pub name: String,
    pub noise: Option<u32>,
    /// Current unit offset estimate, or null while not online.
    pub offset: Option<String>,
    pub state: String,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub date: String,
    pub time: String,
    /// running | resetting | error | offline
    pub info: String,
    /// Host wall minus UTC, whole seconds.
    pub offset: i32,
    /// Count of passings emitted today.
    pub count: usize,
    /// Most recent gate trigger, if any.
    pub gate: Option<String>,
    pub env: Option<EnvReading>,
    /// Refids with low-battery warnings.
    pub batt: Vec<String>,
    pub units: Vec<UnitStatus>,
}

impl Status {
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        date: String,
        now: Tod,
        info: &str,
        utc_offset: i32,
        count: usize,
        gate: Option<Tod>,
        env: Option<EnvReading>,
        sessions: &SessionTable,
    ) -> Status {
        let mut units = Vec::new();
        for s in sessions.ordered() {
            units.push(UnitStatus {
                mpid: s.mpid,
                name: s.name.clone(),
                noise: s.last_seen.map(|_| s.noise),
                offset: s.offset().map(|o| o.rawtime(3)),
                state: s.state().as_str().to_string(),
            });
        }
        Status {
            date,
            time: now.rawtime(2),
            info: info.to_string(),
            offset: utc_offset,
            count,
            gate: gate.map(|g| g.rawtime(2)),
            env,
            batt: sessions.battery_warnings(),
            units,
        }
    }

    /// One summary log line per snapshot.
    pub fn log_line(&self) -> String {
        let mut parts = vec![format!(
            "Status {} Count:{} Offset:{}",
            self.info, self.count, self.offset
        )];
        for u in &self.units {
            parts.push(format!(
                "{}:{}",
                u.name,
                u.noise.map_or("-".to_string(), |n| n.to_string())
            ));
        }
        parts.join(" ")
    }

    /// Units whose noise score flags interference.
    pub fn interference(&self, passlevel: u32) -> Vec<u8> {
        self.units
            .iter()
            .filter(|u| u.noise.map_or(false, |n| n >= passlevel))
            .map(|u| u.mpid)
            .collect()
    }
}
