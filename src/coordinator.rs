// Coordinator - top level glue between intake, sessions, reordering,
// rider tracking, and the control plane
//
// Logically single-threaded: this object owns every piece of mutable
// state and is driven from one task. Raw records and control commands
// arrive on a channel; the reorder release and top-of-minute status
// run off a 100 ms tick multiplexed in the same loop.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::intake::{parse_timer_line, rawpass_payload, CorrectedPassing, RawRecord};
use crate::moto::MotoAnnotator;
use crate::reorder::{Enqueue, ReorderBuffer, DEFAULT_WINDOW_SECS};
use crate::replay::{EmissionLog, EmissionRecord, ReplayFilter};
use crate::rider::{RiderTracker, Subject};
use crate::session::SessionTable;
use crate::status::Status;
use crate::telegraph::Telegraph;
use crate::tod::{Tod, TICKS_PER_SEC};
use crate::track::TrackModel;

/// Raw input silent for longer than this raises the error status.
const INPUT_SILENT_SECS: i64 = 30;

/// Inbound work for the coordinator loop.
#[derive(Debug)]
pub enum Event {
    /// A raw record from the UDP listener or the timer topic.
    Raw(RawRecord),
    /// A control-plane message, keyed by its full topic.
    Command { topic: String, payload: Vec<u8> },
}

pub struct Coordinator {
    cfg: Config,
    track: TrackModel,
    sessions: SessionTable,
    reorder: ReorderBuffer,
    riders: RiderTracker,
    motos: MotoAnnotator,
    log: EmissionLog,
    telegraph: Box<dyn Telegraph>,
    clock: Box<dyn Clock>,
    gatedelay: Tod,
    resetting: bool,
    overflow_error: bool,
    input_silent: bool,
    last_raw: Tod,
    last_minute: i64,
    day: String,
    last_env: Option<crate::intake::EnvReading>,
}

impl Coordinator {
    pub fn new(
        cfg: Config,
        telegraph: Box<dyn Telegraph>,
        clock: Box<dyn Clock>,
    ) -> Result<Coordinator> {
        let track = TrackModel::new(&cfg)?;
        let sessions = SessionTable::new(&track, cfg.sync.as_deref());
        let gatedelay = Tod::parse(&cfg.gatedelay).unwrap_or(Tod::ZERO);
        let now = clock.now();
        let day = clock.date();
        Ok(Coordinator {
            riders: RiderTracker::new(),
            reorder: ReorderBuffer::new(DEFAULT_WINDOW_SECS),
            motos: MotoAnnotator::new(),
            log: EmissionLog::new(),
            sessions,
            track,
            cfg,
            telegraph,
            clock,
            gatedelay,
            resetting: false,
            overflow_error: false,
            input_silent: false,
            last_raw: now,
            last_minute: now.minute(),
            day,
            last_env: None,
        })
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}{}", self.cfg.basetopic, suffix)
    }

    /// Drive the event loop until the input channel closes.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("Coordinator running on {}", self.cfg.basetopic);
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(Event::Raw(r)) => self.handle_raw(r),
                    Some(Event::Command { topic, payload }) => {
                        self.handle_command(&topic, &payload)
                    }
                    None => break,
                },
                _ = tick.tick() => self.tick(),
            }
        }
        // final status on graceful exit
        self.publish_status("offline");
        info!("Exiting");
    }

    /// Dispatch one raw record: stamp, publish rawpass, route triggers
    /// to the session, correct and enqueue the rest.
    pub fn handle_raw(&mut self, mut rec: RawRecord) {
        self.last_raw = rec.recv;
        self.input_silent = false;
        if let Some(env) = rec.env {
            self.last_env = Some(env);
        }

        let mpid = match self.track.mpid(&rec.chan) {
            Some(id) => id,
            None => {
                info!("Spurious passing: {}@{}", rec.chan, rec.tod.rawtime(2));
                return;
            }
        };

        if rec.refid.is_empty() {
            info!("Altered empty refid to 1");
            rec.refid = "1".to_string();
        }

        if self.resetting {
            if rec.refid == self.cfg.trig {
                self.handle_trigger(mpid, &rec);
            } else {
                debug!(
                    "Ignored passing during reset: {}@{}",
                    rec.chan,
                    rec.tod.rawtime(2)
                );
            }
            return;
        }

        {
            let sess = self.sessions.get_mut(mpid).expect("session for track point");
            sess.seen(rec.recv);
            if rec.low_battery && sess.low_battery.insert(rec.refid.clone()) {
                warn!("{} low battery on {}", rec.chan, rec.refid);
            }
        }

        // the raw record goes out verbatim, before any correction
        let name = self.track.point(mpid).expect("track point").name.clone();
        self.telegraph.publish_json(
            &self.topic("/rawpass"),
            &rawpass_payload(&rec, mpid, &name, &self.day),
        );

        if rec.refid == self.cfg.trig {
            self.handle_trigger(mpid, &rec);
            return;
        }

        let tod = match self.sessions.get(mpid).and_then(|s| s.correct(rec.tod)) {
            Some(t) => t,
            None => {
                debug!("{} not online, passing not accepted", rec.chan);
                return;
            }
        };

        if self.cfg.gate.as_deref() == Some(rec.refid.as_str()) {
            self.handle_gate(mpid, tod);
            return;
        }

        // reads outside the cohort feed the unit's noise score
        let subject = if self.cfg.moto.contains(&rec.refid) {
            Subject::Moto(rec.refid.clone())
        } else if rec.refid.bytes().all(|b| b.is_ascii_digit()) {
            Subject::Rider(rec.refid.clone())
        } else {
            debug!("Noise read {}@{}", rec.refid, rec.chan);
            if let Some(s) = self.sessions.get_mut(mpid) {
                s.note_spurious();
            }
            return;
        };

        if let Subject::Moto(_) = &subject {
            self.motos.note(mpid, tod);
        }
        let refid = subject.refid().to_string();

        let pass = CorrectedPassing {
            mpid,
            refid,
            tod,
            raw_tod: rec.tod,
            recv: rec.recv,
            env: rec.env,
            info: rec.info,
            out_of_order: false,
        };
        let now = self.clock.now();
        let (res, dropped) = self.reorder.push(pass, now);
        if dropped && !self.overflow_error {
            self.overflow_error = true;
            error!("Reorder queue overflow, shedding oldest raw events");
            self.publish_status("error");
        }
        if let Enqueue::Late(p) = res {
            self.process_released(p);
        }
    }

    fn handle_trigger(&mut self, mpid: u8, rec: &RawRecord) {
        let is_master = self.sessions.is_master(mpid);
        if let Some(sess) = self.sessions.get_mut(mpid) {
            sess.on_trigger(rec.tod, rec.recv);
        }
        // the reset procedure completes on the first slaved trigger
        if self.resetting && (self.sessions.master().is_none() || !is_master) {
            self.finish_reset();
        }
    }

    fn handle_gate(&mut self, mpid: u8, tod: Tod) {
        let accepted = self
            .track
            .gate()
            .map_or(false, |gs| gs.src == mpid);
        if !accepted {
            warn!("Spurious gate trigger: mpid {}@{}", mpid, tod.rawtime(2));
            return;
        }
        let gate = tod - self.gatedelay;
        debug!("Gate trigger: mpid {}@{}", mpid, gate.rawtime(2));
        self.riders.set_gate(gate);
        let mut rec = EmissionRecord::bare(
            &self.day,
            gate.rawtime(2),
            0,
            Subject::Gate.refid(),
            "Start Gate",
        );
        rec.env = self.last_env;
        rec.elap = Some("0.00".to_string());
        self.emit(rec);
    }

    /// Classify and emit one passing released from the reorder buffer.
    fn process_released(&mut self, pass: CorrectedPassing) {
        if self.resetting {
            return;
        }
        let cls = self.riders.classify(
            &self.track,
            &pass.refid,
            pass.mpid,
            pass.tod,
            pass.out_of_order,
        );
        let name = match self.track.point(pass.mpid) {
            Some(p) => p.name.clone(),
            None => return,
        };
        let mut rec = EmissionRecord::bare(
            &self.day,
            pass.tod.rawtime(2),
            pass.mpid,
            &pass.refid,
            &name,
        );
        rec.env = pass.env.or(self.last_env);
        rec.moto = if pass.refid == "moto" {
            Some("0.00".to_string())
        } else {
            self.motos
                .proximity(pass.mpid, pass.tod)
                .map(|d| d.elapsed(2))
        };
        if cls.in_run {
            for (kind, d) in &cls.splits {
                rec.set_split(*kind, d.as_secs_str(2));
            }
            rec.elap = cls.elap.map(|e| e.elapsed(2));
        }
        self.emit(rec);
    }

    /// Assign the daily index, store, log, and publish.
    fn emit(&mut self, rec: EmissionRecord) {
        let rec = self.log.push(rec);
        info!(
            "Passing {}: mpid {} {}@{} {}",
            rec.index, rec.mpid, rec.refid, rec.time, rec.text
        );
        if let Ok(v) = serde_json::to_value(&rec) {
            self.telegraph.publish_json(&self.topic("/passing"), &v);
        }
    }

    /// Periodic housekeeping off the 100 ms loop tick.
    pub fn tick(&mut self) {
        let now = self.clock.now();
        for p in self.reorder.release(now) {
            self.process_released(p);
        }
        if self.overflow_error && self.reorder.below_half() {
            self.overflow_error = false;
            info!("Reorder queue backlog cleared");
        }

        // daily index reset at local midnight
        let date = self.clock.date();
        if date != self.day {
            info!("Date changed to {}, truncating emission log", date);
            self.log.clear();
            self.riders.clear();
            self.motos.clear();
            self.day = date;
        }

        // silence on the raw input channel
        let silent = (now - self.last_raw).ticks() > INPUT_SILENT_SECS * TICKS_PER_SEC;
        if silent && !self.input_silent {
            self.input_silent = true;
            warn!("Raw input silent for more than {}s", INPUT_SILENT_SECS);
            self.publish_status("error");
        }

        // top-of-minute housekeeping and status
        let minute = now.minute();
        if minute != self.last_minute {
            self.last_minute = minute;
            if self.sessions.minute_tick(now) {
                warn!("Sync master not online, units held at syncing");
            }
            self.riders.prune(&self.track, now);
            self.publish_status(self.info_str());
        }
    }

    fn info_str(&self) -> &'static str {
        if self.resetting {
            "resetting"
        } else if self.overflow_error || self.input_silent {
            "error"
        } else {
            "running"
        }
    }

    fn publish_status(&mut self, info: &str) {
        let st = Status::assemble(
            self.day.clone(),
            self.clock.now(),
            info,
            self.clock.utc_offset_secs(),
            self.log.count(),
            self.riders.gate(),
            self.last_env,
            &self.sessions,
        );
        info!("{}", st.log_line());
        let flagged = st.interference(self.cfg.passlevel);
        if !flagged.is_empty() {
            warn!("Interference at mpids {:?}", flagged);
        }
        if let Ok(v) = serde_json::to_value(&st) {
            self.telegraph.publish_json(&self.topic("/status"), &v);
        }
    }

    /// Route one control-plane message by its topic leaf.
    pub fn handle_command(&mut self, topic: &str, payload: &[u8]) {
        debug!("Command {}", topic);
        let leaf = topic.rsplit('/').next().unwrap_or("").to_ascii_lowercase();
        match leaf.as_str() {
            "request" => self.do_replay(payload),
            "marker" => {
                let text = String::from_utf8_lossy(payload).trim().to_string();
                let text = if text.is_empty() {
                    "marker".to_string()
                } else {
                    text
                };
                self.do_marker(&text);
            }
            "reset" => self.do_reset(payload),
            "timer" => {
                let line = String::from_utf8_lossy(payload);
                match parse_timer_line(&line, self.clock.as_ref()) {
                    Ok(rec) => self.handle_raw(rec),
                    Err(e) => warn!("Ignored invalid foreign timer: {}", e),
                }
            }
            "resetunit" => {
                let chan = String::from_utf8_lossy(payload).trim().to_string();
                self.do_reset_unit(&chan);
            }
            _ => debug!("Ignored invalid command"),
        }
    }

    /// Insert a synthetic marker record, bypassing the reorder buffer.
    pub fn do_marker(&mut self, text: &str) {
        if self.resetting {
            debug!("Ignored marker during reset");
            return;
        }
        let now = self.clock.now();
        let mut rec =
            EmissionRecord::bare(&self.day, now.rawtime(2), 0, Subject::Marker.refid(), text);
        rec.env = self.last_env;
        rec.elap = self.riders.gate_elapsed(now).map(|e| e.elapsed(2));
        self.emit(rec);
    }

    /// Authenticated system reset: drain, clear, push units offline,
    /// then wait for a slaved trigger to resume.
    pub fn do_reset(&mut self, key: &[u8]) {
        if let Some(auth) = &self.cfg.authkey {
            if auth.as_bytes() != key {
                // no oracle: log only, no reply
                warn!("Invalid reset authorisation key");
                return;
            }
        }
        info!("Starting reset procedure, operation paused");
        self.resetting = true;
        self.publish_status("resetting");
        self.reorder.drain();
        self.riders.clear();
        self.motos.clear();
        self.log.clear();
        self.sessions.all_offline();
        self.sessions.clear_batteries();
        self.overflow_error = false;
        info!("Requested unit resynchronisation");
    }

    fn finish_reset(&mut self) {
        self.resetting = false;
        info!("Reset complete, resuming normal operation");
        self.publish_status("running");
    }

    /// Push one unit offline and drop its queued passings. The sync
    /// master cannot be reset this way.
    pub fn do_reset_unit(&mut self, chan: &str) {
        let mpid = match self.track.mpid(chan) {
            Some(id) => id,
            None => {
                warn!("Reset for unknown unit {}", chan);
                return;
            }
        };
        if self.sessions.is_master(mpid) {
            warn!("Refused reset of sync master {}", chan);
            return;
        }
        if let Some(s) = self.sessions.get_mut(mpid) {
            s.reset();
        }
        self.reorder.drop_channel(mpid);
        info!("Unit {} reset, awaiting resynchronisation", chan);
    }

    /// Run a replay request against the emission log.
    pub fn do_replay(&mut self, payload: &[u8]) {
        let req: Value = serde_json::from_slice(payload).unwrap_or(Value::Null);
        let (filter, serial) = ReplayFilter::from_request(&req, &self.track);
        let records = self.log.select(&filter);
        let mut topic = self.topic("/replay");
        if let Some(serial) = serial {
            topic.push('/');
            topic.push_str(&serial);
        }
        info!("Replaying {} passings to {}", records.len(), topic);
        if let Ok(v) = serde_json::to_value(&records) {
            self.telegraph.publish_json(&topic, &v);
        }
    }
}
