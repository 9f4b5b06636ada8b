// Runtime configuration
//
// Command-line flags select the config file and a few overrides; the
// operational keys live in a JSON file merged over built-in defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Default ordering of measurement points around the track.
pub const DEFAULT_MPSEQ: [&str; 9] = [
    "C1", "C9", "C4", "C6", "C3", "C5", "C7", "C8", "C2",
];

/// Velotrain timing filter
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to JSON configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the UDP listen address.
    #[arg(long, value_name = "ADDR")]
    pub uaddr: Option<String>,

    /// Override the UDP listen port.
    #[arg(long, value_name = "PORT")]
    pub uport: Option<u16>,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

/// Per-measurement-point configuration.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct MpConfig {
    /// Display name, defaults to the channel id.
    pub name: Option<String>,
    /// Decoder unit address; a point without one is not configured.
    pub ip: Option<String>,
    /// Distance from the finish line in metres.
    pub offset: Option<f64>,
    /// Ancestor channels for each split kind.
    pub half: Option<String>,
    pub qtr: Option<String>,
    #[serde(rename = "200")]
    pub t200: Option<String>,
    #[serde(rename = "100")]
    pub t100: Option<String>,
    #[serde(rename = "50")]
    pub t50: Option<String>,
}

/// Operational configuration, all keys optional with defaults.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Optional reset auth key, compared byte for byte.
    pub authkey: Option<String>,
    /// Refid of the start gate transponder.
    pub gate: Option<String>,
    /// Correction subtracted from gate trigger times.
    pub gatedelay: String,
    /// Channel accepting gate triggers.
    pub gatesrc: Option<String>,
    /// Lap length in metres.
    pub laplen: f64,
    /// Maximum legal sector speed, km/h.
    pub maxspeed: f64,
    /// Minimum legal sector speed, km/h.
    pub minspeed: f64,
    /// Motorbike transponder refids.
    pub moto: Vec<String>,
    /// Refid of top-of-minute sync trigger messages.
    pub trig: String,
    /// Decoder detection level; noise at or above flags interference.
    pub passlevel: u32,
    /// UDP listen address.
    pub uaddr: String,
    /// UDP listen port.
    pub uport: u16,
    /// Broadcast address of the timing LAN.
    pub bcast: String,
    /// Base topic for all published and subscribed endpoints.
    pub basetopic: String,
    /// Channel of the synchronisation master unit.
    pub sync: Option<String>,
    /// Gate start sector speed window, km/h.
    pub mingate: f64,
    pub maxgate: f64,
    /// DHI scoreboard address, handled by the external serializer.
    pub dhi: Option<(String, u16)>,
    pub dhiencoding: String,
    /// Ordering of measurement points around the track.
    pub mpseq: Vec<String>,
    /// Per-channel measurement point configuration.
    pub mps: HashMap<String, MpConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            authkey: None,
            gate: None,
            gatedelay: "0.075".to_string(),
            gatesrc: None,
            laplen: 250.0,
            maxspeed: 90.0,
            minspeed: 38.0,
            moto: Vec::new(),
            trig: "255".to_string(),
            passlevel: 40,
            uaddr: String::new(),
            uport: 2008,
            bcast: "255.255.255.255".to_string(),
            basetopic: "velotrain".to_string(),
            sync: None,
            mingate: 9.0,
            maxgate: 22.5,
            dhi: None,
            dhiencoding: "utf-8".to_string(),
            mpseq: DEFAULT_MPSEQ.iter().map(|s| s.to_string()).collect(),
            mps: HashMap::new(),
        }
    }
}

impl Config {
    /// Load from the file named in args, then apply flag overrides.
    pub fn load(args: &Args) -> Result<Config> {
        let mut cfg = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str(&text)?
            }
            None => Config::default(),
        };
        if let Some(ua) = &args.uaddr {
            cfg.uaddr = ua.clone();
        }
        if let Some(up) = args.uport {
            cfg.uport = up;
        }
        if cfg.basetopic.is_empty() {
            return Err(Error::ConfigInvalid("empty basetopic".into()));
        }
        Ok(cfg)
    }

    /// Channels with a configured decoder, in mpseq order.
    pub fn configured_channels(&self) -> Vec<String> {
        self.mpseq
            .iter()
            .filter(|c| self.mps.get(*c).map_or(false, |m| m.ip.is_some()))
            .cloned()
            .collect()
    }
}
