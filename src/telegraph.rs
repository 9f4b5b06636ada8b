// Telegraph output seam
//
// The message broker client is an external collaborator; the core only
// needs a publish call keyed by topic. The binary wires a logging
// implementation, tests capture payloads on a channel.

use serde_json::Value;
use tracing::{debug, info};

/// Publish surface for all outbound records.
pub trait Telegraph: Send {
    fn publish_json(&self, topic: &str, payload: &Value);
}

/// Logs every publication; stands in when no broker bridge is wired.
pub struct LogTelegraph;

impl Telegraph for LogTelegraph {
    fn publish_json(&self, topic: &str, payload: &Value) {
        if topic.ends_with("/passing") || topic.ends_with("/status") {
            info!("{} {}", topic, payload);
        } else {
            debug!("{} {}", topic, payload);
        }
    }
}

/// Captures publications on an unbounded channel.
pub struct ChannelTelegraph {
    tx: tokio::sync::mpsc::UnboundedSender<(String, Value)>,
}

impl ChannelTelegraph {
    pub fn new() -> (
        Self,
        tokio::sync::mpsc::UnboundedReceiver<(String, Value)>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (ChannelTelegraph { tx }, rx)
    }
}

impl Telegraph for ChannelTelegraph {
    fn publish_json(&self, topic: &str, payload: &Value) {
        let _ = self.tx.send((topic.to_string(), payload.clone()));
    }
}
