// Error kinds for the timing core
//
// Only ConfigInvalid is fatal; the coordinator converts every other
// per-event failure into a logged kind and continues.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Track topology or configuration inconsistent. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Malformed raw or timer record. Logged and dropped.
    #[error("malformed input record: {0}")]
    TransientInput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file: {0}")]
    ConfigRead(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
