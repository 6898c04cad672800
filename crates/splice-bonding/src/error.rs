use std::io;

use splice_transport::wire::WireError;
use thiserror::Error;

/// Reasons a client or server session ends abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("source {0} terminated the session")]
    PeerTerminated(u8),
    #[error("gave up after {0} consecutive receive/send errors")]
    ErrorBudgetExhausted(u32),
    #[error("no source can serve {0:?}")]
    AllRefused(String),
    #[error("invalid source id {0}")]
    InvalidSource(u8),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("packet construction failed: {0}")]
    Wire(#[from] WireError),
    #[error("internal error: {0}")]
    Internal(&'static str),
}
