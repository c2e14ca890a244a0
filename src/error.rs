use thiserror::Error;

use crate::control_messages::LeaveReason;

/// Why a client session (or a closed server) stopped
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndReason {
    /// no valid traffic from the server within the connection timeout
    TimedOut,
    /// the server sent a LEAVE
    ServerClosed(LeaveReason),
    /// this node left gracefully via `Engine::disconnect()`
    Left,
    /// the server was shut down via `Engine::close()`
    Closed,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    /// Terminal: the engine will not send or process anything anymore, and every subsequent
    ///  call to `update()` returns this error again.
    #[error("network session ended: {reason:?}")]
    Ended { reason: EndReason },
    #[error("socket error: {0}")]
    Socket(#[source] anyhow::Error),
}

impl NetworkError {
    pub fn ended(reason: EndReason) -> NetworkError {
        NetworkError::Ended { reason }
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            NetworkError::Ended { reason } => Some(*reason),
            NetworkError::Socket(_) => None,
        }
    }
}
