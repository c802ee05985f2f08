//! Crate-wide error taxonomy and the C-style return codes the public API reports.

use std::fmt::{self, Display};

/// Error taxonomy, independent of any particular language's exception vocabulary.
///
/// `InvariantViolation` marks a bug in the runtime itself; everything else is
/// a condition the caller or the network can legitimately trigger.
#[derive(Debug)]
pub enum RuntimeError {
    /// A broken internal invariant. Callers should treat this as fatal.
    InvariantViolation(String),
    /// A malformed frame or type string. Recovered locally: drop, count, continue.
    Protocol(String),
    /// Allocator or channel exhaustion. Surfaced to the caller of the failing API.
    Resource(String),
    /// A socket error or a peer that dropped.
    Transport(String),
    /// An operation issued in the wrong lifecycle state (e.g. before `initialize`).
    State(String),
    /// Scheduling into a scheduler whose clock is not live.
    Timing(String),
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::InvariantViolation(s) => write!(f, "invariant violation: {s}"),
            RuntimeError::Protocol(s) => write!(f, "protocol error: {s}"),
            RuntimeError::Resource(s) => write!(f, "resource error: {s}"),
            RuntimeError::Transport(s) => write!(f, "transport error: {s}"),
            RuntimeError::State(s) => write!(f, "state error: {s}"),
            RuntimeError::Timing(s) => write!(f, "timing error: {s}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Transport(format!("io: {e}"))
    }
}

impl From<rosc::OscError> for RuntimeError {
    fn from(e: rosc::OscError) -> Self {
        RuntimeError::Protocol(format!("osc: {e}"))
    }
}

/// The flat, C-style return codes described in spec §6.
///
/// `SUCCESS` is zero; every error is a distinct negative value so a caller
/// can test `< 0` for "failed" without inspecting the variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    Fail = -1,
    ServiceConflict = -2,
    NoService = -3,
    NoMemory = -4,
    AlreadyRunning = -5,
    BadName = -6,
    TcpHangUp = -7,
}

impl From<&RuntimeError> for ReturnCode {
    fn from(e: &RuntimeError) -> Self {
        match e {
            RuntimeError::Resource(_) => ReturnCode::NoMemory,
            RuntimeError::State(s) if s.contains("already running") => ReturnCode::AlreadyRunning,
            RuntimeError::State(s) if s.contains("bad name") => ReturnCode::BadName,
            RuntimeError::State(s) if s.contains("already registered") => ReturnCode::ServiceConflict,
            RuntimeError::State(s) if s.contains("no local service") || s.contains("no OSC delegate") => {
                ReturnCode::NoService
            }
            RuntimeError::Transport(s) if s.contains("hung up") || s.contains("hang up") => {
                ReturnCode::TcpHangUp
            }
            RuntimeError::State(_) => ReturnCode::Fail,
            RuntimeError::InvariantViolation(_) => ReturnCode::Fail,
            RuntimeError::Protocol(_) => ReturnCode::Fail,
            RuntimeError::Transport(_) => ReturnCode::Fail,
            RuntimeError::Timing(_) => ReturnCode::Fail,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_zero() {
        assert_eq!(ReturnCode::Success as i32, 0);
    }

    #[test]
    fn errors_are_distinct_negatives() {
        let codes = [
            ReturnCode::Fail,
            ReturnCode::ServiceConflict,
            ReturnCode::NoService,
            ReturnCode::NoMemory,
            ReturnCode::AlreadyRunning,
            ReturnCode::BadName,
            ReturnCode::TcpHangUp,
        ];
        for c in codes {
            assert!((c as i32) < 0);
        }
    }

    #[test]
    fn resource_error_maps_to_no_memory() {
        let e = RuntimeError::Resource("pool exhausted".into());
        assert_eq!(ReturnCode::from(&e), ReturnCode::NoMemory);
    }
}
