use thiserror::Error;

use crate::transport::TransportError;

/// Errors reported by the debug backend.
///
/// Every variant maps onto one of the fixed numeric result codes used by the
/// wire tools and the CLI (see [`DebugError::code`]).
#[derive(Debug, Error)]
pub enum DebugError {
    /// A generic failure with context.
    #[error("{0}")]
    Fault(String),

    /// A poll loop exhausted its retry budget.
    #[error("timed out waiting for {what} (last value {last:#x})")]
    PollTimeout { what: String, last: u32 },

    /// The requested operation is not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// An argument was rejected.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// The transport layer failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// No warp/thread is selected, but the operation needs one.
    #[error("no warp/thread selected")]
    NoneSelected,

    /// The selected warp must be halted for this operation.
    #[error("warp {0} is not halted")]
    WarpNotHalted(u32),

    /// The external assembler failed.
    #[error("assembler error: {0}")]
    Assembler(String),
}

impl DebugError {
    /// Numeric result code, matching the codes exchanged with scripted
    /// front ends: `OK=0, Error=-1, Timeout=-2, NotImpl=-3, InvalidArg=-4,
    /// BufferOverflow=-5, CommErr=-6, TransportErr=-7, NoneSelectedErr=-8,
    /// WarpNotHalted=-9`.
    pub fn code(&self) -> i32 {
        match self {
            DebugError::Fault(_) | DebugError::Assembler(_) => -1,
            DebugError::PollTimeout { .. } => -2,
            DebugError::NotImplemented(_) => -3,
            DebugError::InvalidArg(_) => -4,
            DebugError::Transport(t) => match t {
                TransportError::Timeout => -2,
                TransportError::InvalidArg(_) => -4,
                TransportError::BatchTooLarge(_) => -5,
                TransportError::Nack | TransportError::InvalidReply(_) => -6,
                TransportError::NotConnected | TransportError::Io(_) => -7,
            },
            DebugError::NoneSelected => -8,
            DebugError::WarpNotHalted(_) => -9,
        }
    }
}
