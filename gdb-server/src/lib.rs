//! GDB Remote Serial Protocol server for the Vortex debugger.
//!
//! Exposes a [`vortex_debug::Backend`] to a GDB client over TCP. The
//! [`parser`] module turns packet payloads into a typed [`parser::Packet`];
//! [`stub`] owns the listener, the `$payload#xx` framing and the command
//! handlers; [`thread`] maps warps and threads onto GDB thread IDs and
//! [`desc`] serves the target description XML.

pub mod desc;
pub mod parser;
pub mod stub;
pub mod thread;

pub use stub::{GdbStub, ServerError};
