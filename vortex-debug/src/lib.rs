//! Host-side debugger backend for the Vortex GPGPU accelerator.
//!
//! The accelerator embeds a Debug Module (DM) which exposes a small set of
//! memory-mapped registers over a byte-oriented transport. This crate turns
//! high-level debugger operations (read a GPR on the selected warp, write a
//! span of memory, set a software breakpoint) into sequences of DM register
//! accesses and injected RISC-V instructions.
//!
//! The layering, bottom up:
//!
//! * [`transport`]: line-framed ASCII register protocol over a byte channel.
//! * [`dm`]: the DM register map and its bitfield helpers.
//! * [`riscv`]: GPR/CSR tables, MISA decoding, instruction encoders and the
//!   external-assembler wrapper.
//! * [`backend`]: the [`Backend`] engine with warp selection, halt/resume/step
//!   control, instruction injection, GPR/CSR/memory access and software
//!   breakpoints.
//!
//! All operations are synchronous and single-threaded; the only suspension
//! points are the transport receive timeout and the sleeps between poll
//! retries.

pub mod backend;
pub mod dm;
mod error;
pub mod riscv;
pub mod transport;

pub use backend::{Backend, Breakpoint, PlatformInfo, WarpStatus, WarpSummary};
pub use dm::HaltCause;
pub use error::DebugError;
pub use transport::{Transport, TransportError};

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DebugError>;
