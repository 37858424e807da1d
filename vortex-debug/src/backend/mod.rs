//! The debug backend engine.
//!
//! [`Backend`] owns the transport and layers the debugger operations on top
//! of it: typed DM register access with poll/retry policy, warp selection,
//! halt/resume/step control, instruction injection, GPR/CSR/memory access
//! and software breakpoints. The submodules split the implementation along
//! those lines; everything hangs off the one `Backend` type.

mod breakpoints;
mod control;
mod memory;
mod registers;
mod selection;

pub use breakpoints::Breakpoint;
pub use selection::{WarpStatus, WarpSummary};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::dm::{self, DmReg};
use crate::riscv::asm;
use crate::transport::Transport;
use crate::{DebugError, Result};

/// Default poll budget: 10 attempts, 100 ms apart.
pub const DEFAULT_POLL_RETRIES: u32 = 10;
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(100);

/// Decoded `PLATFORM` register plus derived totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformInfo {
    pub platform_id: u32,
    pub platform_name: String,
    pub num_clusters: u32,
    pub num_cores_per_cluster: u32,
    pub num_warps_per_core: u32,
    /// Always a power of two; the raw field holds the log2.
    pub num_threads_per_warp: u32,
    pub misa: Option<u32>,
}

impl PlatformInfo {
    pub fn total_cores(&self) -> u32 {
        self.num_clusters * self.num_cores_per_cluster
    }

    pub fn total_warps(&self) -> u32 {
        self.total_cores() * self.num_warps_per_core
    }

    pub fn total_threads(&self) -> u32 {
        self.total_warps() * self.num_threads_per_warp
    }

    /// Number of 32-warp selection windows.
    pub fn num_windows(&self) -> u32 {
        self.total_warps().div_ceil(32)
    }

    fn decode(raw: u32) -> Result<PlatformInfo> {
        let platform_id = dm::extract(DmReg::Platform, "platformid", raw)?;
        let platform_name = if platform_id == 0x1 { "Vortex" } else { "Unknown" };
        Ok(PlatformInfo {
            platform_id,
            platform_name: platform_name.to_string(),
            num_clusters: dm::extract(DmReg::Platform, "numclusters", raw)?,
            num_cores_per_cluster: dm::extract(DmReg::Platform, "numcores", raw)?,
            num_warps_per_core: dm::extract(DmReg::Platform, "numwarps", raw)?,
            num_threads_per_warp: 1 << dm::extract(DmReg::Platform, "numthreads", raw)?,
            misa: None,
        })
    }
}

impl fmt::Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "  Platform ID   : {:#010x} ({})",
            self.platform_id, self.platform_name
        )?;
        writeln!(f, "  Clusters      : {}", self.num_clusters)?;
        writeln!(f, "  Cores/Cluster : {}", self.num_cores_per_cluster)?;
        writeln!(f, "  Warps/Core    : {}", self.num_warps_per_core)?;
        writeln!(f, "  Threads/Warp  : {}", self.num_threads_per_warp)?;
        writeln!(f, "  Total Cores   : {}", self.total_cores())?;
        writeln!(f, "  Total Warps   : {}", self.total_warps())?;
        write!(f, "  Total Threads : {}", self.total_threads())
    }
}

/// The debug backend. One instance owns one target.
pub struct Backend {
    transport: Box<dyn Transport>,
    platform: Option<PlatformInfo>,

    /// Selected `(warp, thread)`, if any.
    pub(crate) selection: Option<(u32, u32)>,
    /// Cached PC of the selected warp/thread.
    pub(crate) selected_pc: u32,

    pub(crate) breakpoints: BTreeMap<u32, Breakpoint>,

    poll_retries: u32,
    poll_delay: Duration,
    toolchain_prefix: String,
}

impl Backend {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Backend {
            transport,
            platform: None,
            selection: None,
            selected_pc: 0,
            breakpoints: BTreeMap::new(),
            poll_retries: DEFAULT_POLL_RETRIES,
            poll_delay: DEFAULT_POLL_DELAY,
            toolchain_prefix: asm::DEFAULT_TOOLCHAIN_PREFIX.to_string(),
        }
    }

    /// Overrides the default poll policy.
    pub fn set_poll_policy(&mut self, retries: u32, delay: Duration) {
        self.poll_retries = retries;
        self.poll_delay = delay;
    }

    pub fn set_toolchain_prefix(&mut self, prefix: impl Into<String>) {
        self.toolchain_prefix = prefix.into();
    }

    pub(crate) fn toolchain_prefix(&self) -> &str {
        &self.toolchain_prefix
    }

    /// Connects the transport and performs the protocol handshake.
    pub fn connect(&mut self, args: &HashMap<String, String>) -> Result<()> {
        self.transport.connect(args)?;
        self.transport.handshake()?;
        log::info!("transport connected");
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect()?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Wakes the DM and fetches platform information.
    pub fn initialize(&mut self) -> Result<()> {
        self.check_connected()?;
        log::info!("initializing backend");

        self.wake_dm()?;
        self.fetch_platform_info()?;

        let info = self.platform.as_ref().unwrap();
        log::info!("platform information:\n{info}");
        Ok(())
    }

    /// Re-reads and decodes the `PLATFORM` register.
    pub fn fetch_platform_info(&mut self) -> Result<()> {
        let raw = self.dm_read(DmReg::Platform)?;
        let info = PlatformInfo::decode(raw)?;
        log::debug!(
            "platform {:#010x}: {} warps x {} threads",
            raw,
            info.total_warps(),
            info.num_threads_per_warp
        );
        self.platform = Some(info);
        Ok(())
    }

    /// Platform info fetched by [`Backend::initialize`].
    pub fn platform_info(&self) -> Result<&PlatformInfo> {
        self.platform
            .as_ref()
            .ok_or_else(|| DebugError::Fault("backend not initialized".to_string()))
    }

    pub(crate) fn check_connected(&self) -> Result<()> {
        if self.transport.is_connected() {
            Ok(())
        } else {
            Err(crate::TransportError::NotConnected.into())
        }
    }

    pub(crate) fn set_misa(&mut self, misa: u32) {
        if let Some(info) = self.platform.as_mut() {
            info.misa = Some(misa);
        }
    }

    //==========================================================================
    // Low-level DM register access
    //==========================================================================

    /// Reads a whole DM register.
    pub fn dm_read(&mut self, reg: DmReg) -> Result<u32> {
        self.check_connected()?;
        let value = self.transport.read_reg(reg.addr()).map_err(|e| {
            log::error!("failed to read DM register {reg}: {e}");
            e
        })?;
        log::debug!("rd DMReg[{:#06x}, {}] => {:#010x}", reg.addr(), reg, value);
        Ok(value)
    }

    /// Writes a whole DM register.
    pub fn dm_write(&mut self, reg: DmReg, value: u32) -> Result<()> {
        self.check_connected()?;
        self.transport.write_reg(reg.addr(), value).map_err(|e| {
            log::error!("failed to write DM register {reg}: {e}");
            e
        })?;
        log::debug!("wr DMReg[{:#06x}, {}] <= {:#010x}", reg.addr(), reg, value);
        Ok(())
    }

    /// Reads a single field out of a DM register.
    pub fn dm_read_field(&mut self, reg: DmReg, field: &str) -> Result<u32> {
        let raw = self.dm_read(reg)?;
        let value = dm::extract(reg, field, raw)?;
        log::trace!("rd DMReg[{reg}.{field}] => {value:#x} (raw {raw:#010x})");
        Ok(value)
    }

    /// Read-modify-writes a single field; all other bits of the register are
    /// preserved.
    pub fn dm_write_field(&mut self, reg: DmReg, field: &str, value: u32) -> Result<()> {
        let old = self.dm_read(reg)?;
        let new = dm::insert(reg, field, old, value)?;
        self.dm_write(reg, new)?;
        log::trace!("wr DMReg[{reg}.{field}] <= {value:#x} (raw {old:#010x} -> {new:#010x})");
        Ok(())
    }

    /// Polls a field until it reads `expected`, with the given (or default)
    /// retry budget. No sleep happens after the last attempt. On exhaustion
    /// the error carries the last observed value.
    pub fn dm_poll_field(
        &mut self,
        reg: DmReg,
        field: &str,
        expected: u32,
        retries: Option<u32>,
        delay: Option<Duration>,
    ) -> Result<u32> {
        let retries = retries.unwrap_or(self.poll_retries);
        let delay = delay.unwrap_or(self.poll_delay);

        let mut last = 0;
        for attempt in 0..retries {
            last = self.dm_read_field(reg, field)?;
            log::trace!(
                "poll DMReg[{reg}.{field}] = {last:#x} (attempt {}/{retries})",
                attempt + 1
            );
            if last == expected {
                return Ok(last);
            }
            if attempt + 1 < retries {
                std::thread::sleep(delay);
            }
        }

        log::error!(
            "poll of {reg}.{field} exhausted {retries} attempts; \
             expected {expected:#x}, last value {last:#x}"
        );
        Err(DebugError::PollTimeout {
            what: format!("{reg}.{field} == {expected:#x}"),
            last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{FakeTransport, TargetModel};

    fn backend() -> Backend {
        let mut b = Backend::new(Box::new(FakeTransport::new(TargetModel::new(1, 1, 4, 1))));
        b.connect(&HashMap::new()).unwrap();
        b
    }

    #[test]
    fn field_write_preserves_the_rest_of_the_register() {
        let mut b = backend();
        b.dm_write(DmReg::Dselect, 0).unwrap();
        b.dm_write_field(DmReg::Dselect, "warpsel", 3).unwrap();
        b.dm_write_field(DmReg::Dselect, "threadsel", 1).unwrap();
        b.dm_write_field(DmReg::Dselect, "winsel", 2).unwrap();

        assert_eq!(b.dm_read_field(DmReg::Dselect, "warpsel").unwrap(), 3);
        assert_eq!(b.dm_read_field(DmReg::Dselect, "threadsel").unwrap(), 1);
        assert_eq!(b.dm_read_field(DmReg::Dselect, "winsel").unwrap(), 2);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let mut b = backend();
        assert_eq!(
            b.dm_read_field(DmReg::Dctrl, "nosuchfield").unwrap_err().code(),
            -4
        );
    }

    #[test]
    fn operations_fail_fast_when_disconnected() {
        let mut b = Backend::new(Box::new(FakeTransport::new(TargetModel::new(1, 1, 1, 0))));
        assert_eq!(b.dm_read(DmReg::Platform).unwrap_err().code(), -7);
        assert_eq!(b.initialize().unwrap_err().code(), -7);
    }

    #[test]
    fn platform_decode_totals() {
        let raw = {
            let mut v = 0;
            v = crate::dm::insert(DmReg::Platform, "platformid", v, 1).unwrap();
            v = crate::dm::insert(DmReg::Platform, "numclusters", v, 2).unwrap();
            v = crate::dm::insert(DmReg::Platform, "numcores", v, 4).unwrap();
            v = crate::dm::insert(DmReg::Platform, "numwarps", v, 8).unwrap();
            crate::dm::insert(DmReg::Platform, "numthreads", v, 5).unwrap()
        };
        let info = PlatformInfo::decode(raw).unwrap();
        assert_eq!(info.platform_name, "Vortex");
        assert_eq!(info.num_threads_per_warp, 32);
        assert_eq!(info.total_cores(), 8);
        assert_eq!(info.total_warps(), 64);
        assert_eq!(info.total_threads(), 2048);
        assert_eq!(info.num_windows(), 2);
    }
}
