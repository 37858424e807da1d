//! Software breakpoints.
//!
//! A breakpoint replaces the instruction word at its address with `ebreak`
//! and remembers the original word so removal can restore it. While a
//! breakpoint is enabled the memory at its address holds the `ebreak`
//! encoding; breakpoints survive platform resets until explicitly removed.

use crate::dm::{DmReg, HaltCause};
use crate::riscv::assembly;
use crate::{DebugError, Result};

use super::Backend;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u32,
    pub enabled: bool,
    /// The pre-patch instruction word.
    pub replaced_instr: u32,
    pub hit_count: u32,
}

impl Backend {
    /// Installs a software breakpoint at `addr` (word aligned). Installing
    /// on top of an enabled breakpoint is a no-op.
    pub fn set_breakpoint(&mut self, addr: u32) -> Result<()> {
        if addr % 4 != 0 {
            return Err(DebugError::InvalidArg(format!(
                "breakpoint address {addr:#010x} is not word aligned"
            )));
        }
        if self.breakpoints.get(&addr).map(|b| b.enabled) == Some(true) {
            log::debug!("breakpoint at {addr:#010x} already set");
            return Ok(());
        }

        let replaced_instr = self.read_mem_word(addr)?;
        self.write_mem(addr, &assembly::EBREAK.to_le_bytes())?;
        self.breakpoints.insert(
            addr,
            Breakpoint {
                addr,
                enabled: true,
                replaced_instr,
                hit_count: 0,
            },
        );
        log::info!("breakpoint set at {addr:#010x} (replaced {replaced_instr:#010x})");
        Ok(())
    }

    /// Removes the breakpoint at `addr`, restoring the original word.
    pub fn remove_breakpoint(&mut self, addr: u32) -> Result<()> {
        let bp = self
            .breakpoints
            .get(&addr)
            .cloned()
            .ok_or_else(|| DebugError::InvalidArg(format!("no breakpoint at {addr:#010x}")))?;

        if bp.enabled {
            self.write_mem(addr, &bp.replaced_instr.to_le_bytes())?;
        }
        self.breakpoints.remove(&addr);
        log::info!("breakpoint removed from {addr:#010x}");
        Ok(())
    }

    /// Snapshot of the breakpoint table.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.values().cloned().collect()
    }

    pub fn has_breakpoints(&self) -> bool {
        !self.breakpoints.is_empty()
    }

    /// Records a hit on the breakpoint at `pc`, if one is installed there.
    pub fn note_breakpoint_hit(&mut self, pc: u32) {
        if let Some(bp) = self.breakpoints.get_mut(&pc) {
            bp.hit_count += 1;
            log::info!("breakpoint at {pc:#010x} hit ({} time(s))", bp.hit_count);
        }
    }

    /// Resumes the selected warp and waits until some warp halts on an
    /// `ebreak`. Returns the id of the first such warp; with `auto_select`
    /// it also becomes the current selection (thread 0).
    pub fn continue_until_breakpoint(&mut self, auto_select: bool) -> Result<u32> {
        let (wid, _) = self.selection.ok_or(DebugError::NoneSelected)?;
        self.resume_warps(&[wid])?;
        self.wait_for_breakpoint(auto_select)
    }

    /// Waits for any warp to halt with `hacause == Ebreak` and bumps its
    /// breakpoint's hit count.
    pub fn wait_for_breakpoint(&mut self, auto_select: bool) -> Result<u32> {
        self.dm_poll_field(DmReg::Dctrl, "anyhalted", 1, None, None)?;

        let status = self.warp_status(true, true)?;
        let hit = status
            .values()
            .find(|s| s.active && s.halted && s.hacause == Some(HaltCause::Ebreak))
            .ok_or_else(|| {
                DebugError::Fault("a warp halted, but not on a breakpoint".to_string())
            })?;
        let (wid, pc) = (hit.wid, hit.pc.unwrap_or(0));

        if let Some(bp) = self.breakpoints.get_mut(&pc) {
            bp.hit_count += 1;
            log::info!(
                "breakpoint at {pc:#010x} hit by warp {wid} ({} time(s))",
                bp.hit_count
            );
        } else {
            log::warn!("warp {wid} stopped on an ebreak at {pc:#010x} with no breakpoint entry");
        }

        if auto_select {
            self.select_warp_thread(wid, 0)?;
        }
        Ok(wid)
    }
}
