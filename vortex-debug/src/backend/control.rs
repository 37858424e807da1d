//! DM wakeup, platform reset, warp halt/resume/step and instruction
//! injection.

use crate::dm::DmReg;
use crate::riscv::asm;
use crate::{DebugError, Result};

use super::Backend;

/// Outer attempts at waking an inactive DM.
const WAKE_DM_ATTEMPTS: u32 = 3;

impl Backend {
    /// Wakes up the Debug Module.
    ///
    /// Waits for a pending `ndmreset` to clear, then repeatedly asserts
    /// `dmactive` until the DM reports it.
    pub fn wake_dm(&mut self) -> Result<()> {
        let ndmreset = self.dm_read_field(DmReg::Dctrl, "ndmreset")?;
        if ndmreset != 0 {
            log::debug!("waiting for DCTRL.ndmreset to clear");
            self.dm_poll_field(DmReg::Dctrl, "ndmreset", 0, None, None)?;
        }

        let mut dmactive = self.dm_read_field(DmReg::Dctrl, "dmactive")?;
        if dmactive == 0 {
            log::debug!("DM not active, asserting DCTRL.dmactive");
            for attempt in 0..WAKE_DM_ATTEMPTS {
                self.dm_write_field(DmReg::Dctrl, "dmactive", 1)?;
                match self.dm_poll_field(DmReg::Dctrl, "dmactive", 1, None, None) {
                    Ok(v) => {
                        dmactive = v;
                        break;
                    }
                    Err(DebugError::PollTimeout { last, .. }) => {
                        log::warn!(
                            "DM did not report dmactive (attempt {}/{WAKE_DM_ATTEMPTS})",
                            attempt + 1
                        );
                        dmactive = last;
                    }
                    Err(e) => return Err(e),
                }
            }
            if dmactive == 0 {
                return Err(DebugError::Fault(
                    "debug module failed to activate".to_string(),
                ));
            }
        }
        log::debug!("DM is awake");
        Ok(())
    }

    /// Resets the target system. With `halt`, every warp is requested to
    /// halt coming out of reset. Re-initializes the backend afterwards.
    pub fn reset_platform(&mut self, halt: bool) -> Result<()> {
        log::info!("issuing system reset");
        if halt {
            log::debug!("selecting all warps to halt after reset");
            self.select_all_warps(true)?;
            self.dm_write_field(DmReg::Dctrl, "resethaltreq", 1)?;
        }

        self.dm_write_field(DmReg::Dctrl, "ndmreset", 1)?;

        // ndmreset self-clears when the reset sequence completes.
        log::debug!("waiting for DCTRL.ndmreset to clear");
        self.dm_poll_field(DmReg::Dctrl, "ndmreset", 0, None, None)?;

        if halt {
            let summary = self.warp_summary()?;
            if summary.all_halted {
                log::info!("all warps halted after reset");
            } else if summary.any_halted {
                log::warn!("some warps halted after reset, but not all");
            } else {
                log::error!("no warps halted after reset");
            }
        }

        log::info!("system reset complete");
        self.selection = None;
        self.initialize()
    }

    /// Halts the given warps, then verifies each one.
    pub fn halt_warps(&mut self, wids: &[u32]) -> Result<()> {
        self.select_warps(wids)?;
        self.dm_write_field(DmReg::Dctrl, "haltreq", 1)?;

        let total = self.platform_info()?.total_warps();
        let mut failed = Vec::new();
        for &wid in wids.iter().filter(|&&w| w < total) {
            if !self.warp_state(wid)? {
                failed.push(wid);
            }
        }
        if !failed.is_empty() {
            log::error!("warps failed to halt: {failed:?}");
            return Err(DebugError::Fault(format!(
                "{} warp(s) did not halt: {failed:?}",
                failed.len()
            )));
        }
        log::info!("halted {} warp(s)", wids.len());
        Ok(())
    }

    /// Halts every warp and waits for `allhalted`.
    pub fn halt_all_warps(&mut self) -> Result<()> {
        self.select_all_warps(true)?;
        self.dm_write_field(DmReg::Dctrl, "haltreq", 1)?;
        self.dm_poll_field(DmReg::Dctrl, "allhalted", 1, None, None)?;
        log::info!("all warps halted");
        Ok(())
    }

    /// Resumes the given warps, then verifies each one.
    pub fn resume_warps(&mut self, wids: &[u32]) -> Result<()> {
        self.select_warps(wids)?;
        self.dm_write_field(DmReg::Dctrl, "resumereq", 1)?;

        let total = self.platform_info()?.total_warps();
        let mut failed = Vec::new();
        for &wid in wids.iter().filter(|&&w| w < total) {
            if self.warp_state(wid)? {
                failed.push(wid);
            }
        }
        if !failed.is_empty() {
            log::error!("warps failed to resume: {failed:?}");
            return Err(DebugError::Fault(format!(
                "{} warp(s) did not resume: {failed:?}",
                failed.len()
            )));
        }
        log::info!("resumed {} warp(s)", wids.len());
        Ok(())
    }

    /// Resumes every warp and waits for `allrunning`.
    pub fn resume_all_warps(&mut self) -> Result<()> {
        self.select_all_warps(true)?;
        self.dm_write_field(DmReg::Dctrl, "resumereq", 1)?;
        self.dm_poll_field(DmReg::Dctrl, "allrunning", 1, None, None)?;
        log::info!("all warps running");
        Ok(())
    }

    /// Single-steps the selected warp/thread and refreshes the PC cache.
    pub fn step_warp(&mut self) -> Result<()> {
        let (wid, tid) = self.selection.ok_or(DebugError::NoneSelected)?;

        let summary = self.warp_summary()?;
        if summary.all_halted {
            // Stepping one warp while every other warp is halted can
            // deadlock workloads that synchronize at barriers.
            log::warn!("stepping warp {wid} while all warps are halted");
        }

        self.dm_write_field(DmReg::Dctrl, "stepreq", 1)?;
        self.dm_poll_field(DmReg::Dctrl, "stepstate", 0, None, None)?;

        self.selected_pc = self.dm_read(DmReg::Dpc)?;
        log::info!(
            "stepped warp {wid} thread {tid}, pc now {:#010x}",
            self.selected_pc
        );
        Ok(())
    }

    //==========================================================================
    // Instruction injection
    //==========================================================================

    /// Injects one instruction word onto the selected warp/thread.
    pub fn inject(&mut self, instruction: u32) -> Result<()> {
        self.ensure_injectable()?;
        self.inject_raw(instruction)
    }

    /// Injects one line of assembly, encoded through the external assembler
    /// (cached per line).
    pub fn inject_asm(&mut self, line: &str) -> Result<()> {
        let word = asm::assemble_line(line, self.toolchain_prefix())?;
        self.inject(word)
    }

    /// Injection without the selection/halt precondition checks; callers in
    /// the state-access loops verify once up front.
    pub(crate) fn inject_raw(&mut self, instruction: u32) -> Result<()> {
        self.dm_write(DmReg::Dinject, instruction)?;
        self.dm_write_field(DmReg::Dctrl, "injectreq", 1)?;

        match self.dm_poll_field(DmReg::Dctrl, "injectstate", 0, None, None) {
            Ok(_) => Ok(()),
            Err(DebugError::PollTimeout { last, .. }) if last > 1 => {
                log::error!("injection of {instruction:#010x} faulted (injectstate={last})");
                Err(DebugError::Fault(format!(
                    "injection fault for instruction {instruction:#010x} (injectstate={last})"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Checks that a warp/thread is selected and the warp is active and
    /// halted, the precondition for injection and per-warp state access.
    pub(crate) fn ensure_injectable(&mut self) -> Result<u32> {
        let (wid, _) = self.selection.ok_or(DebugError::NoneSelected)?;
        let (active, halted) = self.warp_window_state(wid)?;
        if !active || !halted {
            return Err(DebugError::WarpNotHalted(wid));
        }
        Ok(wid)
    }
}
