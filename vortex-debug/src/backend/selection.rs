//! Warp/thread selection and status queries.
//!
//! The DM exposes warps in 32-wide windows addressed through
//! `DSELECT.winsel`; bulk operations write one `WMASK` per window. Per-warp
//! operations act on the single warp/thread named by `DSELECT.warpsel` /
//! `DSELECT.threadsel`.

use std::collections::BTreeMap;

use crate::dm::{DmReg, HaltCause};
use crate::{DebugError, Result};

use super::Backend;

/// Status of one warp. `pc` and `hacause` are only meaningful while the
/// warp is active and halted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpStatus {
    pub wid: u32,
    pub active: bool,
    pub halted: bool,
    pub pc: Option<u32>,
    pub hacause: Option<HaltCause>,
}

/// Six booleans decoded from a single `DCTRL` read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarpSummary {
    pub all_halted: bool,
    pub any_halted: bool,
    pub all_running: bool,
    pub any_running: bool,
    pub all_unavail: bool,
    pub any_unavail: bool,
}

impl Backend {
    /// Selects exactly the given warps for bulk operations. Out-of-range ids
    /// are warned about and skipped.
    pub fn select_warps(&mut self, wids: &[u32]) -> Result<()> {
        let total = self.platform_info()?.total_warps();
        let num_windows = self.platform_info()?.num_windows();

        let mut masks = vec![0u32; num_windows as usize];
        let mut selected = 0;
        for &wid in wids {
            if wid >= total {
                log::warn!("ignoring invalid warp ID {wid} (total {total})");
                continue;
            }
            masks[(wid / 32) as usize] |= 1 << (wid % 32);
            selected += 1;
        }

        for (win, mask) in masks.iter().enumerate() {
            self.dm_write_field(DmReg::Dselect, "winsel", win as u32)?;
            self.dm_write_field(DmReg::Wmask, "mask", *mask)?;
        }
        log::debug!("selected {selected} warps");
        Ok(())
    }

    /// Selects every warp (`all = true`) or none (`all = false`).
    pub fn select_all_warps(&mut self, all: bool) -> Result<()> {
        let num_windows = self.platform_info()?.num_windows();
        let mask = if all { 0xFFFF_FFFF } else { 0 };
        for win in 0..num_windows {
            self.dm_write_field(DmReg::Dselect, "winsel", win)?;
            self.dm_write_field(DmReg::Wmask, "mask", mask)?;
        }
        Ok(())
    }

    /// Selects one warp/thread for per-warp operations and refreshes the PC
    /// cache.
    pub fn select_warp_thread(&mut self, wid: u32, tid: u32) -> Result<()> {
        let info = self.platform_info()?;
        if wid >= info.total_warps() {
            return Err(DebugError::InvalidArg(format!(
                "warp ID {wid} out of range (total {})",
                info.total_warps()
            )));
        }
        if tid >= info.num_threads_per_warp {
            return Err(DebugError::InvalidArg(format!(
                "thread ID {tid} out of range ({} threads/warp)",
                info.num_threads_per_warp
            )));
        }

        self.write_selection(wid, tid)?;
        self.selection = Some((wid, tid));
        self.selected_pc = self.dm_read(DmReg::Dpc)?;
        log::info!("selected warp {wid}, thread {tid} (pc {:#010x})", self.selected_pc);
        Ok(())
    }

    /// Device write only; does not touch the cache. Used by status scans
    /// that restore the user's selection afterwards.
    pub(crate) fn write_selection(&mut self, wid: u32, tid: u32) -> Result<()> {
        self.dm_write_field(DmReg::Dselect, "warpsel", wid)?;
        self.dm_write_field(DmReg::Dselect, "threadsel", tid)?;
        Ok(())
    }

    /// The selected `(warp, thread)` pair. With `force_fetch` the cache is
    /// refreshed from `DSELECT` first.
    pub fn selected_warp_thread(&mut self, force_fetch: bool) -> Result<Option<(u32, u32)>> {
        if force_fetch {
            let wid = self.dm_read_field(DmReg::Dselect, "warpsel")?;
            let tid = self.dm_read_field(DmReg::Dselect, "threadsel")?;
            if self.selection.is_some() {
                self.selection = Some((wid, tid));
            }
        }
        Ok(self.selection)
    }

    /// Cached PC of the selected warp, optionally re-read from `DPC`.
    pub fn selected_warp_pc(&mut self, force_fetch: bool) -> Result<u32> {
        if self.selection.is_none() {
            return Err(DebugError::NoneSelected);
        }
        if force_fetch {
            self.selected_pc = self.dm_read(DmReg::Dpc)?;
        }
        Ok(self.selected_pc)
    }

    /// Status of every warp. Temporarily retargets the selection to fetch
    /// PC/hacause of halted warps, then restores the previous selection
    /// even if the scan fails half way.
    pub fn warp_status(
        &mut self,
        include_pc: bool,
        include_hacause: bool,
    ) -> Result<BTreeMap<u32, WarpStatus>> {
        let prev = self.selection;
        let result = self.warp_status_scan(include_pc, include_hacause);

        // Put the user's selection back on the device on all paths.
        let restored = match prev {
            Some((wid, tid)) => self.write_selection(wid, tid),
            None => Ok(()),
        };
        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => {
                log::error!("failed to restore warp selection after status scan: {e}");
                Err(e)
            }
            (Ok(map), Ok(())) => Ok(map),
        }
    }

    fn warp_status_scan(
        &mut self,
        include_pc: bool,
        include_hacause: bool,
    ) -> Result<BTreeMap<u32, WarpStatus>> {
        let info = self.platform_info()?;
        let total = info.total_warps();
        let num_windows = info.num_windows();

        let mut map = BTreeMap::new();
        for win in 0..num_windows {
            self.dm_write_field(DmReg::Dselect, "winsel", win)?;
            let active = self.dm_read(DmReg::Wactive)?;
            let halted = self.dm_read(DmReg::Wstatus)?;

            for bit in 0..32 {
                let wid = win * 32 + bit;
                if wid >= total {
                    break;
                }
                let mut status = WarpStatus {
                    wid,
                    active: active & (1 << bit) != 0,
                    halted: halted & (1 << bit) != 0,
                    pc: None,
                    hacause: None,
                };

                if status.active && status.halted && (include_pc || include_hacause) {
                    self.write_selection(wid, 0)?;
                    if include_pc {
                        status.pc = Some(self.dm_read(DmReg::Dpc)?);
                    }
                    if include_hacause {
                        let cause = self.dm_read_field(DmReg::Dctrl, "hacause")?;
                        status.hacause = Some(HaltCause::from(cause));
                    }
                }
                map.insert(wid, status);
            }
        }
        Ok(map)
    }

    /// All/any halted/running/unavailable, from one `DCTRL` read.
    pub fn warp_summary(&mut self) -> Result<WarpSummary> {
        let dctrl = self.dm_read(DmReg::Dctrl)?;
        let bit = |field: &str| -> Result<bool> {
            Ok(crate::dm::extract(DmReg::Dctrl, field, dctrl)? != 0)
        };
        Ok(WarpSummary {
            all_halted: bit("allhalted")?,
            any_halted: bit("anyhalted")?,
            all_running: bit("allrunning")?,
            any_running: bit("anyrunning")?,
            all_unavail: bit("allunavail")?,
            any_unavail: bit("anyunavail")?,
        })
    }

    /// Whether warp `wid` is halted, from the one window containing it.
    pub fn warp_state(&mut self, wid: u32) -> Result<bool> {
        let total = self.platform_info()?.total_warps();
        if wid >= total {
            return Err(DebugError::InvalidArg(format!(
                "warp ID {wid} out of range (total {total})"
            )));
        }
        self.dm_write_field(DmReg::Dselect, "winsel", wid / 32)?;
        let halted = self.dm_read(DmReg::Wstatus)?;
        Ok(halted & (1 << (wid % 32)) != 0)
    }

    /// Whether warp `wid` is active and halted.
    pub(crate) fn warp_window_state(&mut self, wid: u32) -> Result<(bool, bool)> {
        self.dm_write_field(DmReg::Dselect, "winsel", wid / 32)?;
        let active = self.dm_read(DmReg::Wactive)?;
        let halted = self.dm_read(DmReg::Wstatus)?;
        let bit = 1 << (wid % 32);
        Ok((active & bit != 0, halted & bit != 0))
    }
}
