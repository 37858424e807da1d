//! GPR and CSR access through instruction injection.
//!
//! Everything funnels through `DSCRATCH`, the one CSR shared between the
//! host and injected code. A GPR access is a single round trip; CSR access
//! needs `t0` as an intermediary, which is saved and restored around the
//! sequence on every exit path.

use crate::dm::DmReg;
use crate::riscv::{self, assembly, CSR_DSCRATCH, CSR_MISA, T0};
use crate::{DebugError, Result};

use super::Backend;

impl Backend {
    /// Reads GPR `x{num}` of the selected warp/thread.
    pub fn read_gpr(&mut self, num: u32) -> Result<u32> {
        self.check_gpr(num)?;
        self.ensure_injectable()?;
        self.read_gpr_raw(num)
    }

    /// Writes GPR `x{num}` of the selected warp/thread. Writes to `x0` are
    /// ignored by the target.
    pub fn write_gpr(&mut self, num: u32, value: u32) -> Result<()> {
        self.check_gpr(num)?;
        self.ensure_injectable()?;
        self.write_gpr_raw(num, value)
    }

    /// Reads the CSR at `addr` of the selected warp/thread.
    pub fn read_csr(&mut self, addr: u32) -> Result<u32> {
        self.ensure_injectable()?;
        let value = self.with_scratch_saved(&[T0], |b| {
            b.inject_raw(assembly::csrr(T0, addr))?;
            b.inject_raw(assembly::csrw(CSR_DSCRATCH, T0))?;
            b.dm_read(DmReg::Dscratch)
        })?;
        if addr == CSR_MISA {
            self.set_misa(value);
        }
        log::debug!("rd CSR[{}] => {value:#010x}", riscv::csr_name(addr));
        Ok(value)
    }

    /// Writes the CSR at `addr` of the selected warp/thread.
    pub fn write_csr(&mut self, addr: u32, value: u32) -> Result<()> {
        self.ensure_injectable()?;
        self.with_scratch_saved(&[T0], |b| {
            b.dm_write(DmReg::Dscratch, value)?;
            b.inject_raw(assembly::csrr(T0, CSR_DSCRATCH))?;
            b.inject_raw(assembly::csrw(addr, T0))
        })?;
        log::debug!("wr CSR[{}] <= {value:#010x}", riscv::csr_name(addr));
        Ok(())
    }

    /// Reads a register by name: a GPR (`x5`), a whitelisted CSR name, or
    /// the pseudo-register `pc`.
    pub fn read_register(&mut self, name: &str) -> Result<u32> {
        if name == "pc" {
            self.ensure_injectable()?;
            let pc = self.dm_read(DmReg::Dpc)?;
            self.selected_pc = pc;
            return Ok(pc);
        }
        if let Some(num) = riscv::gpr_number(name) {
            return self.read_gpr(num);
        }
        if let Some(addr) = riscv::csr_addr(name) {
            return self.read_csr(addr);
        }
        Err(DebugError::InvalidArg(format!("unknown register '{name}'")))
    }

    /// Writes a register by name (see [`Backend::read_register`]).
    pub fn write_register(&mut self, name: &str, value: u32) -> Result<()> {
        if name == "pc" {
            self.ensure_injectable()?;
            self.dm_write(DmReg::Dpc, value)?;
            self.selected_pc = value;
            return Ok(());
        }
        if let Some(num) = riscv::gpr_number(name) {
            return self.write_gpr(num, value);
        }
        if let Some(addr) = riscv::csr_addr(name) {
            return self.write_csr(addr, value);
        }
        Err(DebugError::InvalidArg(format!("unknown register '{name}'")))
    }

    /// Reads a list of registers, one at a time.
    pub fn read_registers(&mut self, names: &[&str]) -> Result<Vec<u32>> {
        names.iter().map(|n| self.read_register(n)).collect()
    }

    /// Writes a list of registers; `names` and `values` must pair up.
    pub fn write_registers(&mut self, names: &[&str], values: &[u32]) -> Result<()> {
        if names.len() != values.len() {
            return Err(DebugError::InvalidArg(format!(
                "{} register names but {} values",
                names.len(),
                values.len()
            )));
        }
        for (name, value) in names.iter().zip(values) {
            self.write_register(name, *value)?;
        }
        Ok(())
    }

    /// Reads and decodes the MISA CSR of the selected warp.
    pub fn isa_string(&mut self, verbose: bool) -> Result<String> {
        let misa = self.read_csr(CSR_MISA)?;
        Ok(riscv::decode_misa(misa, verbose))
    }

    //==========================================================================
    // Injection primitives
    //==========================================================================

    /// One-round-trip GPR read: `csrw dscratch, x[num]`, then read
    /// `DSCRATCH` from the host side.
    pub(crate) fn read_gpr_raw(&mut self, num: u32) -> Result<u32> {
        self.inject_raw(assembly::csrw(CSR_DSCRATCH, num))?;
        self.dm_read(DmReg::Dscratch)
    }

    /// One-round-trip GPR write: host writes `DSCRATCH`, then
    /// `csrr x[num], dscratch`.
    pub(crate) fn write_gpr_raw(&mut self, num: u32, value: u32) -> Result<()> {
        self.dm_write(DmReg::Dscratch, value)?;
        self.inject_raw(assembly::csrr(num, CSR_DSCRATCH))
    }

    /// Runs `body` with the given scratch GPRs saved, restoring them on
    /// every exit path. A restore failure surfaces only when the body
    /// itself succeeded.
    pub(crate) fn with_scratch_saved<T>(
        &mut self,
        regs: &[u32],
        body: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut saved = Vec::with_capacity(regs.len());
        for &reg in regs {
            saved.push((reg, self.read_gpr_raw(reg)?));
        }

        let result = body(self);

        let mut restore_err = None;
        for &(reg, value) in saved.iter().rev() {
            if let Err(e) = self.write_gpr_raw(reg, value) {
                log::error!("failed to restore scratch register x{reg}: {e}");
                restore_err.get_or_insert(e);
            }
        }

        match (result, restore_err) {
            (Err(e), _) => Err(e),
            (Ok(_), Some(e)) => Err(e),
            (Ok(v), None) => Ok(v),
        }
    }

    fn check_gpr(&self, num: u32) -> Result<()> {
        if num >= 32 {
            return Err(DebugError::InvalidArg(format!(
                "GPR number {num} out of range"
            )));
        }
        Ok(())
    }
}
