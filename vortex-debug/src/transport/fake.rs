//! An in-process stand-in for the remote debug server.
//!
//! [`FakeTransport`] speaks the same line protocol as the TCP transport but
//! terminates it in a software model of the target: the DM register file, a
//! set of warps with per-warp GPR/CSR state, a sparse word-addressed memory
//! and an interpreter for the handful of instructions the backend injects
//! (`lw`, `sw`, `addi`, `csrrw`, `csrrs`). Tests hold a handle to the
//! [`TargetModel`] so they can seed state, flip fault knobs and inspect the
//! access log while the backend owns the transport.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Transport, TransportError, TransportResult};
use crate::dm::{self, DmReg};
use crate::riscv::CSR_DSCRATCH;

/// One DM register access, as observed by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read(u32),
    Write(u32, u32),
}

#[derive(Debug, Clone)]
pub struct FakeWarp {
    pub active: bool,
    pub halted: bool,
    pub pc: u32,
    pub hacause: u32,
    pub gprs: [u32; 32],
    pub csrs: HashMap<u32, u32>,
}

impl FakeWarp {
    fn new(active: bool) -> Self {
        FakeWarp {
            active,
            halted: false,
            pc: 0,
            hacause: 0,
            gprs: [0; 32],
            csrs: HashMap::new(),
        }
    }
}

/// Software model of the DM plus target state.
pub struct TargetModel {
    pub warps: Vec<FakeWarp>,
    pub threads_per_warp: u32,
    /// Word-addressed sparse memory.
    pub mem: BTreeMap<u32, u32>,

    platform: u32,
    dconfig: u32,
    dselect: u32,
    wmask: Vec<u32>,
    dinject: u32,
    dscratch: u32,

    dmactive: bool,
    ndmreset: bool,
    resethaltreq: bool,
    injectstate: u32,

    /// Keep `ndmreset` asserted forever (poll-exhaustion tests).
    pub stuck_ndmreset: bool,
    /// Report an injection fault instead of executing.
    pub fail_inject: bool,
    /// Ignore halt requests (warps never report halted).
    pub ignore_haltreq: bool,

    /// Breakpoint hits scheduled by a resume. Each carries a fuse counting
    /// down on status reads, so the host observes the warp running briefly
    /// before it halts on the `ebreak`.
    pending_bp: Vec<(usize, u32, u32)>,

    /// Every DM access in order.
    pub log: Vec<Access>,
}

impl TargetModel {
    /// Builds a model for `clusters x cores x warps` with `2^threads_log2`
    /// threads per warp; every warp starts active and running.
    pub fn new(clusters: u32, cores: u32, warps_per_core: u32, threads_log2: u32) -> Self {
        let platform = compose_platform(1, clusters, cores, warps_per_core, threads_log2);
        let total_warps = clusters * cores * warps_per_core;
        let num_windows = (total_warps as usize).div_ceil(32);
        TargetModel {
            warps: (0..total_warps).map(|_| FakeWarp::new(true)).collect(),
            threads_per_warp: 1 << threads_log2,
            mem: BTreeMap::new(),
            platform,
            dconfig: 0,
            dselect: 0,
            wmask: vec![0; num_windows.max(1)],
            dinject: 0,
            dscratch: 0,
            dmactive: true,
            ndmreset: false,
            resethaltreq: false,
            injectstate: 0,
            stuck_ndmreset: false,
            fail_inject: false,
            ignore_haltreq: false,
            pending_bp: Vec::new(),
            log: Vec::new(),
        }
    }

    pub fn dmactive(&mut self, active: bool) {
        self.dmactive = active;
    }

    pub fn assert_ndmreset(&mut self) {
        self.ndmreset = true;
    }

    /// Little-endian bytes of the word containing `addr`.
    pub fn mem_word(&self, addr: u32) -> u32 {
        self.mem.get(&(addr & !3)).copied().unwrap_or(0)
    }

    pub fn set_mem_word(&mut self, addr: u32, value: u32) {
        self.mem.insert(addr & !3, value);
    }

    pub fn mem_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                let a = addr + i;
                (self.mem_word(a) >> ((a % 4) * 8)) as u8
            })
            .collect()
    }

    /// Number of DM reads of `reg` seen so far.
    pub fn read_count(&self, reg: DmReg) -> usize {
        self.log
            .iter()
            .filter(|a| matches!(a, Access::Read(addr) if *addr == reg.addr()))
            .count()
    }

    /// DCTRL writes that had the given single-bit field set.
    pub fn dctrl_writes_with(&self, field: &str) -> usize {
        let mask = dm::field_info(DmReg::Dctrl, field).unwrap().mask();
        self.log
            .iter()
            .filter(|a| matches!(a, Access::Write(addr, v) if *addr == DmReg::Dctrl.addr() && v & mask != 0))
            .count()
    }

    fn selected_warp(&self) -> usize {
        ((self.dselect >> 7) & 0x7FFF) as usize
    }

    fn winsel(&self) -> usize {
        (self.dselect >> 22) as usize
    }

    /// Warps selected through the window masks.
    fn masked_warps(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (w, mask) in self.wmask.iter().enumerate() {
            for bit in 0..32 {
                let wid = w * 32 + bit;
                if wid < self.warps.len() && mask & (1 << bit) != 0 {
                    out.push(wid);
                }
            }
        }
        out
    }

    fn read(&mut self, addr: u32) -> Option<u32> {
        self.log.push(Access::Read(addr));
        let value = match addr {
            0x00 => self.platform,
            0x01 => self.dconfig,
            0x02 => self.dselect,
            0x03 => *self.wmask.get(self.winsel())?,
            0x04 => self.window_bitmap(|w| w.active),
            0x05 => {
                self.tick_pending_breakpoints();
                self.window_bitmap(|w| w.halted)
            }
            0x06 => {
                self.tick_pending_breakpoints();
                self.dctrl()
            }
            0x07 => {
                let wid = self.selected_warp();
                self.warps.get(wid)?.pc
            }
            0x08 => self.dinject,
            0x09 => self.dscratch,
            _ => return None,
        };
        Some(value)
    }

    fn write(&mut self, addr: u32, value: u32) -> Option<()> {
        self.log.push(Access::Write(addr, value));
        match addr {
            0x01 => self.dconfig = value,
            0x02 => self.dselect = value,
            0x03 => {
                let win = self.winsel();
                *self.wmask.get_mut(win)? = value;
            }
            0x06 => self.write_dctrl(value),
            0x07 => {
                let wid = self.selected_warp();
                self.warps.get_mut(wid)?.pc = value;
            }
            0x08 => self.dinject = value,
            0x09 => self.dscratch = value,
            _ => return None,
        }
        Some(())
    }

    fn window_bitmap(&self, pred: impl Fn(&FakeWarp) -> bool) -> u32 {
        let base = self.winsel() * 32;
        let mut bits = 0u32;
        for i in 0..32 {
            if let Some(warp) = self.warps.get(base + i) {
                if pred(warp) {
                    bits |= 1 << i;
                }
            }
        }
        bits
    }

    fn dctrl(&self) -> u32 {
        let active: Vec<&FakeWarp> = self.warps.iter().filter(|w| w.active).collect();
        let allhalted = !active.is_empty() && active.iter().all(|w| w.halted);
        let anyhalted = active.iter().any(|w| w.halted);
        let allrunning = !active.is_empty() && active.iter().all(|w| !w.halted);
        let anyrunning = active.iter().any(|w| !w.halted);
        let allunavail = self.warps.iter().all(|w| !w.active);
        let anyunavail = self.warps.iter().any(|w| !w.active);
        let hacause = self
            .warps
            .get(self.selected_warp())
            .map(|w| w.hacause)
            .unwrap_or(0);

        (self.dmactive as u32) << 31
            | (self.ndmreset as u32) << 30
            | (allhalted as u32) << 29
            | (anyhalted as u32) << 28
            | (allrunning as u32) << 27
            | (anyrunning as u32) << 26
            | (allunavail as u32) << 25
            | (anyunavail as u32) << 24
            | (hacause & 0x7) << 9
            | (self.injectstate & 0x3) << 7
            | (self.resethaltreq as u32) << 2
    }

    fn write_dctrl(&mut self, value: u32) {
        // Bits 31 (dmactive) and 2 (resethaltreq) are sticky; the request
        // bits act on write and read back as zero.
        self.dmactive = value & (1 << 31) != 0;
        if value & (1 << 2) != 0 {
            self.resethaltreq = true;
        }

        if value & (1 << 30) != 0 {
            // ndmreset
            if self.stuck_ndmreset {
                self.ndmreset = true;
            } else {
                self.reset_platform();
            }
        }
        if value & 1 != 0 && !self.ignore_haltreq {
            // haltreq
            for wid in self.masked_warps() {
                let warp = &mut self.warps[wid];
                if warp.active {
                    warp.halted = true;
                    warp.hacause = 2;
                }
            }
        }
        if value & (1 << 1) != 0 {
            // resumereq: resumed warps run until the next ebreak word at or
            // after their PC, if any.
            for wid in self.masked_warps() {
                let warp = &mut self.warps[wid];
                if !warp.active {
                    continue;
                }
                warp.halted = false;
                warp.hacause = 0;
                let pc = warp.pc;
                if let Some(addr) = self.next_ebreak_at_or_after(pc) {
                    self.pending_bp.push((wid, addr, 2));
                }
            }
        }
        if value & (1 << 3) != 0 {
            // stepreq: one instruction on the selected warp; the model just
            // advances the PC.
            let wid = self.selected_warp();
            if let Some(warp) = self.warps.get_mut(wid) {
                if warp.halted {
                    warp.pc = warp.pc.wrapping_add(4);
                    warp.hacause = 3;
                }
            }
        }
        if value & (1 << 6) != 0 {
            // injectreq
            self.injectstate = 0;
            if self.fail_inject {
                self.injectstate = 2;
            } else {
                let instr = self.dinject;
                self.execute(instr);
            }
        }
    }

    fn next_ebreak_at_or_after(&self, pc: u32) -> Option<u32> {
        self.mem
            .range((pc & !3)..)
            .find(|(_, &w)| w == crate::riscv::assembly::EBREAK)
            .map(|(&a, _)| a)
    }

    fn tick_pending_breakpoints(&mut self) {
        let mut remaining = Vec::new();
        for (wid, addr, fuse) in std::mem::take(&mut self.pending_bp) {
            if fuse > 1 {
                remaining.push((wid, addr, fuse - 1));
            } else if let Some(warp) = self.warps.get_mut(wid) {
                warp.halted = true;
                warp.hacause = 1;
                warp.pc = addr;
            }
        }
        self.pending_bp = remaining;
    }

    fn reset_platform(&mut self) {
        let halt = self.resethaltreq;
        let selected = self.masked_warps();
        for (wid, warp) in self.warps.iter_mut().enumerate() {
            warp.pc = 0;
            warp.gprs = [0; 32];
            if halt && selected.contains(&wid) {
                warp.halted = true;
                warp.hacause = 4;
            } else {
                warp.halted = false;
                warp.hacause = 0;
            }
        }
        self.resethaltreq = false;
        self.ndmreset = false;
    }

    /// Executes one injected instruction on the selected warp.
    fn execute(&mut self, instr: u32) {
        let wid = self.selected_warp();
        if wid >= self.warps.len() {
            self.injectstate = 2;
            return;
        }

        let opcode = instr & 0x7F;
        let rd = ((instr >> 7) & 0x1F) as usize;
        let funct3 = (instr >> 12) & 0x7;
        let rs1 = ((instr >> 15) & 0x1F) as usize;
        let rs2 = ((instr >> 20) & 0x1F) as usize;
        let imm_i = (instr as i32) >> 20;
        let imm_s = (((instr as i32) >> 25) << 5) | ((instr >> 7) & 0x1F) as i32;
        let csr = instr >> 20;

        let mut fault = false;
        match (opcode, funct3) {
            (0x13, 0) => {
                // addi
                let v = self.warps[wid].gprs[rs1].wrapping_add(imm_i as u32);
                self.set_gpr(wid, rd, v);
            }
            (0x03, 2) => {
                // lw
                let addr = self.warps[wid].gprs[rs1].wrapping_add(imm_i as u32);
                let v = self.mem_word(addr);
                self.set_gpr(wid, rd, v);
            }
            (0x23, 2) => {
                // sw
                let addr = self.warps[wid].gprs[rs1].wrapping_add(imm_s as u32);
                let v = self.warps[wid].gprs[rs2];
                self.set_mem_word(addr, v);
            }
            (0x73, 1) => {
                // csrrw
                let old = self.csr_read(wid, csr);
                let new = self.warps[wid].gprs[rs1];
                self.csr_write(wid, csr, new);
                if rd != 0 {
                    self.set_gpr(wid, rd, old);
                }
            }
            (0x73, 2) => {
                // csrrs
                let old = self.csr_read(wid, csr);
                if rs1 != 0 {
                    let set = self.warps[wid].gprs[rs1];
                    self.csr_write(wid, csr, old | set);
                }
                self.set_gpr(wid, rd, old);
            }
            _ => fault = true,
        }
        self.injectstate = if fault { 2 } else { 0 };
    }

    fn set_gpr(&mut self, wid: usize, rd: usize, value: u32) {
        if rd != 0 {
            self.warps[wid].gprs[rd] = value;
        }
    }

    fn csr_read(&self, wid: usize, csr: u32) -> u32 {
        if csr == CSR_DSCRATCH {
            self.dscratch
        } else {
            self.warps[wid].csrs.get(&csr).copied().unwrap_or(0)
        }
    }

    fn csr_write(&mut self, wid: usize, csr: u32, value: u32) {
        if csr == CSR_DSCRATCH {
            self.dscratch = value;
        } else {
            self.warps[wid].csrs.insert(csr, value);
        }
    }

    /// Serves one protocol request line, returning the reply line.
    fn serve(&mut self, line: &str) -> String {
        if line == "p" {
            return "+P".to_string();
        }
        if let Some(rest) = line.strip_prefix('r') {
            return match u32::from_str_radix(rest, 16).ok().and_then(|a| self.read(a)) {
                Some(v) => format!("+{v:08x}"),
                None => "-".to_string(),
            };
        }
        if let Some(rest) = line.strip_prefix('w') {
            let result = rest.split_once(':').and_then(|(a, v)| {
                let addr = u32::from_str_radix(a, 16).ok()?;
                let value = u32::from_str_radix(v, 16).ok()?;
                self.write(addr, value)
            });
            return match result {
                Some(()) => "+".to_string(),
                None => "-".to_string(),
            };
        }
        if let Some(rest) = line.strip_prefix('R') {
            let mut values = Vec::new();
            for tok in rest.split(',') {
                match u32::from_str_radix(tok, 16).ok().and_then(|a| self.read(a)) {
                    Some(v) => values.push(format!("{v:08x}")),
                    None => return "-".to_string(),
                }
            }
            return format!("+{}", values.join(","));
        }
        if let Some(rest) = line.strip_prefix('W') {
            let Some((addrs, vals)) = rest.split_once(';') else {
                return "-".to_string();
            };
            let addrs: Option<Vec<u32>> = addrs
                .split(',')
                .map(|t| u32::from_str_radix(t, 16).ok())
                .collect();
            let vals: Option<Vec<u32>> = vals
                .split(',')
                .map(|t| u32::from_str_radix(t, 16).ok())
                .collect();
            let (Some(addrs), Some(vals)) = (addrs, vals) else {
                return "-".to_string();
            };
            if addrs.len() != vals.len() {
                return "-".to_string();
            }
            for (a, v) in addrs.iter().zip(&vals) {
                if self.write(*a, *v).is_none() {
                    return "-".to_string();
                }
            }
            return "+".to_string();
        }
        "-".to_string()
    }
}

fn compose_platform(id: u32, clusters: u32, cores: u32, warps: u32, threads_log2: u32) -> u32 {
    let mut v = 0;
    v = dm::insert(DmReg::Platform, "platformid", v, id).unwrap();
    v = dm::insert(DmReg::Platform, "numclusters", v, clusters).unwrap();
    v = dm::insert(DmReg::Platform, "numcores", v, cores).unwrap();
    v = dm::insert(DmReg::Platform, "numwarps", v, warps).unwrap();
    dm::insert(DmReg::Platform, "numthreads", v, threads_log2).unwrap()
}

/// Transport backed by an in-process [`TargetModel`].
pub struct FakeTransport {
    model: Arc<Mutex<TargetModel>>,
    replies: VecDeque<String>,
    connected: bool,
}

impl FakeTransport {
    pub fn new(model: TargetModel) -> Self {
        FakeTransport {
            model: Arc::new(Mutex::new(model)),
            replies: VecDeque::new(),
            connected: false,
        }
    }

    /// Shared handle onto the target model, for seeding and inspection.
    pub fn handle(&self) -> Arc<Mutex<TargetModel>> {
        Arc::clone(&self.model)
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self, _args: &HashMap<String, String>) -> TransportResult<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_timeout(&mut self, _timeout: Duration) {}

    fn send_line(&mut self, line: &str) -> TransportResult<()> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let reply = self.model.lock().unwrap().serve(line);
        self.replies.push_back(reply);
        Ok(())
    }

    fn recv_line(&mut self) -> TransportResult<String> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.replies.pop_front().ok_or(TransportError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_the_register_protocol() {
        let mut t = FakeTransport::new(TargetModel::new(1, 1, 4, 2));
        t.connect(&HashMap::new()).unwrap();
        t.handshake().unwrap();

        let platform = t.read_reg(0x00).unwrap();
        assert_eq!(dm::extract(DmReg::Platform, "platformid", platform).unwrap(), 1);
        assert_eq!(dm::extract(DmReg::Platform, "numwarps", platform).unwrap(), 4);

        t.write_reg(0x09, 0x1234_5678).unwrap();
        assert_eq!(t.read_reg(0x09).unwrap(), 0x1234_5678);

        // Unknown address NACKs.
        assert!(matches!(t.read_reg(0x40), Err(TransportError::Nack)));
    }

    #[test]
    fn batch_requests_hit_the_model() {
        let mut t = FakeTransport::new(TargetModel::new(1, 1, 4, 0));
        t.connect(&HashMap::new()).unwrap();
        t.write_regs(&[0x08, 0x09], &[0xAAAA, 0xBBBB]).unwrap();
        assert_eq!(t.read_regs(&[0x08, 0x09]).unwrap(), vec![0xAAAA, 0xBBBB]);
    }

    #[test]
    fn injection_interpreter_executes_loads_and_stores() {
        let model = TargetModel::new(1, 1, 2, 0);
        let mut t = FakeTransport::new(model);
        t.connect(&HashMap::new()).unwrap();
        let handle = t.handle();

        {
            let mut m = handle.lock().unwrap();
            m.set_mem_word(0x100, 0xCAFE_F00D);
            m.warps[0].halted = true;
            m.warps[0].gprs[5] = 0x100; // t0 = address
        }

        // lw t1, 0(t0) ; csrw dscratch, t1
        t.write_reg(0x08, crate::riscv::assembly::lw(0, 5, 6)).unwrap();
        t.write_reg(0x06, (1 << 31) | (1 << 6)).unwrap();
        t.write_reg(0x08, crate::riscv::assembly::csrw(CSR_DSCRATCH, 6))
            .unwrap();
        t.write_reg(0x06, (1 << 31) | (1 << 6)).unwrap();
        assert_eq!(t.read_reg(0x09).unwrap(), 0xCAFE_F00D);

        // Unknown instructions fault.
        t.write_reg(0x08, 0xFFFF_FFFF).unwrap();
        t.write_reg(0x06, (1 << 31) | (1 << 6)).unwrap();
        let dctrl = t.read_reg(0x06).unwrap();
        assert_eq!(dm::extract(DmReg::Dctrl, "injectstate", dctrl).unwrap(), 2);
    }

    #[test]
    fn x0_stays_zero() {
        let mut t = FakeTransport::new(TargetModel::new(1, 1, 1, 0));
        t.connect(&HashMap::new()).unwrap();
        let handle = t.handle();
        handle.lock().unwrap().warps[0].halted = true;

        t.write_reg(0x09, 77).unwrap();
        // csrr x0, dscratch
        t.write_reg(0x08, crate::riscv::assembly::csrr(0, CSR_DSCRATCH))
            .unwrap();
        t.write_reg(0x06, (1 << 31) | (1 << 6)).unwrap();
        assert_eq!(handle.lock().unwrap().warps[0].gprs[0], 0);
    }
}
