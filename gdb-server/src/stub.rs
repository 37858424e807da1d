//! The GDB stub: TCP listener, packet framing and command handlers.
//!
//! Framing is `$<payload>#<checksum>` where the checksum is the low byte of
//! the sum of the payload characters, as two lowercase hex digits. Every
//! received packet is ACKed with `+` before it is dispatched, and every
//! handler sends exactly one reply packet so the client never hangs.

use std::io::{BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use thiserror::Error;

use vortex_debug::dm::{DmReg, HaltCause};
use vortex_debug::riscv::{self, GDB_EXPOSED_CSRS};
use vortex_debug::{Backend, DebugError};

use crate::desc;
use crate::parser::{parse_packet, Packet};
use crate::thread::ThreadMap;

/// How long `c` waits for the resumed warp to halt again.
const CONTINUE_RETRIES: u32 = 600;
const CONTINUE_DELAY: Duration = Duration::from_millis(100);

/// Thread enumeration page size for `qfThreadInfo`/`qsThreadInfo`.
const THREAD_INFO_CHUNK: usize = 64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Debug(#[from] DebugError),
}

/// One event pulled off the client connection.
enum Event {
    Packet(String),
    Interrupt,
    Disconnected,
}

pub struct GdbStub {
    backend: Backend,
    threads: ThreadMap,
    thread_info_pos: usize,
    continue_retries: u32,
    continue_delay: Duration,
}

impl GdbStub {
    /// Wraps an initialized backend. The thread map is built from the
    /// platform info, so [`Backend::initialize`] must have run.
    pub fn new(backend: Backend) -> Result<Self, DebugError> {
        let threads = ThreadMap::new(backend.platform_info()?);
        Ok(GdbStub {
            backend,
            threads,
            thread_info_pos: 0,
            continue_retries: CONTINUE_RETRIES,
            continue_delay: CONTINUE_DELAY,
        })
    }

    /// Overrides how long `c` waits for the target to halt.
    pub fn set_continue_policy(&mut self, retries: u32, delay: Duration) {
        self.continue_retries = retries;
        self.continue_delay = delay;
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    /// Binds `port` on all interfaces and serves clients, one at a time.
    pub fn serve(&mut self, port: u16, allow_reconnect: bool) -> Result<(), ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        log::info!("GDB server listening on port {port}");
        self.serve_listener(listener, allow_reconnect)
    }

    /// Serves clients from an existing listener.
    pub fn serve_listener(
        &mut self,
        listener: TcpListener,
        allow_reconnect: bool,
    ) -> Result<(), ServerError> {
        loop {
            log::info!("waiting for GDB connection...");
            let (stream, peer) = listener.accept()?;
            log::info!("GDB client connected from {peer}");

            if let Err(e) = self.session(stream) {
                log::error!("GDB session ended with error: {e}");
            }

            if !allow_reconnect {
                log::info!("exiting GDB server");
                return Ok(());
            }
            log::info!("GDB client disconnected, waiting for a new connection");
        }
    }

    fn session(&mut self, stream: TcpStream) -> Result<(), ServerError> {
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);

        // GDB assumes an attached, stopped target: make sure something is
        // halted and selected before the first query lands.
        if self.backend.selected_warp_thread(false)?.is_none() {
            log::info!("no warp selected, halting all warps for the debug session");
            self.backend.halt_all_warps()?;
            self.backend.select_warp_thread(0, 0)?;
        }

        loop {
            match self.recv_event(&mut reader, &mut writer)? {
                Event::Disconnected => return Ok(()),
                Event::Interrupt => {
                    log::debug!("RX: interrupt (0x03)");
                    let reply = match self.backend.halt_all_warps() {
                        Ok(()) => "S05".to_string(),
                        Err(e) => err_reply(&e),
                    };
                    self.send_packet(&mut writer, &reply)?;
                }
                Event::Packet(payload) => {
                    log::debug!("RX: ${payload}");
                    let packet = parse_packet(&payload);
                    let reply = self
                        .handle(packet)
                        .unwrap_or_else(|e| {
                            log::error!("command '{payload}' failed: {e}");
                            err_reply(&e)
                        });
                    self.send_packet(&mut writer, &reply)?;
                }
            }
        }
    }

    /// Reads ACKs, interrupts and framed packets. Bad checksums are NACKed
    /// and skipped.
    fn recv_event(
        &mut self,
        reader: &mut impl Read,
        writer: &mut impl Write,
    ) -> Result<Event, ServerError> {
        loop {
            let Some(first) = read_byte(reader)? else {
                return Ok(Event::Disconnected);
            };
            match first {
                b'+' => continue,
                b'-' => {
                    log::warn!("RX: - (NACK)");
                    continue;
                }
                0x03 => return Ok(Event::Interrupt),
                b'$' => {}
                other => {
                    log::warn!("RX: unexpected byte {other:#04x}");
                    continue;
                }
            }

            let mut payload = Vec::new();
            let mut sum: u8 = 0;
            loop {
                let Some(byte) = read_byte(reader)? else {
                    return Ok(Event::Disconnected);
                };
                if byte == b'#' {
                    break;
                }
                sum = sum.wrapping_add(byte);
                payload.push(byte);
            }

            let mut check = [0u8; 2];
            reader.read_exact(&mut check)?;
            let received = u8::from_str_radix(std::str::from_utf8(&check).unwrap_or("00"), 16)
                .unwrap_or(0);

            if sum != received {
                log::warn!("RX: checksum mismatch (calculated {sum:#04x}, received {received:#04x})");
                writer.write_all(b"-")?;
                continue;
            }

            // ACK before dispatch.
            writer.write_all(b"+")?;
            return Ok(Event::Packet(String::from_utf8_lossy(&payload).into_owned()));
        }
    }

    fn send_packet(&mut self, writer: &mut impl Write, payload: &str) -> Result<(), ServerError> {
        let framed = packetify(payload);
        log::debug!("TX: {framed}");
        writer.write_all(framed.as_bytes())?;
        writer.flush()?;
        Ok(())
    }

    //==========================================================================
    // Command handlers
    //==========================================================================

    fn handle(&mut self, packet: Packet) -> Result<String, DebugError> {
        match packet {
            Packet::Supported(features) => Ok(self.reply_supported(&features)),
            Packet::Attached => Ok("1".to_string()),
            Packet::HaltReason => Ok("S05".to_string()),
            Packet::Detach => {
                if let Err(e) = self.backend.resume_all_warps() {
                    log::warn!("failed to resume warps on detach: {e}");
                }
                Ok("OK".to_string())
            }
            Packet::ReadRegisters => self.read_all_registers(),
            Packet::WriteRegisters(values) => self.write_all_registers(&values),
            Packet::ReadRegister(index) => {
                let value = self.read_indexed_register(index)?;
                Ok(hex_le(value))
            }
            Packet::WriteRegister { index, value } => {
                self.write_indexed_register(index, value)?;
                Ok("OK".to_string())
            }
            Packet::ReadMemory { address, length } => {
                let data = self.backend.read_mem(address, length)?;
                Ok(data.iter().map(|b| format!("{b:02x}")).collect())
            }
            Packet::WriteMemory { address, data } => {
                self.backend.write_mem(address, &data)?;
                Ok("OK".to_string())
            }
            Packet::Continue { address } => self.handle_continue(address),
            Packet::Step { address } => {
                if let Some(addr) = address {
                    self.backend.write_register("pc", addr)?;
                }
                self.backend.step_warp()?;
                Ok("S05".to_string())
            }
            Packet::InsertBreakpoint { address } => {
                self.backend.set_breakpoint(address)?;
                Ok("OK".to_string())
            }
            Packet::RemoveBreakpoint { address } => {
                self.backend.remove_breakpoint(address)?;
                Ok("OK".to_string())
            }
            Packet::ThreadInfoFirst => {
                self.thread_info_pos = 0;
                Ok(self.reply_thread_info())
            }
            Packet::ThreadInfoNext => Ok(self.reply_thread_info()),
            Packet::ThreadExtraInfo(tid) => self.reply_thread_extra_info(tid),
            Packet::CurrentThread => {
                let reply = match self.backend.selected_warp_thread(false)? {
                    Some((wid, tid)) => format!("QC{:x}", self.threads.gtid(wid, tid)),
                    None => "QC0".to_string(),
                };
                Ok(reply)
            }
            Packet::SetThread { op, tid } => self.select_thread(op, tid),
            Packet::ThreadAlive(tid) => {
                if self.threads.lookup(tid).is_some() {
                    Ok("OK".to_string())
                } else {
                    Ok("E01".to_string())
                }
            }
            Packet::XferFeatures {
                annex,
                offset,
                length,
            } => {
                if annex != "target.xml" {
                    log::warn!("unsupported qXfer annex '{annex}'");
                    return Ok("E00".to_string());
                }
                Ok(desc::chunk(&desc::target_xml(), offset, length))
            }
            Packet::Unknown(payload) => {
                if !payload.is_empty() && payload != "vMustReplyEmpty" {
                    log::debug!("unsupported command '{payload}'");
                }
                Ok(String::new())
            }
        }
    }

    fn reply_supported(&self, features: &[String]) -> String {
        let mut reply = String::from("PacketSize=4096;qXfer:features:read+");
        if features.iter().any(|f| f == "swbreak+") {
            reply.push_str(";swbreak+");
        }
        reply
    }

    /// `g`: x0..x31, pc, then the exposed Vortex CSRs, each byte-swapped
    /// onto the wire.
    fn read_all_registers(&mut self) -> Result<String, DebugError> {
        let mut reply = String::with_capacity((33 + GDB_EXPOSED_CSRS.len()) * 8);
        for i in 0..32 {
            reply.push_str(&hex_le(self.backend.read_gpr(i)?));
        }
        reply.push_str(&hex_le(self.backend.read_register("pc")?));
        for name in GDB_EXPOSED_CSRS {
            let addr = riscv::csr_addr(name).expect("exposed CSR missing from table");
            reply.push_str(&hex_le(self.backend.read_csr(addr)?));
        }
        Ok(reply)
    }

    /// `G`: writes x1..x31 and pc; the read-only CSR tail is ignored.
    fn write_all_registers(&mut self, values: &[u32]) -> Result<String, DebugError> {
        if values.len() < 33 {
            return Err(DebugError::InvalidArg(format!(
                "register write with only {} values",
                values.len()
            )));
        }
        for (i, value) in values.iter().enumerate().take(32).skip(1) {
            self.backend.write_gpr(i as u32, *value)?;
        }
        self.backend.write_register("pc", values[32])?;
        Ok("OK".to_string())
    }

    fn read_indexed_register(&mut self, index: u32) -> Result<u32, DebugError> {
        match index {
            0..=31 => self.backend.read_gpr(index),
            32 => self.backend.read_register("pc"),
            _ => {
                let csr = GDB_EXPOSED_CSRS
                    .get(index as usize - 33)
                    .copied()
                    .ok_or_else(|| {
                        DebugError::InvalidArg(format!("register index {index} out of range"))
                    })?;
                self.backend.read_csr(riscv::csr_addr(csr).unwrap())
            }
        }
    }

    fn write_indexed_register(&mut self, index: u32, value: u32) -> Result<(), DebugError> {
        match index {
            0..=31 => self.backend.write_gpr(index, value),
            32 => self.backend.write_register("pc", value),
            // The exposed CSR block is read-only through this interface.
            _ => Err(DebugError::InvalidArg(format!(
                "register index {index} is not writable"
            ))),
        }
    }

    /// `c [addr]`: resume the selected warp, then wait for it to halt
    /// before reporting the stop.
    fn handle_continue(&mut self, address: Option<u32>) -> Result<String, DebugError> {
        if let Some(addr) = address {
            self.backend.write_register("pc", addr)?;
        }
        let (wid, _) = self
            .backend
            .selected_warp_thread(false)?
            .ok_or(DebugError::NoneSelected)?;
        self.backend.resume_warps(&[wid])?;

        for attempt in 0..self.continue_retries {
            if self.backend.warp_state(wid)? {
                let cause = self.backend.dm_read_field(DmReg::Dctrl, "hacause")?;
                if HaltCause::from(cause) == HaltCause::Ebreak {
                    let pc = self.backend.selected_warp_pc(true)?;
                    self.backend.note_breakpoint_hit(pc);
                }
                return Ok("S05".to_string());
            }
            if attempt + 1 < self.continue_retries {
                std::thread::sleep(self.continue_delay);
            }
        }
        log::error!("warp {wid} did not halt after continue");
        Err(DebugError::PollTimeout {
            what: format!("warp {wid} halt after continue"),
            last: 0,
        })
    }

    fn reply_thread_info(&mut self) -> String {
        let tids: Vec<i64> = self
            .threads
            .iter()
            .skip(self.thread_info_pos)
            .take(THREAD_INFO_CHUNK)
            .collect();
        if tids.is_empty() {
            return "l".to_string();
        }
        self.thread_info_pos += tids.len();
        format!(
            "m{}",
            tids.iter()
                .map(|t| format!("{t:x}"))
                .collect::<Vec<_>>()
                .join(",")
        )
    }

    fn reply_thread_extra_info(&mut self, tid: i64) -> Result<String, DebugError> {
        let Some((wid, ltid)) = self.threads.lookup(tid) else {
            return Ok("E01".to_string());
        };
        let halted = self.backend.warp_state(wid)?;
        let text = format!(
            "warp {wid} thread {ltid} ({})",
            if halted { "halted" } else { "running" }
        );
        Ok(text.bytes().map(|b| format!("{b:02x}")).collect())
    }

    fn select_thread(&mut self, op: char, tid: i64) -> Result<String, DebugError> {
        // 0 means "any thread", -1 "all threads": keep the current selection.
        if tid == 0 || tid == -1 {
            return Ok("OK".to_string());
        }
        let Some((wid, ltid)) = self.threads.lookup(tid) else {
            return Ok("E01".to_string());
        };
        log::debug!("H{op} selects warp {wid} thread {ltid}");
        self.backend.select_warp_thread(wid, ltid)?;
        Ok("OK".to_string())
    }
}

/// Low byte of the sum of the payload characters.
pub fn checksum(payload: &str) -> u8 {
    payload.bytes().fold(0u8, |acc, b| acc.wrapping_add(b))
}

/// Frames a payload as `$<payload>#<checksum>`.
pub fn packetify(payload: &str) -> String {
    format!("${payload}#{:02x}", checksum(payload))
}

fn err_reply(e: &DebugError) -> String {
    match e.code() {
        -4 => "E02".to_string(),
        -8 | -9 => "E03".to_string(),
        _ => "E01".to_string(),
    }
}

/// A 32-bit value as 8 hex chars in target (little-endian) byte order.
fn hex_le(value: u32) -> String {
    value
        .to_le_bytes()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn read_byte(reader: &mut impl Read) -> std::io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    match reader.read(&mut byte) {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_mod_256_sum() {
        assert_eq!(checksum(""), 0);
        assert_eq!(checksum("OK"), (b'O' as u32 + b'K' as u32) as u8);
        // Sum overflow wraps.
        let payload = "g".repeat(1000);
        let expected = (payload.bytes().map(|b| b as u32).sum::<u32>() % 256) as u8;
        assert_eq!(checksum(&payload), expected);
    }

    #[test]
    fn packetify_frames_with_lowercase_hex() {
        assert_eq!(packetify("OK"), "$OK#9a");
        assert_eq!(packetify(""), "$#00");
        assert_eq!(packetify("S05"), "$S05#b8");
    }

    #[test]
    fn hex_le_swaps_bytes() {
        assert_eq!(hex_le(0x1234_5678), "78563412");
        assert_eq!(hex_le(0), "00000000");
    }
}
