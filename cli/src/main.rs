//! One-shot command front end for the Vortex debugger.
//!
//! Each subcommand maps onto one backend call. Exit codes: 0 on success,
//! 1 for usage errors, and the (negated) backend error code otherwise.

use std::collections::HashMap;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use vortex_debug::transport::TcpTransport;
use vortex_debug::{Backend, DebugError};
use vortex_gdb_server::GdbStub;

#[derive(Parser)]
#[command(name = "vxdbg", version, about = "Vortex debugger")]
struct Cli {
    /// Debug server to attach to, as ip:port.
    #[arg(long, global = true, default_value = "127.0.0.1:5555")]
    target: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print platform information.
    Info,
    /// Reset the target system.
    Reset {
        /// Halt all warps coming out of reset.
        #[arg(long)]
        halt: bool,
    },
    /// Halt warps (all of them when none are listed).
    Halt { wids: Vec<u32> },
    /// Resume warps (all of them when none are listed).
    Resume { wids: Vec<u32> },
    /// Select a warp/thread for per-warp operations.
    Select { wid: u32, tid: u32 },
    /// Single-step the selected warp.
    Step,
    /// Show per-warp status.
    Status,
    /// Read a register by name (x0..x31, a CSR name, or pc).
    ReadReg { name: String },
    /// Write a register by name.
    WriteReg {
        name: String,
        #[arg(value_parser = parse_u32)]
        value: u32,
    },
    /// Read memory and hex-dump it.
    ReadMem {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(value_parser = parse_u32)]
        len: u32,
    },
    /// Write bytes to memory.
    WriteMem {
        #[arg(value_parser = parse_u32)]
        addr: u32,
        #[arg(value_parser = parse_u8, required = true)]
        bytes: Vec<u8>,
    },
    /// Set a software breakpoint.
    BreakSet {
        #[arg(value_parser = parse_u32)]
        addr: u32,
    },
    /// Remove a software breakpoint.
    BreakClear {
        #[arg(value_parser = parse_u32)]
        addr: u32,
    },
    /// List breakpoints.
    BreakList,
    /// Resume the selected warp and wait for a breakpoint hit.
    Continue,
    /// Inject one instruction (a hex word like 0x00100073, or assembly).
    Inject { instr: Vec<String> },
    /// Serve GDB clients.
    Gdb {
        #[arg(long, default_value_t = 3333)]
        port: u16,
        /// Exit after the first client disconnects.
        #[arg(long)]
        no_reconnect: bool,
    },
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

fn parse_u8(s: &str) -> Result<u8, String> {
    parse_u32(s).and_then(|v| u8::try_from(v).map_err(|e| e.to_string()))
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e} (code {})", e.code());
            // Propagate the negated core error code, as far as an exit
            // status can carry it.
            ExitCode::from(e.code().unsigned_abs().min(255) as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<(), DebugError> {
    let (ip, port) = cli
        .target
        .split_once(':')
        .ok_or_else(|| DebugError::InvalidArg(format!("target '{}' is not ip:port", cli.target)))?;
    let mut args = HashMap::new();
    args.insert("ip".to_string(), ip.to_string());
    args.insert("port".to_string(), port.to_string());

    let mut backend = Backend::new(Box::new(TcpTransport::new()));
    backend.connect(&args)?;
    backend.initialize()?;

    match &cli.command {
        Command::Info => {
            println!("{}", backend.platform_info()?);
        }
        Command::Reset { halt } => backend.reset_platform(*halt)?,
        Command::Halt { wids } => {
            if wids.is_empty() {
                backend.halt_all_warps()?;
            } else {
                backend.halt_warps(wids)?;
            }
        }
        Command::Resume { wids } => {
            if wids.is_empty() {
                backend.resume_all_warps()?;
            } else {
                backend.resume_warps(wids)?;
            }
        }
        Command::Select { wid, tid } => backend.select_warp_thread(*wid, *tid)?,
        Command::Step => backend.step_warp()?,
        Command::Status => {
            let status = backend.warp_status(true, true)?;
            for s in status.values() {
                match (s.active, s.halted) {
                    (false, _) => println!("warp {:3}: inactive", s.wid),
                    (true, false) => println!("warp {:3}: running", s.wid),
                    (true, true) => println!(
                        "warp {:3}: halted at {:#010x} ({})",
                        s.wid,
                        s.pc.unwrap_or(0),
                        s.hacause.map(|c| c.to_string()).unwrap_or_default()
                    ),
                }
            }
        }
        Command::ReadReg { name } => {
            let value = backend.read_register(name)?;
            println!("{name} = {value:#010x}");
        }
        Command::WriteReg { name, value } => backend.write_register(name, *value)?,
        Command::ReadMem { addr, len } => {
            let data = backend.read_mem(*addr, *len)?;
            for (i, chunk) in data.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{:#010x}: {}", addr + (i * 16) as u32, hex.join(" "));
            }
        }
        Command::WriteMem { addr, bytes } => backend.write_mem(*addr, bytes)?,
        Command::BreakSet { addr } => backend.set_breakpoint(*addr)?,
        Command::BreakClear { addr } => backend.remove_breakpoint(*addr)?,
        Command::BreakList => {
            for bp in backend.breakpoints() {
                println!(
                    "{:#010x}: {} (hits {}, replaced {:#010x})",
                    bp.addr,
                    if bp.enabled { "enabled" } else { "disabled" },
                    bp.hit_count,
                    bp.replaced_instr
                );
            }
        }
        Command::Continue => {
            let wid = backend.continue_until_breakpoint(true)?;
            println!("warp {wid} stopped at a breakpoint");
        }
        Command::Inject { instr } => {
            let line = instr.join(" ");
            match parse_u32(&line) {
                Ok(word) => backend.inject(word)?,
                Err(_) => backend.inject_asm(&line)?,
            }
        }
        Command::Gdb {
            port,
            no_reconnect,
        } => {
            let mut stub = GdbStub::new(backend)?;
            stub.serve(*port, !*no_reconnect)
                .map_err(|e| DebugError::Fault(e.to_string()))?;
        }
    }
    Ok(())
}
