use std::collections::HashMap;

use anyhow::Context;
use clap::Parser;

use vortex_debug::transport::TcpTransport;
use vortex_debug::Backend;
use vortex_gdb_server::GdbStub;

/// GDB remote serial protocol server for the Vortex debugger.
#[derive(Parser)]
#[command(name = "vortex-gdb-server", version, about)]
struct Args {
    /// Debug server to attach to, as ip:port.
    #[arg(long, default_value = "127.0.0.1:5555")]
    target: String,

    /// Port to listen on for GDB clients.
    #[arg(long, default_value_t = 3333)]
    port: u16,

    /// Exit after the first client disconnects.
    #[arg(long)]
    no_reconnect: bool,
}

fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let (ip, port) = args
        .target
        .split_once(':')
        .with_context(|| format!("target '{}' is not ip:port", args.target))?;

    let mut connect_args = HashMap::new();
    connect_args.insert("ip".to_string(), ip.to_string());
    connect_args.insert("port".to_string(), port.to_string());

    let mut backend = Backend::new(Box::new(TcpTransport::new()));
    backend
        .connect(&connect_args)
        .context("failed to connect to the debug server")?;
    backend.initialize().context("failed to initialize backend")?;

    let mut stub = GdbStub::new(backend)?;
    stub.serve(args.port, !args.no_reconnect)?;
    Ok(())
}
