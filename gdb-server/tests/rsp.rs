//! Full-stack RSP tests: a GDB client socket talking to the stub, which
//! drives a backend connected to the in-process target model.

use std::collections::HashMap;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use vortex_debug::transport::{FakeTransport, TargetModel};
use vortex_debug::Backend;
use vortex_gdb_server::stub::{checksum, packetify};
use vortex_gdb_server::GdbStub;

fn start_server(model: TargetModel) -> (SocketAddr, Arc<Mutex<TargetModel>>, JoinHandle<()>) {
    let transport = FakeTransport::new(model);
    let handle = transport.handle();
    let mut backend = Backend::new(Box::new(transport));
    backend.set_poll_policy(10, Duration::from_millis(1));
    backend.connect(&HashMap::new()).unwrap();
    backend.initialize().unwrap();

    let mut stub = GdbStub::new(backend).unwrap();
    stub.set_continue_policy(100, Duration::from_millis(1));

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let thread = std::thread::spawn(move || {
        stub.serve_listener(listener, false).unwrap();
    });
    (addr, handle, thread)
}

struct RspClient {
    writer: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RspClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        RspClient {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    fn byte(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.reader.read_exact(&mut b).unwrap();
        b[0]
    }

    /// Sends a command and returns the reply payload, checking both the
    /// ACK and the reply checksum.
    fn request(&mut self, payload: &str) -> String {
        self.writer.write_all(packetify(payload).as_bytes()).unwrap();
        assert_eq!(self.byte(), b'+', "expected ACK for {payload}");
        self.read_reply()
    }

    /// Sends the raw interrupt byte and reads the stop reply.
    fn interrupt(&mut self) -> String {
        self.writer.write_all(&[0x03]).unwrap();
        self.read_reply()
    }

    fn read_reply(&mut self) -> String {
        assert_eq!(self.byte(), b'$');
        let mut payload = String::new();
        loop {
            let b = self.byte();
            if b == b'#' {
                break;
            }
            payload.push(b as char);
        }
        let check = [self.byte(), self.byte()];
        let received = u8::from_str_radix(std::str::from_utf8(&check).unwrap(), 16).unwrap();
        assert_eq!(received, checksum(&payload), "bad checksum on '{payload}'");
        self.writer.write_all(b"+").unwrap();
        payload
    }
}

#[test]
fn supported_and_register_file() {
    let (addr, model, server) = start_server(TargetModel::new(1, 1, 4, 2));
    {
        let mut m = model.lock().unwrap();
        m.warps[0].gprs[1] = 0x1234_5678;
        m.warps[0].csrs.insert(0xFC2, 2); // vx_num_cores
    }

    let mut client = RspClient::connect(addr);

    assert_eq!(
        client.request("qSupported:multiprocess+;swbreak+;hwbreak+"),
        "PacketSize=4096;qXfer:features:read+;swbreak+"
    );
    assert_eq!(client.request("qAttached"), "1");
    assert_eq!(client.request("?"), "S05");

    // 32 GPRs + pc + 9 exposed CSRs, 8 hex chars each, little-endian.
    let regs = client.request("g");
    assert_eq!(regs.len(), (32 + 1 + 9) * 8);
    assert_eq!(&regs[8..16], "78563412");
    // vx_num_cores is the first CSR slot (index 33).
    assert_eq!(&regs[33 * 8..34 * 8], "02000000");

    // Single-register access, same byte order.
    assert_eq!(client.request("p1"), "78563412");
    assert_eq!(client.request("P5=efbeadde"), "OK");
    assert_eq!(client.request("p5"), "efbeadde");
    assert_eq!(model.lock().unwrap().warps[0].gprs[5], 0xDEAD_BEEF);

    // The exposed CSR block reads but refuses writes.
    assert_eq!(client.request("p21"), "02000000");
    assert_eq!(client.request("P21=01000000"), "E02");

    // Unknown commands get the empty reply.
    assert_eq!(client.request("vMustReplyEmpty"), "");
    assert_eq!(client.request("qTStatus"), "");

    drop(client);
    server.join().unwrap();
}

#[test]
fn memory_breakpoints_and_continue() {
    let (addr, model, server) = start_server(TargetModel::new(1, 1, 4, 0));
    {
        let mut m = model.lock().unwrap();
        m.set_mem_word(0x1000, 0xAABB_CCDD);
        m.set_mem_word(0x1004, 0x1122_3344);
        m.set_mem_word(0x400, 0x0000_0093);
        m.set_mem_word(0x408, 0x0000_0093);
    }

    let mut client = RspClient::connect(addr);

    assert_eq!(client.request("m1000,8"), "ddccbbaa44332211");
    assert_eq!(client.request("M1002,3:eeff00"), "OK");
    assert_eq!(client.request("m1000,8"), "ddcceeff00332211");

    // Plant a breakpoint ahead of the PC, continue into it.
    assert_eq!(client.request("P20=00040000"), "OK"); // pc = 0x400
    assert_eq!(client.request("Z0,408,4"), "OK");
    assert_eq!(client.request("m408,4"), "73001000"); // ebreak in memory
    assert_eq!(client.request("c"), "S05");
    assert_eq!(client.request("p20"), "08040000"); // stopped at 0x408

    assert_eq!(client.request("z0,408,4"), "OK");
    assert_eq!(client.request("m408,4"), "93000000");

    // Step advances the PC by one instruction.
    assert_eq!(client.request("s"), "S05");
    assert_eq!(client.request("p20"), "0c040000");

    // Detach resumes everything.
    assert_eq!(client.request("D"), "OK");
    assert!(model.lock().unwrap().warps.iter().all(|w| !w.halted));

    // Interrupt halts it all again.
    assert_eq!(client.interrupt(), "S05");
    assert!(model.lock().unwrap().warps.iter().all(|w| w.halted));

    drop(client);
    server.join().unwrap();
}

#[test]
fn thread_model_and_target_description() {
    let (addr, _model, server) = start_server(TargetModel::new(1, 1, 4, 2));
    let mut client = RspClient::connect(addr);

    // 4 warps x 4 threads = 16 thread ids, 1..0x10, in one page.
    let info = client.request("qfThreadInfo");
    assert!(info.starts_with('m'));
    let tids: Vec<&str> = info[1..].split(',').collect();
    assert_eq!(tids.len(), 16);
    assert_eq!(tids[0], "1");
    assert_eq!(tids[15], "10");
    assert_eq!(client.request("qsThreadInfo"), "l");

    assert_eq!(client.request("qC"), "QC1");
    assert_eq!(client.request("Hg5"), "OK"); // warp 1, thread 0
    assert_eq!(client.request("qC"), "QC5");
    assert_eq!(client.request("Hc0"), "OK");
    assert_eq!(client.request("Hg21"), "E01"); // out of range

    assert_eq!(client.request("T5"), "OK");
    assert_eq!(client.request("T21"), "E01");

    let extra = client.request("qThreadExtraInfo,5");
    let decoded: String = extra
        .as_bytes()
        .chunks(2)
        .map(|c| {
            u8::from_str_radix(std::str::from_utf8(c).unwrap(), 16).unwrap() as char
        })
        .collect();
    assert_eq!(decoded, "warp 1 thread 0 (halted)");

    // The target description pages out and reassembles.
    let mut xml = String::new();
    let mut offset = 0;
    loop {
        let page = client.request(&format!("qXfer:features:read:target.xml:{offset:x},100"));
        let (kind, body) = page.split_at(1);
        xml.push_str(body);
        offset += body.len();
        if kind == "l" {
            break;
        }
        assert_eq!(kind, "m");
    }
    assert!(xml.contains("<architecture>riscv:rv32</architecture>"));
    assert!(xml.contains("name=\"pc\""));
    assert!(xml.contains("name=\"vx_local_mem_base\""));

    drop(client);
    server.join().unwrap();
}
