//! TCP implementation of the [`Transport`] trait.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use super::{Transport, TransportError, TransportResult, DEFAULT_TIMEOUT};

/// Line-framed transport over a TCP connection to the debug server.
pub struct TcpTransport {
    stream: Option<TcpStream>,
    rx_buf: Vec<u8>,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new() -> Self {
        TcpTransport {
            stream: None,
            rx_buf: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn stream_mut(&mut self) -> TransportResult<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }

    /// Takes one `\n`-terminated line out of the receive buffer, if present.
    fn take_line(&mut self) -> Option<String> {
        let pos = self.rx_buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.rx_buf.drain(..=pos).take(pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect(&mut self, args: &HashMap<String, String>) -> TransportResult<()> {
        let ip = args
            .get("ip")
            .ok_or_else(|| TransportError::InvalidArg("missing 'ip' argument".into()))?;
        let port: u16 = args
            .get("port")
            .ok_or_else(|| TransportError::InvalidArg("missing 'port' argument".into()))?
            .parse()
            .map_err(|_| TransportError::InvalidArg("bad 'port' argument".into()))?;

        let ip = if ip == "localhost" { "127.0.0.1" } else { ip };

        let stream = TcpStream::connect((ip, port))?;
        stream.set_nodelay(true)?;
        log::info!("connected to {ip}:{port}");

        self.rx_buf.clear();
        self.stream = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) -> TransportResult<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            log::info!("disconnected");
        }
        self.rx_buf.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn send_line(&mut self, line: &str) -> TransportResult<()> {
        let stream = self.stream_mut()?;
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        Ok(())
    }

    fn recv_line(&mut self) -> TransportResult<String> {
        if let Some(line) = self.take_line() {
            return Ok(line);
        }

        let deadline = Instant::now() + self.timeout;
        let mut chunk = [0u8; 256];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(TransportError::Timeout)?;

            let stream = self.stream_mut()?;
            stream.set_read_timeout(Some(remaining))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    // Peer closed the connection.
                    self.disconnect()?;
                    return Err(TransportError::NotConnected);
                }
                Ok(n) => {
                    self.rx_buf.extend_from_slice(&chunk[..n]);
                    if let Some(line) = self.take_line() {
                        return Ok(line);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;

    fn connect_args(port: u16) -> HashMap<String, String> {
        let mut args = HashMap::new();
        args.insert("ip".to_string(), "localhost".to_string());
        args.insert("port".to_string(), port.to_string());
        args
    }

    #[test]
    fn connect_requires_address() {
        let mut t = TcpTransport::new();
        assert!(matches!(
            t.connect(&HashMap::new()),
            Err(TransportError::InvalidArg(_))
        ));
        assert!(!t.is_connected());
    }

    #[test]
    fn register_read_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // A one-shot in-process debug server.
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            let mut stream = stream;

            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "p\n");
            stream.write_all(b"+P\n").unwrap();

            line.clear();
            reader.read_line(&mut line).unwrap();
            assert_eq!(line, "r0000\n");
            stream.write_all(b"+11abc048\n").unwrap();
        });

        let mut t = TcpTransport::new();
        t.connect(&connect_args(port)).unwrap();
        t.handshake().unwrap();
        assert_eq!(t.read_reg(0).unwrap(), 0x11AB_C048);
        t.disconnect().unwrap();
        t.disconnect().unwrap(); // idempotent
        server.join().unwrap();
    }

    #[test]
    fn recv_times_out_but_stays_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            // Hold the socket open without ever replying, then answer the
            // second request.
            let mut reader = std::io::BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            let mut stream = stream;
            reader.read_line(&mut line).unwrap();
            line.clear();
            reader.read_line(&mut line).unwrap();
            stream.write_all(b"+\n").unwrap();
        });

        let mut t = TcpTransport::new();
        t.connect(&connect_args(port)).unwrap();
        t.set_timeout(Duration::from_millis(50));
        assert!(matches!(t.read_reg(6), Err(TransportError::Timeout)));
        assert!(t.is_connected());

        // The next call recovers.
        t.set_timeout(Duration::from_millis(2000));
        t.write_reg(6, 1).unwrap();
        server.join().unwrap();
    }
}
