//! Byte transport to the remote debug server.
//!
//! The register protocol is a line-framed ASCII request/reply scheme. All
//! hex is lowercase and fixed width (4 digits for addresses, 8 for data),
//! every frame ends in `\n`:
//!
//! | request              | reply on success   | reply on failure |
//! |----------------------|--------------------|------------------|
//! | `rAAAA`              | `+XXXXXXXX`        | `-`              |
//! | `wAAAA:XXXXXXXX`     | `+`                | `-`              |
//! | `RAAAA,BBBB,...`     | `+XX...,XX...`     | `-`              |
//! | `WAAAA,...;XX...,..` | `+`                | `-`              |
//! | `p`                  | `+P`               | `-`              |
//!
//! Requests are totally ordered; each completes (reply or timeout) before
//! the next begins. A receive timeout leaves the connection open; the next
//! call may recover.

mod fake;
mod tcp;

pub use fake::{Access, FakeTransport, FakeWarp, TargetModel};
pub use tcp::TcpTransport;

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

/// Largest number of registers in one batched request.
pub const MAX_BATCH: usize = 8;

/// Default receive timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request rejected by the remote (NACK)")]
    Nack,
    #[error("malformed reply: {0}")]
    InvalidReply(String),
    #[error("batch of {0} registers exceeds the limit of {MAX_BATCH}")]
    BatchTooLarge(usize),
    #[error("{0}")]
    InvalidArg(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// A bidirectional line-framed byte channel.
///
/// Implementations provide connection management and raw line I/O; the
/// register protocol itself lives in the provided methods so every
/// implementation speaks it identically.
pub trait Transport: Send {
    /// Connects using string parameters (for TCP: `ip` and `port`).
    fn connect(&mut self, args: &HashMap<String, String>) -> TransportResult<()>;

    /// Disconnects. Idempotent.
    fn disconnect(&mut self) -> TransportResult<()>;

    fn is_connected(&self) -> bool;

    /// Sets the per-reply receive timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Sends one frame; the `\n` terminator is appended here.
    fn send_line(&mut self, line: &str) -> TransportResult<()>;

    /// Receives one frame, with the `\n` terminator stripped.
    fn recv_line(&mut self) -> TransportResult<String>;

    /// Protocol ping. Must be the first call after [`Transport::connect`].
    fn handshake(&mut self) -> TransportResult<()> {
        log::debug!("TX: p");
        self.send_line("p")?;
        let reply = self.recv_line()?;
        log::debug!("RX: {reply}");
        match reply.as_str() {
            "+P" => Ok(()),
            "-" => Err(TransportError::Nack),
            other => Err(TransportError::InvalidReply(other.to_string())),
        }
    }

    /// Reads the 32-bit register at `addr`.
    fn read_reg(&mut self, addr: u32) -> TransportResult<u32> {
        let request = format!("r{addr:04x}");
        log::trace!("TX: {request}");
        self.send_line(&request)?;
        let reply = self.recv_line()?;
        log::trace!("RX: {reply}");
        match reply.as_bytes().first() {
            Some(b'+') => parse_hex32(&reply[1..]),
            Some(b'-') => Err(TransportError::Nack),
            _ => Err(TransportError::InvalidReply(reply)),
        }
    }

    /// Writes the 32-bit register at `addr`.
    fn write_reg(&mut self, addr: u32, value: u32) -> TransportResult<()> {
        let request = format!("w{addr:04x}:{value:08x}");
        log::trace!("TX: {request}");
        self.send_line(&request)?;
        let reply = self.recv_line()?;
        log::trace!("RX: {reply}");
        match reply.as_str() {
            "+" => Ok(()),
            "-" => Err(TransportError::Nack),
            other => Err(TransportError::InvalidReply(other.to_string())),
        }
    }

    /// Reads up to [`MAX_BATCH`] registers in one round trip.
    fn read_regs(&mut self, addrs: &[u32]) -> TransportResult<Vec<u32>> {
        if addrs.is_empty() {
            return Ok(Vec::new());
        }
        if addrs.len() > MAX_BATCH {
            return Err(TransportError::BatchTooLarge(addrs.len()));
        }

        let request = format!(
            "R{}",
            addrs
                .iter()
                .map(|a| format!("{a:04x}"))
                .collect::<Vec<_>>()
                .join(",")
        );
        log::trace!("TX: {request}");
        self.send_line(&request)?;
        let reply = self.recv_line()?;
        log::trace!("RX: {reply}");
        match reply.as_bytes().first() {
            Some(b'+') => {
                let values: Vec<u32> = reply[1..]
                    .split(',')
                    .map(parse_hex32)
                    .collect::<TransportResult<_>>()?;
                if values.len() != addrs.len() {
                    return Err(TransportError::InvalidArg(format!(
                        "batch read returned {} values for {} addresses",
                        values.len(),
                        addrs.len()
                    )));
                }
                Ok(values)
            }
            Some(b'-') => Err(TransportError::Nack),
            _ => Err(TransportError::InvalidReply(reply)),
        }
    }

    /// Writes up to [`MAX_BATCH`] registers in one round trip.
    fn write_regs(&mut self, addrs: &[u32], values: &[u32]) -> TransportResult<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        if addrs.len() != values.len() {
            return Err(TransportError::InvalidArg(format!(
                "batch write with {} addresses but {} values",
                addrs.len(),
                values.len()
            )));
        }
        if addrs.len() > MAX_BATCH {
            return Err(TransportError::BatchTooLarge(addrs.len()));
        }

        let request = format!(
            "W{};{}",
            addrs
                .iter()
                .map(|a| format!("{a:04x}"))
                .collect::<Vec<_>>()
                .join(","),
            values
                .iter()
                .map(|v| format!("{v:08x}"))
                .collect::<Vec<_>>()
                .join(",")
        );
        log::trace!("TX: {request}");
        self.send_line(&request)?;
        let reply = self.recv_line()?;
        log::trace!("RX: {reply}");
        match reply.as_str() {
            "+" => Ok(()),
            "-" => Err(TransportError::Nack),
            other => Err(TransportError::InvalidReply(other.to_string())),
        }
    }
}

fn parse_hex32(s: &str) -> TransportResult<u32> {
    u32::from_str_radix(s.trim(), 16)
        .map_err(|_| TransportError::InvalidReply(format!("bad hex word '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Records outgoing frames and plays back canned replies.
    #[derive(Default)]
    struct ScriptedTransport {
        sent: Vec<String>,
        replies: VecDeque<String>,
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, _args: &HashMap<String, String>) -> TransportResult<()> {
            Ok(())
        }
        fn disconnect(&mut self) -> TransportResult<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn set_timeout(&mut self, _timeout: Duration) {}
        fn send_line(&mut self, line: &str) -> TransportResult<()> {
            self.sent.push(line.to_string());
            Ok(())
        }
        fn recv_line(&mut self) -> TransportResult<String> {
            self.replies.pop_front().ok_or(TransportError::Timeout)
        }
    }

    #[test]
    fn read_reg_frames_and_parses() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+deadbeef".into());
        assert_eq!(t.read_reg(0x06).unwrap(), 0xDEAD_BEEF);
        assert_eq!(t.sent, vec!["r0006"]);
    }

    #[test]
    fn write_reg_frames_fixed_width() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+".into());
        t.write_reg(0x09, 0x42).unwrap();
        assert_eq!(t.sent, vec!["w0009:00000042"]);
    }

    #[test]
    fn nack_maps_to_error() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("-".into());
        assert!(matches!(t.read_reg(0), Err(TransportError::Nack)));
    }

    #[test]
    fn batch_read_roundtrip() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+00000001,00000002".into());
        assert_eq!(t.read_regs(&[4, 5]).unwrap(), vec![1, 2]);
        assert_eq!(t.sent, vec!["R0004,0005"]);
    }

    #[test]
    fn batch_read_size_mismatch() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+00000001".into());
        assert!(matches!(
            t.read_regs(&[4, 5]),
            Err(TransportError::InvalidArg(_))
        ));
    }

    #[test]
    fn batch_limits() {
        let mut t = ScriptedTransport::default();
        let addrs: Vec<u32> = (0..9).collect();
        assert!(matches!(
            t.read_regs(&addrs),
            Err(TransportError::BatchTooLarge(9))
        ));
        assert!(matches!(
            t.write_regs(&[1, 2], &[3]),
            Err(TransportError::InvalidArg(_))
        ));
    }

    #[test]
    fn batch_write_frame_shape() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+".into());
        t.write_regs(&[2, 3], &[0xAABB, 0xFFFF_FFFF]).unwrap();
        assert_eq!(t.sent, vec!["W0002,0003;0000aabb,ffffffff"]);
    }

    #[test]
    fn handshake_expects_ping_reply() {
        let mut t = ScriptedTransport::default();
        t.replies.push_back("+P".into());
        t.handshake().unwrap();
        assert_eq!(t.sent, vec!["p"]);

        let mut t = ScriptedTransport::default();
        t.replies.push_back("garbage".into());
        assert!(matches!(
            t.handshake(),
            Err(TransportError::InvalidReply(_))
        ));
    }
}
