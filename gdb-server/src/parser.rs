//! Parser for GDB packet payloads.
//!
//! GDB packets have the format `$packet-data#checksum`; this parser is
//! concerned with the packet data only. Anything it does not recognize
//! becomes [`Packet::Unknown`], which the stub answers with an empty reply.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::{map, opt, rest, value},
    multi::many0,
    sequence::preceded,
    IResult,
};

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// `qSupported[:feature;feature;...]`
    Supported(Vec<String>),
    /// `qAttached`
    Attached,
    /// `qC`
    CurrentThread,
    /// `qfThreadInfo`
    ThreadInfoFirst,
    /// `qsThreadInfo`
    ThreadInfoNext,
    /// `qThreadExtraInfo,tid`
    ThreadExtraInfo(i64),
    /// `qXfer:features:read:annex:offset,length`
    XferFeatures {
        annex: String,
        offset: usize,
        length: usize,
    },
    /// `?`
    HaltReason,
    /// `D`
    Detach,
    /// `g`
    ReadRegisters,
    /// `G<hex>`, values already converted out of wire byte order.
    WriteRegisters(Vec<u32>),
    /// `p n`
    ReadRegister(u32),
    /// `P n=v`, value already converted out of wire byte order.
    WriteRegister { index: u32, value: u32 },
    /// `m addr,len`
    ReadMemory { address: u32, length: u32 },
    /// `M addr,len:<hex>`
    WriteMemory { address: u32, data: Vec<u8> },
    /// `c [addr]`
    Continue { address: Option<u32> },
    /// `s [addr]`
    Step { address: Option<u32> },
    /// `Z0/Z1,addr,kind`; both map onto software breakpoints.
    InsertBreakpoint { address: u32 },
    /// `z0/z1,addr,kind`
    RemoveBreakpoint { address: u32 },
    /// `Hc tid` / `Hg tid`
    SetThread { op: char, tid: i64 },
    /// `T tid`
    ThreadAlive(i64),
    Unknown(String),
}

/// Parses one packet payload. Never fails; unrecognized input is
/// [`Packet::Unknown`].
pub fn parse_packet(input: &str) -> Packet {
    let result = alt((query, control, registers, memory, breakpoints, threads))(input);
    match result {
        Ok(("", packet)) => packet,
        _ => Packet::Unknown(input.to_string()),
    }
}

fn query(input: &str) -> IResult<&str, Packet> {
    alt((
        xfer_features,
        supported,
        map(tag("qAttached"), |_| Packet::Attached),
        map(tag("qfThreadInfo"), |_| Packet::ThreadInfoFirst),
        map(tag("qsThreadInfo"), |_| Packet::ThreadInfoNext),
        thread_extra_info,
        map(tag("qC"), |_| Packet::CurrentThread),
    ))(input)
}

fn supported(input: &str) -> IResult<&str, Packet> {
    let (input, _) = tag("qSupported")(input)?;
    let (input, features) = opt(preceded(char(':'), rest))(input)?;
    let features = features
        .unwrap_or("")
        .split(';')
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    Ok(("", Packet::Supported(features)))
}

fn xfer_features(input: &str) -> IResult<&str, Packet> {
    let (input, _) = tag("qXfer:features:read:")(input)?;
    let (input, annex) = take_while1(|c| c != ':')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, offset) = hex_usize(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_usize(input)?;
    Ok((
        input,
        Packet::XferFeatures {
            annex: annex.to_string(),
            offset,
            length,
        },
    ))
}

fn thread_extra_info(input: &str) -> IResult<&str, Packet> {
    let (input, _) = tag("qThreadExtraInfo,")(input)?;
    let (input, tid) = hex_i64(input)?;
    Ok((input, Packet::ThreadExtraInfo(tid)))
}

fn control(input: &str) -> IResult<&str, Packet> {
    alt((
        value(Packet::HaltReason, char('?')),
        // An optional detach pid is accepted and ignored.
        map(preceded(char('D'), rest), |_| Packet::Detach),
        map(preceded(char('c'), opt(hex_u32)), |address| {
            Packet::Continue { address }
        }),
        map(preceded(char('s'), opt(hex_u32)), |address| Packet::Step {
            address,
        }),
    ))(input)
}

fn registers(input: &str) -> IResult<&str, Packet> {
    alt((
        map(char('g'), |_| Packet::ReadRegisters),
        map(preceded(char('G'), many0(hex_u32_le)), |values| {
            Packet::WriteRegisters(values)
        }),
        map(preceded(char('p'), hex_u32), Packet::ReadRegister),
        write_register,
    ))(input)
}

fn write_register(input: &str) -> IResult<&str, Packet> {
    let (input, _) = char('P')(input)?;
    let (input, index) = hex_u32(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = hex_u32_le(input)?;
    Ok((input, Packet::WriteRegister { index, value }))
}

fn memory(input: &str) -> IResult<&str, Packet> {
    alt((read_memory, write_memory))(input)
}

fn read_memory(input: &str) -> IResult<&str, Packet> {
    let (input, _) = char('m')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((input, Packet::ReadMemory { address, length }))
}

fn write_memory(input: &str) -> IResult<&str, Packet> {
    let (input, _) = char('M')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = hex_bytes(input)?;
    if data.len() != length as usize {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }
    Ok((input, Packet::WriteMemory { address, data }))
}

fn breakpoints(input: &str) -> IResult<&str, Packet> {
    let (input, op) = alt((char('Z'), char('z')))(input)?;
    // Kinds 0 (software) and 1 (hardware) are accepted; both become
    // software breakpoints. Watchpoints stay unsupported.
    let (input, _) = alt((char('0'), char('1')))(input)?;
    let (input, _) = char(',')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _kind) = hex_u32(input)?;
    let packet = if op == 'Z' {
        Packet::InsertBreakpoint { address }
    } else {
        Packet::RemoveBreakpoint { address }
    };
    Ok((input, packet))
}

fn threads(input: &str) -> IResult<&str, Packet> {
    alt((set_thread, thread_alive))(input)
}

fn set_thread(input: &str) -> IResult<&str, Packet> {
    let (input, _) = char('H')(input)?;
    let (input, op) = alt((char('c'), char('g')))(input)?;
    let (input, tid) = hex_i64(input)?;
    Ok((input, Packet::SetThread { op, tid }))
}

fn thread_alive(input: &str) -> IResult<&str, Packet> {
    let (input, _) = char('T')(input)?;
    let (input, tid) = hex_i64(input)?;
    Ok((input, Packet::ThreadAlive(tid)))
}

//==============================================================================
// Hex helpers
//==============================================================================

fn is_hex(c: char) -> bool {
    c.is_ascii_hexdigit()
}

fn hex_u32(input: &str) -> IResult<&str, u32> {
    let (input, digits) = take_while1(is_hex)(input)?;
    match u32::from_str_radix(digits, 16) {
        Ok(v) => Ok((input, v)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

fn hex_usize(input: &str) -> IResult<&str, usize> {
    let (input, v) = hex_u32(input)?;
    Ok((input, v as usize))
}

/// A thread id: hex, optionally negative (`-1` means "all").
fn hex_i64(input: &str) -> IResult<&str, i64> {
    let (input, neg) = opt(char('-'))(input)?;
    let (input, digits) = take_while1(is_hex)(input)?;
    match i64::from_str_radix(digits, 16) {
        Ok(v) => Ok((input, if neg.is_some() { -v } else { v })),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

/// A 32-bit value transmitted as 8 hex chars in target (little-endian)
/// byte order.
fn hex_u32_le(input: &str) -> IResult<&str, u32> {
    let raw = input.as_bytes();
    if raw.len() < 8 || !raw[..8].iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        )));
    }
    let mut bytes = [0u8; 4];
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = u8::from_str_radix(&input[i * 2..i * 2 + 2], 16).unwrap();
    }
    Ok((&input[8..], u32::from_le_bytes(bytes)))
}

fn hex_bytes(input: &str) -> IResult<&str, Vec<u8>> {
    let (input, digits) = take_while1(is_hex)(input)?;
    if digits.len() % 2 != 0 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::HexDigit,
        )));
    }
    let bytes = digits
        .as_bytes()
        .chunks_exact(2)
        .map(|c| u8::from_str_radix(std::str::from_utf8(c).unwrap(), 16).unwrap())
        .collect();
    Ok((input, bytes))
}
