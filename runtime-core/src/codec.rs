//! Hand-rolled CBOR codec for the wire envelope.
//!
//! Generic CBOR crates don't expose the three-way complete/incomplete/
//! malformed split this protocol needs mid-stream — we have to know whether
//! a short buffer is "not enough bytes yet" versus "not a valid frame at
//! all" before the next packet can even start. The teacher's own framing
//! code (`channel.rs::read_unpack`, `frame.rs::Frame::read`) hand-parses
//! headers directly off buffer slices for the same reason; this applies that
//! technique to CBOR major-type headers instead of a fixed binary header.
//!
//! Only the subset of CBOR the envelope needs is implemented: unsigned/
//! negative integers (major 0/1), byte and text strings (major 2/3), and
//! definite-length arrays (major 4). Indefinite-length items are rejected as
//! malformed — minimum-length encoding never produces them.

use std::convert::TryInto;

pub mod packet_type {
    pub const REQUEST: i64 = 0x100;
    pub const REPLY: i64 = 0x200;
    pub const NOTIFICATION: i64 = 0x400;
    pub const SRC_CLIENT: i64 = 0x010;
    pub const SRC_SERVER: i64 = 0x020;
    pub const DEST_CLIENT: i64 = 0x001;
    pub const DEST_SERVER: i64 = 0x002;
}

/// Sentinel `request_id` marking a notification with no paired reply.
pub const NOTIFICATION_REQUEST_ID: i64 = -2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Text(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }

    pub fn text(s: impl Into<String>) -> Value {
        Value::Text(s.into())
    }

    pub fn bytes(b: Vec<u8>) -> Value {
        Value::Bytes(b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub request_id: i64,
    pub packet_type: i64,
    pub command: Value,
    pub payload: Value,
    pub timeout: Option<i64>,
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn notification(packet_type: i64, command: impl Into<String>, payload: Value) -> Envelope {
        Envelope {
            request_id: NOTIFICATION_REQUEST_ID,
            packet_type,
            command: Value::text(command),
            payload,
            timeout: None,
            timestamp: None,
        }
    }

    pub fn is_request(&self) -> bool {
        self.packet_type & packet_type::REQUEST != 0
    }

    pub fn is_reply(&self) -> bool {
        self.packet_type & packet_type::REPLY != 0
    }

    pub fn is_notification(&self) -> bool {
        self.packet_type & packet_type::NOTIFICATION != 0
    }

    pub fn command_str(&self) -> Option<&str> {
        self.command.as_str()
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Builds the REPLY to this REQUEST: same envelope, REQUEST bit swapped
    /// for REPLY, SRC/DEST bits untouched, payload replaced.
    pub fn into_reply(mut self, payload: Value) -> Envelope {
        self.packet_type = (self.packet_type & !packet_type::REQUEST) | packet_type::REPLY;
        self.payload = payload;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    Incomplete,
    Malformed,
}

enum Need {
    More,
    Malformed,
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], Need> {
        if self.pos + n > self.buf.len() {
            return Err(Need::More);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Validates a declared array/map element count against what the
    /// remaining buffer could possibly hold (each element is at least one
    /// byte) before it's used to pre-size a `Vec`. Without this, a header
    /// claiming close to `u64::MAX` elements reaches `Vec::with_capacity`
    /// directly and aborts the process.
    fn bounded_count(&self, count: u64) -> Result<usize, Need> {
        let remaining = self.buf.len() - self.pos;
        if count as u128 > remaining as u128 {
            return Err(Need::Malformed);
        }
        Ok(count as usize)
    }
}

fn read_head(cur: &mut Cursor) -> Result<(u8, u64), Need> {
    let b0 = cur.take(1)?[0];
    let major = b0 >> 5;
    let ai = b0 & 0x1f;
    let arg = match ai {
        0..=23 => ai as u64,
        24 => cur.take(1)?[0] as u64,
        25 => {
            let b = cur.take(2)?;
            u16::from_be_bytes([b[0], b[1]]) as u64
        }
        26 => {
            let b = cur.take(4)?;
            u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as u64
        }
        27 => {
            let b = cur.take(8)?;
            u64::from_be_bytes(b.try_into().expect("8 byte slice"))
        }
        _ => return Err(Need::Malformed),
    };
    Ok((major, arg))
}

fn read_int(cur: &mut Cursor) -> Result<i64, Need> {
    let (major, arg) = read_head(cur)?;
    match major {
        0 => {
            if arg > i64::MAX as u64 {
                Err(Need::Malformed)
            } else {
                Ok(arg as i64)
            }
        }
        1 => {
            if arg > i64::MAX as u64 {
                Err(Need::Malformed)
            } else {
                Ok(-1 - arg as i64)
            }
        }
        _ => Err(Need::Malformed),
    }
}

fn read_string(cur: &mut Cursor) -> Result<Value, Need> {
    let (major, len) = read_head(cur)?;
    let len = len as usize;
    match major {
        2 => Ok(Value::Bytes(cur.take(len)?.to_vec())),
        3 => {
            let bytes = cur.take(len)?;
            let text = std::str::from_utf8(bytes).map_err(|_| Need::Malformed)?;
            Ok(Value::Text(text.to_string()))
        }
        _ => Err(Need::Malformed),
    }
}

fn decode_envelope(cur: &mut Cursor) -> Result<Envelope, Need> {
    let (major, len) = read_head(cur)?;
    if major != 4 || (len != 4 && len != 6) {
        return Err(Need::Malformed);
    }
    let request_id = read_int(cur)?;
    let packet_type = read_int(cur)?;
    let command = read_string(cur)?;
    let payload = read_string(cur)?;
    let (timeout, timestamp) = if len == 6 {
        (Some(read_int(cur)?), Some(read_int(cur)?))
    } else {
        (None, None)
    };
    Ok(Envelope { request_id, packet_type, command, payload, timeout, timestamp })
}

/// Attempts to parse exactly one envelope off the front of `buf`.
pub fn decode_one(buf: &[u8]) -> Result<(Envelope, usize), ParseOutcome> {
    let mut cur = Cursor { buf, pos: 0 };
    match decode_envelope(&mut cur) {
        Ok(packet) => Ok((packet, cur.pos)),
        Err(Need::More) => Err(ParseOutcome::Incomplete),
        Err(Need::Malformed) => Err(ParseOutcome::Malformed),
    }
}

fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major_bits = major << 5;
    if arg < 24 {
        out.push(major_bits | arg as u8);
    } else if arg <= u8::MAX as u64 {
        out.push(major_bits | 24);
        out.push(arg as u8);
    } else if arg <= u16::MAX as u64 {
        out.push(major_bits | 25);
        out.extend_from_slice(&(arg as u16).to_be_bytes());
    } else if arg <= u32::MAX as u64 {
        out.push(major_bits | 26);
        out.extend_from_slice(&(arg as u32).to_be_bytes());
    } else {
        out.push(major_bits | 27);
        out.extend_from_slice(&arg.to_be_bytes());
    }
}

fn write_int(out: &mut Vec<u8>, value: i64) {
    if value >= 0 {
        write_head(out, 0, value as u64);
    } else {
        write_head(out, 1, (-1 - value) as u64);
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Bytes(bytes) => {
            write_head(out, 2, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
        Value::Text(text) => {
            write_head(out, 3, text.len() as u64);
            out.extend_from_slice(text.as_bytes());
        }
    }
}

/// A generic CBOR value, used for the inner arrays carried inside an
/// envelope's byte/text payload (`Setup`, `SetServerSettings`,
/// `AddTotalGameTime`, `UpdatePackage`). The envelope itself never needs
/// more than [`Value`] — only nested payload shapes need maps and arrays.
#[derive(Debug, Clone, PartialEq)]
pub enum CborValue {
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Array(Vec<CborValue>),
    Map(Vec<(CborValue, CborValue)>),
}

impl CborValue {
    pub fn text(s: impl Into<String>) -> CborValue {
        CborValue::Text(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CborValue::Text(s) => Some(s.as_str()),
            CborValue::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CborValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CborValue]> {
        match self {
            CborValue::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }
}

fn read_value(cur: &mut Cursor) -> Result<CborValue, Need> {
    let (major, arg) = read_head(cur)?;
    match major {
        0 => {
            if arg > i64::MAX as u64 {
                Err(Need::Malformed)
            } else {
                Ok(CborValue::Int(arg as i64))
            }
        }
        1 => {
            if arg > i64::MAX as u64 {
                Err(Need::Malformed)
            } else {
                Ok(CborValue::Int(-1 - arg as i64))
            }
        }
        2 => Ok(CborValue::Bytes(cur.take(arg as usize)?.to_vec())),
        3 => {
            let bytes = cur.take(arg as usize)?;
            let text = std::str::from_utf8(bytes).map_err(|_| Need::Malformed)?;
            Ok(CborValue::Text(text.to_string()))
        }
        4 => {
            let mut items = Vec::with_capacity(cur.bounded_count(arg)?);
            for _ in 0..arg {
                items.push(read_value(cur)?);
            }
            Ok(CborValue::Array(items))
        }
        5 => {
            let mut items = Vec::with_capacity(cur.bounded_count(arg)?);
            for _ in 0..arg {
                let key = read_value(cur)?;
                let val = read_value(cur)?;
                items.push((key, val));
            }
            Ok(CborValue::Map(items))
        }
        _ => Err(Need::Malformed),
    }
}

fn write_cbor_value(out: &mut Vec<u8>, value: &CborValue) {
    match value {
        CborValue::Int(v) => write_int(out, *v),
        CborValue::Bytes(b) => {
            write_head(out, 2, b.len() as u64);
            out.extend_from_slice(b);
        }
        CborValue::Text(t) => {
            write_head(out, 3, t.len() as u64);
            out.extend_from_slice(t.as_bytes());
        }
        CborValue::Array(items) => {
            write_head(out, 4, items.len() as u64);
            for item in items {
                write_cbor_value(out, item);
            }
        }
        CborValue::Map(pairs) => {
            write_head(out, 5, pairs.len() as u64);
            for (k, v) in pairs {
                write_cbor_value(out, k);
                write_cbor_value(out, v);
            }
        }
    }
}

/// Decodes a single generic CBOR value (used for nested payload arrays,
/// not top-level envelopes).
pub fn decode_value(buf: &[u8]) -> Result<(CborValue, usize), ParseOutcome> {
    let mut cur = Cursor { buf, pos: 0 };
    match read_value(&mut cur) {
        Ok(value) => Ok((value, cur.pos)),
        Err(Need::More) => Err(ParseOutcome::Incomplete),
        Err(Need::Malformed) => Err(ParseOutcome::Malformed),
    }
}

pub fn encode_value(value: &CborValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_cbor_value(&mut out, value);
    out
}

/// Encodes `envelope` using minimum-length CBOR argument encoding. Emits the
/// 6-element form when either trailing field is present, the 4-element form
/// otherwise.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut out = Vec::new();
    let has_trailer = envelope.timeout.is_some() || envelope.timestamp.is_some();
    let len: u64 = if has_trailer { 6 } else { 4 };
    write_head(&mut out, 4, len);
    write_int(&mut out, envelope.request_id);
    write_int(&mut out, envelope.packet_type);
    write_value(&mut out, &envelope.command);
    write_value(&mut out, &envelope.payload);
    if has_trailer {
        write_int(&mut out, envelope.timeout.unwrap_or(0));
        write_int(&mut out, envelope.timestamp.unwrap_or(0));
    }
    out
}
