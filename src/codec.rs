//! DNS wire format (RFC 1035 §4): single-question queries and response
//! walking.
//!
//! Queries are encoded into a caller buffer of at most [`MAX_MESSAGE_SIZE`]
//! bytes. Responses are decoded in place; every answer is handed to an
//! [`AnswerSink`] so the caller decides where addresses and names are stored.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::{ResolverError, Result};

/// Largest UDP message exchanged.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Fixed header length.
pub const HEADER_SIZE: usize = 12;

/// Longest single label.
const MAX_LABEL_LEN: usize = 63;

/// Longest decoded name (RFC 1035 §2.3.4).
const MAX_NAME_LEN: usize = 255;

/// Recursion desired, standard query.
const FLAGS_QUERY: u16 = 0x0100;
const FLAG_QR: u16 = 0x8000;
const RCODE_MASK: u16 = 0x000f;

const CLASS_IN: u16 = 1;

/// Top two bits of a length byte that mark a compression pointer.
const COMPRESSION_MASK: u8 = 0xc0;
/// Size of a compression pointer.
const POINTER_SIZE: usize = 2;
/// Pointer hops followed before a name is declared malformed.
const MAX_POINTER_HOPS: usize = 16;

/// Size of type + class + TTL + rdata length in a resource record.
const RR_FIXED_SIZE: usize = 10;

/// Record types the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// IPv4 host address.
    A,
    /// Canonical name alias.
    Cname,
    /// Reverse-mapping pointer.
    Ptr,
    /// IPv6 host address.
    Aaaa,
}

impl RecordKind {
    /// Wire type code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Cname => 5,
            Self::Ptr => 12,
            Self::Aaaa => 28,
        }
    }

    /// Maps a wire type code to a known kind.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::A),
            5 => Some(Self::Cname),
            12 => Some(Self::Ptr),
            28 => Some(Self::Aaaa),
            _ => None,
        }
    }
}

/// Receives the useful content of each answer record.
pub trait AnswerSink {
    /// An A or AAAA record.
    ///
    /// # Errors
    ///
    /// Implementations may refuse the address (e.g. per-host maximum
    /// reached); the decoder logs the error and moves on.
    fn on_address(&mut self, ip: IpAddr) -> Result<()>;

    /// A CNAME record target.
    ///
    /// # Errors
    ///
    /// As for [`on_address`](Self::on_address).
    fn on_canonical_name(&mut self, name: &str) -> Result<()>;

    /// A PTR record target.
    ///
    /// # Errors
    ///
    /// As for [`on_address`](Self::on_address).
    fn on_reverse_name(&mut self, name: &str) -> Result<()>;
}

/// The question section of a query, as read back by [`parse_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Query id.
    pub id: u16,
    /// Queried name without the trailing dot.
    pub name: String,
    /// Queried type code.
    pub qtype: u16,
}

/// Query id allocator. Ids start at 1 and wrap, never yielding 0.
#[derive(Debug)]
pub struct QueryIds(AtomicU16);

impl QueryIds {
    /// Creates an allocator whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU16::new(1))
    }

    /// Returns the next id.
    pub fn next_id(&self) -> u16 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for QueryIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a recursive query for `name` into `buf`.
///
/// A trailing dot on `name` is accepted and ignored.
///
/// # Errors
///
/// Returns [`ResolverError::InvalidHostName`] if a label is empty, longer
/// than 63 bytes, or does not fit in `buf`.
pub fn encode_query(buf: &mut [u8], name: &str, kind: RecordKind, id: u16) -> Result<usize> {
    if buf.len() < HEADER_SIZE {
        return Err(ResolverError::InvalidHostName);
    }

    buf[0..2].copy_from_slice(&id.to_be_bytes());
    buf[2..4].copy_from_slice(&FLAGS_QUERY.to_be_bytes());
    buf[4..6].copy_from_slice(&1u16.to_be_bytes());
    buf[6..12].fill(0);

    let mut pos = HEADER_SIZE;
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Err(ResolverError::InvalidHostName);
    }

    for label in name.split('.') {
        let len = label.len();
        if len == 0 || len > MAX_LABEL_LEN || pos + 1 + len > buf.len() {
            return Err(ResolverError::InvalidHostName);
        }
        buf[pos] = u8::try_from(len).map_err(|_| ResolverError::InvalidHostName)?;
        buf[pos + 1..pos + 1 + len].copy_from_slice(label.as_bytes());
        pos += 1 + len;
    }

    // Root label + type + class.
    if pos + 5 > buf.len() {
        return Err(ResolverError::InvalidHostName);
    }
    buf[pos] = 0;
    pos += 1;
    buf[pos..pos + 2].copy_from_slice(&kind.code().to_be_bytes());
    buf[pos + 2..pos + 4].copy_from_slice(&CLASS_IN.to_be_bytes());
    Ok(pos + 4)
}

/// Validates a response and feeds every answer to `sink`.
///
/// Returns the number of answer records announced by the header. Zero
/// answers is a success: the server has no records of the queried type.
///
/// # Errors
///
/// - [`ResolverError::Truncated`] if the message is shorter than a field it
///   announces
/// - [`ResolverError::NotAResponse`] if the QR bit is clear
/// - [`ResolverError::BadResponseId`] if the id differs from `expected_id`
/// - [`ResolverError::FormatError`], [`ResolverError::ServerFailure`],
///   [`ResolverError::NameNotExist`] for rcodes 1-3, and
///   [`ResolverError::BadResponseType`] for any other non-zero rcode
/// - [`ResolverError::BadQuestionCount`] unless exactly one question is echoed
pub fn decode_response(msg: &[u8], expected_id: u16, sink: &mut impl AnswerSink) -> Result<u16> {
    if msg.len() < HEADER_SIZE {
        return Err(ResolverError::Truncated);
    }

    let flags = read_u16(msg, 2)?;
    if flags & FLAG_QR == 0 {
        return Err(ResolverError::NotAResponse);
    }

    let id = read_u16(msg, 0)?;
    if id != expected_id {
        return Err(ResolverError::BadResponseId {
            expected: expected_id,
            got: id,
        });
    }

    match flags & RCODE_MASK {
        0 => {}
        1 => return Err(ResolverError::FormatError),
        2 => return Err(ResolverError::ServerFailure),
        3 => return Err(ResolverError::NameNotExist),
        rcode => return Err(ResolverError::BadResponseType(rcode)),
    }

    let questions = read_u16(msg, 4)?;
    if questions != 1 {
        return Err(ResolverError::BadQuestionCount(questions));
    }

    let answers = read_u16(msg, 6)?;
    if answers == 0 {
        return Ok(0);
    }

    // Question: name + type + class.
    let mut pos = skip_name(msg, HEADER_SIZE)? + 4;

    for _ in 0..answers {
        pos = skip_name(msg, pos)?;
        if pos + RR_FIXED_SIZE > msg.len() {
            return Err(ResolverError::Truncated);
        }
        let rtype = read_u16(msg, pos)?;
        let rdlen = usize::from(read_u16(msg, pos + 8)?);
        let rdata_start = pos + RR_FIXED_SIZE;
        let rdata_end = rdata_start + rdlen;
        if rdata_end > msg.len() {
            return Err(ResolverError::Truncated);
        }

        if let Err(e) = dispatch_answer(msg, rtype, rdata_start, rdlen, sink) {
            tracing::debug!(rtype, error = %e, "Skipping answer record");
        }
        pos = rdata_end;
    }

    Ok(answers)
}

/// Reads back the header id and question of a query.
///
/// # Errors
///
/// Returns [`ResolverError::Truncated`] for a short message and
/// [`ResolverError::BadQuestionCount`] unless exactly one question is present.
pub fn parse_query(msg: &[u8]) -> Result<Question> {
    if msg.len() < HEADER_SIZE {
        return Err(ResolverError::Truncated);
    }
    let id = read_u16(msg, 0)?;
    let questions = read_u16(msg, 4)?;
    if questions != 1 {
        return Err(ResolverError::BadQuestionCount(questions));
    }
    let (name, pos) = read_name(msg, HEADER_SIZE)?;
    let qtype = read_u16(msg, pos)?;
    Ok(Question { id, name, qtype })
}

fn dispatch_answer(
    msg: &[u8],
    rtype: u16,
    start: usize,
    len: usize,
    sink: &mut impl AnswerSink,
) -> Result<()> {
    let rdata = &msg[start..start + len];
    match RecordKind::from_code(rtype) {
        Some(RecordKind::A) => {
            let octets: [u8; 4] = rdata.try_into().map_err(|_| ResolverError::Truncated)?;
            sink.on_address(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        Some(RecordKind::Aaaa) => {
            let octets: [u8; 16] = rdata.try_into().map_err(|_| ResolverError::Truncated)?;
            sink.on_address(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        Some(RecordKind::Cname) => {
            let (name, _) = read_name(msg, start)?;
            sink.on_canonical_name(&name)
        }
        Some(RecordKind::Ptr) => {
            let (name, _) = read_name(msg, start)?;
            sink.on_reverse_name(&name)
        }
        None => Err(ResolverError::BadResponseType(rtype)),
    }
}

fn read_u16(msg: &[u8], pos: usize) -> Result<u16> {
    msg.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(ResolverError::Truncated)
}

const fn is_pointer(len_byte: u8) -> bool {
    len_byte & COMPRESSION_MASK == COMPRESSION_MASK
}

/// Returns the offset just past the name starting at `pos`.
fn skip_name(msg: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let len = *msg.get(pos).ok_or(ResolverError::Truncated)?;
        if is_pointer(len) {
            if pos + POINTER_SIZE > msg.len() {
                return Err(ResolverError::Truncated);
            }
            return Ok(pos + POINTER_SIZE);
        }
        pos += 1;
        if len == 0 {
            return Ok(pos);
        }
        pos += usize::from(len);
    }
}

/// Decodes the name at `pos`, following compression pointers.
///
/// Returns the dotted name and the offset just past the name in the
/// message at the starting position. Control characters inside labels are
/// written as `.`.
fn read_name(msg: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut hops = 0;

    loop {
        let len = *msg.get(pos).ok_or(ResolverError::Truncated)?;
        if is_pointer(len) {
            let low = *msg.get(pos + 1).ok_or(ResolverError::Truncated)?;
            if end.is_none() {
                end = Some(pos + POINTER_SIZE);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(ResolverError::Truncated);
            }
            pos = (usize::from(len & !COMPRESSION_MASK) << 8) | usize::from(low);
            continue;
        }
        if len == 0 {
            let end = end.unwrap_or(pos + 1);
            return Ok((name, end));
        }

        let label_start = pos + 1;
        let label_end = label_start + usize::from(len);
        let label = msg
            .get(label_start..label_end)
            .ok_or(ResolverError::Truncated)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&b| {
            if b.is_ascii_control() {
                '.'
            } else {
                char::from(b)
            }
        }));
        if name.len() > MAX_NAME_LEN {
            return Err(ResolverError::Truncated);
        }
        pos = label_end;
    }
}
