#![forbid(unsafe_code)]

//! Wehe side-channel framing codec.
//!
//! This crate provides a canonical sans-io implementation of the two wire
//! variants spoken on the side-channel port:
//!
//! Current protocol (clients >= v4.0), all integer fields big-endian:
//!
//! ```text
//! client -> server                      server -> client
//! +------------+----------------+      +----------------+-----------+
//! | opcode(u8) | body_len (u24) |      | body_len (u32) | code (u8) |
//! +------------+----------------+      +----------------+-----------+
//! | body (body_len bytes)       |      | body (body_len - 1 bytes)  |
//! +-----------------------------+      +----------------------------+
//! ```
//!
//! Legacy protocol (clients < v4.0), symmetric in both directions: a
//! 10-character zero-padded ASCII decimal length followed by the body.
//!
//! The two variants are demultiplexed on the first byte of a connection:
//! a legacy client opens with a length string whose first character is
//! `'0'` (0x30), while every current-protocol opcode is assigned from a
//! reserved range strictly below 0x30. [`is_legacy_preamble`] encodes that
//! rule; it must stay true for every opcode this crate ever assigns.

use core::fmt;

/// First byte of a legacy-framed connection: ASCII `'0'` of the zero-padded
/// length field.
pub const LEGACY_PREAMBLE_BYTE: u8 = 0x30;

/// Number of ASCII digits in a legacy length field.
pub const LEGACY_LENGTH_DIGITS: usize = 10;

/// Largest body representable in a legacy length field.
pub const LEGACY_MAX_BODY_LEN: u64 = 9_999_999_999;

/// Request header length of the current protocol: opcode + 24-bit length.
pub const REQUEST_HEADER_LEN: usize = 4;

/// Response header length of the current protocol: 32-bit length.
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Largest body representable in a 24-bit request length.
pub const MAX_REQUEST_BODY_LEN: usize = (1 << 24) - 1;

/// Side-channel request opcodes.
///
/// Wire values are stable and must not be changed once released; they are
/// also constrained to stay below [`LEGACY_PREAMBLE_BYTE`] so that the
/// first-byte demux rule keeps working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    ReceiveId = 0x02,
    Ask4Permission = 0x03,
    MobileStats = 0x04,
    Throughputs = 0x05,
    DeclareReplay = 0x06,
    AnalyzeTest = 0x07,
}

impl Opcode {
    pub const ALL: [Opcode; 6] = [
        Opcode::ReceiveId,
        Opcode::Ask4Permission,
        Opcode::MobileStats,
        Opcode::Throughputs,
        Opcode::DeclareReplay,
        Opcode::AnalyzeTest,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(Opcode::ReceiveId),
            0x03 => Some(Opcode::Ask4Permission),
            0x04 => Some(Opcode::MobileStats),
            0x05 => Some(Opcode::Throughputs),
            0x06 => Some(Opcode::DeclareReplay),
            0x07 => Some(Opcode::AnalyzeTest),
            _ => None,
        }
    }

    pub fn wire(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::ReceiveId => "receiveID",
            Opcode::Ask4Permission => "ask4permission",
            Opcode::MobileStats => "mobileStats",
            Opcode::Throughputs => "throughputs",
            Opcode::DeclareReplay => "declareReplay",
            Opcode::AnalyzeTest => "analyzeTest",
        };
        f.write_str(name)
    }
}

/// Status byte leading every current-protocol response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    Error = 1,
}

impl ResponseCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResponseCode::Ok),
            1 => Some(ResponseCode::Error),
            _ => None,
        }
    }
}

/// Decoded current-protocol request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub opcode_byte: u8,
    pub body_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    BodyTooLarge {
        len: usize,
        max: usize,
    },
    LegacyBodyTooLarge {
        len: u64,
        max: u64,
    },
    LegacyLengthNotDecimal {
        byte: u8,
        position: usize,
    },
    ResponseTooShort {
        len: usize,
    },
    UnknownResponseCode {
        byte: u8,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BodyTooLarge { len, max } => write!(f, "body too large: {len} > {max}"),
            Error::LegacyBodyTooLarge { len, max } => {
                write!(f, "legacy body too large: {len} > {max}")
            }
            Error::LegacyLengthNotDecimal { byte, position } => write!(
                f,
                "legacy length field has non-decimal byte 0x{byte:02x} at position {position}"
            ),
            Error::ResponseTooShort { len } => {
                write!(f, "response body too short: {len} < 1 (missing status byte)")
            }
            Error::UnknownResponseCode { byte } => {
                write!(f, "unknown response code: 0x{byte:02x}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// True when `first_byte` opens a legacy-framed connection.
///
/// Every assigned [`Opcode`] is below 0x30, so the rule is unambiguous.
pub fn is_legacy_preamble(first_byte: u8) -> bool {
    first_byte == LEGACY_PREAMBLE_BYTE
}

/// Encode a current-protocol request frame.
pub fn encode_request(opcode: Opcode, body: &[u8]) -> Result<Vec<u8>, Error> {
    if body.len() > MAX_REQUEST_BODY_LEN {
        return Err(Error::BodyTooLarge {
            len: body.len(),
            max: MAX_REQUEST_BODY_LEN,
        });
    }

    let len = body.len() as u32;
    let mut out = Vec::with_capacity(REQUEST_HEADER_LEN + body.len());
    out.push(opcode.wire());
    out.extend_from_slice(&len.to_be_bytes()[1..]);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode the 4-byte current-protocol request header.
///
/// The opcode byte is returned raw; callers dispatch on
/// [`Opcode::from_byte`] and [`is_legacy_preamble`] because an unknown
/// opcode is a session-level error, not a framing error.
pub fn decode_request_header(header: [u8; REQUEST_HEADER_LEN]) -> RequestHeader {
    let body_len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    RequestHeader {
        opcode_byte: header[0],
        body_len,
    }
}

/// Encode a current-protocol response frame. The encoded length counts the
/// status byte plus the body.
pub fn encode_response(code: ResponseCode, body: &[u8]) -> Result<Vec<u8>, Error> {
    let total = body
        .len()
        .checked_add(1)
        .filter(|total| *total <= u32::MAX as usize)
        .ok_or(Error::BodyTooLarge {
            len: body.len(),
            max: u32::MAX as usize - 1,
        })?;

    let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.push(code as u8);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode the 4-byte current-protocol response header into the body length
/// (status byte included).
pub fn decode_response_header(header: [u8; RESPONSE_HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}

/// Split a current-protocol response body into its status byte and payload.
pub fn split_response_body(body: &[u8]) -> Result<(ResponseCode, &[u8]), Error> {
    let (&code, payload) = body.split_first().ok_or(Error::ResponseTooShort { len: 0 })?;
    let code = ResponseCode::from_byte(code).ok_or(Error::UnknownResponseCode { byte: code })?;
    Ok((code, payload))
}

/// Encode a legacy frame: zero-padded 10-digit ASCII length, then the body.
pub fn encode_legacy(body: &[u8]) -> Result<Vec<u8>, Error> {
    let len = body.len() as u64;
    if len > LEGACY_MAX_BODY_LEN {
        return Err(Error::LegacyBodyTooLarge {
            len,
            max: LEGACY_MAX_BODY_LEN,
        });
    }

    let mut out = Vec::with_capacity(LEGACY_LENGTH_DIGITS + body.len());
    out.extend_from_slice(format!("{len:010}").as_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Decode a legacy 10-digit ASCII length field.
pub fn decode_legacy_length(field: [u8; LEGACY_LENGTH_DIGITS]) -> Result<usize, Error> {
    let mut len: u64 = 0;
    for (position, &byte) in field.iter().enumerate() {
        if !byte.is_ascii_digit() {
            return Err(Error::LegacyLengthNotDecimal { byte, position });
        }
        len = len * 10 + u64::from(byte - b'0');
    }
    Ok(len as usize)
}
