//! PI18 wire framing.
//!
//! Requests travel as `^P<NNN><command><crc><cr>`, responses as
//! `^D<LLL><payload><crc><cr>`. The three length digits count everything
//! after the header: body, the two CRC bytes and the carriage return. The CRC
//! is CRC-16/XMODEM over every byte that precedes it, sent big-endian.

use crate::catalog::Query;
use crc16::*;
use thiserror::Error;

const REQUEST_START: &[u8; 2] = b"^P";
const RESPONSE_START: &[u8; 2] = b"^D";
const TERMINATOR: u8 = b'\r';

const HEADER_LEN: usize = 5;
const TRAILER_LEN: usize = 3;
const MAX_DECLARED_LEN: usize = 999;

/// Smallest possible response: header plus an empty payload and the trailer.
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
/// Largest frame the three length digits can describe.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_DECLARED_LEN;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("incomplete frame, more bytes needed")]
    Incomplete,
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("checksum mismatch: received {received:#06x}, calculated {calculated:#06x}")]
    ChecksumMismatch { received: u16, calculated: u16 },
    #[error("frame body of {len} bytes does not fit the length field")]
    Oversized { len: usize },
}

/// A response frame that passed delimiting and checksum validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub payload: Vec<u8>,
    pub trailer_checksum: u16,
    /// Offset of the terminating carriage return in the decoded buffer.
    pub delimiter_position: usize,
}

pub fn checksum(bytes: &[u8]) -> u16 {
    State::<XMODEM>::calculate(bytes)
}

/// Frames a catalog query for the wire.
pub fn encode(query: &Query) -> Result<Vec<u8>, FrameError> {
    encode_frame(REQUEST_START, query.command.as_bytes())
}

/// Frames a payload the way the inverter answers a query.
pub fn encode_response(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    encode_frame(RESPONSE_START, payload)
}

fn encode_frame(start: &[u8; 2], body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let declared = body.len() + TRAILER_LEN;
    if declared > MAX_DECLARED_LEN {
        return Err(FrameError::Oversized { len: body.len() });
    }

    let mut message = Vec::with_capacity(HEADER_LEN + declared);
    message.extend_from_slice(start);
    message.extend_from_slice(format!("{declared:03}").as_bytes());
    message.extend_from_slice(body);
    let crc = checksum(&message);
    message.extend_from_slice(&crc.to_be_bytes());
    message.push(TERMINATOR);
    Ok(message)
}

/// Extracts the first complete response frame from `raw`.
///
/// Returns [`FrameError::Incomplete`] whenever more bytes could still turn the
/// buffer into a valid frame, so callers keep reading until the frame or a
/// terminal error shows up.
pub fn decode(raw: &[u8]) -> Result<RawFrame, FrameError> {
    if raw.len() < MIN_FRAME_LEN {
        return Err(FrameError::Incomplete);
    }

    let start = match find_start(raw) {
        Some(start) => start,
        None if raw.len() >= MAX_FRAME_LEN => {
            return Err(FrameError::Malformed("no start marker within scan window"))
        }
        None => return Err(FrameError::Incomplete),
    };

    let frame = &raw[start..];
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Incomplete);
    }

    let declared = parse_length(&frame[RESPONSE_START.len()..HEADER_LEN])?;
    if declared < TRAILER_LEN {
        return Err(FrameError::Malformed("declared length shorter than trailer"));
    }

    let total = HEADER_LEN + declared;
    if frame.len() < total {
        return Err(FrameError::Incomplete);
    }

    let delimiter = total - 1;
    if frame[delimiter] != TERMINATOR {
        return Err(FrameError::Malformed("missing terminator"));
    }

    let crc_start = total - TRAILER_LEN;
    let received = u16::from_be_bytes([frame[crc_start], frame[crc_start + 1]]);
    let calculated = checksum(&frame[..crc_start]);
    if received != calculated {
        return Err(FrameError::ChecksumMismatch {
            received,
            calculated,
        });
    }

    Ok(RawFrame {
        payload: frame[HEADER_LEN..crc_start].to_vec(),
        trailer_checksum: received,
        delimiter_position: start + delimiter,
    })
}

fn find_start(raw: &[u8]) -> Option<usize> {
    let window = &raw[..raw.len().min(MAX_FRAME_LEN)];
    window
        .windows(RESPONSE_START.len())
        .position(|candidate| candidate == RESPONSE_START)
}

fn parse_length(digits: &[u8]) -> Result<usize, FrameError> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::Malformed("length field is not numeric"));
    }
    Ok(digits
        .iter()
        .fold(0, |acc, digit| acc * 10 + usize::from(digit - b'0')))
}
