//! The MS/TP frame model and its wire encoding.
//!
//! ```text
//! [0x55][0xFF][type][dest][src][len_hi][len_lo][hdr_crc8] [data ...][crc16_lo][crc16_hi]
//! ```
//!
//! The data part and its CRC are only present when the length is non-zero.

use arrayvec::ArrayVec;
use snafu::{ensure, Snafu};

use crate::crc::{data_crc, header_crc};
use crate::nom_parser::{self, PREAMBLE};
use crate::types::{Address, FrameType};

/// Length of the frame header including the preamble.
pub const HEADER_LEN: usize = 8;
/// Largest payload an MS/TP frame can carry.
pub const MAX_DATA_LEN: usize = 501;
/// Largest frame on the wire.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_DATA_LEN + 2;

/// Fixed capacity frame payload.
pub type Payload = ArrayVec<u8, MAX_DATA_LEN>;

/// Wire buffer large enough for any frame.
pub(crate) type WireBuf = ArrayVec<u8, MAX_FRAME_LEN>;

/// Decoding failures of a single frame.
#[derive(Debug, Snafu, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum DecodeError {
    /// Fewer bytes than the shortest possible header.
    #[snafu(display("Short frame"))]
    Short,
    /// Lost sync, a preamble was found but no complete header follows.
    #[snafu(display("Header sync error"))]
    HeaderSync,
    /// The header checksum does not match.
    #[snafu(display("Header CRC error"))]
    HeaderCrc,
    /// The length field is out of range or the data is truncated.
    #[snafu(display("Frame length error"))]
    FrameLength,
    /// The data checksum does not match.
    #[snafu(display("Data CRC error"))]
    DataCrc,
}

/// Routing part of a frame header.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct FrameInfo {
    pub frame_type: FrameType,
    pub destination: Address,
    pub source: Address,
}

impl FrameInfo {
    pub fn new(frame_type: FrameType, destination: Address, source: Address) -> Self {
        Self {
            frame_type,
            destination,
            source,
        }
    }

    pub const fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }
}

/// An owned frame: routing information plus payload.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct Frame {
    pub info: FrameInfo,
    pub payload: Payload,
}

impl Frame {
    /// # Errors
    /// Returns [`DecodeError::FrameLength`] if `payload` exceeds [`MAX_DATA_LEN`].
    pub fn new(info: FrameInfo, payload: &[u8]) -> Result<Self, DecodeError> {
        ensure!(payload.len() <= MAX_DATA_LEN, FrameLengthSnafu);
        let mut data = Payload::new();
        data.try_extend_from_slice(payload)
            .map_err(|_| DecodeError::FrameLength)?;
        Ok(Self {
            info,
            payload: data,
        })
    }

    /// Zero length placeholder, used to initialize mailbox slots and as the
    /// "no reply" marker of the management channel.
    pub(crate) fn empty() -> Self {
        Self {
            info: FrameInfo::new(FrameType::Token, Address::BROADCAST, Address::BROADCAST),
            payload: Payload::new(),
        }
    }

    /// Overwrite the frame in place, truncating `payload` to [`MAX_DATA_LEN`].
    pub(crate) fn assign(&mut self, info: &FrameInfo, payload: &[u8]) {
        self.info = *info;
        self.payload.clear();
        let len = payload.len().min(MAX_DATA_LEN);
        self.payload.extend(payload[..len].iter().copied());
    }

    /// Encode the frame in wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut wire = WireBuf::new();
        encode(&self.info, &self.payload, &mut wire);
        wire.to_vec()
    }

    /// Decode one frame from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (_, res) = decode(buf);
        let (info, data) = res?;
        Self::new(info, data)
    }
}

/// Writes the 8 header bytes.
pub(crate) fn encode_header(info: &FrameInfo, length: usize, hdr: &mut [u8; HEADER_LEN]) {
    hdr[..2].copy_from_slice(&PREAMBLE);
    hdr[2] = info.frame_type.into();
    hdr[3] = *info.destination;
    hdr[4] = *info.source;
    hdr[5..7].copy_from_slice(&(length as u16).to_be_bytes());
    hdr[7] = header_crc(&hdr[2..7]);
}

/// Encode a frame into `wire`, which is cleared first. `data` is truncated
/// to [`MAX_DATA_LEN`].
pub(crate) fn encode(info: &FrameInfo, data: &[u8], wire: &mut WireBuf) {
    let data = &data[..data.len().min(MAX_DATA_LEN)];
    let mut hdr = [0; HEADER_LEN];
    encode_header(info, data.len(), &mut hdr);
    wire.clear();
    wire.extend(hdr.iter().copied());
    if !data.is_empty() {
        wire.extend(data.iter().copied());
        wire.extend(data_crc(data).to_le_bytes().iter().copied());
    }
}

/// Decode the frame at the start of `buf`.
///
/// Returns the number of bytes to discard from `buf`, even for failures,
/// so the next call starts at a plausible preamble.
pub(crate) fn decode(buf: &[u8]) -> (usize, Result<(FrameInfo, &[u8]), DecodeError>) {
    if buf.len() < HEADER_LEN - PREAMBLE.len() {
        return (buf.len(), Err(DecodeError::Short));
    }

    let skip = match nom_parser::preamble(buf) {
        Ok((_, n)) => n,
        Err(_) => 0,
    };
    let start = &buf[skip..];
    let hdr = match nom_parser::header(start) {
        Ok((_, hdr)) => hdr,
        Err(_) => return (buf.len(), Err(DecodeError::HeaderSync)),
    };
    let hdr_end = skip + HEADER_LEN - PREAMBLE.len();

    if !hdr.crc_ok {
        let resync = nom_parser::find_preamble(buf, 1).unwrap_or(buf.len());
        return (resync, Err(DecodeError::HeaderCrc));
    }

    let info = FrameInfo::new(
        hdr.frame_type.into(),
        Address::from_wire(hdr.destination),
        Address::from_wire(hdr.source),
    );
    let length = hdr.length as usize;
    if length == 0 {
        return (hdr_end, Ok((info, &[][..])));
    }
    if length > MAX_DATA_LEN {
        return (hdr_end, Err(DecodeError::FrameLength));
    }

    match nom_parser::data(&buf[hdr_end..], length) {
        Ok((_, (data, true))) => (hdr_end + length + 2, Ok((info, data))),
        Ok((_, (_, false))) => (hdr_end + length + 2, Err(DecodeError::DataCrc)),
        Err(_) => (hdr_end, Err(DecodeError::FrameLength)),
    }
}
