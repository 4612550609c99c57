use nom::branch::alt;
use nom::bytes::complete::{tag, take};
use nom::combinator::{consumed, map, success, value, verify};
use nom::number::complete::{be_u16, le_u16, u8};
use nom::sequence::tuple;
use nom::IResult;

use crate::crc::{data_crc, header_crc};

type Buf = [u8];

pub(crate) const PREAMBLE: [u8; 2] = [0x55, 0xff];

/// Single bytes seen when the line glitches across the two preamble bytes.
const MERGED_PREAMBLE: [u8; 4] = [0xd5, 0xf5, 0xfd, 0xff];

/// Returns the number of preamble bytes at the start of `buf`. A missing
/// preamble is not an error, the header may start right away.
pub(crate) fn preamble(buf: &Buf) -> IResult<&Buf, usize> {
    alt((
        value(2, tag(&PREAMBLE[..])),
        value(1, tag(&PREAMBLE[..1])),
        value(1, verify(u8, |b: &u8| MERGED_PREAMBLE.contains(b))),
        success(0),
    ))(buf)
}

/// The six header bytes following the preamble.
#[derive(PartialEq, Debug, Copy, Clone)]
pub(crate) struct RawHeader {
    pub frame_type: u8,
    pub destination: u8,
    pub source: u8,
    pub length: u16,
    pub crc_ok: bool,
}

pub(crate) fn header(buf: &Buf) -> IResult<&Buf, RawHeader> {
    let (buf, (covered, (frame_type, destination, source, length))) =
        consumed(tuple((u8, u8, u8, be_u16)))(buf)?;
    let (buf, crc) = u8(buf)?;
    Ok((
        buf,
        RawHeader {
            frame_type,
            destination,
            source,
            length,
            crc_ok: header_crc(covered) == crc,
        },
    ))
}

/// Payload followed by its little endian CRC. Yields the payload and
/// whether the CRC matched.
pub(crate) fn data(buf: &Buf, length: usize) -> IResult<&Buf, (&Buf, bool)> {
    map(tuple((take(length), le_u16)), |(payload, crc): (&Buf, u16)| {
        (payload, data_crc(payload) == crc)
    })(buf)
}

/// Offset of the next full preamble at or after `from`.
pub(crate) fn find_preamble(buf: &Buf, from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(PREAMBLE.len())
        .position(|w| w == PREAMBLE)
        .map(|p| p + from)
}
