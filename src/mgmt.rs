//! Management requests carried in test request frames.
//!
//! ```text
//! request:  [opcode][argument][id_hi][id_lo][payload ...][0 padding]
//! response: [opcode | 0x80][value][id_hi][id_lo][echo ...]
//! ```
//!
//! The request is padded with zeros until its length is 2 modulo 4. The
//! responder echoes the whole request, only the first two bytes change.

use std::time::Instant;

use arrayvec::ArrayVec;
use log::{debug, warn};
use snafu::ensure;

use crate::frame::{Frame, FrameInfo};
use crate::link::{Error, NoResponseSnafu, PayloadTooLargeSnafu, Shared, TimeoutSnafu};
use crate::types::{Address, FrameType};

/// Largest payload of a management request.
pub const MAX_MGMT_PAYLOAD: usize = 48;
const MGMT_HEADER_LEN: usize = 4;
const MAX_MGMT_PDU: usize = MGMT_HEADER_LEN + MAX_MGMT_PAYLOAD + 2;
/// Set in the opcode of a response.
const RESPONSE_BIT: u8 = 0x80;

/// Successful outcome of [`Link::send_request`](crate::Link::send_request).
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Reply {
    /// Broadcast requests are not answered, the request was sent.
    Broadcast,
    /// The request was addressed to this station and looped back.
    Loopback,
    /// The value returned by the remote management handler.
    Value(u8),
}

type Pdu = ArrayVec<u8, MAX_MGMT_PDU>;

fn encode_request(opcode: u8, argument: u8, id: u16, payload: &[u8]) -> Pdu {
    let mut pdu = Pdu::new();
    pdu.extend([opcode, argument].iter().copied());
    pdu.extend(id.to_be_bytes().iter().copied());
    pdu.extend(payload.iter().copied());
    while pdu.len() % 4 != 2 {
        pdu.push(0);
    }
    pdu
}

/// What the management receive mailbox held.
#[derive(PartialEq, Eq, Debug)]
enum Outcome {
    NoReply,
    Loopback,
    Value(u8),
    Mismatch,
}

fn classify(frame: &Frame, request: &[u8], station: Address, destination: Address) -> Outcome {
    let info = frame.info;
    let payload = frame.payload.as_slice();
    match info.frame_type {
        FrameType::TestRequest
            if info.source == station && info.destination == station && payload == request =>
        {
            Outcome::Loopback
        }
        FrameType::TestResponse
            if info.destination == station
                && info.source == destination
                && payload.len() == request.len()
                && payload[0] == request[0] | RESPONSE_BIT
                && payload[2..MGMT_HEADER_LEN] == request[2..MGMT_HEADER_LEN] =>
        {
            Outcome::Value(payload[1])
        }
        _ if payload.is_empty() && info.source.is_broadcast() => Outcome::NoReply,
        _ => Outcome::Mismatch,
    }
}

pub(crate) fn send_request(
    shared: &Shared,
    destination: Address,
    opcode: u8,
    argument: u8,
    payload: &[u8],
) -> Result<Reply, Error> {
    ensure!(
        payload.len() <= MAX_MGMT_PAYLOAD,
        PayloadTooLargeSnafu {
            len: payload.len(),
            max: MAX_MGMT_PAYLOAD
        }
    );
    let _serialized = shared.mgmt_lock.lock();
    let wait = shared.timing.send_wait;

    if !shared.flag.wait_for(wait, || !shared.mgmt_tx.is_pending()) {
        return TimeoutSnafu.fail();
    }
    if shared.mgmt_rx.drain() {
        debug!("[{}] stale management response dropped", shared.tag);
    }

    let station = shared.station();
    let request = encode_request(opcode, argument, fastrand::u16(1..), payload);
    let info = FrameInfo::new(FrameType::TestRequest, destination, station);
    shared.mgmt_tx.post(|slot| slot.assign(&info, &request));
    if !shared.flag.wait_for(wait, || !shared.mgmt_tx.is_pending()) {
        return TimeoutSnafu.fail();
    }
    if destination.is_broadcast() {
        return Ok(Reply::Broadcast);
    }

    let deadline = Instant::now() + shared.timing.reply_timeout * 2;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if !shared.flag.wait_for(remaining, || shared.mgmt_rx.is_pending()) {
            return TimeoutSnafu.fail();
        }
        let outcome = shared
            .mgmt_rx
            .take(|frame| classify(frame, &request, station, destination));
        match outcome {
            Some(Outcome::NoReply) => return NoResponseSnafu.fail(),
            Some(Outcome::Loopback) => return Ok(Reply::Loopback),
            Some(Outcome::Value(value)) => return Ok(Reply::Value(value)),
            Some(Outcome::Mismatch) => {
                warn!(
                    "[{}] management response does not match request {:#04x} to {}",
                    shared.tag, opcode, destination
                );
                shared.stats.lock().mgmt_mismatch += 1;
            }
            None => {}
        }
    }
}
