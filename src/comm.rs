//! Frame transceiver on top of a [`Transport`].
//!
//! Turns the received byte stream into frames and back, and paces
//! transmissions for a half-duplex line.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};

use crate::buffer::RingBuffer;
use crate::config::FRAME_GAP_BITS;
use crate::frame::{self, DecodeError, FrameInfo, Payload, WireBuf, HEADER_LEN, MAX_FRAME_LEN};
use crate::stats::CommStats;
use crate::transport::{RxEvent, Transport};
use crate::types::{Address, FrameType};

/// Why [`Transceiver::recv`] did not return a frame.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum RecvError {
    #[snafu(display("Receive timeout"))]
    Timeout,
    #[snafu(display("Header sync error"))]
    HeaderSync,
    #[snafu(display("Header CRC error"))]
    HeaderCrc,
    #[snafu(display("Frame length error"))]
    FrameLength,
    #[snafu(display("Data CRC error"))]
    DataCrc,
    #[snafu(display("Line break"))]
    LineBreak,
    #[snafu(display("Transport error: {}", source))]
    Transport { source: io::Error },
}

impl RecvError {
    /// Errors in the header, counted towards the error run limit.
    pub fn is_header_error(&self) -> bool {
        matches!(self, RecvError::HeaderSync | RecvError::HeaderCrc)
    }
}

pub(crate) type SharedCommStats = Arc<Mutex<CommStats>>;

pub struct Transceiver<T> {
    tag: Arc<str>,
    transport: T,
    rx: RingBuffer,
    scratch: Vec<u8>,
    chunk: Vec<u8>,
    tx: WireBuf,
    fast: [u8; HEADER_LEN],
    address: Address,
    half_duplex: bool,
    idle_bits: u32,
    header_errors: u32,
    header_error_limit: u32,
    error_alarm: bool,
    stats: SharedCommStats,
}

impl<T: Transport> Transceiver<T> {
    pub fn new(tag: Arc<str>, transport: T, address: Address) -> Self {
        let mut comm = Self {
            tag,
            transport,
            rx: RingBuffer::new(2 * MAX_FRAME_LEN),
            scratch: vec![0; MAX_FRAME_LEN],
            chunk: vec![0; MAX_FRAME_LEN],
            tx: WireBuf::new(),
            fast: [0; HEADER_LEN],
            address,
            half_duplex: true,
            idle_bits: FRAME_GAP_BITS,
            header_errors: 0,
            header_error_limit: 32,
            error_alarm: false,
            stats: SharedCommStats::default(),
        };
        comm.set_address(address);
        comm
    }

    pub(crate) fn stats_handle(&self) -> SharedCommStats {
        Arc::clone(&self.stats)
    }

    /// Source address used by [`fast_send`](Self::fast_send).
    pub fn set_address(&mut self, address: Address) {
        self.address = address;
        let info = FrameInfo::new(FrameType::Token, Address::BROADCAST, address);
        frame::encode_header(&info, 0, &mut self.fast);
    }

    pub fn set_half_duplex(&mut self, half_duplex: bool) {
        self.half_duplex = half_duplex;
    }

    pub fn set_idle_bits(&mut self, bits: u32) {
        self.idle_bits = bits;
    }

    pub fn set_header_error_limit(&mut self, limit: u32) {
        self.header_error_limit = limit;
    }

    /// Bytes received but not yet decoded.
    pub fn pending_events(&self) -> usize {
        self.rx.len()
    }

    /// True once after a run of header errors reached the limit.
    pub fn take_error_alarm(&mut self) -> bool {
        core::mem::replace(&mut self.error_alarm, false)
    }

    /// Encode and transmit a frame. Returns the number of bytes on the wire.
    pub fn send(&mut self, info: &FrameInfo, data: &[u8]) -> io::Result<usize> {
        frame::encode(info, data, &mut self.tx);
        let len = self.tx.len();
        transmit(
            &mut self.transport,
            &self.tx,
            self.half_duplex,
            self.idle_bits,
        )?;
        let mut stats = self.stats.lock();
        if info.is_broadcast() {
            stats.tx_bcast += 1;
        } else {
            stats.tx_unicast += 1;
        }
        trace!(
            "[{}] TX {:?} {} -> {} len={}",
            self.tag,
            info.frame_type,
            info.source,
            info.destination,
            data.len()
        );
        Ok(len)
    }

    /// Transmit a frame without data from the prepared header.
    pub fn fast_send(&mut self, frame_type: FrameType, destination: Address) -> io::Result<()> {
        self.fast[2] = frame_type.into();
        self.fast[3] = *destination;
        self.fast[7] = crate::crc::header_crc(&self.fast[2..7]);
        transmit(
            &mut self.transport,
            &self.fast,
            self.half_duplex,
            self.idle_bits,
        )?;
        let mut stats = self.stats.lock();
        match frame_type {
            FrameType::Token => stats.tx_token += 1,
            FrameType::PollForMaster => stats.tx_pfm += 1,
            _ => stats.tx_mgmt += 1,
        }
        trace!("[{}] TX {:?} -> {}", self.tag, frame_type, destination);
        Ok(())
    }

    /// Receive one frame, waiting at most `timeout` if nothing is buffered.
    ///
    /// On success returns the header and the number of bytes the frame took
    /// on the wire; the data is copied into `payload`.
    pub fn recv(
        &mut self,
        payload: &mut Payload,
        timeout: Duration,
    ) -> Result<(FrameInfo, usize), RecvError> {
        if self.rx.is_empty() {
            self.wait_event(timeout)?;
        }

        let n = self.rx.copy_out(&mut self.scratch);
        let (consumed, res) = frame::decode(&self.scratch[..n]);
        self.rx.consume(consumed);

        let err = match res {
            Ok((info, data)) => {
                payload.clear();
                // decode() never yields more than MAX_DATA_LEN
                let _ = payload.try_extend_from_slice(data);
                self.header_errors = 0;
                self.stats.lock().rx_frames += 1;
                return Ok((info, consumed));
            }
            Err(e) => e,
        };

        let mut stats = self.stats.lock();
        let err = match err {
            DecodeError::Short => {
                stats.rx_short += 1;
                return Err(RecvError::Timeout);
            }
            DecodeError::HeaderSync => {
                stats.rx_err_sync += 1;
                RecvError::HeaderSync
            }
            DecodeError::HeaderCrc => {
                stats.rx_err_crc += 1;
                RecvError::HeaderCrc
            }
            DecodeError::FrameLength => {
                stats.rx_err_datlen += 1;
                RecvError::FrameLength
            }
            DecodeError::DataCrc => {
                stats.rx_err_datcrc += 1;
                RecvError::DataCrc
            }
        };
        drop(stats);

        if err.is_header_error() {
            self.header_errors += 1;
            if self.header_errors >= self.header_error_limit {
                warn!(
                    "[{}] {} header errors in a row",
                    self.tag, self.header_errors
                );
                self.header_errors = 0;
                self.error_alarm = true;
            }
        }
        debug!("[{}] RX {} ({} bytes dropped)", self.tag, err, consumed);
        Err(err)
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<(), RecvError> {
        let event = self
            .transport
            .receive(&mut self.chunk, timeout)
            .context(TransportSnafu)?;
        let mut stats = self.stats.lock();
        let received = match event {
            RxEvent::Timeout => {
                stats.rx_timeout += 1;
                return Err(RecvError::Timeout);
            }
            RxEvent::Break => {
                stats.rx_break += 1;
                self.rx.clear();
                return Err(RecvError::LineBreak);
            }
            RxEvent::Error(n) => {
                stats.rx_err_uart += 1;
                n
            }
            RxEvent::Idle(n) => {
                stats.rx_idle += 1;
                n
            }
        };
        let received = received.min(self.chunk.len());
        let stored = self.rx.write(&self.chunk[..received]);
        if stored < received {
            stats.rx_overrun += 1;
        }
        if self.rx.is_empty() {
            stats.rx_timeout += 1;
            return Err(RecvError::Timeout);
        }
        Ok(())
    }
}

/// Put `wire` on the line, turning the receiver off around it.
fn transmit<T: Transport>(
    transport: &mut T,
    wire: &[u8],
    half_duplex: bool,
    idle_bits: u32,
) -> io::Result<()> {
    if half_duplex {
        transport.set_rx_enabled(false);
    }
    // Turnaround gap, then wait for the frame to leave the line before
    // listening again.
    transport.sleep_bits(idle_bits);
    let res = transport.transmit(wire);
    transport.drain(wire.len() as u32 * 10);
    if half_duplex {
        transport.set_rx_enabled(true);
    }
    res
}
