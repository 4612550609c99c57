//! The byte transport underneath the transceiver.

use std::io;
use std::time::Duration;

/// What a [`Transport::receive`] call observed on the line.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum RxEvent {
    /// The line went idle after `n` bytes were received, a frame boundary.
    Idle(usize),
    /// A break condition was detected on the line.
    Break,
    /// A framing/parity/overrun error, `n` bytes were received before it.
    Error(usize),
    /// Nothing happened before the timeout.
    Timeout,
}

/// Half-duplex, byte oriented serial interface.
///
/// Implementations are moved into the link worker thread.
pub trait Transport: Send {
    /// Transmit `data`, returning once it has been handed to the line driver.
    fn transmit(&mut self, data: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for bytes, writing them into `buf`.
    ///
    /// Should return at a frame boundary, when the line goes idle.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<RxEvent>;

    /// Enable or disable the receiver around transmissions.
    fn set_rx_enabled(&mut self, _enabled: bool) {}

    /// Sleep for `bits` bit times of the line.
    fn sleep_bits(&mut self, bits: u32);

    /// Wait until a transmission of `bits` bit times has left the line.
    /// Transports whose `transmit` only returns once the data is out
    /// override this with a no-op.
    fn drain(&mut self, bits: u32) {
        self.sleep_bits(bits)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
        (**self).transmit(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<RxEvent> {
        (**self).receive(buf, timeout)
    }

    fn set_rx_enabled(&mut self, enabled: bool) {
        (**self).set_rx_enabled(enabled)
    }

    fn sleep_bits(&mut self, bits: u32) {
        (**self).sleep_bits(bits)
    }

    fn drain(&mut self, bits: u32) {
        (**self).drain(bits)
    }
}

/// Duration of `bits` bit times at `baud_rate`.
pub fn bit_time(bits: u32, baud_rate: u32) -> Duration {
    Duration::from_nanos(u64::from(bits) * 1_000_000_000 / u64::from(baud_rate.max(1)))
}

/// Strips the echo of our own transmission from the front of received data.
///
/// Only a complete echo, or a chunk matching the echo so far, is dropped.
/// Data that differs from what was sent is a reply and is kept whole.
#[derive(Debug, Default)]
#[cfg_attr(not(feature = "serial"), allow(dead_code))]
pub(crate) struct EchoFilter {
    echo: Vec<u8>,
    matched: usize,
}

#[cfg_attr(not(feature = "serial"), allow(dead_code))]
impl EchoFilter {
    /// Expect `sent` to come back.
    pub fn arm(&mut self, sent: &[u8]) {
        self.echo.clear();
        self.echo.extend_from_slice(sent);
        self.matched = 0;
    }

    /// Remove echoed bytes from the front of `buf`, returning how many
    /// bytes remain at its start.
    pub fn strip(&mut self, buf: &mut [u8]) -> usize {
        let pending = &self.echo[self.matched..];
        if pending.is_empty() {
            return buf.len();
        }
        let same = buf.iter().zip(pending).take_while(|(a, b)| a == b).count();
        if same == pending.len() {
            self.echo.clear();
            self.matched = 0;
        } else if same == buf.len() {
            self.matched += same;
        } else {
            self.echo.clear();
            self.matched = 0;
            return buf.len();
        }
        buf.copy_within(same.., 0);
        buf.len() - same
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialTransport;

#[cfg(feature = "serial")]
mod serial {
    use std::io::{self, Read, Write};
    use std::thread;
    use std::time::{Duration, Instant};

    use serialport::{DataBits, Parity, SerialPort, StopBits};

    use super::{bit_time, EchoFilter, RxEvent, Transport};

    // Host serial drivers deliver bytes in chunks, wait this long for more
    // before calling the line idle.
    const IDLE_GAP: Duration = Duration::from_millis(2);

    /// [`Transport`] over a host serial port with an RS-485 adapter doing
    /// automatic direction control.
    pub struct SerialTransport {
        port: Box<dyn SerialPort>,
        baud_rate: u32,
        rx_enabled: bool,
        echo: EchoFilter,
    }

    impl SerialTransport {
        /// Open `path` as 8N1 at `baud_rate`.
        pub fn open(path: &str, baud_rate: u32) -> serialport::Result<Self> {
            let port = serialport::new(path, baud_rate)
                .data_bits(DataBits::Eight)
                .parity(Parity::None)
                .stop_bits(StopBits::One)
                .timeout(Duration::from_millis(10))
                .open()?;
            Ok(Self::new(port, baud_rate))
        }

        pub fn new(port: Box<dyn SerialPort>, baud_rate: u32) -> Self {
            Self {
                port,
                baud_rate,
                rx_enabled: true,
                echo: EchoFilter::default(),
            }
        }

        fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            self.port.set_timeout(timeout.max(Duration::from_millis(1)))?;
            match self.port.read(buf) {
                Ok(n) => Ok(n),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
                Err(e) => Err(e),
            }
        }
    }

    impl Transport for SerialTransport {
        fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
            // Adapters that keep the receiver on read back what we send.
            if !self.rx_enabled {
                self.echo.arm(data);
            }
            self.port.write_all(data)?;
            // Returns once the driver has shifted the bytes out.
            self.port.flush()
        }

        fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<RxEvent> {
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let mut count = self.read_some(buf, remaining)?;
                if count == 0 {
                    return Ok(RxEvent::Timeout);
                }
                while count < buf.len() {
                    match self.read_some(&mut buf[count..], IDLE_GAP)? {
                        0 => break,
                        n => count += n,
                    }
                }
                let count = self.echo.strip(&mut buf[..count]);
                if count > 0 {
                    return Ok(RxEvent::Idle(count));
                }
            }
        }

        fn set_rx_enabled(&mut self, enabled: bool) {
            self.rx_enabled = enabled;
        }

        fn sleep_bits(&mut self, bits: u32) {
            thread::sleep(bit_time(bits, self.baud_rate));
        }

        fn drain(&mut self, _bits: u32) {}
    }
}
