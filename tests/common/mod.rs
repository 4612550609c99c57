#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Error, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use mstp_link::{Frame, LinkConfig, RxEvent, Transport};

/// What one transmission puts on the line.
#[derive(Clone)]
enum Chunk {
    Data(Vec<u8>),
    Break,
}

/// Simulated half-duplex RS-485 bus. Every transmission reaches all other
/// ports as one chunk, so receivers see it as a frame followed by idle.
#[derive(Default)]
pub struct Rs485Bus {
    ports: Mutex<Vec<Weak<PortLink>>>,
    next_id: AtomicUsize,
    drop_next: AtomicUsize,
    corrupt_next: AtomicUsize,
}

struct PortLink {
    id: usize,
    rx: Mutex<VecDeque<Chunk>>,
    rx_available: Condvar,
}

impl Rs485Bus {
    pub fn new() -> Arc<Rs485Bus> {
        Default::default()
    }

    pub fn port(self: &Arc<Self>) -> BusPort {
        let link = Arc::new(PortLink {
            id: self.next_id.fetch_add(1, SeqCst),
            rx: Default::default(),
            rx_available: Condvar::new(),
        });
        self.ports.lock().unwrap().push(Arc::downgrade(&link));
        BusPort {
            bus: Arc::clone(self),
            link,
            do_write_error: false,
        }
    }

    /// Lose the next `n` transmissions.
    pub fn drop_frames(&self, n: usize) {
        self.drop_next.store(n, SeqCst);
    }

    /// Flip a bit in the header of the next `n` transmissions.
    pub fn corrupt_frames(&self, n: usize) {
        self.corrupt_next.store(n, SeqCst);
    }

    /// Signal a break condition to every port.
    pub fn line_break(&self) {
        self.deliver(usize::MAX, Chunk::Break);
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn transmit(&self, from: usize, data: &[u8]) {
        if Self::take_fault(&self.drop_next) {
            return;
        }
        let mut data = data.to_vec();
        if Self::take_fault(&self.corrupt_next) && data.len() > 3 {
            data[3] ^= 0x04;
        }
        self.deliver(from, Chunk::Data(data));
    }

    fn deliver(&self, from: usize, chunk: Chunk) {
        let mut ports = self.ports.lock().unwrap();
        ports.retain(|weak| weak.strong_count() > 0);
        for port in ports.iter().filter_map(Weak::upgrade) {
            if port.id != from {
                port.rx.lock().unwrap().push_back(chunk.clone());
                port.rx_available.notify_all();
            }
        }
    }
}

pub struct BusPort {
    bus: Arc<Rs485Bus>,
    link: Arc<PortLink>,
    pub do_write_error: bool,
}

impl BusPort {
    /// Put a hand crafted frame on the bus.
    pub fn send_frame(&mut self, frame: &Frame) {
        self.transmit(&frame.encode()).unwrap();
    }

    /// Next valid frame seen on the bus, skipping undecodable chunks.
    pub fn recv_frame(&mut self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0; 1024];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.receive(&mut buf, remaining).unwrap() {
                RxEvent::Idle(n) => {
                    if let Ok(frame) = Frame::decode(&buf[..n]) {
                        return Some(frame);
                    }
                }
                RxEvent::Timeout => return None,
                _ => {}
            }
        }
    }

    /// First frame seen within `timeout` that satisfies `pred`.
    pub fn recv_matching(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&Frame) -> bool,
    ) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self.recv_frame(remaining)?;
            if pred(&frame) {
                return Some(frame);
            }
        }
    }

    /// Drop everything received so far.
    pub fn flush(&mut self) {
        self.link.rx.lock().unwrap().clear();
    }
}

impl Transport for BusPort {
    fn transmit(&mut self, data: &[u8]) -> io::Result<()> {
        if self.do_write_error {
            self.do_write_error = false;
            return Err(Error::new(ErrorKind::PermissionDenied, "IO write error"));
        }
        self.bus.transmit(self.link.id, data);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<RxEvent> {
        let rx = self.link.rx.lock().unwrap();
        let (mut rx, _) = self
            .link
            .rx_available
            .wait_timeout_while(rx, timeout, |rx| rx.is_empty())
            .expect("Mutex lock failed");
        match rx.pop_front() {
            None => Ok(RxEvent::Timeout),
            Some(Chunk::Break) => Ok(RxEvent::Break),
            Some(Chunk::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    rx.push_front(Chunk::Data(data.split_off(n)));
                }
                Ok(RxEvent::Idle(n))
            }
        }
    }

    fn sleep_bits(&mut self, _bits: u32) {}
}

/// Slow bus profile giving threads plenty of slack:
/// slot 30 ms, usage timeout 87 ms, no token 100 ms.
pub fn test_config() -> LinkConfig {
    LinkConfig::default()
        .with_baud_rate(9600)
        .with_max_nodes(2)
        .with_max_frame_octets(64)
        .with_max_master(7)
        .with_no_token(Duration::from_millis(100))
        .with_reply_delay(Duration::from_millis(40))
        .with_reply_timeout(Duration::from_millis(80))
        .with_send_wait(Duration::from_secs(2))
        .with_recv_wait(Duration::from_secs(2))
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
