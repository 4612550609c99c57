//! The application side of a link: a handle on the worker thread and the
//! state both sides share.

use core::convert::TryFrom;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use snafu::{ensure, ResultExt, Snafu};

use crate::comm::{SharedCommStats, Transceiver};
use crate::config::{ConfigError, LinkConfig, Timing};
use crate::event::{Event, EventSink, MgmtHandler, NullHandler};
use crate::frame::{Frame, FrameInfo, MAX_DATA_LEN};
use crate::mailbox::Mailbox;
use crate::master::State;
use crate::mgmt::{self, Reply};
use crate::node;
use crate::stats::{Activity, CommStats, LinkStats, NetMap};
use crate::sync::{Flag, Gate, Semaphore};
use crate::transport::Transport;
use crate::types::{Address, Error as TypeError, FrameType, IntoAddress, Role};

/// How long [`Link::set_role`] waits for the worker to take the new role.
const ROLE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Error type of the link API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid address"))]
    InvalidAddress,
    /// Only data frames and test requests can be queued by the application.
    #[snafu(display("Frame type {:?} can't be sent by the application", frame_type))]
    InvalidFrameType { frame_type: FrameType },
    #[snafu(display("Payload of {} bytes exceeds the limit of {}", len, max))]
    PayloadTooLarge { len: usize, max: usize },
    #[snafu(display("Timeout"))]
    Timeout,
    /// The transmit mailbox still holds an unsent frame, try again later.
    #[snafu(display("Transmit mailbox busy"))]
    Busy,
    #[snafu(display("The station address can only change while initializing"))]
    NotInitializing,
    /// The management request went unanswered.
    #[snafu(display("No response"))]
    NoResponse,
    #[snafu(display("Could not start the link worker: {}", source))]
    Spawn { source: io::Error },
    #[snafu(display("Invalid configuration: {}", source))]
    #[snafu(context(false))]
    InvalidConfig { source: ConfigError },
}

impl From<TypeError> for Error {
    fn from(_: TypeError) -> Self {
        // Roles are never parsed from user input, so only addresses fail here.
        Error::InvalidAddress
    }
}

/// State shared between a [`Link`] and its worker thread.
pub(crate) struct Shared {
    pub tag: Arc<str>,
    pub config: LinkConfig,
    pub timing: Timing,
    pub alive: AtomicBool,
    address: AtomicU8,
    role_req: AtomicU8,
    role_ack: AtomicU8,
    pub up_req: AtomicBool,
    up_ack: AtomicBool,
    state: AtomicU8,
    next_station: AtomicU8,
    pub rx: Mailbox<Frame>,
    pub rx_sem: Semaphore,
    pub tx: Mailbox<Frame>,
    pub tx_gate: Gate,
    pub mgmt_tx: Mailbox<Frame>,
    pub mgmt_rx: Mailbox<Frame>,
    pub flag: Flag,
    pub stats: Mutex<LinkStats>,
    pub comm_stats: SharedCommStats,
    pub netmap: Mutex<NetMap>,
    pub activity: Mutex<Activity>,
    pub events: EventSink,
    pub handler: Mutex<Box<dyn MgmtHandler>>,
    /// Serializes management requests from several application threads.
    pub mgmt_lock: Mutex<()>,
}

impl Shared {
    pub fn station(&self) -> Address {
        Address::from_wire(self.address.load(Ordering::Acquire))
    }

    pub fn requested_role(&self) -> Role {
        Role::try_from(self.role_req.load(Ordering::Acquire)).unwrap_or(Role::None)
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_next_station(&self, station: u8) {
        self.next_station.store(station, Ordering::Release);
    }

    /// The worker is running `role`.
    pub fn ack_role(&self, role: Role) {
        self.role_ack.store(role as u8, Ordering::Release);
        self.flag.give();
    }

    /// The worker should stay in the loop of `role`.
    pub fn keep_running(&self, role: Role) -> bool {
        self.alive.load(Ordering::Acquire) && self.requested_role() == role
    }

    /// A role loop may start its state machine.
    pub fn is_requested_up(&self, role: Role) -> bool {
        self.keep_running(role) && self.up_req.load(Ordering::Acquire)
    }

    pub fn is_up(&self) -> bool {
        self.up_ack.load(Ordering::Acquire)
    }

    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// First transition to the up state opens the transmit gate.
    pub fn link_up(&self) {
        if !self.up_ack.swap(true, Ordering::AcqRel) {
            info!("[{}] link up", self.tag);
            self.emit(Event::LinkUp);
            self.tx_gate.open();
            self.flag.give();
        }
    }

    /// Leaving a role loop stops transmission until the next link up.
    pub fn link_down(&self) {
        self.up_ack.store(false, Ordering::Release);
        info!("[{}] link down", self.tag);
        self.emit(Event::LinkDown);
        self.tx_gate.close();
        self.flag.give();
    }

    /// Hand a received data frame to the application. Dropped with a
    /// warning if the previous one was not read yet.
    pub fn deliver(&self, info: &FrameInfo, payload: &[u8]) -> bool {
        let posted = self.rx.post(|slot| slot.assign(info, payload));
        if posted {
            self.rx_sem.post();
        } else {
            warn!(
                "[{}] RX {} -> {} ({} bytes) dropped, mailbox full",
                self.tag,
                info.source,
                info.destination,
                payload.len()
            );
            self.stats.lock().rx_dropped += 1;
        }
        posted
    }

    /// Hand a management response, or the empty "no reply" marker, to the
    /// waiting requester.
    pub fn deliver_mgmt(&self, info: &FrameInfo, payload: &[u8]) {
        if !self.mgmt_rx.post(|slot| slot.assign(info, payload)) {
            warn!("[{}] management response dropped", self.tag);
        }
        self.flag.give();
    }

    pub fn deliver_no_reply(&self) {
        let empty = Frame::empty();
        self.deliver_mgmt(&empty.info, &[]);
    }
}

/// An MS/TP data link running on its own worker thread.
///
/// The link is created stopped; call [`Link::resume`] to join the bus.
///
/// # Example
///
/// ```no_run
/// # #[cfg(feature = "serial")]
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use mstp_link::{Address, FrameType, Link, LinkConfig, Role, SerialTransport};
///
/// let port = SerialTransport::open("/dev/ttyUSB0", 500_000)?;
/// let link = Link::new("mstp0", 3, Role::Master, LinkConfig::default(), port)?;
/// link.resume();
/// link.send(Address::BROADCAST, FrameType::BacnetDataNotExpectingReply, b"hello")?;
///
/// let mut buf = [0; mstp_link::MAX_DATA_LEN];
/// let (len, info) = link.recv(&mut buf)?;
/// println!("{} bytes from {}", len, info.source);
/// # Ok(()) }
/// # #[cfg(not(feature = "serial"))]
/// # fn main() {}
/// ```
pub struct Link {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Link {
    /// Start a link on `transport` with station `address` and initial `role`.
    /// # Errors
    /// Fails for an invalid configuration, an address outside the master
    /// range when `role` is [`Role::Master`], or if the worker can't be spawned.
    pub fn new<T: Transport + 'static>(
        tag: &str,
        address: impl IntoAddress,
        role: Role,
        config: LinkConfig,
        transport: T,
    ) -> Result<Self, Error> {
        let address = address.into_address()?;
        let timing = config.timing()?;
        ensure!(
            role != Role::Master || *address <= config.max_master,
            InvalidAddressSnafu
        );

        let tag: Arc<str> = tag.into();
        let mut comm = Transceiver::new(Arc::clone(&tag), transport, address);
        comm.set_half_duplex(config.half_duplex);
        comm.set_idle_bits(config.idle_bits);
        comm.set_header_error_limit(config.header_error_limit);

        info!(
            "[{}] {} baud, no token {:?}, slot {:?}, usage timeout {:?}, reply timeout {:?}",
            tag, config.baud_rate, timing.no_token, timing.slot, timing.usage_timeout, timing.reply_timeout
        );
        debug!("[{}] {:?}", tag, timing);

        let shared = Arc::new(Shared {
            events: EventSink::new(&tag, config.event_capacity),
            tag: Arc::clone(&tag),
            config,
            timing,
            alive: AtomicBool::new(true),
            address: AtomicU8::new(*address),
            role_req: AtomicU8::new(role as u8),
            role_ack: AtomicU8::new(Role::None as u8),
            up_req: AtomicBool::new(false),
            up_ack: AtomicBool::new(false),
            state: AtomicU8::new(State::Initialize as u8),
            next_station: AtomicU8::new(*address),
            rx: Mailbox::new(Frame::empty()),
            rx_sem: Semaphore::default(),
            tx: Mailbox::new(Frame::empty()),
            tx_gate: Gate::default(),
            mgmt_tx: Mailbox::new(Frame::empty()),
            mgmt_rx: Mailbox::new(Frame::empty()),
            flag: Flag::default(),
            stats: Mutex::new(LinkStats::default()),
            comm_stats: comm.stats_handle(),
            netmap: Mutex::new(NetMap::with(address)),
            activity: Mutex::new(Activity::default()),
            handler: Mutex::new(Box::new(NullHandler)),
            mgmt_lock: Mutex::new(()),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(tag.to_string())
            .spawn(move || node::run(&worker_shared, comm))
            .context(SpawnSnafu)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue a frame for transmission, waiting at most the send-wait time
    /// for the transmit mailbox to accept it.
    ///
    /// Masters send queued frames when they hold the token; reply-type frames
    /// to the station whose request is being answered go out as the reply.
    /// # Errors
    /// [`Error::Timeout`] if the link is down or the mailbox stays full,
    /// [`Error::Busy`] if the previous frame is still queued.
    pub fn send(
        &self,
        destination: Address,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<(), Error> {
        ensure!(
            payload.len() <= MAX_DATA_LEN,
            PayloadTooLargeSnafu {
                len: payload.len(),
                max: MAX_DATA_LEN
            }
        );
        ensure!(frame_type.is_sendable(), InvalidFrameTypeSnafu { frame_type });

        let shared = &self.shared;
        if !shared.tx_gate.timed_enter(shared.timing.send_wait) {
            return TimeoutSnafu.fail();
        }
        if shared.tx.is_pending() {
            shared.tx_gate.exit(true);
            return BusySnafu.fail();
        }
        let info = FrameInfo::new(frame_type, destination, shared.station());
        shared.tx.post(|slot| slot.assign(&info, payload));
        shared.tx_gate.exit(false);
        Ok(())
    }

    /// Wait at most the receive-wait time for a data frame, copying its
    /// payload into `buf`. Returns the payload length and the header.
    /// # Errors
    /// [`Error::Timeout`] if no frame arrived in time.
    pub fn recv(&self, buf: &mut [u8]) -> Result<(usize, FrameInfo), Error> {
        let shared = &self.shared;
        if !shared.rx_sem.timed_wait(shared.timing.recv_wait) {
            return TimeoutSnafu.fail();
        }
        shared
            .rx
            .take(|frame| {
                let len = frame.payload.len().min(buf.len());
                buf[..len].copy_from_slice(&frame.payload[..len]);
                (len, frame.info)
            })
            .ok_or(Error::Timeout)
    }

    /// Send a management request to `destination` and wait for the answer.
    /// See [`Reply`] for the possible outcomes.
    /// # Errors
    /// [`Error::NoResponse`] if the destination did not answer,
    /// [`Error::Timeout`] if the link could not send or the answer never came.
    pub fn send_request(
        &self,
        destination: Address,
        opcode: u8,
        argument: u8,
        payload: &[u8],
    ) -> Result<Reply, Error> {
        mgmt::send_request(&self.shared, destination, opcode, argument, payload)
    }

    /// Switch the link to `role`. The link goes down and has to be resumed.
    /// # Errors
    /// [`Error::InvalidAddress`] if the station can't be a master,
    /// [`Error::Timeout`] if the worker did not take the role in time.
    pub fn set_role(&self, role: Role) -> Result<(), Error> {
        let shared = &self.shared;
        ensure!(
            role != Role::Master || *shared.station() <= shared.config.max_master,
            InvalidAddressSnafu
        );
        shared.up_req.store(false, Ordering::Release);
        shared.role_req.store(role as u8, Ordering::Release);
        shared.flag.give();
        let acked = shared.flag.wait_for(ROLE_ACK_TIMEOUT, || {
            shared.role_ack.load(Ordering::Acquire) == role as u8
        });
        ensure!(acked, TimeoutSnafu);
        debug!("[{}] role {}", shared.tag, role);
        Ok(())
    }

    /// The role the worker is running.
    pub fn role(&self) -> Role {
        Role::try_from(self.shared.role_ack.load(Ordering::Acquire)).unwrap_or(Role::None)
    }

    /// Ask the worker to join the bus.
    pub fn resume(&self) {
        self.shared.up_req.store(true, Ordering::Release);
        self.shared.flag.give();
    }

    /// Ask the worker to leave the bus. Queued frames stay queued.
    pub fn stop(&self) {
        self.shared.up_req.store(false, Ordering::Release);
        self.shared.flag.give();
    }

    /// Change the station address. Only possible while the link is down.
    /// # Errors
    /// [`Error::NotInitializing`] while a role state machine is running.
    pub fn set_address(&self, address: impl IntoAddress) -> Result<(), Error> {
        let address = address.into_address()?;
        let shared = &self.shared;
        ensure!(shared.state() == State::Initialize, NotInitializingSnafu);
        ensure!(
            shared.requested_role() != Role::Master || *address <= shared.config.max_master,
            InvalidAddressSnafu
        );
        shared.address.store(*address, Ordering::Release);
        shared.set_next_station(*address);
        *shared.netmap.lock() = NetMap::with(address);
        shared.flag.give();
        Ok(())
    }

    pub fn address(&self) -> Address {
        self.shared.station()
    }

    /// Current state of the master state machine.
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// The master the token is passed to, this station while unknown.
    pub fn next_station(&self) -> Address {
        Address::from_wire(self.shared.next_station.load(Ordering::Acquire))
    }

    /// Snapshot of the link counters, optionally clearing them.
    pub fn stats(&self, reset: bool) -> LinkStats {
        let mut stats = self.shared.stats.lock();
        if reset {
            core::mem::take(&mut *stats)
        } else {
            stats.clone()
        }
    }

    /// Snapshot of the transceiver counters, optionally clearing them.
    pub fn comm_stats(&self, reset: bool) -> CommStats {
        let mut stats = self.shared.comm_stats.lock();
        if reset {
            core::mem::take(&mut *stats)
        } else {
            stats.clone()
        }
    }

    /// Masters known to be on the bus, this station included.
    pub fn netmap(&self) -> NetMap {
        *self.shared.netmap.lock()
    }

    /// Masters heard since the last call, with their frame counts.
    pub fn active(&self) -> Vec<(Address, u32)> {
        self.shared.activity.lock().take()
    }

    /// This station has the lowest address of all known masters.
    pub fn first_address(&self) -> bool {
        let station = self.shared.station();
        self.netmap().first().map_or(true, |first| first >= station)
    }

    pub fn is_up(&self) -> bool {
        self.shared.is_up()
    }

    /// Wait until the link is up. Returns false on timeout.
    pub fn wait_up(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        shared.flag.wait_for(timeout, || shared.is_up())
    }

    /// A new receiver of link [`Event`]s. The queue is bounded, events
    /// are dropped for receivers that fall behind.
    pub fn subscribe(&self) -> Receiver<Event> {
        self.shared.events.subscribe()
    }

    /// Install the handler answering management requests from other stations.
    pub fn set_mgmt_handler(&self, handler: impl MgmtHandler + 'static) {
        *self.shared.handler.lock() = Box::new(handler);
    }

    pub fn timing(&self) -> &Timing {
        &self.shared.timing
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
        self.shared.flag.give();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[{}] link worker panicked", self.shared.tag);
            }
        }
    }
}
