//! The link worker: role dispatch, and the pieces the master and slave
//! state machines have in common.

use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::comm::{RecvError, Transceiver};
use crate::event::Event;
use crate::frame::{Frame, FrameInfo};
use crate::link::Shared;
use crate::master::{self, State};
use crate::slave;
use crate::sniffer;
use crate::transport::Transport;
use crate::types::{Address, FrameType, Role};

/// Sleep of the worker while no role is requested.
const NO_ROLE_SLEEP: Duration = Duration::from_millis(10);
/// Poll interval while a role loop waits for the link up request.
const UP_POLL: Duration = Duration::from_millis(8);
/// Poll interval of the answer-data state, so a reply queued by the
/// application is sent promptly.
pub(crate) const ANSWER_POLL: Duration = Duration::from_millis(1);

/// Worker thread body. Runs the loop of the requested role until the link
/// is dropped.
pub(crate) fn run<T: Transport>(shared: &Shared, mut comm: Transceiver<T>) {
    info!("[{}] link worker started", shared.tag);
    while shared.alive.load(Ordering::Acquire) {
        shared.set_state(State::Initialize);
        match shared.requested_role() {
            Role::Master => master::run(shared, &mut comm),
            Role::Slave => slave::run(shared, &mut comm),
            Role::Sniffer => sniffer::run(shared, &mut comm),
            Role::None => {
                shared.ack_role(Role::None);
                thread::sleep(NO_ROLE_SLEEP);
            }
        }
    }
    shared.set_state(State::Initialize);
    info!("[{}] link worker stopped", shared.tag);
}

/// Acknowledge `role` and wait for the link up request. Returns false if
/// the role loop should be left instead.
pub(crate) fn enter_role(shared: &Shared, role: Role) -> bool {
    shared.ack_role(role);
    debug!("[{}] {} role, waiting for link up", shared.tag, role);
    while shared.keep_running(role) {
        if shared
            .flag
            .wait_for(UP_POLL, || shared.up_req.load(Ordering::Acquire))
        {
            return shared.keep_running(role);
        }
    }
    false
}

/// Outbound frame produced by a transition.
#[derive(Debug)]
pub(crate) enum Action {
    Send(Frame),
    /// Zero length frame from the transceiver's prepared header.
    Fast(FrameType, Address),
}

/// Result of a state transition.
#[derive(Debug)]
pub(crate) struct Step {
    pub next: State,
    pub action: Option<Action>,
    /// Evaluate `next` right away instead of waiting for the bus.
    pub now: bool,
}

impl Step {
    pub fn wait(next: State) -> Self {
        Self {
            next,
            action: None,
            now: false,
        }
    }

    pub fn now(next: State) -> Self {
        Self {
            now: true,
            ..Self::wait(next)
        }
    }

    pub fn send(mut self, frame: Frame) -> Self {
        self.action = Some(Action::Send(frame));
        self
    }

    pub fn fast(mut self, frame_type: FrameType, destination: Address) -> Self {
        self.action = Some(Action::Fast(frame_type, destination));
        self
    }
}

/// A role state machine driven by [`drive`].
pub(crate) trait StateMachine {
    fn state(&self) -> State;
    /// How long to wait for the bus in the current state.
    fn timeout(&self) -> Duration;
    fn transition(&mut self) -> Step;
    fn enter(&mut self, state: State);
    fn rx(&mut self) -> &mut RxContext;
}

/// Run `machine` until the link is stopped or another role is requested.
pub(crate) fn drive<T: Transport, M: StateMachine>(
    shared: &Shared,
    comm: &mut Transceiver<T>,
    role: Role,
    machine: &mut M,
) {
    comm.set_address(shared.station());
    shared.set_state(machine.state());
    while shared.is_requested_up(role) {
        let timeout = machine.timeout();
        machine.rx().receive(shared, comm, timeout);
        loop {
            let from = machine.state();
            let step = machine.transition();
            // Published before transmitting, the peer may answer at once.
            if step.next != from {
                trace!("[{}] {:?} -> {:?}", shared.tag, from, step.next);
                shared.set_state(step.next);
            }
            machine.enter(step.next);
            if let Some(action) = step.action {
                perform(shared, comm, machine.rx(), action);
            }
            if !step.now {
                break;
            }
        }
    }
    shared.link_down();
}

/// Transmit `action`, restarting the silence timer.
pub(crate) fn perform<T: Transport>(
    shared: &Shared,
    comm: &mut Transceiver<T>,
    rx: &mut RxContext,
    action: Action,
) {
    let res = match &action {
        Action::Send(frame) => comm.send(&frame.info, &frame.payload).map(|_| ()),
        Action::Fast(frame_type, destination) => comm.fast_send(*frame_type, *destination),
    };
    rx.reset_silence();
    if let Err(e) = res {
        warn!("[{}] transmit failed: {}", shared.tag, e);
        return;
    }

    let mut stats = shared.stats.lock();
    match action {
        Action::Fast(FrameType::Token, _) => stats.tx_token += 1,
        Action::Fast(FrameType::PollForMaster, _) => stats.tx_pfm += 1,
        Action::Fast(..) => stats.tx_mgmt += 1,
        Action::Send(frame) => match frame.info.frame_type {
            FrameType::TestRequest | FrameType::TestResponse => stats.tx_mgmt += 1,
            _ if frame.info.is_broadcast() => stats.tx_bcast += 1,
            _ => stats.tx_unicast += 1,
        },
    }
}

/// Receive side bookkeeping: the last frame, the valid/invalid flags,
/// the octet counter and the silence timer.
#[derive(Debug)]
pub(crate) struct RxContext {
    pub frame: Frame,
    pub valid: bool,
    pub invalid: bool,
    pub event_count: usize,
    silence: Instant,
}

impl RxContext {
    pub fn new() -> Self {
        Self {
            frame: Frame::empty(),
            valid: false,
            invalid: false,
            event_count: 0,
            silence: Instant::now(),
        }
    }

    /// Time since the bus was last active.
    pub fn silence(&self) -> Duration {
        self.silence.elapsed()
    }

    pub fn reset_silence(&mut self) {
        self.silence = Instant::now();
    }

    /// Forget any frame seen so far and restart the silence timer.
    pub fn clear(&mut self) {
        self.valid = false;
        self.invalid = false;
        self.event_count = 0;
        self.reset_silence();
    }

    /// Wait at most `timeout` for a frame and account for it.
    pub fn receive<T: Transport>(
        &mut self,
        shared: &Shared,
        comm: &mut Transceiver<T>,
        timeout: Duration,
    ) {
        match comm.recv(&mut self.frame.payload, timeout) {
            Ok((info, octets)) => {
                self.frame.info = info;
                self.valid = true;
                self.invalid = false;
                self.event_count += octets;
                self.reset_silence();
                account(shared, &info, self.frame.payload.len());
            }
            Err(RecvError::Timeout) => {}
            Err(RecvError::Transport { source }) => {
                warn!("[{}] transport error: {}", shared.tag, source);
                // Keep a failing transport from spinning the worker.
                thread::sleep(timeout);
            }
            Err(e) => {
                if e.is_header_error() {
                    shared.stats.lock().rx_err += 1;
                }
                if let RecvError::LineBreak = e {
                    warn!("[{}] line break", shared.tag);
                    shared.emit(Event::LineBreak);
                } else {
                    debug!("[{}] invalid frame: {}", shared.tag, e);
                }
                self.invalid = true;
                self.reset_silence();
                self.event_count = comm.pending_events();
            }
        }
        if comm.take_error_alarm() {
            shared.emit(Event::TooManyErrors);
        }
    }
}

/// Counters and activity map for a valid frame.
fn account(shared: &Shared, info: &FrameInfo, len: usize) {
    trace!(
        "[{}] RX {:?} {} -> {} len={}",
        shared.tag,
        info.frame_type,
        info.source,
        info.destination,
        len
    );
    {
        let mut stats = shared.stats.lock();
        match info.frame_type {
            FrameType::Token => stats.rx_token += 1,
            t if t.is_management() => stats.rx_mgmt += 1,
            t if t.is_data() && info.is_broadcast() => stats.rx_bcast += 1,
            t if t.is_data() => stats.rx_unicast += 1,
            _ => {}
        }
    }
    shared.activity.lock().record(info.source);
}

/// What a station does next with a frame addressed to it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Addressed {
    Token,
    PollForMaster,
    /// Reply to a data request from this station.
    AnswerData(Address),
    /// The test response is ready in the receive context.
    AnswerTest,
    Done,
}

/// Handle a valid frame addressed to `station` or broadcast: deliver data
/// to the application and answer management requests.
pub(crate) fn accept(shared: &Shared, rx: &mut RxContext, station: Address) -> Addressed {
    let info = rx.frame.info;
    match info.frame_type {
        FrameType::Token if info.is_broadcast() => {
            warn!("[{}] broadcast token from {}", shared.tag, info.source);
            Addressed::Done
        }
        FrameType::Token => Addressed::Token,
        FrameType::PollForMaster if info.destination == station => Addressed::PollForMaster,
        FrameType::TestRequest => {
            respond_to_test(shared, &mut rx.frame, station);
            if info.is_broadcast() {
                Addressed::Done
            } else {
                Addressed::AnswerTest
            }
        }
        t if t.expects_reply() => {
            shared.deliver(&info, &rx.frame.payload);
            if info.is_broadcast() {
                Addressed::Done
            } else {
                Addressed::AnswerData(info.source)
            }
        }
        t if t.is_reply() => {
            shared.deliver(&info, &rx.frame.payload);
            Addressed::Done
        }
        _ => Addressed::Done,
    }
}

/// Turn a received test request into its response in place.
///
/// Requests of at least two bytes are management requests: the handler's
/// value replaces the argument and the opcode gets its response bit. Shorter
/// requests are echoed unchanged.
fn respond_to_test(shared: &Shared, frame: &mut Frame, station: Address) {
    let source = frame.info.source;
    let payload = &mut frame.payload;
    if payload.len() >= 2 {
        let (opcode, argument) = (payload[0], payload[1]);
        let data = payload.get(4..).unwrap_or(&[]);
        let value = shared
            .handler
            .lock()
            .request(source, opcode, argument, data);
        debug!(
            "[{}] management request {:#04x}({}) from {} -> {}",
            shared.tag, opcode, argument, source, value
        );
        shared.emit(Event::MgmtRequest { source, opcode });
        payload[0] = opcode | 0x80;
        payload[1] = value;
    }
    frame.info = FrameInfo::new(FrameType::TestResponse, source, station);
}

/// ANSWER_DATA_REQUEST: send the application's reply to `requester` if it
/// is queued within the reply delay, postpone otherwise.
pub(crate) fn answer_data(shared: &Shared, rx: &RxContext, requester: Address) -> Step {
    if rx.silence() < shared.timing.reply_delay {
        let is_reply = shared
            .tx
            .peek(|frame| frame.info.frame_type.is_reply() && frame.info.destination == requester)
            .unwrap_or(false);
        if !is_reply {
            return Step::wait(State::AnswerDataRequest);
        }
        return match shared.tx.take(Frame::clone) {
            Some(mut reply) => {
                shared.tx_gate.open();
                reply.info.source = shared.station();
                debug!("[{}] reply to {}", shared.tag, requester);
                Step::wait(State::Idle).send(reply)
            }
            None => Step::wait(State::AnswerDataRequest),
        };
    }
    debug!("[{}] reply to {} postponed", shared.tag, requester);
    Step::wait(State::Idle).fast(FrameType::ReplyPostponed, requester)
}

/// ANSWER_TEST_REQUEST: send the response prepared by [`accept`].
pub(crate) fn answer_test(rx: &mut RxContext) -> Step {
    let response = core::mem::replace(&mut rx.frame, Frame::empty());
    Step::wait(State::Idle).send(response)
}
