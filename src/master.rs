//! The token passing master state machine.
//!
//! See [`State`] for the states. Each transition is a function of the
//! receive context and the master variables returning a [`Step`]: the next
//! state, an optional frame to send and whether to evaluate the next state
//! right away.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::comm::Transceiver;
use crate::event::Event;
use crate::frame::Frame;
use crate::link::Shared;
use crate::node::{self, Addressed, RxContext, StateMachine, Step, ANSWER_POLL};
use crate::stats::NetMap;
use crate::transport::Transport;
use crate::types::{Address, FrameType, Role};

/// How long the master listens before it starts.
const INIT_TIMEOUT: Duration = Duration::from_millis(100);
/// How long the master waits for the application while holding the token.
const USE_TOKEN_TIMEOUT: Duration = Duration::from_millis(2);

/// States of the master state machine, observable with
/// [`Link::state`](crate::Link::state). Slaves use the subset without the
/// token states.
#[derive(PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[repr(u8)]
pub enum State {
    /// Not running, waiting for the link up request.
    Initialize = 0,
    Idle,
    /// The token was lost, waiting for this station's slot to regenerate it.
    NoToken,
    PollForMaster,
    /// The token was passed, waiting for the next station to use it.
    PassToken,
    UseToken,
    DoneWithToken,
    WaitForReply,
    WaitForTestReply,
    AnswerDataRequest,
    AnswerTestRequest,
}

impl State {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => State::Idle,
            2 => State::NoToken,
            3 => State::PollForMaster,
            4 => State::PassToken,
            5 => State::UseToken,
            6 => State::DoneWithToken,
            7 => State::WaitForReply,
            8 => State::WaitForTestReply,
            9 => State::AnswerDataRequest,
            10 => State::AnswerTestRequest,
            _ => State::Initialize,
        }
    }
}

pub(crate) fn run<T: Transport>(shared: &Shared, comm: &mut Transceiver<T>) {
    if !node::enter_role(shared, Role::Master) {
        return;
    }
    let mut master = Master::new(shared);
    info!(
        "[{}] master {} starting, max master {}",
        shared.tag, master.ts, master.n_max
    );
    node::drive(shared, comm, Role::Master, &mut master);
}

struct Master<'a> {
    link: &'a Shared,
    rx: RxContext,
    state: State,
    /// This station.
    ts: u8,
    /// Next station, the master the token is passed to.
    ns: u8,
    /// Poll station, the last address polled for a master.
    ps: u8,
    n_max: u8,
    token_count: u32,
    frame_count: u32,
    retry_count: u32,
    sole_master: bool,
    maintenance: Instant,
    requester: Address,
}

impl<'a> Master<'a> {
    fn new(link: &'a Shared) -> Self {
        let ts = *link.station();
        Self {
            link,
            rx: RxContext::new(),
            state: State::Initialize,
            ts,
            ns: ts,
            ps: ts,
            n_max: link.config.max_master,
            token_count: link.config.n_poll,
            frame_count: 0,
            retry_count: 0,
            sole_master: false,
            maintenance: Instant::now(),
            requester: Address::BROADCAST,
        }
    }

    fn next(&self, station: u8) -> u8 {
        if station >= self.n_max {
            0
        } else {
            station + 1
        }
    }

    fn station(&self) -> Address {
        Address::from_wire(self.ts)
    }

    fn is_for_us(&self, destination: Address) -> bool {
        destination == self.ts
    }

    fn set_next_station(&mut self, ns: u8) {
        self.ns = ns;
        self.link.set_next_station(ns);
    }

    fn saw_frames(&self) -> bool {
        self.rx.event_count > self.link.config.n_min_octets as usize
    }

    fn poll(&mut self, station: u8) -> Step {
        self.ps = station;
        self.retry_count = 0;
        self.maintenance = Instant::now();
        debug!("[{}] poll for master {}", self.link.tag, station);
        Step::wait(State::PollForMaster)
            .fast(FrameType::PollForMaster, Address::from_wire(station))
    }

    fn pass_token(&mut self) -> Step {
        self.retry_count = 0;
        self.rx.event_count = 0;
        Step::wait(State::PassToken).fast(FrameType::Token, Address::from_wire(self.ns))
    }

    fn initialize(&mut self) -> Step {
        let ts = *self.link.station();
        self.ts = ts;
        self.ps = ts;
        self.set_next_station(ts);
        self.token_count = self.link.config.n_poll;
        self.frame_count = 0;
        self.retry_count = 0;
        self.sole_master = false;
        // Idle times the bus from here, not from before the role started.
        self.rx.clear();
        self.maintenance = Instant::now();
        *self.link.netmap.lock() = NetMap::with(self.station());
        self.link.activity.lock().clear();
        Step::wait(State::Idle)
    }

    fn idle(&mut self) -> Step {
        if self.rx.valid {
            self.rx.valid = false;
            let info = self.rx.frame.info;
            if !self.is_for_us(info.destination) && !info.is_broadcast() {
                if matches!(
                    info.frame_type,
                    FrameType::PollForMaster | FrameType::ReplyToPollForMaster
                ) {
                    self.link.netmap.lock().insert(info.source);
                }
                return Step::wait(State::Idle);
            }
            let station = self.station();
            return match node::accept(self.link, &mut self.rx, station) {
                Addressed::Token => {
                    self.frame_count = 0;
                    if self.sole_master {
                        self.sole_master = false;
                        info!("[{}] another master joined", self.link.tag);
                        self.link.emit(Event::MultiMaster);
                    }
                    self.link.link_up();
                    Step::now(State::UseToken)
                }
                Addressed::PollForMaster => {
                    self.link.netmap.lock().insert(info.source);
                    Step::wait(State::Idle).fast(FrameType::ReplyToPollForMaster, info.source)
                }
                Addressed::AnswerData(requester) => {
                    self.requester = requester;
                    Step::now(State::AnswerDataRequest)
                }
                Addressed::AnswerTest => Step::now(State::AnswerTestRequest),
                Addressed::Done => Step::wait(State::Idle),
            };
        }
        if self.rx.invalid {
            self.rx.invalid = false;
            return Step::wait(State::Idle);
        }
        if self.rx.silence() >= self.link.timing.no_token {
            self.rx.event_count = 0;
            self.link.stats.lock().token_lost += 1;
            info!("[{}] token lost", self.link.tag);
            self.link.emit(Event::TokenLost);
            return Step::now(State::NoToken);
        }
        Step::wait(State::Idle)
    }

    fn use_token(&mut self) -> Step {
        let link = self.link;
        let ts = self.station();

        if let Some(frame) = link.mgmt_tx.take(Frame::clone) {
            link.flag.give();
            self.frame_count += 1;
            let info = frame.info;
            if info.frame_type == FrameType::TestRequest && info.destination == ts {
                debug!("[{}] loopback probe", link.tag);
                link.emit(Event::ProbeBegin);
                link.deliver_mgmt(&info, &frame.payload);
                link.emit(Event::ProbeEnd);
                return Step::now(State::DoneWithToken).send(frame);
            }
            return match info.frame_type {
                _ if info.is_broadcast() => Step::now(State::DoneWithToken).send(frame),
                FrameType::TestRequest => Step::wait(State::WaitForTestReply).send(frame),
                t if t.expects_reply() => Step::wait(State::WaitForReply).send(frame),
                _ => Step::now(State::DoneWithToken).send(frame),
            };
        }

        if let Some(mut frame) = link.tx.take(Frame::clone) {
            link.tx_gate.open();
            self.frame_count += 1;
            frame.info.source = ts;
            let info = frame.info;
            let waits = info.frame_type.expects_reply() || info.frame_type == FrameType::TestRequest;
            if waits && !info.is_broadcast() {
                return Step::wait(State::WaitForReply).send(frame);
            }
            return Step::now(State::DoneWithToken).send(frame);
        }

        self.frame_count = self.link.config.max_info_frames;
        Step::now(State::DoneWithToken)
    }

    fn wait_for_reply(&mut self) -> Step {
        if self.rx.invalid {
            self.rx.invalid = false;
            debug!("[{}] invalid frame while waiting for a reply", self.link.tag);
            return Step::now(State::DoneWithToken);
        }
        if !self.rx.valid {
            if self.rx.silence() >= self.link.timing.reply_timeout {
                self.frame_count = self.link.config.max_info_frames;
                debug!("[{}] reply timeout", self.link.tag);
                return Step::now(State::DoneWithToken);
            }
            return Step::wait(State::WaitForReply);
        }

        self.rx.valid = false;
        let info = self.rx.frame.info;
        if self.is_for_us(info.destination) {
            match info.frame_type {
                FrameType::ReplyPostponed => return Step::now(State::DoneWithToken),
                t if t.is_data() => {
                    self.link.deliver(&info, &self.rx.frame.payload);
                    return Step::now(State::DoneWithToken);
                }
                _ => {}
            }
        }
        warn!(
            "[{}] unexpected {:?} from {} while waiting for a reply",
            self.link.tag, info.frame_type, info.source
        );
        Step::now(State::Idle)
    }

    fn wait_for_test_reply(&mut self) -> Step {
        if self.rx.invalid {
            self.rx.invalid = false;
            warn!("[{}] invalid frame while waiting for a test reply", self.link.tag);
            self.link.deliver_no_reply();
            return Step::now(State::DoneWithToken);
        }
        if !self.rx.valid {
            if self.rx.silence() >= self.link.timing.reply_timeout {
                self.frame_count = self.link.config.max_info_frames;
                debug!("[{}] test reply timeout", self.link.tag);
                self.link.deliver_no_reply();
                return Step::now(State::DoneWithToken);
            }
            return Step::wait(State::WaitForTestReply);
        }

        self.rx.valid = false;
        let info = self.rx.frame.info;
        if info.frame_type == FrameType::TestResponse && self.is_for_us(info.destination) {
            self.link.deliver_mgmt(&info, &self.rx.frame.payload);
            return Step::now(State::DoneWithToken);
        }
        warn!(
            "[{}] unexpected {:?} from {} while waiting for a test reply",
            self.link.tag, info.frame_type, info.source
        );
        self.link.deliver_no_reply();
        Step::now(State::Idle)
    }

    fn done_with_token(&mut self) -> Step {
        let n_poll = self.link.config.n_poll;

        if self.frame_count < self.link.config.max_info_frames {
            return Step::now(State::UseToken);
        }

        if !self.sole_master && self.ns == self.ts {
            let ps = self.next(self.ts);
            return self.poll(ps);
        }

        if self.token_count < n_poll - 1 {
            if self.sole_master && self.ns != self.next(self.ts) {
                self.token_count = n_poll - 1;
                self.retry_count = 0;
                self.rx.event_count = 0;
                return Step::now(State::UseToken);
            }
            self.token_count += 1;
            return self.pass_token();
        }

        if self.next(self.ps) == self.ns {
            self.token_count = 1;
            if self.sole_master {
                let ps = self.next(self.ns);
                self.set_next_station(self.ts);
                return self.poll(ps);
            }
            self.ps = self.ts;
            return self.pass_token();
        }

        // Maintenance poll of the next address in the gap.
        let ps = self.next(self.ps);
        self.poll(ps)
    }

    fn find_new_successor(&mut self) -> Step {
        let ps = self.next(self.ns);
        info!(
            "[{}] next station {} does not answer, polling for a successor",
            self.link.tag, self.ns
        );
        self.set_next_station(self.ts);
        self.token_count = 0;
        *self.link.netmap.lock() = NetMap::with(self.station());
        self.poll(ps)
    }

    fn pass_token_state(&mut self) -> Step {
        let retries = self.link.config.n_retry_token;
        if self.retry_count >= retries {
            return self.find_new_successor();
        }
        if self.rx.silence() <= self.link.timing.usage_timeout {
            if self.saw_frames() {
                return Step::now(State::Idle);
            }
            return Step::wait(State::PassToken);
        }
        self.retry_count += 1;
        self.rx.event_count = 0;
        debug!(
            "[{}] token to {} not used, retry {}",
            self.link.tag, self.ns, self.retry_count
        );
        Step::wait(State::PassToken).fast(FrameType::Token, Address::from_wire(self.ns))
    }

    fn generate_token(&mut self) -> Step {
        let ps = self.next(self.ts);
        info!("[{}] generating a token", self.link.tag);
        self.set_next_station(self.ts);
        self.token_count = 0;
        // The ring is rebuilt from the polls that follow.
        *self.link.netmap.lock() = NetMap::with(self.station());
        self.poll(ps)
    }

    fn no_token(&mut self) -> Step {
        let timing = &self.link.timing;
        let silence = self.rx.silence();

        if silence < timing.no_token_slot(self.ts)
            && self.maintenance.elapsed() < timing.maintenance
        {
            if self.saw_frames() {
                return Step::now(State::Idle);
            }
            return Step::wait(State::NoToken);
        }
        // Our slot, or every slot has passed without anybody taking over.
        if silence < timing.no_token_slot(self.ts + 1)
            || silence >= timing.no_token_slot(self.n_max + 1)
        {
            return self.generate_token();
        }
        if self.saw_frames() {
            return Step::now(State::Idle);
        }
        Step::wait(State::NoToken)
    }

    fn poll_for_master(&mut self) -> Step {
        if self.rx.valid {
            self.rx.valid = false;
            let info = self.rx.frame.info;
            if info.frame_type != FrameType::ReplyToPollForMaster
                || !self.is_for_us(info.destination)
            {
                return Step::now(State::Idle);
            }
            let source = *info.source;
            if self.ns != source {
                debug!("[{}] next station {}", self.link.tag, source);
                self.set_next_station(source);
                self.link.netmap.lock().insert(info.source);
            }
            self.ps = self.ts;
            self.token_count = 0;
            if self.sole_master {
                self.sole_master = false;
                info!("[{}] another master joined", self.link.tag);
                self.link.emit(Event::MultiMaster);
                self.link.tx_gate.open();
            }
            return self.pass_token();
        }

        if self.rx.silence() < self.link.timing.pfm_timeout && !self.rx.invalid {
            return Step::wait(State::PollForMaster);
        }
        self.rx.invalid = false;

        if self.sole_master {
            self.frame_count = 0;
            return Step::now(State::UseToken);
        }
        if self.ns != self.ts {
            return self.pass_token();
        }
        if self.next(self.ps) != self.ts {
            let ps = self.next(self.ps);
            return self.poll(ps);
        }

        self.frame_count = 0;
        self.sole_master = true;
        *self.link.netmap.lock() = NetMap::with(self.station());
        info!("[{}] sole master", self.link.tag);
        self.link.emit(Event::SoleMaster);
        self.link.link_up();
        Step::now(State::UseToken)
    }
}

impl<'a> StateMachine for Master<'a> {
    fn state(&self) -> State {
        self.state
    }

    fn timeout(&self) -> Duration {
        let timing = &self.link.timing;
        let silence = self.rx.silence();
        let limit = match self.state {
            State::Initialize => INIT_TIMEOUT,
            State::Idle => timing.no_token,
            State::NoToken => {
                let slot = timing.no_token_slot(self.ts);
                if silence < slot {
                    slot
                } else {
                    timing.no_token_slot(self.n_max + 1)
                }
            }
            State::PollForMaster => timing.pfm_timeout,
            State::PassToken => timing.usage_timeout,
            State::UseToken => USE_TOKEN_TIMEOUT,
            State::WaitForReply | State::WaitForTestReply => timing.reply_timeout,
            State::AnswerDataRequest => {
                return timing.reply_delay.saturating_sub(silence).min(ANSWER_POLL)
            }
            State::DoneWithToken | State::AnswerTestRequest => Duration::ZERO,
        };
        limit.saturating_sub(silence)
    }

    fn transition(&mut self) -> Step {
        match self.state {
            State::Initialize => self.initialize(),
            State::Idle => self.idle(),
            State::NoToken => self.no_token(),
            State::PollForMaster => self.poll_for_master(),
            State::PassToken => self.pass_token_state(),
            State::UseToken => self.use_token(),
            State::DoneWithToken => self.done_with_token(),
            State::WaitForReply => self.wait_for_reply(),
            State::WaitForTestReply => self.wait_for_test_reply(),
            State::AnswerDataRequest => node::answer_data(self.link, &self.rx, self.requester),
            State::AnswerTestRequest => node::answer_test(&mut self.rx),
        }
    }

    fn enter(&mut self, state: State) {
        self.state = state;
    }

    fn rx(&mut self) -> &mut RxContext {
        &mut self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for value in 0..=10u8 {
            assert_eq!(State::from_u8(value) as u8, value);
        }
        assert_eq!(State::from_u8(200), State::Initialize);
    }
}
