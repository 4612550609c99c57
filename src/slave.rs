//! The slave state machine: answers requests, never holds the token.

use std::time::Duration;

use log::info;

use crate::comm::Transceiver;
use crate::link::Shared;
use crate::master::State;
use crate::node::{self, Addressed, RxContext, StateMachine, Step, ANSWER_POLL};
use crate::transport::Transport;
use crate::types::{Address, Role};

pub(crate) fn run<T: Transport>(shared: &Shared, comm: &mut Transceiver<T>) {
    if !node::enter_role(shared, Role::Slave) {
        return;
    }
    info!("[{}] slave {} starting", shared.tag, shared.station());
    let mut slave = Slave {
        link: shared,
        rx: RxContext::new(),
        state: State::Idle,
        station: shared.station(),
        requester: Address::BROADCAST,
    };
    node::drive(shared, comm, Role::Slave, &mut slave);
}

struct Slave<'a> {
    link: &'a Shared,
    rx: RxContext,
    state: State,
    station: Address,
    requester: Address,
}

impl<'a> Slave<'a> {
    fn idle(&mut self) -> Step {
        self.rx.invalid = false;
        if !self.rx.valid {
            return Step::wait(State::Idle);
        }
        self.rx.valid = false;
        let info = self.rx.frame.info;
        if info.destination != self.station && !info.is_broadcast() {
            return Step::wait(State::Idle);
        }

        // Being addressed is all a slave needs to know the bus works.
        self.link.link_up();
        match node::accept(self.link, &mut self.rx, self.station) {
            Addressed::AnswerData(requester) => {
                self.requester = requester;
                Step::now(State::AnswerDataRequest)
            }
            Addressed::AnswerTest => Step::now(State::AnswerTestRequest),
            Addressed::Token | Addressed::PollForMaster | Addressed::Done => {
                Step::wait(State::Idle)
            }
        }
    }
}

impl<'a> StateMachine for Slave<'a> {
    fn state(&self) -> State {
        self.state
    }

    fn timeout(&self) -> Duration {
        let timing = &self.link.timing;
        match self.state {
            State::AnswerDataRequest => timing
                .reply_delay
                .saturating_sub(self.rx.silence())
                .min(ANSWER_POLL),
            State::AnswerTestRequest => Duration::ZERO,
            _ => timing.no_token,
        }
    }

    fn transition(&mut self) -> Step {
        match self.state {
            State::AnswerDataRequest => node::answer_data(self.link, &self.rx, self.requester),
            State::AnswerTestRequest => node::answer_test(&mut self.rx),
            _ => self.idle(),
        }
    }

    fn enter(&mut self, state: State) {
        self.state = state;
    }

    fn rx(&mut self) -> &mut RxContext {
        &mut self.rx
    }
}
