//! Passive bus monitor. Counts and logs every frame, never transmits.

use std::time::Duration;

use log::info;

use crate::comm::Transceiver;
use crate::link::Shared;
use crate::master::State;
use crate::node::{self, RxContext};
use crate::transport::Transport;
use crate::types::{FrameType, Role};

const SNIFF_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) fn run<T: Transport>(shared: &Shared, comm: &mut Transceiver<T>) {
    if !node::enter_role(shared, Role::Sniffer) {
        return;
    }
    info!("[{}] sniffing", shared.tag);
    shared.set_state(State::Idle);

    let mut rx = RxContext::new();
    while shared.is_requested_up(Role::Sniffer) {
        rx.receive(shared, comm, SNIFF_TIMEOUT);
        if !rx.valid {
            rx.invalid = false;
            continue;
        }
        rx.valid = false;
        let info = rx.frame.info;
        if matches!(
            info.frame_type,
            FrameType::PollForMaster | FrameType::ReplyToPollForMaster | FrameType::Token
        ) {
            shared.netmap.lock().insert(info.source);
        }
    }
    shared.set_state(State::Initialize);
    info!("[{}] sniffer stopped", shared.tag);
    shared.link_down();
}
