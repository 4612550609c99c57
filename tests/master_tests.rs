mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mstp_link::{addr, Address, Event, FrameType, Link, Role, State};

use common::{init_logger, test_config, wait_until, Rs485Bus};

/// Collect events until `wanted` shows up or `timeout` passes.
fn wait_event(events: &Receiver<Event>, wanted: Event, timeout: Duration) -> Vec<Event> {
    let deadline = Instant::now() + timeout;
    let mut seen = Vec::new();
    while let Ok(event) =
        events.recv_timeout(deadline.saturating_duration_since(Instant::now()))
    {
        seen.push(event);
        if event == wanted {
            break;
        }
    }
    seen
}

#[test]
fn sole_master() {
    init_logger();
    let bus = Rs485Bus::new();
    let mut monitor = bus.port();
    let link = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let events = link.subscribe();
    assert_eq!(link.state(), State::Initialize);
    assert!(!link.is_up());

    link.resume();
    assert!(link.wait_up(Duration::from_secs(3)));
    let seen = wait_event(&events, Event::LinkUp, Duration::from_secs(1));
    assert!(seen.contains(&Event::TokenLost));
    assert!(seen.contains(&Event::SoleMaster));
    assert!(seen.contains(&Event::LinkUp));
    assert_eq!(link.role(), Role::Master);

    // The sole master keeps polling the address gap for new masters.
    let poll = monitor
        .recv_matching(Duration::from_secs(2), |f| {
            f.info.frame_type == FrameType::PollForMaster
        })
        .unwrap();
    assert_eq!(poll.info.source, addr(1));
    assert_ne!(poll.info.destination, addr(1));

    assert_eq!(link.next_station(), addr(1));
    assert_eq!(link.netmap().len(), 1);
    assert!(link.first_address());
    let stats = link.stats(true);
    assert!(stats.tx_pfm > 0);
    assert_eq!(stats.token_lost, 1);
}

#[test]
fn resumed_master_listens_before_claiming_token() {
    init_logger();
    let bus = Rs485Bus::new();
    let link = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let events = link.subscribe();
    link.resume();

    // Idle lasts a full no token period on a silent bus.
    assert!(wait_until(Duration::from_secs(1), || link.state() == State::Idle));
    let idle_since = Instant::now();
    let seen = wait_event(&events, Event::TokenLost, Duration::from_secs(1));
    assert_eq!(seen.last(), Some(&Event::TokenLost));
    assert!(idle_since.elapsed() >= Duration::from_millis(90));
}

#[test]
fn link_up_once_per_transition() {
    init_logger();
    let bus = Rs485Bus::new();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    let events = m1.subscribe();
    m1.resume();
    m3.resume();
    assert!(wait_until(Duration::from_secs(5), || {
        m1.next_station() == addr(3) && m3.next_station() == addr(1)
    }));
    // Many token rounds, still a single link up.
    thread::sleep(Duration::from_millis(500));
    let count = |events: &Receiver<Event>| {
        events
            .try_iter()
            .filter(|e| *e == Event::LinkUp)
            .count()
    };
    assert_eq!(count(&events), 1);

    m1.stop();
    let seen = wait_event(&events, Event::LinkDown, Duration::from_secs(1));
    assert!(!seen.contains(&Event::LinkUp));
    m1.resume();
    assert!(m1.wait_up(Duration::from_secs(3)));
    thread::sleep(Duration::from_millis(500));
    assert_eq!(count(&events), 1);
}

#[test]
fn only_token_holder_transmits() {
    init_logger();
    let bus = Rs485Bus::new();
    let mut monitor = bus.port();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    m1.resume();
    m3.resume();
    assert!(wait_until(Duration::from_secs(5), || {
        m1.next_station() == addr(3) && m3.next_station() == addr(1)
    }));

    let stop = Arc::new(AtomicBool::new(false));
    let senders: Vec<_> = vec![m1, m3]
        .into_iter()
        .map(|link| {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    let _ = link.send(
                        Address::BROADCAST,
                        FrameType::BacnetDataNotExpectingReply,
                        &[*link.address()],
                    );
                }
                link
            })
        })
        .collect();

    monitor.flush();
    let mut holder = None;
    let mut last_token = None;
    let mut data_from = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(1);
    while Instant::now() < deadline {
        let frame = match monitor.recv_frame(Duration::from_millis(200)) {
            Some(frame) => frame,
            None => continue,
        };
        let info = frame.info;
        let held_by = match holder {
            Some(held_by) => held_by,
            None => {
                if info.frame_type == FrameType::Token {
                    holder = Some(info.destination);
                    last_token = Some((info.source, info.destination));
                }
                continue;
            }
        };
        match info.frame_type {
            FrameType::Token => {
                // A retry repeats the previous pass.
                let retry = last_token == Some((info.source, info.destination));
                assert!(
                    info.source == held_by || retry,
                    "token from {} while {} holds it",
                    info.source,
                    held_by
                );
                holder = Some(info.destination);
                last_token = Some((info.source, info.destination));
            }
            FrameType::PollForMaster => assert_eq!(info.source, held_by),
            t if t.is_data() => {
                assert_eq!(info.source, held_by, "data without the token");
                data_from.push(info.source);
            }
            _ => {}
        }
    }

    stop.store(true, Ordering::Relaxed);
    for sender in senders {
        sender.join().unwrap();
    }
    assert!(data_from.contains(&addr(1)));
    assert!(data_from.contains(&addr(3)));
}

#[test]
fn sole_master_sends_data() {
    init_logger();
    let bus = Rs485Bus::new();
    let mut monitor = bus.port();
    let link = Link::new("m2", 2, Role::Master, test_config(), bus.port()).unwrap();
    link.resume();
    assert!(link.wait_up(Duration::from_secs(3)));

    link.send(addr(30), FrameType::BacnetDataNotExpectingReply, b"ping")
        .unwrap();
    let frame = monitor
        .recv_matching(Duration::from_secs(1), |f| f.info.frame_type.is_data())
        .unwrap();
    assert_eq!(frame.info.destination, addr(30));
    assert_eq!(frame.info.source, addr(2));
    assert_eq!(frame.payload.as_slice(), b"ping");
    assert!(wait_until(Duration::from_secs(1), || link.stats(false).tx_unicast == 1));
}

#[test]
fn two_masters_converge() {
    init_logger();
    let bus = Rs485Bus::new();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    m1.resume();
    m3.resume();

    assert!(wait_until(Duration::from_secs(5), || {
        m1.next_station() == addr(3) && m3.next_station() == addr(1)
    }));
    assert!(m1.is_up() && m3.is_up());
    assert!(m1.netmap().contains(addr(3)));
    assert!(m1.first_address());
    assert!(!m3.first_address());

    // Both hold the token in turn.
    m1.stats(true);
    m3.stats(true);
    assert!(wait_until(Duration::from_secs(2), || {
        m1.stats(false).rx_token > 2 && m3.stats(false).rx_token > 2
    }));
    let active: Vec<_> = m1.active().into_iter().map(|(a, _)| a).collect();
    assert!(active.contains(&addr(3)));

    // Broadcast data reaches the other master.
    m3.send(
        mstp_link::Address::BROADCAST,
        FrameType::BacnetDataNotExpectingReply,
        &[1, 2, 3],
    )
    .unwrap();
    let mut buf = [0; 16];
    let (len, info) = m1.recv(&mut buf).unwrap();
    assert_eq!(&buf[..len], &[1, 2, 3]);
    assert_eq!(info.source, addr(3));
    assert!(info.is_broadcast());
}

#[test]
fn successor_disappears() {
    init_logger();
    let bus = Rs485Bus::new();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    m1.resume();
    m3.resume();
    assert!(wait_until(Duration::from_secs(5), || m1.next_station() == addr(3)));

    let events = m1.subscribe();
    drop(m3);
    let seen = wait_event(&events, Event::SoleMaster, Duration::from_secs(5));
    assert_eq!(seen.last(), Some(&Event::SoleMaster));
    assert_eq!(m1.next_station(), addr(1));
    assert!(!m1.netmap().contains(addr(3)));
}

#[test]
fn ring_survives_lost_frame() {
    init_logger();
    let bus = Rs485Bus::new();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    m1.resume();
    m3.resume();
    assert!(wait_until(Duration::from_secs(5), || {
        m1.next_station() == addr(3) && m3.next_station() == addr(1)
    }));

    bus.drop_frames(1);
    thread::sleep(Duration::from_millis(500));
    m1.stats(true);
    m3.stats(true);
    assert!(wait_until(Duration::from_secs(2), || {
        m1.stats(false).rx_token > 2 && m3.stats(false).rx_token > 2
    }));
    assert_eq!(m1.next_station(), addr(3));
    assert!(m1.is_up() && m3.is_up());
}

#[test]
fn stop_and_change_role() {
    init_logger();
    let bus = Rs485Bus::new();
    let link = Link::new("role", 4, Role::Master, test_config(), bus.port()).unwrap();
    assert!(matches!(
        link.set_address(100),
        Err(mstp_link::Error::InvalidAddress)
    ));
    link.set_address(5).unwrap();
    assert_eq!(link.address(), addr(5));

    link.resume();
    assert!(link.wait_up(Duration::from_secs(3)));
    assert!(matches!(
        link.set_address(6),
        Err(mstp_link::Error::NotInitializing)
    ));

    let events = link.subscribe();
    link.stop();
    assert!(wait_until(Duration::from_secs(1), || {
        link.state() == State::Initialize
    }));
    assert!(!link.is_up());
    assert_eq!(events.recv_timeout(Duration::from_secs(1)), Ok(Event::LinkDown));

    link.set_role(Role::Slave).unwrap();
    assert_eq!(link.role(), Role::Slave);
    link.set_address(100).unwrap();
    link.set_role(Role::None).unwrap();
    assert_eq!(link.role(), Role::None);
}
