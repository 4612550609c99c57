mod common;

use std::thread;
use std::time::Duration;

use mstp_link::{
    addr, Address, Error, Event, Frame, FrameInfo, FrameType, Link, MgmtHandler, Reply, Role,
    MAX_MGMT_PAYLOAD,
};

use common::{init_logger, test_config, wait_until, Rs485Bus};

struct Echo;

impl MgmtHandler for Echo {
    fn request(&mut self, _source: Address, _opcode: u8, argument: u8, _payload: &[u8]) -> u8 {
        argument.wrapping_add(1)
    }
}

#[test]
fn request_between_masters() {
    init_logger();
    let bus = Rs485Bus::new();
    let m1 = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    let m3 = Link::new("m3", 3, Role::Master, test_config(), bus.port()).unwrap();
    m3.set_mgmt_handler(Echo);
    let m3_events = m3.subscribe();
    m1.resume();
    m3.resume();
    assert!(wait_until(Duration::from_secs(5), || {
        m1.next_station() == addr(3) && m3.next_station() == addr(1)
    }));

    for arg in [0u8, 41, 255].iter() {
        assert_eq!(
            m1.send_request(addr(3), 0x20, *arg, &[1, 2, 3]).unwrap(),
            Reply::Value(arg.wrapping_add(1))
        );
    }

    // Broadcast requests are handled but never answered.
    assert_eq!(
        m1.send_request(Address::BROADCAST, 0x21, 0, &[]).unwrap(),
        Reply::Broadcast
    );
    assert!(wait_until(Duration::from_secs(1), || {
        m3_events
            .try_iter()
            .any(|e| e == Event::MgmtRequest { source: addr(1), opcode: 0x21 })
    }));
    assert!(m1.stats(false).tx_mgmt >= 4);
}

#[test]
fn loopback_and_absent_station() {
    init_logger();
    let bus = Rs485Bus::new();
    let link = Link::new("m2", 2, Role::Master, test_config(), bus.port()).unwrap();
    let events = link.subscribe();
    link.resume();
    assert!(link.wait_up(Duration::from_secs(3)));

    assert_eq!(
        link.send_request(addr(2), 0x01, 0, b"probe").unwrap(),
        Reply::Loopback
    );
    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(Duration::from_millis(500)) {
        seen.push(event);
        if event == Event::ProbeEnd {
            break;
        }
    }
    let begin = seen.iter().position(|e| *e == Event::ProbeBegin).unwrap();
    let end = seen.iter().position(|e| *e == Event::ProbeEnd).unwrap();
    assert!(begin < end);

    assert!(matches!(
        link.send_request(addr(5), 0x01, 0, &[]),
        Err(Error::NoResponse)
    ));
    assert!(matches!(
        link.send_request(addr(5), 0x01, 0, &[0; MAX_MGMT_PAYLOAD + 1]),
        Err(Error::PayloadTooLarge { .. })
    ));
}

#[test]
fn request_before_link_up_times_out() {
    init_logger();
    let bus = Rs485Bus::new();
    let config = test_config().with_send_wait(Duration::from_millis(100));
    let link = Link::new("down", 2, Role::Master, config, bus.port()).unwrap();
    assert!(matches!(
        link.send_request(addr(3), 0x01, 0, &[]),
        Err(Error::Timeout)
    ));
}

#[test]
fn response_must_match_request() {
    init_logger();
    let bus = Rs485Bus::new();
    let mut raw = bus.port();
    let link = Link::new("m1", 1, Role::Master, test_config(), bus.port()).unwrap();
    link.resume();
    assert!(link.wait_up(Duration::from_secs(3)));

    // A station at address 10 answering by hand, the second time with a wrong id.
    let responder = thread::spawn(move || {
        for corrupt_id in [false, true].iter() {
            let request = raw
                .recv_matching(Duration::from_secs(2), |f| {
                    f.info.frame_type == FrameType::TestRequest && f.info.destination == addr(10)
                })
                .unwrap();
            let mut payload = request.payload.clone();
            payload[0] |= 0x80;
            payload[1] = 7;
            if *corrupt_id {
                payload[3] ^= 1;
            }
            let info = FrameInfo::new(FrameType::TestResponse, request.info.source, addr(10));
            raw.send_frame(&Frame::new(info, &payload).unwrap());
        }
    });

    assert_eq!(
        link.send_request(addr(10), 0x30, 1, &[]).unwrap(),
        Reply::Value(7)
    );
    assert!(matches!(
        link.send_request(addr(10), 0x30, 2, &[]),
        Err(Error::Timeout)
    ));
    responder.join().unwrap();
    assert_eq!(link.stats(false).mgmt_mismatch, 1);

    // The link keeps working after a mismatch.
    assert_eq!(
        link.send_request(addr(1), 0x30, 3, &[]).unwrap(),
        Reply::Loopback
    );
}
