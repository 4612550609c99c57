mod common;

use std::thread;
use std::time::Duration;

use mstp_link::{addr, Address, Event, FrameType, Link, MgmtHandler, Reply, Role};

use common::{init_logger, test_config, Rs485Bus};

/// Doubles the argument, counting the payload bytes.
struct Doubler;

impl MgmtHandler for Doubler {
    fn request(&mut self, _source: Address, opcode: u8, argument: u8, payload: &[u8]) -> u8 {
        match opcode {
            0x10 => argument.wrapping_mul(2),
            0x11 => payload.iter().filter(|&&b| b != 0).count() as u8,
            _ => 0xff,
        }
    }
}

fn master_and_slave(bus: &std::sync::Arc<Rs485Bus>) -> (Link, Link) {
    let master = Link::new("master", 1, Role::Master, test_config(), bus.port()).unwrap();
    let slave = Link::new("slave", 20, Role::Slave, test_config(), bus.port()).unwrap();
    master.resume();
    slave.resume();
    assert!(master.wait_up(Duration::from_secs(3)));
    (master, slave)
}

#[test]
fn request_and_answer() {
    init_logger();
    let bus = Rs485Bus::new();
    let (master, slave) = master_and_slave(&bus);
    // The slave comes up on the first frame addressed to it.
    assert!(!slave.is_up());

    let responder = thread::spawn(move || {
        let mut buf = [0; 64];
        for _ in 0..3 {
            let (len, info) = slave.recv(&mut buf).unwrap();
            assert_eq!(info.frame_type, FrameType::BacnetDataExpectingReply);
            assert_eq!(info.destination, addr(20));
            buf[..len].reverse();
            slave
                .send(info.source, FrameType::BacnetDataNotExpectingReply, &buf[..len])
                .unwrap();
        }
        slave
    });

    let mut buf = [0; 64];
    for msg in [&b"abc"[..], b"hello", b"x"].iter() {
        master
            .send(addr(20), FrameType::BacnetDataExpectingReply, msg)
            .unwrap();
        let (len, info) = master.recv(&mut buf).unwrap();
        let mut expected = msg.to_vec();
        expected.reverse();
        assert_eq!(&buf[..len], expected.as_slice());
        assert_eq!(info.source, addr(20));
        assert_eq!(info.frame_type, FrameType::BacnetDataNotExpectingReply);
    }

    let slave = responder.join().unwrap();
    assert!(slave.is_up());
    let stats = slave.stats(false);
    assert_eq!(stats.rx_unicast, 3);
    assert_eq!(stats.tx_unicast, 3);
    assert_eq!(stats.tx_token, 0);
    assert_eq!(stats.tx_pfm, 0);
}

#[test]
fn slow_answer_is_postponed() {
    init_logger();
    let bus = Rs485Bus::new();
    let mut monitor = bus.port();
    let (master, slave) = master_and_slave(&bus);

    master
        .send(addr(20), FrameType::BacnetDataExpectingReply, b"late")
        .unwrap();
    let postponed = monitor
        .recv_matching(Duration::from_secs(2), |f| {
            f.info.frame_type == FrameType::ReplyPostponed
        })
        .unwrap();
    assert_eq!(postponed.info.source, addr(20));
    assert_eq!(postponed.info.destination, addr(1));

    // Read the request only now: the answer goes out on a later token.
    let mut buf = [0; 8];
    let (len, info) = slave.recv(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"late");
    slave
        .send(info.source, FrameType::BacnetDataNotExpectingReply, b"sorry")
        .unwrap();

    // A slave never holds the token, its answer waits for the next request.
    master
        .send(addr(20), FrameType::BacnetDataExpectingReply, b"again")
        .unwrap();
    let (len, info) = master.recv(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"sorry");
    assert_eq!(info.source, addr(20));
    let (len, _) = slave.recv(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"again");
}

#[test]
fn management_request_to_slave() {
    init_logger();
    let bus = Rs485Bus::new();
    let (master, slave) = master_and_slave(&bus);
    slave.set_mgmt_handler(Doubler);
    let events = slave.subscribe();

    assert_eq!(
        master.send_request(addr(20), 0x10, 21, &[]).unwrap(),
        Reply::Value(42)
    );
    assert_eq!(
        master.send_request(addr(20), 0x11, 0, &[1, 0, 3, 4, 5]).unwrap(),
        Reply::Value(4)
    );
    assert_eq!(
        master.send_request(addr(20), 0x55, 0, &[]).unwrap(),
        Reply::Value(0xff)
    );

    let mut requests = Vec::new();
    while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
        if let Event::MgmtRequest { source, opcode } = event {
            requests.push((source, opcode));
        }
    }
    assert_eq!(
        requests,
        vec![(addr(1), 0x10), (addr(1), 0x11), (addr(1), 0x55)]
    );
    assert!(slave.stats(false).rx_mgmt >= 3);
}
