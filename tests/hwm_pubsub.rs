//! High-water-mark behaviour of PUB/SUB pairs over every transport.
//!
//! Each scenario binds a PUB, connects a SUB, saturates the connection and
//! drains it again.

mod common;

use std::thread;

use common::*;
use hwmpipe::{FlowError, FlowPolicy, Message};

/// DROP policy: non-blocking publishing `count` messages delivers exactly
/// `send_hwm` of them, all of which are then received.
fn check_drop_saturation(send_hwm: usize, count: usize, transport: Transport) {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_send_hwm(send_hwm);
    connect_pair(&publisher, &subscriber, transport);

    let mut delivered = 0;
    let mut dropped = 0;
    for _ in 0..count {
        let summary = publisher.send("test message", true).unwrap();
        delivered += summary.delivered;
        dropped += summary.dropped;
    }
    assert_eq!(delivered, send_hwm.min(count));
    assert_eq!(dropped, count.saturating_sub(send_hwm));

    assert_eq!(recv_exact(&subscriber, delivered), delivered);
    assert_quiet(&subscriber, 50);
    ctx.terminate();
}

/// BLOCK policy: interleave non-blocking publishing with draining until
/// `count` messages went out; every one of them must arrive.
fn check_block_saturation(send_hwm: usize, count: usize, transport: Transport) {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_send_hwm(send_hwm);
    publisher.set_flow_policy(FlowPolicy::Block);
    connect_pair(&publisher, &subscriber, transport);
    subscriber.set_recv_timeout_ms(10);

    let mut send_count = 0;
    let mut recv_count = 0;
    let mut would_block = 0;
    while send_count < count {
        match publisher.send(Message::empty(), true) {
            Ok(summary) => {
                assert_eq!(summary.delivered, 1);
                send_count += 1;
            }
            Err(FlowError::WouldBlock) => {
                would_block += 1;
                recv_count += drain(&subscriber);
            }
            Err(e) => panic!("Unexpected send failure: {}", e),
        }
    }
    // count > send_hwm, so the pipe must have muted at least once
    assert!(would_block > 0);

    recv_count += recv_exact(&subscriber, send_count - recv_count);
    assert_eq!(recv_count, send_count);
    assert_eq!(recv_count, count);
    assert_quiet(&subscriber, 50);
    ctx.terminate();
}

/// BLOCK policy: one thread publishes `count` messages with blocking sends
/// while another drains continuously; everything sent arrives, in order.
fn check_block_concurrent_drain(send_hwm: usize, count: u32, transport: Transport) {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_send_hwm(send_hwm);
    publisher.set_flow_policy(FlowPolicy::Block);
    // bounded, so a stuck pipe fails the test instead of hanging it
    publisher.set_send_timeout_ms(ARRIVAL_TIMEOUT_MS);
    connect_pair(&publisher, &subscriber, transport);
    subscriber.set_recv_timeout_ms(ARRIVAL_TIMEOUT_MS);

    let (sent, received) = thread::scope(|s| {
        let sender = s.spawn(|| {
            let mut sent = 0u32;
            for i in 0..count {
                let summary = publisher.send(i.to_be_bytes().to_vec(), false).unwrap();
                assert_eq!(summary.delivered, 1);
                sent += 1;
            }
            sent
        });
        let receiver = s.spawn(|| {
            let mut received = 0u32;
            while received < count {
                let msg = subscriber.recv(false).unwrap();
                assert_eq!(msg.body().as_ref(), &received.to_be_bytes()[..]);
                received += 1;
            }
            received
        });
        (sender.join().unwrap(), receiver.join().unwrap())
    });

    assert_eq!(sent, count);
    assert_eq!(received, sent);
    assert_quiet(&subscriber, 50);
    ctx.terminate();
}

/// Occupancy, not a lifetime counter, decides muting: two batches that each
/// fit under the HWM both go through in full.
fn check_occupancy_reset(transport: Transport) {
    const HWM: usize = 11_024;
    const FIRST_BATCH: usize = 9_999;
    const SECOND_BATCH: usize = 1_100;

    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_send_hwm(HWM);
    subscriber.set_recv_hwm(HWM);
    connect_pair(&publisher, &subscriber, transport);

    for batch in [FIRST_BATCH, SECOND_BATCH] {
        for _ in 0..batch {
            let summary = publisher.send("x", true).unwrap();
            assert_eq!(summary.delivered, 1);
        }
        assert_eq!(recv_exact(&subscriber, batch), batch);
    }
    assert_quiet(&subscriber, 50);
    ctx.terminate();
}

#[test]
fn test_defaults_tcp() {
    check_drop_saturation(1000, 1000, Transport::Tcp);
    check_drop_saturation(100, 100, Transport::Tcp);
}

#[test]
fn test_defaults_inproc() {
    check_drop_saturation(1000, 1000, Transport::Inproc);
    check_drop_saturation(100, 100, Transport::Inproc);
}

#[cfg(all(unix, feature = "ipc"))]
#[test]
fn test_defaults_ipc() {
    check_drop_saturation(1000, 1000, Transport::Ipc);
    check_drop_saturation(100, 100, Transport::Ipc);
}

#[test]
fn test_drop_excess_tcp() {
    check_drop_saturation(2000, 6000, Transport::Tcp);
}

#[test]
fn test_drop_excess_inproc() {
    check_drop_saturation(2000, 6000, Transport::Inproc);
}

#[cfg(all(unix, feature = "ipc"))]
#[test]
fn test_drop_excess_ipc() {
    check_drop_saturation(2000, 6000, Transport::Ipc);
}

#[test]
fn test_blocking_tcp() {
    check_block_saturation(2000, 6000, Transport::Tcp);
}

#[test]
fn test_blocking_inproc() {
    check_block_saturation(2000, 6000, Transport::Inproc);
}

#[cfg(all(unix, feature = "ipc"))]
#[test]
fn test_blocking_ipc() {
    check_block_saturation(2000, 6000, Transport::Ipc);
}

#[test]
fn test_block_concurrent_drain_tcp() {
    check_block_concurrent_drain(2000, 6000, Transport::Tcp);
}

#[test]
fn test_block_concurrent_drain_inproc() {
    check_block_concurrent_drain(2000, 6000, Transport::Inproc);
}

#[cfg(all(unix, feature = "ipc"))]
#[test]
fn test_block_concurrent_drain_ipc() {
    check_block_concurrent_drain(2000, 6000, Transport::Ipc);
}

#[test]
fn test_reset_hwm_tcp() {
    check_occupancy_reset(Transport::Tcp);
}

#[test]
fn test_reset_hwm_inproc() {
    check_occupancy_reset(Transport::Inproc);
}

#[cfg(all(unix, feature = "ipc"))]
#[test]
fn test_reset_hwm_ipc() {
    check_occupancy_reset(Transport::Ipc);
}

#[test]
fn test_per_peer_fifo() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    connect_pair(&publisher, &subscriber, Transport::Tcp);

    for i in 0u32..500 {
        publisher.send(i.to_be_bytes().to_vec(), true).unwrap();
    }
    subscriber.set_recv_timeout_ms(ARRIVAL_TIMEOUT_MS);
    for i in 0u32..500 {
        let msg = subscriber.recv(false).unwrap();
        assert_eq!(msg.body().as_ref(), &i.to_be_bytes()[..]);
    }
    ctx.terminate();
}
