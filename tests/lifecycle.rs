//! Close and terminate semantics, option timing and receive fairness.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::*;
use hwmpipe::{FlowError, FlowPolicy};

/// Time given to threads to reach their blocking call.
const PARK_DELAY: Duration = Duration::from_millis(50);

/// Time given to in-process relays to move queued messages.
const SETTLE_TIME: Duration = Duration::from_millis(300);

#[test]
fn test_close_releases_blocked_publisher() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_flow_policy(FlowPolicy::Block);
    publisher.set_send_hwm(1);
    connect_pair(&publisher, &subscriber, Transport::Inproc);
    publisher.send("first", true).unwrap();

    thread::scope(|s| {
        let blocked = s.spawn(|| publisher.send("second", false));
        thread::sleep(PARK_DELAY);
        publisher.close();
        assert_eq!(blocked.join().unwrap(), Err(FlowError::Closed));
    });
    assert!(publisher.is_closed());
}

#[test]
fn test_close_releases_blocked_receiver() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    connect_pair(&publisher, &subscriber, Transport::Tcp);

    thread::scope(|s| {
        let blocked = s.spawn(|| subscriber.recv(false));
        thread::sleep(PARK_DELAY);
        subscriber.close();
        assert_eq!(blocked.join().unwrap(), Err(FlowError::Closed));
    });
}

#[test]
fn test_terminate_releases_blocked_callers() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_flow_policy(FlowPolicy::Block);
    publisher.set_send_hwm(1);
    connect_pair(&publisher, &subscriber, Transport::Tcp);
    publisher.send("fills the pipe", true).unwrap();

    let idle = ctx.sub_socket().unwrap();
    thread::scope(|s| {
        let sender = s.spawn(|| publisher.send("blocked", false));
        let receiver = s.spawn(|| idle.recv(false));
        thread::sleep(PARK_DELAY);
        ctx.terminate();
        assert_eq!(sender.join().unwrap(), Err(FlowError::Closed));
        assert_eq!(receiver.join().unwrap(), Err(FlowError::Closed));
    });
    assert!(publisher.is_closed());
    assert!(subscriber.is_closed());
}

#[test]
fn test_blocked_publisher_wakes_after_one_receive() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_flow_policy(FlowPolicy::Block);
    publisher.set_send_hwm(1);
    connect_pair(&publisher, &subscriber, Transport::Inproc);
    publisher.send("first", true).unwrap();
    assert_eq!(publisher.send("second", true), Err(FlowError::WouldBlock));

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            let summary = publisher.send("second", false).unwrap();
            (summary.delivered, Instant::now())
        });
        thread::sleep(PARK_DELAY);
        subscriber.set_recv_timeout_ms(ARRIVAL_TIMEOUT_MS);
        let first = subscriber.recv(false).unwrap();
        let received_at = Instant::now();
        assert_eq!(first.body().as_ref(), b"first");

        let (delivered, sent_at) = blocked.join().unwrap();
        assert_eq!(delivered, 1);
        assert!(sent_at.saturating_duration_since(received_at) < Duration::from_secs(1));
    });

    let second = subscriber.recv(false).unwrap();
    assert_eq!(second.body().as_ref(), b"second");
}

#[test]
fn test_send_timeout_expires() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    publisher.set_flow_policy(FlowPolicy::Block);
    publisher.set_send_hwm(1);
    publisher.set_send_timeout_ms(20);
    connect_pair(&publisher, &subscriber, Transport::Inproc);

    publisher.send("first", true).unwrap();
    let started = Instant::now();
    assert_eq!(publisher.send("second", false), Err(FlowError::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn test_options_are_not_retroactive() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    publisher.set_flow_policy(FlowPolicy::Block);
    publisher.set_send_hwm(5);
    let endpoint = publisher.bind("inproc://not-retroactive").unwrap();

    let roomy = ctx.sub_socket().unwrap();
    roomy.connect(&endpoint).unwrap();
    publisher.set_send_hwm(2);
    let tight = ctx.sub_socket().unwrap();
    tight.connect(&endpoint).unwrap();
    assert_eq!(publisher.peer_count(), 2);

    // the later, tighter pipe mutes first and holds everyone back
    for _ in 0..2 {
        assert_eq!(publisher.send("m", true).unwrap().delivered, 2);
    }
    assert_eq!(publisher.send("m", true), Err(FlowError::WouldBlock));

    tight.close();
    assert!(wait_for(Duration::from_secs(5), || publisher.peer_count() == 1));

    // the first pipe kept its original HWM of 5
    for _ in 0..3 {
        assert_eq!(publisher.send("m", true).unwrap().delivered, 1);
    }
    assert_eq!(publisher.send("m", true), Err(FlowError::WouldBlock));
}

#[test]
fn test_fair_rotation_across_publishers() {
    let ctx = context();
    let subscriber = ctx.sub_socket().unwrap();
    let endpoint = subscriber.bind("inproc://fair-rotation").unwrap();

    let first = ctx.pub_socket().unwrap();
    first.connect(&endpoint).unwrap();
    let second = ctx.pub_socket().unwrap();
    second.connect(&endpoint).unwrap();
    assert_eq!(subscriber.peer_count(), 2);

    for i in 0..3 {
        first.send(format!("a{}", i).into_bytes(), true).unwrap();
        second.send(format!("b{}", i).into_bytes(), true).unwrap();
    }
    thread::sleep(SETTLE_TIME);

    subscriber.set_recv_timeout_ms(ARRIVAL_TIMEOUT_MS);
    let order: Vec<String> = (0..6)
        .map(|_| {
            let msg = subscriber.recv(false).unwrap();
            String::from_utf8(msg.into_body().to_vec()).unwrap()
        })
        .collect();
    assert_eq!(order, ["a0", "b0", "a1", "b1", "a2", "b2"]);
}

#[test]
fn test_disconnect_discards_undelivered() {
    let ctx = context();
    let publisher = ctx.pub_socket().unwrap();
    let subscriber = ctx.sub_socket().unwrap();
    connect_pair(&publisher, &subscriber, Transport::Tcp);

    publisher.send("lost", true).unwrap();
    subscriber.close();
    assert!(wait_for(Duration::from_secs(5), || publisher.peer_count() == 0));

    // no subscribers left: publishing succeeds and reaches nobody
    let summary = publisher.send("nobody", true).unwrap();
    assert_eq!(summary.delivered + summary.dropped, 0);
}
