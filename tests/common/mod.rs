//! Shared utilities for integration tests.
//!
//! Socket pair setup per transport, plus drain helpers that wait on receive
//! timeouts instead of fixed sleeps.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use hwmpipe::utils::bootstrap::init_tracing;
use hwmpipe::{FlowError, IoContext, PubSocket, SubSocket};

/// How long to wait for one message that is known to be on its way.
pub const ARRIVAL_TIMEOUT_MS: i64 = 5_000;

/// Transports every HWM scenario is repeated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Inproc,
    #[cfg(all(unix, feature = "ipc"))]
    Ipc,
}

impl Transport {
    /// Endpoint to bind; wildcards are resolved by `bind`.
    pub fn bind_endpoint(self) -> String {
        match self {
            Transport::Tcp => "tcp://127.0.0.1:*".to_string(),
            Transport::Inproc => format!("inproc://test-{}", uuid::Uuid::new_v4().simple()),
            #[cfg(all(unix, feature = "ipc"))]
            Transport::Ipc => "ipc://*".to_string(),
        }
    }
}

/// Creates a context with tracing installed.
pub fn context() -> IoContext {
    init_tracing();
    IoContext::new().expect("Failed to start I/O context")
}

/// Binds `publisher` on `transport` and connects `subscriber` to it.
///
/// Options must be set beforehand: the connection's pipes are sized when it
/// is established.
pub fn connect_pair(publisher: &PubSocket, subscriber: &SubSocket, transport: Transport) -> String {
    let endpoint = publisher
        .bind(&transport.bind_endpoint())
        .expect("Failed to bind publisher");
    subscriber
        .connect(&endpoint)
        .expect("Failed to connect subscriber");
    endpoint
}

/// Receives exactly `count` messages, each within `ARRIVAL_TIMEOUT_MS`.
///
/// Returns how many actually arrived before a timeout.
pub fn recv_exact(subscriber: &SubSocket, count: usize) -> usize {
    subscriber.set_recv_timeout_ms(ARRIVAL_TIMEOUT_MS);
    for received in 0..count {
        match subscriber.recv(false) {
            Ok(_) => {}
            Err(FlowError::TimedOut) => return received,
            Err(e) => panic!("Receive failed: {}", e),
        }
    }
    count
}

/// Receives until the socket's receive timeout expires.
pub fn drain(subscriber: &SubSocket) -> usize {
    let mut received = 0;
    loop {
        match subscriber.recv(false) {
            Ok(_) => received += 1,
            Err(FlowError::TimedOut) => return received,
            Err(e) => panic!("Receive failed: {}", e),
        }
    }
}

/// Asserts nothing more arrives within `ms`.
pub fn assert_quiet(subscriber: &SubSocket, ms: i64) {
    subscriber.set_recv_timeout_ms(ms);
    match subscriber.recv(false) {
        Err(FlowError::TimedOut) => {}
        other => panic!("Expected no further messages, got {:?}", other),
    }
}

/// Polls `condition` until it holds or `limit` passes.
pub fn wait_for(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
