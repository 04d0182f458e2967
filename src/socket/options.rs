//! Per-socket options.
//!
//! Options are read when a pipe is created. Changing them later only affects
//! connections established afterwards.

use std::time::Duration;

use serde::Deserialize;

use crate::flow::{FlowPolicy, Timeout};

pub const DEFAULT_SEND_HWM: usize = 1000;
pub const DEFAULT_RECV_HWM: usize = 1000;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: i64 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Capacity of each outbound pipe (publisher side). 0 = unbounded.
    pub send_hwm: usize,
    /// Capacity of each inbound pipe (subscriber side). 0 = unbounded.
    pub recv_hwm: usize,
    /// Behaviour of outbound pipes at their high-water mark.
    pub flow_policy: FlowPolicy,
    /// Blocking send limit: 0 = never wait, negative = wait forever.
    pub send_timeout_ms: i64,
    /// Blocking receive limit: 0 = never wait, negative = wait forever.
    pub recv_timeout_ms: i64,
    /// Limit for the stream greeting; 0 or negative disables it.
    pub handshake_timeout_ms: i64,
    /// Largest accepted message body in bytes; negative = unlimited.
    pub max_message_size: i64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            send_hwm: DEFAULT_SEND_HWM,
            recv_hwm: DEFAULT_RECV_HWM,
            flow_policy: FlowPolicy::Drop,
            send_timeout_ms: -1,
            recv_timeout_ms: -1,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            max_message_size: -1,
        }
    }
}

impl SocketOptions {
    pub fn send_timeout(&self) -> Timeout {
        Timeout::from_millis(self.send_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Timeout {
        Timeout::from_millis(self.recv_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        (self.handshake_timeout_ms > 0)
            .then(|| Duration::from_millis(self.handshake_timeout_ms as u64))
    }

    pub fn message_size_limit(&self) -> Option<usize> {
        usize::try_from(self.max_message_size).ok()
    }
}
