//! hwmpipe-probe: high-water-mark probe
//!
//! Binds a publisher, connects one subscriber, publishes a burst without
//! blocking, then drains the subscriber and reports how many messages made
//! it through the pipe before the HWM kicked in.
//!
//! ## Configuration
//! - PROBE_ENDPOINT: endpoint to bind (default: inproc://probe)
//! - PROBE_MESSAGES: messages in the burst (default: 10000)
//! - HWMPIPE_CONFIG / HWMPIPE__*: socket and I/O settings
//! - HWMPIPE_LOG: log filter (default: info)

use std::time::Instant;

use tracing::{info, warn};

use hwmpipe::utils::bootstrap::init_tracing;
use hwmpipe::{Config, FlowError, IoContext};

const DEFAULT_ENDPOINT: &str = "inproc://probe";
const DEFAULT_MESSAGES: usize = 10_000;

/// Receive timeout used while draining, in milliseconds.
const DRAIN_TIMEOUT_MS: i64 = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let config = Config::load(None)?;

    let endpoint = std::env::var("PROBE_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    let messages = std::env::var("PROBE_MESSAGES")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(DEFAULT_MESSAGES);

    let ctx = IoContext::from_config(&config)?;
    let publisher = ctx.pub_socket()?;
    let subscriber = ctx.sub_socket()?;
    subscriber.set_recv_timeout_ms(DRAIN_TIMEOUT_MS);

    let bound = publisher.bind(&endpoint)?;
    subscriber.connect(&bound)?;
    info!(
        endpoint = %bound,
        send_hwm = config.socket.send_hwm,
        recv_hwm = config.socket.recv_hwm,
        policy = ?config.socket.flow_policy,
        "hwmpipe-probe started"
    );

    let started = Instant::now();
    let mut sent = 0usize;
    let mut dropped = 0usize;
    for i in 0..messages {
        match publisher.send(i.to_be_bytes().to_vec(), true) {
            Ok(summary) => {
                sent += summary.delivered;
                dropped += summary.dropped;
            }
            Err(FlowError::WouldBlock) => break,
            Err(e) => return Err(e.into()),
        }
    }

    let mut received = 0usize;
    loop {
        match subscriber.recv(false) {
            Ok(_) => received += 1,
            Err(FlowError::TimedOut) => break,
            Err(e) => return Err(e.into()),
        }
    }

    if received != sent {
        warn!(sent, received, "Delivered and received counts differ");
    }
    info!(
        attempted = messages,
        delivered = sent,
        dropped,
        received,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Probe finished"
    );

    ctx.terminate();
    Ok(())
}
