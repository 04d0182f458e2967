//! hwmpipe - bounded publish/subscribe messaging
//!
//! A PUB socket fans every message out to all connected SUB sockets over
//! in-process, TCP, or Unix-domain-socket transports. Every connection is a
//! bounded pipe whose capacity is its high-water mark (HWM). When a pipe
//! fills, the publisher's flow policy decides: drop the message for that
//! subscriber, or block the sender until room frees up.
//!
//! Credit flows end to end: a message is only counted as released once the
//! subscriber application has received it, so a publisher with send HWM `H`
//! can deliver at most `H` messages ahead of a subscriber that is not reading.

pub mod config;
pub mod context;
pub mod fanout;
pub mod flow;
pub mod message;
pub mod pipe;
pub mod socket;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use context::IoContext;
pub use fanout::PublishSummary;
pub use flow::{Delivery, FlowError, FlowPolicy, Timeout};
pub use message::{Message, MessageFlags};
pub use socket::{PubSocket, SocketError, SocketOptions, SubSocket};
