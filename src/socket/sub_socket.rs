//! Subscriber socket.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::info;

use super::pub_socket::wire_inproc;
use super::{
    report, with_timeout, InprocBinding, ReadyTx, Result, SocketBase, SocketError, SocketOptions,
    SocketSide,
};
use crate::context::{ContextSocket, IoContext};
use crate::fanout::{PeerId, SubscriberCore};
use crate::flow;
use crate::message::Message;
use crate::pipe::{PipeBuilder, Signal};
use crate::transport::frame::Role;
use crate::transport::stream::{self, BoxedStream};

pub(crate) struct SubShared {
    pub(crate) base: SocketBase,
    pub(crate) core: SubscriberCore,
}

impl SubShared {
    fn close(&self) {
        if self.base.begin_close() {
            self.core.close();
        }
    }
}

impl ContextSocket for SubShared {
    fn shutdown(&self) {
        self.close();
    }
}

impl SocketSide for SubShared {
    fn base(&self) -> &SocketBase {
        &self.base
    }

    fn inproc_binding(this: &Arc<Self>) -> InprocBinding {
        InprocBinding::Subscriber(Arc::downgrade(this))
    }

    fn connect_inproc(this: &Arc<Self>, target: InprocBinding, name: &str) -> Result<()> {
        match target {
            InprocBinding::Publisher(publisher) => {
                let publisher = publisher
                    .upgrade()
                    .ok_or_else(|| SocketError::NotFound(format!("inproc://{}", name)))?;
                wire_inproc(&publisher, this)
            }
            InprocBinding::Subscriber(_) => Err(SocketError::InvalidEndpoint(format!(
                "inproc://{} is bound by another subscriber",
                name
            ))),
        }
    }

    fn serve(
        this: Arc<Self>,
        mut stream: BoxedStream,
        peer: String,
        ready: Option<ReadyTx>,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        async move {
            let options = this.base.options();
            let mut rbuf = BytesMut::new();

            let hello = with_timeout(
                options.handshake_timeout(),
                stream::exchange_hello(&mut stream, &mut rbuf, Role::Subscriber),
            )
            .await;
            if let Err(e) = hello {
                report(ready, &peer, Err(e.into()));
                return;
            }

            let peer_id = PeerId::next();
            let wake = Arc::new(Signal::new());
            let builder = PipeBuilder::new(options.recv_hwm).notify_writable(wake.clone());
            let writer = match this.core.attach_pipe(peer_id, builder) {
                Ok(writer) => writer,
                Err(e) => {
                    report(ready, &peer, Err(e.into()));
                    return;
                }
            };

            // READY means the publisher attached its outbound pipe.
            let ack = with_timeout(
                options.handshake_timeout(),
                stream::await_ready(&mut stream, &mut rbuf),
            )
            .await;
            if let Err(e) = ack {
                this.core.detach(peer_id);
                report(ready, &peer, Err(e.into()));
                return;
            }
            report(ready, &peer, Ok(()));
            info!(peer = %peer, id = %peer_id, transport = "stream", "Publisher connected");

            let shutdown = this.base.shutdown_rx();
            let weak = Arc::downgrade(&this);
            drop(this);

            let result = stream::drive_subscriber(
                stream,
                rbuf,
                writer,
                wake,
                shutdown,
                options.message_size_limit(),
            )
            .await;
            if let Some(this) = weak.upgrade() {
                this.core.detach(peer_id);
            }
            super::log_driver_exit(&peer, result);
        }
    }
}

/// Subscriber socket: receives every message from every connected publisher.
pub struct SubSocket {
    shared: Arc<SubShared>,
}

impl std::fmt::Debug for SubSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubSocket")
            .field("last_endpoint", &self.last_endpoint())
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SubSocket {
    pub(crate) fn new(ctx: IoContext) -> Self {
        let shared = Arc::new(SubShared {
            base: SocketBase::new(ctx, Role::Subscriber),
            core: SubscriberCore::new(),
        });
        super::register(&shared);
        Self { shared }
    }

    /// Bind to an endpoint; returns the resolved address (wildcards filled in).
    pub fn bind(&self, endpoint: &str) -> Result<String> {
        super::bind(&self.shared, endpoint)
    }

    /// Connect to a bound publisher. Blocks until the publisher attached us.
    pub fn connect(&self, endpoint: &str) -> Result<()> {
        super::connect(&self.shared, endpoint)
    }

    /// Receive the next message from any publisher, rotating fairly.
    ///
    /// With `non_blocking`, an empty socket yields `WouldBlock`; otherwise the
    /// receive timeout option bounds the wait.
    pub fn recv(&self, non_blocking: bool) -> flow::Result<Message> {
        if self.shared.base.is_closed() {
            return Err(flow::FlowError::Closed);
        }
        let timeout = self.shared.base.options.read().recv_timeout();
        self.shared.core.receive(non_blocking, timeout)
    }

    pub fn options(&self) -> SocketOptions {
        self.shared.base.options()
    }

    /// Replace all options; only connections made afterwards see them.
    pub fn set_options(&self, options: SocketOptions) {
        self.shared.base.update_options(|current| *current = options);
    }

    pub fn set_recv_hwm(&self, hwm: usize) {
        self.shared.base.update_options(|o| o.recv_hwm = hwm);
    }

    pub fn set_recv_timeout_ms(&self, ms: i64) {
        self.shared.base.update_options(|o| o.recv_timeout_ms = ms);
    }

    pub fn set_max_message_size(&self, bytes: i64) {
        self.shared.base.update_options(|o| o.max_message_size = bytes);
    }

    /// Last endpoint bound or connected, with wildcards resolved.
    pub fn last_endpoint(&self) -> Option<String> {
        self.shared.base.last_endpoint()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.core.peer_count()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.base.is_closed()
    }

    /// Close the socket, its listeners and every connection. Blocked
    /// receivers return `Closed`.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for SubSocket {
    fn drop(&mut self) {
        self.shared.close();
    }
}
