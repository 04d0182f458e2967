//! Publisher socket.

use std::sync::Arc;

use bytes::BytesMut;
use tracing::info;

use super::{
    report, with_timeout, InprocBinding, ReadyTx, Result, SocketBase, SocketError, SocketOptions,
    SocketSide, SubShared,
};
use crate::context::{ContextSocket, IoContext};
use crate::fanout::{PeerId, PublishSummary, PublisherCore};
use crate::flow::{self, FlowPolicy};
use crate::message::Message;
use crate::pipe::{PipeBuilder, Signal};
use crate::transport::frame::Role;
use crate::transport::inproc::{self, InprocAdapter};
use crate::transport::stream::{self, BoxedStream};

pub(crate) struct PubShared {
    pub(crate) base: SocketBase,
    pub(crate) core: PublisherCore,
}

impl PubShared {
    fn close(&self) {
        if self.base.begin_close() {
            self.core.close();
        }
    }
}

impl ContextSocket for PubShared {
    fn shutdown(&self) {
        self.close();
    }
}

impl SocketSide for PubShared {
    fn base(&self) -> &SocketBase {
        &self.base
    }

    fn inproc_binding(this: &Arc<Self>) -> InprocBinding {
        InprocBinding::Publisher(Arc::downgrade(this))
    }

    fn connect_inproc(this: &Arc<Self>, target: InprocBinding, name: &str) -> Result<()> {
        match target {
            InprocBinding::Subscriber(subscriber) => {
                let subscriber = subscriber
                    .upgrade()
                    .ok_or_else(|| SocketError::NotFound(format!("inproc://{}", name)))?;
                wire_inproc(this, &subscriber)
            }
            InprocBinding::Publisher(_) => Err(SocketError::InvalidEndpoint(format!(
                "inproc://{} is bound by another publisher",
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
                stream::exchange_hello(&mut stream, &mut rbuf, Role::Publisher),
            )
            .await;
            if let Err(e) = hello {
                report(ready, &peer, Err(e.into()));
                return;
            }

            let peer_id = PeerId::next();
            let wake = Arc::new(Signal::new());
            let (writer, reader) = PipeBuilder::new(options.send_hwm)
                .notify_readable(wake.clone())
                .build();
            if let Err(e) = this.core.attach(peer_id, writer, options.flow_policy) {
                report(ready, &peer, Err(e.into()));
                return;
            }
            if let Err(e) = stream::send_ready(&mut stream).await {
                this.core.detach(peer_id);
                report(ready, &peer, Err(e.into()));
                return;
            }
            report(ready, &peer, Ok(()));
            info!(peer = %peer, id = %peer_id, transport = "stream", "Subscriber connected");

            let shutdown = this.base.shutdown_rx();
            let weak = Arc::downgrade(&this);
            drop(this);

            let result = stream::drive_publisher(stream, rbuf, reader, wake, shutdown).await;
            if let Some(this) = weak.upgrade() {
                this.core.detach(peer_id);
            }
            super::log_driver_exit(&peer, result);
        }
    }
}

/// Build an in-process connection between a publisher and a subscriber.
///
/// Both pipes are sized from the options each socket has right now.
pub(crate) fn wire_inproc(publisher: &Arc<PubShared>, subscriber: &Arc<SubShared>) -> Result<()> {
    let pub_options = publisher.base.options();
    let sub_options = subscriber.base.options();
    let pub_peer = PeerId::next();
    let sub_peer = PeerId::next();

    let wake = Arc::new(Signal::new());
    let (out_writer, out_reader) = PipeBuilder::new(pub_options.send_hwm)
        .notify_readable(wake.clone())
        .build();
    let in_builder = PipeBuilder::new(sub_options.recv_hwm).upstream(out_reader.releaser());
    let in_writer = subscriber.core.attach_pipe(sub_peer, in_builder)?;
    if let Err(e) = publisher
        .core
        .attach(pub_peer, out_writer, pub_options.flow_policy)
    {
        subscriber.core.detach(sub_peer);
        return Err(e.into());
    }

    let weak_pub = Arc::downgrade(publisher);
    let weak_sub = Arc::downgrade(subscriber);
    inproc::spawn_relay(
        publisher.base.ctx.handle(),
        pub_peer,
        out_reader,
        InprocAdapter::new(in_writer),
        wake,
        move || {
            if let Some(publisher) = weak_pub.upgrade() {
                publisher.core.detach(pub_peer);
            }
            if let Some(subscriber) = weak_sub.upgrade() {
                subscriber.core.detach(sub_peer);
            }
        },
    );
    info!(publisher = %pub_peer, subscriber = %sub_peer, transport = "inproc", "Inproc connection established");
    Ok(())
}

/// Publisher socket: every message goes to every connected subscriber.
pub struct PubSocket {
    shared: Arc<PubShared>,
}

impl std::fmt::Debug for PubSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSocket")
            .field("last_endpoint", &self.last_endpoint())
            .field("peers", &self.peer_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PubSocket {
    pub(crate) fn new(ctx: IoContext) -> Self {
        let shared = Arc::new(PubShared {
            base: SocketBase::new(ctx, Role::Publisher),
            core: PublisherCore::new(),
        });
        super::register(&shared);
        Self { shared }
    }

    /// Bind to an endpoint; returns the resolved address (wildcards filled in).
    pub fn bind(&self, endpoint: &str) -> Result<String> {
        super::bind(&self.shared, endpoint)
    }

    /// Connect to a bound subscriber. Blocks until the subscriber is attached.
    pub fn connect(&self, endpoint: &str) -> Result<()> {
        super::connect(&self.shared, endpoint)
    }

    /// Publish to all connected subscribers.
    ///
    /// With `non_blocking`, a muted BLOCK pipe yields `WouldBlock` instead of
    /// waiting; otherwise the send timeout option bounds the wait.
    pub fn send(&self, msg: impl Into<Message>, non_blocking: bool) -> flow::Result<PublishSummary> {
        if self.shared.base.is_closed() {
            return Err(flow::FlowError::Closed);
        }
        let timeout = self.shared.base.options.read().send_timeout();
        self.shared.core.publish(msg.into(), non_blocking, timeout)
    }

    pub fn options(&self) -> SocketOptions {
        self.shared.base.options()
    }

    /// Replace all options; only connections made afterwards see them.
    pub fn set_options(&self, options: SocketOptions) {
        self.shared.base.update_options(|current| *current = options);
    }

    pub fn set_send_hwm(&self, hwm: usize) {
        self.shared.base.update_options(|o| o.send_hwm = hwm);
    }

    pub fn set_flow_policy(&self, policy: FlowPolicy) {
        self.shared.base.update_options(|o| o.flow_policy = policy);
    }

    pub fn set_send_timeout_ms(&self, ms: i64) {
        self.shared.base.update_options(|o| o.send_timeout_ms = ms);
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

    /// Close the socket, its listeners and every connection. Blocked senders
    /// return `Closed`.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for PubSocket {
    fn drop(&mut self) {
        self.shared.close();
    }
}
