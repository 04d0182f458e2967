//! PUB/SUB socket facades.
//!
//! A socket owns one fan-out core and any number of connections. Each
//! connection gets its own pipe, sized from the socket options in effect at
//! the moment the connection is established.
//!
//! Endpoints:
//! - `tcp://host:port` (`*` port binds an ephemeral port)
//! - `ipc://path` (`ipc://*` binds a fresh temporary path)
//! - `inproc://name` (connect requires the name to be bound already)
//!
//! `bind` and `connect` work in either direction: a SUB may bind and a PUB
//! connect to it.

mod options;
mod pub_socket;
mod sub_socket;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::context::{ContextSocket, IoContext};
use crate::flow::FlowError;
use crate::transport::frame::Role;
use crate::transport::stream::{self, BoxedStream, Listener};
use crate::transport::{Endpoint, TransportError};

pub use options::{
    SocketOptions, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_RECV_HWM, DEFAULT_SEND_HWM,
};
pub use pub_socket::PubSocket;
pub use sub_socket::SubSocket;

pub(crate) use pub_socket::PubShared;
pub(crate) use sub_socket::SubShared;

/// Result type for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;

/// Socket-level errors.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("endpoint already in use: {0}")]
    EndpointInUse(String),

    #[error("no socket bound at {0}")]
    NotFound(String),

    #[error("socket is closed")]
    Closed,

    #[error("I/O context terminated")]
    Terminated,

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket registered under an inproc name.
#[derive(Clone)]
pub(crate) enum InprocBinding {
    Publisher(Weak<PubShared>),
    Subscriber(Weak<SubShared>),
}

impl InprocBinding {
    pub fn is_alive(&self) -> bool {
        match self {
            InprocBinding::Publisher(weak) => weak
                .upgrade()
                .map_or(false, |socket| !socket.base.is_closed()),
            InprocBinding::Subscriber(weak) => weak
                .upgrade()
                .map_or(false, |socket| !socket.base.is_closed()),
        }
    }
}

/// Oneshot used by `connect` to learn the greeting outcome.
pub(crate) type ReadyTx = oneshot::Sender<Result<()>>;

/// State shared by both socket kinds.
pub(crate) struct SocketBase {
    ctx: IoContext,
    id: u64,
    role: Role,
    options: RwLock<SocketOptions>,
    shutdown: watch::Sender<bool>,
    last_endpoint: Mutex<Option<Endpoint>>,
    inproc_names: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl SocketBase {
    fn new(ctx: IoContext, role: Role) -> Self {
        let options = ctx.default_options();
        let (shutdown, _) = watch::channel(false);
        Self {
            id: ctx.next_socket_id(),
            ctx,
            role,
            options: RwLock::new(options),
            shutdown,
            last_endpoint: Mutex::new(None),
            inproc_names: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> SocketOptions {
        self.options.read().clone()
    }

    fn update_options<F: FnOnce(&mut SocketOptions)>(&self, update: F) {
        update(&mut self.options.write());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        self.ctx.check_running()?;
        if self.is_closed() {
            return Err(SocketError::Closed);
        }
        Ok(())
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn last_endpoint(&self) -> Option<String> {
        self.last_endpoint.lock().as_ref().map(Endpoint::to_string)
    }

    /// First close: stop background tasks and release inproc names.
    /// Returns false if the socket was already closed.
    fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown.send_replace(true);
        for name in self.inproc_names.lock().drain(..) {
            self.ctx.unbind_inproc(&name);
        }
        self.ctx.unregister_socket(self.id);
        debug!(role = ?self.role, "Socket closed");
        true
    }
}

/// Role-specific behaviour plugged into the shared bind/connect logic.
pub(crate) trait SocketSide: ContextSocket + Sized + 'static {
    fn base(&self) -> &SocketBase;

    fn inproc_binding(this: &Arc<Self>) -> InprocBinding;

    /// Wire an in-process connection to a socket bound under an inproc name.
    fn connect_inproc(this: &Arc<Self>, target: InprocBinding, name: &str) -> Result<()>;

    /// Run the greeting and then drive an established stream until it ends.
    /// `ready` (connect only) receives the greeting outcome.
    fn serve(
        this: Arc<Self>,
        stream: BoxedStream,
        peer: String,
        ready: Option<ReadyTx>,
    ) -> impl Future<Output = ()> + Send + 'static;
}

/// Register a new socket with its context.
pub(crate) fn register<S: SocketSide>(side: &Arc<S>) {
    let weak: Weak<dyn ContextSocket> = Arc::downgrade(side) as Weak<dyn ContextSocket>;
    side.base().ctx.register_socket(side.base().id, weak);
}

/// Bind `side` to `endpoint`; returns the resolved endpoint.
pub(crate) fn bind<S: SocketSide>(side: &Arc<S>, endpoint: &str) -> Result<String> {
    let base = side.base();
    base.check_open()?;
    let endpoint: Endpoint = endpoint.parse()?;

    let resolved = match &endpoint {
        Endpoint::Inproc(name) => {
            base.ctx.bind_inproc(name, S::inproc_binding(side))?;
            base.inproc_names.lock().push(name.clone());
            endpoint.clone()
        }
        _ => {
            let (listener, resolved) = {
                let _runtime = base.ctx.handle().enter();
                Listener::bind(&endpoint).map_err(|e| match e {
                    TransportError::Io(io) if io.kind() == std::io::ErrorKind::AddrInUse => {
                        SocketError::EndpointInUse(endpoint.to_string())
                    }
                    other => other.into(),
                })?
            };
            spawn_accept_loop(side, listener, resolved.clone());
            resolved
        }
    };

    info!(role = ?base.role, endpoint = %resolved, "Socket bound");
    *base.last_endpoint.lock() = Some(resolved.clone());
    Ok(resolved.to_string())
}

fn spawn_accept_loop<S: SocketSide>(side: &Arc<S>, listener: Listener, endpoint: Endpoint) {
    let weak = Arc::downgrade(side);
    let mut shutdown = side.base().shutdown_rx();
    let handle = side.base().ctx.handle().clone();
    let spawner = handle.clone();

    handle.spawn(async move {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let Some(side) = weak.upgrade() else { break };
                        debug!(endpoint = %endpoint, peer = %peer, "Connection accepted");
                        spawner.spawn(S::serve(side, stream, peer, None));
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(endpoint = %endpoint, "Listener stopped");
    });
}

/// Connect `side` to a bound endpoint.
///
/// Returns once the connection is attached on both ends. Blocks the calling
/// thread; must not be called from within an async runtime.
pub(crate) fn connect<S: SocketSide>(side: &Arc<S>, endpoint: &str) -> Result<()> {
    let base = side.base();
    base.check_open()?;
    let endpoint: Endpoint = endpoint.parse()?;
    if endpoint.is_wildcard() {
        return Err(SocketError::InvalidEndpoint(endpoint.to_string()));
    }

    if let Endpoint::Inproc(name) = &endpoint {
        let target = base
            .ctx
            .lookup_inproc(name)
            .ok_or_else(|| SocketError::NotFound(endpoint.to_string()))?;
        S::connect_inproc(side, target, name)?;
    } else {
        let (ready_tx, ready_rx) = oneshot::channel();
        let handshake = base.options().handshake_timeout();
        let task_side = side.clone();
        let target = endpoint.clone();
        base.ctx.handle().spawn(async move {
            match with_timeout(handshake, stream::connect(&target)).await {
                Ok(stream) => S::serve(task_side, stream, target.to_string(), Some(ready_tx)).await,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.into()));
                }
            }
        });
        // Sender dropped without an answer: the runtime went away.
        ready_rx.blocking_recv().map_err(|_| SocketError::Terminated)??;
    }

    info!(role = ?base.role, endpoint = %endpoint, "Socket connected");
    *base.last_endpoint.lock() = Some(endpoint);
    Ok(())
}

/// Bound a greeting step by the handshake timeout.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> std::result::Result<T, TransportError>
where
    F: Future<Output = std::result::Result<T, TransportError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or(Err(TransportError::HandshakeTimeout)),
        None => fut.await,
    }
}

/// Deliver a greeting outcome to a waiting `connect`, or log it.
pub(crate) fn report(ready: Option<ReadyTx>, peer: &str, result: Result<()>) {
    match ready {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!(peer, error = %e, "Handshake failed");
            }
        }
    }
}

/// Log how a connection driver ended.
pub(crate) fn log_driver_exit(peer: &str, result: std::result::Result<(), TransportError>) {
    match result {
        Ok(()) => debug!(peer, "Connection closed"),
        Err(TransportError::PeerClosed) => debug!(peer, "Peer disconnected"),
        Err(e) => warn!(peer, error = %e, "Connection failed"),
    }
}
