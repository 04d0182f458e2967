//! Stream transports (TCP and IPC) sharing one frame codec and two drivers.
//!
//! A connection runs a short greeting, then one driver task per side:
//! - publisher driver: pumps the outbound pipe into the socket through a
//!   `StreamAdapter`, and turns CREDIT frames into releases of that pipe
//! - subscriber driver: decodes MESSAGE frames into the inbound pipe while it
//!   has room (otherwise stops reading, pushing back on the socket), and
//!   reports every slot the application freed with a CREDIT frame

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, trace};

#[cfg(all(unix, feature = "ipc"))]
use tokio::net::{UnixListener, UnixStream};

use super::endpoint::Endpoint;
use super::frame::{self, Frame, Role, PROTOCOL_VERSION};
use super::{pump, Result, TransportAdapter, TransportError};
use crate::message::Message;
use crate::pipe::{EnqueueError, PipeReader, PipeWriter, Signal};

/// Encoded bytes a publisher buffers before it stops taking from its pipe.
pub const WRITE_BUFFER_LIMIT: usize = 64 * 1024;
/// Read buffer growth step.
const READ_CHUNK: usize = 64 * 1024;

/// Byte stream usable by the drivers.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

// ============================================================================
// Adapter
// ============================================================================

/// Frame encoder writing into a bounded local buffer.
#[derive(Debug)]
pub struct StreamAdapter {
    buffer: BytesMut,
    limit: usize,
    peer_available: Option<Arc<Signal>>,
}

impl StreamAdapter {
    pub fn new(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(limit),
            limit,
            peer_available: None,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Called after the driver wrote part of the buffer to the socket.
    pub fn flushed(&mut self) {
        if self.buffer.len() < self.limit {
            if let Some(signal) = &self.peer_available {
                signal.notify();
            }
        }
    }
}

impl TransportAdapter for StreamAdapter {
    fn drainable(&self) -> bool {
        self.buffer.len() < self.limit
    }

    fn forward(&mut self, msg: Message) -> Result<()> {
        frame::encode_message(&msg, &mut self.buffer)
    }

    fn on_peer_available(&mut self, signal: Arc<Signal>) {
        self.peer_available = Some(signal);
    }
}

// ============================================================================
// Listeners and connections
// ============================================================================

/// Bound listener for a stream endpoint.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(all(unix, feature = "ipc"))]
    Ipc(UnixListener, UdsCleanupGuard),
}

impl Listener {
    /// Bind synchronously so address errors surface to the caller.
    ///
    /// Must run inside the I/O runtime context. Wildcards are resolved; the
    /// returned endpoint is the concrete address peers can connect to.
    pub fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let addr = Endpoint::tcp_bind_addr(host, *port);
                let std_listener = std::net::TcpListener::bind(&addr)?;
                std_listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(std_listener)?;
                let local = listener.local_addr()?;
                let resolved = Endpoint::Tcp {
                    host: local.ip().to_string(),
                    port: local.port(),
                };
                info!(endpoint = %resolved, transport = "tcp", "Listening");
                Ok((Listener::Tcp(listener), resolved))
            }
            #[cfg(all(unix, feature = "ipc"))]
            Endpoint::Ipc(path) => {
                let path = path.clone().unwrap_or_else(Endpoint::temp_ipc_path);
                let guard = prepare_uds_socket(&path)?;
                let std_listener = std::os::unix::net::UnixListener::bind(&path)?;
                std_listener.set_nonblocking(true)?;
                let listener = UnixListener::from_std(std_listener)?;
                let resolved = Endpoint::Ipc(Some(path));
                info!(endpoint = %resolved, transport = "ipc", "Listening");
                Ok((Listener::Ipc(listener, guard), resolved))
            }
            other => Err(TransportError::InvalidEndpoint(format!(
                "{} is not a stream endpoint",
                other
            ))),
        }
    }

    /// Accept the next connection, returning the stream and a peer label.
    pub async fn accept(&self) -> Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), addr.to_string()))
            }
            #[cfg(all(unix, feature = "ipc"))]
            Listener::Ipc(listener, guard) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), guard.path().display().to_string()))
            }
        }
    }
}

/// Open a stream to a bound endpoint.
pub async fn connect(endpoint: &Endpoint) -> Result<BoxedStream> {
    if endpoint.is_wildcard() {
        return Err(TransportError::InvalidEndpoint(format!(
            "cannot connect to wildcard endpoint {}",
            endpoint
        )));
    }
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect(Endpoint::tcp_bind_addr(host, *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(all(unix, feature = "ipc"))]
        Endpoint::Ipc(Some(path)) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
        other => Err(TransportError::InvalidEndpoint(format!(
            "{} is not a stream endpoint",
            other
        ))),
    }
}

/// RAII guard for cleaning up UDS socket files.
pub struct UdsCleanupGuard {
    path: PathBuf,
}

impl UdsCleanupGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UdsCleanupGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up IPC socket"
                );
            } else {
                debug!(path = %self.path.display(), "Cleaned up IPC socket");
            }
        }
    }
}

/// Prepare a UDS socket path for binding.
///
/// - Creates parent directories if needed
/// - Removes a stale socket file if one exists
/// - Returns a guard that removes the socket on drop
pub fn prepare_uds_socket(path: &Path) -> std::io::Result<UdsCleanupGuard> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        info!(path = %path.display(), "Removing stale IPC socket");
        std::fs::remove_file(path)?;
    }
    Ok(UdsCleanupGuard::new(path))
}

// ============================================================================
// Greeting
// ============================================================================

/// Send our HELLO and validate the peer's.
pub async fn exchange_hello<S>(stream: &mut S, rbuf: &mut BytesMut, role: Role) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    frame::encode(
        &Frame::Hello {
            role,
            version: PROTOCOL_VERSION,
        },
        &mut out,
    )?;
    stream.write_all(&out).await?;

    match read_frame(stream, rbuf).await? {
        Frame::Hello {
            role: peer_role,
            version,
        } => {
            if version != PROTOCOL_VERSION {
                return Err(TransportError::Protocol(format!(
                    "unsupported protocol version {}",
                    version
                )));
            }
            if peer_role != role.peer() {
                return Err(TransportError::Protocol(format!(
                    "{:?} cannot connect to {:?}",
                    peer_role, role
                )));
            }
            Ok(())
        }
        other => Err(TransportError::Protocol(format!(
            "expected HELLO, got {:?}",
            other
        ))),
    }
}

/// Publisher side: tell the subscriber its outbound pipe is attached.
pub async fn send_ready<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    frame::encode(&Frame::Ready, &mut out)?;
    stream.write_all(&out).await?;
    Ok(())
}

/// Subscriber side: wait for READY. Frames after it stay in `rbuf`.
pub async fn await_ready<S>(stream: &mut S, rbuf: &mut BytesMut) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match read_frame(stream, rbuf).await? {
        Frame::Ready => Ok(()),
        other => Err(TransportError::Protocol(format!(
            "expected READY, got {:?}",
            other
        ))),
    }
}

async fn read_frame<S>(stream: &mut S, rbuf: &mut BytesMut) -> Result<Frame>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = frame::decode_control(rbuf)? {
            return Ok(frame);
        }
        rbuf.reserve(READ_CHUNK);
        if stream.read_buf(rbuf).await? == 0 {
            return Err(TransportError::PeerClosed);
        }
    }
}

// ============================================================================
// Drivers
// ============================================================================

/// Drive the publisher end of an established connection.
///
/// `wake` must be the readable hook of `outbound`. Returns when the pipe
/// closes, the peer disconnects, or `shutdown` fires.
pub async fn drive_publisher<S>(
    stream: S,
    mut rbuf: BytesMut,
    mut outbound: PipeReader,
    wake: Arc<Signal>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return Ok(());
    }
    let releaser = outbound.releaser();
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut adapter = StreamAdapter::new(WRITE_BUFFER_LIMIT);
    adapter.on_peer_available(wake.clone());

    loop {
        match pump(&mut outbound, &mut adapter) {
            Ok(_) => {}
            Err(TransportError::PipeClosed) => {
                debug!("Outbound pipe closed, publisher driver stopping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        rbuf.reserve(READ_CHUNK);
        let has_pending = adapter.has_pending();
        tokio::select! {
            _ = wake.notified() => {}
            res = wr.write_buf(adapter.buffer_mut()), if has_pending => {
                res?;
                adapter.flushed();
            }
            res = rd.read_buf(&mut rbuf) => {
                if res? == 0 {
                    return Err(TransportError::PeerClosed);
                }
                while let Some(frame) = frame::decode(&mut rbuf, None)? {
                    match frame {
                        Frame::Credit(count) => {
                            let released = releaser.release(count);
                            trace!(count, released, "Credit received");
                        }
                        other => {
                            return Err(TransportError::Protocol(format!(
                                "unexpected {:?} from subscriber",
                                other
                            )))
                        }
                    }
                }
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

/// Drive the subscriber end of an established connection.
///
/// `wake` must be the writable hook of `inbound`. Messages are read off the
/// socket only while none are waiting for room in the inbound pipe.
pub async fn drive_subscriber<S>(
    stream: S,
    mut rbuf: BytesMut,
    mut inbound: PipeWriter,
    wake: Arc<Signal>,
    mut shutdown: watch::Receiver<bool>,
    max_message_size: Option<usize>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if *shutdown.borrow() {
        return Ok(());
    }
    let (mut rd, mut wr) = tokio::io::split(stream);
    let mut pending: VecDeque<Message> = VecDeque::new();
    let mut wbuf = BytesMut::new();
    let mut credited = inbound.released_total();
    decode_messages(&mut rbuf, &mut pending, max_message_size)?;

    loop {
        while let Some(msg) = pending.pop_front() {
            match inbound.try_enqueue(msg) {
                Ok(()) => {}
                Err(EnqueueError::Full(msg)) => {
                    pending.push_front(msg);
                    break;
                }
                Err(EnqueueError::Closed(_)) => {
                    debug!("Inbound pipe closed, subscriber driver stopping");
                    return Ok(());
                }
            }
        }
        if inbound.is_closed() {
            debug!("Inbound pipe closed, subscriber driver stopping");
            return Ok(());
        }

        let released = inbound.released_total();
        if released > credited {
            frame::encode(&Frame::Credit(released - credited), &mut wbuf)?;
            credited = released;
        }

        let can_read = pending.is_empty();
        if can_read {
            rbuf.reserve(READ_CHUNK);
        }
        let has_credit = !wbuf.is_empty();
        tokio::select! {
            _ = wake.notified() => {}
            res = wr.write_buf(&mut wbuf), if has_credit => {
                res?;
            }
            res = rd.read_buf(&mut rbuf), if can_read => {
                if res? == 0 {
                    return Err(TransportError::PeerClosed);
                }
                decode_messages(&mut rbuf, &mut pending, max_message_size)?;
            }
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

fn decode_messages(
    rbuf: &mut BytesMut,
    pending: &mut VecDeque<Message>,
    max_message_size: Option<usize>,
) -> Result<()> {
    while let Some(frame) = frame::decode(rbuf, max_message_size)? {
        match frame {
            Frame::Message(msg) => pending.push_back(msg),
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected {:?} from publisher",
                    other
                )))
            }
        }
    }
    Ok(())
}
