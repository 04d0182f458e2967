//! Explicit I/O execution context.
//!
//! An `IoContext` owns the background runtime that drives connections, the
//! registry of bound inproc endpoints, and the list of live sockets. Nothing
//! here is process-global: every socket is created from, and keeps a handle
//! to, the context it runs on.
//!
//! Lifecycle: `new`/`from_config` starts the runtime; `terminate` closes every
//! socket (waking blocked callers with `Closed`) and stops the runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, info};

use crate::config::{Config, IoConfig};
use crate::socket::{InprocBinding, PubSocket, SocketError, SocketOptions, SubSocket};

/// How long `terminate` waits for driver tasks to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Socket hooks the context needs on termination.
pub(crate) trait ContextSocket: Send + Sync {
    fn shutdown(&self);
}

struct ContextInner {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    defaults: RwLock<SocketOptions>,
    inproc: DashMap<String, InprocBinding>,
    sockets: DashMap<u64, Weak<dyn ContextSocket>>,
    next_socket: AtomicU64,
    terminated: AtomicBool,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            // May run on a thread inside the runtime; never wait here.
            runtime.shutdown_background();
        }
    }
}

/// Handle to an I/O context. Clones share the same context.
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("sockets", &self.inner.sockets.len())
            .field("inproc_endpoints", &self.inner.inproc.len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl IoContext {
    /// Start a context with default I/O settings and socket options.
    pub fn new() -> Result<Self, SocketError> {
        Self::with_config(&IoConfig::default(), SocketOptions::default())
    }

    /// Start a context from loaded configuration.
    pub fn from_config(config: &Config) -> Result<Self, SocketError> {
        Self::with_config(&config.io, config.socket.clone())
    }

    /// Start a context; `defaults` seeds the options of every new socket.
    pub fn with_config(io: &IoConfig, defaults: SocketOptions) -> Result<Self, SocketError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(io.thread_name.clone());
        if io.worker_threads > 0 {
            builder.worker_threads(io.worker_threads);
        }
        let runtime = builder.build()?;
        let handle = runtime.handle().clone();

        info!(
            worker_threads = io.worker_threads,
            thread_name = %io.thread_name,
            "I/O context started"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                runtime: Mutex::new(Some(runtime)),
                handle,
                defaults: RwLock::new(defaults),
                inproc: DashMap::new(),
                sockets: DashMap::new(),
                next_socket: AtomicU64::new(1),
                terminated: AtomicBool::new(false),
            }),
        })
    }

    /// Create a publisher socket.
    pub fn pub_socket(&self) -> Result<PubSocket, SocketError> {
        self.check_running()?;
        Ok(PubSocket::new(self.clone()))
    }

    /// Create a subscriber socket.
    pub fn sub_socket(&self) -> Result<SubSocket, SocketError> {
        self.check_running()?;
        Ok(SubSocket::new(self.clone()))
    }

    /// Options new sockets start with.
    pub fn default_options(&self) -> SocketOptions {
        self.inner.defaults.read().clone()
    }

    pub fn set_default_options(&self, options: SocketOptions) {
        *self.inner.defaults.write() = options;
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Close every socket and stop the runtime.
    ///
    /// Blocked publishers and receivers return `Closed`. Must not be called
    /// from within an async runtime.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }

        let sockets: Vec<_> = self
            .inner
            .sockets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.sockets.clear();
        for socket in sockets.iter().filter_map(Weak::upgrade) {
            socket.shutdown();
        }
        self.inner.inproc.clear();

        if let Some(runtime) = self.inner.runtime.lock().take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
        info!(sockets = sockets.len(), "I/O context terminated");
    }

    // ------------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------------

    pub(crate) fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    pub(crate) fn check_running(&self) -> Result<(), SocketError> {
        if self.is_terminated() {
            Err(SocketError::Terminated)
        } else {
            Ok(())
        }
    }

    pub(crate) fn next_socket_id(&self) -> u64 {
        self.inner.next_socket.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_socket(&self, id: u64, socket: Weak<dyn ContextSocket>) {
        self.inner.sockets.insert(id, socket);
    }

    pub(crate) fn unregister_socket(&self, id: u64) {
        self.inner.sockets.remove(&id);
    }

    /// Claim an inproc name. Names held by dead sockets are reclaimed.
    pub(crate) fn bind_inproc(&self, name: &str, binding: InprocBinding) -> Result<(), SocketError> {
        self.check_running()?;
        match self.inner.inproc.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_alive() {
                    return Err(SocketError::EndpointInUse(format!("inproc://{}", name)));
                }
                entry.insert(binding);
            }
            Entry::Vacant(entry) => {
                entry.insert(binding);
            }
        }
        debug!(name, "Inproc endpoint bound");
        Ok(())
    }

    pub(crate) fn lookup_inproc(&self, name: &str) -> Option<InprocBinding> {
        self.inner
            .inproc
            .get(name)
            .map(|entry| entry.value().clone())
            .filter(InprocBinding::is_alive)
    }

    pub(crate) fn unbind_inproc(&self, name: &str) {
        if self.inner.inproc.remove(name).is_some() {
            debug!(name, "Inproc endpoint released");
        }
    }
}
