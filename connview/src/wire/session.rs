//! Session
//!
//! A `Session` is a duplex call channel to the capture backend: the client
//! calls named operations on the backend, and the backend may call back
//! operations the client exposed with `expose_local`. The link is kept open
//! by reconnecting with a fixed delay; calls in flight when a link goes
//! down are rejected, never resumed.
//!
//! Note: the session runs in a dedicated thread, the handle only talks to
//! it through channels.

use super::frame::{Call, Reply};
use super::session_core::SessionCore;
use super::util::{self, AddressError};

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use serde_json::Value;

/// Status events sent by the session thread.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected,
    /// Number of peers on the other end of the session (0 or 1).
    PeerCount(usize),
    ConnectFailed,
    ProtocolError(String),
    CallTimeout(String),
    CallCancelled(String),
    LocalCall(String),
    Exiting,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("session is not connected")]
    NotConnected,
    #[error("link closed before a reply arrived")]
    Closed,
    #[error("call timed out")]
    Timeout,
    #[error("session is shutting down")]
    Exiting,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The backend replied with an error message.
    #[error("{0}")]
    Failed(String),
}

/// A locally exposed operation. Runs on the session thread, so it must not
/// call back into the session it is registered with.
pub type LocalHandler = Box<dyn FnMut(Vec<Value>) -> Result<Value, String> + Send>;

pub(super) enum Request {
    Call {
        call: Call,
        timeout: Duration,
        reply: channel::Sender<Result<Reply, TransportError>>,
    },
    Expose {
        name: String,
        handler: LocalHandler,
    },
    Withdraw {
        name: String,
    },
    Close,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Delay between a link going down (or failing to open) and the next
    /// connection attempt.
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    /// Default deadline of a call.
    pub call_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            reconnect_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Session {
    requests: channel::Sender<Request>,
    events: channel::Receiver<Event>,
    peers: Arc<AtomicUsize>,
    call_timeout: Duration,
    thread: Option<thread::JoinHandle<()>>,
}

impl Session {
    /// Opens a session to `address` with default options.
    pub fn open(address: &str) -> Result<Session, AddressError> {
        Self::open_with(address, SessionOptions::default())
    }

    /// Starts the session thread. Only the address scheme is checked here;
    /// resolution and connection happen (and are retried) on the session
    /// thread.
    pub fn open_with(address: &str, options: SessionOptions) -> Result<Session, AddressError> {
        let address = util::session_address(address);
        util::validate(&address)?;

        let (req_sender, req_receiver) = channel::bounded::<Request>(Self::request_channel_size());
        let (event_sender, event_receiver) = channel::bounded::<Event>(Self::event_channel_size());
        let peers = Arc::new(AtomicUsize::new(0));
        let call_timeout = options.call_timeout;

        let core_peers = peers.clone();
        let thread = thread::Builder::new()
            .name("connview-session".to_string())
            .spawn(move || {
                let mut core =
                    SessionCore::new(address, options, req_receiver, event_sender, core_peers);
                core.run();
            })
            .map_err(|e| AddressError::Unresolved(format!("cannot start session thread: {e}")))?;

        Ok(Session {
            requests: req_sender,
            events: event_receiver,
            peers,
            call_timeout,
            thread: Some(thread),
        })
    }

    pub fn request_channel_size() -> usize {
        Self::channel_size_from_env("CONNVIEW_SESSION_REQUEST_BUFSIZE", 64)
    }

    pub fn event_channel_size() -> usize {
        Self::channel_size_from_env("CONNVIEW_SESSION_EVENT_BUFSIZE", 256)
    }

    fn channel_size_from_env(var: &str, min_size: usize) -> usize {
        if let Ok(req) = env::var(var) {
            std::cmp::max(req.parse().unwrap_or(0), min_size)
        } else {
            min_size
        }
    }

    /// Calls `name` on the backend and waits for its reply.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, CallError> {
        self.call_with_timeout(name, args, self.call_timeout)
    }

    pub fn call_with_timeout(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let (reply_sender, reply_receiver) = channel::bounded(1);
        let req = Request::Call {
            call: Call::new(name, args),
            timeout,
            reply: reply_sender,
        };
        if self.requests.send(req).is_err() {
            return Err(TransportError::Exiting.into());
        }
        match reply_receiver.recv() {
            Ok(Ok(reply)) => match reply.error {
                None => Ok(reply.value),
                Some(msg) => Err(CallError::Failed(msg)),
            },
            Ok(Err(e)) => Err(e.into()),
            Err(channel::RecvError) => Err(TransportError::Exiting.into()),
        }
    }

    /// Registers an operation the backend may call. Replaces any previous
    /// handler with the same name. Handlers survive reconnects.
    pub fn expose_local<F>(&self, name: &str, handler: F) -> Result<(), TransportError>
    where
        F: FnMut(Vec<Value>) -> Result<Value, String> + Send + 'static,
    {
        self.requests
            .send(Request::Expose {
                name: name.to_string(),
                handler: Box::new(handler),
            })
            .map_err(|_| TransportError::Exiting)
    }

    pub fn withdraw_local(&self, name: &str) -> Result<(), TransportError> {
        self.requests
            .send(Request::Withdraw {
                name: name.to_string(),
            })
            .map_err(|_| TransportError::Exiting)
    }

    /// Status events, from the creation of the session until it exits.
    pub fn events(&self) -> &channel::Receiver<Event> {
        &self.events
    }

    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.peer_count() > 0
    }

    /// Waits until a link is open. Returns false on timeout.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_open() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Stops the session thread, rejecting calls still pending.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.requests.send(Request::Close);
            if thread.join().is_err() {
                tracing::warn!("session thread panicked");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}
