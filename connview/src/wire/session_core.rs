use super::frame::{Call, Frame, Reply};
use super::session::{Event, LocalHandler, Request, SessionOptions, TransportError};
use super::stream::{Port, RecvError};
use super::util;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel;
use serde_json::Value;

struct EventQueue {
    dest: channel::Sender<Event>,
}

impl EventQueue {
    fn send(&self, event: Event) {
        // Observers that fall behind lose events rather than stall the link.
        if let Err(channel::TrySendError::Full(event)) = self.dest.try_send(event) {
            tracing::debug!(?event, "session event queue full, dropping event");
        }
    }
}

type ReplySender = channel::Sender<Result<Reply, TransportError>>;

struct PendingCall {
    name: String,
    deadline: Instant,
    reply: ReplySender,
}

/// One live connection. Replaced wholesale on reconnect.
struct Link {
    port: Port,
    rx: channel::Receiver<Result<Value, RecvError>>,
}

pub(super) struct SessionCore {
    address: String,
    options: SessionOptions,
    requests: channel::Receiver<Request>,
    events: EventQueue,
    peers: Arc<AtomicUsize>,

    link: Option<Link>,
    next_attempt: Instant,
    reported_failure: bool,

    pending: HashMap<String, PendingCall>,
    deadlines: BTreeMap<Instant, HashSet<String>>,
    handlers: HashMap<String, LocalHandler>,
}

impl SessionCore {
    pub(super) fn new(
        address: String,
        options: SessionOptions,
        requests: channel::Receiver<Request>,
        events: channel::Sender<Event>,
        peers: Arc<AtomicUsize>,
    ) -> SessionCore {
        SessionCore {
            address,
            options,
            requests,
            events: EventQueue { dest: events },
            peers,
            link: None,
            next_attempt: Instant::now(),
            reported_failure: false,
            pending: HashMap::new(),
            deadlines: BTreeMap::new(),
            handlers: HashMap::new(),
        }
    }

    fn try_connect(&mut self) -> bool {
        let addr = match util::resolve(&self.address) {
            Ok(addr) => addr,
            Err(e) => {
                if !self.reported_failure {
                    tracing::warn!(address = %self.address, error = %e, "cannot resolve backend");
                }
                return false;
            }
        };
        let (rx_send, rx) = Port::rx_channel();
        match Port::connect(&addr, self.options.connect_timeout, Port::rx_to_channel(rx_send)) {
            Ok(port) => {
                tracing::info!(peer = %port.peer_addr(), "connected to backend");
                self.link = Some(Link { port, rx });
                true
            }
            Err(e) => {
                if !self.reported_failure {
                    tracing::warn!(%addr, error = %e, "failed to connect to backend");
                }
                false
            }
        }
    }

    /// Tears down the current link and rejects everything that was waiting
    /// on it. A new link is attempted after the reconnect delay.
    fn link_lost(&mut self, reason: &str) {
        if self.link.take().is_none() {
            return;
        }
        tracing::info!(reason, "backend link closed");
        self.reject_pending(TransportError::Closed);
        self.peers.store(0, Ordering::SeqCst);
        self.events.send(Event::Disconnected);
        self.events.send(Event::PeerCount(0));
        self.next_attempt = Instant::now() + self.options.reconnect_delay;
        self.reported_failure = false;
    }

    fn reject_pending(&mut self, error: TransportError) {
        for (id, call) in self.pending.drain() {
            self.events.send(Event::CallCancelled(call.name.clone()));
            tracing::debug!(%id, name = %call.name, "rejecting pending call");
            let _ = call.reply.send(Err(error.clone()));
        }
        self.deadlines.clear();
    }

    fn forget_deadline(&mut self, deadline: Instant, id: &str) {
        if let Some(ids) = self.deadlines.get_mut(&deadline) {
            ids.remove(id);
            if ids.is_empty() {
                self.deadlines.remove(&deadline);
            }
        }
    }

    /// Rejects calls past their deadline and returns how long to wait for
    /// the next one.
    fn process_call_timeouts(&mut self) -> Duration {
        let now = Instant::now();
        let expired: Vec<Instant> = self.deadlines.range(..=now).map(|(t, _)| *t).collect();
        for deadline in expired {
            for id in self.deadlines.remove(&deadline).unwrap_or_default() {
                if let Some(call) = self.pending.remove(&id) {
                    tracing::debug!(%id, name = %call.name, "call timed out");
                    self.events.send(Event::CallTimeout(call.name.clone()));
                    let _ = call.reply.send(Err(TransportError::Timeout));
                }
            }
        }
        match self.deadlines.keys().next() {
            Some(deadline) => deadline.saturating_duration_since(now) + Duration::from_millis(1),
            None => Duration::from_secs(60),
        }
    }

    fn start_call(&mut self, call: Call, timeout: Duration, reply: ReplySender) {
        let link = match &self.link {
            Some(link) => link,
            None => {
                let _ = reply.send(Err(TransportError::NotConnected));
                return;
            }
        };
        tracing::debug!(id = %call.id, name = %call.name, "sending call");
        if link.port.send(call.to_value()).is_err() {
            let _ = reply.send(Err(TransportError::Closed));
            self.link_lost("send failed");
            return;
        }
        let deadline = Instant::now() + timeout;
        self.deadlines
            .entry(deadline)
            .or_default()
            .insert(call.id.clone());
        self.pending.insert(
            call.id,
            PendingCall {
                name: call.name,
                deadline,
                reply,
            },
        );
    }

    fn dispatch_local(&mut self, call: Call) {
        self.events.send(Event::LocalCall(call.name.clone()));
        let reply = match self.handlers.get_mut(&call.name) {
            Some(handler) => match handler(call.args) {
                Ok(value) => Reply::ok(call.id, value),
                Err(msg) => Reply::err(call.id, msg),
            },
            None => {
                tracing::warn!(name = %call.name, "backend called unknown local operation");
                Reply::err(call.id, format!("unknown operation {}", call.name))
            }
        };
        let failed = match &self.link {
            Some(link) => link.port.send(reply.to_value()).is_err(),
            None => false,
        };
        if failed {
            self.link_lost("send failed");
        }
    }

    fn process_value(&mut self, value: Value) {
        let frame = match Frame::from_value(value) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed message");
                self.events.send(Event::ProtocolError(e.to_string()));
                return;
            }
        };
        if let Some(call) = self.pending.remove(&frame.id) {
            self.forget_deadline(call.deadline, &frame.id);
            let _ = call.reply.send(Ok(frame.into_reply()));
        } else if frame.is_call_shaped() {
            match frame.into_call() {
                Ok(call) => self.dispatch_local(call),
                Err(e) => self.events.send(Event::ProtocolError(e.to_string())),
            }
        } else {
            // Usually the reply to a call that already timed out.
            tracing::debug!(id = %frame.id, "reply without pending call");
            self.events
                .send(Event::ProtocolError(format!("unexpected reply {}", frame.id)));
        }
    }

    /// Handles requests from the handles. Returns false once they are all gone
    /// or one asked to close.
    fn process_requests(&mut self) -> bool {
        use channel::TryRecvError;
        loop {
            match self.requests.try_recv() {
                Ok(Request::Call {
                    call,
                    timeout,
                    reply,
                }) => self.start_call(call, timeout, reply),
                Ok(Request::Expose { name, handler }) => {
                    self.handlers.insert(name, handler);
                }
                Ok(Request::Withdraw { name }) => {
                    self.handlers.remove(&name);
                }
                Ok(Request::Close) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn process_link(&mut self) {
        use channel::TryRecvError;
        loop {
            let res = match &self.link {
                Some(link) => link.rx.try_recv(),
                None => return,
            };
            match res {
                Ok(Ok(value)) => self.process_value(value),
                Ok(Err(RecvError::Protocol(e))) => {
                    tracing::warn!(error = %e, "protocol error on backend link");
                    self.events.send(Event::ProtocolError(e.to_string()));
                }
                Ok(Err(RecvError::NotReady)) => {}
                Ok(Err(RecvError::Disconnected)) => {
                    self.link_lost("closed by backend");
                    return;
                }
                Ok(Err(e)) => {
                    tracing::debug!(error = ?e, "transport error");
                    self.link_lost("transport error");
                    return;
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.link_lost("port thread exited");
                    return;
                }
            }
        }
    }

    pub(super) fn run(&mut self) {
        'mainloop: loop {
            let mut timeout = self.process_call_timeouts();

            if self.link.is_none() {
                let now = Instant::now();
                if now >= self.next_attempt {
                    if self.try_connect() {
                        self.reported_failure = false;
                        self.peers.store(1, Ordering::SeqCst);
                        self.events.send(Event::Connected);
                        self.events.send(Event::PeerCount(1));
                    } else {
                        if !self.reported_failure {
                            self.events.send(Event::ConnectFailed);
                            self.reported_failure = true;
                        }
                        self.next_attempt = now + self.options.reconnect_delay;
                    }
                }
                if self.link.is_none() {
                    timeout = timeout.min(self.next_attempt.saturating_duration_since(now));
                }
            }

            let index = {
                let mut sel = channel::Select::new();
                sel.recv(&self.requests);
                if let Some(link) = &self.link {
                    sel.recv(&link.rx);
                }
                match sel.ready_timeout(timeout) {
                    Ok(index) => index,
                    Err(channel::ReadyTimeoutError) => continue,
                }
            };

            if index == 0 {
                if !self.process_requests() {
                    break 'mainloop;
                }
            } else {
                self.process_link();
            }
        }

        self.reject_pending(TransportError::Exiting);
        if self.link.take().is_some() {
            self.peers.store(0, Ordering::SeqCst);
            self.events.send(Event::Disconnected);
            self.events.send(Event::PeerCount(0));
        }
        self.events.send(Event::Exiting);
    }
}
