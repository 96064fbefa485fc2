//! Stream port
//!
//! A `Port` carries JSON values over one TCP byte stream. It provides:
//! - framing: outgoing values are written whole (the unsent tail is
//!   buffered and drained when the socket becomes writable again), and
//!   incoming bytes are fed through an incremental decoder so a value
//!   split over several reads is still delivered whole;
//! - a bridge between the `mio` world of the socket and crossbeam
//!   channels, via an owned rx callback and a waker-backed tx queue.
//!
//! Note: `Port` sets up a dedicated thread to perform the above. The
//! thread exits when the stream fails or when the `Port` is dropped.

mod iobuf;

use super::frame;
use iobuf::IOBuf;
use mio::net::TcpStream;
use serde_json::Value;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

/// Possible errors when receiving from a `Port`
#[derive(Debug)]
pub enum RecvError {
    /// No complete value available at this time.
    NotReady,
    /// The peer closed the stream.
    Disconnected,
    /// Error in the data.
    Protocol(frame::Error),
    /// Low level IO error.
    IO(io::Error),
}

/// Possible errors when sending to a `Port`
#[derive(Debug)]
pub enum SendError {
    /// Internal: a value was partially written and must be drained.
    MustDrain,
    /// The previous value has not been drained yet.
    Full,
    /// The port thread is gone.
    Disconnected,
    IO(io::Error),
    Serialization,
}

/// Default size of the rx channel when receiving to a crossbeam channel.
pub const DEFAULT_RX_CHANNEL_SIZE: usize = 256;

/// Default size of the queue of values waiting to be written.
pub const DEFAULT_TX_CHANNEL_SIZE: usize = 64;

/// The raw, non blocking half of the port: socket plus buffers.
struct RawStream {
    stream: TcpStream,
    rxbuf: IOBuf,
    txbuf: IOBuf,
}

impl RawStream {
    fn new(stream: TcpStream) -> RawStream {
        RawStream {
            stream,
            rxbuf: IOBuf::new(),
            txbuf: IOBuf::new(),
        }
    }

    fn recv_buffered(&mut self) -> Result<Value, RecvError> {
        match frame::decode_value(self.rxbuf.data()) {
            Ok((value, size)) => {
                self.rxbuf.consume(size);
                Ok(value)
            }
            Err(frame::Error::NeedMore) => Err(RecvError::NotReady),
            Err(e) => {
                // There is no way to resynchronize inside a broken value.
                self.rxbuf.flush();
                Err(RecvError::Protocol(e))
            }
        }
    }

    /// Returns the next value, reading from the socket until one is complete
    /// or the socket would block.
    fn recv(&mut self) -> Result<Value, RecvError> {
        loop {
            match self.recv_buffered() {
                Err(RecvError::NotReady) => self.rxbuf.refill(&mut self.stream)?,
                res => return res,
            }
        }
    }

    fn send(&mut self, value: &Value) -> Result<(), SendError> {
        if self.has_data_to_drain() {
            return Err(SendError::Full);
        }
        let raw = frame::encode_value(value).map_err(|_| SendError::Serialization)?;
        match self.stream.write(&raw) {
            Ok(size) if size == raw.len() => Ok(()),
            Ok(size) => {
                self.txbuf.add_data(&raw[size..]);
                Err(SendError::MustDrain)
            }
            Err(err) => match err.kind() {
                // Right after connecting, or with the socket buffer full.
                io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected => {
                    self.txbuf.add_data(&raw);
                    Err(SendError::MustDrain)
                }
                _ => Err(SendError::IO(err)),
            },
        }
    }

    fn drain(&mut self) -> Result<(), SendError> {
        self.txbuf.drain(&mut self.stream)
    }

    fn has_data_to_drain(&self) -> bool {
        !self.txbuf.empty()
    }
}

impl mio::event::Source for RawStream {
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

const WAKER: mio::Token = mio::Token(0);
const STREAM: mio::Token = mio::Token(1);

/// Opaque port object, owning the poller thread of one stream.
pub struct Port {
    tx: Option<crossbeam::channel::Sender<Value>>,
    waker: mio::Waker,
    peer: SocketAddr,
}

impl Port {
    /// Event loop of the port thread. Bridges `mio` and crossbeam and
    /// takes care of tx buffering and draining.
    fn poller_thread<RxCallbackT: Fn(Result<Value, RecvError>) -> io::Result<()>>(
        mut raw: RawStream,
        mut poll: mio::Poll,
        rx: RxCallbackT,
        tx: crossbeam::channel::Receiver<Value>,
    ) {
        use crossbeam::channel::TryRecvError;

        let mut events = mio::Events::with_capacity(8);
        let mut needs_draining = false;
        let mut needs_tx_queue_check = false;

        if let Err(e) = poll
            .registry()
            .register(&mut raw, STREAM, mio::Interest::READABLE)
        {
            let _ = rx(Err(RecvError::IO(e)));
            return;
        }

        'ioloop: loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                let _ = rx(Err(RecvError::IO(e)));
                break;
            }

            let mut check_tx_channel = false;

            for event in events.iter() {
                match event.token() {
                    WAKER => {
                        // Values were queued, or the queue was closed.
                        if needs_draining {
                            needs_tx_queue_check = true;
                        } else {
                            check_tx_channel = true;
                        }
                    }
                    STREAM => {
                        if event.is_writable() && needs_draining {
                            match raw.drain() {
                                Ok(()) => {
                                    needs_draining = false;
                                    if poll
                                        .registry()
                                        .reregister(&mut raw, STREAM, mio::Interest::READABLE)
                                        .is_err()
                                    {
                                        break 'ioloop;
                                    }
                                }
                                Err(SendError::MustDrain) => {}
                                Err(e) => {
                                    let _ = rx(Err(match e {
                                        SendError::IO(e) => RecvError::IO(e),
                                        _ => RecvError::Disconnected,
                                    }));
                                    break 'ioloop;
                                }
                            }
                        }
                        if event.is_readable() || event.is_read_closed() || event.is_error() {
                            loop {
                                match raw.recv() {
                                    Ok(value) => {
                                        if rx(Ok(value)).is_err() {
                                            break 'ioloop;
                                        }
                                    }
                                    Err(RecvError::NotReady) => break,
                                    Err(e) => {
                                        let fatal = !matches!(e, RecvError::Protocol(_));
                                        if rx(Err(e)).is_err() || fatal {
                                            break 'ioloop;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    mio::Token(_) => {}
                }
            }

            if !needs_draining && needs_tx_queue_check {
                check_tx_channel = true;
                needs_tx_queue_check = false;
            }

            if check_tx_channel {
                loop {
                    match tx.try_recv() {
                        Ok(value) => match raw.send(&value) {
                            Ok(()) => {}
                            Err(SendError::MustDrain) => {
                                needs_draining = true;
                                if poll
                                    .registry()
                                    .reregister(
                                        &mut raw,
                                        STREAM,
                                        mio::Interest::READABLE.add(mio::Interest::WRITABLE),
                                    )
                                    .is_err()
                                {
                                    break 'ioloop;
                                }
                                // Remaining queued values go out once drained.
                                needs_tx_queue_check = true;
                                break;
                            }
                            Err(SendError::Serialization) => {
                                tracing::warn!("dropping value that failed to serialize");
                            }
                            Err(e) => {
                                let _ = rx(Err(match e {
                                    SendError::IO(e) => RecvError::IO(e),
                                    _ => RecvError::Disconnected,
                                }));
                                break 'ioloop;
                            }
                        },
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => break 'ioloop,
                    }
                }
            }
        }
        let _ = raw.stream.shutdown(std::net::Shutdown::Both);
    }

    /// Connects to `addr`, waiting at most `connect_timeout` for the
    /// handshake, and starts the port thread. Received values and errors are
    /// handed to `rx`; if it returns an `Err()`, the port is closed.
    pub fn connect<RXT: Fn(Result<Value, RecvError>) -> io::Result<()> + Send + 'static>(
        addr: &SocketAddr,
        connect_timeout: Duration,
        rx: RXT,
    ) -> io::Result<Port> {
        let stream = std::net::TcpStream::connect_timeout(addr, connect_timeout)?;
        Port::from_tcp_stream(stream, rx)
    }

    /// Create a new port from a connected `std::net::TcpStream`.
    pub fn from_tcp_stream<RXT: Fn(Result<Value, RecvError>) -> io::Result<()> + Send + 'static>(
        stream: std::net::TcpStream,
        rx: RXT,
    ) -> io::Result<Port> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let raw = RawStream::new(TcpStream::from_std(stream));

        let (tx, ttx) = crossbeam::channel::bounded::<Value>(DEFAULT_TX_CHANNEL_SIZE);
        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER)?;
        thread::Builder::new()
            .name(format!("connview-port-{peer}"))
            .spawn(move || {
                Port::poller_thread(raw, poll, rx, ttx);
            })?;
        Ok(Port {
            tx: Some(tx),
            waker,
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Creates a sender/receiver pair to be used with `rx_to_channel`.
    pub fn rx_channel() -> (
        crossbeam::channel::Sender<Result<Value, RecvError>>,
        crossbeam::channel::Receiver<Result<Value, RecvError>>,
    ) {
        crossbeam::channel::bounded(DEFAULT_RX_CHANNEL_SIZE)
    }

    /// Returns a RX callback which forwards results to a channel. It blocks
    /// while the channel is full, since values on a session link cannot be
    /// dropped without stranding a caller.
    pub fn rx_to_channel(
        rx_send: crossbeam::channel::Sender<Result<Value, RecvError>>,
    ) -> impl Fn(Result<Value, RecvError>) -> io::Result<()> {
        move |rxdata| -> io::Result<()> {
            let disconnected = matches!(rxdata, Err(RecvError::Disconnected));
            if rx_send.send(rxdata).is_err() || disconnected {
                return Err(io::Error::from(io::ErrorKind::BrokenPipe));
            }
            Ok(())
        }
    }

    /// Queues a value to be written. Blocks if the queue is full.
    pub fn send(&self, value: Value) -> Result<(), SendError> {
        let tx = self.tx.as_ref().ok_or(SendError::Disconnected)?;
        if tx.send(value).is_err() {
            return Err(SendError::Disconnected);
        }
        self.waker.wake().map_err(SendError::IO)
    }

    /// Attempts to queue a value without blocking.
    pub fn try_send(&self, value: Value) -> Result<(), SendError> {
        use crossbeam::channel::TrySendError;
        let tx = self.tx.as_ref().ok_or(SendError::Disconnected)?;
        match tx.try_send(value) {
            Ok(()) => self.waker.wake().map_err(SendError::IO),
            Err(TrySendError::Full(_)) => Err(SendError::Full),
            Err(TrySendError::Disconnected(_)) => Err(SendError::Disconnected),
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Closing the tx queue and waking the thread makes it exit.
        drop(self.tx.take());
        let _ = self.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn values_survive_fragmented_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let raw = br#"["a",1,null]["b",{"x":[1,2,3]},null]"#;
            for piece in raw.chunks(5) {
                conn.write_all(piece).unwrap();
                conn.flush().unwrap();
                thread::sleep(Duration::from_millis(2));
            }
            let mut echoed = vec![0u8; 64];
            let n = conn.read(&mut echoed).unwrap();
            echoed.truncate(n);
            echoed
        });

        let (rx_send, rx) = Port::rx_channel();
        let port = Port::connect(&addr, Duration::from_secs(1), Port::rx_to_channel(rx_send)).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(first, json!(["a", 1, null]));
        assert_eq!(second, json!(["b", {"x": [1, 2, 3]}, null]));

        port.send(json!(["c", "Ping", []])).unwrap();
        let echoed = server.join().unwrap();
        let (value, _) = frame::decode_value(&echoed).unwrap();
        assert_eq!(value, json!(["c", "Ping", []]));
    }

    #[test]
    fn peer_close_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });
        let (rx_send, rx) = Port::rx_channel();
        let _port = Port::connect(&addr, Duration::from_secs(1), Port::rx_to_channel(rx_send)).unwrap();
        server.join().unwrap();
        let mut saw_disconnect = false;
        while let Ok(res) = rx.recv_timeout(Duration::from_secs(2)) {
            if let Err(RecvError::Disconnected) | Err(RecvError::IO(_)) = res {
                saw_disconnect = true;
                break;
            }
        }
        assert!(saw_disconnect);
    }
}
