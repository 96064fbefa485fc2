use base64::Engine;
use connview::remote::{Backend, Device, RemoteErrorKind};
use connview::settings::{MemoryStore, SettingsSync};
use connview::trace::{Command, Update};
use connview::wire::{AddressError, CallError, Event, Session, TransportError};
use connview::{RemoteProxy, Tracer};

use serde_json::{json, Value};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

/// One accepted connection of the fake backend.
struct Peer {
    values: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<TcpStream>, Value>,
    writer: TcpStream,
}

impl Peer {
    fn accept(listener: &TcpListener) -> Peer {
        let (stream, _) = listener.accept().unwrap();
        let writer = stream.try_clone().unwrap();
        Peer {
            values: serde_json::Deserializer::from_reader(stream).into_iter::<Value>(),
            writer,
        }
    }

    fn next(&mut self) -> Option<Value> {
        self.values.next().and_then(|v| v.ok())
    }

    /// Next incoming call as (id, name, args).
    fn next_call(&mut self) -> Option<(String, String, Vec<Value>)> {
        let value = self.next()?;
        let id = value[0].as_str()?.to_string();
        let name = value[1].as_str()?.to_string();
        let args = value[2].as_array()?.clone();
        Some((id, name, args))
    }

    fn send(&mut self, value: Value) {
        let mut raw = serde_json::to_vec(&value).unwrap();
        raw.push(b'\n');
        self.writer.write_all(&raw).unwrap();
    }

    fn reply(&mut self, id: &str, value: Value) {
        self.send(json!([id, value, null]));
    }

    fn fail(&mut self, id: &str, message: &str) {
        self.send(json!([id, null, message]));
    }
}

fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("tcp://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn open(url: &str) -> Session {
    let session = Session::open(url).unwrap();
    assert!(session.wait_open(Duration::from_secs(5)));
    session
}

#[test]
fn calls_round_trip_through_proxy() {
    let (listener, url) = listen();
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        while let Some((id, name, args)) = peer.next_call() {
            match name.as_str() {
                "ListDevices" => peer.reply(
                    &id,
                    json!([{"PcapName": "eth0", "NetName": "Ethernet", "MTU": 1500}]),
                ),
                "SetMaxPacketCache" => {
                    assert_eq!(args, vec![json!(250)]);
                    peer.reply(&id, Value::Null);
                }
                "GetDBPath" => peer.fail(&id, "permission denied"),
                "CheckDatabase" => peer.reply(&id, json!("yes")),
                _ => peer.fail(&id, "unexpected"),
            }
        }
    });

    let proxy = RemoteProxy::new(open(&url));
    let devices = proxy.list_devices().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].pcap_name, "eth0");
    assert_eq!(devices[0].mtu, 1500);

    proxy.set_max_packet_cache(250).unwrap();

    let err = proxy.get_db_path().unwrap_err();
    assert_eq!(err.operation, "GetDBPath");
    assert_eq!(err.kind, RemoteErrorKind::Failed("permission denied".into()));

    let err = proxy.check_database().unwrap_err();
    assert!(matches!(err.kind, RemoteErrorKind::Decode(_)));

    proxy.into_session().close();
    server.join().unwrap();
}

#[test]
fn backend_can_call_exposed_operations() {
    let (listener, url) = listen();
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let (id, name, _) = peer.next_call().unwrap();
        assert_eq!(name, "TraceDevice");

        peer.send(json!(["srv-1", "GetEscalationPermission", [true]]));
        let answer = peer.next().unwrap();
        assert_eq!(answer, json!(["srv-1", true, null]));

        peer.send(json!(["srv-2", "NoSuchOperation", []]));
        let answer = peer.next().unwrap();
        assert_eq!(answer[0], json!("srv-2"));
        assert!(answer[2].as_str().unwrap().contains("unknown operation"));

        peer.reply(&id, Value::Null);
    });

    let proxy = RemoteProxy::new(open(&url));
    proxy
        .on_escalation_request(|restart| {
            assert!(restart);
            true
        })
        .unwrap();
    proxy.trace_device(&Default::default()).unwrap();
    server.join().unwrap();
}

#[test]
fn reconnect_rejects_pending_calls() {
    let (listener, url) = listen();
    let server = thread::spawn(move || {
        // First link: take a call and hang up without answering.
        let mut first = Peer::accept(&listener);
        let (_, name, _) = first.next_call().unwrap();
        assert_eq!(name, "GetPackets");
        drop(first);

        let mut second = Peer::accept(&listener);
        while let Some((id, _, _)) = second.next_call() {
            second.reply(&id, json!([]));
        }
    });

    let session = open(&url);
    let events = session.events().clone();
    let proxy = RemoteProxy::new(session);

    let err = proxy.get_packets().unwrap_err();
    assert_eq!(err.operation, "GetPackets");
    assert_eq!(err.kind, RemoteErrorKind::Transport(TransportError::Closed));
    assert!(err.is_transport());

    let mut peer_counts = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while peer_counts != [1, 0, 1] && Instant::now() < deadline {
        if let Ok(Event::PeerCount(n)) = events.recv_timeout(Duration::from_millis(100)) {
            peer_counts.push(n);
        }
    }
    assert_eq!(peer_counts, vec![1, 0, 1]);

    assert!(proxy.session().wait_open(Duration::from_secs(5)));
    assert_eq!(proxy.get_packets().unwrap(), vec![]);

    proxy.into_session().close();
    server.join().unwrap();
}

#[test]
fn unanswered_call_times_out() {
    let (listener, url) = listen();
    let (done_sender, done) = crossbeam::channel::bounded::<()>(1);
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let _ = peer.next_call();
        let _ = done.recv_timeout(Duration::from_secs(5));
    });

    let session = open(&url);
    let started = Instant::now();
    let res = session.call_with_timeout("GetConnections", vec![], Duration::from_millis(150));
    assert_eq!(res, Err(CallError::Transport(TransportError::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(150));

    done_sender.send(()).unwrap();
    session.close();
    server.join().unwrap();
}

#[test]
fn call_without_link_fails_fast() {
    let (listener, url) = listen();
    drop(listener);

    let session = Session::open(&url).unwrap();
    assert_eq!(
        session.call("ListDevices", vec![]),
        Err(CallError::Transport(TransportError::NotConnected))
    );
    assert_eq!(session.peer_count(), 0);
    let mut saw_failure = false;
    while let Ok(event) = session.events().recv_timeout(Duration::from_millis(500)) {
        if event == Event::ConnectFailed {
            saw_failure = true;
            break;
        }
    }
    assert!(saw_failure);
}

#[test]
fn websocket_addresses_are_rejected() {
    assert!(matches!(
        Session::open("ws://localhost:1337"),
        Err(AddressError::UnsupportedScheme(_))
    ));
}

#[test]
fn upload_is_pulled_in_chunks() {
    let (listener, url) = listen();
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let (id, name, args) = peer.next_call().unwrap();
        assert_eq!(name, "UploadDatabase");
        let callback = args[0].as_str().unwrap().to_string();
        assert!(callback.starts_with("UploadDatabase."));

        let mut received = Vec::new();
        for n in 0.. {
            peer.send(json!([format!("pull-{n}"), callback, []]));
            let answer = peer.next().unwrap();
            match &answer[1] {
                Value::String(chunk) => received.extend(
                    base64::engine::general_purpose::STANDARD
                        .decode(chunk)
                        .unwrap(),
                ),
                Value::Null => break,
                other => panic!("unexpected chunk {other}"),
            }
        }
        peer.reply(&id, Value::Null);
        received
    });

    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let proxy = RemoteProxy::new(open(&url));
    proxy
        .upload_database(Box::new(std::io::Cursor::new(data.clone())))
        .unwrap();
    assert_eq!(server.join().unwrap(), data);
}

#[test]
fn escalation_asked_during_trace_start_gets_answered() {
    let (listener, url) = listen();
    let server = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let mut answer = None;
        while let Some((id, name, _)) = peer.next_call() {
            if name == "TraceDevice" {
                // Capture needs privileges: ask before replying.
                peer.send(json!(["srv-1", "GetEscalationPermission", [true]]));
                answer = peer.next();
                peer.reply(&id, Value::Null);
            } else {
                peer.reply(&id, json!([]));
            }
        }
        answer
    });

    let proxy = RemoteProxy::new(open(&url));
    let (ask_sender, asks) = crossbeam::channel::bounded(1);
    proxy
        .on_escalation_request(move |restart| {
            let (answer, reply) = crossbeam::channel::bounded(1);
            if ask_sender.try_send((restart, answer)).is_err() {
                return false;
            }
            reply.recv_timeout(Duration::from_secs(5)).unwrap_or(false)
        })
        .unwrap();

    let settings = SettingsSync::load(MemoryStore::default()).unwrap();
    let trace = Tracer::new(proxy, settings).spawn();
    assert!(trace.send(Command::Start(Device {
        pcap_name: "eth0".into(),
        ..Default::default()
    })));

    // The request reaches this thread while the trace call is in flight.
    let (restart, answer): (bool, crossbeam::channel::Sender<bool>) =
        asks.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(restart);
    answer.send(true).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut traced = None;
    while traced.is_none() && Instant::now() < deadline {
        match trace.updates().recv_timeout(Duration::from_millis(100)) {
            Ok(Update::Snapshot(snapshot)) => traced = snapshot.device.map(|d| d.pcap_name),
            Ok(Update::StartFailed(e)) => panic!("start failed: {e}"),
            _ => {}
        }
    }
    assert_eq!(traced.as_deref(), Some("eth0"));

    trace.close();
    assert_eq!(server.join().unwrap(), Some(json!(["srv-1", true, null])));
}
