use connview::flow::view::{Column, SortDirection, ViewOptions};
use connview::flow::{Direction, Location, PacketObservation};
use connview::remote::{Backend, Device, MockBackend};
use connview::settings::{LocalCache, MemoryStore, SettingsSync};
use connview::{TraceEvent, Tracer};

fn record(src: &str, dst: &str, timestamp: i64) -> PacketObservation {
    PacketObservation {
        timestamp,
        length: 60,
        layer_type: "IPv4".into(),
        next_layer_type: "TCP".into(),
        src_ip: src.into(),
        dst_ip: dst.into(),
        ..Default::default()
    }
}

fn tracer(backend: MockBackend, cache: LocalCache) -> Tracer<MockBackend, MemoryStore> {
    Tracer::new(backend, SettingsSync::load(MemoryStore::new(cache)).unwrap())
}

fn eth0() -> Device {
    Device {
        pcap_name: "eth0".into(),
        net_name: "Ethernet".into(),
        mtu: 1500,
    }
}

#[test]
fn flows_keep_first_seen_coordinates_and_local_location() {
    let backend = MockBackend::new();
    backend.set_location("198.51.100.4", Location::new(-0.1, 51.5));

    let mut inbound = record("203.0.113.8", "10.0.0.2", 1);
    inbound.src_country_name = "Japan".into();
    inbound.src_longitude = 139.7;
    inbound.src_latitude = 35.7;
    backend.push_connections(vec![inbound.clone()]);

    let mut moved = inbound.clone();
    moved.timestamp = 2;
    moved.src_longitude = 135.5;
    moved.src_latitude = 34.7;
    backend.push_connections(vec![moved]);

    let mut t = tracer(
        backend,
        LocalCache {
            public_address: Some("198.51.100.4".into()),
            ..Default::default()
        },
    );
    match t.on_connect() {
        TraceEvent::Connected {
            sync_errors,
            location,
        } => {
            assert!(sync_errors.is_empty());
            assert!(location.is_ok());
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(t.registry().local_location(), Some(Location::new(-0.1, 51.5)));

    t.start(eth0()).unwrap();
    t.poll_connections();
    t.poll_connections();

    let flows: Vec<_> = t.registry().flows().collect();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].src, Some(Location::new(139.7, 35.7)));
    // Local side was backfilled.
    assert_eq!(flows[0].dst, Some(Location::new(-0.1, 51.5)));
    assert_eq!(flows[0].direction, Direction::Inbound);
}

#[test]
fn packet_window_and_view() {
    let backend = MockBackend::new();
    let snapshot: Vec<_> = (0..150)
        .rev()
        .map(|t| record(&format!("10.0.0.{}", t % 3), "192.0.2.1", t))
        .collect();
    backend.push_packets(snapshot);

    let mut t = tracer(backend, LocalCache::default());
    t.on_connect();
    t.start(eth0()).unwrap();
    match t.poll_packets() {
        TraceEvent::Packets(n) => assert_eq!(n, 150),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(t.registry().packets().len(), 100);
    assert_eq!(t.registry().packets()[0].timestamp, 50);

    // The same cache polled again adds nothing.
    match t.poll_packets() {
        TraceEvent::Packets(n) => assert_eq!(n, 0),
        other => panic!("unexpected {other:?}"),
    }

    t.set_view_options(ViewOptions {
        filter: r"10\.0\.0\.1\b".into(),
        sort_column: Some(Column::Timestamp),
        direction: SortDirection::Descending,
        summarized: false,
    });
    let view = t.view();
    assert!(view.bad_filter.is_none());
    assert!(view.rows.iter().all(|r| r.observation.src_ip == "10.0.0.1"));
    assert_eq!(view.rows[0].observation.timestamp, 148);

    t.set_summarized(true).unwrap();
    assert!(t.backend().is_summarized());
    assert!(t.view().rows.is_empty());
}

#[test]
fn settings_reconcile_on_connect() {
    let backend = MockBackend::new();
    backend.set_max_connections_cache(3).unwrap();
    let mut t = tracer(
        backend,
        LocalCache {
            max_packet_cache: Some(10),
            ..Default::default()
        },
    );
    t.on_connect();
    assert_eq!(t.settings().max_packet_cache, 10);
    assert_eq!(t.settings().max_connections_cache, 3);
    assert_eq!(t.backend().get_max_packet_cache().unwrap(), 10);
}
