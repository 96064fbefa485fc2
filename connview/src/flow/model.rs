use serde::{Deserialize, Serialize};
use std::fmt;

/// One record as the backend reports it, both for connections and
/// packets. Fields missing on the wire read as zero values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PacketObservation {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub length: i64,
    pub layer_type: String,
    pub next_layer_type: String,

    #[serde(rename = "srcIP")]
    pub src_ip: String,
    pub src_country_name: String,
    pub src_city_name: String,
    pub src_longitude: f64,
    pub src_latitude: f64,

    #[serde(rename = "dstIP")]
    pub dst_ip: String,
    pub dst_country_name: String,
    pub dst_city_name: String,
    pub dst_longitude: f64,
    pub dst_latitude: f64,
}

/// A connection record has the same shape as a packet record; its length
/// and timestamp describe the packet that last touched it.
pub type ConnectionRecord = PacketObservation;

/// What makes two records the same flow. Location and timing are not part
/// of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowIdentity {
    pub layer_type: String,
    pub next_layer_type: String,
    pub src_ip: String,
    pub dst_ip: String,
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.layer_type, self.next_layer_type, self.src_ip, self.dst_ip
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub longitude: f64,
    pub latitude: f64,
}

impl Location {
    pub fn new(longitude: f64, latitude: f64) -> Location {
        Location {
            longitude,
            latitude,
        }
    }

    /// The backend reports unresolved coordinates as zero.
    pub fn is_zero(&self) -> bool {
        self.longitude == 0.0 && self.latitude == 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Guesses the direction of a flow.
///
/// The backend only resolves countries for public addresses, so a source
/// with a country is taken to be remote. This misreads traffic between two
/// public hosts and is kept as the single place to refine it.
pub fn classify_direction(obs: &PacketObservation) -> Direction {
    if obs.src_country_name.is_empty() {
        Direction::Outbound
    } else {
        Direction::Inbound
    }
}

/// A connection as tracked by the registry, keeping what it looked like
/// when first seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub identity: FlowIdentity,
    pub src: Option<Location>,
    pub dst: Option<Location>,
    pub label: String,
    pub direction: Direction,
    /// Timestamp of the record that introduced the flow.
    pub first_seen: i64,
    pub record: ConnectionRecord,
}

impl PacketObservation {
    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity {
            layer_type: self.layer_type.clone(),
            next_layer_type: self.next_layer_type.clone(),
            src_ip: self.src_ip.clone(),
            dst_ip: self.dst_ip.clone(),
        }
    }

    pub fn src_location(&self) -> Location {
        Location::new(self.src_longitude, self.src_latitude)
    }

    pub fn dst_location(&self) -> Location {
        Location::new(self.dst_longitude, self.dst_latitude)
    }
}

/// Substitutes `local` for each side whose coordinates are zero. Applying
/// it twice gives the same result as applying it once.
pub fn backfill(obs: &mut PacketObservation, local: Option<Location>) {
    let local = match local {
        Some(local) => local,
        None => return,
    };
    if obs.src_location().is_zero() {
        obs.src_longitude = local.longitude;
        obs.src_latitude = local.latitude;
    }
    if obs.dst_location().is_zero() {
        obs.dst_longitude = local.longitude;
        obs.dst_latitude = local.latitude;
    }
}

fn place(city: &str, country: &str) -> String {
    match (city.is_empty(), country.is_empty()) {
        (false, false) => format!("{city}, {country}"),
        (true, false) => country.to_string(),
        (false, true) => city.to_string(),
        (true, true) => String::new(),
    }
}

/// Human readable description of where a flow goes, e.g.
/// `10.0.0.2 -> 93.184.216.34 (Norwell, United States)`.
pub fn label(obs: &PacketObservation) -> String {
    let src = place(&obs.src_city_name, &obs.src_country_name);
    let dst = place(&obs.dst_city_name, &obs.dst_country_name);
    let mut label = format!("{} -> {}", obs.src_ip, obs.dst_ip);
    match (src.is_empty(), dst.is_empty()) {
        (true, true) => {}
        (false, true) => label.push_str(&format!(" ({src})")),
        (true, false) => label.push_str(&format!(" ({dst})")),
        (false, false) => label.push_str(&format!(" ({src} to {dst})")),
    }
    label
}

impl Flow {
    /// Builds a flow from a record that has already been backfilled.
    pub fn from_record(record: ConnectionRecord) -> Flow {
        let side = |loc: Location| if loc.is_zero() { None } else { Some(loc) };
        Flow {
            identity: record.identity(),
            src: side(record.src_location()),
            dst: side(record.dst_location()),
            label: label(&record),
            direction: classify_direction(&record),
            first_seen: record.timestamp,
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(src: &str, dst: &str) -> PacketObservation {
        PacketObservation {
            timestamp: 1,
            length: 60,
            layer_type: "IPv4".into(),
            next_layer_type: "TCP".into(),
            src_ip: src.into(),
            dst_ip: dst.into(),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_wire_record_with_missing_fields() {
        let obs: PacketObservation = serde_json::from_str(
            r#"{"timestamp": 1700000000000, "layerType": "IPv6", "srcIP": "::1",
                "dstCountryName": "Germany", "dstLatitude": 52.5}"#,
        )
        .unwrap();
        assert_eq!(obs.layer_type, "IPv6");
        assert_eq!(obs.src_ip, "::1");
        assert_eq!(obs.dst_country_name, "Germany");
        assert_eq!(obs.dst_latitude, 52.5);
        assert_eq!(obs.length, 0);
        assert_eq!(obs.next_layer_type, "");
    }

    #[test]
    fn identity_ignores_location_and_timing() {
        let mut a = record("10.0.0.1", "1.1.1.1");
        let mut b = a.clone();
        b.timestamp = 99;
        b.length = 1500;
        b.dst_longitude = 151.2;
        a.dst_country_name = "Australia".into();
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity().to_string(), "IPv4-TCP-10.0.0.1-1.1.1.1");
    }

    #[test]
    fn backfill_is_idempotent() {
        let local = Some(Location::new(8.5, 47.4));
        let mut obs = record("10.0.0.1", "1.1.1.1");
        obs.dst_longitude = 151.2;
        obs.dst_latitude = -33.9;
        backfill(&mut obs, local);
        let once = obs.clone();
        backfill(&mut obs, local);
        assert_eq!(obs, once);
        assert_eq!(obs.src_location(), Location::new(8.5, 47.4));
        assert_eq!(obs.dst_location(), Location::new(151.2, -33.9));
    }

    #[test]
    fn backfill_without_local_location_leaves_zero() {
        let mut obs = record("10.0.0.1", "1.1.1.1");
        backfill(&mut obs, None);
        assert!(obs.src_location().is_zero());
        assert_eq!(Flow::from_record(obs).src, None);
    }

    #[test]
    fn direction_and_label() {
        let mut obs = record("93.184.216.34", "10.0.0.2");
        obs.src_country_name = "United States".into();
        obs.src_city_name = "Norwell".into();
        let flow = Flow::from_record(obs);
        assert_eq!(flow.direction, Direction::Inbound);
        assert_eq!(flow.label, "93.184.216.34 -> 10.0.0.2 (Norwell, United States)");

        let flow = Flow::from_record(record("10.0.0.2", "10.0.0.3"));
        assert_eq!(flow.direction, Direction::Outbound);
        assert_eq!(flow.label, "10.0.0.2 -> 10.0.0.3");
    }
}
