//! Remote capabilities
//!
//! `Backend` is the complete set of operations the capture backend offers.
//! `RemoteProxy` implements it over a `Session`, `MockBackend` in memory.
//! Every failure comes back as a `RemoteError` naming the operation; no
//! implementation retries on its own.

pub mod mock;
pub mod proxy;

pub use mock::MockBackend;
pub use proxy::RemoteProxy;

use crate::flow::model::{ConnectionRecord, Location, PacketObservation};
use crate::wire::TransportError;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// A capture device as listed by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    #[serde(rename = "PcapName")]
    pub pcap_name: String,
    #[serde(rename = "NetName")]
    pub net_name: String,
    #[serde(rename = "MTU")]
    pub mtu: i64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteErrorKind {
    /// The backend executed the operation and reported a failure.
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Transport(TransportError),
    /// The reply could not be decoded into the expected type.
    #[error("unexpected reply: {0}")]
    Decode(String),
}

/// A failed backend operation. `kind` tells a refusal by the backend apart
/// from a broken link or an unreadable reply; `message()` renders it as
/// text, which for `Failed` is the backend's own error string verbatim.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation} failed: {kind}")]
pub struct RemoteError {
    pub operation: &'static str,
    pub kind: RemoteErrorKind,
}

impl RemoteError {
    pub fn new(operation: &'static str, kind: RemoteErrorKind) -> RemoteError {
        RemoteError { operation, kind }
    }

    pub fn failed(operation: &'static str, message: impl Into<String>) -> RemoteError {
        Self::new(operation, RemoteErrorKind::Failed(message.into()))
    }

    /// True if the operation failed because the link was unavailable rather
    /// than because the backend refused it.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, RemoteErrorKind::Transport(_))
    }

    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

pub trait Backend {
    fn list_devices(&self) -> Result<Vec<Device>>;
    fn trace_device(&self, device: &Device) -> Result<()>;
    /// Current connections, replacing any earlier snapshot.
    fn get_connections(&self) -> Result<Vec<ConnectionRecord>>;
    /// The backend's packet cache, newest first.
    fn get_packets(&self) -> Result<Vec<PacketObservation>>;
    fn set_is_summarized(&self, summarized: bool) -> Result<()>;

    fn get_max_packet_cache(&self) -> Result<i64>;
    fn set_max_packet_cache(&self, size: i64) -> Result<()>;
    fn get_max_connections_cache(&self) -> Result<i64>;
    fn set_max_connections_cache(&self, size: i64) -> Result<()>;
    fn get_db_download_url(&self) -> Result<String>;
    fn set_db_download_url(&self, url: &str) -> Result<()>;
    fn get_db_path(&self) -> Result<String>;
    fn set_db_path(&self, path: &str) -> Result<()>;

    /// Returns true if the GeoIP database is missing and must be fetched.
    fn check_database(&self) -> Result<bool>;
    fn download_database(&self, license_key: &str) -> Result<()>;
    /// Streams a database file to the backend.
    fn upload_database(&self, data: Box<dyn Read + Send>) -> Result<()>;
    fn delete_database(&self) -> Result<()>;

    fn restart_app(&self, fix_permissions: bool) -> Result<()>;
    fn lookup_location(&self, ip: &str) -> Result<Location>;
    fn open_external_link(&self, url: &str) -> Result<()>;
}
