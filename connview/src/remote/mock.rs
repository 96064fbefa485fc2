use super::{Backend, Device, RemoteError, Result};
use crate::flow::model::{ConnectionRecord, Location, PacketObservation};

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<Device>,
    traced: Vec<Device>,
    /// Each call to `get_connections` takes the next snapshot; the last one
    /// keeps being returned.
    connections: VecDeque<Vec<ConnectionRecord>>,
    packets: VecDeque<Vec<PacketObservation>>,
    summarized: bool,

    max_packet_cache: i64,
    max_connections_cache: i64,
    db_download_url: String,
    db_path: String,
    db_present: bool,
    uploaded: Vec<u8>,

    locations: HashMap<String, Location>,
    failing: HashSet<&'static str>,
    calls: Vec<&'static str>,
}

/// In-memory backend for tests and demos.
#[derive(Debug)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend {
            state: Mutex::new(MockState {
                max_packet_cache: 100,
                max_connections_cache: 1_000_000,
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Records the call, failing it if `operation` was set to fail.
    fn enter(&self, operation: &'static str) -> Result<()> {
        self.with(|s| {
            s.calls.push(operation);
            if s.failing.contains(operation) {
                Err(RemoteError::failed(operation, "injected failure"))
            } else {
                Ok(())
            }
        })
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.with(|s| s.devices = devices);
    }

    pub fn push_connections(&self, snapshot: Vec<ConnectionRecord>) {
        self.with(|s| s.connections.push_back(snapshot));
    }

    pub fn push_packets(&self, snapshot: Vec<PacketObservation>) {
        self.with(|s| s.packets.push_back(snapshot));
    }

    pub fn set_location(&self, ip: &str, location: Location) {
        self.with(|s| s.locations.insert(ip.to_string(), location));
    }

    pub fn set_database_present(&self, present: bool) {
        self.with(|s| s.db_present = present);
    }

    /// Makes every later call of `operation` fail.
    pub fn fail(&self, operation: &'static str) {
        self.with(|s| s.failing.insert(operation));
    }

    pub fn recover(&self, operation: &'static str) {
        self.with(|s| s.failing.remove(operation));
    }

    /// Operation names called so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.with(|s| s.calls.clone())
    }

    pub fn traced(&self) -> Vec<Device> {
        self.with(|s| s.traced.clone())
    }

    pub fn is_summarized(&self) -> bool {
        self.with(|s| s.summarized)
    }

    pub fn uploaded(&self) -> Vec<u8> {
        self.with(|s| s.uploaded.clone())
    }
}

fn next_snapshot<T: Clone>(queue: &mut VecDeque<T>) -> Option<T> {
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

impl Backend for MockBackend {
    fn list_devices(&self) -> Result<Vec<Device>> {
        self.enter("ListDevices")?;
        Ok(self.with(|s| s.devices.clone()))
    }

    fn trace_device(&self, device: &Device) -> Result<()> {
        self.enter("TraceDevice")?;
        self.with(|s| s.traced.push(device.clone()));
        Ok(())
    }

    fn get_connections(&self) -> Result<Vec<ConnectionRecord>> {
        self.enter("GetConnections")?;
        Ok(self.with(|s| next_snapshot(&mut s.connections).unwrap_or_default()))
    }

    fn get_packets(&self) -> Result<Vec<PacketObservation>> {
        self.enter("GetPackets")?;
        Ok(self.with(|s| next_snapshot(&mut s.packets).unwrap_or_default()))
    }

    fn set_is_summarized(&self, summarized: bool) -> Result<()> {
        self.enter("SetIsSummarized")?;
        self.with(|s| {
            if s.summarized != summarized {
                s.summarized = summarized;
                s.packets.clear();
            }
        });
        Ok(())
    }

    fn get_max_packet_cache(&self) -> Result<i64> {
        self.enter("GetMaxPacketCache")?;
        Ok(self.with(|s| s.max_packet_cache))
    }

    fn set_max_packet_cache(&self, size: i64) -> Result<()> {
        self.enter("SetMaxPacketCache")?;
        self.with(|s| s.max_packet_cache = size);
        Ok(())
    }

    fn get_max_connections_cache(&self) -> Result<i64> {
        self.enter("GetMaxConnectionsCache")?;
        Ok(self.with(|s| s.max_connections_cache))
    }

    fn set_max_connections_cache(&self, size: i64) -> Result<()> {
        self.enter("SetMaxConnectionsCache")?;
        self.with(|s| s.max_connections_cache = size);
        Ok(())
    }

    fn get_db_download_url(&self) -> Result<String> {
        self.enter("GetDBDownloadURL")?;
        Ok(self.with(|s| s.db_download_url.clone()))
    }

    fn set_db_download_url(&self, url: &str) -> Result<()> {
        self.enter("SetDBDownloadURL")?;
        self.with(|s| s.db_download_url = url.to_string());
        Ok(())
    }

    fn get_db_path(&self) -> Result<String> {
        self.enter("GetDBPath")?;
        Ok(self.with(|s| s.db_path.clone()))
    }

    fn set_db_path(&self, path: &str) -> Result<()> {
        self.enter("SetDBPath")?;
        self.with(|s| s.db_path = path.to_string());
        Ok(())
    }

    fn check_database(&self) -> Result<bool> {
        self.enter("CheckDatabase")?;
        Ok(self.with(|s| !s.db_present))
    }

    fn download_database(&self, _license_key: &str) -> Result<()> {
        self.enter("DownloadDatabase")?;
        self.with(|s| s.db_present = true);
        Ok(())
    }

    fn upload_database(&self, mut data: Box<dyn Read + Send>) -> Result<()> {
        self.enter("UploadDatabase")?;
        let mut buf = Vec::new();
        data.read_to_end(&mut buf)
            .map_err(|e| RemoteError::failed("UploadDatabase", e.to_string()))?;
        self.with(|s| {
            s.uploaded = buf;
            s.db_present = true;
        });
        Ok(())
    }

    fn delete_database(&self) -> Result<()> {
        self.enter("DeleteDatabase")?;
        self.with(|s| s.db_present = false);
        Ok(())
    }

    fn restart_app(&self, _fix_permissions: bool) -> Result<()> {
        self.enter("RestartApp")
    }

    fn lookup_location(&self, ip: &str) -> Result<Location> {
        self.enter("LookupLocation")?;
        self.with(|s| s.locations.get(ip).copied())
            .ok_or_else(|| RemoteError::failed("LookupLocation", format!("no location for {ip}")))
    }

    fn open_external_link(&self, _url: &str) -> Result<()> {
        self.enter("OpenExternalLink")
    }
}
