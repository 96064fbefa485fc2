use super::{Backend, Device, RemoteError, RemoteErrorKind, Result};
use crate::flow::model::{ConnectionRecord, Location, PacketObservation};
use crate::wire::frame;
use crate::wire::{CallError, Session, TransportError};

use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::io::{self, Read};

/// Size of the file pieces handed out during a database upload.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Name of the consent prompt the backend calls before escalating its
/// capture privileges.
pub const ESCALATION_PERMISSION: &str = "GetEscalationPermission";

/// `Backend` over a live session.
pub struct RemoteProxy {
    session: Session,
}

impl RemoteProxy {
    pub fn new(session: Session) -> RemoteProxy {
        RemoteProxy { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Answers the backend's escalation prompt with `prompt(restart)`.
    pub fn on_escalation_request<F>(&self, mut prompt: F) -> std::result::Result<(), TransportError>
    where
        F: FnMut(bool) -> bool + Send + 'static,
    {
        self.session.expose_local(ESCALATION_PERMISSION, move |args| {
            let restart = args.first().and_then(Value::as_bool).unwrap_or(false);
            Ok(Value::Bool(prompt(restart)))
        })
    }

    fn call(&self, operation: &'static str, args: Vec<Value>) -> Result<Value> {
        tracing::debug!(operation, "remote call");
        self.session.call(operation, args).map_err(|e| {
            let kind = match e {
                CallError::Transport(e) => RemoteErrorKind::Transport(e),
                CallError::Failed(msg) => RemoteErrorKind::Failed(msg),
            };
            RemoteError::new(operation, kind)
        })
    }

    fn invoke<T: DeserializeOwned>(&self, operation: &'static str, args: Vec<Value>) -> Result<T> {
        let value = self.call(operation, args)?;
        serde_json::from_value(value)
            .map_err(|e| RemoteError::new(operation, RemoteErrorKind::Decode(e.to_string())))
    }

    fn action(&self, operation: &'static str, args: Vec<Value>) -> Result<()> {
        self.call(operation, args).map(|_| ())
    }
}

/// Reads the next piece of `reader`, or `None` at end of data.
fn next_chunk(reader: &mut dyn Read) -> io::Result<Option<String>> {
    let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    Ok(Some(base64::engine::general_purpose::STANDARD.encode(&buf[..filled])))
}

impl Backend for RemoteProxy {
    fn list_devices(&self) -> Result<Vec<Device>> {
        // A backend without devices may reply null.
        let devices: Option<Vec<Device>> = self.invoke("ListDevices", vec![])?;
        Ok(devices.unwrap_or_default())
    }

    fn trace_device(&self, device: &Device) -> Result<()> {
        self.action("TraceDevice", vec![json!(device)])
    }

    fn get_connections(&self) -> Result<Vec<ConnectionRecord>> {
        let records: Option<Vec<ConnectionRecord>> = self.invoke("GetConnections", vec![])?;
        Ok(records.unwrap_or_default())
    }

    fn get_packets(&self) -> Result<Vec<PacketObservation>> {
        let packets: Option<Vec<PacketObservation>> = self.invoke("GetPackets", vec![])?;
        Ok(packets.unwrap_or_default())
    }

    fn set_is_summarized(&self, summarized: bool) -> Result<()> {
        self.action("SetIsSummarized", vec![json!(summarized)])
    }

    fn get_max_packet_cache(&self) -> Result<i64> {
        self.invoke("GetMaxPacketCache", vec![])
    }

    fn set_max_packet_cache(&self, size: i64) -> Result<()> {
        self.action("SetMaxPacketCache", vec![json!(size)])
    }

    fn get_max_connections_cache(&self) -> Result<i64> {
        self.invoke("GetMaxConnectionsCache", vec![])
    }

    fn set_max_connections_cache(&self, size: i64) -> Result<()> {
        self.action("SetMaxConnectionsCache", vec![json!(size)])
    }

    fn get_db_download_url(&self) -> Result<String> {
        self.invoke("GetDBDownloadURL", vec![])
    }

    fn set_db_download_url(&self, url: &str) -> Result<()> {
        self.action("SetDBDownloadURL", vec![json!(url)])
    }

    fn get_db_path(&self) -> Result<String> {
        self.invoke("GetDBPath", vec![])
    }

    fn set_db_path(&self, path: &str) -> Result<()> {
        self.action("SetDBPath", vec![json!(path)])
    }

    fn check_database(&self) -> Result<bool> {
        self.invoke("CheckDatabase", vec![])
    }

    fn download_database(&self, license_key: &str) -> Result<()> {
        self.action("DownloadDatabase", vec![json!(license_key)])
    }

    /// The backend pulls the file through a temporary local operation,
    /// whose name is the only argument of the call.
    fn upload_database(&self, mut data: Box<dyn Read + Send>) -> Result<()> {
        const OPERATION: &str = "UploadDatabase";
        let callback = format!("{OPERATION}.{}", frame::new_call_id());
        self.session
            .expose_local(&callback, move |_args| match next_chunk(&mut *data) {
                Ok(Some(chunk)) => Ok(Value::String(chunk)),
                Ok(None) => Ok(Value::Null),
                Err(e) => Err(format!("cannot read database file: {e}")),
            })
            .map_err(|e| RemoteError::new(OPERATION, RemoteErrorKind::Transport(e)))?;
        let res = self.action(OPERATION, vec![json!(callback)]);
        if let Err(e) = self.session.withdraw_local(&callback) {
            tracing::debug!(error = %e, "could not withdraw upload callback");
        }
        res
    }

    fn delete_database(&self) -> Result<()> {
        self.action("DeleteDatabase", vec![])
    }

    fn restart_app(&self, fix_permissions: bool) -> Result<()> {
        self.action("RestartApp", vec![json!(fix_permissions)])
    }

    fn lookup_location(&self, ip: &str) -> Result<Location> {
        self.invoke("LookupLocation", vec![json!(ip)])
    }

    fn open_external_link(&self, url: &str) -> Result<()> {
        self.action("OpenExternalLink", vec![json!(url)])
    }
}
