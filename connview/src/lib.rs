pub mod flow;
pub mod remote;
pub mod settings;
pub mod trace;
pub mod wire;

pub use remote::{Backend, RemoteProxy};
pub use trace::{TraceEvent, TraceHandle, Tracer};
pub use wire::Session;
