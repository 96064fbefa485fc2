//! Transport to the capture backend: framing, stream port and the
//! reconnecting call session built on top of them.

pub mod frame;
pub mod session;
mod session_core;
pub mod stream;
pub mod util;

pub use session::{CallError, Event, Session, SessionOptions, TransportError};
pub use util::AddressError;
