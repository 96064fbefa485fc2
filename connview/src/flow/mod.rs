//! Flow state: the record model, the registry reconciling backend
//! snapshots, local location lookup, and the projections built on top.

pub mod export;
pub mod locate;
pub mod model;
pub mod registry;
pub mod view;

pub use model::{ConnectionRecord, Direction, Flow, FlowIdentity, Location, PacketObservation};
pub use registry::{ConnectionsDelta, FlowRegistry};
pub use view::{Column, FilterSyntaxError, ProjectedView, SortDirection, ViewOptions, ViewRow};
