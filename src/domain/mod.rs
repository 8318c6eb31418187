//! Domain models - event model, cell topology and parts
//!
//! - `types` - raw and fused events, unit identifiers
//! - `topology` - stations, corners, motors and the channel role table
//! - `part` - parts circulating in the loop and their history

pub mod part;
pub mod topology;
pub mod types;

pub use part::{Part, PartActivity, PartRegistry};
pub use topology::{ChannelRole, Endpoint, Topology};
pub use types::{
    ChannelId, CornerId, FusedEvent, FusedKind, MotorId, PartId, RawEvent, RawPayload, RawSource,
    StationId, UnitId,
};
