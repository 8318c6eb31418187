//! Services - event fusion and coordination
//!
//! - `fusion` - pairs raw events into fused events within time windows
//! - `cep` - the single consumer loop and the shutdown sequence
//! - `cell` - controller registry and event routing
//! - `station` - station state machine
//! - `corner` - corner transfer state machine
//! - `collision` - corner exclusivity and conveyor safety
//! - `kpi` - throughput, cycle time and utilisation
//! - `telemetry_worker` - event log, KPI and MQTT sink
//! - `health` - periodic supervisory report

pub mod cell;
pub mod cep;
pub mod collision;
pub mod corner;
pub mod fusion;
pub mod health;
pub mod kpi;
pub mod station;
pub mod telemetry_worker;

// Re-export commonly used types
pub use cell::{Cell, Rejection};
pub use cep::{CepConsumer, CepSettings, CepStats};
pub use collision::{CollisionManager, CollisionSnapshot, Refusal};
pub use corner::{CornerController, CornerState};
pub use fusion::{FusionEngine, FusionStats};
pub use health::HealthMonitor;
pub use kpi::{KpiSnapshot, KpiTracker};
pub use station::{StationController, StationState};
pub use telemetry_worker::TelemetryWorker;
