//! Cell coordinator library
//!
//! Event fusion and coordination for a two-station, four-corner conveyor
//! cell. Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
