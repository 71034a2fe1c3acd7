//! GeoTrack gateway library
//!
//! Exposes modules for integration testing and binary reuse.

pub mod domain;
pub mod gateway;
pub mod infra;
pub mod io;
pub mod services;

pub use gateway::Gateway;
