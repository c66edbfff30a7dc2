//! Infrastructure: configuration, persistence, HTTP surfaces, telemetry.

pub mod config;
pub mod database;
pub mod http;
pub mod telemetry;
