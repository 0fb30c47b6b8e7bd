//! Runtime bootstrap: settings loading and telemetry.

pub mod error;
pub mod telemetry;

pub use error::InfraError;
pub use telemetry::bootstrap;
