//! Connection supervision layered over the transport's native reconnect.

pub mod monitor;

pub use monitor::{
    ConnectError, Connection, ConnectionHealthMonitor, ConnectionState, HealthConfig, HealthHandle,
};

#[cfg(test)]
mod tests;
