//! Long-running services of the Roost server.

pub mod server;
pub mod streaming;
