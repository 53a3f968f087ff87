//! The Roost parent server.
//!
//! Child agents connect over plain TCP with an HTTP request to the streaming
//! endpoint. The acceptance flow authenticates the child, resolves duplicate
//! connections against the host registry, takes the socket over from the HTTP
//! surface, negotiates capabilities, and hands the live connection to a
//! streaming worker.

pub mod capabilities;
pub mod connection;
pub mod constants;
pub mod http;
pub mod receiver;
pub mod registry;
pub mod service;
pub mod services;

mod clock;
mod statsd;

pub use self::service::ServiceState;
pub use self::services::server::{HttpServer, ServerError};
