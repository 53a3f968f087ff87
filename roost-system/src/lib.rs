//! Foundational system components for the Roost services.
//!
//! Services are asynchronous units that communicate through typed message
//! [interfaces](Interface). Each running service owns a [`Receiver`] and is
//! reachable through a cloneable [`Addr`]. The [`Controller`] coordinates
//! graceful shutdown across all services.

mod controller;
mod service;
mod statsd;

pub use controller::*;
pub use service::*;
