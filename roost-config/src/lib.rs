//! Configuration for the Roost parent node.
//!
//! Two documents make up the configuration surface:
//!
//! - `roost.yml` holds process-wide settings: the listen address, socket
//!   timeouts, logging, metrics, and defaults for receiver sessions. See
//!   [`Config`].
//! - `stream.yml` holds the streaming credentials: one section per API key or
//!   machine identity, with enable flags, client ACLs, and per-child receiver
//!   overrides. See [`StreamCredentials`].

mod acl;
mod config;
mod stream;

pub use acl::*;
pub use config::*;
pub use stream::*;
