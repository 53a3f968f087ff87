//! Logging and tracing facade for all Roost crates.
//!
//! Crates do not depend on `tracing` directly. Instead, they use the macros
//! re-exported from this crate, so that the subscriber setup and the default
//! filter directives stay in one place.

mod setup;

pub use setup::*;

// Re-export the tracing crate and its macros for use in all other crates.
pub use tracing;
pub use tracing::{debug, error, info, instrument, trace, warn, Level};

/// Logs an error with its source chain to the given level.
///
/// `std::error::Error` implementations only display their own message. This
/// walks the `source()` chain and appends every cause, which is what we want
/// in virtually every log line that carries an error.
pub fn format_error_chain(mut error: &dyn std::error::Error) -> String {
    let mut formatted = error.to_string();
    while let Some(source) = error.source() {
        formatted.push_str(": ");
        formatted.push_str(&source.to_string());
        error = source;
    }
    formatted
}
