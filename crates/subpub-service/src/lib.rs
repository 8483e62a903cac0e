//! Network service exposing a [`subpub`] bus over HTTP and WebSockets.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod error;
mod router;
mod server;

/// Tracing setup for the server binary.
pub mod logging;

pub use config::{Args, Config};
pub use error::Error;
pub use router::router;
pub use server::SubPubServer;
