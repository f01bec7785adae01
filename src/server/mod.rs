/// TCP server implementation for the Arkivist daemon.
///
/// This module provides the [`Router`] which handles incoming TCP connections
/// and dispatches line commands to a single shared store.
pub mod router;

pub use router::Router;
