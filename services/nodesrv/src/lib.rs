//! Node service library
//!
//! The node accepts one framed batch per connection, executes every
//! entry against the signal modules on its carrier board through a
//! lazily-populated driver registry, and replies with the collected
//! readings and fault reports on the same connection.

pub mod drivers;
pub mod error;
pub mod executor;
pub mod gpio;
pub mod registry;
pub mod server;
pub mod spi;
pub mod state;

pub use error::{NodeError, Result};
pub use registry::ModuleRegistry;
pub use server::DispatchServer;
pub use state::NodeState;
