//! Polyglot v2 NodeServer interface
//!
//! This crate connects a device integration ("NodeServer") to the Polyglot
//! controller over MQTT and keeps an in-memory mirror of every node's state.
//!
//! ## Architecture
//!
//! - **Interface**: the process-wide MQTT transport (connect, subscribe, publish)
//! - **Dispatch queue**: single-consumer FIFO serializing remote commands
//! - **SnapshotStore**: last full config received from the peer
//! - **Node**: driver state, the publish shadow and per-node command handlers
//! - **Controller**: the `controller` node, the node registry and pending adds
//! - **NodeServer**: controller + integration hooks, routes every inbound message
//!
//! Inbound traffic flows Interface -> queue -> NodeServer -> Node; status
//! updates flow back out through the [`Transport`] trait.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod runtime;
pub mod snapshot;
pub mod transport;

// In-memory transport for tests and offline runs
pub mod testing;

pub use config::{Bootstrap, InterfaceConfig, PollSettings, ReconnectPolicy};
pub use controller::{
    Controller, ControllerHooks, NoHooks, NodeServer, Registry, CONTROLLER_ADDRESS,
};
pub use driver::{Driver, DriverTable, DriverValue, Uom};
pub use error::{PolyError, PolyResult};
pub use node::{CommandHandler, CommandTable, Node, NodeState, SetDriver};
pub use protocol::{Command, CommandId, Control, Inbound, NodeCommand, Outbound};
pub use queue::{dispatch_queue, DispatchReceiver, DispatchSender};
pub use runtime::{serve, Running, SharedNodeServer};
pub use snapshot::{ConfigSnapshot, SnapshotNode, SnapshotStore};
pub use transport::{Interface, Transport};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
