//! Node: one managed device, its drivers and its command handlers.
//!
//! Command handlers are registered per node at construction time and keyed by
//! [`CommandId`]; nothing is shared between node instances unless the caller
//! clones a [`CommandTable`] on purpose.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::driver::{Driver, DriverTable, DriverValue, Uom};
use crate::error::PolyResult;
use crate::protocol::{CommandId, NodeCommand, NodeDefinition, Outbound};
use crate::snapshot::SnapshotNode;
use crate::transport::Transport;

/// Handler invoked for one command id.
pub type CommandHandler = Arc<dyn Fn(&mut Node, &NodeCommand) -> PolyResult<()> + Send + Sync>;

/// Handler invoked once when the node becomes active.
pub type StartHandler = Arc<dyn Fn(&mut Node) -> PolyResult<()> + Send + Sync>;

/// Per-node command handler registry.
#[derive(Clone, Default)]
pub struct CommandTable {
    handlers: HashMap<CommandId, CommandHandler>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with<F>(mut self, id: impl Into<CommandId>, handler: F) -> Self
    where
        F: Fn(&mut Node, &NodeCommand) -> PolyResult<()> + Send + Sync + 'static,
    {
        self.insert(id, handler);
        self
    }

    pub fn insert<F>(&mut self, id: impl Into<CommandId>, handler: F)
    where
        F: Fn(&mut Node, &NodeCommand) -> PolyResult<()> + Send + Sync + 'static,
    {
        self.handlers.insert(id.into(), Arc::new(handler));
    }

    pub fn get(&self, id: &CommandId) -> Option<CommandHandler> {
        self.handlers.get(id).cloned()
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.handlers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Lifecycle of a node with respect to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Exists in memory only
    Created,
    /// Announced, waiting for the `addnode` result
    PendingAdd,
    /// Confirmed by a result or already listed in the snapshot
    Active,
    /// Deleted or add denied
    Removed,
}

/// Options for [`Node::set_driver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetDriver {
    /// Attempt a publish right away
    pub report: bool,
    /// Publish even if nothing changed
    pub force: bool,
    /// Replace the unit as well
    pub uom: Option<Uom>,
}

impl Default for SetDriver {
    fn default() -> Self {
        Self {
            report: true,
            force: false,
            uom: None,
        }
    }
}

impl SetDriver {
    pub fn silent() -> Self {
        Self {
            report: false,
            ..Self::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    pub fn with_uom(mut self, uom: Uom) -> Self {
        self.uom = Some(uom);
        self
    }
}

/// One device's record.
pub struct Node {
    address: String,
    name: String,
    primary: String,
    node_def_id: String,
    hint: Option<String>,
    is_primary: Option<bool>,
    time_added: Option<i64>,
    enabled: Option<bool>,
    added: Option<bool>,
    drivers: DriverTable,
    commands: CommandTable,
    on_start: Option<StartHandler>,
    state: NodeState,
    started: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl Node {
    pub fn new(
        primary: impl Into<String>,
        address: impl Into<String>,
        name: impl Into<String>,
        node_def_id: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            primary: primary.into(),
            node_def_id: node_def_id.into(),
            hint: None,
            is_primary: None,
            time_added: None,
            enabled: None,
            added: None,
            drivers: DriverTable::default(),
            commands: CommandTable::default(),
            on_start: None,
            state: NodeState::Created,
            started: false,
            transport: None,
        }
    }

    pub fn with_drivers(mut self, drivers: Vec<Driver>) -> Self {
        self.drivers = DriverTable::new(drivers);
        self
    }

    pub fn with_commands(mut self, commands: CommandTable) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_command<F>(mut self, id: impl Into<CommandId>, handler: F) -> Self
    where
        F: Fn(&mut Node, &NodeCommand) -> PolyResult<()> + Send + Sync + 'static,
    {
        self.commands.insert(id, handler);
        self
    }

    pub fn on_start<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Node) -> PolyResult<()> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(handler));
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn node_def_id(&self) -> &str {
        &self.node_def_id
    }

    pub fn is_primary(&self) -> Option<bool> {
        self.is_primary
    }

    pub fn time_added(&self) -> Option<i64> {
        self.time_added
    }

    pub fn time_added_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        use chrono::TimeZone;
        self.time_added
            .and_then(|ms| chrono::Utc.timestamp_millis_opt(ms).single())
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn added(&self) -> Option<bool> {
        self.added
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn drivers(&self) -> &DriverTable {
        &self.drivers
    }

    pub fn get_driver(&self, id: &str) -> Option<&DriverValue> {
        self.drivers.get(id).map(|d| &d.value)
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    pub(crate) fn attach(&mut self, transport: Arc<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }

    /// Entry of an `addnode` request for this node.
    pub fn definition(&self) -> NodeDefinition {
        NodeDefinition {
            address: self.address.clone(),
            name: self.name.clone(),
            node_def_id: self.node_def_id.clone(),
            primary: self.primary.clone(),
            drivers: self.drivers.current().to_vec(),
            hint: self.hint.clone(),
        }
    }

    /// Copy the peer's record of this node into it.
    ///
    /// This is the only path that fills `is_primary`, `time_added`,
    /// `enabled` and `added`.
    pub fn apply_snapshot(&mut self, entry: &SnapshotNode) {
        let seeded = self.drivers.seed(&entry.drivers);
        debug!(address = %self.address, seeded, "Seeded drivers from config");
        self.is_primary = entry.is_primary;
        self.time_added = entry.time_added;
        self.enabled = entry.enabled;
        self.added = entry.added;
    }

    /// Set a driver value. Returns true if a status update was published.
    ///
    /// Unknown driver ids are a silent no-op.
    pub fn set_driver(&mut self, id: &str, value: impl Into<DriverValue>, opts: SetDriver) -> bool {
        if !self.drivers.set(id, value.into(), opts.uom) {
            return false;
        }
        opts.report && self.report_driver(id, opts.force)
    }

    /// Publish `id` if it differs from what was last published.
    pub fn report_driver(&mut self, id: &str, force: bool) -> bool {
        let Some(driver) = self.drivers.pending_report(id, force) else {
            return false;
        };
        info!(
            address = %self.address,
            driver = %driver.id,
            value = %driver.value,
            "Updating Driver"
        );
        if self.publish(&Outbound::status(&self.address, &driver)) {
            self.drivers.confirm(&driver);
            true
        } else {
            false
        }
    }

    /// Resync the shadow to all current values and publish every driver.
    pub fn report_drivers(&mut self) {
        info!(
            address = %self.address,
            "Updating All Drivers to ISY for {}",
            self.name
        );
        for driver in self.drivers.resync() {
            self.publish(&Outbound::status(&self.address, &driver));
        }
    }

    /// Answer a `query`. Uses a registered `QUERY` handler if there is one.
    pub fn query(&mut self) -> PolyResult<()> {
        let query = NodeCommand::new(self.address.clone(), CommandId::Query);
        match self.commands.get(&CommandId::Query) {
            Some(handler) => handler(self, &query),
            None => {
                self.report_drivers();
                Ok(())
            }
        }
    }

    /// Run the handler for `command`. Returns false if none is registered.
    pub fn run_cmd(&mut self, command: &NodeCommand) -> PolyResult<bool> {
        let Some(handler) = self.commands.get(&command.cmd) else {
            debug!(
                address = %self.address,
                cmd = %command.cmd,
                "No handler for command, ignoring"
            );
            return Ok(false);
        };
        handler(self, command)?;
        Ok(true)
    }

    /// Publish a momentary event, independent of driver state.
    pub fn report_cmd(&self, name: &str, value: Option<DriverValue>, uom: Option<Uom>) -> bool {
        self.publish(&Outbound::Command {
            address: self.address.clone(),
            command: name.to_string(),
            value: value.map(|v| v.normalized()),
            uom,
        })
    }

    /// Mark the node active and run its start handler the first time.
    pub fn start(&mut self) -> PolyResult<()> {
        self.state = NodeState::Active;
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(address = %self.address, "Starting node {}", self.name);
        match self.on_start.clone() {
            Some(handler) => handler(self),
            None => Ok(()),
        }
    }

    fn publish(&self, message: &Outbound) -> bool {
        let Some(transport) = &self.transport else {
            debug!(address = %self.address, "Node not attached, not publishing {}", message.kind());
            return false;
        };
        match transport.send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %self.address, "{}", e);
                false
            }
        }
    }

    /// Debug representation.
    pub fn to_json(&self) -> Value {
        json!({
            "address": self.address,
            "name": self.name,
            "primary": self.primary,
            "node_def_id": self.node_def_id,
            "isPrimary": self.is_primary,
            "timeAdded": self.time_added,
            "enabled": self.enabled,
            "added": self.added,
            "state": format!("{:?}", self.state),
            "drivers": self.drivers.current(),
        })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("node_def_id", &self.node_def_id)
            .field("state", &self.state)
            .field("drivers", &self.drivers.current())
            .field("commands", &self.commands)
            .finish()
    }
}
