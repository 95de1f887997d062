//! Controller, node registry and command routing.
//!
//! [`Controller`] holds its own node record, the [`Registry`] of every other
//! node, and the last config snapshot. [`NodeServer`] pairs a controller with
//! the integration's [`ControllerHooks`] and is the single entry point for
//! inbound traffic: [`NodeServer::handle`] routes each queued item to
//! [`NodeServer::handle_control`] or [`NodeServer::dispatch`].

use serde_json::{Map, Value};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::PollSettings;
use crate::error::{PolyError, PolyResult};
use crate::node::{Node, NodeState};
use crate::protocol::{
    AddNodeResult, Command, Control, Inbound, NodeCommand, NoticeRef, Outbound, ResultMessage,
    Target,
};
use crate::queue::DispatchSender;
use crate::snapshot::{ConfigSnapshot, SnapshotNode, SnapshotStore};
use crate::transport::Transport;

/// Address of the controller node.
pub const CONTROLLER_ADDRESS: &str = "controller";

/// Every node except the controller, plus the set of unconfirmed adds.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: BTreeMap<String, Node>,
    pending_adds: BTreeSet<String>,
}

impl Registry {
    pub fn get(&self, address: &str) -> Option<&Node> {
        self.nodes.get(address)
    }

    pub fn get_mut(&mut self, address: &str) -> Option<&mut Node> {
        self.nodes.get_mut(address)
    }

    pub fn contains(&self, address: &str) -> bool {
        self.nodes.contains_key(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pending_adds(&self) -> &BTreeSet<String> {
        &self.pending_adds
    }

    pub fn is_pending(&self, address: &str) -> bool {
        self.pending_adds.contains(address)
    }

    fn insert(&mut self, node: Node) -> &mut Node {
        match self.nodes.entry(node.address().to_string()) {
            Entry::Occupied(mut entry) => {
                warn!(address = %entry.key(), "Replacing existing node");
                entry.insert(node);
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(node),
        }
    }

    fn remove(&mut self, address: &str) -> Option<Node> {
        self.pending_adds.remove(address);
        self.nodes.remove(address).map(|mut node| {
            node.set_state(NodeState::Removed);
            node
        })
    }
}

/// The controller: its own node record, the registry and the snapshot.
pub struct Controller {
    node: Node,
    registry: Registry,
    snapshot: SnapshotStore,
    transport: Arc<dyn Transport>,
    started: bool,
    polls: PollSettings,
    queue: Option<(DispatchSender, Handle)>,
    poll_tasks: Vec<JoinHandle<()>>,
}

impl Controller {
    /// Create the controller. `node` must use [`CONTROLLER_ADDRESS`].
    ///
    /// Fails if `transport` already serves another controller.
    pub fn new(transport: Arc<dyn Transport>, mut node: Node) -> PolyResult<Self> {
        if node.address() != CONTROLLER_ADDRESS {
            return Err(PolyError::Configuration(format!(
                "controller node must use address '{}', got '{}'",
                CONTROLLER_ADDRESS,
                node.address()
            )));
        }
        transport.claim_controller()?;
        node.attach(transport.clone());
        info!(profile_num = %transport.profile_num(), "Controller created");

        Ok(Self {
            node,
            registry: Registry::default(),
            snapshot: SnapshotStore::new(),
            transport,
            started: false,
            polls: PollSettings::default(),
            queue: None,
            poll_tasks: Vec::new(),
        })
    }

    pub fn with_polls(mut self, polls: PollSettings) -> Self {
        self.polls = polls;
        self
    }

    /// Give the controller a way to enqueue its own poll commands.
    pub fn attach_queue(&mut self, sender: DispatchSender, runtime: Handle) {
        self.queue = Some((sender, runtime));
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn node_mut(&mut self) -> &mut Node {
        &mut self.node
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn pending_adds(&self) -> &BTreeSet<String> {
        self.registry.pending_adds()
    }

    /// Look up a node by address, the controller included.
    pub fn find(&self, address: &str) -> Option<&Node> {
        if address == CONTROLLER_ADDRESS {
            Some(&self.node)
        } else {
            self.registry.get(address)
        }
    }

    pub fn find_mut(&mut self, address: &str) -> Option<&mut Node> {
        if address == CONTROLLER_ADDRESS {
            Some(&mut self.node)
        } else {
            self.registry.get_mut(address)
        }
    }

    /// Register a node.
    ///
    /// A node the snapshot already lists takes the recorded driver values and
    /// becomes active without being announced, unless `force_overwrite` is
    /// set. Any other node is announced with `addnode` and waits for the
    /// result.
    pub fn add_node(&mut self, mut node: Node, force_overwrite: bool) -> PolyResult<&mut Node> {
        if node.address() == CONTROLLER_ADDRESS {
            return Err(PolyError::Lifecycle(
                "the controller registers itself".into(),
            ));
        }
        node.attach(self.transport.clone());

        let recorded = if force_overwrite {
            None
        } else {
            self.snapshot.node(node.address())
        };

        match recorded {
            Some(entry) => {
                info!(address = %node.address(), "Node already known, not re-adding");
                node.apply_snapshot(entry);
                node.set_state(NodeState::Active);
                if self.started {
                    if let Err(e) = node.start() {
                        error!(address = %node.address(), "Node start failed: {}", e);
                    }
                }
            }
            None => {
                info!(address = %node.address(), "Adding node {}", node.name());
                node.set_state(NodeState::PendingAdd);
                self.registry.pending_adds.insert(node.address().to_string());
                self.announce(&node);
            }
        }
        Ok(self.registry.insert(node))
    }

    /// Drop a node locally and ask the peer to remove it.
    ///
    /// Returns whether the node was known locally.
    pub fn del_node(&mut self, address: &str) -> PolyResult<bool> {
        if address == CONTROLLER_ADDRESS {
            return Err(PolyError::Lifecycle("cannot delete the controller".into()));
        }
        let known = self.registry.remove(address).is_some();
        info!(address, known, "Removing node");
        self.send(&Outbound::RemoveNode {
            address: address.to_string(),
        })?;
        Ok(known)
    }

    /// Store `snapshot` and copy each listed node's record into the matching
    /// local node. Returns whether the controller itself is listed.
    pub fn reconcile(&mut self, snapshot: ConfigSnapshot) -> bool {
        let snapshot = self.snapshot.replace(snapshot);
        debug!(nodes = snapshot.nodes.len(), "Reconciling config");
        let mut listed = false;
        for entry in &snapshot.nodes {
            if entry.address == CONTROLLER_ADDRESS {
                self.node.apply_snapshot(entry);
                listed = true;
            } else if let Some(node) = self.registry.nodes.get_mut(&entry.address) {
                node.apply_snapshot(entry);
            }
        }
        listed
    }

    fn announce_self(&mut self) {
        if self.registry.is_pending(CONTROLLER_ADDRESS) {
            debug!("Controller add already pending");
            return;
        }
        info!("Waiting on Controller node to be added");
        self.node.set_state(NodeState::PendingAdd);
        self.registry
            .pending_adds
            .insert(CONTROLLER_ADDRESS.to_string());
        let message = Outbound::AddNode {
            nodes: vec![self.node.definition()],
        };
        self.publish_logged(&message);
    }

    fn announce(&self, node: &Node) {
        let message = Outbound::AddNode {
            nodes: vec![node.definition()],
        };
        self.publish_logged(&message);
    }

    fn publish_logged(&self, message: &Outbound) {
        if let Err(e) = self.transport.send(message) {
            warn!("{}", e);
        }
    }

    fn send(&self, message: &Outbound) -> PolyResult<()> {
        self.transport.send(message)
    }

    /// The peer's record of `address`. `None` before any snapshot.
    pub fn get_node(&self, address: &str) -> Option<&SnapshotNode> {
        self.snapshot.node(address)
    }

    pub fn snapshot(&self) -> Option<&ConfigSnapshot> {
        self.snapshot.get()
    }

    pub fn isy_version(&self) -> Option<&str> {
        self.snapshot.isy_version()
    }

    /// Custom parameters from the last snapshot.
    pub fn get_custom_params(&self) -> Option<&Map<String, Value>> {
        self.snapshot.custom_params().ok()
    }

    /// Replace the custom parameters on the peer.
    pub fn save_custom_params(&mut self, params: Map<String, Value>) -> PolyResult<()> {
        if let Ok(local) = self.snapshot.custom_params_mut() {
            *local = params.clone();
        }
        self.send(&Outbound::CustomParams(params))
    }

    /// Add or replace one custom parameter. False before any snapshot.
    pub fn add_custom_param(&mut self, key: &str, value: impl Into<Value>) -> bool {
        let params = match self.snapshot.custom_params_mut() {
            Ok(params) => {
                params.insert(key.to_string(), value.into());
                params.clone()
            }
            Err(e) => {
                error!("add_custom_param: {}", e);
                return false;
            }
        };
        self.send(&Outbound::CustomParams(params)).is_ok()
    }

    /// Remove one custom parameter. False before any snapshot.
    pub fn remove_custom_param(&mut self, key: &str) -> bool {
        let params = match self.snapshot.custom_params_mut() {
            Ok(params) => {
                params.remove(key);
                params.clone()
            }
            Err(e) => {
                error!("remove_custom_param: {}", e);
                return false;
            }
        };
        self.send(&Outbound::CustomParams(params)).is_ok()
    }

    pub fn save_custom_data(&mut self, data: Map<String, Value>) -> PolyResult<()> {
        if let Ok(local) = self.snapshot.custom_data_mut() {
            *local = data.clone();
        }
        self.send(&Outbound::CustomData(data))
    }

    pub fn add_notice(&self, key: Option<&str>, text: impl Into<String>) -> PolyResult<()> {
        self.send(&Outbound::AddNotice {
            key: key.map(str::to_string),
            value: text.into(),
        })
    }

    pub fn remove_notice(&self, key: &str) -> PolyResult<()> {
        self.send(&Outbound::RemoveNotice(NoticeRef::Key(key.to_string())))
    }

    /// Remove a notice by position, for peers that keep notices as a list.
    pub fn remove_notice_index(&self, index: usize) -> PolyResult<()> {
        self.send(&Outbound::RemoveNotice(NoticeRef::Index(index)))
    }

    /// Ask the peer to restart this NodeServer.
    pub fn restart(&self) -> PolyResult<()> {
        self.send(&Outbound::Restart {})
    }

    pub fn install_profile(&self) -> PolyResult<()> {
        self.send(&Outbound::InstallProfile { reboot: false })
    }

    pub fn save_typed_params(&self, params: Vec<Value>) -> PolyResult<()> {
        self.send(&Outbound::TypedParams(params))
    }

    /// Publish the custom parameter documentation. Markdown passes through untouched.
    pub fn set_custom_params_doc(&self, doc: impl Into<String>) -> PolyResult<()> {
        self.send(&Outbound::CustomParamsDoc(doc.into()))
    }

    /// Spawn the short/long poll timers. Replaces timers already running.
    ///
    /// Without an attached queue there is nothing to feed, so this is a no-op.
    pub fn start_polls(&mut self, settings: PollSettings) {
        self.stop_polls();
        let Some((sender, runtime)) = &self.queue else {
            warn!("No dispatch queue attached, poll timers not started");
            return;
        };
        self.polls = settings;
        info!(
            short_secs = self.polls.short_secs,
            long_secs = self.polls.long_secs,
            "Starting poll timers"
        );
        let timers = [
            (self.polls.short(), Command::ShortPoll),
            (self.polls.long(), Command::LongPoll),
        ];
        for (period, command) in timers {
            let sender = sender.clone();
            self.poll_tasks.push(runtime.spawn(async move {
                let start = tokio::time::Instant::now() + period;
                let mut ticker = tokio::time::interval_at(start, period);
                loop {
                    ticker.tick().await;
                    if sender.push(command.clone()).is_err() {
                        break;
                    }
                }
            }));
        }
    }

    pub fn stop_polls(&mut self) {
        for task in self.poll_tasks.drain(..) {
            task.abort();
        }
    }

    pub fn polls_running(&self) -> bool {
        self.poll_tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.stop_polls();
        self.transport.release_controller();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("node", &self.node)
            .field("registry", &self.registry)
            .field("started", &self.started)
            .field("has_config", &self.snapshot.has_config())
            .finish()
    }
}

/// Integration-specific behaviour of a NodeServer. Every hook defaults to a no-op.
pub trait ControllerHooks: Send {
    /// Runs once, when the controller becomes active.
    fn start(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        Ok(())
    }

    fn short_poll(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        Ok(())
    }

    fn long_poll(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        Ok(())
    }

    /// The peer is deleting this NodeServer; the transport is already stopped.
    fn delete(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        Ok(())
    }

    /// The peer asked this NodeServer to stop.
    fn stop(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        Ok(())
    }

    /// Runs after every reconciliation.
    fn config_changed(
        &mut self,
        _controller: &mut Controller,
        _snapshot: &ConfigSnapshot,
    ) -> PolyResult<()> {
        Ok(())
    }

    /// Controller-addressed commands with no entry in the controller
    /// node's own table. Returns whether the command was handled.
    fn command(&mut self, _controller: &mut Controller, _command: &NodeCommand) -> PolyResult<bool> {
        Ok(false)
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ControllerHooks for NoHooks {}

/// A controller plus its hooks: the complete message-handling engine.
pub struct NodeServer {
    controller: Controller,
    hooks: Box<dyn ControllerHooks>,
}

impl NodeServer {
    pub fn new<H>(controller: Controller, hooks: H) -> Self
    where
        H: ControllerHooks + 'static,
    {
        Self {
            controller,
            hooks: Box::new(hooks),
        }
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    /// Handle one item popped from the dispatch queue.
    pub fn handle(&mut self, item: Inbound) -> PolyResult<()> {
        match item {
            Inbound::Control(control) => self.handle_control(control),
            Inbound::Dispatch(command) => self.dispatch(command),
        }
    }

    pub fn handle_control(&mut self, control: Control) -> PolyResult<()> {
        match control {
            Control::Config(snapshot) => self.handle_config(*snapshot),
            Control::Connected(connected) => {
                info!(connected, "Peer connection status changed");
                Ok(())
            }
            Control::Stop => {
                info!("Received stop from Polyglot");
                self.controller.stop_polls();
                let result = self.hooks.stop(&mut self.controller);
                self.controller.transport.stop();
                result
            }
        }
    }

    /// Reconcile a new snapshot, then register or start the controller.
    pub fn handle_config(&mut self, snapshot: ConfigSnapshot) -> PolyResult<()> {
        let listed = self.controller.reconcile(snapshot);

        if let Some(snapshot) = self.controller.snapshot.get().cloned() {
            if let Err(e) = self.hooks.config_changed(&mut self.controller, &snapshot) {
                error!("config_changed hook failed: {}", e);
            }
        }

        if !listed {
            self.controller.announce_self();
            Ok(())
        } else {
            self.controller.registry.pending_adds.remove(CONTROLLER_ADDRESS);
            self.start_controller()
        }
    }

    /// Route one queued command.
    pub fn dispatch(&mut self, command: Command) -> PolyResult<()> {
        match command {
            Command::Command(cmd) => self.run_command(cmd),
            Command::Query(target) => self.report(&target, true),
            Command::Status(target) => self.report(&target, false),
            Command::Result(ResultMessage::AddNode(result)) => self.handle_add_result(result),
            Command::Result(ResultMessage::Other { kind, body }) => {
                debug!(kind = %kind, "Result: {}", body);
                Ok(())
            }
            Command::ShortPoll => self.hooks.short_poll(&mut self.controller),
            Command::LongPoll => self.hooks.long_poll(&mut self.controller),
            Command::Delete => {
                info!("Received delete from Polyglot, stopping");
                self.controller.stop_polls();
                self.controller.transport.stop();
                self.hooks.delete(&mut self.controller)
            }
        }
    }

    fn run_command(&mut self, cmd: NodeCommand) -> PolyResult<()> {
        if cmd.address == CONTROLLER_ADDRESS {
            if self.controller.node.run_cmd(&cmd)? {
                return Ok(());
            }
            if !self.hooks.command(&mut self.controller, &cmd)? {
                debug!(cmd = %cmd.cmd, "Controller has no handler for command, ignoring");
            }
            return Ok(());
        }
        match self.controller.registry.get_mut(&cmd.address) {
            Some(node) => node.run_cmd(&cmd).map(|_| ()),
            None => {
                warn!(address = %cmd.address, cmd = %cmd.cmd, "Command for unknown node, dropped");
                Ok(())
            }
        }
    }

    fn report(&mut self, target: &Target, query: bool) -> PolyResult<()> {
        let report = |node: &mut Node| -> PolyResult<()> {
            if query {
                node.query()
            } else {
                node.report_drivers();
                Ok(())
            }
        };

        if target.is_all() {
            report(&mut self.controller.node)?;
            for node in self.controller.registry.nodes.values_mut() {
                if let Err(e) = report(&mut *node) {
                    error!(address = %node.address(), "{}", e);
                }
            }
            return Ok(());
        }
        match self.controller.find_mut(&target.address) {
            Some(node) => report(node),
            None => {
                warn!(address = %target.address, "Report for unknown node, dropped");
                Ok(())
            }
        }
    }

    fn handle_add_result(&mut self, result: AddNodeResult) -> PolyResult<()> {
        let address = result.address.as_str();
        let was_pending = self.controller.registry.pending_adds.remove(address);
        debug!(address, was_pending, success = result.success, "addnode result");

        if !result.success {
            let reason = result.reason.as_deref().unwrap_or("no reason given");
            error!(address, "Add node failed: {}", reason);
            if address != CONTROLLER_ADDRESS {
                self.controller.registry.remove(address);
            }
            return Ok(());
        }

        if address == CONTROLLER_ADDRESS {
            return self.start_controller();
        }
        match self.controller.registry.get_mut(address) {
            Some(node) => node.start(),
            None => {
                warn!(address, "addnode result for unknown node");
                Ok(())
            }
        }
    }

    /// Start the controller and every node waiting on it. Runs once.
    fn start_controller(&mut self) -> PolyResult<()> {
        if self.controller.started {
            return Ok(());
        }
        self.controller.started = true;
        info!("Starting Controller");

        self.controller.node.start()?;
        let hook_result = self.hooks.start(&mut self.controller);

        if self.controller.queue.is_some() && self.controller.poll_tasks.is_empty() {
            let polls = self.controller.polls.clone();
            self.controller.start_polls(polls);
        }

        for node in self.controller.registry.nodes.values_mut() {
            if node.state() == NodeState::Active && !node.is_started() {
                if let Err(e) = node.start() {
                    error!(address = %node.address(), "Node start failed: {}", e);
                }
            }
        }
        hook_result
    }
}

impl std::fmt::Debug for NodeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeServer")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}
