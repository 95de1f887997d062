//! Reference NodeServer: one controller and a handful of virtual switches.

use polylink_core::{
    CommandId, Controller, ControllerHooks, ConfigSnapshot, Driver, Node, NodeCommand, PolyResult,
    SetDriver, Uom, CONTROLLER_ADDRESS,
};
use tracing::{debug, info, warn};

/// Custom parameter holding the number of virtual switches.
const SWITCHES_PARAM: &str = "switches";
const DEFAULT_SWITCHES: u64 = 1;

pub fn controller_node() -> Node {
    Node::new(
        CONTROLLER_ADDRESS,
        CONTROLLER_ADDRESS,
        "Polylink Controller",
        "controller",
    )
    .with_drivers(vec![Driver::new("ST", 0, Uom::BOOLEAN)])
}

fn switch_node(index: u64) -> Node {
    let address = format!("switch{}", index);
    Node::new(
        CONTROLLER_ADDRESS,
        address,
        format!("Virtual Switch {}", index),
        "vswitch",
    )
    .with_drivers(vec![
        Driver::new("ST", 0, Uom::BOOLEAN),
        Driver::new("GV0", 0, Uom::RAW),
    ])
    .with_command(CommandId::On, |node, _| {
        node.set_driver("ST", 1, SetDriver::default());
        Ok(())
    })
    .with_command(CommandId::Off, |node, _| {
        node.set_driver("ST", 0, SetDriver::default());
        Ok(())
    })
    .on_start(|node| {
        info!(address = %node.address(), "Virtual switch ready");
        node.report_drivers();
        Ok(())
    })
}

#[derive(Debug, Default)]
pub struct DemoHooks {
    heartbeat: bool,
    ticks: u64,
}

impl DemoHooks {
    fn discover(&self, controller: &mut Controller) -> PolyResult<()> {
        let count = controller
            .get_custom_params()
            .and_then(|params| params.get(SWITCHES_PARAM))
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
            .unwrap_or(DEFAULT_SWITCHES);
        info!(count, "Discovering virtual switches");
        for index in 1..=count {
            let address = format!("switch{}", index);
            if controller.registry().contains(&address) {
                continue;
            }
            controller.add_node(switch_node(index), false)?;
        }
        Ok(())
    }
}

impl ControllerHooks for DemoHooks {
    fn start(&mut self, controller: &mut Controller) -> PolyResult<()> {
        info!("Started Polylink reference NodeServer");
        controller
            .node_mut()
            .set_driver("ST", 1, SetDriver::forced());
        let missing = controller
            .get_custom_params()
            .is_some_and(|params| !params.contains_key(SWITCHES_PARAM));
        if missing {
            controller.add_custom_param(SWITCHES_PARAM, DEFAULT_SWITCHES.to_string());
        }
        self.discover(controller)
    }

    fn short_poll(&mut self, controller: &mut Controller) -> PolyResult<()> {
        self.ticks += 1;
        let addresses: Vec<String> = controller.registry().addresses().map(String::from).collect();
        for address in addresses {
            if let Some(node) = controller.find_mut(&address) {
                node.set_driver("GV0", self.ticks, SetDriver::default());
            }
        }
        Ok(())
    }

    fn long_poll(&mut self, controller: &mut Controller) -> PolyResult<()> {
        self.heartbeat = !self.heartbeat;
        let name = if self.heartbeat { "DON" } else { "DOF" };
        debug!(name, "Heartbeat");
        controller.node().report_cmd(name, None, None);
        Ok(())
    }

    fn delete(&mut self, _controller: &mut Controller) -> PolyResult<()> {
        warn!("NodeServer deleted, cleaning up");
        Ok(())
    }

    fn stop(&mut self, controller: &mut Controller) -> PolyResult<()> {
        info!("NodeServer stopping");
        controller
            .node_mut()
            .set_driver("ST", 0, SetDriver::default());
        Ok(())
    }

    fn config_changed(
        &mut self,
        _controller: &mut Controller,
        snapshot: &ConfigSnapshot,
    ) -> PolyResult<()> {
        debug!(
            nodes = snapshot.nodes.len(),
            params = snapshot.custom_params.len(),
            "Config received"
        );
        Ok(())
    }

    fn command(&mut self, controller: &mut Controller, command: &NodeCommand) -> PolyResult<bool> {
        match command.cmd {
            CommandId::Discover => self.discover(controller).map(|_| true),
            CommandId::Update => controller.install_profile().map(|_| true),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polylink_core::testing::RecordingTransport;
    use polylink_core::{Command, NodeServer};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_demo_discovers_on_start() {
        let transport = Arc::new(RecordingTransport::new("4"));
        let controller = Controller::new(transport.clone(), controller_node()).unwrap();
        let mut server = NodeServer::new(controller, DemoHooks::default());

        let snapshot: ConfigSnapshot = serde_json::from_value(json!({
            "nodes": [{"address": "controller"}],
            "customParams": {"switches": "2"}
        }))
        .unwrap();
        server.handle_config(snapshot).unwrap();

        assert_eq!(server.controller().registry().len(), 2);
        assert_eq!(transport.sent_of("addnode").len(), 2);

        server.dispatch(Command::ShortPoll).unwrap();
        let node = server.controller().registry().get("switch1").unwrap();
        assert_eq!(node.get_driver("GV0").unwrap().normalized(), "1");
    }
}
