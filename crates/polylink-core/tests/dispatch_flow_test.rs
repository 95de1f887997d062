//! Dispatch Flow Tests
//!
//! Drives a NodeServer with raw wire payloads the way the interface does:
//! - every decoded item goes through the dispatch queue and its consumer
//! - outbound traffic captured by the recording transport

use parking_lot::Mutex;
use polylink_core::protocol::{parse_envelope, Envelope};
use polylink_core::testing::RecordingTransport;
use polylink_core::{
    dispatch_queue, Controller, Driver, Inbound, NoHooks, Node, NodeServer, NodeState, Outbound,
    SetDriver, Uom, CONTROLLER_ADDRESS,
};
use std::sync::Arc;

const PEER: &str = "polyglot";

fn controller_node() -> Node {
    Node::new(CONTROLLER_ADDRESS, CONTROLLER_ADDRESS, "Controller", "controller")
        .with_drivers(vec![Driver::new("ST", 0, Uom::BOOLEAN)])
}

fn switch(address: &str) -> Node {
    Node::new(CONTROLLER_ADDRESS, address, address, "switch")
        .with_drivers(vec![Driver::new("ST", 0, Uom::BOOLEAN)])
        .with_command("DON", |node, _| {
            node.set_driver("ST", 1, SetDriver::default());
            Ok(())
        })
        .with_command("DOF", |node, _| {
            node.set_driver("ST", 0, SetDriver::default());
            Ok(())
        })
}

/// Decode payloads into the items the interface would enqueue.
fn decode(payloads: &[&str]) -> Vec<Inbound> {
    let mut items = Vec::new();
    for payload in payloads {
        if let Envelope::Accepted(decoded) = parse_envelope(payload.as_bytes(), PEER).unwrap() {
            items.extend(decoded);
        }
    }
    items
}

/// Handle decoded payloads directly on the calling thread.
fn feed(server: &Arc<Mutex<NodeServer>>, payloads: &[&str]) {
    for item in decode(payloads) {
        server.lock().handle(item).unwrap();
    }
}

#[test]
fn test_controller_self_registration_over_the_wire() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));

    let (tx, rx) = dispatch_queue();
    for item in decode(&[
        r#"{"node": "polyglot", "config": {"nodes": []}}"#,
        r#"{"node": "polyglot", "result": {"addnode": {"success": true, "address": "controller"}}}"#,
    ]) {
        tx.push(item).unwrap();
    }
    drop(tx);

    let consumer = Arc::clone(&server);
    let processed = rx.run(move |item| consumer.lock().handle(item));
    assert_eq!(processed, 2);
    assert_eq!(transport.sent_of("addnode").len(), 1);

    let server = server.lock();
    assert!(server.controller().is_started());
    assert!(server.controller().pending_adds().is_empty());
}

#[test]
fn test_commands_reach_nodes_in_order() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));
    feed(
        &server,
        &[r#"{"node": "polyglot", "config": {"nodes": [{"address": "controller"}, {"address": "sw1"}]}}"#],
    );
    server
        .lock()
        .controller_mut()
        .add_node(switch("sw1"), false)
        .unwrap();
    transport.take();

    let (tx, rx) = dispatch_queue();
    let consumer_server = Arc::clone(&server);
    let consumer = rx
        .spawn(move |item| consumer_server.lock().handle(item))
        .unwrap();

    let payloads = [
        r#"{"node": "polyglot", "command": {"address": "sw1", "cmd": "DON"}}"#,
        r#"{"node": "polyglot", "command": {"address": "sw1", "cmd": "DON"}}"#,
        r#"{"node": "polyglot", "command": {"address": "sw1", "cmd": "DOF"}}"#,
        r#"{"node": "polyglot", "command": {"address": "ghost", "cmd": "DON"}}"#,
        r#"{"node": "5", "command": {"address": "sw1", "cmd": "DON"}}"#,
    ];
    for item in decode(&payloads) {
        tx.push(item).unwrap();
    }
    drop(tx);
    assert_eq!(consumer.join().unwrap(), 4);

    let values: Vec<String> = transport
        .sent_of("status")
        .into_iter()
        .map(|m| match m {
            Outbound::Status { value, .. } => value,
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(values, vec!["1", "0"]);
}

#[test]
fn test_failed_add_result_discards_node() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));

    let state = server
        .lock()
        .controller_mut()
        .add_node(switch("sw2"), false)
        .unwrap()
        .state();
    assert_eq!(state, NodeState::PendingAdd);

    feed(
        &server,
        &[r#"{"node": "polyglot", "result": {"addnode": {"success": false, "address": "sw2", "reason": "limit"}}}"#],
    );
    let server = server.lock();
    assert!(server.controller().registry().get("sw2").is_none());
    assert!(server.controller().pending_adds().is_empty());
}

#[test]
fn test_external_thread_and_consumer_share_the_lock() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));
    server
        .lock()
        .controller_mut()
        .add_node(switch("sw3"), false)
        .unwrap();
    transport.take();

    let (tx, rx) = dispatch_queue();
    let consumer_server = Arc::clone(&server);
    let consumer = rx
        .spawn(move |item| consumer_server.lock().handle(item))
        .unwrap();

    let poller_server = Arc::clone(&server);
    let poller = std::thread::spawn(move || {
        for i in 0..100u32 {
            let mut server = poller_server.lock();
            if let Some(node) = server.controller_mut().find_mut("sw3") {
                node.set_driver("ST", i % 2, SetDriver::silent());
            }
        }
    });

    for item in decode(&[r#"{"node": "polyglot", "status": {"address": "all"}}"#; 20]) {
        tx.push(item).unwrap();
    }
    drop(tx);
    poller.join().unwrap();
    assert_eq!(consumer.join().unwrap(), 20);

    // controller + sw3 reported for every status request
    assert_eq!(transport.sent_of("status").len(), 40);
}

#[test]
fn test_config_with_malformed_node_still_starts_controller() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));

    feed(
        &server,
        &[r#"{"node": "polyglot", "config": {
            "nodes": [
                {"address": "controller", "drivers": [{"driver": "ST", "value": 1, "uom": 2}]},
                {"address": "broken", "drivers": [{"driver": "ST", "value": null, "uom": "2"}]}
            ],
            "customParams": {"host": "10.0.0.2"}
        }}"#],
    );

    let server = server.lock();
    assert!(server.controller().is_started());
    assert!(transport.sent_of("addnode").is_empty());
    assert_eq!(
        server.controller().get_custom_params().unwrap()["host"],
        "10.0.0.2"
    );
}

#[test]
fn test_config_arriving_behind_commands_is_handled_in_order() {
    let transport = Arc::new(RecordingTransport::new("5"));
    let controller = Controller::new(transport.clone(), controller_node()).unwrap();
    let server = Arc::new(Mutex::new(NodeServer::new(controller, NoHooks)));

    let (tx, rx) = dispatch_queue();
    let consumer_server = Arc::clone(&server);
    let consumer = rx
        .spawn(move |item| consumer_server.lock().handle(item))
        .unwrap();

    // Hold the lock while the items are enqueued, as integration code might
    let guard = server.lock();
    for item in decode(&[
        r#"{"node": "polyglot", "status": {"address": "controller"}}"#,
        r#"{"node": "polyglot", "config": {"nodes": [{"address": "controller"}]}}"#,
        r#"{"node": "polyglot", "stop": {}}"#,
    ]) {
        tx.push(item).unwrap();
    }
    drop(guard);
    drop(tx);
    assert_eq!(consumer.join().unwrap(), 3);

    let server = server.lock();
    assert!(server.controller().is_started());
    assert!(!server.controller().polls_running());
    assert_eq!(transport.stop_count(), 1);
    assert_eq!(transport.sent_of("status").len(), 1);
}
