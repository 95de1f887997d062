//! Wire protocol: topics, inbound envelope decoding and outbound messages.
//!
//! ## Topic Format
//!
//! Node input/output: `{namespace}/ns/{profile_num}`
//! Own connection status (retained): `{namespace}/connections/{profile_num}`
//! Peer connection status: `{namespace}/connections/polyglot`
//!
//! Every envelope is a JSON object carrying `"node": <sender>` plus exactly the
//! message-kind keys. Inbound envelopes whose sender is not the expected peer
//! are dropped, which is also how our own echoed publishes are filtered out.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, warn};

use crate::driver::{Driver, DriverValue, Uom};
use crate::error::{PolyError, PolyResult};
use crate::snapshot::ConfigSnapshot;

/// Address sentinel meaning "every node" in `query`/`status` messages.
pub const ALL_NODES: &str = "all";

/// The three topics one NodeServer talks on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Node-addressed input and output topic
    pub input: String,
    /// This NodeServer's connection status (retained)
    pub self_connection: String,
    /// The peer's connection status
    pub peer_connection: String,
}

impl Topics {
    pub fn new(namespace: &str, profile_num: &str, peer_id: &str) -> Self {
        let namespace = namespace.trim_end_matches('/');
        Self {
            input: format!("{}/ns/{}", namespace, profile_num),
            self_connection: format!("{}/connections/{}", namespace, profile_num),
            peer_connection: format!("{}/connections/{}", namespace, peer_id),
        }
    }

    /// Topics subscribed after every successful connect.
    pub fn subscriptions(&self) -> [&str; 2] {
        [&self.input, &self.peer_connection]
    }
}

/// Command identifier used to key per-node handler tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandId {
    On,
    Off,
    FastOn,
    FastOff,
    Bright,
    Dim,
    Query,
    Discover,
    Update,
    /// Any node-definition specific command
    Other(String),
}

impl CommandId {
    pub fn as_str(&self) -> &str {
        match self {
            Self::On => "DON",
            Self::Off => "DOF",
            Self::FastOn => "DFON",
            Self::FastOff => "DFOF",
            Self::Bright => "BRT",
            Self::Dim => "DIM",
            Self::Query => "QUERY",
            Self::Discover => "DISCOVER",
            Self::Update => "UPDATE",
            Self::Other(s) => s,
        }
    }
}

impl FromStr for CommandId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DON" => Self::On,
            "DOF" => Self::Off,
            "DFON" => Self::FastOn,
            "DFOF" => Self::FastOff,
            "BRT" => Self::Bright,
            "DIM" => Self::Dim,
            "QUERY" => Self::Query,
            "DISCOVER" => Self::Discover,
            "UPDATE" => Self::Update,
            other => Self::Other(other.to_string()),
        })
    }
}

impl From<&str> for CommandId {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(id) => id,
            Err(never) => match never {},
        }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(CommandId::from(s.as_str()))
    }
}

/// A `command` message addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCommand {
    pub address: String,
    pub cmd: CommandId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<DriverValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uom: Option<Uom>,
    /// Extra parameters for multi-parameter commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Map<String, Value>>,
}

impl NodeCommand {
    pub fn new(address: impl Into<String>, cmd: impl Into<CommandId>) -> Self {
        Self {
            address: address.into(),
            cmd: cmd.into(),
            value: None,
            uom: None,
            query: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<DriverValue>, uom: Option<Uom>) -> Self {
        self.value = Some(value.into());
        self.uom = uom;
        self
    }
}

/// Node selector of `query` and `status` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub address: String,
}

impl Target {
    pub fn is_all(&self) -> bool {
        self.address == ALL_NODES
    }
}

/// Outcome of an `addnode` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddNodeResult {
    pub success: bool,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A `result` message from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultMessage {
    AddNode(AddNodeResult),
    /// Results for other requests are informational only
    Other { kind: String, body: Value },
}

impl ResultMessage {
    fn decode(value: Value) -> PolyResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(PolyError::Protocol("result is not an object".into()));
        };
        if let Some(addnode) = map.remove("addnode") {
            return Ok(Self::AddNode(serde_json::from_value(addnode)?));
        }
        match map.into_iter().next() {
            Some((kind, body)) => Ok(Self::Other { kind, body }),
            None => Err(PolyError::Protocol("empty result".into())),
        }
    }
}

/// One decoded inbound message that goes through the dispatch queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Command(NodeCommand),
    Query(Target),
    Status(Target),
    Result(ResultMessage),
    ShortPoll,
    LongPoll,
    Delete,
}

impl Command {
    /// Wire key of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::Query(_) => "query",
            Self::Status(_) => "status",
            Self::Result(_) => "result",
            Self::ShortPoll => "shortPoll",
            Self::LongPoll => "longPoll",
            Self::Delete => "delete",
        }
    }

    /// Target address for node-directed kinds.
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Command(c) => Some(&c.address),
            Self::Query(t) | Self::Status(t) => Some(&t.address),
            Self::Result(ResultMessage::AddNode(r)) => Some(&r.address),
            _ => None,
        }
    }
}

/// Messages that change the engine state rather than address a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    Config(Box<ConfigSnapshot>),
    Connected(bool),
    Stop,
}

/// Everything one envelope can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Control(Control),
    Dispatch(Command),
}

impl Inbound {
    /// Decode the body stored under envelope key `key`.
    pub fn decode(key: &str, body: Value) -> PolyResult<Self> {
        let inbound = match key {
            "config" => Self::Control(Control::Config(Box::new(serde_json::from_value(body)?))),
            "connected" => match body {
                Value::Bool(connected) => Self::Control(Control::Connected(connected)),
                other => {
                    return Err(PolyError::Protocol(format!(
                        "connected is not a boolean: {}",
                        other
                    )));
                }
            },
            "stop" => Self::Control(Control::Stop),
            "command" => Self::Dispatch(Command::Command(serde_json::from_value(body)?)),
            "query" => Self::Dispatch(Command::Query(serde_json::from_value(body)?)),
            "status" => Self::Dispatch(Command::Status(serde_json::from_value(body)?)),
            "result" => Self::Dispatch(Command::Result(ResultMessage::decode(body)?)),
            "shortPoll" => Self::Dispatch(Command::ShortPoll),
            "longPoll" => Self::Dispatch(Command::LongPoll),
            "delete" => Self::Dispatch(Command::Delete),
            other => {
                return Err(PolyError::Protocol(format!(
                    "Invalid command received in message: {}",
                    other
                )));
            }
        };
        Ok(inbound)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Control(Control::Config(_)) => "config",
            Self::Control(Control::Connected(_)) => "connected",
            Self::Control(Control::Stop) => "stop",
            Self::Dispatch(command) => command.kind(),
        }
    }
}

impl From<Command> for Inbound {
    fn from(command: Command) -> Self {
        Self::Dispatch(command)
    }
}

/// Result of looking at one raw payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Not from the expected peer (includes our own echoes)
    Ignored,
    Accepted(Vec<Inbound>),
}

fn sender_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a raw payload into inbound items.
///
/// A decode failure of the whole payload is an error; an unknown or malformed
/// individual key is logged and skipped.
pub fn parse_envelope(payload: &[u8], peer_id: &str) -> PolyResult<Envelope> {
    let parsed: Value = serde_json::from_slice(payload)?;
    let Value::Object(mut map) = parsed else {
        return Err(PolyError::Protocol("envelope is not a JSON object".into()));
    };

    let sender = map.remove("node").as_ref().and_then(sender_id);
    if sender.as_deref() != Some(peer_id) {
        debug!(sender = ?sender, "Ignoring envelope not sent by peer");
        return Ok(Envelope::Ignored);
    }

    let mut items = Vec::with_capacity(map.len());
    for (key, body) in map {
        match Inbound::decode(&key, body) {
            Ok(item) => items.push(item),
            Err(PolyError::Protocol(msg)) => error!("{}", msg),
            Err(e) => warn!(key = %key, "Dropping malformed message: {}", e),
        }
    }
    Ok(Envelope::Accepted(items))
}

/// One node entry of an `addnode` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub address: String,
    pub name: String,
    pub node_def_id: String,
    /// Address of the primary node this node hangs under
    pub primary: String,
    pub drivers: Vec<Driver>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Selector of a `removenotice` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeRef {
    Key(String),
    Index(usize),
}

/// Messages this side publishes on the input topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outbound {
    AddNode {
        nodes: Vec<NodeDefinition>,
    },
    RemoveNode {
        address: String,
    },
    Status {
        address: String,
        driver: String,
        value: String,
        uom: Uom,
    },
    Command {
        address: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uom: Option<Uom>,
    },
    CustomData(Map<String, Value>),
    CustomParams(Map<String, Value>),
    AddNotice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        value: String,
    },
    RemoveNotice(NoticeRef),
    Restart {},
    InstallProfile {
        reboot: bool,
    },
    TypedParams(Vec<Value>),
    CustomParamsDoc(String),
}

impl Outbound {
    /// Build a `status` message from a driver.
    pub fn status(address: &str, driver: &Driver) -> Self {
        Self::Status {
            address: address.to_string(),
            driver: driver.id.clone(),
            value: driver.value.normalized(),
            uom: driver.uom,
        }
    }

    /// Wire key of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddNode { .. } => "addnode",
            Self::RemoveNode { .. } => "removenode",
            Self::Status { .. } => "status",
            Self::Command { .. } => "command",
            Self::CustomData(_) => "customdata",
            Self::CustomParams(_) => "customparams",
            Self::AddNotice { .. } => "addnotice",
            Self::RemoveNotice(_) => "removenotice",
            Self::Restart {} => "restart",
            Self::InstallProfile { .. } => "installprofile",
            Self::TypedParams(_) => "typedparams",
            Self::CustomParamsDoc(_) => "customparamsdoc",
        }
    }

    /// Serialize into an envelope stamped with our profile number.
    pub fn to_envelope(&self, profile_num: &str) -> PolyResult<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        let Some(map) = value.as_object_mut() else {
            return Err(PolyError::Protocol(format!(
                "{} did not serialize to an object",
                self.kind()
            )));
        };
        map.insert("node".to_string(), Value::String(profile_num.to_string()));
        Ok(serde_json::to_vec(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(value: Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn test_topics() {
        let topics = Topics::new("udi/polyglot/", "7", "polyglot");
        assert_eq!(topics.input, "udi/polyglot/ns/7");
        assert_eq!(topics.self_connection, "udi/polyglot/connections/7");
        assert_eq!(topics.peer_connection, "udi/polyglot/connections/polyglot");
        assert_eq!(topics.subscriptions(), ["udi/polyglot/ns/7", "udi/polyglot/connections/polyglot"]);
    }

    #[test]
    fn test_command_id_round_trip_names() {
        assert_eq!(CommandId::from("DON"), CommandId::On);
        assert_eq!(CommandId::from("SET_MODE"), CommandId::Other("SET_MODE".into()));
        assert_eq!(CommandId::Other("SET_MODE".into()).to_string(), "SET_MODE");
    }

    #[test]
    fn test_echo_is_ignored() {
        let payload = envelope(json!({"node": "7", "status": {"address": "all"}}));
        assert_eq!(parse_envelope(&payload, "polyglot").unwrap(), Envelope::Ignored);

        let payload = envelope(json!({"status": {"address": "all"}}));
        assert_eq!(parse_envelope(&payload, "polyglot").unwrap(), Envelope::Ignored);
    }

    #[test]
    fn test_command_envelope() {
        let payload = envelope(json!({
            "node": "polyglot",
            "command": {"address": "device1", "cmd": "DON", "value": 50, "uom": 51}
        }));
        let Envelope::Accepted(items) = parse_envelope(&payload, "polyglot").unwrap() else {
            panic!("expected accepted envelope");
        };
        assert_eq!(items.len(), 1);
        match &items[0] {
            Inbound::Dispatch(Command::Command(cmd)) => {
                assert_eq!(cmd.address, "device1");
                assert_eq!(cmd.cmd, CommandId::On);
                assert_eq!(cmd.uom, Some(Uom::PERCENT));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_fields_rejected_at_decode() {
        let payload = envelope(json!({"node": "polyglot", "command": {"cmd": "DON"}}));
        assert_eq!(
            parse_envelope(&payload, "polyglot").unwrap(),
            Envelope::Accepted(vec![])
        );
    }

    #[test]
    fn test_unknown_key_skipped() {
        let payload = envelope(json!({"node": "polyglot", "bogus": 1, "longPoll": {}}));
        assert_eq!(
            parse_envelope(&payload, "polyglot").unwrap(),
            Envelope::Accepted(vec![Inbound::Dispatch(Command::LongPoll)])
        );
    }

    #[test]
    fn test_malformed_payload() {
        assert!(parse_envelope(b"not json", "polyglot").is_err());
        assert!(parse_envelope(b"[1,2]", "polyglot").is_err());
    }

    #[test]
    fn test_result_decoding() {
        let payload = envelope(json!({
            "node": "polyglot",
            "result": {"addnode": {"success": true, "address": "controller"}}
        }));
        let Envelope::Accepted(items) = parse_envelope(&payload, "polyglot").unwrap() else {
            panic!("expected accepted envelope");
        };
        assert_eq!(
            items,
            vec![Inbound::Dispatch(Command::Result(ResultMessage::AddNode(AddNodeResult {
                success: true,
                address: "controller".into(),
                reason: None,
            })))]
        );
    }

    #[test]
    fn test_connected_and_stop_are_control() {
        let payload = envelope(json!({"node": "polyglot", "connected": true}));
        assert_eq!(
            parse_envelope(&payload, "polyglot").unwrap(),
            Envelope::Accepted(vec![Inbound::Control(Control::Connected(true))])
        );
        assert_eq!(
            Inbound::decode("stop", json!({})).unwrap(),
            Inbound::Control(Control::Stop)
        );
    }

    #[test]
    fn test_non_boolean_connected_is_rejected() {
        assert!(matches!(
            Inbound::decode("connected", json!("yes")),
            Err(PolyError::Protocol(_))
        ));
        assert!(matches!(
            Inbound::decode("connected", Value::Null),
            Err(PolyError::Protocol(_))
        ));

        // The bad key is dropped, the rest of the envelope survives
        let payload = envelope(json!({"node": "polyglot", "connected": 1, "longPoll": {}}));
        assert_eq!(
            parse_envelope(&payload, "polyglot").unwrap(),
            Envelope::Accepted(vec![Inbound::Dispatch(Command::LongPoll)])
        );
        assert_eq!(Inbound::from(Command::Delete).kind(), "delete");
        assert_eq!(Inbound::Control(Control::Stop).kind(), "stop");
    }

    #[test]
    fn test_outbound_envelopes() {
        let status = Outbound::status("device1", &Driver::new("ST", 1, Uom::BOOLEAN));
        let value: Value = serde_json::from_slice(&status.to_envelope("7").unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"node": "7", "status": {"address": "device1", "driver": "ST", "value": "1", "uom": 2}})
        );

        let restart: Value =
            serde_json::from_slice(&Outbound::Restart {}.to_envelope("7").unwrap()).unwrap();
        assert_eq!(restart, json!({"node": "7", "restart": {}}));

        let notice: Value = serde_json::from_slice(
            &Outbound::RemoveNotice(NoticeRef::Key("auth".into()))
                .to_envelope("7")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(notice, json!({"node": "7", "removenotice": {"key": "auth"}}));

        let doc: Value = serde_json::from_slice(
            &Outbound::CustomParamsDoc("# Help".into()).to_envelope("7").unwrap(),
        )
        .unwrap();
        assert_eq!(doc, json!({"node": "7", "customparamsdoc": "# Help"}));
    }
}
