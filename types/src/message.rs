//! The envelope posted between the host page and the widget iframe.
//!
//! On the wire a message is a flat JSON object (`id`, `type`, `timeout`, `payload`, `error`,
//! `success`, `detail`). In memory the `type` and `payload` are decoded into a [Kind] and
//! a payload typed per kind.

use crate::Error;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Correlation token. Unique per outbound message and echoed unchanged in the reply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Actions a host page can ask the widget to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Init,
    PageView,
    ClickThrough,
}

impl Action {
    pub const ALL: [Action; 3] = [Action::Init, Action::PageView, Action::ClickThrough];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Init => "init",
            Action::PageView => "page-view",
            Action::ClickThrough => "click-through",
        }
    }

    /// The reward transaction class for this action. `init` is not a transaction.
    pub fn transaction_class(&self) -> Option<&'static str> {
        match self {
            Action::Init => None,
            Action::PageView | Action::ClickThrough => Some(self.as_str()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| Error::UnknownAction(s.to_string()))
    }
}

/// Local storage commands, honored only in local-testing mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageCommand {
    Clear,
    Get,
}

impl StorageCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageCommand::Clear => "debug-localStorage::clear",
            StorageCommand::Get => "debug-localStorage::get",
        }
    }
}

/// What a message is about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Sent by the iframe once it can accept actions.
    Ready,
    Action(Action),
    Storage(StorageCommand),
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Ready => "ready",
            Kind::Action(action) => action.as_str(),
            Kind::Storage(command) => command.as_str(),
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(Kind::Ready),
            "debug-localStorage::clear" => Ok(Kind::Storage(StorageCommand::Clear)),
            "debug-localStorage::get" => Ok(Kind::Storage(StorageCommand::Get)),
            other => other
                .parse()
                .map(Kind::Action)
                .map_err(|_| Error::UnknownMessageType(other.to_string())),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied options for an action.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOptions {
    /// Explicit distinguisher; derived from the referrer when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distinguisher: Option<String>,
    /// Milliseconds the caller is willing to wait.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_timeout"
    )]
    pub timeout: Option<u64>,
}

impl ActionOptions {
    pub fn distinguisher(distinguisher: impl Into<String>) -> Self {
        Self {
            distinguisher: Some(distinguisher.into()),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }
}

/// The definitive result handed to the caller of an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    /// Terminal failure (validation, credentials, fatal configuration).
    pub error: Option<String>,
    pub success: bool,
    /// Supplementary information: HTTP status, `"timeout"`, `"not yet allowed"`, ...
    pub detail: String,
}

impl Outcome {
    pub fn timeout() -> Self {
        Self {
            error: None,
            success: false,
            detail: "timeout".to_string(),
        }
    }
}

/// A cross-frame message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Envelope", into = "Envelope")]
pub struct Message {
    pub id: MessageId,
    pub kind: Kind,
    /// Milliseconds allowed for the receiver's processing.
    pub timeout: Option<u64>,
    pub options: ActionOptions,
    /// Storage contents, carried by `debug-localStorage::get` replies.
    pub dump: Option<BTreeMap<String, String>>,
    error: Option<String>,
    success: bool,
    pub detail: String,
}

impl Message {
    pub fn new(id: MessageId, kind: Kind) -> Self {
        Self {
            id,
            kind,
            timeout: None,
            options: ActionOptions::default(),
            dump: None,
            error: None,
            success: true,
            detail: String::new(),
        }
    }

    pub fn action(id: MessageId, action: Action, timeout: Option<u64>, options: ActionOptions) -> Self {
        Self {
            timeout,
            options,
            ..Self::new(id, Kind::Action(action))
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Records a terminal failure. The first error sticks; any error forces `success = false`.
    pub fn set_error(&mut self, error: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(error.into());
        }
        self.success = false;
    }

    pub fn success(&self) -> bool {
        self.success
    }

    /// Records the outcome. Success can't be reported once an error is set.
    pub fn set_success(&mut self, success: bool, detail: impl Into<String>) {
        self.success = success && self.error.is_none();
        self.detail = detail.into();
    }

    pub fn outcome(&self) -> Outcome {
        Outcome {
            error: self.error.clone(),
            success: self.success,
            detail: self.detail.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(data: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(data)?)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, deserialize_with = "deserialize_timeout")]
    timeout: Option<u64>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    detail: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Milliseconds as a page script may send them: fractions round, negatives clamp to 0,
/// anything unusable reads as no timeout.
fn timeout_from_value(value: &Value) -> Option<u64> {
    let millis = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !millis.is_finite() {
        return None;
    }
    Some(millis.max(0.0).round() as u64)
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(timeout_from_value(&value))
}

impl TryFrom<Envelope> for Message {
    type Error = Error;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let id = envelope
            .id
            .filter(|id| !id.is_empty())
            .map(MessageId)
            .ok_or(Error::MissingId)?;
        let kind: Kind = envelope.kind.parse()?;

        let payload = envelope.payload.filter(|p| !p.is_null());
        let (options, dump) = match (kind, payload) {
            (Kind::Action(_), Some(payload)) => (serde_json::from_value(payload)?, None),
            (Kind::Storage(StorageCommand::Get), Some(payload)) => {
                (ActionOptions::default(), Some(serde_json::from_value(payload)?))
            }
            _ => (ActionOptions::default(), None),
        };

        let error = envelope.error.filter(|e| !e.is_empty());
        Ok(Self {
            id,
            kind,
            timeout: envelope.timeout,
            options,
            dump,
            success: envelope.success && error.is_none(),
            error,
            detail: envelope.detail.unwrap_or_default(),
        })
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        let payload = match message.kind {
            Kind::Action(_) => serde_json::to_value(&message.options).ok(),
            Kind::Storage(StorageCommand::Get) => message
                .dump
                .as_ref()
                .and_then(|dump| serde_json::to_value(dump).ok()),
            _ => None,
        };
        Self {
            id: Some(message.id.0),
            kind: message.kind.as_str().to_string(),
            timeout: message.timeout,
            payload,
            error: message.error,
            success: message.success,
            detail: Some(message.detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names() {
        assert_eq!("page-view".parse::<Action>().unwrap(), Action::PageView);
        assert!(matches!(
            "steal-credits".parse::<Action>(),
            Err(Error::UnknownAction(name)) if name == "steal-credits"
        ));
        assert_eq!(Action::Init.transaction_class(), None);
        assert_eq!(Action::ClickThrough.transaction_class(), Some("click-through"));
    }

    #[test]
    fn id_and_payload_survive_the_wire() {
        let message = Message::action(
            MessageId::new("0.123"),
            Action::PageView,
            Some(5000),
            ActionOptions::distinguisher("example.com/blog").with_timeout(5000),
        );
        let json = message.to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["id"], "0.123");
        assert_eq!(value["type"], "page-view");
        assert_eq!(value["payload"]["distinguisher"], "example.com/blog");

        assert_eq!(Message::from_json(&json).unwrap(), message);
    }

    #[test]
    fn accepts_messages_from_javascript_producers() {
        let message = Message::from_json(
            r#"{"id":"0.5","type":"click-through","timeout":1000,"payload":{"timeout":1000},"storage":null,"error":null,"success":true,"detail":""}"#,
        )
        .unwrap();
        assert_eq!(message.kind, Kind::Action(Action::ClickThrough));
        assert_eq!(message.timeout, Some(1000));
        assert_eq!(message.options.distinguisher, None);
        assert!(message.success());

        let ready = Message::from_json(r#"{"id":"1","type":"ready"}"#).unwrap();
        assert_eq!(ready.kind, Kind::Ready);
        assert!(ready.success());
    }

    #[test]
    fn loose_timeouts_are_normalized() {
        let message = Message::from_json(
            r#"{"id":"2","type":"page-view","timeout":1500.5,"payload":{"timeout":-1}}"#,
        )
        .unwrap();
        assert_eq!(message.timeout, Some(1501));
        assert_eq!(message.options.timeout, Some(0));

        let message = Message::from_json(
            r#"{"id":"3","type":"init","timeout":"250","payload":{"timeout":"soon"}}"#,
        )
        .unwrap();
        assert_eq!(message.timeout, Some(250));
        assert_eq!(message.options.timeout, None);

        let message =
            Message::from_json(r#"{"id":"4","type":"init","timeout":null,"payload":{}}"#).unwrap();
        assert_eq!(message.timeout, None);
    }

    #[test]
    fn rejects_unknown_types_and_missing_ids() {
        assert!(Message::from_json(r#"{"id":"1","type":"mine-bitcoin"}"#).is_err());
        assert!(Message::from_json(r#"{"type":"init"}"#).is_err());
        assert!(Message::from_json("not json").is_err());
    }

    #[test]
    fn error_is_sticky_and_forces_failure() {
        let mut message = Message::new(MessageId::new("1"), Kind::Action(Action::Init));
        message.set_error("no tokens available");
        message.set_error("something else");
        message.set_success(true, "200");

        let outcome = message.outcome();
        assert_eq!(outcome.error.as_deref(), Some("no tokens available"));
        assert!(!outcome.success);
        assert_eq!(outcome.detail, "200");
    }

    #[test]
    fn wire_error_implies_failure() {
        let message =
            Message::from_json(r#"{"id":"1","type":"init","error":"boom","success":true}"#)
                .unwrap();
        assert!(!message.success());
        assert_eq!(message.error(), Some("boom"));
    }

    #[test]
    fn storage_dump_round_trips() {
        let mut message = Message::new(MessageId::new("9"), Kind::Storage(StorageCommand::Get));
        message.dump = Some(BTreeMap::from([(
            "PsiCash::v2::PsiCashParams".to_string(),
            "{}".to_string(),
        )]));
        let decoded = Message::from_json(&message.to_json().unwrap()).unwrap();
        assert_eq!(decoded.dump, message.dump);
    }
}
