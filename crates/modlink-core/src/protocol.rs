//! Wire frames exchanged over a channel.
//!
//! Requests travel client → server as `[event, taskId, module?, method?, args?]`,
//! responses travel server → client as `[event, taskId | name, data?]`. Both
//! are positional arrays so the same shape works for JSON text frames and
//! MessagePack binary frames.

use std::fmt;

use serde::de::{self, IgnoredAny, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::{ChannelError, Result};

// ── Event codes ─────────────────────────────────────────────────────

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Event {
    /// Server greeting carrying its id and the negotiated codec.
    Connect = 1,
    /// Start a call (request) or acknowledge a suspended generator (response).
    Invoke = 2,
    /// Generator `return` (request) or terminal value (response).
    Return = 3,
    /// Generator `throw` (request) or call error (response).
    Throw = 4,
    /// Generator `next`.
    Yield = 5,
    /// Topic message pushed by the server.
    Publish = 6,
    /// Keepalive ping.
    Ping = 7,
    /// Keepalive answer.
    Pong = 8,
}

impl Event {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up an event by wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Connect,
            2 => Self::Invoke,
            3 => Self::Return,
            4 => Self::Throw,
            5 => Self::Yield,
            6 => Self::Publish,
            7 => Self::Ping,
            8 => Self::Pong,
            _ => return None,
        })
    }

    /// Lower-case label used in logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Invoke => "invoke",
            Self::Return => "return",
            Self::Throw => "throw",
            Self::Yield => "yield",
            Self::Publish => "publish",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| {
            de::Error::invalid_value(de::Unexpected::Unsigned(code.into()), &"an event code 1..=8")
        })
    }
}

// ── Requests ────────────────────────────────────────────────────────

/// Client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Frame kind.
    pub event: Event,
    /// Task id, or the timestamp for [`Event::Ping`].
    pub task_id: u64,
    /// Target module name.
    pub module: Option<String>,
    /// Target method name.
    pub method: Option<String>,
    /// Call arguments; generator operations carry a single input value.
    pub args: Vec<Value>,
}

impl Request {
    /// `[INVOKE, id, module, method, args]`.
    pub fn invoke(task_id: u64, module: &str, method: &str, args: Vec<Value>) -> Self {
        Self {
            event: Event::Invoke,
            task_id,
            module: Some(module.to_owned()),
            method: Some(method.to_owned()),
            args,
        }
    }

    /// A generator operation (`YIELD`, `RETURN` or `THROW`) on an existing task.
    pub fn generator(event: Event, task_id: u64, module: &str, method: &str, input: Value) -> Self {
        Self {
            event,
            task_id,
            module: Some(module.to_owned()),
            method: Some(method.to_owned()),
            args: vec![input],
        }
    }

    /// `[PING, timestamp]`.
    pub fn ping(timestamp: u64) -> Self {
        Self {
            event: Event::Ping,
            task_id: timestamp,
            module: None,
            method: None,
            args: Vec::new(),
        }
    }

    /// First argument, used as the generator input and the routing key.
    pub fn first_arg(&self) -> Value {
        self.args.first().cloned().unwrap_or(Value::Null)
    }

    fn is_bare(&self) -> bool {
        self.module.is_none() && self.method.is_none() && self.args.is_empty()
    }
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.is_bare() { 2 } else { 5 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.event)?;
        seq.serialize_element(&self.task_id)?;
        if !self.is_bare() {
            seq.serialize_element(&self.module)?;
            seq.serialize_element(&self.method)?;
            seq.serialize_element(&self.args)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Request {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RequestVisitor;

        impl<'de> Visitor<'de> for RequestVisitor {
            type Value = Request;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a request frame [event, taskId, module?, method?, args?]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Request, A::Error> {
                let event: Event = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let task_id: u64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let module: Option<String> = seq.next_element::<Option<String>>()?.flatten();
                let method: Option<String> = seq.next_element::<Option<String>>()?.flatten();
                let args: Vec<Value> = seq.next_element::<Option<Vec<Value>>>()?.flatten().unwrap_or_default();
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Request {
                    event,
                    task_id,
                    module,
                    method,
                    args,
                })
            }
        }

        deserializer.deserialize_seq(RequestVisitor)
    }
}

// ── Responses ───────────────────────────────────────────────────────

/// Second slot of a response: a task id, or a name for `CONNECT` / `PUBLISH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Target {
    /// Task id of the call being answered.
    Task(u64),
    /// Server id (`CONNECT`) or topic (`PUBLISH`).
    Name(String),
}

/// Server → client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Frame kind.
    pub event: Event,
    /// Task id or name.
    pub target: Target,
    /// Payload, absent for bare acknowledgements.
    pub data: Option<Value>,
}

impl Response {
    /// `[CONNECT, serverId, codec]`.
    pub fn connect(server_id: &str, codec: &str) -> Self {
        Self {
            event: Event::Connect,
            target: Target::Name(server_id.to_owned()),
            data: Some(Value::String(codec.to_owned())),
        }
    }

    /// Answer for a task.
    pub fn task(event: Event, task_id: u64, data: Option<Value>) -> Self {
        Self {
            event,
            target: Target::Task(task_id),
            data,
        }
    }

    /// `[PUBLISH, topic, payload]`.
    pub fn publish(topic: &str, payload: Value) -> Self {
        Self {
            event: Event::Publish,
            target: Target::Name(topic.to_owned()),
            data: Some(payload),
        }
    }

    /// `[PONG, timestamp]`.
    pub fn pong(timestamp: u64) -> Self {
        Self {
            event: Event::Pong,
            target: Target::Task(timestamp),
            data: None,
        }
    }

    /// Task id carried by the frame, if any.
    pub fn task_id(&self) -> Option<u64> {
        match self.target {
            Target::Task(id) => Some(id),
            Target::Name(_) => None,
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.data.is_some() { 3 } else { 2 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.event)?;
        seq.serialize_element(&self.target)?;
        if let Some(data) = &self.data {
            seq.serialize_element(data)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ResponseVisitor;

        impl<'de> Visitor<'de> for ResponseVisitor {
            type Value = Response;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a response frame [event, taskId | name, data?]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Response, A::Error> {
                let event: Event = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let target: Target = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let data: Option<Value> = seq.next_element()?;
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                Ok(Response { event, target, data })
            }
        }

        deserializer.deserialize_seq(ResponseVisitor)
    }
}

// ── Iterator results ────────────────────────────────────────────────

/// Result of a generator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterResult {
    /// Yielded or returned value.
    #[serde(default)]
    pub value: Value,
    /// Whether the generator has finished.
    #[serde(default)]
    pub done: bool,
}

impl IterResult {
    /// A yielded, non-final value.
    pub fn yielded(value: Value) -> Self {
        Self { value, done: false }
    }

    /// A final value.
    pub fn done(value: Value) -> Self {
        Self { value, done: true }
    }

    /// `{value, done}` object as carried in frames.
    pub fn to_value(&self) -> Value {
        serde_json::json!({ "value": self.value, "done": self.done })
    }

    /// Parse a `{value, done}` payload.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(ChannelError::Protocol(format!(
                "expected an iterator result object, got {value}"
            )));
        }
        serde_json::from_value(value).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invoke_request_serializes_as_positional_array() {
        let req = Request::invoke(7, "math", "add", vec![json!(2), json!(3)]);
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"[2,7,"math","add",[2,3]]"#);
    }

    #[test]
    fn ping_request_has_two_slots() {
        let text = serde_json::to_string(&Request::ping(1_700_000_000_000)).unwrap();
        assert_eq!(text, "[7,1700000000000]");
    }

    #[test]
    fn request_parses_without_optional_slots() {
        let req: Request = serde_json::from_str("[7,42]").unwrap();
        assert_eq!(req.event, Event::Ping);
        assert_eq!(req.task_id, 42);
        assert!(req.module.is_none());
        assert!(req.args.is_empty());
    }

    #[test]
    fn request_tolerates_null_slots_and_trailing_elements() {
        let req: Request = serde_json::from_str(r#"[5,1,"m","f",null,"extra"]"#).unwrap();
        assert_eq!(req.event, Event::Yield);
        assert_eq!(req.module.as_deref(), Some("m"));
        assert!(req.args.is_empty());
        assert_eq!(req.first_arg(), Value::Null);
    }

    #[test]
    fn unknown_event_code_is_rejected() {
        let err = serde_json::from_str::<Request>("[9,1]").unwrap_err();
        assert!(err.to_string().contains("event code"));
    }

    #[test]
    fn connect_response_carries_name_and_codec() {
        let text = serde_json::to_string(&Response::connect("ws://127.0.0.1:80/", "JSON")).unwrap();
        assert_eq!(text, r#"[1,"ws://127.0.0.1:80/","JSON"]"#);
        let parsed: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.target, Target::Name("ws://127.0.0.1:80/".into()));
        assert_eq!(parsed.data, Some(json!("JSON")));
    }

    #[test]
    fn bare_ack_omits_data_slot() {
        let text = serde_json::to_string(&Response::task(Event::Invoke, 3, None)).unwrap();
        assert_eq!(text, "[2,3]");
        let parsed: Response = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.task_id(), Some(3));
        assert!(parsed.data.is_none());
    }

    #[test]
    fn response_frames_survive_msgpack() {
        let frame = Response::task(Event::Yield, 11, Some(IterResult::yielded(json!("a")).to_value()));
        let bytes = rmp_serde::to_vec(&frame).unwrap();
        let parsed: Response = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn iter_result_defaults_missing_fields() {
        let r = IterResult::from_value(json!({ "done": true })).unwrap();
        assert_eq!(r, IterResult::done(Value::Null));
        assert!(IterResult::from_value(json!(5)).is_err());
    }
}
