use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol identity pinned into every envelope. Messages carrying any other
/// channel are foreign (or from an older protocol) and are ignored.
pub const EXTENSION_SANDBOX_CHANNEL: &str = "xlext.extension.sandbox.rpc.v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `EnvelopeDirection` values.
pub enum EnvelopeDirection {
    HostToSandbox,
    SandboxToHost,
}

impl EnvelopeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostToSandbox => "host_to_sandbox",
            Self::SandboxToHost => "sandbox_to_host",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host_to_sandbox" => Some(Self::HostToSandbox),
            "sandbox_to_host" => Some(Self::SandboxToHost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// One message crossing the isolation boundary.
pub struct Envelope {
    pub channel: String,
    pub instance_id: String,
    pub direction: EnvelopeDirection,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
/// Kind-specific envelope fields.
pub enum EnvelopeBody {
    #[serde(rename_all = "camelCase")]
    Request {
        request_id: String,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
}

impl Envelope {
    pub fn request(
        instance_id: impl Into<String>,
        direction: EnvelopeDirection,
        request_id: impl Into<String>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self {
            channel: EXTENSION_SANDBOX_CHANNEL.to_string(),
            instance_id: instance_id.into(),
            direction,
            body: EnvelopeBody::Request {
                request_id: request_id.into(),
                method: method.into(),
                params,
            },
        }
    }

    pub fn response_ok(
        instance_id: impl Into<String>,
        direction: EnvelopeDirection,
        request_id: impl Into<String>,
        result: Value,
    ) -> Self {
        Self {
            channel: EXTENSION_SANDBOX_CHANNEL.to_string(),
            instance_id: instance_id.into(),
            direction,
            body: EnvelopeBody::Response {
                request_id: request_id.into(),
                ok: true,
                result: Some(result),
                error: None,
            },
        }
    }

    pub fn response_error(
        instance_id: impl Into<String>,
        direction: EnvelopeDirection,
        request_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            channel: EXTENSION_SANDBOX_CHANNEL.to_string(),
            instance_id: instance_id.into(),
            direction,
            body: EnvelopeBody::Response {
                request_id: request_id.into(),
                ok: false,
                result: None,
                error: Some(Value::String(message.into())),
            },
        }
    }

    pub fn event(
        instance_id: impl Into<String>,
        direction: EnvelopeDirection,
        event: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            channel: EXTENSION_SANDBOX_CHANNEL.to_string(),
            instance_id: instance_id.into(),
            direction,
            body: EnvelopeBody::Event {
                event: event.into(),
                data,
            },
        }
    }

    /// Converts the envelope into its JSON wire form.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl EnvelopeBody {
    /// Returns a printable error message for a failed response.
    ///
    /// Sandboxes may report errors as plain strings or as `{ message }`
    /// objects; anything else is rendered as JSON.
    pub fn error_message(&self) -> Option<String> {
        let Self::Response {
            error: Some(error), ..
        } = self
        else {
            return None;
        };
        Some(match error {
            Value::String(message) => message.clone(),
            Value::Object(object) => object
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            other => other.to_string(),
        })
    }
}

/// Returns true when `raw` is a structurally valid envelope for this protocol.
///
/// Checks run in a fixed order: channel, instance id, direction, kind, then
/// the kind-specific required fields. Any failure yields `false`.
pub fn is_valid_envelope(raw: &Value) -> bool {
    let Some(object) = raw.as_object() else {
        return false;
    };
    if object.get("channel").and_then(Value::as_str) != Some(EXTENSION_SANDBOX_CHANNEL) {
        return false;
    }
    if !object.get("instanceId").is_some_and(Value::is_string) {
        return false;
    }
    if object
        .get("direction")
        .and_then(Value::as_str)
        .and_then(EnvelopeDirection::parse)
        .is_none()
    {
        return false;
    }
    match object.get("kind").and_then(Value::as_str) {
        Some("request") => has_string(object, "requestId") && has_string(object, "method"),
        Some("response") => {
            has_string(object, "requestId") && object.get("ok").is_some_and(Value::is_boolean)
        }
        Some("event") => has_string(object, "event"),
        _ => false,
    }
}

/// Validates and decodes an envelope. Invalid input is discarded whole.
pub fn parse_envelope(raw: &Value) -> Option<Envelope> {
    if !is_valid_envelope(raw) {
        return None;
    }
    serde_json::from_value(raw.clone()).ok()
}

fn has_string(object: &Map<String, Value>, field: &str) -> bool {
    object.get(field).is_some_and(Value::is_string)
}
