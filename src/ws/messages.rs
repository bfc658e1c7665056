//! Protocol frames: client → relay and relay → client.
//!
//! Every frame is a JSON array led by a string label. Client frames are
//! parsed into the closed [`ClientMessage`] sum type; anything that does not
//! fit one of its variants is a [`ProtocolError`].

use std::str::FromStr;
use std::sync::Arc;

use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

use crate::domain::{Event, Filter, FilterGroup, SubscriptionId};
use crate::error::ProtocolError;

/// Frame received from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`: submit an event.
    Event(Box<Event>),
    /// `["REQ", <sub id>, <filter>, ...]`: replay history, then stream live.
    Req {
        /// Client-chosen subscription id.
        subscription_id: SubscriptionId,
        /// Filters combined by OR.
        filters: FilterGroup,
    },
    /// `["CLOSE", <sub id>]`: cancel a subscription.
    Close(SubscriptionId),
    /// `["NOTICE", <message>]`: informational.
    Notice(String),
    /// `["EOSE", <sub id>]`: informational.
    Eose(String),
    /// `["OK", <event id>, <accepted>, <message>]`: informational.
    Ok {
        /// Event the acknowledgement refers to.
        event_id: String,
        /// Whether the peer accepted it.
        accepted: bool,
        /// Free-form explanation.
        message: String,
    },
    /// `["AUTH", <payload>]`: informational; no relay-side auth policy.
    Auth(Value),
}

impl ClientMessage {
    /// Returns the frame label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Event(_) => "EVENT",
            Self::Req { .. } => "REQ",
            Self::Close(_) => "CLOSE",
            Self::Notice(_) => "NOTICE",
            Self::Eose(_) => "EOSE",
            Self::Ok { .. } => "OK",
            Self::Auth(_) => "AUTH",
        }
    }
}

impl FromStr for ClientMessage {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Json(e.to_string()))?;
        let Value::Array(items) = value else {
            return Err(ProtocolError::NotAnArray);
        };
        let mut items = items.into_iter();
        let Some(Value::String(label)) = items.next() else {
            return Err(ProtocolError::NotAnArray);
        };
        let rest: Vec<Value> = items.collect();

        match label.as_str() {
            "EVENT" => {
                let [event] = exactly("EVENT", rest)?;
                let event: Event = serde_json::from_value(event)
                    .map_err(|e| malformed("EVENT", format!("bad event: {e}")))?;
                Ok(Self::Event(Box::new(event)))
            }
            "REQ" => parse_req(rest),
            "CLOSE" => {
                let [id] = exactly("CLOSE", rest)?;
                Ok(Self::Close(subscription_id("CLOSE", id)?))
            }
            "NOTICE" => {
                let [message] = exactly("NOTICE", rest)?;
                Ok(Self::Notice(string("NOTICE", message)?))
            }
            "EOSE" => {
                let [id] = exactly("EOSE", rest)?;
                Ok(Self::Eose(string("EOSE", id)?))
            }
            "OK" => parse_ok(rest),
            "AUTH" => {
                let [payload] = exactly("AUTH", rest)?;
                Ok(Self::Auth(payload))
            }
            _ => Err(ProtocolError::UnknownLabel(label)),
        }
    }
}

fn malformed(label: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        label,
        reason: reason.into(),
    }
}

fn exactly<const N: usize>(
    label: &'static str,
    rest: Vec<Value>,
) -> Result<[Value; N], ProtocolError> {
    let got = rest.len();
    <[Value; N]>::try_from(rest).map_err(|_| {
        malformed(label, format!("expected {N} element(s) after label, got {got}"))
    })
}

fn string(label: &'static str, value: Value) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(malformed(label, "expected a string")),
    }
}

fn subscription_id(label: &'static str, value: Value) -> Result<SubscriptionId, ProtocolError> {
    SubscriptionId::new(string(label, value)?).map_err(|reason| malformed(label, reason))
}

fn parse_req(rest: Vec<Value>) -> Result<ClientMessage, ProtocolError> {
    let mut items = rest.into_iter();
    let Some(id) = items.next() else {
        return Err(malformed("REQ", "missing subscription id"));
    };
    let subscription_id = subscription_id("REQ", id)?;
    let filters = items
        .map(|value| {
            serde_json::from_value::<Filter>(value)
                .map_err(|e| malformed("REQ", format!("bad filter: {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    if filters.is_empty() {
        return Err(malformed("REQ", "at least one filter is required"));
    }
    Ok(ClientMessage::Req {
        subscription_id,
        filters: FilterGroup::new(filters),
    })
}

fn parse_ok(rest: Vec<Value>) -> Result<ClientMessage, ProtocolError> {
    let mut items = rest.into_iter();
    let (Some(Value::String(event_id)), Some(Value::Bool(accepted))) = (items.next(), items.next())
    else {
        return Err(malformed("OK", "expected event id and accepted flag"));
    };
    let message = match items.next() {
        Some(Value::String(m)) => m,
        None => String::new(),
        Some(_) => return Err(malformed("OK", "message must be a string")),
    };
    if items.next().is_some() {
        return Err(malformed("OK", "too many elements"));
    }
    Ok(ClientMessage::Ok {
        event_id,
        accepted,
        message,
    })
}

/// Frame sent to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// `["EVENT", <sub id>, <event>]`: replayed or live event.
    Event(SubscriptionId, Arc<Event>),
    /// `["EOSE", <sub id>]`: end of stored events.
    Eose(SubscriptionId),
    /// `["OK", <event id>, <accepted>, <message>]`: submission result.
    Ok {
        /// Submitted event id.
        event_id: String,
        /// Whether the event was accepted.
        accepted: bool,
        /// Machine-readable prefix plus explanation, or empty.
        message: String,
    },
    /// `["NOTICE", <message>]`: human-readable notice.
    Notice(String),
    /// `["CLOSED", <sub id>, <message>]`: the relay ended a subscription.
    Closed(SubscriptionId, String),
}

impl RelayMessage {
    /// Serializes the frame to its JSON text.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the payload cannot be encoded.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Event(sub, event) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(sub)?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
            Self::Eose(sub) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(sub)?;
                seq.end()
            }
            Self::Ok {
                event_id,
                accepted,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(event_id)?;
                seq.serialize_element(accepted)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            Self::Notice(message) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("NOTICE")?;
                seq.serialize_element(message)?;
                seq.end()
            }
            Self::Closed(sub, message) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(sub)?;
                seq.serialize_element(message)?;
                seq.end()
            }
        }
    }
}
