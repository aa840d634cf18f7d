//! WS Protocol Codec (§4.9): each frame on the wire is a bare JSON array,
//! not an object, so a custom codec reads the first element (the message
//! type) and decides how many more elements to expect.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Message type tag, first element of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Open = 0,
    Close = 1,
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// A frame received from the client: either an open/close handshake
/// message or a call naming an action and its payload.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    /// Hello frame: `payload` carries either Basic credentials or a
    /// `{session,secret}` resume pair.
    Open { unique_id: i64, payload: Value },
    /// Sign-out frame.
    Close { unique_id: i64, payload: Value },
    Call {
        unique_id: i64,
        action: String,
        payload: Value,
    },
}

impl<'de> Deserialize<'de> for ClientFrame {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let elements = Vec::<Value>::deserialize(deserializer)?;
        let mut iter = elements.into_iter();

        let type_id = iter
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| D::Error::custom("missing message type"))?;
        let message_type = MessageType::from_id(type_id as u8)
            .ok_or_else(|| D::Error::custom("unknown message type"))?;
        let unique_id = iter
            .next()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| D::Error::custom("missing uniqueId"))?;

        match message_type {
            MessageType::Open => Ok(ClientFrame::Open {
                unique_id,
                payload: iter.next().unwrap_or(Value::Null),
            }),
            MessageType::Close => Ok(ClientFrame::Close {
                unique_id,
                payload: iter.next().unwrap_or(Value::Null),
            }),
            MessageType::Call => {
                let action = iter
                    .next()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| D::Error::custom("missing action"))?;
                let payload = iter.next().unwrap_or(Value::Null);
                Ok(ClientFrame::Call {
                    unique_id,
                    action,
                    payload,
                })
            }
            MessageType::CallResult | MessageType::CallError => Err(D::Error::custom(
                "client may not send a result or error frame",
            )),
        }
    }
}

/// A frame sent back to the client: a call's result, or an error naming a
/// code, message, and optional structured details.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    Result {
        unique_id: i64,
        payload: Value,
    },
    Error {
        unique_id: i64,
        code: u16,
        message: String,
        details: Option<Value>,
    },
}

impl Serialize for ServerFrame {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeSeq;

        match self {
            ServerFrame::Result { unique_id, payload } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(&(MessageType::CallResult as u8))?;
                seq.serialize_element(unique_id)?;
                seq.serialize_element(payload)?;
                seq.end()
            }
            ServerFrame::Error {
                unique_id,
                code,
                message,
                details,
            } => {
                let len = if details.is_some() { 5 } else { 4 };
                let mut seq = serializer.serialize_seq(Some(len))?;
                seq.serialize_element(&(MessageType::CallError as u8))?;
                seq.serialize_element(unique_id)?;
                seq.serialize_element(code)?;
                seq.serialize_element(message)?;
                if let Some(details) = details {
                    seq.serialize_element(details)?;
                }
                seq.end()
            }
        }
    }
}
