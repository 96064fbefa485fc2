//! Wire messages
//!
//! Each direction of a session link carries a sequence of self-delimited
//! JSON values. Every value is an array whose first element is a
//! correlation id:
//! - a call is `[id, name, args]`, with `args` an array;
//! - a reply is `[id, value, error]`, with `error` either `null` (or an
//!   empty string) or a message describing the failure.
//!
//! A frame can only be told apart as a call or a reply by whoever knows
//! which ids are pending, so decoding stops at `Frame` and the session
//! core does the classification.

use serde_json::Value;

/// Largest amount of buffered data a single value may span.
pub const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not enough data yet to form a complete value.
    #[error("incomplete value")]
    NeedMore,
    #[error("malformed JSON: {0}")]
    Json(serde_json::Error),
    #[error("value exceeds {MAX_VALUE_SIZE} bytes")]
    TooLarge,
    #[error("message is not an array: {0}")]
    NotAnArray(Value),
    #[error("message has no string correlation id")]
    InvalidId,
    #[error("message {0} is not shaped like a call")]
    NotACall(String),
}

/// A call, either outgoing or invoked by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub id: String,
    pub name: String,
    pub args: Vec<Value>,
}

/// The answer to a `Call` with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub id: String,
    pub value: Value,
    pub error: Option<String>,
}

/// A decoded message whose kind is not yet known.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: String,
    pub body: Vec<Value>,
}

impl Call {
    pub fn new(name: &str, args: Vec<Value>) -> Call {
        Call {
            id: new_call_id(),
            name: name.to_string(),
            args,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.id.clone()),
            Value::String(self.name.clone()),
            Value::Array(self.args.clone()),
        ])
    }
}

impl Reply {
    pub fn ok(id: String, value: Value) -> Reply {
        Reply {
            id,
            value,
            error: None,
        }
    }

    pub fn err(id: String, message: String) -> Reply {
        Reply {
            id,
            value: Value::Null,
            error: Some(message),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.id.clone()),
            self.value.clone(),
            match &self.error {
                Some(msg) => Value::String(msg.clone()),
                None => Value::Null,
            },
        ])
    }
}

impl Frame {
    pub fn from_value(value: Value) -> Result<Frame, Error> {
        let mut items = match value {
            Value::Array(items) => items,
            other => return Err(Error::NotAnArray(other)),
        };
        if items.is_empty() {
            return Err(Error::InvalidId);
        }
        let id = match items.remove(0) {
            Value::String(id) => id,
            _ => return Err(Error::InvalidId),
        };
        Ok(Frame { id, body: items })
    }

    pub fn is_call_shaped(&self) -> bool {
        matches!(self.body.as_slice(), [Value::String(_), Value::Array(_)])
    }

    pub fn into_call(self) -> Result<Call, Error> {
        let mut body = self.body.into_iter();
        match (body.next(), body.next(), body.next()) {
            (Some(Value::String(name)), Some(Value::Array(args)), None) => Ok(Call {
                id: self.id,
                name,
                args,
            }),
            _ => Err(Error::NotACall(self.id)),
        }
    }

    /// Interpret as a reply. Missing elements read as `null`; any error
    /// element other than `null` or `""` marks the reply as failed.
    pub fn into_reply(self) -> Reply {
        let mut body = self.body.into_iter();
        let value = body.next().unwrap_or(Value::Null);
        let error = match body.next() {
            None | Some(Value::Null) => None,
            Some(Value::String(msg)) if msg.is_empty() => None,
            Some(Value::String(msg)) => Some(msg),
            Some(other) => Some(other.to_string()),
        };
        Reply {
            id: self.id,
            value,
            error,
        }
    }
}

pub fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Attempts to decode one JSON value off the front of `data`, returning it
/// and the number of bytes it spanned (including leading whitespace).
pub fn decode_value(data: &[u8]) -> Result<(Value, usize), Error> {
    let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<Value>();
    match stream.next() {
        None => {
            if data.len() > MAX_VALUE_SIZE {
                Err(Error::TooLarge)
            } else {
                Err(Error::NeedMore)
            }
        }
        Some(Ok(value)) => Ok((value, stream.byte_offset())),
        Some(Err(e)) if e.is_eof() => {
            if data.len() > MAX_VALUE_SIZE {
                Err(Error::TooLarge)
            } else {
                Err(Error::NeedMore)
            }
        }
        Some(Err(e)) => Err(Error::Json(e)),
    }
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut raw = serde_json::to_vec(value)?;
    raw.push(b'\n');
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_split_across_reads_needs_more_until_complete() {
        let raw = br#"["abc","GetPackets",[]] ["def",1,null]"#;
        assert!(matches!(decode_value(&raw[..10]), Err(Error::NeedMore)));
        let (first, used) = decode_value(raw).unwrap();
        assert_eq!(first, json!(["abc", "GetPackets", []]));
        let (second, _) = decode_value(&raw[used..]).unwrap();
        assert_eq!(second, json!(["def", 1, null]));
    }

    #[test]
    fn whitespace_only_needs_more() {
        assert!(matches!(decode_value(b"  \n "), Err(Error::NeedMore)));
    }

    #[test]
    fn garbage_is_a_json_error() {
        assert!(matches!(decode_value(b"]["), Err(Error::Json(_))));
    }

    #[test]
    fn call_shape_and_reply_errors() {
        let frame = Frame::from_value(json!(["1", "GetEscalationPermission", [true]])).unwrap();
        assert!(frame.is_call_shaped());
        let call = frame.into_call().unwrap();
        assert_eq!(call.name, "GetEscalationPermission");
        assert_eq!(call.args, vec![json!(true)]);

        let reply = Frame::from_value(json!(["2", null, ""])).unwrap().into_reply();
        assert_eq!(reply.error, None);
        let reply = Frame::from_value(json!(["3", null, "no such device"]))
            .unwrap()
            .into_reply();
        assert_eq!(reply.error.as_deref(), Some("no such device"));
        let reply = Frame::from_value(json!(["4"])).unwrap().into_reply();
        assert_eq!(reply.value, Value::Null);
    }

    #[test]
    fn non_string_id_is_rejected() {
        assert!(matches!(
            Frame::from_value(json!([7, "x", []])),
            Err(Error::InvalidId)
        ));
        assert!(matches!(
            Frame::from_value(json!({"id": 1})),
            Err(Error::NotAnArray(_))
        ));
    }
}
