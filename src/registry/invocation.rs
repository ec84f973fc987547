//! The token that tells a re-executed binary which function to run.
//!
//! Token format: hex of the JSON encoding of `{"name": .., "args": [..]}`,
//! with each argument an externally tagged [`Value`] (`{"Int": 5}`, `"Nil"`).
//! Hex keeps the token safe to pass through the environment.

use super::Value;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Invocation {
    pub name: String,
    pub args: Vec<Value>,
}

impl Invocation {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn encode(&self) -> Result<String> {
        // serde_json writes non-finite floats as null, which would not decode.
        if let Some(bad) = self.args.iter().find(|v| !is_finite(v)) {
            return Err(Error::Encode(format!("{}: non-finite float in {}", self.name, bad)));
        }
        let json = serde_json::to_vec(self).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(hex::encode(json))
    }

    pub fn decode(token: &str) -> Result<Self> {
        let json = hex::decode(token.trim()).map_err(|e| Error::Decode(format!("bad hex: {}", e)))?;
        let inv: Invocation =
            serde_json::from_slice(&json).map_err(|e| Error::Decode(e.to_string()))?;
        if inv.name.is_empty() {
            return Err(Error::Decode("empty function name".to_string()));
        }
        Ok(inv)
    }
}

fn is_finite(v: &Value) -> bool {
    match v {
        Value::Float(x) => x.is_finite(),
        Value::List(items) => items.iter().all(is_finite),
        Value::Map(m) => m.values().all(is_finite),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_token_round_trip() {
        let mut m = BTreeMap::new();
        m.insert("k".to_string(), Value::List(vec![Value::Nil, Value::Bool(true)]));
        let inv = Invocation::new(
            "serve",
            vec![
                Value::Str("127.0.0.1:0".to_string()),
                Value::Int(-3),
                Value::Float(1.5),
                Value::Bytes(vec![0, 255]),
                Value::Map(m),
                Value::Nil,
            ],
        );
        let token = inv.encode().unwrap();
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(Invocation::decode(&token).unwrap(), inv);
    }

    #[test]
    fn test_wire_shape() {
        let token = Invocation::new("add", vec![Value::Int(2), Value::Nil]).encode().unwrap();
        let json = String::from_utf8(hex::decode(token).unwrap()).unwrap();
        assert_eq!(json, r#"{"name":"add","args":[{"Int":2},"Nil"]}"#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Invocation::decode("zz"), Err(Error::Decode(_))));
        let unknown_tag = hex::encode(r#"{"name":"f","args":[{"Complex":1}]}"#);
        assert!(matches!(Invocation::decode(&unknown_tag), Err(Error::Decode(_))));
        let extra_field = hex::encode(r#"{"name":"f","args":[],"x":1}"#);
        assert!(matches!(Invocation::decode(&extra_field), Err(Error::Decode(_))));
        let no_name = hex::encode(r#"{"name":"","args":[]}"#);
        assert!(matches!(Invocation::decode(&no_name), Err(Error::Decode(_))));
    }

    #[test]
    fn test_nan_cannot_be_encoded() {
        let inv = Invocation::new("f", vec![Value::Float(f64::NAN)]);
        assert!(matches!(inv.encode(), Err(Error::Encode(_))));
        let nested = Invocation::new("f", vec![Value::List(vec![Value::Float(f64::INFINITY)])]);
        assert!(matches!(nested.encode(), Err(Error::Encode(_))));
    }
}
