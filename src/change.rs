//! Wire types: ops, changes and history blocks, in the JSON shapes of the
//! op-based document protocol.
use crate::clock::Clock;
use crate::graph::LensReg;
use crate::id::{ActorId, Key, ObjId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Scalar payload of a `set` op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl ScalarValue {
    /// Converts a JSON value, if it is a scalar.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::Null),
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Number(n) => Some(Self::Number(n.as_f64()?)),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// A single operation inside a change. `obj` is the parent object, except
/// for `make*` where it is the created object's id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Op {
    MakeMap {
        obj: ObjId,
    },
    MakeList {
        obj: ObjId,
    },
    Ins {
        obj: ObjId,
        key: Key,
        elem: u64,
    },
    Set {
        obj: ObjId,
        key: Key,
        value: ScalarValue,
    },
    Link {
        obj: ObjId,
        key: Key,
        value: ObjId,
    },
    Del {
        obj: ObjId,
        key: Key,
    },
}

impl Op {
    pub fn obj(&self) -> &ObjId {
        match self {
            Self::MakeMap { obj }
            | Self::MakeList { obj }
            | Self::Ins { obj, .. }
            | Self::Set { obj, .. }
            | Self::Link { obj, .. }
            | Self::Del { obj, .. } => obj,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            Self::MakeMap { .. } | Self::MakeList { .. } => None,
            Self::Ins { key, .. }
            | Self::Set { key, .. }
            | Self::Link { key, .. }
            | Self::Del { key, .. } => Some(key),
        }
    }

    pub fn elem(&self) -> Option<u64> {
        match self {
            Self::Ins { elem, .. } => Some(*elem),
            _ => None,
        }
    }
}

/// One unit of work by one actor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub actor: ActorId,
    pub seq: u64,
    #[serde(default)]
    pub deps: Clock,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub ops: Vec<Op>,
}

/// The unit of history: a change together with the schema its author wrote
/// under and the lens registrations the author believes its peers may need.
/// `actor` and `seq` mirror the change for cheap indexing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub schema: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lenses: Vec<LensReg>,
    pub change: Change,
    pub actor: ActorId,
    pub seq: u64,
}

impl Block {
    pub fn new(schema: impl Into<String>, lenses: Vec<LensReg>, change: Change) -> Self {
        let actor = change.actor.clone();
        let seq = change.seq;
        Self {
            schema: schema.into(),
            lenses,
            change,
            actor,
            seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn op_wire_shape() {
        let op = Op::Set {
            obj: ObjId::root(),
            key: Key::from("name"),
            value: ScalarValue::Text("hello".into()),
        };
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({
                "action": "set",
                "obj": "00000000-0000-0000-0000-000000000000",
                "key": "name",
                "value": "hello",
            })
        );
        let back: Op = serde_json::from_value(wire).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn block_mirrors_change_identity() {
        let change = Change {
            actor: ActorId::new("actor-a"),
            seq: 3,
            deps: Clock::new(),
            message: None,
            ops: vec![],
        };
        let block = Block::new("project-v1", vec![], change);
        assert_eq!(block.actor, ActorId::new("actor-a"));
        assert_eq!(block.seq, 3);
    }
}
