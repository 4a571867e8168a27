//! JSON patch fragments exchanged with the lens evaluator, and the diff
//! based patches handed to frontends.
use crate::clock::Clock;
use crate::error::Error;
use crate::id::{ActorId, ElemId, Key, ObjId};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The RFC 6902 subset the translator produces and the lens evaluator
/// rewrites. Values are restricted to scalars, `null` and empty
/// collections.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Replace { path: String, value: Value },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. } | Self::Replace { path, .. } | Self::Remove { path } => path,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Add { value, .. } | Self::Replace { value, .. } => Some(value),
            Self::Remove { .. } => None,
        }
    }

    pub fn with_path(self, path: String) -> Self {
        match self {
            Self::Add { value, .. } => Self::Add { path, value },
            Self::Replace { value, .. } => Self::Replace { path, value },
            Self::Remove { .. } => Self::Remove { path },
        }
    }

    /// Whether this op materializes an empty object, i.e. creates the
    /// container that property lenses scoped here fill with defaults.
    pub fn creates_object(&self) -> bool {
        matches!(self.value(), Some(Value::Object(map)) if map.is_empty())
    }
}

/// Splits `/a/b/c` into `("a", "/b/c")`. The empty path has no head.
pub(crate) fn split_path(path: &str) -> (Option<&str>, &str) {
    match path.strip_prefix('/') {
        Some(rest) => match rest.find('/') {
            Some(at) => (Some(&rest[..at]), &rest[at..]),
            None => (Some(rest), ""),
        },
        None => (None, ""),
    }
}

/// Splits `/a/b/c` into `("/a/b", "c")`.
pub(crate) fn split_last(path: &str) -> Option<(&str, &str)> {
    let at = path.rfind('/')?;
    Some((&path[..at], &path[at + 1..]))
}

/// The shape of an object as recorded at creation time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjType {
    Map,
    List,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    Create,
    Set,
    Insert,
    Remove,
}

/// One edit of the materialized document, in the wire shape of the op-based
/// backend's patch format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    pub action: DiffAction,
    pub obj: ObjId,
    #[serde(rename = "type")]
    pub kind: ObjType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elem_id: Option<ElemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub link: bool,
}

impl Diff {
    pub fn create(obj: ObjId, kind: ObjType) -> Self {
        Self {
            action: DiffAction::Create,
            obj,
            kind,
            key: None,
            index: None,
            elem_id: None,
            value: None,
            link: false,
        }
    }
}

/// What an apply returns: the edits plus the clock and dependency frontier
/// of the state they lead to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub clock: Clock,
    pub deps: Clock,
    pub diffs: Vec<Diff>,
}

impl Patch {
    /// Strips the phantom actor from the visible clocks. The defaults
    /// change is materialized locally on every peer and must never leak
    /// into inter-peer causality.
    pub fn scrub(mut self) -> Self {
        self.clock.remove(&ActorId::phantom());
        self.deps.remove(&ActorId::phantom());
        self
    }
}

enum Node {
    Map(BTreeMap<String, Slot>),
    List(Vec<Slot>),
}

#[derive(Clone)]
enum Slot {
    Value(Value),
    Link(ObjId),
}

/// Folds a diff sequence into the JSON document it describes. This is the
/// reference frontend: tests and embedders that don't keep their own object
/// tables read state through it.
pub fn materialize(diffs: &[Diff]) -> Result<Value> {
    let mut objects: HashMap<ObjId, Node> = HashMap::new();
    objects.insert(ObjId::root(), Node::Map(BTreeMap::new()));
    for diff in diffs {
        if diff.action == DiffAction::Create {
            let node = match diff.kind {
                ObjType::Map => Node::Map(BTreeMap::new()),
                ObjType::List => Node::List(Vec::new()),
            };
            objects.insert(diff.obj.clone(), node);
            continue;
        }
        let slot = match (&diff.value, diff.link) {
            (Some(Value::String(id)), true) => Some(Slot::Link(ObjId::from(id.as_str()))),
            (Some(value), false) => Some(Slot::Value(value.clone())),
            (None, _) => None,
            _ => return Err(Error::OpShape("link diff without object id".into()).into()),
        };
        let node = objects
            .get_mut(&diff.obj)
            .ok_or_else(|| Error::OpShape(format!("diff for unknown object {}", diff.obj)))?;
        match (node, diff.action) {
            (Node::Map(map), DiffAction::Set) => {
                let key = diff.key.clone().ok_or_else(|| bad_diff("map set without key"))?;
                map.insert(key.to_string(), slot.ok_or_else(|| bad_diff("set without value"))?);
            }
            (Node::Map(map), DiffAction::Remove) => {
                let key = diff.key.clone().ok_or_else(|| bad_diff("map remove without key"))?;
                map.remove(key.as_str());
            }
            (Node::List(list), DiffAction::Insert) => {
                let index = diff.index.ok_or_else(|| bad_diff("insert without index"))?;
                if index > list.len() {
                    return Err(bad_diff("insert index out of bounds").into());
                }
                list.insert(index, slot.ok_or_else(|| bad_diff("insert without value"))?);
            }
            (Node::List(list), DiffAction::Set) => {
                let index = diff.index.ok_or_else(|| bad_diff("list set without index"))?;
                let slot = slot.ok_or_else(|| bad_diff("set without value"))?;
                *list
                    .get_mut(index)
                    .ok_or_else(|| bad_diff("list set index out of bounds"))? = slot;
            }
            (Node::List(list), DiffAction::Remove) => {
                let index = diff.index.ok_or_else(|| bad_diff("list remove without index"))?;
                if index >= list.len() {
                    return Err(bad_diff("list remove index out of bounds").into());
                }
                list.remove(index);
            }
            _ => return Err(bad_diff("action doesn't match object type").into()),
        }
    }
    realize(&objects, &ObjId::root())
}

fn bad_diff(msg: &str) -> Error {
    Error::OpShape(msg.into())
}

fn realize(objects: &HashMap<ObjId, Node>, obj: &ObjId) -> Result<Value> {
    let node = objects
        .get(obj)
        .ok_or_else(|| Error::OpShape(format!("dangling link to {}", obj)))?;
    let resolve = |slot: &Slot| match slot {
        Slot::Value(value) => Ok(value.clone()),
        Slot::Link(child) => realize(objects, child),
    };
    match node {
        Node::Map(map) => {
            let mut out = serde_json::Map::new();
            for (key, slot) in map {
                out.insert(key.clone(), resolve(slot)?);
            }
            Ok(Value::Object(out))
        }
        Node::List(list) => Ok(Value::Array(
            list.iter().map(resolve).collect::<Result<Vec<_>>>()?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_path_heads() {
        assert_eq!(split_path(""), (None, ""));
        assert_eq!(split_path("/a"), (Some("a"), ""));
        assert_eq!(split_path("/a/b/c"), (Some("a"), "/b/c"));
    }

    #[test]
    fn split_last_parents() {
        assert_eq!(split_last("/a"), Some(("", "a")));
        assert_eq!(split_last("/a/b"), Some(("/a", "b")));
        assert_eq!(split_last(""), None);
    }

    #[test]
    fn materialize_nested() {
        let list = ObjId::from("list-1");
        let diffs = vec![
            Diff {
                action: DiffAction::Set,
                obj: ObjId::root(),
                kind: ObjType::Map,
                key: Some(Key::from("title")),
                index: None,
                elem_id: None,
                value: Some(json!("hello")),
                link: false,
            },
            Diff::create(list.clone(), ObjType::List),
            Diff {
                action: DiffAction::Set,
                obj: ObjId::root(),
                kind: ObjType::Map,
                key: Some(Key::from("tags")),
                index: None,
                elem_id: None,
                value: Some(json!(list.as_str())),
                link: true,
            },
            Diff {
                action: DiffAction::Insert,
                obj: list,
                kind: ObjType::List,
                key: None,
                index: Some(0),
                elem_id: Some(ElemId::Elem(ActorId::new("a"), 1)),
                value: Some(json!("fun")),
                link: false,
            },
        ];
        let doc = materialize(&diffs).unwrap();
        assert_eq!(doc, json!({"title": "hello", "tags": ["fun"]}));
    }

    #[test]
    fn patch_op_wire_shape() {
        let op = PatchOp::Add {
            path: "/name".into(),
            value: json!("hello"),
        };
        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(wire, json!({"op": "add", "path": "/name", "value": "hello"}));
    }
}
