use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Reserved actor that authors the defaults change of every schema. Its
/// entries never appear in externally visible clocks.
pub const PHANTOM_ACTOR: &str = "0000000000";

/// Namespace for deriving synthetic object ids during patch conversion, so
/// every peer computes the same id for the same synthesized object.
pub const OBJ_ID_NAMESPACE: Uuid = Uuid::from_u128(0xf1bb7a0b_2d26_48ca_aaa3_92c63bbb5c50);

/// Identifies the author of a change.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn phantom() -> Self {
        Self(PHANTOM_ACTOR.into())
    }

    pub fn is_phantom(&self) -> bool {
        self.0 == PHANTOM_ACTOR
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActorId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies an object (map or list) inside the document. The root object
/// is the nil uuid.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjId(String);

impl ObjId {
    pub fn root() -> Self {
        Self(Uuid::nil().to_string())
    }

    pub fn is_root(&self) -> bool {
        self.0 == Uuid::nil().to_string()
    }

    /// Derives the deterministic id of an object synthesized while
    /// converting the `patch_index`th fragment of the `op_index`th op of
    /// `(actor, seq)`.
    pub fn derive(actor: &ActorId, seq: u64, op_index: usize, patch_index: usize) -> Self {
        let name = format!("{}:{}:{}:{}", actor, seq, op_index, patch_index);
        Self(Uuid::new_v5(&OBJ_ID_NAMESPACE, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ObjId {
    fn from(id: &str) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ObjId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Labels a list element with the actor that inserted it and the actor's
/// element counter at insertion time. `_head` is the position before the
/// first element.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum ElemId {
    Head,
    Elem(ActorId, u64),
}

impl ElemId {
    pub fn parse(s: &str) -> Option<Self> {
        if s == "_head" {
            return Some(Self::Head);
        }
        let (actor, counter) = s.rsplit_once(':')?;
        let counter = counter.parse().ok()?;
        Some(Self::Elem(ActorId::new(actor), counter))
    }

    pub fn counter(&self) -> Option<u64> {
        match self {
            Self::Head => None,
            Self::Elem(_, counter) => Some(*counter),
        }
    }
}

impl Ord for ElemId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Head, Self::Head) => Ordering::Equal,
            (Self::Head, Self::Elem(..)) => Ordering::Less,
            (Self::Elem(..), Self::Head) => Ordering::Greater,
            // lamport order: counter first, actor breaks ties
            (Self::Elem(a1, c1), Self::Elem(a2, c2)) => c1.cmp(c2).then_with(|| a1.cmp(a2)),
        }
    }
}

impl PartialOrd for ElemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ElemId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Head => f.write_str("_head"),
            Self::Elem(actor, counter) => write!(f, "{}:{}", actor, counter),
        }
    }
}

impl Serialize for ElemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ElemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid element id {}", s)))
    }
}

/// A map key or the string form of an [`ElemId`], depending on the parent
/// object's type.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn head() -> Self {
        Self::from(&ElemId::Head)
    }

    pub fn elem(actor: &ActorId, counter: u64) -> Self {
        Self::from(&ElemId::Elem(actor.clone(), counter))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_elem(&self) -> Option<ElemId> {
        ElemId::parse(&self.0)
    }
}

impl From<&ElemId> for Key {
    fn from(elem: &ElemId) -> Self {
        Self(elem.to_string())
    }
}

impl From<&str> for Key {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elem_id_round_trip() {
        let elem = ElemId::Elem(ActorId::new("a1"), 7);
        assert_eq!(ElemId::parse(&elem.to_string()), Some(elem));
        assert_eq!(ElemId::parse("_head"), Some(ElemId::Head));
        assert_eq!(ElemId::parse("noelem"), None);
    }

    #[test]
    fn elem_id_order_is_lamport() {
        let a = ElemId::Elem(ActorId::new("b"), 1);
        let b = ElemId::Elem(ActorId::new("a"), 2);
        assert!(a < b);
        assert!(ElemId::Head < a);
    }

    #[test]
    fn derived_obj_ids_are_stable() {
        let actor = ActorId::new("actor-a");
        let a = ObjId::derive(&actor, 1, 0, 0);
        let b = ObjId::derive(&actor, 1, 0, 0);
        let c = ObjId::derive(&actor, 1, 0, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
