use crate::id::{ElemId, Key, ObjId};
use crate::change::Op;
use crate::patch::ObjType;
use crate::shadow::Shadow;

/// Read-only translation between object ids and JSON pointer paths over
/// one shadow's backend state. List segments are the element's visible
/// index at lookup time, so callers are responsible for the order of
/// lookups relative to mutation.
pub struct Resolver<'a> {
    shadow: &'a Shadow,
}

impl<'a> Resolver<'a> {
    pub fn new(shadow: &'a Shadow) -> Self {
        Self { shadow }
    }

    /// The shape an object was created with.
    pub fn obj_type(&self, id: &ObjId) -> Option<ObjType> {
        Some(self.shadow.state().obj(id)?.kind())
    }

    /// The path of an object, by walking its inbound links up to the root.
    /// `None` if the object is unreachable.
    pub fn path_of(&self, id: &ObjId) -> Option<String> {
        let mut segments = Vec::new();
        let mut cursor = id.clone();
        while !cursor.is_root() {
            let (parent, key) = self.shadow.state().obj(&cursor)?.inbound()?.clone();
            let parent_state = self.shadow.state().obj(&parent)?;
            match parent_state.kind() {
                ObjType::Map => segments.push(key.to_string()),
                ObjType::List => {
                    let index = parent_state.index_of(&key.as_elem()?)?;
                    if index < 0 {
                        return None;
                    }
                    segments.push(index.to_string());
                }
            }
            cursor = parent;
        }
        segments.reverse();
        if segments.is_empty() {
            Some(String::new())
        } else {
            Some(format!("/{}", segments.join("/")))
        }
    }

    /// The object at a path, by descending from the root. At list parents
    /// the segment is a decimal index translated through the element ids.
    pub fn obj_id_of(&self, path: &str) -> Option<ObjId> {
        let mut cursor = ObjId::root();
        if path.is_empty() {
            return Some(cursor);
        }
        for segment in path.strip_prefix('/')?.split('/') {
            let state = self.shadow.state().obj(&cursor)?;
            let key = match state.kind() {
                ObjType::Map => Key::from(segment),
                ObjType::List => {
                    let index: i64 = segment.parse().ok()?;
                    Key::from(&state.elem_at(index)?)
                }
            };
            match &state.winner(&key)?.op {
                Op::Link { value, .. } => cursor = value.clone(),
                _ => return None,
            }
        }
        Some(cursor)
    }

    /// The visible index of an element in a list object; `_head` is -1.
    pub fn index_of_elem(&self, obj: &ObjId, elem: &ElemId) -> Option<i64> {
        self.shadow.state().obj(obj)?.index_of(elem)
    }

    /// The element at a visible index of a list object; -1 is `_head`.
    pub fn elem_of_index(&self, obj: &ObjId, index: i64) -> Option<ElemId> {
        self.shadow.state().obj(obj)?.elem_at(index)
    }

    /// Whether a map key currently has an active assignment.
    pub fn key_present(&self, obj: &ObjId, key: &Key) -> bool {
        self.shadow
            .state()
            .obj(obj)
            .and_then(|state| state.winner(key))
            .is_some()
    }
}
