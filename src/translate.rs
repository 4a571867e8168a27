//! Translation between single ops and JSON patch fragments, in both
//! directions, plus the canonical op ordering the converter relies on.
use crate::change::{Change, Op, ScalarValue};
use crate::error::Error;
use crate::id::{ActorId, ElemId, Key, ObjId};
use crate::patch::{split_last, ObjType, PatchOp};
use crate::resolver::Resolver;
use crate::shadow::Shadow;
use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Per-change cache of insertion placeholders, keyed by the element id they
/// will reify, so assignments created earlier in the same change resolve.
pub type ElemCache = HashMap<Key, Op>;

/// Permutes a change's ops so every insertion placeholder is immediately
/// followed by its reifying op(s): the `set` or `link` keyed by the
/// inserted element, with the linked object's `make*` slotted between.
/// `make*` ops keyed into maps are followed immediately by their `link`.
/// Stable elsewhere. A placeholder without a reifier is a fatal
/// inconsistency.
pub fn sort_ops(change: &Change) -> Result<Vec<Op>> {
    let ops = &change.ops;
    let mut used = vec![false; ops.len()];
    let mut out = Vec::with_capacity(ops.len());
    for i in 0..ops.len() {
        if used[i] {
            continue;
        }
        match &ops[i] {
            Op::Ins { elem, .. } => {
                used[i] = true;
                out.push(ops[i].clone());
                let reifier_key = Key::elem(&change.actor, *elem);
                let j = (0..ops.len())
                    .find(|&j| {
                        !used[j]
                            && matches!(ops[j], Op::Set { .. } | Op::Link { .. })
                            && ops[j].key() == Some(&reifier_key)
                    })
                    .ok_or_else(|| {
                        Error::OpShape(format!("no reifier for insertion {}", reifier_key))
                    })?;
                if let Op::Link { value, .. } = &ops[j] {
                    if let Some(k) = (0..ops.len()).find(|&k| {
                        !used[k]
                            && matches!(&ops[k], Op::MakeMap { obj } | Op::MakeList { obj } if obj == value)
                    }) {
                        used[k] = true;
                        out.push(ops[k].clone());
                    }
                }
                used[j] = true;
                out.push(ops[j].clone());
            }
            Op::MakeMap { obj } | Op::MakeList { obj } => {
                used[i] = true;
                out.push(ops[i].clone());
                if let Some(j) = (0..ops.len()).find(|&j| {
                    !used[j] && matches!(&ops[j], Op::Link { value, .. } if value == obj)
                }) {
                    // an elem-keyed link whose placeholder hasn't been
                    // emitted yet is pulled by its ins instead
                    let pending_ins = ops[j].key().and_then(Key::as_elem).map_or(false, |elem| {
                        (0..ops.len()).any(|k| {
                            !used[k]
                                && matches!(ops[k], Op::Ins { elem: e, .. }
                                    if ElemId::Elem(change.actor.clone(), e) == elem)
                        })
                    });
                    if !pending_ins {
                        used[j] = true;
                        out.push(ops[j].clone());
                    }
                }
            }
            op @ (Op::Set { .. } | Op::Link { .. }) => {
                // a reifier whose placeholder or make* is still pending is
                // pulled into place by that op's branch instead
                let pending_ins = op.key().and_then(Key::as_elem).map_or(false, |elem| {
                    (0..ops.len()).any(|k| {
                        !used[k]
                            && matches!(ops[k], Op::Ins { elem: e, .. }
                                if ElemId::Elem(change.actor.clone(), e) == elem)
                    })
                });
                let pending_make = matches!(op, Op::Link { value, .. } if (0..ops.len()).any(|k| {
                    !used[k]
                        && matches!(&ops[k], Op::MakeMap { obj } | Op::MakeList { obj } if obj == value)
                }));
                if pending_ins || pending_make {
                    continue;
                }
                used[i] = true;
                out.push(ops[i].clone());
            }
            Op::Del { .. } => {
                used[i] = true;
                out.push(ops[i].clone());
            }
        }
    }
    if out.len() != ops.len() {
        return Err(Error::OpShape("change contains unpaired reifiers".into()).into());
    }
    Ok(out)
}

enum Site {
    Add(String),
    Replace(String),
}

fn assign_site(
    resolver: &Resolver,
    obj: &ObjId,
    key: &Key,
    cache: &ElemCache,
) -> Result<Site> {
    let parent = resolver
        .path_of(obj)
        .ok_or_else(|| Error::PathResolution(format!("no path to object {}", obj)))?;
    let kind = resolver
        .obj_type(obj)
        .ok_or_else(|| Error::PathResolution(format!("unknown object {}", obj)))?;
    match kind {
        ObjType::Map => {
            let path = format!("{}/{}", parent, key);
            if resolver.key_present(obj, key) {
                Ok(Site::Replace(path))
            } else {
                Ok(Site::Add(path))
            }
        }
        ObjType::List => {
            if let Some(ins) = cache.get(key) {
                // the key names a placeholder from this same change, so
                // this assignment is an insert after the placeholder's
                // anchor
                let anchor = ins.key().and_then(Key::as_elem).ok_or_else(|| {
                    Error::OpShape(format!("insertion with invalid anchor: {:?}", ins))
                })?;
                let index = resolver.index_of_elem(obj, &anchor).ok_or_else(|| {
                    Error::PathResolution(format!("unknown anchor {} in {}", anchor, obj))
                })?;
                Ok(Site::Add(format!("{}/{}", parent, index + 1)))
            } else {
                let elem = key.as_elem().ok_or_else(|| {
                    Error::OpShape(format!("list assignment with map key {}", key))
                })?;
                let index = resolver.index_of_elem(obj, &elem).ok_or_else(|| {
                    Error::PathResolution(format!("unknown element {} in {}", elem, obj))
                })?;
                Ok(Site::Replace(format!("{}/{}", parent, index)))
            }
        }
    }
}

/// Translates one op of a change into the patch fragment it denotes in the
/// owning shadow's schema. `Ok(None)` means the op has no observable
/// effect (deleting something already gone) and is silently dropped.
/// Placeholders and `make*` ops never reach this function; the converter
/// pre-handles them.
pub fn op_to_patch(op: &Op, from: &Shadow, cache: &ElemCache) -> Result<Option<PatchOp>> {
    let resolver = Resolver::new(from);
    match op {
        Op::Set { obj, key, value } => {
            let value = value.to_json();
            Ok(Some(match assign_site(&resolver, obj, key, cache)? {
                Site::Add(path) => PatchOp::Add { path, value },
                Site::Replace(path) => PatchOp::Replace { path, value },
            }))
        }
        Op::Link { obj, key, value } => {
            let value = match resolver.obj_type(value) {
                Some(ObjType::Map) => json!({}),
                Some(ObjType::List) => json!([]),
                None => {
                    return Err(Error::PathResolution(format!(
                        "link to unknown object {}",
                        value
                    ))
                    .into())
                }
            };
            Ok(Some(match assign_site(&resolver, obj, key, cache)? {
                Site::Add(path) => PatchOp::Add { path, value },
                Site::Replace(path) => PatchOp::Replace { path, value },
            }))
        }
        Op::Del { obj, key } => {
            let parent = resolver
                .path_of(obj)
                .ok_or_else(|| Error::PathResolution(format!("no path to object {}", obj)))?;
            let kind = resolver
                .obj_type(obj)
                .ok_or_else(|| Error::PathResolution(format!("unknown object {}", obj)))?;
            if !resolver.key_present(obj, key) {
                // deleting something already gone has no observable effect
                return Ok(None);
            }
            let path = match kind {
                ObjType::Map => format!("{}/{}", parent, key),
                ObjType::List => {
                    let elem = key.as_elem().ok_or_else(|| {
                        Error::OpShape(format!("list deletion with map key {}", key))
                    })?;
                    let index = resolver.index_of_elem(obj, &elem).ok_or_else(|| {
                        Error::PathResolution(format!("unknown element {} in {}", elem, obj))
                    })?;
                    format!("{}/{}", parent, index)
                }
            };
            Ok(Some(PatchOp::Remove { path }))
        }
        op => Err(Error::OpShape(format!("op cannot be translated directly: {:?}", op)).into()),
    }
}

enum Payload {
    Scalar(ScalarValue),
    Map,
    List,
}

fn classify(value: &Value) -> Result<Payload> {
    match value {
        Value::Object(map) if map.is_empty() => Ok(Payload::Map),
        Value::Array(items) if items.is_empty() => Ok(Payload::List),
        Value::Object(_) | Value::Array(_) => Err(Error::OpShape(format!(
            "patch value must be a scalar or an empty collection: {}",
            value
        ))
        .into()),
        scalar => ScalarValue::from_json(scalar)
            .map(Payload::Scalar)
            .ok_or_else(|| Error::OpShape(format!("unrepresentable value {}", scalar)).into()),
    }
}

/// Resolution state local to one patch conversion: paths of objects this
/// patch created, and the element layout of every list it touched.
#[derive(Default)]
struct PathCache {
    objs: HashMap<String, (ObjId, ObjType)>,
    lists: HashMap<ObjId, Vec<ElemId>>,
}

impl PathCache {
    fn resolve(&mut self, path: &str, to: &Shadow) -> Option<(ObjId, ObjType)> {
        if path.is_empty() {
            return Some((ObjId::root(), ObjType::Map));
        }
        if let Some(hit) = self.objs.get(path) {
            return Some(hit.clone());
        }
        let resolver = Resolver::new(to);
        let id = resolver.obj_id_of(path)?;
        let kind = resolver.obj_type(&id)?;
        self.objs.insert(path.to_string(), (id.clone(), kind));
        Some((id, kind))
    }

    fn created(&mut self, path: &str, id: ObjId, kind: ObjType) {
        if kind == ObjType::List {
            self.lists.insert(id.clone(), Vec::new());
        }
        self.objs.insert(path.to_string(), (id, kind));
    }

    fn seed_list(&mut self, obj: &ObjId, to: &Shadow) {
        if !self.lists.contains_key(obj) {
            let elems = to
                .state()
                .obj(obj)
                .map(|state| state.elem_ids())
                .unwrap_or_default();
            self.lists.insert(obj.clone(), elems);
        }
    }

    fn elem_at(&mut self, obj: &ObjId, index: i64, to: &Shadow) -> Option<ElemId> {
        if index < 0 {
            return None;
        }
        self.seed_list(obj, to);
        self.lists.get(obj)?.get(index as usize).cloned()
    }

    fn inserted(&mut self, obj: &ObjId, index: i64, elem: ElemId, to: &Shadow) {
        self.seed_list(obj, to);
        if let Some(elems) = self.lists.get_mut(obj) {
            let index = (index.max(0) as usize).min(elems.len());
            elems.insert(index, elem);
        }
    }

    fn removed(&mut self, obj: &ObjId, index: i64, to: &Shadow) {
        self.seed_list(obj, to);
        if let Some(elems) = self.lists.get_mut(obj) {
            if index >= 0 && (index as usize) < elems.len() {
                elems.remove(index as usize);
            }
        }
    }
}

/// Converts a lensed patch fragment back into an ordered op list for the
/// target shadow. Synthesized objects get ids derived from
/// `(actor, seq, op_index, patch_index)`; synthesized insertions take the
/// writer's element counter when it is still fresh in the target shadow
/// and inflate past the shadow's counter otherwise. A list `replace` or
/// `remove` at an index the target never materialized drops silently.
pub fn patch_to_ops(
    patch: &[PatchOp],
    actor: &ActorId,
    seq: u64,
    op_index: usize,
    origin_key: Option<&Key>,
    to: &mut Shadow,
) -> Result<Vec<Op>> {
    let mut cache = PathCache::default();
    let mut ops = Vec::new();
    for (patch_index, pop) in patch.iter().enumerate() {
        let (parent_path, segment) = split_last(pop.path()).ok_or_else(|| {
            Error::OpShape(format!("patch op without a target path: {:?}", pop))
        })?;
        let (parent, kind) = cache.resolve(parent_path, to).ok_or_else(|| {
            Error::PathResolution(format!("no object at {:?}", parent_path))
        })?;
        match kind {
            ObjType::Map => {
                let key = Key::from(segment);
                match pop {
                    PatchOp::Remove { .. } => ops.push(Op::Del { obj: parent, key }),
                    PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                        match classify(value)? {
                            Payload::Scalar(value) => ops.push(Op::Set {
                                obj: parent,
                                key,
                                value,
                            }),
                            Payload::Map => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeMap { obj: new.clone() });
                                ops.push(Op::Link {
                                    obj: parent,
                                    key,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::Map);
                            }
                            Payload::List => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeList { obj: new.clone() });
                                ops.push(Op::Link {
                                    obj: parent,
                                    key,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::List);
                            }
                        }
                    }
                }
            }
            ObjType::List => {
                let index: i64 = segment.parse().map_err(|_| {
                    Error::OpShape(format!("list path with non-numeric index: {}", pop.path()))
                })?;
                match pop {
                    PatchOp::Add { value, .. } => {
                        let anchor = if index == 0 {
                            ElemId::Head
                        } else {
                            cache.elem_at(&parent, index - 1, to).ok_or_else(|| {
                                Error::PathResolution(format!(
                                    "no element before index {} of {}",
                                    index,
                                    pop.path()
                                ))
                            })?
                        };
                        // element-id inflation
                        let counter = origin_key
                            .and_then(Key::as_elem)
                            .and_then(|elem| elem.counter())
                            .unwrap_or(0);
                        let elem = counter.max(to.next_elem(actor));
                        to.record_elem(actor, elem);
                        let elem_id = ElemId::Elem(actor.clone(), elem);
                        let ekey = Key::from(&elem_id);
                        let ins = Op::Ins {
                            obj: parent.clone(),
                            key: Key::from(&anchor),
                            elem,
                        };
                        match classify(value)? {
                            Payload::Scalar(value) => {
                                ops.push(ins);
                                ops.push(Op::Set {
                                    obj: parent.clone(),
                                    key: ekey,
                                    value,
                                });
                            }
                            Payload::Map => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeMap { obj: new.clone() });
                                ops.push(ins);
                                ops.push(Op::Link {
                                    obj: parent.clone(),
                                    key: ekey,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::Map);
                            }
                            Payload::List => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeList { obj: new.clone() });
                                ops.push(ins);
                                ops.push(Op::Link {
                                    obj: parent.clone(),
                                    key: ekey,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::List);
                            }
                        }
                        cache.inserted(&parent, index, elem_id, to);
                    }
                    PatchOp::Replace { value, .. } => {
                        let Some(elem) = cache.elem_at(&parent, index, to) else {
                            tracing::debug!(path = pop.path(), "dropping list replace at missing index");
                            continue;
                        };
                        let ekey = Key::from(&elem);
                        match classify(value)? {
                            Payload::Scalar(value) => ops.push(Op::Set {
                                obj: parent.clone(),
                                key: ekey,
                                value,
                            }),
                            Payload::Map => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeMap { obj: new.clone() });
                                ops.push(Op::Link {
                                    obj: parent.clone(),
                                    key: ekey,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::Map);
                            }
                            Payload::List => {
                                let new = ObjId::derive(actor, seq, op_index, patch_index);
                                ops.push(Op::MakeList { obj: new.clone() });
                                ops.push(Op::Link {
                                    obj: parent.clone(),
                                    key: ekey,
                                    value: new.clone(),
                                });
                                cache.created(pop.path(), new, ObjType::List);
                            }
                        }
                    }
                    PatchOp::Remove { .. } => {
                        let Some(elem) = cache.elem_at(&parent, index, to) else {
                            tracing::debug!(path = pop.path(), "dropping list remove at missing index");
                            continue;
                        };
                        ops.push(Op::Del {
                            obj: parent.clone(),
                            key: Key::from(&elem),
                        });
                        cache.removed(&parent, index, to);
                    }
                }
            }
        }
    }
    Ok(ops)
}
