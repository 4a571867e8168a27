//! A minimal op-set backend for the op-based document protocol.
//!
//! It maintains, per object id, the set of concurrent operations seen for
//! each key, plus the insertion tree that orders list elements. Changes
//! queue until causally ready; applying one resolves each op against the
//! operations already stored and emits the diffs a frontend needs to keep
//! its materialized view current. Reading the whole state re-walks the
//! object tree from the root, which is not fast and not meant to be.
use crate::clock::Clock;
use crate::error::Error;
use crate::id::{ActorId, ElemId, Key, ObjId};
use crate::change::{Change, Op};
use crate::patch::{Diff, DiffAction, ObjType, Patch};
use anyhow::Result;
use fnv::{FnvHashMap, FnvHashSet};
use serde_json::{json, Value};

/// An op copied out of its change together with the actor and sequence it
/// arrived under, which concurrency resolution needs.
#[derive(Clone, Debug)]
pub struct StoredOp {
    pub actor: ActorId,
    pub seq: u64,
    pub op: Op,
}

impl StoredOp {
    fn diff_value(&self) -> Result<(Value, bool)> {
        match &self.op {
            Op::Set { value, .. } => Ok((value.to_json(), false)),
            Op::Link { value, .. } => Ok((json!(value.as_str()), true)),
            op => Err(Error::OpShape(format!("stored op is not an assignment: {:?}", op)).into()),
        }
    }
}

/// Everything known about one object: its creation record, the concurrent
/// assignments per key, the list insertion tree, and the link pointing at
/// it from its parent.
#[derive(Clone, Debug)]
pub struct ObjState {
    kind: ObjType,
    keys: FnvHashMap<Key, Vec<StoredOp>>,
    following: FnvHashMap<ElemId, Vec<ElemId>>,
    inserted: FnvHashSet<ElemId>,
    inbound: Option<(ObjId, Key)>,
}

impl ObjState {
    fn new(kind: ObjType) -> Self {
        Self {
            kind,
            keys: FnvHashMap::default(),
            following: FnvHashMap::default(),
            inserted: FnvHashSet::default(),
            inbound: None,
        }
    }

    pub fn kind(&self) -> ObjType {
        self.kind
    }

    /// The link `(parent, key)` under which this object hangs.
    pub fn inbound(&self) -> Option<&(ObjId, Key)> {
        self.inbound.as_ref()
    }

    /// The active assignment for a key; concurrent ops are kept sorted so
    /// the first one wins everywhere.
    pub fn winner(&self, key: &Key) -> Option<&StoredOp> {
        self.keys.get(key).and_then(|ops| ops.first())
    }

    fn incorporate(&mut self, key: Key, new: Option<StoredOp>, tclock: &Clock) {
        let ops = self.keys.entry(key).or_default();
        // everything causally before the incoming change is superseded
        ops.retain(|op| op.seq > tclock.get(&op.actor));
        if let Some(new) = new {
            ops.push(new);
        }
        ops.sort_by(|a, b| b.seq.cmp(&a.seq).then_with(|| b.actor.cmp(&a.actor)));
    }

    fn visible_elem(&self, elem: &ElemId) -> bool {
        self.keys
            .get(&Key::from(elem))
            .map_or(false, |ops| !ops.is_empty())
    }

    fn walk_elems(&self, anchor: &ElemId, out: &mut Vec<ElemId>) {
        if let Some(children) = self.following.get(anchor) {
            let mut children = children.clone();
            children.sort_by(|a, b| b.cmp(a));
            for child in children {
                out.push(child.clone());
                self.walk_elems(&child, out);
            }
        }
    }

    /// Every inserted element in document order, visible or not.
    fn ordered_elems(&self) -> Vec<ElemId> {
        let mut out = Vec::new();
        self.walk_elems(&ElemId::Head, &mut out);
        out
    }

    /// The visible elements in document order; the `_elemIds` sequence.
    pub fn elem_ids(&self) -> Vec<ElemId> {
        self.ordered_elems()
            .into_iter()
            .filter(|elem| self.visible_elem(elem))
            .collect()
    }

    /// The visible index of an element; `_head` is -1. An invisible
    /// element resolves to the index of the last visible element at or
    /// before it.
    pub fn index_of(&self, elem: &ElemId) -> Option<i64> {
        if *elem == ElemId::Head {
            return Some(-1);
        }
        let mut index = -1i64;
        for e in self.ordered_elems() {
            if self.visible_elem(&e) {
                index += 1;
            }
            if e == *elem {
                return Some(index);
            }
        }
        None
    }

    /// The element at a visible index; -1 is `_head`.
    pub fn elem_at(&self, index: i64) -> Option<ElemId> {
        if index == -1 {
            return Some(ElemId::Head);
        }
        if index < 0 {
            return None;
        }
        self.elem_ids().into_iter().nth(index as usize)
    }
}

/// The backend state: object tables plus causal bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct OpSet {
    objects: FnvHashMap<ObjId, ObjState>,
    // transitive dependency clock of each applied change, per actor, dense
    // in seq
    states: FnvHashMap<ActorId, Vec<Clock>>,
    queue: Vec<Change>,
    clock: Clock,
    deps: Clock,
}

impl OpSet {
    /// A fresh state containing only the root map.
    pub fn init() -> Self {
        let mut objects = FnvHashMap::default();
        objects.insert(ObjId::root(), ObjState::new(ObjType::Map));
        Self {
            objects,
            ..Default::default()
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn deps(&self) -> &Clock {
        &self.deps
    }

    pub fn obj(&self, id: &ObjId) -> Option<&ObjState> {
        self.objects.get(id)
    }

    /// Queues the changes and applies every causally ready one, returning
    /// the diffs in application order.
    pub fn apply_changes(&mut self, changes: Vec<Change>) -> Result<Vec<Diff>> {
        self.queue.extend(changes);
        let mut diffs = Vec::new();
        while let Some(change) = self.pop_ready() {
            self.apply_change(change, &mut diffs)?;
        }
        Ok(diffs)
    }

    /// Applies a locally generated change, which must be in sequence and
    /// have its dependencies satisfied.
    pub fn apply_local_change(&mut self, change: Change) -> Result<Vec<Diff>> {
        if change.seq != self.clock.get(&change.actor) + 1 {
            return Err(Error::OpShape(format!(
                "out of order local change {}:{}",
                change.actor, change.seq
            ))
            .into());
        }
        if !change.deps.le(&self.clock) {
            return Err(Error::OpShape("local change with unmet dependencies".into()).into());
        }
        let mut diffs = Vec::new();
        self.apply_change(change, &mut diffs)?;
        let unblocked = self.apply_changes(Vec::new())?;
        diffs.extend(unblocked);
        Ok(diffs)
    }

    /// Applies ops under a change's identity without recording the change,
    /// used on throwaway clones during conversion.
    pub(crate) fn stage_ops(
        &mut self,
        actor: &ActorId,
        seq: u64,
        deps: &Clock,
        ops: &[Op],
    ) -> Result<()> {
        let mut tclock = self.transitive(actor, seq, deps);
        tclock.set(actor.clone(), seq);
        let mut scratch = Vec::new();
        for op in ops {
            self.apply_op(actor, seq, &tclock, op, &mut scratch)?;
        }
        Ok(())
    }

    /// The frontier of changes the queue is waiting for.
    pub fn missing_deps(&self) -> Clock {
        let mut missing = Clock::new();
        for change in &self.queue {
            let mut need = change.deps.clone();
            if change.seq > 1 {
                need.set(change.actor.clone(), change.seq - 1);
            }
            for (actor, seq) in need.iter() {
                if self.clock.get(actor) < seq {
                    missing.set(actor.clone(), seq);
                }
            }
        }
        missing
    }

    /// Re-walks the whole document into a full-state patch.
    pub fn get_patch(&self) -> Result<Patch> {
        let mut diffs = Vec::new();
        self.walk(&ObjId::root(), &mut diffs)?;
        Ok(Patch {
            clock: self.clock.clone(),
            deps: self.deps.clone(),
            diffs,
        })
    }

    fn pop_ready(&mut self) -> Option<Change> {
        let pos = self.queue.iter().position(|change| {
            change.seq <= self.clock.get(&change.actor) + 1 && change.deps.le(&self.clock)
        })?;
        Some(self.queue.remove(pos))
    }

    /// The transitive dependency clock of a change: its direct deps, the
    /// previous change of its actor, and everything those imply.
    fn transitive(&self, actor: &ActorId, seq: u64, deps: &Clock) -> Clock {
        let mut tclock = deps.clone();
        if seq > 1 {
            tclock.set(actor.clone(), seq - 1);
        }
        let direct: Vec<(ActorId, u64)> = tclock.iter().map(|(a, s)| (a.clone(), s)).collect();
        for (actor, seq) in direct {
            if let Some(clocks) = self.states.get(&actor) {
                if seq >= 1 && seq as usize <= clocks.len() {
                    tclock.union(&clocks[seq as usize - 1]);
                }
            }
        }
        tclock
    }

    fn apply_change(&mut self, change: Change, diffs: &mut Vec<Diff>) -> Result<()> {
        if self.clock.contains(&change.actor, change.seq) {
            tracing::debug!(actor = %change.actor, seq = change.seq, "skipping duplicate change");
            return Ok(());
        }
        let mut tclock = self.transitive(&change.actor, change.seq, &change.deps);
        tclock.set(change.actor.clone(), change.seq);
        self.states
            .entry(change.actor.clone())
            .or_default()
            .push(tclock.clone());
        for op in &change.ops {
            self.apply_op(&change.actor, change.seq, &tclock, op, diffs)?;
        }
        self.clock.set(change.actor.clone(), change.seq);
        let superseded: Vec<ActorId> = change
            .deps
            .iter()
            .filter(|(actor, seq)| self.deps.get(actor) <= *seq)
            .map(|(actor, _)| actor.clone())
            .collect();
        for actor in superseded {
            self.deps.remove(&actor);
        }
        self.deps.set(change.actor, change.seq);
        Ok(())
    }

    fn apply_op(
        &mut self,
        actor: &ActorId,
        seq: u64,
        tclock: &Clock,
        op: &Op,
        diffs: &mut Vec<Diff>,
    ) -> Result<()> {
        match op {
            Op::MakeMap { obj } => {
                self.objects.insert(obj.clone(), ObjState::new(ObjType::Map));
                diffs.push(Diff::create(obj.clone(), ObjType::Map));
            }
            Op::MakeList { obj } => {
                self.objects.insert(obj.clone(), ObjState::new(ObjType::List));
                diffs.push(Diff::create(obj.clone(), ObjType::List));
            }
            Op::Ins { obj, key, elem } => {
                let state = self
                    .objects
                    .get_mut(obj)
                    .ok_or_else(|| unknown_object(obj))?;
                if state.kind != ObjType::List {
                    return Err(Error::OpShape(format!("insert into map {}", obj)).into());
                }
                let anchor = key
                    .as_elem()
                    .ok_or_else(|| Error::OpShape(format!("insert after invalid key {}", key)))?;
                let elem_id = ElemId::Elem(actor.clone(), *elem);
                if !state.inserted.insert(elem_id.clone()) {
                    return Err(
                        Error::OpShape(format!("duplicate insertion of {}", elem_id)).into(),
                    );
                }
                state.following.entry(anchor).or_default().push(elem_id);
                // no diff: the placeholder is invisible until reified
            }
            Op::Set { obj, key, .. } => {
                let stored = StoredOp {
                    actor: actor.clone(),
                    seq,
                    op: op.clone(),
                };
                self.assign(obj, key, Some(stored), tclock, diffs)?;
            }
            Op::Link { obj, key, value } => {
                if !self.objects.contains_key(value) {
                    return Err(unknown_object(value).into());
                }
                let stored = StoredOp {
                    actor: actor.clone(),
                    seq,
                    op: op.clone(),
                };
                self.assign(obj, key, Some(stored), tclock, diffs)?;
                self.objects.get_mut(value).unwrap().inbound = Some((obj.clone(), key.clone()));
            }
            Op::Del { obj, key } => {
                self.assign(obj, key, None, tclock, diffs)?;
            }
        }
        Ok(())
    }

    fn assign(
        &mut self,
        obj: &ObjId,
        key: &Key,
        new: Option<StoredOp>,
        tclock: &Clock,
        diffs: &mut Vec<Diff>,
    ) -> Result<()> {
        let state = self
            .objects
            .get_mut(obj)
            .ok_or_else(|| unknown_object(obj))?;
        match state.kind {
            ObjType::Map => {
                let existed = state.winner(key).is_some();
                state.incorporate(key.clone(), new, tclock);
                match state.winner(key) {
                    Some(winner) => {
                        let (value, link) = winner.diff_value()?;
                        diffs.push(Diff {
                            action: DiffAction::Set,
                            obj: obj.clone(),
                            kind: ObjType::Map,
                            key: Some(key.clone()),
                            index: None,
                            elem_id: None,
                            value: Some(value),
                            link,
                        });
                    }
                    None if existed => diffs.push(Diff {
                        action: DiffAction::Remove,
                        obj: obj.clone(),
                        kind: ObjType::Map,
                        key: Some(key.clone()),
                        index: None,
                        elem_id: None,
                        value: None,
                        link: false,
                    }),
                    None => {}
                }
            }
            ObjType::List => {
                let elem = key.as_elem().ok_or_else(|| {
                    Error::OpShape(format!("list op without element id key {}", key))
                })?;
                if !state.inserted.contains(&elem) {
                    return Err(
                        Error::OpShape(format!("assignment to unknown element {}", elem)).into(),
                    );
                }
                let old_index = if state.visible_elem(&elem) {
                    state.index_of(&elem)
                } else {
                    None
                };
                state.incorporate(key.clone(), new, tclock);
                match (old_index, state.winner(key)) {
                    (None, Some(winner)) => {
                        let (value, link) = winner.diff_value()?;
                        let index = state.index_of(&elem).unwrap_or(0).max(0) as usize;
                        diffs.push(Diff {
                            action: DiffAction::Insert,
                            obj: obj.clone(),
                            kind: ObjType::List,
                            key: None,
                            index: Some(index),
                            elem_id: Some(elem),
                            value: Some(value),
                            link,
                        });
                    }
                    (Some(index), Some(winner)) => {
                        let (value, link) = winner.diff_value()?;
                        diffs.push(Diff {
                            action: DiffAction::Set,
                            obj: obj.clone(),
                            kind: ObjType::List,
                            key: None,
                            index: Some(index as usize),
                            elem_id: Some(elem),
                            value: Some(value),
                            link,
                        });
                    }
                    (Some(index), None) => diffs.push(Diff {
                        action: DiffAction::Remove,
                        obj: obj.clone(),
                        kind: ObjType::List,
                        key: None,
                        index: Some(index as usize),
                        elem_id: None,
                        value: None,
                        link: false,
                    }),
                    (None, None) => {}
                }
            }
        }
        Ok(())
    }

    fn walk(&self, obj: &ObjId, diffs: &mut Vec<Diff>) -> Result<()> {
        let state = self.obj(obj).ok_or_else(|| unknown_object(obj))?;
        match state.kind {
            ObjType::Map => {
                let mut keys: Vec<&Key> = state
                    .keys
                    .iter()
                    .filter(|(_, ops)| !ops.is_empty())
                    .map(|(key, _)| key)
                    .collect();
                keys.sort();
                for key in keys {
                    let winner = state.winner(key).unwrap();
                    let (value, link) = self.walk_value(winner, diffs)?;
                    diffs.push(Diff {
                        action: DiffAction::Set,
                        obj: obj.clone(),
                        kind: ObjType::Map,
                        key: Some(key.clone()),
                        index: None,
                        elem_id: None,
                        value: Some(value),
                        link,
                    });
                }
            }
            ObjType::List => {
                for (index, elem) in state.elem_ids().into_iter().enumerate() {
                    let winner = state.winner(&Key::from(&elem)).unwrap();
                    let (value, link) = self.walk_value(winner, diffs)?;
                    diffs.push(Diff {
                        action: DiffAction::Insert,
                        obj: obj.clone(),
                        kind: ObjType::List,
                        key: None,
                        index: Some(index),
                        elem_id: Some(elem),
                        value: Some(value),
                        link,
                    });
                }
            }
        }
        Ok(())
    }

    fn walk_value(&self, winner: &StoredOp, diffs: &mut Vec<Diff>) -> Result<(Value, bool)> {
        if let Op::Link { value: child, .. } = &winner.op {
            let kind = self
                .obj(child)
                .ok_or_else(|| unknown_object(child))?
                .kind();
            diffs.push(Diff::create(child.clone(), kind));
            self.walk(child, diffs)?;
        }
        winner.diff_value()
    }
}

fn unknown_object(obj: &ObjId) -> Error {
    Error::OpShape(format!("op references unknown object {}", obj))
}
