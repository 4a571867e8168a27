use crate::backend::OpSet;
use crate::change::{Change, Op};
use crate::clock::Clock;
use crate::id::ActorId;
use crate::patch::Patch;
use anyhow::Result;
use std::collections::BTreeMap;

/// A per-schema view of the document: the backend state that results from
/// applying (possibly synthetic) changes under one schema, plus the
/// bookkeeping that keeps translation into and out of that schema correct.
#[derive(Clone, Debug)]
pub struct Shadow {
    schema: String,
    state: OpSet,
    clock: Clock,
    deps: Clock,
    elem: BTreeMap<ActorId, u64>,
    bootstrapped: bool,
}

impl Shadow {
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            state: OpSet::init(),
            clock: Clock::new(),
            deps: Clock::new(),
            elem: BTreeMap::new(),
            bootstrapped: false,
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn state(&self) -> &OpSet {
        &self.state
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn deps(&self) -> &Clock {
        &self.deps
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    pub(crate) fn set_bootstrapped(&mut self) {
        self.bootstrapped = true;
    }

    /// The highest element counter seen or synthesized for an actor in
    /// this shadow. Per shadow, not global: the same `(actor, elem)` may
    /// name different elements under different schemas.
    pub fn elem(&self, actor: &ActorId) -> u64 {
        self.elem.get(actor).copied().unwrap_or_default()
    }

    /// The next free element counter for an actor.
    pub fn next_elem(&self, actor: &ActorId) -> u64 {
        self.elem(actor) + 1
    }

    /// Raises the recorded counter; never lowers it.
    pub(crate) fn record_elem(&mut self, actor: &ActorId, elem: u64) {
        let counter = self.elem.entry(actor.clone()).or_default();
        if elem > *counter {
            *counter = elem;
        }
    }

    /// Applies changes through the backend and folds the clock, dependency
    /// frontier and element counters.
    pub fn apply_changes(&mut self, changes: Vec<Change>) -> Result<Patch> {
        for change in &changes {
            for op in &change.ops {
                if let Op::Ins { elem, .. } = op {
                    self.record_elem(&change.actor, *elem);
                }
            }
        }
        let diffs = self.state.apply_changes(changes)?;
        self.clock = self.state.clock().clone();
        self.deps = self.state.deps().clone();
        Ok(Patch {
            clock: self.clock.clone(),
            deps: self.deps.clone(),
            diffs,
        })
    }

    /// Applies a locally generated change.
    pub fn apply_local_change(&mut self, change: Change) -> Result<Patch> {
        for op in &change.ops {
            if let Op::Ins { elem, .. } = op {
                self.record_elem(&change.actor, *elem);
            }
        }
        let diffs = self.state.apply_local_change(change)?;
        self.clock = self.state.clock().clone();
        self.deps = self.state.deps().clone();
        Ok(Patch {
            clock: self.clock.clone(),
            deps: self.deps.clone(),
            diffs,
        })
    }

    /// Applies ops to this shadow without recording a change, used on the
    /// clones the converter walks alongside a change.
    pub(crate) fn stage(
        &mut self,
        actor: &ActorId,
        seq: u64,
        deps: &Clock,
        ops: &[Op],
    ) -> Result<()> {
        for op in ops {
            if let Op::Ins { elem, .. } = op {
                self.record_elem(actor, *elem);
            }
        }
        self.state.stage_ops(actor, seq, deps, ops)
    }
}
