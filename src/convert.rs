//! Rewrites whole changes from the schema their author wrote under into the
//! schema a reader uses.
use crate::change::{Change, Op};
use crate::id::Key;
use crate::lens::{transform_patch, Lens};
use crate::shadow::Shadow;
use crate::translate::{op_to_patch, patch_to_ops, sort_ops, ElemCache};
use anyhow::Result;
use std::slice;

/// Converts one change through a lens chain. `from` is a shadow holding
/// exactly the history before this change in the author's schema, `to` the
/// reader's shadow at the same point; both are cloned so the canonical
/// instances stay untouched while later ops of the same change resolve
/// paths against the partially applied state.
pub fn convert_change(
    change: &Change,
    from: &Shadow,
    to: &Shadow,
    lenses: &[Lens],
) -> Result<Change> {
    let mut from = from.clone();
    let mut to = to.clone();
    let sorted = sort_ops(change)?;
    let mut cache = ElemCache::new();
    let mut out = Vec::with_capacity(sorted.len());
    for (index, op) in sorted.iter().enumerate() {
        match op {
            Op::Ins { elem, .. } => {
                // placeholders are not emitted; the reader side synthesizes
                // its own when the reifying assignment arrives
                cache.insert(Key::elem(&change.actor, *elem), op.clone());
                from.stage(&change.actor, change.seq, &change.deps, slice::from_ref(op))?;
            }
            Op::MakeMap { .. } | Op::MakeList { .. } => {
                // the eventual link causes the reader side to synthesize
                // its own make
                from.stage(&change.actor, change.seq, &change.deps, slice::from_ref(op))?;
            }
            op => {
                let translated = match op_to_patch(op, &from, &cache)? {
                    Some(patch_op) => transform_patch(lenses, vec![patch_op])?,
                    None => Vec::new(),
                };
                let new_ops = patch_to_ops(
                    &translated,
                    &change.actor,
                    change.seq,
                    index,
                    op.key(),
                    &mut to,
                )?;
                tracing::trace!(?op, emitted = new_ops.len(), "converted op");
                from.stage(&change.actor, change.seq, &change.deps, slice::from_ref(op))?;
                to.stage(&change.actor, change.seq, &change.deps, &new_ops)?;
                out.extend(new_ops);
            }
        }
    }
    Ok(Change {
        actor: change.actor.clone(),
        seq: change.seq,
        deps: change.deps.clone(),
        message: change.message.clone(),
        ops: out,
    })
}
