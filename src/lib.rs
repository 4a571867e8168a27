//! # lensmerge
//!
//! A schema-migrating wrapper around an op-based collaborative document
//! store. Peers that each view the same shared document through different
//! schema versions exchange changes safely: every incoming change is
//! rewritten, on the fly, from the schema its author used into the schema
//! the local reader uses, through a declarative bidirectional lens
//! language.
//!
//! ## Blocks and lenses
//! History is exchanged as [`Block`]s: a CRDT change paired with the name
//! of the schema its author wrote under, plus any lens registrations the
//! author believes its peers still need. Schemas are nodes of a
//! [`LensGraph`] rooted at the empty schema `mu`; each edge carries a lens
//! chain and its structural reverse, so any two connected schemas can be
//! composed in either direction.
//!
//! ## The translation pipeline
//! A change authored under another schema is rewritten one op at a time:
//! the op becomes a JSON patch fragment against a *shadow* reconstruction
//! of the author's document, the fragment runs through the composed lens
//! chain, and the result is reassembled into ops against the reader's
//! shadow. Insertion placeholders, deterministic synthetic object ids and
//! per-shadow element counters keep the rewritten ops convergent across
//! peers.
//!
//! ## Bootstrap
//! Every schema's defaults are materialized exactly once per shadow as a
//! synthetic change by a reserved phantom actor, which every peer computes
//! identically and which never leaks into externally visible clocks.
//!
//! ```
//! use lensmerge::{materialize, Engine, Lens, LensReg, Schema};
//!
//! let lenses = vec![LensReg::new(
//!     "mu",
//!     "project-v1",
//!     vec![
//!         Lens::add("name", Schema::text()),
//!         Lens::add("summary", Schema::text()),
//!     ],
//! )];
//! let mut engine = Engine::init("project-v1", lenses)?;
//! let patch = engine.get_patch()?;
//! assert_eq!(
//!     materialize(&patch.diffs)?,
//!     serde_json::json!({"name": "", "summary": ""})
//! );
//! # Ok::<(), anyhow::Error>(())
//! ```
mod backend;
mod change;
mod clock;
mod convert;
mod engine;
mod error;
mod graph;
mod id;
mod lens;
mod patch;
#[cfg(any(test, feature = "proptest"))]
pub mod props;
mod resolver;
mod schema;
mod shadow;
mod translate;

pub use crate::backend::{ObjState, OpSet, StoredOp};
pub use crate::change::{Block, Change, Op, ScalarValue};
pub use crate::clock::Clock;
pub use crate::convert::convert_change;
pub use crate::engine::Engine;
pub use crate::error::Error;
pub use crate::graph::{LensGraph, LensReg, MU};
pub use crate::id::{ActorId, ElemId, Key, ObjId, OBJ_ID_NAMESPACE, PHANTOM_ACTOR};
pub use crate::lens::{reverse_chain, transform_patch, Lens};
pub use crate::patch::{materialize, Diff, DiffAction, ObjType, Patch, PatchOp};
pub use crate::resolver::Resolver;
pub use crate::schema::{Prop, Schema};
pub use crate::shadow::Shadow;
pub use crate::translate::{op_to_patch, patch_to_ops, sort_ops, ElemCache};
