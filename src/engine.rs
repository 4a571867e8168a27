//! The history-replaying engine: the entry point to this crate.
use crate::change::{Block, Change};
use crate::clock::Clock;
use crate::convert::convert_change;
use crate::graph::{LensGraph, LensReg, MU};
use crate::id::ActorId;
use crate::lens::transform_patch;
use crate::patch::{Diff, Patch, PatchOp};
use crate::shadow::Shadow;
use crate::translate::patch_to_ops;
use anyhow::Result;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

/// Computes the synthetic defaults change of a schema: the universal
/// root-existence patch lensed from `mu`, with the root op dropped and the
/// remainder converted against an empty shadow. Every peer produces the
/// identical change because lens traversal and property enumeration are
/// deterministic.
pub(crate) fn bootstrap_change(graph: &LensGraph, schema: &str) -> Result<Change> {
    let lenses = graph.compose(MU, schema)?;
    let root = vec![PatchOp::Add {
        path: String::new(),
        value: json!({}),
    }];
    let mut patch = transform_patch(&lenses, root)?;
    if patch.first().map_or(false, |op| op.path().is_empty()) {
        patch.remove(0);
    }
    let mut shadow = Shadow::new(schema);
    let actor = ActorId::phantom();
    let ops = patch_to_ops(&patch, &actor, 1, 0, None, &mut shadow)?;
    Ok(Change {
        actor,
        seq: 1,
        deps: Clock::new(),
        message: None,
        ops,
    })
}

#[derive(Clone, Debug)]
struct CachedShadow {
    shadow: Shadow,
    synced: usize,
}

/// Owns the primary shadow (the reader's schema), one auxiliary shadow per
/// writer schema seen in history, the lens graph, and the ordered history
/// of received blocks. Incoming blocks authored under other schemas are
/// rewritten through the graph before they reach the primary shadow.
///
/// All operations on one engine must be serialized by the caller; nothing
/// here suspends or retries.
#[derive(Clone, Debug)]
pub struct Engine {
    schema: String,
    history: Vec<Block>,
    primary: Shadow,
    aux: BTreeMap<String, CachedShadow>,
    graph: LensGraph,
    in_doc: BTreeSet<String>,
}

impl Engine {
    /// Creates an engine reading through `schema`. Fails if the lens list
    /// doesn't connect `mu` to the schema.
    pub fn init(schema: impl Into<String>, lenses: Vec<LensReg>) -> Result<Self> {
        let schema = schema.into();
        let mut graph = LensGraph::new();
        for reg in lenses {
            graph.register(reg)?;
        }
        graph.compose(MU, &schema)?;
        Ok(Self {
            primary: Shadow::new(&schema),
            schema,
            history: Vec::new(),
            aux: BTreeMap::new(),
            graph,
            in_doc: BTreeSet::new(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The primary shadow, for frontends that resolve paths and element
    /// ids through a [`crate::Resolver`].
    pub fn shadow(&self) -> &Shadow {
        &self.primary
    }

    /// The primary clock without the phantom entry.
    pub fn clock(&self) -> Clock {
        let mut clock = self.primary.clock().clone();
        clock.remove(&ActorId::phantom());
        clock
    }

    fn ensure_bootstrap(&mut self, diffs: &mut Vec<Diff>) -> Result<()> {
        if self.primary.bootstrapped() {
            return Ok(());
        }
        let change = bootstrap_change(&self.graph, &self.schema)?;
        let patch = self.primary.apply_changes(vec![change])?;
        self.primary.set_bootstrapped();
        diffs.extend(patch.diffs);
        tracing::debug!(schema = %self.schema, "bootstrapped primary shadow");
        Ok(())
    }

    /// Folds received blocks into the engine. Blocks already covered by
    /// the primary clock are skipped; blocks authored under another schema
    /// are converted against a shadow replayed from the history prefix
    /// before them. Returns the combined patch.
    pub fn apply_blocks(&mut self, blocks: Vec<Block>) -> Result<Patch> {
        let mut diffs = Vec::new();
        self.ensure_bootstrap(&mut diffs)?;
        for block in blocks {
            if self.primary.clock().contains(&block.actor, block.seq)
                || self
                    .history
                    .iter()
                    .any(|b| b.actor == block.actor && b.seq == block.seq)
            {
                tracing::debug!(actor = %block.actor, seq = block.seq, "skipping duplicate block");
                continue;
            }
            for reg in &block.lenses {
                self.graph.merge(reg)?;
                self.in_doc.insert(reg.to.clone());
            }
            let position = self.history.len();
            self.history.push(block.clone());
            let change = if block.schema == self.schema {
                block.change
            } else {
                let from = self.shadow_at(&block.schema, position)?;
                let lenses = self.graph.compose(&block.schema, &self.schema)?;
                tracing::debug!(
                    from = %block.schema,
                    to = %self.schema,
                    actor = %block.actor,
                    seq = block.seq,
                    "converting block"
                );
                convert_change(&block.change, &from, &self.primary, &lenses)?
            };
            let patch = self.primary.apply_changes(vec![change])?;
            diffs.extend(patch.diffs);
        }
        Ok(Patch {
            clock: self.primary.clock().clone(),
            deps: self.primary.deps().clone(),
            diffs,
        }
        .scrub())
    }

    /// A shadow of `schema` containing exactly `history[..upto]`. The
    /// cached instance per schema is advanced when it is behind and left
    /// alone when it is ahead, in which case the prefix is replayed fresh.
    fn shadow_at(&mut self, schema: &str, upto: usize) -> Result<Shadow> {
        let (mut shadow, mut synced) = match self.aux.remove(schema) {
            Some(cached) if cached.synced <= upto => (cached.shadow, cached.synced),
            other => {
                if let Some(cached) = other {
                    self.aux.insert(schema.to_string(), cached);
                }
                let mut shadow = Shadow::new(schema);
                shadow.apply_changes(vec![bootstrap_change(&self.graph, schema)?])?;
                shadow.set_bootstrapped();
                (shadow, 0)
            }
        };
        while synced < upto {
            let block = self.history[synced].clone();
            let change = if block.schema == schema {
                block.change
            } else {
                let from = self.shadow_at(&block.schema, synced)?;
                let lenses = self.graph.compose(&block.schema, schema)?;
                convert_change(&block.change, &from, &shadow, &lenses)?
            };
            shadow.apply_changes(vec![change])?;
            synced += 1;
        }
        let keep = match self.aux.get(schema) {
            Some(cached) => cached.synced < synced,
            None => true,
        };
        if keep {
            self.aux.insert(
                schema.to_string(),
                CachedShadow {
                    shadow: shadow.clone(),
                    synced,
                },
            );
        }
        Ok(shadow)
    }

    /// Applies a locally authored change: no conversion, but the phantom
    /// dependency is injected on an actor's first change, and the full
    /// lens list rides along on the first block that publishes this
    /// engine's schema.
    pub fn apply_local_change(&mut self, mut change: Change) -> Result<(Patch, Block)> {
        let mut diffs = Vec::new();
        self.ensure_bootstrap(&mut diffs)?;
        if change.seq == 1 {
            change.deps.set(ActorId::phantom(), 1);
        }
        let patch = self.primary.apply_local_change(change.clone())?;
        diffs.extend(patch.diffs);
        let lenses = if self.in_doc.contains(&self.schema) {
            Vec::new()
        } else {
            for reg in self.graph.registrations() {
                self.in_doc.insert(reg.to.clone());
            }
            self.in_doc.insert(self.schema.clone());
            self.graph.registrations().to_vec()
        };
        let block = Block::new(self.schema.clone(), lenses, change);
        self.history.push(block.clone());
        Ok((
            Patch {
                clock: self.primary.clock().clone(),
                deps: self.primary.deps().clone(),
                diffs,
            }
            .scrub(),
            block,
        ))
    }

    /// The full-state patch of the primary shadow, bootstrapping it first
    /// if nothing has been applied yet.
    pub fn get_patch(&mut self) -> Result<Patch> {
        self.apply_blocks(Vec::new())?;
        Ok(self.primary.state().get_patch()?.scrub())
    }

    /// History filtered to what a peer at `clock` is missing.
    pub fn get_missing_changes(&self, clock: &Clock) -> Vec<Block> {
        self.history
            .iter()
            .filter(|block| block.seq > clock.get(&block.actor))
            .cloned()
            .collect()
    }

    /// The dependency frontier the backend is still waiting for.
    pub fn get_missing_deps(&self) -> Clock {
        let mut missing = self.primary.state().missing_deps();
        missing.remove(&ActorId::phantom());
        missing
    }

    /// Applies everything `remote` has that this engine is missing.
    pub fn merge(&mut self, remote: &Engine) -> Result<Patch> {
        let missing = remote.get_missing_changes(self.primary.clock());
        self.apply_blocks(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Op, ScalarValue};
    use crate::id::{ElemId, Key, ObjId};
    use crate::lens::Lens;
    use crate::patch::materialize;
    use crate::resolver::Resolver;
    use crate::schema::Schema;
    use serde_json::{json, Value};

    fn init_tracing() {
        use tracing_subscriber::EnvFilter;
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    }

    fn project_v1() -> LensReg {
        LensReg::new(
            MU,
            "project-v1",
            vec![
                Lens::add("name", Schema::text()),
                Lens::add("summary", Schema::text()),
            ],
        )
    }

    fn rename_v2() -> LensReg {
        LensReg::new(
            "project-v1",
            "project-v2",
            vec![Lens::rename("name", "title")],
        )
    }

    fn chain_to_v5() -> Vec<LensReg> {
        vec![
            project_v1(),
            LensReg::new(
                "project-v1",
                "project-v2",
                vec![
                    Lens::add("created_at", Schema::text()),
                    Lens::add(
                        "details",
                        Schema::object([("author", Schema::text()), ("date", Schema::text())]),
                    ),
                ],
            ),
            LensReg::new(
                "project-v2",
                "project-v3",
                vec![Lens::rename("name", "title")],
            ),
            LensReg::new(
                "project-v3",
                "project-v4",
                vec![Lens::plunge("details", "created_at")],
            ),
            LensReg::new(
                "project-v4",
                "project-v5",
                vec![Lens::rename("date", "updated_at").lens_in("details")],
            ),
        ]
    }

    /// One participant: an engine plus the actor writing through it.
    struct Peer {
        engine: Engine,
        actor: ActorId,
        seq: u64,
    }

    impl Peer {
        fn new(schema: &str, lenses: Vec<LensReg>, actor: &str) -> Self {
            let mut engine = Engine::init(schema, lenses).unwrap();
            // bootstrap up front so op building can resolve paths
            engine.get_patch().unwrap();
            Self {
                engine,
                actor: ActorId::new(actor),
                seq: 0,
            }
        }

        fn read(&mut self) -> Value {
            materialize(&self.engine.get_patch().unwrap().diffs).unwrap()
        }

        fn obj_at(&self, path: &str) -> ObjId {
            Resolver::new(self.engine.shadow()).obj_id_of(path).unwrap()
        }

        fn commit(&mut self, ops: Vec<Op>) -> Block {
            self.seq += 1;
            let mut deps = self.engine.shadow().deps().clone();
            deps.remove(&self.actor);
            deps.remove(&ActorId::phantom());
            let change = Change {
                actor: self.actor.clone(),
                seq: self.seq,
                deps,
                message: None,
                ops,
            };
            let (_, block) = self.engine.apply_local_change(change).unwrap();
            block
        }

        fn set(&mut self, parent: &str, key: &str, value: &str) -> Block {
            let obj = self.obj_at(parent);
            self.commit(vec![Op::Set {
                obj,
                key: Key::from(key),
                value: ScalarValue::Text(value.into()),
            }])
        }

        fn push(&mut self, list: &str, value: &str) -> Block {
            let obj = self.obj_at(list);
            let shadow = self.engine.shadow();
            let anchor = shadow
                .state()
                .obj(&obj)
                .unwrap()
                .elem_ids()
                .last()
                .cloned()
                .unwrap_or(ElemId::Head);
            let elem = shadow.next_elem(&self.actor);
            self.commit(vec![
                Op::Ins {
                    obj: obj.clone(),
                    key: Key::from(&anchor),
                    elem,
                },
                Op::Set {
                    obj,
                    key: Key::elem(&self.actor, elem),
                    value: ScalarValue::Text(value.into()),
                },
            ])
        }

        fn shift(&mut self, list: &str) -> Block {
            let obj = self.obj_at(list);
            let elem = self
                .engine
                .shadow()
                .state()
                .obj(&obj)
                .unwrap()
                .elem_at(0)
                .unwrap();
            self.commit(vec![Op::Del {
                obj,
                key: Key::from(&elem),
            }])
        }
    }

    #[test]
    fn scenario_1_defaults() {
        let mut reader = Peer::new("project-v1", vec![project_v1()], "reader");
        assert_eq!(reader.read(), json!({"name": "", "summary": ""}));
    }

    #[test]
    fn scenario_2_rename_across_versions() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        let mut reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "reader");
        let block = author.set("", "name", "hello");
        let patch = reader.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(patch.clock.get(&ActorId::new("author")), 1);
        assert_eq!(reader.read(), json!({"title": "hello", "summary": ""}));
    }

    #[test]
    fn scenario_3_chain_of_five_schemas() {
        let mut author = Peer::new("project-v1", chain_to_v5(), "author");
        let mut reader = Peer::new("project-v5", chain_to_v5(), "reader");
        let block = author.set("", "name", "hello");
        reader.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(
            reader.read(),
            json!({
                "title": "hello",
                "summary": "",
                "details": {"author": "", "created_at": "", "updated_at": ""},
            })
        );
    }

    #[test]
    fn scenario_4_nested_write_mid_chain() {
        let mut author = Peer::new("project-v2", chain_to_v5(), "author");
        let mut reader = Peer::new("project-v5", chain_to_v5(), "reader");
        let block = author.set("/details", "author", "Klaus");
        reader.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(
            reader.read(),
            json!({
                "title": "",
                "summary": "",
                "details": {"author": "Klaus", "created_at": "", "updated_at": ""},
            })
        );
    }

    fn tags_regs() -> Vec<LensReg> {
        vec![
            LensReg::new(MU, "project-v1", vec![Lens::add("other", Schema::text())]),
            LensReg::new(
                "project-v1",
                "project-v2",
                vec![Lens::add("tags", Schema::array(Schema::text()))],
            ),
            LensReg::new("project-v2", "project-v2-compat", vec![]),
        ]
    }

    #[test]
    fn scenario_5_array_pushes_through_noop_lens() {
        init_tracing();
        let mut author = Peer::new("project-v2", tags_regs(), "author");
        let mut reader = Peer::new("project-v2-compat", tags_regs(), "reader");
        let blocks = vec![
            author.push("/tags", "fun"),
            author.push("/tags", "relaxing"),
            author.push("/tags", "lovecraftian"),
        ];
        let mut last_elem = 0;
        for block in blocks {
            reader.engine.apply_blocks(vec![block]).unwrap();
            // element counters never decrease across applies
            let elem = reader.engine.shadow().elem(&ActorId::new("author"));
            assert!(elem >= last_elem);
            last_elem = elem;
        }
        assert_eq!(
            reader.read(),
            json!({"other": "", "tags": ["fun", "relaxing", "lovecraftian"]})
        );
    }

    fn wrap_regs() -> Vec<LensReg> {
        vec![
            LensReg::new(
                MU,
                "scalar",
                vec![Lens::add("assignee", Schema::text_with("Bob"))],
            ),
            LensReg::new(
                "scalar",
                "wrap",
                vec![
                    Lens::Wrap.lens_in("assignee"),
                    Lens::rename("assignee", "assignees"),
                ],
            ),
        ]
    }

    #[test]
    fn scenario_6_wrap_and_head() {
        init_tracing();
        let mut scalar = Peer::new("scalar", wrap_regs(), "scalar-actor");
        let mut wrap = Peer::new("wrap", wrap_regs(), "wrap-actor");
        assert_eq!(scalar.read(), json!({"assignee": "Bob"}));
        assert_eq!(wrap.read(), json!({"assignees": ["Bob"]}));

        let block = scalar.set("", "assignee", "Joe");
        wrap.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(wrap.read(), json!({"assignees": ["Joe"]}));

        // a push lands past the head and is invisible to the scalar reader
        let block = wrap.push("/assignees", "Jill");
        scalar.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(wrap.read(), json!({"assignees": ["Joe", "Jill"]}));
        assert_eq!(scalar.read(), json!({"assignee": "Joe"}));

        // shifting the head surfaces as a null assignment
        let block = wrap.shift("/assignees");
        scalar.engine.apply_blocks(vec![block]).unwrap();
        assert_eq!(wrap.read(), json!({"assignees": ["Jill"]}));
        assert_eq!(scalar.read(), json!({"assignee": null}));
    }

    #[test]
    fn empty_apply_bootstraps_exactly_once() {
        let mut engine = Engine::init("project-v1", vec![project_v1()]).unwrap();
        let patch = engine.apply_blocks(Vec::new()).unwrap();
        assert_eq!(
            materialize(&patch.diffs).unwrap(),
            json!({"name": "", "summary": ""})
        );
        // the phantom change is invisible outside
        assert!(patch.clock.is_empty());
        assert!(patch.deps.is_empty());
        let patch = engine.apply_blocks(Vec::new()).unwrap();
        assert!(patch.diffs.is_empty());
    }

    #[test]
    fn duplicate_blocks_are_noops() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        let mut reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "reader");
        let block = author.set("", "name", "hello");
        reader.engine.apply_blocks(vec![block.clone()]).unwrap();
        let before = reader.read();
        let patch = reader.engine.apply_blocks(vec![block]).unwrap();
        assert!(patch.diffs.is_empty());
        assert_eq!(reader.read(), before);
    }

    #[test]
    fn same_block_list_converges_in_any_batching() {
        let mut author = Peer::new("project-v2", tags_regs(), "author");
        let blocks = vec![
            author.push("/tags", "fun"),
            author.push("/tags", "relaxing"),
            author.push("/tags", "lovecraftian"),
        ];
        let mut at_once = Peer::new("project-v2-compat", tags_regs(), "r1");
        at_once.engine.apply_blocks(blocks.clone()).unwrap();
        let mut one_by_one = Peer::new("project-v2-compat", tags_regs(), "r2");
        for block in blocks {
            one_by_one.engine.apply_blocks(vec![block]).unwrap();
        }
        assert_eq!(at_once.read(), one_by_one.read());
    }

    #[test]
    fn readers_at_different_schemas_agree_through_the_lens() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        let block = author.set("", "name", "hello");
        let mut v1_reader = Peer::new("project-v1", vec![project_v1()], "r1");
        let mut v2_reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "r2");
        v1_reader.engine.apply_blocks(vec![block.clone()]).unwrap();
        v2_reader.engine.apply_blocks(vec![block]).unwrap();
        // the two views are the same document projected through the lens
        assert_eq!(v1_reader.read(), json!({"name": "hello", "summary": ""}));
        assert_eq!(v2_reader.read(), json!({"title": "hello", "summary": ""}));
    }

    #[test]
    fn first_block_carries_the_lens_list() {
        let mut author = Peer::new(
            "project-v2",
            vec![project_v1(), rename_v2()],
            "author",
        );
        let first = author.set("", "title", "hello");
        assert!(!first.lenses.is_empty());
        let second = author.set("", "title", "again");
        assert!(second.lenses.is_empty());
        assert_eq!(first.change.deps.get(&ActorId::phantom()), 1);

        // a reader that never saw v2 learns it from the block itself
        let mut reader = Peer::new("project-v1", vec![project_v1()], "reader");
        reader.engine.apply_blocks(vec![first, second]).unwrap();
        assert_eq!(reader.read(), json!({"name": "again", "summary": ""}));
    }

    #[test]
    fn out_of_order_blocks_wait_for_their_deps() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        let first = author.set("", "name", "one");
        let second = author.set("", "summary", "two");
        let mut reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "reader");
        let patch = reader.engine.apply_blocks(vec![second]).unwrap();
        assert!(patch.diffs.is_empty());
        assert_eq!(
            reader.engine.get_missing_deps().get(&ActorId::new("author")),
            1
        );
        reader.engine.apply_blocks(vec![first]).unwrap();
        assert!(reader.engine.get_missing_deps().is_empty());
        assert_eq!(reader.read(), json!({"title": "one", "summary": "two"}));
    }

    #[test]
    fn merge_pulls_missing_history() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        author.set("", "name", "hello");
        author.set("", "summary", "world");
        let mut reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "reader");
        reader.engine.merge(&author.engine).unwrap();
        assert_eq!(reader.read(), json!({"title": "hello", "summary": "world"}));
        let patch = reader.engine.merge(&author.engine).unwrap();
        assert!(patch.diffs.is_empty());
    }

    #[test]
    fn missing_changes_filter_by_clock() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        author.set("", "name", "hello");
        author.set("", "name", "again");
        assert_eq!(author.engine.get_missing_changes(&Clock::new()).len(), 2);
        let upto: Clock = [(ActorId::new("author"), 1)].into_iter().collect();
        let missing = author.engine.get_missing_changes(&upto);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].seq, 2);
    }

    #[test]
    fn init_requires_a_path_from_mu() {
        let err = Engine::init("unknown", vec![project_v1()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::Error>(),
            Some(crate::error::Error::Construction(_))
        ));
    }

    #[test]
    fn phantom_never_escapes() {
        let mut author = Peer::new("project-v1", vec![project_v1()], "author");
        let block = author.set("", "name", "hello");
        let mut reader = Peer::new("project-v2", vec![project_v1(), rename_v2()], "reader");
        let patch = reader.engine.apply_blocks(vec![block]).unwrap();
        let phantom = ActorId::phantom();
        assert_eq!(patch.clock.get(&phantom), 0);
        assert_eq!(patch.deps.get(&phantom), 0);
        let patch = reader.engine.get_patch().unwrap();
        assert_eq!(patch.clock.get(&phantom), 0);
        assert_eq!(patch.deps.get(&phantom), 0);
        assert_eq!(reader.engine.clock().get(&phantom), 0);
    }
}
