use crate::error::Error;
use crate::lens::{reverse_chain, Lens};
use crate::schema::Schema;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Name of the empty initial schema every lens chain grows from.
pub const MU: &str = "mu";

/// A published edge of the lens graph.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LensReg {
    pub from: String,
    pub to: String,
    pub lens: Vec<Lens>,
}

impl LensReg {
    pub fn new(from: impl Into<String>, to: impl Into<String>, lens: Vec<Lens>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            lens,
        }
    }
}

#[derive(Clone, Debug)]
struct Edge {
    to: String,
    lens: Vec<Lens>,
}

/// Directed graph of schema names. Each registration inserts the forward
/// edge and its structural reverse, so composition works in both
/// directions; the schema at a node is derived when the edge is added.
#[derive(Clone, Debug)]
pub struct LensGraph {
    edges: BTreeMap<String, Vec<Edge>>,
    schemas: BTreeMap<String, Schema>,
    regs: Vec<LensReg>,
}

impl Default for LensGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LensGraph {
    pub fn new() -> Self {
        let mut schemas = BTreeMap::new();
        schemas.insert(MU.to_string(), Schema::Object(Default::default()));
        Self {
            edges: BTreeMap::new(),
            schemas,
            regs: Vec::new(),
        }
    }

    pub fn has_schema(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Adds a schema to the graph. Fails if `from` is unknown, `to` already
    /// exists, or the lens chain doesn't fit the schema at `from`.
    pub fn register(&mut self, reg: LensReg) -> Result<()> {
        let from_schema = self.schemas.get(&reg.from).ok_or_else(|| {
            Error::LensRegistration(format!("unknown source schema {}", reg.from))
        })?;
        if self.schemas.contains_key(&reg.to) {
            return Err(
                Error::LensRegistration(format!("schema {} already registered", reg.to)).into(),
            );
        }
        let mut schema = from_schema.clone();
        for lens in &reg.lens {
            lens.transform_schema(&mut schema)?;
        }
        self.schemas.insert(reg.to.clone(), schema);
        self.edges.entry(reg.from.clone()).or_default().push(Edge {
            to: reg.to.clone(),
            lens: reg.lens.clone(),
        });
        self.edges.entry(reg.to.clone()).or_default().push(Edge {
            to: reg.from.clone(),
            lens: reverse_chain(&reg.lens),
        });
        self.regs.push(reg);
        Ok(())
    }

    /// Folds a registration carried by a history block into the graph.
    /// Registrations for schemas already present are assumed identical and
    /// skipped.
    pub fn merge(&mut self, reg: &LensReg) -> Result<()> {
        if self.has_schema(&reg.to) {
            tracing::trace!(schema = %reg.to, "skipping known lens registration");
            return Ok(());
        }
        self.register(reg.clone())
    }

    /// The derived schema at a node.
    pub fn schema_at(&self, name: &str) -> Result<&Schema> {
        self.schemas
            .get(name)
            .ok_or_else(|| Error::Construction(format!("unknown schema {}", name)).into())
    }

    /// The lens chain along the shortest path (by hop count) between two
    /// schemas; identity when they are equal.
    pub fn compose(&self, from: &str, to: &str) -> Result<Vec<Lens>> {
        if !self.schemas.contains_key(from) {
            return Err(Error::Construction(format!("unknown schema {}", from)).into());
        }
        if from == to {
            return Ok(Vec::new());
        }
        let mut prev: BTreeMap<&str, (&str, &[Lens])> = BTreeMap::new();
        let mut queue = VecDeque::from([from]);
        'search: while let Some(node) = queue.pop_front() {
            for edge in self.edges.get(node).map(Vec::as_slice).unwrap_or_default() {
                if edge.to != from && !prev.contains_key(edge.to.as_str()) {
                    prev.insert(edge.to.as_str(), (node, edge.lens.as_slice()));
                    if edge.to == to {
                        break 'search;
                    }
                    queue.push_back(edge.to.as_str());
                }
            }
        }
        if !prev.contains_key(to) {
            return Err(
                Error::Construction(format!("no lens path from {} to {}", from, to)).into(),
            );
        }
        let mut chains = Vec::new();
        let mut node = to;
        while node != from {
            let (parent, lens) = prev[node];
            chains.push(lens);
            node = parent;
        }
        Ok(chains.into_iter().rev().flatten().cloned().collect())
    }

    /// Every forward registration folded in so far, in registration order.
    pub fn registrations(&self) -> &[LensReg] {
        &self.regs
    }
}
