use crate::patch::PatchOp;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub type Prop = String;

/// Document schema at a single node, restricted to the map/list core.
///
/// `Text` carries its default string so lens-declared defaults survive
/// schema derivation. Object properties live in a `BTreeMap`, which fixes
/// the lexical enumeration order that keeps default patches identical on
/// every peer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Schema {
    Null,
    Boolean,
    Number,
    Text(String),
    Array(Box<Schema>),
    Object(BTreeMap<Prop, Schema>),
}

impl Schema {
    pub fn text() -> Self {
        Self::Text(String::new())
    }

    pub fn text_with(default: &str) -> Self {
        Self::Text(default.into())
    }

    pub fn array(item: Schema) -> Self {
        Self::Array(Box::new(item))
    }

    pub fn object<I: IntoIterator<Item = (&'static str, Schema)>>(props: I) -> Self {
        Self::Object(
            props
                .into_iter()
                .map(|(prop, schema)| (prop.to_string(), schema))
                .collect(),
        )
    }

    /// The default value of a leaf node. Containers default to empty; their
    /// contents are expanded by [`Schema::default_patch`].
    fn empty_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean => json!(false),
            Self::Number => json!(0),
            Self::Text(default) => json!(default),
            Self::Array(_) => json!([]),
            Self::Object(_) => json!({}),
        }
    }

    /// Appends the patch ops that materialize this node's defaults at
    /// `path`, enumerating object properties lexically.
    pub fn default_patch(&self, path: &str, out: &mut Vec<PatchOp>) {
        out.push(PatchOp::Add {
            path: path.into(),
            value: self.empty_value(),
        });
        if let Self::Object(props) = self {
            for (prop, schema) in props {
                schema.default_patch(&format!("{}/{}", path, prop), out);
            }
        }
    }
}
