use crate::error::Error;
use crate::patch::{split_path, PatchOp};
use crate::schema::{Prop, Schema};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::{smallvec, SmallVec};

/// One step of a bidirectional schema transformation. A chain of lenses
/// carries a document shape from one named schema to the next; reversing
/// the chain carries it back.
///
/// `AddProperty` and `RemoveProperty` carry the property's schema so each
/// is the exact structural reverse of the other and defaults survive the
/// round trip. `Wrap` and `Head` apply to the node a surrounding `LensIn`
/// scopes them to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lens {
    AddProperty(Prop, Schema),
    RemoveProperty(Prop, Schema),
    RenameProperty(Prop, Prop),
    HoistProperty(Prop, Prop),
    PlungeProperty(Prop, Prop),
    Wrap,
    Head,
    LensIn(Prop, Box<Lens>),
    LensMap(Box<Lens>),
}

impl Lens {
    pub fn add(name: &str, schema: Schema) -> Self {
        Self::AddProperty(name.into(), schema)
    }

    pub fn remove(name: &str, schema: Schema) -> Self {
        Self::RemoveProperty(name.into(), schema)
    }

    pub fn rename(from: &str, to: &str) -> Self {
        Self::RenameProperty(from.into(), to.into())
    }

    pub fn hoist(host: &str, name: &str) -> Self {
        Self::HoistProperty(host.into(), name.into())
    }

    pub fn plunge(host: &str, name: &str) -> Self {
        Self::PlungeProperty(host.into(), name.into())
    }

    pub fn lens_in(self, prop: &str) -> Self {
        Self::LensIn(prop.into(), Box::new(self))
    }

    pub fn lens_map(self) -> Self {
        Self::LensMap(Box::new(self))
    }

    pub fn reverse(&self) -> Self {
        match self {
            Self::AddProperty(name, schema) => Self::RemoveProperty(name.clone(), schema.clone()),
            Self::RemoveProperty(name, schema) => Self::AddProperty(name.clone(), schema.clone()),
            Self::RenameProperty(from, to) => Self::RenameProperty(to.clone(), from.clone()),
            Self::HoistProperty(host, name) => Self::PlungeProperty(host.clone(), name.clone()),
            Self::PlungeProperty(host, name) => Self::HoistProperty(host.clone(), name.clone()),
            Self::Wrap => Self::Head,
            Self::Head => Self::Wrap,
            Self::LensIn(prop, lens) => Self::LensIn(prop.clone(), Box::new(lens.reverse())),
            Self::LensMap(lens) => Self::LensMap(Box::new(lens.reverse())),
        }
    }

    pub fn transform_schema(&self, s: &mut Schema) -> Result<()> {
        match (self, s) {
            (Self::AddProperty(key, ps), Schema::Object(m)) => {
                if m.contains_key(key) {
                    return Err(Error::LensRegistration(format!(
                        "property {} already exists in schema",
                        key
                    ))
                    .into());
                }
                m.insert(key.clone(), ps.clone());
            }
            (Self::RemoveProperty(key, _), Schema::Object(m)) => {
                if m.remove(key).is_none() {
                    return Err(Error::LensRegistration(format!(
                        "property {} doesn't exist in schema",
                        key
                    ))
                    .into());
                }
            }
            (Self::RenameProperty(from, to), Schema::Object(m)) => {
                if m.contains_key(to) {
                    return Err(Error::LensRegistration(format!(
                        "trying to rename to existing property: {}",
                        to
                    ))
                    .into());
                }
                if let Some(s) = m.remove(from) {
                    m.insert(to.clone(), s);
                } else {
                    return Err(Error::LensRegistration(format!(
                        "cannot rename property that doesn't exist: {}",
                        from
                    ))
                    .into());
                }
            }
            (Self::HoistProperty(host, target), Schema::Object(m)) => {
                if m.contains_key(target) {
                    return Err(Error::LensRegistration(format!(
                        "target property {} already exists",
                        target
                    ))
                    .into());
                }
                if let Some(Schema::Object(host)) = m.get_mut(host) {
                    if let Some(s) = host.remove(target) {
                        m.insert(target.clone(), s);
                    } else {
                        return Err(Error::LensRegistration(format!(
                            "target property {} doesn't exist",
                            target
                        ))
                        .into());
                    }
                } else {
                    return Err(Error::LensRegistration(format!(
                        "host property {} doesn't exist",
                        host
                    ))
                    .into());
                }
            }
            (Self::PlungeProperty(host, target), Schema::Object(m)) => {
                if host == target {
                    return Err(Error::LensRegistration(
                        "host and target property are the same".into(),
                    )
                    .into());
                }
                let s = if let Some(s) = m.remove(target) {
                    s
                } else {
                    return Err(Error::LensRegistration(format!(
                        "target property {} doesn't exist",
                        target
                    ))
                    .into());
                };
                if let Some(Schema::Object(host)) = m.get_mut(host) {
                    if host.contains_key(target) {
                        return Err(Error::LensRegistration(format!(
                            "host already contains target property {}",
                            target
                        ))
                        .into());
                    }
                    host.insert(target.clone(), s);
                } else {
                    return Err(
                        Error::LensRegistration("host property doesn't exist".into()).into()
                    );
                }
            }
            (Self::Wrap, s) => *s = Schema::Array(Box::new(s.clone())),
            (Self::Head, s) => match s {
                Schema::Array(item) => {
                    let item = (**item).clone();
                    *s = item;
                }
                s => {
                    return Err(Error::LensRegistration(format!(
                        "cannot apply head to {:?}",
                        s
                    ))
                    .into())
                }
            },
            (Self::LensIn(key, lens), Schema::Object(m)) if m.contains_key(key) => {
                lens.transform_schema(m.get_mut(key).unwrap())?;
            }
            (Self::LensMap(lens), Schema::Array(item)) => lens.transform_schema(item)?,
            (lens, s) => {
                return Err(Error::LensRegistration(format!(
                    "invalid lens for schema: {:?} {:?}",
                    lens, s
                ))
                .into())
            }
        }
        Ok(())
    }

    /// Rewrites one patch op. Paths are relative to the node this lens is
    /// scoped to; an empty output drops the op.
    pub fn transform_patch_op(&self, op: PatchOp) -> Result<SmallVec<[PatchOp; 2]>> {
        let out = match self {
            Self::AddProperty(name, schema) => {
                let inject = op.path().is_empty() && op.creates_object();
                let mut out = smallvec![op];
                if inject {
                    let mut defaults = Vec::new();
                    schema.default_patch(&format!("/{}", name), &mut defaults);
                    out.extend(defaults);
                }
                out
            }
            Self::RemoveProperty(name, _) => match split_path(op.path()) {
                (Some(head), _) if head == name => smallvec![],
                _ => smallvec![op],
            },
            Self::RenameProperty(from, to) => match split_path(op.path()) {
                (Some(head), rest) if head == from => {
                    let path = format!("/{}{}", to, rest);
                    smallvec![op.with_path(path)]
                }
                _ => smallvec![op],
            },
            Self::HoistProperty(host, name) => match split_path(op.path()) {
                (Some(head), rest) if head == host => match split_path(rest) {
                    (Some(second), tail) if second == name => {
                        let path = format!("/{}{}", name, tail);
                        smallvec![op.with_path(path)]
                    }
                    _ => smallvec![op],
                },
                _ => smallvec![op],
            },
            Self::PlungeProperty(host, name) => match split_path(op.path()) {
                (Some(head), rest) if head == name => {
                    let path = format!("/{}/{}{}", host, name, rest);
                    smallvec![op.with_path(path)]
                }
                _ => smallvec![op],
            },
            Self::Wrap => match split_path(op.path()) {
                // ops below the node shift under the head element
                (Some(_), _) => {
                    let path = format!("/0{}", op.path());
                    smallvec![op.with_path(path)]
                }
                (None, _) => match op {
                    PatchOp::Add { value, .. } if value.is_null() => smallvec![PatchOp::Add {
                        path: String::new(),
                        value: json!([]),
                    }],
                    PatchOp::Add { value, .. } => smallvec![
                        PatchOp::Add {
                            path: String::new(),
                            value: json!([]),
                        },
                        PatchOp::Add {
                            path: "/0".into(),
                            value,
                        },
                    ],
                    PatchOp::Replace { value, .. } if value.is_null() => {
                        smallvec![PatchOp::Remove { path: "/0".into() }]
                    }
                    PatchOp::Replace { value, .. } => smallvec![PatchOp::Replace {
                        path: "/0".into(),
                        value,
                    }],
                    PatchOp::Remove { .. } => smallvec![op],
                },
            },
            Self::Head => match split_path(op.path()) {
                (None, _) => match op {
                    // the array node collapses to a null head until an
                    // element arrives
                    PatchOp::Add { .. } => smallvec![PatchOp::Add {
                        path: String::new(),
                        value: json!(null),
                    }],
                    PatchOp::Replace { .. } => smallvec![PatchOp::Replace {
                        path: String::new(),
                        value: json!(null),
                    }],
                    PatchOp::Remove { .. } => smallvec![op],
                },
                (Some("0"), rest) => {
                    if rest.is_empty() {
                        match op {
                            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                                smallvec![PatchOp::Replace {
                                    path: String::new(),
                                    value,
                                }]
                            }
                            PatchOp::Remove { .. } => smallvec![PatchOp::Replace {
                                path: String::new(),
                                value: json!(null),
                            }],
                        }
                    } else {
                        let path = rest.to_string();
                        smallvec![op.with_path(path)]
                    }
                }
                (Some(_), _) => smallvec![],
            },
            Self::LensIn(name, lens) => match split_path(op.path()) {
                (Some(head), rest) if head == name => {
                    let rest = rest.to_string();
                    let inner = op.with_path(rest);
                    lens.transform_patch_op(inner)?
                        .into_iter()
                        .map(|op| {
                            let path = format!("/{}{}", name, op.path());
                            op.with_path(path)
                        })
                        .collect()
                }
                _ => smallvec![op],
            },
            Self::LensMap(lens) => match split_path(op.path()) {
                (Some(head), rest) if head.parse::<usize>().is_ok() => {
                    let index = head.to_string();
                    let rest = rest.to_string();
                    let inner = op.with_path(rest);
                    lens.transform_patch_op(inner)?
                        .into_iter()
                        .map(|op| {
                            let path = format!("/{}{}", index, op.path());
                            op.with_path(path)
                        })
                        .collect()
                }
                _ => smallvec![op],
            },
        };
        Ok(out)
    }
}

/// The structural reverse of a whole chain.
pub fn reverse_chain(lenses: &[Lens]) -> Vec<Lens> {
    lenses.iter().rev().map(Lens::reverse).collect()
}

/// Runs every op of a patch through every lens of a chain, in order.
pub fn transform_patch(lenses: &[Lens], patch: Vec<PatchOp>) -> Result<Vec<PatchOp>> {
    let mut ops = patch;
    for lens in lenses {
        let mut next = Vec::with_capacity(ops.len());
        for op in ops {
            next.extend(lens.transform_patch_op(op)?);
        }
        ops = next;
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::*;
    use proptest::prelude::*;

    fn add(path: &str, value: serde_json::Value) -> PatchOp {
        PatchOp::Add {
            path: path.into(),
            value,
        }
    }

    fn replace(path: &str, value: serde_json::Value) -> PatchOp {
        PatchOp::Replace {
            path: path.into(),
            value,
        }
    }

    #[test]
    fn rename_rewrites_the_leading_segment() {
        let lens = Lens::rename("name", "title");
        let out = lens
            .transform_patch_op(replace("/name", json!("hello")))
            .unwrap();
        assert_eq!(out.as_slice(), &[replace("/title", json!("hello"))]);
        let out = lens
            .transform_patch_op(replace("/names/0", json!("x")))
            .unwrap();
        assert_eq!(out.as_slice(), &[replace("/names/0", json!("x"))]);
    }

    #[test]
    fn plunge_and_hoist_move_nested_paths() {
        let plunge = Lens::plunge("details", "created_at");
        let out = plunge
            .transform_patch_op(add("/created_at", json!("")))
            .unwrap();
        assert_eq!(out.as_slice(), &[add("/details/created_at", json!(""))]);
        let hoist = plunge.reverse();
        let out = hoist
            .transform_patch_op(add("/details/created_at", json!("")))
            .unwrap();
        assert_eq!(out.as_slice(), &[add("/created_at", json!(""))]);
    }

    #[test]
    fn add_property_injects_defaults_after_container_creation() {
        let lens = Lens::add(
            "details",
            Schema::object([("author", Schema::text()), ("date", Schema::text())]),
        );
        let out = lens.transform_patch_op(add("", json!({}))).unwrap();
        let paths: Vec<&str> = out.iter().map(|op| op.path()).collect();
        assert_eq!(paths, ["", "/details", "/details/author", "/details/date"]);
    }

    #[test]
    fn wrap_moves_scalars_under_the_head() {
        let lens = Lens::Wrap.lens_in("assignee");
        let out = lens
            .transform_patch_op(replace("/assignee", json!("Joe")))
            .unwrap();
        assert_eq!(out.as_slice(), &[replace("/assignee/0", json!("Joe"))]);
        let out = lens
            .transform_patch_op(replace("/assignee", json!(null)))
            .unwrap();
        assert_eq!(
            out.as_slice(),
            &[PatchOp::Remove {
                path: "/assignee/0".into()
            }]
        );
        let out = lens
            .transform_patch_op(add("/assignee", json!("Bob")))
            .unwrap();
        assert_eq!(
            out.as_slice(),
            &[add("/assignee", json!([])), add("/assignee/0", json!("Bob"))]
        );
    }

    #[test]
    fn head_keeps_only_the_first_element() {
        let lens = Lens::Head.lens_in("assignees");
        let out = lens
            .transform_patch_op(add("/assignees/1", json!("Jill")))
            .unwrap();
        assert!(out.is_empty());
        let out = lens
            .transform_patch_op(PatchOp::Remove {
                path: "/assignees/0".into(),
            })
            .unwrap();
        assert_eq!(out.as_slice(), &[replace("/assignees", json!(null))]);
        let out = lens
            .transform_patch_op(add("/assignees/0", json!("Joe")))
            .unwrap();
        assert_eq!(out.as_slice(), &[replace("/assignees", json!("Joe"))]);
    }

    #[test]
    fn chain_transform_follows_lens_order() {
        let lenses = vec![
            Lens::add("created_at", Schema::text()),
            Lens::add("details", Schema::object([("author", Schema::text())])),
            Lens::plunge("details", "created_at"),
        ];
        // later lenses keep rewriting defaults injected by earlier ones,
        // and containers are created before the ops that land inside them
        let out = transform_patch(&lenses, vec![add("", json!({}))]).unwrap();
        let paths: Vec<&str> = out.iter().map(|op| op.path()).collect();
        assert_eq!(
            paths,
            ["", "/details", "/details/author", "/details/created_at"]
        );
    }

    proptest! {
        #[test]
        fn reversible((lens, schema) in lens_and_schema()) {
            let mut schema2 = schema.clone();
            prop_assume!(lens.transform_schema(&mut schema2).is_ok());
            lens.reverse().transform_schema(&mut schema2).unwrap();
            prop_assert_eq!(schema, schema2);
        }

        #[test]
        fn chain_reversal_restores_schema((lenses, schema) in lenses_and_schema()) {
            let mut derived = schema.clone();
            for lens in &lenses {
                lens.transform_schema(&mut derived).unwrap();
            }
            for lens in reverse_chain(&lenses) {
                lens.transform_schema(&mut derived).unwrap();
            }
            prop_assert_eq!(schema, derived);
        }
    }
}
