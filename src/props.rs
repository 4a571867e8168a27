//! Proptest strategies for schemas and lens chains.
use crate::lens::Lens;
use crate::schema::{Prop, Schema};
use proptest::prelude::*;

pub fn arb_prop() -> impl Strategy<Value = Prop> {
    "[a-z]{1,3}"
}

pub fn arb_leaf_schema() -> impl Strategy<Value = Schema> {
    prop_oneof![
        Just(Schema::Null),
        Just(Schema::Boolean),
        Just(Schema::Number),
        "[a-z]{0,3}".prop_map(Schema::Text),
    ]
}

pub fn arb_schema() -> impl Strategy<Value = Schema> {
    arb_leaf_schema().prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            inner.clone().prop_map(Schema::array),
            prop::collection::btree_map(arb_prop(), inner, 0..4).prop_map(Schema::Object),
        ]
    })
}

/// A lens that plausibly applies to the given schema. Collisions (adding a
/// property that already exists, renaming onto an occupied name) are
/// possible; callers either assume away or skip failed applications.
pub fn arb_lens_for_schema(s: &Schema) -> BoxedStrategy<Lens> {
    let mut strategy: Vec<BoxedStrategy<Lens>> = vec![Just(Lens::Wrap).boxed()];
    match s {
        Schema::Object(fields) => {
            strategy.push(
                (arb_prop(), arb_leaf_schema())
                    .prop_map(|(prop, schema)| Lens::AddProperty(prop, schema))
                    .boxed(),
            );
            for (k, v) in fields {
                strategy.push(Just(Lens::RemoveProperty(k.clone(), v.clone())).boxed());
                let kk = k.clone();
                strategy.push(
                    arb_prop()
                        .prop_map(move |to| Lens::RenameProperty(kk.clone(), to))
                        .boxed(),
                );
                if let Schema::Object(inner) = v {
                    for k2 in inner.keys() {
                        strategy.push(Just(Lens::HoistProperty(k.clone(), k2.clone())).boxed());
                    }
                    for k2 in fields.keys() {
                        if k2 != k {
                            strategy.push(Just(Lens::PlungeProperty(k.clone(), k2.clone())).boxed());
                        }
                    }
                }
                let kk = k.clone();
                strategy.push(
                    arb_lens_for_schema(v)
                        .prop_map(move |lens| lens.lens_in(&kk))
                        .boxed(),
                );
            }
        }
        Schema::Array(item) => {
            strategy.push(Just(Lens::Head).boxed());
            strategy.push(arb_lens_for_schema(item).prop_map(Lens::lens_map).boxed());
        }
        _ => {}
    }
    (0..strategy.len())
        .prop_flat_map(move |i| strategy[i].clone())
        .boxed()
}

prop_compose! {
    pub fn lens_and_schema()
        (schema in arb_schema())
        (lens in arb_lens_for_schema(&schema), schema in Just(schema)) -> (Lens, Schema)
    {
        (lens, schema)
    }
}

fn step(
    (start, current, lenses): (Schema, Schema, Vec<Lens>),
) -> impl Strategy<Value = (Schema, Schema, Vec<Lens>)> {
    arb_lens_for_schema(&current).prop_map(move |lens| {
        let mut next = current.clone();
        let mut lenses = lenses.clone();
        if lens.transform_schema(&mut next).is_ok() {
            lenses.push(lens);
            (start.clone(), next, lenses)
        } else {
            (start.clone(), current.clone(), lenses)
        }
    })
}

/// A chain of lenses that applies cleanly to the schema it is returned
/// with.
pub fn lenses_and_schema() -> impl Strategy<Value = (Vec<Lens>, Schema)> {
    arb_schema()
        .prop_map(|schema| (schema.clone(), schema, Vec::new()))
        .prop_flat_map(step)
        .prop_flat_map(step)
        .prop_flat_map(step)
        .prop_map(|(start, _, lenses)| (lenses, start))
}
