//! Proptest strategies shared by the property suites.

use crate::hash::Hash;
use crate::recipe::{ItemType, Recipe, RecipeRule, Registry};
use crate::value::{Link, Obj, Value};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// A registry holding the `Thing` recipe exercising every itemtype family.
pub fn test_registry() -> Registry {
    let reg = Registry::new();
    reg.register(Recipe::new(
        "Thing",
        vec![
            RecipeRule::new("name", ItemType::string()),
            RecipeRule::new("count", ItemType::integer()),
            RecipeRule::new("ratio", ItemType::number()),
            RecipeRule::new("done", ItemType::Boolean),
            RecipeRule::new("note", ItemType::string()).optional(),
            RecipeRule::new("tags", ItemType::set_of(ItemType::string())),
            RecipeRule::new("scores", ItemType::array_of(ItemType::integer())),
            RecipeRule::new(
                "attrs",
                ItemType::map_of(ItemType::string(), ItemType::integer()),
            ),
            RecipeRule::new(
                "inner",
                ItemType::Object {
                    rules: vec![
                        RecipeRule::new("a", ItemType::string()),
                        RecipeRule::new("b", ItemType::integer()).optional(),
                    ],
                },
            )
            .optional(),
            RecipeRule::new("target", ItemType::reference_to_obj(["*"])).optional(),
            RecipeRule::new("extra", ItemType::Stringifiable).optional(),
        ],
    ))
    .unwrap();
    reg
}

pub fn text() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 <>&\"'.:/-]{0,12}"
}

/// Map keys: reported paths embed the key's canonical string, so keys in
/// generated data stay free of the path separators.
pub fn key_text() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

pub fn obj_ref() -> impl Strategy<Value = Value> {
    any::<[u8; 32]>().prop_map(|b| Value::Reference(Link::Obj(Hash::new(b))))
}

fn json_leaf() -> impl Strategy<Value = serde_json::Value> {
    prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        text().prop_map(serde_json::Value::from),
    ]
}

/// A well-typed `Thing` object.
pub fn thing() -> impl Strategy<Value = Obj> {
    let required = (
        text(),
        any::<i64>(),
        (-1.0e9..1.0e9f64),
        any::<bool>(),
        prop::collection::btree_set(text(), 0..4),
        prop::collection::vec(any::<i64>(), 0..4),
        prop::collection::btree_map(key_text(), any::<i64>(), 0..4),
    );
    let optional = (
        prop::option::of(text()),
        prop::option::of((text(), prop::option::of(any::<i64>()))),
        prop::option::of(obj_ref()),
        prop::option::of(json_leaf()),
    );
    (required, optional).prop_map(
        |(
            (name, count, ratio, done, tags, scores, attrs),
            (note, inner, target, extra),
        )| {
            let mut obj = Obj::new("Thing")
                .with("name", Value::String(name))
                .with("count", Value::Integer(count))
                .with("ratio", Value::Number(ratio))
                .with("done", Value::Bool(done))
                .with(
                    "tags",
                    Value::set_from(tags.into_iter().map(Value::String)),
                )
                .with(
                    "scores",
                    Value::Array(scores.into_iter().map(Value::Integer).collect()),
                )
                .with(
                    "attrs",
                    Value::map_from(
                        attrs
                            .into_iter()
                            .map(|(k, v)| (Value::String(k), Value::Integer(v))),
                    ),
                );
            if let Some(note) = note {
                obj.set("note", Value::String(note));
            }
            if let Some((a, b)) = inner {
                let mut fields = BTreeMap::new();
                fields.insert("a".to_string(), Value::String(a));
                if let Some(b) = b {
                    fields.insert("b".to_string(), Value::Integer(b));
                }
                obj.set("inner", Value::Object(fields));
            }
            if let Some(target) = target {
                obj.set("target", target);
            }
            if let Some(extra) = extra {
                obj.set("extra", Value::Stringifiable(extra));
            }
            obj
        },
    )
}
