//! Multi-object lockstep traversal driven by the recipe.
//!
//! `iterate` walks N objects of the same type in recipe order and hands
//! every field to a [`Visitor`]. For container fields the visitor picks an
//! iteration strategy; maps pick one strategy for keys and one for values.
//! Collection elements are delivered to `on_value` aligned by position
//! (arrays) or by canonical element string (sets and bags); paths carry no
//! index syntax, so element callbacks report the container's own path.
//!
//! Visitors may rewrite values through [`Field::set_value`]; passing `None`
//! deletes an optional field or removes a map entry. Every applied mutation
//! is reported through `on_change`.

use crate::crdt::{self, Algorithm};
use crate::error::{Error, Result};
use crate::recipe::{ItemType, Recipe, RecipeRule, Registry};
use crate::value::{render_path, Obj, PathSeg, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// How to descend into a container field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Recurse once over all objects' corresponding positions together.
    Parallel,
    /// Recurse once per object.
    Separate,
    /// Do not descend.
    Off,
}

/// Per-side strategies for map fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MapStrategy {
    pub keys: Strategy,
    pub values: Strategy,
}

/// The view of one field (or aligned element/entry) handed to the visitor.
pub struct Field<'a> {
    pub path: String,
    pub itemtype: &'a ItemType,
    pub algorithm: Algorithm,
    /// The map key, inside a map value walk.
    pub key: Option<Value>,
    /// One slot per iterated object; `None` where absent or inactive.
    pub values: Vec<Option<Value>>,
    sets: Vec<(usize, Option<Value>)>,
}

impl<'a> Field<'a> {
    /// Schedules a replacement (or with `None` a removal) of this field's
    /// value on object `index`. Applied after the callback returns.
    pub fn set_value(&mut self, index: usize, value: Option<Value>) {
        self.sets.push((index, value));
    }
}

/// Callbacks of one traversal.
pub trait Visitor {
    fn on_value(&mut self, field: &mut Field) -> Result<()>;

    fn on_object(&mut self, field: &mut Field) -> Result<Strategy> {
        let _ = field;
        Ok(Strategy::Parallel)
    }

    fn on_collection(&mut self, field: &mut Field) -> Result<Strategy> {
        let _ = field;
        Ok(Strategy::Off)
    }

    fn on_map(&mut self, field: &mut Field) -> Result<MapStrategy> {
        let _ = field;
        Ok(MapStrategy {
            keys: Strategy::Off,
            values: Strategy::Off,
        })
    }

    /// Invoked for every applied mutation.
    fn on_change(&mut self, path: &str, index: usize, value: Option<&Value>) {
        let _ = (path, index, value);
    }
}

/// Walks `objs` (all of type `type_name`) in lockstep.
pub fn iterate(
    registry: &Registry,
    type_name: &str,
    objs: &mut [Obj],
    visitor: &mut dyn Visitor,
) -> Result<()> {
    let recipe = registry.get(type_name)?;
    let active: Vec<usize> = (0..objs.len()).collect();
    let mut walker = Walker {
        recipe: recipe.clone(),
        objs,
        visitor,
    };
    walker.walk_rules(&recipe.rules, &[], &active)
}

struct Walker<'a> {
    recipe: Arc<Recipe>,
    objs: &'a mut [Obj],
    visitor: &'a mut dyn Visitor,
}

impl<'a> Walker<'a> {
    fn walk_rules(
        &mut self,
        rules: &[RecipeRule],
        base: &[PathSeg],
        active: &[usize],
    ) -> Result<()> {
        for rule in rules {
            let mut segs = base.to_vec();
            segs.push(PathSeg::Field(rule.itemprop.clone()));
            self.walk_slot(&rule.itemtype, &segs, active, None)?;
        }
        Ok(())
    }

    fn gather(&self, segs: &[PathSeg], active: &[usize]) -> Vec<Option<Value>> {
        (0..self.objs.len())
            .map(|i| {
                if active.contains(&i) {
                    self.objs[i].at(segs).cloned()
                } else {
                    None
                }
            })
            .collect()
    }

    fn apply(&mut self, segs: &[PathSeg], path: &str, sets: Vec<(usize, Option<Value>)>) {
        for (i, value) in sets {
            if i < self.objs.len() && self.objs[i].set_at(segs, value.clone()) {
                self.visitor.on_change(path, i, value.as_ref());
            }
        }
    }

    fn walk_slot(
        &mut self,
        itemtype: &ItemType,
        segs: &[PathSeg],
        active: &[usize],
        key: Option<Value>,
    ) -> Result<()> {
        let path = render_path(segs);
        let algorithm = crdt::select(&self.recipe.crdt_config, &path, itemtype);
        let values = self.gather(segs, active);
        let mut field = Field {
            path: path.clone(),
            itemtype,
            algorithm,
            key,
            values,
            sets: Vec::new(),
        };
        match itemtype {
            ItemType::Object { rules } => {
                let strategy = self.visitor.on_object(&mut field)?;
                let sets = std::mem::take(&mut field.sets);
                drop(field);
                self.apply(segs, &path, sets);
                match strategy {
                    Strategy::Parallel => self.walk_rules(rules, segs, active)?,
                    Strategy::Separate => {
                        for &i in active {
                            self.walk_rules(rules, segs, &[i])?;
                        }
                    }
                    Strategy::Off => {}
                }
            }
            ItemType::Set { item } | ItemType::Bag { item } | ItemType::Array { item } => {
                let strategy = self.visitor.on_collection(&mut field)?;
                let sets = std::mem::take(&mut field.sets);
                drop(field);
                self.apply(segs, &path, sets);
                match strategy {
                    Strategy::Parallel => self.walk_elements_parallel(itemtype, item, segs, active)?,
                    Strategy::Separate => {
                        for &i in active {
                            self.walk_elements_separate(item, segs, i)?;
                        }
                    }
                    Strategy::Off => {}
                }
            }
            ItemType::Map { key: kt, value: vt } => {
                let strategy = self.visitor.on_map(&mut field)?;
                let sets = std::mem::take(&mut field.sets);
                drop(field);
                self.apply(segs, &path, sets);
                let keys = self.union_keys(segs, active);
                match strategy.keys {
                    Strategy::Parallel => {
                        for k in &keys {
                            let mut key_segs = segs.to_vec();
                            key_segs.push(PathSeg::Key(k.clone()));
                            self.walk_leaf(kt, &key_segs, active, Some(k.clone()))?;
                        }
                    }
                    Strategy::Separate => {
                        for &i in active {
                            for k in &keys {
                                let mut key_segs = segs.to_vec();
                                key_segs.push(PathSeg::Key(k.clone()));
                                self.walk_leaf(kt, &key_segs, &[i], Some(k.clone()))?;
                            }
                        }
                    }
                    Strategy::Off => {}
                }
                match strategy.values {
                    Strategy::Parallel => {
                        for k in &keys {
                            let mut entry_segs = segs.to_vec();
                            entry_segs.push(PathSeg::Entry(k.clone()));
                            self.walk_slot(vt, &entry_segs, active, Some(k.clone()))?;
                        }
                    }
                    Strategy::Separate => {
                        for &i in active {
                            for k in &keys {
                                let mut entry_segs = segs.to_vec();
                                entry_segs.push(PathSeg::Entry(k.clone()));
                                self.walk_slot(vt, &entry_segs, &[i], Some(k.clone()))?;
                            }
                        }
                    }
                    Strategy::Off => {}
                }
            }
            _ => {
                self.visitor.on_value(&mut field)?;
                let sets = std::mem::take(&mut field.sets);
                drop(field);
                self.apply(segs, &path, sets);
            }
        }
        Ok(())
    }

    /// Leaf visit without navigation (used for map keys, which are not
    /// addressable slots of the value tree).
    fn walk_leaf(
        &mut self,
        itemtype: &ItemType,
        segs: &[PathSeg],
        active: &[usize],
        key: Option<Value>,
    ) -> Result<()> {
        let path = render_path(segs);
        let algorithm = crdt::select(&self.recipe.crdt_config, &path, itemtype);
        let mut field = Field {
            path: path.clone(),
            itemtype,
            algorithm,
            key,
            values: self.gather(segs, active),
            sets: Vec::new(),
        };
        self.visitor.on_value(&mut field)?;
        let sets = std::mem::take(&mut field.sets);
        drop(field);
        self.apply(segs, &path, sets);
        Ok(())
    }

    fn union_keys(&self, segs: &[PathSeg], active: &[usize]) -> Vec<Value> {
        let mut keys: BTreeMap<String, Value> = BTreeMap::new();
        for &i in active {
            if let Some(entries) = self.objs[i].at(segs).and_then(Value::entries) {
                for (k, _) in entries {
                    keys.entry(k.canonical_string()).or_insert_with(|| k.clone());
                }
            }
        }
        keys.into_values().collect()
    }

    fn walk_elements_parallel(
        &mut self,
        container: &ItemType,
        item: &ItemType,
        segs: &[PathSeg],
        active: &[usize],
    ) -> Result<()> {
        let path = render_path(segs);
        let algorithm = crdt::select(&self.recipe.crdt_config, &path, item);
        let aligned: Vec<Vec<Option<Value>>> = if matches!(container, ItemType::Array { .. }) {
            let max = active
                .iter()
                .filter_map(|&i| self.objs[i].at(segs).and_then(Value::elements))
                .map(<[Value]>::len)
                .max()
                .unwrap_or(0);
            (0..max)
                .map(|pos| {
                    (0..self.objs.len())
                        .map(|i| {
                            if active.contains(&i) {
                                self.objs[i]
                                    .at(segs)
                                    .and_then(Value::elements)
                                    .and_then(|e| e.get(pos))
                                    .cloned()
                            } else {
                                None
                            }
                        })
                        .collect()
                })
                .collect()
        } else {
            let mut union: BTreeMap<String, ()> = BTreeMap::new();
            for &i in active {
                if let Some(elements) = self.objs[i].at(segs).and_then(Value::elements) {
                    for e in elements {
                        union.insert(e.canonical_string(), ());
                    }
                }
            }
            union
                .into_keys()
                .map(|canonical| {
                    (0..self.objs.len())
                        .map(|i| {
                            if active.contains(&i) {
                                self.objs[i]
                                    .at(segs)
                                    .and_then(Value::elements)
                                    .and_then(|e| {
                                        e.iter().find(|e| e.canonical_string() == canonical)
                                    })
                                    .cloned()
                            } else {
                                None
                            }
                        })
                        .collect()
                })
                .collect()
        };
        for values in aligned {
            let mut field = Field {
                path: path.clone(),
                itemtype: item,
                algorithm,
                key: None,
                values,
                sets: Vec::new(),
            };
            self.visitor.on_value(&mut field)?;
            // element positions are not addressable slots; mutations at
            // element granularity go through the container value instead
            if !field.sets.is_empty() {
                return Err(Error::internal("set_value on a container element"));
            }
        }
        Ok(())
    }

    fn walk_elements_separate(
        &mut self,
        item: &ItemType,
        segs: &[PathSeg],
        index: usize,
    ) -> Result<()> {
        let path = render_path(segs);
        let algorithm = crdt::select(&self.recipe.crdt_config, &path, item);
        let elements = match self.objs[index].at(segs).and_then(Value::elements) {
            Some(e) => e.to_vec(),
            None => return Ok(()),
        };
        for element in elements {
            let mut values = vec![None; self.objs.len()];
            values[index] = Some(element);
            let mut field = Field {
                path: path.clone(),
                itemtype: item,
                algorithm,
                key: None,
                values,
                sets: Vec::new(),
            };
            self.visitor.on_value(&mut field)?;
            if !field.sets.is_empty() {
                return Err(Error::internal("set_value on a container element"));
            }
        }
        Ok(())
    }
}

/// Parses a reported dotted path back into segments, using the recipe to
/// tell map-entry keys apart from nested fields.
pub fn parse_path(registry: &Registry, type_name: &str, path: &str) -> Result<Vec<PathSeg>> {
    let recipe = registry.get(type_name)?;
    let mut segs = Vec::new();
    let mut itemtype: Option<&ItemType> = None;
    let mut rules: &[RecipeRule] = &recipe.rules;
    for part in path.split('.') {
        match itemtype {
            Some(ItemType::Map { key, value }) => {
                let (seg, next) = if let Some(raw) = part.strip_prefix("!key!") {
                    (PathSeg::Key(key_value(key, raw)?), None)
                } else {
                    (PathSeg::Entry(key_value(key, part)?), Some(value.as_ref()))
                };
                segs.push(seg);
                itemtype = next;
                rules = &[];
            }
            _ => {
                let rule = rules
                    .iter()
                    .find(|r| r.itemprop == part)
                    .ok_or_else(|| Error::internal(format!("path {path} does not resolve")))?;
                segs.push(PathSeg::Field(part.to_string()));
                itemtype = Some(&rule.itemtype);
                rules = match &rule.itemtype {
                    ItemType::Object { rules } => rules,
                    _ => &[],
                };
            }
        }
    }
    Ok(segs)
}

fn key_value(itemtype: &ItemType, raw: &str) -> Result<Value> {
    Ok(match itemtype {
        ItemType::String { .. } => Value::String(raw.to_string()),
        ItemType::Integer { .. } => Value::Integer(
            raw.parse()
                .map_err(|_| Error::internal(format!("bad integer key {raw:?}")))?,
        ),
        ItemType::Boolean => Value::Bool(raw == "true"),
        other => {
            return Err(Error::internal(format!(
                "unsupported path key type {}",
                other.kind()
            )))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Recipe, RecipeRule};

    fn registry() -> Registry {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "T",
            vec![
                RecipeRule::new("a", ItemType::string()),
                RecipeRule::new(
                    "inner",
                    ItemType::Object {
                        rules: vec![RecipeRule::new("b", ItemType::integer())],
                    },
                ),
                RecipeRule::new(
                    "m",
                    ItemType::map_of(ItemType::string(), ItemType::integer()),
                ),
                RecipeRule::new("tags", ItemType::set_of(ItemType::string())),
            ],
        ))
        .unwrap();
        reg
    }

    fn obj(a: &str, b: i64, m: &[(&str, i64)], tags: &[&str]) -> Obj {
        Obj::new("T")
            .with("a", Value::String(a.into()))
            .with(
                "inner",
                Value::Object(
                    [("b".to_string(), Value::Integer(b))].into_iter().collect(),
                ),
            )
            .with(
                "m",
                Value::map_from(
                    m.iter()
                        .map(|(k, v)| (Value::String((*k).into()), Value::Integer(*v))),
                ),
            )
            .with(
                "tags",
                Value::set_from(tags.iter().map(|t| Value::String((*t).into()))),
            )
    }

    #[derive(Default)]
    struct Recorder {
        paths: Vec<(String, usize)>,
        changes: Vec<String>,
    }

    impl Visitor for Recorder {
        fn on_value(&mut self, field: &mut Field) -> Result<()> {
            let present = field.values.iter().filter(|v| v.is_some()).count();
            self.paths.push((field.path.clone(), present));
            Ok(())
        }

        fn on_map(&mut self, _field: &mut Field) -> Result<MapStrategy> {
            Ok(MapStrategy {
                keys: Strategy::Parallel,
                values: Strategy::Parallel,
            })
        }

        fn on_collection(&mut self, _field: &mut Field) -> Result<Strategy> {
            Ok(Strategy::Parallel)
        }

        fn on_change(&mut self, path: &str, index: usize, _value: Option<&Value>) {
            self.changes.push(format!("{path}#{index}"));
        }
    }

    #[test]
    fn walks_fields_maps_and_elements() {
        let reg = registry();
        let mut objs = [
            obj("x", 1, &[("k", 1), ("only1", 5)], &["p", "q"]),
            obj("y", 2, &[("k", 2)], &["q"]),
        ];
        let mut rec = Recorder::default();
        iterate(&reg, "T", &mut objs, &mut rec).unwrap();
        let paths: Vec<&str> = rec.paths.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(
            paths,
            [
                "a",
                "inner.b",
                "m.!key!k",
                "m.!key!only1",
                "m.k",
                "m.only1",
                "tags", // element p
                "tags", // element q
            ]
        );
        // entry only present on one side surfaces as one Some slot
        let only1 = rec.paths.iter().find(|(p, _)| p == "m.only1").unwrap();
        assert_eq!(only1.1, 1);
    }

    #[test]
    fn set_value_mutates_and_reports() {
        let reg = registry();
        let mut objs = [obj("x", 1, &[("k", 1)], &[])];

        struct Bump;
        impl Visitor for Bump {
            fn on_value(&mut self, field: &mut Field) -> Result<()> {
                if field.path == "inner.b" {
                    field.set_value(0, Some(Value::Integer(42)));
                }
                if field.path == "m.k" {
                    field.set_value(0, None);
                }
                Ok(())
            }
            fn on_map(&mut self, _f: &mut Field) -> Result<MapStrategy> {
                Ok(MapStrategy {
                    keys: Strategy::Off,
                    values: Strategy::Parallel,
                })
            }
        }
        iterate(&reg, "T", &mut objs, &mut Bump).unwrap();
        let segs = parse_path(&reg, "T", "inner.b").unwrap();
        assert_eq!(objs[0].at(&segs), Some(&Value::Integer(42)));
        let m = parse_path(&reg, "T", "m").unwrap();
        assert_eq!(objs[0].at(&m).unwrap().entries().unwrap().len(), 0);
    }

    #[test]
    fn separate_strategy_walks_one_object_at_a_time() {
        let reg = registry();
        let mut objs = [obj("x", 1, &[], &["a"]), obj("y", 2, &[], &["b"])];

        #[derive(Default)]
        struct Sep(Vec<usize>);
        impl Visitor for Sep {
            fn on_value(&mut self, field: &mut Field) -> Result<()> {
                if field.path == "tags" {
                    self.0
                        .push(field.values.iter().filter(|v| v.is_some()).count());
                }
                Ok(())
            }
            fn on_collection(&mut self, _f: &mut Field) -> Result<Strategy> {
                Ok(Strategy::Separate)
            }
        }
        let mut sep = Sep::default();
        iterate(&reg, "T", &mut objs, &mut sep).unwrap();
        assert_eq!(sep.0, [1, 1]);
    }
}
