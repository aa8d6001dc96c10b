//! Field-level difference computation between two objects of one recipe.

use crate::error::{Error, Result};
use crate::iter::{iterate, Field, MapStrategy, Strategy, Visitor};
use crate::recipe::Registry;
use crate::value::{Obj, Value};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Op {
    Set,
    Delete,
    Add,
    Remove,
}

/// One step needed to carry the left object toward the right one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transformation {
    pub op: Op,
    pub key: Option<Value>,
    pub value: Option<Value>,
}

impl Transformation {
    fn set(key: Option<Value>, value: Value) -> Self {
        Self {
            op: Op::Set,
            key,
            value: Some(value),
        }
    }

    fn delete(key: Option<Value>) -> Self {
        Self {
            op: Op::Delete,
            key,
            value: None,
        }
    }

    fn add(value: Value) -> Self {
        Self {
            op: Op::Add,
            key: None,
            value: Some(value),
        }
    }

    fn remove(value: Value) -> Self {
        Self {
            op: Op::Remove,
            key: None,
            value: Some(value),
        }
    }
}

/// Transformations keyed by dotted path.
pub type DiffMap = BTreeMap<String, Vec<Transformation>>;

/// Computes the path-keyed transformation lists turning `a` into `b`.
/// `diff(a, a)` is empty. Set, bag and array fields yield `add`/`remove`
/// pairs keyed by canonical element strings, so element order alone never
/// produces a difference.
pub fn diff(registry: &Registry, a: &Obj, b: &Obj) -> Result<DiffMap> {
    if a.type_name != b.type_name {
        return Err(Error::TypeMismatch {
            path: String::new(),
            expected: a.type_name.clone(),
            found: b.type_name.clone(),
        });
    }
    let mut objs = [a.clone(), b.clone()];
    let mut visitor = DiffVisitor::default();
    iterate(registry, &a.type_name, &mut objs, &mut visitor)?;
    Ok(visitor.diff)
}

#[derive(Default)]
struct DiffVisitor {
    diff: DiffMap,
}

impl DiffVisitor {
    fn push(&mut self, path: &str, t: Transformation) {
        self.diff.entry(path.to_string()).or_default().push(t);
    }
}

fn element_counts(value: Option<&Value>) -> BTreeMap<String, (usize, Value)> {
    let mut counts: BTreeMap<String, (usize, Value)> = BTreeMap::new();
    if let Some(elements) = value.and_then(Value::elements) {
        for e in elements {
            counts
                .entry(e.canonical_string())
                .or_insert_with(|| (0, e.clone()))
                .0 += 1;
        }
    }
    counts
}

impl Visitor for DiffVisitor {
    fn on_value(&mut self, field: &mut Field) -> Result<()> {
        match (&field.values[0], &field.values[1]) {
            (Some(a), Some(b)) if a == b => {}
            (_, Some(b)) => self.push(&field.path, Transformation::set(field.key.clone(), b.clone())),
            (Some(_), None) => self.push(&field.path, Transformation::delete(field.key.clone())),
            (None, None) => {}
        }
        Ok(())
    }

    fn on_object(&mut self, field: &mut Field) -> Result<Strategy> {
        Ok(match (&field.values[0], &field.values[1]) {
            (Some(a), Some(b)) if a == b => Strategy::Off,
            (Some(_), Some(_)) => Strategy::Parallel,
            (_, Some(b)) => {
                self.push(&field.path, Transformation::set(field.key.clone(), b.clone()));
                Strategy::Off
            }
            (Some(_), None) => {
                self.push(&field.path, Transformation::delete(field.key.clone()));
                Strategy::Off
            }
            (None, None) => Strategy::Off,
        })
    }

    fn on_collection(&mut self, field: &mut Field) -> Result<Strategy> {
        match (&field.values[0], &field.values[1]) {
            (None, Some(b)) => {
                self.push(&field.path, Transformation::set(field.key.clone(), b.clone()));
            }
            (Some(_), None) => {
                self.push(&field.path, Transformation::delete(field.key.clone()));
            }
            (a, b) => {
                let a = element_counts(a.as_ref());
                let b = element_counts(b.as_ref());
                for (canonical, (count_b, value)) in &b {
                    let count_a = a.get(canonical).map_or(0, |(c, _)| *c);
                    for _ in count_a..*count_b {
                        self.push(&field.path, Transformation::add(value.clone()));
                    }
                }
                for (canonical, (count_a, value)) in &a {
                    let count_b = b.get(canonical).map_or(0, |(c, _)| *c);
                    for _ in count_b..*count_a {
                        self.push(&field.path, Transformation::remove(value.clone()));
                    }
                }
            }
        }
        Ok(Strategy::Off)
    }

    fn on_map(&mut self, field: &mut Field) -> Result<MapStrategy> {
        Ok(match (&field.values[0], &field.values[1]) {
            (None, Some(b)) => {
                self.push(&field.path, Transformation::set(field.key.clone(), b.clone()));
                MapStrategy {
                    keys: Strategy::Off,
                    values: Strategy::Off,
                }
            }
            (Some(_), None) => {
                self.push(&field.path, Transformation::delete(field.key.clone()));
                MapStrategy {
                    keys: Strategy::Off,
                    values: Strategy::Off,
                }
            }
            _ => MapStrategy {
                keys: Strategy::Off,
                values: Strategy::Parallel,
            },
        })
    }
}

/// Applies a diff to an object. Defined for recipes whose diffs only carry
/// `set`/`delete` and set/bag element operations; array element operations
/// cannot restore positions and are applied as appends.
pub fn apply(registry: &Registry, base: &Obj, diff: &DiffMap) -> Result<Obj> {
    let mut obj = base.clone();
    for (path, transformations) in diff {
        let segs = crate::iter::parse_path(registry, &obj.type_name, path)?;
        for t in transformations {
            match t.op {
                Op::Set => {
                    obj.set_at(&segs, t.value.clone());
                }
                Op::Delete => {
                    obj.set_at(&segs, None);
                }
                Op::Add | Op::Remove => {
                    let value = t
                        .value
                        .as_ref()
                        .ok_or_else(|| Error::internal("element op without value"))?;
                    let mut container = obj
                        .at(&segs)
                        .cloned()
                        .ok_or_else(|| Error::internal(format!("no container at {path}")))?;
                    match &mut container {
                        Value::Set(e) | Value::Bag(e) | Value::Array(e) => {
                            if t.op == Op::Add {
                                e.push(value.clone());
                            } else if let Some(i) = e.iter().position(|x| x == value) {
                                e.remove(i);
                            }
                        }
                        _ => return Err(Error::internal(format!("no container at {path}"))),
                    }
                    let container = match container {
                        Value::Set(e) => Value::set_from(e),
                        other => other,
                    };
                    obj.set_at(&segs, Some(container));
                }
            }
        }
    }
    Ok(obj)
}
