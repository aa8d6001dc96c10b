//! Per-field CRDT merge algorithms.
//!
//! Each field of a merge is dispatched to one algorithm selected from the
//! recipe's `crdt_config` (falling back to `Standard`, with object
//! references defaulting to `ReferenceToObject`). All algorithms operate on
//! a subpath-projected [`VersionTree`] and are symmetric in the two heads,
//! which is what makes pairwise merging commutative and convergent.
//!
//! Concurrent operations on the same element or field are ordered by
//! `(creationTime, add-over-remove, node hash)`: the later operation wins,
//! a tie prefers the surviving value, and the hash breaks exact ties
//! deterministically.

use crate::diff::{Op, Transformation};
use crate::error::{Error, Result};
use crate::graph::{TreeNode, VersionTree};
use crate::hash::IdHash;
use crate::recipe::ItemType;
use crate::store::Db;
use crate::value::{Link, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// The closed set of merge algorithms.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Algorithm {
    /// Last-writer-wins over whole values.
    Standard,
    /// Three-way element merge for set/bag/array fields.
    Set,
    /// Presence/value merge for optional fields and map entries.
    OptionalValue,
    /// Point-wise merge across an object-reference boundary.
    ReferenceToObject,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Self::Standard => "Standard",
            Self::Set => "Set",
            Self::OptionalValue => "OptionalValue",
            Self::ReferenceToObject => "ReferenceToObject",
        };
        write!(f, "{name}")
    }
}

/// Resolves the algorithm for a field: explicit configuration first, then
/// the per-type default.
pub fn select(config: &BTreeMap<String, Algorithm>, path: &str, itemtype: &ItemType) -> Algorithm {
    if let Some(algorithm) = config.get(path) {
        return *algorithm;
    }
    match itemtype {
        ItemType::ReferenceToObj { .. } => Algorithm::ReferenceToObject,
        _ => Algorithm::Standard,
    }
}

/// Rejects configurations pairing an algorithm with a field kind it cannot
/// merge.
pub fn check_applicable(algorithm: Algorithm, path: &str, itemtype: &ItemType) -> Result<()> {
    let ok = match algorithm {
        Algorithm::Standard | Algorithm::OptionalValue => true,
        Algorithm::Set => itemtype.is_collection(),
        Algorithm::ReferenceToObject => matches!(itemtype, ItemType::ReferenceToObj { .. }),
    };
    if ok {
        Ok(())
    } else {
        Err(Error::AlgorithmTypeMismatch {
            path: path.into(),
            algorithm: algorithm.to_string(),
        })
    }
}

/// Merges one field of the two heads of a projected tree.
pub fn merge_value(
    db: &Db,
    tree: &VersionTree,
    path: &str,
    itemtype: &ItemType,
    algorithm: Algorithm,
    visited: &mut BTreeSet<IdHash>,
) -> Result<Option<Value>> {
    check_applicable(algorithm, path, itemtype)?;
    let [h1, h2] = match tree.heads() {
        [h1, h2] => [*h1, *h2],
        _ => return Err(Error::internal("merge requires two heads")),
    };
    match algorithm {
        Algorithm::Standard => Ok(standard(tree, h1, h2)),
        Algorithm::OptionalValue => Ok(optional_value(tree, h1, h2, path)),
        Algorithm::Set => set_merge(tree, h1, h2, path, itemtype),
        Algorithm::ReferenceToObject => reference_merge(db, tree, h1, h2, visited),
    }
}

fn node_key(node: &TreeNode) -> (i64, String) {
    let hash = node
        .kind
        .version()
        .map(|v| v.data().to_hex())
        .unwrap_or_default();
    (node.creation_time(), hash)
}

/// The value at the node with the highest creation time wins; ties break on
/// the concrete hash.
fn standard(tree: &VersionTree, h1: usize, h2: usize) -> Option<Value> {
    let a = tree.node(h1);
    let b = tree.node(h2);
    if node_key(a) >= node_key(b) {
        a.value.clone()
    } else {
        b.value.clone()
    }
}

fn op_rank(op: Op) -> u8 {
    match op {
        Op::Set | Op::Add => 1,
        Op::Delete | Op::Remove => 0,
    }
}

/// Last transformation a node applied to `path`, if any.
fn last_op<'a>(node: &'a TreeNode, path: &str) -> Option<&'a Transformation> {
    node.pred_diff.as_ref()?.get(path)?.last()
}

fn cmp_by_op<R: Fn(&TreeNode) -> u8 + Copy>(
    rank: R,
) -> impl Fn(&TreeNode, &TreeNode) -> Ordering {
    move |a, b| {
        a.creation_time()
            .cmp(&b.creation_time())
            .then_with(|| rank(a).cmp(&rank(b)))
            .then_with(|| node_key(a).1.cmp(&node_key(b).1))
    }
}

/// Merges `(present, value)` for an optional field or map entry. The most
/// recent write wins; a later delete overrides an earlier write.
fn optional_value(tree: &VersionTree, h1: usize, h2: usize, path: &str) -> Option<Value> {
    let v1 = tree.node(h1).value.clone();
    let v2 = tree.node(h2).value.clone();
    if v1 == v2 {
        return v1;
    }
    let touched = |n: &TreeNode| last_op(n, path).is_some();
    let rank = |n: &TreeNode| last_op(n, path).map_or(0, |t| op_rank(t.op));
    let c1 = tree.find_max_predecessor(h1, touched, cmp_by_op(rank));
    let c2 = tree.find_max_predecessor(h2, touched, cmp_by_op(rank));
    let winner = match (c1, c2) {
        (None, None) => return tree.common_ancestor().and_then(|c| tree.node(c).value.clone()),
        (Some(c), None) | (None, Some(c)) => c,
        (Some(c1), Some(c2)) if c1 == c2 => c1,
        (Some(c1), Some(c2)) => {
            let cmp = cmp_by_op(rank);
            if cmp(tree.node(c1), tree.node(c2)) == Ordering::Less {
                c2
            } else {
                c1
            }
        }
    };
    tree.node(winner).value.clone()
}

/// A node's verdict on one element: added or removed.
fn element_op(node: &TreeNode, path: &str, canonical: &str) -> Option<bool> {
    let transformations = node.pred_diff.as_ref()?.get(path)?;
    let mut verdict = None;
    for t in transformations {
        match t.op {
            Op::Add => {
                if t.value.as_ref().map(Value::canonical_string).as_deref() == Some(canonical) {
                    verdict = Some(true);
                }
            }
            Op::Remove => {
                if t.value.as_ref().map(Value::canonical_string).as_deref() == Some(canonical) {
                    verdict = Some(false);
                }
            }
            // a whole-container write asserts full membership
            Op::Set => {
                if let Some(elements) = t.value.as_ref().and_then(Value::elements) {
                    verdict = Some(
                        elements
                            .iter()
                            .any(|e| e.canonical_string() == canonical),
                    );
                }
            }
            Op::Delete => verdict = Some(false),
        }
    }
    verdict
}

fn contains(value: Option<&Value>, canonical: &str) -> bool {
    value
        .and_then(Value::elements)
        .is_some_and(|e| e.iter().any(|e| e.canonical_string() == canonical))
}

/// Three-way element merge over the projected tree.
fn set_merge(
    tree: &VersionTree,
    h1: usize,
    h2: usize,
    path: &str,
    itemtype: &ItemType,
) -> Result<Option<Value>> {
    let a = tree.node(h1).value.clone();
    let b = tree.node(h2).value.clone();
    if a.is_none() && b.is_none() {
        return Ok(None);
    }
    let mut union: BTreeMap<String, Value> = BTreeMap::new();
    for side in [&a, &b] {
        if let Some(elements) = side.as_ref().and_then(Value::elements) {
            for e in elements {
                union.entry(e.canonical_string()).or_insert_with(|| e.clone());
            }
        }
    }
    let mut members = Vec::new();
    for (canonical, element) in union {
        let in_a = contains(a.as_ref(), &canonical);
        let in_b = contains(b.as_ref(), &canonical);
        let keep = if in_a == in_b {
            in_a
        } else {
            let has_op = |n: &TreeNode| element_op(n, path, &canonical).is_some();
            let rank = |n: &TreeNode| {
                element_op(n, path, &canonical).map_or(0, |added| u8::from(added))
            };
            let c1 = tree.find_max_predecessor(h1, has_op, cmp_by_op(rank));
            let c2 = tree.find_max_predecessor(h2, has_op, cmp_by_op(rank));
            match (c1, c2) {
                // no operation since the common history: its membership holds
                (None, None) => tree
                    .common_ancestor()
                    .map(|c| contains(tree.node(c).value.as_ref(), &canonical))
                    .unwrap_or(false),
                (Some(c), None) | (None, Some(c)) => {
                    element_op(tree.node(c), path, &canonical).unwrap_or(false)
                }
                (Some(c1), Some(c2)) if c1 == c2 => {
                    element_op(tree.node(c1), path, &canonical).unwrap_or(false)
                }
                (Some(c1), Some(c2)) => {
                    let cmp = cmp_by_op(rank);
                    let winner = if cmp(tree.node(c1), tree.node(c2)) == Ordering::Less {
                        c2
                    } else {
                        c1
                    };
                    element_op(tree.node(winner), path, &canonical).unwrap_or(false)
                }
            }
        };
        if keep {
            members.push(element);
        }
    }
    // canonical output order for every container kind keeps the merge
    // commutative
    Ok(Some(match itemtype {
        ItemType::Set { .. } => Value::set_from(members),
        ItemType::Bag { .. } => Value::Bag(members),
        _ => Value::Array(members),
    }))
}

/// Merges object references, recursing into the referenced objects'
/// version graphs when both sides are versions of the same id.
fn reference_merge(
    db: &Db,
    tree: &VersionTree,
    h1: usize,
    h2: usize,
    visited: &mut BTreeSet<IdHash>,
) -> Result<Option<Value>> {
    let v1 = tree.node(h1).value.clone();
    let v2 = tree.node(h2).value.clone();
    if v1 == v2 {
        return Ok(v1);
    }
    if let (Some(Value::Reference(Link::Obj(a))), Some(Value::Reference(Link::Obj(b)))) =
        (&v1, &v2)
    {
        let oa = db.get_object(*a)?;
        let ob = db.get_object(*b)?;
        if oa.type_name == ob.type_name && db.registry().is_versioned(&oa.type_name)? {
            let ida = crate::microdata::id_hash(db.registry(), &oa)?;
            let idb = crate::microdata::id_hash(db.registry(), &ob)?;
            if ida == idb && !visited.contains(&ida) {
                if let Some(head) = db.version_head(&ida)? {
                    let full = VersionTree::complete(db, head)?;
                    let node_for = |data: &crate::hash::Hash| {
                        full.nodes.iter().find_map(|n| {
                            n.kind
                                .version()
                                .filter(|v| v.data() == *data)
                                .and_then(|_| n.hash)
                        })
                    };
                    if let (Some(na), Some(nb)) = (node_for(a), node_for(b)) {
                        let merged = crate::merge::merge_inner(db, na, nb, visited)?;
                        return Ok(Some(Value::Reference(Link::Obj(merged.hash))));
                    }
                }
            }
        }
    }
    Ok(standard(tree, h1, h2))
}

