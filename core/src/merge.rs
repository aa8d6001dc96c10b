//! The merge coordinator: builds the tree to the common history, dispatches
//! every field to its CRDT algorithm, and writes the merge node.

use crate::crdt;
use crate::error::{Error, Result};
use crate::graph::{NodeBody, VersionNode, VersionTree};
use crate::hash::{Hash, IdHash};
use crate::iter::{iterate, Field, MapStrategy, Strategy, Visitor};
use crate::store::{now_ms, Db};
use crate::value::{Obj, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of merging two version-node heads of one id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MergeResult {
    /// True when one head already contained the other's history.
    pub already_merged: bool,
    /// The merge node (or the surviving head when already merged).
    pub node: Hash,
    /// Concrete hash of the merged data.
    pub hash: Hash,
    pub id_hash: IdHash,
}

/// Merges the histories at two version-node hashes, persisting the merged
/// object and a merge node, and advancing the id's head.
pub fn merge(db: &Db, h1: Hash, h2: Hash) -> Result<MergeResult> {
    let mut visited = BTreeSet::new();
    merge_inner(db, h1, h2, &mut visited)
}

pub(crate) fn merge_inner(
    db: &Db,
    h1: Hash,
    h2: Hash,
    visited: &mut BTreeSet<IdHash>,
) -> Result<MergeResult> {
    let tree = VersionTree::until_common_history(db, h1, h2)?;
    let head = tree.heads()[0];
    let head_node = tree
        .node(head)
        .kind
        .version()
        .ok_or_else(|| Error::internal("head is not a version node"))?
        .clone();
    let id_hash = head_node.data_id_hash();
    if tree.collapsed {
        let node = tree.node(head).hash.ok_or_else(|| Error::internal("head without hash"))?;
        tracing::debug!("{} and {} already merged at {}", h1, h2, node);
        db.set_version_head(&id_hash, node)?;
        return Ok(MergeResult {
            already_merged: true,
            node,
            hash: head_node.data(),
            id_hash,
        });
    }
    if !visited.insert(id_hash) {
        return Err(Error::internal(format!(
            "reference cycle while merging {id_hash}"
        )));
    }

    let [i1, i2] = match tree.heads() {
        [a, b] => [*a, *b],
        _ => return Err(Error::internal("merge requires two heads")),
    };
    let n1 = tree.node(i1).kind.version().expect("head is a version").clone();
    let n2 = tree.node(i2).kind.version().expect("head is a version").clone();
    if n1.data_type() != n2.data_type() {
        return Err(Error::TypeMismatch {
            path: String::new(),
            expected: n1.data_type().into(),
            found: n2.data_type().into(),
        });
    }
    let obj1 = tree.node(i1).obj.clone().ok_or_else(|| Error::internal("head without data"))?;
    let obj2 = tree.node(i2).obj.clone().ok_or_else(|| Error::internal("head without data"))?;

    let mut visitor = MergeVisitor {
        db,
        tree: &tree,
        visited,
        merged: BTreeMap::new(),
    };
    let mut heads = [obj1, obj2];
    iterate(db.registry(), n1.data_type(), &mut heads, &mut visitor)?;
    let merged = Obj {
        type_name: n1.data_type().to_string(),
        fields: visitor.merged,
    };

    let merged_md = crate::microdata::serialize(db.registry(), &merged)?;
    let merged_id = crate::microdata::id_hash(db.registry(), &merged)?;
    if merged_id != id_hash {
        return Err(Error::internal("merge changed the identity projection"));
    }
    let hash = db.put_microdata(&merged_md)?;
    let node = VersionNode::Merge {
        body: NodeBody {
            data: hash,
            data_id_hash: id_hash,
            data_type: n1.data_type().into(),
            creation_time: now_ms(),
        },
        parents: [h1, h2].into_iter().collect(),
        depth: 1 + n1.depth().max(n2.depth()),
    };
    let node = db.store_version_node(&node)?;
    db.set_version_head(&id_hash, node)?;
    tracing::debug!("merged {} and {} into {}", h1, h2, node);
    Ok(MergeResult {
        already_merged: false,
        node,
        hash,
        id_hash,
    })
}

/// Dispatches every top-level field to its algorithm over a subpath
/// projection; never descends (the algorithms own their subtrees).
struct MergeVisitor<'a, 'v> {
    db: &'a Db,
    tree: &'a VersionTree,
    visited: &'v mut BTreeSet<IdHash>,
    merged: BTreeMap<String, Value>,
}

impl<'a, 'v> MergeVisitor<'a, 'v> {
    fn merge_field(&mut self, field: &Field) -> Result<()> {
        let projected = self.tree.project(self.db, &field.path, false)?;
        let value = crdt::merge_value(
            self.db,
            &projected,
            &field.path,
            field.itemtype,
            field.algorithm,
            self.visited,
        )?;
        if let Some(value) = value {
            self.merged.insert(field.path.clone(), value);
        }
        Ok(())
    }
}

impl<'a, 'v> Visitor for MergeVisitor<'a, 'v> {
    fn on_value(&mut self, field: &mut Field) -> Result<()> {
        self.merge_field(field)
    }

    fn on_object(&mut self, field: &mut Field) -> Result<Strategy> {
        self.merge_field(field)?;
        Ok(Strategy::Off)
    }

    fn on_collection(&mut self, field: &mut Field) -> Result<Strategy> {
        self.merge_field(field)?;
        Ok(Strategy::Off)
    }

    fn on_map(&mut self, field: &mut Field) -> Result<MapStrategy> {
        self.merge_field(field)?;
        Ok(MapStrategy {
            keys: Strategy::Off,
            values: Strategy::Off,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::Algorithm;
    use crate::recipe::{ItemType, Recipe, RecipeRule};
    use crate::value::Link;

    fn tags_db() -> Db {
        let db = Db::memory().unwrap();
        db.registry()
            .register(
                Recipe::new(
                    "Tags",
                    vec![
                        RecipeRule::new("id", ItemType::string()).id(),
                        RecipeRule::new("tags", ItemType::set_of(ItemType::string())),
                        RecipeRule::new("note", ItemType::string()).optional(),
                    ],
                )
                .with_crdt("tags", Algorithm::Set)
                .with_crdt("note", Algorithm::OptionalValue),
            )
            .unwrap();
        db
    }

    fn tags(tags: &[&str]) -> Obj {
        Obj::new("Tags")
            .with("id", Value::String("x".into()))
            .with(
                "tags",
                Value::set_from(tags.iter().map(|t| Value::String((*t).into()))),
            )
    }

    fn set_of(tags: &[&str]) -> Value {
        Value::set_from(tags.iter().map(|t| Value::String((*t).into())))
    }

    #[test]
    fn set_crdt_three_way() {
        let db = tags_db();
        // base {a,b}; H1 adds c; H2 removes b; merge = {a,c}
        let base = db.store_versioned_object(&tags(&["a", "b"])).unwrap();
        let h1 = db.store_versioned_object(&tags(&["a", "b", "c"])).unwrap();
        db.set_version_head(&base.id_hash, base.node).unwrap();
        let h2 = db.store_versioned_object(&tags(&["a"])).unwrap();

        let result = merge(&db, h1.node, h2.node).unwrap();
        assert!(!result.already_merged);
        let merged = db.get_object(result.hash).unwrap();
        assert_eq!(merged.get("tags"), Some(&set_of(&["a", "c"])));

        let node = db.get_version_node(result.node).unwrap();
        assert_eq!(node.depth(), 2);
        assert_eq!(db.version_head(&base.id_hash).unwrap(), Some(result.node));
    }

    #[test]
    fn merge_is_commutative_and_idempotent() {
        let db = tags_db();
        let base = db.store_versioned_object(&tags(&["a", "b"])).unwrap();
        let h1 = db.store_versioned_object(&tags(&["a", "b", "c"])).unwrap();
        db.set_version_head(&base.id_hash, base.node).unwrap();
        let h2 = db.store_versioned_object(&tags(&["a"])).unwrap();

        let ab = merge(&db, h1.node, h2.node).unwrap();
        let ba = merge(&db, h2.node, h1.node).unwrap();
        assert_eq!(ab.hash, ba.hash);

        // merge(h, h) is a no-op
        let same = merge(&db, h1.node, h1.node).unwrap();
        assert!(same.already_merged);
        assert_eq!(same.node, h1.node);

        // merge(h1, merge(h1, h2)) = merge(h1, h2)
        let again = merge(&db, h1.node, ab.node).unwrap();
        assert!(again.already_merged);
        assert_eq!(again.hash, ab.hash);
    }

    #[test]
    fn ancestor_heads_collapse() {
        let db = tags_db();
        let v1 = db.store_versioned_object(&tags(&["a"])).unwrap();
        let v2 = db.store_versioned_object(&tags(&["a", "b"])).unwrap();
        let result = merge(&db, v1.node, v2.node).unwrap();
        assert!(result.already_merged);
        assert_eq!(result.node, v2.node);
        assert_eq!(result.hash, v2.hash);
    }

    #[test]
    fn optional_value_delete_vs_set() {
        let db = tags_db();
        let mut with_note = tags(&["a"]);
        with_note.set("note", Value::String("old".into()));
        let base = db.store_versioned_object(&with_note).unwrap();
        // H1 deletes the note
        let h1 = db.store_versioned_object(&tags(&["a"])).unwrap();
        db.set_version_head(&base.id_hash, base.node).unwrap();
        // H2 rewrites it
        let mut rewritten = tags(&["a"]);
        rewritten.set("note", Value::String("new".into()));
        let h2 = db.store_versioned_object(&rewritten).unwrap();

        let result = merge(&db, h1.node, h2.node).unwrap();
        let merged = db.get_object(result.hash).unwrap();
        // h2 was written after (or in the same instant as) h1, and on a
        // creation-time tie the write outranks the delete
        assert_eq!(merged.get("note"), Some(&Value::String("new".into())));
        let reversed = merge(&db, h2.node, h1.node).unwrap();
        assert_eq!(result.hash, reversed.hash);
    }

    #[test]
    fn standard_lww_on_leaves() {
        let db = Db::memory().unwrap();
        db.registry()
            .register(Recipe::new(
                "Doc",
                vec![
                    RecipeRule::new("name", ItemType::string()).id(),
                    RecipeRule::new("body", ItemType::string()),
                ],
            ))
            .unwrap();
        let doc = |body: &str| {
            Obj::new("Doc")
                .with("name", Value::String("d".into()))
                .with("body", Value::String(body.into()))
        };
        let base = db.store_versioned_object(&doc("base")).unwrap();
        let h1 = db.store_versioned_object(&doc("one")).unwrap();
        db.set_version_head(&base.id_hash, base.node).unwrap();
        let h2 = db.store_versioned_object(&doc("two")).unwrap();

        let result = merge(&db, h1.node, h2.node).unwrap();
        let merged = db.get_object(result.hash).unwrap();
        let body = merged.get("body").unwrap().as_str().unwrap();
        assert!(body == "one" || body == "two");
        // both orders agree on the winner
        let other = merge(&db, h2.node, h1.node).unwrap();
        assert_eq!(result.hash, other.hash);
    }

    #[test]
    fn algorithm_type_mismatch_aborts() {
        let db = Db::memory().unwrap();
        db.registry()
            .register(
                Recipe::new(
                    "Bad",
                    vec![
                        RecipeRule::new("id", ItemType::string()).id(),
                        RecipeRule::new("leaf", ItemType::string()),
                    ],
                )
                .with_crdt("leaf", Algorithm::Set),
            )
            .unwrap();
        let obj = |s: &str| {
            Obj::new("Bad")
                .with("id", Value::String("x".into()))
                .with("leaf", Value::String(s.into()))
        };
        let base = db.store_versioned_object(&obj("a")).unwrap();
        let h1 = db.store_versioned_object(&obj("b")).unwrap();
        db.set_version_head(&base.id_hash, base.node).unwrap();
        let h2 = db.store_versioned_object(&obj("c")).unwrap();
        assert!(matches!(
            merge(&db, h1.node, h2.node).unwrap_err(),
            Error::AlgorithmTypeMismatch { .. }
        ));
    }

    proptest::proptest! {
        /// Any two divergent operation sequences merge to the same hash in
        /// either order, and remerging reaches a fixpoint.
        #[test]
        fn set_crdt_converges(
            ops1 in proptest::collection::vec((proptest::bool::ANY, 0u8..5), 0..6),
            ops2 in proptest::collection::vec((proptest::bool::ANY, 0u8..5), 0..6),
        ) {
            let db = tags_db();
            let base = db.store_versioned_object(&tags(&["e0"])).unwrap();

            let replica = |ops: &[(bool, u8)]| {
                db.set_version_head(&base.id_hash, base.node).unwrap();
                let mut elements: std::collections::BTreeSet<String> =
                    ["e0".to_string()].into_iter().collect();
                let mut head = base;
                for (add, e) in ops {
                    let e = format!("e{e}");
                    if *add {
                        elements.insert(e);
                    } else {
                        elements.remove(&e);
                    }
                    let refs: Vec<&str> = elements.iter().map(String::as_str).collect();
                    head = db.store_versioned_object(&tags(&refs)).unwrap();
                }
                head
            };
            let h1 = replica(&ops1);
            let h2 = replica(&ops2);

            let ab = merge(&db, h1.node, h2.node).unwrap();
            let ba = merge(&db, h2.node, h1.node).unwrap();
            proptest::prop_assert_eq!(ab.hash, ba.hash);
            let fix = merge(&db, ab.node, h2.node).unwrap();
            proptest::prop_assert!(fix.already_merged);
            proptest::prop_assert_eq!(fix.hash, ab.hash);
        }
    }

    #[test]
    fn reference_to_object_recurses() {
        let db = Db::memory().unwrap();
        db.registry()
            .register(
                Recipe::new(
                    "Inner",
                    vec![
                        RecipeRule::new("id", ItemType::string()).id(),
                        RecipeRule::new("items", ItemType::set_of(ItemType::string())),
                    ],
                )
                .with_crdt("items", Algorithm::Set),
            )
            .unwrap();
        db.registry()
            .register(Recipe::new(
                "Outer",
                vec![
                    RecipeRule::new("id", ItemType::string()).id(),
                    RecipeRule::new("inner", ItemType::reference_to_obj(["Inner"])),
                ],
            ))
            .unwrap();
        let inner = |items: &[&str]| {
            Obj::new("Inner")
                .with("id", Value::String("i".into()))
                .with(
                    "items",
                    Value::set_from(items.iter().map(|s| Value::String((*s).into()))),
                )
        };
        let outer = |h: Hash| {
            Obj::new("Outer")
                .with("id", Value::String("o".into()))
                .with("inner", Value::Reference(Link::Obj(h)))
        };

        let ibase = db.store_versioned_object(&inner(&["x"])).unwrap();
        let obase = db.store_versioned_object(&outer(ibase.hash)).unwrap();

        let i1 = db.store_versioned_object(&inner(&["x", "y"])).unwrap();
        let o1 = db.store_versioned_object(&outer(i1.hash)).unwrap();

        db.set_version_head(&ibase.id_hash, ibase.node).unwrap();
        db.set_version_head(&obase.id_hash, obase.node).unwrap();
        let i2 = db.store_versioned_object(&inner(&["x", "z"])).unwrap();
        let o2 = db.store_versioned_object(&outer(i2.hash)).unwrap();
        // make both inner versions reachable for the recursion
        crate::merge::merge(&db, i1.node, i2.node).unwrap();

        let result = merge(&db, o1.node, o2.node).unwrap();
        let merged = db.get_object(result.hash).unwrap();
        let inner_ref = merged.get("inner").unwrap().as_link().unwrap().hash().unwrap();
        let merged_inner = db.get_object(inner_ref).unwrap();
        assert_eq!(
            merged_inner.get("items"),
            Some(&Value::set_from([
                Value::String("x".into()),
                Value::String("y".into()),
                Value::String("z".into())
            ]))
        );
    }
}
