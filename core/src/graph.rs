//! The version graph of one id: a DAG of version-nodes ordered by
//! decreasing depth in an internal array, with predecessor/successor links
//! held as indices into that array.
//!
//! Version-nodes are themselves ordinary unversioned objects (`Edge`,
//! `Change`, `Merge` recipes below); the virtual `Empty` ancestor at depth
//! -1 exists only in memory.

use crate::diff::{diff, DiffMap};
use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::iter::parse_path;
use crate::recipe::{ItemType, Recipe, RecipeRule};
use crate::store::Db;
use crate::value::{Link, Obj, Value};
use std::collections::{BTreeSet, HashMap};

pub const VERSION_NODE_EDGE: &str = "VersionNodeEdge";
pub const VERSION_NODE_CHANGE: &str = "VersionNodeChange";
pub const VERSION_NODE_MERGE: &str = "VersionNodeMerge";

/// Recipes of the three stored version-node types; registered at init.
pub fn version_node_recipes() -> Vec<Recipe> {
    let node_types = || {
        ItemType::reference_to_obj([VERSION_NODE_EDGE, VERSION_NODE_CHANGE, VERSION_NODE_MERGE])
    };
    let common = || {
        vec![
            RecipeRule::new("data", ItemType::reference_to_obj(["*"])),
            RecipeRule::new("dataIdHash", ItemType::ReferenceToId {
                allowed: ["*".to_string()].into_iter().collect(),
            }),
            RecipeRule::new("dataType", ItemType::string()),
            RecipeRule::new("creationTime", ItemType::integer()),
        ]
    };
    let edge = common();
    let mut change = vec![RecipeRule::new("prev", node_types())];
    change.extend(common());
    change.push(RecipeRule::new("depth", ItemType::integer()));
    let mut merge = vec![RecipeRule::new("parents", ItemType::set_of(node_types()))];
    merge.extend(common());
    merge.push(RecipeRule::new("depth", ItemType::integer()));
    vec![
        Recipe::new(VERSION_NODE_EDGE, edge),
        Recipe::new(VERSION_NODE_CHANGE, change),
        Recipe::new(VERSION_NODE_MERGE, merge),
    ]
}

pub fn is_version_node_type(name: &str) -> bool {
    matches!(
        name,
        VERSION_NODE_EDGE | VERSION_NODE_CHANGE | VERSION_NODE_MERGE
    )
}

/// Fields shared by every stored version-node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeBody {
    pub data: Hash,
    pub data_id_hash: IdHash,
    pub data_type: String,
    pub creation_time: i64,
}

/// One stored step in an id's history.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VersionNode {
    /// First version of an id; its predecessor is the empty ancestor.
    Edge { body: NodeBody },
    Change {
        body: NodeBody,
        prev: Hash,
        depth: i64,
    },
    Merge {
        body: NodeBody,
        parents: BTreeSet<Hash>,
        depth: i64,
    },
}

impl VersionNode {
    pub fn body(&self) -> &NodeBody {
        match self {
            Self::Edge { body } | Self::Change { body, .. } | Self::Merge { body, .. } => body,
        }
    }

    pub fn data(&self) -> Hash {
        self.body().data
    }

    pub fn data_id_hash(&self) -> IdHash {
        self.body().data_id_hash
    }

    pub fn data_type(&self) -> &str {
        &self.body().data_type
    }

    pub fn creation_time(&self) -> i64 {
        self.body().creation_time
    }

    pub fn depth(&self) -> i64 {
        match self {
            Self::Edge { .. } => 0,
            Self::Change { depth, .. } | Self::Merge { depth, .. } => *depth,
        }
    }

    pub fn predecessors(&self) -> Vec<Hash> {
        match self {
            Self::Edge { .. } => Vec::new(),
            Self::Change { prev, .. } => vec![*prev],
            Self::Merge { parents, .. } => parents.iter().copied().collect(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Edge { .. } => VERSION_NODE_EDGE,
            Self::Change { .. } => VERSION_NODE_CHANGE,
            Self::Merge { .. } => VERSION_NODE_MERGE,
        }
    }

    pub fn to_obj(&self) -> Obj {
        let body = self.body();
        let mut obj = Obj::new(self.type_name())
            .with("data", Value::Reference(Link::Obj(body.data)))
            .with("dataIdHash", Value::Reference(Link::Id(body.data_id_hash)))
            .with("dataType", Value::String(body.data_type.clone()))
            .with("creationTime", Value::Integer(body.creation_time));
        match self {
            Self::Edge { .. } => {}
            Self::Change { prev, depth, .. } => {
                obj.set("prev", Value::Reference(Link::Obj(*prev)));
                obj.set("depth", Value::Integer(*depth));
            }
            Self::Merge { parents, depth, .. } => {
                obj.set(
                    "parents",
                    Value::set_from(
                        parents.iter().map(|p| Value::Reference(Link::Obj(*p))),
                    ),
                );
                obj.set("depth", Value::Integer(*depth));
            }
        }
        obj
    }

    pub fn from_obj(obj: &Obj) -> Result<Self> {
        let field = |name: &str| {
            obj.get(name).ok_or_else(|| Error::TypeMismatch {
                path: format!("{}.{name}", obj.type_name),
                expected: "version node field".into(),
                found: "missing field".into(),
            })
        };
        let obj_link = |name: &str| -> Result<Hash> {
            field(name)?
                .as_link()
                .and_then(|l| l.hash())
                .ok_or_else(|| Error::internal(format!("{name} is not an object reference")))
        };
        let body = NodeBody {
            data: obj_link("data")?,
            data_id_hash: field("dataIdHash")?
                .as_link()
                .and_then(|l| l.id_hash())
                .ok_or_else(|| Error::internal("dataIdHash is not an id reference"))?,
            data_type: field("dataType")?
                .as_str()
                .ok_or_else(|| Error::internal("dataType is not a string"))?
                .to_string(),
            creation_time: field("creationTime")?
                .as_i64()
                .ok_or_else(|| Error::internal("creationTime is not an integer"))?,
        };
        let depth = |name: &str| -> Result<i64> {
            field(name)?
                .as_i64()
                .ok_or_else(|| Error::internal("depth is not an integer"))
        };
        match obj.type_name.as_str() {
            VERSION_NODE_EDGE => Ok(Self::Edge { body }),
            VERSION_NODE_CHANGE => Ok(Self::Change {
                prev: obj_link("prev")?,
                depth: depth("depth")?,
                body,
            }),
            VERSION_NODE_MERGE => {
                let parents = field("parents")?
                    .elements()
                    .ok_or_else(|| Error::internal("parents is not a set"))?
                    .iter()
                    .map(|v| {
                        v.as_link()
                            .and_then(|l| l.hash())
                            .ok_or_else(|| Error::internal("parent is not an object reference"))
                    })
                    .collect::<Result<BTreeSet<Hash>>>()?;
                Ok(Self::Merge {
                    parents,
                    depth: depth("depth")?,
                    body,
                })
            }
            other => Err(Error::TypeMismatch {
                path: other.to_string(),
                expected: "a version node type".into(),
                found: other.to_string(),
            }),
        }
    }
}

/// In-memory node kind; `Empty` is the virtual ancestor at depth -1.
#[derive(Clone, Debug)]
pub enum NodeKind {
    Empty,
    Version(VersionNode),
}

impl NodeKind {
    pub fn depth(&self) -> i64 {
        match self {
            Self::Empty => -1,
            Self::Version(n) => n.depth(),
        }
    }

    pub fn version(&self) -> Option<&VersionNode> {
        match self {
            Self::Empty => None,
            Self::Version(n) => Some(n),
        }
    }
}

/// One arena slot of a [`VersionTree`].
#[derive(Clone, Debug)]
pub struct TreeNode {
    /// `None` only for the empty ancestor.
    pub hash: Option<Hash>,
    pub kind: NodeKind,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    /// The node's concrete data object, when loaded.
    pub obj: Option<Obj>,
    /// The subpath projection of `obj`, on projected trees.
    pub value: Option<Value>,
    /// Diff against the predecessor's data (`None` at the tree boundary;
    /// an edge diffs against nothing, which marks every field as set).
    pub pred_diff: Option<DiffMap>,
}

impl TreeNode {
    pub fn depth(&self) -> i64 {
        self.kind.depth()
    }

    pub fn creation_time(&self) -> i64 {
        self.kind.version().map_or(-1, VersionNode::creation_time)
    }
}

/// A DAG of version-nodes for one id, nodes sorted by decreasing depth.
#[derive(Clone, Debug)]
pub struct VersionTree {
    pub nodes: Vec<TreeNode>,
    index: HashMap<Hash, usize>,
    heads: Vec<usize>,
    common: Option<usize>,
    /// True when until-common-history collapsed because one head is an
    /// ancestor of the other.
    pub collapsed: bool,
}

impl VersionTree {
    /// Builds the complete tree reachable backwards from `head`.
    pub fn complete(db: &Db, head: Hash) -> Result<Self> {
        let mut collected = HashMap::new();
        let mut queue = vec![head];
        while let Some(hash) = queue.pop() {
            if collected.contains_key(&hash) {
                continue;
            }
            let node = db.get_version_node(hash)?;
            queue.extend(node.predecessors());
            collected.insert(hash, node);
        }
        Self::build(db, collected, vec![head], None, false)
    }

    /// Walks predecessors of both heads in depth-priority order until a
    /// single frontier element, the deepest common ancestor, remains.
    /// When one head turns out to be the other's ancestor the tree
    /// collapses to the deeper head alone.
    pub fn until_common_history(db: &Db, h1: Hash, h2: Hash) -> Result<Self> {
        let n1 = db.get_version_node(h1)?;
        let n2 = db.get_version_node(h2)?;
        if n1.data_id_hash() != n2.data_id_hash() {
            return Err(Error::NoCommonHistory {
                a: h1.to_hex(),
                b: h2.to_hex(),
            });
        }
        if h1 == h2 {
            let mut collected = HashMap::new();
            collected.insert(h1, n1);
            return Self::build(db, collected, vec![h1], Some(h1), true);
        }

        let mut collected: HashMap<Hash, VersionNode> = HashMap::new();
        collected.insert(h1, n1);
        collected.insert(h2, n2);
        // frontier ordered for depth-priority popping; the empty ancestor
        // is None. Predecessor depths are strictly decreasing, so a node is
        // only ever popped after everything that points at it.
        let mut frontier: BTreeSet<(i64, Option<Hash>)> = BTreeSet::new();
        frontier.insert((collected[&h1].depth(), Some(h1)));
        frontier.insert((collected[&h2].depth(), Some(h2)));
        while frontier.len() > 1 {
            let top = *frontier.iter().next_back().expect("frontier is non-empty");
            frontier.remove(&top);
            let hash = top
                .1
                .ok_or_else(|| Error::internal("empty ancestor popped before convergence"))?;
            let preds = collected[&hash].predecessors();
            if preds.is_empty() {
                frontier.insert((-1, None));
                continue;
            }
            for pred in preds {
                if let std::collections::hash_map::Entry::Vacant(e) = collected.entry(pred) {
                    let loaded = db.get_version_node(pred)?;
                    frontier.insert((loaded.depth(), Some(pred)));
                    e.insert(loaded);
                }
            }
        }
        let common = frontier.iter().next().and_then(|(_, h)| *h);

        if let Some(common) = common {
            if common == h1 || common == h2 {
                // ancestor collapse: keep only the deeper head
                let deeper = if common == h1 { h2 } else { h1 };
                let node = collected[&deeper].clone();
                let mut single = HashMap::new();
                single.insert(deeper, node);
                return Self::build(db, single, vec![deeper], Some(deeper), true);
            }
        }
        Self::build(db, collected, vec![h1, h2], common, false)
    }

    fn build(
        db: &Db,
        collected: HashMap<Hash, VersionNode>,
        heads: Vec<Hash>,
        common: Option<Hash>,
        collapsed: bool,
    ) -> Result<Self> {
        let mut order: Vec<(Hash, VersionNode)> = collected.into_iter().collect();
        order.sort_by(|(ha, a), (hb, b)| {
            b.depth()
                .cmp(&a.depth())
                .then_with(|| ha.to_hex().cmp(&hb.to_hex()))
        });
        // the boundary node's history is not part of the tree
        let needs_empty = order
            .iter()
            .any(|(h, n)| n.predecessors().is_empty() && Some(*h) != common);
        let mut nodes: Vec<TreeNode> = order
            .into_iter()
            .map(|(hash, node)| TreeNode {
                hash: Some(hash),
                kind: NodeKind::Version(node),
                preds: Vec::new(),
                succs: Vec::new(),
                obj: None,
                value: None,
                pred_diff: None,
            })
            .collect();
        if needs_empty && nodes.len() > 1 {
            nodes.push(TreeNode {
                hash: None,
                kind: NodeKind::Empty,
                preds: Vec::new(),
                succs: Vec::new(),
                obj: None,
                value: None,
                pred_diff: None,
            });
        }
        let index: HashMap<Hash, usize> = nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.hash.map(|h| (h, i)))
            .collect();
        let empty_index = nodes.iter().position(|n| n.hash.is_none());

        // resolve edges and check the depth invariants
        for i in 0..nodes.len() {
            let version = match nodes[i].kind.version() {
                Some(v) => v.clone(),
                None => continue,
            };
            if nodes[i].hash == common {
                continue;
            }
            let preds = version.predecessors();
            if preds.is_empty() {
                if let Some(e) = empty_index {
                    nodes[i].preds.push(e);
                    nodes[e].succs.push(i);
                }
                continue;
            }
            let mut max_pred_depth = None;
            for pred in preds {
                if let Some(&j) = index.get(&pred) {
                    nodes[i].preds.push(j);
                    nodes[j].succs.push(i);
                    max_pred_depth = Some(max_pred_depth.unwrap_or(i64::MIN).max(nodes[j].depth()));
                }
            }
            if let Some(max_pred_depth) = max_pred_depth {
                let expected = max_pred_depth + 1;
                let complete = nodes[i].preds.len() == version.predecessors().len();
                if complete && version.depth() != expected {
                    return Err(Error::internal(format!(
                        "depth {} of node {:?} is not {expected}",
                        version.depth(),
                        nodes[i].hash
                    )));
                }
            }
        }

        // load concrete objects and compute predecessor diffs
        for i in 0..nodes.len() {
            let data = match nodes[i].kind.version() {
                Some(version) => version.data(),
                None => continue,
            };
            nodes[i].obj = Some(db.get_object(data)?);
        }
        for i in 0..nodes.len() {
            let obj = match &nodes[i].obj {
                Some(o) => o.clone(),
                None => continue,
            };
            // merges diff against their deepest in-tree parent
            let pred = nodes[i]
                .preds
                .iter()
                .copied()
                .max_by_key(|&j| (nodes[j].depth(), nodes[j].hash.map(|h| h.to_hex())));
            let base = match pred {
                Some(j) => match &nodes[j].obj {
                    Some(o) => o.clone(),
                    None => Obj::new(obj.type_name.clone()),
                },
                None => continue,
            };
            nodes[i].pred_diff = Some(diff(db.registry(), &base, &obj)?);
        }

        let heads = heads
            .iter()
            .map(|h| {
                index
                    .get(h)
                    .copied()
                    .ok_or_else(|| Error::internal("head missing from tree"))
            })
            .collect::<Result<Vec<usize>>>()?;
        Ok(Self {
            nodes,
            common: common.and_then(|c| index.get(&c).copied()).or(match common {
                None => empty_index,
                Some(_) => None,
            }),
            index,
            heads,
            collapsed,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn heads(&self) -> &[usize] {
        &self.heads
    }

    /// Index of the deepest common ancestor (the empty node, if histories
    /// only meet at the beginning).
    pub fn common_ancestor(&self) -> Option<usize> {
        self.common
    }

    pub fn index_of(&self, hash: &Hash) -> Option<usize> {
        self.index.get(hash).copied()
    }

    pub fn node(&self, i: usize) -> &TreeNode {
        &self.nodes[i]
    }

    /// All matching nodes reachable backwards, stopping at the first match
    /// along each branch.
    pub fn find_predecessors(
        &self,
        start: usize,
        matches: impl Fn(&TreeNode) -> bool,
        include_self: bool,
    ) -> Vec<usize> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue = if include_self {
            vec![start]
        } else {
            self.nodes[start].preds.clone()
        };
        while let Some(i) = queue.pop() {
            if !seen.insert(i) {
                continue;
            }
            if matches(&self.nodes[i]) {
                found.insert(i);
            } else {
                queue.extend(self.nodes[i].preds.iter().copied());
            }
        }
        found.into_iter().collect()
    }

    /// Forward variant of [`Self::find_predecessors`].
    pub fn find_successors(
        &self,
        start: usize,
        matches: impl Fn(&TreeNode) -> bool,
        include_self: bool,
    ) -> Vec<usize> {
        let mut found = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue = if include_self {
            vec![start]
        } else {
            self.nodes[start].succs.clone()
        };
        while let Some(i) = queue.pop() {
            if !seen.insert(i) {
                continue;
            }
            if matches(&self.nodes[i]) {
                found.insert(i);
            } else {
                queue.extend(self.nodes[i].succs.iter().copied());
            }
        }
        found.into_iter().collect()
    }

    fn is_ancestor(&self, a: usize, b: usize) -> bool {
        let mut queue = self.nodes[b].preds.clone();
        let mut seen = BTreeSet::new();
        while let Some(i) = queue.pop() {
            if i == a {
                return true;
            }
            if seen.insert(i) {
                queue.extend(self.nodes[i].preds.iter().copied());
            }
        }
        false
    }

    /// Matches (the start node included) that are not themselves ancestors
    /// of another match.
    pub fn find_top_level_predecessors(
        &self,
        start: usize,
        matches: impl Fn(&TreeNode) -> bool,
    ) -> Vec<usize> {
        let mut all = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut queue = vec![start];
        while let Some(i) = queue.pop() {
            if !seen.insert(i) {
                continue;
            }
            if matches(&self.nodes[i]) {
                all.insert(i);
            }
            queue.extend(self.nodes[i].preds.iter().copied());
        }
        all.iter()
            .copied()
            .filter(|&m| !all.iter().any(|&other| other != m && self.is_ancestor(m, other)))
            .collect()
    }

    /// Topmost match under a total order.
    pub fn find_max_predecessor(
        &self,
        start: usize,
        matches: impl Fn(&TreeNode) -> bool,
        cmp: impl Fn(&TreeNode, &TreeNode) -> std::cmp::Ordering,
    ) -> Option<usize> {
        self.find_top_level_predecessors(start, matches)
            .into_iter()
            .max_by(|&a, &b| cmp(&self.nodes[a], &self.nodes[b]))
    }

    /// Rebuilds the tree with each node's data replaced by the value at
    /// `path` (optionally dereferencing object references) and each
    /// predecessor diff restricted to that path.
    pub fn project(&self, db: &Db, path: &str, deref: bool) -> Result<VersionTree> {
        let mut projected = self.clone();
        let prefix = format!("{path}.");
        for node in &mut projected.nodes {
            if let Some(obj) = &node.obj {
                let segs = parse_path(db.registry(), &obj.type_name, path)?;
                let mut value = obj.at(&segs).cloned();
                if deref {
                    if let Some(Value::Reference(Link::Obj(hash))) = &value {
                        let target = db.get_object(*hash)?;
                        value = Some(Value::Object(target.fields));
                    }
                }
                node.value = value;
            }
            if let Some(diff) = node.pred_diff.take() {
                node.pred_diff = Some(
                    diff.into_iter()
                        .filter(|(k, _)| k.as_str() == path || k.starts_with(&prefix))
                        .collect(),
                );
            }
        }
        Ok(projected)
    }
}
