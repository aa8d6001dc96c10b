//! # The one content-addressed object database
//!
//! ## Objects and microdata
//! Every stored object is a typed, structured value serialized to a
//! deterministic HTML-like string ("microdata"). The SHA-256 of that string
//! is the object's name; equal content means equal hash, so writes are
//! idempotent and nothing is ever updated in place. BLOBs and CLOBs are
//! hashed over their raw bytes.
//!
//! ## Recipes
//! A recipe declares the fields of one type: primitives, references to
//! other objects/ids/CLOBs/BLOBs, maps, sets, bags, arrays, nested objects.
//! Recipes live in a per-instance registry, validate on registration and
//! resolve rule inheritance eagerly. A type with identity fields is
//! *versioned*: hashing just those fields yields the id-hash under which
//! all versions of the entity are grouped.
//!
//! ## Version graph
//! Each write of a versioned object appends a version-node (edge, change or
//! merge) to the id's history DAG. Nodes are ordinary unversioned objects,
//! so history replicates exactly like data. Depth grows by one along every
//! edge, which gives the graph construction its frontier ordering.
//!
//! ## CRDT merge
//! Two heads of one id merge without coordination: the tree down to the
//! common history is built, every field is dispatched to a merge algorithm
//! (last-writer-wins, three-way element merge, optional-value, or recursion
//! through an object reference), and the result is written as a merge node.
//! Merging is commutative, idempotent and convergent, which is what allows
//! peers to exchange heads in any order.
//!
//! ## Chum
//! Synchronization is pull-based: an exporter answers by-hash requests
//! gated by an access filter, an importer walks accessible roots bottom-up
//! so that storage only ever contains referentially closed subgraphs. The
//! protocol lives in the `one` crate on top of this one.
mod crdt;
mod diff;
mod error;
mod graph;
mod hash;
mod iter;
mod keys;
mod link;
mod merge;
mod microdata;
#[cfg(test)]
mod props;
mod recipe;
mod store;
mod value;

pub use crate::crdt::{check_applicable, merge_value, select, Algorithm};
pub use crate::diff::{apply, diff, DiffMap, Op, Transformation};
pub use crate::error::{Error, Result};
pub use crate::graph::{
    is_version_node_type, version_node_recipes, NodeBody, NodeKind, TreeNode, VersionNode,
    VersionTree, VERSION_NODE_CHANGE, VERSION_NODE_EDGE, VERSION_NODE_MERGE,
};
pub use crate::hash::{Hash, IdHash};
pub use crate::iter::{iterate, parse_path, Field, MapStrategy, Strategy, Visitor};
pub use crate::keys::{
    change_password, keys_object, keys_recipe, read_secret_key, verify, write_secret_keys,
    Keypair, MasterKey, SecretKind, KEYS_TYPE,
};
pub use crate::link::{
    find_all_hash_links, implode, implode_current, scan_links, IdResolver, ScannedLink,
};
pub use crate::merge::{merge, MergeResult};
pub use crate::microdata::{
    escape, id_hash, object_hash, parse, parse_any, parse_id, serialize, serialize_id, unescape,
    TYPE_PREFIX,
};
pub use crate::recipe::{Extract, Inherit, ItemType, Recipe, RecipeRule, Registry};
pub use crate::store::{
    Area, Db, MemStore, ObjectStore, StoredVersion, StreamWriter, WriteResult, WriteStatus,
};
pub use crate::value::{render_path, Link, LinkKind, Obj, PathSeg, Value};
