//! The object store contract this crate consumes, a memory-backed
//! implementation, and the `Db` handle combining a store with the recipe
//! registry.
//!
//! Raw storage is deliberately narrow: put/get/remove/list by name per
//! area. Everything content-addressed (hash verification, reverse maps,
//! version heads, version-node creation) lives on [`Db`] on top of it.

use crate::error::{Error, Result};
use crate::graph::{version_node_recipes, NodeBody, VersionNode};
use crate::hash::{Hash, IdHash};
use crate::link::scan_links;
use crate::microdata;
use crate::recipe::Registry;
use crate::value::Obj;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Storage areas. `objects` holds microdata and BLOB/CLOB content by hash;
/// the rest are named files with component-defined contents.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Area {
    Objects,
    Private,
    Tmp,
    Rmaps,
    Vheads,
    Acache,
}

/// Minimal contract of the raw storage collaborator. Concurrent reads are
/// safe; writes of the same name must be idempotent (content-addressed
/// names always carry identical bytes).
pub trait ObjectStore: Send + Sync {
    fn exists(&self, area: Area, name: &str) -> Result<bool>;
    fn read(&self, area: Area, name: &str) -> Result<Vec<u8>>;
    fn write(&self, area: Area, name: &str, bytes: &[u8]) -> Result<()>;
    fn remove(&self, area: Area, name: &str) -> Result<()>;
    fn list(&self, area: Area) -> Result<Vec<String>>;
}

/// Test-grade in-memory store.
#[derive(Default)]
pub struct MemStore {
    files: Mutex<BTreeMap<(Area, String), Vec<u8>>>,
}

impl ObjectStore for MemStore {
    fn exists(&self, area: Area, name: &str) -> Result<bool> {
        Ok(self.files.lock().contains_key(&(area, name.to_string())))
    }

    fn read(&self, area: Area, name: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(&(area, name.to_string()))
            .cloned()
            .ok_or_else(|| Error::internal(format!("{area:?}/{name} not found")))
    }

    fn write(&self, area: Area, name: &str, bytes: &[u8]) -> Result<()> {
        self.files
            .lock()
            .insert((area, name.to_string()), bytes.to_vec());
        Ok(())
    }

    fn remove(&self, area: Area, name: &str) -> Result<()> {
        self.files.lock().remove(&(area, name.to_string()));
        Ok(())
    }

    fn list(&self, area: Area) -> Result<Vec<String>> {
        Ok(self
            .files
            .lock()
            .keys()
            .filter(|(a, _)| *a == area)
            .map(|(_, n)| n.clone())
            .collect())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteStatus {
    New,
    Exists,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteResult {
    pub hash: Hash,
    pub status: WriteStatus,
}

/// Content-addressed streaming write; nothing becomes visible before
/// [`StreamWriter::end`].
pub struct StreamWriter {
    store: Arc<dyn ObjectStore>,
    buf: Vec<u8>,
}

impl StreamWriter {
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn end(self) -> Result<WriteResult> {
        let hash = Hash::digest(&self.buf);
        let name = hash.to_hex();
        let status = if self.store.exists(Area::Objects, &name)? {
            WriteStatus::Exists
        } else {
            self.store.write(Area::Objects, &name, &self.buf)?;
            WriteStatus::New
        };
        Ok(WriteResult { hash, status })
    }

    pub fn cancel(self) {}
}

/// The outcome of storing one version of a versioned object.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StoredVersion {
    pub hash: Hash,
    pub id_hash: IdHash,
    /// Hash of the version-node recording this version.
    pub node: Hash,
}

/// A store plus the recipe registry: the handle every operation takes.
/// Multiple instances in one process share nothing.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn ObjectStore>,
    registry: Registry,
}

impl Db {
    /// Wraps a store, registering the built-in recipes.
    pub fn new(store: Arc<dyn ObjectStore>) -> Result<Self> {
        let registry = Registry::new();
        for recipe in version_node_recipes() {
            registry.register(recipe)?;
        }
        registry.register(crate::keys::keys_recipe())?;
        Ok(Self { store, registry })
    }

    pub fn memory() -> Result<Self> {
        Self::new(Arc::new(MemStore::default()))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn exists(&self, hash: &Hash) -> Result<bool> {
        self.store.exists(Area::Objects, &hash.to_hex())
    }

    pub fn read_bytes(&self, hash: Hash) -> Result<Vec<u8>> {
        self.store.read(Area::Objects, &hash.to_hex())
    }

    pub fn read_text(&self, hash: Hash) -> Result<String> {
        String::from_utf8(self.read_bytes(hash)?)
            .map_err(|_| Error::internal(format!("{hash} is not utf-8")))
    }

    /// Reads the microdata of a stored object.
    pub fn get_microdata(&self, hash: Hash) -> Result<String> {
        self.read_text(hash)
    }

    pub fn get_object(&self, hash: Hash) -> Result<Obj> {
        microdata::parse(&self.registry, &self.get_microdata(hash)?)
    }

    pub fn get_version_node(&self, hash: Hash) -> Result<VersionNode> {
        VersionNode::from_obj(&self.get_object(hash)?)
    }

    /// Writes microdata under its computed hash and records reverse-map
    /// entries for every link it contains. Idempotent.
    pub fn put_microdata(&self, microdata: &str) -> Result<Hash> {
        let hash = Hash::digest(microdata.as_bytes());
        let name = hash.to_hex();
        if !self.store.exists(Area::Objects, &name)? {
            self.store.write(Area::Objects, &name, microdata.as_bytes())?;
            self.update_reverse_maps(hash, microdata)?;
        }
        Ok(hash)
    }

    /// Writes microdata only if it hashes to `expected`.
    pub fn write_text(&self, microdata: &str, expected: Hash) -> Result<()> {
        let computed = Hash::digest(microdata.as_bytes());
        if computed != expected {
            return Err(Error::HashMismatch {
                expected: expected.to_hex(),
                computed: computed.to_hex(),
            });
        }
        self.put_microdata(microdata)?;
        Ok(())
    }

    fn update_reverse_maps(&self, referencing: Hash, microdata: &str) -> Result<()> {
        for link in scan_links(microdata)? {
            let target = link.link.to_hex();
            let mut entries = match self.store.exists(Area::Rmaps, &target)? {
                true => self.store.read(Area::Rmaps, &target)?,
                false => Vec::new(),
            };
            let line = format!("{}\n", referencing.to_hex());
            if !String::from_utf8_lossy(&entries).contains(line.trim_end()) {
                entries.extend_from_slice(line.as_bytes());
                self.store.write(Area::Rmaps, &target, &entries)?;
            }
        }
        Ok(())
    }

    /// Hashes that reference `target`, from the reverse maps.
    pub fn referencing_hashes(&self, target: &str) -> Result<Vec<Hash>> {
        if !self.store.exists(Area::Rmaps, target)? {
            return Ok(Vec::new());
        }
        let raw = self.store.read(Area::Rmaps, target)?;
        String::from_utf8_lossy(&raw)
            .lines()
            .map(|l| l.parse())
            .collect()
    }

    /// Serialize-hash-write for a type without identity fields.
    pub fn store_unversioned_object(&self, obj: &Obj) -> Result<Hash> {
        if self.registry.is_versioned(&obj.type_name)? {
            return Err(Error::TypeMismatch {
                path: obj.type_name.clone(),
                expected: "unversioned object type".into(),
                found: "versioned".into(),
            });
        }
        self.put_microdata(&microdata::serialize(&self.registry, obj)?)
    }

    /// Serialize-hash-write for a versioned object, appending to the id's
    /// version graph and advancing its head. Writing the bytes already at
    /// the head is a no-op returning the existing node.
    pub fn store_versioned_object(&self, obj: &Obj) -> Result<StoredVersion> {
        let md = microdata::serialize(&self.registry, obj)?;
        let id_hash = microdata::id_hash(&self.registry, obj)?;
        let hash = Hash::digest(md.as_bytes());
        let body = NodeBody {
            data: hash,
            data_id_hash: id_hash,
            data_type: obj.type_name.clone(),
            creation_time: now_ms(),
        };
        let node = match self.version_head(&id_hash)? {
            None => VersionNode::Edge { body },
            Some(prev) => {
                let prev_node = self.get_version_node(prev)?;
                if prev_node.data() == hash {
                    return Ok(StoredVersion {
                        hash,
                        id_hash,
                        node: prev,
                    });
                }
                VersionNode::Change {
                    body,
                    prev,
                    depth: prev_node.depth() + 1,
                }
            }
        };
        self.put_microdata(&md)?;
        let node_hash = self.store_version_node(&node)?;
        self.set_version_head(&id_hash, node_hash)?;
        tracing::debug!("stored version {} of {}", node_hash, id_hash);
        Ok(StoredVersion {
            hash,
            id_hash,
            node: node_hash,
        })
    }

    /// Writes a version-node object. The node's parents must already be
    /// stored; the head is not touched.
    pub fn store_version_node(&self, node: &VersionNode) -> Result<Hash> {
        for pred in node.predecessors() {
            if !self.exists(&pred)? {
                return Err(Error::internal(format!(
                    "version node predecessor {pred} not stored"
                )));
            }
        }
        self.put_microdata(&microdata::serialize(&self.registry, &node.to_obj())?)
    }

    /// Current head version-node for an id.
    pub fn version_head(&self, id: &IdHash) -> Result<Option<Hash>> {
        let name = id.to_hex();
        if !self.store.exists(Area::Vheads, &name)? {
            return Ok(None);
        }
        let raw = self.store.read(Area::Vheads, &name)?;
        let hex = String::from_utf8_lossy(&raw);
        Ok(Some(hex.trim().parse()?))
    }

    pub fn set_version_head(&self, id: &IdHash, node: Hash) -> Result<()> {
        self.store
            .write(Area::Vheads, &id.to_hex(), node.to_hex().as_bytes())
    }

    /// Ids with a stored head.
    pub fn version_heads(&self) -> Result<Vec<IdHash>> {
        self.store
            .list(Area::Vheads)?
            .iter()
            .map(|n| n.parse())
            .collect()
    }

    /// Id-microdata of an id's current head version.
    pub fn id_microdata(&self, id: &IdHash) -> Result<String> {
        let head = self.version_head(id)?.ok_or_else(|| Error::BadHash {
            value: id.to_hex(),
        })?;
        let node = self.get_version_node(head)?;
        let obj = self.get_object(node.data())?;
        microdata::serialize_id(&self.registry, &obj)
    }

    pub fn write_blob(&self, bytes: &[u8]) -> Result<Hash> {
        let hash = Hash::digest(bytes);
        self.store.write(Area::Objects, &hash.to_hex(), bytes)?;
        Ok(hash)
    }

    pub fn write_clob(&self, text: &str) -> Result<Hash> {
        self.write_blob(text.as_bytes())
    }

    pub fn create_write_stream(&self) -> StreamWriter {
        StreamWriter {
            store: self.store.clone(),
            buf: Vec::new(),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
