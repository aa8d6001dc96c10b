//! Content-addressed object database with a git-like version history,
//! CRDT-based multi-writer merge, and pull-based synchronization between
//! peer instances ("Chum").
//!
//! The data layer lives in [`one_core`]; this crate adds the instance
//! handle and the Chum importer/exporter pair on top of a pluggable frame
//! transport and access filter.

mod conn;
mod exporter;
mod filter;
mod importer;
mod lane;
mod wire;

pub use one_core::{
    apply, change_password, diff, id_hash, implode, implode_current, iterate, keys_object,
    merge, object_hash, parse, parse_any, parse_id, read_secret_key, scan_links, serialize,
    serialize_id, verify, write_secret_keys, Algorithm, Area, Db, DiffMap, Error, Hash, IdHash,
    ItemType, Keypair, Link, LinkKind, MasterKey, MemStore, MergeResult, Obj, ObjectStore, Recipe,
    RecipeRule, Registry, Result, SecretKind, StoredVersion, Value, VersionNode, VersionTree,
};

pub use crate::conn::{memory_pair, Connection, Frame, MemConnection};
pub use crate::exporter::Exporter;
pub use crate::filter::{AccessFilter, AllowAll, Grant, StaticFilter};
pub use crate::importer::{ImportEvent, Importer, ImporterOptions};
pub use crate::lane::Lanes;
pub use crate::wire::{
    AccessibleObject, BlobEncoding, Child, ChildKind, Request, PROTOCOL_VERSION,
};

use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// One database instance: a store, its recipe registry, and the
/// serialization lanes. Instances share no process-wide state.
pub struct Instance {
    db: Db,
    lanes: Lanes,
}

impl Instance {
    /// Opens an instance over a store, initializing logging once.
    pub fn new(store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        tracing_log::LogTracer::init().ok();
        let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_span_events(FmtSpan::ACTIVE | FmtSpan::CLOSE)
            .with_env_filter(EnvFilter::new(env))
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber).ok();
        log_panics::init();

        Ok(Self {
            db: Db::new(store)?,
            lanes: Lanes::new(),
        })
    }

    pub fn memory() -> anyhow::Result<Self> {
        Self::new(Arc::new(MemStore::default()))
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn registry(&self) -> &Registry {
        self.db.registry()
    }

    /// Registers an application recipe.
    pub fn register(&self, recipe: Recipe) -> Result<()> {
        self.db.registry().register(recipe)
    }

    /// Merges two version heads of one id through that id's lane.
    pub async fn merge_versions(&self, h1: Hash, h2: Hash) -> Result<MergeResult> {
        let node = self.db.get_version_node(h1)?;
        let key = format!("vheads:{}", node.data_id_hash().to_hex());
        let db = self.db.clone();
        self.lanes
            .serialized(&key, async move { merge(&db, h1, h2) })
            .await
    }

    /// An exporter serving this instance's data behind `filter`.
    pub fn exporter(&self, filter: Arc<dyn AccessFilter>) -> Exporter {
        Exporter::new(self.db.clone(), filter)
    }

    /// An importer pulling into this instance.
    pub fn importer(&self, options: ImporterOptions) -> Importer {
        Importer::new(self.db.clone(), self.lanes.clone(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use one_core::{ItemType, Recipe, RecipeRule};

    fn doc_recipe() -> Recipe {
        Recipe::new(
            "Doc",
            vec![
                RecipeRule::new("name", ItemType::string()).id(),
                RecipeRule::new("body", ItemType::ReferenceToClob),
                RecipeRule::new("attachment", ItemType::ReferenceToBlob).optional(),
                RecipeRule::new("tags", ItemType::set_of(ItemType::string())),
            ],
        )
        .with_crdt("tags", Algorithm::Set)
    }

    fn instance() -> Instance {
        let instance = Instance::memory().unwrap();
        instance.register(doc_recipe()).unwrap();
        instance
    }

    fn doc(db: &Db, name: &str, body: &str, tags: &[&str]) -> StoredVersion {
        let clob = db.write_clob(body).unwrap();
        let obj = Obj::new("Doc")
            .with("name", Value::String(name.into()))
            .with("body", Value::Reference(Link::Clob(clob)))
            .with(
                "tags",
                Value::set_from(tags.iter().map(|t| Value::String((*t).into()))),
            );
        db.store_versioned_object(&obj).unwrap()
    }

    async fn sync(remote: &Instance, local: &Instance, roots: Vec<Grant>) -> Result<()> {
        let filter = Arc::new(StaticFilter::new(remote.db(), roots).unwrap());
        let exporter = remote.exporter(filter);
        let importer = local.importer(ImporterOptions::default());
        let (mut conn_e, mut conn_i) = memory_pair();
        let serve = async {
            exporter.serve(&mut conn_e, None).await.ok();
        };
        let (result, ()) = futures::join!(importer.run(&mut conn_i), serve);
        result
    }

    #[async_std::test]
    async fn chum_transfers_an_accessible_closure() {
        let remote = instance();
        let local = instance();
        let v = doc(remote.db(), "readme", "content", &["a", "b"]);

        sync(&remote, &local, vec![Grant::Id(v.id_hash)])
            .await
            .unwrap();

        assert!(local.db().exists(&v.hash).unwrap());
        assert_eq!(local.db().version_head(&v.id_hash).unwrap(), Some(v.node));
        let fetched = local.db().get_object(v.hash).unwrap();
        let clob = fetched.get("body").unwrap().as_link().unwrap().hash().unwrap();
        assert_eq!(local.db().read_text(clob).unwrap(), "content");
    }

    #[async_std::test]
    async fn chum_merges_divergent_histories() {
        let a = instance();
        let b = instance();
        // both sides share the base version, then diverge
        let base = doc(a.db(), "d", "text", &["x"]);
        sync(&a, &b, vec![Grant::Id(base.id_hash)]).await.unwrap();

        let ha = doc(a.db(), "d", "text", &["x", "y"]);
        let hb = doc(b.db(), "d", "text", &[]);

        // pull a's history into b and vice versa
        sync(&a, &b, vec![Grant::Id(base.id_hash)]).await.unwrap();
        sync(&b, &a, vec![Grant::Id(base.id_hash)]).await.unwrap();
        // second round lets a's merge result flow back to b
        sync(&a, &b, vec![Grant::Id(base.id_hash)]).await.unwrap();

        let head_a = a.db().version_head(&base.id_hash).unwrap().unwrap();
        let head_b = b.db().version_head(&base.id_hash).unwrap().unwrap();
        assert_eq!(head_a, head_b);
        let merged = a
            .db()
            .get_object(a.db().get_version_node(head_a).unwrap().data())
            .unwrap();
        // x removed by b, y added by a
        assert_eq!(
            merged.get("tags"),
            Some(&Value::set_from([Value::String("y".into())]))
        );
        let _ = (ha, hb);
    }

    #[async_std::test]
    async fn denied_roots_do_not_transfer() {
        let remote = instance();
        let local = instance();
        let visible = doc(remote.db(), "public", "p", &[]);
        let hidden = doc(remote.db(), "secret", "s", &[]);

        sync(&remote, &local, vec![Grant::Id(visible.id_hash)])
            .await
            .unwrap();
        assert!(local.db().exists(&visible.hash).unwrap());
        assert!(!local.db().exists(&hidden.hash).unwrap());
        assert!(local.db().version_head(&hidden.id_hash).unwrap().is_none());
    }
}
