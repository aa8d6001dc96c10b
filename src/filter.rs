//! The access gate consumed by the exporter. Policy evaluation (who may
//! see what, and why) happens elsewhere; the core trusts the boolean
//! answer as the only gate on export.

use one_core::{Db, Hash, IdHash, Link, Result};
use std::collections::BTreeSet;

/// One entry of the accessible set: a concrete hash or a whole id.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Grant {
    Object(Hash),
    Id(IdHash),
}

impl Grant {
    pub fn to_hex(&self) -> String {
        match self {
            Self::Object(h) => h.to_hex(),
            Self::Id(h) => h.to_hex(),
        }
    }
}

/// Snapshot view of what one remote peer may fetch.
pub trait AccessFilter: Send + Sync {
    /// The roots offered through `GetAccessibleRoots`.
    fn accessible_roots(&self) -> Result<Vec<Grant>>;

    /// Whether a single target may be served.
    fn is_accessible(&self, grant: &Grant) -> Result<bool>;
}

/// Serves everything; for wiring two own instances together and for tests.
pub struct AllowAll {
    db: Db,
}

impl AllowAll {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl AccessFilter for AllowAll {
    fn accessible_roots(&self) -> Result<Vec<Grant>> {
        Ok(self
            .db
            .version_heads()?
            .into_iter()
            .map(Grant::Id)
            .collect())
    }

    fn is_accessible(&self, _grant: &Grant) -> Result<bool> {
        Ok(true)
    }
}

/// A fixed set of root grants whose whole reference closure is accessible.
pub struct StaticFilter {
    roots: Vec<Grant>,
    closure: BTreeSet<String>,
}

impl StaticFilter {
    /// Computes the reference closure of `roots` against the local store.
    pub fn new(db: &Db, roots: Vec<Grant>) -> Result<Self> {
        let mut closure = BTreeSet::new();
        let mut queue: Vec<Grant> = roots.clone();
        while let Some(grant) = queue.pop() {
            if !closure.insert(grant.to_hex()) {
                continue;
            }
            let microdata = match grant {
                Grant::Object(hash) => match db.get_microdata(hash) {
                    Ok(md) => md,
                    // BLOB/CLOB content has no links
                    Err(_) => continue,
                },
                Grant::Id(id) => db.id_microdata(&id)?,
            };
            if !microdata.starts_with("<div ") {
                // BLOB/CLOB content carries no links
                continue;
            }
            for link in one_core::scan_links(&microdata)? {
                queue.push(match link.link {
                    Link::Obj(h) | Link::Clob(h) | Link::Blob(h) => Grant::Object(h),
                    Link::Id(i) => Grant::Id(i),
                });
            }
            // an id grant also exposes its current version
            if let Grant::Id(id) = grant {
                if let Some(head) = db.version_head(&id)? {
                    queue.push(Grant::Object(head));
                    queue.push(Grant::Object(db.get_version_node(head)?.data()));
                }
            }
        }
        Ok(Self { roots, closure })
    }
}

impl AccessFilter for StaticFilter {
    fn accessible_roots(&self) -> Result<Vec<Grant>> {
        Ok(self.roots.clone())
    }

    fn is_accessible(&self, grant: &Grant) -> Result<bool> {
        Ok(self.closure.contains(&grant.to_hex()))
    }
}
