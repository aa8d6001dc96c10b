//! The Chum importer: a polling client that pulls accessible roots from a
//! peer, walks their reference closures bottom-up, verifies everything it
//! receives, and merges remote version history into the local graph.
//!
//! Nothing unverifiable is ever written: a child stores only after its own
//! references are present, the root stores last, so observers see either a
//! referentially closed subgraph or nothing of it.

use crate::conn::{Connection, Frame};
use crate::lane::Lanes;
use crate::wire::{
    self, AccessibleObject, BlobEncoding, Child, ChildKind, Request, PROTOCOL_VERSION,
};
use fnv::FnvHashMap;
use futures::channel::mpsc;
use futures_timer::Delay;
use one_core::{
    id_hash, is_version_node_type, merge, parse_any, scan_links, Db, Error, Hash, IdHash, Result,
    VersionNode,
};
use std::collections::BTreeSet;
use std::time::Duration;

/// Events surfaced while the importer runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ImportEvent {
    /// The first full pass over the accessible roots completed.
    FirstSync,
    /// A per-root failure; the loop continues.
    Error { root: String, error: Error },
}

#[derive(Clone, Debug)]
pub struct ImporterOptions {
    /// Poll again after each pass instead of sending `Fin` and exiting.
    pub keep_running: bool,
    pub poll_interval: Duration,
    /// Incoming objects of these types are refused.
    pub rejected_types: BTreeSet<String>,
    pub handshake_retries: u32,
    pub handshake_delay: Duration,
}

impl Default for ImporterOptions {
    fn default() -> Self {
        Self {
            keep_running: false,
            poll_interval: Duration::from_secs(5),
            rejected_types: ["Access", "IdAccess", "Group"]
                .into_iter()
                .map(Into::into)
                .collect(),
            handshake_retries: 20,
            handshake_delay: Duration::from_millis(100),
        }
    }
}

pub struct Importer {
    db: Db,
    lanes: Lanes,
    options: ImporterOptions,
    events: Option<mpsc::UnboundedSender<ImportEvent>>,
}

impl Importer {
    pub fn new(db: Db, lanes: Lanes, options: ImporterOptions) -> Self {
        Self {
            db,
            lanes,
            options,
            events: None,
        }
    }

    /// Returns the stream of [`ImportEvent`]s for this run.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<ImportEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.events = Some(tx);
        rx
    }

    fn emit(&self, event: ImportEvent) {
        if let Some(events) = &self.events {
            events.unbounded_send(event).ok();
        }
    }

    fn report(&self, root: &str, error: Error) {
        tracing::info!("import of {} failed: {}", root, error);
        self.emit(ImportEvent::Error {
            root: root.to_string(),
            error,
        });
    }

    /// Drives the importer over one connection until the work is done
    /// (`keep_running = false`) or the connection goes away.
    pub async fn run(mut self, conn: &mut dyn Connection) -> Result<()> {
        let mut client = Client::new(conn);

        // the peer's service may not be registered yet; retry bounded
        let mut attempt = 0;
        let remote = loop {
            match client.protocol_version().await {
                Ok(version) => break version,
                Err(Error::PeerUnknownService) if attempt < self.options.handshake_retries => {
                    attempt += 1;
                    Delay::new(self.options.handshake_delay).await;
                }
                Err(e) => return Err(e),
            }
        };
        if remote != PROTOCOL_VERSION {
            client.conn.close();
            return Err(Error::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote,
            });
        }

        let mut first_pass = true;
        loop {
            self.poll(&mut client).await?;
            if first_pass {
                first_pass = false;
                self.emit(ImportEvent::FirstSync);
            }
            if !self.options.keep_running {
                client.fin().await.ok();
                return Ok(());
            }
            if !client.conn.connected() {
                return Err(Error::PeerClosed);
            }
            if !client.take_new_roots() {
                Delay::new(self.options.poll_interval).await;
            }
        }
    }

    async fn poll(&mut self, client: &mut Client<'_>) -> Result<()> {
        let roots = client.accessible_roots().await?;
        let mut version_groups: FnvHashMap<IdHash, Vec<(Hash, IdHash, String)>> =
            FnvHashMap::default();
        for root in roots {
            if !client.conn.connected() {
                return Err(Error::PeerClosed);
            }
            match root {
                AccessibleObject::Unversioned { hash, .. }
                | AccessibleObject::Versioned { hash, .. } => {
                    if let Err(e) = self.fetch_object_with_children(client, hash, None).await {
                        self.report(&hash.to_hex(), e);
                    }
                }
                AccessibleObject::Id { id_hash, .. } => {
                    if let Err(e) = self.fetch_id_object_with_children(client, id_hash).await {
                        self.report(&id_hash.to_hex(), e);
                    }
                }
                AccessibleObject::VersionNode {
                    node,
                    data_id_hash,
                    data_type,
                } => version_groups
                    .entry(data_id_hash)
                    .or_default()
                    .push((node, data_id_hash, data_type)),
            }
        }
        for (group_id, group) in version_groups {
            if let Err(e) = self.integrate_version_group(client, group_id, group).await {
                self.report(&group_id.to_hex(), e);
            }
            if !client.conn.connected() {
                return Err(Error::PeerClosed);
            }
        }
        Ok(())
    }

    /// Validates one fetched microdata string against its claimed hash, the
    /// rejected-type set, and the no-holes rule, then stores it.
    fn verify_and_store(
        &self,
        microdata: &str,
        claimed: Hash,
        fetched: &BTreeSet<String>,
    ) -> Result<()> {
        let computed = Hash::digest(microdata.as_bytes());
        if computed != claimed {
            return Err(Error::HashMismatch {
                expected: claimed.to_hex(),
                computed: computed.to_hex(),
            });
        }
        let (obj, id_obj) = parse_any(self.db.registry(), microdata)?;
        if id_obj {
            return Err(Error::ChildConsistency {
                hash: claimed.to_hex(),
                reason: "id object served as a concrete object".into(),
            });
        }
        if self.options.rejected_types.contains(&obj.type_name) {
            return Err(Error::RejectedType {
                name: obj.type_name,
            });
        }
        // no holes in the tree at any time
        for link in scan_links(microdata)? {
            let hex = link.link.to_hex();
            let present = match link.link.hash() {
                Some(hash) => self.db.exists(&hash)?,
                // id references carry no payload of their own
                None => true,
            };
            if !present && !fetched.contains(&hex) {
                return Err(Error::ChildConsistency {
                    hash: claimed.to_hex(),
                    reason: format!("reference {hex} not fetched yet"),
                });
            }
        }
        self.db.write_text(microdata, claimed)?;
        Ok(())
    }

    /// Fetches the closure below `root` bottom-up, storing the root last.
    /// `validate_root` runs after the root parsed and every child stored,
    /// but before the root itself is written.
    async fn fetch_object_with_children(
        &self,
        client: &mut Client<'_>,
        root: Hash,
        validate_root: Option<&dyn Fn(&Db, &str) -> Result<()>>,
    ) -> Result<()> {
        if self.db.exists(&root)? {
            return Ok(());
        }
        let children = client.object_children(root).await?;
        let mut fetched: BTreeSet<String> = BTreeSet::new();
        for child in children.iter().rev() {
            if !client.conn.connected() {
                return Err(Error::PeerClosed);
            }
            self.fetch_child(client, child, &mut fetched).await?;
        }
        let microdata = client.object(root).await?;
        if let Some(validate) = validate_root {
            let computed = Hash::digest(microdata.as_bytes());
            if computed != root {
                return Err(Error::HashMismatch {
                    expected: root.to_hex(),
                    computed: computed.to_hex(),
                });
            }
            validate(&self.db, &microdata)?;
        }
        self.verify_and_store(&microdata, root, &fetched)
    }

    async fn fetch_child(
        &self,
        client: &mut Client<'_>,
        child: &Child,
        fetched: &mut BTreeSet<String>,
    ) -> Result<()> {
        match child.kind {
            ChildKind::Object => {
                let hash: Hash = child.hash.parse()?;
                if !self.db.exists(&hash)? {
                    let microdata = client.object(hash).await?;
                    self.verify_and_store(&microdata, hash, fetched)?;
                }
            }
            ChildKind::Id => {
                // id-objects are validated but never written as files
                let id: IdHash = child.hash.parse()?;
                let microdata = client.id_object(id).await?;
                let computed = IdHash::digest(microdata.as_bytes());
                if computed != id {
                    return Err(Error::HashMismatch {
                        expected: id.to_hex(),
                        computed: computed.to_hex(),
                    });
                }
                let (obj, id_obj) = parse_any(self.db.registry(), &microdata)?;
                if !id_obj {
                    return Err(Error::ChildConsistency {
                        hash: id.to_hex(),
                        reason: "concrete object served as an id object".into(),
                    });
                }
                if self.options.rejected_types.contains(&obj.type_name) {
                    return Err(Error::RejectedType {
                        name: obj.type_name,
                    });
                }
            }
            ChildKind::Blob | ChildKind::Clob => {
                let hash: Hash = child.hash.parse()?;
                if !self.db.exists(&hash)? {
                    let bytes = client.blob(hash, BlobEncoding::Binary).await?;
                    let computed = Hash::digest(&bytes);
                    if computed != hash {
                        return Err(Error::HashMismatch {
                            expected: hash.to_hex(),
                            computed: computed.to_hex(),
                        });
                    }
                    let mut writer = self.db.create_write_stream();
                    writer.write(&bytes);
                    writer.end()?;
                }
            }
        }
        fetched.insert(child.hash.clone());
        Ok(())
    }

    async fn fetch_id_object_with_children(
        &self,
        client: &mut Client<'_>,
        id: IdHash,
    ) -> Result<()> {
        let children = client.id_object_children(id).await?;
        let mut fetched = BTreeSet::new();
        for child in children.iter().rev() {
            self.fetch_child(client, child, &mut fetched).await?;
        }
        // validate the id-object itself
        self.fetch_child(
            client,
            &Child {
                kind: ChildKind::Id,
                hash: id.to_hex(),
            },
            &mut fetched,
        )
        .await
    }

    /// Fetches a group of version-nodes for one id in depth order, then
    /// merges the deepest into the local head.
    async fn integrate_version_group(
        &self,
        client: &mut Client<'_>,
        group_id: IdHash,
        mut group: Vec<(Hash, IdHash, String)>,
    ) -> Result<()> {
        let mut fetched_nodes = Vec::new();
        for (node, declared_id, declared_type) in group.drain(..) {
            let validate = move |db: &Db, microdata: &str| {
                validate_version_node(db, microdata, declared_id, &declared_type)
            };
            self.fetch_object_with_children(client, node, Some(&validate))
                .await?;
            let depth = self.db.get_version_node(node)?.depth();
            fetched_nodes.push((depth, node));
        }
        fetched_nodes.sort();
        let Some(&(_, deepest)) = fetched_nodes.last() else {
            return Ok(());
        };
        // head rewrites for one id are serialized by name
        let db = self.db.clone();
        self.lanes
            .serialized(&format!("vheads:{}", group_id.to_hex()), async move {
                match db.version_head(&group_id)? {
                    None => db.set_version_head(&group_id, deepest),
                    Some(local) if local == deepest => Ok(()),
                    Some(local) => merge(&db, local, deepest).map(|_| ()),
                }
            })
            .await
    }
}

/// After a version-node and its closure arrived: the pointed-at object must
/// exist, parse, and agree with the node's declared id-hash and type.
fn validate_version_node(
    db: &Db,
    microdata: &str,
    declared_id: IdHash,
    declared_type: &str,
) -> Result<()> {
    let (obj, _) = parse_any(db.registry(), microdata)?;
    if !is_version_node_type(&obj.type_name) {
        return Err(Error::ChildConsistency {
            hash: Hash::digest(microdata.as_bytes()).to_hex(),
            reason: format!("{} is not a version node", obj.type_name),
        });
    }
    let node = VersionNode::from_obj(&obj)?;
    let data = db.get_object(node.data())?;
    let computed_id = id_hash(db.registry(), &data)?;
    if computed_id != declared_id || node.data_id_hash() != declared_id {
        return Err(Error::ChildConsistency {
            hash: node.data().to_hex(),
            reason: format!(
                "data id-hash {} does not match declared {}",
                computed_id, declared_id
            ),
        });
    }
    if data.type_name != declared_type || node.data_type() != declared_type {
        return Err(Error::ChildConsistency {
            hash: node.data().to_hex(),
            reason: format!(
                "data type {} does not match declared {}",
                data.type_name, declared_type
            ),
        });
    }
    Ok(())
}

/// Request/response correlation over one connection.
struct Client<'a> {
    conn: &'a mut dyn Connection,
    next_id: u64,
    new_roots: bool,
}

impl<'a> Client<'a> {
    fn new(conn: &'a mut dyn Connection) -> Self {
        Self {
            conn,
            next_id: 1,
            new_roots: false,
        }
    }

    /// True once the exporter announced a grown accessible set; cleared on
    /// read.
    fn take_new_roots(&mut self) -> bool {
        std::mem::take(&mut self.new_roots)
    }

    async fn request(&mut self, request: Request) -> Result<serde_json::Value> {
        let id = self.next_id;
        self.next_id += 1;
        self.conn
            .send(Frame::Text(wire::encode_request(id, &request)))
            .await?;
        loop {
            match self.conn.recv().await? {
                Frame::Text(text) => {
                    if wire::is_new_accessible_root(&text) {
                        self.new_roots = true;
                        continue;
                    }
                    let (rid, result) = wire::decode_response(&text)?;
                    if rid == id {
                        return result;
                    }
                    tracing::debug!("dropping stale response {}", rid);
                }
                Frame::Binary(_) => {}
            }
        }
    }

    async fn typed<T: serde::de::DeserializeOwned>(&mut self, request: Request) -> Result<T> {
        let value = self.request(request).await?;
        serde_json::from_value(value).map_err(|e| Error::internal(format!("bad response: {e}")))
    }

    async fn protocol_version(&mut self) -> Result<u32> {
        self.typed(Request::GetProtocolVersion).await
    }

    async fn accessible_roots(&mut self) -> Result<Vec<AccessibleObject>> {
        self.typed(Request::GetAccessibleRoots).await
    }

    async fn object_children(&mut self, hash: Hash) -> Result<Vec<Child>> {
        self.typed(Request::GetObjectChildren { hash }).await
    }

    async fn id_object_children(&mut self, id_hash: IdHash) -> Result<Vec<Child>> {
        self.typed(Request::GetIdObjectChildren { id_hash }).await
    }

    async fn object(&mut self, hash: Hash) -> Result<String> {
        self.typed(Request::GetObject { hash }).await
    }

    async fn id_object(&mut self, id_hash: IdHash) -> Result<String> {
        self.typed(Request::GetIdObject { id_hash }).await
    }

    async fn blob(&mut self, hash: Hash, encoding: BlobEncoding) -> Result<Vec<u8>> {
        self.request(Request::GetBlob { hash, encoding }).await?;
        let mut bytes = Vec::new();
        loop {
            match self.conn.recv().await? {
                Frame::Binary(chunk) if chunk.is_empty() => return Ok(bytes),
                Frame::Binary(chunk) => bytes.extend_from_slice(&chunk),
                Frame::Text(text) => match encoding {
                    BlobEncoding::Base64 => bytes.extend_from_slice(
                        &base64::decode(&text)
                            .map_err(|e| Error::internal(format!("bad base64 frame: {e}")))?,
                    ),
                    BlobEncoding::Utf8 => bytes.extend_from_slice(text.as_bytes()),
                    BlobEncoding::Binary => {
                        if wire::is_new_accessible_root(&text) {
                            self.new_roots = true;
                        }
                    }
                },
            }
        }
    }

    async fn fin(&mut self) -> Result<()> {
        self.request(Request::Fin).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{memory_pair, Connection, Frame};
    use crate::exporter::Exporter;
    use crate::filter::{AccessFilter, Grant, StaticFilter};
    use futures::StreamExt;
    use one_core::{
        Algorithm, ItemType, Link, NodeBody, Obj, Recipe, RecipeRule, StoredVersion, Value,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn db() -> Db {
        let db = Db::memory().unwrap();
        db.registry()
            .register(
                Recipe::new(
                    "Doc",
                    vec![
                        RecipeRule::new("name", ItemType::string()).id(),
                        RecipeRule::new("body", ItemType::ReferenceToClob),
                        RecipeRule::new("tags", ItemType::set_of(ItemType::string())),
                    ],
                )
                .with_crdt("tags", Algorithm::Set),
            )
            .unwrap();
        db
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

    async fn run_sync(
        remote: &Db,
        local: &Db,
        filter: Arc<dyn AccessFilter>,
    ) -> (Result<()>, Vec<ImportEvent>) {
        let exporter = Exporter::new(remote.clone(), filter);
        let mut importer = Importer::new(local.clone(), Lanes::new(), ImporterOptions::default());
        let events = importer.events();
        let (mut conn_e, mut conn_i) = memory_pair();
        let serve = async {
            exporter.serve(&mut conn_e, None).await.ok();
        };
        let (result, ()) = futures::join!(importer.run(&mut conn_i), serve);
        (result, events.collect().await)
    }

    #[async_std::test]
    async fn accessible_roots_transfer_children_before_the_root() {
        let remote = db();
        let local = db();
        let v = doc(&remote, "readme", "content", &["a"]);
        let filter = Arc::new(StaticFilter::new(&remote, vec![Grant::Id(v.id_hash)]).unwrap());

        let (result, events) = run_sync(&remote, &local, filter).await;
        result.unwrap();
        assert!(events.contains(&ImportEvent::FirstSync));
        assert!(local.exists(&v.hash).unwrap());
        assert_eq!(local.version_head(&v.id_hash).unwrap(), Some(v.node));
        // child closure holds for everything stored
        for link in scan_links(&local.get_microdata(v.hash).unwrap()).unwrap() {
            if let Some(hash) = link.link.hash() {
                assert!(local.exists(&hash).unwrap());
            }
        }
    }

    #[async_std::test]
    async fn protocol_mismatch_tears_the_connection_down() {
        let local = db();
        let importer = Importer::new(local, Lanes::new(), ImporterOptions::default());
        let (mut peer, mut conn_i) = memory_pair();
        let fake_peer = async {
            // speak version 2, then go silent
            if let Ok(Frame::Text(text)) = peer.recv().await {
                let (id, _) = wire::decode_request(&text).unwrap();
                peer.send(Frame::Text(wire::encode_response_ok(id, &json!(2))))
                    .await
                    .unwrap();
            }
            // the importer must not ask for roots
            assert!(peer.recv().await.is_err());
        };
        let (result, ()) = futures::join!(importer.run(&mut conn_i), fake_peer);
        assert_eq!(
            result.unwrap_err(),
            Error::ProtocolMismatch {
                local: PROTOCOL_VERSION,
                remote: 2
            }
        );
    }

    #[async_std::test]
    async fn handshake_retries_on_unknown_service() {
        let local = db();
        let options = ImporterOptions {
            handshake_retries: 3,
            handshake_delay: Duration::from_millis(1),
            ..ImporterOptions::default()
        };
        let importer = Importer::new(local, Lanes::new(), options);
        let (mut peer, mut conn_i) = memory_pair();
        let fake_peer = async {
            // initial attempt plus three retries
            for _ in 0..4 {
                if let Ok(Frame::Text(text)) = peer.recv().await {
                    let (id, _) = wire::decode_request(&text).unwrap();
                    peer.send(Frame::Text(wire::encode_response_err(
                        id,
                        &Error::PeerUnknownService,
                    )))
                    .await
                    .ok();
                } else {
                    return;
                }
            }
            peer.close();
        };
        let (result, ()) = futures::join!(importer.run(&mut conn_i), fake_peer);
        assert_eq!(result.unwrap_err(), Error::PeerUnknownService);
    }

    #[async_std::test]
    async fn inconsistent_version_nodes_are_refused() {
        let remote = db();
        let local = db();
        let v = doc(&remote, "d", "b", &[]);
        // a node whose declared id-hash belongs to a different id
        let bad_node = remote
            .store_version_node(&VersionNode::Edge {
                body: NodeBody {
                    data: v.hash,
                    data_id_hash: IdHash::digest(b"someone else"),
                    data_type: "Doc".into(),
                    creation_time: 1,
                },
            })
            .unwrap();
        let filter = Arc::new(
            StaticFilter::new(&remote, vec![Grant::Object(bad_node)]).unwrap(),
        );

        let (result, events) = run_sync(&remote, &local, filter).await;
        result.unwrap();
        assert!(!local.exists(&bad_node).unwrap());
        assert!(events.iter().any(|e| matches!(
            e,
            ImportEvent::Error {
                error: Error::ChildConsistency { .. },
                ..
            }
        )));
    }

    #[async_std::test]
    async fn rejected_types_are_dropped_with_an_error_event() {
        let remote = db();
        let local = db();
        for d in [&remote, &local] {
            d.registry()
                .register(Recipe::new(
                    "Group",
                    vec![RecipeRule::new("members", ItemType::set_of(ItemType::string()))],
                ))
                .unwrap();
        }
        let group = remote
            .store_unversioned_object(
                &Obj::new("Group").with("members", Value::set_from([Value::String("a".into())])),
            )
            .unwrap();
        let filter = Arc::new(
            StaticFilter::new(&remote, vec![Grant::Object(group)]).unwrap(),
        );

        let (result, events) = run_sync(&remote, &local, filter).await;
        result.unwrap();
        assert!(!local.exists(&group).unwrap());
        assert!(events.iter().any(|e| matches!(
            e,
            ImportEvent::Error {
                error: Error::RejectedType { .. },
                ..
            }
        )));
    }

    /// A filter that hides one hash of an otherwise accessible closure.
    struct Punctured {
        inner: StaticFilter,
        hole: Hash,
    }

    impl AccessFilter for Punctured {
        fn accessible_roots(&self) -> Result<Vec<Grant>> {
            self.inner.accessible_roots()
        }
        fn is_accessible(&self, grant: &Grant) -> Result<bool> {
            if grant.to_hex() == self.hole.to_hex() {
                return Ok(false);
            }
            self.inner.is_accessible(grant)
        }
    }

    #[async_std::test]
    async fn failed_subtrees_leave_no_partial_state() {
        let remote = db();
        let local = db();
        let v = doc(&remote, "d", "will be denied", &[]);
        let clob = remote
            .get_object(v.hash)
            .unwrap()
            .get("body")
            .unwrap()
            .as_link()
            .unwrap()
            .hash()
            .unwrap();
        let inner = StaticFilter::new(&remote, vec![Grant::Id(v.id_hash)]).unwrap();
        let (result, events) =
            run_sync(&remote, &local, Arc::new(Punctured { inner, hole: clob })).await;
        result.unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, ImportEvent::Error { .. })));
        // neither the root nor the version node became visible
        assert!(!local.exists(&v.hash).unwrap());
        assert!(!local.exists(&v.node).unwrap());
        assert!(local.version_head(&v.id_hash).unwrap().is_none());

        // re-running with full access succeeds
        let full = Arc::new(StaticFilter::new(&remote, vec![Grant::Id(v.id_hash)]).unwrap());
        let (result, _) = run_sync(&remote, &local, full).await;
        result.unwrap();
        assert!(local.exists(&v.hash).unwrap());
        assert_eq!(local.version_head(&v.id_hash).unwrap(), Some(v.node));
    }

    #[async_std::test]
    async fn blob_streams_reassemble() {
        let remote = db();
        let blob = remote.write_blob(&vec![7u8; 200_000]).unwrap();
        let filter = Arc::new(
            StaticFilter::new(&remote, vec![Grant::Object(blob)]).unwrap(),
        );
        let exporter = Exporter::new(remote.clone(), filter);
        let (mut conn_e, mut conn_i) = memory_pair();
        let serve = async {
            exporter.serve(&mut conn_e, None).await.ok();
        };
        let fetch = async {
            let mut client = Client::new(&mut conn_i);
            let bytes = client.blob(blob, BlobEncoding::Binary).await.unwrap();
            let b64 = client.blob(blob, BlobEncoding::Base64).await.unwrap();
            client.fin().await.ok();
            (bytes, b64)
        };
        let ((bytes, b64), ()) = futures::join!(fetch, serve);
        assert_eq!(bytes.len(), 200_000);
        assert_eq!(Hash::digest(&bytes), blob);
        assert_eq!(b64, bytes);
    }
}
