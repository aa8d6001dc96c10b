//! The Chum exporter: a per-connection service answering by-hash requests,
//! gated exclusively by the access filter.

use crate::conn::{Connection, Frame};
use crate::filter::{AccessFilter, Grant};
use crate::wire::{
    self, AccessibleObject, BlobEncoding, Child, Request, PROTOCOL_VERSION,
};
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use one_core::{is_version_node_type, scan_links, Db, Error, Hash, IdHash, Link, Result, VersionNode};
use serde_json::json;
use std::sync::Arc;

const BLOB_CHUNK: usize = 64 * 1024;

pub struct Exporter {
    db: Db,
    filter: Arc<dyn AccessFilter>,
}

enum Reply {
    Json(serde_json::Value),
    Blob { bytes: Vec<u8>, encoding: BlobEncoding },
}

impl Exporter {
    pub fn new(db: Db, filter: Arc<dyn AccessFilter>) -> Self {
        Self { db, filter }
    }

    /// Serves one connection until `Fin` or connection loss. A message on
    /// `changes` announces a grown accessible set to the peer.
    pub async fn serve(
        &self,
        conn: &mut dyn Connection,
        mut changes: Option<mpsc::UnboundedReceiver<()>>,
    ) -> Result<()> {
        enum Wake {
            Frame(Result<Frame>),
            Announce,
        }
        loop {
            let wake = match &mut changes {
                Some(rx) => {
                    futures::select! {
                        frame = conn.recv().fuse() => Wake::Frame(frame),
                        _ = rx.next().fuse() => Wake::Announce,
                    }
                }
                None => Wake::Frame(conn.recv().await),
            };
            let frame = match wake {
                Wake::Announce => {
                    conn.send(Frame::Text(wire::encode_new_accessible_root()))
                        .await?;
                    continue;
                }
                Wake::Frame(frame) => frame,
            };
            let text = match frame {
                Ok(Frame::Text(text)) => text,
                Ok(Frame::Binary(_)) => continue,
                Err(Error::PeerClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            let (id, request) = match wire::decode_request(&text) {
                Ok(decoded) => decoded,
                Err(e) => {
                    tracing::error!("undecodable request: {}", e);
                    continue;
                }
            };
            tracing::debug!("chum request {:?}", request);
            let fin = matches!(request, Request::Fin);
            match self.dispatch(&request) {
                Ok(Reply::Json(result)) => {
                    conn.send(Frame::Text(wire::encode_response_ok(id, &result)))
                        .await?;
                }
                Ok(Reply::Blob { bytes, encoding }) => {
                    conn.send(Frame::Text(wire::encode_response_ok(
                        id,
                        &json!({ "stream": true }),
                    )))
                    .await?;
                    self.stream_blob(conn, &bytes, encoding).await?;
                }
                Err(e) => {
                    tracing::info!("chum request failed: {}", e);
                    conn.send(Frame::Text(wire::encode_response_err(id, &e)))
                        .await?;
                }
            }
            if fin {
                return Ok(());
            }
        }
    }

    async fn stream_blob(
        &self,
        conn: &mut dyn Connection,
        bytes: &[u8],
        encoding: BlobEncoding,
    ) -> Result<()> {
        for chunk in bytes.chunks(BLOB_CHUNK.max(1)) {
            let frame = match encoding {
                BlobEncoding::Binary => Frame::Binary(chunk.to_vec()),
                BlobEncoding::Base64 => Frame::Text(base64::encode(chunk)),
                BlobEncoding::Utf8 => Frame::Text(
                    std::str::from_utf8(chunk)
                        .map_err(|_| Error::internal("blob is not utf-8"))?
                        .to_string(),
                ),
            };
            conn.send(frame).await?;
        }
        conn.send(Frame::Binary(Vec::new())).await
    }

    fn check(&self, grant: Grant) -> Result<()> {
        if self.filter.is_accessible(&grant)? {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                hash: grant.to_hex(),
            })
        }
    }

    fn dispatch(&self, request: &Request) -> Result<Reply> {
        Ok(match request {
            Request::GetProtocolVersion => Reply::Json(json!(PROTOCOL_VERSION)),
            Request::GetAccessibleRoots => Reply::Json(serde_json::to_value(self.roots()?)
                .map_err(|e| Error::internal(e.to_string()))?),
            Request::GetObjectChildren { hash } => {
                self.check(Grant::Object(*hash))?;
                let microdata = self.db.get_microdata(*hash)?;
                let children = self.closure_children(&microdata)?;
                Reply::Json(serde_json::to_value(children)
                    .map_err(|e| Error::internal(e.to_string()))?)
            }
            Request::GetIdObjectChildren { id_hash } => {
                self.check(Grant::Id(*id_hash))?;
                let microdata = self.db.id_microdata(id_hash)?;
                let children = self.closure_children(&microdata)?;
                Reply::Json(serde_json::to_value(children)
                    .map_err(|e| Error::internal(e.to_string()))?)
            }
            Request::GetObject { hash } => {
                self.check(Grant::Object(*hash))?;
                Reply::Json(json!(self.db.get_microdata(*hash)?))
            }
            Request::GetIdObject { id_hash } => {
                self.check(Grant::Id(*id_hash))?;
                Reply::Json(json!(self.db.id_microdata(id_hash)?))
            }
            Request::GetBlob { hash, encoding } => {
                self.check(Grant::Object(*hash))?;
                Reply::Blob {
                    bytes: self.db.read_bytes(*hash)?,
                    encoding: *encoding,
                }
            }
            Request::Fin => Reply::Json(json!("ack")),
        })
    }

    fn roots(&self) -> Result<Vec<AccessibleObject>> {
        let mut roots = Vec::new();
        for grant in self.filter.accessible_roots()? {
            match grant {
                Grant::Id(id_hash) => {
                    let Some(head) = self.db.version_head(&id_hash)? else {
                        tracing::debug!("accessible id {} has no head", id_hash);
                        continue;
                    };
                    let node = self.db.get_version_node(head)?;
                    roots.push(AccessibleObject::VersionNode {
                        node: head,
                        data_id_hash: id_hash,
                        data_type: node.data_type().into(),
                    });
                }
                Grant::Object(hash) => match self.classify(hash) {
                    Ok(Some(root)) => roots.push(root),
                    Ok(None) => {}
                    Err(e) => tracing::info!("unclassifiable root {}: {}", hash, e),
                },
            }
        }
        Ok(roots)
    }

    fn classify(&self, hash: Hash) -> Result<Option<AccessibleObject>> {
        let microdata = self.db.get_microdata(hash)?;
        if !microdata.starts_with("<div ") {
            // raw BLOB/CLOB content is fetched as a child, never a root
            return Ok(None);
        }
        let (obj, id_obj) = one_core::parse_any(self.db.registry(), &microdata)?;
        if id_obj {
            return Ok(Some(AccessibleObject::Id {
                id_hash: IdHash::digest(microdata.as_bytes()),
                one_type: obj.type_name,
            }));
        }
        if is_version_node_type(&obj.type_name) {
            let node = VersionNode::from_obj(&obj)?;
            return Ok(Some(AccessibleObject::VersionNode {
                node: hash,
                data_id_hash: node.data_id_hash(),
                data_type: node.data_type().into(),
            }));
        }
        if self.db.registry().is_versioned(&obj.type_name)? {
            return Ok(Some(AccessibleObject::Versioned {
                id_hash: one_core::id_hash(self.db.registry(), &obj)?,
                hash,
                one_type: obj.type_name,
            }));
        }
        Ok(Some(AccessibleObject::Unversioned {
            hash,
            one_type: obj.type_name,
        }))
    }

    /// The transitive reference closure in document order: every reference
    /// is listed before its own references, so the reversed list fetches
    /// bottom-up without holes.
    fn closure_children(&self, microdata: &str) -> Result<Vec<Child>> {
        let mut children = Vec::new();
        for link in scan_links(microdata)? {
            children.push(Child {
                kind: link.link.kind().into(),
                hash: link.link.to_hex(),
            });
            match link.link {
                Link::Obj(hash) => {
                    let nested = self.db.get_microdata(hash)?;
                    children.extend(self.closure_children(&nested)?);
                }
                Link::Id(id) => {
                    let nested = self.db.id_microdata(&id)?;
                    children.extend(self.closure_children(&nested)?);
                }
                Link::Clob(_) | Link::Blob(_) => {}
            }
        }
        Ok(children)
    }
}
