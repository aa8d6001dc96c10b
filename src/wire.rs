//! Chum wire frames.
//!
//! Requests are JSON text frames `{"type": <code>, "id": <n>, "args": {…}}`;
//! responses correlate by id and carry either a `result` or an `error` with
//! a stable code plus details dictionary. BLOB content travels in binary
//! frames terminated by a zero-length frame.

use one_core::{Error, Hash, IdHash, LinkKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 3;

/// Requested representation of a BLOB stream.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobEncoding {
    #[default]
    Binary,
    Base64,
    Utf8,
}

/// Importer-to-exporter requests, one per message code.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    GetProtocolVersion,
    GetAccessibleRoots,
    GetObjectChildren { hash: Hash },
    GetIdObjectChildren { id_hash: IdHash },
    GetObject { hash: Hash },
    GetIdObject { id_hash: IdHash },
    GetBlob { hash: Hash, encoding: BlobEncoding },
    Fin,
}

impl Request {
    pub fn code(&self) -> u8 {
        match self {
            Self::GetProtocolVersion => 1,
            Self::GetAccessibleRoots => 2,
            Self::GetObjectChildren { .. } => 3,
            Self::GetIdObjectChildren { .. } => 4,
            Self::GetObject { .. } => 5,
            Self::GetIdObject { .. } => 6,
            Self::GetBlob { .. } => 7,
            Self::Fin => 8,
        }
    }

    fn args(&self) -> Value {
        match self {
            Self::GetProtocolVersion | Self::GetAccessibleRoots | Self::Fin => json!({}),
            Self::GetObjectChildren { hash } | Self::GetObject { hash } => {
                json!({ "hash": hash })
            }
            Self::GetIdObjectChildren { id_hash } | Self::GetIdObject { id_hash } => {
                json!({ "idHash": id_hash })
            }
            Self::GetBlob { hash, encoding } => json!({ "hash": hash, "encoding": encoding }),
        }
    }
}

/// Exporter-to-importer event code.
pub const NEW_ACCESSIBLE_ROOT: u8 = 9;

fn malformed(reason: &str) -> Error {
    Error::malformed(0, reason)
}

pub fn encode_request(id: u64, request: &Request) -> String {
    json!({ "type": request.code(), "id": id, "args": request.args() }).to_string()
}

/// The exporter's event frame announcing a grown accessible set.
pub fn encode_new_accessible_root() -> String {
    json!({ "type": NEW_ACCESSIBLE_ROOT }).to_string()
}

pub fn is_new_accessible_root(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_u64))
        == Some(u64::from(NEW_ACCESSIBLE_ROOT))
}

fn arg<T: serde::de::DeserializeOwned>(args: &Value, name: &str) -> Result<T> {
    serde_json::from_value(
        args.get(name)
            .cloned()
            .ok_or_else(|| malformed("missing argument"))?,
    )
    .map_err(|e| malformed(&format!("bad argument {name}: {e}")))
}

pub fn decode_request(text: &str) -> Result<(u64, Request)> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| malformed(&format!("bad frame: {e}")))?;
    let code = frame
        .get("type")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing type"))?;
    let id = frame
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing id"))?;
    let args = frame.get("args").cloned().unwrap_or_else(|| json!({}));
    let request = match code {
        1 => Request::GetProtocolVersion,
        2 => Request::GetAccessibleRoots,
        3 => Request::GetObjectChildren {
            hash: arg(&args, "hash")?,
        },
        4 => Request::GetIdObjectChildren {
            id_hash: arg(&args, "idHash")?,
        },
        5 => Request::GetObject {
            hash: arg(&args, "hash")?,
        },
        6 => Request::GetIdObject {
            id_hash: arg(&args, "idHash")?,
        },
        7 => Request::GetBlob {
            hash: arg(&args, "hash")?,
            encoding: args
                .get("encoding")
                .filter(|v| !v.is_null())
                .map(|v| serde_json::from_value(v.clone()))
                .transpose()
                .map_err(|e| malformed(&format!("bad encoding: {e}")))?
                .unwrap_or_default(),
        },
        8 => Request::Fin,
        other => return Err(malformed(&format!("unknown message code {other}"))),
    };
    Ok((id, request))
}

pub fn encode_response_ok(id: u64, result: &impl Serialize) -> String {
    json!({ "id": id, "result": result }).to_string()
}

pub fn encode_response_err(id: u64, error: &Error) -> String {
    json!({ "id": id, "error": { "code": error.code(), "details": error.details() } })
        .to_string()
}

/// Reconstructs the typed errors the importer reacts to; everything else
/// surfaces as `Internal` with the original code in the reason.
fn decode_error(code: &str, details: &Value) -> Error {
    match code {
        "ONE-ACC1" => Error::AccessDenied {
            hash: details["hash"].as_str().unwrap_or_default().to_string(),
        },
        "ONE-PEER1" => Error::PeerUnknownService,
        "ONE-PEER2" => Error::PeerClosed,
        "ONE-PROT1" => Error::ProtocolMismatch {
            local: details["local"].as_u64().unwrap_or_default() as u32,
            remote: details["remote"].as_u64().unwrap_or_default() as u32,
        },
        code => Error::internal(format!("peer error {code}: {details}")),
    }
}

pub fn decode_response(text: &str) -> Result<(u64, Result<Value>)> {
    let frame: Value =
        serde_json::from_str(text).map_err(|e| malformed(&format!("bad frame: {e}")))?;
    let id = frame
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| malformed("missing id"))?;
    if let Some(error) = frame.get("error") {
        let code = error["code"].as_str().unwrap_or("ONE-INT1");
        return Ok((id, Err(decode_error(code, &error["details"]))));
    }
    let result = frame
        .get("result")
        .cloned()
        .ok_or_else(|| malformed("missing result"))?;
    Ok((id, Ok(result)))
}

/// One accessible root offered by the exporter.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccessibleObject {
    Unversioned {
        hash: Hash,
        #[serde(rename = "oneType")]
        one_type: String,
    },
    Versioned {
        #[serde(rename = "idHash")]
        id_hash: IdHash,
        hash: Hash,
        #[serde(rename = "oneType")]
        one_type: String,
    },
    Id {
        #[serde(rename = "idHash")]
        id_hash: IdHash,
        #[serde(rename = "oneType")]
        one_type: String,
    },
    VersionNode {
        node: Hash,
        #[serde(rename = "dataIdHash")]
        data_id_hash: IdHash,
        #[serde(rename = "dataType")]
        data_type: String,
    },
}

/// Kinds a child reference can have on the wire.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildKind {
    Object,
    Id,
    Clob,
    Blob,
}

impl From<LinkKind> for ChildKind {
    fn from(kind: LinkKind) -> Self {
        match kind {
            LinkKind::Obj => Self::Object,
            LinkKind::Id => Self::Id,
            LinkKind::Clob => Self::Clob,
            LinkKind::Blob => Self::Blob,
        }
    }
}

/// One entry of a child list, in document order of the parent's references.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Child {
    #[serde(rename = "type")]
    pub kind: ChildKind,
    pub hash: String,
}
