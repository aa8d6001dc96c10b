use crate::hash::{Hash, IdHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The four kinds of hash-link a microdata document can contain.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Obj,
    Id,
    Clob,
    Blob,
}

impl LinkKind {
    /// The value of the `data-type` attribute on `<a>` tags.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Id => "id",
            Self::Clob => "clob",
            Self::Blob => "blob",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "obj" => Some(Self::Obj),
            "id" => Some(Self::Id),
            "clob" => Some(Self::Clob),
            "blob" => Some(Self::Blob),
            _ => None,
        }
    }
}

/// A typed reference to another stored thing.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Link {
    Obj(Hash),
    Id(IdHash),
    Clob(Hash),
    Blob(Hash),
}

impl Link {
    pub fn kind(&self) -> LinkKind {
        match self {
            Self::Obj(_) => LinkKind::Obj,
            Self::Id(_) => LinkKind::Id,
            Self::Clob(_) => LinkKind::Clob,
            Self::Blob(_) => LinkKind::Blob,
        }
    }

    /// The 64-char hex form used in `href` attributes.
    pub fn to_hex(&self) -> String {
        match self {
            Self::Obj(h) | Self::Clob(h) | Self::Blob(h) => h.to_hex(),
            Self::Id(h) => h.to_hex(),
        }
    }

    pub fn from_hex(kind: LinkKind, hex: &str) -> Result<Self, crate::Error> {
        Ok(match kind {
            LinkKind::Obj => Self::Obj(hex.parse()?),
            LinkKind::Id => Self::Id(hex.parse()?),
            LinkKind::Clob => Self::Clob(hex.parse()?),
            LinkKind::Blob => Self::Blob(hex.parse()?),
        })
    }

    /// Returns the target hash for non-id links.
    pub fn hash(&self) -> Option<Hash> {
        match self {
            Self::Obj(h) | Self::Clob(h) | Self::Blob(h) => Some(*h),
            Self::Id(_) => None,
        }
    }

    /// Returns the target id-hash for id links.
    pub fn id_hash(&self) -> Option<IdHash> {
        match self {
            Self::Id(h) => Some(*h),
            _ => None,
        }
    }
}

/// A dynamically typed field value. Which variants are legal for a given
/// field is decided by the field's recipe rule, not by this type.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Number(f64),
    Bool(bool),
    Reference(Link),
    /// Nested object: itemprop to value.
    Object(BTreeMap<String, Value>),
    /// Entries kept sorted by the key's canonical string.
    Map(Vec<(Value, Value)>),
    /// Elements kept sorted by their canonical string.
    Set(Vec<Value>),
    /// Multiset in document order.
    Bag(Vec<Value>),
    /// Ordered list in document order.
    Array(Vec<Value>),
    /// Arbitrary JSON-serializable leaf.
    Stringifiable(serde_json::Value),
}

// Number values are validated to be finite before they enter an object, so
// the reflexivity hole around NaN cannot be observed.
impl Eq for Value {}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        if let Self::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let Self::Integer(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if let Self::Number(n) = self {
            Some(*n)
        } else {
            None
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let Self::Bool(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_link(&self) -> Option<Link> {
        if let Self::Reference(l) = self {
            Some(*l)
        } else {
            None
        }
    }

    pub fn as_fields(&self) -> Option<&BTreeMap<String, Value>> {
        if let Self::Object(f) = self {
            Some(f)
        } else {
            None
        }
    }

    /// Returns the elements of a set, bag or array.
    pub fn elements(&self) -> Option<&[Value]> {
        match self {
            Self::Set(e) | Self::Bag(e) | Self::Array(e) => Some(e),
            _ => None,
        }
    }

    pub fn entries(&self) -> Option<&[(Value, Value)]> {
        if let Self::Map(e) = self {
            Some(e)
        } else {
            None
        }
    }

    /// Builds a set value in canonical element order.
    pub fn set_from(elements: impl IntoIterator<Item = Value>) -> Self {
        let mut elements: Vec<Value> = elements.into_iter().collect();
        elements.sort_by(|a, b| a.canonical_string().cmp(&b.canonical_string()));
        elements.dedup();
        Self::Set(elements)
    }

    /// Builds a map value in canonical key order.
    pub fn map_from(entries: impl IntoIterator<Item = (Value, Value)>) -> Self {
        let mut entries: Vec<(Value, Value)> = entries.into_iter().collect();
        entries.sort_by(|a, b| a.0.canonical_string().cmp(&b.0.canonical_string()));
        entries.dedup_by(|a, b| a.0 == b.0);
        Self::Map(entries)
    }

    /// A total, deterministic string form. Collections are ordered by it,
    /// and the diff engine keys element transformations by it.
    pub fn canonical_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Reference(l) => l.to_hex(),
            Self::Object(fields) => {
                let mut out = String::new();
                for (k, v) in fields {
                    out.push_str(k);
                    out.push(':');
                    out.push_str(&v.canonical_string());
                    out.push(';');
                }
                out
            }
            Self::Map(entries) => {
                let mut out = String::new();
                for (k, v) in entries {
                    out.push_str(&k.canonical_string());
                    out.push('=');
                    out.push_str(&v.canonical_string());
                    out.push(';');
                }
                out
            }
            Self::Set(e) | Self::Bag(e) | Self::Array(e) => {
                let mut out = String::new();
                for v in e {
                    out.push_str(&v.canonical_string());
                    out.push(',');
                }
                out
            }
            Self::Stringifiable(json) => json.to_string(),
        }
    }
}

/// One path segment of an iterator walk. The reporting form is the dotted
/// string; navigation uses the structured form so that map keys containing
/// dots cannot be misread.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PathSeg {
    /// An itemprop on the current object level.
    Field(String),
    /// A map entry selected by key; navigates to the entry value.
    Entry(Value),
    /// A map entry selected by key; navigates to the key itself.
    Key(Value),
}

impl PathSeg {
    /// Renders the segment the way paths are reported and configured.
    pub fn render(&self) -> String {
        match self {
            Self::Field(name) => name.clone(),
            Self::Entry(key) => key.canonical_string(),
            Self::Key(key) => format!("!key!{}", key.canonical_string()),
        }
    }
}

/// Renders a full dotted path.
pub fn render_path(segs: &[PathSeg]) -> String {
    segs.iter()
        .map(PathSeg::render)
        .collect::<Vec<_>>()
        .join(".")
}

/// A typed object: a recipe name plus its field values.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Obj {
    pub type_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl Obj {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, itemprop: impl Into<String>, value: Value) -> Self {
        self.fields.insert(itemprop.into(), value);
        self
    }

    pub fn get(&self, itemprop: &str) -> Option<&Value> {
        self.fields.get(itemprop)
    }

    pub fn set(&mut self, itemprop: impl Into<String>, value: Value) {
        self.fields.insert(itemprop.into(), value);
    }

    /// Returns the value at a segment path, if every step resolves.
    pub fn at(&self, path: &[PathSeg]) -> Option<&Value> {
        let mut fields = &self.fields;
        let mut current: Option<&Value> = None;
        for seg in path {
            match seg {
                PathSeg::Field(name) => {
                    current = fields.get(name);
                    match current {
                        Some(Value::Object(nested)) => fields = nested,
                        _ => fields = &EMPTY_FIELDS,
                    }
                }
                PathSeg::Entry(key) => {
                    current = current
                        .and_then(Value::entries)
                        .and_then(|e| e.iter().find(|(k, _)| k == key))
                        .map(|(_, v)| v);
                    match current {
                        Some(Value::Object(nested)) => fields = nested,
                        _ => fields = &EMPTY_FIELDS,
                    }
                }
                PathSeg::Key(key) => {
                    current = current
                        .and_then(Value::entries)
                        .and_then(|e| e.iter().find(|(k, _)| k == key))
                        .map(|(k, _)| k);
                    fields = &EMPTY_FIELDS;
                }
            }
        }
        current
    }

    /// Writes (or with `None` removes) the value at a segment path.
    /// Intermediate objects and maps must exist. Returns false if the path
    /// did not resolve.
    pub fn set_at(&mut self, path: &[PathSeg], value: Option<Value>) -> bool {
        fn descend(slot: &mut Value, path: &[PathSeg], value: Option<Value>) -> bool {
            let (seg, rest) = match path.split_first() {
                Some(p) => p,
                None => return false,
            };
            match (seg, slot) {
                (PathSeg::Field(name), Value::Object(fields)) => {
                    set_in_fields(fields, name, rest, value)
                }
                (PathSeg::Entry(key), Value::Map(entries)) => {
                    let pos = entries.iter().position(|(k, _)| k == key);
                    if rest.is_empty() {
                        match (pos, value) {
                            (Some(i), Some(v)) => entries[i].1 = v,
                            (Some(i), None) => {
                                entries.remove(i);
                            }
                            (None, Some(v)) => {
                                let at = entries
                                    .iter()
                                    .position(|(k, _)| {
                                        k.canonical_string() > key.canonical_string()
                                    })
                                    .unwrap_or(entries.len());
                                entries.insert(at, (key.clone(), v));
                            }
                            (None, None) => return false,
                        }
                        true
                    } else {
                        match pos {
                            Some(i) => descend(&mut entries[i].1, rest, value),
                            None => false,
                        }
                    }
                }
                (PathSeg::Key(key), Value::Map(entries)) => {
                    // replacing a key renames the entry
                    let pos = match entries.iter().position(|(k, _)| k == key) {
                        Some(p) => p,
                        None => return false,
                    };
                    if !rest.is_empty() {
                        return false;
                    }
                    match value {
                        Some(new_key) => entries[pos].0 = new_key,
                        None => {
                            entries.remove(pos);
                        }
                    }
                    entries.sort_by(|a, b| a.0.canonical_string().cmp(&b.0.canonical_string()));
                    true
                }
                _ => false,
            }
        }

        fn set_in_fields(
            fields: &mut BTreeMap<String, Value>,
            name: &str,
            rest: &[PathSeg],
            value: Option<Value>,
        ) -> bool {
            if rest.is_empty() {
                match value {
                    Some(v) => {
                        fields.insert(name.to_string(), v);
                    }
                    None => {
                        fields.remove(name);
                    }
                }
                true
            } else {
                match fields.get_mut(name) {
                    Some(slot) => descend(slot, rest, value),
                    None => false,
                }
            }
        }

        let (seg, rest) = match path.split_first() {
            Some(p) => p,
            None => return false,
        };
        match seg {
            PathSeg::Field(name) => set_in_fields(&mut self.fields, name, rest, value),
            _ => false,
        }
    }
}

static EMPTY_FIELDS: BTreeMap<String, Value> = BTreeMap::new();
