//! Deterministic object ↔ microdata conversion.
//!
//! The canonical form is an HTML-like string: one outer `<div>` carrying the
//! type, one `<span itemprop=…>` per field in recipe order, `<a>` elements
//! for hash-links. Two objects are equal exactly when their microdata is
//! byte-identical, which is what makes content addressing work: the object
//! hash is the SHA-256 of this string and nothing else.
//!
//! Sets and map entries serialize in canonical order (ascending by the
//! element's or key's canonical string), so that logically equal collections
//! hash identically no matter how they were built.

use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::recipe::{ItemType, RecipeRule, Registry};
use crate::value::{Link, LinkKind, Obj, Value};
use std::collections::BTreeMap;

/// Prefix of every `itemtype` attribute.
pub const TYPE_PREFIX: &str = "//refin.io/";

/// Attribute distinguishing an id-projection from a concrete object, so the
/// two hash namespaces cannot collide even for an object consisting only of
/// identity fields.
const ID_ATTR: &str = "data-id-object=\"true\" ";

pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

pub fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        for (entity, c) in [("&amp;", '&'), ("&lt;", '<'), ("&gt;", '>')] {
            if let Some(tail) = rest.strip_prefix(entity) {
                out.push(c);
                rest = tail;
                break;
            }
        }
        if rest.starts_with('&') {
            return Err(Error::malformed(s.len() - rest.len(), "bare ampersand"));
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Serializes a concrete object to its canonical microdata string.
pub fn serialize(registry: &Registry, obj: &Obj) -> Result<String> {
    let recipe = registry.get(&obj.type_name)?;
    let mut out = String::new();
    out.push_str("<div itemscope itemtype=\"");
    out.push_str(TYPE_PREFIX);
    out.push_str(&obj.type_name);
    out.push_str("\">");
    write_fields(&mut out, &recipe.rules, &obj.fields, &obj.type_name)?;
    out.push_str("</div>");
    Ok(out)
}

/// Serializes the identity projection of a versioned object.
pub fn serialize_id(registry: &Registry, obj: &Obj) -> Result<String> {
    let recipe = registry.get(&obj.type_name)?;
    if !recipe.is_versioned() {
        return Err(Error::TypeMismatch {
            path: obj.type_name.clone(),
            expected: "versioned object type".into(),
            found: "unversioned".into(),
        });
    }
    let id_rules: Vec<RecipeRule> = recipe.id_rules().cloned().collect();
    let mut out = String::new();
    out.push_str("<div ");
    out.push_str(ID_ATTR);
    out.push_str("itemscope itemtype=\"");
    out.push_str(TYPE_PREFIX);
    out.push_str(&obj.type_name);
    out.push_str("\">");
    let mut id_fields = BTreeMap::new();
    for rule in &id_rules {
        if let Some(v) = obj.get(&rule.itemprop) {
            id_fields.insert(rule.itemprop.clone(), v.clone());
        }
    }
    write_fields(&mut out, &id_rules, &id_fields, &obj.type_name)?;
    out.push_str("</div>");
    Ok(out)
}

/// SHA-256 over the canonical microdata.
pub fn object_hash(registry: &Registry, obj: &Obj) -> Result<Hash> {
    Ok(Hash::digest(serialize(registry, obj)?.as_bytes()))
}

/// SHA-256 over the canonical id-microdata.
pub fn id_hash(registry: &Registry, obj: &Obj) -> Result<IdHash> {
    Ok(IdHash::digest(serialize_id(registry, obj)?.as_bytes()))
}

fn write_fields(
    out: &mut String,
    rules: &[RecipeRule],
    fields: &BTreeMap<String, Value>,
    path: &str,
) -> Result<()> {
    for name in fields.keys() {
        if !rules.iter().any(|r| &r.itemprop == name) {
            return Err(Error::TypeMismatch {
                path: format!("{path}.{name}"),
                expected: "a recipe rule".into(),
                found: "unknown field".into(),
            });
        }
    }
    for rule in rules {
        let path = format!("{path}.{}", rule.itemprop);
        match fields.get(&rule.itemprop) {
            Some(value) => write_value(out, &rule.itemtype, Some(rule.itemprop.as_str()), value, &path)?,
            None if rule.optional => {}
            None => {
                return Err(Error::TypeMismatch {
                    path,
                    expected: rule.itemtype.kind().into(),
                    found: "missing field".into(),
                })
            }
        }
    }
    Ok(())
}

fn open_span(out: &mut String, itemprop: Option<&str>) {
    match itemprop {
        Some(p) => {
            out.push_str("<span itemprop=\"");
            out.push_str(p);
            out.push_str("\">");
        }
        None => out.push_str("<span>"),
    }
}

fn mismatch(path: &str, expected: &ItemType, found: &Value) -> Error {
    let found = match found {
        Value::String(_) => "string",
        Value::Integer(_) => "integer",
        Value::Number(_) => "number",
        Value::Bool(_) => "boolean",
        Value::Reference(_) => "reference",
        Value::Object(_) => "object",
        Value::Map(_) => "map",
        Value::Set(_) => "set",
        Value::Bag(_) => "bag",
        Value::Array(_) => "array",
        Value::Stringifiable(_) => "stringifiable",
    };
    Error::TypeMismatch {
        path: path.into(),
        expected: expected.kind().into(),
        found: found.into(),
    }
}

fn write_value(
    out: &mut String,
    itemtype: &ItemType,
    itemprop: Option<&str>,
    value: &Value,
    path: &str,
) -> Result<()> {
    match (itemtype, value) {
        (ItemType::String { regexp }, Value::String(s)) => {
            if let Some(re) = regexp {
                let re = regex::Regex::new(re)
                    .map_err(|e| Error::internal(format!("unvalidated regexp: {e}")))?;
                if !re.is_match(s) {
                    return Err(Error::ValueOutOfRange {
                        path: path.into(),
                        value: s.clone(),
                    });
                }
            }
            open_span(out, itemprop);
            out.push_str(&escape(s));
            out.push_str("</span>");
        }
        (ItemType::Integer { min, max }, Value::Integer(i)) => {
            if min.map_or(false, |m| *i < m) || max.map_or(false, |m| *i > m) {
                return Err(Error::ValueOutOfRange {
                    path: path.into(),
                    value: i.to_string(),
                });
            }
            open_span(out, itemprop);
            out.push_str(&i.to_string());
            out.push_str("</span>");
        }
        (ItemType::Number { min, max }, Value::Number(n)) => {
            if !n.is_finite() || min.map_or(false, |m| *n < m) || max.map_or(false, |m| *n > m) {
                return Err(Error::ValueOutOfRange {
                    path: path.into(),
                    value: n.to_string(),
                });
            }
            open_span(out, itemprop);
            out.push_str(&n.to_string());
            out.push_str("</span>");
        }
        (ItemType::Boolean, Value::Bool(b)) => {
            open_span(out, itemprop);
            out.push_str(if *b { "true" } else { "false" });
            out.push_str("</span>");
        }
        (ItemType::Stringifiable, Value::Stringifiable(json)) => {
            open_span(out, itemprop);
            out.push_str(&escape(&json.to_string()));
            out.push_str("</span>");
        }
        (
            ItemType::ReferenceToObj { .. }
            | ItemType::ReferenceToId { .. }
            | ItemType::ReferenceToClob
            | ItemType::ReferenceToBlob,
            Value::Reference(link),
        ) => {
            let expected = match itemtype {
                ItemType::ReferenceToObj { .. } => LinkKind::Obj,
                ItemType::ReferenceToId { .. } => LinkKind::Id,
                ItemType::ReferenceToClob => LinkKind::Clob,
                _ => LinkKind::Blob,
            };
            if link.kind() != expected {
                return Err(mismatch(path, itemtype, value));
            }
            let hex = link.to_hex();
            out.push_str("<a ");
            if let Some(p) = itemprop {
                out.push_str("itemprop=\"");
                out.push_str(p);
                out.push_str("\" ");
            }
            out.push_str("data-type=\"");
            out.push_str(link.kind().as_str());
            out.push_str("\" href=\"");
            out.push_str(&hex);
            out.push_str("\">");
            out.push_str(&hex);
            out.push_str("</a>");
        }
        (ItemType::Object { rules }, Value::Object(fields)) => {
            open_span(out, itemprop);
            write_fields(out, rules, fields, path)?;
            out.push_str("</span>");
        }
        (ItemType::Map { key, value: vt }, Value::Map(entries)) => {
            let mut sorted: Vec<&(Value, Value)> = entries.iter().collect();
            sorted.sort_by_key(|(k, _)| k.canonical_string());
            open_span(out, itemprop);
            for (k, v) in sorted {
                out.push_str("<span>");
                write_value(out, key, Some("key"), k, &format!("{path}.!key!"))?;
                write_value(out, vt, Some("value"), v, &format!("{path}.{}", k.canonical_string()))?;
                out.push_str("</span>");
            }
            out.push_str("</span>");
        }
        (ItemType::Set { item }, Value::Set(elements)) => {
            let mut sorted: Vec<&Value> = elements.iter().collect();
            sorted.sort_by_key(|v| v.canonical_string());
            open_span(out, itemprop);
            for element in sorted {
                write_value(out, item, None, element, path)?;
            }
            out.push_str("</span>");
        }
        (ItemType::Bag { item }, Value::Bag(elements))
        | (ItemType::Array { item }, Value::Array(elements)) => {
            open_span(out, itemprop);
            for element in elements {
                write_value(out, item, None, element, path)?;
            }
            out.push_str("</span>");
        }
        (itemtype, value) => return Err(mismatch(path, itemtype, value)),
    }
    Ok(())
}

/// Parses canonical microdata of a concrete object.
pub fn parse(registry: &Registry, microdata: &str) -> Result<Obj> {
    let (obj, id_obj) = parse_any(registry, microdata)?;
    if id_obj {
        return Err(Error::TypeMismatch {
            path: obj.type_name,
            expected: "concrete object".into(),
            found: "id object".into(),
        });
    }
    Ok(obj)
}

/// Parses canonical id-microdata.
pub fn parse_id(registry: &Registry, microdata: &str) -> Result<Obj> {
    let (obj, id_obj) = parse_any(registry, microdata)?;
    if !id_obj {
        return Err(Error::TypeMismatch {
            path: obj.type_name,
            expected: "id object".into(),
            found: "concrete object".into(),
        });
    }
    Ok(obj)
}

/// Parses either form; the flag reports whether it was an id-projection.
pub fn parse_any(registry: &Registry, microdata: &str) -> Result<(Obj, bool)> {
    let mut p = Parser {
        s: microdata,
        pos: 0,
    };
    p.eat("<div ")?;
    let id_obj = p.try_eat(ID_ATTR);
    p.eat("itemscope itemtype=\"")?;
    p.eat(TYPE_PREFIX)?;
    let type_name = p.read_until('"')?.to_string();
    p.eat("\">")?;
    let recipe = registry.get(&type_name)?;
    let rules: Vec<RecipeRule> = if id_obj {
        recipe.id_rules().cloned().collect()
    } else {
        recipe.rules.clone()
    };
    if id_obj && rules.is_empty() {
        return Err(Error::TypeMismatch {
            path: type_name,
            expected: "versioned object type".into(),
            found: "unversioned".into(),
        });
    }
    let mut obj = Obj::new(type_name.clone());
    parse_fields(&mut p, &rules, &mut obj.fields, &type_name)?;
    p.eat("</div>")?;
    if p.pos != p.s.len() {
        return Err(p.error("trailing garbage"));
    }
    Ok((obj, id_obj))
}

struct Parser<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> Error {
        Error::malformed(self.pos, reason)
    }

    fn rest(&self) -> &'a str {
        &self.s[self.pos..]
    }

    fn eat(&mut self, token: &str) -> Result<()> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn try_eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn read_until(&mut self, stop: char) -> Result<&'a str> {
        match self.rest().find(stop) {
            Some(i) => {
                let s = &self.rest()[..i];
                self.pos += i;
                Ok(s)
            }
            None => Err(self.error(format!("unterminated, expected {stop:?}"))),
        }
    }

    /// Reads text up to the next tag.
    fn read_text(&mut self) -> Result<String> {
        let i = self.rest().find('<').unwrap_or(self.rest().len());
        let raw = &self.rest()[..i];
        self.pos += i;
        unescape(raw)
    }
}

fn parse_fields(
    p: &mut Parser,
    rules: &[RecipeRule],
    fields: &mut BTreeMap<String, Value>,
    path: &str,
) -> Result<()> {
    for rule in rules {
        let path = format!("{path}.{}", rule.itemprop);
        let span_open = format!("<span itemprop=\"{}\">", rule.itemprop);
        let a_open = format!("<a itemprop=\"{}\" ", rule.itemprop);
        let present = p.rest().starts_with(&span_open) || p.rest().starts_with(&a_open);
        if !present {
            if rule.optional {
                continue;
            }
            return Err(Error::TypeMismatch {
                path,
                expected: rule.itemtype.kind().into(),
                found: "missing field".into(),
            });
        }
        let value = parse_value(p, &rule.itemtype, Some(rule.itemprop.as_str()), &path)?;
        fields.insert(rule.itemprop.clone(), value);
    }
    Ok(())
}

fn parse_value(
    p: &mut Parser,
    itemtype: &ItemType,
    itemprop: Option<&str>,
    path: &str,
) -> Result<Value> {
    match itemtype {
        ItemType::ReferenceToObj { .. }
        | ItemType::ReferenceToId { .. }
        | ItemType::ReferenceToClob
        | ItemType::ReferenceToBlob => {
            let expected = match itemtype {
                ItemType::ReferenceToObj { .. } => LinkKind::Obj,
                ItemType::ReferenceToId { .. } => LinkKind::Id,
                ItemType::ReferenceToClob => LinkKind::Clob,
                _ => LinkKind::Blob,
            };
            p.eat("<a ")?;
            if let Some(prop) = itemprop {
                p.eat(&format!("itemprop=\"{prop}\" "))?;
            }
            p.eat("data-type=\"")?;
            let kind = p.read_until('"')?;
            let kind = LinkKind::parse(kind)
                .ok_or_else(|| p.error(format!("unknown link kind {kind:?}")))?;
            if kind != expected {
                return Err(Error::TypeMismatch {
                    path: path.into(),
                    expected: expected.as_str().into(),
                    found: kind.as_str().into(),
                });
            }
            p.eat("\" href=\"")?;
            let href = p.read_until('"')?.to_string();
            p.eat("\">")?;
            let body = p.read_until('<')?;
            if body != href {
                return Err(p.error("href and body disagree"));
            }
            p.eat("</a>")?;
            Ok(Value::Reference(Link::from_hex(kind, &href)?))
        }
        _ => {
            match itemprop {
                Some(prop) => p.eat(&format!("<span itemprop=\"{prop}\">"))?,
                None => p.eat("<span>")?,
            }
            let value = parse_span_body(p, itemtype, path)?;
            p.eat("</span>")?;
            Ok(value)
        }
    }
}

fn parse_span_body(p: &mut Parser, itemtype: &ItemType, path: &str) -> Result<Value> {
    match itemtype {
        ItemType::String { regexp } => {
            let s = p.read_text()?;
            if let Some(re) = regexp {
                let re = regex::Regex::new(re)
                    .map_err(|e| Error::internal(format!("unvalidated regexp: {e}")))?;
                if !re.is_match(&s) {
                    return Err(Error::ValueOutOfRange {
                        path: path.into(),
                        value: s,
                    });
                }
            }
            Ok(Value::String(s))
        }
        ItemType::Integer { min, max } => {
            let s = p.read_text()?;
            let i: i64 = s.parse().map_err(|_| Error::TypeMismatch {
                path: path.into(),
                expected: "integer".into(),
                found: s.clone(),
            })?;
            if min.map_or(false, |m| i < m) || max.map_or(false, |m| i > m) {
                return Err(Error::ValueOutOfRange {
                    path: path.into(),
                    value: s,
                });
            }
            Ok(Value::Integer(i))
        }
        ItemType::Number { min, max } => {
            let s = p.read_text()?;
            let n: f64 = s.parse().map_err(|_| Error::TypeMismatch {
                path: path.into(),
                expected: "number".into(),
                found: s.clone(),
            })?;
            if !n.is_finite() || min.map_or(false, |m| n < m) || max.map_or(false, |m| n > m) {
                return Err(Error::ValueOutOfRange {
                    path: path.into(),
                    value: s,
                });
            }
            Ok(Value::Number(n))
        }
        ItemType::Boolean => {
            let s = p.read_text()?;
            match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(Error::TypeMismatch {
                    path: path.into(),
                    expected: "boolean".into(),
                    found: s,
                }),
            }
        }
        ItemType::Stringifiable => {
            let s = p.read_text()?;
            let json = serde_json::from_str(&s)
                .map_err(|e| p.error(format!("bad stringifiable: {e}")))?;
            Ok(Value::Stringifiable(json))
        }
        ItemType::Object { rules } => {
            let mut fields = BTreeMap::new();
            parse_fields(p, rules, &mut fields, path)?;
            Ok(Value::Object(fields))
        }
        ItemType::Map { key, value } => {
            let mut entries = Vec::new();
            while p.try_eat("<span>") {
                let k = parse_value(p, key, Some("key"), &format!("{path}.!key!"))?;
                let v = parse_value(
                    p,
                    value,
                    Some("value"),
                    &format!("{path}.{}", k.canonical_string()),
                )?;
                p.eat("</span>")?;
                entries.push((k, v));
            }
            let sorted = entries
                .windows(2)
                .all(|w| w[0].0.canonical_string() < w[1].0.canonical_string());
            if !sorted {
                return Err(p.error("map entries out of canonical order"));
            }
            Ok(Value::Map(entries))
        }
        ItemType::Set { item } => {
            let elements = parse_elements(p, item, path)?;
            let sorted = elements
                .windows(2)
                .all(|w| w[0].canonical_string() < w[1].canonical_string());
            if !sorted {
                return Err(p.error("set elements out of canonical order"));
            }
            Ok(Value::Set(elements))
        }
        ItemType::Bag { item } => Ok(Value::Bag(parse_elements(p, item, path)?)),
        ItemType::Array { item } => Ok(Value::Array(parse_elements(p, item, path)?)),
        ItemType::ReferenceToObj { .. }
        | ItemType::ReferenceToId { .. }
        | ItemType::ReferenceToClob
        | ItemType::ReferenceToBlob => unreachable!("references are parsed as <a> elements"),
    }
}

fn parse_elements(p: &mut Parser, item: &ItemType, path: &str) -> Result<Vec<Value>> {
    let mut elements = Vec::new();
    while p.rest().starts_with("<span>") || p.rest().starts_with("<a ") {
        elements.push(parse_value(p, item, None, path)?);
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{test_registry, thing};
    use crate::recipe::{ItemType, Recipe, RecipeRule};
    use proptest::prelude::*;

    fn note_registry() -> Registry {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Note",
            vec![
                RecipeRule::new("text", ItemType::string()),
                RecipeRule::new("title", ItemType::string()).optional(),
            ],
        ))
        .unwrap();
        reg
    }

    #[test]
    fn serialize_note() {
        let reg = note_registry();
        let obj = Obj::new("Note")
            .with("text", Value::String("hi".into()))
            .with("title", Value::String("t".into()));
        let md = serialize(&reg, &obj).unwrap();
        assert_eq!(
            md,
            "<div itemscope itemtype=\"//refin.io/Note\">\
             <span itemprop=\"text\">hi</span>\
             <span itemprop=\"title\">t</span></div>"
        );
        assert_eq!(parse(&reg, &md).unwrap(), obj);
        assert_eq!(object_hash(&reg, &obj).unwrap().to_hex().len(), 64);
    }

    #[test]
    fn optional_field_is_omitted() {
        let reg = note_registry();
        let obj = Obj::new("Note").with("text", Value::String("hi".into()));
        let md = serialize(&reg, &obj).unwrap();
        assert!(!md.contains("title"));
        assert_eq!(parse(&reg, &md).unwrap(), obj);
    }

    #[test]
    fn missing_required_field() {
        let reg = note_registry();
        let obj = Obj::new("Note").with("title", Value::String("t".into()));
        assert!(matches!(
            serialize(&reg, &obj).unwrap_err(),
            Error::TypeMismatch { .. }
        ));
    }

    #[test]
    fn unknown_type_and_trailing_garbage() {
        let reg = note_registry();
        assert!(matches!(
            parse(&reg, "<div itemscope itemtype=\"//refin.io/Nope\"></div>").unwrap_err(),
            Error::RecipeUnknown { .. }
        ));
        let md = serialize(
            &reg,
            &Obj::new("Note").with("text", Value::String("x".into())),
        )
        .unwrap();
        assert!(matches!(
            parse(&reg, &format!("{md} ")).unwrap_err(),
            Error::MalformedMicrodata { .. }
        ));
    }

    #[test]
    fn escaping_round_trips() {
        let reg = note_registry();
        let obj = Obj::new("Note").with("text", Value::String("a<b>&amp;c".into()));
        let md = serialize(&reg, &obj).unwrap();
        assert!(md.contains("a&lt;b&gt;&amp;amp;c"));
        assert_eq!(parse(&reg, &md).unwrap(), obj);
    }

    #[test]
    fn id_projection_and_hash_separation() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Person",
            vec![RecipeRule::new("email", ItemType::string()).id()],
        ))
        .unwrap();
        let obj = Obj::new("Person").with("email", Value::String("a@b".into()));
        let md = serialize(&reg, &obj).unwrap();
        let id_md = serialize_id(&reg, &obj).unwrap();
        assert!(id_md.starts_with("<div data-id-object=\"true\" itemscope"));
        // only identity fields exist, yet the hashes stay distinct
        assert_ne!(md, id_md);
        assert_ne!(
            object_hash(&reg, &obj).unwrap().to_hex(),
            id_hash(&reg, &obj).unwrap().to_hex()
        );
        assert_eq!(parse_id(&reg, &id_md).unwrap(), obj);
    }

    #[test]
    fn id_hash_ignores_non_id_fields() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Doc",
            vec![
                RecipeRule::new("name", ItemType::string()).id(),
                RecipeRule::new("body", ItemType::string()),
            ],
        ))
        .unwrap();
        let a = Obj::new("Doc")
            .with("name", Value::String("n".into()))
            .with("body", Value::String("one".into()));
        let b = Obj::new("Doc")
            .with("name", Value::String("n".into()))
            .with("body", Value::String("two".into()));
        assert_eq!(id_hash(&reg, &a).unwrap(), id_hash(&reg, &b).unwrap());
        assert_ne!(object_hash(&reg, &a).unwrap(), object_hash(&reg, &b).unwrap());
    }

    #[test]
    fn set_serialization_is_order_independent() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Tags",
            vec![RecipeRule::new("tags", ItemType::set_of(ItemType::string()))],
        ))
        .unwrap();
        let a = Obj::new("Tags").with(
            "tags",
            Value::set_from([Value::String("b".into()), Value::String("a".into())]),
        );
        let b = Obj::new("Tags").with(
            "tags",
            Value::set_from([Value::String("a".into()), Value::String("b".into())]),
        );
        assert_eq!(serialize(&reg, &a).unwrap(), serialize(&reg, &b).unwrap());
    }

    #[test]
    fn range_and_regex_enforcement() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Limits",
            vec![
                RecipeRule::new(
                    "n",
                    ItemType::Integer {
                        min: Some(0),
                        max: Some(10),
                    },
                ),
                RecipeRule::new(
                    "s",
                    ItemType::String {
                        regexp: Some("^[a-z]+$".into()),
                    },
                )
                .optional(),
            ],
        ))
        .unwrap();
        let over = Obj::new("Limits").with("n", Value::Integer(11));
        assert!(matches!(
            serialize(&reg, &over).unwrap_err(),
            Error::ValueOutOfRange { .. }
        ));
        let bad = Obj::new("Limits")
            .with("n", Value::Integer(1))
            .with("s", Value::String("UPPER".into()));
        assert!(matches!(
            serialize(&reg, &bad).unwrap_err(),
            Error::ValueOutOfRange { .. }
        ));
    }

    #[test]
    fn reference_round_trip() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Link",
            vec![
                RecipeRule::new("target", ItemType::reference_to_obj(["*"])),
                RecipeRule::new("blob", ItemType::ReferenceToBlob).optional(),
            ],
        ))
        .unwrap();
        let h = Hash::digest(b"target");
        let obj = Obj::new("Link")
            .with("target", Value::Reference(Link::Obj(h)))
            .with("blob", Value::Reference(Link::Blob(Hash::digest(b"b"))));
        let md = serialize(&reg, &obj).unwrap();
        assert!(md.contains(&format!(
            "<a itemprop=\"target\" data-type=\"obj\" href=\"{}\">{}</a>",
            h.to_hex(),
            h.to_hex()
        )));
        assert_eq!(parse(&reg, &md).unwrap(), obj);
    }

    #[test]
    fn wrong_link_kind_is_a_type_mismatch() {
        let reg = Registry::new();
        reg.register(Recipe::new(
            "Link",
            vec![RecipeRule::new("target", ItemType::reference_to_obj(["*"]))],
        ))
        .unwrap();
        let obj = Obj::new("Link").with(
            "target",
            Value::Reference(Link::Blob(Hash::digest(b"b"))),
        );
        assert!(matches!(
            serialize(&reg, &obj).unwrap_err(),
            Error::TypeMismatch { .. }
        ));
    }

    proptest! {
        #[test]
        fn round_trip(obj in thing()) {
            let reg = test_registry();
            let md = serialize(&reg, &obj).unwrap();
            let parsed = parse(&reg, &md).unwrap();
            prop_assert_eq!(&parsed, &obj);
            // reserializing the parse yields identical bytes and hash
            prop_assert_eq!(serialize(&reg, &parsed).unwrap(), md.clone());
            prop_assert_eq!(
                object_hash(&reg, &obj).unwrap(),
                Hash::digest(md.as_bytes())
            );
        }
    }
}
