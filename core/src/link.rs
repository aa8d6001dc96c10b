//! Discovery of hash-links inside microdata, and the implode helper that
//! inlines a whole reference closure into one self-contained string.
//!
//! The scanner works over the flat canonical string. It never builds a DOM:
//! the itemprop of a hash-link is on the `<a>` tag itself when present and
//! otherwise inherited from the nearest enclosing `<span itemprop=…>`, so a
//! single pass with a span stack is enough at any nesting depth.

use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::microdata::escape;
use crate::store::Db;
use crate::value::{Link, LinkKind};
use std::collections::BTreeMap;

/// One hash-link occurrence. `start..end` spans the whole `<a>` element.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedLink {
    pub start: usize,
    pub end: usize,
    /// Own or inherited itemprop.
    pub itemprop: Option<String>,
    pub link: Link,
}

fn tag_attr(tag: &str, name: &str) -> Option<String> {
    let marker = format!("{name}=\"");
    let at = tag.find(&marker)? + marker.len();
    let end = tag[at..].find('"')?;
    Some(tag[at..at + end].to_string())
}

/// Returns every hash-link in document order.
pub fn scan_links(microdata: &str) -> Result<Vec<ScannedLink>> {
    let mut links = Vec::new();
    let mut spans: Vec<Option<String>> = Vec::new();
    let mut pos = 0;
    while let Some(i) = microdata[pos..].find('<') {
        let start = pos + i;
        let close = microdata[start..]
            .find('>')
            .ok_or_else(|| Error::malformed(start, "unterminated tag"))?;
        let tag = &microdata[start..start + close + 1];
        pos = start + close + 1;
        if tag.starts_with("<span") {
            spans.push(tag_attr(tag, "itemprop"));
        } else if tag == "</span>" {
            spans
                .pop()
                .ok_or_else(|| Error::malformed(start, "unbalanced </span>"))?;
        } else if tag.starts_with("<a") {
            let kind = tag_attr(tag, "data-type")
                .and_then(|k| LinkKind::parse(&k))
                .ok_or_else(|| Error::malformed(start, "hash-link without data-type"))?;
            let href = tag_attr(tag, "href")
                .ok_or_else(|| Error::malformed(start, "hash-link without href"))?;
            let body_end = microdata[pos..]
                .find("</a>")
                .ok_or_else(|| Error::malformed(pos, "unterminated hash-link"))?;
            let end = pos + body_end + "</a>".len();
            let itemprop = tag_attr(tag, "itemprop")
                .or_else(|| spans.iter().rev().find_map(Clone::clone));
            links.push(ScannedLink {
                start,
                end,
                itemprop,
                link: Link::from_hex(kind, &href)?,
            });
            pos = end;
        }
    }
    Ok(links)
}

/// Groups the links of [`scan_links`] by itemprop, preserving document order
/// within each group.
pub fn find_all_hash_links(microdata: &str) -> Result<BTreeMap<String, Vec<ScannedLink>>> {
    let mut by_prop: BTreeMap<String, Vec<ScannedLink>> = BTreeMap::new();
    for link in scan_links(microdata)? {
        if let Some(prop) = link.itemprop.clone() {
            by_prop.entry(prop).or_default().push(link);
        }
    }
    Ok(by_prop)
}

/// Resolves an id-reference to a concrete object hash.
pub type IdResolver<'a> = dyn Fn(&IdHash) -> Result<Option<Hash>> + 'a;

/// Returns a self-contained microdata string for `root` with every
/// referenced object, id-object, CLOB and BLOB inlined in place of its
/// hash-link. The result is a presentation form and is never written back.
pub fn implode(db: &Db, root: Hash, resolve_id: &IdResolver) -> Result<String> {
    let mut microdata = db.get_microdata(root)?;
    for link in scan_links(&microdata)?.into_iter().rev() {
        let inlined = match link.link {
            Link::Obj(hash) => implode(db, hash, resolve_id)?,
            Link::Id(id) => match resolve_id(&id)? {
                Some(hash) => implode(db, hash, resolve_id)?,
                None => continue,
            },
            Link::Clob(hash) => format!("<span>{}</span>", escape(&db.read_text(hash)?)),
            Link::Blob(hash) => format!("<span>{}</span>", hex::encode(db.read_bytes(hash)?)),
        };
        microdata.replace_range(link.start..link.end, &inlined);
    }
    Ok(microdata)
}

/// [`implode`] resolving id-references to the current head version.
pub fn implode_current(db: &Db, root: Hash) -> Result<String> {
    let db2 = db.clone();
    implode(db, root, &move |id| {
        Ok(match db2.version_head(id)? {
            Some(node) => Some(db2.get_version_node(node)?.data()),
            None => None,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn scans_in_document_order_with_inherited_itemprops() {
        let md = format!(
            "<div itemscope itemtype=\"//refin.io/X\">\
             <a itemprop=\"direct\" data-type=\"obj\" href=\"{0}\">{0}</a>\
             <span itemprop=\"list\">\
             <a data-type=\"blob\" href=\"{1}\">{1}</a>\
             <span><a data-type=\"id\" href=\"{2}\">{2}</a></span>\
             </span></div>",
            hex(1),
            hex(2),
            hex(3)
        );
        let links = scan_links(&md).unwrap();
        assert_eq!(links.len(), 3);
        assert_eq!(links[0].itemprop.as_deref(), Some("direct"));
        assert_eq!(links[0].link.kind(), LinkKind::Obj);
        assert_eq!(links[1].itemprop.as_deref(), Some("list"));
        assert_eq!(links[2].itemprop.as_deref(), Some("list"));
        assert_eq!(links[2].link.kind(), LinkKind::Id);
        assert_eq!(&md[links[0].start..links[0].end],
            &format!("<a itemprop=\"direct\" data-type=\"obj\" href=\"{0}\">{0}</a>", hex(1)));

        let by_prop = find_all_hash_links(&md).unwrap();
        assert_eq!(by_prop["list"].len(), 2);
        assert_eq!(by_prop["direct"].len(), 1);
    }

    #[test]
    fn rejects_malformed_links() {
        assert!(scan_links("<a href=\"00\">x</a>").is_err());
        assert!(scan_links("<span itemprop=\"x\"").is_err());
    }

    #[test]
    fn implode_inlines_the_whole_closure() {
        use crate::recipe::{ItemType, Recipe, RecipeRule};
        use crate::value::{Obj, Value};

        let db = Db::memory().unwrap();
        db.registry()
            .register(Recipe::new(
                "Note",
                vec![RecipeRule::new("text", ItemType::string())],
            ))
            .unwrap();
        db.registry()
            .register(Recipe::new(
                "Doc",
                vec![
                    RecipeRule::new("note", ItemType::reference_to_obj(["Note"])),
                    RecipeRule::new("body", ItemType::ReferenceToClob),
                ],
            ))
            .unwrap();
        let note = db
            .store_unversioned_object(&Obj::new("Note").with("text", Value::String("inner".into())))
            .unwrap();
        let clob = db.write_clob("clob text").unwrap();
        let doc = db
            .store_unversioned_object(
                &Obj::new("Doc")
                    .with("note", Value::Reference(Link::Obj(note)))
                    .with("body", Value::Reference(Link::Clob(clob))),
            )
            .unwrap();

        let imploded = implode_current(&db, doc).unwrap();
        assert!(imploded.contains("<span itemprop=\"text\">inner</span>"));
        assert!(imploded.contains("<span>clob text</span>"));
        assert!(!imploded.contains(&note.to_hex()));
        assert!(!imploded.contains(&clob.to_hex()));
    }
}
