use once_cell::sync::Lazy;
use regex::Regex;

use crate::docx::session::PackageSession;
use crate::docx::xml::{escape_attr, parse_xml_part, write_xml_part, XmlEvent, XmlPart};
use crate::error::{PatchError, Result};

static REL_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rId(\d+)$").expect("valid rel id regex"));

const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub type_: String,
    pub target: String,
    pub external: bool,
}

/// Relationships file of one owning part, kept as an event stream so unrelated markup survives.
#[derive(Clone, Debug)]
pub struct Relationships {
    part: XmlPart,
}

/// `dir/_rels/name.rels` for `dir/name`.
pub fn rels_for_part(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file_name)) => format!("{dir}/_rels/{file_name}.rels"),
        None => format!("_rels/{part}.rels"),
    }
}

/// Resolves a relationship target against the directory of the owning part (never against the
/// `_rels` directory that stores the relationship).
pub fn resolve_target(source_part: &str, target: &str) -> String {
    let target = target.split('#').next().unwrap_or(target);
    if target.is_empty() {
        return normalize(source_part);
    }
    if let Some(target) = target.strip_prefix('/') {
        return normalize(target);
    }
    let base_dir = source_part.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
    normalize(&format!("{base_dir}/{target}"))
}

/// Relative target from the directory of `source_part` to `target_part`.
pub fn relative_target(source_part: &str, target_part: &str) -> String {
    let base: Vec<&str> = source_part
        .rsplit_once('/')
        .map(|(dir, _)| dir.split('/').collect())
        .unwrap_or_default();
    let target: Vec<&str> = target_part.split('/').collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<&str> = vec![".."; base.len() - common];
    parts.extend_from_slice(&target[common..]);
    parts.join("/")
}

fn normalize(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out.join("/")
}

impl Relationships {
    pub fn empty(rels_part: &str) -> Self {
        Self {
            part: XmlPart {
                name: rels_part.to_string(),
                events: vec![
                    XmlEvent::Decl {
                        version: "1.0".to_string(),
                        encoding: Some("UTF-8".to_string()),
                        standalone: Some("yes".to_string()),
                    },
                    XmlEvent::Start {
                        name: "Relationships".to_string(),
                        attrs: vec![("xmlns".to_string(), RELS_NS.to_string())],
                    },
                    XmlEvent::End {
                        name: "Relationships".to_string(),
                    },
                ],
            },
        }
    }

    pub fn parse(rels_part: &str, xml: &[u8]) -> Result<Self> {
        let mut part = parse_xml_part(rels_part, xml)?;
        // `<Relationships/>` has nowhere to append to; expand it.
        if let Some(idx) = part
            .events
            .iter()
            .position(|ev| matches!(ev, XmlEvent::Empty { name, .. } if name.ends_with("Relationships")))
        {
            if let XmlEvent::Empty { name, attrs } = part.events[idx].clone() {
                part.events[idx] = XmlEvent::Start {
                    name: name.clone(),
                    attrs,
                };
                part.events.insert(idx + 1, XmlEvent::End { name });
            }
        }
        Ok(Self { part })
    }

    pub fn load(session: &PackageSession, owner_part: &str) -> Result<Option<Self>> {
        let rels_part = rels_for_part(owner_part);
        if !session.part_exists(&rels_part)? {
            return Ok(None);
        }
        let bytes = session.read_part(&rels_part)?;
        Self::parse(&rels_part, &bytes).map(Some)
    }

    pub fn load_or_empty(session: &PackageSession, owner_part: &str) -> Result<Self> {
        Ok(Self::load(session, owner_part)?
            .unwrap_or_else(|| Self::empty(&rels_for_part(owner_part))))
    }

    pub fn save(&self, session: &PackageSession) -> Result<()> {
        session.write_part(&self.part.name, &self.to_xml())
    }

    /// The same relationships, stored as the rels file of `owner_part`.
    pub fn copy_to(&self, owner_part: &str) -> Self {
        let mut part = self.part.clone();
        part.name = rels_for_part(owner_part);
        Self { part }
    }

    pub fn rels_part(&self) -> &str {
        &self.part.name
    }

    pub fn to_xml(&self) -> Vec<u8> {
        write_xml_part(&self.part)
    }

    pub fn iter(&self) -> impl Iterator<Item = Relationship> + '_ {
        self.part.elements("Relationship").filter_map(|ev| {
            let id = ev.attr("Id")?.to_string();
            Some(Relationship {
                id,
                type_: ev.attr("Type").unwrap_or_default().to_string(),
                target: unescape_lossy(ev.attr("Target").unwrap_or_default()),
                external: ev
                    .attr("TargetMode")
                    .is_some_and(|m| m.eq_ignore_ascii_case("External")),
            })
        })
    }

    pub fn get(&self, id: &str) -> Option<Relationship> {
        self.iter().find(|r| r.id == id)
    }

    pub fn by_type<'a>(&'a self, type_: &'a str) -> impl Iterator<Item = Relationship> + 'a {
        self.iter().filter(move |r| r.type_ == type_)
    }

    /// `rId{max + 1}` over the ids already present; non-numeric ids are ignored.
    pub fn next_id(&self) -> Result<String> {
        let max = self
            .iter()
            .filter_map(|r| {
                REL_ID_RE
                    .captures(&r.id)
                    .and_then(|c| c[1].parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0);
        let next = max
            .checked_add(1)
            .ok_or_else(|| PatchError::structural(&self.part.name, format!("no relationship id after rId{max}")))?;
        Ok(format!("rId{next}"))
    }

    pub fn add(&mut self, type_: &str, target: &str) -> Result<String> {
        let id = self.next_id()?;
        self.push(&id, type_, target);
        Ok(id)
    }

    fn push(&mut self, id: &str, type_: &str, target: &str) {
        let idx = self.part.root_end_index().unwrap_or(self.part.events.len());
        self.part.events.insert(
            idx,
            XmlEvent::Empty {
                name: "Relationship".to_string(),
                attrs: vec![
                    ("Id".to_string(), escape_attr(id).into_owned()),
                    ("Type".to_string(), escape_attr(type_).into_owned()),
                    ("Target".to_string(), escape_attr(target).into_owned()),
                ],
            },
        );
    }

    /// Retargets `id` when present, otherwise adds it with exactly that id.
    pub fn upsert(&mut self, id: &str, type_: &str, target: &str) {
        if !self.retarget(id, target) {
            self.push(id, type_, target);
        }
    }

    /// Points an existing relationship at a new target. Returns false when `id` is unknown.
    pub fn retarget(&mut self, id: &str, target: &str) -> bool {
        for ev in self.part.events.iter_mut() {
            let (XmlEvent::Empty { name, attrs } | XmlEvent::Start { name, attrs }) = ev else {
                continue;
            };
            if !name.ends_with("Relationship") || !attrs.iter().any(|(k, v)| k == "Id" && v == id) {
                continue;
            }
            for (k, v) in attrs.iter_mut() {
                if k == "Target" {
                    *v = escape_attr(target).into_owned();
                    return true;
                }
            }
            attrs.push(("Target".to_string(), escape_attr(target).into_owned()));
            return true;
        }
        false
    }
}

fn unescape_lossy(raw: &str) -> String {
    quick_xml::escape::unescape(raw)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Resolves `rel_id` of `part` to the part name it targets.
pub fn resolve_relationship(session: &PackageSession, part: &str, rel_id: &str) -> Result<String> {
    let rels = Relationships::load(session, part)?
        .ok_or_else(|| PatchError::not_found("relationships", rels_for_part(part)))?;
    let rel = rels
        .get(rel_id)
        .ok_or_else(|| PatchError::not_found("relationship", format!("{part}#{rel_id}")))?;
    if rel.external {
        return Err(PatchError::not_found(
            "internal relationship target",
            format!("{part}#{rel_id} -> {}", rel.target),
        ));
    }
    Ok(resolve_target(part, &rel.target))
}

/// Adds a relationship from `owner_part` and persists it, returning the minted id.
pub fn add_relationship(
    session: &PackageSession,
    owner_part: &str,
    type_: &str,
    target: &str,
) -> Result<String> {
    let mut rels = Relationships::load_or_empty(session, owner_part)?;
    let id = rels.add(type_, target)?;
    rels.save(session)?;
    log::debug!("{owner_part}: {id} -> {target}");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::session::StagingOptions;

    const CHART_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/package" Target="../embeddings/Microsoft_Excel_Worksheet.xlsx"/><Relationship Id="rId1" Type="http://schemas.microsoft.com/office/2011/relationships/chartStyle" Target="style1.xml"/><Relationship Id="rIdLink" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/hyperlink" Target="https://example.com/?a=1&amp;b=2" TargetMode="External"/></Relationships>"#;

    #[test]
    fn resolve_target_relative_to_owning_part_dir() {
        assert_eq!(
            resolve_target("word/charts/chart1.xml", "../embeddings/Microsoft_Excel_Worksheet.xlsx"),
            "word/embeddings/Microsoft_Excel_Worksheet.xlsx"
        );
        assert_eq!(resolve_target("word/document.xml", "charts/chart2.xml"), "word/charts/chart2.xml");
        assert_eq!(resolve_target("word/document.xml", "/word/./media/a.png#x"), "word/media/a.png");
    }

    #[test]
    fn relative_target_walks_up_when_needed() {
        assert_eq!(
            relative_target("word/charts/chart3.xml", "word/embeddings/Book3.xlsx"),
            "../embeddings/Book3.xlsx"
        );
        assert_eq!(relative_target("word/document.xml", "word/charts/chart3.xml"), "charts/chart3.xml");
        assert_eq!(rels_for_part("word/charts/chart3.xml"), "word/charts/_rels/chart3.xml.rels");
    }

    #[test]
    fn next_id_skips_past_highest_numeric_id() {
        let rels = Relationships::parse("word/charts/_rels/chart1.xml.rels", CHART_RELS.as_bytes())
            .expect("parse");
        assert_eq!(rels.next_id().expect("next"), "rId4");
        let ext = rels.get("rIdLink").expect("link");
        assert!(ext.external);
        assert_eq!(ext.target, "https://example.com/?a=1&b=2");
        assert_eq!(
            rels.by_type("http://schemas.microsoft.com/office/2011/relationships/chartStyle")
                .map(|r| r.target)
                .collect::<Vec<_>>(),
            vec!["style1.xml"]
        );
    }

    #[test]
    fn exhausted_id_space_is_structural() {
        let mut rels = Relationships::parse(
            "word/_rels/document.xml.rels",
            br#"<Relationships xmlns="urn:r"><Relationship Id="rId4294967295" Type="t" Target="a.xml"/></Relationships>"#,
        )
        .expect("parse");
        assert!(matches!(rels.next_id(), Err(PatchError::Structural { .. })));
        assert!(rels.add("t", "b.xml").is_err());
        assert_eq!(rels.iter().count(), 1);
    }

    #[test]
    fn add_to_self_closing_root_and_retarget() {
        let mut rels = Relationships::parse(
            "word/_rels/document.xml.rels",
            br#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"/>"#,
        )
        .expect("parse");
        assert_eq!(rels.add("t", "charts/chart1.xml").expect("add"), "rId1");
        assert_eq!(rels.add("t", "charts/chart2.xml").expect("add"), "rId2");
        assert!(rels.retarget("rId1", "charts/chart9.xml"));
        assert!(!rels.retarget("rId7", "x"));
        rels.upsert("rId7", "t", "charts/chart7.xml");
        rels.upsert("rId2", "t", "charts/chart8.xml");
        assert_eq!(rels.get("rId7").map(|r| r.target).as_deref(), Some("charts/chart7.xml"));
        assert_eq!(rels.next_id().expect("next"), "rId8");

        let xml = String::from_utf8(rels.to_xml()).expect("utf8");
        let back = Relationships::parse("x.rels", xml.as_bytes()).expect("reparse");
        assert_eq!(back.get("rId1").map(|r| r.target), Some("charts/chart9.xml".to_string()));
        assert_eq!(back.get("rId2").map(|r| r.target), Some("charts/chart8.xml".to_string()));
    }

    #[test]
    fn session_level_add_and_resolve() {
        let session = PackageSession::create_blank(&StagingOptions::default()).expect("blank");
        let owner = "word/charts/chart1.xml";
        let first = add_relationship(&session, owner, "pkg", "../embeddings/Book1.xlsx").expect("add");
        let second = add_relationship(&session, owner, "pkg", "../embeddings/Book2.xlsx").expect("add");
        assert_eq!((first.as_str(), second.as_str()), ("rId1", "rId2"));
        assert_eq!(
            resolve_relationship(&session, owner, "rId2").expect("resolve"),
            "word/embeddings/Book2.xlsx"
        );
        let missing = resolve_relationship(&session, owner, "rId9").err().expect("error");
        assert!(missing.is_not_found());
        let no_rels = resolve_relationship(&session, "word/charts/chart5.xml", "rId1")
            .err()
            .expect("error");
        assert!(no_rels.is_not_found());
    }
}
