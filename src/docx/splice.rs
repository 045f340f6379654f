//! Anchor-relative insertion into the serialized document body.
//!
//! Positions are resolved against the literal markup of `word/document.xml`: the `<w:body>`
//! delimiters, paragraph delimiters and a case-sensitive first-occurrence search for anchor
//! text. The search does not know about XML structure, so anchor text that is split across runs
//! will not be found and text that happens to occur inside an attribute value will match.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::docx::constants::{DOCUMENT_PART, NS_CHART, NS_DRAWING, NS_RELATIONSHIPS, NS_WP};
use crate::docx::scan::{attr_value, children, find_first, TagScanner};
use crate::docx::session::PackageSession;
use crate::docx::xml::escape_attr;
use crate::error::{PatchError, Result};

const PARAGRAPH_CLOSE: &str = "</w:p>";
const PARAGRAPH_OPEN: &str = "<w:p";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "at", content = "anchor")]
pub enum InsertPosition {
    DocumentStart,
    DocumentEnd,
    AfterAnchor(String),
    BeforeAnchor(String),
}

impl fmt::Display for InsertPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertPosition::DocumentStart => f.write_str("document start"),
            InsertPosition::DocumentEnd => f.write_str("document end"),
            InsertPosition::AfterAnchor(a) => write!(f, "after {a:?}"),
            InsertPosition::BeforeAnchor(a) => write!(f, "before {a:?}"),
        }
    }
}

/// Byte range strictly inside `<w:body>` ... `</w:body>`, plus the offset for document-end
/// inserts (before a trailing body-level `<w:sectPr>`, which has to stay last).
struct BodyBounds {
    inner_start: usize,
    inner_end: usize,
    end_insert: usize,
}

fn body_bounds(markup: &str) -> Result<BodyBounds> {
    let body = find_first(markup, 0..markup.len(), "w:body")
        .ok_or_else(|| PatchError::structural(DOCUMENT_PART, "missing <w:body> element"))?;
    if body.is_empty() {
        return Err(PatchError::structural(DOCUMENT_PART, "<w:body/> has no closing delimiter"));
    }
    let end_insert = match children(markup, &body).last() {
        Some((name, sect)) if *name == "w:sectPr" => sect.start,
        _ => body.close_start,
    };
    Ok(BodyBounds {
        inner_start: body.open_end,
        inner_end: body.close_start,
        end_insert,
    })
}

/// Offset of the first `<w:p>` / `<w:p ...>` opening tag at or before `before`, not counting
/// look-alikes such as `<w:pPr>`.
fn paragraph_open_before(markup: &str, floor: usize, before: usize) -> Option<usize> {
    let mut hay_end = before;
    while let Some(at) = markup[floor..hay_end].rfind(PARAGRAPH_OPEN) {
        let at = floor + at;
        match markup.as_bytes().get(at + PARAGRAPH_OPEN.len()) {
            Some(b'>') | Some(b'/') => return Some(at),
            Some(b) if b.is_ascii_whitespace() => return Some(at),
            _ => hay_end = at,
        }
    }
    None
}

/// Computes the insertion offset for `position` without modifying anything.
pub fn resolve_offset(markup: &str, position: &InsertPosition) -> Result<usize> {
    let bounds = body_bounds(markup)?;
    let inner = bounds.inner_start..bounds.inner_end;
    match position {
        InsertPosition::DocumentStart => Ok(bounds.inner_start),
        InsertPosition::DocumentEnd => Ok(bounds.end_insert),
        InsertPosition::AfterAnchor(anchor) | InsertPosition::BeforeAnchor(anchor) => {
            if anchor.is_empty() {
                return Err(PatchError::Validation("anchor text must not be empty".into()));
            }
            let hit = markup[inner.clone()]
                .find(anchor.as_str())
                .map(|i| inner.start + i)
                .ok_or_else(|| PatchError::AnchorNotFound(anchor.clone()))?;
            if matches!(position, InsertPosition::AfterAnchor(_)) {
                markup[hit..inner.end]
                    .find(PARAGRAPH_CLOSE)
                    .map(|i| hit + i + PARAGRAPH_CLOSE.len())
                    .ok_or_else(|| {
                        PatchError::structural(
                            DOCUMENT_PART,
                            format!("no paragraph end after anchor {anchor:?}"),
                        )
                    })
            } else {
                paragraph_open_before(markup, inner.start, hit).ok_or_else(|| {
                    PatchError::structural(
                        DOCUMENT_PART,
                        format!("no paragraph start before anchor {anchor:?}"),
                    )
                })
            }
        }
    }
}

/// Returns `markup` with `fragment` spliced in at `position`. The input is left untouched on
/// every error.
pub fn insert_at(markup: &str, fragment: &str, position: &InsertPosition) -> Result<String> {
    let offset = resolve_offset(markup, position)?;
    let mut out = String::with_capacity(markup.len() + fragment.len());
    out.push_str(&markup[..offset]);
    out.push_str(fragment);
    out.push_str(&markup[offset..]);
    Ok(out)
}

/// Applies [`insert_at`] to the package's main document part.
pub fn insert_into_document(
    session: &PackageSession,
    fragment: &str,
    position: &InsertPosition,
) -> Result<()> {
    let markup = session.read_part_string(DOCUMENT_PART)?;
    let updated = insert_at(&markup, fragment, position)?;
    session.write_part(DOCUMENT_PART, updated.as_bytes())?;
    log::debug!("inserted {} bytes at {position}", fragment.len());
    Ok(())
}

pub fn page_break_paragraph() -> &'static str {
    r#"<w:p><w:r><w:br w:type="page"/></w:r></w:p>"#
}

pub fn insert_page_break(session: &PackageSession, position: &InsertPosition) -> Result<()> {
    insert_into_document(session, page_break_paragraph(), position)
}

/// Next free `wp:docPr` id in the document (drawing ids must be unique per document).
pub fn next_doc_pr_id(markup: &str) -> Result<u32> {
    let max = TagScanner::new(markup)
        .filter(|t| t.name == "wp:docPr")
        .filter_map(|t| attr_value(t.text(markup), "id")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    max.checked_add(1)
        .ok_or_else(|| PatchError::structural(DOCUMENT_PART, format!("no drawing id after {max}")))
}

/// Inline chart drawing placed in its own paragraph.
#[derive(Clone, Debug)]
pub struct ChartDrawing<'a> {
    pub rel_id: &'a str,
    pub doc_pr_id: u32,
    pub name: &'a str,
    pub width_emu: u64,
    pub height_emu: u64,
}

impl ChartDrawing<'_> {
    /// Namespaces are declared on the elements that use them, so the fragment is valid whatever
    /// the host document declares on its root.
    pub fn to_paragraph(&self) -> String {
        format!(
            concat!(
                r#"<w:p><w:r><w:drawing>"#,
                r#"<wp:inline xmlns:wp="{wp}" distT="0" distB="0" distL="0" distR="0">"#,
                r#"<wp:extent cx="{cx}" cy="{cy}"/>"#,
                r#"<wp:effectExtent l="0" t="0" r="0" b="0"/>"#,
                r#"<wp:docPr id="{id}" name="{name}"/>"#,
                r#"<wp:cNvGraphicFramePr/>"#,
                r#"<a:graphic xmlns:a="{a}"><a:graphicData uri="{c}">"#,
                r#"<c:chart xmlns:c="{c}" xmlns:r="{r}" r:id="{rid}"/>"#,
                r#"</a:graphicData></a:graphic></wp:inline></w:drawing></w:r></w:p>"#
            ),
            wp = NS_WP,
            a = NS_DRAWING,
            c = NS_CHART,
            r = NS_RELATIONSHIPS,
            cx = self.width_emu,
            cy = self.height_emu,
            id = self.doc_pr_id,
            name = escape_attr(self.name),
            rid = escape_attr(self.rel_id),
        )
    }
}
