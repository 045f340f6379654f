//! Lexical scanner over serialized XML.
//!
//! Edits to chart parts, worksheets and the document body are made by locating a small set of
//! markers (element open/close tags and their attributes) in the flat character stream and
//! splicing text between them. Everything outside the edited spans is preserved byte-for-byte.
//! The scanner only understands tags: comments, processing instructions, CDATA sections and
//! doctype declarations are skipped, text content is opaque.

use std::ops::Range;

use crate::error::{PatchError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagKind {
    Start,
    End,
    Empty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag<'a> {
    pub kind: TagKind,
    pub name: &'a str,
    /// Byte offset of `<`.
    pub start: usize,
    /// Byte offset just past `>`.
    pub end: usize,
}

impl<'a> Tag<'a> {
    pub fn text(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

/// Iterator over the tags of `src[range]`, in document order.
pub struct TagScanner<'a> {
    src: &'a str,
    pos: usize,
    limit: usize,
}

impl<'a> TagScanner<'a> {
    pub fn new(src: &'a str) -> Self {
        Self::over(src, 0..src.len())
    }

    pub fn over(src: &'a str, range: Range<usize>) -> Self {
        Self {
            src,
            pos: range.start,
            limit: range.end.min(src.len()),
        }
    }
}

impl<'a> Iterator for TagScanner<'a> {
    type Item = Tag<'a>;

    fn next(&mut self) -> Option<Tag<'a>> {
        let bytes = self.src.as_bytes();
        loop {
            let rel = self.src[self.pos..self.limit].find('<')?;
            let start = self.pos + rel;
            let rest = &self.src[start..self.limit];

            if rest.starts_with("<!") || rest.starts_with("<?") {
                let skip_to = if rest.starts_with("<!--") {
                    rest.find("-->").map(|i| start + i + 3)
                } else if rest.starts_with("<![CDATA[") {
                    rest.find("]]>").map(|i| start + i + 3)
                } else if rest.starts_with("<?") {
                    rest.find("?>").map(|i| start + i + 2)
                } else {
                    rest.find('>').map(|i| start + i + 1)
                };
                self.pos = skip_to.unwrap_or(self.limit);
                continue;
            }

            let end = tag_end(bytes, start, self.limit)?;
            self.pos = end;

            let (kind, name_start) = if bytes.get(start + 1) == Some(&b'/') {
                (TagKind::End, start + 2)
            } else if end >= 2 && bytes[end - 2] == b'/' {
                (TagKind::Empty, start + 1)
            } else {
                (TagKind::Start, start + 1)
            };
            let name_end = self.src[name_start..end]
                .find(|c: char| c.is_ascii_whitespace() || c == '>' || c == '/')
                .map(|i| name_start + i)
                .unwrap_or(end);
            return Some(Tag {
                kind,
                name: &self.src[name_start..name_end],
                start,
                end,
            });
        }
    }
}

/// End offset (past `>`) of the tag opening at `start`, honouring quoted attribute values.
fn tag_end(bytes: &[u8], start: usize, limit: usize) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut i = start + 1;
    while i < limit {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if b == b'>' => return Some(i + 1),
            None => {}
        }
        i += 1;
    }
    None
}

/// One element located in the source: the open tag and, unless self-closing, the close tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Element {
    /// Offset of the opening `<`.
    pub start: usize,
    /// Offset just past the open tag.
    pub open_end: usize,
    /// Offset of the closing tag's `<` (equals `open_end` for self-closing elements).
    pub close_start: usize,
    /// Offset just past the element.
    pub end: usize,
}

impl Element {
    pub fn is_empty(&self) -> bool {
        self.open_end == self.end
    }

    pub fn span(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn inner(&self) -> Range<usize> {
        self.open_end..self.close_start
    }

    pub fn open_tag<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.open_end]
    }

    pub fn inner_text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.open_end..self.close_start]
    }

    pub fn outer<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

/// All outermost elements named `name` within `range`, in document order.
pub fn find_elements(src: &str, range: Range<usize>, name: &str) -> Vec<Element> {
    let mut found = Vec::new();
    let mut open: Option<(usize, usize)> = None;
    let mut depth = 0usize;
    for tag in TagScanner::over(src, range) {
        if tag.name != name {
            continue;
        }
        match tag.kind {
            TagKind::Empty if open.is_none() => found.push(Element {
                start: tag.start,
                open_end: tag.end,
                close_start: tag.end,
                end: tag.end,
            }),
            TagKind::Empty => {}
            TagKind::Start => {
                if open.is_none() {
                    open = Some((tag.start, tag.end));
                }
                depth += 1;
            }
            TagKind::End => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some((start, open_end)) = open.take() {
                        found.push(Element {
                            start,
                            open_end,
                            close_start: tag.start,
                            end: tag.end,
                        });
                    }
                }
            }
        }
    }
    found
}

pub fn find_first(src: &str, range: Range<usize>, name: &str) -> Option<Element> {
    find_elements(src, range, name).into_iter().next()
}

/// Direct children of `parent` as `(name, element)` pairs.
pub fn children<'a>(src: &'a str, parent: &Element) -> Vec<(&'a str, Element)> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut open: Option<(&'a str, usize, usize)> = None;
    for tag in TagScanner::over(src, parent.inner()) {
        match tag.kind {
            TagKind::Empty => {
                if depth == 0 {
                    out.push((
                        tag.name,
                        Element {
                            start: tag.start,
                            open_end: tag.end,
                            close_start: tag.end,
                            end: tag.end,
                        },
                    ));
                }
            }
            TagKind::Start => {
                if depth == 0 {
                    open = Some((tag.name, tag.start, tag.end));
                }
                depth += 1;
            }
            TagKind::End => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some((name, start, open_end)) = open.take() {
                        out.push((
                            name,
                            Element {
                                start,
                                open_end,
                                close_start: tag.start,
                                end: tag.end,
                            },
                        ));
                    }
                }
            }
        }
    }
    out
}

pub fn find_child(src: &str, parent: &Element, name: &str) -> Option<Element> {
    children(src, parent)
        .into_iter()
        .find(|(n, _)| *n == name)
        .map(|(_, el)| el)
}

/// The document element of `src`.
pub fn root_element(src: &str) -> Option<(&str, Element)> {
    let first = TagScanner::new(src).find(|t| t.kind != TagKind::End)?;
    let el = find_first(src, first.start..src.len(), first.name)?;
    Some((first.name, el))
}

/// Raw (escaped) value of `attr` inside an open tag.
pub fn attr_value<'a>(open_tag: &'a str, attr: &str) -> Option<&'a str> {
    attr_value_range(open_tag, attr).map(|r| &open_tag[r])
}

fn attr_value_range(open_tag: &str, attr: &str) -> Option<Range<usize>> {
    let bytes = open_tag.as_bytes();
    let mut search = 0usize;
    while let Some(rel) = open_tag[search..].find(attr) {
        let at = search + rel;
        search = at + attr.len();
        let boundary_ok = at > 0 && bytes[at - 1].is_ascii_whitespace();
        if !boundary_ok {
            continue;
        }
        let mut i = at + attr.len();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if bytes.get(i) != Some(&b'=') {
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let quote = match bytes.get(i) {
            Some(&q) if q == b'"' || q == b'\'' => q,
            _ => continue,
        };
        let value_start = i + 1;
        let value_end = value_start + open_tag[value_start..].find(quote as char)?;
        return Some(value_start..value_end);
    }
    None
}

/// Returns `open_tag` with `attr` set to `value` (already escaped), appending the attribute
/// when it is missing.
pub fn with_attr(open_tag: &str, attr: &str, value: &str) -> String {
    if let Some(r) = attr_value_range(open_tag, attr) {
        let mut out = String::with_capacity(open_tag.len() + value.len());
        out.push_str(&open_tag[..r.start]);
        out.push_str(value);
        out.push_str(&open_tag[r.end..]);
        return out;
    }
    let insert_at = if open_tag.ends_with("/>") {
        open_tag.len() - 2
    } else {
        open_tag.len() - 1
    };
    format!(
        "{} {attr}=\"{value}\"{}",
        open_tag[..insert_at].trim_end(),
        &open_tag[insert_at..]
    )
}

/// Namespace prefix of a qualified name (`"c:ser"` -> `"c:"`, `"worksheet"` -> `""`).
pub fn prefix_of(qualified: &str) -> &str {
    qualified
        .find(':')
        .map(|i| &qualified[..=i])
        .unwrap_or("")
}

/// One replacement of a byte range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    pub range: Range<usize>,
    pub text: String,
}

impl Edit {
    pub fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
        Self {
            range,
            text: text.into(),
        }
    }

    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::replace(at..at, text)
    }
}

/// Applies non-overlapping edits to `src`. Inserts at the same offset keep their given order.
pub fn apply_edits(part: &str, src: &str, mut edits: Vec<Edit>) -> Result<String> {
    edits.sort_by_key(|e| (e.range.start, e.range.end));
    let mut out = String::with_capacity(src.len() + edits.iter().map(|e| e.text.len()).sum::<usize>());
    let mut cursor = 0usize;
    for edit in edits {
        if edit.range.start < cursor || edit.range.end > src.len() {
            return Err(PatchError::structural(
                part,
                format!("overlapping edit at byte {}", edit.range.start),
            ));
        }
        out.push_str(&src[cursor..edit.range.start]);
        out.push_str(&edit.text);
        cursor = edit.range.end;
    }
    out.push_str(&src[cursor..]);
    Ok(out)
}
