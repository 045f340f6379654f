use std::collections::HashMap;

use crate::docx::scan::{apply_edits, attr_value, children, find_elements, root_element, with_attr, Edit};
use crate::docx::xml::{escape_text, unescape};
use crate::error::{PatchError, Result};

/// Shared-string table of a workbook (`xl/sharedStrings.xml`).
///
/// Existing entries keep their position and markup; new strings are appended.
#[derive(Clone, Debug)]
pub struct SharedStrings {
    part: String,
    source: String,
    strings: Vec<String>,
    index: HashMap<String, usize>,
    appended: Vec<String>,
    count: usize,
}

impl SharedStrings {
    pub fn parse(part: &str, xml: &str) -> Result<Self> {
        let (root, el) = root_element(xml)
            .ok_or_else(|| PatchError::structural(part, "missing shared string table"))?;
        if !root.ends_with("sst") {
            return Err(PatchError::structural(part, format!("unexpected root <{root}>")));
        }
        let prefix = &root[..root.len() - 3];
        let si_name = format!("{prefix}si");
        let t_name = format!("{prefix}t");
        let r_name = format!("{prefix}r");

        let mut strings = Vec::new();
        for si in find_elements(xml, el.inner(), &si_name) {
            let mut text = String::new();
            for (name, child) in children(xml, &si) {
                if name == t_name {
                    text.push_str(&unescape(part, child.inner_text(xml))?);
                } else if name == r_name {
                    for t in find_elements(xml, child.inner(), &t_name) {
                        text.push_str(&unescape(part, t.inner_text(xml))?);
                    }
                }
            }
            strings.push(text);
        }

        let mut index = HashMap::new();
        for (i, s) in strings.iter().enumerate() {
            index.entry(s.clone()).or_insert(i);
        }
        let count = attr_value(el.open_tag(xml), "count")
            .and_then(|v| v.parse().ok())
            .unwrap_or(strings.len());
        Ok(Self {
            part: part.to_string(),
            source: xml.to_string(),
            strings,
            index,
            appended: Vec::new(),
            count,
        })
    }

    /// Index of `s`, appending it when the table does not hold it yet.
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.strings.len();
        self.strings.push(s.to_string());
        self.appended.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }

    pub fn unique_count(&self) -> usize {
        self.strings.len()
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn to_xml(&self) -> Result<String> {
        let (root, el) = root_element(&self.source)
            .ok_or_else(|| PatchError::structural(&self.part, "missing shared string table"))?;
        let prefix = &root[..root.len() - 3];

        let unique = self.unique_count().to_string();
        let count = self.count.max(self.unique_count()).to_string();
        let mut open = with_attr(el.open_tag(&self.source), "uniqueCount", &unique);
        open = with_attr(&open, "count", &count);

        let mut added = String::new();
        for s in &self.appended {
            let space = if s.trim() != s { r#" xml:space="preserve""# } else { "" };
            added.push_str(&format!(
                "<{prefix}si><{prefix}t{space}>{}</{prefix}t></{prefix}si>",
                escape_text(s)
            ));
        }

        let mut edits = Vec::new();
        if el.is_empty() {
            let open = format!("{}>", open.trim_end_matches("/>").trim_end());
            edits.push(Edit::replace(el.span(), format!("{open}{added}</{root}>")));
        } else {
            edits.push(Edit::replace(el.start..el.open_end, open));
            if !added.is_empty() {
                edits.push(Edit::insert(el.close_start, added));
            }
        }
        apply_edits(&self.part, &self.source, edits)
    }
}
