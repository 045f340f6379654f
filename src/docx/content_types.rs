use crate::docx::constants::CONTENT_TYPES_PART;
use crate::docx::session::PackageSession;
use crate::docx::xml::{escape_attr, parse_xml_part, write_xml_part, XmlEvent, XmlPart};
use crate::error::{PatchError, Result};

/// `[Content_Types].xml` of a package.
#[derive(Clone, Debug)]
pub struct ContentTypes {
    part: XmlPart,
}

fn part_name_key(part: &str) -> String {
    format!("/{}", part.trim_start_matches('/'))
}

impl ContentTypes {
    pub fn parse(xml: &[u8]) -> Result<Self> {
        let part = parse_xml_part(CONTENT_TYPES_PART, xml)?;
        if part.root_end_index().is_none() {
            return Err(PatchError::structural(CONTENT_TYPES_PART, "missing </Types>"));
        }
        Ok(Self { part })
    }

    pub fn load(session: &PackageSession) -> Result<Self> {
        Self::parse(&session.read_part(CONTENT_TYPES_PART)?)
    }

    pub fn save(&self, session: &PackageSession) -> Result<()> {
        session.write_part(CONTENT_TYPES_PART, &self.to_xml())
    }

    pub fn to_xml(&self) -> Vec<u8> {
        write_xml_part(&self.part)
    }

    /// Part names compare case-insensitively, as package consumers do.
    pub fn override_for(&self, part: &str) -> Option<String> {
        let key = part_name_key(part);
        self.part
            .elements("Override")
            .find(|ev| ev.attr("PartName").is_some_and(|p| p.eq_ignore_ascii_case(&key)))
            .and_then(|ev| ev.attr("ContentType"))
            .map(str::to_string)
    }

    pub fn default_for(&self, extension: &str) -> Option<String> {
        self.part
            .elements("Default")
            .find(|ev| {
                ev.attr("Extension")
                    .is_some_and(|e| e.eq_ignore_ascii_case(extension))
            })
            .and_then(|ev| ev.attr("ContentType"))
            .map(str::to_string)
    }

    /// Returns false when an override for `part` already exists.
    pub fn add_override(&mut self, part: &str, content_type: &str) -> bool {
        if self.override_for(part).is_some() {
            return false;
        }
        self.push(
            "Override",
            vec![
                ("PartName".to_string(), escape_attr(&part_name_key(part)).into_owned()),
                ("ContentType".to_string(), escape_attr(content_type).into_owned()),
            ],
        );
        true
    }

    pub fn add_default(&mut self, extension: &str, content_type: &str) -> bool {
        if self.default_for(extension).is_some() {
            return false;
        }
        self.push(
            "Default",
            vec![
                ("Extension".to_string(), escape_attr(extension).into_owned()),
                ("ContentType".to_string(), escape_attr(content_type).into_owned()),
            ],
        );
        true
    }

    fn push(&mut self, local: &str, attrs: Vec<(String, String)>) {
        // Keep the prefix of the root element, if the producer used one.
        let name = match self.part.events.iter().find_map(XmlEvent::element_name) {
            Some(root) => match root.split_once(':') {
                Some((prefix, _)) => format!("{prefix}:{local}"),
                None => local.to_string(),
            },
            None => local.to_string(),
        };
        let idx = self.part.root_end_index().unwrap_or(self.part.events.len());
        self.part.events.insert(idx, XmlEvent::Empty { name, attrs });
    }
}

/// Registers an override for `part` unless one exists. Returns whether the manifest changed.
pub fn add_override(session: &PackageSession, part: &str, content_type: &str) -> Result<bool> {
    let mut types = ContentTypes::load(session)?;
    if !types.add_override(part, content_type) {
        return Ok(false);
    }
    types.save(session)?;
    Ok(true)
}

pub fn add_default(session: &PackageSession, extension: &str, content_type: &str) -> Result<bool> {
    let mut types = ContentTypes::load(session)?;
    if !types.add_default(extension, content_type) {
        return Ok(false);
    }
    types.save(session)?;
    Ok(true)
}

pub fn override_for(session: &PackageSession, part: &str) -> Result<Option<String>> {
    Ok(ContentTypes::load(session)?.override_for(part))
}
