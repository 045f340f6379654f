use std::borrow::Cow;
use std::fmt::Write as _;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{PatchError, Result};

/// Flat event stream of a small package part (relationships, content types, workbook manifest).
///
/// Large body parts are never loaded through this; they go through the lexical scanner in
/// [`crate::docx::scan`] so untouched bytes stay untouched.
#[derive(Clone, Debug, PartialEq)]
pub enum XmlEvent {
    Decl {
        version: String,
        encoding: Option<String>,
        standalone: Option<String>,
    },
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Text {
        text: String,
    },
    /// Comments, CDATA, processing instructions and doctypes, kept as written.
    Raw {
        markup: String,
    },
}

impl XmlEvent {
    pub fn element_name(&self) -> Option<&str> {
        match self {
            XmlEvent::Start { name, .. } | XmlEvent::Empty { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }

    /// Raw (still escaped) attribute value of a start or empty element.
    pub fn attr(&self, key: &str) -> Option<&str> {
        match self {
            XmlEvent::Start { attrs, .. } | XmlEvent::Empty { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct XmlPart {
    pub name: String,
    pub events: Vec<XmlEvent>,
}

impl XmlPart {
    /// Index of the closing event of the document element.
    pub fn root_end_index(&self) -> Option<usize> {
        self.events
            .iter()
            .rposition(|ev| matches!(ev, XmlEvent::End { .. }))
    }

    /// Elements with the given name, in document order, ignoring the prefix when `name` has none.
    pub fn elements<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlEvent> + 'a {
        self.events
            .iter()
            .filter(move |ev| ev.element_name().is_some_and(|n| name_matches(n, name)))
    }
}

pub fn name_matches(qualified: &str, wanted: &str) -> bool {
    if qualified == wanted {
        return true;
    }
    !wanted.contains(':') && local_name(qualified) == wanted
}

pub fn local_name(qualified: &str) -> &str {
    qualified
        .rsplit_once(':')
        .map(|(_, local)| local)
        .unwrap_or(qualified)
}

pub fn parse_xml_part(name: &str, xml_bytes: &[u8]) -> Result<XmlPart> {
    let xml_err = |source: quick_xml::Error| PatchError::Xml {
        part: name.to_string(),
        source,
    };

    let mut reader = Reader::from_reader(xml_bytes);
    reader.config_mut().trim_text(false);

    let mut events: Vec<XmlEvent> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let ev = reader.read_event_into(&mut buf).map_err(xml_err)?;
        match ev {
            Event::Eof => break,
            Event::Decl(d) => {
                let version = bytes_to_string(d.version().map_err(|e| xml_err(e.into()))?);
                let encoding = d
                    .encoding()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                let standalone = d
                    .standalone()
                    .map(|r| r.map(bytes_to_string))
                    .transpose()
                    .unwrap_or(None);
                events.push(XmlEvent::Decl {
                    version,
                    encoding,
                    standalone,
                });
            }
            Event::Start(s) => {
                events.push(XmlEvent::Start {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(name, &s)?,
                });
            }
            Event::End(e) => {
                events.push(XmlEvent::End {
                    name: bytes_to_string(e.name().as_ref()),
                });
            }
            Event::Empty(s) => {
                events.push(XmlEvent::Empty {
                    name: bytes_to_string(s.name().as_ref()),
                    attrs: collect_attrs(name, &s)?,
                });
            }
            Event::Text(t) => {
                let txt = t.unescape().map_err(|e| xml_err(e.into()))?.into_owned();
                events.push(XmlEvent::Text { text: txt });
            }
            Event::CData(t) => {
                events.push(raw(format!("<![CDATA[{}]]>", bytes_to_string(t.into_inner()))));
            }
            Event::Comment(t) => {
                events.push(raw(format!("<!--{}-->", bytes_to_string(t.into_inner()))));
            }
            Event::PI(t) => events.push(raw(format!("<?{}?>", bytes_to_string(&*t)))),
            Event::DocType(t) => {
                events.push(raw(format!("<!DOCTYPE {}>", bytes_to_string(t.into_inner()))));
            }
        }
    }

    Ok(XmlPart {
        name: name.to_string(),
        events,
    })
}

fn collect_attrs(part: &str, s: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut attrs: Vec<(String, String)> = Vec::new();
    for a in s.attributes() {
        let a = a.map_err(|e| PatchError::Xml {
            part: part.to_string(),
            source: e.into(),
        })?;
        let key = bytes_to_string(a.key.as_ref());
        // Values stay raw (escaped); writing them back must not escape twice.
        let val = bytes_to_string(a.value.as_ref());
        attrs.push((key, val));
    }
    Ok(attrs)
}

fn bytes_to_string(bytes: impl AsRef<[u8]>) -> String {
    String::from_utf8_lossy(bytes.as_ref()).into_owned()
}

fn raw(markup: String) -> XmlEvent {
    XmlEvent::Raw { markup }
}

fn push_tag(out: &mut String, name: &str, attrs: &[(String, String)], empty: bool) {
    out.push('<');
    out.push_str(name);
    for (k, v) in attrs {
        // attribute values are stored escaped
        let _ = write!(out, r#" {k}="{v}""#);
    }
    out.push_str(if empty { "/>" } else { ">" });
}

/// Serializes the event stream back to bytes. Attribute values go out as they came in.
pub fn write_xml_part(part: &XmlPart) -> Vec<u8> {
    let mut out = String::new();
    for ev in &part.events {
        match ev {
            XmlEvent::Decl {
                version,
                encoding,
                standalone,
            } => {
                let _ = write!(out, r#"<?xml version="{version}""#);
                if let Some(enc) = encoding {
                    let _ = write!(out, r#" encoding="{enc}""#);
                }
                if let Some(sa) = standalone {
                    let _ = write!(out, r#" standalone="{sa}""#);
                }
                out.push_str("?>");
            }
            XmlEvent::Start { name, attrs } => push_tag(&mut out, name, attrs, false),
            XmlEvent::Empty { name, attrs } => push_tag(&mut out, name, attrs, true),
            XmlEvent::End { name } => {
                let _ = write!(out, "</{name}>");
            }
            XmlEvent::Text { text } => out.push_str(&escape_text(text)),
            XmlEvent::Raw { markup } => out.push_str(markup),
        }
    }
    out.into_bytes()
}

pub fn escape_text(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    Cow::Owned(out)
}

pub fn escape_attr(value: &str) -> Cow<'_, str> {
    if !value.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(value);
    }
    let mut out = String::with_capacity(value.len() + 8);
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    Cow::Owned(out)
}

pub fn unescape(part: &str, raw: &str) -> Result<String> {
    quick_xml::escape::unescape(raw)
        .map(Cow::into_owned)
        .map_err(|e| PatchError::Xml {
            part: part.to_string(),
            source: e.into(),
        })
}

#[cfg(test)]
mod tests {
    use super::{escape_text, parse_xml_part, unescape, write_xml_part, XmlEvent};

    #[test]
    fn write_preserves_attr_entity_refs() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?><root xmlns:o="urn:test" o:gfxdata="A&#xD;&#xA;B"/>"#;
        let part = parse_xml_part("test.xml", xml).expect("parse xml");
        let out = write_xml_part(&part);
        let s = String::from_utf8(out).expect("utf8");

        assert!(s.contains(r#"o:gfxdata="A&#xD;&#xA;B""#));
        assert!(!s.contains(r#"o:gfxdata="A&amp;#xD;"#));
    }

    #[test]
    fn comments_and_cdata_pass_through() {
        let xml = br#"<Types><!-- keep --><![CDATA[a<b]]></Types>"#;
        let part = parse_xml_part("t.xml", xml).expect("parse xml");
        assert_eq!(write_xml_part(&part), xml.to_vec());
    }

    #[test]
    fn elements_match_by_local_name() {
        let xml = br#"<x:Types xmlns:x="urn:t"><x:Override PartName="/a"/><Default Extension="xml"/></x:Types>"#;
        let part = parse_xml_part("t.xml", xml).expect("parse xml");
        assert_eq!(part.elements("Override").count(), 1);
        assert_eq!(part.elements("Default").count(), 1);
        assert_eq!(
            part.elements("Override").next().and_then(|e| e.attr("PartName")),
            Some("/a")
        );
        assert!(matches!(
            part.events[part.root_end_index().expect("root end")],
            XmlEvent::End { ref name } if name == "x:Types"
        ));
    }

    #[test]
    fn text_escaping_round_trips() {
        let raw = escape_text("R&D <Q1>");
        assert_eq!(raw, "R&amp;D &lt;Q1&gt;");
        assert_eq!(unescape("t", &raw).expect("unescape"), "R&D <Q1>");
    }
}
