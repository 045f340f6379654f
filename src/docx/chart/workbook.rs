//! The worksheet grid of an embedded chart workbook.
//!
//! Layout written for `N` categories and `M` series: `B1..` hold the series names, `A2..A{N+1}`
//! the categories, and the values fill the grid below the names. `A1` stays empty.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::docx::chart::shared_strings::SharedStrings;
use crate::docx::chart::{column_name, format_number, ChartData};
use crate::docx::constants::{
    CT_RELS, CT_SHARED_STRINGS, CT_STYLES, CT_WORKBOOK, CT_WORKSHEET, CT_XML, NS_RELATIONSHIPS,
    NS_SPREADSHEET, REL_OFFICE_DOCUMENT, REL_SHARED_STRINGS, REL_STYLES, REL_WORKSHEET,
};
use crate::docx::package::{ZipEntry, ZipPackage};
use crate::docx::rels::{rels_for_part, resolve_target, Relationships};
use crate::docx::scan::{
    apply_edits, attr_value, find_child, find_elements, find_first, prefix_of, root_element,
    with_attr, Edit,
};
use crate::docx::xml::{escape_attr, escape_text, unescape};
use crate::error::{PatchError, Result};

const DEFAULT_WORKBOOK_PART: &str = "xl/workbook.xml";
const DEFAULT_SHEET_PART: &str = "xl/worksheets/sheet1.xml";
const DEFAULT_SHARED_STRINGS_PART: &str = "xl/sharedStrings.xml";

/// What a workbook rewrite touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkbookEdit {
    pub sheet_name: String,
    pub sheet_part: String,
    pub dimension: String,
    pub shared_strings: bool,
}

struct Layout {
    sheet_name: String,
    sheet_part: String,
    shared_strings_part: Option<String>,
}

fn entry_text(label: &str, pkg: &ZipPackage, name: &str) -> Result<String> {
    let entry = pkg
        .entry(name)
        .ok_or_else(|| PatchError::structural(label, format!("workbook has no {name}")))?;
    String::from_utf8(entry.data.clone())
        .map_err(|_| PatchError::structural(label, format!("{name} is not UTF-8")))
}

fn entry_rels(pkg: &ZipPackage, owner: &str) -> Result<Option<Relationships>> {
    let rels_part = rels_for_part(owner);
    match pkg.entry(&rels_part) {
        Some(entry) => Relationships::parse(&rels_part, &entry.data).map(Some),
        None => Ok(None),
    }
}

/// Workbook manifest, first sheet and shared-string table of a workbook package.
fn locate(label: &str, pkg: &ZipPackage) -> Result<Layout> {
    let workbook_part = entry_rels(pkg, "")?
        .and_then(|rels| rels.by_type(REL_OFFICE_DOCUMENT).next())
        .map(|rel| resolve_target("", &rel.target))
        .unwrap_or_else(|| DEFAULT_WORKBOOK_PART.to_string());
    let manifest = entry_text(label, pkg, &workbook_part)?;
    let (root, root_el) = root_element(&manifest)
        .ok_or_else(|| PatchError::structural(label, "empty workbook manifest"))?;
    let sheet = find_first(&manifest, root_el.inner(), &format!("{}sheet", prefix_of(root)))
        .ok_or_else(|| PatchError::structural(label, "workbook declares no sheet"))?;
    let sheet_tag = sheet.open_tag(&manifest);
    let sheet_name = unescape(label, attr_value(sheet_tag, "name").unwrap_or("Sheet1"))?;

    let rels = entry_rels(pkg, &workbook_part)?;
    let sheet_part = attr_value(sheet_tag, "r:id")
        .and_then(|id| rels.as_ref()?.get(id))
        .map(|rel| resolve_target(&workbook_part, &rel.target))
        .filter(|part| pkg.contains(part))
        .unwrap_or_else(|| DEFAULT_SHEET_PART.to_string());
    let shared_strings_part = rels
        .as_ref()
        .and_then(|rels| rels.by_type(REL_SHARED_STRINGS).next())
        .map(|rel| resolve_target(&workbook_part, &rel.target))
        .or_else(|| Some(DEFAULT_SHARED_STRINGS_PART.to_string()))
        .filter(|part| pkg.contains(part));

    Ok(Layout {
        sheet_name,
        sheet_part,
        shared_strings_part,
    })
}

fn string_cell(p: &str, cell_ref: &str, text: &str, sst: Option<&mut SharedStrings>) -> String {
    match sst {
        Some(sst) => format!(r#"<{p}c r="{cell_ref}" t="s"><{p}v>{}</{p}v></{p}c>"#, sst.intern(text)),
        None => {
            let space = if text.trim() != text { r#" xml:space="preserve""# } else { "" };
            format!(
                r#"<{p}c r="{cell_ref}" t="inlineStr"><{p}is><{p}t{space}>{}</{p}t></{p}is></{p}c>"#,
                escape_text(text)
            )
        }
    }
}

/// Replaces the grid of a worksheet and recomputes its dimension.
fn rewrite_sheet(
    part: &str,
    xml: &str,
    data: &ChartData,
    mut sst: Option<&mut SharedStrings>,
) -> Result<(String, String)> {
    let (root, root_el) =
        root_element(xml).ok_or_else(|| PatchError::structural(part, "empty worksheet"))?;
    let p = prefix_of(root);
    let sheet_data = find_first(xml, root_el.inner(), &format!("{p}sheetData"))
        .ok_or_else(|| PatchError::structural(part, "missing sheetData"))?;
    let dimension = find_first(xml, root_el.inner(), &format!("{p}dimension"))
        .ok_or_else(|| PatchError::structural(part, "missing dimension"))?;

    let cols = data.series.len() + 1;
    let spans = format!("1:{cols}");
    let mut rows = String::new();

    let _ = write!(rows, r#"<{p}row r="1" spans="{spans}">"#);
    for (i, s) in data.series.iter().enumerate() {
        let cell_ref = format!("{}1", column_name(i + 1));
        rows.push_str(&string_cell(p, &cell_ref, &s.name, sst.as_deref_mut()));
    }
    let _ = write!(rows, "</{p}row>");

    for (r, category) in data.categories.iter().enumerate() {
        let row = r + 2;
        let _ = write!(rows, r#"<{p}row r="{row}" spans="{spans}">"#);
        rows.push_str(&string_cell(p, &format!("A{row}"), category, sst.as_deref_mut()));
        for (i, s) in data.series.iter().enumerate() {
            let _ = write!(
                rows,
                r#"<{p}c r="{}{row}"><{p}v>{}</{p}v></{p}c>"#,
                column_name(i + 1),
                format_number(s.values[r])
            );
        }
        let _ = write!(rows, "</{p}row>");
    }

    let extent = format!("A1:{}{}", column_name(cols - 1), data.categories.len() + 1);
    let edits = vec![
        Edit::replace(
            dimension.start..dimension.open_end,
            with_attr(dimension.open_tag(xml), "ref", &extent),
        ),
        if sheet_data.is_empty() {
            Edit::replace(
                sheet_data.span(),
                format!("<{p}sheetData>{rows}</{p}sheetData>"),
            )
        } else {
            Edit::replace(sheet_data.inner(), rows)
        },
    ];
    Ok((apply_edits(part, xml, edits)?, extent))
}

/// Rewrites the first worksheet of `pkg` to hold `data`, merging strings into its shared-string
/// table when it has one.
pub fn rewrite_workbook(label: &str, pkg: &mut ZipPackage, data: &ChartData) -> Result<WorkbookEdit> {
    let layout = locate(label, pkg)?;
    let sheet_xml = entry_text(label, pkg, &layout.sheet_part)?;
    let sheet_label = format!("{label}!{}", layout.sheet_part);

    let (sheet_out, dimension, sst_out) = match &layout.shared_strings_part {
        Some(sst_part) => {
            let sst_label = format!("{label}!{sst_part}");
            let mut sst = SharedStrings::parse(&sst_label, &entry_text(label, pkg, sst_part)?)?;
            let (sheet, dimension) = rewrite_sheet(&sheet_label, &sheet_xml, data, Some(&mut sst))?;
            (sheet, dimension, Some((sst_part.clone(), sst.to_xml()?)))
        }
        None => {
            let (sheet, dimension) = rewrite_sheet(&sheet_label, &sheet_xml, data, None)?;
            (sheet, dimension, None)
        }
    };

    pkg.set_entry(&layout.sheet_part, sheet_out.into_bytes());
    let shared_strings = sst_out.is_some();
    if let Some((part, xml)) = sst_out {
        pkg.set_entry(&part, xml.into_bytes());
    }
    log::debug!(
        "{label}: wrote {} row(s) to {} ({dimension})",
        data.categories.len() + 1,
        layout.sheet_part
    );
    Ok(WorkbookEdit {
        sheet_name: layout.sheet_name,
        sheet_part: layout.sheet_part,
        dimension,
        shared_strings,
    })
}

/// Builds a single-sheet workbook holding `data`.
pub fn new_workbook(data: &ChartData, sheet_name: &str) -> Result<Vec<u8>> {
    let content_types = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="rels" ContentType="{rels}"/><Default Extension="xml" ContentType="{xml}"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="{workbook}"/>"#,
            r#"<Override PartName="/xl/worksheets/sheet1.xml" ContentType="{sheet}"/>"#,
            r#"<Override PartName="/xl/styles.xml" ContentType="{styles}"/>"#,
            r#"<Override PartName="/xl/sharedStrings.xml" ContentType="{sst}"/>"#,
            r#"</Types>"#
        ),
        rels = CT_RELS,
        xml = CT_XML,
        workbook = CT_WORKBOOK,
        sheet = CT_WORKSHEET,
        styles = CT_STYLES,
        sst = CT_SHARED_STRINGS,
    );
    let package_rels = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="{}" Target="xl/workbook.xml"/></Relationships>"#
        ),
        REL_OFFICE_DOCUMENT
    );
    let workbook = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<workbook xmlns="{ns}" xmlns:r="{r}"><sheets>"#,
            r#"<sheet name="{name}" sheetId="1" r:id="rId1"/></sheets></workbook>"#
        ),
        ns = NS_SPREADSHEET,
        r = NS_RELATIONSHIPS,
        name = escape_attr(sheet_name),
    );
    let workbook_rels = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="{sheet}" Target="worksheets/sheet1.xml"/>"#,
            r#"<Relationship Id="rId2" Type="{styles}" Target="styles.xml"/>"#,
            r#"<Relationship Id="rId3" Type="{sst}" Target="sharedStrings.xml"/>"#,
            r#"</Relationships>"#
        ),
        sheet = REL_WORKSHEET,
        styles = REL_STYLES,
        sst = REL_SHARED_STRINGS,
    );
    let sheet = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<worksheet xmlns="{ns}" xmlns:r="{r}"><dimension ref="A1"/>"#,
            r#"<sheetViews><sheetView workbookViewId="0"/></sheetViews>"#,
            r#"<sheetFormatPr defaultRowHeight="15"/><sheetData/>"#,
            r#"<pageMargins left="0.7" right="0.7" top="0.75" bottom="0.75" header="0.3" footer="0.3"/>"#,
            r#"</worksheet>"#
        ),
        ns = NS_SPREADSHEET,
        r = NS_RELATIONSHIPS,
    );
    let styles = format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<styleSheet xmlns="{ns}">"#,
            r#"<fonts count="1"><font><sz val="11"/><name val="Calibri"/><family val="2"/></font></fonts>"#,
            r#"<fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills>"#,
            r#"<borders count="1"><border><left/><right/><top/><bottom/><diagonal/></border></borders>"#,
            r#"<cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs>"#,
            r#"<cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs>"#,
            r#"<cellStyles count="1"><cellStyle name="Normal" xfId="0" builtinId="0"/></cellStyles>"#,
            r#"</styleSheet>"#
        ),
        ns = NS_SPREADSHEET,
    );
    let shared_strings = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><sst xmlns="{NS_SPREADSHEET}" count="0" uniqueCount="0"/>"#
    );

    let mut pkg = ZipPackage {
        entries: vec![
            ZipEntry::file("[Content_Types].xml", content_types.into_bytes()),
            ZipEntry::file("_rels/.rels", package_rels.into_bytes()),
            ZipEntry::file(DEFAULT_WORKBOOK_PART, workbook.into_bytes()),
            ZipEntry::file("xl/_rels/workbook.xml.rels", workbook_rels.into_bytes()),
            ZipEntry::file(DEFAULT_SHEET_PART, sheet.into_bytes()),
            ZipEntry::file("xl/styles.xml", styles.into_bytes()),
            ZipEntry::file(DEFAULT_SHARED_STRINGS_PART, shared_strings.into_bytes()),
        ],
    };
    rewrite_workbook("new workbook", &mut pkg, data)?;
    pkg.to_bytes("new workbook")
}

/// Column index of a cell reference (`"C7"` -> `2`).
fn column_of(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(char::is_ascii_alphabetic).collect();
    if letters.is_empty() {
        return None;
    }
    let mut col = 0usize;
    for b in letters.to_ascii_uppercase().bytes() {
        col = col * 26 + usize::from(b - b'A') + 1;
    }
    Some(col - 1)
}

/// Cell text of the first worksheet, row by row. Gaps are empty strings.
pub fn read_workbook_grid(label: &str, bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let pkg = ZipPackage::from_bytes(label, bytes)?;
    let layout = locate(label, &pkg)?;
    let sst = match &layout.shared_strings_part {
        Some(part) => Some(SharedStrings::parse(part, &entry_text(label, &pkg, part)?)?),
        None => None,
    };
    let xml = entry_text(label, &pkg, &layout.sheet_part)?;
    let part = layout.sheet_part.as_str();
    let (root, root_el) =
        root_element(&xml).ok_or_else(|| PatchError::structural(part, "empty worksheet"))?;
    let p = prefix_of(root);
    let sheet_data = find_first(&xml, root_el.inner(), &format!("{p}sheetData"))
        .ok_or_else(|| PatchError::structural(part, "missing sheetData"))?;

    let mut rows: BTreeMap<usize, BTreeMap<usize, String>> = BTreeMap::new();
    let row_name = format!("{p}row");
    for (i, row) in find_elements(&xml, sheet_data.inner(), &row_name).into_iter().enumerate() {
        let row_no = attr_value(row.open_tag(&xml), "r")
            .and_then(|r| r.parse::<usize>().ok())
            .unwrap_or(i + 1);
        let cells = rows.entry(row_no).or_default();
        for (j, cell) in find_elements(&xml, row.inner(), &format!("{p}c")).into_iter().enumerate() {
            let tag = cell.open_tag(&xml);
            let col = attr_value(tag, "r").and_then(column_of).unwrap_or(j);
            let text = match attr_value(tag, "t") {
                Some("s") => {
                    let idx = find_child(&xml, &cell, &format!("{p}v"))
                        .and_then(|v| v.inner_text(&xml).trim().parse::<usize>().ok());
                    idx.and_then(|i| sst.as_ref()?.get(i))
                        .map(str::to_string)
                        .ok_or_else(|| PatchError::structural(part, "dangling shared string reference"))?
                }
                Some("inlineStr") => {
                    let mut text = String::new();
                    for t in find_elements(&xml, cell.inner(), &format!("{p}t")) {
                        text.push_str(&unescape(part, t.inner_text(&xml))?);
                    }
                    text
                }
                _ => match find_child(&xml, &cell, &format!("{p}v")) {
                    Some(v) => unescape(part, v.inner_text(&xml))?,
                    None => String::new(),
                },
            };
            cells.insert(col, text);
        }
    }

    let mut grid = Vec::new();
    for (_, cells) in rows {
        let width = cells.keys().next_back().map(|c| c + 1).unwrap_or(0);
        let mut row = vec![String::new(); width];
        for (col, text) in cells {
            row[col] = text;
        }
        grid.push(row);
    }
    Ok(grid)
}
