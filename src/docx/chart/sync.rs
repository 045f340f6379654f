//! Session-level chart operations: update, create, copy and read back.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::docx::chart::{
    chart_part_xml, external_data_rel_id, new_workbook, read_chart_caches, rewrite_chart_caches,
    rewrite_workbook, series_count, sheet_formula_name, xml_illegal_char, ChartData, ChartSpec,
    LegendPosition, WorkbookEdit,
};
use crate::docx::constants::{
    chart_part, CHARTS_DIR, CONTENT_TYPES_PART, CT_CHART, CT_XLSX, DOCUMENT_PART, EMBEDDINGS_DIR,
    REL_CHART, REL_PACKAGE, WORKBOOK_EXTENSIONS,
};
use crate::docx::content_types::{self, ContentTypes};
use crate::docx::journal::Journal;
use crate::docx::package::ZipPackage;
use crate::docx::rels::{
    add_relationship, rels_for_part, relative_target, resolve_relationship, resolve_target,
    Relationships,
};
use crate::docx::scan::{attr_value, TagScanner};
use crate::docx::session::PackageSession;
use crate::docx::splice::{insert_at, next_doc_pr_id, resolve_offset, ChartDrawing, InsertPosition};
use crate::error::{PatchError, Result};

static CHART_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^chart(\d+)\.xml$").expect("valid chart file regex"));

/// Drawing size used when neither the caller nor the source drawing gives one (15.24 x 8.89 cm).
pub const DEFAULT_WIDTH_EMU: u64 = 5_486_400;
pub const DEFAULT_HEIGHT_EMU: u64 = 3_200_400;

const WORKBOOK_STEM: &str = "word/embeddings/Microsoft_Excel_Worksheet";

/// How the companion workbook of a chart was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    /// Through the chart's external data relationship.
    Relationship,
    /// First workbook in the embeddings directory. Ambiguous when several charts share it.
    Heuristic,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkbookResolution {
    pub part: String,
    pub via: ResolvedVia,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChartUpdate {
    pub chart_part: String,
    pub workbook: WorkbookResolution,
    pub sheet_name: String,
    pub dimension: String,
    pub series_written: usize,
    /// Series blocks past the supplied data, left as they were.
    pub series_untouched: usize,
    pub steps: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ChartOptions {
    pub data: ChartData,
    pub spec: ChartSpec,
    pub sheet_name: String,
    pub width_emu: u64,
    pub height_emu: u64,
    pub position: InsertPosition,
}

impl ChartOptions {
    pub fn new(data: ChartData) -> Self {
        Self {
            data,
            spec: ChartSpec {
                legend: Some(LegendPosition::Right),
                ..ChartSpec::default()
            },
            sheet_name: "Sheet1".to_string(),
            width_emu: DEFAULT_WIDTH_EMU,
            height_emu: DEFAULT_HEIGHT_EMU,
            position: InsertPosition::DocumentEnd,
        }
    }

    fn validate(&self) -> Result<()> {
        self.data.validate()?;
        let name = self.sheet_name.as_str();
        if name.trim().is_empty()
            || name.chars().count() > 31
            || name.contains(['[', ']', ':', '*', '?', '/', '\\'])
            || xml_illegal_char(name).is_some()
        {
            return Err(PatchError::Validation(format!("invalid sheet name {name:?}")));
        }
        if self.width_emu == 0 || self.height_emu == 0 {
            return Err(PatchError::Validation("chart extent must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ChartCreated {
    pub index: u32,
    pub chart_part: String,
    pub workbook_part: String,
    pub document_rel_id: String,
    pub steps: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChartCopied {
    pub source_index: u32,
    pub index: u32,
    pub chart_part: String,
    /// Workbook the copy was taken from and how it was found. `None` when the source chart
    /// has no workbook at all.
    pub source_workbook: Option<WorkbookResolution>,
    /// The copied workbook.
    pub workbook_part: Option<String>,
    pub document_rel_id: String,
    pub steps: Vec<String>,
}

/// Indices of the chart parts in the package, ascending.
pub fn list_charts(session: &PackageSession) -> Result<Vec<u32>> {
    let mut indices: Vec<u32> = session
        .list_dir(CHARTS_DIR)?
        .iter()
        .filter_map(|name| CHART_FILE_RE.captures(name)?[1].parse().ok())
        .collect();
    indices.sort_unstable();
    Ok(indices)
}

fn existing_chart(session: &PackageSession, index: u32) -> Result<String> {
    let part = chart_part(index);
    if !session.part_exists(&part)? {
        return Err(PatchError::not_found("chart", part));
    }
    Ok(part)
}

pub fn read_chart_data(session: &PackageSession, index: u32) -> Result<ChartData> {
    let part = existing_chart(session, index)?;
    read_chart_caches(&part, &session.read_part_string(&part)?)
}

fn is_workbook_name(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| WORKBOOK_EXTENSIONS.iter().any(|w| ext.eq_ignore_ascii_case(w)))
}

/// Finds the workbook behind a chart: its external data relationship when that resolves to an
/// existing workbook, else the first workbook of the embeddings directory.
pub fn resolve_workbook(
    session: &PackageSession,
    chart_part: &str,
    chart_xml: &str,
) -> Result<WorkbookResolution> {
    if let Some(id) = external_data_rel_id(chart_xml) {
        match resolve_relationship(session, chart_part, &id) {
            Ok(part) => {
                if is_workbook_name(&part) && session.part_exists(&part)? {
                    return Ok(WorkbookResolution {
                        part,
                        via: ResolvedVia::Relationship,
                    });
                }
                log::debug!("{chart_part}: {id} -> {part} is not an embedded workbook");
            }
            Err(e) if e.is_not_found() => log::debug!("{chart_part}: {e}"),
            Err(e) => return Err(e),
        }
    }

    let first = session
        .list_dir(EMBEDDINGS_DIR)?
        .into_iter()
        .find(|name| is_workbook_name(name))
        .ok_or_else(|| PatchError::not_found("companion workbook", chart_part.to_string()))?;
    let part = format!("{EMBEDDINGS_DIR}/{first}");
    log::warn!("{chart_part}: no usable external data relationship, guessing workbook {part}");
    Ok(WorkbookResolution {
        part,
        via: ResolvedVia::Heuristic,
    })
}

/// Rewrites the caches of chart `index` and the grid of its workbook from `data`.
///
/// Only the first `data.series.len()` series blocks are rewritten; any further blocks keep
/// their data and formatting. Nothing is written unless both new parts could be built.
pub fn update_chart(session: &PackageSession, index: u32, data: &ChartData) -> Result<ChartUpdate> {
    data.validate()?;
    let chart_part = existing_chart(session, index)?;
    let chart_xml = session.read_part_string(&chart_part)?;
    let blocks = series_count(&chart_xml);
    if blocks < data.series.len() {
        return Err(PatchError::structural(
            &chart_part,
            format!("chart has {blocks} series block(s), got {} series", data.series.len()),
        ));
    }

    let workbook = resolve_workbook(session, &chart_part, &chart_xml)?;
    let mut pkg = ZipPackage::from_bytes(&workbook.part, &session.read_part(&workbook.part)?)?;
    let WorkbookEdit {
        sheet_name,
        dimension,
        ..
    } = rewrite_workbook(&workbook.part, &mut pkg, data)?;
    let new_chart = rewrite_chart_caches(&chart_part, &chart_xml, data, &sheet_formula_name(&sheet_name))?;
    let new_workbook = pkg.to_bytes(&workbook.part)?;

    let mut journal = Journal::new(session, format!("update chart {index}"));
    journal.write("chart caches", &chart_part, new_chart.as_bytes())?;
    journal.write("workbook grid", &workbook.part, &new_workbook)?;
    let steps = journal.commit();

    log::info!(
        "updated {chart_part}: {} series x {} categories, workbook {} ({:?})",
        data.series.len(),
        data.categories.len(),
        workbook.part,
        workbook.via
    );
    Ok(ChartUpdate {
        chart_part,
        workbook,
        sheet_name,
        dimension,
        series_written: data.series.len(),
        series_untouched: blocks - data.series.len(),
        steps,
    })
}

fn next_chart_index(session: &PackageSession) -> Result<u32> {
    Ok(list_charts(session)?.last().map_or(1, |max| max + 1))
}

/// `{stem}{n}.{ext}` for the first `n >= start` not taken in the package.
fn fresh_part_name(session: &PackageSession, stem: &str, ext: &str, start: u32) -> Result<String> {
    let mut n = start.max(1);
    loop {
        let name = format!("{stem}{n}.{ext}");
        if !session.part_exists(&name)? {
            return Ok(name);
        }
        n += 1;
    }
}

/// Adds a new chart with its own workbook and places it at `options.position`.
///
/// Steps run in dependency order (workbook, chart relationship, chart part, content types,
/// document relationship, drawing); a failure undoes the steps already taken.
pub fn create_chart(session: &PackageSession, options: &ChartOptions) -> Result<ChartCreated> {
    options.validate()?;
    resolve_offset(&session.read_part_string(DOCUMENT_PART)?, &options.position)?;

    let index = next_chart_index(session)?;
    let chart_part = chart_part(index);
    let workbook_part = fresh_part_name(session, WORKBOOK_STEM, "xlsx", index)?;
    let chart_rels = rels_for_part(&chart_part);
    let document_rels = rels_for_part(DOCUMENT_PART);

    let mut journal = Journal::new(session, format!("create chart {index}"));

    let workbook = new_workbook(&options.data, &options.sheet_name)?;
    journal.write("workbook", &workbook_part, &workbook)?;

    let workbook_target = relative_target(&chart_part, &workbook_part);
    let workbook_rel_id = journal.step("chart relationship", &[chart_rels.as_str()], |s| {
        add_relationship(s, &chart_part, REL_PACKAGE, &workbook_target)
    })?;

    let spec = ChartSpec {
        external_rel_id: Some(workbook_rel_id),
        ..options.spec.clone()
    };
    let chart_xml = chart_part_xml(&spec, &options.data, &sheet_formula_name(&options.sheet_name))?;
    journal.write("chart part", &chart_part, chart_xml.as_bytes())?;

    journal.step::<()>("content types", &[CONTENT_TYPES_PART], |s| {
        content_types::add_override(s, &chart_part, CT_CHART)?;
        content_types::add_override(s, &workbook_part, CT_XLSX)?;
        Ok(())
    })?;

    let chart_target = relative_target(DOCUMENT_PART, &chart_part);
    let document_rel_id = journal.step("document relationship", &[document_rels.as_str()], |s| {
        add_relationship(s, DOCUMENT_PART, REL_CHART, &chart_target)
    })?;

    let markup = session.read_part_string(DOCUMENT_PART)?;
    let name = format!("Chart {index}");
    let drawing = ChartDrawing {
        rel_id: &document_rel_id,
        doc_pr_id: next_doc_pr_id(&markup)?,
        name: &name,
        width_emu: options.width_emu,
        height_emu: options.height_emu,
    };
    let updated = insert_at(&markup, &drawing.to_paragraph(), &options.position)?;
    journal.write("chart drawing", DOCUMENT_PART, updated.as_bytes())?;

    let steps = journal.commit();
    log::info!(
        "created {chart_part} ({} series) with {workbook_part} at {}",
        options.data.series.len(),
        options.position
    );
    Ok(ChartCreated {
        index,
        chart_part,
        workbook_part,
        document_rel_id,
        steps,
    })
}

/// Size of the drawing that shows `chart_part` in the document, if there is one.
fn drawing_extent(session: &PackageSession, markup: &str, chart_part: &str) -> Result<Option<(u64, u64)>> {
    let Some(rels) = Relationships::load(session, DOCUMENT_PART)? else {
        return Ok(None);
    };
    let ids: Vec<String> = rels
        .iter()
        .filter(|r| !r.external && resolve_target(DOCUMENT_PART, &r.target) == chart_part)
        .map(|r| r.id)
        .collect();
    if ids.is_empty() {
        return Ok(None);
    }

    let mut extent = None;
    for tag in TagScanner::new(markup) {
        let text = tag.text(markup);
        if tag.name == "wp:extent" {
            let cx = attr_value(text, "cx").and_then(|v| v.parse().ok());
            let cy = attr_value(text, "cy").and_then(|v| v.parse().ok());
            extent = cx.zip(cy);
        } else if tag.name.ends_with(":chart")
            && attr_value(text, "r:id").is_some_and(|id| ids.iter().any(|i| i == id))
        {
            return Ok(extent);
        }
    }
    Ok(None)
}

/// Duplicates chart `source_index` and its workbook under fresh names and shows the copy right
/// after the paragraph containing `anchor`.
pub fn copy_chart(session: &PackageSession, source_index: u32, anchor: &str) -> Result<ChartCopied> {
    let position = InsertPosition::AfterAnchor(anchor.to_string());
    let markup = session.read_part_string(DOCUMENT_PART)?;
    resolve_offset(&markup, &position)?;

    let source_part = existing_chart(session, source_index)?;
    let chart_bytes = session.read_part(&source_part)?;
    let chart_xml = String::from_utf8_lossy(&chart_bytes).into_owned();
    let workbook = match resolve_workbook(session, &source_part, &chart_xml) {
        Ok(found) => Some(found),
        Err(e) if e.is_not_found() => {
            log::warn!("{source_part}: copying without a workbook: {e}");
            None
        }
        Err(e) => return Err(e),
    };

    let index = next_chart_index(session)?;
    let new_part = chart_part(index);
    let types = ContentTypes::load(session)?;
    let mut rels = match Relationships::load(session, &source_part)? {
        Some(rels) => rels.copy_to(&new_part),
        None => Relationships::empty(&rels_for_part(&new_part)),
    };

    let mut journal = Journal::new(session, format!("copy chart {source_index} to {index}"));
    let mut overrides: Vec<(String, String)> = vec![(new_part.clone(), CT_CHART.to_string())];

    // Internal siblings of the chart (style and colour parts) are duplicated so the copies
    // never share a part.
    let workbook_part = match &workbook {
        Some(found) => {
            let copy = fresh_part_name(session, WORKBOOK_STEM, "xlsx", index)?;
            journal.write("workbook copy", &copy, &session.read_part(&found.part)?)?;
            overrides.push((copy.clone(), CT_XLSX.to_string()));
            Some((found.part.clone(), copy))
        }
        None => None,
    };

    for rel in rels.iter().collect::<Vec<_>>() {
        if rel.external {
            continue;
        }
        let target = resolve_target(&source_part, &rel.target);
        if let Some((original, copy)) = &workbook_part {
            if &target == original {
                rels.retarget(&rel.id, &relative_target(&new_part, copy));
                continue;
            }
        }
        if !session.part_exists(&target)? {
            continue;
        }
        let (stem, ext) = sibling_stem(&target);
        let copy = fresh_part_name(session, &stem, &ext, index)?;
        journal.write("sibling copy", &copy, &session.read_part(&target)?)?;
        if let Some(ct) = types.override_for(&target) {
            overrides.push((copy.clone(), ct));
        }
        rels.retarget(&rel.id, &relative_target(&new_part, &copy));
    }

    // A missing or stale external data relationship would leave the copy pointing nowhere.
    if let Some((_, copy)) = &workbook_part {
        let target = relative_target(&new_part, copy);
        match external_data_rel_id(&chart_xml) {
            Some(id) => rels.upsert(&id, REL_PACKAGE, &target),
            None if rels.by_type(REL_PACKAGE).next().is_none() => {
                rels.add(REL_PACKAGE, &target)?;
            }
            None => {}
        }
    }

    journal.write("chart part copy", &new_part, &chart_bytes)?;
    journal.write("chart relationships", &rels_for_part(&new_part), &rels.to_xml())?;
    journal.step::<()>("content types", &[CONTENT_TYPES_PART], |s| {
        for (part, ct) in &overrides {
            content_types::add_override(s, part, ct)?;
        }
        Ok(())
    })?;

    let document_rels = rels_for_part(DOCUMENT_PART);
    let chart_target = relative_target(DOCUMENT_PART, &new_part);
    let document_rel_id = journal.step("document relationship", &[document_rels.as_str()], |s| {
        add_relationship(s, DOCUMENT_PART, REL_CHART, &chart_target)
    })?;

    let (width_emu, height_emu) = drawing_extent(session, &markup, &source_part)?
        .unwrap_or((DEFAULT_WIDTH_EMU, DEFAULT_HEIGHT_EMU));
    let name = format!("Chart {index}");
    let drawing = ChartDrawing {
        rel_id: &document_rel_id,
        doc_pr_id: next_doc_pr_id(&markup)?,
        name: &name,
        width_emu,
        height_emu,
    };
    let updated = insert_at(&markup, &drawing.to_paragraph(), &position)?;
    journal.write("chart drawing", DOCUMENT_PART, updated.as_bytes())?;

    let steps = journal.commit();
    log::info!("copied {source_part} to {new_part} after {anchor:?}");
    Ok(ChartCopied {
        source_index,
        index,
        chart_part: new_part,
        source_workbook: workbook,
        workbook_part: workbook_part.map(|(_, copy)| copy),
        document_rel_id,
        steps,
    })
}

/// `word/charts/style1.xml` -> (`word/charts/style`, `xml`).
fn sibling_stem(part: &str) -> (String, String) {
    let (base, ext) = part.rsplit_once('.').unwrap_or((part, "xml"));
    (base.trim_end_matches(|c: char| c.is_ascii_digit()).to_string(), ext.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::chart::{read_workbook_grid, SeriesData};
    use crate::docx::session::StagingOptions;
    use pretty_assertions::assert_eq;

    fn data() -> ChartData {
        ChartData::new(
            vec!["Q1".into(), "Q2".into()],
            vec![SeriesData::new("Sales", vec![10.0, 20.0])],
        )
    }

    fn blank() -> PackageSession {
        PackageSession::create_blank(&StagingOptions::default()).expect("blank")
    }

    #[test]
    fn create_registers_every_part() {
        let session = blank();
        let created = create_chart(&session, &ChartOptions::new(data())).expect("create");
        assert_eq!(created.index, 1);
        assert_eq!(created.chart_part, "word/charts/chart1.xml");
        assert_eq!(created.workbook_part, "word/embeddings/Microsoft_Excel_Worksheet1.xlsx");
        assert_eq!(
            created.steps,
            vec![
                "workbook",
                "chart relationship",
                "chart part",
                "content types",
                "document relationship",
                "chart drawing"
            ]
        );

        let types = ContentTypes::load(&session).expect("types");
        assert_eq!(types.override_for(&created.chart_part).as_deref(), Some(CT_CHART));
        assert_eq!(types.override_for(&created.workbook_part).as_deref(), Some(CT_XLSX));

        let resolution = resolve_workbook(
            &session,
            &created.chart_part,
            &session.read_part_string(&created.chart_part).expect("chart"),
        )
        .expect("resolve");
        assert_eq!(resolution.via, ResolvedVia::Relationship);
        assert_eq!(resolution.part, created.workbook_part);

        let doc = session.read_part_string(DOCUMENT_PART).expect("doc");
        assert!(doc.contains(&format!(r#"r:id="{}""#, created.document_rel_id)));
        assert!(doc.contains(r#"<wp:docPr id="1" name="Chart 1"/>"#));
        assert_eq!(read_chart_data(&session, 1).expect("read"), data());
        assert_eq!(list_charts(&session).expect("list"), vec![1]);
    }

    #[test]
    fn failed_create_leaves_package_untouched() {
        let session = blank();
        let before = session.part_names().expect("names");
        let doc = session.read_part(DOCUMENT_PART).expect("doc");

        let mut options = ChartOptions::new(data());
        options.position = InsertPosition::AfterAnchor("nowhere".into());
        let err = create_chart(&session, &options).err().expect("error");
        assert!(matches!(err, PatchError::AnchorNotFound(_)));
        assert_eq!(session.part_names().expect("names"), before);
        assert_eq!(session.read_part(DOCUMENT_PART).expect("doc"), doc);

        options.position = InsertPosition::DocumentEnd;
        options.sheet_name = "a/b".into();
        assert!(matches!(create_chart(&session, &options), Err(PatchError::Validation(_))));
        options.sheet_name = "Sheet\u{7}".into();
        assert!(matches!(create_chart(&session, &options), Err(PatchError::Validation(_))));
        assert_eq!(session.part_names().expect("names"), before);
    }

    #[test]
    fn update_rewrites_chart_and_workbook_together() {
        let session = blank();
        let created = create_chart(&session, &ChartOptions::new(data())).expect("create");
        let new_data = ChartData::new(
            vec!["Jan".into(), "Feb".into(), "Mar".into()],
            vec![SeriesData::new("Sales", vec![1.0, 2.5, 3.0])],
        );
        let update = update_chart(&session, created.index, &new_data).expect("update");
        assert_eq!(update.workbook.via, ResolvedVia::Relationship);
        assert_eq!(update.dimension, "A1:B4");
        assert_eq!(update.series_untouched, 0);
        assert_eq!(update.steps, vec!["chart caches", "workbook grid"]);
        assert_eq!(read_chart_data(&session, created.index).expect("read"), new_data);

        let grid = read_workbook_grid("wb", &session.read_part(&created.workbook_part).expect("wb"))
            .expect("grid");
        assert_eq!(grid[3], vec!["Mar", "3"]);
    }

    #[test]
    fn update_of_missing_chart_is_not_found() {
        let err = update_chart(&blank(), 4, &data()).err().expect("error");
        assert!(err.is_not_found());
    }

    #[test]
    fn stale_relationship_falls_back_to_embeddings() {
        let session = blank();
        let created = create_chart(&session, &ChartOptions::new(data())).expect("create");
        session
            .remove_part(&rels_for_part(&created.chart_part))
            .expect("remove rels");
        let chart_xml = session.read_part_string(&created.chart_part).expect("chart");
        let resolution = resolve_workbook(&session, &created.chart_part, &chart_xml).expect("resolve");
        assert_eq!(resolution.via, ResolvedVia::Heuristic);
        assert_eq!(resolution.part, created.workbook_part);

        session.remove_part(&created.workbook_part).expect("remove workbook");
        let err = resolve_workbook(&session, &created.chart_part, &chart_xml)
            .err()
            .expect("error");
        assert!(err.is_not_found());
    }

    #[test]
    fn reference_like_sheet_names_are_quoted_in_formulas() {
        let session = blank();
        let mut options = ChartOptions::new(data());
        options.sheet_name = "FY24".into();
        let created = create_chart(&session, &options).expect("create");
        let chart = session.read_part_string(&created.chart_part).expect("chart");
        assert!(chart.contains("<c:f>'FY24'!$B$1</c:f>"));
        assert!(chart.contains("<c:f>'FY24'!$A$2:$A$3</c:f>"));
        assert!(!chart.contains("<c:f>FY24!"));
    }

    #[test]
    fn sibling_names() {
        assert_eq!(
            sibling_stem("word/charts/colors12.xml"),
            ("word/charts/colors".to_string(), "xml".to_string())
        );
    }
}
