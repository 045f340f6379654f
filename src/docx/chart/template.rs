//! Chart parts generated from scratch.

use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

use crate::docx::chart::{rewrite_chart_caches, ChartData};
use crate::docx::constants::{NS_CHART, NS_DRAWING, NS_RELATIONSHIPS};
use crate::docx::xml::{escape_attr, escape_text};
use crate::error::{PatchError, Result};

const CAT_AX_ID: u32 = 111_111_111;
const VAL_AX_ID: u32 = 222_222_222;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    /// Horizontal bars.
    Bar,
    /// Vertical bars.
    #[default]
    Column,
    Line,
    Pie,
    Area,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegendPosition {
    #[default]
    Right,
    Left,
    Top,
    Bottom,
}

impl LegendPosition {
    pub fn xml_value(&self) -> &'static str {
        match self {
            Self::Right => "r",
            Self::Left => "l",
            Self::Top => "t",
            Self::Bottom => "b",
        }
    }
}

/// Presentation of a generated chart. Series data comes separately as [`ChartData`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: Option<String>,
    pub x_axis_title: Option<String>,
    pub y_axis_title: Option<String>,
    pub legend: Option<LegendPosition>,
    /// Relationship id of the companion workbook, written as `c:externalData`.
    pub external_rel_id: Option<String>,
}

/// Serialized chart part holding `data`, with formulas pointing at `sheet` of the workbook.
pub fn chart_part_xml(spec: &ChartSpec, data: &ChartData, sheet: &str) -> Result<String> {
    let mut skeleton = String::new();
    write_chart_space(&mut skeleton, spec, data.series.len())
        .map_err(|e| PatchError::structural("chart template", e.to_string()))?;
    rewrite_chart_caches("chart template", &skeleton, data, sheet)
}

fn write_chart_space(w: &mut String, spec: &ChartSpec, series: usize) -> fmt::Result {
    write!(w, r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#)?;
    write!(
        w,
        r#"<c:chartSpace xmlns:c="{NS_CHART}" xmlns:a="{NS_DRAWING}" xmlns:r="{NS_RELATIONSHIPS}">"#
    )?;
    write!(w, r#"<c:date1904 val="0"/><c:lang val="en-US"/><c:roundedCorners val="0"/>"#)?;
    write!(w, "<c:chart>")?;
    match &spec.title {
        Some(title) => {
            write_title(w, title)?;
            write!(w, r#"<c:autoTitleDeleted val="0"/>"#)?;
        }
        None => write!(w, r#"<c:autoTitleDeleted val="1"/>"#)?,
    }

    write!(w, "<c:plotArea><c:layout/>")?;
    write_group(w, spec.kind, series)?;
    if spec.kind != ChartKind::Pie {
        write_axes(w, spec)?;
    }
    write!(w, "</c:plotArea>")?;

    if let Some(legend) = spec.legend {
        write!(
            w,
            r#"<c:legend><c:legendPos val="{}"/><c:overlay val="0"/></c:legend>"#,
            legend.xml_value()
        )?;
    }
    write!(w, r#"<c:plotVisOnly val="1"/><c:dispBlanksAs val="gap"/>"#)?;
    write!(w, "</c:chart>")?;

    if let Some(id) = &spec.external_rel_id {
        write!(
            w,
            r#"<c:externalData r:id="{}"><c:autoUpdate val="0"/></c:externalData>"#,
            escape_attr(id)
        )?;
    }
    write!(w, "</c:chartSpace>")
}

fn write_title(w: &mut String, text: &str) -> fmt::Result {
    write!(w, "<c:title><c:tx><c:rich><a:bodyPr/><a:lstStyle/>")?;
    write!(w, "<a:p><a:pPr><a:defRPr/></a:pPr>")?;
    write!(w, r#"<a:r><a:rPr lang="en-US"/><a:t>{}</a:t></a:r>"#, escape_text(text))?;
    write!(w, r#"</a:p></c:rich></c:tx><c:overlay val="0"/></c:title>"#)
}

/// Empty series blocks; names and references are filled in by the cache writer.
fn write_series(w: &mut String, kind: ChartKind, index: usize) -> fmt::Result {
    write!(w, r#"<c:ser><c:idx val="{index}"/><c:order val="{index}"/>"#)?;
    match kind {
        ChartKind::Bar | ChartKind::Column => write!(w, r#"<c:invertIfNegative val="0"/>"#)?,
        ChartKind::Line => {
            write!(w, r#"<c:marker><c:symbol val="none"/></c:marker><c:smooth val="0"/>"#)?
        }
        ChartKind::Pie | ChartKind::Area => {}
    }
    write!(w, "</c:ser>")
}

fn write_group(w: &mut String, kind: ChartKind, series: usize) -> fmt::Result {
    let (tag, vary) = match kind {
        ChartKind::Bar | ChartKind::Column => ("c:barChart", false),
        ChartKind::Line => ("c:lineChart", false),
        ChartKind::Pie => ("c:pieChart", true),
        ChartKind::Area => ("c:areaChart", false),
    };
    write!(w, "<{tag}>")?;
    match kind {
        ChartKind::Bar => write!(w, r#"<c:barDir val="bar"/><c:grouping val="clustered"/>"#)?,
        ChartKind::Column => write!(w, r#"<c:barDir val="col"/><c:grouping val="clustered"/>"#)?,
        ChartKind::Line | ChartKind::Area => write!(w, r#"<c:grouping val="standard"/>"#)?,
        ChartKind::Pie => {}
    }
    write!(w, r#"<c:varyColors val="{}"/>"#, if vary { "1" } else { "0" })?;
    for i in 0..series {
        write_series(w, kind, i)?;
    }
    match kind {
        ChartKind::Bar | ChartKind::Column => write!(w, r#"<c:gapWidth val="150"/>"#)?,
        ChartKind::Line => write!(w, r#"<c:marker val="1"/>"#)?,
        ChartKind::Pie => write!(w, r#"<c:firstSliceAng val="0"/>"#)?,
        ChartKind::Area => {}
    }
    if kind != ChartKind::Pie {
        write!(w, r#"<c:axId val="{CAT_AX_ID}"/><c:axId val="{VAL_AX_ID}"/>"#)?;
    }
    write!(w, "</{tag}>")
}

fn write_axes(w: &mut String, spec: &ChartSpec) -> fmt::Result {
    // Horizontal bars swap the axis positions.
    let (cat_pos, val_pos) = if spec.kind == ChartKind::Bar { ("l", "b") } else { ("b", "l") };

    write!(w, r#"<c:catAx><c:axId val="{CAT_AX_ID}"/>"#)?;
    write!(w, r#"<c:scaling><c:orientation val="minMax"/></c:scaling>"#)?;
    write!(w, r#"<c:delete val="0"/><c:axPos val="{cat_pos}"/>"#)?;
    if let Some(title) = &spec.x_axis_title {
        write_title(w, title)?;
    }
    write!(
        w,
        r#"<c:numFmt formatCode="General" sourceLinked="1"/><c:majorTickMark val="out"/><c:minorTickMark val="none"/><c:tickLblPos val="nextTo"/>"#
    )?;
    write!(w, r#"<c:crossAx val="{VAL_AX_ID}"/><c:crosses val="autoZero"/>"#)?;
    write!(
        w,
        r#"<c:auto val="1"/><c:lblAlgn val="ctr"/><c:lblOffset val="100"/><c:noMultiLvlLbl val="0"/>"#
    )?;
    write!(w, "</c:catAx>")?;

    write!(w, r#"<c:valAx><c:axId val="{VAL_AX_ID}"/>"#)?;
    write!(w, r#"<c:scaling><c:orientation val="minMax"/></c:scaling>"#)?;
    write!(w, r#"<c:delete val="0"/><c:axPos val="{val_pos}"/><c:majorGridlines/>"#)?;
    if let Some(title) = &spec.y_axis_title {
        write_title(w, title)?;
    }
    write!(
        w,
        r#"<c:numFmt formatCode="General" sourceLinked="1"/><c:majorTickMark val="out"/><c:minorTickMark val="none"/><c:tickLblPos val="nextTo"/>"#
    )?;
    write!(w, r#"<c:crossAx val="{CAT_AX_ID}"/><c:crosses val="autoZero"/>"#)?;
    write!(w, r#"<c:crossBetween val="between"/></c:valAx>"#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docx::chart::{external_data_rel_id, read_chart_caches, series_count, SeriesData};
    use crate::docx::xml::parse_xml_part;
    use pretty_assertions::assert_eq;

    fn data() -> ChartData {
        ChartData::new(
            vec!["Q1".into(), "Q2".into()],
            vec![
                SeriesData::new("Sales", vec![10.0, 20.0]),
                SeriesData::new("Costs <net>", vec![4.0, 5.5]),
            ],
        )
    }

    #[test]
    fn generated_chart_is_well_formed_and_consistent() {
        for kind in [ChartKind::Bar, ChartKind::Column, ChartKind::Line, ChartKind::Pie, ChartKind::Area] {
            let spec = ChartSpec {
                kind,
                title: Some("Revenue & Costs".into()),
                x_axis_title: Some("Quarter".into()),
                y_axis_title: Some("USD".into()),
                legend: Some(LegendPosition::Bottom),
                external_rel_id: Some("rId1".into()),
            };
            let xml = chart_part_xml(&spec, &data(), "Sheet1").expect("chart");
            parse_xml_part("chart.xml", xml.as_bytes()).expect("well-formed");
            assert_eq!(series_count(&xml), 2, "{kind}");
            assert_eq!(read_chart_caches("chart.xml", &xml).expect("read"), data(), "{kind}");
            assert_eq!(external_data_rel_id(&xml).as_deref(), Some("rId1"));
            assert!(xml.contains("<a:t>Revenue &amp; Costs</a:t>"));
            assert!(xml.contains(r#"<c:legendPos val="b"/>"#));
            assert_eq!(xml.contains("<c:catAx>"), kind != ChartKind::Pie, "{kind}");
        }
    }

    #[test]
    fn line_series_keep_schema_order() {
        let spec = ChartSpec {
            kind: ChartKind::Line,
            ..ChartSpec::default()
        };
        let xml = chart_part_xml(&spec, &data(), "Sheet1").expect("chart");
        let marker = xml.find("<c:marker><c:symbol").expect("marker");
        let val = xml.find("<c:val>").expect("val");
        let smooth = xml.find("<c:smooth").expect("smooth");
        assert!(marker < val && val < smooth);
        assert!(xml.contains(r#"<c:autoTitleDeleted val="1"/>"#));
        assert!(!xml.contains("<c:legend>"));
        assert!(!xml.contains("c:externalData"));
    }

    #[test]
    fn bar_axes_are_swapped() {
        let spec = ChartSpec {
            kind: ChartKind::Bar,
            ..ChartSpec::default()
        };
        let xml = chart_part_xml(&spec, &data(), "Sheet1").expect("chart");
        assert!(xml.contains(r#"<c:barDir val="bar"/>"#));
        let cat = xml.find("<c:catAx>").expect("catAx");
        assert!(xml[cat..].starts_with(&format!(
            r#"<c:catAx><c:axId val="{CAT_AX_ID}"/><c:scaling><c:orientation val="minMax"/></c:scaling><c:delete val="0"/><c:axPos val="l"/>"#
        )));
    }
}
