use std::fmt::Write as _;

use crate::docx::chart::{column_name, format_number, ChartData, SeriesData};
use crate::docx::scan::{
    apply_edits, attr_value, children, find_child, find_elements, find_first, Edit, Element,
};
use crate::docx::xml::{escape_text, unescape};
use crate::error::{PatchError, Result};

const SER: &str = "c:ser";

/// Series children that follow the data references; new references go before them.
const AFTER_DATA: [&str; 5] = ["c:smooth", "c:shape", "c:bubbleSize", "c:bubble3D", "c:extLst"];

pub fn series_count(chart_xml: &str) -> usize {
    find_elements(chart_xml, 0..chart_xml.len(), SER).len()
}

/// `r:id` of the chart's `c:externalData` element, if any.
pub fn external_data_rel_id(chart_xml: &str) -> Option<String> {
    let el = find_first(chart_xml, 0..chart_xml.len(), "c:externalData")?;
    attr_value(el.open_tag(chart_xml), "r:id").map(str::to_string)
}

fn name_formula(sheet: &str, series: usize) -> String {
    format!("{sheet}!${}$1", column_name(series + 1))
}

fn category_formula(sheet: &str, rows: usize) -> String {
    format!("{sheet}!$A$2:$A${}", rows + 1)
}

fn value_formula(sheet: &str, series: usize, rows: usize) -> String {
    let col = column_name(series + 1);
    format!("{sheet}!${col}$2:${col}${}", rows + 1)
}

fn tx_xml(sheet: &str, index: usize, name: &str) -> String {
    format!(
        r#"<c:tx><c:strRef><c:f>{}</c:f><c:strCache><c:ptCount val="1"/><c:pt idx="0"><c:v>{}</c:v></c:pt></c:strCache></c:strRef></c:tx>"#,
        escape_text(&name_formula(sheet, index)),
        escape_text(name)
    )
}

fn categories_xml(tag: &str, sheet: &str, categories: &[String]) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        r#"<{tag}><c:strRef><c:f>{}</c:f><c:strCache><c:ptCount val="{}"/>"#,
        escape_text(&category_formula(sheet, categories.len())),
        categories.len()
    );
    for (i, cat) in categories.iter().enumerate() {
        let _ = write!(out, r#"<c:pt idx="{i}"><c:v>{}</c:v></c:pt>"#, escape_text(cat));
    }
    let _ = write!(out, "</c:strCache></c:strRef></{tag}>");
    out
}

fn values_xml(tag: &str, sheet: &str, index: usize, format_code: &str, values: &[f64]) -> String {
    let mut out = String::new();
    let _ = write!(
        out,
        r#"<{tag}><c:numRef><c:f>{}</c:f><c:numCache><c:formatCode>{format_code}</c:formatCode><c:ptCount val="{}"/>"#,
        escape_text(&value_formula(sheet, index, values.len())),
        values.len()
    );
    for (i, v) in values.iter().enumerate() {
        let _ = write!(out, r#"<c:pt idx="{i}"><c:v>{}</c:v></c:pt>"#, format_number(*v));
    }
    let _ = write!(out, "</c:numCache></c:numRef></{tag}>");
    out
}

/// Existing number format of a value reference, still escaped.
fn existing_format_code<'a>(src: &'a str, val: &Element) -> Option<&'a str> {
    let fc = find_first(src, val.inner(), "c:formatCode")?;
    Some(fc.inner_text(src)).filter(|s| !s.is_empty())
}

/// Rewrites name, category and value references of the first `data.series.len()` series blocks.
/// Later blocks are left exactly as they are and no block is added or removed.
pub fn rewrite_chart_caches(part: &str, chart_xml: &str, data: &ChartData, sheet: &str) -> Result<String> {
    let blocks = find_elements(chart_xml, 0..chart_xml.len(), SER);
    if blocks.len() < data.series.len() {
        return Err(PatchError::structural(
            part,
            format!(
                "chart has {} series block(s), cannot write {} series",
                blocks.len(),
                data.series.len()
            ),
        ));
    }

    let mut edits = Vec::new();
    for (i, (ser, series)) in blocks.iter().zip(&data.series).enumerate() {
        if ser.is_empty() {
            return Err(PatchError::structural(part, format!("series block {} is empty", i + 1)));
        }
        series_edits(chart_xml, ser, i, series, &data.categories, sheet, &mut edits);
    }
    apply_edits(part, chart_xml, edits)
}

fn series_edits(
    src: &str,
    ser: &Element,
    index: usize,
    series: &SeriesData,
    categories: &[String],
    sheet: &str,
    edits: &mut Vec<Edit>,
) {
    let kids = children(src, ser);
    let child = |name: &str| kids.iter().find(|(n, _)| *n == name).map(|(_, el)| *el);

    let tx = tx_xml(sheet, index, &series.name);
    match child("c:tx") {
        Some(el) => edits.push(Edit::replace(el.span(), tx)),
        None => {
            let after = child("c:order").or_else(|| child("c:idx"));
            edits.push(Edit::insert(after.map(|e| e.end).unwrap_or(ser.open_end), tx));
        }
    }

    // Scatter and bubble series carry x/y references instead of category/value ones.
    let scatter = child("c:cat").is_none() && (child("c:xVal").is_some() || child("c:yVal").is_some());
    let (cat_tag, val_tag) = if scatter { ("c:xVal", "c:yVal") } else { ("c:cat", "c:val") };
    let cat_el = child(cat_tag);
    let val_el = child(val_tag);

    let tail = kids
        .iter()
        .find(|(n, _)| AFTER_DATA.contains(n))
        .map(|(_, el)| el.start)
        .unwrap_or(ser.close_start);

    let cat_xml = categories_xml(cat_tag, sheet, categories);
    match (cat_el, val_el) {
        (Some(el), _) => edits.push(Edit::replace(el.span(), cat_xml)),
        (None, Some(val)) => edits.push(Edit::insert(val.start, cat_xml)),
        (None, None) => edits.push(Edit::insert(tail, cat_xml)),
    }

    let format_code = val_el
        .and_then(|el| existing_format_code(src, &el))
        .unwrap_or("General")
        .to_string();
    let val_xml = values_xml(val_tag, sheet, index, &format_code, &series.values);
    match (val_el, cat_el) {
        (Some(el), _) => edits.push(Edit::replace(el.span(), val_xml)),
        (None, Some(cat)) => edits.push(Edit::insert(cat.end, val_xml)),
        (None, None) => edits.push(Edit::insert(tail, val_xml)),
    }
}

/// Cached points of a `c:strCache`/`c:numCache`, ordered by `idx`.
fn cached_points(part: &str, src: &str, container: &Element) -> Result<Vec<String>> {
    let mut pts: Vec<(usize, String)> = Vec::new();
    for pt in find_elements(src, container.inner(), "c:pt") {
        let idx = attr_value(pt.open_tag(src), "idx")
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| PatchError::structural(part, "cache point without idx"))?;
        let text = match find_child(src, &pt, "c:v") {
            Some(v) => unescape(part, v.inner_text(src))?,
            None => String::new(),
        };
        pts.push((idx, text));
    }
    pts.sort_by_key(|(idx, _)| *idx);
    Ok(pts.into_iter().map(|(_, t)| t).collect())
}

fn cache_of(src: &str, reference: &Element) -> Option<Element> {
    find_first(src, reference.inner(), "c:strCache")
        .or_else(|| find_first(src, reference.inner(), "c:numCache"))
        .or_else(|| find_first(src, reference.inner(), "c:strLit"))
        .or_else(|| find_first(src, reference.inner(), "c:numLit"))
}

/// Reads the cached series data back out of a chart part.
pub fn read_chart_caches(part: &str, chart_xml: &str) -> Result<ChartData> {
    let mut categories: Option<Vec<String>> = None;
    let mut series = Vec::new();
    for ser in find_elements(chart_xml, 0..chart_xml.len(), SER) {
        let name = match find_child(chart_xml, &ser, "c:tx") {
            Some(tx) => match find_first(chart_xml, tx.inner(), "c:v") {
                Some(v) => unescape(part, v.inner_text(chart_xml))?,
                None => String::new(),
            },
            None => String::new(),
        };

        let cat = find_child(chart_xml, &ser, "c:cat").or_else(|| find_child(chart_xml, &ser, "c:xVal"));
        if categories.is_none() {
            if let Some(cache) = cat.as_ref().and_then(|c| cache_of(chart_xml, c)) {
                categories = Some(cached_points(part, chart_xml, &cache)?);
            }
        }

        let val = find_child(chart_xml, &ser, "c:val").or_else(|| find_child(chart_xml, &ser, "c:yVal"));
        let mut values = Vec::new();
        if let Some(cache) = val.as_ref().and_then(|v| cache_of(chart_xml, v)) {
            for text in cached_points(part, chart_xml, &cache)? {
                let v = text.trim().parse::<f64>().map_err(|_| {
                    PatchError::structural(part, format!("non-numeric cached value {text:?}"))
                })?;
                values.push(v);
            }
        }
        series.push(SeriesData { name, values });
    }
    Ok(ChartData {
        categories: categories.unwrap_or_default(),
        series,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PART: &str = "word/charts/chart1.xml";

    fn existing_chart() -> String {
        let ser = |i: usize, name: &str| {
            format!(
                concat!(
                    r#"<c:ser><c:idx val="{i}"/><c:order val="{i}"/>"#,
                    r#"<c:tx><c:strRef><c:f>Sheet1!$B$1</c:f><c:strCache><c:ptCount val="1"/><c:pt idx="0"><c:v>{name}</c:v></c:pt></c:strCache></c:strRef></c:tx>"#,
                    r#"<c:spPr><a:solidFill><a:srgbClr val="4472C4"/></a:solidFill></c:spPr>"#,
                    r#"<c:invertIfNegative val="0"/>"#,
                    r#"<c:cat><c:strRef><c:f>Sheet1!$A$2:$A$4</c:f><c:strCache><c:ptCount val="3"/>"#,
                    r#"<c:pt idx="0"><c:v>A</c:v></c:pt><c:pt idx="1"><c:v>B</c:v></c:pt><c:pt idx="2"><c:v>C</c:v></c:pt>"#,
                    r#"</c:strCache></c:strRef></c:cat>"#,
                    r#"<c:val><c:numRef><c:f>Sheet1!$B$2:$B$4</c:f><c:numCache><c:formatCode>0.0%</c:formatCode><c:ptCount val="3"/>"#,
                    r#"<c:pt idx="0"><c:v>1.5</c:v></c:pt><c:pt idx="1"><c:v>2</c:v></c:pt><c:pt idx="2"><c:v>3</c:v></c:pt>"#,
                    r#"</c:numCache></c:numRef></c:val>"#,
                    r#"<c:extLst><c:ext uri="x"/></c:extLst></c:ser>"#
                ),
                i = i,
                name = name
            )
        };
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<c:chartSpace xmlns:c="urn:c" xmlns:a="urn:a" xmlns:r="urn:r"><c:chart><c:plotArea><c:barChart>"#,
                "{}{}{}",
                r#"</c:barChart></c:plotArea></c:chart><c:externalData r:id="rId3"><c:autoUpdate val="0"/></c:externalData></c:chartSpace>"#
            ),
            ser(0, "Old A"),
            ser(1, "Old B"),
            ser(2, "Old C")
        )
    }

    fn data() -> ChartData {
        ChartData::new(
            vec!["Q1".into(), "Q2 & more".into()],
            vec![
                SeriesData::new("Sales", vec![10.0, 20.0]),
                SeriesData::new("Cost", vec![7.25, -1.0]),
            ],
        )
    }

    #[test]
    fn rewrites_first_n_blocks_and_keeps_the_rest() {
        let src = existing_chart();
        let third_before = find_elements(&src, 0..src.len(), SER)[2].outer(&src).to_string();

        let out = rewrite_chart_caches(PART, &src, &data(), "Sheet1").expect("rewrite");
        assert_eq!(series_count(&out), 3);
        let blocks = find_elements(&out, 0..out.len(), SER);
        assert_eq!(blocks[2].outer(&out), third_before);

        let back = read_chart_caches(PART, &out).expect("read");
        assert_eq!(back.categories, vec!["Q1", "Q2 & more"]);
        assert_eq!(back.series[0], SeriesData::new("Sales", vec![10.0, 20.0]));
        assert_eq!(back.series[1], SeriesData::new("Cost", vec![7.25, -1.0]));
        assert_eq!(back.series[2].name, "Old C");
        assert_eq!(back.series[2].values, vec![1.5, 2.0, 3.0]);
    }

    #[test]
    fn cache_counts_and_formatting() {
        let out = rewrite_chart_caches(PART, &existing_chart(), &data(), "Sheet1").expect("rewrite");
        let first = find_elements(&out, 0..out.len(), SER)[0].outer(&out).to_string();
        assert!(first.contains(r#"<c:f>Sheet1!$A$2:$A$3</c:f><c:strCache><c:ptCount val="2"/>"#));
        assert!(first.contains(r#"<c:pt idx="1"><c:v>Q2 &amp; more</c:v></c:pt>"#));
        assert!(first.contains(r#"<c:pt idx="0"><c:v>10</c:v></c:pt><c:pt idx="1"><c:v>20</c:v></c:pt>"#));
        assert!(!first.contains("10.0"));
        // number format and formatting siblings survive
        assert!(first.contains("<c:formatCode>0.0%</c:formatCode>"));
        assert!(first.contains(r#"<a:srgbClr val="4472C4"/>"#));
        assert!(first.ends_with(r#"<c:extLst><c:ext uri="x"/></c:extLst></c:ser>"#));

        let second = find_elements(&out, 0..out.len(), SER)[1].outer(&out).to_string();
        assert!(second.contains("<c:f>Sheet1!$C$1</c:f>"));
        assert!(second.contains("<c:f>Sheet1!$C$2:$C$3</c:f>"));
        assert!(second.contains("<c:v>7.25</c:v>"));
    }

    #[test]
    fn more_series_than_blocks_is_structural() {
        let mut d = data();
        for i in 0..3 {
            d.series.push(SeriesData::new(format!("extra {i}"), vec![1.0, 2.0]));
        }
        let err = rewrite_chart_caches(PART, &existing_chart(), &d, "Sheet1").err().expect("error");
        assert!(matches!(err, PatchError::Structural { .. }));
    }

    #[test]
    fn skeleton_series_get_references_in_schema_order() {
        let src = r#"<c:chartSpace xmlns:c="urn:c"><c:lineChart><c:ser><c:idx val="0"/><c:order val="0"/><c:marker><c:symbol val="none"/></c:marker><c:smooth val="0"/></c:ser></c:lineChart></c:chartSpace>"#;
        let d = ChartData::new(vec!["x".into()], vec![SeriesData::new("s", vec![4.0])]);
        let out = rewrite_chart_caches(PART, src, &d, "'My Sheet'").expect("rewrite");
        let tx = out.find("<c:tx>").expect("tx");
        let marker = out.find("<c:marker>").expect("marker");
        let cat = out.find("<c:cat>").expect("cat");
        let val = out.find("<c:val>").expect("val");
        let smooth = out.find("<c:smooth").expect("smooth");
        assert!(tx < marker && marker < cat && cat < val && val < smooth);
        assert!(out.contains("<c:f>'My Sheet'!$B$1</c:f>"));
        assert!(out.contains("<c:formatCode>General</c:formatCode>"));
    }

    #[test]
    fn scatter_series_use_x_and_y_references() {
        let src = r#"<c:chartSpace xmlns:c="urn:c"><c:scatterChart><c:ser><c:idx val="0"/><c:order val="0"/><c:xVal><c:numRef><c:f>S!$A$2</c:f></c:numRef></c:xVal><c:yVal><c:numRef><c:f>S!$B$2</c:f></c:numRef></c:yVal></c:ser></c:scatterChart></c:chartSpace>"#;
        let d = ChartData::new(vec!["1".into()], vec![SeriesData::new("s", vec![4.0])]);
        let out = rewrite_chart_caches(PART, src, &d, "S").expect("rewrite");
        assert!(out.contains("<c:xVal><c:strRef>"));
        assert!(out.contains("<c:yVal><c:numRef>"));
        assert!(!out.contains("<c:cat>"));
        let back = read_chart_caches(PART, &out).expect("read");
        assert_eq!(back, d);
    }

    #[test]
    fn external_data_id_is_found() {
        assert_eq!(external_data_rel_id(&existing_chart()).as_deref(), Some("rId3"));
        assert_eq!(external_data_rel_id("<c:chartSpace/>"), None);
    }
}
