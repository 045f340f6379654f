//! Charts embedded in a document and the workbooks that back them.
//!
//! A chart is stored twice: as display caches inside `word/charts/chartN.xml` and as a cell
//! grid inside an embedded workbook under `word/embeddings/`. Every operation here rewrites
//! both from the same [`ChartData`] so they never disagree.

mod cache;
mod shared_strings;
mod sync;
mod template;
mod workbook;

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{PatchError, Result};

pub use cache::{external_data_rel_id, read_chart_caches, rewrite_chart_caches, series_count};
pub use shared_strings::SharedStrings;
pub use sync::{
    copy_chart, create_chart, list_charts, read_chart_data, resolve_workbook, update_chart,
    ChartCopied, ChartCreated, ChartOptions, ChartUpdate, ResolvedVia, WorkbookResolution,
    DEFAULT_HEIGHT_EMU, DEFAULT_WIDTH_EMU,
};
pub use template::{chart_part_xml, ChartKind, ChartSpec, LegendPosition};
pub use workbook::{new_workbook, read_workbook_grid, rewrite_workbook, WorkbookEdit};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesData {
    pub name: String,
    pub values: Vec<f64>,
}

impl SeriesData {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChartData {
    pub categories: Vec<String>,
    pub series: Vec<SeriesData>,
}

/// First character XML 1.0 cannot carry, even escaped.
pub fn xml_illegal_char(s: &str) -> Option<char> {
    s.chars().find(|&c| {
        (c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r')) || c == '\u{FFFE}' || c == '\u{FFFF}'
    })
}

fn check_text(what: &str, text: &str) -> Result<()> {
    match xml_illegal_char(text) {
        Some(c) => Err(PatchError::Validation(format!(
            "{what} {text:?} contains character U+{:04X}, which XML cannot hold",
            u32::from(c)
        ))),
        None => Ok(()),
    }
}

impl ChartData {
    pub fn new(categories: Vec<String>, series: Vec<SeriesData>) -> Self {
        Self { categories, series }
    }

    /// Rejects data that cannot be written consistently to both the chart and its workbook.
    pub fn validate(&self) -> Result<()> {
        if self.categories.is_empty() {
            return Err(PatchError::Validation("categories must not be empty".into()));
        }
        if self.series.is_empty() {
            return Err(PatchError::Validation("at least one series is required".into()));
        }
        for c in &self.categories {
            check_text("category", c)?;
        }
        for (i, s) in self.series.iter().enumerate() {
            check_text("series name", &s.name)?;
            if s.name.trim().is_empty() {
                return Err(PatchError::Validation(format!("series {} has a blank name", i + 1)));
            }
            if s.values.len() != self.categories.len() {
                return Err(PatchError::Validation(format!(
                    "series {:?} has {} values for {} categories",
                    s.name,
                    s.values.len(),
                    self.categories.len()
                )));
            }
            if let Some(bad) = s.values.iter().find(|v| !v.is_finite()) {
                return Err(PatchError::Validation(format!(
                    "series {:?} contains non-finite value {bad}",
                    s.name
                )));
            }
        }
        Ok(())
    }
}

/// Number text as written to caches and cells: integers without a fractional part, everything
/// else in the shortest form that parses back to the same value.
pub fn format_number(v: f64) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    if v.fract() == 0.0 && v.abs() < 1e15 {
        return format!("{}", v as i64);
    }
    format!("{v}")
}

/// Spreadsheet column letters for a 0-based column index (`0` -> `A`, `27` -> `AB`).
pub fn column_name(mut col: usize) -> String {
    let mut out = Vec::new();
    loop {
        out.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Names a formula parser would read as an A1 or R1C1 reference.
static CELL_LIKE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:[a-z]{1,3}\d+|r\d*c\d*|r\d*|c\d*)$").expect("valid cell reference regex")
});

/// Sheet name as it appears in a formula, quoted when it is not a plain identifier or could be
/// mistaken for a reference or a boolean.
pub fn sheet_formula_name(sheet: &str) -> String {
    let plain = sheet
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && sheet.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !CELL_LIKE_RE.is_match(sheet)
        && !sheet.eq_ignore_ascii_case("true")
        && !sheet.eq_ignore_ascii_case("false");
    if plain {
        sheet.to_string()
    } else {
        format!("'{}'", sheet.replace('\'', "''"))
    }
}

impl FromStr for ChartKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bar" => Ok(Self::Bar),
            "column" | "col" => Ok(Self::Column),
            "line" => Ok(Self::Line),
            "pie" => Ok(Self::Pie),
            "area" => Ok(Self::Area),
            other => Err(format!("unknown chart kind: {other}")),
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bar => "bar",
            Self::Column => "column",
            Self::Line => "line",
            Self::Pie => "pie",
            Self::Area => "area",
        })
    }
}

impl FromStr for LegendPosition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "right" => Ok(Self::Right),
            "l" | "left" => Ok(Self::Left),
            "t" | "top" => Ok(Self::Top),
            "b" | "bottom" => Ok(Self::Bottom),
            other => Err(format!("unknown legend position: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChartData {
        ChartData::new(
            vec!["Q1".into(), "Q2".into()],
            vec![SeriesData::new("Sales", vec![10.0, 20.0])],
        )
    }

    #[test]
    fn validation_rejects_each_malformed_shape() {
        assert!(sample().validate().is_ok());

        let mut d = sample();
        d.categories.clear();
        d.series[0].values.clear();
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.series.clear();
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.series[0].name = "  ".into();
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.categories.push("Q3".into());
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.series[0].values[1] = f64::NAN;
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.categories[1] = "Q\u{1}2".into();
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.series[0].name = "Sales\u{FFFF}".into();
        assert!(matches!(d.validate(), Err(PatchError::Validation(_))));

        let mut d = sample();
        d.categories[0] = "Q1\tnorth\r\n".into();
        assert!(d.validate().is_ok());
    }

    #[test]
    fn numbers_format_without_trailing_zero_fraction() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(-3.0), "-3");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!("0.1".parse::<f64>().ok(), Some(0.1));
    }

    #[test]
    fn column_names() {
        assert_eq!(column_name(0), "A");
        assert_eq!(column_name(25), "Z");
        assert_eq!(column_name(26), "AA");
        assert_eq!(column_name(27), "AB");
        assert_eq!(column_name(701), "ZZ");
        assert_eq!(column_name(702), "AAA");
    }

    #[test]
    fn sheet_names_are_quoted_when_needed() {
        assert_eq!(sheet_formula_name("Sheet1"), "Sheet1");
        assert_eq!(sheet_formula_name("My Data"), "'My Data'");
        assert_eq!(sheet_formula_name("Bob's"), "'Bob''s'");
        assert_eq!(sheet_formula_name("2024"), "'2024'");
        assert_eq!(sheet_formula_name("FY24"), "'FY24'");
        assert_eq!(sheet_formula_name("Q1"), "'Q1'");
        assert_eq!(sheet_formula_name("R1C1"), "'R1C1'");
        assert_eq!(sheet_formula_name("r"), "'r'");
        assert_eq!(sheet_formula_name("TRUE"), "'TRUE'");
        assert_eq!(sheet_formula_name("Data"), "Data");
        assert_eq!(sheet_formula_name("Revenue2024"), "Revenue2024");
    }

    #[test]
    fn kinds_parse_from_config_strings() {
        assert_eq!("Column".parse::<ChartKind>(), Ok(ChartKind::Column));
        assert_eq!("bottom".parse::<LegendPosition>(), Ok(LegendPosition::Bottom));
        assert!("radar".parse::<ChartKind>().is_err());
    }
}
