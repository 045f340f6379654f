use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::Deserialize;
use zip::CompressionMethod;

use crate::docx::chart::{ChartKind, LegendPosition, DEFAULT_HEIGHT_EMU, DEFAULT_WIDTH_EMU};
use crate::docx::session::StagingOptions;

pub const CONFIG_FILE_NAME: &str = "docx-patcher.toml";
pub const CONFIG_ENV_VAR: &str = "DOCX_PATCHER_CONFIG";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub staging: StagingSection,
    #[serde(default)]
    pub package: PackageSection,
    #[serde(default)]
    pub chart: ChartSection,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct StagingSection {
    /// Parent directory of session working trees. Relative paths resolve against the config
    /// file's directory.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct PackageSection {
    /// "deflated" (default) or "stored".
    #[serde(default)]
    pub compression: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ChartSection {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    /// r | l | t | b | none
    #[serde(default)]
    pub legend: Option<String>,
    #[serde(default)]
    pub width_emu: Option<u64>,
    #[serde(default)]
    pub height_emu: Option<u64>,
}

/// Chart settings used when the command line does not override them.
#[derive(Clone, Debug, PartialEq)]
pub struct ChartDefaults {
    pub kind: ChartKind,
    pub sheet_name: String,
    pub legend: Option<LegendPosition>,
    pub width_emu: u64,
    pub height_emu: u64,
}

impl Default for ChartDefaults {
    fn default() -> Self {
        Self {
            kind: ChartKind::default(),
            sheet_name: "Sheet1".to_string(),
            legend: Some(LegendPosition::Right),
            width_emu: DEFAULT_WIDTH_EMU,
            height_emu: DEFAULT_HEIGHT_EMU,
        }
    }
}

pub fn find_file_upwards(start_dir: &Path, filename: &str, max_levels: usize) -> Option<PathBuf> {
    let mut dir = start_dir;
    for _ in 0..=max_levels {
        let candidate = dir.join(filename);
        if candidate.exists() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

/// Config file to use when none is given on the command line: the environment variable, then an
/// upward search from `workdir`, then from the executable's directory.
pub fn find_default_config(workdir: &Path, filename: &str) -> Option<PathBuf> {
    if let Some(p) = std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from) {
        if p.is_file() {
            return Some(p);
        }
        log::warn!("{CONFIG_ENV_VAR} points at a missing file: {}", p.display());
    }
    if let Some(p) = find_file_upwards(workdir, filename, 8) {
        return Some(p);
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Some(p) = find_file_upwards(dir, filename, 10) {
                return Some(p);
            }
        }
    }
    None
}

pub fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&text).context("parse config toml")?;
    Ok(cfg)
}

const DEFAULT_CONFIG_TOML: &str = r#"# docx-patcher configuration

[staging]
# Parent directory of session working trees (default: system temp dir).
# temp_dir = "/tmp"
prefix = "docx-patcher-"

[package]
# "deflated" or "stored"
compression = "deflated"

[chart]
# bar | column | line | pie | area
kind = "column"
sheet_name = "Sheet1"
# r | l | t | b | none
legend = "r"
width_emu = 5486400
height_emu = 3200400
"#;

/// Writes a commented default config into `dir`, returning its path.
pub fn init_default_config(dir: &Path, force: bool) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create dir: {}", dir.display()))?;
    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() && !force {
        return Err(anyhow!(
            "config already exists: {} (use --force to overwrite)",
            path.display()
        ));
    }
    std::fs::write(&path, DEFAULT_CONFIG_TOML)
        .with_context(|| format!("write config: {}", path.display()))?;
    Ok(path)
}

impl AppConfig {
    pub fn staging_options(&self, config_path: Option<&Path>) -> anyhow::Result<StagingOptions> {
        let mut opts = StagingOptions::default();
        if let Some(dir) = self.staging.temp_dir.as_ref() {
            let config_dir = config_path
                .and_then(Path::parent)
                .unwrap_or_else(|| Path::new("."));
            opts.temp_dir = Some(if dir.is_relative() {
                config_dir.join(dir)
            } else {
                dir.clone()
            });
        }
        if let Some(prefix) = self.staging.prefix.as_deref().map(str::trim) {
            if !prefix.is_empty() {
                opts.prefix = prefix.to_string();
            }
        }
        if let Some(c) = self.package.compression.as_deref() {
            opts.compression = match c.trim().to_ascii_lowercase().as_str() {
                "deflated" | "deflate" => CompressionMethod::Deflated,
                "stored" | "store" | "none" => CompressionMethod::Stored,
                other => return Err(anyhow!("unknown package compression: {other}")),
            };
        }
        Ok(opts)
    }

    pub fn chart_defaults(&self) -> anyhow::Result<ChartDefaults> {
        let mut out = ChartDefaults::default();
        let c = &self.chart;
        if let Some(kind) = c.kind.as_deref() {
            out.kind = kind.parse().map_err(|e: String| anyhow!(e))?;
        }
        if let Some(name) = c.sheet_name.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            out.sheet_name = name.to_string();
        }
        if let Some(legend) = c.legend.as_deref() {
            out.legend = parse_legend(legend)?;
        }
        if let Some(w) = c.width_emu {
            out.width_emu = w;
        }
        if let Some(h) = c.height_emu {
            out.height_emu = h;
        }
        Ok(out)
    }
}

/// `none` hides the legend.
pub fn parse_legend(s: &str) -> anyhow::Result<Option<LegendPosition>> {
    if s.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|e: String| anyhow!(e))
}
