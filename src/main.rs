use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;

use docx_patcher::config::{
    find_default_config, init_default_config, load_config, parse_legend, AppConfig, ChartDefaults,
    CONFIG_FILE_NAME,
};
use docx_patcher::docx::chart::{
    copy_chart, create_chart, list_charts, read_chart_data, update_chart, ChartData, ChartKind,
    ChartOptions,
};
use docx_patcher::docx::session::{PackageSession, StagingOptions};
use docx_patcher::docx::splice::{insert_into_document, insert_page_break, InsertPosition};
use docx_patcher::progress::ConsoleLogger;

#[derive(Parser, Debug)]
#[command(name = "docx-patcher")]
#[command(about = "Patch charts and content of DOCX packages in place", long_about = None)]
struct Args {
    /// Config file path (default: $DOCX_PATCHER_CONFIG, or search for docx-patcher.toml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Only print errors and command output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Log every step
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default docx-patcher.toml, then exit
    InitConfig {
        /// Directory to write the config to (default: current directory)
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Print the indices of the charts in a document
    ListCharts {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
    },

    /// Print the cached data of a chart as JSON
    ShowChart {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
        /// 1-based chart index
        #[arg(long)]
        chart: u32,
    },

    /// Replace the data of a chart and its workbook
    UpdateChart {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
        #[arg(long)]
        chart: u32,
        /// Chart data JSON: {"categories": [...], "series": [{"name": ..., "values": [...]}]}
        #[arg(long, value_name = "JSON")]
        data: PathBuf,
        #[command(flatten)]
        out: OutputArgs,
    },

    /// Add a new chart with its own workbook
    CreateChart {
        /// Document to add the chart to (omit with --new)
        #[arg(value_name = "DOCX", required_unless_present = "new")]
        input: Option<PathBuf>,
        /// Start from a blank document
        #[arg(long, conflicts_with = "input")]
        new: bool,
        #[arg(long, value_name = "JSON")]
        data: PathBuf,
        /// bar | column | line | pie | area
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        x_title: Option<String>,
        #[arg(long)]
        y_title: Option<String>,
        /// r | l | t | b | none
        #[arg(long)]
        legend: Option<String>,
        #[arg(long)]
        sheet_name: Option<String>,
        #[command(flatten)]
        position: PositionArgs,
        #[command(flatten)]
        out: OutputArgs,
    },

    /// Duplicate a chart and its workbook after the paragraph containing TEXT
    CopyChart {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
        #[arg(long)]
        chart: u32,
        #[arg(long, value_name = "TEXT")]
        after: String,
        #[command(flatten)]
        out: OutputArgs,
    },

    /// Insert a markup fragment (one or more complete body elements) into the document
    Insert {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
        #[arg(long, value_name = "XML")]
        fragment: PathBuf,
        #[command(flatten)]
        position: PositionArgs,
        #[command(flatten)]
        out: OutputArgs,
    },

    /// Insert a page break paragraph
    PageBreak {
        #[arg(value_name = "DOCX")]
        input: PathBuf,
        #[command(flatten)]
        position: PositionArgs,
        #[command(flatten)]
        out: OutputArgs,
    },
}

#[derive(ClapArgs, Debug)]
struct PositionArgs {
    /// Insert after the paragraph containing TEXT
    #[arg(long, value_name = "TEXT", conflicts_with_all = ["before", "at_start"])]
    after: Option<String>,
    /// Insert before the paragraph containing TEXT
    #[arg(long, value_name = "TEXT", conflicts_with = "at_start")]
    before: Option<String>,
    /// Insert at the start of the document (default: end)
    #[arg(long)]
    at_start: bool,
}

impl PositionArgs {
    fn position(&self) -> InsertPosition {
        if let Some(a) = &self.after {
            InsertPosition::AfterAnchor(a.clone())
        } else if let Some(b) = &self.before {
            InsertPosition::BeforeAnchor(b.clone())
        } else if self.at_start {
            InsertPosition::DocumentStart
        } else {
            InsertPosition::DocumentEnd
        }
    }
}

#[derive(ClapArgs, Debug)]
struct OutputArgs {
    /// Output .docx (default: <input_stem>_patched.docx)
    #[arg(short, long, value_name = "DOCX")]
    output: Option<PathBuf>,
}

impl OutputArgs {
    fn resolve(&self, input: Option<&Path>) -> anyhow::Result<PathBuf> {
        if let Some(p) = &self.output {
            return Ok(p.clone());
        }
        let input = input.context("missing -o/--output")?;
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output")
            .to_string();
        Ok(input.with_file_name(format!("{stem}_patched.docx")))
    }
}

fn read_chart_data_json(path: &Path) -> anyhow::Result<ChartData> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read chart data: {}", path.display()))?;
    let data: ChartData = serde_json::from_str(&text)
        .with_context(|| format!("parse chart data json: {}", path.display()))?;
    Ok(data)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serialize output")?);
    Ok(())
}

/// Opens `input`, applies `f`, saves to `output` and removes the working tree.
fn patch<T>(
    input: &Path,
    output: &Path,
    staging: &StagingOptions,
    f: impl FnOnce(&PackageSession) -> docx_patcher::error::Result<T>,
) -> anyhow::Result<T> {
    let mut session =
        PackageSession::open(input, staging).with_context(|| format!("open {}", input.display()))?;
    let out = f(&session)?;
    session
        .save(output)
        .with_context(|| format!("save {}", output.display()))?;
    session.close()?;
    log::info!("wrote {}", output.display());
    Ok(out)
}

fn load_app_config(explicit: Option<PathBuf>) -> anyhow::Result<(AppConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(p) => Some(p),
        None => {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            find_default_config(&cwd, CONFIG_FILE_NAME)
        }
    };
    match path {
        Some(p) => {
            let cfg = load_config(&p)?;
            log::debug!("config: {}", p.display());
            Ok((cfg, Some(p)))
        }
        None => Ok((AppConfig::default(), None)),
    }
}

fn chart_options(
    defaults: &ChartDefaults,
    data: ChartData,
    kind: Option<&str>,
    legend: Option<&str>,
    sheet_name: Option<String>,
) -> anyhow::Result<ChartOptions> {
    let mut opts = ChartOptions::new(data);
    opts.spec.kind = match kind {
        Some(k) => k.parse::<ChartKind>().map_err(|e| anyhow!(e))?,
        None => defaults.kind,
    };
    opts.spec.legend = match legend {
        Some(l) => parse_legend(l)?,
        None => defaults.legend,
    };
    opts.sheet_name = sheet_name.unwrap_or_else(|| defaults.sheet_name.clone());
    opts.width_emu = defaults.width_emu;
    opts.height_emu = defaults.height_emu;
    Ok(opts)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    ConsoleLogger::install(args.quiet, args.verbose).context("install logger")?;

    if let Command::InitConfig { dir, force } = &args.command {
        let dir = dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, *force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let (cfg, cfg_path) = load_app_config(args.config.clone())?;
    let staging = cfg.staging_options(cfg_path.as_deref())?;

    match args.command {
        Command::InitConfig { .. } => unreachable!("handled above"),
        Command::ListCharts { input } => {
            let mut session = PackageSession::open(&input, &staging)?;
            let charts = list_charts(&session)?;
            session.close()?;
            print_json(&charts)?;
        }
        Command::ShowChart { input, chart } => {
            let mut session = PackageSession::open(&input, &staging)?;
            let data = read_chart_data(&session, chart)?;
            session.close()?;
            print_json(&data)?;
        }
        Command::UpdateChart {
            input,
            chart,
            data,
            out,
        } => {
            let data = read_chart_data_json(&data)?;
            let output = out.resolve(Some(&input))?;
            let update = patch(&input, &output, &staging, |s| update_chart(s, chart, &data))?;
            print_json(&update)?;
        }
        Command::CreateChart {
            input,
            new,
            data,
            kind,
            title,
            x_title,
            y_title,
            legend,
            sheet_name,
            position,
            out,
        } => {
            let defaults = cfg.chart_defaults()?;
            let data = read_chart_data_json(&data)?;
            let mut opts = chart_options(&defaults, data, kind.as_deref(), legend.as_deref(), sheet_name)?;
            opts.spec.title = title;
            opts.spec.x_axis_title = x_title;
            opts.spec.y_axis_title = y_title;
            opts.position = position.position();

            let output = out.resolve(input.as_deref())?;
            let created = match (input, new) {
                (Some(input), false) => patch(&input, &output, &staging, |s| create_chart(s, &opts))?,
                _ => {
                    let mut session = PackageSession::create_blank(&staging)?;
                    let created = create_chart(&session, &opts)?;
                    session
                        .save(&output)
                        .with_context(|| format!("save {}", output.display()))?;
                    session.close()?;
                    log::info!("wrote {}", output.display());
                    created
                }
            };
            print_json(&created)?;
        }
        Command::CopyChart {
            input,
            chart,
            after,
            out,
        } => {
            let output = out.resolve(Some(&input))?;
            let copied = patch(&input, &output, &staging, |s| copy_chart(s, chart, &after))?;
            print_json(&copied)?;
        }
        Command::Insert {
            input,
            fragment,
            position,
            out,
        } => {
            let fragment = std::fs::read_to_string(&fragment)
                .with_context(|| format!("read fragment: {}", fragment.display()))?;
            let output = out.resolve(Some(&input))?;
            let at = position.position();
            patch(&input, &output, &staging, |s| insert_into_document(s, &fragment, &at))?;
        }
        Command::PageBreak {
            input,
            position,
            out,
        } => {
            let output = out.resolve(Some(&input))?;
            let at = position.position();
            patch(&input, &output, &staging, |s| insert_page_break(s, &at))?;
        }
    }
    Ok(())
}
