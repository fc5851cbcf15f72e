mod cli;
mod config;
mod output;

use std::io::{self, IsTerminal as _};

use clap::Parser as _;
use color_eyre::eyre::{Result, WrapErr as _};
use color_eyre::{Section as _, SectionExt as _};
use tracing::{debug, info, Level};

use crate::cli::Args;
use crate::config::Settings;
use jobstats_data::report::{RenderOptions, Report, ReportOptions};
use jobstats_data::slurm::{parse_accounting, AccountingSource as _, NoLiveStatus, Sacct, Sstat};
use jobstats_data::Error;

/// Used when the terminal width can't be detected
const DEFAULT_WIDTH: usize = 120;

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    register_logging(args.log_level())?;

    let settings = Settings::load(args.config.as_deref()).wrap_err("loading configuration")?;
    debug!(?settings, "configuration");

    let query = args.accounting_query();
    info!(?query, "fetching accounting data");
    let raw = Sacct.fetch(&query).map_err(with_stderr)?;
    let records = parse_accounting(&raw)?;

    let options = ReportOptions {
        rollup: settings.rollup_options(args.children, args.running),
        grading: settings.grading_options(args.gpu),
    };
    let report = match args.running {
        true => Report::build(records, &options, &Sstat),
        false => Report::build(records, &options, &NoLiveStatus),
    };

    let render = RenderOptions {
        parsable: args.parsable,
        max_width: max_width(&args),
    };
    let lines = match args.by_user {
        true => report.render_by_owner(&render),
        false => report.render(&render),
    };

    let stdout = io::stdout();
    let colored = !args.parsable && !args.no_color && stdout.is_terminal();
    output::write_lines(&mut stdout.lock(), &lines, colored).wrap_err("writing report")
}

/// A failing `sacct` gets its own stderr attached, as-is
fn with_stderr(error: Error) -> color_eyre::Report {
    let stderr = match &error {
        Error::UpstreamFailure { stderr, .. } if !stderr.is_empty() => Some(stderr.clone()),
        _ => None,
    };
    let report = color_eyre::Report::new(error);
    match stderr {
        Some(stderr) => report.note(stderr.header("Stderr:")),
        None => report,
    }
}

fn max_width(args: &Args) -> Option<usize> {
    if args.parsable || args.no_width_limit {
        return None;
    }
    if let Some(width) = args.width {
        return Some(width);
    }
    let columns = crossterm::terminal::size()
        .map(|(columns, _rows)| usize::from(columns))
        .inspect_err(|error| debug!(%error, "no terminal size"))
        .ok()
        .filter(|&columns| columns > 0);
    Some(columns.unwrap_or(DEFAULT_WIDTH))
}

fn register_logging(level: Level) -> Result<()> {
    // stdout is reserved for the report
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).wrap_err("setting default subscriber failed")
}
