use std::path::PathBuf;

use chrono::{Local, NaiveTime};
use clap::{ArgAction, Parser};
use tracing::Level;

use jobstats_data::slurm::{format_datetime_for_slurm, AccountingQuery, SlurmUser};

/// Efficiency report for Slurm jobs: memory, CPU, time and GPU usage against what was requested
#[derive(Debug, Clone, PartialEq, Parser)]
#[command(version, about)]
pub struct Args {
    /// Whose jobs to report
    #[arg(short, long, env = "USER")]
    pub user: Option<String>,

    /// Report the jobs of every user
    #[arg(short, long)]
    pub all_users: bool,

    /// Only jobs charged to these accounts
    #[arg(short = 'A', long = "account", value_delimiter = ',')]
    pub accounts: Vec<String>,

    /// Only these job ids
    #[arg(short, long, value_delimiter = ',')]
    pub jobs: Vec<String>,

    /// Only jobs in these states, as understood by `sacct`
    #[arg(short, long = "state", value_delimiter = ',')]
    pub states: Vec<String>,

    /// Start of the window [default: midnight today, or everything with --jobs]
    #[arg(short = 'S', long)]
    pub starttime: Option<String>,

    /// End of the window [default: now]
    #[arg(short = 'E', long)]
    pub endtime: Option<String>,

    /// Sample the usage of running jobs with `sstat`
    #[arg(short, long)]
    pub running: bool,

    /// Show job steps as rows of their own
    #[arg(long)]
    pub children: bool,

    /// Include GPU usage
    #[arg(short, long)]
    pub gpu: bool,

    /// `|` separated output without colours or truncation
    #[arg(short, long)]
    pub parsable: bool,

    #[arg(short, long)]
    pub no_color: bool,

    /// Maximum line width [default: terminal width]
    #[arg(short, long)]
    pub width: Option<usize>,

    /// Never truncate
    #[arg(short = 'W', long)]
    pub no_width_limit: bool,

    /// One summary row per user instead of one row per job
    #[arg(long)]
    pub by_user: bool,

    /// Configuration file, read after /etc/jobstats/config.toml
    #[arg(short, long, env = "JOBSTATS_CONFIG")]
    pub config: Option<PathBuf>,

    /// More log output on stderr, repeatable
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    pub fn accounting_query(&self) -> AccountingQuery {
        // `sacct` itself looks at all time when asked for job ids
        let start = match (&self.starttime, self.jobs.is_empty()) {
            (Some(start), _) => Some(start.clone()),
            (None, true) => Some(local_midnight()),
            (None, false) => None,
        };

        AccountingQuery {
            user: self.user.as_deref().map(SlurmUser::from),
            all_users: self.all_users,
            accounts: self.accounts.clone(),
            jobs: self.jobs.clone(),
            states: self.states.clone(),
            start,
            end: self.endtime.clone(),
        }
    }
}

fn local_midnight() -> String {
    let now = Local::now();
    let midnight = now
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(Local)
        .earliest()
        .unwrap_or(now);
    format_datetime_for_slurm(midnight)
}
