use std::collections::HashMap;
use std::process::Command;

use chrono::{DateTime, Local};
use color_eyre::eyre::{bail, WrapErr as _};
use derive_more::derive::{Deref, Display, Into};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::job::{column, JobId, JobRecord};
use crate::misc::parsing::{Megabytes, Quantity, Seconds};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, Display, Into, Serialize)]
pub struct SlurmUser(pub String);

impl From<&str> for SlurmUser {
    fn from(value: &str) -> Self {
        SlurmUser(value.to_owned())
    }
}

/// Use `%+` format specifier (ISO 8601 / RFC 3339,`2001-07-08T00:34:60.026490+09:30`) then cut off
/// the `+xx:yy` end (slurm don't like).
///
/// slurm takes _local_ time, not UTC
pub fn format_datetime_for_slurm(date: DateTime<Local>) -> String {
    const FMT: &str = "%Y-%m-%dT%H:%M:%S";
    // ISO 8601 / RFC 3339
    date.format(FMT).to_string()
}

/// Given output from `sacct -P`, parses it into a line vector consisting of HashMaps. This works by taking the first line as header.
///
/// Returns a (header, data) tuple
pub fn sacct_csvlike(input: impl AsRef<str>) -> Result<(Vec<String>, Vec<Result<HashMap<String, String>>>)> {
    let input = input.as_ref();
    let mut lines = input.lines();
    let Some(header) = lines.next().filter(|header| !header.trim().is_empty()) else {
        return Err(Error::malformed("no header line"));
    };
    let header = header.split('|').map(String::from).collect_vec();

    let data = lines
        .enumerate()
        .filter(|(_, line)| !line.is_empty())
        .map(|(line_number, line)| {
            line.split('|')
                .enumerate()
                .map(|(i, field)| match header.get(i) {
                    Some(key) => Ok((String::from(key), String::from(field))),
                    None => Err(Error::malformed(format!("line {}: too many fields", line_number + 2))),
                })
                .process_results(|iter| iter.collect::<HashMap<_, _>>())
        })
        .collect_vec();

    Ok((header, data))
}

/// Turns `sacct -P` output into records, in fetch order. Bad rows are logged and skipped so one
/// odd job doesn't take the report down.
#[instrument(skip_all)]
pub fn parse_accounting(input: &str) -> Result<Vec<JobRecord>> {
    let (header, rows) = sacct_csvlike(input)?;
    if !header.iter().any(|key| key == column::JOB_ID) {
        return Err(Error::MissingColumn(column::JOB_ID));
    }

    let records = rows
        .into_iter()
        .filter_map(|row| match row.and_then(|row| JobRecord::from_sacct_row(&row)) {
            Ok(record) => Some(record),
            Err(error) => {
                warn!(%error, "skipping accounting row");
                None
            }
        })
        .collect_vec();
    debug!(records = records.len(), "parsed accounting rows");
    Ok(records)
}

/// Which jobs to ask the accounting database for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountingQuery {
    pub user: Option<SlurmUser>,
    pub all_users: bool,
    pub accounts: Vec<String>,
    pub jobs: Vec<String>,
    pub states: Vec<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl AccountingQuery {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-P".to_owned(),
            "--units=M".to_owned(),
            format!("--format={}", column::ALL.join(",")),
        ];
        if self.all_users {
            args.push("-a".to_owned());
        } else if let Some(user) = &self.user {
            args.extend(["-u".to_owned(), user.0.clone()]);
        }
        for (flag, values) in [("-A", &self.accounts), ("-j", &self.jobs), ("-s", &self.states)] {
            if !values.is_empty() {
                args.extend([flag.to_owned(), values.join(",")]);
            }
        }
        for (flag, value) in [("-S", &self.start), ("-E", &self.end)] {
            if let Some(value) = value {
                args.extend([flag.to_owned(), value.clone()]);
            }
        }
        args
    }
}

/// Source of raw `sacct -P` text
pub trait AccountingSource {
    fn fetch(&self, query: &AccountingQuery) -> Result<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sacct;

impl AccountingSource for Sacct {
    #[instrument(skip(self))]
    fn fetch(&self, query: &AccountingQuery) -> Result<String> {
        const COMMAND: &str = "sacct";
        let args = query.to_args();
        debug!(?args, "querying accounting");

        let output = Command::new(COMMAND).args(&args).output().map_err(|source| Error::Spawn {
            command: COMMAND.to_owned(),
            source,
        })?;

        if !output.status.success() {
            return Err(Error::UpstreamFailure {
                command: COMMAND.to_owned(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Usage of a job that is still running. Either half may be missing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LiveSample {
    pub cpu_time: Option<Seconds>,
    pub max_rss: Option<Megabytes>,
}

/// Live usage of a running job, `None` if it can't be had
pub trait LiveStatus {
    fn sample(&self, job: &JobId) -> Option<LiveSample>;
}

/// For runs that never look at running jobs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLiveStatus;

impl LiveStatus for NoLiveStatus {
    fn sample(&self, _job: &JobId) -> Option<LiveSample> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sstat;

impl Sstat {
    const FORMAT: &'static str = "--format=JobID,AveCPU,NTasks,MaxRSS";
}

impl LiveStatus for Sstat {
    #[instrument(skip(self), fields(job = %job))]
    fn sample(&self, job: &JobId) -> Option<LiveSample> {
        let output = Command::new("sstat")
            .args(["-a", "-n", "-P", Self::FORMAT, "-j", job.as_str()])
            .output()
            .inspect_err(|error| debug!(%error, "could not run sstat"))
            .ok()?;

        if !output.status.success() {
            debug!(
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "sstat failed"
            );
            return None;
        }

        parse_sstat(&String::from_utf8_lossy(&output.stdout))
            .inspect_err(|error| debug!("{error:#}"))
            .ok()
    }
}

/// `JobID|AveCPU|NTasks|MaxRSS` per running step. CPU time adds up over steps (`AveCPU` is per
/// task), memory is the largest step. `MaxRSS` arrives in K and gets rescaled.
pub fn parse_sstat(output: &str) -> color_eyre::Result<LiveSample> {
    let mut sample = LiveSample::default();

    for (i, line) in output.trim().lines().enumerate() {
        let fields = line.split('|').collect_vec();
        let &[_step, ave_cpu, tasks, max_rss] = fields.as_slice() else {
            bail!("line {i}: (expected `step|avecpu|ntasks|maxrss`, got {line})");
        };

        if let Ok(ave_cpu) = Seconds::parse(ave_cpu) {
            let tasks = match tasks.trim() {
                "" => 1,
                tasks => tasks.parse::<u32>().wrap_err_with(|| format!("line {i}, parsing task count"))?,
            };
            let step_cpu = Seconds(ave_cpu.0 * f64::from(tasks));
            sample.cpu_time = Some(sample.cpu_time.unwrap_or_default() + step_cpu);
        }

        let rss = Quantity::parse(max_rss).wrap_err_with(|| format!("line {i}, parsing MaxRSS"))?;
        if let Some(rss) = rss.map(|rss| rss.amount) {
            sample.max_rss = Some(sample.max_rss.map_or(rss, |max| if rss > max { rss } else { max }));
        }
    }

    Ok(sample)
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use color_eyre::Result;

    use super::*;
    use crate::job::JobState;

    const ε: f64 = 0.0000000001;

    #[test]
    fn sacct_csvlike__header_keys() -> Result<()> {
        let (header, rows) = sacct_csvlike("JobID|State\n1|RUNNING\n1.batch|RUNNING\n")?;
        assert_eq!(header, ["JobID", "State"]);
        assert_eq!(rows.len(), 2);
        let first = rows.into_iter().next().unwrap()?;
        assert_eq!(first["State"], "RUNNING");
        Ok(())
    }

    #[test]
    fn sacct_csvlike__too_many_fields() -> Result<()> {
        let (_, rows) = sacct_csvlike("JobID\n1|extra")?;
        assert!(matches!(rows.as_slice(), [Err(Error::MalformedTable(_))]));
        Ok(())
    }

    #[test]
    fn sacct_csvlike__empty() {
        assert!(sacct_csvlike("").is_err());
    }

    #[test]
    fn parse_accounting__skips_bad_rows() -> Result<()> {
        let input = "JobID|JobName|State\n1|ok|COMPLETED\n|noid|COMPLETED\n2|x|FAILED|surplus\n3|also ok|TIMEOUT\n";
        let records = parse_accounting(input)?;
        let ids = records.iter().map(|record| record.id.as_str()).collect_vec();
        assert_eq!(ids, ["1", "3"]);
        assert_eq!(records[1].state, JobState::Timeout);
        Ok(())
    }

    #[test]
    fn parse_accounting__needs_job_id_column() {
        assert!(matches!(parse_accounting("JobName|State\n"), Err(Error::MissingColumn(_))));
    }

    #[test]
    fn AccountingQuery__to_args() {
        let query = AccountingQuery {
            user: Some(SlurmUser::from("alice")),
            jobs: vec!["12".to_owned(), "13".to_owned()],
            start: Some("2024-01-01T00:00:00".to_owned()),
            ..Default::default()
        };
        let args = query.to_args();
        assert_eq!(&args[..2], ["-P", "--units=M"]);
        assert!(args[2].starts_with("--format=JobID,JobName,ReqMem,MaxRSS"));
        assert_eq!(&args[3..], ["-u", "alice", "-j", "12,13", "-S", "2024-01-01T00:00:00"]);

        let everyone = AccountingQuery {
            user: Some(SlurmUser::from("alice")),
            all_users: true,
            ..Default::default()
        };
        assert_eq!(&everyone.to_args()[3..], ["-a"]);
    }

    #[test]
    fn parse_sstat__sums_cpu_and_maxes_memory() -> Result<()> {
        let sample = parse_sstat("55.batch|00:10:00|1|2048K\n55.0|00:05:00|4|512000K\n")?;
        let cpu = sample.cpu_time.unwrap();
        assert!((cpu.0 - 1800.0).abs() < ε);
        let rss = sample.max_rss.unwrap();
        assert!((rss.0 - 512.0).abs() < ε);
        Ok(())
    }

    #[test]
    fn parse_sstat__partial_fields() -> Result<()> {
        let sample = parse_sstat("55.0||1|\n")?;
        assert_eq!(sample, LiveSample::default());
        assert!(parse_sstat("55.0|garbage").is_err());
        Ok(())
    }
}
