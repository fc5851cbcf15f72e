use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use derive_builder::Builder;
use derive_more::derive::{Deref, Display, Into};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::misc::parsing::{Megabytes, Quantity, Scope, Seconds};
use crate::slurm::SlurmUser;

/// Separates a job id from its step name (`123.batch`, `123.0`)
pub const STEP_SEPARATOR: char = '.';

/// Column names as requested from `sacct --format=…`
pub mod column {
    pub const JOB_ID: &str = "JobID";
    pub const NAME: &str = "JobName";
    pub const REQ_MEM: &str = "ReqMem";
    pub const MAX_RSS: &str = "MaxRSS";
    pub const REQ_CPUS: &str = "ReqCPUS";
    pub const TOTAL_CPU: &str = "TotalCPU";
    pub const TIME_LIMIT: &str = "Timelimit";
    pub const ELAPSED: &str = "Elapsed";
    pub const STATE: &str = "State";
    pub const USER: &str = "User";
    pub const ADMIN_COMMENT: &str = "AdminComment";

    pub const ALL: [&str; 11] = [
        JOB_ID,
        NAME,
        REQ_MEM,
        MAX_RSS,
        REQ_CPUS,
        TOTAL_CPU,
        TIME_LIMIT,
        ELAPSED,
        STATE,
        USER,
        ADMIN_COMMENT,
    ];
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deref, Display, Into, Serialize)]
pub struct JobId(pub String);

impl JobId {
    /// `123` for `123.batch`. Array indices (`123_4`) stay part of the top level id.
    pub fn top_level(&self) -> &str {
        self.0.split_once(STEP_SEPARATOR).map_or(self.0.as_str(), |(job, _)| job)
    }

    pub fn is_step(&self) -> bool {
        self.0.contains(STEP_SEPARATOR)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_owned())
    }
}

/// Whether a rendered cell is a step id such as `4711.batch`, `4711_3.extern` or `4711.0`
pub fn is_step_label(cell: &str) -> bool {
    let Some((job, step)) = cell.split_once(STEP_SEPARATOR) else {
        return false;
    };
    let job_like = !job.is_empty() && job.chars().all(|c| c.is_ascii_digit() || matches!(c, '_' | '[' | ']' | '-' | ','));
    let step_like = match step.chars().next() {
        Some(first) if first.is_ascii_alphabetic() => step.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+')),
        Some(_) => step.chars().all(|c| c.is_ascii_digit()),
        None => false,
    };
    job_like && step_like
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    #[default]
    Pending,
    Other(String),
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::Timeout => "TIMEOUT",
            JobState::OutOfMemory => "OUT_OF_MEMORY",
            JobState::Pending => "PENDING",
            JobState::Other(state) => state,
        }
    }

    /// Cut short, killed or not yet started jobs still get rendered but stay out of the fleet
    /// tallies
    pub fn counts_toward_fleet(&self) -> bool {
        !matches!(
            self,
            JobState::Cancelled | JobState::OutOfMemory | JobState::Failed | JobState::Timeout | JobState::Pending
        )
    }

    /// Ended on its own, so a missing memory sample means nothing was used
    pub fn has_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl FromStr for JobState {
    type Err = std::convert::Infallible;

    /// `sacct` decorates states (`CANCELLED by 1234`, `CANCELLED+`), only the bare name counts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.split_whitespace().next().unwrap_or_default().trim_end_matches('+');
        Ok(match name.to_ascii_uppercase().as_str() {
            "RUNNING" => JobState::Running,
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "CANCELLED" => JobState::Cancelled,
            "TIMEOUT" => JobState::Timeout,
            "OUT_OF_MEMORY" => JobState::OutOfMemory,
            "PENDING" => JobState::Pending,
            _ => JobState::Other(name.to_owned()),
        })
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPU figures stashed into the `AdminComment` column as JSON, e.g.
/// `{"gpus": 2, "gpu_util": 87.5, "step_minutes": 5}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuSample {
    #[serde(alias = "gpu_count")]
    pub gpus: u32,
    /// percent, 0 to 100
    #[serde(alias = "gpu_utilization")]
    pub gpu_util: f64,
    pub step_minutes: f64,
}

impl GpuSample {
    /// Anything that isn't a valid annotation means "no GPUs"
    pub fn from_annotation(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|error| {
            debug!(%error, raw, "ignoring unparsable GPU annotation");
            Self::default()
        })
    }

    pub fn utilization_seconds(&self, elapsed: Seconds) -> Seconds {
        Seconds(self.gpu_util / 100.0 * elapsed.0 * f64::from(self.gpus))
    }
}

///
/// One accounting row: a job or one of its steps. `None` means the value was unavailable,
/// which is a different thing than zero.
///
#[derive(Debug, Clone, Default, PartialEq, Builder)]
#[builder(setter(into), default)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub requested_memory: Option<Quantity>,
    pub max_rss: Option<Megabytes>,
    pub requested_cpus: Option<u32>,
    pub cpu_time: Option<Seconds>,
    pub time_limit: Option<Seconds>,
    pub elapsed: Option<Seconds>,
    pub state: JobState,
    pub owner: Option<SlurmUser>,
    pub gpu: GpuSample,
}

impl JobRecord {
    /// Builds a record from one `sacct -P` row keyed by header name. Only a missing `JobID` is
    /// an error; unparsable fields become unavailable.
    pub fn from_sacct_row(row: &HashMap<String, String>) -> Result<Self> {
        let field = |key: &str| row.get(key).map_or("", |value| value.trim());

        let id = match field(column::JOB_ID) {
            "" => return Err(Error::MissingColumn(column::JOB_ID)),
            id => JobId::from(id),
        };

        let duration = |key: &'static str| -> Option<Seconds> {
            match field(key) {
                "" => None,
                raw => Seconds::parse(raw)
                    .inspect_err(|error| debug!(%id, column = key, raw, %error, "duration unavailable"))
                    .ok(),
            }
        };
        let quantity = |key: &'static str| -> Option<Quantity> {
            Quantity::parse(field(key))
                .inspect_err(|error| debug!(%id, column = key, %error, "quantity unavailable"))
                .ok()
                .flatten()
        };

        Ok(JobRecord {
            name: field(column::NAME).to_owned(),
            requested_memory: quantity(column::REQ_MEM),
            max_rss: quantity(column::MAX_RSS).map(|rss| rss.amount),
            requested_cpus: field(column::REQ_CPUS).parse().ok(),
            cpu_time: duration(column::TOTAL_CPU),
            time_limit: duration(column::TIME_LIMIT),
            elapsed: duration(column::ELAPSED),
            state: field(column::STATE).parse().unwrap_or_default(),
            owner: Some(field(column::USER)).filter(|user| !user.is_empty()).map(SlurmUser::from),
            gpu: GpuSample::from_annotation(field(column::ADMIN_COMMENT)),
            id,
        })
    }

    /// Requested memory in absolute terms. A per-core request without a known CPU count
    /// can't be resolved.
    pub fn total_requested_memory(&self) -> Option<Megabytes> {
        let request = self.requested_memory?;
        match request.scope {
            Scope::PerCore => self.requested_cpus.map(|cpus| request.total(cpus)),
            Scope::Total | Scope::PerNode => Some(request.amount),
        }
    }

    pub fn requested_gpus(&self) -> u32 {
        self.gpu.gpus
    }

    pub fn gpu_utilization_seconds(&self) -> Option<Seconds> {
        self.elapsed.map(|elapsed| self.gpu.utilization_seconds(elapsed))
    }
}
