use std::collections::HashMap;
use std::iter;

use itertools::Itertools as _;
use tracing::{debug, instrument};

use crate::job::{JobRecord, JobState};
use crate::misc::parsing::Megabytes;
use crate::slurm::LiveStatus;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupOptions {
    /// Render step records on their own instead of folding them into their job
    pub show_step_children: bool,
    /// Ask the live status source about jobs that are still running
    pub sample_running: bool,
}

/// A job together with its steps, in fetch order
#[derive(Debug, Clone, PartialEq)]
pub struct JobGroup {
    pub parent: JobRecord,
    pub children: Vec<JobRecord>,
}

impl JobGroup {
    /// The parent with peak memory usage and CPU request taken over from its steps. Slurm
    /// records usage per step and leaves the job level row as a placeholder.
    ///
    /// Steps without a memory sample don't move the memory maximum but still count for CPUs.
    pub fn consolidate(&self) -> JobRecord {
        let max_rss = self
            .children
            .iter()
            .filter_map(|child| child.max_rss)
            .fold(self.parent.max_rss, |max, rss| match max {
                Some(max) if max >= rss => Some(max),
                _ => Some(rss),
            });
        let requested_cpus = self
            .children
            .iter()
            .filter_map(|child| child.requested_cpus)
            .fold(self.parent.requested_cpus, |max, cpus| max.max(Some(cpus)));

        JobRecord {
            max_rss,
            requested_cpus,
            ..self.parent.clone()
        }
    }
}

/// Groups records by top level id. Steps whose job isn't part of the batch are dropped.
pub fn group_records(records: impl IntoIterator<Item = JobRecord>) -> Vec<JobGroup> {
    let mut groups: Vec<JobGroup> = Vec::new();
    let mut index_of: HashMap<String, usize> = HashMap::new();

    for record in records {
        let top_level = record.id.top_level().to_owned();
        if !record.id.is_step() {
            index_of.insert(top_level, groups.len());
            groups.push(JobGroup {
                parent: record,
                children: Vec::new(),
            });
            continue;
        }
        match index_of.get(&top_level).and_then(|&i| groups.get_mut(i)) {
            Some(group) => group.children.push(record),
            None => debug!(id = %record.id, "step without its job in this batch, dropped"),
        }
    }

    groups
}

/// Produces one effective row per job, then fills in what finished and running jobs are missing.
/// With step children shown, each job's rolled up row is followed by its steps, untouched.
#[instrument(skip_all, fields(records = records.len()))]
pub fn roll_up(records: Vec<JobRecord>, options: &RollupOptions, live: &impl LiveStatus) -> Vec<JobRecord> {
    let groups = group_records(records);
    if !options.show_step_children {
        return groups
            .iter()
            .map(|group| settle(group.consolidate(), options, live))
            .collect_vec();
    }

    groups
        .into_iter()
        .flat_map(|group| {
            let parent = settle(group.consolidate(), options, live);
            iter::once(parent).chain(group.children)
        })
        .collect_vec()
}

fn settle(mut record: JobRecord, options: &RollupOptions, live: &impl LiveStatus) -> JobRecord {
    if record.state.has_finished() && record.max_rss.is_none() {
        record.max_rss = Some(Megabytes(0.0));
    }

    if record.state == JobState::Running && options.sample_running {
        let sample = live.sample(&record.id).unwrap_or_default();
        debug!(id = %record.id, ?sample, "live sample");
        record.cpu_time = sample.cpu_time;
        record.max_rss = sample.max_rss;
    }

    record
}
