use std::fmt;

use derive_more::derive::{Add, AddAssign};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobRecord;
use crate::misc::parsing::{Megabytes, Seconds};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Resource {
    Memory,
    Cpu,
    Time,
    Gpu,
}

impl Resource {
    pub const ALL: [Resource; 4] = [Resource::Memory, Resource::Cpu, Resource::Time, Resource::Gpu];

    pub fn label(self) -> &'static str {
        match self {
            Resource::Memory => "Mem",
            Resource::Cpu => "CPU",
            Resource::Time => "Time",
            Resource::Gpu => "GPU",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Quality bucket of a ratio, worst first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Grade {
    Worst,
    Middle,
    Best,
}

/// Cut points for one resource. Below `low` is [`Grade::Worst`], from `mid` on is
/// [`Grade::Best`]. `perfect` is the nominal full-usage reference and takes no part in
/// bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct Thresholds {
    pub low: f64,
    pub mid: f64,
    pub perfect: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            low: 0.33,
            mid: 0.66,
            perfect: 1.0,
        }
    }
}

impl Thresholds {
    pub fn grade(&self, ratio: f64) -> Grade {
        if ratio < self.low {
            Grade::Worst
        } else if ratio < self.mid {
            Grade::Middle
        } else {
            Grade::Best
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ThresholdError {
    #[error("expected 3 thresholds, got {0}")]
    Count(usize),
    #[error("thresholds must be finite and ascending, got {0:?}")]
    Order(Vec<f64>),
}

impl TryFrom<Vec<f64>> for Thresholds {
    type Error = ThresholdError;

    fn try_from(value: Vec<f64>) -> Result<Self, Self::Error> {
        let &[low, mid, perfect] = value.as_slice() else {
            return Err(ThresholdError::Count(value.len()));
        };
        if !(value.iter().all(|cut| cut.is_finite()) && low <= mid && mid <= perfect) {
            return Err(ThresholdError::Order(value));
        }
        Ok(Thresholds { low, mid, perfect })
    }
}

impl From<Thresholds> for Vec<f64> {
    fn from(value: Thresholds) -> Self {
        vec![value.low, value.mid, value.perfect]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceThresholds {
    pub memory: Thresholds,
    pub cpu: Thresholds,
    pub time: Thresholds,
    pub gpu: Thresholds,
}

impl ResourceThresholds {
    pub fn get(&self, resource: Resource) -> &Thresholds {
        match resource {
            Resource::Memory => &self.memory,
            Resource::Cpu => &self.cpu,
            Resource::Time => &self.time,
            Resource::Gpu => &self.gpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradingOptions {
    /// Clamp memory usage to the request; Slurm occasionally reports more than was allowed
    pub hard_memory_cap: bool,
    /// Grade single core jobs on CPU usage too
    pub track_single_core_jobs: bool,
    pub memory_weight: u32,
    pub cpu_weight: u32,
    /// Grade and tally GPU usage
    pub report_gpu: bool,
    pub thresholds: ResourceThresholds,
}

impl Default for GradingOptions {
    fn default() -> Self {
        GradingOptions {
            hard_memory_cap: true,
            track_single_core_jobs: false,
            memory_weight: 1,
            cpu_weight: 1,
            report_gpu: false,
            thresholds: ResourceThresholds::default(),
        }
    }
}

/// Consumed against allocated amount of one resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Add, AddAssign)]
pub struct Tally {
    pub consumed: f64,
    pub allocated: f64,
}

impl Tally {
    pub fn new(consumed: f64, allocated: f64) -> Self {
        Tally { consumed, allocated }
    }

    /// `None` when nothing was allocated
    pub fn ratio(&self) -> Option<f64> {
        (self.allocated > 0.0).then(|| self.consumed / self.allocated)
    }

    /// Nothing allocated means nothing wasted, which is 100%
    pub fn percent(&self) -> f64 {
        self.ratio().map_or(100.0, |ratio| 100.0 * ratio)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Add, AddAssign)]
pub struct FleetTallies {
    pub memory: Tally,
    pub cpu: Tally,
    pub time: Tally,
    pub gpu: Tally,
}

impl FleetTallies {
    pub fn get(&self, resource: Resource) -> &Tally {
        match resource {
            Resource::Memory => &self.memory,
            Resource::Cpu => &self.cpu,
            Resource::Time => &self.time,
            Resource::Gpu => &self.gpu,
        }
    }

    pub fn get_mut(&mut self, resource: Resource) -> &mut Tally {
        match resource {
            Resource::Memory => &mut self.memory,
            Resource::Cpu => &mut self.cpu,
            Resource::Time => &mut self.time,
            Resource::Gpu => &mut self.gpu,
        }
    }

    /// Fleet percentage per resource; GPU only when it is being reported
    pub fn percentages(&self, report_gpu: bool) -> Vec<(Resource, f64)> {
        Resource::ALL
            .into_iter()
            .filter(|&resource| report_gpu || resource != Resource::Gpu)
            .map(|resource| (resource, self.get(resource).percent()))
            .collect()
    }

    /// Mean of the collected fleet percentages
    pub fn score(&self, report_gpu: bool) -> f64 {
        let percentages = self.percentages(report_gpu);
        percentages.iter().map(|(_, percent)| percent).sum::<f64>() / percentages.len() as f64
    }
}

/// How one resource of one job fared
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assessment {
    /// A required field was missing or the allocation was zero
    Unavailable,
    /// Not graded but shown as best (single core CPU, minimum time limit)
    Exempt,
    Scored { ratio: f64, grade: Grade },
}

impl Assessment {
    pub fn grade(&self) -> Option<Grade> {
        match self {
            Assessment::Unavailable => None,
            Assessment::Exempt => Some(Grade::Best),
            Assessment::Scored { grade, .. } => Some(*grade),
        }
    }

    pub fn ratio(&self) -> Option<f64> {
        match self {
            Assessment::Scored { ratio, .. } => Some(*ratio),
            Assessment::Unavailable | Assessment::Exempt => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradedJob {
    pub record: JobRecord,
    pub requested_memory: Option<Megabytes>,
    /// Memory usage as displayed, after the hard cap
    pub max_rss: Option<Megabytes>,
    pub memory: Assessment,
    pub cpu: Assessment,
    pub time: Assessment,
    pub gpu: Assessment,
    /// Weighted mean of the computed ratios, `None` if there are none
    pub efficiency: Option<f64>,
    /// What this job added to the fleet tallies
    pub contribution: FleetTallies,
}

impl GradedJob {
    pub fn assessment(&self, resource: Resource) -> &Assessment {
        match resource {
            Resource::Memory => &self.memory,
            Resource::Cpu => &self.cpu,
            Resource::Time => &self.time,
            Resource::Gpu => &self.gpu,
        }
    }
}

/// Grades jobs one at a time and keeps the fleet wide tallies
#[derive(Debug, Clone)]
pub struct Grader<'a> {
    options: &'a GradingOptions,
    tallies: FleetTallies,
}

impl<'a> Grader<'a> {
    pub fn new(options: &'a GradingOptions) -> Self {
        Grader {
            options,
            tallies: FleetTallies::default(),
        }
    }

    pub fn into_tallies(self) -> FleetTallies {
        self.tallies
    }

    pub fn grade(&mut self, record: JobRecord) -> GradedJob {
        let options = self.options;
        // steps are already folded into their job's row
        let counted = record.state.counts_toward_fleet() && !record.id.is_step();
        let mut contribution = FleetTallies::default();
        let mut assess = |resource: Resource, usage: Option<Tally>| -> Assessment {
            let Some(usage) = usage else {
                return Assessment::Unavailable;
            };
            let Some(ratio) = usage.ratio() else {
                return Assessment::Unavailable;
            };
            if counted {
                *contribution.get_mut(resource) += usage;
            }
            Assessment::Scored {
                ratio,
                grade: options.thresholds.get(resource).grade(ratio),
            }
        };

        let requested_memory = record.total_requested_memory();
        let max_rss = match (record.max_rss, requested_memory) {
            (Some(used), Some(requested)) if options.hard_memory_cap && used > requested => Some(requested),
            (used, _) => used,
        };
        let memory = assess(
            Resource::Memory,
            max_rss.zip(requested_memory).map(|(used, requested)| Tally::new(used.0, requested.0)),
        );

        let cpu = match record.requested_cpus {
            Some(1) if !options.track_single_core_jobs => Assessment::Exempt,
            cpus => assess(Resource::Cpu, cpu_usage(record.cpu_time, record.elapsed, cpus)),
        };

        let time = match record.time_limit {
            Some(limit) if limit == Seconds::GRANULARITY => Assessment::Exempt,
            limit => assess(Resource::Time, time_usage(record.elapsed, limit)),
        };

        let gpu = match options.report_gpu {
            true => assess(Resource::Gpu, gpu_usage(&record)),
            false => Assessment::Unavailable,
        };

        let weighted = [
            (memory.ratio(), options.memory_weight),
            (cpu.ratio(), options.cpu_weight),
            (time.ratio(), 1),
            (gpu.ratio(), 1),
        ];
        let (sum, weight) = weighted
            .iter()
            .filter_map(|&(ratio, weight)| ratio.map(|ratio| (ratio * f64::from(weight), f64::from(weight))))
            .fold((0.0, 0.0), |(sum, total), (value, weight)| (sum + value, total + weight));
        let efficiency = (weight > 0.0).then(|| sum / weight);

        self.tallies += contribution;

        GradedJob {
            record,
            requested_memory,
            max_rss,
            memory,
            cpu,
            time,
            gpu,
            efficiency,
            contribution,
        }
    }
}

fn cpu_usage(cpu_time: Option<Seconds>, elapsed: Option<Seconds>, cpus: Option<u32>) -> Option<Tally> {
    let (cpu_time, elapsed, cpus) = (cpu_time?, elapsed?, cpus?);
    Some(Tally::new(cpu_time.0, elapsed.0 * f64::from(cpus)))
}

/// Overruns count as fully used, never more
fn time_usage(elapsed: Option<Seconds>, limit: Option<Seconds>) -> Option<Tally> {
    let (elapsed, limit) = (elapsed?, limit?);
    let used = if elapsed > limit { limit } else { elapsed };
    Some(Tally::new(used.0, limit.0))
}

/// Uses the job's own run time when there is one; otherwise estimates from the sampling window
/// of the annotation.
fn gpu_usage(record: &JobRecord) -> Option<Tally> {
    let sample = record.gpu;
    if sample.gpus == 0 {
        return None;
    }
    let gpus = f64::from(sample.gpus);

    match record.gpu_utilization_seconds().zip(record.elapsed) {
        Some((used, elapsed)) if elapsed.0 > 0.0 => Some(Tally::new(used.0, elapsed.0 * gpus)),
        _ => {
            let window = sample.step_minutes * 60.0 * gpus;
            Some(Tally::new(sample.gpu_util * window / 100.0, window))
        }
    }
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use color_eyre::Result;

    use super::*;
    use crate::job::{GpuSample, JobRecordBuilder, JobState};
    use crate::misc::parsing::Quantity;

    const ε: f64 = 0.0000000001;

    fn completed() -> JobRecordBuilder {
        let mut builder = JobRecordBuilder::default();
        builder.id("1").state(JobState::Completed);
        builder
    }

    #[test]
    fn Thresholds__grade__buckets() {
        let thresholds = Thresholds::default();
        assert_eq!(thresholds.grade(0.1), Grade::Worst);
        assert_eq!(thresholds.grade(0.33), Grade::Middle);
        assert_eq!(thresholds.grade(0.5), Grade::Middle);
        assert_eq!(thresholds.grade(0.66), Grade::Best);
        assert_eq!(thresholds.grade(1.4), Grade::Best);
    }

    #[test]
    fn Thresholds__try_from() {
        assert_eq!(
            Thresholds::try_from(vec![0.1, 0.2, 0.3]),
            Ok(Thresholds { low: 0.1, mid: 0.2, perfect: 0.3 })
        );
        assert_eq!(Thresholds::try_from(vec![0.1, 0.2]), Err(ThresholdError::Count(2)));
        assert!(matches!(Thresholds::try_from(vec![0.5, 0.2, 1.0]), Err(ThresholdError::Order(_))));
        assert!(Thresholds::try_from(vec![0.1, f64::NAN, 1.0]).is_err());
    }

    #[test]
    fn Tally__percent__zero_allocation_is_full() {
        assert_eq!(Tally::default().percent(), 100.0);
        assert_eq!(Tally::new(5.0, 0.0).percent(), 100.0);
        assert!((Tally::new(1.0, 4.0).percent() - 25.0).abs() < ε);
    }

    #[test]
    fn Grader__memory__hard_cap() -> Result<()> {
        let options = GradingOptions::default();
        let mut grader = Grader::new(&options);

        let half = completed()
            .requested_memory(Quantity::parse("1000M")?)
            .max_rss(Megabytes(500.0))
            .build()?;
        let graded = grader.grade(half);
        assert_eq!(graded.memory, Assessment::Scored { ratio: 0.5, grade: Grade::Middle });

        let over = completed()
            .requested_memory(Quantity::parse("1000M")?)
            .max_rss(Megabytes(1200.0))
            .build()?;
        let graded = grader.grade(over);
        assert_eq!(graded.max_rss, Some(Megabytes(1000.0)));
        assert_eq!(graded.memory.ratio(), Some(1.0));
        assert_eq!(grader.into_tallies().memory, Tally::new(1500.0, 2000.0));
        Ok(())
    }

    #[test]
    fn Grader__memory__uncapped_can_exceed_request() -> Result<()> {
        let options = GradingOptions {
            hard_memory_cap: false,
            ..Default::default()
        };
        let record = completed()
            .requested_memory(Quantity::parse("1000M")?)
            .max_rss(Megabytes(1500.0))
            .build()?;
        let graded = Grader::new(&options).grade(record);
        assert_eq!(graded.memory.ratio(), Some(1.5));
        assert_eq!(graded.max_rss, Some(Megabytes(1500.0)));
        Ok(())
    }

    #[test]
    fn Grader__cpu__single_core_exempt() -> Result<()> {
        let options = GradingOptions::default();
        let mut grader = Grader::new(&options);
        let record = completed()
            .requested_cpus(1)
            .cpu_time(Seconds(10.0))
            .elapsed(Seconds(100.0))
            .build()?;
        let graded = grader.grade(record.clone());
        assert_eq!(graded.cpu, Assessment::Exempt);
        assert_eq!(graded.cpu.grade(), Some(Grade::Best));
        assert_eq!(grader.into_tallies().cpu, Tally::default());

        let tracking = GradingOptions {
            track_single_core_jobs: true,
            ..Default::default()
        };
        let graded = Grader::new(&tracking).grade(record);
        assert_eq!(graded.cpu, Assessment::Scored { ratio: 0.1, grade: Grade::Worst });
        Ok(())
    }

    #[test]
    fn Grader__cpu__ratio() -> Result<()> {
        let options = GradingOptions::default();
        let record = completed()
            .requested_cpus(4)
            .cpu_time(Seconds(300.0))
            .elapsed(Seconds(100.0))
            .build()?;
        let graded = Grader::new(&options).grade(record);
        assert_eq!(graded.cpu, Assessment::Scored { ratio: 0.75, grade: Grade::Best });
        Ok(())
    }

    #[test]
    fn Grader__time__clamped_and_minimum_limit() -> Result<()> {
        let options = GradingOptions::default();
        let overrun = completed()
            .time_limit(Seconds(100.0))
            .elapsed(Seconds(250.0))
            .build()?;
        assert_eq!(Grader::new(&options).grade(overrun).time.ratio(), Some(1.0));

        let minimal = completed()
            .time_limit(Seconds::GRANULARITY)
            .elapsed(Seconds(1.0))
            .build()?;
        let mut grader = Grader::new(&options);
        assert_eq!(grader.grade(minimal).time, Assessment::Exempt);
        assert_eq!(grader.into_tallies().time, Tally::default());
        Ok(())
    }

    #[test]
    fn Grader__zero_denominators_are_unavailable() -> Result<()> {
        let options = GradingOptions::default();
        let record = completed()
            .requested_memory(Quantity::parse("0M")?)
            .max_rss(Megabytes(0.0))
            .requested_cpus(2)
            .cpu_time(Seconds(0.0))
            .elapsed(Seconds(0.0))
            .time_limit(Seconds(0.0))
            .build()?;
        let graded = Grader::new(&options).grade(record);
        assert_eq!(graded.memory, Assessment::Unavailable);
        assert_eq!(graded.cpu, Assessment::Unavailable);
        assert_eq!(graded.time, Assessment::Unavailable);
        assert_eq!(graded.efficiency, None);
        Ok(())
    }

    #[test]
    fn Grader__gpu__elapsed_and_window_estimate() -> Result<()> {
        let options = GradingOptions {
            report_gpu: true,
            ..Default::default()
        };
        let gpu = GpuSample {
            gpus: 2,
            gpu_util: 40.0,
            step_minutes: 5.0,
        };

        let with_elapsed = completed().gpu(gpu).elapsed(Seconds(100.0)).build()?;
        let mut grader = Grader::new(&options);
        let ratio = grader.grade(with_elapsed).gpu.ratio().unwrap();
        assert!((ratio - 0.4).abs() < ε);
        assert_eq!(grader.into_tallies().gpu, Tally::new(80.0, 200.0));

        let without_elapsed = completed().gpu(gpu).build()?;
        let graded = Grader::new(&options).grade(without_elapsed);
        assert_eq!(graded.contribution.gpu, Tally::new(240.0, 600.0));

        let no_gpus = completed().elapsed(Seconds(100.0)).build()?;
        assert_eq!(Grader::new(&options).grade(no_gpus).gpu, Assessment::Unavailable);
        Ok(())
    }

    #[test]
    fn Grader__excluded_states_rendered_not_tallied() -> Result<()> {
        let options = GradingOptions::default();
        let mut grader = Grader::new(&options);
        let record = completed()
            .state(JobState::Timeout)
            .time_limit(Seconds(100.0))
            .elapsed(Seconds(100.0))
            .build()?;
        let graded = grader.grade(record);
        assert_eq!(graded.time.ratio(), Some(1.0));
        assert_eq!(grader.into_tallies(), FleetTallies::default());
        Ok(())
    }

    #[test]
    fn Grader__pending_not_tallied() -> Result<()> {
        let options = GradingOptions::default();
        let mut grader = Grader::new(&options);
        let pending = completed()
            .state(JobState::Pending)
            .time_limit(Seconds(3600.0))
            .elapsed(Seconds(0.0))
            .build()?;
        let graded = grader.grade(pending);
        assert_eq!(graded.time.ratio(), Some(0.0));
        assert_eq!(graded.contribution, FleetTallies::default());
        assert_eq!(grader.into_tallies(), FleetTallies::default());
        Ok(())
    }

    #[test]
    fn Grader__steps_not_tallied() -> Result<()> {
        let options = GradingOptions::default();
        let mut grader = Grader::new(&options);
        let step = completed()
            .id("1.batch")
            .time_limit(Seconds(100.0))
            .elapsed(Seconds(50.0))
            .build()?;
        let graded = grader.grade(step);
        assert_eq!(graded.time.ratio(), Some(0.5));
        assert_eq!(grader.into_tallies(), FleetTallies::default());
        Ok(())
    }

    #[test]
    fn Grader__efficiency__weighted_mean() -> Result<()> {
        let record = completed()
            .requested_memory(Quantity::parse("1000M")?)
            .max_rss(Megabytes(200.0))
            .requested_cpus(2)
            .cpu_time(Seconds(200.0))
            .elapsed(Seconds(100.0))
            .build()?;

        let plain = GradingOptions::default();
        let efficiency = Grader::new(&plain).grade(record.clone()).efficiency.unwrap();
        assert!((efficiency - 0.6).abs() < ε);

        let memory_heavy = GradingOptions {
            memory_weight: 3,
            ..Default::default()
        };
        let efficiency = Grader::new(&memory_heavy).grade(record).efficiency.unwrap();
        assert!((efficiency - 0.4).abs() < ε);
        Ok(())
    }

    #[test]
    fn FleetTallies__score() {
        let tallies = FleetTallies {
            memory: Tally::new(1.0, 2.0),
            cpu: Tally::new(1.0, 4.0),
            time: Tally::default(),
            gpu: Tally::new(0.0, 10.0),
        };
        assert!((tallies.score(false) - (50.0 + 25.0 + 100.0) / 3.0).abs() < ε);
        assert!((tallies.score(true) - (50.0 + 25.0 + 100.0) / 4.0).abs() < ε);
    }
}
