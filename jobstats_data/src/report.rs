//! Turns fetched records into the lines of the final report: rollup, grading, column fitting and
//! the fleet footer.

use itertools::Itertools as _;
use tracing::{debug, info, instrument};

use crate::efficiency::{FleetTallies, Grade, GradedJob, Grader, GradingOptions, Resource, ResourceThresholds};
use crate::job::JobRecord;
use crate::misc::parsing::quantity::UNAVAILABLE_SENTINEL;
use crate::misc::parsing::Seconds;
use crate::rollup::{roll_up, RollupOptions};
use crate::slurm::{LiveStatus, SlurmUser};
use crate::table::{render_parsable, ColumnPlan, ColumnSpec};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportOptions {
    pub rollup: RollupOptions,
    pub grading: GradingOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// `|` separated, never truncated
    pub parsable: bool,
    /// `None` means no limit
    pub max_width: Option<usize>,
}

/// A piece of output text, followed by `trailing` spaces. The grade is for colouring only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub trailing: usize,
    pub grade: Option<Grade>,
}

impl Segment {
    pub fn plain(text: impl Into<String>) -> Self {
        Segment {
            text: text.into(),
            trailing: 0,
            grade: None,
        }
    }
}

pub type Line = Vec<Segment>;

/// Text of a line without any colouring
pub fn line_text(line: &Line) -> String {
    line.iter()
        .map(|segment| format!("{}{}", segment.text, " ".repeat(segment.trailing)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    JobId,
    Name,
    ReqMem,
    MaxRss,
    ReqCpus,
    CpuTime,
    TimeLimit,
    Elapsed,
    State,
    Gpus,
    GpuUtil,
    Efficiency,
}

impl Field {
    fn all(report_gpu: bool) -> Vec<Field> {
        use Field::*;
        let mut fields = vec![JobId, Name, ReqMem, MaxRss, ReqCpus, CpuTime, TimeLimit, Elapsed, State];
        if report_gpu {
            fields.extend([Gpus, GpuUtil]);
        }
        fields.push(Efficiency);
        fields
    }

    fn spec(self) -> ColumnSpec {
        match self {
            Field::JobId => ColumnSpec::new("JobID"),
            Field::Name => ColumnSpec::new("Name"),
            Field::ReqMem => ColumnSpec::with_unit("ReqMem"),
            Field::MaxRss => ColumnSpec::with_unit("MaxRSS"),
            Field::ReqCpus => ColumnSpec::new("ReqCPUs"),
            Field::CpuTime => ColumnSpec::new("CPUTime"),
            Field::TimeLimit => ColumnSpec::new("TimeLimit"),
            Field::Elapsed => ColumnSpec::new("Elapsed"),
            Field::State => ColumnSpec::new("State"),
            Field::Gpus => ColumnSpec::new("GPUs"),
            Field::GpuUtil => ColumnSpec::new("GPUUtil"),
            Field::Efficiency => ColumnSpec::new("Efficiency"),
        }
    }

    fn cell(self, job: &GradedJob) -> String {
        let record = &job.record;
        let duration = |value: Option<Seconds>| value.map_or_else(unavailable, Seconds::to_slurm_string);
        match self {
            Field::JobId => record.id.to_string(),
            Field::Name => record.name.clone(),
            Field::ReqMem => job.requested_memory.map_or_else(unavailable, |memory| memory.to_human()),
            Field::MaxRss => job.max_rss.map_or_else(unavailable, |memory| memory.to_human()),
            Field::ReqCpus => record.requested_cpus.map_or_else(unavailable, |cpus| cpus.to_string()),
            Field::CpuTime => duration(record.cpu_time),
            Field::TimeLimit => duration(record.time_limit),
            Field::Elapsed => duration(record.elapsed),
            Field::State => record.state.to_string(),
            Field::Gpus => record.requested_gpus().to_string(),
            Field::GpuUtil => match record.requested_gpus() {
                0 => unavailable(),
                _ => format!("{:.2}%", record.gpu.gpu_util),
            },
            Field::Efficiency => job.efficiency.map_or_else(unavailable, percent),
        }
    }

    fn grade(self, job: &GradedJob) -> Option<Grade> {
        let resource = match self {
            Field::MaxRss => Resource::Memory,
            Field::CpuTime => Resource::Cpu,
            Field::Elapsed => Resource::Time,
            Field::GpuUtil => Resource::Gpu,
            _ => return None,
        };
        job.assessment(resource).grade()
    }
}

fn unavailable() -> String {
    UNAVAILABLE_SENTINEL.to_owned()
}

fn percent(ratio: f64) -> String {
    format!("{:.2}%", 100.0 * ratio)
}

/// Fleet usage of one job owner
#[derive(Debug, Clone, PartialEq)]
pub struct OwnerSummary {
    pub owner: Option<SlurmUser>,
    pub jobs: usize,
    pub tallies: FleetTallies,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub jobs: Vec<GradedJob>,
    pub fleet: FleetTallies,
    pub report_gpu: bool,
    thresholds: ResourceThresholds,
}

impl Report {
    /// Rolls up and grades `records` (in fetch order)
    #[instrument(skip_all, fields(records = records.len()))]
    pub fn build(records: Vec<JobRecord>, options: &ReportOptions, live: &impl LiveStatus) -> Report {
        let rows = roll_up(records, &options.rollup, live);

        let mut grader = Grader::new(&options.grading);
        let jobs = rows.into_iter().map(|row| grader.grade(row)).collect_vec();
        let fleet = grader.into_tallies();
        info!(jobs = jobs.len(), score = fleet.score(options.grading.report_gpu), "graded");

        Report {
            jobs,
            fleet,
            report_gpu: options.grading.report_gpu,
            thresholds: options.grading.thresholds,
        }
    }

    pub fn columns(&self) -> Vec<ColumnSpec> {
        Field::all(self.report_gpu).into_iter().map(Field::spec).collect()
    }

    /// Per job table followed by the fleet summary
    pub fn render(&self, options: &RenderOptions) -> Vec<Line> {
        let fields = Field::all(self.report_gpu);
        let rows = self
            .jobs
            .iter()
            .map(|job| {
                let cells = fields.iter().map(|field| field.cell(job)).collect_vec();
                let grades = fields.iter().map(|field| field.grade(job)).collect_vec();
                (cells, grades)
            })
            .collect_vec();

        let mut lines = render_table(&self.columns(), rows, options);
        if !options.parsable {
            lines.push(Line::new());
        }
        lines.extend(self.summary_lines().into_iter().map(|text| vec![Segment::plain(text)]));
        lines
    }

    /// `Mem Efficiency: 12.34%` and so on, then the overall score
    pub fn summary_lines(&self) -> Vec<String> {
        self.fleet
            .percentages(self.report_gpu)
            .into_iter()
            .map(|(resource, percent)| format!("{resource} Efficiency: {percent:.2}%"))
            .chain([format!("Efficiency Score: {:.2}", self.fleet.score(self.report_gpu))])
            .collect()
    }

    /// Fleet tallies per job owner, ordered by name. Jobs without a known owner come last.
    pub fn by_owner(&self) -> Vec<OwnerSummary> {
        self.jobs
            .iter()
            .filter(|job| !job.record.id.is_step())
            .into_group_map_by(|job| job.record.owner.clone())
            .into_iter()
            .map(|(owner, jobs)| OwnerSummary {
                tallies: jobs
                    .iter()
                    .fold(FleetTallies::default(), |sum, job| sum + job.contribution),
                jobs: jobs.len(),
                owner,
            })
            .sorted_by(|a, b| (a.owner.is_none(), &a.owner).cmp(&(b.owner.is_none(), &b.owner)))
            .collect()
    }

    /// One row per owner instead of per job, followed by the fleet summary
    pub fn render_by_owner(&self, options: &RenderOptions) -> Vec<Line> {
        let resources = Resource::ALL
            .into_iter()
            .filter(|&resource| self.report_gpu || resource != Resource::Gpu)
            .collect_vec();
        let columns = [ColumnSpec::new("User"), ColumnSpec::new("Jobs")]
            .into_iter()
            .chain(resources.iter().map(|resource| ColumnSpec::new(resource.label())))
            .chain([ColumnSpec::new("Score")])
            .collect_vec();

        let rows = self
            .by_owner()
            .into_iter()
            .map(|summary| {
                let owner = summary.owner.map_or_else(|| "(unknown)".to_owned(), |owner| owner.0);
                let mut cells = vec![owner, summary.jobs.to_string()];
                let mut grades = vec![None, None];
                for &resource in &resources {
                    let tally = summary.tallies.get(resource);
                    cells.push(format!("{:.2}%", tally.percent()));
                    grades.push(tally.ratio().map(|ratio| self.thresholds.get(resource).grade(ratio)));
                }
                cells.push(format!("{:.2}", summary.tallies.score(self.report_gpu)));
                grades.push(None);
                (cells, grades)
            })
            .collect_vec();

        let mut lines = render_table(&columns, rows, options);
        if !options.parsable {
            lines.push(Line::new());
        }
        lines.extend(self.summary_lines().into_iter().map(|text| vec![Segment::plain(text)]));
        lines
    }
}

/// Header plus rows, either fitted to the width or `|` separated
fn render_table(columns: &[ColumnSpec], rows: Vec<(Vec<String>, Vec<Option<Grade>>)>, options: &RenderOptions) -> Vec<Line> {
    if options.parsable {
        let labels = columns.iter().map(|column| column.label.to_owned()).collect_vec();
        return [labels]
            .into_iter()
            .chain(rows.into_iter().map(|(cells, _)| cells))
            .map(|cells| vec![Segment::plain(render_parsable(&cells))])
            .collect();
    }

    let cells = rows.iter().map(|(cells, _)| cells.clone()).collect_vec();
    let plan = ColumnPlan::fit(columns, &cells, options.max_width);
    debug!(width = plan.total_width(), max_width = ?options.max_width, "table layout");
    let header = plan
        .render_cells(&plan.labels())
        .into_iter()
        .map(|(text, trailing)| Segment {
            text,
            trailing,
            grade: None,
        })
        .collect_vec();

    [header]
        .into_iter()
        .chain(rows.into_iter().map(|(cells, grades)| {
            plan.render_cells(&cells)
                .into_iter()
                .zip(grades)
                .map(|((text, trailing), grade)| Segment { text, trailing, grade })
                .collect_vec()
        }))
        .collect()
}
