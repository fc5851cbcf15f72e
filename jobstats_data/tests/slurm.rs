use std::process::Command;

use chrono::{Duration, Local};
use color_eyre::Result;

use jobstats_data::report::{line_text, RenderOptions, Report, ReportOptions};
use jobstats_data::slurm::{format_datetime_for_slurm, parse_accounting, AccountingQuery, AccountingSource, Sacct, Sstat};

fn are_we_on_slurm_machine() -> bool {
    let success = Command::new("which")
        .arg("sacct")
        .output()
        .expect("error while executing `which`")
        .status
        .success();
    if !success {
        eprintln!("No slurm found, SKIPPING");
    }
    success
}

#[test]
fn sacct_last_week_everyone() -> Result<()> {
    if !are_we_on_slurm_machine() {
        return Ok(());
    }
    // look if querying, parsing and grading can happen without an error
    // if so, just print out the result, since we have no way to actually validate the data
    let query = AccountingQuery {
        all_users: true,
        start: Some(format_datetime_for_slurm(Local::now() - Duration::days(7))),
        ..Default::default()
    };
    let raw = Sacct.fetch(&query)?;
    let records = parse_accounting(&raw)?;
    let report = Report::build(records, &ReportOptions::default(), &Sstat);
    for line in report.render(&RenderOptions::default()) {
        println!("{}", line_text(&line));
    }
    Ok(())
}
