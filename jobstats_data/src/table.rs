use itertools::Itertools as _;
use tracing::trace;

use crate::job::is_step_label;

/// Spaces between two columns
pub const COLUMN_SEPARATOR_WIDTH: usize = 3;
/// Spaces after the last column
pub const TRAILING_PADDING: usize = 2;
/// Replaces the last visible character of a truncated cell
pub const ELISION_MARKER: char = '+';
pub const PARSABLE_DELIMITER: &str = "|";
/// Memory columns end in a unit letter that has to stay readable
pub const UNIT_COLUMN_MIN_WIDTH: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub label: &'static str,
    pub min_width: usize,
}

impl ColumnSpec {
    pub const fn new(label: &'static str) -> Self {
        ColumnSpec { label, min_width: 0 }
    }

    pub const fn with_unit(label: &'static str) -> Self {
        ColumnSpec {
            label,
            min_width: UNIT_COLUMN_MIN_WIDTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub label: &'static str,
    pub width: usize,
}

/// Final width of every column of one run, applied the same way to every row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    pub columns: Vec<Column>,
}

/// Fixed padding of a line with `columns` columns
pub fn padding(columns: usize) -> usize {
    match columns {
        0 => 0,
        n => (n - 1) * COLUMN_SEPARATOR_WIDTH + TRAILING_PADDING,
    }
}

fn display_width(cell: &str) -> usize {
    cell.chars().count()
}

/// Cells with spaces or step ids are long free text and don't get to widen their column
fn drives_width(cell: &str) -> bool {
    !cell.contains(' ') && !is_step_label(cell)
}

impl ColumnPlan {
    /// Natural width per column, then the widest column loses one unit at a time until the line
    /// fits `max_width`. No column goes below 1, so a budget smaller than the column count plus
    /// padding can't be met and the narrowest possible plan is returned.
    pub fn fit(specs: &[ColumnSpec], rows: &[Vec<String>], max_width: Option<usize>) -> Self {
        let mut widths = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let natural = rows
                    .iter()
                    .filter_map(|row| row.get(i))
                    .filter(|cell| drives_width(cell))
                    .map(|cell| display_width(cell))
                    .max()
                    .unwrap_or(0);
                natural.max(display_width(spec.label)).max(spec.min_width)
            })
            .collect_vec();

        if let Some(max_width) = max_width {
            let padding = padding(widths.len());
            while widths.iter().sum::<usize>() + padding > max_width {
                let Some(widest) = widths.iter().copied().max().filter(|&widest| widest > 1) else {
                    break;
                };
                if let Some(i) = widths.iter().position(|&width| width == widest) {
                    widths[i] -= 1;
                }
            }
            trace!(?widths, max_width, "fitted columns");
        }

        ColumnPlan {
            columns: specs
                .iter()
                .zip(widths)
                .map(|(spec, width)| Column {
                    label: spec.label,
                    width,
                })
                .collect(),
        }
    }

    pub fn labels(&self) -> Vec<String> {
        self.columns.iter().map(|column| column.label.to_owned()).collect()
    }

    pub fn total_width(&self) -> usize {
        self.columns.iter().map(|column| column.width).sum::<usize>() + padding(self.columns.len())
    }

    /// Each cell cut to its column, paired with the number of spaces that follow it
    pub fn render_cells(&self, cells: &[String]) -> Vec<(String, usize)> {
        let last = self.columns.len().saturating_sub(1);
        self.columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let text = fit_cell(cells.get(i).map_or("", String::as_str), column.width);
                let separator = if i == last { TRAILING_PADDING } else { COLUMN_SEPARATOR_WIDTH };
                let trailing = column.width - display_width(&text) + separator;
                (text, trailing)
            })
            .collect()
    }

    #[cfg(test)]
    fn render_row(&self, cells: &[String]) -> String {
        self.render_cells(cells)
            .into_iter()
            .map(|(text, trailing)| format!("{text}{}", " ".repeat(trailing)))
            .collect()
    }
}

/// Cuts `cell` down to `width` characters, marking the cut
pub fn fit_cell(cell: &str, width: usize) -> String {
    if display_width(cell) <= width {
        return cell.to_owned();
    }
    match width {
        0 => String::new(),
        width => cell.chars().take(width - 1).chain([ELISION_MARKER]).collect(),
    }
}

pub fn render_parsable(cells: &[String]) -> String {
    cells.join(PARSABLE_DELIMITER)
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use itertools::Itertools as _;

    use super::*;

    fn cells(row: &[&str]) -> Vec<String> {
        row.iter().map(|cell| cell.to_string()).collect()
    }

    #[test]
    fn ColumnPlan__fit__natural_widths() {
        let specs = [ColumnSpec::new("JobID"), ColumnSpec::with_unit("MaxRSS"), ColumnSpec::new("Name")];
        let rows = [cells(&["123456789", "5M", "ab"]), cells(&["1.batch", "12.50G", "a long name"])];
        let plan = ColumnPlan::fit(&specs, &rows, None);
        let widths = plan.columns.iter().map(|column| column.width).collect_vec();
        // "1.batch" and "a long name" don't count
        assert_eq!(widths, [9, 7, 4]);
        assert_eq!(plan.total_width(), 9 + 7 + 4 + 3 + 3 + 2);
    }

    #[test]
    fn ColumnPlan__fit__shrinks_widest_first_found() {
        let specs = [ColumnSpec::new("a"), ColumnSpec::new("b"), ColumnSpec::new("c")];
        let rows = [cells(&["xxxxxx", "xxxxxx", "xx"])];
        let plan = ColumnPlan::fit(&specs, &rows, Some(6 + 5 + 2 + 8));
        let widths = plan.columns.iter().map(|column| column.width).collect_vec();
        assert_eq!(widths, [5, 6, 2]);
        assert_eq!(plan.total_width(), 21);
    }

    #[test]
    fn ColumnPlan__fit__always_meets_reachable_budget() {
        let natural = [1usize, 3, 17, 8, 8, 40, 2, 11];
        let specs = natural.iter().map(|_| ColumnSpec::new("")).collect_vec();
        let rows = [natural.iter().map(|&width| "x".repeat(width)).collect_vec()];
        let floor = natural.len() + padding(natural.len());
        let unconstrained = natural.iter().sum::<usize>() + padding(natural.len());

        for max_width in floor..=unconstrained + 3 {
            let plan = ColumnPlan::fit(&specs, &rows, Some(max_width));
            assert!(plan.total_width() <= max_width, "max {max_width}: {plan:?}");
            assert!(plan.columns.iter().all(|column| column.width >= 1));
        }
    }

    #[test]
    fn ColumnPlan__fit__unreachable_budget_stops() {
        let specs = [ColumnSpec::new("a"), ColumnSpec::new("b")];
        let rows = [cells(&["xxxx", "yyyy"])];
        let plan = ColumnPlan::fit(&specs, &rows, Some(1));
        assert!(plan.columns.iter().all(|column| column.width == 1));
    }

    #[test]
    fn fit_cell__truncates_with_marker() {
        assert_eq!(fit_cell("COMPLETED", 9), "COMPLETED");
        assert_eq!(fit_cell("COMPLETED", 5), "COMP+");
        assert_eq!(fit_cell("COMPLETED", 1), "+");
        assert_eq!(fit_cell("COMPLETED", 0), "");
        assert_eq!(fit_cell("jöb", 2), "j+");
    }

    #[test]
    fn ColumnPlan__render_row() {
        let specs = [ColumnSpec::new("ID"), ColumnSpec::new("State")];
        let plan = ColumnPlan::fit(&specs, &[cells(&["1", "RUNNING"])], Some(2 + 5 + 5));
        assert_eq!(plan.render_row(&cells(&["1", "RUNNING"])), "1    RUNN+  ");
        assert_eq!(plan.render_row(&plan.labels()), "ID   State  ");
    }

    #[test]
    fn render_parsable__no_truncation() {
        assert_eq!(render_parsable(&cells(&["1", "a very long name", "-"])), "1|a very long name|-");
    }
}
