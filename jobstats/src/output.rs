use std::io::{self, Write};

use crossterm::style::{Color, Stylize as _};

use jobstats_data::efficiency::Grade;
use jobstats_data::report::Line;

fn grade_color(grade: Grade) -> Color {
    match grade {
        Grade::Worst => Color::Red,
        Grade::Middle => Color::Yellow,
        Grade::Best => Color::Green,
    }
}

/// Writes report lines, colouring graded segments if `colored`. Padding is never coloured.
pub fn write_lines(out: &mut impl Write, lines: &[Line], colored: bool) -> io::Result<()> {
    for line in lines {
        for segment in line {
            match segment.grade.filter(|_| colored) {
                Some(grade) => write!(out, "{}", segment.text.as_str().with(grade_color(grade)))?,
                None => out.write_all(segment.text.as_bytes())?,
            }
            out.write_all(" ".repeat(segment.trailing).as_bytes())?;
        }
        writeln!(out)?;
    }
    out.flush()
}

#[allow(non_snake_case)]
#[cfg(test)]
mod test {
    use color_eyre::Result;
    use jobstats_data::report::Segment;

    use super::*;

    fn lines() -> Vec<Line> {
        vec![
            vec![
                Segment {
                    text: "1".to_owned(),
                    trailing: 3,
                    grade: None,
                },
                Segment {
                    text: "250M".to_owned(),
                    trailing: 2,
                    grade: Some(Grade::Worst),
                },
            ],
            vec![Segment::plain("Efficiency Score: 75.00")],
        ]
    }

    #[test]
    fn write_lines__plain() -> Result<()> {
        let mut out = Vec::new();
        write_lines(&mut out, &lines(), false)?;
        assert_eq!(String::from_utf8(out)?, "1   250M  \nEfficiency Score: 75.00\n");
        Ok(())
    }

    #[test]
    fn write_lines__colored_keeps_text_and_padding() -> Result<()> {
        let mut out = Vec::new();
        write_lines(&mut out, &lines(), true)?;
        let out = String::from_utf8(out)?;
        assert!(out.starts_with("1   "));
        assert!(out.contains("250M"));
        assert!(out.ends_with("  \nEfficiency Score: 75.00\n"));
        Ok(())
    }
}
