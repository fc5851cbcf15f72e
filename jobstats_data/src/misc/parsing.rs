pub mod duration {
    use std::num::{ParseFloatError, ParseIntError};

    use derive_more::derive::{Add, AddAssign, Deref, Display, From, Into, Sub};
    use itertools::Itertools as _;
    use thiserror::Error;

    const SECONDS_PER_MINUTE: u64 = 60;
    const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
    const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;

    /// A span of time as Slurm reports it. Fractional seconds survive parsing since `TotalCPU`
    /// comes with milliseconds attached.
    #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Display, Deref, From, Into, Add, AddAssign, Sub)]
    pub struct Seconds(pub f64);

    impl Seconds {
        /// Smallest time limit Slurm can express
        pub const GRANULARITY: Seconds = Seconds(SECONDS_PER_MINUTE as f64);

        /// Parses `[D-]HH:MM:SS[.fff]`.
        ///
        /// The number of `-`/`:` separated fields decides what is present: four fields are
        /// days, hours, minutes, seconds; three drop the days; two are `MM:SS`; one is plain
        /// seconds. Absent leading fields are zero.
        pub fn parse(input: &str) -> Result<Self, DurationParseError> {
            let input = input.trim();
            if input.is_empty() {
                return Err(DurationParseError::Empty);
            }

            let (whole, fraction) = match input.split_once('.') {
                Some((whole, fraction)) => (whole, fraction),
                None => (input, ""),
            };
            let fraction = match fraction {
                "" => 0.0,
                digits => format!("0.{digits}").parse::<f64>()?,
            };

            let fields = whole
                .split(['-', ':'])
                .map(str::parse::<u64>)
                .process_results(|fields| fields.collect_vec())?;
            let (days, hours, minutes, seconds) = match fields.as_slice() {
                &[d, h, m, s] => (d, h, m, s),
                &[h, m, s] => (0, h, m, s),
                &[m, s] => (0, 0, m, s),
                &[s] => (0, 0, 0, s),
                _ => return Err(DurationParseError::TooManyFields(fields.len())),
            };

            let total = [
                (days, SECONDS_PER_DAY),
                (hours, SECONDS_PER_HOUR),
                (minutes, SECONDS_PER_MINUTE),
                (seconds, 1),
            ]
            .into_iter()
            .try_fold(0u64, |total, (count, unit)| count.checked_mul(unit)?.checked_add(total))
            .ok_or(DurationParseError::Overflow)?;
            Ok(Seconds(total as f64 + fraction))
        }

        /// Rounds to whole seconds and renders via [`format_duration`]
        pub fn to_slurm_string(self) -> String {
            format_duration(self.0.max(0.0).round() as u64)
        }
    }

    /// `D-HH:MM:SS`, leaving out `D-` entirely when there are no full days.
    pub fn format_duration(total_seconds: u64) -> String {
        let days = total_seconds / SECONDS_PER_DAY;
        let hours = total_seconds % SECONDS_PER_DAY / SECONDS_PER_HOUR;
        let minutes = total_seconds % SECONDS_PER_HOUR / SECONDS_PER_MINUTE;
        let seconds = total_seconds % SECONDS_PER_MINUTE;

        match days {
            0 => format!("{hours:02}:{minutes:02}:{seconds:02}"),
            days => format!("{days}-{hours:02}:{minutes:02}:{seconds:02}"),
        }
    }

    /// empty means empty after trimming
    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum DurationParseError {
        #[error("trying to parse an empty duration")]
        Empty,
        #[error("{0} time fields, expected at most 4 (`D-HH:MM:SS`)")]
        TooManyFields(usize),
        #[error("time field is not an unsigned integer")]
        InvalidField(#[from] ParseIntError),
        #[error("fractional seconds are not a number")]
        InvalidFraction(#[from] ParseFloatError),
        #[error("duration does not fit into 64 bits of seconds")]
        Overflow,
    }
}

pub mod quantity {
    use std::num::ParseFloatError;

    use derive_more::derive::{Add, AddAssign, Deref, Display, From, Into};
    use itertools::Itertools as _;
    use thiserror::Error;

    /// Fixed `M` to `G` factor used throughout Slurm accounting output (not 1024)
    pub const KILO: f64 = 1000.0;

    /// What `sacct` prints instead of a value it doesn't have
    pub const UNAVAILABLE_SENTINEL: &str = "-";

    /// Memory in Slurm's `M` unit. Every quantity is normalized to this before comparing.
    #[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Display, Deref, From, Into, Add, AddAssign)]
    pub struct Megabytes(pub f64);

    impl Megabytes {
        /// `1.50G` from 1000M upwards, below that `M` with at most two decimals (`250.5M`, `64M`)
        pub fn to_human(self) -> String {
            if self.0 >= KILO {
                return format!("{:.2}G", self.0 / KILO);
            }
            let formatted = format!("{:.2}", self.0);
            format!("{}M", formatted.trim_end_matches('0').trim_end_matches('.'))
        }
    }

    /// What a memory amount refers to. Slurm marks per-core requests with a trailing `c` and
    /// per-node requests with `n`.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub enum Scope {
        #[default]
        Total,
        PerCore,
        PerNode,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct Quantity {
        pub amount: Megabytes,
        pub scope: Scope,
    }

    impl Quantity {
        /// Parses `16000M`, `4Gc`, `980K`, … A missing unit means `M`, since `sacct` is asked to
        /// scale everything to `--units=M`.
        ///
        /// `Ok(None)` is the unavailable sentinel (`-` or empty), kept apart from an actual zero.
        pub fn parse(input: &str) -> Result<Option<Self>, QuantityParseError> {
            use QuantityParseError::*;
            let input = input.trim();
            if input.is_empty() || input == UNAVAILABLE_SENTINEL {
                return Ok(None);
            }

            let (rest, scope) = if let Some(rest) = input.strip_suffix('c') {
                (rest, Scope::PerCore)
            } else if let Some(rest) = input.strip_suffix('n') {
                (rest, Scope::PerNode)
            } else {
                (input, Scope::Total)
            };

            fn strip_suffix(s: &str) -> String {
                s.chars().dropping_back(1).collect()
            }

            let (magnitude, scale) = match rest.chars().last() {
                Some(digit) if digit.is_ascii_digit() => (rest.to_owned(), 1.0),
                Some(unit) => match unit.to_ascii_uppercase() {
                    'K' => (strip_suffix(rest), 1.0 / KILO),
                    'M' => (strip_suffix(rest), 1.0),
                    'G' => (strip_suffix(rest), KILO),
                    'T' => (strip_suffix(rest), KILO * KILO),
                    _ => return Err(InvalidSuffix(unit)),
                },
                None => return Err(Empty),
            };

            let magnitude = magnitude.parse::<f64>()?;
            if magnitude.is_sign_negative() {
                return Err(Negative);
            }

            Ok(Some(Quantity {
                amount: Megabytes(magnitude * scale),
                scope,
            }))
        }

        /// Absolute amount; per-core amounts get multiplied by the requested CPU count.
        pub fn total(&self, requested_cpus: u32) -> Megabytes {
            match self.scope {
                Scope::PerCore => Megabytes(self.amount.0 * f64::from(requested_cpus)),
                Scope::Total | Scope::PerNode => self.amount,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum QuantityParseError {
        #[error("nothing left to parse after removing the scope flag")]
        Empty,
        #[error("unknown unit suffix `{0}` (only K, M, G, T)")]
        InvalidSuffix(char),
        #[error("quantities can't be negative")]
        Negative,
        #[error("scalar part is not a number")]
        InvalidNumber(#[from] ParseFloatError),
    }
}

pub use duration::{format_duration, DurationParseError, Seconds};
pub use quantity::{Megabytes, Quantity, QuantityParseError, Scope};
