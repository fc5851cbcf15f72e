pub mod efficiency;
pub mod error;
pub mod job;
pub mod misc {
    pub mod parsing;
}
pub mod report;
pub mod rollup;
pub mod slurm;
pub mod table;

pub use error::{Error, Result};
