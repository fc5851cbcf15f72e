use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that stop a whole report. Anything scoped to a single job or field degrades to
/// "unavailable" instead and never shows up here.
#[derive(Debug, Error)]
pub enum Error {
    /// The accounting command ran but reported failure. `stderr` is passed on as-is.
    #[error("`{command}` failed with status {status:?}")]
    UpstreamFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("could not run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed accounting table: {0}")]
    MalformedTable(String),

    #[error("accounting row has no `{0}` column")]
    MissingColumn(&'static str),
}

impl Error {
    pub fn malformed(message: impl Into<String>) -> Self {
        Error::MalformedTable(message.into())
    }
}
