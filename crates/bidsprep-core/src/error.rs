use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("expected exactly one file matching '{pattern}', found {}", .matches.len())]
    AmbiguousOrMissingSource {
        pattern: String,
        matches: Vec<PathBuf>,
    },

    #[error("failed to stage {} -> {}: {source}", .from.display(), .to.display())]
    StagingFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tool '{tool}' failed: {failure}")]
    ToolExecutionFailed { tool: String, failure: ToolFailure },

    #[error("{}: cannot fill metadata, upstream key '{key}' is missing", .path.display())]
    MetadataKeyMissingUpstream { path: PathBuf, key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error in {}: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Result table error: {0}")]
    Csv(#[from] csv::Error),

    #[error("NIfTI header error in {}: {source}", .path.display())]
    Nifti {
        path: PathBuf,
        #[source]
        source: nifti::NiftiError,
    },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("{0}")]
    Other(String),
}

/// How an external invocation ended when it did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolFailure {
    ExitCode(i32),
    Timeout(Duration),
    /// Killed by a signal or otherwise ended without an exit code.
    Terminated,
    Launch(String),
    Engine(String),
    /// The process succeeded but a declared output is still missing.
    MissingOutput(PathBuf),
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolFailure::ExitCode(code) => write!(f, "exit code {}", code),
            ToolFailure::Timeout(limit) => write!(f, "timed out after {}s", limit.as_secs()),
            ToolFailure::Terminated => write!(f, "terminated without exit code"),
            ToolFailure::Launch(msg) => write!(f, "could not launch: {}", msg),
            ToolFailure::Engine(msg) => write!(f, "engine error: {}", msg),
            ToolFailure::MissingOutput(path) => {
                write!(f, "expected output {} was not produced", path.display())
            }
        }
    }
}

impl Error {
    pub fn tool(tool: impl Into<String>, failure: ToolFailure) -> Self {
        Error::ToolExecutionFailed {
            tool: tool.into(),
            failure,
        }
    }

    /// Short name of the error kind, used in run reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AmbiguousOrMissingSource { .. } => "AmbiguousOrMissingSource",
            Error::StagingFailed { .. } => "StagingFailed",
            Error::ToolExecutionFailed { .. } => "ToolExecutionFailed",
            Error::MetadataKeyMissingUpstream { .. } => "MetadataKeyMissingUpstream",
            Error::Io(_) => "Io",
            Error::Config(_) => "Config",
            Error::Json { .. } => "Json",
            Error::Csv(_) => "Csv",
            Error::Nifti { .. } => "Nifti",
            Error::Registry(_) => "Registry",
            Error::Other(_) => "Other",
        }
    }
}
