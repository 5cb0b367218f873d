use camino::Utf8PathBuf;
use thiserror::Error;

use crate::graph::TaskId;

#[derive(Debug, Error)]
pub enum ScflowError {
    #[error("Error in configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error("Error while resolving samples:\n{0}")]
    Sample(#[from] SampleError),

    #[error("Error while constructing the task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while running the workflow:\n{0}")]
    Build(#[from] BuildError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file {0}.\n{1}")]
    Read(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse config file.\n{0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("subset.fraction must be in (0, 1], got {0}")]
    Fraction(f64),

    #[error("Parameter domain '{0}' is empty")]
    EmptyDomain(&'static str),

    #[error("Invalid sample pattern.\n{0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("No samples detected: set data.sample_sheet_path or enable samples_in_directory")]
    NoSource,

    #[error("No samples detected in directory {0}")]
    EmptyDirectory(Utf8PathBuf),

    #[error("Sample sheet {0} contains no samples")]
    EmptySheet(Utf8PathBuf),

    #[error("Sample sheet {0} is missing required column '{1}'")]
    MissingColumn(Utf8PathBuf, &'static str),

    #[error("Sample '{0}' is listed more than once")]
    Duplicate(String),

    #[error("Sample '{0}' has an empty path")]
    EmptyPath(String),

    #[error("Sample name '{0}' can't be used in a file name")]
    InvalidName(String),

    #[error("Invalid sample pattern.\n{0}")]
    Pattern(#[from] regex::Error),

    #[error("Couldn't read sample sheet.\n{0}")]
    Sheet(#[from] csv::Error),

    #[error("Couldn't scan sample directory.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Template '{0}': unbalanced braces")]
    Unbalanced(String),

    #[error("Template '{0}': unknown placeholder '{{{1}}}'")]
    UnknownPlaceholder(String, String),

    #[error("Template '{0}': placeholder '{{{1}}}' is not bound for rule '{2}'")]
    Unbound(String, &'static str, String),

    #[error("Rule '{0}' has neither outputs nor a completion marker")]
    NoMarker(String),

    #[error("Rule '{0}' is declared more than once")]
    DuplicateRule(String),

    #[error("Output {path} is produced by both {first} and {second}")]
    DuplicateOutput {
        path: Utf8PathBuf,
        first: TaskId,
        second: TaskId,
    },

    #[error("Task {task} requires {path}, which no rule produces and which does not exist")]
    MissingInput { task: TaskId, path: Utf8PathBuf },

    #[error("Cycle detected in task graph at {0}")]
    Cycle(TaskId),

    #[error("Unknown target '{0}'")]
    UnknownTarget(String),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0} is not a checkpoint artifact")]
    Magic(Utf8PathBuf),

    #[error("{0} has unsupported artifact version {1}")]
    Version(Utf8PathBuf, u32),

    #[error("Couldn't decode artifact.\n{0}")]
    Decode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("Couldn't encode artifact.\n{0}")]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("Matrix has {len} values, expected {rows}x{cols}")]
    MatrixShape { rows: usize, cols: usize, len: usize },

    #[error("{what} has shape {got:?}, expected {expected:?}")]
    Shape {
        what: String,
        got: (usize, usize),
        expected: (usize, usize),
    },

    #[error("Metadata column '{0}' has {1} values, expected {2}")]
    Column(String, usize, usize),

    #[error("Artifact is missing {0}")]
    Missing(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Couldn't create thread pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Couldn't write completion marker.\n{0}")]
    Marker(#[from] serde_json::Error),

    #[error("{} task(s) failed:\n{}", .0.len(), format_failures(.0))]
    Failed(Vec<(TaskId, String)>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_failures(failures: &[(TaskId, String)]) -> String {
    failures
        .iter()
        .map(|(id, msg)| format!("  {id}: {msg}"))
        .collect::<Vec<_>>()
        .join("\n")
}
