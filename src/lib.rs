#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod artifact;
mod builtin;
mod config;
mod core;
mod env;
mod error;
mod executor;
mod graph;
mod memo;
mod params;
pub mod pipeline;
mod rule;
mod runner;
mod sample;
mod utils;
mod workflow;

pub use crate::artifact::{Annotations, Dataset, Embedding, Layer, Matrix};
pub use crate::builtin::{Builtin, align_features, read_feature_list, subset_cells};
pub use crate::config::{
    AnnotationConfig, CacheConfig, CachePolicy, Config, DataConfig, DimReducConfig, EnvConfig,
    SubsetConfig,
};
pub use crate::env::{Activation, ExecEnv};
pub use crate::error::*;
pub use crate::executor::{Executor, Job, NotebookExecutor};
pub use crate::graph::{TaskGraph, TaskId, TaskNode};
pub use crate::params::{CellCycleMethod, GeneSelection, GridPoint, ParamGrid};
pub use crate::rule::{Action, Expects, Rule, Scope};
pub use crate::runner::{Outcome, Report, RunOptions, Summary, TaskExecution};
pub use crate::sample::{SAMPLE_DIR, Sample, SampleSet};
pub use crate::utils::as_overhead;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::workflow::Workflow;
