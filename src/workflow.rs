use camino::{Utf8Path, Utf8PathBuf};

use crate::config::Config;
use crate::env::EnvPool;
use crate::error::ScflowError;
use crate::executor::{Executor, NotebookExecutor};
use crate::graph::TaskGraph;
use crate::params::ParamGrid;
use crate::rule::Rule;
use crate::runner::{self, Context, Report, RunOptions};
use crate::sample::{self, SampleSet};

/// A configured workflow with its task graph built and validated.
///
/// Everything that can be checked without running a task is checked here,
/// so configuration and graph errors surface before any work starts.
pub struct Workflow {
    config: Config,
    root: Utf8PathBuf,
    samples: SampleSet,
    grid: ParamGrid,
    graph: TaskGraph,
    envs: EnvPool,
}

impl Workflow {
    /// Builds the single-cell pipeline for `config`, with all relative paths
    /// resolved against `root`.
    pub fn new(config: Config, root: impl Into<Utf8PathBuf>) -> Result<Self, ScflowError> {
        let rules = crate::pipeline::rules(&config);
        Self::with_rules(config, root, &rules)
    }

    /// Builds a workflow from an arbitrary rule set.
    pub fn with_rules(
        config: Config,
        root: impl Into<Utf8PathBuf>,
        rules: &[Rule],
    ) -> Result<Self, ScflowError> {
        let root = root.into();
        config.validate()?;

        let samples = sample::resolve(&config, &root)?;
        let grid = ParamGrid::from_config(&config.dim_reduc)?;
        let graph = TaskGraph::build(rules, &samples, &grid, &config.conda_envs, &root)?;
        let envs = EnvPool::new(&config.conda_envs, root.clone(), graph.envs());

        tracing::info!(
            samples = samples.len(),
            grid_points = grid.len(),
            tasks = graph.len(),
            "workflow ready"
        );

        Ok(Self {
            config,
            root,
            samples,
            grid,
            graph,
            envs,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn samples(&self) -> &SampleSet {
        &self.samples
    }

    pub fn grid(&self) -> &ParamGrid {
        &self.grid
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// The default executor, using the configured environment frontend.
    pub fn notebook_executor(&self) -> NotebookExecutor {
        NotebookExecutor::new(self.envs.frontend())
    }

    /// Runs the tasks selected by `options`. Fails if any task failed; the
    /// error names every one of them.
    pub fn run(&self, executor: &dyn Executor, options: &RunOptions) -> Result<Report, ScflowError> {
        Ok(self.run_report(executor, options)?.into_result()?)
    }

    /// Like [`Workflow::run`], but task failures stay in the returned
    /// report. Only errors that prevent scheduling are returned as `Err`.
    pub fn run_report(
        &self,
        executor: &dyn Executor,
        options: &RunOptions,
    ) -> Result<Report, ScflowError> {
        let selected = self.graph.select(&options.targets)?;

        let ctx = Context {
            graph: &self.graph,
            root: &self.root,
            policy: self.config.cache.policy,
            envs: &self.envs,
            executor,
            options,
        };

        Ok(runner::run_tasks_parallel(&ctx, &selected)?)
    }
}
