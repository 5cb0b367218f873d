//! Task bodies that run outside of this process.

use std::collections::BTreeMap;
use std::fs;
use std::process::Command;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};

use crate::env::Activation;
use crate::graph::TaskId;
use crate::utils::stderr_tail;

/// Everything a notebook run needs. Paths are relative to `root`.
#[derive(Debug)]
pub struct Job<'a> {
    pub id: &'a TaskId,
    pub notebook: &'a Utf8Path,
    pub inputs: &'a [Utf8PathBuf],
    pub outputs: &'a [Utf8PathBuf],
    pub params: &'a BTreeMap<String, String>,
    pub env: Option<&'a Activation>,
    pub root: &'a Utf8Path,
    /// Where the executed notebook is kept.
    pub log: Utf8PathBuf,
}

/// Runs the body of a notebook task. Called concurrently from the worker
/// threads of the scheduler.
pub trait Executor: Send + Sync {
    fn execute(&self, job: &Job<'_>) -> anyhow::Result<()>;
}

impl<F> Executor for F
where
    F: Fn(&Job<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, job: &Job<'_>) -> anyhow::Result<()> {
        self(job)
    }
}

/// Runs notebooks with `papermill`, inside the task's environment when it
/// has one.
#[derive(Debug, Clone)]
pub struct NotebookExecutor {
    frontend: String,
    runner: String,
}

impl NotebookExecutor {
    pub fn new(frontend: impl Into<String>) -> Self {
        Self {
            frontend: frontend.into(),
            runner: "papermill".into(),
        }
    }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    fn command(&self, job: &Job<'_>) -> Command {
        let mut command = match job.env {
            Some(env) => {
                let mut command = Command::new(&self.frontend);
                command
                    .arg("run")
                    .args(env.run_args())
                    .arg("--no-capture-output")
                    .arg(&self.runner);
                command
            }
            None => Command::new(&self.runner),
        };

        command
            .current_dir(job.root)
            .arg(job.notebook.as_str())
            .arg(job.log.as_str());

        for (key, value) in job.params {
            command.arg("-p").arg(key).arg(value);
        }

        command
    }
}

impl Executor for NotebookExecutor {
    fn execute(&self, job: &Job<'_>) -> anyhow::Result<()> {
        if let Some(parent) = job.root.join(&job.log).parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("couldn't create log directory {parent}"))?;
        }

        let mut command = self.command(job);
        tracing::debug!(task = %job.id, ?command, "running notebook");

        let output = command
            .output()
            .with_context(|| format!("couldn't launch notebook runner for {}", job.id))?;

        if !output.status.success() {
            bail!(
                "notebook {} exited with {} (log: {})\n{}",
                job.notebook,
                output.status,
                job.log,
                stderr_tail(&output.stderr, 20)
            );
        }

        Ok(())
    }
}
