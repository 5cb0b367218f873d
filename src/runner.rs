mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow, bail};
use camino::Utf8Path;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::artifact::Dataset;
use crate::config::CachePolicy;
use crate::core::Hash32;
use crate::env::EnvPool;
use crate::error::BuildError;
use crate::executor::{Executor, Job};
use crate::graph::{TaskGraph, TaskNode};
use crate::memo;
use crate::rule::Action;

pub use diagnostics::{Outcome, Report, Summary, TaskExecution};

/// Operator choices for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Number of tasks executed at the same time.
    pub cores: usize,
    /// Report what would run without running anything.
    pub dry_run: bool,
    /// Ignore completion markers.
    pub forceall: bool,
    /// Task ids or rule names; empty means everything.
    pub targets: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cores: std::thread::available_parallelism().map_or(1, usize::from),
            dry_run: false,
            forceall: false,
            targets: Vec::new(),
        }
    }
}

/// Shared, read-only state of a run.
pub(crate) struct Context<'a> {
    pub graph: &'a TaskGraph,
    pub root: &'a Utf8Path,
    pub policy: CachePolicy,
    pub envs: &'a EnvPool,
    pub executor: &'a dyn Executor,
    pub options: &'a RunOptions,
}

/// Executes the selected part of the task graph on a thread pool, starting
/// each task as soon as all of its dependencies are done.
///
/// The scheduler loop runs on the calling thread and owns all bookkeeping.
/// Workers get immutable access to the graph and send their outcome back
/// over a channel. When a task fails, everything downstream of it is marked
/// as blocked and never started, while unrelated branches keep going.
pub(crate) fn run_tasks_parallel(
    ctx: &Context<'_>,
    nodes_to_run: &HashSet<NodeIndex>,
) -> Result<Report, BuildError> {
    let graph = ctx.graph;

    let mut dependency_counts: HashMap<NodeIndex, usize> = nodes_to_run
        .iter()
        .map(|&i| {
            (
                i,
                graph
                    .dependencies(i)
                    .filter(|dep| nodes_to_run.contains(dep))
                    .count(),
            )
        })
        .collect();

    let total_tasks = nodes_to_run.len();
    let mut completed_tasks = 0;
    let mut report = Report::default();

    if total_tasks == 0 {
        return Ok(report);
    }

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total_tasks as u64);
    root_span.pb_set_style(&crate::utils::get_style_root()?);
    root_span.pb_set_message(if ctx.options.dry_run {
        "Checking tasks..."
    } else {
        "Running tasks..."
    });
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task()?;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.options.cores.max(1))
        .build()?;

    pool.in_place_scope(|s| -> Result<(), BuildError> {
        let (result_sender, result_receiver) =
            channel::<(NodeIndex, Outcome, Instant, Duration)>();

        let spawn_task = |index: NodeIndex, upstream_ran: bool| {
            let sender = result_sender.clone();
            let pb_style = pb_style.clone();

            s.spawn(move |_| {
                let node = graph.node(index);
                let span = tracing::span!(Level::INFO, "task", id = %node.id);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&node.id.to_string());
                let _enter = span.enter();

                let start = Instant::now();
                let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    run_task(ctx, node, upstream_ran)
                })) {
                    Ok(outcome) => outcome,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };
                        discard(ctx.root, node);
                        Outcome::Failed(msg)
                    }
                };

                // the receiver only goes away once the scheduler has given up
                let _ = sender.send((index, outcome, start, start.elapsed()));
            });
        };

        for &index in nodes_to_run {
            if dependency_counts.get(&index).copied().unwrap_or(0) == 0 {
                spawn_task(index, false);
            }
        }

        while completed_tasks < total_tasks {
            let (index, outcome, start, duration) = result_receiver
                .recv()
                .map_err(|_| anyhow!("all workers exited before the run completed"))?;

            completed_tasks += 1;
            root_span.pb_inc(1);

            let node = graph.node(index);
            match &outcome {
                Outcome::Executed => {
                    report
                        .execution_times
                        .insert(index, TaskExecution { start, duration });
                }
                Outcome::Failed(msg) => {
                    tracing::error!(task = %node.id, "{msg}");
                    report
                        .execution_times
                        .insert(index, TaskExecution { start, duration });
                    report.failures.push((node.id.clone(), msg.clone()));

                    for blocked in graph.descendants(index) {
                        if nodes_to_run.contains(&blocked)
                            && dependency_counts.remove(&blocked).is_some()
                        {
                            tracing::warn!(task = %graph.node(blocked).id, upstream = %node.id, "blocked");
                            report.outcomes.insert(blocked, Outcome::Blocked);
                            completed_tasks += 1;
                            root_span.pb_inc(1);
                        }
                    }
                }
                _ => {}
            }
            report.outcomes.insert(index, outcome);

            for dependent in graph.dependents(index) {
                let Some(count) = dependency_counts.get_mut(&dependent) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    let upstream_ran = graph.dependencies(dependent).any(|dep| {
                        matches!(
                            report.outcomes.get(&dep),
                            Some(Outcome::Executed | Outcome::WouldRun)
                        )
                    });
                    spawn_task(dependent, upstream_ran);
                }
            }
        }

        Ok(())
    })?;

    let summary = report.summary();
    tracing::info!(
        executed = summary.executed,
        cached = summary.cached,
        would_run = summary.would_run,
        failed = summary.failed,
        blocked = summary.blocked,
        "run finished"
    );

    Ok(report)
}

/// Decides whether `node` has to run, runs it, and records completion.
fn run_task(ctx: &Context<'_>, node: &TaskNode, upstream_ran: bool) -> Outcome {
    let dry_run = ctx.options.dry_run;

    // the aggregate task only signals that its dependencies are complete
    if node.marker.is_none() {
        return match (upstream_ran, dry_run) {
            (false, _) => Outcome::Cached,
            (true, false) => Outcome::Executed,
            (true, true) => Outcome::WouldRun,
        };
    }

    if dry_run && (upstream_ran || ctx.options.forceall) {
        return Outcome::WouldRun;
    }

    let fingerprint = match memo::fingerprint(node, ctx.root) {
        Ok(fingerprint) => fingerprint,
        Err(_) if dry_run => return Outcome::WouldRun,
        Err(e) => return Outcome::Failed(format!("couldn't hash inputs: {e}")),
    };

    if !ctx.options.forceall {
        match memo::staleness(node, ctx.root, ctx.policy, fingerprint) {
            None => {
                tracing::debug!(task = %node.id, "up to date");
                return Outcome::Cached;
            }
            Some(reason) => tracing::debug!(task = %node.id, %reason, "stale"),
        }
    }

    if dry_run {
        return Outcome::WouldRun;
    }

    match execute(ctx, node, fingerprint) {
        Ok(()) => Outcome::Executed,
        Err(e) => {
            discard(ctx.root, node);
            Outcome::Failed(format!("{e:#}"))
        }
    }
}

fn execute(ctx: &Context<'_>, node: &TaskNode, fingerprint: Hash32) -> anyhow::Result<()> {
    memo::invalidate(node, ctx.root).context("couldn't remove stale outputs")?;

    for output in &node.outputs {
        if let Some(parent) = ctx.root.join(output).parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let s = Instant::now();

    match &node.action {
        Action::Notebook(notebook) => {
            let activation = node
                .env
                .as_ref()
                .map(|env| ctx.envs.activate(env))
                .transpose()?;

            let job = Job {
                id: &node.id,
                notebook,
                inputs: &node.inputs,
                outputs: &node.outputs,
                params: &node.params,
                env: activation.as_ref(),
                root: ctx.root,
                log: format!("logs/{}/{}.ipynb", node.id.rule, node.tag).into(),
            };
            ctx.executor.execute(&job)?;
        }
        Action::Builtin(builtin) => builtin.run(ctx.root, &node.inputs, &node.outputs)?,
        Action::Aggregate => {}
    }

    verify(ctx.root, node)?;
    memo::record(node, ctx.root, fingerprint)?;

    tracing::info!(task = %node.id, "finished {}", crate::utils::as_overhead(s));
    Ok(())
}

/// Checks that the task actually produced what it declares.
fn verify(root: &Utf8Path, node: &TaskNode) -> anyhow::Result<()> {
    if let Some(missing) = node.outputs.iter().find(|out| !root.join(out).exists()) {
        bail!("declared output {missing} was not produced");
    }

    if !node.expects.is_empty() {
        let Some(first) = node.outputs.first() else {
            bail!("expected layers declared without an output");
        };
        Dataset::read(&root.join(first))
            .and_then(|ds| ds.require(&node.expects.layers, &node.expects.embeddings))
            .with_context(|| format!("output {first} is incomplete"))?;
    }

    Ok(())
}

fn discard(root: &Utf8Path, node: &TaskNode) {
    if let Err(e) = memo::invalidate(node, root) {
        tracing::warn!(task = %node.id, "couldn't remove outputs of failed task: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use camino::Utf8PathBuf;

    use super::*;
    use crate::artifact::Layer;
    use crate::config::{DimReducConfig, EnvConfig};
    use crate::graph::tests::samples;
    use crate::params::ParamGrid;
    use crate::rule::Rule;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: Utf8PathBuf,
        graph: TaskGraph,
        envs: EnvPool,
        policy: CachePolicy,
    }

    impl Fixture {
        fn new(rules: Vec<Rule>) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
            fs::create_dir_all(root.join("raw")).unwrap();
            fs::write(root.join("raw/A.h5"), "a").unwrap();
            fs::write(root.join("raw/B.h5"), "b").unwrap();

            let grid = ParamGrid::from_config(&DimReducConfig::default()).unwrap();
            let graph = TaskGraph::build(
                &rules,
                &samples(&["A", "B"]),
                &grid,
                &EnvConfig::default(),
                &root,
            )
            .unwrap();
            let envs = EnvPool::new(&EnvConfig::default(), root.clone(), graph.envs());

            Self {
                _dir: dir,
                root,
                graph,
                envs,
                policy: CachePolicy::Content,
            }
        }

        fn run(&self, executor: &dyn Executor, options: &RunOptions) -> Report {
            let ctx = Context {
                graph: &self.graph,
                root: &self.root,
                policy: self.policy,
                envs: &self.envs,
                executor,
                options,
            };
            let selected = self.graph.select(&options.targets).unwrap();
            run_tasks_parallel(&ctx, &selected).unwrap()
        }

        fn outcome(&self, report: &Report, id: &str) -> Outcome {
            let (index, _) = self
                .graph
                .nodes()
                .find(|(_, n)| n.id.to_string() == id)
                .unwrap();
            report.outcome(index).cloned().unwrap()
        }
    }

    fn chain() -> Vec<Rule> {
        vec![
            Rule::new("qc", Action::Notebook("qc.ipynb".into()))
                .per_sample()
                .input("{source}")
                .output("r/{sample}/qc.txt"),
            Rule::new("norm", Action::Notebook("norm.ipynb".into()))
                .per_sample()
                .input("r/{sample}/qc.txt")
                .output("r/{sample}/norm.txt"),
        ]
    }

    /// Writes every output as the concatenation of the inputs.
    fn concat(calls: &AtomicUsize) -> impl Fn(&Job<'_>) -> anyhow::Result<()> + Send + Sync + '_ {
        move |job: &Job<'_>| -> anyhow::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            let mut text = String::new();
            for input in job.inputs {
                text.push_str(&fs::read_to_string(job.root.join(input))?);
            }
            for output in job.outputs {
                fs::write(job.root.join(output), format!("{text}+{}", job.id.rule))?;
            }
            Ok(())
        }
    }

    fn options() -> RunOptions {
        RunOptions {
            cores: 2,
            ..RunOptions::default()
        }
    }

    #[test]
    fn test_second_run_executes_nothing() {
        let fx = Fixture::new(chain());
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        let first = fx.run(&executor, &options());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(first.summary().failed, 0);
        assert_eq!(
            fs::read_to_string(fx.root.join("r/A/norm.txt")).unwrap(),
            "a+qc+norm"
        );

        let second = fx.run(&executor, &options());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(second.summary().executed, 0);
        assert_eq!(second.summary().cached, fx.graph.len());
    }

    #[test]
    fn test_content_change_reruns_branch() {
        let fx = Fixture::new(chain());
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        fx.run(&executor, &options());
        fs::write(fx.root.join("raw/A.h5"), "A").unwrap();

        let report = fx.run(&executor, &options());
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(fx.outcome(&report, "norm[sample=A]"), Outcome::Executed);
        assert_eq!(fx.outcome(&report, "norm[sample=B]"), Outcome::Cached);
        assert_eq!(
            fs::read_to_string(fx.root.join("r/A/norm.txt")).unwrap(),
            "A+qc+norm"
        );
    }

    fn set_mtime(path: &Utf8Path, time: std::time::SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_timestamp_policy_reruns_touched_branch() {
        let mut fx = Fixture::new(chain());
        fx.policy = CachePolicy::Timestamp;
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        fx.run(&executor, &options());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let later = std::time::SystemTime::now() + Duration::from_secs(3600);
        set_mtime(&fx.root.join("raw/A.h5"), later);

        let report = fx.run(&executor, &options());
        assert_eq!(fx.outcome(&report, "qc[sample=A]"), Outcome::Executed);
        assert_eq!(fx.outcome(&report, "qc[sample=B]"), Outcome::Cached);
        assert_eq!(fx.outcome(&report, "norm[sample=B]"), Outcome::Cached);
    }

    #[test]
    fn test_timestamp_policy_keeps_stale_output_when_mtime_unchanged() {
        let mut fx = Fixture::new(chain());
        fx.policy = CachePolicy::Timestamp;
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        fx.run(&executor, &options());

        let raw = fx.root.join("raw/A.h5");
        let before = fs::metadata(&raw).unwrap().modified().unwrap();
        fs::write(&raw, "edited").unwrap();
        set_mtime(&raw, before);

        let report = fx.run(&executor, &options());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(report.summary().executed, 0);
        assert_eq!(
            fs::read_to_string(fx.root.join("r/A/norm.txt")).unwrap(),
            "a+qc+norm"
        );
    }

    #[test]
    fn test_failure_blocks_only_its_branch() {
        let fx = Fixture::new(chain());
        let calls = AtomicUsize::new(0);
        let inner = concat(&calls);
        let executor = |job: &Job<'_>| -> anyhow::Result<()> {
            if job.id.to_string() == "qc[sample=B]" {
                fs::write(job.root.join("r/B/qc.txt"), "partial")?;
                bail!("notebook crashed");
            }
            inner(job)
        };

        let report = fx.run(&executor, &options());

        assert!(matches!(fx.outcome(&report, "qc[sample=B]"), Outcome::Failed(_)));
        assert_eq!(fx.outcome(&report, "norm[sample=B]"), Outcome::Blocked);
        assert_eq!(fx.outcome(&report, "all"), Outcome::Blocked);
        assert_eq!(fx.outcome(&report, "norm[sample=A]"), Outcome::Executed);
        assert!(!fx.root.join("r/B/qc.txt").exists());
        assert!(!fx.root.join("r/B/qc.txt.done").exists());

        let err = report.into_result().unwrap_err();
        match err {
            BuildError::Failed(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0.to_string(), "qc[sample=B]");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panic_is_a_failure() {
        let fx = Fixture::new(chain());
        let executor = |_: &Job<'_>| -> anyhow::Result<()> { panic!("kaboom") };

        let report = fx.run(&executor, &options());
        assert_eq!(report.summary().failed, 2);
        assert_eq!(report.summary().blocked, 3);
        assert!(matches!(
            fx.outcome(&report, "qc[sample=A]"),
            Outcome::Failed(msg) if msg.contains("kaboom")
        ));
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fx = Fixture::new(chain());
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        let dry = RunOptions {
            dry_run: true,
            ..options()
        };
        let report = fx.run(&executor, &dry);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.summary().would_run, fx.graph.len());
        assert!(!fx.root.join("r").exists());

        fx.run(&executor, &options());
        fs::write(fx.root.join("raw/B.h5"), "B").unwrap();
        let report = fx.run(&executor, &dry);
        assert_eq!(fx.outcome(&report, "qc[sample=A]"), Outcome::Cached);
        assert_eq!(fx.outcome(&report, "qc[sample=B]"), Outcome::WouldRun);
        assert_eq!(fx.outcome(&report, "norm[sample=B]"), Outcome::WouldRun);
    }

    #[test]
    fn test_forceall_and_targets() {
        let fx = Fixture::new(chain());
        let calls = AtomicUsize::new(0);
        let executor = concat(&calls);

        let qc_only = RunOptions {
            targets: vec!["qc".into()],
            ..options()
        };
        let report = fx.run(&executor, &qc_only);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.outcomes.len(), 2);

        let force = RunOptions {
            forceall: true,
            ..options()
        };
        fx.run(&executor, &force);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_missing_expected_layer_fails() {
        let rules = vec![
            Rule::new("norm", Action::Notebook("norm.ipynb".into()))
                .per_sample()
                .input("{source}")
                .output("r/{sample}/norm.cbor")
                .expects_layers([Layer::Log1pNorm]),
        ];
        let fx = Fixture::new(rules);
        let executor = |job: &Job<'_>| -> anyhow::Result<()> {
            crate::artifact::tests::sample_dataset().write(&job.root.join(&job.outputs[0]))?;
            Ok(())
        };

        let report = fx.run(&executor, &options());
        assert!(matches!(
            fx.outcome(&report, "norm[sample=A]"),
            Outcome::Failed(msg) if msg.contains("log1p_norm")
        ));
        assert!(!fx.root.join("r/A/norm.cbor").exists());
    }

    #[test]
    fn test_declared_output_must_exist() {
        let fx = Fixture::new(chain());
        let executor = |_: &Job<'_>| -> anyhow::Result<()> { Ok(()) };

        let report = fx.run(&executor, &options());
        assert!(matches!(
            fx.outcome(&report, "qc[sample=A]"),
            Outcome::Failed(msg) if msg.contains("was not produced")
        ));
    }
}
