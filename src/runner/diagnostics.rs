use std::collections::HashMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;

use crate::error::BuildError;
use crate::graph::{TaskGraph, TaskId};

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What happened to a scheduled task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Executed,
    /// Products were reused.
    Cached,
    /// Dry run only.
    WouldRun,
    Failed(String),
    /// An upstream task failed.
    Blocked,
}

/// Number of tasks per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub executed: usize,
    pub cached: usize,
    pub would_run: usize,
    pub failed: usize,
    pub blocked: usize,
}

/// Result of one run over the task graph.
#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: HashMap<NodeIndex, Outcome>,
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
    pub(crate) failures: Vec<(TaskId, String)>,
}

impl Report {
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in self.outcomes.values() {
            match outcome {
                Outcome::Executed => summary.executed += 1,
                Outcome::Cached => summary.cached += 1,
                Outcome::WouldRun => summary.would_run += 1,
                Outcome::Failed(_) => summary.failed += 1,
                Outcome::Blocked => summary.blocked += 1,
            }
        }
        summary
    }

    pub fn outcome(&self, index: NodeIndex) -> Option<&Outcome> {
        self.outcomes.get(&index)
    }

    pub fn failures(&self) -> &[(TaskId, String)] {
        &self.failures
    }

    /// Turns a run with failed tasks into an error naming each of them.
    pub fn into_result(self) -> Result<Self, BuildError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(BuildError::Failed(self.failures))
        }
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by outcome
    /// and, for executed tasks, by duration.
    ///
    /// * **Green** to **Red**: fast to slow
    /// * **Blue**: cached
    /// * **Grey**: blocked or not scheduled
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (mut min_time, mut max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold((f64::MAX, f64::MIN), |(lo, hi), secs| (lo.min(secs), hi.max(secs)));

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (index, node) in graph.nodes() {
            let name = node.id.to_string().replace('"', "\\\"");

            let (label, color) = match (self.outcomes.get(&index), times.get(&index)) {
                (Some(Outcome::Failed(_)), _) => ("Failed".to_string(), "#FF6B6B".to_string()),
                (Some(Outcome::Executed), Some(exec)) => {
                    let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                    (format!("{:.2?}", exec.duration), gradient(t))
                }
                (Some(Outcome::Cached), _) => ("Cached".to_string(), "#ADD8E6".to_string()),
                (Some(Outcome::WouldRun), _) => ("Would run".to_string(), "#FFFACD".to_string()),
                (Some(Outcome::Blocked), _) => ("Blocked".to_string(), "#D3D3D3".to_string()),
                _ => ("Skipped".to_string(), "#F5F5F5".to_string()),
            };

            let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for (index, _) in graph.nodes() {
            for dependent in graph.dependents(index) {
                let _ = writeln!(f, "    {:?} --> {:?}", index.index(), dependent.index());
            }
        }

        f
    }
}

/// 0.0 is green, 0.5 yellow, 1.0 red.
fn gradient(t: f64) -> String {
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}
