//! Task graph construction.
//!
//! Rules are expanded against the sample set and the parameter grid into
//! task nodes. Edges are induced from path equality: a task depends on every
//! task that produces one of its inputs, either as an output or as a
//! completion marker.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::config::EnvConfig;
use crate::env::ExecEnv;
use crate::error::GraphError;
use crate::params::ParamGrid;
use crate::rule::{Action, Bindings, Expects, Rule, Scope};
use crate::sample::SampleSet;

/// Name of the aggregate task that completes the whole workflow.
pub const ALL: &str = "all";

/// Rule name together with the wildcard values it was bound with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    pub rule: String,
    pub wildcards: Vec<(&'static str, String)>,
}

impl TaskId {
    pub fn new(rule: impl Into<String>) -> Self {
        Self {
            rule: rule.into(),
            wildcards: Vec::new(),
        }
    }

    pub fn wildcard(&self, key: &str) -> Option<&str> {
        self.wildcards
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rule)?;
        if self.wildcards.is_empty() {
            return Ok(());
        }

        f.write_str("[")?;
        for (i, (key, value)) in self.wildcards.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("]")
    }
}

/// A bound task instance.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: TaskId,
    /// File name fragment identifying this instance within its rule.
    pub tag: String,
    pub inputs: Vec<Utf8PathBuf>,
    pub outputs: Vec<Utf8PathBuf>,
    /// `None` only for the aggregate task.
    pub marker: Option<Utf8PathBuf>,
    pub env: Option<ExecEnv>,
    pub action: Action,
    pub params: BTreeMap<String, String>,
    pub expects: Expects,
}

impl TaskNode {
    /// Every path this task writes, marker included.
    pub fn products(&self) -> impl Iterator<Item = &Utf8Path> {
        self.outputs
            .iter()
            .chain(self.marker.iter())
            .map(Utf8PathBuf::as_path)
    }
}

pub struct TaskGraph {
    pub(crate) graph: DiGraph<TaskNode, ()>,
    all: NodeIndex,
}

impl TaskGraph {
    /// Expands `rules` and validates the result: outputs are unique, every
    /// input is produced by some task or already exists under `root`, and
    /// the graph is acyclic.
    pub fn build(
        rules: &[Rule],
        samples: &SampleSet,
        grid: &ParamGrid,
        envs: &EnvConfig,
        root: &Utf8Path,
    ) -> Result<Self, GraphError> {
        let mut seen = HashSet::from([ALL]);
        for rule in rules {
            if !seen.insert(rule.name()) {
                return Err(GraphError::DuplicateRule(rule.name().to_string()));
            }
        }

        let mut graph = DiGraph::new();
        for rule in rules {
            for node in expand(rule, samples, grid, envs)? {
                graph.add_node(node);
            }
        }

        let producers = index_products(&graph)?;

        let mut edges = BTreeSet::new();
        for index in graph.node_indices() {
            let node = &graph[index];
            for input in &node.inputs {
                match producers.get(input.as_path()) {
                    Some(&producer) => {
                        edges.insert((producer, index));
                    }
                    None if root.join(input).exists() => {}
                    None => {
                        return Err(GraphError::MissingInput {
                            task: node.id.clone(),
                            path: input.clone(),
                        });
                    }
                }
            }
        }

        for &(from, to) in &edges {
            graph.add_edge(from, to, ());
        }

        let terminals: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&i| graph.neighbors_directed(i, Direction::Outgoing).next().is_none())
            .collect();

        let all = graph.add_node(TaskNode {
            id: TaskId::new(ALL),
            tag: ALL.into(),
            inputs: terminals
                .iter()
                .filter_map(|&i| graph[i].marker.clone())
                .collect(),
            outputs: Vec::new(),
            marker: None,
            env: None,
            action: Action::Aggregate,
            params: BTreeMap::new(),
            expects: Expects::default(),
        });
        for terminal in terminals {
            graph.add_edge(terminal, all, ());
        }

        petgraph::algo::toposort(&graph, None)
            .map_err(|cycle| GraphError::Cycle(graph[cycle.node_id()].id.clone()))?;

        tracing::debug!(
            tasks = graph.node_count(),
            edges = graph.edge_count(),
            "built task graph"
        );

        Ok(Self { graph, all })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, index: NodeIndex) -> &TaskNode {
        &self.graph[index]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &TaskNode)> {
        self.graph.node_indices().map(|i| (i, &self.graph[i]))
    }

    pub fn find(&self, id: &TaskId) -> Option<NodeIndex> {
        self.graph.node_indices().find(|&i| self.graph[i].id == *id)
    }

    /// Distinct environments referenced by any task.
    pub fn envs(&self) -> HashSet<&ExecEnv> {
        self.graph
            .node_weights()
            .filter_map(|node| node.env.as_ref())
            .collect()
    }

    pub fn dependencies(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Incoming)
    }

    pub fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }

    /// The tasks needed to complete `targets`: every task whose full id or
    /// rule name matches, plus all of their ancestors. No targets means the
    /// aggregate task.
    pub fn select(&self, targets: &[String]) -> Result<HashSet<NodeIndex>, GraphError> {
        let mut stack = Vec::new();

        if targets.is_empty() {
            stack.push(self.all);
        }

        for target in targets {
            let before = stack.len();
            stack.extend(self.graph.node_indices().filter(|&i| {
                let id = &self.graph[i].id;
                id.rule == *target || id.to_string() == *target
            }));
            if stack.len() == before {
                return Err(GraphError::UnknownTarget(target.clone()));
            }
        }

        let mut selected = HashSet::new();
        while let Some(index) = stack.pop() {
            if selected.insert(index) {
                stack.extend(self.dependencies(index));
            }
        }

        Ok(selected)
    }

    /// All tasks reachable downstream of `index`, excluding itself.
    pub fn descendants(&self, index: NodeIndex) -> HashSet<NodeIndex> {
        let mut found = HashSet::new();
        let mut stack: Vec<_> = self.dependents(index).collect();
        while let Some(next) = stack.pop() {
            if found.insert(next) {
                stack.extend(self.dependents(next));
            }
        }
        found
    }
}

impl fmt::Display for TaskGraph {
    /// Mermaid flowchart of the whole graph.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].id.to_string().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for edge in self.graph.edge_references() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

fn expand(
    rule: &Rule,
    samples: &SampleSet,
    grid: &ParamGrid,
    envs: &EnvConfig,
) -> Result<Vec<TaskNode>, GraphError> {
    let compiled = rule.compile()?;
    let env = rule.env.as_deref().map(|name| ExecEnv::resolve(envs, name));

    let bindings: Vec<Bindings<'_>> = match rule.scope() {
        Scope::Once => vec![Bindings::default()],
        Scope::PerSample => samples
            .iter()
            .map(|sample| Bindings {
                sample: Some(sample),
                point: None,
            })
            .collect(),
        Scope::PerSampleGrid => samples
            .iter()
            .flat_map(|sample| {
                grid.points().iter().map(move |point| Bindings {
                    sample: Some(sample),
                    point: Some(point),
                })
            })
            .collect(),
    };

    bindings
        .into_iter()
        .map(|b| -> Result<TaskNode, GraphError> {
            let (inputs, outputs, marker) = compiled.bind(&b, rule.name())?;

            let mut params = rule.params.clone();
            if let Some(sample) = b.sample {
                params.insert("sample".into(), sample.id.clone());
            }
            if let Some(point) = b.point {
                params.extend(point.as_params());
            }
            if let Some(input) = inputs.first() {
                params.insert("input_path".into(), input.to_string());
            }
            if let Some(output) = outputs.first() {
                params.insert("output_path".into(), output.to_string());
            }

            let tag = match (b.sample, b.point) {
                (Some(sample), Some(point)) => format!("{}__{}", sample.id, point.tag()),
                (Some(sample), None) => sample.id.clone(),
                _ => rule.name().to_string(),
            };

            Ok(TaskNode {
                id: TaskId {
                    rule: rule.name().to_string(),
                    wildcards: b.wildcards(),
                },
                tag,
                inputs,
                outputs,
                marker: Some(marker),
                env: env.clone(),
                action: rule.action.clone(),
                params,
                expects: rule.expects.clone(),
            })
        })
        .collect()
}

fn index_products(
    graph: &DiGraph<TaskNode, ()>,
) -> Result<HashMap<&Utf8Path, NodeIndex>, GraphError> {
    let mut producers: HashMap<&Utf8Path, NodeIndex> = HashMap::new();

    for index in graph.node_indices() {
        for path in graph[index].products() {
            if let Some(&first) = producers.get(path) {
                return Err(GraphError::DuplicateOutput {
                    path: path.to_owned(),
                    first: graph[first].id.clone(),
                    second: graph[index].id.clone(),
                });
            }
            producers.insert(path, index);
        }
    }

    Ok(producers)
}
