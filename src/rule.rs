//! Rule templates.
//!
//! A [`Rule`] declares file path patterns for its inputs and outputs. The
//! patterns contain placeholders that are bound once per sample, or once per
//! sample and grid point, when the graph is expanded.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;

use crate::artifact::{Embedding, Layer};
use crate::builtin::Builtin;
use crate::error::GraphError;
use crate::params::GridPoint;
use crate::sample::Sample;

/// Placeholders bound from the sample.
const SAMPLE_KEYS: &[&str] = &["sample", "source"];

/// Placeholders bound from the grid point.
const GRID_KEYS: &[&str] = &["params", "layer", "scale", "genes", "cc", "pcs", "neighbors"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(&'static str),
}

/// A path pattern such as `results/{sample}/dim_reduction/{params}.cbor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(raw: impl Into<String>) -> Result<Self, GraphError> {
        let raw = raw.into();
        let mut segments = Vec::new();
        let mut rest = raw.as_str();

        while !rest.is_empty() {
            match rest.find(['{', '}']) {
                None => {
                    segments.push(Segment::Literal(rest.to_string()));
                    break;
                }
                Some(i) if rest.as_bytes()[i] == b'}' => {
                    return Err(GraphError::Unbalanced(raw.clone()));
                }
                Some(i) => {
                    if i > 0 {
                        segments.push(Segment::Literal(rest[..i].to_string()));
                    }
                    let after = &rest[i + 1..];
                    let end = after
                        .find('}')
                        .ok_or_else(|| GraphError::Unbalanced(raw.clone()))?;
                    let name = &after[..end];

                    if name.contains('{') {
                        return Err(GraphError::Unbalanced(raw.clone()));
                    }

                    let key = SAMPLE_KEYS
                        .iter()
                        .chain(GRID_KEYS)
                        .copied()
                        .find(|k| *k == name)
                        .ok_or_else(|| {
                            GraphError::UnknownPlaceholder(raw.clone(), name.to_string())
                        })?;

                    segments.push(Segment::Placeholder(key));
                    rest = &after[end + 1..];
                }
            }
        }

        Ok(Self { raw, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn placeholders(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Placeholder(key) => Some(*key),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, bindings: &Bindings<'_>, rule: &str) -> Result<Utf8PathBuf, GraphError> {
        let mut out = String::with_capacity(self.raw.len());

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(key) => {
                    let value = bindings.get(key).ok_or_else(|| {
                        GraphError::Unbound(self.raw.clone(), *key, rule.to_string())
                    })?;
                    out.push_str(&value);
                }
            }
        }

        Ok(Utf8PathBuf::from(out))
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Concrete values for one task instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bindings<'a> {
    pub sample: Option<&'a Sample>,
    pub point: Option<&'a GridPoint>,
}

impl Bindings<'_> {
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "sample" => self.sample.map(|s| s.id.clone()),
            "source" => self.sample.map(|s| s.path.to_string()),
            _ => self.point.and_then(|p| p.get(key)),
        }
    }

    /// Wildcard values identifying the task, in declaration order.
    pub fn wildcards(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(sample) = self.sample {
            out.push(("sample", sample.id.clone()));
        }
        if let Some(point) = self.point {
            for &key in &GRID_KEYS[1..] {
                if let Some(value) = point.get(key) {
                    out.push((key, value));
                }
            }
        }
        out
    }
}

/// How many task instances a rule expands into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Once,
    PerSample,
    PerSampleGrid,
}

impl Scope {
    fn allows(self, key: &str) -> bool {
        match self {
            Scope::Once => false,
            Scope::PerSample => SAMPLE_KEYS.contains(&key),
            Scope::PerSampleGrid => true,
        }
    }
}

/// What a task does when it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Parameterized notebook run by an [`Executor`](crate::Executor).
    Notebook(Utf8PathBuf),
    /// Step implemented natively on checkpoint artifacts.
    Builtin(Builtin),
    /// Completion signal with no body.
    Aggregate,
}

impl Action {
    /// Stable description mixed into task fingerprints.
    pub(crate) fn signature(&self) -> String {
        match self {
            Action::Notebook(path) => format!("notebook:{path}"),
            Action::Builtin(builtin) => format!("builtin:{builtin:?}"),
            Action::Aggregate => "aggregate".into(),
        }
    }
}

/// Layers and embeddings that must exist in the first output afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Expects {
    pub layers: Vec<Layer>,
    pub embeddings: Vec<Embedding>,
}

impl Expects {
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.embeddings.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub(crate) name: String,
    pub(crate) scope: Scope,
    pub(crate) inputs: Vec<String>,
    pub(crate) outputs: Vec<String>,
    pub(crate) marker: Option<String>,
    pub(crate) env: Option<String>,
    pub(crate) action: Action,
    pub(crate) params: BTreeMap<String, String>,
    pub(crate) expects: Expects,
}

impl Rule {
    pub fn new(name: impl Into<String>, action: Action) -> Self {
        Self {
            name: name.into(),
            scope: Scope::Once,
            inputs: Vec::new(),
            outputs: Vec::new(),
            marker: None,
            env: None,
            action,
            params: BTreeMap::new(),
            expects: Expects::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn per_sample(mut self) -> Self {
        self.scope = Scope::PerSample;
        self
    }

    pub fn per_grid_point(mut self) -> Self {
        self.scope = Scope::PerSampleGrid;
        self
    }

    pub fn input(mut self, template: impl Into<String>) -> Self {
        self.inputs.push(template.into());
        self
    }

    pub fn output(mut self, template: impl Into<String>) -> Self {
        self.outputs.push(template.into());
        self
    }

    /// Completion marker; defaults to the first output with `.done` appended.
    pub fn marker(mut self, template: impl Into<String>) -> Self {
        self.marker = Some(template.into());
        self
    }

    pub fn env(mut self, name: impl Into<String>) -> Self {
        self.env = Some(name.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn expects_layers(mut self, layers: impl IntoIterator<Item = Layer>) -> Self {
        self.expects.layers.extend(layers);
        self
    }

    pub fn expects_embeddings(mut self, embeddings: impl IntoIterator<Item = Embedding>) -> Self {
        self.expects.embeddings.extend(embeddings);
        self
    }

    pub(crate) fn scope(&self) -> Scope {
        self.scope
    }

    /// Parses every template and checks that it only uses placeholders the
    /// scope can bind.
    pub(crate) fn compile(&self) -> Result<CompiledRule, GraphError> {
        let parse_all = |templates: &[String]| {
            templates
                .iter()
                .map(|t| self.checked(t))
                .collect::<Result<Vec<_>, _>>()
        };

        let inputs = parse_all(&self.inputs)?;
        let outputs = parse_all(&self.outputs)?;

        let marker = match (&self.marker, self.outputs.first()) {
            (Some(marker), _) => self.checked(marker)?,
            (None, Some(first)) => self.checked(&format!("{first}.done"))?,
            (None, None) => return Err(GraphError::NoMarker(self.name.clone())),
        };

        Ok(CompiledRule {
            inputs,
            outputs,
            marker,
        })
    }

    fn checked(&self, raw: &str) -> Result<PathTemplate, GraphError> {
        let template = PathTemplate::parse(raw)?;
        if let Some(key) = template.placeholders().find(|k| !self.scope.allows(k)) {
            return Err(GraphError::Unbound(raw.to_string(), key, self.name.clone()));
        }
        Ok(template)
    }
}

pub(crate) struct CompiledRule {
    pub inputs: Vec<PathTemplate>,
    pub outputs: Vec<PathTemplate>,
    pub marker: PathTemplate,
}

impl CompiledRule {
    pub fn bind(
        &self,
        bindings: &Bindings<'_>,
        rule: &str,
    ) -> Result<(Vec<Utf8PathBuf>, Vec<Utf8PathBuf>, Utf8PathBuf), GraphError> {
        let render = |templates: &[PathTemplate]| {
            templates
                .iter()
                .map(|t| t.render(bindings, rule))
                .collect::<Result<Vec<_>, _>>()
        };

        Ok((
            render(&self.inputs)?,
            render(&self.outputs)?,
            self.marker.render(bindings, rule)?,
        ))
    }
}
