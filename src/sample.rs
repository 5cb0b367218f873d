//! Sample resolution.
//!
//! Samples come either from a tab-separated sheet or from a scan of the
//! resource directory. Exactly one of the two sources is used; when neither
//! is configured resolution fails instead of yielding an empty set.

use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::config::Config;
use crate::error::SampleError;

/// Directory scanned for samples when `samples_in_directory` is enabled.
pub const SAMPLE_DIR: &str = "resources/samples";

const DEFAULT_PATTERN: &str = r"^(?P<treatment>[A-Za-z]+)[_-]?(?P<timepoint>\d+[A-Za-z]*)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub path: Utf8PathBuf,
    pub treatment: Option<String>,
    pub timepoint: Option<String>,
}

impl Sample {
    fn new(id: String, path: Utf8PathBuf, pattern: &Regex) -> Self {
        let (treatment, timepoint) = match pattern.captures(&id) {
            Some(captures) => {
                let group = |name| captures.name(name).map(|m| m.as_str().to_string());
                (group("treatment"), group("timepoint"))
            }
            None => (None, None),
        };

        Self {
            id,
            path,
            treatment,
            timepoint,
        }
    }
}

/// Ordered, duplicate-free collection of samples.
#[derive(Debug, Clone, Default)]
pub struct SampleSet {
    samples: Vec<Sample>,
}

impl SampleSet {
    pub(crate) fn from_vec(samples: Vec<Sample>) -> Result<Self, SampleError> {
        let mut seen = HashSet::new();
        for sample in &samples {
            if sample.id.contains(['/', '\\']) || sample.id == "." || sample.id == ".." {
                return Err(SampleError::InvalidName(sample.id.clone()));
            }
            if !seen.insert(sample.id.as_str()) {
                return Err(SampleError::Duplicate(sample.id.clone()));
            }
        }
        Ok(Self { samples })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.samples.iter().map(|s| s.id.as_str())
    }

    pub fn get(&self, id: &str) -> Option<&Sample> {
        self.samples.iter().find(|s| s.id == id)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl<'a> IntoIterator for &'a SampleSet {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Resolves the sample set relative to the working directory `root`.
pub fn resolve(config: &Config, root: &Utf8Path) -> Result<SampleSet, SampleError> {
    let pattern = config.data.sample_pattern.as_deref().unwrap_or(DEFAULT_PATTERN);
    let pattern = Regex::new(pattern)?;

    match (&config.data.sample_sheet_path, config.scan_directory()) {
        (Some(sheet), scan) => {
            if scan {
                tracing::warn!("both a sample sheet and directory scanning are configured, using the sheet");
            }
            read_sheet(&root.join(sheet), &pattern)
        }
        (None, true) => scan_directory(&root.join(SAMPLE_DIR), &pattern),
        (None, false) => Err(SampleError::NoSource),
    }
}

fn read_sheet(path: &Utf8Path, pattern: &Regex) -> Result<SampleSet, SampleError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let name_col = headers
        .iter()
        .position(|h| h == "sample_name")
        .ok_or_else(|| SampleError::MissingColumn(path.to_owned(), "sample_name"))?;
    let path_col = headers
        .iter()
        .position(|h| h == "path" || h == "sample_path")
        .ok_or_else(|| SampleError::MissingColumn(path.to_owned(), "path"))?;

    let base = path.parent().unwrap_or(Utf8Path::new(""));
    let mut samples = Vec::new();

    for record in reader.records() {
        let record = record?;
        let id = record.get(name_col).unwrap_or_default().to_string();
        let source = record.get(path_col).unwrap_or_default();

        if id.is_empty() {
            continue;
        }
        if source.is_empty() {
            return Err(SampleError::EmptyPath(id));
        }

        samples.push(Sample::new(id, base.join(source), pattern));
    }

    if samples.is_empty() {
        return Err(SampleError::EmptySheet(path.to_owned()));
    }

    tracing::info!(count = samples.len(), sheet = %path, "read sample sheet");
    SampleSet::from_vec(samples)
}

fn scan_directory(dir: &Utf8Path, pattern: &Regex) -> Result<SampleSet, SampleError> {
    let glob_pattern = dir.join("*");
    let mut samples = Vec::new();

    // glob yields entries sorted by path
    for entry in glob::glob(glob_pattern.as_str())? {
        let path = Utf8PathBuf::try_from(entry?)?;
        let Some(name) = path.file_name() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let id = strip_extensions(name).to_string();
        samples.push(Sample::new(id, path, pattern));
    }

    if samples.is_empty() {
        return Err(SampleError::EmptyDirectory(dir.to_owned()));
    }

    tracing::info!(count = samples.len(), dir = %dir, "discovered samples");
    SampleSet::from_vec(samples)
}

/// `A_1.raw.h5ad` -> `A_1`
fn strip_extensions(name: &str) -> &str {
    match name.find('.') {
        Some(0) | None => name,
        Some(i) => &name[..i],
    }
}
