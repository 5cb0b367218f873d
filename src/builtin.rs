//! Steps implemented natively on checkpoint artifacts.

use std::collections::HashMap;
use std::fs;

use anyhow::{Context, ensure};
use camino::{Utf8Path, Utf8PathBuf};

use crate::artifact::{Annotations, Dataset};
use crate::core::{Fingerprint, Hash32};

#[derive(Debug, Clone, PartialEq)]
pub enum Builtin {
    /// Inputs: dataset, reference feature list. Output: aligned dataset.
    AlignFeatures,
    /// Input: dataset. Output: dataset with a deterministic fraction of cells.
    Subset { fraction: f64, seed: u64 },
}

impl Builtin {
    pub(crate) fn run(
        &self,
        root: &Utf8Path,
        inputs: &[Utf8PathBuf],
        outputs: &[Utf8PathBuf],
    ) -> anyhow::Result<()> {
        let output = outputs.first().context("builtin step declares no output")?;

        match self {
            Builtin::AlignFeatures => {
                ensure!(
                    inputs.len() >= 2,
                    "align_features needs a dataset and a reference feature list"
                );
                let dataset = read_dataset(root, &inputs[0])?;
                let reference = read_feature_list(&root.join(&inputs[1]))?;
                let aligned = align_features(&dataset, &reference);
                tracing::debug!(
                    features = reference.len(),
                    missing = missing_features(&dataset, &reference),
                    "aligned features to reference"
                );
                aligned.write(&root.join(output))?;
            }
            Builtin::Subset { fraction, seed } => {
                let input = inputs.first().context("subset needs a dataset")?;
                let dataset = read_dataset(root, input)?;
                let subset = subset_cells(&dataset, *fraction, *seed);
                tracing::debug!(
                    before = dataset.n_obs(),
                    after = subset.n_obs(),
                    "subset cells"
                );
                subset.write(&root.join(output))?;
            }
        }

        Ok(())
    }
}

fn read_dataset(root: &Utf8Path, path: &Utf8Path) -> anyhow::Result<Dataset> {
    let path = root.join(path);
    Dataset::read(&path).with_context(|| format!("couldn't read dataset {path}"))
}

/// One feature name per line, blank lines ignored.
pub fn read_feature_list(path: &Utf8Path) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("couldn't read feature list {path}"))?;

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

fn feature_index(dataset: &Dataset) -> HashMap<&str, usize> {
    dataset
        .var
        .names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect()
}

fn missing_features(dataset: &Dataset, reference: &[String]) -> usize {
    let index = feature_index(dataset);
    reference
        .iter()
        .filter(|f| !index.contains_key(f.as_str()))
        .count()
}

/// Reorders the features of `dataset` to match `reference`. Features the
/// dataset lacks are filled with zeros in `X` and in every layer; features
/// the reference doesn't list are dropped.
pub fn align_features(dataset: &Dataset, reference: &[String]) -> Dataset {
    let index = feature_index(dataset);

    let map: Vec<Option<usize>> = reference
        .iter()
        .map(|name| index.get(name.as_str()).copied())
        .collect();

    let var = Annotations {
        names: reference.to_vec(),
        columns: dataset
            .var
            .columns
            .iter()
            .map(|(key, column)| {
                let column = map
                    .iter()
                    .map(|src| src.map(|i| column[i].clone()).unwrap_or_default())
                    .collect();
                (key.clone(), column)
            })
            .collect(),
    };

    Dataset {
        x: dataset.x.select_columns(&map),
        obs: dataset.obs.clone(),
        var,
        layers: dataset
            .layers
            .iter()
            .map(|(layer, matrix)| (*layer, matrix.select_columns(&map)))
            .collect(),
        embeddings: dataset.embeddings.clone(),
    }
}

/// Keeps cells whose seeded name hash falls below `fraction`. The choice for
/// a given cell doesn't depend on the rest of the dataset.
pub fn subset_cells(dataset: &Dataset, fraction: f64, seed: u64) -> Dataset {
    let threshold = (fraction.clamp(0.0, 1.0) * u64::MAX as f64) as u64;

    let keep: Vec<usize> = dataset
        .obs
        .names
        .iter()
        .enumerate()
        .filter(|(_, name)| fraction >= 1.0 || cell_hash(seed, name).prefix_u64() < threshold)
        .map(|(i, _)| i)
        .collect();

    let obs = Annotations {
        names: keep.iter().map(|&i| dataset.obs.names[i].clone()).collect(),
        columns: dataset
            .obs
            .columns
            .iter()
            .map(|(key, column)| (key.clone(), keep.iter().map(|&i| column[i].clone()).collect()))
            .collect(),
    };

    Dataset {
        x: dataset.x.select_rows(&keep),
        obs,
        var: dataset.var.clone(),
        layers: dataset
            .layers
            .iter()
            .map(|(layer, matrix)| (*layer, matrix.select_rows(&keep)))
            .collect(),
        embeddings: dataset
            .embeddings
            .iter()
            .map(|(embedding, matrix)| (*embedding, matrix.select_rows(&keep)))
            .collect(),
    }
}

fn cell_hash(seed: u64, name: &str) -> Hash32 {
    Fingerprint::new().field(seed.to_le_bytes()).field(name).finish()
}
