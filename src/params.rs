//! Parameter grid expansion.
//!
//! The declared domains of the dimensionality reduction parameters are
//! crossed into a list of [`GridPoint`]s. Every point renders into a tag
//! which is embedded in output file names, so distinct points always produce
//! distinct paths.

use std::collections::BTreeMap;
use std::fmt;

use itertools::iproduct;
use serde::Deserialize;

use crate::artifact::Layer;
use crate::config::DimReducConfig;
use crate::error::ConfigError;

/// Which genes feed into the PCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum GeneSelection {
    #[serde(rename = "hvg", alias = "highly_variable")]
    HighlyVariable,
    #[serde(rename = "all")]
    All,
}

impl GeneSelection {
    pub fn as_str(self) -> &'static str {
        match self {
            GeneSelection::HighlyVariable => "hvg",
            GeneSelection::All => "all",
        }
    }
}

/// Handling of the cell-cycle signal before reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub enum CellCycleMethod {
    #[serde(rename = "None", alias = "none")]
    None,
    #[serde(rename = "regress_out")]
    RegressOut,
}

impl CellCycleMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            CellCycleMethod::None => "None",
            CellCycleMethod::RegressOut => "regress_out",
        }
    }
}

/// One combination of the categorical parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPoint {
    pub layer: Layer,
    pub scale: bool,
    pub genes: GeneSelection,
    pub cc: CellCycleMethod,
    pub n_pcs: u32,
    pub n_neighbors: u32,
}

impl GridPoint {
    /// File name fragment that encodes the whole tuple.
    pub fn tag(&self) -> String {
        format!(
            "layer-{}__scale-{}__genes-{}__cc-{}__pcs-{}__nn-{}",
            self.layer.as_str(),
            self.scale,
            self.genes.as_str(),
            self.cc.as_str(),
            self.n_pcs,
            self.n_neighbors,
        )
    }

    /// Individual components by placeholder name.
    pub fn get(&self, key: &str) -> Option<String> {
        Some(match key {
            "layer" => self.layer.as_str().to_string(),
            "scale" => self.scale.to_string(),
            "genes" => self.genes.as_str().to_string(),
            "cc" => self.cc.as_str().to_string(),
            "pcs" => self.n_pcs.to_string(),
            "neighbors" => self.n_neighbors.to_string(),
            "params" => self.tag(),
            _ => return None,
        })
    }

    /// Parameters handed to the notebook of a grid task. Values are Python
    /// literals where papermill would otherwise pass a string.
    pub fn as_params(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("layer_to_use".into(), self.layer.as_str().into()),
            ("scale_data_before_pca".into(), python_bool(self.scale).into()),
            ("genes_for_pca".into(), self.genes.as_str().into()),
            ("cc_method".into(), self.cc.as_str().into()),
            ("pca_n_components".into(), self.n_pcs.to_string()),
            ("umap_n_neighbors".into(), self.n_neighbors.to_string()),
        ])
    }
}

fn python_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

impl fmt::Display for GridPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// The expanded Cartesian product of all declared domains.
#[derive(Debug, Clone)]
pub struct ParamGrid {
    points: Vec<GridPoint>,
}

impl ParamGrid {
    pub fn from_config(config: &DimReducConfig) -> Result<Self, ConfigError> {
        let layers = domain("layer_to_use", &config.layer_to_use)?;
        let scales = domain("scale_data_before_pca", &config.scale_data_before_pca)?;
        let genes = domain("genes_for_pca", &config.genes_for_pca)?;
        let ccs = domain("cc_method", &config.cc_method)?;
        let pcs = domain("pca_n_components", &config.pca_n_components)?;
        let nns = domain("umap_n_neighbors", &config.umap_n_neighbors)?;

        let points = iproduct!(layers, scales, genes, ccs, pcs, nns)
            .map(|(layer, scale, genes, cc, n_pcs, n_neighbors)| GridPoint {
                layer,
                scale,
                genes,
                cc,
                n_pcs,
                n_neighbors,
            })
            .collect();

        Ok(Self { points })
    }

    pub fn points(&self) -> &[GridPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Deduplicates a domain, keeping the first occurrence of every value.
fn domain<T>(name: &'static str, values: &[T]) -> Result<Vec<T>, ConfigError>
where
    T: Copy + PartialEq,
{
    let mut out: Vec<T> = Vec::with_capacity(values.len());
    for &value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }

    if out.is_empty() {
        return Err(ConfigError::EmptyDomain(name));
    }

    Ok(out)
}
