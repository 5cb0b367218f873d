//! The configuration document.
//!
//! A [`Config`] is parsed once from YAML, validated, and from then on passed
//! by reference to every component that needs it. Nothing in the crate reads
//! configuration from global state.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Deserializer};

use crate::artifact::Layer;
use crate::error::ConfigError;
use crate::params::{CellCycleMethod, GeneSelection, ParamGrid};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,
    /// Legacy top-level spelling of `data.samples_in_directory`.
    #[serde(default)]
    pub samples_in_directory: bool,
    #[serde(default)]
    pub conda_envs: EnvConfig,
    #[serde(default = "default_count_layer")]
    pub count_layer_to_use: Layer,
    #[serde(default)]
    pub subset: SubsetConfig,
    #[serde(default)]
    pub dim_reduc: DimReducConfig,
    #[serde(default)]
    pub annotation: AnnotationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_results_dir")]
    pub results_dir: Utf8PathBuf,
    #[serde(default = "default_notebooks_dir")]
    pub notebooks_dir: Utf8PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub sample_sheet_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub samples_in_directory: bool,
    /// Regex with `treatment` and `timepoint` groups applied to sample names.
    #[serde(default)]
    pub sample_pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvConfig {
    #[serde(default)]
    pub use_existing_envs: bool,
    #[serde(default = "default_envs_path")]
    pub envs_path: Utf8PathBuf,
    /// Binary used to create and enter environments.
    #[serde(default = "default_frontend")]
    pub frontend: String,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            use_existing_envs: false,
            envs_path: default_envs_path(),
            frontend: default_frontend(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubsetConfig {
    #[serde(rename = "use", default)]
    pub enabled: bool,
    #[serde(default = "default_fraction")]
    pub fraction: f64,
    #[serde(default)]
    pub seed: u64,
}

impl Default for SubsetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fraction: default_fraction(),
            seed: 0,
        }
    }
}

/// Declared domains of the parameter grid. Each key accepts either a single
/// value or a list of values.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DimReducConfig {
    #[serde(default = "default_layers", deserialize_with = "one_or_many")]
    pub layer_to_use: Vec<Layer>,
    #[serde(default = "default_scale", deserialize_with = "one_or_many")]
    pub scale_data_before_pca: Vec<bool>,
    #[serde(default = "default_genes", deserialize_with = "one_or_many")]
    pub genes_for_pca: Vec<GeneSelection>,
    #[serde(default = "default_cc", deserialize_with = "one_or_many")]
    pub cc_method: Vec<CellCycleMethod>,
    #[serde(default = "default_pcs", deserialize_with = "one_or_many")]
    pub pca_n_components: Vec<u32>,
    #[serde(default = "default_neighbors", deserialize_with = "one_or_many")]
    pub umap_n_neighbors: Vec<u32>,
}

impl Default for DimReducConfig {
    fn default() -> Self {
        Self {
            layer_to_use: default_layers(),
            scale_data_before_pca: default_scale(),
            genes_for_pca: default_genes(),
            cc_method: default_cc(),
            pca_n_components: default_pcs(),
            umap_n_neighbors: default_neighbors(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnnotationConfig {
    /// Feature list of the reference model, one name per line. Annotation
    /// rules are only declared when this is set.
    #[serde(default, deserialize_with = "empty_as_none")]
    pub reference_features: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Fresh when the recorded input fingerprint matches the current content.
    #[default]
    Content,
    /// Fresh when outputs are newer than inputs.
    Timestamp,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default)]
    pub policy: CachePolicy,
}

impl Config {
    /// Reads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Utf8Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_owned(), e))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.subset.enabled && !(self.subset.fraction > 0.0 && self.subset.fraction <= 1.0) {
            return Err(ConfigError::Fraction(self.subset.fraction));
        }

        if let Some(pattern) = &self.data.sample_pattern {
            regex::Regex::new(pattern)?;
        }

        ParamGrid::from_config(&self.dim_reduc).map(|_| ())
    }

    /// Directory scanning is enabled by either spelling of the flag.
    pub fn scan_directory(&self) -> bool {
        self.data.samples_in_directory || self.samples_in_directory
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Utf8PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(Utf8PathBuf::from))
}

fn default_count_layer() -> Layer {
    Layer::Counts
}

fn default_results_dir() -> Utf8PathBuf {
    "results".into()
}

fn default_notebooks_dir() -> Utf8PathBuf {
    "notebooks".into()
}

fn default_envs_path() -> Utf8PathBuf {
    "envs".into()
}

fn default_frontend() -> String {
    "conda".into()
}

fn default_fraction() -> f64 {
    0.1
}

fn default_layers() -> Vec<Layer> {
    vec![Layer::Log1pNorm]
}

fn default_scale() -> Vec<bool> {
    vec![false]
}

fn default_genes() -> Vec<GeneSelection> {
    vec![GeneSelection::HighlyVariable]
}

fn default_cc() -> Vec<CellCycleMethod> {
    vec![CellCycleMethod::None]
}

fn default_pcs() -> Vec<u32> {
    vec![50]
}

fn default_neighbors() -> Vec<u32> {
    vec![15]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config() {
        let config = Config::from_yaml("data:\n  samples_in_directory: true\n").unwrap();
        assert!(config.scan_directory());
        assert!(config.data.sample_sheet_path.is_none());
        assert_eq!(config.count_layer_to_use, Layer::Counts);
        assert_eq!(config.cache.policy, CachePolicy::Content);
        assert_eq!(config.results_dir, "results");
    }

    #[test]
    fn test_empty_sheet_path_is_none() {
        let config = Config::from_yaml("data:\n  sample_sheet_path: ''\n").unwrap();
        assert!(config.data.sample_sheet_path.is_none());
    }

    #[test]
    fn test_top_level_directory_flag() {
        let config = Config::from_yaml("samples_in_directory: true\n").unwrap();
        assert!(config.scan_directory());
    }

    #[test]
    fn test_scalar_and_list_domains() {
        let yaml = r#"
dim_reduc:
  layer_to_use: log1p_norm
  scale_data_before_pca: [true, false]
  genes_for_pca: hvg
  cc_method: ["None", "regress_out"]
  pca_n_components: [50, 100]
  umap_n_neighbors: 30
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let dr = &config.dim_reduc;
        assert_eq!(dr.layer_to_use, vec![Layer::Log1pNorm]);
        assert_eq!(dr.scale_data_before_pca, vec![true, false]);
        assert_eq!(
            dr.cc_method,
            vec![CellCycleMethod::None, CellCycleMethod::RegressOut]
        );
        assert_eq!(dr.pca_n_components, vec![50, 100]);
        assert_eq!(dr.umap_n_neighbors, vec![30]);
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let yaml = "subset:\n  use: true\n  fraction: 1.5\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Fraction(_))
        ));
    }

    #[test]
    fn test_fraction_ignored_when_subset_disabled() {
        let yaml = "subset:\n  use: false\n  fraction: 0\n";
        assert!(Config::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_rejects_empty_domain() {
        let yaml = "dim_reduc:\n  pca_n_components: []\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::EmptyDomain("pca_n_components"))
        ));
    }

    #[test]
    fn test_rejects_bad_pattern() {
        let yaml = "data:\n  sample_pattern: '(unclosed'\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Pattern(_))
        ));
    }

    #[test]
    fn test_rejects_misplaced_domain() {
        let yaml = "samples_in_directory: true\npca_n_components: [50, 100]\n";
        match Config::from_yaml(yaml) {
            Err(ConfigError::Parse(e)) => assert!(e.to_string().contains("pca_n_components")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_nested_key() {
        let yaml = "dim_reduc:\n  umap_neighbours: 30\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));

        let yaml = "subset:\n  use: true\n  fractoin: 0.5\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_rejects_unknown_layer() {
        let yaml = "count_layer_to_use: raw_stuff\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }
}
