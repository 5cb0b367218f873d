//! The single-cell analysis workflow.
//!
//! Each stage reads the checkpoint of the previous one and writes its own:
//! quality control and normalization per sample, then dimensionality
//! reduction and clustering per sample and grid point. Subsetting and
//! reference annotation are added when the configuration asks for them.

use camino::Utf8Path;

use crate::artifact::{Embedding, Layer};
use crate::builtin::Builtin;
use crate::config::Config;
use crate::rule::{Action, Rule};

const ENV_SCANPY: &str = "scanpy";
const ENV_SCARCHES: &str = "scarches";

pub fn rules(config: &Config) -> Vec<Rule> {
    let results = config.results_dir.as_str();
    let notebook = |name: &str| Action::Notebook(config.notebooks_dir.join(name));
    let count_layer = config.count_layer_to_use;

    let qc_out = format!("{results}/{{sample}}/01_quality_control.cbor");
    let norm_out = format!("{results}/{{sample}}/02_normalization.cbor");
    let dr_out = format!("{results}/{{sample}}/03_dim_reduction/{{params}}.cbor");
    let cl_out = format!("{results}/{{sample}}/04_clustering/{{params}}.cbor");

    let mut norm_layers = vec![count_layer];
    for &layer in &config.dim_reduc.layer_to_use {
        if !norm_layers.contains(&layer) {
            norm_layers.push(layer);
        }
    }

    let mut rules = vec![
        Rule::new("quality_control", notebook("01_quality_control.ipynb"))
            .per_sample()
            .input("{source}")
            .output(&qc_out)
            .env(ENV_SCANPY)
            .expects_layers([Layer::Counts]),
        Rule::new("normalization", notebook("02_normalization.ipynb"))
            .per_sample()
            .input(&qc_out)
            .output(&norm_out)
            .env(ENV_SCANPY)
            .param("count_layer_to_use", count_layer.as_str())
            .expects_layers(norm_layers),
    ];

    let mut prepared = norm_out;

    if config.subset.enabled {
        let subset_out = format!("{results}/{{sample}}/02_normalization_subset.cbor");
        rules.push(
            Rule::new(
                "subset",
                Action::Builtin(Builtin::Subset {
                    fraction: config.subset.fraction,
                    seed: config.subset.seed,
                }),
            )
            .per_sample()
            .input(&prepared)
            .output(&subset_out),
        );
        prepared = subset_out;
    }

    rules.push(
        Rule::new("dim_reduction", notebook("03_dim_reduction.ipynb"))
            .per_grid_point()
            .input(&prepared)
            .output(&dr_out)
            .env(ENV_SCANPY)
            .param("count_layer_to_use", count_layer.as_str())
            .expects_embeddings([Embedding::Pca, Embedding::Umap]),
    );

    rules.push(
        Rule::new("clustering", notebook("04_clustering.ipynb"))
            .per_grid_point()
            .input(&dr_out)
            .output(&cl_out)
            .env(ENV_SCANPY)
            .expects_embeddings([Embedding::Pca, Embedding::Umap]),
    );

    if let Some(reference) = &config.annotation.reference_features {
        rules.extend(annotation(results, &prepared, reference, &notebook));
    }

    rules
}

fn annotation(
    results: &str,
    prepared: &str,
    reference: &Utf8Path,
    notebook: &dyn Fn(&str) -> Action,
) -> [Rule; 2] {
    let aligned = format!("{results}/{{sample}}/05_annotation/aligned.cbor");
    let annotated = format!("{results}/{{sample}}/05_annotation/annotated.cbor");

    [
        Rule::new("align_features", Action::Builtin(Builtin::AlignFeatures))
            .per_sample()
            .input(prepared)
            .input(reference.as_str())
            .output(&aligned),
        Rule::new("annotation", notebook("05_annotation.ipynb"))
            .per_sample()
            .input(&aligned)
            .output(annotated)
            .env(ENV_SCARCHES)
            .expects_embeddings([Embedding::Scanvi]),
    ]
}
