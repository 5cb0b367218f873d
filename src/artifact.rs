//! Checkpoint artifacts.
//!
//! A [`Dataset`] is the single-file container passed between stages: a cells
//! by genes matrix, row and column metadata, and typed maps of derived layers
//! and low-dimensional embeddings. Files start with a magic string and a
//! format version, followed by the CBOR-encoded dataset. Every read validates
//! shapes, so a stage never sees a dataset whose parts disagree.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, BufWriter, Read, Write};

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;

const MAGIC: &[u8; 8] = b"SCFLOWDS";
const VERSION: u32 = 1;

/// Named derived matrices with the same shape as `X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Counts,
    SoupxCounts,
    Log1pNorm,
    ScranNorm,
    AnalyticPearsonResiduals,
    Scaled,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Counts => "counts",
            Layer::SoupxCounts => "soupx_counts",
            Layer::Log1pNorm => "log1p_norm",
            Layer::ScranNorm => "scran_norm",
            Layer::AnalyticPearsonResiduals => "analytic_pearson_residuals",
            Layer::Scaled => "scaled",
        }
    }
}

/// Named low-dimensional representations with one row per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Embedding {
    Pca,
    Umap,
    Tsne,
    Scvi,
    Scanvi,
}

impl Embedding {
    pub fn as_str(self) -> &'static str {
        match self {
            Embedding::Pca => "pca",
            Embedding::Umap => "umap",
            Embedding::Tsne => "tsne",
            Embedding::Scvi => "scvi",
            Embedding::Scanvi => "scanvi",
        }
    }
}

/// Dense row-major matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, ArtifactError> {
        let matrix = Self { rows, cols, data };
        matrix.check()?;
        Ok(matrix)
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    /// New matrix whose column `j` is column `map[j]` of `self`, or zeros
    /// where `map[j]` is `None`.
    pub fn select_columns(&self, map: &[Option<usize>]) -> Self {
        let mut data = Vec::with_capacity(self.rows * map.len());
        for row in 0..self.rows {
            let src = self.row(row);
            data.extend(map.iter().map(|col| col.map_or(0.0, |c| src[c])));
        }

        Self {
            rows: self.rows,
            cols: map.len(),
            data,
        }
    }

    /// New matrix with only the given rows, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        let mut data = Vec::with_capacity(rows.len() * self.cols);
        for &row in rows {
            data.extend_from_slice(self.row(row));
        }

        Self {
            rows: rows.len(),
            cols: self.cols,
            data,
        }
    }

    fn check(&self) -> Result<(), ArtifactError> {
        if self.rows.checked_mul(self.cols) != Some(self.data.len()) {
            return Err(ArtifactError::MatrixShape {
                rows: self.rows,
                cols: self.cols,
                len: self.data.len(),
            });
        }
        Ok(())
    }
}

/// Names plus string-valued annotation columns for one axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotations {
    pub names: Vec<String>,
    pub columns: BTreeMap<String, Vec<String>>,
}

impl Annotations {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            columns: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn check(&self) -> Result<(), ArtifactError> {
        for (name, column) in &self.columns {
            if column.len() != self.names.len() {
                return Err(ArtifactError::Column(
                    name.clone(),
                    column.len(),
                    self.names.len(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub x: Matrix,
    pub obs: Annotations,
    pub var: Annotations,
    pub layers: BTreeMap<Layer, Matrix>,
    pub embeddings: BTreeMap<Embedding, Matrix>,
}

impl Dataset {
    pub fn new(x: Matrix, cells: Vec<String>, genes: Vec<String>) -> Result<Self, ArtifactError> {
        let dataset = Self {
            x,
            obs: Annotations::new(cells),
            var: Annotations::new(genes),
            layers: BTreeMap::new(),
            embeddings: BTreeMap::new(),
        };
        dataset.validate()?;
        Ok(dataset)
    }

    pub fn n_obs(&self) -> usize {
        self.obs.len()
    }

    pub fn n_vars(&self) -> usize {
        self.var.len()
    }

    pub fn validate(&self) -> Result<(), ArtifactError> {
        let expected = (self.n_obs(), self.n_vars());

        self.x.check()?;
        if self.x.shape() != expected {
            return Err(ArtifactError::Shape {
                what: "X".into(),
                got: self.x.shape(),
                expected,
            });
        }

        self.obs.check()?;
        self.var.check()?;

        for (layer, matrix) in &self.layers {
            matrix.check()?;
            if matrix.shape() != expected {
                return Err(ArtifactError::Shape {
                    what: format!("layer '{}'", layer.as_str()),
                    got: matrix.shape(),
                    expected,
                });
            }
        }

        for (embedding, matrix) in &self.embeddings {
            matrix.check()?;
            if matrix.shape().0 != self.n_obs() {
                return Err(ArtifactError::Shape {
                    what: format!("embedding '{}'", embedding.as_str()),
                    got: matrix.shape(),
                    expected: (self.n_obs(), matrix.shape().1),
                });
            }
        }

        Ok(())
    }

    pub fn layer(&self, layer: Layer) -> Result<&Matrix, ArtifactError> {
        self.layers
            .get(&layer)
            .ok_or_else(|| ArtifactError::Missing(format!("layer '{}'", layer.as_str())))
    }

    pub fn embedding(&self, embedding: Embedding) -> Result<&Matrix, ArtifactError> {
        self.embeddings
            .get(&embedding)
            .ok_or_else(|| ArtifactError::Missing(format!("embedding '{}'", embedding.as_str())))
    }

    /// Fails unless every listed layer and embedding is present.
    pub fn require(&self, layers: &[Layer], embeddings: &[Embedding]) -> Result<(), ArtifactError> {
        for &layer in layers {
            self.layer(layer)?;
        }
        for &embedding in embeddings {
            self.embedding(embedding)?;
        }
        Ok(())
    }

    pub fn read(path: &Utf8Path) -> Result<Self, ArtifactError> {
        let mut reader = BufReader::new(fs::File::open(path)?);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ArtifactError::Magic(path.to_owned()));
        }

        let mut version = [0u8; 4];
        reader.read_exact(&mut version)?;
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(ArtifactError::Version(path.to_owned(), version));
        }

        let dataset: Dataset = ciborium::from_reader(reader)?;
        dataset.validate()?;
        Ok(dataset)
    }

    /// Writes to a sibling temporary file first and renames it into place,
    /// so readers never observe a partially written artifact.
    pub fn write(&self, path: &Utf8Path) -> Result<(), ArtifactError> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let temp = path.with_extension("partial");
        {
            let mut writer = BufWriter::new(fs::File::create(&temp)?);
            writer.write_all(MAGIC)?;
            writer.write_all(&VERSION.to_le_bytes())?;
            ciborium::into_writer(self, &mut writer)?;
            writer.flush()?;
        }
        fs::rename(&temp, path)?;

        Ok(())
    }
}
