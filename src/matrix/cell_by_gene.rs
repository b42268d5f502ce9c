use std::collections::HashMap;

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MapperError, Result};

/// How the values of a cell by gene matrix are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Normalization {
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "log2CPM")]
    Log2Cpm,
}

/// A dense cell by gene matrix tagged with its gene identifiers and
/// normalization. Rows are cells, columns are genes.
#[derive(Debug, Clone)]
pub struct CellByGeneMatrix {
    data: Array2<f64>,
    gene_identifiers: Vec<String>,
    normalization: Normalization,
}

impl CellByGeneMatrix {
    pub fn new(
        data: Array2<f64>,
        gene_identifiers: Vec<String>,
        normalization: Normalization,
    ) -> Result<Self> {
        if data.ncols() != gene_identifiers.len() {
            return Err(MapperError::MalformedMatrix(format!(
                "matrix has {} columns but {} gene identifiers",
                data.ncols(),
                gene_identifiers.len()
            )));
        }
        Ok(Self {
            data,
            gene_identifiers,
            normalization,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_genes(&self) -> usize {
        self.data.ncols()
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn gene_identifiers(&self) -> &[String] {
        &self.gene_identifiers
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Lookup from gene identifier to column index.
    pub fn gene_to_col(&self) -> HashMap<&str, usize> {
        self.gene_identifiers
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect()
    }

    /// Convert raw counts to log2(CPM + 1) row by row. A no-op error if
    /// the matrix is already log2CPM.
    pub fn to_log2cpm_in_place(&mut self) -> Result<()> {
        if self.normalization == Normalization::Log2Cpm {
            return Err(MapperError::MalformedMatrix(
                "matrix is already log2CPM".into(),
            ));
        }
        log2cpm_rows_in_place(&mut self.data);
        self.normalization = Normalization::Log2Cpm;
        Ok(())
    }

    /// Subset to the given columns, preserving the selector's order.
    pub fn downsample_genes(&self, selected: &[usize]) -> Result<CellByGeneMatrix> {
        for &col in selected {
            if col >= self.n_genes() {
                return Err(MapperError::MalformedMatrix(format!(
                    "gene index {col} out of range for {} genes",
                    self.n_genes()
                )));
            }
        }
        let data = self.data.select(Axis(1), selected);
        let gene_identifiers = selected
            .iter()
            .map(|&col| self.gene_identifiers[col].clone())
            .collect();
        Ok(CellByGeneMatrix {
            data,
            gene_identifiers,
            normalization: self.normalization,
        })
    }

    /// Subset to the given rows, preserving the selector's order.
    pub fn downsample_cells(&self, selected: &[usize]) -> Result<CellByGeneMatrix> {
        for &row in selected {
            if row >= self.n_cells() {
                return Err(MapperError::MalformedMatrix(format!(
                    "cell index {row} out of range for {} cells",
                    self.n_cells()
                )));
            }
        }
        Ok(CellByGeneMatrix {
            data: self.data.select(Axis(0), selected),
            gene_identifiers: self.gene_identifiers.clone(),
            normalization: self.normalization,
        })
    }
}

/// Row-wise raw → log2(1 + CPM) conversion of a dense chunk. Rows whose
/// total is zero are left as zeros.
pub fn log2cpm_rows_in_place(data: &mut Array2<f64>) {
    for mut row in data.axis_iter_mut(Axis(0)) {
        let total: f64 = row.sum();
        if total > 0.0 {
            let scale = 1.0e6 / total;
            row.mapv_inplace(|x| (1.0 + x * scale).log2());
        }
    }
}
