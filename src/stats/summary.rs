use std::collections::BTreeMap;
use std::path::Path;

use ndarray::{Array2, ArrayView1};

use crate::error::{MapperError, Result};
use crate::sparse::{read_json_string, write_json_string};
use crate::taxonomy::TaxonomyTree;

/// Per-cluster summary statistics over all genes: the five additive
/// accumulators the marker scorer and the mean-profile builder consume.
/// `gt0` counts cells expressing a gene at all; `gt1` counts cells above
/// 1 CPM (in log2CPM space, a value above 1.0).
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub cluster_to_row: BTreeMap<String, usize>,
    pub col_names: Vec<String>,
    pub n_cells: Vec<u64>,
    pub sum: Array2<f64>,
    pub sumsq: Array2<f64>,
    pub gt0: Array2<u64>,
    pub gt1: Array2<u64>,
    pub taxonomy: Option<TaxonomyTree>,
}

impl ClusterStats {
    pub fn zeros(cluster_names: &[String], col_names: Vec<String>) -> Self {
        let n_clusters = cluster_names.len();
        let n_genes = col_names.len();
        let cluster_to_row = cluster_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();
        Self {
            cluster_to_row,
            col_names,
            n_cells: vec![0; n_clusters],
            sum: Array2::zeros((n_clusters, n_genes)),
            sumsq: Array2::zeros((n_clusters, n_genes)),
            gt0: Array2::zeros((n_clusters, n_genes)),
            gt1: Array2::zeros((n_clusters, n_genes)),
            taxonomy: None,
        }
    }

    pub fn n_clusters(&self) -> usize {
        self.n_cells.len()
    }

    pub fn n_genes(&self) -> usize {
        self.col_names.len()
    }

    pub fn row_for_cluster(&self, cluster: &str) -> Result<usize> {
        self.cluster_to_row.get(cluster).copied().ok_or_else(|| {
            MapperError::InconsistentInputs(format!(
                "cluster {cluster} absent from precomputed stats"
            ))
        })
    }

    /// Fold one cell into a cluster's accumulators.
    pub fn accumulate_cell(&mut self, cluster_row: usize, values: ArrayView1<'_, f64>) {
        self.n_cells[cluster_row] += 1;
        for (gene, &x) in values.iter().enumerate() {
            if x == 0.0 {
                continue;
            }
            self.sum[[cluster_row, gene]] += x;
            self.sumsq[[cluster_row, gene]] += x * x;
            if x > 0.0 {
                self.gt0[[cluster_row, gene]] += 1;
            }
            if x > 1.0 {
                self.gt1[[cluster_row, gene]] += 1;
            }
        }
    }

    /// Add another accumulator elementwise. Statistics are additive over
    /// disjoint cell sets, so merging partial passes is exact.
    pub fn merge_from(&mut self, other: &ClusterStats) -> Result<()> {
        if self.cluster_to_row != other.cluster_to_row
            || self.col_names != other.col_names
        {
            return Err(MapperError::InconsistentInputs(
                "cannot merge stats over different clusters or genes".into(),
            ));
        }
        for (a, b) in self.n_cells.iter_mut().zip(&other.n_cells) {
            *a += b;
        }
        self.sum += &other.sum;
        self.sumsq += &other.sumsq;
        self.gt0 += &other.gt0;
        self.gt1 += &other.gt1;
        Ok(())
    }

    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let file = hdf5::File::create(path)?;
        write_json_string(
            &file,
            "cluster_to_row",
            &serde_json::to_string(&self.cluster_to_row)?,
        )?;
        write_json_string(&file, "col_names", &serde_json::to_string(&self.col_names)?)?;
        if let Some(tree) = &self.taxonomy {
            write_json_string(&file, "taxonomy_tree", &tree.to_str())?;
        }
        let n_cells: Vec<i64> = self.n_cells.iter().map(|&v| v as i64).collect();
        file.new_dataset_builder()
            .with_data(&n_cells)
            .create("n_cells")?;
        file.new_dataset_builder()
            .with_data(&self.sum)
            .create("sum")?;
        file.new_dataset_builder()
            .with_data(&self.sumsq)
            .create("sumsq")?;
        file.new_dataset_builder()
            .with_data(&self.gt0.mapv(|v| v as i64))
            .create("gt0")?;
        file.new_dataset_builder()
            .with_data(&self.gt1.mapv(|v| v as i64))
            .create("gt1")?;
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MapperError::MissingInput(path.to_path_buf()));
        }
        let file = hdf5::File::open(path)?;
        let cluster_to_row: BTreeMap<String, usize> =
            serde_json::from_str(&read_json_string(&file.dataset("cluster_to_row")?)?)?;
        let col_names: Vec<String> =
            serde_json::from_str(&read_json_string(&file.dataset("col_names")?)?)?;
        let taxonomy = if file.link_exists("taxonomy_tree") {
            Some(TaxonomyTree::from_str(&read_json_string(
                &file.dataset("taxonomy_tree")?,
            )?)?)
        } else {
            None
        };
        let n_cells: Vec<u64> = file
            .dataset("n_cells")?
            .read_raw::<i64>()?
            .into_iter()
            .map(|v| v as u64)
            .collect();
        let sum = file.dataset("sum")?.read_2d::<f64>()?;
        let sumsq = file.dataset("sumsq")?.read_2d::<f64>()?;
        let gt0 = file.dataset("gt0")?.read_2d::<i64>()?.mapv(|v| v as u64);
        let gt1 = file.dataset("gt1")?.read_2d::<i64>()?.mapv(|v| v as u64);

        let n_clusters = cluster_to_row.len();
        let n_genes = col_names.len();
        if n_cells.len() != n_clusters
            || sum.dim() != (n_clusters, n_genes)
            || sumsq.dim() != (n_clusters, n_genes)
            || gt0.dim() != (n_clusters, n_genes)
            || gt1.dim() != (n_clusters, n_genes)
        {
            return Err(MapperError::InconsistentInputs(format!(
                "stats file {} has mismatched array shapes",
                path.display()
            )));
        }
        Ok(Self {
            cluster_to_row,
            col_names,
            n_cells,
            sum,
            sumsq,
            gt0,
            gt1,
            taxonomy,
        })
    }
}
