use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::binary::BitMatrix;
use crate::error::{MapperError, Result};
use crate::sparse::read_json_string;

/// In-memory view of a reference marker file: the two packed
/// `(n_genes, n_pairs)` masks plus the pair and gene indexes needed to
/// navigate them.
#[derive(Debug, Clone)]
pub struct MarkerGeneArray {
    gene_names: Vec<String>,
    leaf_level: String,
    pair_to_idx: HashMap<(String, String), usize>,
    n_pairs: usize,
    is_marker: BitMatrix,
    up_regulated: BitMatrix,
}

impl MarkerGeneArray {
    pub fn from_h5_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MapperError::MissingInput(path.to_path_buf()));
        }
        let file = hdf5::File::open(path)?;
        let gene_names: Vec<String> =
            serde_json::from_str(&read_json_string(&file.dataset("gene_names")?)?)?;
        let n_pairs_raw: Vec<i64> = file.dataset("n_pairs")?.read_raw()?;
        let n_pairs = *n_pairs_raw.first().ok_or_else(|| {
            MapperError::MalformedMatrix("marker file has empty n_pairs".into())
        })? as usize;

        let nested: BTreeMap<String, BTreeMap<String, BTreeMap<String, usize>>> =
            serde_json::from_str(&read_json_string(&file.dataset("pair_to_idx")?)?)?;
        let (leaf_level, by_first) = nested.into_iter().next().ok_or_else(|| {
            MapperError::MalformedMatrix("marker file has empty pair_to_idx".into())
        })?;
        let mut pair_to_idx = HashMap::new();
        for (a, by_second) in by_first {
            for (b, idx) in by_second {
                pair_to_idx.insert((a.clone(), b), idx);
            }
        }

        let is_marker = BitMatrix::read_from_group(&file.group("markers")?)?;
        let up_regulated = BitMatrix::read_from_group(&file.group("up_regulated")?)?;
        if is_marker.n_rows() != gene_names.len()
            || is_marker.n_cols() != n_pairs
            || up_regulated.n_rows() != gene_names.len()
            || up_regulated.n_cols() != n_pairs
        {
            return Err(MapperError::MalformedMatrix(format!(
                "marker masks in {} do not match gene/pair counts",
                path.display()
            )));
        }
        Ok(Self {
            gene_names,
            leaf_level,
            pair_to_idx,
            n_pairs,
            is_marker,
            up_regulated,
        })
    }

    pub fn gene_names(&self) -> &[String] {
        &self.gene_names
    }

    pub fn n_genes(&self) -> usize {
        self.gene_names.len()
    }

    pub fn n_pairs(&self) -> usize {
        self.n_pairs
    }

    pub fn leaf_level(&self) -> &str {
        &self.leaf_level
    }

    /// Index of the stored pair `(a, b)`; the members may be passed in
    /// either order.
    pub fn idx_of_pair(&self, a: &str, b: &str) -> Result<usize> {
        let key = if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        };
        self.pair_to_idx.get(&key).copied().ok_or_else(|| {
            MapperError::InconsistentInputs(format!(
                "pair ({a}, {b}) absent from reference marker file"
            ))
        })
    }

    pub fn is_marker(&self, gene: usize, pair: usize) -> bool {
        self.is_marker.get(gene, pair)
    }

    /// Up-regulated in the lexicographically lower member of the pair.
    pub fn up_in_first(&self, gene: usize, pair: usize) -> bool {
        self.up_regulated.get(gene, pair)
    }
}
