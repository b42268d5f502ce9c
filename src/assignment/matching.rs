use ndarray::{Array1, Array2, Axis};

use crate::error::{MapperError, Result};
use crate::matrix::CellByGeneMatrix;
use crate::selection::MarkerCache;
use crate::stats::ClusterStats;
use crate::taxonomy::{ParentNode, TaxonomyTree};

/// Mean expression profile of every leaf cluster, rows in sorted leaf
/// order, columns in the reference gene order of the stats file.
#[derive(Debug, Clone)]
pub struct LeafMeans {
    pub matrix: Array2<f64>,
    pub leaf_names: Vec<String>,
    pub n_cells: Vec<u64>,
}

/// `μ_g = sum(leaf, g) / n_cells(leaf)` straight from the precomputed
/// stats.
pub fn get_leaf_means(tree: &TaxonomyTree, stats: &ClusterStats) -> Result<LeafMeans> {
    let leaf_names = tree.all_leaves();
    let n_genes = stats.n_genes();
    let mut matrix = Array2::<f64>::zeros((leaf_names.len(), n_genes));
    let mut n_cells = Vec::with_capacity(leaf_names.len());
    for (out_row, leaf) in leaf_names.iter().enumerate() {
        let stats_row = stats.row_for_cluster(leaf)?;
        let n = stats.n_cells[stats_row];
        if n == 0 {
            return Err(MapperError::InconsistentInputs(format!(
                "leaf {leaf} has zero cells in the precomputed stats"
            )));
        }
        let mean = stats.sum.row(stats_row).mapv(|s| s / n as f64);
        matrix.row_mut(out_row).assign(&mean);
        n_cells.push(n);
    }
    Ok(LeafMeans {
        matrix,
        leaf_names,
        n_cells,
    })
}

/// Query and reference data aligned on one parent's marker genes:
/// query rows are the chunk's cells, reference rows are the parent's
/// children (each the cell-count weighted mean of its descendant
/// leaves), and `children` names the reference rows.
#[derive(Debug)]
pub struct QueryAssembly {
    pub query_data: Array2<f64>,
    pub reference_data: Array2<f64>,
    pub children: Vec<String>,
}

pub fn assemble_query_data(
    query: &CellByGeneMatrix,
    leaf_means: &LeafMeans,
    tree: &TaxonomyTree,
    cache: &MarkerCache,
    parent: &ParentNode,
) -> Result<QueryAssembly> {
    let children = tree.children_of(parent)?;
    let markers = cache.markers_for(parent)?;
    if markers.query.is_empty() && children.len() > 1 {
        return Err(MapperError::InconsistentInputs(format!(
            "no marker genes cached for a parent with {} children",
            children.len()
        )));
    }

    // The chunk has been trimmed to the union marker set, so map the
    // cache's full-vocabulary indices through gene names.
    let col_of = query.gene_to_col();
    let query_cols: Vec<usize> = markers
        .query
        .iter()
        .map(|&idx| {
            let name = cache.query_gene_names.get(idx).ok_or_else(|| {
                MapperError::InconsistentInputs(format!(
                    "query marker index {idx} beyond the query vocabulary"
                ))
            })?;
            col_of.get(name.as_str()).copied().ok_or_else(|| {
                MapperError::InconsistentInputs(format!(
                    "marker gene {name} missing from the query chunk"
                ))
            })
        })
        .collect::<Result<_>>()?;
    let query_data = query.data().select(Axis(1), &query_cols);

    let child_level = match parent {
        None => tree.hierarchy()[0].clone(),
        Some((level, _)) => {
            let idx = tree
                .hierarchy()
                .iter()
                .position(|l| l == level)
                .ok_or_else(|| {
                    MapperError::InvalidTaxonomy(format!("{level} is not a valid level"))
                })?;
            tree.hierarchy()[idx + 1].clone()
        }
    };
    let as_leaves = tree.as_leaves();
    let leaf_row: std::collections::HashMap<&str, usize> = leaf_means
        .leaf_names
        .iter()
        .enumerate()
        .map(|(row, name)| (name.as_str(), row))
        .collect();

    let n_markers = markers.reference.len();
    let mut reference_data = Array2::<f64>::zeros((children.len(), n_markers));
    for (child_row, child) in children.iter().enumerate() {
        let leaves = as_leaves
            .get(&child_level)
            .and_then(|m| m.get(child))
            .ok_or_else(|| {
                MapperError::InvalidTaxonomy(format!(
                    "{child} is not a valid node at level {child_level}"
                ))
            })?;
        let mut weighted = Array1::<f64>::zeros(n_markers);
        let mut total = 0.0f64;
        for leaf in leaves {
            let row = leaf_row[leaf.as_str()];
            let weight = leaf_means.n_cells[row] as f64;
            for (out_col, &gene) in markers.reference.iter().enumerate() {
                weighted[out_col] += weight * leaf_means.matrix[[row, gene]];
            }
            total += weight;
        }
        weighted.mapv_inplace(|v| v / total);
        reference_data.row_mut(child_row).assign(&weighted);
    }

    Ok(QueryAssembly {
        query_data,
        reference_data,
        children,
    })
}
