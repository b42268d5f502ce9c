use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::binary::BitMatrix;
use crate::diffexp::scores::{MarkerThresholds, score_differential_genes};
use crate::error::{MapperError, Result};
use crate::runlog::RunLog;
use crate::sparse::transpose::transpose_sparse_on_disk;
use crate::sparse::write_json_string;
use crate::stats::ClusterStats;
use crate::taxonomy::TaxonomyTree;

#[derive(Debug, Clone)]
pub struct ReferenceMarkerParams {
    pub thresholds: MarkerThresholds,
    pub n_workers: usize,
    pub max_gb: f64,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for ReferenceMarkerParams {
    fn default() -> Self {
        Self {
            thresholds: MarkerThresholds::default(),
            n_workers: num_cpus::get(),
            max_gb: 10.0,
            scratch_dir: None,
        }
    }
}

/// The unordered leaf pairs of a taxonomy, `a < b`, in the index order
/// the marker file stores them.
pub fn enumerate_leaf_pairs(tree: &TaxonomyTree) -> Vec<(String, String)> {
    let leaves = tree.all_leaves();
    let mut pairs = Vec::with_capacity(leaves.len() * (leaves.len().saturating_sub(1)) / 2);
    for i in 0..leaves.len() {
        for j in (i + 1)..leaves.len() {
            pairs.push((leaves[i].clone(), leaves[j].clone()));
        }
    }
    pairs
}

/// Score every leaf pair of the taxonomy and persist the reference
/// marker file: packed `(n_genes, n_pairs)` masks for validity and
/// up-regulation, the pair index, the sorted gene list, and a
/// pair-major sparse view built with the on-disk transposer. Pairs are
/// split across worker threads; each worker reads the shared stats and
/// returns its mask columns, merged after the join.
pub fn find_markers_for_all_pairs(
    stats: &ClusterStats,
    tree: &TaxonomyTree,
    output_path: &Path,
    gene_list: Option<&[String]>,
    params: &ReferenceMarkerParams,
    log: &mut RunLog,
) -> Result<()> {
    for leaf in tree.all_leaves() {
        stats.row_for_cluster(&leaf)?;
    }
    let pairs = enumerate_leaf_pairs(tree);
    let n_pairs = pairs.len();

    // Bit rows are stored in lexicographic gene order.
    let mut sorted_genes: Vec<String> = stats.col_names.clone();
    sorted_genes.sort();
    let stats_col_of: Vec<usize> = {
        let col_of: BTreeMap<&str, usize> = stats
            .col_names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.as_str(), idx))
            .collect();
        sorted_genes.iter().map(|g| col_of[g.as_str()]).collect()
    };
    let allowed: Option<Vec<bool>> = gene_list.map(|list| {
        let wanted: HashSet<&str> = list.iter().map(String::as_str).collect();
        stats
            .col_names
            .iter()
            .map(|g| wanted.contains(g.as_str()))
            .collect()
    });

    let n_workers = params.n_workers.max(1).min(n_pairs.max(1));
    let per_worker = n_pairs.div_ceil(n_workers).max(1);
    log.info(format!(
        "scoring {n_pairs} leaf pairs over {} genes with {n_workers} workers",
        stats.n_genes()
    ));

    let blocks: Vec<(Vec<(usize, Vec<bool>, Vec<bool>)>, usize)> =
        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for (worker_idx, pair_group) in pairs.chunks(per_worker).enumerate() {
                let thresholds = params.thresholds.clone();
                let allowed = allowed.as_deref();
                let first_pair = worker_idx * per_worker;
                handles.push(scope.spawn(move || -> Result<(Vec<_>, usize)> {
                    let mut out = Vec::with_capacity(pair_group.len());
                    let mut n_degenerate = 0usize;
                    for (offset, (a, b)) in pair_group.iter().enumerate() {
                        let result = score_differential_genes(
                            std::slice::from_ref(a),
                            std::slice::from_ref(b),
                            stats,
                            &thresholds,
                            allowed,
                        )?;
                        if result.degenerate {
                            n_degenerate += 1;
                        }
                        out.push((first_pair + offset, result.validity, result.up_in_first));
                    }
                    Ok((out, n_degenerate))
                }));
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| MapperError::Worker("pair scoring worker panicked".into()))?
                })
                .collect::<Result<Vec<_>>>()
        })?;

    let n_degenerate: usize = blocks.iter().map(|(_, count)| count).sum();
    if n_degenerate > 0 {
        log.warn(
            MapperError::NumericDegeneracy(format!(
                "{n_degenerate} of {n_pairs} pairs had no cells on one side and \
                 contributed no markers"
            ))
            .to_string(),
        );
    }

    let n_genes = sorted_genes.len();
    let mut is_marker = BitMatrix::zeros(n_genes, n_pairs);
    let mut up_regulated = BitMatrix::zeros(n_genes, n_pairs);
    let mut col_validity = vec![false; n_genes];
    let mut col_up = vec![false; n_genes];
    for (block, _) in blocks {
        for (pair_idx, validity, up) in block {
            for (sorted_row, &stats_col) in stats_col_of.iter().enumerate() {
                col_validity[sorted_row] = validity[stats_col];
                col_up[sorted_row] = up[stats_col];
            }
            is_marker.set_col(pair_idx, &col_validity);
            up_regulated.set_col(pair_idx, &col_up);
        }
    }

    let mut pair_to_idx: BTreeMap<String, BTreeMap<String, BTreeMap<String, usize>>> =
        BTreeMap::new();
    let leaf_map = pair_to_idx.entry(tree.leaf_level().to_string()).or_default();
    for (idx, (a, b)) in pairs.iter().enumerate() {
        leaf_map.entry(a.clone()).or_default().insert(b.clone(), idx);
    }

    let file = hdf5::File::create(output_path)?;
    is_marker.write_to_group(&file.create_group("markers")?)?;
    up_regulated.write_to_group(&file.create_group("up_regulated")?)?;
    write_json_string(&file, "pair_to_idx", &serde_json::to_string(&pair_to_idx)?)?;
    write_json_string(&file, "gene_names", &serde_json::to_string(&sorted_genes)?)?;
    file.new_dataset_builder()
        .with_data(&[n_pairs as i64])
        .create("n_pairs")?;

    write_sparse_by_pair(&file, &is_marker, &up_regulated, n_pairs, params)?;
    log.info(format!(
        "wrote reference marker file {}",
        output_path.display()
    ));
    Ok(())
}

/// Pair-major enumeration of the marker masks: for each pair, the gene
/// rows that are markers, split by up/down. Built by writing the
/// gene-major adjacency to scratch and running the bounded disk
/// transpose without a data array.
fn write_sparse_by_pair(
    file: &hdf5::File,
    is_marker: &BitMatrix,
    up_regulated: &BitMatrix,
    n_pairs: usize,
    params: &ReferenceMarkerParams,
) -> Result<()> {
    let tmp = match &params.scratch_dir {
        Some(dir) => tempfile::Builder::new()
            .prefix("sparse_by_pair_")
            .tempdir_in(dir)?,
        None => tempfile::tempdir()?,
    };
    let group = file.create_group("sparse_by_pair")?;
    for (sign, keep_up) in [("up", true), ("down", false)] {
        let mut indptr: Vec<i64> = Vec::with_capacity(is_marker.n_rows() + 1);
        indptr.push(0);
        let mut indices: Vec<i64> = Vec::new();
        for gene in 0..is_marker.n_rows() {
            for pair in is_marker.row_indices(gene) {
                if up_regulated.get(gene, pair) == keep_up {
                    indices.push(pair as i64);
                }
            }
            indptr.push(indices.len() as i64);
        }

        let scratch_path = tmp.path().join(format!("{sign}_gene_major.h5"));
        let scratch = hdf5::File::create(&scratch_path)?;
        scratch
            .new_dataset_builder()
            .with_data(&indices)
            .create("indices")?;
        let transposed_path = tmp.path().join(format!("{sign}_pair_major.h5"));
        let transposed = hdf5::File::create(&transposed_path)?;
        transpose_sparse_on_disk(
            None,
            &scratch.dataset("indices")?,
            &indptr,
            n_pairs,
            &transposed,
            params.max_gb,
        )?;

        let pair_idx: Vec<i64> = transposed.dataset("indptr")?.read_raw()?;
        let gene_idx: Vec<i64> = transposed.dataset("indices")?.read_raw()?;
        group
            .new_dataset_builder()
            .with_data(&pair_idx)
            .create(format!("{sign}_pair_idx").as_str())?;
        group
            .new_dataset_builder()
            .with_data(&gene_idx)
            .create(format!("{sign}_gene_idx").as_str())?;
    }
    Ok(())
}
