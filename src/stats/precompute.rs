use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array2, s};

use crate::error::{MapperError, Result};
use crate::matrix::cell_by_gene::log2cpm_rows_in_place;
use crate::matrix::Normalization;
use crate::runlog::RunLog;
use crate::sparse::transpose::csc_to_csr_on_disk;
use crate::sparse::{MatrixLayout, load_csr_rows, matrix_layout, read_index_column,
                    validate_indptr};
use crate::stats::ClusterStats;
use crate::taxonomy::TaxonomyTree;

#[derive(Debug, Clone)]
pub struct PrecomputeParams {
    pub n_workers: usize,
    pub rows_at_a_time: usize,
    pub max_gb: f64,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PrecomputeParams {
    fn default() -> Self {
        Self {
            n_workers: num_cpus::get(),
            rows_at_a_time: 5000,
            max_gb: 10.0,
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum RowSourceKind {
    /// `data`/`indices` under the h5ad `X` group.
    CsrGroup,
    /// Top-level `data`/`indices` in a scratch transposed file.
    CsrTopLevel,
    /// Dense 2-D `X` dataset.
    Dense,
}

struct RowSource {
    kind: RowSourceKind,
    path: PathBuf,
    n_cols: usize,
    indptr: Arc<Vec<i64>>,
}

struct OpenRowSource {
    kind: RowSourceKind,
    data: hdf5::Dataset,
    indices: Option<hdf5::Dataset>,
    indptr: Arc<Vec<i64>>,
    n_cols: usize,
}

impl RowSource {
    /// Every worker opens its own handle on the backing file.
    fn open(&self) -> Result<OpenRowSource> {
        let file = hdf5::File::open(&self.path)?;
        let (data, indices) = match self.kind {
            RowSourceKind::CsrGroup => {
                let group = file.group("X")?;
                (group.dataset("data")?, Some(group.dataset("indices")?))
            }
            RowSourceKind::CsrTopLevel => {
                (file.dataset("data")?, Some(file.dataset("indices")?))
            }
            RowSourceKind::Dense => (file.dataset("X")?, None),
        };
        Ok(OpenRowSource {
            kind: self.kind,
            data,
            indices,
            indptr: Arc::clone(&self.indptr),
            n_cols: self.n_cols,
        })
    }
}

impl OpenRowSource {
    fn read_rows(&self, rows: &[usize]) -> Result<Array2<f64>> {
        match self.kind {
            RowSourceKind::Dense => {
                let mut out = Array2::<f64>::zeros((rows.len(), self.n_cols));
                for (out_row, &row) in rows.iter().enumerate() {
                    let slab = self.data.read_slice_2d::<f64, _>(s![row..row + 1, ..])?;
                    out.row_mut(out_row).assign(&slab.row(0));
                }
                Ok(out)
            }
            RowSourceKind::CsrGroup | RowSourceKind::CsrTopLevel => load_csr_rows(
                &self.data,
                self.indices.as_ref().expect("sparse source has indices"),
                &self.indptr,
                rows,
                self.n_cols,
            ),
        }
    }
}

/// One pass over the reference matrix producing the per-leaf summary
/// statistics file. Leaves are partitioned across worker threads; each
/// worker reads the rows of its clusters through its own file handle
/// and accumulates privately, and the partial blocks are merged after
/// the join. The serialized taxonomy rides along in the output so
/// downstream tools need not be handed the tree again.
pub fn precompute_summary_stats(
    reference_path: &Path,
    tree: &TaxonomyTree,
    normalization: Normalization,
    output_path: &Path,
    params: &PrecomputeParams,
    log: &mut RunLog,
) -> Result<()> {
    if !reference_path.is_file() {
        return Err(MapperError::MissingInput(reference_path.to_path_buf()));
    }
    let file = hdf5::File::open(reference_path)?;
    let (layout, n_rows, n_cols) = matrix_layout(&file)?;
    let col_names = read_index_column(&file, "var")?;
    if col_names.len() != n_cols {
        return Err(MapperError::InconsistentInputs(format!(
            "var table has {} genes but X has {} columns",
            col_names.len(),
            n_cols
        )));
    }
    for (leaf, rows) in tree.leaf_to_rows() {
        if let Some(&bad) = rows.iter().find(|&&r| r >= n_rows) {
            return Err(MapperError::InconsistentInputs(format!(
                "leaf {leaf} references row {bad} beyond the {n_rows} reference rows"
            )));
        }
    }

    // A CSC reference is transcribed to a scratch CSR file first so
    // workers can gather arbitrary row sets.
    let mut _scratch = None;
    let source = match layout {
        MatrixLayout::Csr => {
            let group = file.group("X")?;
            let indptr: Vec<i64> = group.dataset("indptr")?.read_raw()?;
            validate_indptr(&indptr, n_rows, group.dataset("data")?.size())?;
            RowSource {
                kind: RowSourceKind::CsrGroup,
                path: reference_path.to_path_buf(),
                n_cols,
                indptr: Arc::new(indptr),
            }
        }
        MatrixLayout::Dense => RowSource {
            kind: RowSourceKind::Dense,
            path: reference_path.to_path_buf(),
            n_cols,
            indptr: Arc::new(Vec::new()),
        },
        MatrixLayout::Csc => {
            let tmp = match &params.scratch_dir {
                Some(dir) => tempfile::Builder::new()
                    .prefix("precompute_csr_")
                    .tempdir_in(dir)?,
                None => tempfile::tempdir()?,
            };
            let csr_path = tmp.path().join("reference_as_csr.h5");
            log.info(format!(
                "reference {} is CSC; transcribing to scratch CSR",
                reference_path.display()
            ));
            csc_to_csr_on_disk(&file.group("X")?, &csr_path, n_rows, params.max_gb)?;
            let csr = hdf5::File::open(&csr_path)?;
            let indptr: Vec<i64> = csr.dataset("indptr")?.read_raw()?;
            validate_indptr(&indptr, n_rows, csr.dataset("data")?.size())?;
            let source = RowSource {
                kind: RowSourceKind::CsrTopLevel,
                path: csr_path,
                n_cols,
                indptr: Arc::new(indptr),
            };
            _scratch = Some(tmp);
            source
        }
    };

    let leaves = tree.all_leaves();
    let n_workers = params.n_workers.max(1).min(leaves.len().max(1));
    let per_worker = leaves.len().div_ceil(n_workers);
    log.info(format!(
        "precomputing stats for {} clusters over {} genes with {n_workers} workers",
        leaves.len(),
        col_names.len()
    ));

    let blocks: Vec<ClusterStats> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for cluster_group in leaves.chunks(per_worker) {
            let source = &source;
            let col_names = &col_names;
            let rows_at_a_time = params.rows_at_a_time.max(1);
            handles.push(scope.spawn(move || -> Result<ClusterStats> {
                let open = source.open()?;
                let mut block = ClusterStats::zeros(cluster_group, col_names.clone());
                for cluster in cluster_group {
                    let cluster_row = block.row_for_cluster(cluster)?;
                    let rows = tree.rows_for_leaf(cluster)?;
                    for batch in rows.chunks(rows_at_a_time) {
                        let mut chunk = open.read_rows(batch)?;
                        if normalization == Normalization::Raw {
                            log2cpm_rows_in_place(&mut chunk);
                        }
                        for cell in chunk.rows() {
                            block.accumulate_cell(cluster_row, cell);
                        }
                    }
                }
                Ok(block)
            }));
        }
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| MapperError::Worker("precompute worker panicked".into()))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut stats = ClusterStats::zeros(&leaves, col_names);
    for block in &blocks {
        for (cluster, &block_row) in &block.cluster_to_row {
            let row = stats.row_for_cluster(cluster)?;
            stats.n_cells[row] = block.n_cells[block_row];
            stats
                .sum
                .row_mut(row)
                .assign(&block.sum.row(block_row));
            stats
                .sumsq
                .row_mut(row)
                .assign(&block.sumsq.row(block_row));
            stats.gt0.row_mut(row).assign(&block.gt0.row(block_row));
            stats.gt1.row_mut(row).assign(&block.gt1.row(block_row));
        }
    }
    stats.taxonomy = Some(tree.clone());
    stats.write_to_file(output_path)?;
    log.info(format!("wrote stats file {}", output_path.display()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use crate::sparse::write_anndata;

    fn reference_fixture(seed: u64) -> (Array2<f64>, TaxonomyTree) {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dense = Array2::from_shape_fn((12, 6), |_| {
            if rng.gen_bool(0.4) {
                rng.gen_range(1..20) as f64
            } else {
                0.0
            }
        });
        let tree = TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"A": ["c0", "c1"], "B": ["c2"]},
            "cluster": {
                "c0": [0, 3, 5, 7],
                "c1": [1, 2, 9],
                "c2": [4, 6, 8, 10, 11]
            }
        }"#,
        )
        .unwrap();
        (dense, tree)
    }

    fn run_precompute(
        dense: &Array2<f64>,
        tree: &TaxonomyTree,
        layout: MatrixLayout,
        n_workers: usize,
    ) -> ClusterStats {
        let dir = tempfile::tempdir().unwrap();
        let ref_path = dir.path().join("reference.h5ad");
        let cells: Vec<String> = (0..dense.nrows()).map(|i| format!("cell_{i}")).collect();
        let genes: Vec<String> = (0..dense.ncols()).map(|i| format!("g_{i}")).collect();
        write_anndata(&ref_path, dense, layout, &cells, &genes).unwrap();

        let out_path = dir.path().join("stats.h5");
        let params = PrecomputeParams {
            n_workers,
            rows_at_a_time: 3,
            max_gb: 0.001,
            scratch_dir: None,
        };
        let mut log = RunLog::new(None);
        precompute_summary_stats(
            &ref_path,
            tree,
            Normalization::Raw,
            &out_path,
            &params,
            &mut log,
        )
        .unwrap();
        ClusterStats::read_from_file(&out_path).unwrap()
    }

    fn expected_stats(dense: &Array2<f64>, tree: &TaxonomyTree) -> ClusterStats {
        let leaves = tree.all_leaves();
        let genes: Vec<String> = (0..dense.ncols()).map(|i| format!("g_{i}")).collect();
        let mut stats = ClusterStats::zeros(&leaves, genes);
        for leaf in &leaves {
            let row = stats.row_for_cluster(leaf).unwrap();
            for &cell in tree.rows_for_leaf(leaf).unwrap() {
                let mut values = dense.row(cell).to_owned().insert_axis(ndarray::Axis(0));
                log2cpm_rows_in_place(&mut values);
                stats.accumulate_cell(row, values.row(0));
            }
        }
        stats
    }

    #[test]
    fn test_precompute_matches_direct_accumulation() {
        let (dense, tree) = reference_fixture(20240);
        let expected = expected_stats(&dense, &tree);
        for n_workers in [1, 3] {
            let stats = run_precompute(&dense, &tree, MatrixLayout::Csr, n_workers);
            assert_eq!(stats.n_cells, expected.n_cells);
            assert_eq!(stats.gt0, expected.gt0);
            assert_eq!(stats.gt1, expected.gt1);
            for (a, b) in stats.sum.iter().zip(expected.sum.iter()) {
                assert!((a - b).abs() < 1.0e-9);
            }
            for (a, b) in stats.sumsq.iter().zip(expected.sumsq.iter()) {
                assert!((a - b).abs() < 1.0e-9);
            }
        }
    }

    #[test]
    fn test_precompute_layouts_agree() {
        let (dense, tree) = reference_fixture(7);
        let csr = run_precompute(&dense, &tree, MatrixLayout::Csr, 2);
        let csc = run_precompute(&dense, &tree, MatrixLayout::Csc, 2);
        let plain = run_precompute(&dense, &tree, MatrixLayout::Dense, 2);
        for other in [&csc, &plain] {
            assert_eq!(csr.n_cells, other.n_cells);
            for (a, b) in csr.sum.iter().zip(other.sum.iter()) {
                assert!((a - b).abs() < 1.0e-9);
            }
            assert_eq!(csr.gt0, other.gt0);
            assert_eq!(csr.gt1, other.gt1);
        }
    }

    #[test]
    fn test_precompute_embeds_taxonomy() {
        let (dense, tree) = reference_fixture(99);
        let stats = run_precompute(&dense, &tree, MatrixLayout::Csr, 2);
        assert_eq!(stats.taxonomy.as_ref().unwrap(), &tree);
    }

    #[test]
    fn test_row_out_of_range_is_inconsistent() {
        let (dense, _) = reference_fixture(5);
        let tree = TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["cluster"],
            "cluster": {"c0": [0, 99]}
        }"#,
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ref_path = dir.path().join("reference.h5ad");
        let cells: Vec<String> = (0..dense.nrows()).map(|i| format!("cell_{i}")).collect();
        let genes: Vec<String> = (0..dense.ncols()).map(|i| format!("g_{i}")).collect();
        write_anndata(&ref_path, &dense, MatrixLayout::Csr, &cells, &genes).unwrap();
        let mut log = RunLog::new(None);
        let err = precompute_summary_stats(
            &ref_path,
            &tree,
            Normalization::Raw,
            &dir.path().join("stats.h5"),
            &PrecomputeParams::default(),
            &mut log,
        )
        .unwrap_err();
        assert!(matches!(err, MapperError::InconsistentInputs(_)));
    }
}
