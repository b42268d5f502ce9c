use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use ndarray::{Array2, Axis};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::error::{MapperError, Result};
use crate::matrix::{CellByGeneMatrix, Normalization};
use crate::report::{CellAssignment, LevelAssignment};
use crate::runlog::RunLog;
use crate::selection::{MarkerCache, reconcile_taxonomy_and_markers};
use crate::sparse::{AnnDataRowIterator, read_index_column};
use crate::stats::ClusterStats;
use crate::taxonomy::{ParentNode, TaxonomyTree};

use super::matching::{LeafMeans, assemble_query_data, get_leaf_means};

#[derive(Debug, Clone, Copy)]
pub struct BootstrapParams {
    /// Fraction of the marker set drawn in each iteration.
    pub factor: f64,
    pub iterations: usize,
}

impl Default for BootstrapParams {
    fn default() -> Self {
        Self {
            factor: 0.9,
            iterations: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ElectionParams {
    pub bootstrap: BootstrapParams,
    pub chunk_size: usize,
    pub n_workers: usize,
    pub rng_seed: u64,
    pub normalization: Normalization,
    pub max_gb: f64,
    pub scratch_dir: Option<PathBuf>,
    /// When set, each chunk's assignments land in their own
    /// `{r0}_{r1}_assignment.json` file instead of the shared list.
    pub results_output_dir: Option<PathBuf>,
}

impl Default for ElectionParams {
    fn default() -> Self {
        Self {
            bootstrap: BootstrapParams::default(),
            chunk_size: 10_000,
            n_workers: num_cpus::get(),
            rng_seed: 11235813,
            normalization: Normalization::Log2Cpm,
            max_gb: 10.0,
            scratch_dir: None,
            results_output_dir: None,
        }
    }
}

/// Pearson correlation of every query row against every reference row,
/// restricted to the already-selected marker columns. Rows are
/// standardized with zero-ddof moments; a row with no variance
/// correlates at a defined zero with everything.
fn correlation_matrix(query: &Array2<f64>, reference: &Array2<f64>) -> Array2<f64> {
    let m = query.ncols() as f64;
    let standardize = |matrix: &Array2<f64>| -> Array2<f64> {
        let mut out = matrix.clone();
        for mut row in out.axis_iter_mut(Axis(0)) {
            let mean = row.sum() / m;
            let var = row.fold(0.0, |acc, &x| acc + (x - mean) * (x - mean)) / m;
            if var > 0.0 {
                let std = var.sqrt();
                row.mapv_inplace(|x| (x - mean) / std);
            } else {
                row.fill(0.0);
            }
        }
        out
    };
    let q = standardize(query);
    let r = standardize(reference);
    q.dot(&r.t()) / m
}

/// Run the bootstrap vote of a query chunk against a set of reference
/// profiles. Returns per-(query, reference) vote counts and summed
/// correlations of the winning iterations.
pub fn tally_votes(
    query: &Array2<f64>,
    reference: &Array2<f64>,
    bootstrap: &BootstrapParams,
    rng: &mut ChaCha8Rng,
) -> (Array2<u32>, Array2<f64>) {
    let n_markers = query.ncols();
    let n_bootstrap = ((bootstrap.factor * n_markers as f64).round() as usize)
        .clamp(1, n_markers);
    let mut votes = Array2::<u32>::zeros((query.nrows(), reference.nrows()));
    let mut corr_sum = Array2::<f64>::zeros((query.nrows(), reference.nrows()));

    for _ in 0..bootstrap.iterations {
        let mut chosen = rand::seq::index::sample(rng, n_markers, n_bootstrap).into_vec();
        chosen.sort_unstable();
        let query_sub = query.select(Axis(1), &chosen);
        let reference_sub = reference.select(Axis(1), &chosen);
        let corr = correlation_matrix(&query_sub, &reference_sub);
        for (cell, corr_row) in corr.axis_iter(Axis(0)).enumerate() {
            let mut best = 0usize;
            for candidate in 1..corr_row.len() {
                if corr_row[candidate] > corr_row[best] {
                    best = candidate;
                }
            }
            votes[[cell, best]] += 1;
            corr_sum[[cell, best]] += corr_row[best];
        }
    }
    (votes, corr_sum)
}

/// Resolve each query row's vote into a winner. Ties in the vote count
/// break on summed correlation, then on the lower reference index
/// (references are sorted, so that is the lexicographic winner).
pub fn choose_node(
    votes: &Array2<u32>,
    corr_sum: &Array2<f64>,
    iterations: usize,
) -> (Vec<usize>, Vec<f64>, Vec<f64>) {
    let n_cells = votes.nrows();
    let mut winners = Vec::with_capacity(n_cells);
    let mut probabilities = Vec::with_capacity(n_cells);
    let mut avg_correlations = Vec::with_capacity(n_cells);
    for cell in 0..n_cells {
        let mut best = 0usize;
        for candidate in 1..votes.ncols() {
            let better = votes[[cell, candidate]] > votes[[cell, best]]
                || (votes[[cell, candidate]] == votes[[cell, best]]
                    && corr_sum[[cell, candidate]] > corr_sum[[cell, best]]);
            if better {
                best = candidate;
            }
        }
        let n_votes = votes[[cell, best]];
        winners.push(best);
        probabilities.push(n_votes as f64 / iterations as f64);
        avg_correlations.push(if n_votes > 0 {
            corr_sum[[cell, best]] / n_votes as f64
        } else {
            0.0
        });
    }
    (winners, probabilities, avg_correlations)
}

/// Classify one chunk of query cells through every level of the
/// taxonomy. The chunk must already be log2CPM and trimmed to the
/// cache's union marker set.
pub fn run_type_assignment(
    chunk: &CellByGeneMatrix,
    leaf_means: &LeafMeans,
    cache: &MarkerCache,
    tree: &TaxonomyTree,
    bootstrap: &BootstrapParams,
    rng: &mut ChaCha8Rng,
) -> Result<Vec<BTreeMap<String, LevelAssignment>>> {
    let hierarchy = tree.hierarchy();
    let n_cells = chunk.n_cells();
    let mut results: Vec<BTreeMap<String, LevelAssignment>> = vec![BTreeMap::new(); n_cells];

    // level -> node -> chunk-row indices assigned there.
    let mut previously_assigned: HashMap<String, HashMap<String, Vec<usize>>> = HashMap::new();

    for (level_idx, child_level) in hierarchy.iter().enumerate() {
        let parent_nodes: Vec<ParentNode> = if level_idx == 0 {
            vec![None]
        } else {
            let parent_level = &hierarchy[level_idx - 1];
            tree.nodes_at_level(parent_level)?
                .into_iter()
                .map(|node| Some((parent_level.clone(), node)))
                .collect()
        };

        let mut assigned_this_level: HashMap<String, Vec<usize>> = HashMap::new();
        for parent in parent_nodes {
            let chosen_idx: Vec<usize> = match &parent {
                None => (0..n_cells).collect(),
                Some((parent_level, node)) => previously_assigned
                    .get(parent_level.as_str())
                    .and_then(|m| m.get(node.as_str()))
                    .cloned()
                    .unwrap_or_default(),
            };
            if chosen_idx.is_empty() {
                continue;
            }
            let children = tree.children_of(&parent)?;

            let (winners, probabilities, avg_correlations) = if children.len() == 1 {
                (
                    vec![0usize; chosen_idx.len()],
                    vec![1.0; chosen_idx.len()],
                    vec![1.0; chosen_idx.len()],
                )
            } else {
                let selected = chunk.downsample_cells(&chosen_idx)?;
                let assembly = assemble_query_data(&selected, leaf_means, tree, cache, &parent)?;
                let (votes, corr_sum) = tally_votes(
                    &assembly.query_data,
                    &assembly.reference_data,
                    bootstrap,
                    rng,
                );
                choose_node(&votes, &corr_sum, bootstrap.iterations)
            };

            for ((cell, winner), (probability, avg_correlation)) in chosen_idx
                .iter()
                .zip(winners.iter())
                .zip(probabilities.iter().zip(avg_correlations.iter()))
            {
                let child = children[*winner].clone();
                assigned_this_level
                    .entry(child.clone())
                    .or_default()
                    .push(*cell);
                results[*cell].insert(
                    child_level.clone(),
                    LevelAssignment {
                        assignment: child,
                        bootstrapping_probability: *probability,
                        avg_correlation: *avg_correlation,
                    },
                );
            }
        }
        previously_assigned.insert(child_level.clone(), assigned_this_level);
    }
    Ok(results)
}

struct ChunkJob {
    matrix: CellByGeneMatrix,
    cell_names: Vec<String>,
    r0: usize,
    r1: usize,
    seed: u64,
}

/// Assign types at every level of the taxonomy to the query cells of
/// an h5ad file.
///
/// Chunks stream on the caller's thread; worker threads classify them,
/// each with a ChaCha RNG seeded from the root RNG in dispatch order,
/// so a fixed `rng_seed` reproduces the run exactly. Results either
/// accumulate in a shared list (returned sorted by row range) or, when
/// `results_output_dir` is set, land in per-chunk JSON files whose
/// names encode the row range.
pub fn run_type_assignment_on_h5ad(
    query_path: &Path,
    stats: &ClusterStats,
    cache: &MarkerCache,
    tree: &TaxonomyTree,
    params: &ElectionParams,
    log: &mut RunLog,
) -> Result<Vec<CellAssignment>> {
    reconcile_taxonomy_and_markers(tree, cache)?;
    if stats.col_names != cache.reference_gene_names {
        return Err(MapperError::InconsistentInputs(
            "marker cache gene universe disagrees with the precomputed stats".into(),
        ));
    }

    let query_file = hdf5::File::open(query_path)?;
    let cell_names = read_index_column(&query_file, "obs")?;
    let var_names = read_index_column(&query_file, "var")?;
    drop(query_file);
    if var_names != cache.query_gene_names {
        return Err(MapperError::InconsistentInputs(
            "marker cache was built against a different query gene vocabulary".into(),
        ));
    }

    let leaf_means = get_leaf_means(tree, stats)?;
    let n_rows = cell_names.len();
    let n_workers = params.n_workers.max(1);
    let max_chunk = n_rows.div_ceil(n_workers).max(1);
    let chunk_size = params.chunk_size.clamp(1, max_chunk);
    log.info(format!(
        "assigning {n_rows} query cells in chunks of {chunk_size} across {n_workers} workers"
    ));

    if let Some(dir) = &params.results_output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let mut iterator = AnnDataRowIterator::new(
        query_path,
        chunk_size,
        params.scratch_dir.as_deref(),
        params.max_gb,
    )?;
    let mut root_rng = ChaCha8Rng::seed_from_u64(params.rng_seed);

    let shared: Arc<Mutex<Vec<(usize, Vec<CellAssignment>)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let (sender, receiver) = mpsc::sync_channel::<ChunkJob>(n_workers);
    let receiver = Arc::new(Mutex::new(receiver));

    let collected = std::thread::scope(|scope| -> Result<()> {
        let leaf_means = &leaf_means;
        let mut handles = Vec::new();
        for _ in 0..n_workers {
            let receiver = Arc::clone(&receiver);
            let shared = Arc::clone(&shared);
            let results_dir = params.results_output_dir.clone();
            let bootstrap = params.bootstrap;
            handles.push(scope.spawn(move || -> Result<()> {
                loop {
                    let job = {
                        let guard = receiver.lock().map_err(|_| {
                            MapperError::Worker("chunk queue poisoned".into())
                        })?;
                        guard.recv()
                    };
                    let Ok(job) = job else {
                        return Ok(());
                    };
                    let mut rng = ChaCha8Rng::seed_from_u64(job.seed);
                    let assignments = run_type_assignment(
                        &job.matrix,
                        leaf_means,
                        cache,
                        tree,
                        &bootstrap,
                        &mut rng,
                    )?;
                    let cells: Vec<CellAssignment> = job
                        .cell_names
                        .iter()
                        .zip(assignments)
                        .map(|(cell_id, levels)| CellAssignment {
                            cell_id: cell_id.clone(),
                            levels,
                        })
                        .collect();
                    match &results_dir {
                        Some(dir) => {
                            let path =
                                dir.join(format!("{}_{}_assignment.json", job.r0, job.r1));
                            let payload = serde_json::to_string(&cells)?;
                            std::fs::write(path, payload)?;
                        }
                        None => {
                            shared
                                .lock()
                                .map_err(|_| {
                                    MapperError::Worker("result list poisoned".into())
                                })?
                                .push((job.r0, cells));
                        }
                    }
                }
            }));
        }
        // Only workers may hold the receiver: if they all exit early,
        // the channel disconnects and the send loop stops instead of
        // blocking on a full buffer.
        drop(receiver);

        let mut send_error = None;
        for chunk in iterator.by_ref() {
            let chunk = chunk?;
            let mut matrix = CellByGeneMatrix::new(
                chunk.data,
                cache.query_gene_names.clone(),
                params.normalization,
            )?;
            if matrix.normalization() != Normalization::Log2Cpm {
                matrix.to_log2cpm_in_place()?;
            }
            let matrix = matrix.downsample_genes(&cache.all_query_markers)?;
            let job = ChunkJob {
                matrix,
                cell_names: cell_names[chunk.r0..chunk.r1].to_vec(),
                r0: chunk.r0,
                r1: chunk.r1,
                seed: root_rng.gen_range(99..4_294_967_296u64),
            };
            if sender.send(job).is_err() {
                send_error = Some(MapperError::Worker(
                    "classification workers exited early".into(),
                ));
                break;
            }
        }
        drop(sender);
        for handle in handles {
            handle
                .join()
                .map_err(|_| MapperError::Worker("classification worker panicked".into()))??;
        }
        match send_error {
            // A worker that exited early must have recorded its error
            // above; reaching here means it did not.
            Some(err) => Err(err),
            None => Ok(()),
        }
    });
    collected?;

    let mut chunks = Arc::try_unwrap(shared)
        .map_err(|_| MapperError::Worker("result list still shared after join".into()))?
        .into_inner()
        .map_err(|_| MapperError::Worker("result list poisoned".into()))?;
    chunks.sort_by_key(|(r0, _)| *r0);
    Ok(chunks.into_iter().flat_map(|(_, cells)| cells).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    use crate::diffexp::find_markers_for_all_pairs;
    use crate::diffexp::markers::ReferenceMarkerParams;
    use crate::selection::create_marker_cache;
    use crate::sparse::{MatrixLayout, write_anndata};
    use crate::stats::precompute::PrecomputeParams;
    use crate::stats::precompute_summary_stats;

    #[test]
    fn test_correlation_matrix_perfect_and_zero_variance() {
        let query = array![[1.0, 2.0, 3.0], [5.0, 5.0, 5.0]];
        let reference = array![[2.0, 4.0, 6.0], [3.0, 2.0, 1.0]];
        let corr = correlation_matrix(&query, &reference);
        // Row 0 is perfectly correlated with reference 0 and
        // anti-correlated with reference 1.
        assert!((corr[[0, 0]] - 1.0).abs() < 1.0e-12);
        assert!((corr[[0, 1]] + 1.0).abs() < 1.0e-12);
        // A flat query row has defined-zero correlation.
        assert_eq!(corr[[1, 0]], 0.0);
        assert_eq!(corr[[1, 1]], 0.0);
    }

    #[test]
    fn test_tally_votes_conserves_iterations() {
        let query = array![[1.0, 2.0, 3.0, 4.0], [4.0, 3.0, 2.0, 1.0]];
        let reference = array![[1.1, 2.1, 2.9, 4.2], [4.0, 2.9, 2.1, 1.1]];
        let bootstrap = BootstrapParams {
            factor: 0.75,
            iterations: 37,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let (votes, corr_sum) = tally_votes(&query, &reference, &bootstrap, &mut rng);
        for cell in 0..2 {
            let total: u32 = (0..2).map(|r| votes[[cell, r]]).sum();
            assert_eq!(total, 37);
        }
        // Each query row matches its mirror reference.
        assert_eq!(votes[[0, 0]], 37);
        assert_eq!(votes[[1, 1]], 37);
        assert!(corr_sum[[0, 0]] > 0.0);
    }

    #[test]
    fn test_tally_votes_reproducible_for_fixed_seed() {
        let query = array![[1.0, 0.5, 2.0, 0.1, 3.0]];
        let reference = array![[1.0, 0.4, 2.2, 0.0, 2.9], [0.1, 2.0, 0.3, 1.8, 0.2]];
        let bootstrap = BootstrapParams {
            factor: 0.5,
            iterations: 25,
        };
        let mut rng_a = ChaCha8Rng::seed_from_u64(777);
        let mut rng_b = ChaCha8Rng::seed_from_u64(777);
        let (votes_a, corr_a) = tally_votes(&query, &reference, &bootstrap, &mut rng_a);
        let (votes_b, corr_b) = tally_votes(&query, &reference, &bootstrap, &mut rng_b);
        assert_eq!(votes_a, votes_b);
        assert_eq!(corr_a, corr_b);
    }

    #[test]
    fn test_choose_node_tie_breaks() {
        // Equal votes: higher corr_sum wins.
        let votes = array![[5u32, 5]];
        let corr = array![[2.0, 3.0]];
        let (winners, probabilities, avg) = choose_node(&votes, &corr, 10);
        assert_eq!(winners, vec![1]);
        assert!((probabilities[0] - 0.5).abs() < 1.0e-12);
        assert!((avg[0] - 0.6).abs() < 1.0e-12);

        // Equal votes and correlations: the lower index wins.
        let votes = array![[5u32, 5]];
        let corr = array![[2.0, 2.0]];
        let (winners, _, _) = choose_node(&votes, &corr, 10);
        assert_eq!(winners, vec![0]);
    }

    // End-to-end fixtures: a synthetic reference with one signature
    // gene per cluster, run through precompute, pair scoring, query
    // marker selection, and the classifier.

    const GENE_COUNT: usize = 8;

    fn gene_names() -> Vec<String> {
        (0..GENE_COUNT).map(|i| format!("g_{i}")).collect()
    }

    fn reference_counts() -> Array2<f64> {
        // Four cells per cluster; cluster k has its signature on gene k
        // with mild per-cell depth variation, plus a shared housekeeping
        // count on gene 3.
        let mut dense = Array2::<f64>::zeros((12, GENE_COUNT));
        let depths = [8.0, 10.0, 12.0, 9.0];
        for cluster in 0..3usize {
            for cell in 0..4usize {
                let row = cluster * 4 + cell;
                dense[[row, cluster]] = depths[cell];
                dense[[row, 3]] = 1.0 + (cell % 2) as f64;
            }
        }
        dense
    }

    fn pipeline_tree() -> TaxonomyTree {
        TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"A": ["c0", "c1"], "B": ["c2"]},
            "cluster": {
                "c0": [0, 1, 2, 3],
                "c1": [4, 5, 6, 7],
                "c2": [8, 9, 10, 11]
            }
        }"#,
        )
        .unwrap()
    }

    struct PipelineFixture {
        stats: ClusterStats,
        cache: MarkerCache,
        tree: TaxonomyTree,
        leaf_means: LeafMeans,
    }

    fn build_pipeline(dir: &Path, tree: &TaxonomyTree) -> PipelineFixture {
        let genes = gene_names();
        let cells: Vec<String> = (0..12).map(|i| format!("ref_{i}")).collect();
        let reference_path = dir.join("reference.h5ad");
        write_anndata(
            &reference_path,
            &reference_counts(),
            MatrixLayout::Csr,
            &cells,
            &genes,
        )
        .unwrap();

        let stats_path = dir.join("stats.h5");
        let mut log = RunLog::new(None);
        precompute_summary_stats(
            &reference_path,
            tree,
            Normalization::Raw,
            &stats_path,
            &PrecomputeParams {
                n_workers: 2,
                rows_at_a_time: 3,
                max_gb: 0.01,
                scratch_dir: None,
            },
            &mut log,
        )
        .unwrap();
        let stats = ClusterStats::read_from_file(&stats_path).unwrap();

        let marker_path = dir.join("reference_markers.h5");
        find_markers_for_all_pairs(
            &stats,
            tree,
            &marker_path,
            None,
            &ReferenceMarkerParams {
                n_workers: 2,
                ..ReferenceMarkerParams::default()
            },
            &mut log,
        )
        .unwrap();

        let cache_path = dir.join("query_markers.h5");
        create_marker_cache(
            &cache_path,
            &marker_path,
            &genes,
            tree,
            5,
            2,
            1_000_000,
            &mut log,
        )
        .unwrap();
        let cache = MarkerCache::read_from_file(&cache_path).unwrap();
        let leaf_means = get_leaf_means(tree, &stats).unwrap();
        PipelineFixture {
            stats,
            cache,
            tree: tree.clone(),
            leaf_means,
        }
    }

    fn write_query(
        dir: &Path,
        name: &str,
        data: &Array2<f64>,
        layout: MatrixLayout,
        cell_prefix: &str,
    ) -> std::path::PathBuf {
        let path = dir.join(name);
        let cells: Vec<String> = (0..data.nrows())
            .map(|i| format!("{cell_prefix}_{i}"))
            .collect();
        write_anndata(&path, data, layout, &cells, &gene_names()).unwrap();
        path
    }

    fn map_query(
        fixture: &PipelineFixture,
        query_path: &Path,
        normalization: Normalization,
        results_output_dir: Option<PathBuf>,
    ) -> Vec<CellAssignment> {
        let params = ElectionParams {
            bootstrap: BootstrapParams {
                factor: 1.0,
                iterations: 20,
            },
            chunk_size: 2,
            n_workers: 2,
            rng_seed: 6171,
            normalization,
            max_gb: 0.01,
            scratch_dir: None,
            results_output_dir,
        };
        let mut log = RunLog::new(None);
        run_type_assignment_on_h5ad(
            query_path,
            &fixture.stats,
            &fixture.cache,
            &fixture.tree,
            &params,
            &mut log,
        )
        .unwrap()
    }

    #[test]
    fn test_pure_reference_recall() {
        let dir = tempfile::tempdir().unwrap();
        let tree = pipeline_tree();
        let fixture = build_pipeline(dir.path(), &tree);
        // Submit the per-leaf mean profiles themselves as the query.
        let query_path = write_query(
            dir.path(),
            "query.h5ad",
            &fixture.leaf_means.matrix,
            MatrixLayout::Csr,
            "query",
        );
        let results = map_query(&fixture, &query_path, Normalization::Log2Cpm, None);
        assert_eq!(results.len(), 3);
        for (idx, cell) in results.iter().enumerate() {
            let leaf = &cell.levels["cluster"];
            assert_eq!(leaf.assignment, format!("c{idx}"));
            assert!((leaf.bootstrapping_probability - 1.0).abs() < 1.0e-12);
            assert!((leaf.avg_correlation - 1.0).abs() < 1.0e-9);
            // Monotonicity: the leaf's class matches the class-level
            // assignment, and probabilities stay in bounds.
            let class = &cell.levels["class"];
            let expected_class = if idx < 2 { "A" } else { "B" };
            assert_eq!(class.assignment, expected_class);
            for level in ["class", "cluster"] {
                let p = cell.levels[level].bootstrapping_probability;
                assert!((0.0..=1.0).contains(&p));
            }
        }
    }

    #[test]
    fn test_raw_queries_scale_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let tree = pipeline_tree();
        let fixture = build_pipeline(dir.path(), &tree);
        let counts = reference_counts();
        let mut scaled = counts.clone();
        for (row, mut cells) in scaled.axis_iter_mut(Axis(0)).enumerate() {
            let factor = 1.0 + (row % 5) as f64 * 0.75;
            cells.mapv_inplace(|x| x * factor);
        }
        let plain_path =
            write_query(dir.path(), "plain.h5ad", &counts, MatrixLayout::Csr, "q");
        let scaled_path =
            write_query(dir.path(), "scaled.h5ad", &scaled, MatrixLayout::Csr, "q");

        let plain = map_query(&fixture, &plain_path, Normalization::Raw, None);
        let scaled = map_query(&fixture, &scaled_path, Normalization::Raw, None);
        assert_eq!(plain.len(), scaled.len());
        for (a, b) in plain.iter().zip(scaled.iter()) {
            assert_eq!(a.cell_id, b.cell_id);
            for level in ["class", "cluster"] {
                assert_eq!(a.levels[level].assignment, b.levels[level].assignment);
                assert_eq!(
                    a.levels[level].bootstrapping_probability,
                    b.levels[level].bootstrapping_probability
                );
                assert!(
                    (a.levels[level].avg_correlation - b.levels[level].avg_correlation).abs()
                        < 1.0e-6
                );
            }
        }
        // Raw reference cells recall their own cluster.
        for (row, cell) in plain.iter().enumerate() {
            assert_eq!(cell.levels["cluster"].assignment, format!("c{}", row / 4));
        }
    }

    #[test]
    fn test_csc_query_matches_csr() {
        let dir = tempfile::tempdir().unwrap();
        let tree = pipeline_tree();
        let fixture = build_pipeline(dir.path(), &tree);
        let query = fixture.leaf_means.matrix.clone();
        let csr_path = write_query(dir.path(), "csr.h5ad", &query, MatrixLayout::Csr, "q");
        let csc_path = write_query(dir.path(), "csc.h5ad", &query, MatrixLayout::Csc, "q");
        let from_csr = map_query(&fixture, &csr_path, Normalization::Log2Cpm, None);
        let from_csc = map_query(&fixture, &csc_path, Normalization::Log2Cpm, None);
        assert_eq!(from_csr, from_csc);
    }

    #[test]
    fn test_per_chunk_result_files() {
        let dir = tempfile::tempdir().unwrap();
        let tree = pipeline_tree();
        let fixture = build_pipeline(dir.path(), &tree);
        let query_path = write_query(
            dir.path(),
            "query.h5ad",
            &fixture.leaf_means.matrix,
            MatrixLayout::Csr,
            "query",
        );
        let out_dir = dir.path().join("chunks");
        let returned = map_query(
            &fixture,
            &query_path,
            Normalization::Log2Cpm,
            Some(out_dir.clone()),
        );
        assert!(returned.is_empty());
        let mut all: Vec<CellAssignment> = Vec::new();
        for (r0, r1) in [(0usize, 2usize), (2, 3)] {
            let path = out_dir.join(format!("{r0}_{r1}_assignment.json"));
            let chunk: Vec<CellAssignment> =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(chunk.len(), r1 - r0);
            all.extend(chunk);
        }
        for (idx, cell) in all.iter().enumerate() {
            assert_eq!(cell.cell_id, format!("query_{idx}"));
            assert_eq!(cell.levels["cluster"].assignment, format!("c{idx}"));
        }
    }

    #[test]
    fn test_trivial_single_child_root() {
        let dir = tempfile::tempdir().unwrap();
        let tree = TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"Z": ["c0", "c1"]},
            "cluster": {"c0": [0, 1, 2, 3], "c1": [4, 5, 6, 7]}
        }"#,
        )
        .unwrap();
        let fixture = build_pipeline(dir.path(), &tree);
        let query_path = write_query(
            dir.path(),
            "query.h5ad",
            &fixture.leaf_means.matrix,
            MatrixLayout::Csr,
            "query",
        );
        let results = map_query(&fixture, &query_path, Normalization::Log2Cpm, None);
        for cell in &results {
            let class = &cell.levels["class"];
            assert_eq!(class.assignment, "Z");
            assert_eq!(class.bootstrapping_probability, 1.0);
            assert_eq!(class.avg_correlation, 1.0);
        }
        assert_eq!(results[0].levels["cluster"].assignment, "c0");
        assert_eq!(results[1].levels["cluster"].assignment, "c1");
    }

    #[test]
    fn test_foreign_cache_is_fatal_before_work() {
        let dir = tempfile::tempdir().unwrap();
        let tree = pipeline_tree();
        let fixture = build_pipeline(dir.path(), &tree);
        let other_tree = TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"Q": ["c0", "c1", "c2"]},
            "cluster": {"c0": [0], "c1": [1], "c2": [2]}
        }"#,
        )
        .unwrap();
        let query_path = write_query(
            dir.path(),
            "query.h5ad",
            &fixture.leaf_means.matrix,
            MatrixLayout::Csr,
            "query",
        );
        let params = ElectionParams::default();
        let mut log = RunLog::new(None);
        let err = run_type_assignment_on_h5ad(
            &query_path,
            &fixture.stats,
            &fixture.cache,
            &other_tree,
            &params,
            &mut log,
        )
        .unwrap_err();
        assert!(matches!(err, MapperError::InconsistentInputs(_)));
    }
}
