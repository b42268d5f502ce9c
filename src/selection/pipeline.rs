use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{MapperError, Result};
use crate::selection::{MarkerGeneArray, select_marker_genes};
use crate::taxonomy::{ParentNode, TaxonomyTree};

/// Run marker selection for every parent node of the taxonomy.
///
/// Parents whose descendant-pair count exceeds `behemoth_cutoff` would
/// starve a shared pool, so they drain one at a time on a dedicated
/// worker while the remaining workers pull the small parents off a
/// shared queue. Each worker loads the marker file through its own
/// handle; results are merged after the join.
pub fn select_all_markers(
    marker_path: &Path,
    query_gene_names: &[String],
    tree: &TaxonomyTree,
    n_per_utility: usize,
    n_workers: usize,
    behemoth_cutoff: usize,
) -> Result<BTreeMap<ParentNode, Vec<String>>> {
    let mut behemoths: Vec<ParentNode> = Vec::new();
    let mut small: Vec<ParentNode> = Vec::new();
    for parent in tree.all_parents() {
        let n_pairs = tree.leaves_to_compare(&parent)?.len();
        if n_pairs > behemoth_cutoff {
            behemoths.push(parent);
        } else {
            small.push(parent);
        }
    }

    let n_workers = n_workers.max(1);
    let queue: Mutex<Vec<ParentNode>> = Mutex::new(small);
    let n_small_workers = if behemoths.is_empty() {
        n_workers
    } else {
        (n_workers - 1).max(1)
    };

    let mut results: Vec<(ParentNode, Vec<String>)> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        if !behemoths.is_empty() {
            let behemoths = &behemoths;
            handles.push(scope.spawn(move || -> Result<Vec<_>> {
                let marker_array = MarkerGeneArray::from_h5_file(marker_path)?;
                let mut out = Vec::with_capacity(behemoths.len());
                for parent in behemoths {
                    let genes = select_marker_genes(
                        &marker_array,
                        query_gene_names,
                        tree,
                        parent,
                        n_per_utility,
                    )?;
                    out.push((parent.clone(), genes));
                }
                Ok(out)
            }));
        }
        for _ in 0..n_small_workers {
            let queue = &queue;
            handles.push(scope.spawn(move || -> Result<Vec<_>> {
                let marker_array = MarkerGeneArray::from_h5_file(marker_path)?;
                let mut out = Vec::new();
                loop {
                    let parent = match queue.lock() {
                        Ok(mut q) => q.pop(),
                        Err(_) => {
                            return Err(MapperError::Worker(
                                "marker selection queue poisoned".into(),
                            ));
                        }
                    };
                    let Some(parent) = parent else {
                        break;
                    };
                    let genes = select_marker_genes(
                        &marker_array,
                        query_gene_names,
                        tree,
                        &parent,
                        n_per_utility,
                    )?;
                    out.push((parent, genes));
                }
                Ok(out)
            }));
        }
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| MapperError::Worker("marker selection worker panicked".into()))?
            })
            .collect::<Result<Vec<Vec<_>>>>()
    })?
    .into_iter()
    .flatten()
    .collect();

    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results.into_iter().collect())
}
