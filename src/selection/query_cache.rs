use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use crate::error::{MapperError, Result};
use crate::runlog::RunLog;
use crate::selection::select_all_markers;
use crate::sparse::{read_json_string, write_json_string};
use crate::taxonomy::{ParentNode, TaxonomyTree};

/// Marker lists for one parent node, as gene indices in the reference
/// and query vocabularies (parallel, same order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentMarkers {
    pub reference: Vec<usize>,
    pub query: Vec<usize>,
}

/// The query marker cache: per-parent marker gene indices intersected
/// with the query vocabulary, plus the global index arrays the
/// classifier uses to trim query chunks.
#[derive(Debug, Clone)]
pub struct MarkerCache {
    pub query_gene_names: Vec<String>,
    pub reference_gene_names: Vec<String>,
    pub all_query_markers: Vec<usize>,
    pub all_reference_markers: Vec<usize>,
    pub parents: HashMap<ParentNode, ParentMarkers>,
}

fn parent_group_path(parent: &ParentNode) -> String {
    match parent {
        None => "None".to_string(),
        Some((level, node)) => format!("{level}/{node}"),
    }
}

/// Select markers for every parent and persist the per-parent cache.
/// The layout mirrors the reference side: top-level name lists and
/// sorted union index arrays, then one group per parent holding the
/// `reference` and `query` index vectors.
pub fn create_marker_cache(
    output_path: &Path,
    reference_marker_path: &Path,
    query_gene_names: &[String],
    tree: &TaxonomyTree,
    n_per_utility: usize,
    n_workers: usize,
    behemoth_cutoff: usize,
    log: &mut RunLog,
) -> Result<()> {
    log.info(format!(
        "creating query marker cache {}",
        output_path.display()
    ));
    let marker_lookup = select_all_markers(
        reference_marker_path,
        query_gene_names,
        tree,
        n_per_utility,
        n_workers,
        behemoth_cutoff,
    )?;

    let reference_gene_names: Vec<String> = {
        let file = hdf5::File::open(reference_marker_path)?;
        serde_json::from_str(&read_json_string(&file.dataset("gene_names")?)?)?
    };
    let query_to_int: HashMap<&str, usize> = query_gene_names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();
    let reference_to_int: HashMap<&str, usize> = reference_gene_names
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.as_str(), idx))
        .collect();

    let mut query_union: BTreeSet<usize> = BTreeSet::new();
    let mut reference_union: BTreeSet<usize> = BTreeSet::new();
    for genes in marker_lookup.values() {
        for gene in genes {
            let (Some(&q), Some(&r)) = (
                query_to_int.get(gene.as_str()),
                reference_to_int.get(gene.as_str()),
            ) else {
                return Err(MapperError::InconsistentInputs(format!(
                    "selected marker {gene} missing from a gene vocabulary"
                )));
            };
            query_union.insert(q);
            reference_union.insert(r);
        }
    }

    let file = hdf5::File::create(output_path)?;
    let parent_node_list: Vec<&ParentNode> = marker_lookup.keys().collect();
    write_json_string(
        &file,
        "parent_node_list",
        &serde_json::to_string(&parent_node_list)?,
    )?;
    write_json_string(
        &file,
        "query_gene_names",
        &serde_json::to_string(query_gene_names)?,
    )?;
    write_json_string(
        &file,
        "reference_gene_names",
        &serde_json::to_string(&reference_gene_names)?,
    )?;
    let to_i64 = |set: &BTreeSet<usize>| -> Vec<i64> { set.iter().map(|&v| v as i64).collect() };
    file.new_dataset_builder()
        .with_data(&to_i64(&query_union))
        .create("all_query_markers")?;
    file.new_dataset_builder()
        .with_data(&to_i64(&reference_union))
        .create("all_reference_markers")?;

    for (parent, genes) in &marker_lookup {
        let group = match parent {
            None => file.create_group("None")?,
            Some((level, node)) => {
                let level_group = if file.link_exists(level) {
                    file.group(level)?
                } else {
                    file.create_group(level)?
                };
                level_group.create_group(node)?
            }
        };
        let mut reference: Vec<i64> = Vec::with_capacity(genes.len());
        let mut query: Vec<i64> = Vec::with_capacity(genes.len());
        for gene in genes {
            reference.push(reference_to_int[gene.as_str()] as i64);
            query.push(query_to_int[gene.as_str()] as i64);
        }
        group
            .new_dataset_builder()
            .with_data(&reference)
            .create("reference")?;
        group.new_dataset_builder().with_data(&query).create("query")?;
    }
    log.info(format!(
        "query marker cache covers {} parents, {} query genes",
        marker_lookup.len(),
        query_union.len()
    ));
    Ok(())
}

impl MarkerCache {
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(MapperError::MissingInput(path.to_path_buf()));
        }
        let file = hdf5::File::open(path)?;
        let query_gene_names: Vec<String> =
            serde_json::from_str(&read_json_string(&file.dataset("query_gene_names")?)?)?;
        let reference_gene_names: Vec<String> = serde_json::from_str(&read_json_string(
            &file.dataset("reference_gene_names")?,
        )?)?;
        let parent_node_list: Vec<ParentNode> =
            serde_json::from_str(&read_json_string(&file.dataset("parent_node_list")?)?)?;
        let read_usize_vec = |name: &str| -> Result<Vec<usize>> {
            Ok(file
                .dataset(name)?
                .read_raw::<i64>()?
                .into_iter()
                .map(|v| v as usize)
                .collect())
        };
        let all_query_markers = read_usize_vec("all_query_markers")?;
        let all_reference_markers = read_usize_vec("all_reference_markers")?;

        let mut parents = HashMap::new();
        for parent in parent_node_list {
            let group = file.group(&parent_group_path(&parent))?;
            let reference: Vec<usize> = group
                .dataset("reference")?
                .read_raw::<i64>()?
                .into_iter()
                .map(|v| v as usize)
                .collect();
            let query: Vec<usize> = group
                .dataset("query")?
                .read_raw::<i64>()?
                .into_iter()
                .map(|v| v as usize)
                .collect();
            parents.insert(parent, ParentMarkers { reference, query });
        }
        Ok(Self {
            query_gene_names,
            reference_gene_names,
            all_query_markers,
            all_reference_markers,
            parents,
        })
    }

    pub fn markers_for(&self, parent: &ParentNode) -> Result<&ParentMarkers> {
        self.parents.get(parent).ok_or_else(|| {
            MapperError::InconsistentInputs(format!(
                "parent {} absent from query marker cache",
                parent_group_path(parent)
            ))
        })
    }
}

/// Fail before classification starts if the taxonomy and the marker
/// cache describe different trees: every parent with more than one
/// child must carry a non-empty marker list.
pub fn reconcile_taxonomy_and_markers(tree: &TaxonomyTree, cache: &MarkerCache) -> Result<()> {
    let mut problems: Vec<String> = Vec::new();
    for parent in tree.all_parents() {
        let n_children = tree.children_of(&parent)?.len();
        match cache.parents.get(&parent) {
            None => problems.push(format!(
                "parent {} has no marker cache entry",
                parent_group_path(&parent)
            )),
            Some(markers) => {
                if n_children > 1 && markers.query.is_empty() {
                    problems.push(format!(
                        "parent {} has {n_children} children but no markers",
                        parent_group_path(&parent)
                    ));
                }
                if markers.query.len() != markers.reference.len() {
                    problems.push(format!(
                        "parent {} has mismatched marker index lists",
                        parent_group_path(&parent)
                    ));
                }
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(MapperError::InconsistentInputs(format!(
            "taxonomy tree and marker cache appear to describe different taxonomies: {}",
            problems.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binary::BitMatrix;
    use crate::selection::marker_array::tests::write_marker_fixture;

    fn fixture_tree() -> TaxonomyTree {
        TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"A": ["c0", "c1"], "B": ["c2"]},
            "cluster": {"c0": [0], "c1": [1], "c2": [2]}
        }"#,
        )
        .unwrap()
    }

    fn build_cache(dir: &std::path::Path, query_genes: &[String]) -> std::path::PathBuf {
        let tree = fixture_tree();
        let reference_genes: Vec<String> = (0..6).map(|i| format!("g_{i:02}")).collect();
        let pairs = vec![
            ("c0".to_string(), "c1".to_string()),
            ("c0".to_string(), "c2".to_string()),
            ("c1".to_string(), "c2".to_string()),
        ];
        let mut is_marker = BitMatrix::zeros(6, 3);
        let mut up = BitMatrix::zeros(6, 3);
        for gene in 0..6 {
            for pair in 0..3 {
                is_marker.set(gene, pair, (gene + pair) % 2 == 0);
                up.set(gene, pair, gene % 2 == 0);
            }
        }
        let marker_path = dir.join("reference_markers.h5");
        write_marker_fixture(
            &marker_path,
            &reference_genes,
            "cluster",
            &pairs,
            &is_marker,
            &up,
        );
        let cache_path = dir.join("query_markers.h5");
        let mut log = RunLog::new(None);
        create_marker_cache(
            &cache_path,
            &marker_path,
            query_genes,
            &tree,
            3,
            2,
            1_000_000,
            &mut log,
        )
        .unwrap();
        cache_path
    }

    #[test]
    fn test_cache_round_trip_and_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        // The query vocabulary shuffles and drops reference genes.
        let query_genes: Vec<String> = vec![
            "g_04".into(),
            "g_00".into(),
            "extra".into(),
            "g_02".into(),
            "g_01".into(),
            "g_03".into(),
        ];
        let cache_path = build_cache(dir.path(), &query_genes);
        let cache = MarkerCache::read_from_file(&cache_path).unwrap();

        assert_eq!(cache.query_gene_names, query_genes);
        assert_eq!(cache.parents.len(), 3);
        let tree = fixture_tree();
        reconcile_taxonomy_and_markers(&tree, &cache).unwrap();

        // Parallel index lists point at the same gene names.
        for markers in cache.parents.values() {
            for (q, r) in markers.query.iter().zip(markers.reference.iter()) {
                assert_eq!(
                    cache.query_gene_names[*q],
                    cache.reference_gene_names[*r]
                );
            }
        }
        // Unions are sorted and cover every per-parent index.
        assert!(cache.all_query_markers.windows(2).all(|w| w[0] < w[1]));
        for markers in cache.parents.values() {
            for q in &markers.query {
                assert!(cache.all_query_markers.contains(q));
            }
        }
    }

    #[test]
    fn test_reconcile_rejects_foreign_tree() {
        let dir = tempfile::tempdir().unwrap();
        let query_genes: Vec<String> = (0..6).map(|i| format!("g_{i:02}")).collect();
        let cache_path = build_cache(dir.path(), &query_genes);
        let cache = MarkerCache::read_from_file(&cache_path).unwrap();
        let other_tree = TaxonomyTree::from_str(
            r#"{
            "hierarchy": ["class", "cluster"],
            "class": {"Z": ["c0", "c1", "c2"]},
            "cluster": {"c0": [0], "c1": [1], "c2": [2]}
        }"#,
        )
        .unwrap();
        let err = reconcile_taxonomy_and_markers(&other_tree, &cache).unwrap_err();
        assert!(matches!(err, MapperError::InconsistentInputs(_)));
    }
}
