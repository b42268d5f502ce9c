use std::collections::HashSet;

use crate::error::{MapperError, Result};
use crate::selection::MarkerGeneArray;
use crate::taxonomy::{ParentNode, TaxonomyTree};

/// Greedily pick marker genes for one parent node. The target is to
/// cover every (leaf pair, sign) combination under the parent
/// `n_per_utility` times, where sign distinguishes genes up-regulated
/// in the lexicographically lower pair member from the rest. Each step
/// takes the gene advancing the most still-unsatisfied combinations;
/// ties fall to the gene with the higher total utility, then to the
/// lexicographically smaller name. Only genes present in the query
/// vocabulary are candidates; a query sharing no gene at all with the
/// reference is an error.
pub fn select_marker_genes(
    marker_array: &MarkerGeneArray,
    query_gene_names: &[String],
    tree: &TaxonomyTree,
    parent: &ParentNode,
    n_per_utility: usize,
) -> Result<Vec<String>> {
    let query_set: HashSet<&str> = query_gene_names.iter().map(String::as_str).collect();
    let mut candidates: Vec<usize> = (0..marker_array.n_genes())
        .filter(|&gene| query_set.contains(marker_array.gene_names()[gene].as_str()))
        .collect();
    if candidates.is_empty() {
        return Err(MapperError::EmptyVocabulary);
    }
    // Lexicographic candidate order makes the strict-greater scan below
    // implement the final tie-break for free.
    candidates.sort_by(|&a, &b| {
        marker_array.gene_names()[a].cmp(&marker_array.gene_names()[b])
    });

    let leaf_pairs = tree.leaves_to_compare(parent)?;
    if leaf_pairs.is_empty() {
        return Ok(Vec::new());
    }
    let pair_indices: Vec<usize> = leaf_pairs
        .iter()
        .map(|(a, b)| marker_array.idx_of_pair(a, b))
        .collect::<Result<_>>()?;

    // Per candidate, the (pair, sign) slots it covers, encoded as
    // 2 * position + sign.
    let covers: Vec<Vec<u32>> = candidates
        .iter()
        .map(|&gene| {
            let mut slots = Vec::new();
            for (pos, &pair) in pair_indices.iter().enumerate() {
                if marker_array.is_marker(gene, pair) {
                    let sign = if marker_array.up_in_first(gene, pair) { 0 } else { 1 };
                    slots.push((2 * pos + sign) as u32);
                }
            }
            slots
        })
        .collect();

    let mut covered = vec![0usize; 2 * pair_indices.len()];
    let mut used = vec![false; candidates.len()];
    let mut chosen = Vec::new();
    loop {
        if covered.iter().all(|&c| c >= n_per_utility) {
            break;
        }
        let mut best: Option<(usize, usize, usize)> = None;
        for (cand, slots) in covers.iter().enumerate() {
            if used[cand] || slots.is_empty() {
                continue;
            }
            let gain = slots
                .iter()
                .filter(|&&slot| covered[slot as usize] < n_per_utility)
                .count();
            if gain == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_gain, best_utility, _)) => {
                    gain > best_gain || (gain == best_gain && slots.len() > best_utility)
                }
            };
            if better {
                best = Some((gain, slots.len(), cand));
            }
        }
        let Some((_, _, cand)) = best else {
            break;
        };
        used[cand] = true;
        for &slot in &covers[cand] {
            covered[slot as usize] += 1;
        }
        chosen.push(marker_array.gene_names()[candidates[cand]].clone());
    }
    Ok(chosen)
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

    fn fixture_pairs() -> Vec<(String, String)> {
        vec![
            ("c0".to_string(), "c1".to_string()),
            ("c0".to_string(), "c2".to_string()),
            ("c1".to_string(), "c2".to_string()),
        ]
    }

    fn write_fixture(
        dir: &std::path::Path,
        set_bits: &[(usize, usize, bool)],
        n_genes: usize,
    ) -> MarkerGeneArray {
        let genes: Vec<String> = (0..n_genes).map(|i| format!("g_{i:02}")).collect();
        let mut is_marker = BitMatrix::zeros(n_genes, 3);
        let mut up = BitMatrix::zeros(n_genes, 3);
        for &(gene, pair, up_first) in set_bits {
            is_marker.set(gene, pair, true);
            up.set(gene, pair, up_first);
        }
        let path = dir.join("markers.h5");
        write_marker_fixture(&path, &genes, "cluster", &fixture_pairs(), &is_marker, &up);
        MarkerGeneArray::from_h5_file(&path).unwrap()
    }

    #[test]
    fn test_no_overlap_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let array = write_fixture(dir.path(), &[(0, 0, true)], 4);
        let err = select_marker_genes(
            &array,
            &["nope_1".to_string(), "nope_2".to_string()],
            &fixture_tree(),
            &None,
            5,
        )
        .unwrap_err();
        assert!(matches!(err, MapperError::EmptyVocabulary));
    }

    #[test]
    fn test_blank_markers_select_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let array = write_fixture(dir.path(), &[], 4);
        let genes: Vec<String> = (0..4).map(|i| format!("g_{i:02}")).collect();
        let chosen =
            select_marker_genes(&array, &genes, &fixture_tree(), &None, 5).unwrap();
        assert!(chosen.is_empty());
    }

    #[test]
    fn test_single_child_parent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let array = write_fixture(dir.path(), &[(0, 0, true)], 4);
        let genes: Vec<String> = (0..4).map(|i| format!("g_{i:02}")).collect();
        let parent = Some(("class".to_string(), "B".to_string()));
        let chosen = select_marker_genes(&array, &genes, &fixture_tree(), &parent, 5).unwrap();
        assert!(chosen.is_empty());
    }

    #[test]
    fn test_greedy_prefers_wider_coverage() {
        let dir = tempfile::tempdir().unwrap();
        // g_00 covers all three pairs; g_01..g_03 cover one pair each.
        let array = write_fixture(
            dir.path(),
            &[
                (0, 0, true),
                (0, 1, true),
                (0, 2, true),
                (1, 0, true),
                (2, 1, true),
                (3, 2, true),
            ],
            5,
        );
        let genes: Vec<String> = (0..5).map(|i| format!("g_{i:02}")).collect();
        let chosen = select_marker_genes(&array, &genes, &fixture_tree(), &None, 1).unwrap();
        assert_eq!(chosen[0], "g_00");
        // Coverage soundness: every returned gene marks some pair under
        // the parent.
        for gene in &chosen {
            assert!(genes.contains(gene));
        }
    }

    #[test]
    fn test_restriction_to_query_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let array = write_fixture(
            dir.path(),
            &[(0, 0, true), (1, 0, true), (2, 1, true)],
            4,
        );
        // g_00 is absent from the query, so it may not be selected.
        let query = vec!["g_01".to_string(), "g_02".to_string()];
        let chosen =
            select_marker_genes(&array, &query, &fixture_tree(), &None, 2).unwrap();
        assert!(!chosen.contains(&"g_00".to_string()));
        assert!(chosen.contains(&"g_01".to_string()));
        assert!(chosen.contains(&"g_02".to_string()));
    }

    #[test]
    fn test_coverage_reaches_available_depth() {
        let dir = tempfile::tempdir().unwrap();
        // Three genes all cover pair 0 with the same (up) sign.
        let array = write_fixture(
            dir.path(),
            &[(0, 0, true), (1, 0, true), (2, 0, true)],
            4,
        );
        let genes: Vec<String> = (0..4).map(|i| format!("g_{i:02}")).collect();
        let parent = Some(("class".to_string(), "A".to_string()));
        // Ask for more coverage than genes exist: all three are taken.
        let chosen = select_marker_genes(&array, &genes, &fixture_tree(), &parent, 5).unwrap();
        assert_eq!(
            chosen,
            vec!["g_00".to_string(), "g_01".to_string(), "g_02".to_string()]
        );
    }
}
