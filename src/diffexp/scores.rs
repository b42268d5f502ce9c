use ndarray::Array1;
use serde::Deserialize;

use crate::error::Result;
use crate::stats::ClusterStats;

const SCORE_EPSILON: f64 = 1.0e-9;

/// Summary statistics aggregated over a population of leaf clusters.
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    pub n_cells: u64,
    pub mean: Array1<f64>,
    pub var: Array1<f64>,
    pub q1: Array1<f64>,
}

/// Sum the additive per-leaf accumulators over a leaf population and
/// derive mean, variance (ddof = 1) and the CPM > 1 penetrance
/// fraction. A population of one cell reports zero variance.
pub fn aggregate_stats(leaves: &[String], stats: &ClusterStats) -> Result<AggregatedStats> {
    let n_genes = stats.n_genes();
    let mut n_cells = 0u64;
    let mut sum = Array1::<f64>::zeros(n_genes);
    let mut sumsq = Array1::<f64>::zeros(n_genes);
    let mut gt1 = Array1::<f64>::zeros(n_genes);
    for leaf in leaves {
        let row = stats.row_for_cluster(leaf)?;
        n_cells += stats.n_cells[row];
        sum += &stats.sum.row(row);
        sumsq += &stats.sumsq.row(row);
        gt1 += &stats.gt1.row(row).mapv(|v| v as f64);
    }
    let n = n_cells as f64;
    let (mean, var, q1) = if n_cells == 0 {
        (
            Array1::zeros(n_genes),
            Array1::zeros(n_genes),
            Array1::zeros(n_genes),
        )
    } else {
        let mean = sum.mapv(|s| s / n);
        let var = if n_cells > 1 {
            let mut var = &sumsq - &(&mean * &mean * n);
            var.mapv_inplace(|v| (v / (n - 1.0)).max(0.0));
            var
        } else {
            Array1::zeros(n_genes)
        };
        (mean, var, gt1.mapv(|g| g / n))
    };
    Ok(AggregatedStats {
        n_cells,
        mean,
        var,
        q1,
    })
}

/// Symmetric per-gene discriminator between two populations:
/// `(μ₁−μ₂)² / (σ₁²/n₁ + σ₂²/n₂ + ε)`.
pub fn diffexp_score(
    mean1: &Array1<f64>,
    var1: &Array1<f64>,
    n1: u64,
    mean2: &Array1<f64>,
    var2: &Array1<f64>,
    n2: u64,
) -> Array1<f64> {
    let n1 = (n1 as f64).max(1.0);
    let n2 = (n2 as f64).max(1.0);
    let mut out = Array1::<f64>::zeros(mean1.len());
    for gene in 0..mean1.len() {
        let delta = mean1[gene] - mean2[gene];
        let denom = var1[gene] / n1 + var2[gene] / n2 + SCORE_EPSILON;
        out[gene] = delta * delta / denom;
    }
    out
}

/// Two-sided Welch p-values with a Bonferroni correction over all
/// genes. The t statistic's tail is approximated by the normal
/// distribution, which is conservative nowhere and tight for the cell
/// counts clusters carry in practice.
pub fn corrected_p_values(
    mean1: &Array1<f64>,
    var1: &Array1<f64>,
    n1: u64,
    mean2: &Array1<f64>,
    var2: &Array1<f64>,
    n2: u64,
) -> Array1<f64> {
    let n_genes = mean1.len();
    let bonferroni = n_genes as f64;
    let n1 = n1 as f64;
    let n2 = n2 as f64;
    let mut out = Array1::<f64>::zeros(n_genes);
    for gene in 0..n_genes {
        let se2 = var1[gene] / n1.max(1.0) + var2[gene] / n2.max(1.0);
        let delta = (mean1[gene] - mean2[gene]).abs();
        let p = if se2 <= 0.0 {
            if delta > 0.0 { 0.0 } else { 1.0 }
        } else {
            let z = delta / se2.sqrt();
            libm::erfc(z / std::f64::consts::SQRT_2)
        };
        out[gene] = (p * bonferroni).min(1.0);
    }
    out
}

/// Validity thresholds for calling a gene a marker of a cluster pair.
/// Defaults follow the reference-marker tool's documented values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerThresholds {
    pub p_th: f64,
    pub q1_th: f64,
    pub q1_min_th: f64,
    pub qdiff_th: f64,
    pub qdiff_min_th: f64,
    pub log2_fold_th: f64,
    pub log2_fold_min_th: f64,
    pub n_valid: usize,
    pub exact_penetrance: bool,
}

impl Default for MarkerThresholds {
    fn default() -> Self {
        Self {
            p_th: 0.01,
            q1_th: 0.5,
            q1_min_th: 0.1,
            qdiff_th: 0.7,
            qdiff_min_th: 0.1,
            log2_fold_th: 1.0,
            log2_fold_min_th: 0.8,
            n_valid: 30,
            exact_penetrance: false,
        }
    }
}

/// Per-gene outcome of scoring one pair of leaf populations.
#[derive(Debug, Clone)]
pub struct PairScores {
    pub scores: Array1<f64>,
    pub validity: Vec<bool>,
    pub up_in_first: Vec<bool>,
    /// One side had no cells: no moments, no markers. The pair is
    /// skipped, not fatal; callers tally these for the run log.
    pub degenerate: bool,
}

/// Score every gene for one pair of sibling leaf populations and apply
/// the penetrance/fold-change/p-value validity rules. `allowed` can
/// restrict the candidate genes (e.g. to the query vocabulary). A pair
/// with no cells on either side is degenerate: it scores zero and
/// yields no markers.
pub fn score_differential_genes(
    pop1: &[String],
    pop2: &[String],
    stats: &ClusterStats,
    thresholds: &MarkerThresholds,
    allowed: Option<&[bool]>,
) -> Result<PairScores> {
    let n_genes = stats.n_genes();
    let agg1 = aggregate_stats(pop1, stats)?;
    let agg2 = aggregate_stats(pop2, stats)?;
    if agg1.n_cells == 0 || agg2.n_cells == 0 {
        tracing::debug!(
            "degenerate pair ({pop1:?}, {pop2:?}): {} vs {} cells, no markers scored",
            agg1.n_cells,
            agg2.n_cells
        );
        return Ok(PairScores {
            scores: Array1::zeros(n_genes),
            validity: vec![false; n_genes],
            up_in_first: vec![false; n_genes],
            degenerate: true,
        });
    }

    let scores = diffexp_score(
        &agg1.mean, &agg1.var, agg1.n_cells, &agg2.mean, &agg2.var, agg2.n_cells,
    );
    let p_values = corrected_p_values(
        &agg1.mean, &agg1.var, agg1.n_cells, &agg2.mean, &agg2.var, agg2.n_cells,
    );

    let mut validity = vec![false; n_genes];
    let mut relaxed = vec![false; n_genes];
    let mut up_in_first = vec![false; n_genes];
    let mut n_strict = 0usize;
    for gene in 0..n_genes {
        up_in_first[gene] = agg1.mean[gene] > agg2.mean[gene];
        if let Some(allowed) = allowed {
            if !allowed[gene] {
                continue;
            }
        }
        let q1_max = agg1.q1[gene].max(agg2.q1[gene]);
        let qdiff = (agg1.q1[gene] - agg2.q1[gene]).abs();
        let log2_fold =
            ((agg1.mean[gene] + 1.0) / (agg2.mean[gene] + 1.0)).log2().abs();
        if q1_max >= thresholds.q1_th
            && qdiff >= thresholds.qdiff_th
            && log2_fold >= thresholds.log2_fold_th
            && p_values[gene] < thresholds.p_th
        {
            validity[gene] = true;
            n_strict += 1;
        } else if q1_max >= thresholds.q1_min_th
            && qdiff >= thresholds.qdiff_min_th
            && log2_fold >= thresholds.log2_fold_min_th
        {
            relaxed[gene] = true;
        }
    }

    // Top up sparse pairs from the relaxed tier, best score first.
    if !thresholds.exact_penetrance && n_strict < thresholds.n_valid {
        let mut n_marked = n_strict;
        for gene in rank_genes(&scores, &validity) {
            if n_marked >= thresholds.n_valid {
                break;
            }
            if !validity[gene] && relaxed[gene] {
                validity[gene] = true;
                n_marked += 1;
            }
        }
    }

    Ok(PairScores {
        scores,
        validity,
        up_in_first,
        degenerate: false,
    })
}

/// Gene indices ordered valid-first, by descending score within each
/// tier.
pub fn rank_genes(scores: &Array1<f64>, validity: &[bool]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| {
        validity[b]
            .cmp(&validity[a])
            .then_with(|| {
                scores[b]
                    .partial_cmp(&scores[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.cmp(&b))
    });
    order
}
