pub mod markers;
pub mod scores;

pub use markers::find_markers_for_all_pairs;
pub use scores::{AggregatedStats, MarkerThresholds, aggregate_stats, score_differential_genes};
