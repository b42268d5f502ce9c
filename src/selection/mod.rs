pub mod marker_array;
pub mod pipeline;
pub mod query_cache;
pub mod selector;

pub use marker_array::MarkerGeneArray;
pub use pipeline::select_all_markers;
pub use query_cache::{MarkerCache, create_marker_cache, reconcile_taxonomy_and_markers};
pub use selector::select_marker_genes;
