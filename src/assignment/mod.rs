pub mod election;
pub mod matching;

pub use election::{BootstrapParams, ElectionParams, run_type_assignment_on_h5ad};
pub use matching::{LeafMeans, assemble_query_data, get_leaf_means};
