pub mod csv;
pub mod json;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use csv::write_mapping_csv;
pub use json::write_mapping_json;

/// The assignment of one cell at one taxonomy level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelAssignment {
    pub assignment: String,
    pub bootstrapping_probability: f64,
    pub avg_correlation: f64,
}

/// The full per-cell result: the cell id plus one assignment per
/// hierarchy level, serialized flat the way the result JSON expects
/// (`{"cell_id": ..., "<level>": {...}, ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellAssignment {
    pub cell_id: String,
    #[serde(flatten)]
    pub levels: BTreeMap<String, LevelAssignment>,
}
