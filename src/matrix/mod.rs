pub mod cell_by_gene;

pub use cell_by_gene::{CellByGeneMatrix, Normalization};
