pub mod tree;

pub use tree::{ParentNode, TaxonomyTree};
