pub mod expr;
pub mod index;
pub mod rewriter;
pub mod spec;
pub mod target;
pub mod topology;

pub use index::GraphError;
