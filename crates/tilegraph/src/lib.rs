extern crate self as tilegraph;

pub mod backend;
pub mod env;

pub use backend::expr::SizeExpr;
pub use backend::spec::{DType, Graph, GraphBuilder, Node, NodeId, Operation};
pub use backend::GraphError;
