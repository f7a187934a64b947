use thiserror::Error;
use tilegraph::backend::spec::NodeId;
use tilegraph::GraphError;

/// Hard failures while analysing or rewriting one concat node.
///
/// "Nothing to do" outcomes are not errors: they surface as `Ok(None)` or an empty result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcatFusionError {
    #[error("invalid concat {node}: {reason}")]
    InvalidConcat { node: NodeId, reason: String },
    #[error("unexpected graph around {node}: {reason}")]
    UnexpectedTopology { node: NodeId, reason: String },
    #[error("arithmetic overflow while computing {what}")]
    Overflow { what: &'static str },
    #[error("graph verification failed after {stage}")]
    Verification { stage: &'static str },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl ConcatFusionError {
    pub fn invalid(node: NodeId, reason: impl Into<String>) -> Self {
        Self::InvalidConcat {
            node,
            reason: reason.into(),
        }
    }

    pub fn topology(node: NodeId, reason: impl Into<String>) -> Self {
        Self::UnexpectedTopology {
            node,
            reason: reason.into(),
        }
    }
}

pub type ConcatFusionResult<T> = Result<T, ConcatFusionError>;
