//! Errors raised by the replicated model.

use thiserror::Error;

use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("not a folder: {0}")]
    NotAFolder(NodeId),

    #[error("not a file: {0}")]
    NotAFile(NodeId),

    #[error("moving {id} under {parent} would create a cycle")]
    WouldCycle { id: NodeId, parent: NodeId },

    #[error("text range {index}..{end} out of bounds for {id} (len {len})")]
    OutOfRange {
        id: NodeId,
        index: u32,
        end: u32,
        len: u32,
    },

    #[error("failed to decode update: {0}")]
    Decode(String),
}

impl From<yrs::encoding::read::Error> for ModelError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        ModelError::Decode(e.to_string())
    }
}
