use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Instance-ordering strategy for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOrdering {
    /// Arrival order. Requeued instances keep their original position.
    #[serde(rename = "fifo")]
    Fifo,
    /// Highest message priority first; arrival order within a priority band.
    #[serde(rename = "priority")]
    Priority,
}

impl Default for QueueOrdering {
    fn default() -> Self {
        QueueOrdering::Fifo
    }
}

impl Display for QueueOrdering {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueOrdering::Fifo => write!(f, "FIFO"),
            QueueOrdering::Priority => write!(f, "Priority"),
        }
    }
}
