use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by cache operations and fallible constructors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A multi-level operation was called without any path component.
    #[error("{op} requires a path with at least one component")]
    EmptyPath { op: &'static str },

    /// The path crosses a position that already holds the other kind of node: a leaf value where
    /// a subtree is needed, or a subtree where a leaf value is requested.
    #[error("path conflicts with an existing {found} at depth {depth}")]
    PathConflict { depth: usize, found: NodeKind },

    /// Construction parameters were rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// The kind of node found at a tree position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Subtree,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Leaf => f.write_str("leaf value"),
            NodeKind::Subtree => f.write_str("subtree"),
        }
    }
}
