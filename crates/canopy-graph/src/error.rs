use crate::DependentId;
use canopy_ast::Span;
use canopy_parser::ParseError;
use std::fmt;
use thiserror::Error;

/// A binding whose reads cannot be determined statically
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("'{name}' is not a state namespace, builtin or local")]
    UnknownRoot { name: String, span: Span },
}

impl TrackError {
    pub fn span(&self) -> Span {
        match self {
            TrackError::Parse(err) => err.span(),
            TrackError::UnknownRoot { span, .. } => *span,
        }
    }
}

/// A strongly connected set of dependents; each member reads another's output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", CyclePath(.members))]
pub struct CycleError {
    /// Members in discovery order
    pub members: Vec<DependentId>,
}

impl CycleError {
    pub fn contains(&self, dependent: &DependentId) -> bool {
        self.members.contains(dependent)
    }
}

struct CyclePath<'a>(&'a [DependentId]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for member in self.0 {
            write!(f, "{} -> ", member)?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// Problems found while rebuilding the graph. None of them abort the rebuild.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphDiagnostic {
    #[error("{dependent}: {error}")]
    Untracked {
        dependent: DependentId,
        source_text: String,
        error: TrackError,
    },

    #[error(transparent)]
    Cycle(#[from] CycleError),
}
