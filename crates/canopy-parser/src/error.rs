use canopy_ast::Span;
use thiserror::Error;

/// Errors produced while splitting a template or parsing a binding
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unclosed binding: missing '}}}}'")]
    UnclosedBinding { span: Span },

    #[error("empty binding")]
    EmptyBinding { span: Span },

    #[error("unexpected {found}, expected {expected}")]
    Unexpected {
        found: &'static str,
        expected: String,
        span: Span,
    },

    #[error("invalid token '{text}'")]
    InvalidToken { text: String, span: Span },

    #[error("invalid number literal '{text}'")]
    InvalidNumber { text: String, span: Span },

    #[error("invalid escape sequence in string literal")]
    InvalidEscape { span: Span },

    #[error("expression nested deeper than {limit} levels")]
    TooDeep { limit: usize, span: Span },
}

impl ParseError {
    /// Location of the error inside the template source
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnclosedBinding { span }
            | ParseError::EmptyBinding { span }
            | ParseError::Unexpected { span, .. }
            | ParseError::InvalidToken { span, .. }
            | ParseError::InvalidNumber { span, .. }
            | ParseError::InvalidEscape { span }
            | ParseError::TooDeep { span, .. } => *span,
        }
    }
}
