use canopy_ast::Span;
use canopy_parser::ParseError;
use thiserror::Error;

/// A template failed to evaluate. Carries the offending template text.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("failed to evaluate `{expression}`: {kind}")]
pub struct EvalError {
    pub expression: String,
    #[source]
    pub kind: EvalErrorKind,
}

impl EvalError {
    pub fn new(expression: impl Into<String>, kind: EvalErrorKind) -> Self {
        Self {
            expression: expression.into(),
            kind,
        }
    }

    /// Location of the fault inside `expression`, when known
    pub fn span(&self) -> Option<Span> {
        self.kind.span()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalErrorKind {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("'{name}' is not defined")]
    UnknownIdentifier { name: String, span: Span },

    #[error("cannot read property '{property}' of {target}")]
    UndefinedReference {
        property: String,
        target: &'static str,
        span: Span,
    },

    #[error("'{name}' is not an allowed function")]
    UnknownFunction { name: String, span: Span },

    #[error("{function}: {message}")]
    BadArguments {
        function: String,
        message: String,
        span: Span,
    },

    #[error("invalid operands for '{operator}': {details}")]
    InvalidOperands {
        operator: &'static str,
        details: String,
        span: Span,
    },

    #[error("division by zero")]
    DivisionByZero { span: Span },

    #[error("result is not a finite number")]
    NonFinite { span: Span },
}

impl EvalErrorKind {
    pub fn span(&self) -> Option<Span> {
        match self {
            EvalErrorKind::Parse(err) => Some(err.span()),
            EvalErrorKind::UnknownIdentifier { span, .. }
            | EvalErrorKind::UndefinedReference { span, .. }
            | EvalErrorKind::UnknownFunction { span, .. }
            | EvalErrorKind::BadArguments { span, .. }
            | EvalErrorKind::InvalidOperands { span, .. }
            | EvalErrorKind::DivisionByZero { span }
            | EvalErrorKind::NonFinite { span } => Some(*span),
        }
    }
}
