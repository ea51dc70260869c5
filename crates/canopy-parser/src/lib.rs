//! Canopy Parser - Template splitting and recursive descent
//!
//! Turns template text such as `Hello {{ components.input1.value }}` into a
//! `Template`: literal runs interleaved with parsed binding expressions.
//! Parsing challenges:
//! - `{{ }}` delimiters must not be confused with object literal braces
//! - `?.` / `??` / `? :` all start with a question mark
//! - every span points into the full template so diagnostics line up

mod error;
mod parser;
mod template;

pub use error::*;
pub use parser::*;

use canopy_ast::{Expr, Template};
use canopy_lexer::tokenize;

/// Parse template text into literal segments and bindings
pub fn parse_template(source: &str) -> Result<Template, ParseError> {
    template::split(source)
}

/// Parse bare binding code (without the surrounding `{{ }}`)
pub fn parse_expression(code: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(code, 0);
    let mut parser = Parser::new(code, tokens);
    parser.parse_binding()
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_ast::{BinaryOp, ExprKind, Literal, UnaryOp};

    fn expr(code: &str) -> ExprKind {
        match parse_expression(code) {
            Ok(expr) => expr.kind,
            Err(err) => panic!("Failed to parse {:?}: {}", code, err),
        }
    }

    #[test]
    fn test_parse_state_reference() {
        let kind = expr("queries.getUsers.data");
        match kind {
            ExprKind::Member { object, property, optional } => {
                assert_eq!(property, "data");
                assert!(!optional);
                assert!(matches!(object.kind, ExprKind::Member { .. }));
            }
            other => panic!("expected member access, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_index_and_call() {
        let kind = expr("components.table1.rows[0].name.toUpperCase()");
        match kind {
            ExprKind::Call { callee, args } => {
                assert!(args.is_empty());
                assert!(matches!(callee.kind, ExprKind::Member { ref property, .. } if property == "toUpperCase"));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_optional_chaining() {
        assert!(matches!(expr("a?.b"), ExprKind::Member { optional: true, .. }));
        assert!(matches!(expr("a?.[0]"), ExprKind::Index { optional: true, .. }));
    }

    // === Precedence ===

    #[test]
    fn test_multiplication_binds_tighter() {
        match expr("1 + 2 * 3") {
            ExprKind::Binary { op: BinaryOp::Add, right, .. } => {
                assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_left_associative_subtraction() {
        match expr("10 - 4 - 3") {
            ExprKind::Binary { op: BinaryOp::Sub, left, .. } => {
                assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Sub, .. }));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_conditional_is_lowest() {
        match expr("a && b ? 'yes' : c ?? 'no'") {
            ExprKind::Conditional { test, alternate, .. } => {
                assert!(matches!(test.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
                assert!(matches!(alternate.kind, ExprKind::Binary { op: BinaryOp::Nullish, .. }));
            }
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn test_unary_operators() {
        assert!(matches!(expr("!a"), ExprKind::Unary { op: UnaryOp::Not, .. }));
        assert!(matches!(expr("-1"), ExprKind::Unary { op: UnaryOp::Neg, .. }));
    }

    // === Literals ===

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            expr(r#""say \"hi\"\n""#),
            ExprKind::Literal(Literal::String("say \"hi\"\n".into()))
        );
        assert_eq!(expr(r"'A'"), ExprKind::Literal(Literal::String("A".into())));
    }

    #[test]
    fn test_array_and_object_literals() {
        match expr("[1, 'two', [3],]") {
            ExprKind::Array(items) => assert_eq!(items.len(), 3),
            other => panic!("expected array, got {:?}", other),
        }
        match expr("{ id: 1, \"full name\": 'x', status }") {
            ExprKind::Object(fields) => {
                let keys: Vec<_> = fields.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(keys, vec!["id", "full name", "status"]);
                assert!(matches!(fields[2].1.kind, ExprKind::Ident(ref n) if n == "status"));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_keyword_property_names() {
        assert!(matches!(expr("a.null"), ExprKind::Member { ref property, .. } if property == "null"));
    }

    // === Templates ===

    #[test]
    fn test_template_spans_point_into_source() {
        let source = "Rows: {{ queries.q1.data.length }}";
        let template = parse_template(source).unwrap();
        let binding = template.bindings().next().unwrap();
        assert_eq!(&source[binding.span.into_range()], "queries.q1.data.length");
    }

    #[test]
    fn test_template_single_binding() {
        let template = parse_template("{{ globals.filter }}").unwrap();
        assert!(template.single_binding().is_some());
    }

    // === Error Cases ===

    #[test]
    fn test_trailing_tokens_rejected() {
        let err = parse_expression("a b").unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { .. }));
    }

    #[test]
    fn test_missing_colon_in_conditional() {
        let err = parse_expression("a ? b").unwrap_err();
        assert_eq!(err.to_string(), "unexpected end of expression, expected ':'");
    }

    #[test]
    fn test_invalid_token_reported_with_text() {
        let err = parse_template("{{ a # b }}").unwrap_err();
        match err {
            ParseError::InvalidToken { text, span } => {
                assert_eq!(text, "#");
                assert_eq!(span.start, 5);
            }
            other => panic!("expected invalid token, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_escape() {
        assert!(matches!(parse_expression(r"'\q'"), Err(ParseError::InvalidEscape { .. })));
    }

    #[test]
    fn test_unclosed_call() {
        assert!(parse_expression("Math.max(1, 2").is_err());
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse_expression(&nested(MAX_NESTING - 1)).is_ok());
        for depth in [MAX_NESTING + 1, 500, 5000] {
            let err = parse_expression(&nested(depth)).unwrap_err();
            assert!(matches!(err, ParseError::TooDeep { limit: MAX_NESTING, .. }), "depth {}", depth);
        }
    }

    #[test]
    fn test_long_chains_count_toward_nesting() {
        let sum = vec!["1"; 10_000].join(" + ");
        assert!(matches!(parse_expression(&sum), Err(ParseError::TooDeep { .. })));

        let members = format!("globals{}", ".a".repeat(10_000));
        assert!(matches!(parse_expression(&members), Err(ParseError::TooDeep { .. })));

        let negations = format!("{}x", "!".repeat(10_000));
        assert!(matches!(parse_expression(&negations), Err(ParseError::TooDeep { .. })));

        let short = vec!["a"; 20].join(" + ");
        assert!(parse_expression(&short).is_ok());
    }
}
