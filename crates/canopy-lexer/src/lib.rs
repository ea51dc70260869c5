//! Canopy Lexer - Tokenization using logos
//!
//! Tokenizes the code inside a single `{{ }}` binding. The binding language
//! looks like a small slice of JavaScript:
//! - `===` / `!==` alongside `==` / `!=`
//! - `?.` optional member access and `??` nullish fallback
//! - single- or double-quoted strings

mod token;

pub use token::*;

use canopy_ast::Span;
use logos::Logos;

/// Tokenize a source string into a vector of tokens.
///
/// `base` is added to every span so tokens point into the enclosing template.
pub fn tokenize(source: &str, base: usize) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut lexer = TokenKind::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::new(lexer.span().start, lexer.span().end).offset(base);
        let kind = match result {
            Ok(kind) => kind,
            Err(_) => TokenKind::Error,
        };
        tokens.push(Token { kind, span });
    }

    // Add EOF token
    let end = base + source.len();
    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(end, end),
    });

    tokens
}

/// A token with its span
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    /// Slice of the template text this token covers
    pub fn text<'a>(&self, template: &'a str) -> &'a str {
        &template[self.span.start..self.span.end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source, 0).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_state_reference() {
        let tokens = kinds("queries.getUsers.data");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident,
                TokenKind::Dot,
                TokenKind::Ident,
                TokenKind::Dot,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_optional_chaining_vs_ternary() {
        let tokens = kinds("a?.b");
        assert_eq!(tokens[1], TokenKind::QuestionDot);

        let tokens = kinds("a ? b : c");
        assert_eq!(tokens[1], TokenKind::Question);
        assert_eq!(tokens[3], TokenKind::Colon);

        let tokens = kinds("a ?? b");
        assert_eq!(tokens[1], TokenKind::QuestionQuestion);
    }

    // === Token Coverage ===

    #[test]
    fn test_keywords() {
        let tokens = kinds("true false null undefined");
        assert_eq!(tokens[0], TokenKind::True);
        assert_eq!(tokens[1], TokenKind::False);
        assert_eq!(tokens[2], TokenKind::Null);
        assert_eq!(tokens[3], TokenKind::Undefined);
    }

    #[test]
    fn test_all_operators() {
        // Comparison operators
        let tokens = kinds("== != === !== < <= > >=");
        assert_eq!(tokens[0], TokenKind::EqEq);
        assert_eq!(tokens[1], TokenKind::Ne);
        assert_eq!(tokens[2], TokenKind::EqEqEq);
        assert_eq!(tokens[3], TokenKind::NeEq);
        assert_eq!(tokens[4], TokenKind::Lt);
        assert_eq!(tokens[5], TokenKind::Le);
        assert_eq!(tokens[6], TokenKind::Gt);
        assert_eq!(tokens[7], TokenKind::Ge);

        // Arithmetic operators
        let tokens = kinds("+ - * / %");
        assert_eq!(tokens[0], TokenKind::Plus);
        assert_eq!(tokens[1], TokenKind::Minus);
        assert_eq!(tokens[2], TokenKind::Star);
        assert_eq!(tokens[3], TokenKind::Slash);
        assert_eq!(tokens[4], TokenKind::Percent);

        // Boolean operators
        let tokens = kinds("&& || !");
        assert_eq!(tokens[0], TokenKind::AndAnd);
        assert_eq!(tokens[1], TokenKind::OrOr);
        assert_eq!(tokens[2], TokenKind::Bang);
    }

    #[test]
    fn test_delimiters_and_punctuation() {
        let tokens = kinds("( ) { } [ ] , : . ?");
        assert_eq!(tokens[0], TokenKind::LParen);
        assert_eq!(tokens[1], TokenKind::RParen);
        assert_eq!(tokens[2], TokenKind::LBrace);
        assert_eq!(tokens[3], TokenKind::RBrace);
        assert_eq!(tokens[4], TokenKind::LBracket);
        assert_eq!(tokens[5], TokenKind::RBracket);
        assert_eq!(tokens[6], TokenKind::Comma);
        assert_eq!(tokens[7], TokenKind::Colon);
        assert_eq!(tokens[8], TokenKind::Dot);
        assert_eq!(tokens[9], TokenKind::Question);
    }

    // === String Tests ===

    #[test]
    fn test_both_quote_styles() {
        let source = r#""double" 'single'"#;
        let tokens = tokenize(source, 0);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text(source), r#""double""#);
        assert_eq!(tokens[1].kind, TokenKind::String);
        assert_eq!(tokens[1].text(source), "'single'");
    }

    #[test]
    fn test_string_with_escapes() {
        let source = r#""hello \"world\"""#;
        let tokens = tokenize(source, 0);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text(source), source);
    }

    // === Number Tests ===

    #[test]
    fn test_number_formats() {
        let source = "0 42 1.5 2e3";
        let tokens = tokenize(source, 0);
        assert!(tokens[..4].iter().all(|t| t.kind == TokenKind::Number));
        assert_eq!(tokens[2].text(source), "1.5");
        assert_eq!(tokens[3].text(source), "2e3");
    }

    #[test]
    fn test_negative_number_is_two_tokens() {
        let tokens = kinds("-5");
        assert_eq!(tokens[0], TokenKind::Minus);
        assert_eq!(tokens[1], TokenKind::Number);
    }

    // === Error Cases ===

    #[test]
    fn test_invalid_token_produces_error() {
        let tokens = kinds("a @ b");
        assert!(tokens.contains(&TokenKind::Error));
    }

    #[test]
    fn test_assignment_is_not_a_token() {
        // Bindings are read-only; a lone `=` must not lex as an operator
        let tokens = kinds("a = b");
        assert!(tokens.contains(&TokenKind::Error));
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = kinds(r#""unclosed string"#);
        assert!(tokens.contains(&TokenKind::Error));
    }

    // === Edge Cases ===

    #[test]
    fn test_empty_input() {
        let tokens = tokenize("", 0);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }

    #[test]
    fn test_span_offset_into_template() {
        let template = "Hi {{ name }}";
        // Code starts after the opening braces
        let tokens = tokenize(&template[5..11], 5);
        assert_eq!(tokens[0].kind, TokenKind::Ident);
        assert_eq!(tokens[0].text(template), "name");
        assert_eq!(tokens[0].span.start, 6);
        assert_eq!(tokens[1].span.start, 11);
    }

    #[test]
    fn test_identifier_characters() {
        let source = "table_1 $ctx _private";
        let tokens = tokenize(source, 0);
        assert!(tokens[..3].iter().all(|t| t.kind == TokenKind::Ident));
        assert_eq!(tokens[1].text(source), "$ctx");
    }

    #[test]
    fn test_keyword_is_keyword() {
        assert!(TokenKind::True.is_keyword());
        assert!(TokenKind::Undefined.is_keyword());
        assert!(!TokenKind::Ident.is_keyword());
        assert!(!TokenKind::EqEq.is_keyword());
    }
}
