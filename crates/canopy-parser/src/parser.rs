//! Recursive descent parser for binding expressions

use crate::ParseError;
use canopy_ast::{BinaryOp, Expr, ExprKind, Literal, Span, UnaryOp};
use canopy_lexer::{Token, TokenKind};

/// Deepest nesting a binding may reach. Groups, operands, member links and
/// call arguments each count one level.
pub const MAX_NESTING: usize = 64;

pub struct Parser<'a> {
    /// Full template text; token spans index into it
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a str, tokens: Vec<Token>) -> Self {
        Self {
            source,
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Parse one complete binding: an expression followed by end of input
    pub fn parse_binding(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_expr()?;
        if !self.check(TokenKind::Eof) {
            return Err(self.unexpected("end of expression"));
        }
        Ok(expr)
    }

    pub fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        self.nest()?;
        let expr = self.parse_conditional();
        self.depth -= 1;
        expr
    }

    // === Token Helpers ===

    fn peek(&self) -> &Token {
        // `tokenize` always appends Eof, so the last token is a safe fallback
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: TokenKind) -> Option<Token> {
        if self.check(kind) {
            Some(self.advance())
        } else {
            None
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        self.eat(kind).ok_or_else(|| self.unexpected(kind.describe()))
    }

    fn nest(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::TooDeep {
                limit: MAX_NESTING,
                span: self.peek().span,
            });
        }
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        if token.kind == TokenKind::Error {
            return ParseError::InvalidToken {
                text: token.text(self.source).to_string(),
                span: token.span,
            };
        }
        ParseError::Unexpected {
            found: token.kind.describe(),
            expected: expected.to_string(),
            span: token.span,
        }
    }

    // === Expressions ===

    fn parse_conditional(&mut self) -> Result<Expr, ParseError> {
        let test = self.parse_binary(0)?;
        if self.eat(TokenKind::Question).is_none() {
            return Ok(test);
        }
        let consequent = self.parse_expr()?;
        self.expect(TokenKind::Colon)?;
        let alternate = self.parse_expr()?;
        let span = test.span.to(alternate.span);
        Ok(Expr::new(
            ExprKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            span,
        ))
    }

    /// Precedence climbing over left-associative binary operators
    fn parse_binary(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        let mut links = 0;

        while let Some((op, prec)) = binary_op(self.peek_kind()) {
            if prec < min_prec {
                break;
            }
            self.nest()?;
            links += 1;
            self.advance();
            let right = self.parse_binary(prec + 1)?;
            let span = left.span.to(right.span);
            left = Expr::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );
        }

        self.depth -= links;
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            TokenKind::Bang => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        let start = self.advance().span;
        self.nest()?;
        let operand = self.parse_unary()?;
        self.depth -= 1;
        let span = start.to(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;
        let mut links = 0;

        loop {
            if matches!(
                self.peek_kind(),
                TokenKind::Dot | TokenKind::QuestionDot | TokenKind::LBracket | TokenKind::LParen
            ) {
                self.nest()?;
                links += 1;
            }
            match self.peek_kind() {
                TokenKind::Dot => {
                    self.advance();
                    let (property, end) = self.parse_property_name()?;
                    let span = expr.span.to(end);
                    expr = Expr::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property,
                            optional: false,
                        },
                        span,
                    );
                }
                TokenKind::QuestionDot => {
                    self.advance();
                    if self.eat(TokenKind::LBracket).is_some() {
                        let index = self.parse_expr()?;
                        let end = self.expect(TokenKind::RBracket)?.span;
                        let span = expr.span.to(end);
                        expr = Expr::new(
                            ExprKind::Index {
                                object: Box::new(expr),
                                index: Box::new(index),
                                optional: true,
                            },
                            span,
                        );
                    } else {
                        let (property, end) = self.parse_property_name()?;
                        let span = expr.span.to(end);
                        expr = Expr::new(
                            ExprKind::Member {
                                object: Box::new(expr),
                                property,
                                optional: true,
                            },
                            span,
                        );
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    let end = self.expect(TokenKind::RBracket)?.span;
                    let span = expr.span.to(end);
                    expr = Expr::new(
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index),
                            optional: false,
                        },
                        span,
                    );
                }
                TokenKind::LParen => {
                    self.advance();
                    let args = self.parse_list(TokenKind::RParen, Self::parse_expr)?;
                    let end = self.expect(TokenKind::RParen)?.span;
                    let span = expr.span.to(end);
                    expr = Expr::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        span,
                    );
                }
                _ => break,
            }
        }

        self.depth -= links;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = self.peek().clone();
        let literal = match token.kind {
            TokenKind::Number => {
                self.advance();
                let text = token.text(self.source);
                let value = text.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
                    text: text.to_string(),
                    span: token.span,
                })?;
                Literal::Number(value)
            }
            TokenKind::String => {
                self.advance();
                Literal::String(unescape(token.text(self.source), token.span)?)
            }
            TokenKind::True => {
                self.advance();
                Literal::Bool(true)
            }
            TokenKind::False => {
                self.advance();
                Literal::Bool(false)
            }
            TokenKind::Null => {
                self.advance();
                Literal::Null
            }
            TokenKind::Undefined => {
                self.advance();
                Literal::Undefined
            }
            TokenKind::Ident => {
                self.advance();
                let name = token.text(self.source).to_string();
                return Ok(Expr::new(ExprKind::Ident(name), token.span));
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                let end = self.expect(TokenKind::RParen)?.span;
                // Keep the inner node but widen its span to the parentheses
                return Ok(Expr::new(inner.kind, token.span.to(end)));
            }
            TokenKind::LBracket => {
                self.advance();
                let items = self.parse_list(TokenKind::RBracket, Self::parse_expr)?;
                let end = self.expect(TokenKind::RBracket)?.span;
                return Ok(Expr::new(ExprKind::Array(items), token.span.to(end)));
            }
            TokenKind::LBrace => {
                self.advance();
                let fields = self.parse_list(TokenKind::RBrace, Self::parse_object_field)?;
                let end = self.expect(TokenKind::RBrace)?.span;
                return Ok(Expr::new(ExprKind::Object(fields), token.span.to(end)));
            }
            _ => return Err(self.unexpected("an expression")),
        };
        Ok(Expr::new(ExprKind::Literal(literal), token.span))
    }

    /// Comma-separated items up to (not including) `close`; trailing comma allowed
    fn parse_list<T>(
        &mut self,
        close: TokenKind,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = Vec::new();
        while !self.check(close) {
            items.push(item(self)?);
            if self.eat(TokenKind::Comma).is_none() {
                break;
            }
        }
        Ok(items)
    }

    fn parse_object_field(&mut self) -> Result<(String, Expr), ParseError> {
        let token = self.peek().clone();
        let key = match token.kind {
            TokenKind::String => unescape(token.text(self.source), token.span)?,
            TokenKind::Number | TokenKind::Ident => token.text(self.source).to_string(),
            kind if kind.is_keyword() => token.text(self.source).to_string(),
            _ => return Err(self.unexpected("an object key")),
        };
        self.advance();

        // Shorthand `{ name }` reads the identifier of the same name
        if token.kind == TokenKind::Ident && (self.check(TokenKind::Comma) || self.check(TokenKind::RBrace)) {
            return Ok((key.clone(), Expr::new(ExprKind::Ident(key), token.span)));
        }

        self.expect(TokenKind::Colon)?;
        let value = self.parse_expr()?;
        Ok((key, value))
    }

    /// Property name after `.` or `?.`; keywords are valid property names
    fn parse_property_name(&mut self) -> Result<(String, Span), ParseError> {
        let token = self.peek().clone();
        if token.kind == TokenKind::Ident || token.kind.is_keyword() {
            self.advance();
            return Ok((token.text(self.source).to_string(), token.span));
        }
        Err(self.unexpected("a property name"))
    }
}

fn binary_op(kind: TokenKind) -> Option<(BinaryOp, u8)> {
    let entry = match kind {
        TokenKind::QuestionQuestion => (BinaryOp::Nullish, 1),
        TokenKind::OrOr => (BinaryOp::Or, 2),
        TokenKind::AndAnd => (BinaryOp::And, 3),
        TokenKind::EqEq => (BinaryOp::Eq, 4),
        TokenKind::Ne => (BinaryOp::Ne, 4),
        TokenKind::EqEqEq => (BinaryOp::StrictEq, 4),
        TokenKind::NeEq => (BinaryOp::StrictNe, 4),
        TokenKind::Lt => (BinaryOp::Lt, 5),
        TokenKind::Le => (BinaryOp::Le, 5),
        TokenKind::Gt => (BinaryOp::Gt, 5),
        TokenKind::Ge => (BinaryOp::Ge, 5),
        TokenKind::Plus => (BinaryOp::Add, 6),
        TokenKind::Minus => (BinaryOp::Sub, 6),
        TokenKind::Star => (BinaryOp::Mul, 7),
        TokenKind::Slash => (BinaryOp::Div, 7),
        TokenKind::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    };
    Some(entry)
}

/// Strip quotes and resolve escapes of a string literal token
fn unescape(raw: &str, span: Span) -> Result<String, ParseError> {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let code = u32::from_str_radix(&hex, 16).map_err(|_| ParseError::InvalidEscape { span })?;
                out.push(char::from_u32(code).ok_or(ParseError::InvalidEscape { span })?);
            }
            _ => return Err(ParseError::InvalidEscape { span }),
        }
    }

    Ok(out)
}
