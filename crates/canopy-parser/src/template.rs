//! Splits template text into literal runs and `{{ }}` bindings

use crate::{ParseError, Parser};
use canopy_ast::{Segment, Span, Template};
use canopy_lexer::tokenize;

pub(crate) fn split(source: &str) -> Result<Template, ParseError> {
    let bytes = source.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;

    while pos + 1 < bytes.len() {
        if bytes[pos] != b'{' || bytes[pos + 1] != b'{' {
            pos += 1;
            continue;
        }

        if pos > text_start {
            segments.push(Segment::Text(source[text_start..pos].to_string()));
        }

        let open = pos;
        let code_start = pos + 2;
        let code_end = find_close(bytes, code_start).ok_or(ParseError::UnclosedBinding {
            span: Span::new(open, source.len()),
        })?;
        let span = Span::new(open, code_end + 2);
        let code = &source[code_start..code_end];
        if code.trim().is_empty() {
            return Err(ParseError::EmptyBinding { span });
        }

        let tokens = tokenize(code, code_start);
        let expr = Parser::new(source, tokens).parse_binding()?;
        segments.push(Segment::Binding {
            code: code.trim().to_string(),
            expr,
            span,
        });

        pos = code_end + 2;
        text_start = pos;
    }

    if text_start < source.len() {
        segments.push(Segment::Text(source[text_start..].to_string()));
    }

    Ok(Template {
        source: source.to_string(),
        segments,
    })
}

/// Index of the `}}` that closes a binding starting at `start`.
/// Braces of object literals nest; braces inside string literals are ignored.
fn find_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut pos = start;

    while pos < bytes.len() {
        let b = bytes[pos];
        if let Some(q) = quote {
            if b == b'\\' {
                pos += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            pos += 1;
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' => depth += 1,
            b'}' if depth == 0 => {
                if bytes.get(pos + 1) == Some(&b'}') {
                    return Some(pos);
                }
                return None;
            }
            b'}' => depth -= 1,
            _ => {}
        }
        pos += 1;
    }
    None
}
