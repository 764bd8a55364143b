//! Lexer for the Pascal dialect
//!
//! The lexer converts source code into a stream of tokens. It uses the
//! `logos` crate for the character-level work and wraps it in a cursor
//! with one-token lookahead, which is all the parser ever needs.

use crate::span::Span;
use crate::token::{Token, TokenKind};
use logos::Logos;
use thiserror::Error;

/// Lexer errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexerError {
    #[error("unexpected character at position {0}")]
    UnexpectedChar(usize),
}

/// The lexer for the Pascal dialect
pub struct Lexer<'src> {
    source: &'src str,
    inner: logos::Lexer<'src, TokenKind>,
    peeked: Option<Token>,
    errors: Vec<LexerError>,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer for the given source code
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            inner: TokenKind::lexer(source),
            peeked: None,
            errors: Vec::new(),
        }
    }

    /// Get the source code
    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Get any errors that occurred during lexing
    pub fn errors(&self) -> &[LexerError] {
        &self.errors
    }

    /// Peek at the next token without consuming it
    pub fn peek(&mut self) -> Option<&Token> {
        if self.peeked.is_none() {
            self.peeked = self.next_token();
        }
        self.peeked.as_ref()
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Option<Token> {
        if let Some(token) = self.peeked.take() {
            return Some(token);
        }

        loop {
            match self.inner.next() {
                Some(Ok(kind)) => {
                    let span = self.inner.span();
                    let span = Span::new(span.start, span.end);
                    // A one-character string literal is a char constant.
                    let kind = if kind == TokenKind::StringLiteral
                        && decode_string(span.text(self.source)).len() == 1
                    {
                        TokenKind::CharLiteral
                    } else {
                        kind
                    };
                    return Some(Token::new(kind, span));
                }
                Some(Err(())) => {
                    let span = self.inner.span();
                    self.errors.push(LexerError::UnexpectedChar(span.start));
                    continue;
                }
                None => {
                    let pos = self.source.len();
                    return Some(Token::new(TokenKind::Eof, Span::new(pos, pos)));
                }
            }
        }
    }

    /// Collect all tokens into a vector
    pub fn tokenize(mut self) -> (Vec<Token>, Vec<LexerError>) {
        let mut tokens = Vec::new();

        loop {
            match self.next_token() {
                Some(token) if token.kind == TokenKind::Eof => {
                    tokens.push(token);
                    break;
                }
                Some(token) => tokens.push(token),
                None => break,
            }
        }

        (tokens, self.errors)
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token;

    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token()?;
        if token.kind == TokenKind::Eof {
            None
        } else {
            Some(token)
        }
    }
}

/// Helper function to lex source code
pub fn lex(source: &str) -> (Vec<Token>, Vec<LexerError>) {
    Lexer::new(source).tokenize()
}

/// Decode a quoted Pascal string literal: strip the quotes and collapse
/// doubled quotes.
pub fn decode_string(text: &str) -> String {
    let inner = text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')).unwrap_or(text);
    inner.replace("''", "'")
}

/// Decode a character literal: either a one-character quoted string or a
/// `#NN` character code.
pub fn decode_char(text: &str) -> u8 {
    if let Some(code) = text.strip_prefix('#') {
        code.parse::<u8>().unwrap_or(0)
    } else {
        decode_string(text).bytes().next().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_kinds(source: &str) -> Vec<TokenKind> {
        let (tokens, _) = lex(source);
        tokens.into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_empty_source() {
        let kinds = token_kinds("");
        assert_eq!(kinds, vec![TokenKind::Eof]);
    }

    #[test]
    fn test_keywords_case_insensitive() {
        let kinds = token_kinds("BEGIN Begin begin");
        assert_eq!(
            kinds,
            vec![TokenKind::Begin, TokenKind::Begin, TokenKind::Begin, TokenKind::Eof]
        );
    }

    #[test]
    fn test_assignment_statement() {
        let kinds = token_kinds("i := 1 + 2 * 3;");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::IntLiteral,
                TokenKind::Plus,
                TokenKind::IntLiteral,
                TokenKind::Star,
                TokenKind::IntLiteral,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_range_is_not_a_real() {
        let kinds = token_kinds("1..10");
        assert_eq!(
            kinds,
            vec![TokenKind::IntLiteral, TokenKind::DotDot, TokenKind::IntLiteral, TokenKind::Eof]
        );
    }

    #[test]
    fn test_real_literal() {
        let kinds = token_kinds("3.14 2e10");
        assert_eq!(
            kinds,
            vec![TokenKind::RealLiteral, TokenKind::RealLiteral, TokenKind::Eof]
        );
    }

    #[test]
    fn test_char_vs_string_literal() {
        let kinds = token_kinds("'a' 'ab' #13");
        assert_eq!(
            kinds,
            vec![
                TokenKind::CharLiteral,
                TokenKind::StringLiteral,
                TokenKind::CharLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_doubled_quote_escape() {
        let (tokens, errors) = lex("'it''s'");
        assert!(errors.is_empty());
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
        assert_eq!(decode_string(tokens[0].text("'it''s'")), "it's");
    }

    #[test]
    fn test_comments_are_skipped() {
        let kinds = token_kinds("{ a comment } x (* another *) y");
        assert_eq!(
            kinds,
            vec![TokenKind::Identifier, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn test_operators() {
        let kinds = token_kinds("<> <= >= := .. ^");
        assert_eq!(
            kinds,
            vec![
                TokenKind::NotEqual,
                TokenKind::LessOrEqual,
                TokenKind::GreaterOrEqual,
                TokenKind::Assign,
                TokenKind::DotDot,
                TokenKind::Uparrow,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_invalid_character_is_reported() {
        let (tokens, errors) = lex("x ? y");
        assert_eq!(errors.len(), 1);
        assert_eq!(tokens.len(), 3); // x, y, eof
    }
}
