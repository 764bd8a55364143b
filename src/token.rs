//! Token definitions for the Pascal dialect
//!
//! This module defines all the tokens that the lexer can produce. Pascal
//! keywords are case-insensitive; identifier text is folded to lower case
//! at the parser boundary.

use crate::span::Span;
use logos::Logos;
use std::fmt;

/// A token produced by the lexer
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Get the text of this token from source
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        self.span.text(source)
    }
}

/// All possible token types in the Pascal dialect
#[derive(Logos, Debug, Clone, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"\{[^}]*\}")]
#[logos(skip r"\(\*([^*]|\*[^)])*\*\)")]
pub enum TokenKind {
    // ============ Literals ============

    /// Integer literal: 42
    #[regex(r"[0-9]+")]
    IntLiteral,

    /// Real literal: 3.14, 2.5e-3
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?")]
    #[regex(r"[0-9]+[eE][+-]?[0-9]+")]
    RealLiteral,

    /// String literal: 'hello', 'it''s'. The lexer reclassifies
    /// single-character literals as `CharLiteral`.
    #[regex(r"'([^'\n]|'')*'")]
    StringLiteral,

    /// Character literal. Produced by reclassification of one-character
    /// string literals and by `#NN` character codes.
    #[regex(r"#[0-9]+")]
    CharLiteral,

    // ============ Keywords ============

    #[token("program", ignore(ascii_case))]
    Program,
    #[token("var", ignore(ascii_case))]
    Var,
    #[token("type", ignore(ascii_case))]
    Type,
    #[token("const", ignore(ascii_case))]
    Const,
    #[token("function", ignore(ascii_case))]
    Function,
    #[token("procedure", ignore(ascii_case))]
    Procedure,
    #[token("begin", ignore(ascii_case))]
    Begin,
    #[token("end", ignore(ascii_case))]
    End,
    #[token("if", ignore(ascii_case))]
    If,
    #[token("then", ignore(ascii_case))]
    Then,
    #[token("else", ignore(ascii_case))]
    Else,
    #[token("for", ignore(ascii_case))]
    For,
    #[token("to", ignore(ascii_case))]
    To,
    #[token("downto", ignore(ascii_case))]
    Downto,
    #[token("do", ignore(ascii_case))]
    Do,
    #[token("while", ignore(ascii_case))]
    While,
    #[token("repeat", ignore(ascii_case))]
    Repeat,
    #[token("until", ignore(ascii_case))]
    Until,
    #[token("case", ignore(ascii_case))]
    Case,
    #[token("of", ignore(ascii_case))]
    Of,
    #[token("otherwise", ignore(ascii_case))]
    Otherwise,
    #[token("with", ignore(ascii_case))]
    With,
    #[token("record", ignore(ascii_case))]
    Record,
    #[token("object", ignore(ascii_case))]
    Object,
    #[token("array", ignore(ascii_case))]
    Array,
    #[token("file", ignore(ascii_case))]
    File,
    #[token("set", ignore(ascii_case))]
    Set,
    #[token("string", ignore(ascii_case))]
    String,
    #[token("packed", ignore(ascii_case))]
    Packed,
    #[token("nil", ignore(ascii_case))]
    Nil,
    #[token("forward", ignore(ascii_case))]
    Forward,
    #[token("static", ignore(ascii_case))]
    Static,
    #[token("virtual", ignore(ascii_case))]
    Virtual,
    #[token("override", ignore(ascii_case))]
    Override,
    #[token("write", ignore(ascii_case))]
    Write,
    #[token("writeln", ignore(ascii_case))]
    Writeln,
    #[token("read", ignore(ascii_case))]
    Read,
    #[token("readln", ignore(ascii_case))]
    Readln,
    #[token("sizeof", ignore(ascii_case))]
    SizeOf,

    // ============ Operators ============

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("div", ignore(ascii_case))]
    Div,
    #[token("mod", ignore(ascii_case))]
    Mod,
    #[token("and", ignore(ascii_case))]
    And,
    #[token("or", ignore(ascii_case))]
    Or,
    #[token("xor", ignore(ascii_case))]
    Xor,
    #[token("not", ignore(ascii_case))]
    Not,
    #[token("shl", ignore(ascii_case))]
    Shl,
    #[token("shr", ignore(ascii_case))]
    Shr,
    #[token("in", ignore(ascii_case))]
    In,

    #[token("=")]
    Equal,
    #[token("<>")]
    NotEqual,
    #[token("<")]
    LessThan,
    #[token("<=")]
    LessOrEqual,
    #[token(">")]
    GreaterThan,
    #[token(">=")]
    GreaterOrEqual,

    #[token(":=")]
    Assign,

    // ============ Punctuation ============

    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("[")]
    LeftSquare,
    #[token("]")]
    RightSquare,
    #[token("^")]
    Uparrow,
    #[token(".")]
    Period,
    #[token("..")]
    DotDot,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semicolon,

    /// Identifier (case-insensitive)
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Identifier,

    /// End of file
    Eof,
}

impl TokenKind {
    /// Binary operator precedence for the expression parser. Higher binds
    /// tighter; `None` means the token is not a binary operator.
    ///
    /// Pascal groups: relational (including `in`) bind loosest, then the
    /// adding operators, then the multiplying operators.
    pub fn precedence(&self) -> Option<u8> {
        use TokenKind::*;
        match self {
            Equal | NotEqual | LessThan | LessOrEqual | GreaterThan | GreaterOrEqual | In => {
                Some(10)
            }
            Plus | Minus | Or | Xor => Some(20),
            Star | Slash | Div | Mod | And | Shl | Shr => Some(40),
            _ => None,
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TokenKind::*;
        let s = match self {
            IntLiteral => "integer literal",
            RealLiteral => "real literal",
            StringLiteral => "string literal",
            CharLiteral => "character literal",
            Program => "program",
            Var => "var",
            Type => "type",
            Const => "const",
            Function => "function",
            Procedure => "procedure",
            Begin => "begin",
            End => "end",
            If => "if",
            Then => "then",
            Else => "else",
            For => "for",
            To => "to",
            Downto => "downto",
            Do => "do",
            While => "while",
            Repeat => "repeat",
            Until => "until",
            Case => "case",
            Of => "of",
            Otherwise => "otherwise",
            With => "with",
            Record => "record",
            Object => "object",
            Array => "array",
            File => "file",
            Set => "set",
            String => "string",
            Packed => "packed",
            Nil => "nil",
            Forward => "forward",
            Static => "static",
            Virtual => "virtual",
            Override => "override",
            Write => "write",
            Writeln => "writeln",
            Read => "read",
            Readln => "readln",
            SizeOf => "sizeof",
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Div => "div",
            Mod => "mod",
            And => "and",
            Or => "or",
            Xor => "xor",
            Not => "not",
            Shl => "shl",
            Shr => "shr",
            In => "in",
            Equal => "=",
            NotEqual => "<>",
            LessThan => "<",
            LessOrEqual => "<=",
            GreaterThan => ">",
            GreaterOrEqual => ">=",
            Assign => ":=",
            LeftParen => "(",
            RightParen => ")",
            LeftSquare => "[",
            RightSquare => "]",
            Uparrow => "^",
            Period => ".",
            DotDot => "..",
            Comma => ",",
            Colon => ":",
            Semicolon => ";",
            Identifier => "identifier",
            Eof => "end of file",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_ordering() {
        assert!(TokenKind::Star.precedence() > TokenKind::Plus.precedence());
        assert!(TokenKind::Plus.precedence() > TokenKind::Equal.precedence());
        assert_eq!(TokenKind::In.precedence(), TokenKind::Equal.precedence());
        assert_eq!(TokenKind::Assign.precedence(), None);
    }
}
