//! Parser and resolver for the Pascal dialect
//!
//! A single-pass recursive descent parser with one-token lookahead. It
//! builds the typed AST and resolves names against the scope stack as it
//! goes: identifiers are looked up at the point of use, field accesses
//! are turned into struct indices, `with` blocks inject their field
//! names, member functions gain their implicit receiver, and nested
//! routines are closure-converted at the close of their definition.
//!
//! On an error the offending production reports a diagnostic and
//! returns `Err`; the statement/declaration loops synchronize at the
//! next boundary so one mistake does not cascade.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::ast::*;
use crate::closure;
use crate::consteval::{self, ConstValue};
use crate::lexer::{decode_char, decode_string, Lexer};
use crate::names::{NameStack, NamedObject};
use crate::span::Span;
use crate::token::{Token, TokenKind};
use crate::types::{self, MemberFunc, TypeId, TypeKind, TypeStore};

/// Parser errors
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: TokenKind,
        span: Span,
    },

    #[error("{message}")]
    Custom { message: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            ParseError::UnexpectedToken { span, .. } => *span,
            ParseError::Custom { span, .. } => *span,
        }
    }
}

/// Parse result
pub type ParseResult<T> = Result<T, ParseError>;

/// The parser for the Pascal dialect
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token,
    errors: Vec<ParseError>,
    names: NameStack,
    types: TypeStore,
    /// Used-variable maps, one level per routine being parsed. Closure
    /// conversion consumes the top level when the routine closes.
    used: Vec<BTreeMap<String, TypeId>>,
}

impl<'src> Parser<'src> {
    /// Create a new parser with the predeclared names in scope
    pub fn new(source: &'src str) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer
            .next_token()
            .unwrap_or(Token::new(TokenKind::Eof, Span::new(source.len(), source.len())));

        let mut parser = Self {
            lexer,
            current,
            errors: Vec::new(),
            names: NameStack::new(),
            types: TypeStore::new(),
            used: vec![BTreeMap::new()],
        };
        parser.add_predeclared();
        parser
    }

    fn add_predeclared(&mut self) {
        let builtins = [
            ("integer", types::INTEGER),
            ("longint", types::INT64),
            ("real", types::REAL),
            ("char", types::CHAR),
            ("boolean", types::BOOL),
            ("text", types::TEXT),
        ];
        for (name, ty) in builtins {
            self.names.add(name, NamedObject::TypeDef { ty });
        }
        self.names
            .add("false", NamedObject::EnumDef { ty: types::BOOL, value: 0 });
        self.names
            .add("true", NamedObject::EnumDef { ty: types::BOOL, value: 1 });
        self.names.add(
            "pi",
            NamedObject::ConstDef { value: ConstValue::Real(std::f64::consts::PI) },
        );
    }

    /// Get the source code
    pub fn source(&self) -> &'src str {
        self.lexer.source()
    }

    /// Get parse errors
    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    /// Number of errors so far. Nonzero after parsing suppresses
    /// code emission.
    pub fn err_count(&self) -> usize {
        self.errors.len()
    }

    /// Take ownership of the type registry after parsing
    pub fn into_types(self) -> TypeStore {
        self.types
    }

    // ============ Token plumbing ============

    fn advance(&mut self) -> Token {
        let next = self.lexer.next_token().unwrap_or(Token::new(
            TokenKind::Eof,
            Span::new(self.source().len(), self.source().len()),
        ));
        std::mem::replace(&mut self.current, next)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn is_at_end(&self) -> bool {
        self.check(TokenKind::Eof)
    }

    fn expect(&mut self, kind: TokenKind) -> ParseResult<Token> {
        if self.check(kind.clone()) {
            Ok(self.advance())
        } else {
            Err(ParseError::UnexpectedToken {
                expected: format!("'{}'", kind),
                found: self.current.kind.clone(),
                span: self.current.span,
            })
        }
    }

    fn consume(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// A statement list separator: either `;` or the closing `end`
    fn expect_semicolon_or_end(&mut self) -> ParseResult<()> {
        if !self.check(TokenKind::End) && !self.check(TokenKind::Until) {
            self.expect(TokenKind::Semicolon)?;
        }
        Ok(())
    }

    fn text(&self, token: &Token) -> &'src str {
        token.text(self.source())
    }

    /// Identifier text, case-folded. Pascal identifiers are
    /// case-insensitive, so the environment only ever sees lower case.
    fn ident_text(&self, token: &Token) -> String {
        self.text(token).to_ascii_lowercase()
    }

    fn custom(&self, message: impl Into<String>, span: Span) -> ParseError {
        ParseError::Custom { message: message.into(), span }
    }

    fn note_use(&mut self, name: &str, ty: TypeId) {
        if let Some(top) = self.used.last_mut() {
            top.insert(name.to_string(), ty);
        }
    }

    // ============ Top-level parsing ============

    /// Parse a complete program
    pub fn parse_program(&mut self) -> Program {
        let start = self.current.span.start;
        let mut items = Vec::new();
        let mut name = String::new();

        if let Err(e) = self.parse_program_heading(&mut name) {
            self.errors.push(e);
            self.synchronize();
        }

        // `input` and `output` exist as globals before the program body.
        self.names.add("input", NamedObject::VarDef { ty: types::TEXT });
        self.names.add("output", NamedObject::VarDef { ty: types::TEXT });
        items.push(Item::Vars(vec![
            VarItem { name: "input".into(), ty: types::TEXT },
            VarItem { name: "output".into(), ty: types::TEXT },
        ]));

        while !self.is_at_end() {
            match self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                }
                TokenKind::Var => match self.parse_var_decls() {
                    Ok(vars) => items.push(Item::Vars(vars)),
                    Err(e) => {
                        self.errors.push(e);
                        self.synchronize();
                    }
                },
                TokenKind::Type => {
                    if let Err(e) = self.parse_type_block() {
                        self.errors.push(e);
                        self.synchronize();
                    }
                }
                TokenKind::Const => {
                    if let Err(e) = self.parse_const_block() {
                        self.errors.push(e);
                        self.synchronize();
                    }
                }
                TokenKind::Function | TokenKind::Procedure => match self.parse_definition() {
                    Ok(func) => items.push(Item::Function(func)),
                    Err(e) => {
                        self.errors.push(e);
                        self.synchronize();
                    }
                },
                TokenKind::Begin => {
                    match self.parse_main_block() {
                        Ok(func) => items.push(Item::Function(func)),
                        Err(e) => {
                            self.errors.push(e);
                            self.synchronize();
                        }
                    }
                    break;
                }
                _ => {
                    let e = ParseError::UnexpectedToken {
                        expected: "declaration or 'begin'".into(),
                        found: self.current.kind.clone(),
                        span: self.current.span,
                    };
                    self.errors.push(e);
                    self.synchronize();
                }
            }
        }

        let end = self.current.span.end;
        Program { name, items, span: Span::new(start, end) }
    }

    fn parse_program_heading(&mut self, name: &mut String) -> ParseResult<()> {
        self.expect(TokenKind::Program)?;
        let tok = self.expect(TokenKind::Identifier)?;
        *name = self.ident_text(&tok);
        // The file list, if present, is parsed and ignored.
        if self.consume(TokenKind::LeftParen) {
            while !self.check(TokenKind::RightParen) {
                self.expect(TokenKind::Identifier)?;
                if !self.check(TokenKind::RightParen) {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }
        self.expect(TokenKind::Semicolon)?;
        Ok(())
    }

    /// The program's main block becomes `__PascalMain`, called from the
    /// C driver.
    fn parse_main_block(&mut self) -> ParseResult<FunctionDecl> {
        let start = self.current.span;
        self.used.push(BTreeMap::new());
        let body = self.parse_block();
        self.used.pop();
        let body = body?;
        self.expect(TokenKind::Period)?;
        let proto = Prototype::new("__PascalMain", Vec::new(), types::VOID).shared();
        Ok(FunctionDecl {
            proto,
            vars: Vec::new(),
            body: Some(body),
            subs: Vec::new(),
            captured: Vec::new(),
            span: start,
        })
    }

    /// Synchronize after an error: skip to the next statement or
    /// declaration boundary.
    fn synchronize(&mut self) {
        while !self.is_at_end() {
            match self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Var
                | TokenKind::Type
                | TokenKind::Const
                | TokenKind::Function
                | TokenKind::Procedure
                | TokenKind::Begin
                | TokenKind::End => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // ============ Declarations ============

    fn add_type(&mut self, name: &str, ty: TypeId, span: Span) -> ParseResult<()> {
        if let TypeKind::Enum { values } = self.types.kind(ty).clone() {
            for v in values {
                if !self
                    .names
                    .add(v.name.clone(), NamedObject::EnumDef { ty, value: v.value })
                {
                    return Err(self.custom(
                        format!("enumerated value '{}' already exists", v.name),
                        span,
                    ));
                }
            }
        }
        if !self.names.add(name, NamedObject::TypeDef { ty }) {
            return Err(self.custom(format!("name '{}' is already in use", name), span));
        }
        Ok(())
    }

    fn get_type_decl(&self, name: &str) -> Option<TypeId> {
        match self.names.find(name) {
            Some(NamedObject::TypeDef { ty }) => Some(*ty),
            _ => None,
        }
    }

    /// `type name = ...;` block. Forward pointers collected while the
    /// block parses are resolved when it ends; missing pointees are
    /// errors.
    fn parse_type_block(&mut self) -> ParseResult<()> {
        self.expect(TokenKind::Type)?;
        while self.check(TokenKind::Identifier) {
            let tok = self.advance();
            let name = self.ident_text(&tok);
            self.expect(TokenKind::Equal)?;
            let ty = self.parse_type(&name)?;
            self.add_type(&name, ty, tok.span)?;
            self.expect(TokenKind::Semicolon)?;
        }

        let span = self.current.span;
        let names = &self.names;
        let unresolved = self.types.resolve_forward_pointers(|n| match names.find(n) {
            Some(NamedObject::TypeDef { ty }) => Some(*ty),
            _ => None,
        });
        for name in unresolved {
            self.errors.push(self.custom(
                format!("forward declared pointer type not declared: {}", name),
                span,
            ));
        }
        if let Err(e) = self.types.complete_pending() {
            return Err(self.custom(e.to_string(), span));
        }
        Ok(())
    }

    fn parse_const_block(&mut self) -> ParseResult<()> {
        self.expect(TokenKind::Const)?;
        while self.check(TokenKind::Identifier) {
            let tok = self.advance();
            let name = self.ident_text(&tok);
            self.expect(TokenKind::Equal)?;
            let value = self.parse_const_expr()?;
            if !self.names.add(name.clone(), NamedObject::ConstDef { value }) {
                return Err(self.custom(
                    format!("name '{}' is already declared as a constant", name),
                    tok.span,
                ));
            }
            self.expect(TokenKind::Semicolon)?;
        }
        Ok(())
    }

    fn parse_var_decls(&mut self) -> ParseResult<Vec<VarItem>> {
        self.expect(TokenKind::Var)?;
        let mut vars = Vec::new();
        let mut group: Vec<(String, Span)> = Vec::new();
        while self.check(TokenKind::Identifier) {
            let tok = self.advance();
            group.push((self.ident_text(&tok), tok.span));
            if self.consume(TokenKind::Colon) {
                let ty = self.parse_type("")?;
                for (name, span) in group.drain(..) {
                    if !self.names.add(name.clone(), NamedObject::VarDef { ty }) {
                        self.errors
                            .push(self.custom(format!("name '{}' is already defined", name), span));
                    }
                    vars.push(VarItem { name, ty });
                }
                self.expect(TokenKind::Semicolon)?;
            } else {
                self.expect(TokenKind::Comma)?;
            }
        }
        Ok(vars)
    }

    // ============ Constant expressions ============

    fn parse_const_expr(&mut self) -> ParseResult<ConstValue> {
        let lhs = self.parse_const_primary()?;
        self.parse_const_rhs(0, lhs)
    }

    fn parse_const_rhs(&mut self, prec: u8, mut lhs: ConstValue) -> ParseResult<ConstValue> {
        loop {
            let tok_prec = match self.current.kind.precedence() {
                Some(p) if p >= prec => p,
                _ => return Ok(lhs),
            };
            let op = self.advance();
            let mut rhs = self.parse_const_primary()?;
            if let Some(next_prec) = self.current.kind.precedence() {
                if tok_prec < next_prec {
                    rhs = self.parse_const_rhs(tok_prec + 1, rhs)?;
                }
            }
            lhs = consteval::binary(op.kind.clone(), lhs, rhs)
                .map_err(|e| self.custom(e.to_string(), op.span))?;
        }
    }

    fn parse_const_primary(&mut self) -> ParseResult<ConstValue> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::Minus | TokenKind::Plus | TokenKind::Not => {
                let op = self.advance();
                let v = self.parse_const_primary()?;
                consteval::unary(op.kind, v).map_err(|e| self.custom(e.to_string(), span))
            }
            TokenKind::LeftParen => {
                self.advance();
                let v = self.parse_const_expr()?;
                self.expect(TokenKind::RightParen)?;
                Ok(v)
            }
            TokenKind::IntLiteral => {
                let tok = self.advance();
                let v = self.text(&tok).parse::<i64>().map_err(|_| {
                    self.custom("integer literal out of range", span)
                })?;
                Ok(ConstValue::Int(v))
            }
            TokenKind::RealLiteral => {
                let tok = self.advance();
                let v = self
                    .text(&tok)
                    .parse::<f64>()
                    .map_err(|_| self.custom("malformed real literal", span))?;
                Ok(ConstValue::Real(v))
            }
            TokenKind::CharLiteral => {
                let tok = self.advance();
                Ok(ConstValue::Char(decode_char(self.text(&tok))))
            }
            TokenKind::StringLiteral => {
                let tok = self.advance();
                Ok(ConstValue::Str(decode_string(self.text(&tok))))
            }
            TokenKind::Identifier => {
                let tok = self.advance();
                let name = self.ident_text(&tok);
                match self.names.find(&name) {
                    Some(NamedObject::EnumDef { ty, value }) => {
                        if *ty == types::BOOL {
                            Ok(ConstValue::Bool(*value != 0))
                        } else {
                            Ok(ConstValue::Enum { value: *value, ty: *ty })
                        }
                    }
                    Some(NamedObject::ConstDef { value }) => Ok(value.clone()),
                    _ => Err(self.custom(
                        format!("'{}' does not name a constant", name),
                        tok.span,
                    )),
                }
            }
            other => Err(ParseError::UnexpectedToken {
                expected: "constant".into(),
                found: other,
                span,
            }),
        }
    }

    /// A single ordinal constant: integer, char, or an identifier naming
    /// an enum value or declared ordinal constant. `expected` enforces
    /// that all constants in one construct share a kind.
    fn parse_constant_value(
        &mut self,
        expected: &mut Option<TokenKind>,
    ) -> ParseResult<(i64, TypeId)> {
        let span = self.current.span;
        // Negative bounds: `-10..10`.
        let negate = self.consume(TokenKind::Minus);
        let (kind_seen, mut value, ty) = match self.current.kind.clone() {
            TokenKind::IntLiteral => {
                let tok = self.advance();
                let v = self
                    .text(&tok)
                    .parse::<i64>()
                    .map_err(|_| self.custom("integer literal out of range", span))?;
                (TokenKind::IntLiteral, v, types::INTEGER)
            }
            TokenKind::CharLiteral => {
                let tok = self.advance();
                (TokenKind::CharLiteral, decode_char(self.text(&tok)) as i64, types::CHAR)
            }
            TokenKind::Identifier => {
                let tok = self.advance();
                let name = self.ident_text(&tok);
                match self.names.find(&name) {
                    Some(NamedObject::EnumDef { ty, value }) => {
                        (TokenKind::Identifier, *value, *ty)
                    }
                    Some(NamedObject::ConstDef { value: ConstValue::Int(v) }) => {
                        (TokenKind::IntLiteral, *v, types::INTEGER)
                    }
                    Some(NamedObject::ConstDef { value: ConstValue::Char(c) }) => {
                        (TokenKind::CharLiteral, *c as i64, types::CHAR)
                    }
                    _ => {
                        return Err(self.custom(
                            format!("invalid constant, '{}' is not an ordinal value", name),
                            tok.span,
                        ))
                    }
                }
            }
            other => {
                return Err(ParseError::UnexpectedToken {
                    expected: "char, integer or enum value".into(),
                    found: other,
                    span,
                })
            }
        };

        if negate {
            if ty != types::INTEGER {
                return Err(self.custom("only integer constants can be negated here", span));
            }
            value = -value;
        }

        match expected {
            Some(k) if *k != kind_seen => {
                Err(self.custom("constant kind must not change within this construct", span))
            }
            _ => {
                *expected = Some(kind_seen);
                Ok((value, ty))
            }
        }
    }

    // ============ Types ============

    fn parse_simple_type(&mut self) -> ParseResult<TypeId> {
        let span = self.current.span;
        let tok = self.expect(TokenKind::Identifier)?;
        let name = self.ident_text(&tok);
        self.get_type_decl(&name)
            .ok_or_else(|| self.custom(format!("'{}' does not name a type", name), span))
    }

    fn parse_range(&mut self) -> ParseResult<TypeId> {
        let span = self.current.span;
        let mut expected = None;
        let (low, ty) = self.parse_constant_value(&mut expected)?;
        self.expect(TokenKind::DotDot)?;
        let (high, _) = self.parse_constant_value(&mut expected)?;
        self.types
            .subrange(ty, low, high)
            .map_err(|e| self.custom(e.to_string(), span))
    }

    /// A range, or a type name whose whole ordinal interval serves as
    /// the range (`array[boolean]`, `set of char`).
    fn parse_range_or_type_range(&mut self) -> ParseResult<TypeId> {
        if self.check(TokenKind::Identifier) {
            let name = self.ident_text(&self.current.clone());
            if let Some(ty) = self.get_type_decl(&name) {
                let span = self.current.span;
                if !self.types.is_integral(ty) {
                    return Err(
                        self.custom("index type must be an integral type", span)
                    );
                }
                self.advance();
                let (low, high) = self
                    .types
                    .range_bounds(ty)
                    .ok_or_else(|| self.custom("type has no ordinal range", span))?;
                return self
                    .types
                    .subrange(ty, low, high)
                    .map_err(|e| self.custom(e.to_string(), span));
            }
        }
        self.parse_range()
    }

    /// Dispatch on the leading token of a type denoter
    fn parse_type(&mut self, name: &str) -> ParseResult<TypeId> {
        if self.check(TokenKind::Packed) {
            // Accepted for compatibility; has no layout effect.
            self.advance();
            if !self.check(TokenKind::Array) && !self.check(TokenKind::Record) {
                return Err(self.custom(
                    "expected 'array' or 'record' after 'packed'",
                    self.current.span,
                ));
            }
        }

        match self.current.kind.clone() {
            TokenKind::Identifier => {
                let ident = self.ident_text(&self.current.clone());
                // A plain type name, unless the identifier starts a
                // subrange of enum constants.
                if self.get_type_decl(&ident).is_some() {
                    self.parse_simple_type()
                } else {
                    self.parse_range()
                }
            }
            TokenKind::IntLiteral | TokenKind::CharLiteral | TokenKind::Minus => {
                self.parse_range()
            }
            TokenKind::Array => self.parse_array_decl(),
            TokenKind::Record => self.parse_record_decl(),
            TokenKind::Object => self.parse_object_decl(name),
            TokenKind::File => self.parse_file_decl(),
            TokenKind::Set => self.parse_set_decl(),
            TokenKind::LeftParen => self.parse_enum_def(),
            TokenKind::Uparrow => self.parse_pointer_type(),
            TokenKind::String => self.parse_string_decl(),
            other => Err(ParseError::UnexpectedToken {
                expected: "type".into(),
                found: other,
                span: self.current.span,
            }),
        }
    }

    fn parse_enum_def(&mut self) -> ParseResult<TypeId> {
        self.expect(TokenKind::LeftParen)?;
        let mut values = Vec::new();
        while !self.check(TokenKind::RightParen) {
            let tok = self.expect(TokenKind::Identifier)?;
            values.push(self.ident_text(&tok));
            if !self.check(TokenKind::RightParen) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok(self.types.enum_decl(values))
    }

    /// `^Ident` or `^type`. An unknown identifier is a forward
    /// declaration, recorded for fixup at the end of the type block.
    fn parse_pointer_type(&mut self) -> ParseResult<TypeId> {
        self.expect(TokenKind::Uparrow)?;
        if self.check(TokenKind::Identifier) {
            let tok = self.advance();
            let name = self.ident_text(&tok);
            if let Some(ty) = self.get_type_decl(&name) {
                return Ok(self.types.pointer_to(ty));
            }
            return Ok(self.types.pointer_forward(name));
        }
        let inner = self.parse_type("")?;
        Ok(self.types.pointer_to(inner))
    }

    fn parse_array_decl(&mut self) -> ParseResult<TypeId> {
        self.expect(TokenKind::Array)?;
        self.expect(TokenKind::LeftSquare)?;
        let mut dims = Vec::new();
        while !self.check(TokenKind::RightSquare) {
            dims.push(self.parse_range_or_type_range()?);
            if !self.check(TokenKind::RightSquare) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RightSquare)?;
        self.expect(TokenKind::Of)?;
        if dims.is_empty() {
            return Err(self.custom("array needs at least one index range", self.current.span));
        }
        let elem = self.parse_type("")?;
        Ok(self.types.array(elem, dims))
    }

    fn parse_file_decl(&mut self) -> ParseResult<TypeId> {
        self.expect(TokenKind::File)?;
        self.expect(TokenKind::Of)?;
        let elem = self.parse_type("")?;
        Ok(self.types.file_of(elem, false))
    }

    fn parse_set_decl(&mut self) -> ParseResult<TypeId> {
        let span = self.current.span;
        self.expect(TokenKind::Set)?;
        self.expect(TokenKind::Of)?;
        let range = self.parse_range_or_type_range()?;
        self.types
            .set_of(range)
            .map_err(|e| self.custom(e.to_string(), span))
    }

    fn parse_string_decl(&mut self) -> ParseResult<TypeId> {
        self.expect(TokenKind::String)?;
        let mut capacity: u32 = 255;
        if self.consume(TokenKind::LeftSquare) {
            let mut expected = Some(TokenKind::IntLiteral);
            let (size, _) = self.parse_constant_value(&mut expected)?;
            if !(1..=255).contains(&size) {
                return Err(self.custom("string capacity must be 1..255", self.current.span));
            }
            capacity = size as u32;
            self.expect(TokenKind::RightSquare)?;
        }
        Ok(self.types.string(capacity))
    }

    fn parse_record_decl(&mut self) -> ParseResult<TypeId> {
        let span = self.current.span;
        self.expect(TokenKind::Record)?;
        let (fields, variant, _) = self.parse_fields(false)?;
        if fields.is_empty() && variant.is_none() {
            return Err(self.custom("no elements in record declaration", span));
        }
        Ok(self.types.record(fields, variant))
    }

    fn parse_object_decl(&mut self, name: &str) -> ParseResult<TypeId> {
        let span = self.current.span;
        self.expect(TokenKind::Object)?;
        let mut base = None;
        if self.consume(TokenKind::LeftParen) {
            let tok = self.expect(TokenKind::Identifier)?;
            let base_name = self.ident_text(&tok);
            match self.get_type_decl(&base_name) {
                Some(ty) if matches!(self.types.kind(ty), TypeKind::Object { .. }) => {
                    base = Some(ty);
                }
                _ => return Err(self.custom("expected object as base", tok.span)),
            }
            self.expect(TokenKind::RightParen)?;
        }

        let (fields, variant, methods) = self.parse_fields(true)?;
        self.types
            .object(name, fields, methods, variant, base)
            .map_err(|e| self.custom(e.to_string(), span))
    }

    /// Field groups, optional variant part, and (for objects) method
    /// declarations, up to and including `end`.
    #[allow(clippy::type_complexity)]
    fn parse_fields(
        &mut self,
        is_object: bool,
    ) -> ParseResult<(Vec<types::Field>, Option<TypeId>, Vec<MemberFunc>)> {
        let mut fields: Vec<types::Field> = Vec::new();
        let mut methods = Vec::new();
        let mut variant = None;

        while !self.check(TokenKind::End) {
            if self.check(TokenKind::Case) {
                self.advance();
                // Optional named tag: `case tag: type of`
                let mut marker = None;
                if self.check(TokenKind::Identifier) {
                    let name = self.ident_text(&self.current.clone());
                    if self.get_type_decl(&name).is_none() {
                        self.advance();
                        self.expect(TokenKind::Colon)?;
                        marker = Some(name);
                    }
                }
                let span = self.current.span;
                let marker_ty = self.parse_type("")?;
                if !self.types.is_integral(marker_ty) {
                    return Err(self.custom("variant selector must be an integral type", span));
                }
                if let Some(name) = marker {
                    fields.push(types::Field::new(name, marker_ty));
                }
                self.expect(TokenKind::Of)?;
                let (v, tag_ty) = self.parse_variant_decl()?;
                if self.types.compatible(marker_ty, tag_ty).is_none() {
                    return Err(
                        self.custom("variant tag kind does not match the selector type", span)
                    );
                }
                variant = Some(v);
            } else if is_object
                && (self.check(TokenKind::Function) || self.check(TokenKind::Procedure))
            {
                let proto = self.parse_prototype()?;
                let mut is_static = false;
                let mut is_virtual = false;
                let mut is_override = false;
                loop {
                    if self.check(TokenKind::Static) {
                        self.advance();
                        self.expect(TokenKind::Semicolon)?;
                        is_static = true;
                    } else if self.check(TokenKind::Virtual) {
                        self.advance();
                        self.expect(TokenKind::Semicolon)?;
                        is_virtual = true;
                    } else if self.check(TokenKind::Override) {
                        self.advance();
                        self.expect(TokenKind::Semicolon)?;
                        is_override = true;
                    } else {
                        break;
                    }
                }
                methods.push(MemberFunc {
                    proto,
                    is_static,
                    is_virtual,
                    is_override,
                    virt_index: None,
                    mangled: String::new(),
                });
            } else {
                let mut group: Vec<(String, Span)> = Vec::new();
                loop {
                    let tok = self.expect(TokenKind::Identifier)?;
                    group.push((self.ident_text(&tok), tok.span));
                    if self.check(TokenKind::Colon) {
                        break;
                    }
                    self.expect(TokenKind::Comma)?;
                }
                self.expect(TokenKind::Colon)?;
                let ty = self.parse_type("")?;
                for (name, span) in group {
                    if fields.iter().any(|f| f.name == name) {
                        return Err(self.custom(
                            format!("duplicate field name '{}' in record", name),
                            span,
                        ));
                    }
                    fields.push(types::Field::new(name, ty));
                }
                self.expect_semicolon_or_end()?;
            }
        }
        self.expect(TokenKind::End)?;
        Ok((fields, variant, methods))
    }

    /// The arms of a variant part, after `case ... of`
    fn parse_variant_decl(&mut self) -> ParseResult<(TypeId, TypeId)> {
        let mut seen: Vec<i64> = Vec::new();
        let mut arms: Vec<types::Field> = Vec::new();
        let mut expected = None;
        let mut tag_ty = types::INTEGER;

        loop {
            // Tag value list for this arm.
            loop {
                let span = self.current.span;
                let (v, ty) = self.parse_constant_value(&mut expected)?;
                tag_ty = ty;
                if seen.contains(&v) {
                    return Err(self.custom(
                        format!("value {} already used in variant declaration", v),
                        span,
                    ));
                }
                seen.push(v);
                if self.check(TokenKind::Colon) {
                    break;
                }
                self.expect(TokenKind::Comma)?;
            }
            self.expect(TokenKind::Colon)?;
            self.expect(TokenKind::LeftParen)?;

            let mut arm_fields: Vec<types::Field> = Vec::new();
            while !self.check(TokenKind::RightParen) {
                let mut group: Vec<(String, Span)> = Vec::new();
                loop {
                    let tok = self.expect(TokenKind::Identifier)?;
                    group.push((self.ident_text(&tok), tok.span));
                    if self.check(TokenKind::Colon) {
                        break;
                    }
                    self.expect(TokenKind::Comma)?;
                }
                self.expect(TokenKind::Colon)?;
                let ty = self.parse_type("")?;
                for (name, span) in group {
                    if arm_fields.iter().any(|f| f.name == name) {
                        return Err(self.custom(
                            format!("duplicate field name '{}' in variant", name),
                            span,
                        ));
                    }
                    arm_fields.push(types::Field::new(name, ty));
                }
                if !self.check(TokenKind::RightParen) {
                    self.expect(TokenKind::Semicolon)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
            self.expect_semicolon_or_end()?;

            // One field stands alone; several share an anonymous record.
            match arm_fields.len() {
                0 => {}
                1 => arms.push(arm_fields.into_iter().next().expect("one field")),
                _ => {
                    let rec = self.types.record(arm_fields, None);
                    arms.push(types::Field::new("", rec));
                }
            }

            if self.check(TokenKind::End) {
                break;
            }
        }

        if arms.is_empty() {
            return Err(self.custom("variant part has no arms", self.current.span));
        }
        let v = self.types.variant(arms);
        Ok((v, tag_ty))
    }

    // ============ Prototypes and definitions ============

    /// `function name(args): type;` / `procedure name(args);`, including
    /// member-function headers `procedure Obj.method(...);`
    fn parse_prototype(&mut self) -> ParseResult<ProtoRef> {
        let is_function = self.check(TokenKind::Function);
        self.advance();

        let tok = self.expect(TokenKind::Identifier)?;
        let mut func_name = self.ident_text(&tok);
        let mut member: Option<(TypeId, MemberFunc)> = None;

        if self.check(TokenKind::Period) {
            self.advance();
            let obj_ty = match self.get_type_decl(&func_name) {
                Some(ty) if matches!(self.types.kind(ty), TypeKind::Object { .. }) => ty,
                _ => {
                    return Err(self.custom("expected object name", tok.span));
                }
            };
            let mtok = self.expect(TokenKind::Identifier)?;
            let mname = self.ident_text(&mtok);
            let mf = self.types.member_func(obj_ty, &mname).ok_or_else(|| {
                self.custom(
                    format!("member function '{}' not found in '{}'", mname, func_name),
                    mtok.span,
                )
            })?;
            func_name = format!("{}${}", func_name, mname);
            member = Some((obj_ty, mf));
        }

        let mut params: Vec<Param> = Vec::new();
        if self.consume(TokenKind::LeftParen) {
            let mut group: Vec<String> = Vec::new();
            let mut by_ref = false;
            while !self.check(TokenKind::RightParen) {
                if self.check(TokenKind::Function) || self.check(TokenKind::Procedure) {
                    // A routine-valued parameter.
                    let sub = self.parse_prototype_header()?;
                    let name = sub.borrow().name.clone();
                    let ty = self.types.func_ptr(sub);
                    params.push(Param::new(name, ty, false));
                    if !self.check(TokenKind::RightParen) {
                        self.expect(TokenKind::Semicolon)?;
                    }
                    continue;
                }
                if self.check(TokenKind::Var) {
                    self.advance();
                    by_ref = true;
                }
                let tok = self.expect(TokenKind::Identifier)?;
                group.push(self.ident_text(&tok));
                if self.consume(TokenKind::Colon) {
                    let ty = self.parse_type("")?;
                    for name in group.drain(..) {
                        params.push(Param::new(name, ty, by_ref));
                    }
                    by_ref = false;
                    if !self.check(TokenKind::RightParen) {
                        self.expect(TokenKind::Semicolon)?;
                    }
                } else {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }

        let result = if is_function {
            self.expect(TokenKind::Colon)?;
            self.parse_simple_type()?
        } else {
            types::VOID
        };

        self.expect(TokenKind::Semicolon)?;

        let proto = Prototype::new(func_name, params, result).shared();
        if let Some((obj_ty, mf)) = member {
            if !mf.is_static {
                let mut p = proto.borrow_mut();
                p.params.insert(0, Param::self_param(obj_ty));
                p.has_self = true;
                p.base_object = Some(obj_ty);
            }
        }
        Ok(proto)
    }

    /// A prototype without the trailing semicolon, used for
    /// routine-valued parameters inside an argument list.
    fn parse_prototype_header(&mut self) -> ParseResult<ProtoRef> {
        let is_function = self.check(TokenKind::Function);
        self.advance();
        let tok = self.expect(TokenKind::Identifier)?;
        let name = self.ident_text(&tok);

        let mut params = Vec::new();
        if self.consume(TokenKind::LeftParen) {
            let mut group: Vec<String> = Vec::new();
            let mut by_ref = false;
            while !self.check(TokenKind::RightParen) {
                if self.check(TokenKind::Var) {
                    self.advance();
                    by_ref = true;
                }
                let tok = self.expect(TokenKind::Identifier)?;
                group.push(self.ident_text(&tok));
                if self.consume(TokenKind::Colon) {
                    let ty = self.parse_type("")?;
                    for n in group.drain(..) {
                        params.push(Param::new(n, ty, by_ref));
                    }
                    by_ref = false;
                    if !self.check(TokenKind::RightParen) {
                        self.expect(TokenKind::Semicolon)?;
                    }
                } else {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }

        let result = if is_function {
            self.expect(TokenKind::Colon)?;
            self.parse_simple_type()?
        } else {
            types::VOID
        };

        Ok(Prototype::new(name, params, result).shared())
    }

    /// A routine definition: prototype, declarations, nested routines,
    /// body. Closure conversion runs when the body closes.
    fn parse_definition(&mut self) -> ParseResult<FunctionDecl> {
        let start = self.current.span;
        let mut proto = self.parse_prototype()?;
        let name = proto.borrow().name.clone();

        // A definition completing an earlier `forward` declaration
        // reuses the recorded prototype, so existing call sites keep
        // pointing at the right one.
        let mut predeclared = false;
        if let Some(NamedObject::FuncDef { proto: fwd, .. }) = self.names.find(&name).cloned() {
            if fwd.borrow().is_forward {
                let params_match =
                    fwd.borrow().params.len() == proto.borrow().params.len();
                if !params_match {
                    return Err(self.custom(
                        format!("definition of '{}' does not match its forward declaration", name),
                        start,
                    ));
                }
                fwd.borrow_mut().is_forward = false;
                proto = fwd;
                predeclared = true;
            }
        }

        if !predeclared {
            let fn_ty = self.types.function(proto.clone());
            if !self
                .names
                .add(name.clone(), NamedObject::FuncDef { ty: fn_ty, proto: proto.clone() })
            {
                return Err(self.custom(format!("name '{}' already exists", name), start));
            }
        }

        if self.check(TokenKind::Forward) {
            self.advance();
            self.expect(TokenKind::Semicolon)?;
            proto.borrow_mut().is_forward = true;
            return Ok(FunctionDecl {
                proto,
                vars: Vec::new(),
                body: None,
                subs: Vec::new(),
                captured: Vec::new(),
                span: start,
            });
        }

        let fn_scope = self.names.depth();
        self.names.push_scope();
        self.used.push(BTreeMap::new());
        let result = self.parse_definition_inner(&proto, fn_scope, start);
        self.used.pop();
        self.names.pop_scope();
        result
    }

    fn parse_definition_inner(
        &mut self,
        proto: &ProtoRef,
        fn_scope: usize,
        start: Span,
    ) -> ParseResult<FunctionDecl> {
        for p in proto.borrow().params.clone() {
            if !self.names.add(p.name.clone(), NamedObject::VarDef { ty: p.ty }) {
                return Err(self.custom(format!("duplicate name '{}'", p.name), start));
            }
        }
        // Inside `function Obj.m`, the result pseudo-variable goes by
        // the short method name.
        let full_name = proto.borrow().name.clone();
        if let Some(pos) = full_name.find('$') {
            let short = full_name[pos + 1..].to_string();
            let fn_ty = self.types.function(proto.clone());
            self.names
                .add(short, NamedObject::FuncDef { ty: fn_ty, proto: proto.clone() });
        }
        // Inside a member function, the receiver's fields resolve
        // unqualified, exactly like a `with self` block.
        let (has_self, base_object) = {
            let p = proto.borrow();
            (p.has_self, p.base_object)
        };
        if has_self {
            if let Some(obj) = base_object {
                let self_var =
                    Expr::new(ExprKind::Variable { name: "self".into() }, start, obj);
                self.expand_with_names(obj, &self_var);
            }
        }

        let mut vars: Vec<VarItem> = Vec::new();
        let mut subs: Vec<FunctionDecl> = Vec::new();
        let mut seen_vars = false;
        let mut seen_types = false;
        let mut seen_consts = false;

        loop {
            match self.current.kind {
                TokenKind::Var => {
                    if seen_vars {
                        return Err(
                            self.custom("cannot declare variables multiple times", self.current.span)
                        );
                    }
                    vars = self.parse_var_decls()?;
                    seen_vars = true;
                }
                TokenKind::Type => {
                    if seen_types {
                        return Err(
                            self.custom("cannot declare types multiple times", self.current.span)
                        );
                    }
                    self.parse_type_block()?;
                    seen_types = true;
                }
                TokenKind::Const => {
                    if seen_consts {
                        return Err(
                            self.custom("cannot declare constants multiple times", self.current.span)
                        );
                    }
                    self.parse_const_block()?;
                    seen_consts = true;
                }
                TokenKind::Function | TokenKind::Procedure => {
                    subs.push(self.parse_definition()?);
                }
                TokenKind::Begin => {
                    let body = self.parse_block()?;
                    self.expect(TokenKind::Semicolon)?;

                    let used = self.used.last().cloned().unwrap_or_default();
                    let captured =
                        closure::compute_captures(&used, &subs, &self.names, fn_scope);
                    let mut func = FunctionDecl {
                        proto: proto.clone(),
                        vars,
                        body: Some(body),
                        subs,
                        captured: Vec::new(),
                        span: start,
                    };
                    closure::convert(&mut func, captured);
                    return Ok(func);
                }
                _ => {
                    return Err(ParseError::UnexpectedToken {
                        expected: "declaration or 'begin'".into(),
                        found: self.current.kind.clone(),
                        span: self.current.span,
                    });
                }
            }
        }
    }

    // ============ Statements ============

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(TokenKind::Begin)?;
        let mut stmts = Vec::new();
        while !self.check(TokenKind::End) {
            if self.is_at_end() {
                return Err(self.custom("unexpected end of file in block", self.current.span));
            }
            // Recover at statement boundaries: one bad statement does
            // not abandon the rest of the block.
            match self.parse_statement() {
                Ok(stmt) => {
                    stmts.push(stmt);
                    if let Err(e) = self.expect_semicolon_or_end() {
                        self.errors.push(e);
                        self.synchronize_stmt();
                    }
                }
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize_stmt();
                }
            }
        }
        self.expect(TokenKind::End)?;
        Ok(stmts)
    }

    /// Skip to the next statement boundary inside a block
    fn synchronize_stmt(&mut self) {
        while !self.is_at_end() {
            match self.current.kind {
                TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::End | TokenKind::Until => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn parse_block_stmt(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        let stmts = self.parse_block()?;
        Ok(Stmt::new(StmtKind::Block(stmts), span))
    }

    fn parse_stmt_or_block(&mut self) -> ParseResult<Stmt> {
        match self.current.kind {
            TokenKind::Begin => self.parse_block_stmt(),
            TokenKind::Semicolon | TokenKind::End => {
                Ok(Stmt::new(StmtKind::Empty, self.current.span))
            }
            _ => self.parse_statement(),
        }
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        match self.current.kind {
            TokenKind::Begin => self.parse_block_stmt(),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::While => self.parse_while(),
            TokenKind::Repeat => self.parse_repeat(),
            TokenKind::Case => self.parse_case(),
            TokenKind::With => self.parse_with(),
            TokenKind::Write | TokenKind::Writeln => self.parse_write(),
            TokenKind::Read | TokenKind::Readln => self.parse_read(),
            TokenKind::Semicolon | TokenKind::End => Ok(Stmt::new(StmtKind::Empty, span)),
            _ => {
                let expr = self.parse_primary()?;
                if self.check(TokenKind::Assign) {
                    let assign_span = self.current.span;
                    self.advance();
                    let rhs = self.parse_expression()?;
                    if !expr.is_addressable() {
                        return Err(self.custom(
                            "left hand side of assignment must be a variable",
                            assign_span,
                        ));
                    }
                    if self.types.assignable(expr.ty, rhs.ty).is_none() {
                        return Err(self.custom(
                            format!(
                                "cannot assign {} to {}",
                                self.types.describe(rhs.ty),
                                self.types.describe(expr.ty)
                            ),
                            assign_span,
                        ));
                    }
                    return Ok(Stmt::new(StmtKind::Assign { lhs: expr, rhs }, span));
                }
                Ok(Stmt::new(StmtKind::Expr(expr), span))
            }
        }
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::If)?;
        let cond = self.parse_expression()?;
        if !self.types.same_as(cond.ty, types::BOOL) {
            return Err(self.custom("if condition must be a boolean expression", cond.span));
        }
        self.expect(TokenKind::Then)?;
        let then = if self.check(TokenKind::Else) {
            Stmt::new(StmtKind::Empty, self.current.span)
        } else {
            self.parse_stmt_or_block()?
        };
        let els = if self.consume(TokenKind::Else) {
            Some(Box::new(self.parse_stmt_or_block()?))
        } else {
            None
        };
        Ok(Stmt::new(StmtKind::If { cond, then: Box::new(then), els }, span))
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::For)?;
        let tok = self.expect(TokenKind::Identifier)?;
        let var = self.ident_text(&tok);
        let var_ty = match self.names.find(&var) {
            Some(NamedObject::VarDef { ty }) => *ty,
            _ => {
                return Err(
                    self.custom(format!("loop variable '{}' is not declared", var), tok.span)
                )
            }
        };
        if !self.types.is_integral(var_ty) {
            return Err(self.custom("loop variable must have an integral type", tok.span));
        }
        self.note_use(&var, var_ty);

        self.expect(TokenKind::Assign)?;
        let start = self.parse_expression()?;
        let down = match self.current.kind {
            TokenKind::To => false,
            TokenKind::Downto => true,
            _ => {
                return Err(ParseError::UnexpectedToken {
                    expected: "'to' or 'downto'".into(),
                    found: self.current.kind.clone(),
                    span: self.current.span,
                })
            }
        };
        self.advance();
        let end = self.parse_expression()?;
        if self.types.compatible(var_ty, start.ty).is_none()
            || self.types.compatible(var_ty, end.ty).is_none()
        {
            return Err(self.custom("for bounds must match the loop variable's type", span));
        }
        self.expect(TokenKind::Do)?;
        let body = self.parse_stmt_or_block()?;
        Ok(Stmt::new(
            StmtKind::For { var, start, end, down, body: Box::new(body) },
            span,
        ))
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::While)?;
        let cond = self.parse_expression()?;
        if !self.types.same_as(cond.ty, types::BOOL) {
            return Err(self.custom("while condition must be a boolean expression", cond.span));
        }
        self.expect(TokenKind::Do)?;
        let body = self.parse_stmt_or_block()?;
        Ok(Stmt::new(StmtKind::While { cond, body: Box::new(body) }, span))
    }

    fn parse_repeat(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::Repeat)?;
        let mut body = Vec::new();
        while !self.check(TokenKind::Until) {
            if self.is_at_end() {
                return Err(self.custom("unexpected end of file in repeat", self.current.span));
            }
            body.push(self.parse_statement()?);
            if self.check(TokenKind::Semicolon) {
                self.advance();
            }
        }
        self.expect(TokenKind::Until)?;
        let cond = self.parse_expression()?;
        if !self.types.same_as(cond.ty, types::BOOL) {
            return Err(self.custom("until condition must be a boolean expression", cond.span));
        }
        Ok(Stmt::new(StmtKind::Repeat { body, cond }, span))
    }

    fn parse_case_label(&mut self) -> ParseResult<i64> {
        let span = self.current.span;
        let mut expected = None;
        let (v, _) = self.parse_constant_value(&mut expected).map_err(|_| {
            self.custom("syntax error, expected case label", span)
        })?;
        Ok(v)
    }

    fn parse_case(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::Case)?;
        let selector = self.parse_expression()?;
        if !self.types.is_integral(selector.ty) {
            return Err(self.custom("case selection must be an integral type", selector.span));
        }
        self.expect(TokenKind::Of)?;

        let mut arms: Vec<CaseArm> = Vec::new();
        let mut otherwise: Option<Box<Stmt>> = None;
        let mut seen: Vec<i64> = Vec::new();

        while !self.check(TokenKind::End) {
            if self.is_at_end() {
                return Err(self.custom("unexpected end of file in case", self.current.span));
            }
            if self.check(TokenKind::Otherwise) {
                let ospan = self.advance().span;
                if otherwise.is_some() {
                    return Err(self.custom("otherwise already used in this case block", ospan));
                }
                self.consume(TokenKind::Colon);
                let body = self.parse_stmt_or_block()?;
                otherwise = Some(Box::new(body));
                self.expect_semicolon_or_end()?;
                continue;
            }

            let arm_span = self.current.span;
            let mut labels = Vec::new();
            loop {
                let v = self.parse_case_label()?;
                if seen.contains(&v) {
                    return Err(
                        self.custom(format!("case label {} already used", v), arm_span)
                    );
                }
                seen.push(v);
                labels.push(v);
                if self.check(TokenKind::Colon) {
                    break;
                }
                self.expect(TokenKind::Comma)?;
            }
            self.expect(TokenKind::Colon)?;
            let body = self.parse_stmt_or_block()?;
            arms.push(CaseArm { labels, body, span: arm_span });
            self.expect_semicolon_or_end()?;
        }
        self.expect(TokenKind::End)?;
        Ok(Stmt::new(StmtKind::Case { selector, arms, otherwise }, span))
    }

    /// Inject a container's field names into the innermost scope, bound
    /// to prebuilt access expressions rooted at `subject`. Anonymous
    /// variant-arm records are descended into.
    fn expand_with_names(&mut self, container: TypeId, subject: &Expr) {
        let entries: Vec<(String, Expr)> = match self.types.kind(container).clone() {
            TypeKind::Record { fields, variant } => {
                let mut out = Vec::new();
                for (i, f) in fields.iter().enumerate() {
                    let access = Expr::new(
                        ExprKind::Field { base: Box::new(subject.clone()), index: i as u32 },
                        subject.span,
                        f.ty,
                    );
                    out.push((f.name.clone(), access));
                }
                if let Some(v) = variant {
                    let vindex = self.types.variant_index(container).unwrap_or(0);
                    out.extend(self.variant_with_entries(v, vindex, subject));
                }
                out
            }
            TypeKind::Object { variant, .. } => {
                let offset = if self.types.has_vtable(container) { 1 } else { 0 };
                let mut out = Vec::new();
                for (i, f) in self.types.object_fields(container).iter().enumerate() {
                    let access = Expr::new(
                        ExprKind::Field {
                            base: Box::new(subject.clone()),
                            index: i as u32 + offset,
                        },
                        subject.span,
                        f.ty,
                    );
                    out.push((f.name.clone(), access));
                }
                if let Some(v) = variant {
                    let vindex = self.types.variant_index(container).unwrap_or(0);
                    out.extend(self.variant_with_entries(v, vindex, subject));
                }
                out
            }
            _ => Vec::new(),
        };
        for (name, access) in entries {
            let ty = access.ty;
            self.names.insert(name, NamedObject::WithDef { ty, access });
        }
    }

    fn variant_with_entries(
        &mut self,
        variant: TypeId,
        vindex: u32,
        subject: &Expr,
    ) -> Vec<(String, Expr)> {
        let arms = match self.types.kind(variant).clone() {
            TypeKind::Variant { arms } => arms,
            _ => return Vec::new(),
        };
        let mut out = Vec::new();
        for arm in arms {
            let arm_access = Expr::new(
                ExprKind::VariantField { base: Box::new(subject.clone()), index: vindex },
                subject.span,
                arm.ty,
            );
            if arm.name.is_empty() {
                if let TypeKind::Record { fields, .. } = self.types.kind(arm.ty).clone() {
                    for (i, f) in fields.iter().enumerate() {
                        let access = Expr::new(
                            ExprKind::Field {
                                base: Box::new(arm_access.clone()),
                                index: i as u32,
                            },
                            subject.span,
                            f.ty,
                        );
                        out.push((f.name.clone(), access));
                    }
                }
            } else {
                out.push((arm.name.clone(), arm_access));
            }
        }
        out
    }

    fn parse_with(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        self.expect(TokenKind::With)?;
        let mut subjects = Vec::new();
        loop {
            let e = self.parse_identifier_expr()?;
            if !e.is_addressable()
                || !matches!(
                    self.types.kind(e.ty),
                    TypeKind::Record { .. } | TypeKind::Object { .. }
                )
            {
                return Err(self.custom(
                    "with statement subject must be a record or object variable",
                    e.span,
                ));
            }
            subjects.push(e);
            if self.check(TokenKind::Do) {
                break;
            }
            self.expect(TokenKind::Comma)?;
        }
        self.expect(TokenKind::Do)?;

        self.names.push_scope();
        for subject in &subjects {
            self.expand_with_names(subject.ty, subject);
        }
        let body = self.parse_stmt_or_block();
        self.names.pop_scope();
        let body = body?;
        Ok(Stmt::new(StmtKind::With { body: Box::new(body) }, span))
    }

    fn parse_write(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        let newline = self.check(TokenKind::Writeln);
        self.advance();

        let mut file: Option<Expr> = None;
        let mut args: Vec<WriteArg> = Vec::new();
        if self.check(TokenKind::LeftParen) {
            self.advance();
            let mut first = true;
            while !self.check(TokenKind::RightParen) {
                let expr = self.parse_expression()?;
                let mut taken = false;
                if first {
                    first = false;
                    if matches!(self.types.kind(expr.ty), TypeKind::File { .. }) {
                        file = Some(expr.clone());
                        taken = true;
                    }
                }
                if !taken {
                    let mut arg = WriteArg { expr, width: None, precision: None };
                    if self.consume(TokenKind::Colon) {
                        arg.width = Some(self.parse_expression()?);
                    }
                    if self.consume(TokenKind::Colon) {
                        arg.precision = Some(self.parse_expression()?);
                    }
                    args.push(arg);
                }
                if !self.check(TokenKind::RightParen) {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }
        if args.is_empty() && file.is_none() && !newline {
            return Err(self.custom("write must have arguments", span));
        }
        Ok(Stmt::new(StmtKind::Write { file, args, newline }, span))
    }

    fn parse_read(&mut self) -> ParseResult<Stmt> {
        let span = self.current.span;
        let newline = self.check(TokenKind::Readln);
        self.advance();

        let mut file: Option<Expr> = None;
        let mut args: Vec<Expr> = Vec::new();
        if self.check(TokenKind::LeftParen) {
            self.advance();
            let mut first = true;
            while !self.check(TokenKind::RightParen) {
                let expr = self.parse_expression()?;
                let mut taken = false;
                if first {
                    first = false;
                    if matches!(self.types.kind(expr.ty), TypeKind::File { .. }) {
                        file = Some(expr.clone());
                        taken = true;
                    }
                }
                if !taken {
                    if !expr.is_addressable() {
                        return Err(
                            self.custom("read argument must be a variable", expr.span)
                        );
                    }
                    args.push(expr);
                }
                if !self.check(TokenKind::RightParen) {
                    self.expect(TokenKind::Comma)?;
                }
            }
            self.expect(TokenKind::RightParen)?;
        }
        if args.is_empty() && file.is_none() && !newline {
            return Err(self.custom("read must have arguments", span));
        }
        Ok(Stmt::new(StmtKind::Read { file, args, newline }, span))
    }

    // ============ Expressions ============

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        let lhs = self.parse_primary()?;
        self.parse_binop_rhs(0, lhs)
    }

    fn parse_binop_rhs(&mut self, prec: u8, mut lhs: Expr) -> ParseResult<Expr> {
        loop {
            let tok_prec = match self.current.kind.precedence() {
                Some(p) if p >= prec => p,
                _ => return Ok(lhs),
            };
            let op = self.advance();
            let mut rhs = self.parse_primary()?;
            if let Some(next_prec) = self.current.kind.precedence() {
                if tok_prec < next_prec {
                    rhs = self.parse_binop_rhs(tok_prec + 1, rhs)?;
                }
            }
            lhs = self.make_binary(op, lhs, rhs)?;
        }
    }

    fn make_binary(&mut self, op: Token, lhs: Expr, rhs: Expr) -> ParseResult<Expr> {
        let ty = self.binary_type(&op.kind, &lhs, &rhs, op.span)?;
        let span = lhs.span.merge(rhs.span);
        Ok(Expr::new(
            ExprKind::Binary { op: op.kind, lhs: Box::new(lhs), rhs: Box::new(rhs) },
            span,
            ty,
        ))
    }

    fn binary_type(
        &mut self,
        op: &TokenKind,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> ParseResult<TypeId> {
        use TokenKind::*;

        let lhs_set = matches!(self.types.kind(lhs.ty), TypeKind::Set { .. });
        let rhs_set = matches!(self.types.kind(rhs.ty), TypeKind::Set { .. });

        if *op == In {
            if self.types.is_integral(lhs.ty) && rhs_set {
                return Ok(types::BOOL);
            }
            return Err(self.custom("'in' needs an ordinal and a set", span));
        }

        if lhs_set || rhs_set {
            if !(lhs_set && rhs_set) {
                return Err(self.custom("invalid arguments in set operation", span));
            }
            return match op {
                Plus | Minus | Star => self
                    .types
                    .compatible(lhs.ty, rhs.ty)
                    .ok_or_else(|| self.custom("sets have incompatible element types", span)),
                Equal | NotEqual | LessOrEqual | GreaterOrEqual => Ok(types::BOOL),
                _ => Err(self.custom("unknown operator on set", span)),
            };
        }

        let numeric = |t: &TypeStore, id: TypeId| t.is_integral(id) || t.is_real(id);

        match op {
            Equal | NotEqual | LessThan | LessOrEqual | GreaterThan | GreaterOrEqual => {
                if self.types.compatible(lhs.ty, rhs.ty).is_some() {
                    Ok(types::BOOL)
                } else {
                    Err(self.custom(
                        format!(
                            "cannot compare {} with {}",
                            self.types.describe(lhs.ty),
                            self.types.describe(rhs.ty)
                        ),
                        span,
                    ))
                }
            }
            Slash => {
                if numeric(&self.types, lhs.ty) && numeric(&self.types, rhs.ty) {
                    Ok(types::REAL)
                } else {
                    Err(self.custom("'/' needs numeric operands", span))
                }
            }
            Div | Mod | Shl | Shr | And | Or | Xor => {
                if self.types.is_integral(lhs.ty) && self.types.is_integral(rhs.ty) {
                    self.types
                        .compatible(lhs.ty, rhs.ty)
                        .ok_or_else(|| self.custom("operands have incompatible types", span))
                } else {
                    Err(self.custom(
                        format!("'{}' needs integral operands", op),
                        span,
                    ))
                }
            }
            Plus | Minus | Star => {
                if numeric(&self.types, lhs.ty) && numeric(&self.types, rhs.ty) {
                    self.types
                        .compatible(lhs.ty, rhs.ty)
                        .ok_or_else(|| self.custom("operands have incompatible types", span))
                } else {
                    Err(self.custom(
                        format!("'{}' needs numeric operands", op),
                        span,
                    ))
                }
            }
            other => Err(self.custom(format!("unknown operator '{}'", other), span)),
        }
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = self.advance();
        let rhs = self.parse_primary()?;
        if op.kind == TokenKind::Plus {
            // Unary plus changes nothing.
            return Ok(rhs);
        }
        let ok = match op.kind {
            TokenKind::Minus => {
                self.types.is_integral(rhs.ty) || self.types.is_real(rhs.ty)
            }
            TokenKind::Not => self.types.is_integral(rhs.ty),
            _ => false,
        };
        if !ok {
            return Err(self.custom(
                format!("unary '{}' cannot apply to {}", op.kind, self.types.describe(rhs.ty)),
                op.span,
            ));
        }
        let ty = rhs.ty;
        let span = op.span.merge(rhs.span);
        Ok(Expr::new(ExprKind::Unary { op: op.kind, rhs: Box::new(rhs) }, span, ty))
    }

    fn string_literal_type(&mut self, len: usize) -> TypeId {
        let high = (len.max(1) - 1) as i64;
        let dim = self
            .types
            .subrange(types::INTEGER, 0, high)
            .unwrap_or(types::INTEGER);
        self.types.array(types::CHAR, vec![dim])
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let span = self.current.span;
        match self.current.kind.clone() {
            TokenKind::IntLiteral => {
                let tok = self.advance();
                let v = self
                    .text(&tok)
                    .parse::<i64>()
                    .map_err(|_| self.custom("integer literal out of range", span))?;
                let ty = if v > u32::MAX as i64 { types::INT64 } else { types::INTEGER };
                Ok(Expr::new(ExprKind::IntLit(v), span, ty))
            }
            TokenKind::RealLiteral => {
                let tok = self.advance();
                let v = self
                    .text(&tok)
                    .parse::<f64>()
                    .map_err(|_| self.custom("malformed real literal", span))?;
                Ok(Expr::new(ExprKind::RealLit(v), span, types::REAL))
            }
            TokenKind::CharLiteral => {
                let tok = self.advance();
                Ok(Expr::new(
                    ExprKind::CharLit(decode_char(self.text(&tok))),
                    span,
                    types::CHAR,
                ))
            }
            TokenKind::StringLiteral => {
                let tok = self.advance();
                let s = decode_string(self.text(&tok));
                let ty = self.string_literal_type(s.len());
                Ok(Expr::new(ExprKind::StrLit(s), span, ty))
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::new(ExprKind::Nil, span, types::NIL))
            }
            TokenKind::LeftParen => {
                self.advance();
                let e = self.parse_expression()?;
                self.expect(TokenKind::RightParen)?;
                Ok(e)
            }
            TokenKind::LeftSquare => self.parse_set_expr(),
            TokenKind::Identifier => self.parse_identifier_expr(),
            TokenKind::Minus | TokenKind::Plus | TokenKind::Not => self.parse_unary(),
            TokenKind::SizeOf => self.parse_sizeof(),
            other => Err(ParseError::UnexpectedToken {
                expected: "expression".into(),
                found: other,
                span,
            }),
        }
    }

    fn parse_sizeof(&mut self) -> ParseResult<Expr> {
        let span = self.current.span;
        self.expect(TokenKind::SizeOf)?;
        self.expect(TokenKind::LeftParen)?;
        let target = if self.check(TokenKind::Identifier) {
            let name = self.ident_text(&self.current.clone());
            if let Some(ty) = self.get_type_decl(&name) {
                self.advance();
                ty
            } else {
                self.parse_expression()?.ty
            }
        } else {
            self.parse_expression()?.ty
        };
        self.expect(TokenKind::RightParen)?;
        Ok(Expr::new(ExprKind::SizeOf { target }, span, types::INTEGER))
    }

    /// `[a, b, lo..hi]`. The first element fixes the element type;
    /// every later element must be compatible with it.
    fn parse_set_expr(&mut self) -> ParseResult<Expr> {
        let span = self.current.span;
        self.expect(TokenKind::LeftSquare)?;
        let mut elements: Vec<SetElem> = Vec::new();
        let mut elem_ty: Option<TypeId> = None;

        while !self.check(TokenKind::RightSquare) {
            let v = self.parse_expression()?;
            if !self.types.is_integral(v.ty) {
                return Err(self.custom("set elements must be ordinal values", v.span));
            }
            match elem_ty {
                None => elem_ty = Some(v.ty),
                Some(t) => {
                    if self.types.compatible(t, v.ty).is_none() {
                        return Err(self.custom(
                            "set elements must all have the same type",
                            v.span,
                        ));
                    }
                }
            }
            if self.consume(TokenKind::DotDot) {
                let hi = self.parse_expression()?;
                if !self.types.is_integral(hi.ty) {
                    return Err(self.custom("set elements must be ordinal values", hi.span));
                }
                elements.push(SetElem::Range(v, hi));
            } else {
                elements.push(SetElem::Single(v));
            }
            if !self.check(TokenKind::RightSquare) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RightSquare)?;

        let elem = elem_ty.unwrap_or(types::INTEGER);
        let ty = self.types.set_literal(elem);
        Ok(Expr::new(ExprKind::SetLit { elements }, span, ty))
    }

    // ============ Identifier expressions, calls, postfix ============

    fn parse_identifier_expr(&mut self) -> ParseResult<Expr> {
        let tok = self.expect(TokenKind::Identifier)?;
        let span = tok.span;
        let name = self.ident_text(&tok);

        let def = match self.names.find(&name).cloned() {
            Some(def) => def,
            None => {
                if let Some(builtin) = Builtin::from_name(&name) {
                    return self.parse_builtin(builtin, span);
                }
                return Err(self.custom(format!("undefined name '{}'", name), span));
            }
        };

        match def {
            NamedObject::EnumDef { ty, value } => {
                Ok(Expr::new(ExprKind::IntLit(value), span, ty))
            }
            NamedObject::ConstDef { value } => Ok(self.const_to_expr(value, span)),
            NamedObject::WithDef { access, .. } => self.parse_postfix(access),
            NamedObject::VarDef { ty } => {
                // A variable holding a routine pointer is a call unless
                // it stands on the left of `:=`.
                if let TypeKind::FuncPtr { proto } = self.types.kind(ty).clone() {
                    if !self.check(TokenKind::Assign) {
                        let args = self.parse_args(Some(&proto))?;
                        let callee = Expr::new(ExprKind::Variable { name: name.clone() }, span, ty);
                        self.note_use(&name, ty);
                        return self.make_call(None, callee, proto, args, span);
                    }
                }
                self.note_use(&name, ty);
                let expr = Expr::new(ExprKind::Variable { name }, span, ty);
                self.parse_postfix(expr)
            }
            NamedObject::FuncDef { ty, proto } => {
                if self.check(TokenKind::Assign) {
                    // The function name on the left of `:=` denotes the
                    // result pseudo-variable inside its own body.
                    let result = proto.borrow().result;
                    return Ok(Expr::new(ExprKind::Variable { name }, span, result));
                }
                let args = self.parse_args(Some(&proto))?;
                let callee = Expr::new(ExprKind::FuncRef { name }, span, ty);
                self.make_call(None, callee, proto, args, span)
            }
            NamedObject::TypeDef { .. } => {
                Err(self.custom(format!("'{}' is a type, not a value", name), span))
            }
        }
    }

    fn const_to_expr(&mut self, value: ConstValue, span: Span) -> Expr {
        match value {
            ConstValue::Int(v) => Expr::new(ExprKind::IntLit(v), span, types::INTEGER),
            ConstValue::Real(v) => Expr::new(ExprKind::RealLit(v), span, types::REAL),
            ConstValue::Char(v) => Expr::new(ExprKind::CharLit(v), span, types::CHAR),
            ConstValue::Bool(v) => Expr::new(ExprKind::BoolLit(v), span, types::BOOL),
            ConstValue::Str(s) => {
                let ty = self.string_literal_type(s.len());
                Expr::new(ExprKind::StrLit(s), span, ty)
            }
            ConstValue::Enum { value, ty } => Expr::new(ExprKind::IntLit(value), span, ty),
        }
    }

    /// Postfix chain: indexing, dereference, field access. A member
    /// call terminates the chain (function results are not addressable).
    fn parse_postfix(&mut self, mut expr: Expr) -> ParseResult<Expr> {
        loop {
            match self.current.kind {
                TokenKind::LeftSquare => {
                    expr = self.parse_index_expr(expr)?;
                }
                TokenKind::Uparrow => {
                    expr = self.parse_deref_expr(expr)?;
                }
                TokenKind::Period => {
                    match self.parse_field_expr(expr)? {
                        FieldOrCall::Field(e) => expr = e,
                        FieldOrCall::Call(e) => return Ok(e),
                    }
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_index_expr(&mut self, expr: Expr) -> ParseResult<Expr> {
        let span = self.current.span;
        self.expect(TokenKind::LeftSquare)?;

        // Strings index as single-dimension char arrays.
        if let TypeKind::Str { capacity } = self.types.kind(expr.ty).clone() {
            let index = self.parse_expression()?;
            if !self.types.is_integral(index.ty) {
                return Err(self.custom("index must be an integral type", index.span));
            }
            self.expect(TokenKind::RightSquare)?;
            let dim = self
                .types
                .subrange(types::INTEGER, 0, capacity as i64)
                .map_err(|e| self.custom(e.to_string(), span))?;
            return Ok(Expr::new(
                ExprKind::Index { base: Box::new(expr), indices: vec![index], dims: vec![dim] },
                span,
                types::CHAR,
            ));
        }

        let (mut element, mut dims) = match self.types.kind(expr.ty).clone() {
            TypeKind::Array { element, dims } => (element, dims),
            _ => {
                return Err(self.custom(
                    "expected variable of array type when using index",
                    span,
                ))
            }
        };

        let mut base = expr;
        let mut indices: Vec<Expr> = Vec::new();
        while !self.check(TokenKind::RightSquare) {
            let index = self.parse_expression()?;
            if !self.types.is_integral(index.ty) {
                return Err(self.custom("index must be an integral type", index.span));
            }
            indices.push(index);
            if indices.len() == dims.len() {
                base = Expr::new(
                    ExprKind::Index {
                        base: Box::new(base),
                        indices: std::mem::take(&mut indices),
                        dims: dims.clone(),
                    },
                    span,
                    element,
                );
                // `a[i, j]` may continue into an array-of-arrays.
                match self.types.kind(element).clone() {
                    TypeKind::Array { element: e2, dims: d2 } => {
                        element = e2;
                        dims = d2;
                    }
                    _ => {
                        if !self.check(TokenKind::RightSquare) {
                            return Err(
                                self.custom("too many array indices", self.current.span)
                            );
                        }
                    }
                }
            }
            if !self.check(TokenKind::RightSquare) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RightSquare)?;
        if !indices.is_empty() {
            return Err(self.custom("wrong number of array indices", span));
        }
        Ok(base)
    }

    fn parse_deref_expr(&mut self, expr: Expr) -> ParseResult<Expr> {
        let span = self.current.span;
        self.expect(TokenKind::Uparrow)?;
        match self.types.kind(expr.ty).clone() {
            TypeKind::File { element, .. } => Ok(Expr::new(
                ExprKind::FileBuffer { base: Box::new(expr) },
                span,
                element,
            )),
            TypeKind::Pointer { pointee: types::Pointee::Resolved(p) } => {
                Ok(Expr::new(ExprKind::Deref { base: Box::new(expr) }, span, p))
            }
            _ => Err(self.custom("expected pointer or file for '^'", span)),
        }
    }

    fn parse_field_expr(&mut self, expr: Expr) -> ParseResult<FieldOrCall> {
        self.expect(TokenKind::Period)?;
        let tok = self.expect(TokenKind::Identifier)?;
        let span = tok.span;
        let name = self.ident_text(&tok);

        let container = expr.ty;
        let is_object = matches!(self.types.kind(container), TypeKind::Object { .. });
        let is_record = matches!(self.types.kind(container), TypeKind::Record { .. });
        if !is_object && !is_record {
            return Err(self.custom(
                "attempt to access a field of a value that has no fields",
                span,
            ));
        }

        if let Some((index, ty)) = self.types.field_index(container, &name) {
            return Ok(FieldOrCall::Field(Expr::new(
                ExprKind::Field { base: Box::new(expr), index },
                span,
                ty,
            )));
        }
        if is_object {
            if let Some(mf) = self.types.member_func(container, &name) {
                let args = self.parse_args(Some(&mf.proto))?;
                let call = self.make_member_call(expr, mf, args, span)?;
                return Ok(FieldOrCall::Call(call));
            }
        }
        if let Some(hit) = self.variant_hit(container, &name) {
            return Ok(FieldOrCall::Field(hit_to_expr(expr, hit, span, container, &self.types)));
        }
        Err(self.custom(
            format!(
                "cannot find element '{}' in {}",
                name,
                if is_object { "object" } else { "record" }
            ),
            span,
        ))
    }

    fn variant_hit(&self, container: TypeId, name: &str) -> Option<types::VariantFieldHit> {
        let variant = self.types.variant_of(container)?;
        self.types.variant_field(variant, name)
    }

    /// Build a member call: static dispatch to the mangled symbol, or a
    /// vtable dispatch when the method is virtual.
    fn make_member_call(
        &mut self,
        object: Expr,
        mf: MemberFunc,
        args: Vec<Expr>,
        span: Span,
    ) -> ParseResult<Expr> {
        if !object.is_addressable() && !mf.is_static {
            return Err(self.custom("member call needs an addressable object", span));
        }
        let result = mf.proto.borrow().result;
        if let Some(slot) = mf.virt_index {
            self.check_call_arity(&mf.proto, args.len(), span)?;
            return Ok(Expr::new(
                ExprKind::VirtualCall {
                    object: Box::new(object),
                    slot,
                    args,
                    proto: mf.proto.clone(),
                },
                span,
                result,
            ));
        }
        let callee = Expr::new(ExprKind::FuncRef { name: mf.mangled.clone() }, span, result);
        let self_arg = if mf.is_static { None } else { Some(object) };
        self.make_call(self_arg, callee, mf.proto.clone(), args, span)
    }

    /// Parse a call's argument list. Formal parameters drive two
    /// context-sensitive rules: routine-valued formals take a bare
    /// routine name, and `var` formals require an addressable actual of
    /// the exact same type.
    fn parse_args(&mut self, proto: Option<&ProtoRef>) -> ParseResult<Vec<Expr>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::LeftParen) {
            return Ok(args);
        }
        self.advance();

        let formals: Vec<Param> = proto
            .map(|p| {
                let p = p.borrow();
                let skip = if p.has_self { 1 } else { 0 };
                p.params
                    .iter()
                    .skip(skip)
                    .filter(|q| !q.is_closure)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut arg_no = 0usize;
        while !self.check(TokenKind::RightParen) {
            let formal = formals.get(arg_no);
            if proto.is_some() && formal.is_none() {
                return Err(self.custom("too many arguments", self.current.span));
            }

            let is_func_arg = formal
                .map(|f| matches!(self.types.kind(f.ty), TypeKind::FuncPtr { .. }))
                .unwrap_or(false);

            let arg = if is_func_arg {
                let tok = self.expect(TokenKind::Identifier).map_err(|_| {
                    self.custom(
                        "expected the name of a function or procedure",
                        self.current.span,
                    )
                })?;
                let fname = self.ident_text(&tok);
                match self.names.find(&fname) {
                    Some(NamedObject::FuncDef { .. }) => Expr::new(
                        ExprKind::FuncRef { name: fname },
                        tok.span,
                        formal.map(|f| f.ty).unwrap_or(types::VOID),
                    ),
                    _ => {
                        return Err(self.custom(
                            format!("'{}' does not name a function or procedure", fname),
                            tok.span,
                        ))
                    }
                }
            } else {
                let e = self.parse_expression()?;
                if let Some(f) = formal {
                    if f.by_ref {
                        if !e.is_addressable() {
                            return Err(self.custom(
                                "arguments declared with 'var' must be variables",
                                e.span,
                            ));
                        }
                        if !self.types.same_as(f.ty, e.ty)
                            && !self.types.derives_from(e.ty, f.ty)
                        {
                            return Err(self.custom(
                                format!(
                                    "var argument type mismatch: expected {}, got {}",
                                    self.types.describe(f.ty),
                                    self.types.describe(e.ty)
                                ),
                                e.span,
                            ));
                        }
                    } else if self.types.compatible(f.ty, e.ty).is_none()
                        && self.types.assignable(f.ty, e.ty).is_none()
                    {
                        return Err(self.custom(
                            format!(
                                "argument type mismatch: expected {}, got {}",
                                self.types.describe(f.ty),
                                self.types.describe(e.ty)
                            ),
                            e.span,
                        ));
                    }
                }
                e
            };

            args.push(arg);
            arg_no += 1;
            if !self.check(TokenKind::RightParen) {
                self.expect(TokenKind::Comma)?;
            }
        }
        self.expect(TokenKind::RightParen)?;
        Ok(args)
    }

    fn check_call_arity(
        &self,
        proto: &ProtoRef,
        user_args: usize,
        span: Span,
    ) -> ParseResult<()> {
        let p = proto.borrow();
        let expected = p
            .params
            .iter()
            .filter(|q| !q.is_closure && !(p.has_self && q.name == "self"))
            .count();
        if user_args != expected {
            return Err(self.custom(
                format!(
                    "incorrect number of arguments for '{}': expected {}, got {}",
                    p.name, expected, user_args
                ),
                span,
            ));
        }
        Ok(())
    }

    /// Assemble a call: prepend the receiver for member functions,
    /// append captured-variable arguments for closure-converted
    /// routines (resolved in the calling scope).
    fn make_call(
        &mut self,
        self_arg: Option<Expr>,
        callee: Expr,
        proto: ProtoRef,
        mut args: Vec<Expr>,
        span: Span,
    ) -> ParseResult<Expr> {
        self.check_call_arity(&proto, args.len(), span)?;

        if proto.borrow().has_self {
            match self_arg {
                Some(obj) => args.insert(0, obj),
                None => {
                    return Err(
                        self.custom("member function call needs an object", span)
                    )
                }
            }
        }

        let closure_params: Vec<Param> = proto
            .borrow()
            .params
            .iter()
            .filter(|p| p.is_closure)
            .cloned()
            .collect();
        for p in closure_params {
            // Referencing the captured variable here makes the caller
            // capture it too when the caller is itself nested.
            self.note_use(&p.name, p.ty);
            args.push(Expr::new(
                ExprKind::Variable { name: p.name.clone() },
                span,
                p.ty,
            ));
        }

        let result = proto.borrow().result;
        Ok(Expr::new(
            ExprKind::Call { callee: Box::new(callee), args, proto },
            span,
            result,
        ))
    }

    // ============ Builtins ============

    fn parse_builtin(&mut self, builtin: Builtin, span: Span) -> ParseResult<Expr> {
        let args = self.parse_args(None)?;
        if args.len() != 1 {
            return Err(self.custom(
                format!("builtin takes exactly one argument, got {}", args.len()),
                span,
            ));
        }
        let arg = &args[0];
        let arg_ty = arg.ty;

        let ty = match builtin {
            Builtin::New | Builtin::Dispose => {
                let is_ptr = matches!(
                    self.types.kind(arg_ty),
                    TypeKind::Pointer { pointee: types::Pointee::Resolved(_) }
                );
                if !is_ptr || !arg.is_addressable() {
                    return Err(
                        self.custom("argument must be a pointer variable", arg.span)
                    );
                }
                types::VOID
            }
            Builtin::Ord => {
                if !self.types.is_integral(arg_ty) {
                    return Err(self.custom("ord needs an ordinal argument", arg.span));
                }
                types::INTEGER
            }
            Builtin::Chr => {
                if !self.types.is_integral(arg_ty) {
                    return Err(self.custom("chr needs an integer argument", arg.span));
                }
                types::CHAR
            }
            Builtin::Succ | Builtin::Pred => {
                if !self.types.is_integral(arg_ty) {
                    return Err(self.custom("succ/pred need an ordinal argument", arg.span));
                }
                arg_ty
            }
            Builtin::Abs | Builtin::Sqr => {
                if !self.types.is_integral(arg_ty) && !self.types.is_real(arg_ty) {
                    return Err(self.custom("argument must be numeric", arg.span));
                }
                arg_ty
            }
            Builtin::Odd => {
                if !self.types.is_integral(arg_ty) {
                    return Err(self.custom("odd needs an integer argument", arg.span));
                }
                types::BOOL
            }
            Builtin::Trunc | Builtin::Round => {
                if !self.types.is_real(arg_ty) {
                    return Err(self.custom("argument must be a real value", arg.span));
                }
                types::INTEGER
            }
        };
        Ok(Expr::new(ExprKind::BuiltinCall { builtin, args }, span, ty))
    }
}

/// A field access production either extends the postfix chain or ends
/// it with a member call.
enum FieldOrCall {
    Field(Expr),
    Call(Expr),
}

fn hit_to_expr(
    base: Expr,
    hit: types::VariantFieldHit,
    span: Span,
    container: TypeId,
    types: &TypeStore,
) -> Expr {
    let vindex = types.variant_index(container).unwrap_or(0);
    let arm = Expr::new(
        ExprKind::VariantField { base: Box::new(base), index: vindex },
        span,
        hit.arm_ty,
    );
    match hit.nested {
        None => arm,
        Some((index, ty)) => Expr::new(
            ExprKind::Field { base: Box::new(arm), index },
            span,
            ty,
        ),
    }
}

/// Parse source code into a program, the populated type registry and
/// any errors.
pub fn parse(source: &str) -> (Program, TypeStore, Vec<ParseError>) {
    let mut parser = Parser::new(source);
    let program = parser.parse_program();
    let errors = parser.errors.clone();
    (program, parser.into_types(), errors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> (Program, TypeStore) {
        let (program, types, errors) = parse(source);
        assert!(errors.is_empty(), "Parse errors: {:?}", errors);
        (program, types)
    }

    fn parse_err(source: &str) -> Vec<ParseError> {
        let (_, _, errors) = parse(source);
        assert!(!errors.is_empty(), "expected parse errors");
        errors
    }

    fn main_function(program: &Program) -> &FunctionDecl {
        program
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(f) if f.proto.borrow().name == "__PascalMain" => Some(f),
                _ => None,
            })
            .expect("program should have a main block")
    }

    #[test]
    fn test_minimal_program() {
        let (program, _) = parse_ok("program p; begin end.");
        assert_eq!(program.name, "p");
        let main = main_function(&program);
        assert!(main.body.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_arithmetic_statement() {
        let (program, _) = parse_ok(
            "program p; var i: integer; begin i := 1 + 2 * 3; writeln(i) end.",
        );
        let main = main_function(&program);
        let body = main.body.as_ref().unwrap();
        assert_eq!(body.len(), 2);
        match &body[0].kind {
            StmtKind::Assign { lhs, rhs } => {
                assert!(matches!(&lhs.kind, ExprKind::Variable { name } if name == "i"));
                assert!(matches!(&rhs.kind, ExprKind::Binary { op: TokenKind::Plus, .. }));
            }
            other => panic!("expected assignment, got {:?}", other),
        }
        assert!(matches!(&body[1].kind, StmtKind::Write { newline: true, .. }));
    }

    #[test]
    fn test_every_expression_has_a_registered_type() {
        let (mut program, types) = parse_ok(
            "program p;
             var i: integer; r: real; s: string[10];
             begin i := 1 + 2; r := i * 3; s := 'hi'; writeln(r:8:2) end.",
        );
        for item in &mut program.items {
            if let Item::Function(f) = item {
                f.walk_exprs_mut(&mut |e| {
                    assert!(types.contains(e.ty), "expression without type: {:?}", e);
                });
            }
        }
    }

    #[test]
    fn test_self_referential_pointer_type() {
        let (_, types) = parse_ok(
            "program p;
             type t = ^t;
             var x: t;
             begin new(x); x^ := x end.",
        );
        assert!(!types.has_incomplete_pointers());
    }

    #[test]
    fn test_forward_pointer_to_record() {
        let (_, types) = parse_ok(
            "program p;
             type pnode = ^node;
                  node = record value: integer; next: pnode end;
             var head: pnode;
             begin new(head); head^.value := 1; head^.next := nil end.",
        );
        assert!(!types.has_incomplete_pointers());
    }

    #[test]
    fn test_missing_forward_pointee_is_an_error() {
        let errors = parse_err("program p; type t = ^missing; begin end.");
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("forward declared pointer")));
    }

    #[test]
    fn test_enum_and_set() {
        let (_, _) = parse_ok(
            "program p;
             type color = (red, green, blue);
                  s = set of color;
             var x: s;
             begin x := [red, blue]; if green in x then writeln(1) else writeln(0) end.",
        );
    }

    #[test]
    fn test_heterogeneous_set_literal_is_an_error() {
        let errors = parse_err(
            "program p;
             type color = (red, green, blue);
             var x: set of color;
             begin x := [red, 'a'] end.",
        );
        assert!(errors
            .iter()
            .any(|e| e.to_string().contains("same type")));
    }

    #[test]
    fn test_nested_procedure_captures_outer_variable() {
        let (program, _) = parse_ok(
            "program p;
             procedure outer;
             var k: integer;
               procedure inner;
               begin k := k + 1 end;
             begin k := 0; inner; writeln(k) end;
             begin outer end.",
        );
        let outer = program
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(f) if f.proto.borrow().name == "outer" => Some(f),
                _ => None,
            })
            .expect("outer should exist");
        let inner = &outer.subs[0];
        // The prototype gained exactly one by-ref parameter named k.
        assert_eq!(inner.captured.len(), 1);
        assert_eq!(inner.captured[0].name, "k");
        assert!(inner.captured[0].by_ref);
        let proto = inner.proto.borrow();
        assert_eq!(proto.params.len(), 1);
        assert!(proto.params[0].is_closure);

        // The call site inside outer's body passes the captured k.
        let body = outer.body.as_ref().unwrap();
        let call_args = body
            .iter()
            .find_map(|s| match &s.kind {
                StmtKind::Expr(Expr { kind: ExprKind::Call { args, proto, .. }, .. })
                    if proto.borrow().name == "inner" =>
                {
                    Some(args)
                }
                _ => None,
            })
            .expect("call to inner");
        assert_eq!(call_args.len(), 1);
        assert!(matches!(&call_args[0].kind, ExprKind::Variable { name } if name == "k"));
    }

    #[test]
    fn test_closure_conversion_matches_arity_invariant() {
        let (program, _) = parse_ok(
            "program p;
             procedure outer;
             var a, b: integer;
               procedure inner;
               begin a := a + b end;
             begin a := 0; b := 2; inner end;
             begin outer end.",
        );
        let outer = program
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(f) if f.proto.borrow().name == "outer" => Some(f),
                _ => None,
            })
            .unwrap();
        let inner = &outer.subs[0];
        let proto = inner.proto.borrow();
        // Original parameter count (0) plus |used vars| (2).
        assert_eq!(proto.params.len(), inner.captured.len());
        assert_eq!(inner.captured.len(), 2);
    }

    #[test]
    fn test_with_block_expands_fields() {
        let (program, _) = parse_ok(
            "program p;
             type point = record x, y: integer end;
             var pt: point;
             begin with pt do begin x := 1; y := 2 end end.",
        );
        let main = main_function(&program);
        let body = main.body.as_ref().unwrap();
        match &body[0].kind {
            StmtKind::With { body } => match &body.kind {
                StmtKind::Block(stmts) => {
                    // x resolved to a field access rooted at pt.
                    match &stmts[0].kind {
                        StmtKind::Assign { lhs, .. } => {
                            assert!(matches!(&lhs.kind, ExprKind::Field { index: 0, .. }));
                        }
                        other => panic!("expected assignment, got {:?}", other),
                    }
                }
                other => panic!("expected block, got {:?}", other),
            },
            other => panic!("expected with, got {:?}", other),
        }
    }

    #[test]
    fn test_record_variant_access() {
        let (_, _) = parse_ok(
            "program p;
             type shape = record
                    tag: integer;
                    case integer of
                      1: (radius: real);
                      2: (width, height: real);
                  end;
             var s: shape;
             begin s.tag := 1; s.radius := 2.5; s.width := 1.0 end.",
        );
    }

    #[test]
    fn test_duplicate_variant_tag_is_an_error() {
        let errors = parse_err(
            "program p;
             type r = record
                    case integer of
                      1: (a: integer);
                      1: (b: real);
                  end;
             begin end.",
        );
        assert!(errors.iter().any(|e| e.to_string().contains("already used")));
    }

    #[test]
    fn test_object_with_virtual_methods() {
        let (_, types) = parse_ok(
            "program p;
             type shape = object
                    x: integer;
                    procedure draw; virtual;
                  end;
                  circle = object(shape)
                    r: real;
                    procedure draw; override;
                  end;
             procedure shape.draw;
             begin writeln(1) end;
             procedure circle.draw;
             begin writeln(2) end;
             var c: circle;
             begin c.draw end.",
        );
        // Find the two object types and check their vtable slots agree.
        let mut shape = None;
        let mut circle = None;
        for i in 0..1000u32 {
            let id = TypeId(i);
            if !types.contains(id) {
                break;
            }
            if let TypeKind::Object { name, .. } = types.kind(id) {
                match name.as_str() {
                    "shape" => shape = Some(id),
                    "circle" => circle = Some(id),
                    _ => {}
                }
            }
        }
        let (shape, circle) = (shape.unwrap(), circle.unwrap());
        let base_draw = types.member_func(shape, "draw").unwrap();
        let derived_draw = types.member_func(circle, "draw").unwrap();
        assert_eq!(base_draw.virt_index, derived_draw.virt_index);
        assert_eq!(derived_draw.mangled, "circle$draw");
    }

    #[test]
    fn test_member_call_is_virtual_dispatch() {
        let (program, _) = parse_ok(
            "program p;
             type shape = object
                    procedure draw; virtual;
                  end;
             procedure shape.draw;
             begin end;
             var s: shape;
             begin s.draw end.",
        );
        let main = main_function(&program);
        let body = main.body.as_ref().unwrap();
        assert!(matches!(
            &body[0].kind,
            StmtKind::Expr(Expr { kind: ExprKind::VirtualCall { slot: 0, .. }, .. })
        ));
    }

    #[test]
    fn test_override_of_non_virtual_is_an_error() {
        let errors = parse_err(
            "program p;
             type a = object
                    procedure m;
                  end;
                  b = object(a)
                    procedure m; override;
                  end;
             begin end.",
        );
        assert!(errors.iter().any(|e| e.to_string().contains("not virtual")));
    }

    #[test]
    fn test_function_result_assignment() {
        let (program, _) = parse_ok(
            "program p;
             function three: integer;
             begin three := 3 end;
             begin writeln(three) end.",
        );
        let f = program
            .items
            .iter()
            .find_map(|item| match item {
                Item::Function(f) if f.proto.borrow().name == "three" => Some(f),
                _ => None,
            })
            .unwrap();
        match &f.body.as_ref().unwrap()[0].kind {
            StmtKind::Assign { lhs, .. } => {
                assert!(matches!(&lhs.kind, ExprKind::Variable { name } if name == "three"));
                assert_eq!(lhs.ty, types::INTEGER);
            }
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn test_var_parameter_requires_variable() {
        let errors = parse_err(
            "program p;
             procedure bump(var n: integer);
             begin n := n + 1 end;
             begin bump(42) end.",
        );
        assert!(errors.iter().any(|e| e.to_string().contains("'var'")));
    }

    #[test]
    fn test_function_valued_parameter_takes_bare_name() {
        let (_, _) = parse_ok(
            "program p;
             function double(x: integer): integer;
             begin double := x * 2 end;
             procedure apply(function f(x: integer): integer);
             var r: integer;
             begin r := 0 end;
             begin apply(double) end.",
        );
    }

    #[test]
    fn test_undeclared_name_is_an_error() {
        let errors = parse_err("program p; begin x := 1 end.");
        assert!(errors.iter().any(|e| e.to_string().contains("undefined name")));
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let errors = parse_err(
            "program p; var i: integer; begin i := 1.5 end.",
        );
        assert!(errors.iter().any(|e| e.to_string().contains("cannot assign")));
    }

    #[test]
    fn test_recovery_continues_after_bad_statement() {
        let (_, _, errors) = parse(
            "program p; var i: integer;
             begin i := ; i := 2 end.",
        );
        // One error for the bad expression; the parser recovers and
        // accepts the rest.
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_forward_declaration() {
        let (_, _) = parse_ok(
            "program p;
             procedure later(n: integer); forward;
             procedure first;
             begin later(1) end;
             procedure later(n: integer);
             begin writeln(n) end;
             begin first end.",
        );
    }

    #[test]
    fn test_case_statement() {
        let (program, _) = parse_ok(
            "program p;
             var i: integer;
             begin
               case i of
                 1: writeln(1);
                 2, 3: writeln(2);
                 otherwise writeln(0)
               end
             end.",
        );
        let main = main_function(&program);
        match &main.body.as_ref().unwrap()[0].kind {
            StmtKind::Case { arms, otherwise, .. } => {
                assert_eq!(arms.len(), 2);
                assert_eq!(arms[1].labels, vec![2, 3]);
                assert!(otherwise.is_some());
            }
            other => panic!("expected case, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_case_label_is_an_error() {
        let errors = parse_err(
            "program p; var i: integer;
             begin case i of 1: writeln(1); 1: writeln(2) end end.",
        );
        assert!(errors.iter().any(|e| e.to_string().contains("already used")));
    }

    #[test]
    fn test_for_loop() {
        let (program, _) = parse_ok(
            "program p; var i: integer;
             begin for i := 1 to 10 do if i mod 2 = 0 then write(i) end.",
        );
        let main = main_function(&program);
        assert!(matches!(
            &main.body.as_ref().unwrap()[0].kind,
            StmtKind::For { down: false, .. }
        ));
    }

    #[test]
    fn test_sizeof() {
        let (_, _) = parse_ok(
            "program p; var i: integer;
             begin i := sizeof(integer); i := sizeof(i) end.",
        );
    }

    #[test]
    fn test_string_indexing() {
        let (_, _) = parse_ok(
            "program p; var s: string[20]; c: char;
             begin s := 'hello'; c := s[1] end.",
        );
    }

    #[test]
    fn test_repeat_until() {
        let (_, _) = parse_ok(
            "program p; var i: integer;
             begin i := 0; repeat i := i + 1 until i >= 10 end.",
        );
    }

    #[test]
    fn test_multi_dimensional_array() {
        let (_, _) = parse_ok(
            "program p;
             var m: array[1..3, 1..4] of integer;
             begin m[2, 3] := 7 end.",
        );
    }
}
