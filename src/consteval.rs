//! Constant expression evaluation
//!
//! The parser folds constant expressions while it reads them (range
//! bounds, array dimensions, variant tags, `const` declarations). The
//! token-cursor driving lives in the parser; this module holds the value
//! representation and the folding rules.

use thiserror::Error;

use crate::token::TokenKind;
use crate::types::{self, TypeId};

/// A folded constant
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    Real(f64),
    Char(u8),
    Bool(bool),
    Str(String),
    /// An enumerated value, remembering its enum type
    Enum { value: i64, ty: TypeId },
}

/// Folding errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstError {
    #[error("unary '{0}' is not allowed for this constant")]
    BadUnary(String),

    #[error("operator '{0}' is not supported in constant expressions")]
    BadOperator(String),

    #[error("operands of constant '{0}' have incompatible kinds")]
    Incompatible(String),
}

impl ConstValue {
    /// The type of the constant
    pub fn type_id(&self) -> TypeId {
        match self {
            ConstValue::Int(_) => types::INTEGER,
            ConstValue::Real(_) => types::REAL,
            ConstValue::Char(_) => types::CHAR,
            ConstValue::Bool(_) => types::BOOL,
            // String constants type as char arrays at use sites; the
            // registry id is resolved by the parser.
            ConstValue::Str(_) => types::CHAR,
            ConstValue::Enum { ty, .. } => *ty,
        }
    }

    /// Ordinal value, for range bounds, case labels and variant tags
    pub fn ordinal(&self) -> Option<i64> {
        match self {
            ConstValue::Int(v) => Some(*v),
            ConstValue::Char(v) => Some(*v as i64),
            ConstValue::Bool(v) => Some(*v as i64),
            ConstValue::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }
}

/// Apply a unary operator to a constant
pub fn unary(op: TokenKind, v: ConstValue) -> Result<ConstValue, ConstError> {
    match op {
        TokenKind::Plus => match v {
            ConstValue::Int(_) | ConstValue::Real(_) => Ok(v),
            _ => Err(ConstError::BadUnary("+".into())),
        },
        TokenKind::Minus => match v {
            ConstValue::Int(i) => Ok(ConstValue::Int(-i)),
            ConstValue::Real(r) => Ok(ConstValue::Real(-r)),
            _ => Err(ConstError::BadUnary("-".into())),
        },
        // `not` is logical on booleans and bitwise on integers.
        TokenKind::Not => match v {
            ConstValue::Bool(b) => Ok(ConstValue::Bool(!b)),
            ConstValue::Int(i) => Ok(ConstValue::Int(!i)),
            _ => Err(ConstError::BadUnary("not".into())),
        },
        _ => Err(ConstError::BadOperator(op.to_string())),
    }
}

/// Apply a binary operator to two constants. Integer operands widen to
/// real when the other side is real.
pub fn binary(op: TokenKind, lhs: ConstValue, rhs: ConstValue) -> Result<ConstValue, ConstError> {
    use ConstValue::*;

    match op {
        TokenKind::Plus | TokenKind::Minus | TokenKind::Star => {}
        _ => return Err(ConstError::BadOperator(op.to_string())),
    }

    match (lhs, rhs) {
        (Int(a), Int(b)) => Ok(Int(apply_int(op, a, b))),
        (Real(a), Real(b)) => Ok(Real(apply_real(op, a, b))),
        (Int(a), Real(b)) => Ok(Real(apply_real(op, a as f64, b))),
        (Real(a), Int(b)) => Ok(Real(apply_real(op, a, b as f64))),
        _ => Err(ConstError::Incompatible(op.to_string())),
    }
}

fn apply_int(op: TokenKind, a: i64, b: i64) -> i64 {
    match op {
        TokenKind::Plus => a.wrapping_add(b),
        TokenKind::Minus => a.wrapping_sub(b),
        TokenKind::Star => a.wrapping_mul(b),
        _ => unreachable!("filtered by binary()"),
    }
}

fn apply_real(op: TokenKind, a: f64, b: f64) -> f64 {
    match op {
        TokenKind::Plus => a + b,
        TokenKind::Minus => a - b,
        TokenKind::Star => a * b,
        _ => unreachable!("filtered by binary()"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic() {
        let v = binary(TokenKind::Plus, ConstValue::Int(1), ConstValue::Int(2)).unwrap();
        assert_eq!(v, ConstValue::Int(3));
        let v = binary(TokenKind::Star, ConstValue::Int(4), ConstValue::Int(5)).unwrap();
        assert_eq!(v, ConstValue::Int(20));
    }

    #[test]
    fn test_mixed_widening() {
        let v = binary(TokenKind::Plus, ConstValue::Int(1), ConstValue::Real(0.5)).unwrap();
        assert_eq!(v, ConstValue::Real(1.5));
    }

    #[test]
    fn test_unary_not() {
        assert_eq!(
            unary(TokenKind::Not, ConstValue::Bool(true)).unwrap(),
            ConstValue::Bool(false)
        );
        assert_eq!(unary(TokenKind::Not, ConstValue::Int(0)).unwrap(), ConstValue::Int(-1));
    }

    #[test]
    fn test_negate_string_is_an_error() {
        assert!(unary(TokenKind::Minus, ConstValue::Str("x".into())).is_err());
    }

    #[test]
    fn test_division_is_not_folded() {
        assert!(binary(TokenKind::Slash, ConstValue::Int(1), ConstValue::Int(2)).is_err());
    }

    #[test]
    fn test_ordinals() {
        assert_eq!(ConstValue::Char(65).ordinal(), Some(65));
        assert_eq!(ConstValue::Bool(true).ordinal(), Some(1));
        assert_eq!(ConstValue::Str("no".into()).ordinal(), None);
    }
}
