//! Abstract syntax tree for the Pascal dialect
//!
//! The parser resolves names and types while it builds this tree, so
//! every expression carries its resolved [`TypeId`] from the moment it is
//! constructed. Nodes are immutable afterwards with one exception:
//! closure conversion appends captured-variable parameters to prototypes
//! and extends the argument lists of already-parsed call sites.

use std::cell::RefCell;
use std::rc::Rc;

use crate::span::Span;
use crate::token::TokenKind;
use crate::types::TypeId;

/// Shared, mutable handle to a routine's prototype. Call expressions,
/// the name environment and object member tables all point at the same
/// prototype, and closure conversion mutates it in place; the rewrite
/// pass finds affected call sites by `Rc` identity.
pub type ProtoRef = Rc<RefCell<Prototype>>;

/// One formal parameter
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
    pub by_ref: bool,
    /// Appended by closure conversion rather than written by the user
    pub is_closure: bool,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: TypeId, by_ref: bool) -> Self {
        Self { name: name.into(), ty, by_ref, is_closure: false }
    }

    pub fn closure(name: impl Into<String>, ty: TypeId) -> Self {
        Self { name: name.into(), ty, by_ref: true, is_closure: true }
    }

    /// The implicit receiver injected into non-static member functions
    pub fn self_param(object: TypeId) -> Self {
        Self { name: "self".into(), ty: object, by_ref: true, is_closure: false }
    }
}

/// A routine's prototype: name, formals, result type and flags
#[derive(Debug, Clone)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<Param>,
    pub result: TypeId,
    pub is_forward: bool,
    /// True for non-static member functions (first param is `self`)
    pub has_self: bool,
    /// The object type a member function belongs to
    pub base_object: Option<TypeId>,
}

impl Prototype {
    pub fn new(name: impl Into<String>, params: Vec<Param>, result: TypeId) -> Self {
        Self {
            name: name.into(),
            params,
            result,
            is_forward: false,
            has_self: false,
            base_object: None,
        }
    }

    pub fn shared(self) -> ProtoRef {
        Rc::new(RefCell::new(self))
    }
}

/// Builtin procedures and functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    New,
    Dispose,
    Ord,
    Chr,
    Succ,
    Pred,
    Abs,
    Sqr,
    Odd,
    Trunc,
    Round,
}

impl Builtin {
    pub fn from_name(name: &str) -> Option<Builtin> {
        Some(match name {
            "new" => Builtin::New,
            "dispose" => Builtin::Dispose,
            "ord" => Builtin::Ord,
            "chr" => Builtin::Chr,
            "succ" => Builtin::Succ,
            "pred" => Builtin::Pred,
            "abs" => Builtin::Abs,
            "sqr" => Builtin::Sqr,
            "odd" => Builtin::Odd,
            "trunc" => Builtin::Trunc,
            "round" => Builtin::Round,
            _ => return None,
        })
    }
}

/// One element of a set constructor
#[derive(Debug, Clone)]
pub enum SetElem {
    Single(Expr),
    Range(Expr, Expr),
}

/// A typed expression
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    pub ty: TypeId,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span, ty: TypeId) -> Self {
        Self { kind, span, ty }
    }

    /// Does this expression denote a storage location? Addressable
    /// expressions can stand on the left of `:=`, be passed to `var`
    /// parameters and be the subject of `with`. Set constructors are
    /// addressable through a materialized temporary.
    pub fn is_addressable(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Variable { .. }
                | ExprKind::Index { .. }
                | ExprKind::Field { .. }
                | ExprKind::VariantField { .. }
                | ExprKind::Deref { .. }
                | ExprKind::FileBuffer { .. }
                | ExprKind::SetLit { .. }
        )
    }

    /// Visit this expression and all sub-expressions, mutably
    pub fn walk_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        f(self);
        match &mut self.kind {
            ExprKind::IntLit(_)
            | ExprKind::RealLit(_)
            | ExprKind::CharLit(_)
            | ExprKind::StrLit(_)
            | ExprKind::BoolLit(_)
            | ExprKind::Nil
            | ExprKind::Variable { .. }
            | ExprKind::FuncRef { .. }
            | ExprKind::SizeOf { .. } => {}
            ExprKind::Index { base, indices, .. } => {
                base.walk_mut(f);
                for e in indices {
                    e.walk_mut(f);
                }
            }
            ExprKind::Field { base, .. }
            | ExprKind::VariantField { base, .. }
            | ExprKind::Deref { base }
            | ExprKind::FileBuffer { base } => base.walk_mut(f),
            ExprKind::SetLit { elements } => {
                for elem in elements {
                    match elem {
                        SetElem::Single(e) => e.walk_mut(f),
                        SetElem::Range(lo, hi) => {
                            lo.walk_mut(f);
                            hi.walk_mut(f);
                        }
                    }
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                lhs.walk_mut(f);
                rhs.walk_mut(f);
            }
            ExprKind::Unary { rhs, .. } => rhs.walk_mut(f),
            ExprKind::Call { callee, args, .. } => {
                callee.walk_mut(f);
                for a in args {
                    a.walk_mut(f);
                }
            }
            ExprKind::VirtualCall { object, args, .. } => {
                object.walk_mut(f);
                for a in args {
                    a.walk_mut(f);
                }
            }
            ExprKind::BuiltinCall { args, .. } => {
                for a in args {
                    a.walk_mut(f);
                }
            }
        }
    }
}

/// Expression shapes
#[derive(Debug, Clone)]
pub enum ExprKind {
    IntLit(i64),
    RealLit(f64),
    CharLit(u8),
    StrLit(String),
    BoolLit(bool),
    Nil,
    /// Named variable (including the function-result pseudo-variable)
    Variable { name: String },
    /// Array or string indexing; `dims` are the subrange types of the
    /// indexed dimensions
    Index { base: Box<Expr>, indices: Vec<Expr>, dims: Vec<TypeId> },
    /// Record or object field access by materialized struct index
    Field { base: Box<Expr>, index: u32 },
    /// Variant-part access: `index` is the struct slot of the variant
    /// overlay; the expression's type is the arm viewed through it
    VariantField { base: Box<Expr>, index: u32 },
    /// Pointer dereference `p^`
    Deref { base: Box<Expr> },
    /// File buffer variable `f^`
    FileBuffer { base: Box<Expr> },
    /// A function used as a value (callee or function-valued argument)
    FuncRef { name: String },
    /// Set constructor `[a, b, lo..hi]`
    SetLit { elements: Vec<SetElem> },
    Binary { op: TokenKind, lhs: Box<Expr>, rhs: Box<Expr> },
    Unary { op: TokenKind, rhs: Box<Expr> },
    Call { callee: Box<Expr>, args: Vec<Expr>, proto: ProtoRef },
    /// Dispatch through the object's vtable slot
    VirtualCall { object: Box<Expr>, slot: u32, args: Vec<Expr>, proto: ProtoRef },
    BuiltinCall { builtin: Builtin, args: Vec<Expr> },
    SizeOf { target: TypeId },
}

/// One argument of `write`/`writeln`, with optional width and precision
#[derive(Debug, Clone)]
pub struct WriteArg {
    pub expr: Expr,
    pub width: Option<Expr>,
    pub precision: Option<Expr>,
}

/// One arm of a `case` statement
#[derive(Debug, Clone)]
pub struct CaseArm {
    pub labels: Vec<i64>,
    pub body: Stmt,
    pub span: Span,
}

/// A statement
#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Visit every expression in this statement tree, mutably
    pub fn walk_exprs_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        match &mut self.kind {
            StmtKind::Empty => {}
            StmtKind::Assign { lhs, rhs } => {
                lhs.walk_mut(f);
                rhs.walk_mut(f);
            }
            StmtKind::Expr(e) => e.walk_mut(f),
            StmtKind::Block(stmts) => {
                for s in stmts {
                    s.walk_exprs_mut(f);
                }
            }
            StmtKind::If { cond, then, els } => {
                cond.walk_mut(f);
                then.walk_exprs_mut(f);
                if let Some(e) = els {
                    e.walk_exprs_mut(f);
                }
            }
            StmtKind::While { cond, body } => {
                cond.walk_mut(f);
                body.walk_exprs_mut(f);
            }
            StmtKind::Repeat { body, cond } => {
                for s in body {
                    s.walk_exprs_mut(f);
                }
                cond.walk_mut(f);
            }
            StmtKind::For { start, end, body, .. } => {
                start.walk_mut(f);
                end.walk_mut(f);
                body.walk_exprs_mut(f);
            }
            StmtKind::Case { selector, arms, otherwise } => {
                selector.walk_mut(f);
                for arm in arms {
                    arm.body.walk_exprs_mut(f);
                }
                if let Some(o) = otherwise {
                    o.walk_exprs_mut(f);
                }
            }
            StmtKind::With { body } => body.walk_exprs_mut(f),
            StmtKind::Write { file, args, .. } => {
                if let Some(file) = file {
                    file.walk_mut(f);
                }
                for arg in args {
                    arg.expr.walk_mut(f);
                    if let Some(w) = &mut arg.width {
                        w.walk_mut(f);
                    }
                    if let Some(p) = &mut arg.precision {
                        p.walk_mut(f);
                    }
                }
            }
            StmtKind::Read { file, args, .. } => {
                if let Some(file) = file {
                    file.walk_mut(f);
                }
                for a in args {
                    a.walk_mut(f);
                }
            }
        }
    }
}

/// Statement shapes
#[derive(Debug, Clone)]
pub enum StmtKind {
    Empty,
    Assign { lhs: Expr, rhs: Expr },
    /// Procedure call (or any expression in statement position)
    Expr(Expr),
    Block(Vec<Stmt>),
    If { cond: Expr, then: Box<Stmt>, els: Option<Box<Stmt>> },
    While { cond: Expr, body: Box<Stmt> },
    Repeat { body: Vec<Stmt>, cond: Expr },
    For { var: String, start: Expr, end: Expr, down: bool, body: Box<Stmt> },
    Case { selector: Expr, arms: Vec<CaseArm>, otherwise: Option<Box<Stmt>> },
    /// The field names were expanded into scope at parse time, so only
    /// the body remains
    With { body: Box<Stmt> },
    Write { file: Option<Expr>, args: Vec<WriteArg>, newline: bool },
    Read { file: Option<Expr>, args: Vec<Expr>, newline: bool },
}

/// One declared variable
#[derive(Debug, Clone)]
pub struct VarItem {
    pub name: String,
    pub ty: TypeId,
}

/// A routine definition: prototype, locals, body, nested routines
#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub proto: ProtoRef,
    pub vars: Vec<VarItem>,
    /// `None` for a `forward` declaration
    pub body: Option<Vec<Stmt>>,
    pub subs: Vec<FunctionDecl>,
    /// Variables captured from enclosing scopes, appended to the
    /// prototype by closure conversion
    pub captured: Vec<Param>,
    pub span: Span,
}

impl FunctionDecl {
    /// Visit every expression in the routine, including nested routines
    pub fn walk_exprs_mut(&mut self, f: &mut dyn FnMut(&mut Expr)) {
        if let Some(body) = &mut self.body {
            for s in body {
                s.walk_exprs_mut(f);
            }
        }
        for sub in &mut self.subs {
            sub.walk_exprs_mut(f);
        }
    }
}

/// A top-level item
#[derive(Debug, Clone)]
pub enum Item {
    Vars(Vec<VarItem>),
    Function(FunctionDecl),
}

/// A whole program
#[derive(Debug, Clone)]
pub struct Program {
    pub name: String,
    pub items: Vec<Item>,
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::INTEGER;

    fn int_lit(v: i64) -> Expr {
        Expr::new(ExprKind::IntLit(v), Span::default(), INTEGER)
    }

    #[test]
    fn test_addressability() {
        let var = Expr::new(
            ExprKind::Variable { name: "x".into() },
            Span::default(),
            INTEGER,
        );
        assert!(var.is_addressable());
        assert!(!int_lit(1).is_addressable());
        let deref = Expr::new(
            ExprKind::Deref { base: Box::new(var.clone()) },
            Span::default(),
            INTEGER,
        );
        assert!(deref.is_addressable());
    }

    #[test]
    fn test_walk_visits_call_arguments() {
        let proto = Prototype::new("f", Vec::new(), INTEGER).shared();
        let callee = Expr::new(ExprKind::FuncRef { name: "f".into() }, Span::default(), INTEGER);
        let mut call = Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                args: vec![int_lit(1), int_lit(2)],
                proto,
            },
            Span::default(),
            INTEGER,
        );
        let mut count = 0;
        call.walk_mut(&mut |_| count += 1);
        // The call itself, the callee, and two arguments.
        assert_eq!(count, 4);
    }
}
