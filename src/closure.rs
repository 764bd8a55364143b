//! Closure conversion for nested routines
//!
//! Pascal's nested procedures may reference variables of enclosing
//! routines. Rather than building heap-allocated activation frames, the
//! parser rewrites each nested routine at the close of its definition:
//! every used-but-not-declared variable becomes an extra by-reference
//! parameter, and call sites pass the variable explicitly.
//!
//! Conversion runs bottom-up. A routine's capture set merges the
//! variables its own body referenced with the capture sets of its nested
//! routines, minus its own locals and parameters, minus globals. Call
//! sites parsed before the prototype grew (recursive calls inside the
//! routine itself) are fixed by a mutating walk that matches calls by
//! prototype identity and arity.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ast::{Expr, ExprKind, FunctionDecl, Param};
use crate::names::{NamedObject, NameStack};
use crate::span::Span;
use crate::types::TypeId;

/// Compute the used-but-not-declared set for a routine.
///
/// `used` is the map of variable references recorded while parsing the
/// routine's body (nested routines excluded; their contribution arrives
/// through `subs[i].captured`). `fn_scope` is the index of the routine's
/// own scope in `names`: anything declared at that level or deeper is
/// local, anything at level 0 is global, and everything in between is
/// captured. The result is name-ordered, so prototypes gain their extra
/// parameters deterministically.
pub fn compute_captures(
    used: &BTreeMap<String, TypeId>,
    subs: &[FunctionDecl],
    names: &NameStack,
    fn_scope: usize,
) -> Vec<Param> {
    let mut nonlocal: BTreeMap<String, TypeId> = used.clone();
    for sub in subs {
        for p in &sub.captured {
            nonlocal.insert(p.name.clone(), p.ty);
        }
    }

    let mut captured = Vec::new();
    for (name, ty) in nonlocal {
        match names.find_with_level(&name) {
            Some((level, NamedObject::VarDef { .. })) if level > 0 && level < fn_scope => {
                captured.push(Param::closure(name, ty));
            }
            _ => {}
        }
    }
    captured
}

/// Append the captured variables to the routine's prototype and rewrite
/// every call site already parsed inside the routine (its body and its
/// nested routines) to pass them.
pub fn convert(func: &mut FunctionDecl, captured: Vec<Param>) {
    if captured.is_empty() {
        func.captured = Vec::new();
        return;
    }

    {
        let mut proto = func.proto.borrow_mut();
        proto.params.extend(captured.iter().cloned());
    }
    func.captured = captured.clone();

    let proto = func.proto.clone();
    let expected = proto.borrow().params.len();
    func.walk_exprs_mut(&mut |expr: &mut Expr| {
        if let ExprKind::Call { proto: call_proto, args, .. } = &mut expr.kind {
            if Rc::ptr_eq(call_proto, &proto) && args.len() != expected {
                for p in &captured {
                    args.push(Expr::new(
                        ExprKind::Variable { name: p.name.clone() },
                        Span::default(),
                        p.ty,
                    ));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Prototype, Stmt, StmtKind};
    use crate::types::INTEGER;

    fn call_to(proto: &crate::ast::ProtoRef, args: Vec<Expr>) -> Expr {
        let callee = Expr::new(
            ExprKind::FuncRef { name: proto.borrow().name.clone() },
            Span::default(),
            INTEGER,
        );
        Expr::new(
            ExprKind::Call { callee: Box::new(callee), args, proto: proto.clone() },
            Span::default(),
            crate::types::VOID,
        )
    }

    #[test]
    fn test_captures_exclude_locals_and_globals() {
        let mut names = NameStack::new();
        names.add("g", NamedObject::VarDef { ty: INTEGER }); // global (level 0)
        names.push_scope(); // outer routine (level 1)
        names.add("k", NamedObject::VarDef { ty: INTEGER });
        names.push_scope(); // inner routine (level 2)
        names.add("local", NamedObject::VarDef { ty: INTEGER });

        let mut used = BTreeMap::new();
        used.insert("g".to_string(), INTEGER);
        used.insert("k".to_string(), INTEGER);
        used.insert("local".to_string(), INTEGER);

        let captured = compute_captures(&used, &[], &names, 2);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].name, "k");
        assert!(captured[0].by_ref);
        assert!(captured[0].is_closure);
    }

    #[test]
    fn test_sub_captures_propagate() {
        let mut names = NameStack::new();
        names.push_scope(); // grandparent (level 1)
        names.add("k", NamedObject::VarDef { ty: INTEGER });
        names.push_scope(); // parent routine under conversion (level 2)

        let sub = FunctionDecl {
            proto: Prototype::new("inner", Vec::new(), crate::types::VOID).shared(),
            vars: Vec::new(),
            body: Some(Vec::new()),
            subs: Vec::new(),
            captured: vec![Param::closure("k", INTEGER)],
            span: Span::default(),
        };

        let captured = compute_captures(&BTreeMap::new(), &[sub], &names, 2);
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].name, "k");
    }

    #[test]
    fn test_convert_extends_prototype_and_call_sites() {
        let proto = Prototype::new("inner", Vec::new(), crate::types::VOID).shared();
        let recursive_call = call_to(&proto, Vec::new());
        let mut func = FunctionDecl {
            proto: proto.clone(),
            vars: Vec::new(),
            body: Some(vec![Stmt::new(StmtKind::Expr(recursive_call), Span::default())]),
            subs: Vec::new(),
            captured: Vec::new(),
            span: Span::default(),
        };

        convert(&mut func, vec![Param::closure("k", INTEGER)]);

        assert_eq!(proto.borrow().params.len(), 1);
        assert!(proto.borrow().params[0].is_closure);
        // The recursive call gained the captured argument.
        match &func.body.as_ref().unwrap()[0].kind {
            StmtKind::Expr(Expr { kind: ExprKind::Call { args, .. }, .. }) => {
                assert_eq!(args.len(), 1);
                assert!(matches!(
                    &args[0].kind,
                    ExprKind::Variable { name } if name == "k"
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_convert_without_captures_is_a_noop() {
        let proto = Prototype::new("leaf", Vec::new(), crate::types::VOID).shared();
        let mut func = FunctionDecl {
            proto: proto.clone(),
            vars: Vec::new(),
            body: Some(Vec::new()),
            subs: Vec::new(),
            captured: Vec::new(),
            span: Span::default(),
        };
        convert(&mut func, Vec::new());
        assert!(proto.borrow().params.is_empty());
    }
}
