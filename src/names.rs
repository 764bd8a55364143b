//! Name environment
//!
//! A stack of lexical scopes mapping identifiers to named objects. Scope
//! lifetime follows the parser's traversal: a scope is pushed on entering
//! a routine, `with` block or similar construct, and popped on exit,
//! dropping all of its entries at once.

use std::collections::HashMap;

use crate::ast::{Expr, ProtoRef};
use crate::consteval::ConstValue;
use crate::types::TypeId;

/// An entry in the name environment
#[derive(Debug, Clone)]
pub enum NamedObject {
    /// A type name
    TypeDef { ty: TypeId },
    /// A named constant
    ConstDef { value: ConstValue },
    /// A variable
    VarDef { ty: TypeId },
    /// A function or procedure
    FuncDef { ty: TypeId, proto: ProtoRef },
    /// A value of an enumerated type
    EnumDef { ty: TypeId, value: i64 },
    /// A record field imported by a `with` block, bound to a prebuilt
    /// field-access expression rooted at the subject variable
    WithDef { ty: TypeId, access: Expr },
}

/// Stack of scopes. Index 0 is the global scope.
pub struct NameStack {
    scopes: Vec<HashMap<String, NamedObject>>,
}

impl NameStack {
    pub fn new() -> Self {
        Self { scopes: vec![HashMap::new()] }
    }

    /// Number of scopes currently on the stack
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    pub fn pop_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "cannot pop the global scope");
        self.scopes.pop();
    }

    /// Add a name to the innermost scope. Returns false if the name is
    /// already declared there.
    pub fn add(&mut self, name: impl Into<String>, obj: NamedObject) -> bool {
        let name = name.into();
        let top = self.scopes.last_mut().expect("at least the global scope");
        if top.contains_key(&name) {
            return false;
        }
        top.insert(name, obj);
        true
    }

    /// Replace or insert a name in the innermost scope unconditionally.
    /// `with` expansion uses this: duplicate field names across several
    /// subjects follow last-writer-wins within the pushed scope.
    pub fn insert(&mut self, name: impl Into<String>, obj: NamedObject) {
        let top = self.scopes.last_mut().expect("at least the global scope");
        top.insert(name.into(), obj);
    }

    /// Find a name, searching innermost scope first
    pub fn find(&self, name: &str) -> Option<&NamedObject> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// Find a name along with the index of the scope it is declared in
    /// (0 = global)
    pub fn find_with_level(&self, name: &str) -> Option<(usize, &NamedObject)> {
        for (level, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(obj) = scope.get(name) {
                return Some((level, obj));
            }
        }
        None
    }

    /// Look only in the innermost scope
    pub fn find_top_level(&self, name: &str) -> Option<&NamedObject> {
        self.scopes.last().and_then(|scope| scope.get(name))
    }
}

impl Default for NameStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{INTEGER, REAL};

    #[test]
    fn test_add_and_find() {
        let mut names = NameStack::new();
        assert!(names.add("x", NamedObject::VarDef { ty: INTEGER }));
        assert!(!names.add("x", NamedObject::VarDef { ty: INTEGER }));
        assert!(matches!(names.find("x"), Some(NamedObject::VarDef { .. })));
        assert!(names.find("y").is_none());
    }

    #[test]
    fn test_inner_scope_shadows_outer() {
        let mut names = NameStack::new();
        names.add("x", NamedObject::VarDef { ty: INTEGER });
        names.push_scope();
        names.add("x", NamedObject::VarDef { ty: REAL });
        match names.find("x") {
            Some(NamedObject::VarDef { ty }) => assert_eq!(*ty, REAL),
            other => panic!("unexpected {:?}", other),
        }
        names.pop_scope();
        match names.find("x") {
            Some(NamedObject::VarDef { ty }) => assert_eq!(*ty, INTEGER),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scope_pop_drops_entries() {
        let mut names = NameStack::new();
        names.push_scope();
        names.add("temp", NamedObject::VarDef { ty: INTEGER });
        names.pop_scope();
        assert!(names.find("temp").is_none());
    }

    #[test]
    fn test_find_with_level() {
        let mut names = NameStack::new();
        names.add("g", NamedObject::VarDef { ty: INTEGER });
        names.push_scope();
        names.add("l", NamedObject::VarDef { ty: INTEGER });
        assert_eq!(names.find_with_level("g").map(|(l, _)| l), Some(0));
        assert_eq!(names.find_with_level("l").map(|(l, _)| l), Some(1));
    }

    #[test]
    fn test_find_top_level_ignores_outer() {
        let mut names = NameStack::new();
        names.add("x", NamedObject::VarDef { ty: INTEGER });
        names.push_scope();
        assert!(names.find_top_level("x").is_none());
        assert!(names.find("x").is_some());
    }

    #[test]
    fn test_insert_overwrites() {
        let mut names = NameStack::new();
        names.insert("f", NamedObject::VarDef { ty: INTEGER });
        names.insert("f", NamedObject::VarDef { ty: REAL });
        match names.find("f") {
            Some(NamedObject::VarDef { ty }) => assert_eq!(*ty, REAL),
            other => panic!("unexpected {:?}", other),
        }
    }
}
