//! AST to IR lowering
//!
//! Walks the typed AST and emits SSA IR through the builder. Lowering
//! should be unreachable after a clean parse; anything that goes wrong
//! here is reported as an internal diagnostic and counted, but does not
//! abort the pass.
//!
//! Two parallel stacks drive the walk: the variable stack maps names to
//! storage (a local slot holding an address, or a global symbol), and
//! the mangle stack maps routine names to their emitted symbols
//! (`Parent.Child` for nested routines, `__PascalMain` for the program
//! body). Both push on routine entry and pop on exit, so nested
//! lowering sees a superset view while the parent remains restorable.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{
    Builtin, CaseArm, Expr, ExprKind, FunctionDecl, Item, Program, SetElem, Stmt, StmtKind,
    WriteArg,
};
use crate::span::Span;
use crate::token::TokenKind;
use crate::types::{self, file_field, TypeId, TypeKind, TypeStore};

use super::builder::IrBuilder;
use super::instr::CmpOp;
use super::runtime;
use super::types::{Constant, IrType, Module, VReg};

/// Lowering diagnostics. These indicate a front-end inconsistency, not
/// a user error.
#[derive(Error, Debug, Clone)]
pub enum LowerError {
    #[error("internal lowering error: {message}")]
    Internal { message: String, span: Span },
}

impl LowerError {
    pub fn span(&self) -> Span {
        match self {
            LowerError::Internal { span, .. } => *span,
        }
    }
}

type LowerResult<T> = Result<T, LowerError>;

/// Where a name lives at runtime
#[derive(Debug, Clone)]
enum Slot {
    /// An address value inside the current function
    Local(VReg),
    /// A module-level symbol; a fresh `GlobalRef` is materialized per
    /// use, since instructions are function-local
    Global(String),
}

/// Lowers a parsed program to an IR module
pub struct Lowerer<'a> {
    builder: IrBuilder,
    types: &'a mut TypeStore,
    vars: Vec<HashMap<String, Slot>>,
    mangles: Vec<HashMap<String, String>>,
    /// Global object variables whose vtable pointer is installed at the
    /// top of `__PascalMain`
    global_vtables: Vec<(String, String)>,
    errors: Vec<LowerError>,
}

impl<'a> Lowerer<'a> {
    pub fn new(module_name: impl Into<String>, types: &'a mut TypeStore) -> Self {
        Self {
            builder: IrBuilder::new(module_name),
            types,
            vars: vec![HashMap::new()],
            mangles: vec![HashMap::new()],
            global_vtables: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn internal(&self, message: impl Into<String>, span: Span) -> LowerError {
        LowerError::Internal { message: message.into(), span }
    }

    /// Lower a whole program. Returns the module, or the internal
    /// diagnostics if any were recorded.
    pub fn lower_program(mut self, program: &Program) -> Result<Module, Vec<LowerError>> {
        runtime::declare(&mut self.builder);

        // Globals first, so every function sees them.
        for item in &program.items {
            if let Item::Vars(vars) = item {
                for v in vars {
                    if let Err(e) = self.lower_global(v.ty, &v.name, program.span) {
                        self.errors.push(e);
                    }
                }
            }
        }

        if let Err(e) = self.emit_vtables(program.span) {
            self.errors.push(e);
        }

        // Register every top-level routine before lowering any, so
        // mutual recursion resolves.
        for item in &program.items {
            if let Item::Function(f) = item {
                let name = f.proto.borrow().name.clone();
                let mangled = mangle("P", &name);
                self.add_mangle(&name, &mangled);
            }
        }
        for item in &program.items {
            if let Item::Function(f) = item {
                if let Err(e) = self.lower_function(f, "P") {
                    self.errors.push(e);
                }
            }
        }

        if let Err(e) = self.types.complete_pending() {
            self.errors
                .push(self.internal(e.to_string(), program.span));
        }
        self.builder.set_structs(self.types.struct_defs().to_vec());

        if self.errors.is_empty() {
            Ok(self.builder.finish())
        } else {
            Err(self.errors)
        }
    }

    fn lower_global(&mut self, ty: TypeId, name: &str, span: Span) -> LowerResult<()> {
        let ir = self
            .types
            .ir_type(ty)
            .map_err(|e| self.internal(e.to_string(), span))?;
        // File globals carry {0, null, sizeof(elem), isText} so the
        // runtime can infer record size and kind from the value alone.
        let init = if let TypeKind::File { element, is_text } = self.types.kind(ty).clone() {
            let rec_size = self
                .types
                .size_of(element)
                .map_err(|e| self.internal(e.to_string(), span))?;
            Some(Constant::Struct(vec![
                Constant::Int(0),
                Constant::Null,
                Constant::Int(rec_size as i64),
                Constant::Bool(is_text),
            ]))
        } else {
            None
        };
        self.builder.add_global(name, ir, init, false);
        self.vars[0].insert(name.to_string(), Slot::Global(name.to_string()));

        if let TypeKind::Object { name: obj_name, .. } = self.types.kind(ty) {
            if self.types.has_vtable(ty) {
                self.global_vtables
                    .push((name.to_string(), format!("vtable_{}", obj_name)));
            }
        }
        Ok(())
    }

    /// Emit one vtable global per object type that dispatches
    /// virtually: a struct of function symbols in slot order, overrides
    /// occupying the base slot.
    fn emit_vtables(&mut self, span: Span) -> LowerResult<()> {
        for i in 0..self.types.type_count() {
            let id = TypeId(i as u32);
            let (obj_name, methods) = match self.types.kind(id) {
                TypeKind::Object { name, methods, .. } => (name.clone(), methods.clone()),
                _ => continue,
            };
            if !self.types.has_vtable(id) {
                continue;
            }
            // Materializing the instance type also defines the vtable
            // struct in the struct table.
            self.types
                .ir_type(id)
                .map_err(|e| self.internal(e.to_string(), span))?;

            let mut slots: Vec<(u32, String)> = methods
                .iter()
                .filter_map(|m| m.virt_index.map(|s| (s, mangle("P", &m.mangled))))
                .collect();
            slots.sort_by_key(|(s, _)| *s);
            let init =
                Constant::Struct(slots.into_iter().map(|(_, sym)| Constant::Symbol(sym)).collect());
            let vt_name = format!("vtable_{}", obj_name);
            self.builder
                .add_global(vt_name.clone(), IrType::Named(vt_name), Some(init), true);
        }
        Ok(())
    }

    // ============ Stacks ============

    fn add_mangle(&mut self, name: &str, actual: &str) {
        let top = self.mangles.last_mut().expect("mangle stack is never empty");
        top.entry(name.to_string()).or_insert_with(|| actual.to_string());
    }

    fn lookup_mangle(&self, name: &str, span: Span) -> LowerResult<String> {
        for scope in self.mangles.iter().rev() {
            if let Some(m) = scope.get(name) {
                return Ok(m.clone());
            }
        }
        Err(self.internal(format!("routine '{}' has no emitted symbol", name), span))
    }

    fn add_var(&mut self, name: &str, slot: Slot) {
        let top = self.vars.last_mut().expect("variable stack is never empty");
        top.insert(name.to_string(), slot);
    }

    fn lookup_var(&self, name: &str) -> Option<Slot> {
        for scope in self.vars.iter().rev() {
            if let Some(slot) = scope.get(name) {
                return Some(slot.clone());
            }
        }
        None
    }

    // ============ Functions ============

    fn lower_function(&mut self, func: &FunctionDecl, prefix: &str) -> LowerResult<()> {
        let (name, params, result) = {
            let p = func.proto.borrow();
            (p.name.clone(), p.params.clone(), p.result)
        };
        let mangled = mangle(prefix, &name);
        self.add_mangle(&name, &mangled);

        // A forward declaration only fixes the symbol; the definition
        // arrives later.
        let body = match &func.body {
            Some(body) => body,
            None => return Ok(()),
        };

        self.mangles.push(HashMap::new());

        // Pre-register nested routines so mutually recursive siblings
        // resolve, then lower them before our own body: the builder
        // constructs one function at a time.
        for sub in &func.subs {
            let sub_name = sub.proto.borrow().name.clone();
            let sub_mangled = mangle(&mangled, &sub_name);
            self.add_mangle(&sub_name, &sub_mangled);
        }
        for sub in &func.subs {
            let r = self.lower_function(sub, &mangled);
            if let Err(e) = r {
                self.errors.push(e);
            }
        }

        // Parameter types: by-ref formals (including closure args)
        // arrive as pointers.
        let mut param_tys = Vec::new();
        for p in &params {
            let ir = self
                .types
                .ir_type(p.ty)
                .map_err(|e| self.internal(e.to_string(), func.span))?;
            param_tys.push(if p.by_ref { IrType::ptr(ir) } else { ir });
        }
        let ret_ir = self
            .types
            .ir_type(result)
            .map_err(|e| self.internal(e.to_string(), func.span))?;

        let param_vregs = self.builder.start_function(&mangled, param_tys, ret_ir.clone());

        self.vars.push(HashMap::new());

        // Bind parameters: a by-value formal gets an entry-block slot
        // with the argument stored in; a by-ref formal's incoming
        // pointer is the slot.
        for (p, vreg) in params.iter().zip(param_vregs) {
            if p.by_ref {
                self.add_var(&p.name, Slot::Local(vreg));
            } else {
                let ir = self
                    .types
                    .ir_type(p.ty)
                    .map_err(|e| self.internal(e.to_string(), func.span))?;
                let slot = self.builder.alloca(ir);
                self.builder.store(slot, vreg);
                self.add_var(&p.name, Slot::Local(slot));
            }
        }

        // The return value lives in a slot named after the routine,
        // loaded on exit.
        if result != types::VOID {
            let slot = self.builder.alloca(ret_ir);
            self.add_var(&name, Slot::Local(slot));
            if let Some(pos) = name.find('$') {
                self.add_var(&name[pos + 1..], Slot::Local(slot));
            }
        }

        for v in &func.vars {
            let ir = self
                .types
                .ir_type(v.ty)
                .map_err(|e| self.internal(e.to_string(), func.span))?;
            let slot = self.builder.alloca(ir);
            self.add_var(&v.name, Slot::Local(slot));
            self.init_vtable_ptr(v.ty, slot);
        }

        if mangled == "__PascalMain" {
            for (global, vtable) in self.global_vtables.clone() {
                let addr = self.builder.global_ref(&global);
                let vt = self.builder.global_ref(&vtable);
                let slot0 = self.builder.get_field_ptr(addr, 0);
                self.builder.store(slot0, vt);
            }
        }

        for stmt in body {
            if let Err(e) = self.lower_stmt(stmt) {
                self.errors.push(e);
            }
        }

        if result == types::VOID {
            self.builder.ret(None);
        } else {
            match self.lookup_var(&name) {
                Some(Slot::Local(slot)) => {
                    let v = self.builder.load(slot);
                    self.builder.ret(Some(v));
                }
                _ => {
                    self.builder.ret(None);
                    self.errors
                        .push(self.internal("missing result slot", func.span));
                }
            }
        }

        self.vars.pop();
        self.mangles.pop();
        Ok(())
    }

    /// Store the class vtable pointer into a freshly allocated object
    fn init_vtable_ptr(&mut self, ty: TypeId, addr: VReg) {
        if let TypeKind::Object { name, .. } = self.types.kind(ty) {
            if self.types.has_vtable(ty) {
                let vt_name = format!("vtable_{}", name);
                let vt = self.builder.global_ref(&vt_name);
                let slot0 = self.builder.get_field_ptr(addr, 0);
                self.builder.store(slot0, vt);
            }
        }
    }

    // ============ Addresses and values ============

    /// The address of an l-value expression
    fn address(&mut self, expr: &Expr) -> LowerResult<VReg> {
        match &expr.kind {
            ExprKind::Variable { name } => match self.lookup_var(name) {
                Some(Slot::Local(v)) => Ok(v),
                Some(Slot::Global(g)) => Ok(self.builder.global_ref(&g)),
                None => Err(self.internal(format!("unknown variable name '{}'", name), expr.span)),
            },
            ExprKind::Index { base, indices, dims } => {
                let base_addr = self.address(base)?;
                // Row-major: subtract each dimension's low bound and
                // scale by the product of the remaining dimensions.
                let mut muls: Vec<i64> = Vec::with_capacity(dims.len());
                let mut m = 1i64;
                for dim in dims.iter().rev() {
                    muls.push(m);
                    m *= self.types.range_size(*dim).unwrap_or(1);
                }
                muls.reverse();

                let mut total: Option<VReg> = None;
                for (i, index) in indices.iter().enumerate() {
                    let mut idx = self.value(index)?;
                    let low = self.types.range_bounds(dims[i]).map(|(l, _)| l).unwrap_or(0);
                    if low != 0 {
                        let low_v = self.builder.const_int(low);
                        idx = self.builder.sub(idx, low_v);
                    }
                    if muls[i] != 1 {
                        let m_v = self.builder.const_int(muls[i]);
                        idx = self.builder.mul(idx, m_v);
                    }
                    total = Some(match total {
                        Some(acc) => self.builder.add(acc, idx),
                        None => idx,
                    });
                }
                let total =
                    total.ok_or_else(|| self.internal("array index missing", expr.span))?;
                Ok(self.builder.get_element_ptr(base_addr, total))
            }
            ExprKind::Field { base, index } => {
                let base_addr = self.address(base)?;
                Ok(self.builder.get_field_ptr(base_addr, *index))
            }
            ExprKind::VariantField { base, index } => {
                // The variant overlay is a max-size blob; view it as
                // the arm being accessed.
                let base_addr = self.address(base)?;
                let p = self.builder.get_field_ptr(base_addr, *index);
                let arm_ir = self
                    .types
                    .ir_type(expr.ty)
                    .map_err(|e| self.internal(e.to_string(), expr.span))?;
                Ok(self.builder.bitcast(p, IrType::ptr(arm_ir)))
            }
            ExprKind::Deref { base } => self.value(base),
            ExprKind::FileBuffer { base } => {
                let f = self.address(base)?;
                let buf_ptr = self.builder.get_field_ptr(f, file_field::BUFFER);
                Ok(self.builder.load(buf_ptr))
            }
            ExprKind::SetLit { elements } => self.lower_set_literal(elements, expr.span),
            _ => Err(self.internal("expression is not addressable", expr.span)),
        }
    }

    /// The value of an expression
    fn value(&mut self, expr: &Expr) -> LowerResult<VReg> {
        match &expr.kind {
            ExprKind::IntLit(v) => Ok(self.builder.const_int(*v)),
            ExprKind::RealLit(v) => Ok(self.builder.const_float(*v)),
            ExprKind::CharLit(v) => Ok(self.builder.const_int(*v as i64)),
            ExprKind::BoolLit(v) => Ok(self.builder.const_bool(*v)),
            ExprKind::Nil => Ok(self.builder.const_null()),
            ExprKind::StrLit(s) => {
                let name = self.builder.add_string_constant(s);
                Ok(self.builder.global_ref(&name))
            }
            ExprKind::Variable { .. }
            | ExprKind::Index { .. }
            | ExprKind::Field { .. }
            | ExprKind::VariantField { .. }
            | ExprKind::Deref { .. }
            | ExprKind::FileBuffer { .. }
            | ExprKind::SetLit { .. } => {
                let addr = self.address(expr)?;
                Ok(self.builder.load(addr))
            }
            ExprKind::FuncRef { name } => {
                let sym = self.lookup_mangle(name, expr.span)?;
                Ok(self.builder.func_ref(sym))
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(op, lhs, rhs, expr.span),
            ExprKind::Unary { op, rhs } => {
                let v = self.value(rhs)?;
                match op {
                    TokenKind::Minus => {
                        if self.types.is_real(rhs.ty) {
                            Ok(self.builder.fneg(v))
                        } else {
                            Ok(self.builder.neg(v))
                        }
                    }
                    TokenKind::Not => Ok(self.builder.not(v)),
                    other => {
                        Err(self.internal(format!("unknown unary operator '{}'", other), expr.span))
                    }
                }
            }
            ExprKind::Call { .. } => match self.lower_call(expr)? {
                Some(v) => Ok(v),
                None => Err(self.internal("procedure call has no value", expr.span)),
            },
            ExprKind::VirtualCall { .. } => match self.lower_virtual_call(expr)? {
                Some(v) => Ok(v),
                None => Err(self.internal("procedure call has no value", expr.span)),
            },
            ExprKind::BuiltinCall { builtin, args } => {
                match self.lower_builtin(*builtin, args, expr.span)? {
                    Some(v) => Ok(v),
                    None => Err(self.internal("builtin has no value", expr.span)),
                }
            }
            ExprKind::SizeOf { target } => {
                let size = self
                    .types
                    .size_of(*target)
                    .map_err(|e| self.internal(e.to_string(), expr.span))?;
                Ok(self.builder.const_int(size as i64))
            }
        }
    }

    // ============ Sets ============

    /// Materialize a set constructor into a zeroed temporary and set
    /// the element bits: bit `x & 31` of word `x >> 5`.
    fn lower_set_literal(&mut self, elements: &[SetElem], _span: Span) -> LowerResult<VReg> {
        let set_addr = self.builder.alloca(runtime::set_type());
        let byte_len = (types::SET_WORDS * 4) as i64;
        let zero = self.builder.const_int(0);
        let len = self.builder.const_int(byte_len);
        self.builder.memset(set_addr, zero, len);

        for elem in elements {
            match elem {
                SetElem::Single(e) => {
                    let v = self.value(e)?;
                    self.set_bit(set_addr, v);
                }
                SetElem::Range(lo, hi) => {
                    // A range becomes a small loop setting each bit.
                    let lo_v = self.value(lo)?;
                    let hi_v = self.value(hi)?;
                    let cur = self.builder.alloca(IrType::I32);
                    self.builder.store(cur, lo_v);

                    let loop_bb = self.builder.create_block();
                    let after_bb = self.builder.create_block();
                    self.builder.br(loop_bb);
                    self.builder.start_block(loop_bb);
                    let x = self.builder.load(cur);
                    self.set_bit(set_addr, x);
                    let one = self.builder.const_int(1);
                    let next = self.builder.add(x, one);
                    self.builder.store(cur, next);
                    let done = self.builder.icmp(CmpOp::Sgt, next, hi_v);
                    self.builder.cond_br(done, after_bb, loop_bb);
                    self.builder.start_block(after_bb);
                }
            }
        }
        Ok(set_addr)
    }

    fn set_bit(&mut self, set_addr: VReg, x: VReg) {
        let five = self.builder.const_int(5);
        let mask = self.builder.const_int(31);
        let index = self.builder.lshr(x, five);
        let offset = self.builder.and(x, mask);
        let one = self.builder.const_int(1);
        let bit = self.builder.shl(one, offset);
        let word_addr = self.builder.get_element_ptr(set_addr, index);
        let word = self.builder.load(word_addr);
        let updated = self.builder.or(word, bit);
        self.builder.store(word_addr, updated);
    }

    /// Address of a set operand: addressable sets give their own
    /// storage, anything else lands in a temporary.
    fn set_operand_addr(&mut self, expr: &Expr) -> LowerResult<VReg> {
        if expr.is_addressable() {
            self.address(expr)
        } else {
            let v = self.value(expr)?;
            let tmp = self.builder.alloca(runtime::set_type());
            self.builder.store(tmp, v);
            Ok(tmp)
        }
    }

    // ============ Binary operators ============

    fn lower_binary(
        &mut self,
        op: &TokenKind,
        lhs: &Expr,
        rhs: &Expr,
        span: Span,
    ) -> LowerResult<VReg> {
        let rhs_is_set = matches!(self.types.kind(rhs.ty), TypeKind::Set { .. });

        if rhs_is_set {
            if *op == TokenKind::In {
                // x in S: load word x >> 5, test bit x & 31.
                let x = self.value(lhs)?;
                let set_addr = self.set_operand_addr(rhs)?;
                let five = self.builder.const_int(5);
                let mask = self.builder.const_int(31);
                let index = self.builder.lshr(x, five);
                let offset = self.builder.and(x, mask);
                let word_addr = self.builder.get_element_ptr(set_addr, index);
                let word = self.builder.load(word_addr);
                let bit = self.builder.lshr(word, offset);
                return Ok(self.builder.trunc(bit, IrType::Bool));
            }

            let l = self.set_operand_addr(lhs)?;
            let r = self.set_operand_addr(rhs)?;
            return match op {
                TokenKind::Plus => Ok(self.builder.call("__SetUnion", vec![l, r])),
                TokenKind::Minus => Ok(self.builder.call("__SetDiff", vec![l, r])),
                TokenKind::Star => Ok(self.builder.call("__SetIntersect", vec![l, r])),
                TokenKind::Equal => Ok(self.builder.call("__SetEqual", vec![l, r])),
                TokenKind::NotEqual => {
                    let eq = self.builder.call("__SetEqual", vec![l, r]);
                    Ok(self.builder.not(eq))
                }
                // a <= b: b contains a. a >= b: a contains b.
                TokenKind::LessOrEqual => Ok(self.builder.call("__SetContains", vec![l, r])),
                TokenKind::GreaterOrEqual => Ok(self.builder.call("__SetContains", vec![r, l])),
                other => Err(self.internal(format!("unknown operator '{}' on set", other), span)),
            };
        }

        let lhs_real = self.types.is_real(lhs.ty);
        let rhs_real = self.types.is_real(rhs.ty);
        let as_float = lhs_real || rhs_real || *op == TokenKind::Slash;

        let mut l = self.value(lhs)?;
        let mut r = self.value(rhs)?;
        if as_float {
            if !lhs_real {
                l = self.builder.sitofp(l, IrType::F64);
            }
            if !rhs_real {
                r = self.builder.sitofp(r, IrType::F64);
            }
            return match op {
                TokenKind::Plus => Ok(self.builder.fadd(l, r)),
                TokenKind::Minus => Ok(self.builder.fsub(l, r)),
                TokenKind::Star => Ok(self.builder.fmul(l, r)),
                TokenKind::Slash => Ok(self.builder.fdiv(l, r)),
                TokenKind::Equal => Ok(self.builder.fcmp(CmpOp::Eq, l, r)),
                TokenKind::NotEqual => Ok(self.builder.fcmp(CmpOp::Ne, l, r)),
                TokenKind::LessThan => Ok(self.builder.fcmp(CmpOp::Slt, l, r)),
                TokenKind::LessOrEqual => Ok(self.builder.fcmp(CmpOp::Sle, l, r)),
                TokenKind::GreaterThan => Ok(self.builder.fcmp(CmpOp::Sgt, l, r)),
                TokenKind::GreaterOrEqual => Ok(self.builder.fcmp(CmpOp::Sge, l, r)),
                other => {
                    Err(self.internal(format!("unknown float operator '{}'", other), span))
                }
            };
        }

        // Boolean comparisons are unsigned; everything else is signed.
        let unsigned = self.types.same_as(lhs.ty, types::BOOL);
        match op {
            TokenKind::Plus => Ok(self.builder.add(l, r)),
            TokenKind::Minus => Ok(self.builder.sub(l, r)),
            TokenKind::Star => Ok(self.builder.mul(l, r)),
            TokenKind::Div => Ok(self.builder.sdiv(l, r)),
            TokenKind::Mod => Ok(self.builder.srem(l, r)),
            TokenKind::Shl => Ok(self.builder.shl(l, r)),
            TokenKind::Shr => Ok(self.builder.lshr(l, r)),
            TokenKind::Xor => Ok(self.builder.xor(l, r)),
            TokenKind::And => Ok(self.builder.and(l, r)),
            TokenKind::Or => Ok(self.builder.or(l, r)),
            TokenKind::Equal => Ok(self.builder.icmp(CmpOp::Eq, l, r)),
            TokenKind::NotEqual => Ok(self.builder.icmp(CmpOp::Ne, l, r)),
            TokenKind::LessThan => {
                Ok(self.builder.icmp(if unsigned { CmpOp::Ult } else { CmpOp::Slt }, l, r))
            }
            TokenKind::LessOrEqual => {
                Ok(self.builder.icmp(if unsigned { CmpOp::Ule } else { CmpOp::Sle }, l, r))
            }
            TokenKind::GreaterThan => {
                Ok(self.builder.icmp(if unsigned { CmpOp::Ugt } else { CmpOp::Sgt }, l, r))
            }
            TokenKind::GreaterOrEqual => {
                Ok(self.builder.icmp(if unsigned { CmpOp::Uge } else { CmpOp::Sge }, l, r))
            }
            other => Err(self.internal(format!("unknown operator '{}'", other), span)),
        }
    }

    // ============ Calls ============

    fn lower_call(&mut self, expr: &Expr) -> LowerResult<Option<VReg>> {
        let (callee, args, proto) = match &expr.kind {
            ExprKind::Call { callee, args, proto } => (callee, args, proto),
            _ => return Err(self.internal("not a call", expr.span)),
        };
        let (params, result, name) = {
            let p = proto.borrow();
            (p.params.clone(), p.result, p.name.clone())
        };
        if params.len() != args.len() {
            return Err(self.internal(
                format!("incorrect number of arguments for '{}'", name),
                expr.span,
            ));
        }

        let mut arg_vs = Vec::with_capacity(args.len());
        for (formal, actual) in params.iter().zip(args.iter()) {
            // By-reference formals (and closure args) take addresses.
            let v = if formal.by_ref {
                self.address(actual)?
            } else {
                let mut v = self.value(actual)?;
                if self.types.is_real(formal.ty) && self.types.is_integral(actual.ty) {
                    v = self.builder.sitofp(v, IrType::F64);
                }
                v
            };
            arg_vs.push(v);
        }

        match &callee.kind {
            ExprKind::FuncRef { name } => {
                let sym = self.lookup_mangle(name, expr.span)?;
                if result == types::VOID {
                    self.builder.call_void(sym, arg_vs);
                    Ok(None)
                } else {
                    Ok(Some(self.builder.call(sym, arg_vs)))
                }
            }
            // Calling through a routine-pointer variable.
            _ => {
                let fp = self.value(callee)?;
                if result == types::VOID {
                    self.builder.call_ptr_void(fp, arg_vs);
                    Ok(None)
                } else {
                    Ok(Some(self.builder.call_ptr(fp, arg_vs)))
                }
            }
        }
    }

    /// Load the object's vtable pointer, index the method slot, and
    /// call through it with the object's address first.
    fn lower_virtual_call(&mut self, expr: &Expr) -> LowerResult<Option<VReg>> {
        let (object, slot, args, proto) = match &expr.kind {
            ExprKind::VirtualCall { object, slot, args, proto } => (object, slot, args, proto),
            _ => return Err(self.internal("not a virtual call", expr.span)),
        };
        let (params, result) = {
            let p = proto.borrow();
            (p.params.clone(), p.result)
        };

        let obj_addr = self.address(object)?;
        let vt_slot = self.builder.get_field_ptr(obj_addr, 0);
        let vt = self.builder.load(vt_slot);
        let fn_slot = self.builder.get_field_ptr(vt, *slot);
        let fp = self.builder.load(fn_slot);

        let mut arg_vs = vec![obj_addr];
        // Formals after the implicit receiver.
        for (formal, actual) in params.iter().skip(1).zip(args.iter()) {
            let v = if formal.by_ref {
                self.address(actual)?
            } else {
                let mut v = self.value(actual)?;
                if self.types.is_real(formal.ty) && self.types.is_integral(actual.ty) {
                    v = self.builder.sitofp(v, IrType::F64);
                }
                v
            };
            arg_vs.push(v);
        }

        if result == types::VOID {
            self.builder.call_ptr_void(fp, arg_vs);
            Ok(None)
        } else {
            Ok(Some(self.builder.call_ptr(fp, arg_vs)))
        }
    }

    fn lower_builtin(
        &mut self,
        builtin: Builtin,
        args: &[Expr],
        span: Span,
    ) -> LowerResult<Option<VReg>> {
        let arg = args
            .first()
            .ok_or_else(|| self.internal("builtin without argument", span))?;
        match builtin {
            Builtin::New => {
                let addr = self.address(arg)?;
                let pointee = self
                    .types
                    .element_type(arg.ty)
                    .ok_or_else(|| self.internal("new needs a typed pointer", span))?;
                let ir = self
                    .types
                    .ir_type(pointee)
                    .map_err(|e| self.internal(e.to_string(), span))?;
                let mem = self.builder.malloc(ir);
                self.builder.store(addr, mem);
                self.init_vtable_ptr(pointee, mem);
                Ok(None)
            }
            Builtin::Dispose => {
                let v = self.value(arg)?;
                self.builder.free(v);
                Ok(None)
            }
            Builtin::Ord => {
                let v = self.value(arg)?;
                if self.types.same_as(arg.ty, types::CHAR)
                    || self.types.same_as(arg.ty, types::BOOL)
                {
                    Ok(Some(self.builder.zext(v, IrType::I32)))
                } else {
                    Ok(Some(v))
                }
            }
            Builtin::Chr => {
                let v = self.value(arg)?;
                Ok(Some(self.builder.trunc(v, IrType::I8)))
            }
            Builtin::Succ => {
                let v = self.value(arg)?;
                let one = self.builder.const_int(1);
                Ok(Some(self.builder.add(v, one)))
            }
            Builtin::Pred => {
                let v = self.value(arg)?;
                let one = self.builder.const_int(1);
                Ok(Some(self.builder.sub(v, one)))
            }
            Builtin::Abs => {
                let v = self.value(arg)?;
                if self.types.is_real(arg.ty) {
                    let zero = self.builder.const_float(0.0);
                    let negated = self.builder.fneg(v);
                    let is_neg = self.builder.fcmp(CmpOp::Slt, v, zero);
                    Ok(Some(self.builder.select(is_neg, negated, v)))
                } else {
                    let zero = self.builder.const_int(0);
                    let negated = self.builder.neg(v);
                    let is_neg = self.builder.icmp(CmpOp::Slt, v, zero);
                    Ok(Some(self.builder.select(is_neg, negated, v)))
                }
            }
            Builtin::Sqr => {
                let v = self.value(arg)?;
                if self.types.is_real(arg.ty) {
                    Ok(Some(self.builder.fmul(v, v)))
                } else {
                    Ok(Some(self.builder.mul(v, v)))
                }
            }
            Builtin::Odd => {
                let v = self.value(arg)?;
                let one = self.builder.const_int(1);
                let low = self.builder.and(v, one);
                Ok(Some(self.builder.trunc(low, IrType::Bool)))
            }
            Builtin::Trunc => {
                let v = self.value(arg)?;
                Ok(Some(self.builder.fptosi(v, IrType::I32)))
            }
            Builtin::Round => {
                let v = self.value(arg)?;
                let half = self.builder.const_float(0.5);
                let adjusted = self.builder.fadd(v, half);
                Ok(Some(self.builder.fptosi(adjusted, IrType::I32)))
            }
        }
    }

    // ============ Statements ============

    fn lower_stmt(&mut self, stmt: &Stmt) -> LowerResult<()> {
        match &stmt.kind {
            StmtKind::Empty => Ok(()),
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.lower_stmt(s)?;
                }
                Ok(())
            }
            StmtKind::Assign { lhs, rhs } => self.lower_assign(lhs, rhs, stmt.span),
            StmtKind::Expr(e) => {
                match &e.kind {
                    ExprKind::Call { .. } => {
                        self.lower_call(e)?;
                    }
                    ExprKind::VirtualCall { .. } => {
                        self.lower_virtual_call(e)?;
                    }
                    ExprKind::BuiltinCall { builtin, args } => {
                        self.lower_builtin(*builtin, args, e.span)?;
                    }
                    _ => {
                        self.value(e)?;
                    }
                }
                Ok(())
            }
            StmtKind::If { cond, then, els } => self.lower_if(cond, then, els.as_deref()),
            StmtKind::While { cond, body } => self.lower_while(cond, body),
            StmtKind::Repeat { body, cond } => self.lower_repeat(body, cond),
            StmtKind::For { var, start, end, down, body } => {
                self.lower_for(var, start, end, *down, body, stmt.span)
            }
            StmtKind::Case { selector, arms, otherwise } => {
                self.lower_case(selector, arms, otherwise.as_deref())
            }
            StmtKind::With { body } => self.lower_stmt(body),
            StmtKind::Write { file, args, newline } => {
                self.lower_write(file.as_ref(), args, *newline, stmt.span)
            }
            StmtKind::Read { file, args, newline } => {
                self.lower_read(file.as_ref(), args, *newline, stmt.span)
            }
        }
    }

    fn lower_assign(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> LowerResult<()> {
        if matches!(self.types.kind(lhs.ty), TypeKind::Str { .. }) {
            return self.lower_string_assign(lhs, rhs, span);
        }
        let mut v = self.value(rhs)?;
        if self.types.is_real(lhs.ty) && self.types.is_integral(rhs.ty) {
            v = self.builder.sitofp(v, IrType::F64);
        }
        let dest = self.address(lhs)?;
        self.builder.store(dest, v);
        Ok(())
    }

    /// String assignment: a char stores length 1 plus the byte, a
    /// literal or string expression copies `min(len, capacity)` bytes
    /// and sets the length byte.
    fn lower_string_assign(&mut self, lhs: &Expr, rhs: &Expr, span: Span) -> LowerResult<()> {
        let capacity = match self.types.kind(lhs.ty) {
            TypeKind::Str { capacity } => *capacity as i64,
            _ => return Err(self.internal("string assignment to non-string", span)),
        };
        let dest = self.address(lhs)?;
        let zero = self.builder.const_int(0);
        let one = self.builder.const_int(1);
        let len_ptr = self.builder.get_element_ptr(dest, zero);
        let data_ptr = self.builder.get_element_ptr(dest, one);

        match (&rhs.kind, self.types.kind(rhs.ty).clone()) {
            (_, TypeKind::Char) => {
                let len = self.builder.const_int(1);
                self.builder.store(len_ptr, len);
                let v = self.value(rhs)?;
                self.builder.store(data_ptr, v);
                Ok(())
            }
            (ExprKind::StrLit(s), _) => {
                let n = (s.len() as i64).min(capacity);
                let len = self.builder.const_int(n);
                self.builder.store(len_ptr, len);
                let src = self.value(rhs)?;
                let n_v = self.builder.const_int(n);
                self.memcpy_bytes(data_ptr, src, n_v);
                Ok(())
            }
            (_, TypeKind::Str { capacity: src_cap }) => {
                // Copy the length byte and the data in one move.
                let src = self.address(rhs)?;
                let n = capacity.min(src_cap as i64) + 1;
                let n_v = self.builder.const_int(n);
                self.memcpy_bytes(dest, src, n_v);
                Ok(())
            }
            (_, TypeKind::Array { element, dims })
                if dims.len() == 1 && self.types.same_as(element, types::CHAR) =>
            {
                let n = self
                    .types
                    .range_size(dims[0])
                    .unwrap_or(0)
                    .min(capacity);
                let len = self.builder.const_int(n);
                self.builder.store(len_ptr, len);
                let src = self.address(rhs)?;
                let n_v = self.builder.const_int(n);
                self.memcpy_bytes(data_ptr, src, n_v);
                Ok(())
            }
            _ => Err(self.internal("unsupported string assignment", span)),
        }
    }

    fn memcpy_bytes(&mut self, dst: VReg, src: VReg, len: VReg) {
        let dst = self.builder.bitcast(dst, IrType::void_ptr());
        let src = self.builder.bitcast(src, IrType::void_ptr());
        let align = self.builder.const_int(1);
        let volatile = self.builder.const_bool(false);
        self.builder
            .call_void(runtime::MEMCPY, vec![dst, src, len, align, volatile]);
    }

    fn lower_if(&mut self, cond: &Expr, then: &Stmt, els: Option<&Stmt>) -> LowerResult<()> {
        let c = self.value(cond)?;
        let then_bb = self.builder.create_block();
        let merge_bb = self.builder.create_block();
        let else_bb = if els.is_some() { self.builder.create_block() } else { merge_bb };

        self.builder.cond_br(c, then_bb, else_bb);
        self.builder.start_block(then_bb);
        self.lower_stmt(then)?;
        self.builder.br(merge_bb);

        if let Some(els) = els {
            self.builder.start_block(else_bb);
            self.lower_stmt(els)?;
            self.builder.br(merge_bb);
        }
        self.builder.start_block(merge_bb);
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &Stmt) -> LowerResult<()> {
        let pre_bb = self.builder.create_block();
        let body_bb = self.builder.create_block();
        let after_bb = self.builder.create_block();

        self.builder.br(pre_bb);
        self.builder.start_block(pre_bb);
        let c = self.value(cond)?;
        self.builder.cond_br(c, body_bb, after_bb);

        self.builder.start_block(body_bb);
        self.lower_stmt(body)?;
        self.builder.br(pre_bb);

        self.builder.start_block(after_bb);
        Ok(())
    }

    fn lower_repeat(&mut self, body: &[Stmt], cond: &Expr) -> LowerResult<()> {
        let body_bb = self.builder.create_block();
        let after_bb = self.builder.create_block();

        self.builder.br(body_bb);
        self.builder.start_block(body_bb);
        for s in body {
            self.lower_stmt(s)?;
        }
        let c = self.value(cond)?;
        self.builder.cond_br(c, after_bb, body_bb);

        self.builder.start_block(after_bb);
        Ok(())
    }

    /// `for` reads the iteration variable's address once, stores the
    /// start value, tests, and re-tests after each increment. The
    /// variable's value after the loop is unspecified.
    fn lower_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        down: bool,
        body: &Stmt,
        span: Span,
    ) -> LowerResult<()> {
        let var_addr = match self.lookup_var(var) {
            Some(Slot::Local(v)) => v,
            Some(Slot::Global(g)) => self.builder.global_ref(&g),
            None => {
                return Err(self.internal(format!("unknown loop variable '{}'", var), span))
            }
        };

        let start_v = self.value(start)?;
        self.builder.store(var_addr, start_v);

        let loop_bb = self.builder.create_block();
        let after_bb = self.builder.create_block();

        let end_v = self.value(end)?;
        let cmp_op = if down { CmpOp::Sge } else { CmpOp::Sle };
        let cur = self.builder.load(var_addr);
        let enter = self.builder.icmp(cmp_op, cur, end_v);
        self.builder.cond_br(enter, loop_bb, after_bb);

        self.builder.start_block(loop_bb);
        self.lower_stmt(body)?;
        let cur = self.builder.load(var_addr);
        let step = self.builder.const_int(if down { -1 } else { 1 });
        let next = self.builder.add(cur, step);
        self.builder.store(var_addr, next);
        let again = self.builder.icmp(cmp_op, next, end_v);
        self.builder.cond_br(again, loop_bb, after_bb);

        self.builder.start_block(after_bb);
        Ok(())
    }

    fn lower_case(
        &mut self,
        selector: &Expr,
        arms: &[CaseArm],
        otherwise: Option<&Stmt>,
    ) -> LowerResult<()> {
        let v = self.value(selector)?;
        let after_bb = self.builder.create_block();
        let default_bb = if otherwise.is_some() {
            self.builder.create_block()
        } else {
            after_bb
        };

        let arm_blocks: Vec<_> = arms.iter().map(|_| self.builder.create_block()).collect();
        let mut cases = Vec::new();
        for (arm, bb) in arms.iter().zip(&arm_blocks) {
            for label in &arm.labels {
                cases.push((Constant::Int(*label), *bb));
            }
        }
        self.builder.switch(v, default_bb, cases);

        for (arm, bb) in arms.iter().zip(&arm_blocks) {
            self.builder.start_block(*bb);
            self.lower_stmt(&arm.body)?;
            self.builder.br(after_bb);
        }
        if let Some(otherwise) = otherwise {
            self.builder.start_block(default_bb);
            self.lower_stmt(otherwise)?;
            self.builder.br(after_bb);
        }
        self.builder.start_block(after_bb);
        Ok(())
    }

    // ============ Write / read ============

    fn file_addr(&mut self, file: Option<&Expr>, default: &str) -> LowerResult<VReg> {
        match file {
            Some(e) => self.address(e),
            None => Ok(self.builder.global_ref(default)),
        }
    }

    fn file_is_text(&self, file: Option<&Expr>) -> bool {
        match file {
            Some(e) => matches!(self.types.kind(e.ty), TypeKind::File { is_text: true, .. }),
            None => true,
        }
    }

    fn lower_write(
        &mut self,
        file: Option<&Expr>,
        args: &[WriteArg],
        newline: bool,
        span: Span,
    ) -> LowerResult<()> {
        let f = self.file_addr(file, "output")?;
        let is_text = self.file_is_text(file);

        for arg in args {
            if !is_text {
                // Untyped record I/O straight from the variable.
                let p = self.address(&arg.expr)?;
                let p = self.builder.bitcast(p, IrType::void_ptr());
                self.builder.call_void("__write_bin", vec![f, p]);
                continue;
            }

            let ty = arg.expr.ty;
            let kind = self.types.kind(ty).clone();
            match kind {
                TypeKind::Real => {
                    let v = self.value(&arg.expr)?;
                    let w = self.width_or(arg.width.as_ref(), 15)?;
                    let p = match &arg.precision {
                        Some(e) => self.value(e)?,
                        None => self.builder.const_int(-1),
                    };
                    self.builder.call_void("__write_real", vec![f, v, w, p]);
                }
                TypeKind::Char => {
                    let v = self.value(&arg.expr)?;
                    let w = self.width_or(arg.width.as_ref(), 0)?;
                    self.builder.call_void("__write_char", vec![f, v, w]);
                }
                TypeKind::Bool => {
                    let v = self.value(&arg.expr)?;
                    let w = self.width_or(arg.width.as_ref(), 0)?;
                    self.builder.call_void("__write_bool", vec![f, v, w]);
                }
                TypeKind::Array { element, dims }
                    if dims.len() == 1 && self.types.same_as(element, types::CHAR) =>
                {
                    let p = if let ExprKind::StrLit(_) = &arg.expr.kind {
                        self.value(&arg.expr)?
                    } else {
                        let addr = self.address(&arg.expr)?;
                        self.builder.bitcast(addr, IrType::void_ptr())
                    };
                    let w = self.width_or(arg.width.as_ref(), 0)?;
                    self.builder.call_void("__write_str", vec![f, p, w]);
                }
                _ if self.types.is_integral(ty) => {
                    let v = self.value(&arg.expr)?;
                    let w = self.width_or(arg.width.as_ref(), 13)?;
                    self.builder.call_void("__write_int", vec![f, v, w]);
                }
                _ => {
                    return Err(self.internal(
                        format!("cannot write a value of type {}", self.types.describe(ty)),
                        span,
                    ));
                }
            }
        }

        if newline {
            if !is_text {
                return Err(self.internal("writeln on a binary file", span));
            }
            self.builder.call_void("__write_nl", vec![f]);
        }
        Ok(())
    }

    fn width_or(&mut self, width: Option<&Expr>, default: i64) -> LowerResult<VReg> {
        match width {
            Some(e) => self.value(e),
            None => Ok(self.builder.const_int(default)),
        }
    }

    fn lower_read(
        &mut self,
        file: Option<&Expr>,
        args: &[Expr],
        newline: bool,
        span: Span,
    ) -> LowerResult<()> {
        let f = self.file_addr(file, "input")?;
        let is_text = self.file_is_text(file);

        for arg in args {
            let addr = self.address(arg)?;
            if !is_text {
                let p = self.builder.bitcast(addr, IrType::void_ptr());
                self.builder.call_void("__read_bin", vec![f, p]);
                continue;
            }
            let helper = match self.types.kind(arg.ty) {
                TypeKind::Char => "__read_chr",
                TypeKind::Real => "__read_real",
                _ if self.types.is_integral(arg.ty) => "__read_int",
                _ => {
                    return Err(self.internal(
                        format!(
                            "cannot read a value of type {}",
                            self.types.describe(arg.ty)
                        ),
                        span,
                    ));
                }
            };
            self.builder.call_void(helper, vec![f, addr]);
        }

        if newline {
            if !is_text {
                return Err(self.internal("readln on a binary file", span));
            }
            self.builder.call_void("__read_nl", vec![f]);
        }
        Ok(())
    }
}

/// Mangle a routine name: the enclosing routine chain dotted before the
/// routine's own name. The program body keeps its unmangled C-callable
/// name.
fn mangle(prefix: &str, name: &str) -> String {
    if name == "__PascalMain" {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::print_module;
    use crate::parser;

    fn lower_ok(source: &str) -> Module {
        let (program, mut types, errors) = parser::parse(source);
        assert!(errors.is_empty(), "parse errors: {:?}", errors);
        let lowerer = Lowerer::new("test", &mut types);
        match lowerer.lower_program(&program) {
            Ok(module) => module,
            Err(errors) => panic!("lowering errors: {:?}", errors),
        }
    }

    fn defined_names(module: &Module) -> Vec<&str> {
        module
            .functions
            .iter()
            .filter(|f| !f.is_external)
            .map(|f| f.name.as_str())
            .collect()
    }

    fn function<'m>(module: &'m Module, name: &str) -> &'m crate::ir::Function {
        module
            .functions
            .iter()
            .find(|f| f.name == name)
            .unwrap_or_else(|| panic!("function {} not emitted", name))
    }

    #[test]
    fn test_symbol_set_matches_declared_routines() {
        let module = lower_ok(
            "program p;
             var i: integer;
             procedure hello;
             begin writeln(1) end;
             function twice(n: integer): integer;
             begin twice := n * 2 end;
             begin i := twice(3); hello end.",
        );
        let mut names = defined_names(&module);
        names.sort_unstable();
        assert_eq!(names, vec!["P.hello", "P.twice", "__PascalMain"]);
    }

    #[test]
    fn test_arithmetic_program_emits_main() {
        let module = lower_ok(
            "program p; var i: integer; begin i := 1 + 2 * 3; writeln(i) end.",
        );
        let main = function(&module, "__PascalMain");
        let text = print_module(&module);
        assert!(!main.blocks.is_empty());
        // Default integer write width is 13.
        assert!(text.contains("__write_int"));
        assert!(text.contains("__write_nl"));
    }

    #[test]
    fn test_globals_are_zero_initialized() {
        let module = lower_ok("program p; var i: integer; begin i := 0 end.");
        let g = module.globals.iter().find(|g| g.name == "i").unwrap();
        assert!(g.init.is_none());
        assert_eq!(g.ty, IrType::I32);
    }

    #[test]
    fn test_file_global_initializer() {
        let module = lower_ok("program p; begin end.");
        let output = module.globals.iter().find(|g| g.name == "output").unwrap();
        match &output.init {
            Some(Constant::Struct(fields)) => {
                assert_eq!(fields[0], Constant::Int(0));
                assert_eq!(fields[1], Constant::Null);
                assert_eq!(fields[2], Constant::Int(1)); // sizeof(char)
                assert_eq!(fields[3], Constant::Bool(true));
            }
            other => panic!("expected struct initializer, got {:?}", other),
        }
    }

    #[test]
    fn test_self_referential_pointer_lowers() {
        let module = lower_ok(
            "program p;
             type pnode = ^node;
                  node = record value: integer; next: pnode end;
             var head: pnode;
             begin new(head); head^.value := 1; head^.next := nil end.",
        );
        // The record's struct body was completed after fixup.
        let node = module
            .structs
            .iter()
            .find(|s| s.name == "node")
            .expect("node struct emitted");
        assert!(!node.is_opaque());
        let text = print_module(&module);
        assert!(text.contains("malloc"));
    }

    #[test]
    fn test_nested_function_mangling() {
        let module = lower_ok(
            "program p;
             procedure outer;
             var k: integer;
               procedure inner;
               begin k := k + 1 end;
             begin k := 0; inner; writeln(k) end;
             begin outer end.",
        );
        let mut names = defined_names(&module);
        names.sort_unstable();
        assert_eq!(names, vec!["P.outer", "P.outer.inner", "__PascalMain"]);
        // inner takes the captured k by reference.
        let inner = function(&module, "P.outer.inner");
        assert_eq!(inner.params.len(), 1);
        assert!(inner.params[0].1.is_ptr());
    }

    #[test]
    fn test_set_operations_use_runtime_helpers() {
        let module = lower_ok(
            "program p;
             type color = (red, green, blue);
             var s, t: set of color;
             begin
               s := [red, blue];
               t := s + [green];
               if s = t then writeln(1);
               if green in s then writeln(1) else writeln(0)
             end.",
        );
        let text = print_module(&module);
        assert!(text.contains("__SetUnion"));
        assert!(text.contains("__SetEqual"));
        // Membership is an inline shift-and-mask, not a call.
        assert!(!text.contains("__SetIn"));
        assert!(text.contains("lshr"));
    }

    #[test]
    fn test_case_lowers_to_switch() {
        let module = lower_ok(
            "program p; var i: integer;
             begin
               case i of
                 1: writeln(1);
                 2, 3: writeln(2);
                 otherwise writeln(0)
               end
             end.",
        );
        let text = print_module(&module);
        assert!(text.contains("switch"));
        assert!(text.contains("2: bb"));
        assert!(text.contains("3: bb"));
    }

    #[test]
    fn test_for_loop_shape() {
        let module = lower_ok(
            "program p; var i: integer;
             begin for i := 1 to 10 do write(i) end.",
        );
        let main = function(&module, "__PascalMain");
        // Entry, loop, after.
        assert!(main.blocks.len() >= 3);
        let text = print_module(&module);
        assert!(text.contains("icmp sle"));
    }

    #[test]
    fn test_downto_uses_sge() {
        let module = lower_ok(
            "program p; var i: integer;
             begin for i := 5 downto 5 do write(i) end.",
        );
        let text = print_module(&module);
        assert!(text.contains("icmp sge"));
    }

    #[test]
    fn test_virtual_call_goes_through_vtable() {
        let module = lower_ok(
            "program p;
             type shape = object
                    procedure draw; virtual;
                  end;
                  circle = object(shape)
                    procedure draw; override;
                  end;
             procedure shape.draw;
             begin writeln(1) end;
             procedure circle.draw;
             begin writeln(2) end;
             var c: circle;
             begin c.draw end.",
        );
        // Both vtables exist, pointing at the right implementations.
        let shape_vt = module.globals.iter().find(|g| g.name == "vtable_shape").unwrap();
        let circle_vt = module.globals.iter().find(|g| g.name == "vtable_circle").unwrap();
        assert_eq!(
            shape_vt.init,
            Some(Constant::Struct(vec![Constant::Symbol("P.shape$draw".into())]))
        );
        assert_eq!(
            circle_vt.init,
            Some(Constant::Struct(vec![Constant::Symbol("P.circle$draw".into())]))
        );
        // The call site loads the vtable and calls indirectly.
        let text = print_module(&module);
        assert!(text.contains("callptr"));
        // The global object's vtable pointer is installed in main.
        assert!(text.contains("globalref @vtable_circle"));
    }

    #[test]
    fn test_member_functions_are_emitted_with_mangled_names() {
        let module = lower_ok(
            "program p;
             type counter = object
                    n: integer;
                    procedure bump;
                  end;
             procedure counter.bump;
             begin n := n + 1 end;
             var c: counter;
             begin c.bump; writeln(c.n) end.",
        );
        let names = defined_names(&module);
        assert!(names.contains(&"P.counter$bump"));
        // Static dispatch: a direct call, no vtable global.
        assert!(module.globals.iter().all(|g| !g.name.starts_with("vtable_")));
        let text = print_module(&module);
        assert!(text.contains("call P.counter$bump"));
    }

    #[test]
    fn test_string_assignment_copies_and_sets_length() {
        let module = lower_ok(
            "program p; var s: string[10]; c: char;
             begin s := 'hello'; c := 'x'; s := c end.",
        );
        let text = print_module(&module);
        assert!(text.contains(runtime::MEMCPY));
    }

    #[test]
    fn test_lowering_is_deterministic() {
        let source = "program p;
             var i: integer;
             function fib(n: integer): integer;
             begin
               if n < 2 then fib := n
               else fib := fib(n - 1) + fib(n - 2)
             end;
             begin for i := 1 to 10 do writeln(fib(i)) end.";
        let first = {
            let (program, mut types, _) = parser::parse(source);
            let module = Lowerer::new("test", &mut types).lower_program(&program).unwrap();
            print_module(&module)
        };
        let second = {
            let (program, mut types, _) = parser::parse(source);
            let module = Lowerer::new("test", &mut types).lower_program(&program).unwrap();
            print_module(&module)
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_by_ref_parameter_passes_address() {
        let module = lower_ok(
            "program p;
             var n: integer;
             procedure bump(var x: integer);
             begin x := x + 1 end;
             begin n := 0; bump(n) end.",
        );
        let bump = function(&module, "P.bump");
        assert_eq!(bump.params.len(), 1);
        assert!(bump.params[0].1.is_ptr());
        // The call site passes the global's address, not a load.
        let text = print_module(&module);
        assert!(text.contains("call P.bump"));
    }

    #[test]
    fn test_array_indexing_subtracts_low_bound() {
        let module = lower_ok(
            "program p;
             var a: array[5..10] of integer;
             begin a[7] := 1 end.",
        );
        let text = print_module(&module);
        // 7 - 5 happens before the element GEP.
        assert!(text.contains("sub"));
        assert!(text.contains("getelementptr"));
    }

    #[test]
    fn test_multi_dim_indexing_accumulates_strides() {
        let module = lower_ok(
            "program p;
             var m: array[1..3, 1..4] of integer;
             begin m[2, 3] := 7 end.",
        );
        let text = print_module(&module);
        // Row stride of 4 scales the first index.
        assert!(text.contains("const 4"));
        assert!(text.contains("mul"));
    }

    #[test]
    fn test_division_promotes_to_float() {
        let module = lower_ok(
            "program p; var r: real;
             begin r := 7 / 2 end.",
        );
        let text = print_module(&module);
        assert!(text.contains("sitofp"));
        assert!(text.contains("fdiv"));
    }

    #[test]
    fn test_read_dispatches_by_type() {
        let module = lower_ok(
            "program p; var i: integer; c: char; r: real;
             begin readln(i, c, r) end.",
        );
        let text = print_module(&module);
        assert!(text.contains("__read_int"));
        assert!(text.contains("__read_chr"));
        assert!(text.contains("__read_real"));
        assert!(text.contains("__read_nl"));
    }

    #[test]
    fn test_binary_file_io() {
        let module = lower_ok(
            "program p;
             type rec = record a, b: integer end;
             var f: file of rec; r: rec;
             begin write(f, r); read(f, r) end.",
        );
        let text = print_module(&module);
        assert!(text.contains("__write_bin"));
        assert!(text.contains("__read_bin"));
    }

    #[test]
    fn test_with_block_addresses_fields() {
        let module = lower_ok(
            "program p;
             type point = record x, y: integer end;
             var pt: point;
             begin with pt do begin x := 1; y := 2 end end.",
        );
        let text = print_module(&module);
        assert!(text.contains("getfieldptr"));
    }

    #[test]
    fn test_sizeof_folds_to_constant() {
        let module = lower_ok(
            "program p; var i: integer;
             begin i := sizeof(integer) end.",
        );
        let text = print_module(&module);
        assert!(text.contains("const 4"));
    }
}
