//! IR Builder
//!
//! Helper for constructing IR instructions and basic blocks. The
//! builder is append-only: one function is under construction at a
//! time, instructions go into the current block, and terminators close
//! blocks.

use super::instr::{CmpOp, Instruction, InstrKind, Terminator};
use super::types::{BasicBlock, BlockId, Constant, Function, Global, IrType, Module, VReg};

/// Builder for constructing IR
pub struct IrBuilder {
    /// Next virtual register ID
    next_vreg: u32,
    /// Next block ID
    next_block: u32,
    /// Next string constant ID
    next_string: u32,
    /// Current module being built
    module: Module,
    /// Current function being built
    current_fn: Option<Function>,
    /// Current block being built
    current_block: Option<BasicBlock>,
}

impl IrBuilder {
    /// Create a new IR builder
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            next_vreg: 0,
            next_block: 0,
            next_string: 0,
            module: Module::new(module_name),
            current_fn: None,
            current_block: None,
        }
    }

    /// Finish building and return the module
    pub fn finish(mut self) -> Module {
        self.finish_function();
        self.module
    }

    /// Create a fresh virtual register
    pub fn fresh_vreg(&mut self) -> VReg {
        let vreg = VReg(self.next_vreg);
        self.next_vreg += 1;
        vreg
    }

    /// Create a fresh block ID
    pub fn fresh_block(&mut self) -> BlockId {
        let id = BlockId(self.next_block);
        self.next_block += 1;
        id
    }

    // ============ Function Building ============

    /// Start building a new function, returning the parameter registers
    pub fn start_function(
        &mut self,
        name: impl Into<String>,
        params: Vec<IrType>,
        ret_type: IrType,
    ) -> Vec<VReg> {
        self.finish_function();

        let param_vregs: Vec<(VReg, IrType)> =
            params.into_iter().map(|ty| (self.fresh_vreg(), ty)).collect();
        let vregs: Vec<VReg> = param_vregs.iter().map(|(v, _)| *v).collect();

        self.current_fn = Some(Function::new(name, param_vregs, ret_type));

        let entry = self.fresh_block();
        self.current_block = Some(BasicBlock::new(entry));

        vregs
    }

    /// Finish the current function
    pub fn finish_function(&mut self) {
        if let Some(block) = self.current_block.take() {
            if let Some(ref mut func) = self.current_fn {
                func.blocks.push(block);
            }
        }
        if let Some(func) = self.current_fn.take() {
            self.module.functions.push(func);
        }
    }

    /// Declare an external function
    pub fn declare_external(
        &mut self,
        name: impl Into<String>,
        params: Vec<IrType>,
        ret_type: IrType,
    ) {
        let name = name.into();
        if self.module.functions.iter().any(|f| f.name == name) {
            return;
        }
        let mut func = Function::new(name, Vec::new(), ret_type);
        func.is_external = true;
        func.params = params.into_iter().map(|ty| (VReg(0), ty)).collect();
        self.module.functions.push(func);
    }

    // ============ Globals and named structs ============

    /// Add a global string constant and return its name
    pub fn add_string_constant(&mut self, value: &str) -> String {
        let name = format!(".str.{}", self.next_string);
        self.next_string += 1;

        self.module.globals.push(Global {
            name: name.clone(),
            ty: IrType::Array(Box::new(IrType::I8), value.len() + 1), // +1 for NUL
            init: Some(Constant::String(value.to_string())),
            is_const: true,
        });

        name
    }

    /// Add a global variable to the module
    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: IrType,
        init: Option<Constant>,
        is_const: bool,
    ) {
        self.module.globals.push(Global { name: name.into(), ty, init, is_const });
    }

    /// Get a reference (pointer) to a global
    pub fn global_ref(&mut self, name: &str) -> VReg {
        self.emit_with_result(InstrKind::GlobalRef(name.to_string()))
    }

    /// Install the named struct table (from the type registry)
    pub fn set_structs(&mut self, structs: Vec<super::types::StructDef>) {
        self.module.structs = structs;
    }

    // ============ Block Building ============

    /// Create a new block and return its ID
    pub fn create_block(&mut self) -> BlockId {
        self.fresh_block()
    }

    /// Start building a block (finishes the current block first)
    pub fn start_block(&mut self, id: BlockId) {
        if let Some(block) = self.current_block.take() {
            if let Some(ref mut func) = self.current_fn {
                func.blocks.push(block);
            }
        }
        self.current_block = Some(BasicBlock::new(id));
    }

    /// Get the current block ID
    pub fn current_block_id(&self) -> Option<BlockId> {
        self.current_block.as_ref().map(|b| b.id)
    }

    // ============ Instruction Emission ============

    fn emit(&mut self, result: Option<VReg>, kind: InstrKind) -> Option<VReg> {
        if let Some(ref mut block) = self.current_block {
            block.instructions.push(Instruction::new(result, kind));
        }
        result
    }

    fn emit_with_result(&mut self, kind: InstrKind) -> VReg {
        let result = self.fresh_vreg();
        self.emit(Some(result), kind);
        result
    }

    // ============ Constants ============

    /// Emit an integer constant
    pub fn const_int(&mut self, value: i64) -> VReg {
        self.emit_with_result(InstrKind::Const(Constant::Int(value)))
    }

    /// Emit a float constant
    pub fn const_float(&mut self, value: f64) -> VReg {
        self.emit_with_result(InstrKind::Const(Constant::Float(value)))
    }

    /// Emit a boolean constant
    pub fn const_bool(&mut self, value: bool) -> VReg {
        self.emit_with_result(InstrKind::Const(Constant::Bool(value)))
    }

    /// Emit a null pointer constant
    pub fn const_null(&mut self) -> VReg {
        self.emit_with_result(InstrKind::Const(Constant::Null))
    }

    // ============ Arithmetic ============

    pub fn add(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Add(a, b))
    }

    pub fn sub(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Sub(a, b))
    }

    pub fn mul(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Mul(a, b))
    }

    pub fn sdiv(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::SDiv(a, b))
    }

    pub fn srem(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::SRem(a, b))
    }

    pub fn neg(&mut self, v: VReg) -> VReg {
        self.emit_with_result(InstrKind::Neg(v))
    }

    pub fn fadd(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::FAdd(a, b))
    }

    pub fn fsub(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::FSub(a, b))
    }

    pub fn fmul(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::FMul(a, b))
    }

    pub fn fdiv(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::FDiv(a, b))
    }

    pub fn fneg(&mut self, v: VReg) -> VReg {
        self.emit_with_result(InstrKind::FNeg(v))
    }

    // ============ Bitwise ============

    pub fn and(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::And(a, b))
    }

    pub fn or(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Or(a, b))
    }

    pub fn xor(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Xor(a, b))
    }

    pub fn shl(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::Shl(a, b))
    }

    pub fn lshr(&mut self, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::LShr(a, b))
    }

    pub fn not(&mut self, v: VReg) -> VReg {
        self.emit_with_result(InstrKind::Not(v))
    }

    // ============ Comparison ============

    pub fn icmp(&mut self, op: CmpOp, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::ICmp(op, a, b))
    }

    pub fn fcmp(&mut self, op: CmpOp, a: VReg, b: VReg) -> VReg {
        self.emit_with_result(InstrKind::FCmp(op, a, b))
    }

    // ============ Conversions ============

    pub fn sext(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::SExt(v, ty))
    }

    pub fn zext(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::ZExt(v, ty))
    }

    pub fn trunc(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Trunc(v, ty))
    }

    pub fn bitcast(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Bitcast(v, ty))
    }

    /// Signed integer to floating point
    pub fn sitofp(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::SIToFP(v, ty))
    }

    /// Floating point to signed integer
    pub fn fptosi(&mut self, v: VReg, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::FPToSI(v, ty))
    }

    // ============ Memory ============

    pub fn alloca(&mut self, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Alloca(ty))
    }

    /// Allocate memory on the heap (malloc)
    pub fn malloc(&mut self, ty: IrType) -> VReg {
        self.emit_with_result(InstrKind::Malloc(ty))
    }

    /// Free heap memory
    pub fn free(&mut self, ptr: VReg) {
        self.emit(None, InstrKind::Free(ptr));
    }

    /// Copy memory from src to dst (memcpy)
    pub fn memcpy(&mut self, dst: VReg, src: VReg, len: VReg) {
        self.emit(None, InstrKind::Memcpy(dst, src, len));
    }

    /// Set memory to a value (memset)
    pub fn memset(&mut self, dst: VReg, val: VReg, len: VReg) {
        self.emit(None, InstrKind::Memset(dst, val, len));
    }

    pub fn load(&mut self, ptr: VReg) -> VReg {
        self.emit_with_result(InstrKind::Load(ptr))
    }

    pub fn store(&mut self, ptr: VReg, value: VReg) {
        self.emit(None, InstrKind::Store(ptr, value));
    }

    pub fn get_field_ptr(&mut self, ptr: VReg, field_idx: u32) -> VReg {
        self.emit_with_result(InstrKind::GetFieldPtr(ptr, field_idx))
    }

    pub fn get_element_ptr(&mut self, ptr: VReg, index: VReg) -> VReg {
        self.emit_with_result(InstrKind::GetElementPtr(ptr, index))
    }

    // ============ Calls ============

    pub fn call(&mut self, func: impl Into<String>, args: Vec<VReg>) -> VReg {
        self.emit_with_result(InstrKind::Call { func: func.into(), args })
    }

    pub fn call_void(&mut self, func: impl Into<String>, args: Vec<VReg>) {
        self.emit(None, InstrKind::Call { func: func.into(), args });
    }

    /// Get a function pointer
    pub fn func_ref(&mut self, name: impl Into<String>) -> VReg {
        self.emit_with_result(InstrKind::FuncRef(name.into()))
    }

    /// Call through a function pointer
    pub fn call_ptr(&mut self, ptr: VReg, args: Vec<VReg>) -> VReg {
        self.emit_with_result(InstrKind::CallPtr { ptr, args })
    }

    /// Call through a function pointer, discarding any result
    pub fn call_ptr_void(&mut self, ptr: VReg, args: Vec<VReg>) {
        self.emit(None, InstrKind::CallPtr { ptr, args });
    }

    // ============ Misc ============

    pub fn select(&mut self, cond: VReg, then_val: VReg, else_val: VReg) -> VReg {
        self.emit_with_result(InstrKind::Select(cond, then_val, else_val))
    }

    // ============ Terminators ============

    pub fn ret(&mut self, value: Option<VReg>) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Ret(value));
        }
    }

    pub fn br(&mut self, target: BlockId) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Br(target));
        }
    }

    pub fn cond_br(&mut self, cond: VReg, then_block: BlockId, else_block: BlockId) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::CondBr { cond, then_block, else_block });
        }
    }

    pub fn switch(&mut self, value: VReg, default: BlockId, cases: Vec<(Constant, BlockId)>) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Switch { value, default, cases });
        }
    }

    pub fn unreachable(&mut self) {
        if let Some(ref mut block) = self.current_block {
            block.terminator = Some(Terminator::Unreachable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_simple_function() {
        let mut b = IrBuilder::new("test");
        b.start_function("f", vec![IrType::I32], IrType::I32);
        let one = b.const_int(1);
        let two = b.const_int(2);
        let sum = b.add(one, two);
        b.ret(Some(sum));
        let module = b.finish();
        assert_eq!(module.functions.len(), 1);
        let f = &module.functions[0];
        assert_eq!(f.name, "f");
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.blocks[0].instructions.len(), 3);
        assert!(matches!(f.blocks[0].terminator, Some(Terminator::Ret(Some(_)))));
    }

    #[test]
    fn test_external_declaration_is_deduplicated() {
        let mut b = IrBuilder::new("test");
        b.declare_external("puts", vec![IrType::void_ptr()], IrType::I32);
        b.declare_external("puts", vec![IrType::void_ptr()], IrType::I32);
        let module = b.finish();
        assert_eq!(module.functions.len(), 1);
        assert!(module.functions[0].is_external);
    }

    #[test]
    fn test_string_constants_get_unique_names() {
        let mut b = IrBuilder::new("test");
        let a = b.add_string_constant("hello");
        let c = b.add_string_constant("world");
        assert_ne!(a, c);
        let module = b.finish();
        assert_eq!(module.globals.len(), 2);
    }

    #[test]
    fn test_switch_terminator() {
        let mut b = IrBuilder::new("test");
        b.start_function("f", vec![], IrType::Void);
        let v = b.const_int(1);
        let after = b.create_block();
        let case1 = b.create_block();
        b.switch(v, after, vec![(Constant::Int(1), case1)]);
        b.start_block(case1);
        b.br(after);
        b.start_block(after);
        b.ret(None);
        let module = b.finish();
        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 3);
        assert!(matches!(
            f.blocks[0].terminator,
            Some(Terminator::Switch { .. })
        ));
    }
}
