//! IR Types
//!
//! Type representations for the SSA IR handed to the backend.

use std::fmt;

/// A virtual register (SSA value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VReg(pub u32);

impl fmt::Display for VReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// A basic block label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// IR types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrType {
    /// Void/unit type
    Void,
    /// Boolean (1 bit)
    Bool,
    /// 8-bit signed integer (also the char representation)
    I8,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 64-bit float
    F64,
    /// Pointer to another type
    Ptr(Box<IrType>),
    /// Array of elements
    Array(Box<IrType>, usize),
    /// Anonymous struct
    Struct(Vec<IrType>),
    /// Reference to a named struct in the module's struct table. Named
    /// structs may start out opaque (body set later), which is what makes
    /// self-referential record types representable.
    Named(String),
    /// Function type: (params) -> ret
    Fn {
        params: Vec<IrType>,
        ret: Box<IrType>,
    },
}

impl IrType {
    pub fn ptr(inner: IrType) -> Self {
        IrType::Ptr(Box::new(inner))
    }

    pub fn array(element: IrType, size: usize) -> Self {
        IrType::Array(Box::new(element), size)
    }

    /// Untyped byte pointer, used for runtime helper arguments
    pub fn void_ptr() -> Self {
        IrType::Ptr(Box::new(IrType::I8))
    }

    /// Is this type a pointer?
    pub fn is_ptr(&self) -> bool {
        matches!(self, IrType::Ptr(_))
    }

    /// Is this type an integer?
    pub fn is_int(&self) -> bool {
        matches!(self, IrType::I8 | IrType::I32 | IrType::I64)
    }

    /// Is this type a float?
    pub fn is_float(&self) -> bool {
        matches!(self, IrType::F64)
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IrType::Void => write!(f, "void"),
            IrType::Bool => write!(f, "i1"),
            IrType::I8 => write!(f, "i8"),
            IrType::I32 => write!(f, "i32"),
            IrType::I64 => write!(f, "i64"),
            IrType::F64 => write!(f, "f64"),
            IrType::Ptr(inner) => write!(f, "*{}", inner),
            IrType::Array(elem, size) => write!(f, "[{} x {}]", size, elem),
            IrType::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
            IrType::Named(name) => write!(f, "%{}", name),
            IrType::Fn { params, ret } => {
                write!(f, "(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
        }
    }
}

/// A named struct definition. `body` is `None` while the struct is still
/// opaque (declared but not yet defined).
#[derive(Debug, Clone)]
pub struct StructDef {
    pub name: String,
    pub body: Option<Vec<IrType>>,
}

impl StructDef {
    pub fn opaque(name: impl Into<String>) -> Self {
        Self { name: name.into(), body: None }
    }

    pub fn is_opaque(&self) -> bool {
        self.body.is_none()
    }
}

/// A module contains functions, globals and named struct definitions
#[derive(Debug, Clone)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub structs: Vec<StructDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            globals: Vec::new(),
            structs: Vec::new(),
        }
    }

    /// Look up a named struct definition
    pub fn struct_def(&self, name: &str) -> Option<&StructDef> {
        self.structs.iter().find(|s| s.name == name)
    }
}

/// A function in the IR
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<(VReg, IrType)>,
    pub ret_type: IrType,
    pub blocks: Vec<BasicBlock>,
    pub is_external: bool,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<(VReg, IrType)>, ret_type: IrType) -> Self {
        Self {
            name: name.into(),
            params,
            ret_type,
            blocks: Vec::new(),
            is_external: false,
        }
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }
}

/// A basic block contains a sequence of instructions
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instructions: Vec<super::Instruction>,
    pub terminator: Option<super::Terminator>,
}

impl BasicBlock {
    pub fn new(id: BlockId) -> Self {
        Self {
            id,
            instructions: Vec::new(),
            terminator: None,
        }
    }
}

/// A global variable or constant. A `None` initializer means
/// zero-initialized.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: IrType,
    pub init: Option<Constant>,
    pub is_const: bool,
}

/// A constant value
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    String(String),
    /// The address of a named function or global (vtable slots)
    Symbol(String),
    Struct(Vec<Constant>),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{}", v),
            Constant::Float(v) => write!(f, "{}", v),
            Constant::Bool(v) => write!(f, "{}", if *v { "true" } else { "false" }),
            Constant::Null => write!(f, "null"),
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Symbol(name) => write!(f, "@{}", name),
            Constant::Struct(fields) => {
                write!(f, "{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Render a whole module as text, for `--emit-ir` and for tests
pub fn print_module(module: &Module) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let _ = writeln!(out, "; module {}", module.name);
    for s in &module.structs {
        match &s.body {
            Some(fields) => {
                let body: Vec<String> = fields.iter().map(|t| t.to_string()).collect();
                let _ = writeln!(out, "%{} = {{ {} }}", s.name, body.join(", "));
            }
            None => {
                let _ = writeln!(out, "%{} = opaque", s.name);
            }
        }
    }
    for g in &module.globals {
        match &g.init {
            Some(init) => {
                let _ = writeln!(out, "@{} : {} = {}", g.name, g.ty, init);
            }
            None => {
                let _ = writeln!(out, "@{} : {} = zeroinit", g.name, g.ty);
            }
        }
    }
    for func in &module.functions {
        if func.is_external {
            let params: Vec<String> = func.params.iter().map(|(_, t)| t.to_string()).collect();
            let _ = writeln!(
                out,
                "declare {}({}) -> {}",
                func.name,
                params.join(", "),
                func.ret_type
            );
            continue;
        }
        let params: Vec<String> = func
            .params
            .iter()
            .map(|(v, t)| format!("{}: {}", v, t))
            .collect();
        let _ = writeln!(out, "fn {}({}) -> {} {{", func.name, params.join(", "), func.ret_type);
        for block in &func.blocks {
            let _ = writeln!(out, "{}:", block.id);
            for instr in &block.instructions {
                let _ = writeln!(out, "  {}", instr);
            }
            if let Some(term) = &block.terminator {
                let _ = writeln!(out, "  {}", term);
            }
        }
        let _ = writeln!(out, "}}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_display() {
        let ty = IrType::ptr(IrType::Named("node".to_string()));
        assert_eq!(ty.to_string(), "*%node");
        let arr = IrType::array(IrType::I32, 8);
        assert_eq!(arr.to_string(), "[8 x i32]");
    }

    #[test]
    fn test_opaque_struct() {
        let s = StructDef::opaque("node");
        assert!(s.is_opaque());
    }
}
