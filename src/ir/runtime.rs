//! Runtime interface
//!
//! The lowered code leans on a small C runtime for set arithmetic,
//! formatted text I/O and binary record I/O. This module declares those
//! external symbols on the builder before lowering starts. The names
//! and signatures are ABI: they must agree with the runtime library.

use super::builder::IrBuilder;
use super::types::IrType;
use crate::types::SET_WORDS;

/// The in-memory set representation: a fixed array of 32-bit words
pub fn set_type() -> IrType {
    IrType::array(IrType::I32, SET_WORDS)
}

/// The symbol used for string assignment. Kept as the memcpy intrinsic
/// name for compatibility with the existing runtime and backend.
pub const MEMCPY: &str = "llvm.memcpy.p0i8.p0i8.i32";

/// Declare every runtime helper the lowerer may call
pub fn declare(builder: &mut IrBuilder) {
    let file_ptr = IrType::void_ptr();
    let set_ptr = IrType::ptr(set_type());
    let int = IrType::I32;
    let void = IrType::Void;

    // Set arithmetic: binary operations return the result set by value,
    // relations return a boolean.
    for name in ["__SetUnion", "__SetDiff", "__SetIntersect"] {
        builder.declare_external(name, vec![set_ptr.clone(), set_ptr.clone()], set_type());
    }
    for name in ["__SetEqual", "__SetContains"] {
        builder.declare_external(name, vec![set_ptr.clone(), set_ptr.clone()], IrType::Bool);
    }

    // Formatted write: (file*, value, width [, precision]).
    builder.declare_external(
        "__write_int",
        vec![file_ptr.clone(), int.clone(), int.clone()],
        void.clone(),
    );
    builder.declare_external(
        "__write_real",
        vec![file_ptr.clone(), IrType::F64, int.clone(), int.clone()],
        void.clone(),
    );
    builder.declare_external(
        "__write_char",
        vec![file_ptr.clone(), IrType::I8, int.clone()],
        void.clone(),
    );
    builder.declare_external(
        "__write_bool",
        vec![file_ptr.clone(), IrType::Bool, int.clone()],
        void.clone(),
    );
    builder.declare_external(
        "__write_str",
        vec![file_ptr.clone(), IrType::void_ptr(), int.clone()],
        void.clone(),
    );
    builder.declare_external("__write_nl", vec![file_ptr.clone()], void.clone());

    // Formatted read: (file*, destination pointer).
    builder.declare_external(
        "__read_int",
        vec![file_ptr.clone(), IrType::ptr(int.clone())],
        void.clone(),
    );
    builder.declare_external(
        "__read_real",
        vec![file_ptr.clone(), IrType::ptr(IrType::F64)],
        void.clone(),
    );
    builder.declare_external(
        "__read_chr",
        vec![file_ptr.clone(), IrType::ptr(IrType::I8)],
        void.clone(),
    );
    builder.declare_external("__read_nl", vec![file_ptr.clone()], void.clone());

    // Untyped record I/O for `file of T`. The runtime takes the record
    // size from the file struct.
    builder.declare_external(
        "__write_bin",
        vec![file_ptr.clone(), IrType::void_ptr()],
        void.clone(),
    );
    builder.declare_external(
        "__read_bin",
        vec![file_ptr.clone(), IrType::void_ptr()],
        void.clone(),
    );

    // String assignment copies through the memcpy intrinsic:
    // (dst, src, len, align, volatile).
    builder.declare_external(
        MEMCPY,
        vec![
            IrType::void_ptr(),
            IrType::void_ptr(),
            int.clone(),
            int,
            IrType::Bool,
        ],
        void,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_helpers_are_declared() {
        let mut builder = IrBuilder::new("test");
        declare(&mut builder);
        let module = builder.finish();
        for name in [
            "__SetUnion",
            "__SetDiff",
            "__SetIntersect",
            "__SetEqual",
            "__SetContains",
            "__write_int",
            "__write_real",
            "__write_char",
            "__write_bool",
            "__write_str",
            "__write_nl",
            "__read_int",
            "__read_real",
            "__read_chr",
            "__read_nl",
            "__write_bin",
            "__read_bin",
            MEMCPY,
        ] {
            assert!(
                module.functions.iter().any(|f| f.name == name && f.is_external),
                "missing runtime declaration: {}",
                name
            );
        }
    }

    #[test]
    fn test_set_type_width() {
        match set_type() {
            IrType::Array(elem, n) => {
                assert_eq!(*elem, IrType::I32);
                assert_eq!(n, SET_WORDS);
            }
            other => panic!("unexpected set type {:?}", other),
        }
    }
}
