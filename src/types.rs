//! Type registry for the Pascal dialect
//!
//! All types live in an arena owned by [`TypeStore`] and are referenced by
//! stable [`TypeId`] handles. This sidesteps ownership questions for the
//! cyclic shapes Pascal produces (self-referential records through
//! pointers, base-object chains, forward-declared pointees): a cycle is
//! just two ids pointing at each other.
//!
//! The registry owns three related jobs:
//!
//! - the structural relations `same_as`, `compatible` and `assignable`,
//! - forward-pointer bookkeeping and fixup at the end of a type block,
//! - lazy materialization of IR types, including the two-phase
//!   "reserve a named struct, then define its body" protocol that makes
//!   recursive records representable.

use std::collections::HashMap;

use thiserror::Error;

use crate::ast::{Param, ProtoRef};
use crate::ir::{IrType, StructDef};

/// Largest number of ordinals a set type can cover
pub const MAX_SET_SIZE: i64 = 256;
/// Number of 32-bit words in a set's bitmap
pub const SET_WORDS: usize = (MAX_SET_SIZE as usize) / 32;

/// Field indices of the file struct `{handle, buffer, recordSize, isText}`.
/// The runtime depends on this layout.
pub mod file_field {
    pub const HANDLE: u32 = 0;
    pub const BUFFER: u32 = 1;
    pub const RECORD_SIZE: u32 = 2;
    pub const IS_TEXT: u32 = 3;
}

/// A handle into the type arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u32);

// Pre-interned primitives, in the order `TypeStore::new` creates them.
pub const INTEGER: TypeId = TypeId(0);
pub const INT64: TypeId = TypeId(1);
pub const REAL: TypeId = TypeId(2);
pub const CHAR: TypeId = TypeId(3);
pub const BOOL: TypeId = TypeId(4);
pub const VOID: TypeId = TypeId(5);
pub const TEXT: TypeId = TypeId(6);
/// The type of `nil`: a pointer with a void pointee, assignable and
/// comparable to any pointer type.
pub const NIL: TypeId = TypeId(7);

/// One value of an enumerated type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumValue {
    pub name: String,
    pub value: i64,
}

/// A named field of a record, object or variant arm. Variant arms that
/// group several fields use an anonymous nested record with `name == ""`.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub ty: TypeId,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self { name: name.into(), ty }
    }
}

/// A member function attached to an object type
#[derive(Debug, Clone)]
pub struct MemberFunc {
    pub proto: ProtoRef,
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_override: bool,
    /// Slot in the vtable, if the method dispatches virtually
    pub virt_index: Option<u32>,
    /// Externally visible symbol: `ObjectName$method`
    pub mangled: String,
}

/// The pointee of a pointer type. `Forward` holds the not-yet-declared
/// type name until the enclosing type block resolves it.
#[derive(Debug, Clone)]
pub enum Pointee {
    Resolved(TypeId),
    Forward(String),
}

/// The closed lattice of type shapes
#[derive(Debug, Clone)]
pub enum TypeKind {
    Integer,
    Int64,
    Real,
    Char,
    Bool,
    Void,
    Enum { values: Vec<EnumValue> },
    Subrange { base: TypeId, low: i64, high: i64 },
    Pointer { pointee: Pointee },
    Array { element: TypeId, dims: Vec<TypeId> },
    Record { fields: Vec<Field>, variant: Option<TypeId> },
    Variant { arms: Vec<Field> },
    Object {
        name: String,
        fields: Vec<Field>,
        methods: Vec<MemberFunc>,
        variant: Option<TypeId>,
        base: Option<TypeId>,
    },
    Set { element: TypeId },
    File { element: TypeId, is_text: bool },
    Str { capacity: u32 },
    Function { proto: ProtoRef },
    FuncPtr { proto: ProtoRef },
}

/// A type in the arena, with its lazily materialized IR type
#[derive(Debug, Clone)]
struct TypeDecl {
    kind: TypeKind,
    ir: Option<IrType>,
}

/// Errors detected by the registry
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TypeError {
    #[error("invalid range specification {0}..{1}")]
    InvalidRange(i64, i64),

    #[error("set type too large: {0} elements, the maximum is {MAX_SET_SIZE}")]
    SetTooLarge(i64),

    #[error("set element range {0}..{1} outside 0..{}", MAX_SET_SIZE - 1)]
    SetOutOfRange(i64, i64),

    #[error("'{0}' overrides a method that is not virtual in the base object")]
    OverrideNonVirtual(String),

    #[error("forward declared pointer type not declared: {0}")]
    UnresolvedPointer(String),

    #[error("internal type error: {0}")]
    Internal(String),
}

/// The arena of all types in a compilation
pub struct TypeStore {
    decls: Vec<TypeDecl>,
    /// Named IR struct table, shared with the emitted module
    structs: Vec<StructDef>,
    struct_index: HashMap<String, usize>,
    /// Forward pointers awaiting fixup at the end of the type block
    incomplete: Vec<TypeId>,
    /// Record/object types whose named struct body is still unset
    pending_bodies: Vec<TypeId>,
    next_anon: u32,
}

impl TypeStore {
    pub fn new() -> Self {
        let mut store = Self {
            decls: Vec::new(),
            structs: Vec::new(),
            struct_index: HashMap::new(),
            incomplete: Vec::new(),
            pending_bodies: Vec::new(),
            next_anon: 0,
        };
        // Order must match the pre-interned TypeId constants.
        store.push(TypeKind::Integer);
        store.push(TypeKind::Int64);
        store.push(TypeKind::Real);
        store.push(TypeKind::Char);
        store.push(TypeKind::Bool);
        store.push(TypeKind::Void);
        store.push(TypeKind::File { element: CHAR, is_text: true });
        store.push(TypeKind::Pointer { pointee: Pointee::Resolved(VOID) });
        store
    }

    fn push(&mut self, kind: TypeKind) -> TypeId {
        let id = TypeId(self.decls.len() as u32);
        self.decls.push(TypeDecl { kind, ir: None });
        id
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.decls[id.0 as usize].kind
    }

    pub fn contains(&self, id: TypeId) -> bool {
        (id.0 as usize) < self.decls.len()
    }

    /// Number of types in the arena; ids are dense in `0..type_count()`
    pub fn type_count(&self) -> usize {
        self.decls.len()
    }

    // ============ Constructors ============

    pub fn enum_decl(&mut self, names: Vec<String>) -> TypeId {
        let values = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| EnumValue { name, value: i as i64 })
            .collect();
        self.push(TypeKind::Enum { values })
    }

    pub fn subrange(&mut self, base: TypeId, low: i64, high: i64) -> Result<TypeId, TypeError> {
        if high < low {
            return Err(TypeError::InvalidRange(low, high));
        }
        Ok(self.push(TypeKind::Subrange { base, low, high }))
    }

    pub fn pointer_to(&mut self, pointee: TypeId) -> TypeId {
        self.push(TypeKind::Pointer { pointee: Pointee::Resolved(pointee) })
    }

    /// Pointer to a type that has not been declared yet. The id is
    /// remembered for fixup at the end of the type block.
    pub fn pointer_forward(&mut self, name: impl Into<String>) -> TypeId {
        let id = self.push(TypeKind::Pointer { pointee: Pointee::Forward(name.into()) });
        self.incomplete.push(id);
        id
    }

    pub fn array(&mut self, element: TypeId, dims: Vec<TypeId>) -> TypeId {
        self.push(TypeKind::Array { element, dims })
    }

    pub fn record(&mut self, fields: Vec<Field>, variant: Option<TypeId>) -> TypeId {
        self.push(TypeKind::Record { fields, variant })
    }

    pub fn variant(&mut self, arms: Vec<Field>) -> TypeId {
        self.push(TypeKind::Variant { arms })
    }

    pub fn set_of(&mut self, element: TypeId) -> Result<TypeId, TypeError> {
        if let Some((low, high)) = self.range_bounds(element) {
            let size = high - low + 1;
            if size > MAX_SET_SIZE {
                return Err(TypeError::SetTooLarge(size));
            }
            // Bits are indexed by raw ordinal, so the whole range must
            // fit inside the fixed bitmap.
            if low < 0 || high >= MAX_SET_SIZE {
                return Err(TypeError::SetOutOfRange(low, high));
            }
        }
        Ok(self.push(TypeKind::Set { element }))
    }

    /// Set type for a `[...]` constructor. No range validation happens
    /// here: the literal's elements carry their own ordinal bounds, and
    /// compatibility with declared set types goes by element base kind.
    pub fn set_literal(&mut self, element: TypeId) -> TypeId {
        self.push(TypeKind::Set { element })
    }

    pub fn file_of(&mut self, element: TypeId, is_text: bool) -> TypeId {
        self.push(TypeKind::File { element, is_text })
    }

    pub fn string(&mut self, capacity: u32) -> TypeId {
        self.push(TypeKind::Str { capacity })
    }

    pub fn function(&mut self, proto: ProtoRef) -> TypeId {
        self.push(TypeKind::Function { proto })
    }

    pub fn func_ptr(&mut self, proto: ProtoRef) -> TypeId {
        self.push(TypeKind::FuncPtr { proto })
    }

    /// Construct an object type. Inherited fields and methods are merged
    /// in, non-static methods get an implicit by-ref `self` receiver, and
    /// vtable slots are assigned: fresh monotonic indices for `virtual`,
    /// the overridden slot for `override`.
    pub fn object(
        &mut self,
        name: &str,
        fields: Vec<Field>,
        own_methods: Vec<MemberFunc>,
        variant: Option<TypeId>,
        base: Option<TypeId>,
    ) -> Result<TypeId, TypeError> {
        // Reserve the id first so method prototypes can name the
        // receiver type.
        let id = self.push(TypeKind::Object {
            name: name.to_string(),
            fields: Vec::new(),
            methods: Vec::new(),
            variant: None,
            base: None,
        });

        let mut methods: Vec<MemberFunc> = match base {
            Some(b) => match self.kind(b) {
                TypeKind::Object { methods, .. } => methods.clone(),
                _ => return Err(TypeError::Internal("base type is not an object".into())),
            },
            None => Vec::new(),
        };

        let mut next_slot = methods
            .iter()
            .filter_map(|m| m.virt_index)
            .max()
            .map(|i| i + 1)
            .unwrap_or(0);

        for mut m in own_methods {
            {
                let mut proto = m.proto.borrow_mut();
                if !m.is_static {
                    proto.params.insert(0, Param::self_param(id));
                    proto.has_self = true;
                    proto.base_object = Some(id);
                }
                m.mangled = format!("{}${}", name, proto.name);
            }
            let mname = m.proto.borrow().name.clone();
            if let Some(pos) = methods
                .iter()
                .position(|e| e.proto.borrow().name == mname)
            {
                let inherited_slot = methods[pos].virt_index;
                if m.is_override {
                    match inherited_slot {
                        Some(slot) => m.virt_index = Some(slot),
                        None => return Err(TypeError::OverrideNonVirtual(mname)),
                    }
                } else if m.is_virtual {
                    // Redeclared virtual keeps the base slot.
                    m.virt_index = inherited_slot.or_else(|| {
                        let s = next_slot;
                        next_slot += 1;
                        Some(s)
                    });
                }
                methods[pos] = m;
            } else {
                if m.is_override {
                    return Err(TypeError::OverrideNonVirtual(mname));
                }
                if m.is_virtual {
                    m.virt_index = Some(next_slot);
                    next_slot += 1;
                }
                methods.push(m);
            }
        }

        self.decls[id.0 as usize].kind = TypeKind::Object {
            name: name.to_string(),
            fields,
            methods,
            variant,
            base,
        };
        Ok(id)
    }

    // ============ Forward pointer fixup ============

    /// Resolve all forward-declared pointers collected since the last
    /// call, using `lookup` to map a type name to its declared id.
    /// Returns the names that could not be resolved.
    pub fn resolve_forward_pointers(
        &mut self,
        mut lookup: impl FnMut(&str) -> Option<TypeId>,
    ) -> Vec<String> {
        let pending = std::mem::take(&mut self.incomplete);
        let mut unresolved = Vec::new();
        for id in pending {
            let name = match &self.decls[id.0 as usize].kind {
                TypeKind::Pointer { pointee: Pointee::Forward(name) } => name.clone(),
                _ => continue,
            };
            match lookup(&name) {
                Some(target) => {
                    self.decls[id.0 as usize].kind =
                        TypeKind::Pointer { pointee: Pointee::Resolved(target) };
                }
                None => unresolved.push(name),
            }
        }
        unresolved
    }

    /// Does any pointer still hold an unresolved name?
    pub fn has_incomplete_pointers(&self) -> bool {
        !self.incomplete.is_empty()
    }

    // ============ Queries ============

    pub fn is_integral(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            TypeKind::Integer
                | TypeKind::Int64
                | TypeKind::Char
                | TypeKind::Bool
                | TypeKind::Enum { .. }
                | TypeKind::Subrange { .. }
        )
    }

    pub fn is_real(&self, id: TypeId) -> bool {
        matches!(self.kind(id), TypeKind::Real)
    }

    pub fn is_compound(&self, id: TypeId) -> bool {
        matches!(
            self.kind(id),
            TypeKind::Array { .. }
                | TypeKind::Record { .. }
                | TypeKind::Object { .. }
                | TypeKind::Variant { .. }
                | TypeKind::Set { .. }
                | TypeKind::File { .. }
                | TypeKind::Str { .. }
        )
    }

    /// Low/high bounds of an ordinal type usable as an index or set range
    pub fn range_bounds(&self, id: TypeId) -> Option<(i64, i64)> {
        match self.kind(id) {
            TypeKind::Subrange { low, high, .. } => Some((*low, *high)),
            TypeKind::Char => Some((0, 255)),
            TypeKind::Bool => Some((0, 1)),
            TypeKind::Enum { values } => Some((0, values.len() as i64 - 1)),
            TypeKind::Integer => Some((i32::MIN as i64, i32::MAX as i64)),
            _ => None,
        }
    }

    pub fn range_size(&self, id: TypeId) -> Option<i64> {
        self.range_bounds(id).map(|(low, high)| high - low + 1)
    }

    /// Number of bits needed to represent the interval of an ordinal
    /// type: ceil(log2(high - low + 1)), at least 1.
    pub fn bits(&self, id: TypeId) -> u32 {
        let size = self.range_size(id).unwrap_or(1).max(1) as u64;
        let mut b = 1;
        while (1u64 << b) < size {
            b += 1;
        }
        b
    }

    /// Element type of a pointer, array, file or set
    pub fn element_type(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Pointer { pointee: Pointee::Resolved(p) } => Some(*p),
            TypeKind::Array { element, .. } => Some(*element),
            TypeKind::File { element, .. } => Some(*element),
            TypeKind::Set { element } => Some(*element),
            TypeKind::Str { .. } => Some(CHAR),
            _ => None,
        }
    }

    /// Does this object type carry a vtable pointer?
    pub fn has_vtable(&self, id: TypeId) -> bool {
        match self.kind(id) {
            TypeKind::Object { methods, .. } => {
                methods.iter().any(|m| m.virt_index.is_some())
            }
            _ => false,
        }
    }

    /// All instance fields of an object, base chain first
    pub fn object_fields(&self, id: TypeId) -> Vec<Field> {
        match self.kind(id) {
            TypeKind::Object { fields, base, .. } => {
                let mut all = base.map(|b| self.object_fields(b)).unwrap_or_default();
                all.extend(fields.iter().cloned());
                all
            }
            _ => Vec::new(),
        }
    }

    /// Look up a field of a record or object by name. Returns the index
    /// into the materialized IR struct (accounting for the vtable slot)
    /// and the field's type. Own fields shadow base fields.
    pub fn field_index(&self, id: TypeId, name: &str) -> Option<(u32, TypeId)> {
        match self.kind(id) {
            TypeKind::Record { fields, .. } => fields
                .iter()
                .position(|f| f.name == name)
                .map(|i| (i as u32, fields[i].ty)),
            TypeKind::Object { .. } => {
                let all = self.object_fields(id);
                let offset = if self.has_vtable(id) { 1 } else { 0 };
                // rposition: the derived object's own copy wins over a
                // shadowed base field of the same name.
                all.iter()
                    .rposition(|f| f.name == name)
                    .map(|i| (i as u32 + offset, all[i].ty))
            }
            _ => None,
        }
    }

    /// IR struct index where a record's or object's variant part lives
    pub fn variant_index(&self, id: TypeId) -> Option<u32> {
        match self.kind(id) {
            TypeKind::Record { fields, variant: Some(_) } => Some(fields.len() as u32),
            TypeKind::Object { variant: Some(_), .. } => {
                let offset = if self.has_vtable(id) { 1 } else { 0 };
                Some(self.object_fields(id).len() as u32 + offset)
            }
            _ => None,
        }
    }

    pub fn variant_of(&self, id: TypeId) -> Option<TypeId> {
        match self.kind(id) {
            TypeKind::Record { variant, .. } => *variant,
            TypeKind::Object { variant, .. } => *variant,
            _ => None,
        }
    }

    /// Find a field inside a variant part. Anonymous nested records
    /// (multi-field arms) are descended transparently: the result then
    /// carries the arm's record type and the index within it.
    pub fn variant_field(&self, variant: TypeId, name: &str) -> Option<VariantFieldHit> {
        let arms = match self.kind(variant) {
            TypeKind::Variant { arms } => arms,
            _ => return None,
        };
        for arm in arms {
            if arm.name == name {
                return Some(VariantFieldHit { arm_ty: arm.ty, nested: None });
            }
            if arm.name.is_empty() {
                if let TypeKind::Record { fields, .. } = self.kind(arm.ty) {
                    if let Some(i) = fields.iter().position(|f| f.name == name) {
                        return Some(VariantFieldHit {
                            arm_ty: arm.ty,
                            nested: Some((i as u32, fields[i].ty)),
                        });
                    }
                }
            }
        }
        None
    }

    /// Find a member function on an object (searching the merged table,
    /// which includes inherited methods)
    pub fn member_func(&self, id: TypeId, name: &str) -> Option<MemberFunc> {
        match self.kind(id) {
            TypeKind::Object { methods, .. } => methods
                .iter()
                .find(|m| m.proto.borrow().name == name)
                .cloned(),
            _ => None,
        }
    }

    /// Human-readable description of a type, for diagnostics
    pub fn describe(&self, id: TypeId) -> String {
        match self.kind(id) {
            TypeKind::Integer => "integer".into(),
            TypeKind::Int64 => "longint".into(),
            TypeKind::Real => "real".into(),
            TypeKind::Char => "char".into(),
            TypeKind::Bool => "boolean".into(),
            TypeKind::Void => "void".into(),
            TypeKind::Enum { values } => {
                let names: Vec<&str> = values.iter().map(|v| v.name.as_str()).collect();
                format!("({})", names.join(", "))
            }
            TypeKind::Subrange { low, high, .. } => format!("{}..{}", low, high),
            TypeKind::Pointer { pointee: Pointee::Resolved(p) } => {
                format!("^{}", self.describe(*p))
            }
            TypeKind::Pointer { pointee: Pointee::Forward(name) } => format!("^{}", name),
            TypeKind::Array { element, dims } => {
                format!("array[{}] of {}", dims.len(), self.describe(*element))
            }
            TypeKind::Record { .. } => "record".into(),
            TypeKind::Variant { .. } => "variant".into(),
            TypeKind::Object { name, .. } => name.clone(),
            TypeKind::Set { element } => format!("set of {}", self.describe(*element)),
            TypeKind::File { element, is_text } => {
                if *is_text {
                    "text".into()
                } else {
                    format!("file of {}", self.describe(*element))
                }
            }
            TypeKind::Str { capacity } => format!("string[{}]", capacity),
            TypeKind::Function { .. } => "function".into(),
            TypeKind::FuncPtr { .. } => "function pointer".into(),
        }
    }

    // ============ Relations ============

    fn proto_same(&self, a: &ProtoRef, b: &ProtoRef) -> bool {
        let (a, b) = (a.borrow(), b.borrow());
        a.params.len() == b.params.len()
            && self.same_as(a.result, b.result)
            && a.params
                .iter()
                .zip(b.params.iter())
                .all(|(p, q)| p.by_ref == q.by_ref && self.same_as(p.ty, q.ty))
    }

    /// Structural equality. Named records and objects are nominal:
    /// identical only to themselves.
    pub fn same_as(&self, a: TypeId, b: TypeId) -> bool {
        if a == b {
            return true;
        }
        match (self.kind(a), self.kind(b)) {
            (TypeKind::Integer, TypeKind::Integer)
            | (TypeKind::Int64, TypeKind::Int64)
            | (TypeKind::Real, TypeKind::Real)
            | (TypeKind::Char, TypeKind::Char)
            | (TypeKind::Bool, TypeKind::Bool)
            | (TypeKind::Void, TypeKind::Void) => true,
            (TypeKind::Enum { values: va }, TypeKind::Enum { values: vb }) => va == vb,
            (
                TypeKind::Subrange { base: ba, low: la, high: ha },
                TypeKind::Subrange { base: bb, low: lb, high: hb },
            ) => self.same_as(*ba, *bb) && la == lb && ha == hb,
            (
                TypeKind::Pointer { pointee: Pointee::Resolved(pa) },
                TypeKind::Pointer { pointee: Pointee::Resolved(pb) },
            ) => self.same_as(*pa, *pb),
            (
                TypeKind::Pointer { pointee: Pointee::Forward(na) },
                TypeKind::Pointer { pointee: Pointee::Forward(nb) },
            ) => na == nb,
            (
                TypeKind::Array { element: ea, dims: da },
                TypeKind::Array { element: eb, dims: db },
            ) => {
                self.same_as(*ea, *eb)
                    && da.len() == db.len()
                    && da
                        .iter()
                        .zip(db.iter())
                        .all(|(x, y)| self.range_bounds(*x) == self.range_bounds(*y))
            }
            (TypeKind::Set { element: ea }, TypeKind::Set { element: eb }) => {
                self.range_bounds(*ea) == self.range_bounds(*eb)
            }
            (
                TypeKind::File { element: ea, is_text: ta },
                TypeKind::File { element: eb, is_text: tb },
            ) => ta == tb && self.same_as(*ea, *eb),
            (TypeKind::Str { capacity: ca }, TypeKind::Str { capacity: cb }) => ca == cb,
            (TypeKind::FuncPtr { proto: pa }, TypeKind::FuncPtr { proto: pb })
            | (TypeKind::Function { proto: pa }, TypeKind::Function { proto: pb })
            | (TypeKind::FuncPtr { proto: pa }, TypeKind::Function { proto: pb })
            | (TypeKind::Function { proto: pa }, TypeKind::FuncPtr { proto: pb }) => {
                self.proto_same(pa, pb)
            }
            // Records, variants and objects are nominally equal only.
            _ => false,
        }
    }

    fn subrange_base_kind(&self, id: TypeId) -> TypeId {
        match self.kind(id) {
            TypeKind::Subrange { base, .. } => *base,
            _ => id,
        }
    }

    /// Is `derived` equal to `base` or somewhere below it in the
    /// inheritance chain?
    pub fn derives_from(&self, derived: TypeId, base: TypeId) -> bool {
        if derived == base {
            return true;
        }
        match self.kind(derived) {
            TypeKind::Object { base: Some(b), .. } => self.derives_from(*b, base),
            _ => false,
        }
    }

    /// The widening relation used for binary operands and by-value
    /// arguments. Returns the common type, or `None`.
    pub fn compatible(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        if self.same_as(a, b) {
            return Some(a);
        }
        match (self.kind(a), self.kind(b)) {
            // Numeric widening: Integer -> Int64 -> Real
            (TypeKind::Integer, TypeKind::Int64) => Some(b),
            (TypeKind::Int64, TypeKind::Integer) => Some(a),
            (TypeKind::Integer, TypeKind::Real) => Some(b),
            (TypeKind::Real, TypeKind::Integer) => Some(a),
            (TypeKind::Int64, TypeKind::Real) => Some(b),
            (TypeKind::Real, TypeKind::Int64) => Some(a),

            // Char widens into strings
            (TypeKind::Char, TypeKind::Str { .. }) => Some(b),
            (TypeKind::Str { .. }, TypeKind::Char) => Some(a),

            // A subrange is compatible with its base kind and with other
            // subranges of the same base kind.
            (TypeKind::Subrange { base, .. }, _) if self.compatible_base(*base, b) => Some(b),
            (_, TypeKind::Subrange { base, .. }) if self.compatible_base(*base, a) => Some(a),

            // Pointers: same pointee, or nil on either side
            (
                TypeKind::Pointer { pointee: Pointee::Resolved(pa) },
                TypeKind::Pointer { pointee: Pointee::Resolved(pb) },
            ) => {
                if matches!(self.kind(*pa), TypeKind::Void)
                    || matches!(self.kind(*pb), TypeKind::Void)
                    || self.same_as(*pa, *pb)
                {
                    Some(a)
                } else {
                    None
                }
            }

            // Strings accept single-dimension char arrays (string
            // literals type as arrays of char).
            (TypeKind::Str { .. }, TypeKind::Array { element, dims })
                if dims.len() == 1 && self.same_as(*element, CHAR) =>
            {
                Some(a)
            }
            (TypeKind::Array { element, dims }, TypeKind::Str { .. })
                if dims.len() == 1 && self.same_as(*element, CHAR) =>
            {
                Some(b)
            }
            (TypeKind::Char, TypeKind::Array { element, dims })
                if dims.len() == 1
                    && self.same_as(*element, CHAR)
                    && self.range_size(dims[0]) == Some(1) =>
            {
                Some(a)
            }
            (TypeKind::Array { element, dims }, TypeKind::Char)
                if dims.len() == 1
                    && self.same_as(*element, CHAR)
                    && self.range_size(dims[0]) == Some(1) =>
            {
                Some(b)
            }

            // Sets with the same element base kind
            (TypeKind::Set { element: ea }, TypeKind::Set { element: eb }) => {
                let (ba, bb) = (self.subrange_base_kind(*ea), self.subrange_base_kind(*eb));
                if self.same_as(ba, bb) {
                    Some(a)
                } else {
                    None
                }
            }

            // Upcast along the inheritance chain
            (TypeKind::Object { .. }, TypeKind::Object { .. }) => {
                if self.derives_from(b, a) {
                    Some(a)
                } else {
                    None
                }
            }

            _ => None,
        }
    }

    fn compatible_base(&self, base: TypeId, other: TypeId) -> bool {
        let other = self.subrange_base_kind(other);
        self.same_as(base, other)
            || matches!(
                (self.kind(base), self.kind(other)),
                (TypeKind::Integer, TypeKind::Int64) | (TypeKind::Int64, TypeKind::Integer)
            )
    }

    /// The stricter assignment relation: `dst := src`
    pub fn assignable(&self, dst: TypeId, src: TypeId) -> Option<TypeId> {
        if self.same_as(dst, src) {
            return Some(dst);
        }
        match (self.kind(dst), self.kind(src)) {
            (TypeKind::Real, TypeKind::Integer) | (TypeKind::Real, TypeKind::Int64) => Some(dst),
            (TypeKind::Int64, TypeKind::Integer) => Some(dst),

            (TypeKind::Real, TypeKind::Subrange { base, .. })
            | (TypeKind::Int64, TypeKind::Subrange { base, .. })
                if matches!(self.kind(*base), TypeKind::Integer) =>
            {
                Some(dst)
            }

            // Subrange assignment: the base kinds must agree
            (TypeKind::Subrange { base, .. }, _) if self.compatible_base(*base, src) => Some(dst),
            (_, TypeKind::Subrange { base, .. }) if self.compatible_base(*base, dst) => Some(dst),

            // Strings accept chars, narrower strings and char arrays
            (TypeKind::Str { .. }, TypeKind::Char) => Some(dst),
            (TypeKind::Str { capacity: cd }, TypeKind::Str { capacity: cs }) if cs <= cd => {
                Some(dst)
            }
            (TypeKind::Str { .. }, TypeKind::Array { element, dims })
                if dims.len() == 1 && self.same_as(*element, CHAR) =>
            {
                Some(dst)
            }

            // Pointers: same pointee or nil
            (
                TypeKind::Pointer { pointee: Pointee::Resolved(pd) },
                TypeKind::Pointer { pointee: Pointee::Resolved(ps) },
            ) => {
                if matches!(self.kind(*ps), TypeKind::Void) || self.same_as(*pd, *ps) {
                    Some(dst)
                } else {
                    None
                }
            }

            // A base object accepts a derived object (pointer-free upcast)
            (TypeKind::Object { .. }, TypeKind::Object { .. }) => {
                if self.derives_from(src, dst) {
                    Some(dst)
                } else {
                    None
                }
            }

            (TypeKind::Set { .. }, TypeKind::Set { .. }) => self.compatible(dst, src),

            _ => None,
        }
    }

    // ============ IR materialization and layout ============

    fn fresh_struct_name(&mut self, hint: &str) -> String {
        if !hint.is_empty() && !self.struct_index.contains_key(hint) {
            return hint.to_string();
        }
        loop {
            let name = format!("record.{}", self.next_anon);
            self.next_anon += 1;
            if !self.struct_index.contains_key(&name) {
                return name;
            }
        }
    }

    fn declare_struct(&mut self, name: String) -> String {
        let idx = self.structs.len();
        self.structs.push(StructDef::opaque(name.clone()));
        self.struct_index.insert(name.clone(), idx);
        name
    }

    fn set_struct_body(&mut self, name: &str, body: Vec<IrType>) {
        if let Some(&idx) = self.struct_index.get(name) {
            self.structs[idx].body = Some(body);
        }
    }

    fn struct_body(&self, name: &str) -> Option<&Vec<IrType>> {
        self.struct_index
            .get(name)
            .and_then(|&idx| self.structs[idx].body.as_ref())
    }

    /// The named struct table, for handing to the emitted module
    pub fn struct_defs(&self) -> &[StructDef] {
        &self.structs
    }

    /// Materialize the IR type for `id`, lazily and cached.
    ///
    /// Records and objects always lower to named structs. The name is
    /// reserved (opaque) and cached *before* the field types are
    /// computed, so self-reference through a pointer terminates; the body
    /// is set afterwards. A record containing a pointer whose pointee is
    /// still a forward name stays opaque until
    /// [`TypeStore::complete_pending`] runs after fixup.
    pub fn ir_type(&mut self, id: TypeId) -> Result<IrType, TypeError> {
        if let Some(ir) = &self.decls[id.0 as usize].ir {
            return Ok(ir.clone());
        }
        let ir = match self.kind(id).clone() {
            TypeKind::Integer => IrType::I32,
            TypeKind::Int64 => IrType::I64,
            TypeKind::Real => IrType::F64,
            TypeKind::Char => IrType::I8,
            TypeKind::Bool => IrType::Bool,
            TypeKind::Void => IrType::Void,
            TypeKind::Enum { .. } => IrType::I32,
            TypeKind::Subrange { base, .. } => match self.kind(base) {
                TypeKind::Char => IrType::I8,
                _ => IrType::I32,
            },
            TypeKind::Pointer { pointee } => match pointee {
                Pointee::Resolved(p) => {
                    if matches!(self.kind(p), TypeKind::Void) {
                        IrType::void_ptr()
                    } else {
                        // Break pointee cycles (`type t = ^t`): a
                        // provisional untyped pointer stands in while
                        // the pointee materializes.
                        self.decls[id.0 as usize].ir = Some(IrType::void_ptr());
                        IrType::ptr(self.ir_type(p)?)
                    }
                }
                Pointee::Forward(name) => {
                    return Err(TypeError::UnresolvedPointer(name));
                }
            },
            TypeKind::Array { element, dims } => {
                let elem = self.ir_type(element)?;
                let mut nelems: usize = 1;
                for dim in &dims {
                    nelems *= self.range_size(*dim).unwrap_or(1).max(1) as usize;
                }
                IrType::array(elem, nelems)
            }
            TypeKind::Record { fields, variant } => {
                return self.materialize_struct(id, "", &fields, variant, None);
            }
            TypeKind::Object { name, variant, .. } => {
                let fields = self.object_fields(id);
                let vtable = if self.has_vtable(id) {
                    Some(self.vtable_struct(id)?)
                } else {
                    None
                };
                return self.materialize_struct(id, &name, &fields, variant, vtable);
            }
            TypeKind::Variant { arms } => self.variant_layout(&arms)?,
            TypeKind::Set { .. } => IrType::array(IrType::I32, SET_WORDS),
            TypeKind::File { element, .. } => {
                let elem = self.ir_type(element)?;
                IrType::Struct(vec![IrType::I32, IrType::ptr(elem), IrType::I32, IrType::Bool])
            }
            TypeKind::Str { capacity } => IrType::array(IrType::I8, capacity as usize + 1),
            TypeKind::Function { proto } | TypeKind::FuncPtr { proto } => {
                let ir = self.proto_ir_type(&proto)?;
                IrType::ptr(ir)
            }
        };
        self.decls[id.0 as usize].ir = Some(ir.clone());
        Ok(ir)
    }

    /// Function type with the compound-by-ref calling convention: by-ref
    /// parameters and compound by-value parameters are passed as pointers.
    fn proto_ir_type(&mut self, proto: &ProtoRef) -> Result<IrType, TypeError> {
        let (params, result) = {
            let p = proto.borrow();
            (p.params.clone(), p.result)
        };
        let mut tys = Vec::new();
        for p in &params {
            let ty = self.ir_type(p.ty)?;
            if p.by_ref || self.is_compound(p.ty) {
                tys.push(IrType::ptr(ty));
            } else {
                tys.push(ty);
            }
        }
        let ret = self.ir_type(result)?;
        Ok(IrType::Fn { params: tys, ret: Box::new(ret) })
    }

    /// The vtable struct type for an object: one function-pointer slot
    /// per virtual method, in slot order.
    fn vtable_struct(&mut self, id: TypeId) -> Result<IrType, TypeError> {
        let name = match self.kind(id) {
            TypeKind::Object { name, .. } => name.clone(),
            _ => return Err(TypeError::Internal("vtable of non-object".into())),
        };
        let vt_name = format!("vtable_{}", name);
        if self.struct_index.contains_key(&vt_name) {
            return Ok(IrType::Named(vt_name));
        }
        let methods = match self.kind(id) {
            TypeKind::Object { methods, .. } => methods.clone(),
            _ => unreachable!(),
        };
        self.declare_struct(vt_name.clone());
        let mut slots: Vec<(u32, IrType)> = Vec::new();
        for m in &methods {
            if let Some(slot) = m.virt_index {
                let fp = self.proto_ir_type(&m.proto)?;
                slots.push((slot, IrType::ptr(fp)));
            }
        }
        slots.sort_by_key(|(slot, _)| *slot);
        let body: Vec<IrType> = slots.into_iter().map(|(_, ty)| ty).collect();
        self.set_struct_body(&vt_name, body);
        Ok(IrType::Named(vt_name))
    }

    fn materialize_struct(
        &mut self,
        id: TypeId,
        name_hint: &str,
        fields: &[Field],
        variant: Option<TypeId>,
        vtable: Option<IrType>,
    ) -> Result<IrType, TypeError> {
        let name = self.fresh_struct_name(name_hint);
        let name = self.declare_struct(name);
        let named = IrType::Named(name.clone());
        // Cache before computing the body: recursive references resolve
        // to the (still opaque) named struct.
        self.decls[id.0 as usize].ir = Some(named.clone());

        // A field whose type is a pointer with an unresolved pointee
        // keeps the struct opaque until fixup.
        let blocked = fields.iter().any(|f| {
            matches!(
                self.kind(f.ty),
                TypeKind::Pointer { pointee: Pointee::Forward(_) }
            )
        });
        if blocked {
            self.pending_bodies.push(id);
            return Ok(named);
        }

        let body = self.struct_field_types(fields, variant, vtable)?;
        self.set_struct_body(&name, body);
        Ok(named)
    }

    fn struct_field_types(
        &mut self,
        fields: &[Field],
        variant: Option<TypeId>,
        vtable: Option<IrType>,
    ) -> Result<Vec<IrType>, TypeError> {
        let mut body = Vec::new();
        if let Some(vt) = vtable {
            body.push(IrType::ptr(vt));
        }
        for f in fields {
            body.push(self.ir_type(f.ty)?);
        }
        if let Some(v) = variant {
            body.push(self.ir_type(v)?);
        }
        if body.is_empty() {
            // An empty record still occupies storage.
            body.push(IrType::I8);
        }
        Ok(body)
    }

    /// Set bodies for structs that were blocked on forward pointers.
    /// Must run after [`TypeStore::resolve_forward_pointers`].
    pub fn complete_pending(&mut self) -> Result<(), TypeError> {
        let pending = std::mem::take(&mut self.pending_bodies);
        for id in pending {
            let name = match &self.decls[id.0 as usize].ir {
                Some(IrType::Named(name)) => name.clone(),
                _ => continue,
            };
            let (fields, variant, vtable) = match self.kind(id).clone() {
                TypeKind::Record { fields, variant } => (fields, variant, None),
                TypeKind::Object { variant, .. } => {
                    let fields = self.object_fields(id);
                    let vt = if self.has_vtable(id) {
                        Some(self.vtable_struct(id)?)
                    } else {
                        None
                    };
                    (fields, variant, vt)
                }
                _ => continue,
            };
            let still_blocked = fields.iter().any(|f| {
                matches!(
                    self.kind(f.ty),
                    TypeKind::Pointer { pointee: Pointee::Forward(_) }
                )
            });
            if still_blocked {
                let forward = fields
                    .iter()
                    .find_map(|f| match self.kind(f.ty) {
                        TypeKind::Pointer { pointee: Pointee::Forward(n) } => Some(n.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                return Err(TypeError::UnresolvedPointer(forward));
            }
            let body = self.struct_field_types(&fields, variant, vtable)?;
            self.set_struct_body(&name, body);
        }
        Ok(())
    }

    /// Variant layout: the arm with the greatest alignment (ties broken
    /// by size) anchors the struct; if some other arm needs more bytes,
    /// padding is appended so the overlay covers every arm.
    fn variant_layout(&mut self, arms: &[Field]) -> Result<IrType, TypeError> {
        let mut max_size = 0;
        let mut max_align = 0;
        let mut max_align_size = 0;
        let mut anchor: Option<IrType> = None;
        for arm in arms {
            let ty = self.ir_type(arm.ty)?;
            let size = self.ir_size(&ty)?;
            let align = self.ir_align(&ty)?;
            if size > max_size {
                max_size = size;
            }
            if align > max_align || (align == max_align && size > max_align_size) {
                max_align = align;
                max_align_size = size;
                anchor = Some(ty);
            }
        }
        let anchor = anchor.ok_or_else(|| TypeError::Internal("empty variant".into()))?;
        let mut body = vec![anchor];
        if max_size > max_align_size {
            body.push(IrType::array(IrType::I8, max_size - max_align_size));
        }
        Ok(IrType::Struct(body))
    }

    /// Allocation size of a type in bytes
    pub fn size_of(&mut self, id: TypeId) -> Result<usize, TypeError> {
        let ir = self.ir_type(id)?;
        self.ir_size(&ir)
    }

    /// Preferred alignment of a type in bytes
    pub fn align_of(&mut self, id: TypeId) -> Result<usize, TypeError> {
        let ir = self.ir_type(id)?;
        self.ir_align(&ir)
    }

    /// The data-layout oracle: byte size of an IR type, C-style struct
    /// layout (fields padded to their alignment, total padded to the
    /// struct's alignment).
    pub fn ir_size(&self, ty: &IrType) -> Result<usize, TypeError> {
        Ok(match ty {
            IrType::Void => 0,
            IrType::Bool | IrType::I8 => 1,
            IrType::I32 => 4,
            IrType::I64 | IrType::F64 => 8,
            IrType::Ptr(_) | IrType::Fn { .. } => 8,
            IrType::Array(elem, n) => self.ir_size(elem)? * n,
            IrType::Struct(fields) => self.struct_size(fields)?,
            IrType::Named(name) => {
                let body = self
                    .struct_body(name)
                    .ok_or_else(|| {
                        TypeError::Internal(format!("size query on opaque struct '{}'", name))
                    })?
                    .clone();
                self.struct_size(&body)?
            }
        })
    }

    pub fn ir_align(&self, ty: &IrType) -> Result<usize, TypeError> {
        Ok(match ty {
            IrType::Void => 1,
            IrType::Bool | IrType::I8 => 1,
            IrType::I32 => 4,
            IrType::I64 | IrType::F64 => 8,
            IrType::Ptr(_) | IrType::Fn { .. } => 8,
            IrType::Array(elem, _) => self.ir_align(elem)?,
            IrType::Struct(fields) => {
                let mut align = 1;
                for f in fields {
                    align = align.max(self.ir_align(f)?);
                }
                align
            }
            IrType::Named(name) => {
                let body = self
                    .struct_body(name)
                    .ok_or_else(|| {
                        TypeError::Internal(format!("align query on opaque struct '{}'", name))
                    })?
                    .clone();
                self.ir_align(&IrType::Struct(body))?
            }
        })
    }

    fn struct_size(&self, fields: &[IrType]) -> Result<usize, TypeError> {
        let mut offset = 0;
        let mut align = 1;
        for f in fields {
            let fa = self.ir_align(f)?;
            let fs = self.ir_size(f)?;
            offset = round_up(offset, fa);
            offset += fs;
            align = align.max(fa);
        }
        Ok(round_up(offset, align).max(1))
    }
}

impl Default for TypeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a variant-part field lookup
#[derive(Debug, Clone)]
pub struct VariantFieldHit {
    /// Type of the arm the name was found in (a field type, or the
    /// anonymous record grouping the arm's fields)
    pub arm_ty: TypeId,
    /// If the arm is an anonymous record: index and type of the field
    /// inside it
    pub nested: Option<(u32, TypeId)>,
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Prototype;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_primitive_sizes() {
        let mut store = TypeStore::new();
        assert_eq!(store.size_of(INTEGER).unwrap(), 4);
        assert_eq!(store.size_of(INT64).unwrap(), 8);
        assert_eq!(store.size_of(REAL).unwrap(), 8);
        assert_eq!(store.size_of(CHAR).unwrap(), 1);
    }

    #[test]
    fn test_relations_are_reflexive() {
        let mut store = TypeStore::new();
        let sub = store.subrange(INTEGER, 1, 10).unwrap();
        let arr = store.array(INTEGER, vec![sub]);
        for id in [INTEGER, INT64, REAL, CHAR, BOOL, sub, arr] {
            assert!(store.same_as(id, id));
            assert!(store.compatible(id, id).is_some());
            assert!(store.assignable(id, id).is_some());
        }
    }

    #[test]
    fn test_numeric_widening_is_monotonic() {
        let store = TypeStore::new();
        assert!(store.assignable(INT64, INTEGER).is_some());
        assert!(store.assignable(REAL, INTEGER).is_some());
        assert!(store.assignable(REAL, INT64).is_some());
        // No reverse narrowing.
        assert!(store.assignable(INTEGER, INT64).is_none());
        assert!(store.assignable(INTEGER, REAL).is_none());
        assert!(store.assignable(INT64, REAL).is_none());
    }

    #[test]
    fn test_arrays_of_differing_bounds_are_incompatible() {
        let mut store = TypeStore::new();
        let r1 = store.subrange(INTEGER, 1, 10).unwrap();
        let r2 = store.subrange(INTEGER, 0, 9).unwrap();
        let a1 = store.array(INTEGER, vec![r1]);
        let a2 = store.array(INTEGER, vec![r2]);
        assert!(!store.same_as(a1, a2));
        assert!(store.compatible(a1, a2).is_none());
        assert!(store.assignable(a1, a2).is_none());
    }

    #[test]
    fn test_same_bounds_arrays_are_compatible() {
        let mut store = TypeStore::new();
        let r1 = store.subrange(INTEGER, 1, 10).unwrap();
        let r2 = store.subrange(INTEGER, 1, 10).unwrap();
        let a1 = store.array(INTEGER, vec![r1]);
        let a2 = store.array(INTEGER, vec![r2]);
        assert!(store.same_as(a1, a2));
        assert!(store.compatible(a1, a2).is_some());
    }

    #[test]
    fn test_invalid_subrange() {
        let mut store = TypeStore::new();
        assert!(store.subrange(INTEGER, 10, 1).is_err());
        // A one-element range is allowed (set of 0..0 is legal).
        assert!(store.subrange(INTEGER, 0, 0).is_ok());
    }

    #[test]
    fn test_subrange_bits() {
        let mut store = TypeStore::new();
        let r = store.subrange(INTEGER, 0, 255).unwrap();
        assert_eq!(store.bits(r), 8);
        let r = store.subrange(INTEGER, 1, 10).unwrap();
        assert_eq!(store.bits(r), 4);
        let r = store.subrange(INTEGER, 5, 5).unwrap();
        assert_eq!(store.bits(r), 1);
    }

    #[test]
    fn test_set_too_large() {
        let mut store = TypeStore::new();
        let r = store.subrange(INTEGER, 0, 255).unwrap();
        assert!(store.set_of(r).is_ok());
        let r = store.subrange(INTEGER, 0, 256).unwrap();
        assert!(store.set_of(r).is_err());
    }

    #[test]
    fn test_set_layout_is_fixed_width() {
        let mut store = TypeStore::new();
        let r = store.subrange(INTEGER, 0, 0).unwrap();
        let s = store.set_of(r).unwrap();
        assert_eq!(store.ir_type(s).unwrap(), IrType::array(IrType::I32, SET_WORDS));
    }

    #[test]
    fn test_forward_pointer_fixup() {
        let mut store = TypeStore::new();
        let p = store.pointer_forward("node");
        assert!(store.has_incomplete_pointers());
        let node = store.record(vec![Field::new("next", p)], None);
        let unresolved = store.resolve_forward_pointers(|name| {
            if name == "node" {
                Some(node)
            } else {
                None
            }
        });
        assert!(unresolved.is_empty());
        assert!(!store.has_incomplete_pointers());
        match store.kind(p) {
            TypeKind::Pointer { pointee: Pointee::Resolved(t) } => assert_eq!(*t, node),
            other => panic!("expected resolved pointer, got {:?}", other),
        }
    }

    #[test]
    fn test_unresolved_forward_pointer_is_reported() {
        let mut store = TypeStore::new();
        store.pointer_forward("missing");
        let unresolved = store.resolve_forward_pointers(|_| None);
        assert_eq!(unresolved, vec!["missing".to_string()]);
    }

    #[test]
    fn test_recursive_record_materializes() {
        let mut store = TypeStore::new();
        let p = store.pointer_forward("node");
        let node = store.record(
            vec![Field::new("value", INTEGER), Field::new("next", p)],
            None,
        );
        store.resolve_forward_pointers(|_| Some(node));
        let ir = store.ir_type(node).unwrap();
        store.complete_pending().unwrap();
        match &ir {
            IrType::Named(name) => {
                let body = store.struct_body(name).expect("body must be completed");
                assert_eq!(body.len(), 2);
                assert_eq!(body[0], IrType::I32);
                assert!(matches!(&body[1], IrType::Ptr(inner) if **inner == ir));
            }
            other => panic!("expected named struct, got {:?}", other),
        }
        // Size query works once the body is set: i32 + padding + ptr.
        assert_eq!(store.size_of(node).unwrap(), 16);
    }

    #[test]
    fn test_empty_record_is_one_byte_struct() {
        let mut store = TypeStore::new();
        let rec = store.record(vec![], None);
        let ir = store.ir_type(rec).unwrap();
        match &ir {
            IrType::Named(name) => {
                assert_eq!(store.struct_body(name), Some(&vec![IrType::I8]));
            }
            other => panic!("expected named struct, got {:?}", other),
        }
        assert_eq!(store.size_of(rec).unwrap(), 1);
    }

    #[test]
    fn test_variant_layout_covers_largest_arm() {
        let mut store = TypeStore::new();
        let sub = store.subrange(INTEGER, 0, 9).unwrap();
        let arr = store.array(CHAR, vec![sub]); // 10 bytes, align 1
        let v = store.variant(vec![Field::new("r", REAL), Field::new("s", arr)]);
        let rec = store.record(vec![Field::new("tag", INTEGER)], Some(v));
        let variant_size = store.size_of(v).unwrap();
        // Anchor is the real (align 8, size 8); the char array needs 10,
        // so two bytes of padding follow.
        assert!(variant_size >= 10);
        let rec_size = store.size_of(rec).unwrap();
        assert!(rec_size >= variant_size);
    }

    fn method(name: &str, virtual_: bool, override_: bool) -> MemberFunc {
        let proto = Rc::new(RefCell::new(Prototype::new(name, Vec::new(), VOID)));
        MemberFunc {
            proto,
            is_static: false,
            is_virtual: virtual_,
            is_override: override_,
            virt_index: None,
            mangled: String::new(),
        }
    }

    #[test]
    fn test_vtable_slot_assignment() {
        let mut store = TypeStore::new();
        let m1 = method("draw", true, false);
        let m2 = method("area", true, false);
        let base = store
            .object("shape", vec![Field::new("x", INTEGER)], vec![m1, m2], None, None)
            .unwrap();
        let over = method("draw", false, true);
        let m3 = method("extra", true, false);
        let derived = store
            .object("circle", vec![Field::new("r", REAL)], vec![over, m3], None, Some(base))
            .unwrap();

        let draw = store.member_func(derived, "draw").unwrap();
        let area = store.member_func(derived, "area").unwrap();
        let extra = store.member_func(derived, "extra").unwrap();
        // Override occupies the base slot; new virtuals extend the table.
        assert_eq!(draw.virt_index, Some(0));
        assert_eq!(area.virt_index, Some(1));
        assert_eq!(extra.virt_index, Some(2));
        assert!(store.has_vtable(derived));
    }

    #[test]
    fn test_override_of_non_virtual_is_an_error() {
        let mut store = TypeStore::new();
        let m1 = method("draw", false, false);
        let base = store.object("shape", vec![], vec![m1], None, None).unwrap();
        let over = method("draw", false, true);
        let err = store.object("circle", vec![], vec![over], None, Some(base));
        assert!(matches!(err, Err(TypeError::OverrideNonVirtual(_))));
    }

    #[test]
    fn test_object_field_lookup_with_vtable_offset() {
        let mut store = TypeStore::new();
        let m = method("draw", true, false);
        let base = store
            .object("shape", vec![Field::new("x", INTEGER)], vec![m], None, None)
            .unwrap();
        let derived = store
            .object("circle", vec![Field::new("r", REAL)], vec![], None, Some(base))
            .unwrap();
        // vtable pointer occupies slot 0, base field x slot 1, own field r slot 2.
        assert_eq!(store.field_index(derived, "x"), Some((1, INTEGER)));
        assert_eq!(store.field_index(derived, "r"), Some((2, REAL)));
    }

    #[test]
    fn test_object_upcast_assignable() {
        let mut store = TypeStore::new();
        let base = store.object("shape", vec![], vec![], None, None).unwrap();
        let derived = store.object("circle", vec![], vec![], None, Some(base)).unwrap();
        assert!(store.assignable(base, derived).is_some());
        assert!(store.assignable(derived, base).is_none());
    }

    #[test]
    fn test_string_accepts_char_and_narrower_string() {
        let mut store = TypeStore::new();
        let s80 = store.string(80);
        let s20 = store.string(20);
        assert!(store.assignable(s80, CHAR).is_some());
        assert!(store.assignable(s80, s20).is_some());
        assert!(store.assignable(s20, s80).is_none());
    }

    #[test]
    fn test_nil_is_assignable_to_any_pointer() {
        let mut store = TypeStore::new();
        let p = store.pointer_to(INTEGER);
        assert!(store.assignable(p, NIL).is_some());
        let q = store.pointer_to(REAL);
        assert!(store.assignable(p, q).is_none());
    }

    #[test]
    fn test_same_as_implies_same_size_and_align() {
        let mut store = TypeStore::new();
        let r1 = store.subrange(INTEGER, 1, 8).unwrap();
        let r2 = store.subrange(INTEGER, 1, 8).unwrap();
        assert!(store.same_as(r1, r2));
        assert_eq!(store.size_of(r1).unwrap(), store.size_of(r2).unwrap());
        assert_eq!(store.align_of(r1).unwrap(), store.align_of(r2).unwrap());
    }

    #[test]
    fn test_file_layout() {
        let mut store = TypeStore::new();
        let f = store.file_of(INTEGER, false);
        match store.ir_type(f).unwrap() {
            IrType::Struct(fields) => {
                assert_eq!(fields.len(), 4);
                assert_eq!(fields[file_field::HANDLE as usize], IrType::I32);
                assert!(fields[file_field::BUFFER as usize].is_ptr());
                assert_eq!(fields[file_field::RECORD_SIZE as usize], IrType::I32);
                assert_eq!(fields[file_field::IS_TEXT as usize], IrType::Bool);
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }
}
