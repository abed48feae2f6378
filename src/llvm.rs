//! A small model of LLVM types, values, and code.
//!
//! This is the shape the lowering emits into: enough of the LLVM value and
//! type language to express closure and data layouts, allocator expansion,
//! and the control flow of lowered definitions. Printing the textual IR is
//! a concern of an external collaborator; this module only supplies the
//! in-memory model and the `Module` accumulator it populates.

use std::fmt;
use std::rc::Rc;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    I1,
    I8,
    I32,
    I64,
    /// A pointer to a value of the given type.
    Ptr(Rc<Type>),
    /// A structure with the given field types.
    Struct(Vec<Type>),
    /// A function from the argument types to the result type.
    Fun(Vec<Type>, Rc<Type>),
    /// Functions with no useful result.
    Void,
}

impl Type {
    pub fn ptr(self) -> Type {
        Type::Ptr(Rc::new(self))
    }

    pub fn fun(args: Vec<Type>, ret: Type) -> Type {
        Type::Fun(args, Rc::new(ret))
    }

    /// The type a pointer of this type points to.
    pub fn deref(&self) -> Option<&Type> {
        match self {
            Type::Ptr(t) => Some(t),
            _ => None,
        }
    }

    /// The type of the code pointer stored in slot 0 of a closure whose
    /// pointers have this type.
    pub fn code_ptr_type(&self) -> Option<Type> {
        match self.deref()? {
            Type::Struct(fields) => fields.first().cloned(),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::I1 => write!(f, "i1"),
            Type::I8 => write!(f, "i8"),
            Type::I32 => write!(f, "i32"),
            Type::I64 => write!(f, "i64"),
            Type::Ptr(t) => write!(f, "{}*", t),
            Type::Struct(fields) => {
                write!(f, "{{")?;
                for (i, t) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "}}")
            }
            Type::Fun(args, ret) => {
                write!(f, "{} (", ret)?;
                for (i, t) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, ")")
            }
            Type::Void => write!(f, "void"),
        }
    }
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An integer constant.
    Int(i64),
    /// A reference to a global symbol.
    Global(Type, String),
    /// A local register.
    Local(Type, String),
    /// The null pointer of a given type.
    Null(Type),
    /// A structure assembled from component values.
    Aggregate(Type, Vec<Value>),
}

impl Value {
    pub fn ty(&self) -> Type {
        match self {
            Value::Int(_) => Type::I32,
            Value::Global(t, _) | Value::Local(t, _) | Value::Null(t) => t.clone(),
            Value::Aggregate(t, _) => t.clone(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Value::Global(_, n) | Value::Local(_, n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Global(_, n) => write!(f, "@{}", n),
            Value::Local(_, n) => write!(f, "%{}", n),
            Value::Null(_) => write!(f, "null"),
            Value::Aggregate(_, vs) => {
                write!(f, "{{")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

// ============================================================================
// Right hand sides and code
// ============================================================================

/// The right hand side of a register assignment.
#[derive(Debug, Clone)]
pub enum Rhs {
    Bitcast(Value, Type),
    PtrToInt(Value, Type),
    /// `getelementptr` from a base value through the given indices.
    Getelementptr(Value, Vec<Value>),
    Load(Value),
    Call(Type, Value, Vec<Value>),
    ExtractValue(Value, usize),
}

/// Straight-line code with explicit terminators.
#[derive(Debug, Clone)]
pub enum Code {
    /// `local = rhs; rest`
    Op(Value, Rhs, Box<Code>),
    /// `store value, addr; rest`
    Store(Value, Value, Box<Code>),
    /// Unconditional branch to a labeled basic block.
    Br(String),
    /// Conditional branch.
    CondBr(Value, String, String),
    /// Multi-way dispatch on an integer value.
    Switch(Value, Vec<(i64, String)>, String),
    Ret(Value),
    RetVoid,
}

impl Code {
    /// Prepend an operation to this code.
    pub fn op(local: Value, rhs: Rhs, rest: Code) -> Code {
        Code::Op(local, rhs, Box::new(rest))
    }

    pub fn store(value: Value, addr: Value, rest: Code) -> Code {
        Code::Store(value, addr, Box::new(rest))
    }

    /// The number of operations before the terminator.
    pub fn len(&self) -> usize {
        match self {
            Code::Op(_, _, rest) | Code::Store(_, _, rest) => 1 + rest.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Functions and modules
// ============================================================================

/// A basic block: a label, the phi bindings satisfied by predecessors, and
/// straight-line code.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub label: String,
    /// `(register, (incoming value, predecessor label) list)`
    pub phis: Vec<(Value, Vec<(Value, String)>)>,
    pub code: Code,
}

#[derive(Debug, Clone)]
pub struct FuncDefn {
    pub name: String,
    pub ret: Type,
    pub formals: Vec<Value>,
    pub blocks: Vec<BasicBlock>,
}

/// A named constant holding a structure of known values.
#[derive(Debug, Clone)]
pub struct PrivConst {
    pub name: String,
    pub ty: Type,
    pub fields: Vec<Value>,
}

/// One top-level item of a module.
#[derive(Debug, Clone)]
pub enum Defn {
    Func(FuncDefn),
    /// A private constant (used for statically allocated objects).
    Const(PrivConst),
    /// An alias giving an existing constant a second, differently typed name.
    Alias { name: String, ty: Type, of: Value },
    /// A mutable global variable with an initial value.
    GlobalVar { name: String, ty: Type, init: Value },
    /// A declaration of an external symbol.
    Declare { name: String, ty: Type },
}

impl Defn {
    pub fn name(&self) -> &str {
        match self {
            Defn::Func(f) => &f.name,
            Defn::Const(c) => &c.name,
            Defn::Alias { name, .. } => name,
            Defn::GlobalVar { name, .. } => name,
            Defn::Declare { name, .. } => name,
        }
    }
}

/// The accumulator lowering emits into.
#[derive(Debug, Default)]
pub struct Module {
    pub defns: Vec<Defn>,
    fresh: u32,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    /// A module-unique name with the given prefix.
    pub fn fresh_name(&mut self, prefix: &str) -> String {
        let n = self.fresh;
        self.fresh += 1;
        format!("{}{}", prefix, n)
    }

    pub fn add(&mut self, d: Defn) {
        self.defns.push(d);
    }

    pub fn find(&self, name: &str) -> Option<&Defn> {
        self.defns.iter().find(|d| d.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn types_render_in_llvm_syntax() {
        let clos = Type::Struct(vec![Type::I8.ptr(), Type::I32]).ptr();
        assert_eq!(clos.to_string(), "{i8*, i32}*");
        assert_eq!(Type::fun(vec![Type::I32], Type::I1).to_string(), "i1 (i32)");
    }

    #[test]
    fn code_ptr_type_reads_slot_zero() {
        let code_ptr = Type::fun(vec![Type::I8.ptr()], Type::I32).ptr();
        let clos = Type::Struct(vec![code_ptr.clone(), Type::I32]).ptr();
        assert_eq!(clos.code_ptr_type(), Some(code_ptr));
    }

    #[test]
    fn fresh_names_are_unique_per_module() {
        let mut m = Module::new();
        let a = m.fresh_name("layout");
        let b = m.fresh_name("layout");
        assert_ne!(a, b);
        m.add(Defn::Declare { name: "alloc".to_string(), ty: Type::I8 });
        assert!(m.find("alloc").is_some());
    }
}
