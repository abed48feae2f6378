//! Lowering of a monomorphic MIL program to the LLVM model.
//!
//! Every closure definition, and every block that is called from non-tail
//! position (or from a top-level initializer), becomes a function. Tail
//! calls to other blocks become branches to basic blocks within the same
//! function, with block parameters carried by phis; everything else leaves
//! the function as a call or return. Allocators expand to a size
//! computation with the `getelementptr null, 1` idiom, a call to the
//! external `alloc` symbol, and stores of the tag and fields. Statically
//! valued top-levels are emitted as private constants with a bitcast alias
//! to the generic object pointer type; the remaining globals are filled in
//! by an ordered init function that threads an initializer list so later
//! initializers can reuse earlier results.

use std::collections::{HashMap, HashSet};

use crate::atom::{Atom, Const, Temp, Top};
use crate::code::Code;
use crate::defns::{BlockId, ClosureId, DefnRef, Program, TopId};
use crate::errors::Failure;
use crate::llvm;
use crate::tail::{BlockCall, Tail};
use crate::tyset::TypeSet;
use crate::types::{Cfun, TyconBody, Type};

// ============================================================================
// TypeMap
// ============================================================================

/// A `TypeSet` specialization that maps canonical MIL types to LLVM types
/// and computes object layouts.
pub struct TypeMap {
    set: TypeSet,
}

impl TypeMap {
    pub fn new() -> TypeMap {
        TypeMap { set: TypeSet::new() }
    }

    /// The generic pointer type for data objects: a tag-first struct.
    pub fn data_ptr() -> llvm::Type {
        llvm::Type::Struct(vec![llvm::Type::I32]).ptr()
    }

    /// The generic pointer type for closures: a code-slot-first struct.
    pub fn clos_ptr() -> llvm::Type {
        llvm::Type::Struct(vec![llvm::Type::I8.ptr()]).ptr()
    }

    /// The LLVM type of a MIL value type.
    pub fn to_llvm(&mut self, ty: &Type) -> llvm::Type {
        let ty = self.set.canon_type(ty);
        if let Some(ts) = ty.tuple_components() {
            return match ts.len() {
                0 => llvm::Type::Void,
                1 => self.to_llvm(&ts[0]),
                _ => llvm::Type::Struct(ts.iter().map(|t| self.to_llvm(t)).collect()),
            };
        }
        if ty.milfun_components().is_some() {
            return TypeMap::clos_ptr();
        }
        let (head, args) = ty.spine();
        let c = match head {
            Type::Con(c) => c,
            _ => {
                log::debug!("lowering a non-constructor type {} as a word", ty);
                return llvm::Type::I32;
            }
        };
        match c.body() {
            TyconBody::Word => llvm::Type::I32,
            TyconBody::Flag => llvm::Type::I1,
            TyconBody::Bit if args.len() == 1 => match args[0].as_nat() {
                Some(n) if n <= 1 => llvm::Type::I1,
                Some(n) if n <= 8 => llvm::Type::I8,
                Some(n) if n <= 32 => llvm::Type::I32,
                _ => llvm::Type::I64,
            },
            TyconBody::Ix => llvm::Type::I32,
            TyconBody::ARef => llvm::Type::I8.ptr(),
            TyconBody::Data => TypeMap::data_ptr(),
            _ => {
                log::debug!("lowering type {} as a word", ty);
                llvm::Type::I32
            }
        }
    }

    /// The layout struct for objects built by a data constructor: the tag
    /// in slot 0 followed by the fields.
    pub fn data_layout(&mut self, cfun: &Cfun) -> llvm::Type {
        let mut fields = vec![llvm::Type::I32];
        for t in &cfun.alloc_type().stored {
            fields.push(self.to_llvm(t));
        }
        llvm::Type::Struct(fields)
    }

    /// The layout struct for closures of a definition: the code pointer in
    /// slot 0 followed by the stored parameters.
    pub fn closure_layout(&mut self, prog: &Program, k: ClosureId) -> llvm::Type {
        let mut fields = vec![llvm::Type::I8.ptr()];
        for p in &prog.closure(k).params {
            let t = p.ty();
            fields.push(self.to_llvm(&t));
        }
        llvm::Type::Struct(fields)
    }

    /// The return type of the function generated for a block.
    fn block_ret(&mut self, prog: &Program, b: BlockId) -> llvm::Type {
        match prog.block(b).declared.as_ref() {
            Some(bt) => self.to_llvm(&bt.rng),
            None => llvm::Type::Void,
        }
    }

    /// The return type of the function generated for a closure definition.
    fn closure_ret(&mut self, prog: &Program, k: ClosureId) -> llvm::Type {
        match prog.closure(k).declared.as_ref() {
            Some(at) => match at.result.milfun_components() {
                Some((_, rng)) => self.to_llvm(&rng),
                None => llvm::Type::Void,
            },
            None => llvm::Type::Void,
        }
    }
}

impl Default for TypeMap {
    fn default() -> Self {
        TypeMap::new()
    }
}

// ============================================================================
// Global values
// ============================================================================

/// Where the value of a top-level component can be found at runtime.
#[derive(Debug, Clone)]
enum GlobalValue {
    /// A compile-time constant, usable directly.
    Static(llvm::Value),
    /// A mutable global filled in by the init function.
    Var(String, llvm::Type),
}

/// The initializer list threaded through the init function: each entry
/// records that a top-level component has been computed into a local.
#[derive(Debug, Default)]
struct InitVarMap {
    inits: Vec<(TopId, usize, llvm::Value)>,
}

impl InitVarMap {
    fn lookup(&self, top: TopId, index: usize) -> Option<llvm::Value> {
        self.inits
            .iter()
            .find(|(t, i, _)| *t == top && *i == index)
            .map(|(_, _, v)| v.clone())
    }

    fn map_global(&mut self, top: TopId, index: usize, v: llvm::Value) {
        self.inits.push((top, index, v));
    }
}

// ============================================================================
// The lowering driver
// ============================================================================

/// Lower a monomorphic program to an LLVM module.
pub fn lower(prog: &Program) -> Result<llvm::Module, Failure> {
    let mut tm = TypeMap::new();
    let mut module = llvm::Module::new();

    // the allocator is an external symbol; policy lives outside the core
    module.add(llvm::Defn::Declare {
        name: "alloc".to_string(),
        ty: llvm::Type::fun(vec![llvm::Type::I32], llvm::Type::I8.ptr()),
    });

    let live = if prog.entries().is_empty() {
        None
    } else {
        Some(prog.reachable())
    };
    let is_live = |d: DefnRef| live.as_ref().map_or(true, |l| l.contains(&d));
    let owners = function_owner_blocks(prog);
    let order = prog.dependency_order();

    // statics first: later constants and initializers refer to them
    let mut globals: HashMap<(TopId, usize), GlobalValue> = HashMap::new();
    for d in &order {
        if let DefnRef::Top(t) = d {
            if is_live(*d) && prog.top(*t).is_static {
                emit_static(prog, &mut tm, &mut module, *t, &mut globals)?;
            }
        }
    }

    // mutable globals for everything initialized at runtime
    for d in &order {
        if let DefnRef::Top(t) = d {
            if is_live(*d) && !prog.top(*t).is_static {
                for (i, lhs) in prog.top(*t).lhs.iter().enumerate() {
                    let ty = match &lhs.declared {
                        Some(s) => tm.to_llvm(&s.body),
                        None => llvm::Type::I32,
                    };
                    let init = zero_value(&ty);
                    module.add(llvm::Defn::GlobalVar {
                        name: lhs.name.clone(),
                        ty: ty.clone(),
                        init,
                    });
                    globals.insert((*t, i), GlobalValue::Var(lhs.name.clone(), ty));
                }
            }
        }
    }

    // functions for closures and for blocks that are genuine call targets
    for d in &order {
        match d {
            DefnRef::Block(b) if is_live(*d) && owners.contains(b) => {
                let f = emit_block_fn(prog, &mut tm, &mut module, &owners, &globals, *b)?;
                module.add(llvm::Defn::Func(f));
            }
            DefnRef::Closure(k) if is_live(*d) => {
                let f = emit_closure_fn(prog, &mut tm, &mut module, &owners, &globals, *k)?;
                module.add(llvm::Defn::Func(f));
            }
            _ => {}
        }
    }

    // the ordered init function computes the runtime globals
    emit_init(prog, &mut tm, &mut module, &owners, &globals, &order, &is_live)?;

    Ok(module)
}

/// The blocks that become functions: targets of non-tail calls and of
/// top-level initializer tails. Everything else is inlined into its
/// callers' control flow graphs.
fn function_owner_blocks(prog: &Program) -> HashSet<BlockId> {
    let mut owners = HashSet::new();
    fn scan_code(code: &Code, owners: &mut HashSet<BlockId>) {
        match code {
            Code::Bind { tail, rest, .. } => {
                if let Tail::BlockCall(bc) = tail {
                    owners.insert(bc.block);
                }
                scan_code(rest, owners);
            }
            _ => {}
        }
    }
    for (_, b) in prog.blocks.iter() {
        scan_code(&b.code, &mut owners);
    }
    for (_, t) in prog.tops.iter() {
        if let Tail::BlockCall(bc) = &t.tail {
            owners.insert(bc.block);
        }
    }
    owners
}

fn zero_value(ty: &llvm::Type) -> llvm::Value {
    match ty {
        llvm::Type::Ptr(_) => llvm::Value::Null(ty.clone()),
        _ => llvm::Value::Int(0),
    }
}

// ============================================================================
// Static constants
// ============================================================================

fn emit_static(
    prog: &Program,
    tm: &mut TypeMap,
    module: &mut llvm::Module,
    t: TopId,
    globals: &mut HashMap<(TopId, usize), GlobalValue>,
) -> Result<(), Failure> {
    let top = prog.top(t);
    let value = match &top.tail {
        Tail::Return(atoms) if atoms.len() == 1 => static_atom(prog, globals, &atoms[0])?,
        Tail::DataAlloc { cfun, args } => {
            let mut vals = vec![llvm::Value::Int(cfun.tag() as i64)];
            for a in args {
                vals.push(static_atom(prog, globals, a)?);
            }
            static_alloc(module, tm.data_layout(cfun), TypeMap::data_ptr(), vals)
        }
        Tail::ClosAlloc { closure, args } => {
            let code_ptr = llvm::Value::Global(
                llvm::Type::I8.ptr(),
                closure_label(&prog.closure(*closure).name),
            );
            let mut vals = vec![code_ptr];
            for a in args {
                vals.push(static_atom(prog, globals, a)?);
            }
            static_alloc(module, tm.closure_layout(prog, *closure), TypeMap::clos_ptr(), vals)
        }
        _ => {
            return Err(Failure::Internal(format!(
                "top-level {} marked static but holds {}",
                top.lhs[0].name, top.tail
            )))
        }
    };
    globals.insert((t, 0), GlobalValue::Static(value));
    Ok(())
}

fn static_atom(
    prog: &Program,
    globals: &HashMap<(TopId, usize), GlobalValue>,
    a: &Atom,
) -> Result<llvm::Value, Failure> {
    match a {
        Atom::Lit(Const::Word(n)) => Ok(llvm::Value::Int(*n)),
        Atom::Lit(Const::Flag(b)) => Ok(llvm::Value::Int(*b as i64)),
        Atom::Top(Top::Def { top, index }) => match globals.get(&(*top, *index)) {
            Some(GlobalValue::Static(v)) => Ok(v.clone()),
            _ => Err(Failure::Internal(
                "static allocator refers to a value that is not yet static".into(),
            )),
        },
        _ => Err(Failure::Internal(format!("non-static atom {} in a static allocator", a))),
    }
}

/// Emit a private constant for the layout and an alias that casts it to
/// the generic object pointer type.
fn static_alloc(
    module: &mut llvm::Module,
    layout: llvm::Type,
    generic: llvm::Type,
    fields: Vec<llvm::Value>,
) -> llvm::Value {
    let layout_name = module.fresh_name("layout");
    module.add(llvm::Defn::Const(llvm::PrivConst {
        name: layout_name.clone(),
        ty: layout.clone(),
        fields,
    }));
    let value_name = module.fresh_name("val");
    module.add(llvm::Defn::Alias {
        name: value_name.clone(),
        ty: generic.clone(),
        of: llvm::Value::Global(layout.ptr(), layout_name),
    });
    llvm::Value::Global(generic, value_name)
}

fn closure_label(name: &str) -> String {
    format!("clos_{}", name)
}

// ============================================================================
// Function emission
// ============================================================================

/// One pending operation of the basic block being built.
enum Step {
    Op(llvm::Value, llvm::Rhs),
    Store(llvm::Value, llvm::Value),
}

fn seal(steps: Vec<Step>, term: llvm::Code) -> llvm::Code {
    steps.into_iter().rev().fold(term, |rest, s| match s {
        Step::Op(l, r) => llvm::Code::Op(l, r, Box::new(rest)),
        Step::Store(v, a) => llvm::Code::Store(v, a, Box::new(rest)),
    })
}

struct Emitter<'a> {
    prog: &'a Program,
    tm: &'a mut TypeMap,
    module: &'a mut llvm::Module,
    owners: &'a HashSet<BlockId>,
    globals: &'a HashMap<(TopId, usize), GlobalValue>,
    /// The root of this function's CFG.
    root: BlockId,
    regs: u32,
    labels: HashMap<BlockId, String>,
    phi_regs: HashMap<BlockId, Vec<llvm::Value>>,
    /// (target, predecessor label, argument values)
    edges: Vec<(BlockId, String, Vec<llvm::Value>)>,
    out: Vec<llvm::BasicBlock>,
    varmap: HashMap<Temp, llvm::Value>,
    ret: llvm::Type,
    /// The initializer list, populated only inside the init function.
    inits: InitVarMap,
}

impl<'a> Emitter<'a> {
    fn reg(&mut self, ty: llvm::Type) -> llvm::Value {
        let n = self.regs;
        self.regs += 1;
        llvm::Value::Local(ty, format!("r{}", n))
    }

    fn fresh_label(&mut self, prefix: &str) -> String {
        let n = self.regs;
        self.regs += 1;
        format!("{}{}", prefix, n)
    }

    /// The blocks reachable from the root through branch transfers. A
    /// branch to an owner block other than the root leaves the function as
    /// a call instead.
    fn discover(&mut self) {
        let mut work = vec![self.root];
        let mut seen = HashSet::new();
        while let Some(b) = work.pop() {
            if !seen.insert(b) {
                continue;
            }
            let label = format!("bb_{}", self.prog.block(b).name);
            self.labels.insert(b, label);
            let params = self.prog.block(b).params.clone();
            let regs: Vec<llvm::Value> = params
                .iter()
                .map(|p| {
                    let t = p.ty();
                    let lt = self.tm.to_llvm(&t);
                    self.reg(lt)
                })
                .collect();
            for (p, r) in params.iter().zip(&regs) {
                self.varmap.insert(p.clone(), r.clone());
            }
            self.phi_regs.insert(b, regs);
            for succ in branch_successors(&self.prog.block(b).code) {
                if succ == self.root || !self.owners.contains(&succ) {
                    work.push(succ);
                }
            }
        }
    }

    fn emit_all(&mut self) -> Result<(), Failure> {
        let mut blocks: Vec<BlockId> = self.labels.keys().copied().collect();
        blocks.sort_by_key(|b| u32::from(b.into_raw()));
        for b in blocks {
            let label = self.labels[&b].clone();
            let code = self.prog.block(b).code.clone();
            let mut steps = Vec::new();
            let term = self.emit_code(&label, &mut steps, &code)?;
            self.out.push(llvm::BasicBlock {
                label,
                phis: Vec::new(),
                code: seal(steps, term),
            });
        }
        Ok(())
    }

    /// Attach the recorded edges as phi bindings on each block's params.
    fn attach_phis(&mut self) {
        for bb in &mut self.out {
            let id = self
                .labels
                .iter()
                .find(|(_, l)| **l == bb.label)
                .map(|(b, _)| *b);
            let Some(id) = id else { continue };
            let regs = self.phi_regs[&id].clone();
            let mut phis = Vec::new();
            for (i, r) in regs.into_iter().enumerate() {
                let incoming: Vec<(llvm::Value, String)> = self
                    .edges
                    .iter()
                    .filter(|(t, _, _)| *t == id)
                    .map(|(_, pred, args)| (args[i].clone(), pred.clone()))
                    .collect();
                phis.push((r, incoming));
            }
            bb.phis = phis;
        }
    }

    // ------------------------------------------------------------------------
    // Atoms and calls
    // ------------------------------------------------------------------------

    /// The MIL type of an atom, when one is recorded.
    fn mil_atom_type(&self, a: &Atom) -> Option<Type> {
        match a {
            Atom::Var(t) => Some(t.ty()),
            Atom::Top(Top::Def { top, index }) => self
                .prog
                .top(*top)
                .lhs
                .get(*index)
                .and_then(|l| l.declared.as_ref())
                .map(|s| s.body.clone()),
            Atom::Top(Top::Ext(e)) => Some(self.prog.external(*e).declared.body.clone()),
            Atom::Lit(Const::Word(_)) => Some(Type::word()),
            Atom::Lit(Const::Flag(_)) => Some(Type::flag()),
        }
    }

    fn atom_value(&mut self, steps: &mut Vec<Step>, a: &Atom) -> Result<llvm::Value, Failure> {
        match a {
            Atom::Lit(Const::Word(n)) => Ok(llvm::Value::Int(*n)),
            Atom::Lit(Const::Flag(b)) => Ok(llvm::Value::Int(*b as i64)),
            Atom::Var(t) => self
                .varmap
                .get(t)
                .cloned()
                .ok_or_else(|| Failure::Internal(format!("no register for {}", t))),
            Atom::Top(Top::Def { top, index }) => {
                // inside the init function, earlier results are reused
                // through the initializer list instead of being reloaded
                if let Some(v) = self.inits.lookup(*top, *index) {
                    return Ok(v);
                }
                match self.globals.get(&(*top, *index)) {
                    Some(GlobalValue::Static(v)) => Ok(v.clone()),
                    Some(GlobalValue::Var(name, ty)) => {
                        let addr = llvm::Value::Global(ty.clone().ptr(), name.clone());
                        let r = self.reg(ty.clone());
                        steps.push(Step::Op(r.clone(), llvm::Rhs::Load(addr)));
                        Ok(r)
                    }
                    None => Err(Failure::Internal("reference to an unlowered top-level".into())),
                }
            }
            Atom::Top(Top::Ext(e)) => {
                let ext = self.prog.external(*e);
                let ty = self.tm.to_llvm(&ext.declared.body);
                Ok(llvm::Value::Global(ty, ext.name.clone()))
            }
        }
    }

    fn atom_values(
        &mut self,
        steps: &mut Vec<Step>,
        atoms: &[Atom],
    ) -> Result<Vec<llvm::Value>, Failure> {
        atoms.iter().map(|a| self.atom_value(steps, a)).collect()
    }

    /// Emit a call to the function generated for a block.
    fn call_block(
        &mut self,
        steps: &mut Vec<Step>,
        bc: &BlockCall,
    ) -> Result<(llvm::Value, llvm::Type), Failure> {
        let args = self.atom_values(steps, &bc.args)?;
        let ret = self.tm.block_ret(self.prog, bc.block);
        let fty = llvm::Type::fun(args.iter().map(|a| a.ty()).collect(), ret.clone());
        let callee = llvm::Value::Global(fty, self.prog.block(bc.block).name.clone());
        let r = self.reg(ret.clone());
        steps.push(Step::Op(r.clone(), llvm::Rhs::Call(ret.clone(), callee, args)));
        Ok((r, ret))
    }

    /// Expand an allocator: size the layout with `getelementptr null, 1`,
    /// call `alloc`, store the tag and fields, and cast to the generic
    /// object pointer type.
    fn emit_alloc(
        &mut self,
        steps: &mut Vec<Step>,
        layout: llvm::Type,
        generic: llvm::Type,
        slot0: llvm::Value,
        fields: Vec<llvm::Value>,
    ) -> llvm::Value {
        let layout_ptr = layout.clone().ptr();
        let past = self.reg(layout_ptr.clone());
        steps.push(Step::Op(
            past.clone(),
            llvm::Rhs::Getelementptr(llvm::Value::Null(layout_ptr.clone()), vec![llvm::Value::Int(1)]),
        ));
        let size = self.reg(llvm::Type::I32);
        steps.push(Step::Op(size.clone(), llvm::Rhs::PtrToInt(past, llvm::Type::I32)));
        let raw = self.reg(llvm::Type::I8.ptr());
        let alloc_ty = llvm::Type::fun(vec![llvm::Type::I32], llvm::Type::I8.ptr());
        steps.push(Step::Op(
            raw.clone(),
            llvm::Rhs::Call(
                llvm::Type::I8.ptr(),
                llvm::Value::Global(alloc_ty, "alloc".to_string()),
                vec![size],
            ),
        ));
        let obj = self.reg(layout_ptr.clone());
        steps.push(Step::Op(obj.clone(), llvm::Rhs::Bitcast(raw, layout_ptr)));

        // slot 0 holds the tag or code pointer, fields follow
        self.store_slot(steps, &obj, 0, slot0);
        for (i, v) in fields.into_iter().enumerate() {
            self.store_slot(steps, &obj, i + 1, v);
        }

        let out = self.reg(generic.clone());
        steps.push(Step::Op(out.clone(), llvm::Rhs::Bitcast(obj, generic)));
        out
    }

    fn store_slot(&mut self, steps: &mut Vec<Step>, obj: &llvm::Value, n: usize, v: llvm::Value) {
        let addr = self.reg(v.ty().ptr());
        steps.push(Step::Op(
            addr.clone(),
            llvm::Rhs::Getelementptr(obj.clone(), vec![llvm::Value::Int(0), llvm::Value::Int(n as i64)]),
        ));
        steps.push(Step::Store(v, addr));
    }

    /// Compute a tail into a value; `None` when the tail produces nothing.
    fn tail_value(
        &mut self,
        steps: &mut Vec<Step>,
        tail: &Tail,
    ) -> Result<Option<llvm::Value>, Failure> {
        match tail {
            Tail::Return(atoms) => match atoms.len() {
                0 => Ok(None),
                1 => Ok(Some(self.atom_value(steps, &atoms[0])?)),
                _ => {
                    let vals = self.atom_values(steps, atoms)?;
                    let ty = llvm::Type::Struct(vals.iter().map(|v| v.ty()).collect());
                    Ok(Some(llvm::Value::Aggregate(ty, vals)))
                }
            },
            Tail::BlockCall(bc) => {
                let (r, ret) = self.call_block(steps, bc)?;
                Ok(if ret == llvm::Type::Void { None } else { Some(r) })
            }
            Tail::Enter { f, args } => {
                let ret = match self.mil_atom_type(f).and_then(|t| t.milfun_components()) {
                    Some((_, rng)) => self.tm.to_llvm(&rng),
                    None => llvm::Type::I32,
                };
                let clos = self.atom_value(steps, f)?;
                let args = self.atom_values(steps, args)?;
                // load the code pointer out of slot 0 and cast it to the
                // precise function type before the indirect call
                let slot = self.reg(llvm::Type::I8.ptr().ptr());
                steps.push(Step::Op(
                    slot.clone(),
                    llvm::Rhs::Getelementptr(
                        clos.clone(),
                        vec![llvm::Value::Int(0), llvm::Value::Int(0)],
                    ),
                ));
                let raw = self.reg(llvm::Type::I8.ptr());
                steps.push(Step::Op(raw.clone(), llvm::Rhs::Load(slot)));
                let mut formal_tys = vec![clos.ty()];
                formal_tys.extend(args.iter().map(|a| a.ty()));
                let fty = llvm::Type::fun(formal_tys, ret.clone()).ptr();
                let code = self.reg(fty.clone());
                steps.push(Step::Op(code.clone(), llvm::Rhs::Bitcast(raw, fty)));
                let r = self.reg(ret.clone());
                let mut call_args = vec![clos];
                call_args.extend(args);
                steps.push(Step::Op(r.clone(), llvm::Rhs::Call(ret, code, call_args)));
                Ok(Some(r))
            }
            Tail::PrimCall { prim, args } => {
                let args = self.atom_values(steps, args)?;
                let name = format!("prim_{}", prim.id());
                let rng = prim.block_type().rng.clone();
                let ret = self.tm.to_llvm(&rng);
                let fty = llvm::Type::fun(args.iter().map(|a| a.ty()).collect(), ret.clone());
                if self.module.find(&name).is_none() {
                    self.module.add(llvm::Defn::Declare { name: name.clone(), ty: fty.clone() });
                }
                let r = self.reg(ret.clone());
                steps.push(Step::Op(
                    r.clone(),
                    llvm::Rhs::Call(ret, llvm::Value::Global(fty, name), args),
                ));
                Ok(Some(r))
            }
            Tail::Sel { cfun, index, from } => {
                let obj = self.atom_value(steps, from)?;
                let layout = self.tm.data_layout(cfun).ptr();
                let cast = self.reg(layout.clone());
                steps.push(Step::Op(cast.clone(), llvm::Rhs::Bitcast(obj, layout)));
                let field_ty = {
                    let t = cfun.alloc_type().stored[*index].clone();
                    self.tm.to_llvm(&t)
                };
                let addr = self.reg(field_ty.clone().ptr());
                steps.push(Step::Op(
                    addr.clone(),
                    llvm::Rhs::Getelementptr(
                        cast,
                        vec![llvm::Value::Int(0), llvm::Value::Int(*index as i64 + 1)],
                    ),
                ));
                let r = self.reg(field_ty);
                steps.push(Step::Op(r.clone(), llvm::Rhs::Load(addr)));
                Ok(Some(r))
            }
            Tail::DataAlloc { cfun, args } => {
                let fields = self.atom_values(steps, args)?;
                let layout = self.tm.data_layout(cfun);
                let v = self.emit_alloc(
                    steps,
                    layout,
                    TypeMap::data_ptr(),
                    llvm::Value::Int(cfun.tag() as i64),
                    fields,
                );
                Ok(Some(v))
            }
            Tail::ClosAlloc { closure, args } => {
                let fields = self.atom_values(steps, args)?;
                let layout = self.tm.closure_layout(self.prog, *closure);
                let code_ptr = llvm::Value::Global(
                    llvm::Type::I8.ptr(),
                    closure_label(&self.prog.closure(*closure).name),
                );
                let v = self.emit_alloc(steps, layout, TypeMap::clos_ptr(), code_ptr, fields);
                Ok(Some(v))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Code emission
    // ------------------------------------------------------------------------

    fn emit_code(
        &mut self,
        label: &str,
        steps: &mut Vec<Step>,
        code: &Code,
    ) -> Result<llvm::Code, Failure> {
        match code {
            Code::Bind { vs, tail, rest } => {
                match self.tail_value(steps, tail)? {
                    None => {}
                    Some(v) => match vs.len() {
                        0 => {}
                        1 => {
                            self.varmap.insert(vs[0].clone(), v);
                        }
                        n => {
                            // a multi-result tail yields a struct; bind
                            // each component through an extractvalue
                            for i in 0..n {
                                let t = vs[i].ty();
                                let lt = self.tm.to_llvm(&t);
                                let r = self.reg(lt);
                                steps.push(Step::Op(
                                    r.clone(),
                                    llvm::Rhs::ExtractValue(v.clone(), i),
                                ));
                                self.varmap.insert(vs[i].clone(), r);
                            }
                        }
                    },
                }
                self.emit_code(label, steps, rest)
            }
            Code::Done(tail) => self.emit_transfer(label, steps, tail),
            Code::Case { scrutinee, alts, default } => {
                let obj = self.atom_value(steps, scrutinee)?;
                let cast = self.reg(TypeMap::data_ptr());
                steps.push(Step::Op(cast.clone(), llvm::Rhs::Bitcast(obj, TypeMap::data_ptr())));
                let tag_addr = self.reg(llvm::Type::I32.ptr());
                steps.push(Step::Op(
                    tag_addr.clone(),
                    llvm::Rhs::Getelementptr(cast, vec![llvm::Value::Int(0), llvm::Value::Int(0)]),
                ));
                let tag = self.reg(llvm::Type::I32);
                steps.push(Step::Op(tag.clone(), llvm::Rhs::Load(tag_addr)));

                let mut cases = Vec::new();
                for alt in alts {
                    let l = self.branch_target(label, steps, &alt.call)?;
                    cases.push((alt.cfun.tag() as i64, l));
                }
                let default_label = match default {
                    Some(d) => self.branch_target(label, steps, d)?,
                    // a case with no default cannot fall through in a
                    // well-typed program; reuse the first alternative
                    None => cases
                        .first()
                        .map(|(_, l)| l.clone())
                        .unwrap_or_else(|| label.to_string()),
                };
                Ok(llvm::Code::Switch(tag, cases, default_label))
            }
            Code::If { cond, if_true, if_false } => {
                let c = self.atom_value(steps, cond)?;
                let lt = self.branch_target(label, steps, if_true)?;
                let lf = self.branch_target(label, steps, if_false)?;
                Ok(llvm::Code::CondBr(c, lt, lf))
            }
        }
    }

    /// The label to branch to for a block call in branch position: a
    /// direct edge to an included block, or a trampoline that calls an
    /// owner function and returns its result.
    fn branch_target(
        &mut self,
        _pred: &str,
        steps: &mut Vec<Step>,
        bc: &BlockCall,
    ) -> Result<String, Failure> {
        if self.labels.contains_key(&bc.block) {
            // argument values are computed in the predecessor, then carried
            // by an edge block so each phi sees one predecessor label
            let args = self.atom_values(steps, bc.args.as_slice())?;
            let edge = self.fresh_label("edge");
            let target = self.labels[&bc.block].clone();
            self.edges.push((bc.block, edge.clone(), args));
            self.out.push(llvm::BasicBlock {
                label: edge.clone(),
                phis: Vec::new(),
                code: llvm::Code::Br(target),
            });
            Ok(edge)
        } else {
            let mut tsteps = Vec::new();
            let (r, ret) = {
                let args = self.atom_values(steps, bc.args.as_slice())?;
                let ret = self.tm.block_ret(self.prog, bc.block);
                let fty = llvm::Type::fun(args.iter().map(|a| a.ty()).collect(), ret.clone());
                let callee = llvm::Value::Global(fty, self.prog.block(bc.block).name.clone());
                let r = self.reg(ret.clone());
                tsteps.push(Step::Op(r.clone(), llvm::Rhs::Call(ret.clone(), callee, args)));
                (r, ret)
            };
            let term = if ret == llvm::Type::Void || self.ret == llvm::Type::Void {
                llvm::Code::RetVoid
            } else {
                llvm::Code::Ret(r)
            };
            let label = self.fresh_label("tramp");
            self.out.push(llvm::BasicBlock {
                label: label.clone(),
                phis: Vec::new(),
                code: seal(tsteps, term),
            });
            Ok(label)
        }
    }

    /// Emit a tail in transfer position: a branch, a tail call, or a
    /// return.
    fn emit_transfer(
        &mut self,
        label: &str,
        steps: &mut Vec<Step>,
        tail: &Tail,
    ) -> Result<llvm::Code, Failure> {
        if let Tail::BlockCall(bc) = tail {
            if self.labels.contains_key(&bc.block) {
                let args = self.atom_values(steps, &bc.args)?;
                let target = self.labels[&bc.block].clone();
                self.edges.push((bc.block, label.to_string(), args));
                return Ok(llvm::Code::Br(target));
            }
        }
        match self.tail_value(steps, tail)? {
            None => Ok(llvm::Code::RetVoid),
            Some(v) => {
                if self.ret == llvm::Type::Void {
                    Ok(llvm::Code::RetVoid)
                } else {
                    Ok(llvm::Code::Ret(v))
                }
            }
        }
    }
}

/// The branch successors of a code sequence: the blocks its cases,
/// conditionals, and terminal calls transfer to.
fn branch_successors(code: &Code) -> Vec<BlockId> {
    match code {
        Code::Bind { rest, .. } => branch_successors(rest),
        Code::Done(Tail::BlockCall(bc)) => vec![bc.block],
        Code::Done(_) => Vec::new(),
        Code::Case { alts, default, .. } => {
            let mut ss: Vec<BlockId> = alts.iter().map(|a| a.call.block).collect();
            if let Some(d) = default {
                ss.push(d.block);
            }
            ss
        }
        Code::If { if_true, if_false, .. } => vec![if_true.block, if_false.block],
    }
}

/// Emit the function for a block that is a genuine call target.
fn emit_block_fn(
    prog: &Program,
    tm: &mut TypeMap,
    module: &mut llvm::Module,
    owners: &HashSet<BlockId>,
    globals: &HashMap<(TopId, usize), GlobalValue>,
    b: BlockId,
) -> Result<llvm::FuncDefn, Failure> {
    let ret = tm.block_ret(prog, b);
    let mut em = Emitter {
        prog,
        tm,
        module,
        owners,
        globals,
        root: b,
        regs: 0,
        labels: HashMap::new(),
        phi_regs: HashMap::new(),
        edges: Vec::new(),
        out: Vec::new(),
        varmap: HashMap::new(),
        ret: ret.clone(),
        inits: InitVarMap::default(),
    };
    em.discover();

    // formals feed the root block through the entry edge
    let formals: Vec<llvm::Value> = prog
        .block(b)
        .params
        .iter()
        .map(|p| {
            let t = p.ty();
            let lt = em.tm.to_llvm(&t);
            em.reg(lt)
        })
        .collect();
    let root_label = em.labels[&b].clone();
    em.edges.push((b, "entry".to_string(), formals.clone()));
    em.out.push(llvm::BasicBlock {
        label: "entry".to_string(),
        phis: Vec::new(),
        code: llvm::Code::Br(root_label),
    });

    em.emit_all()?;
    em.attach_phis();
    let blocks = std::mem::take(&mut em.out);
    Ok(llvm::FuncDefn { name: prog.block(b).name.clone(), ret, formals, blocks })
}

/// Emit the function for a closure definition: the closure pointer plus
/// the invocation arguments, with stored parameters loaded from slots
/// 1..N of the closure layout.
fn emit_closure_fn(
    prog: &Program,
    tm: &mut TypeMap,
    module: &mut llvm::Module,
    owners: &HashSet<BlockId>,
    globals: &HashMap<(TopId, usize), GlobalValue>,
    k: ClosureId,
) -> Result<llvm::FuncDefn, Failure> {
    let ret = tm.closure_ret(prog, k);
    let mut em = Emitter {
        prog,
        tm,
        module,
        owners,
        globals,
        root: BlockId::from_raw(0u32.into()),
        regs: 0,
        labels: HashMap::new(),
        phi_regs: HashMap::new(),
        edges: Vec::new(),
        out: Vec::new(),
        varmap: HashMap::new(),
        ret: ret.clone(),
        inits: InitVarMap::default(),
    };

    let clos = em.reg(TypeMap::clos_ptr());
    let mut formals = vec![clos.clone()];
    for a in &prog.closure(k).args {
        let t = a.ty();
        let lt = em.tm.to_llvm(&t);
        let r = em.reg(lt);
        em.varmap.insert(a.clone(), r.clone());
        formals.push(r);
    }

    // the closure's tail may branch into blocks; discover from each branch
    // successor of the tail
    let mut steps = Vec::new();
    if !prog.closure(k).params.is_empty() {
        // load stored values from the closure
        let layout = em.tm.closure_layout(prog, k).ptr();
        let ptr = em.reg(layout.clone());
        steps.push(Step::Op(ptr.clone(), llvm::Rhs::Bitcast(clos, layout)));
        let params = prog.closure(k).params.clone();
        for (n, p) in params.iter().enumerate() {
            let t = p.ty();
            let lt = em.tm.to_llvm(&t);
            let addr = em.reg(lt.clone().ptr());
            steps.push(Step::Op(
                addr.clone(),
                llvm::Rhs::Getelementptr(
                    ptr.clone(),
                    vec![llvm::Value::Int(0), llvm::Value::Int(n as i64 + 1)],
                ),
            ));
            let r = em.reg(lt);
            steps.push(Step::Op(r.clone(), llvm::Rhs::Load(addr)));
            em.varmap.insert(p.clone(), r);
        }
    }

    // discover the blocks the tail can branch to
    if let Tail::BlockCall(bc) = &prog.closure(k).tail {
        if !owners.contains(&bc.block) {
            em.root = bc.block;
            em.discover();
        }
    }

    let tail = prog.closure(k).tail.clone();
    let term = em.emit_transfer("entry", &mut steps, &tail)?;
    em.out.insert(
        0,
        llvm::BasicBlock { label: "entry".to_string(), phis: Vec::new(), code: seal(steps, term) },
    );

    em.emit_all()?;
    em.attach_phis();
    let blocks = std::mem::take(&mut em.out);
    Ok(llvm::FuncDefn {
        name: closure_label(&prog.closure(k).name),
        ret,
        formals,
        blocks,
    })
}

// ============================================================================
// The init function
// ============================================================================

/// Emit the ordered initialization function for runtime globals. The
/// definition order must be the leaves-first dependency order, which is
/// asserted by the initializer-list lookups: an initializer may only read
/// values that are static or already initialized.
fn emit_init(
    prog: &Program,
    tm: &mut TypeMap,
    module: &mut llvm::Module,
    owners: &HashSet<BlockId>,
    globals: &HashMap<(TopId, usize), GlobalValue>,
    order: &[DefnRef],
    is_live: &dyn Fn(DefnRef) -> bool,
) -> Result<(), Failure> {
    let runtime: Vec<TopId> = order
        .iter()
        .filter_map(|d| match d {
            DefnRef::Top(t) if is_live(*d) && !prog.top(*t).is_static => Some(*t),
            _ => None,
        })
        .collect();
    if runtime.is_empty() {
        return Ok(());
    }

    let mut em = Emitter {
        prog,
        tm,
        module,
        owners,
        globals,
        root: BlockId::from_raw(0u32.into()),
        regs: 0,
        labels: HashMap::new(),
        phi_regs: HashMap::new(),
        edges: Vec::new(),
        out: Vec::new(),
        varmap: HashMap::new(),
        ret: llvm::Type::Void,
        inits: InitVarMap::default(),
    };

    let mut steps = Vec::new();
    for t in runtime {
        // the leaves-first ordering is a precondition: an initializer may
        // only read values that are static or already on the list
        for a in prog.top(t).tail.atoms() {
            if let Atom::Top(Top::Def { top, index }) = a {
                let ok = em.inits.lookup(top, index).is_some()
                    || matches!(globals.get(&(top, index)), Some(GlobalValue::Static(_)))
                    || prog.top(top).is_static;
                if !ok {
                    return Err(Failure::Internal(format!(
                        "initializer reads {} before it is initialized",
                        prog.top(top).lhs[index].name
                    )));
                }
            }
        }
        let tail = prog.top(t).tail.clone();
        let value = em.tail_value(&mut steps, &tail)?;
        let n = prog.top(t).lhs.len();
        match (n, value) {
            (0, _) => {}
            (1, Some(v)) => {
                store_init(&mut steps, globals, t, 0, v.clone())?;
                em.inits.map_global(t, 0, v);
            }
            (_, Some(v)) => {
                for i in 0..n {
                    let lt = match globals.get(&(t, i)) {
                        Some(GlobalValue::Var(_, ty)) => ty.clone(),
                        _ => llvm::Type::I32,
                    };
                    let r = em.reg(lt);
                    steps.push(Step::Op(r.clone(), llvm::Rhs::ExtractValue(v.clone(), i)));
                    store_init(&mut steps, globals, t, i, r.clone())?;
                    em.inits.map_global(t, i, r);
                }
            }
            (_, None) => {
                return Err(Failure::Internal(
                    "initializer produced no value for a top-level".into(),
                ))
            }
        }
    }

    let blocks = vec![llvm::BasicBlock {
        label: "entry".to_string(),
        phis: Vec::new(),
        code: seal(steps, llvm::Code::RetVoid),
    }];
    module.add(llvm::Defn::Func(llvm::FuncDefn {
        name: "milc_init".to_string(),
        ret: llvm::Type::Void,
        formals: Vec::new(),
        blocks,
    }));
    Ok(())
}

fn store_init(
    steps: &mut Vec<Step>,
    globals: &HashMap<(TopId, usize), GlobalValue>,
    t: TopId,
    i: usize,
    v: llvm::Value,
) -> Result<(), Failure> {
    match globals.get(&(t, i)) {
        Some(GlobalValue::Var(name, ty)) => {
            let addr = llvm::Value::Global(ty.clone().ptr(), name.clone());
            steps.push(Step::Store(v, addr));
            Ok(())
        }
        _ => Err(Failure::Internal("initializer for a top-level with no global".into())),
    }
}
