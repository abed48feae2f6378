//! Tails: the terminal expressions of MIL code sequences.
//!
//! A tail produces a tuple of atoms. The seven forms cover returning,
//! entering a closure, calling a block or primitive, selecting a field,
//! and allocating data values or closures. The allocator forms are pure,
//! repeatable, and free of side effects.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::atom::{Atom, Temp, TempSubst};
use crate::defns::{BlockId, ClosureId, DefnRef, Program};
use crate::types::{BlockType, Cfun};

// ============================================================================
// Primitives
// ============================================================================

/// A primitive operation, shared by reference.
#[derive(Debug, Clone)]
pub struct Prim(Rc<PrimData>);

#[derive(Debug)]
pub struct PrimData {
    pub id: String,
    /// Pure primitives have no externally visible effects and no
    /// dependence on other effects.
    pub pure: bool,
    pub block_type: BlockType,
}

impl Prim {
    pub fn new(id: impl Into<String>, pure: bool, block_type: BlockType) -> Prim {
        Prim(Rc::new(PrimData { id: id.into(), pure, block_type }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn is_pure(&self) -> bool {
        self.0.pure
    }

    pub fn block_type(&self) -> &BlockType {
        &self.0.block_type
    }
}

impl PartialEq for Prim {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Prim {}

impl Hash for Prim {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for Prim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.id)
    }
}

// ============================================================================
// Block calls
// ============================================================================

/// A jump or call to a block with a list of arguments.
#[derive(Debug, Clone)]
pub struct BlockCall {
    pub block: BlockId,
    pub args: Vec<Atom>,
}

impl BlockCall {
    pub fn new(block: BlockId, args: Vec<Atom>) -> BlockCall {
        BlockCall { block, args }
    }

    pub fn apply(&self, s: &TempSubst) -> BlockCall {
        BlockCall { block: self.block, args: Atom::apply_all(&self.args, s) }
    }

    pub fn same(&self, other: &BlockCall) -> bool {
        self.block == other.block
            && self.args.len() == other.args.len()
            && self.args.iter().zip(&other.args).all(|(a, b)| a.same_atom(b))
    }

    pub fn alpha(&self, env: &[Temp], other: &BlockCall, oenv: &[Temp]) -> bool {
        self.block == other.block && Atom::alpha_atoms(&self.args, env, &other.args, oenv)
    }

    pub fn summary(&self) -> i64 {
        let mut s = 3 + 13 * u32::from(self.block.into_raw()) as i64;
        for a in &self.args {
            s = s.wrapping_mul(33).wrapping_add(a.summary());
        }
        s
    }

    /// The variables a call contributes, filtered by the callee's
    /// used-argument bitmap.
    pub fn used_vars(&self, prog: &Program, vs: &mut Vec<Temp>) {
        prog.block(self.block).used_vars_of_call(&self.args, vs);
    }

    pub fn add_vars(&self, vs: &mut Vec<Temp>) {
        Atom::add_vars_of(&self.args, vs);
    }
}

impl fmt::Display for BlockCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}(", u32::from(self.block.into_raw()))?;
        display_atoms(f, &self.args)?;
        write!(f, ")")
    }
}

fn display_atoms(f: &mut fmt::Formatter<'_>, atoms: &[Atom]) -> fmt::Result {
    for (i, a) in atoms.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", a)?;
    }
    Ok(())
}

// ============================================================================
// Tails
// ============================================================================

#[derive(Debug, Clone)]
pub enum Tail {
    /// Yield a tuple of atoms.
    Return(Vec<Atom>),
    /// Apply the closure held in `f` to the given arguments.
    Enter { f: Atom, args: Vec<Atom> },
    /// Jump or call to a block.
    BlockCall(BlockCall),
    /// Invoke a primitive.
    PrimCall { prim: Prim, args: Vec<Atom> },
    /// Project field `index` of constructor `cfun` out of `from`.
    Sel { cfun: Cfun, index: usize, from: Atom },
    /// Allocate a data value for a constructor.
    DataAlloc { cfun: Cfun, args: Vec<Atom> },
    /// Allocate a closure for a closure definition.
    ClosAlloc { closure: ClosureId, args: Vec<Atom> },
}

impl Tail {
    pub fn is_allocator(&self) -> bool {
        matches!(self, Tail::DataAlloc { .. } | Tail::ClosAlloc { .. })
    }

    /// Whether this tail has no externally visible side effect.
    pub fn has_no_effect(&self) -> bool {
        match self {
            Tail::Return(_) | Tail::Sel { .. } => true,
            Tail::PrimCall { prim, .. } => prim.is_pure(),
            t => t.is_allocator(),
        }
    }

    /// Whether the result of a previous use of the same tail can be reused
    /// instead of repeating it. Only allocators qualify.
    pub fn is_repeatable(&self) -> bool {
        self.is_allocator()
    }

    pub fn is_pure(&self) -> bool {
        self.is_allocator()
    }

    /// The argument atoms of this tail, in order.
    pub fn atoms(&self) -> Vec<Atom> {
        match self {
            Tail::Return(atoms) => atoms.clone(),
            Tail::Enter { f, args } => {
                let mut v = vec![f.clone()];
                v.extend(args.iter().cloned());
                v
            }
            Tail::BlockCall(bc) => bc.args.clone(),
            Tail::PrimCall { args, .. } => args.clone(),
            Tail::Sel { from, .. } => vec![from.clone()],
            Tail::DataAlloc { args, .. } => args.clone(),
            Tail::ClosAlloc { args, .. } => args.clone(),
        }
    }

    /// Test for a free occurrence of a particular temporary.
    pub fn contains(&self, w: &Temp) -> bool {
        self.atoms().iter().any(|a| matches!(a, Atom::Var(t) if t == w))
    }

    pub fn contains_any(&self, ws: &[Temp]) -> bool {
        self.atoms()
            .iter()
            .any(|a| matches!(a, Atom::Var(t) if t.is_in(ws)))
    }

    /// Add every temporary mentioned by this tail to the list.
    pub fn add_vars(&self, vs: &mut Vec<Temp>) {
        for a in self.atoms() {
            a.add_vars(vs);
        }
    }

    /// Back-flow liveness: the variables this tail needs live.
    pub fn liveness(&self, vs: &mut Vec<Temp>) {
        self.add_vars(vs);
    }

    /// The variables used by this tail. Arguments of block calls and
    /// closure allocations only count when the callee's used-argument
    /// bitmap marks their position; every other call form uses all of its
    /// arguments.
    pub fn used_vars(&self, prog: &Program, vs: &mut Vec<Temp>) {
        match self {
            Tail::BlockCall(bc) => bc.used_vars(prog, vs),
            Tail::ClosAlloc { closure, args } => {
                prog.closure(*closure).used_vars_of_call(args, vs)
            }
            _ => self.add_vars(vs),
        }
    }

    pub fn apply(&self, s: &TempSubst) -> Tail {
        if s.is_empty() {
            return self.clone();
        }
        match self {
            Tail::Return(atoms) => Tail::Return(Atom::apply_all(atoms, s)),
            Tail::Enter { f, args } => {
                Tail::Enter { f: f.apply(s), args: Atom::apply_all(args, s) }
            }
            Tail::BlockCall(bc) => Tail::BlockCall(bc.apply(s)),
            Tail::PrimCall { prim, args } => {
                Tail::PrimCall { prim: prim.clone(), args: Atom::apply_all(args, s) }
            }
            Tail::Sel { cfun, index, from } => {
                Tail::Sel { cfun: cfun.clone(), index: *index, from: from.apply(s) }
            }
            Tail::DataAlloc { cfun, args } => {
                Tail::DataAlloc { cfun: cfun.clone(), args: Atom::apply_all(args, s) }
            }
            Tail::ClosAlloc { closure, args } => {
                Tail::ClosAlloc { closure: *closure, args: Atom::apply_all(args, s) }
            }
        }
    }

    /// Add the definitions this tail mentions to a dependency list.
    pub fn dependencies(&self, ds: &mut Vec<DefnRef>) {
        fn atom_deps(a: &Atom, ds: &mut Vec<DefnRef>) {
            if let Atom::Top(top) = a {
                let d = match top {
                    crate::atom::Top::Def { top, .. } => DefnRef::Top(*top),
                    crate::atom::Top::Ext(e) => DefnRef::Ext(*e),
                };
                if !ds.contains(&d) {
                    ds.push(d);
                }
            }
        }
        match self {
            Tail::BlockCall(bc) => {
                let d = DefnRef::Block(bc.block);
                if !ds.contains(&d) {
                    ds.push(d);
                }
            }
            Tail::ClosAlloc { closure, .. } => {
                let d = DefnRef::Closure(*closure);
                if !ds.contains(&d) {
                    ds.push(d);
                }
            }
            _ => {}
        }
        for a in self.atoms() {
            atom_deps(&a, ds);
        }
    }

    /// Test whether two tails are the same expression.
    pub fn same_tail(&self, other: &Tail) -> bool {
        fn same_atoms(xs: &[Atom], ys: &[Atom]) -> bool {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(a, b)| a.same_atom(b))
        }
        match (self, other) {
            (Tail::Return(a), Tail::Return(b)) => same_atoms(a, b),
            (Tail::Enter { f: f1, args: a1 }, Tail::Enter { f: f2, args: a2 }) => {
                f1.same_atom(f2) && same_atoms(a1, a2)
            }
            (Tail::BlockCall(b1), Tail::BlockCall(b2)) => b1.same(b2),
            (Tail::PrimCall { prim: p1, args: a1 }, Tail::PrimCall { prim: p2, args: a2 }) => {
                p1 == p2 && same_atoms(a1, a2)
            }
            (
                Tail::Sel { cfun: c1, index: i1, from: f1 },
                Tail::Sel { cfun: c2, index: i2, from: f2 },
            ) => c1 == c2 && i1 == i2 && f1.same_atom(f2),
            (Tail::DataAlloc { cfun: c1, args: a1 }, Tail::DataAlloc { cfun: c2, args: a2 }) => {
                c1 == c2 && same_atoms(a1, a2)
            }
            (
                Tail::ClosAlloc { closure: k1, args: a1 },
                Tail::ClosAlloc { closure: k2, args: a2 },
            ) => k1 == k2 && same_atoms(a1, a2),
            _ => false,
        }
    }

    /// An integer summary with the property that alpha equivalent tails
    /// have the same summary value.
    pub fn summary(&self) -> i64 {
        fn fold(base: i64, atoms: &[Atom]) -> i64 {
            atoms
                .iter()
                .fold(base, |s, a| s.wrapping_mul(33).wrapping_add(a.summary()))
        }
        match self {
            Tail::Return(atoms) => fold(1, atoms),
            Tail::Enter { f, args } => fold(fold(2, std::slice::from_ref(f)), args),
            Tail::BlockCall(bc) => bc.summary(),
            Tail::PrimCall { prim, args } => {
                fold(5 + 13 * (Rc::as_ptr(&prim.0) as usize as i64 >> 4), args)
            }
            Tail::Sel { cfun, index, from } => {
                fold(7 + 13 * cfun.tag() as i64 + 31 * *index as i64, std::slice::from_ref(from))
            }
            Tail::DataAlloc { cfun, args } => fold(11 + 13 * cfun.tag() as i64, args),
            Tail::ClosAlloc { closure, args } => {
                fold(13 + 13 * u32::from(closure.into_raw()) as i64, args)
            }
        }
    }

    /// Test two tails for alpha equivalence under the given environments.
    pub fn alpha_tail(&self, env: &[Temp], other: &Tail, oenv: &[Temp]) -> bool {
        match (self, other) {
            (Tail::Return(a), Tail::Return(b)) => Atom::alpha_atoms(a, env, b, oenv),
            (Tail::Enter { f: f1, args: a1 }, Tail::Enter { f: f2, args: a2 }) => {
                f1.alpha_atom(env, f2, oenv) && Atom::alpha_atoms(a1, env, a2, oenv)
            }
            (Tail::BlockCall(b1), Tail::BlockCall(b2)) => b1.alpha(env, b2, oenv),
            (Tail::PrimCall { prim: p1, args: a1 }, Tail::PrimCall { prim: p2, args: a2 }) => {
                p1 == p2 && Atom::alpha_atoms(a1, env, a2, oenv)
            }
            (
                Tail::Sel { cfun: c1, index: i1, from: f1 },
                Tail::Sel { cfun: c2, index: i2, from: f2 },
            ) => c1 == c2 && i1 == i2 && f1.alpha_atom(env, f2, oenv),
            (Tail::DataAlloc { cfun: c1, args: a1 }, Tail::DataAlloc { cfun: c2, args: a2 }) => {
                c1 == c2 && Atom::alpha_atoms(a1, env, a2, oenv)
            }
            (
                Tail::ClosAlloc { closure: k1, args: a1 },
                Tail::ClosAlloc { closure: k2, args: a2 },
            ) => k1 == k2 && Atom::alpha_atoms(a1, env, a2, oenv),
            _ => false,
        }
    }

    pub fn as_block_call(&self) -> Option<&BlockCall> {
        match self {
            Tail::BlockCall(bc) => Some(bc),
            _ => None,
        }
    }

    /// The closure allocation behind this tail, if it is one.
    pub fn look_for_clos_alloc(&self) -> Option<(ClosureId, &[Atom])> {
        match self {
            Tail::ClosAlloc { closure, args } => Some((*closure, args)),
            _ => None,
        }
    }

    /// The data allocation behind this tail, if it is one.
    pub fn look_for_data_alloc(&self) -> Option<(&Cfun, &[Atom])> {
        match self {
            Tail::DataAlloc { cfun, args } => Some((cfun, args)),
            _ => None,
        }
    }

    /// The atoms returned by this tail, when it is a plain return.
    pub fn returns_atoms(&self) -> Option<&[Atom]> {
        match self {
            Tail::Return(atoms) => Some(atoms),
            _ => None,
        }
    }

    /// Test for `return vs` with exactly the given temporaries. A wildcard
    /// return also matches, since the caller ignores the result.
    pub fn is_return_of(&self, vs: &[Temp]) -> bool {
        match self {
            Tail::Return(atoms) => {
                atoms.len() == vs.len()
                    && atoms.iter().zip(vs).all(|(a, v)| match a {
                        Atom::Var(t) => t == v || !t.is_live(),
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    /// Eliminate a newtype constructor or selector by returning the
    /// wrapped value directly.
    pub fn remove_newtype_cfun(self) -> Tail {
        match &self {
            Tail::DataAlloc { cfun, args } if cfun.is_newtype() && args.len() == 1 => {
                Tail::Return(vec![args[0].clone()])
            }
            Tail::Sel { cfun, index, from } if cfun.is_newtype() && *index == 0 => {
                Tail::Return(vec![from.clone()])
            }
            _ => self,
        }
    }
}

impl fmt::Display for Tail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tail::Return(atoms) => {
                write!(f, "return [")?;
                display_atoms(f, atoms)?;
                write!(f, "]")
            }
            Tail::Enter { f: fun, args } => {
                write!(f, "{} @ [", fun)?;
                display_atoms(f, args)?;
                write!(f, "]")
            }
            Tail::BlockCall(bc) => write!(f, "{}", bc),
            Tail::PrimCall { prim, args } => {
                write!(f, "{}((", prim)?;
                display_atoms(f, args)?;
                write!(f, "))")
            }
            Tail::Sel { cfun, index, from } => write!(f, "{} {} {}", cfun, index, from),
            Tail::DataAlloc { cfun, args } => {
                write!(f, "{}(", cfun)?;
                display_atoms(f, args)?;
                write!(f, ")")
            }
            Tail::ClosAlloc { closure, args } => {
                write!(f, "k{}{{", u32::from(closure.into_raw()))?;
                display_atoms(f, args)?;
                write!(f, "}}")
            }
        }
    }
}
