//! Definitions and the program that owns them.
//!
//! Blocks, closure definitions, top-level bindings, and externals live in
//! arenas inside a `Program`; definitions reference one another by index,
//! never by owning handle, so mutual recursion needs no special casing.
//! Passes iterate over definitions in declaration order, and the
//! dependency order used for emission is a leaves-first traversal fixed
//! once per program.

use std::collections::HashSet;
use std::fmt;

use la_arena::{Arena, Idx};

use crate::atom::{Atom, Temp, Top};
use crate::code::Code;
use crate::tail::{BlockCall, Tail};
use crate::types::{AllocType, BlockType, Cfun, IdSource, Scheme, Type};

pub type BlockId = Idx<Block>;
pub type ClosureId = Idx<ClosureDefn>;
pub type TopId = Idx<TopLevel>;
pub type ExtId = Idx<External>;

/// A reference to any kind of definition, used in dependency lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefnRef {
    Block(BlockId),
    Closure(ClosureId),
    Top(TopId),
    Ext(ExtId),
}

impl fmt::Display for DefnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefnRef::Block(b) => write!(f, "b{}", u32::from(b.into_raw())),
            DefnRef::Closure(k) => write!(f, "k{}", u32::from(k.into_raw())),
            DefnRef::Top(t) => write!(f, "g{}", u32::from(t.into_raw())),
            DefnRef::Ext(e) => write!(f, "e{}", u32::from(e.into_raw())),
        }
    }
}

/// The pattern of statically known constructor calls at each argument
/// position, used to key derived known-constructor specializations.
pub type KnownPattern = Vec<Option<Cfun>>;

// ============================================================================
// Blocks
// ============================================================================

/// A parameterized code sequence, callable by `BlockCall`.
#[derive(Debug)]
pub struct Block {
    pub name: String,
    pub params: Vec<Temp>,
    pub code: Code,
    /// The declared block type, if one was given or inferred.
    pub declared: Option<BlockType>,
    /// The monomorphic (dom, rng) pair recorded during inference.
    pub defining: Option<(Type, Type)>,
    /// Bitmap of used argument positions; `None` means none shown used yet.
    pub used_args: Option<Vec<bool>>,
    pub num_used_args: usize,
    /// Derived specializations of this block, keyed by call pattern.
    pub derived: Vec<(KnownPattern, BlockId)>,
    /// Number of calling occurrences, maintained by the inliner.
    pub occurrences: usize,
}

impl Block {
    /// Clear the used-argument analysis state before a fixpoint pass.
    pub fn clear_used_args(&mut self) {
        self.used_args = None;
        self.num_used_args = 0;
    }

    /// The variables a call to this block contributes: only arguments in
    /// positions the bitmap marks as used.
    pub fn used_vars_of_call(&self, args: &[Atom], vs: &mut Vec<Temp>) {
        if let Some(bitmap) = &self.used_args {
            for (a, used) in args.iter().zip(bitmap) {
                if *used {
                    a.add_vars(vs);
                }
            }
        }
    }

    /// Trim an argument list to the used positions, or decline when no
    /// newly unused argument has been found.
    pub fn remove_unused_args(&self, args: &[Atom]) -> Option<Vec<Atom>> {
        if self.num_used_args >= args.len() {
            return None;
        }
        let bitmap = self.used_args.as_deref().unwrap_or(&[]);
        Some(
            args.iter()
                .enumerate()
                .filter(|(i, _)| bitmap.get(*i).copied().unwrap_or(false))
                .map(|(_, a)| a.clone())
                .collect(),
        )
    }
}

// ============================================================================
// Closure definitions
// ============================================================================

/// A definition of how to enter a closure: `k{params} args = tail`.
///
/// The params are stored in the closure when it is allocated; the args
/// arrive when the closure is entered.
#[derive(Debug)]
pub struct ClosureDefn {
    pub name: String,
    pub params: Vec<Temp>,
    pub args: Vec<Temp>,
    pub tail: Tail,
    pub declared: Option<AllocType>,
    /// The (stored, result) pair recorded during inference.
    pub defining: Option<(Vec<Type>, Type)>,
    pub used_args: Option<Vec<bool>>,
    pub num_used_args: usize,
    pub derived: Vec<(KnownPattern, ClosureId)>,
}

impl ClosureDefn {
    pub fn clear_used_args(&mut self) {
        self.used_args = None;
        self.num_used_args = 0;
    }

    pub fn used_vars_of_call(&self, args: &[Atom], vs: &mut Vec<Temp>) {
        if let Some(bitmap) = &self.used_args {
            for (a, used) in args.iter().zip(bitmap) {
                if *used {
                    a.add_vars(vs);
                }
            }
        }
    }

    pub fn remove_unused_args(&self, args: &[Atom]) -> Option<Vec<Atom>> {
        if self.num_used_args >= args.len() {
            return None;
        }
        let bitmap = self.used_args.as_deref().unwrap_or(&[]);
        Some(
            args.iter()
                .enumerate()
                .filter(|(i, _)| bitmap.get(*i).copied().unwrap_or(false))
                .map(|(_, a)| a.clone())
                .collect(),
        )
    }

    /// The tail that results from entering this closure with the given
    /// stored and supplied arguments.
    pub fn with_args(&self, sargs: &[Atom], fargs: &[Atom]) -> Tail {
        let s = crate::atom::TempSubst::empty()
            .extend_pairs(&self.params, sargs)
            .extend_pairs(&self.args, fargs);
        self.tail.apply(&s)
    }
}

// ============================================================================
// Top-level definitions and externals
// ============================================================================

/// The left hand side of one component of a top-level definition.
#[derive(Debug)]
pub struct TopLhs {
    pub name: String,
    pub declared: Option<Scheme>,
    pub defining: Option<Type>,
}

impl TopLhs {
    pub fn new(name: impl Into<String>) -> TopLhs {
        TopLhs { name: name.into(), declared: None, defining: None }
    }
}

/// A module-scope binding whose value is produced by a tail at
/// initialization time.
#[derive(Debug)]
pub struct TopLevel {
    pub lhs: Vec<TopLhs>,
    pub tail: Tail,
    /// Set once the value is known to be a compile-time constant (a
    /// literal or a hoisted allocator whose arguments are all static).
    pub is_static: bool,
    pub is_entry: bool,
}

/// An external symbol with a declared type.
#[derive(Debug)]
pub struct External {
    pub name: String,
    pub declared: Scheme,
}

// ============================================================================
// Programs
// ============================================================================

/// A MIL program: the arenas of definitions plus the compilation context.
#[derive(Debug, Default)]
pub struct Program {
    pub blocks: Arena<Block>,
    pub closures: Arena<ClosureDefn>,
    pub tops: Arena<TopLevel>,
    pub externals: Arena<External>,
    pub ids: IdSource,
}

impl Program {
    pub fn new() -> Program {
        Program::default()
    }

    // ------------------------------------------------------------------------
    // Builders
    // ------------------------------------------------------------------------

    pub fn add_block(&mut self, params: Vec<Temp>, code: Code) -> BlockId {
        let name = self.ids.fresh_block_name();
        self.add_block_named(name, params, code)
    }

    pub fn add_block_named(
        &mut self,
        name: impl Into<String>,
        params: Vec<Temp>,
        code: Code,
    ) -> BlockId {
        self.blocks.alloc(Block {
            name: name.into(),
            params,
            code,
            declared: None,
            defining: None,
            used_args: None,
            num_used_args: 0,
            derived: Vec::new(),
            occurrences: 0,
        })
    }

    pub fn add_closure(&mut self, params: Vec<Temp>, args: Vec<Temp>, tail: Tail) -> ClosureId {
        let name = self.ids.fresh_closure_name();
        self.add_closure_named(name, params, args, tail)
    }

    pub fn add_closure_named(
        &mut self,
        name: impl Into<String>,
        params: Vec<Temp>,
        args: Vec<Temp>,
        tail: Tail,
    ) -> ClosureId {
        self.closures.alloc(ClosureDefn {
            name: name.into(),
            params,
            args,
            tail,
            declared: None,
            defining: None,
            used_args: None,
            num_used_args: 0,
            derived: Vec::new(),
        })
    }

    pub fn add_top(&mut self, lhs: Vec<TopLhs>, tail: Tail) -> TopId {
        self.tops.alloc(TopLevel { lhs, tail, is_static: false, is_entry: false })
    }

    /// A top-level with a single generated left hand side.
    pub fn add_top_anon(&mut self, tail: Tail) -> TopId {
        let name = self.ids.fresh_top_name();
        self.add_top(vec![TopLhs::new(name)], tail)
    }

    pub fn add_external(&mut self, name: impl Into<String>, declared: Scheme) -> ExtId {
        self.externals.alloc(External { name: name.into(), declared })
    }

    // ------------------------------------------------------------------------
    // Access
    // ------------------------------------------------------------------------

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id]
    }

    pub fn closure(&self, id: ClosureId) -> &ClosureDefn {
        &self.closures[id]
    }

    pub fn closure_mut(&mut self, id: ClosureId) -> &mut ClosureDefn {
        &mut self.closures[id]
    }

    pub fn top(&self, id: TopId) -> &TopLevel {
        &self.tops[id]
    }

    pub fn top_mut(&mut self, id: TopId) -> &mut TopLevel {
        &mut self.tops[id]
    }

    pub fn external(&self, id: ExtId) -> &External {
        &self.externals[id]
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|(id, _)| id).collect()
    }

    pub fn closure_ids(&self) -> Vec<ClosureId> {
        self.closures.iter().map(|(id, _)| id).collect()
    }

    pub fn top_ids(&self) -> Vec<TopId> {
        self.tops.iter().map(|(id, _)| id).collect()
    }

    pub fn entries(&self) -> Vec<TopId> {
        self.tops.iter().filter(|(_, t)| t.is_entry).map(|(id, _)| id).collect()
    }

    // ------------------------------------------------------------------------
    // Body take/put
    // ------------------------------------------------------------------------

    /// Take a block's code out for transformation, leaving a placeholder.
    pub fn take_block_code(&mut self, id: BlockId) -> Code {
        std::mem::replace(&mut self.blocks[id].code, Code::Done(Tail::Return(Vec::new())))
    }

    pub fn put_block_code(&mut self, id: BlockId, code: Code) {
        self.blocks[id].code = code;
    }

    pub fn take_closure_tail(&mut self, id: ClosureId) -> Tail {
        std::mem::replace(&mut self.closures[id].tail, Tail::Return(Vec::new()))
    }

    pub fn put_closure_tail(&mut self, id: ClosureId, tail: Tail) {
        self.closures[id].tail = tail;
    }

    pub fn take_top_tail(&mut self, id: TopId) -> Tail {
        std::mem::replace(&mut self.tops[id].tail, Tail::Return(Vec::new()))
    }

    pub fn put_top_tail(&mut self, id: TopId, tail: Tail) {
        self.tops[id].tail = tail;
    }

    // ------------------------------------------------------------------------
    // Static values and occurrences
    // ------------------------------------------------------------------------

    /// An atom is static when it is a literal or a reference to a static
    /// top-level; static atoms are immutable after hoisting.
    pub fn atom_is_static(&self, a: &Atom) -> bool {
        match a {
            Atom::Lit(_) => true,
            Atom::Top(Top::Def { top, .. }) => self.top(*top).is_static,
            Atom::Top(Top::Ext(_)) => false,
            Atom::Var(_) => false,
        }
    }

    /// Recount block calling occurrences across the whole program.
    pub fn count_occurrences(&mut self) {
        fn note(counts: &mut [usize], bc: &BlockCall) {
            counts[u32::from(bc.block.into_raw()) as usize] += 1;
        }
        fn walk_tail(counts: &mut [usize], t: &Tail) {
            if let Tail::BlockCall(bc) = t {
                note(counts, bc);
            }
        }
        fn walk_code(counts: &mut [usize], code: &Code) {
            match code {
                Code::Bind { tail, rest, .. } => {
                    walk_tail(counts, tail);
                    walk_code(counts, rest);
                }
                Code::Done(t) => walk_tail(counts, t),
                Code::Case { alts, default, .. } => {
                    for alt in alts {
                        note(counts, &alt.call);
                    }
                    if let Some(d) = default {
                        note(counts, d);
                    }
                }
                Code::If { if_true, if_false, .. } => {
                    note(counts, if_true);
                    note(counts, if_false);
                }
            }
        }

        let mut counts = vec![0usize; self.blocks.len()];
        for (_, b) in self.blocks.iter() {
            walk_code(&mut counts, &b.code);
        }
        for (_, k) in self.closures.iter() {
            walk_tail(&mut counts, &k.tail);
        }
        for (_, t) in self.tops.iter() {
            walk_tail(&mut counts, &t.tail);
        }
        for (c, (_, b)) in counts.iter().zip(self.blocks.iter_mut()) {
            b.occurrences = *c;
        }
    }

    // ------------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------------

    /// The definitions a single definition depends on, in mention order.
    pub fn dependencies_of(&self, d: DefnRef) -> Vec<DefnRef> {
        let mut ds = Vec::new();
        match d {
            DefnRef::Block(b) => self.block(b).code.dependencies(&mut ds),
            DefnRef::Closure(k) => self.closure(k).tail.dependencies(&mut ds),
            DefnRef::Top(t) => self.top(t).tail.dependencies(&mut ds),
            DefnRef::Ext(_) => {}
        }
        ds
    }

    /// A leaves-first ordering of every definition, established once and
    /// reused wherever iteration order matters.
    pub fn dependency_order(&self) -> Vec<DefnRef> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let roots: Vec<DefnRef> = self
            .top_ids()
            .into_iter()
            .map(DefnRef::Top)
            .chain(self.block_ids().into_iter().map(DefnRef::Block))
            .chain(self.closure_ids().into_iter().map(DefnRef::Closure))
            .collect();
        for root in roots {
            self.visit(root, &mut visited, &mut order);
        }
        order
    }

    fn visit(&self, d: DefnRef, visited: &mut HashSet<DefnRef>, order: &mut Vec<DefnRef>) {
        if !visited.insert(d) {
            return;
        }
        for dep in self.dependencies_of(d) {
            self.visit(dep, visited, order);
        }
        order.push(d);
    }

    /// The strongly connected components of the dependency graph, leaves
    /// first, so that a component is listed before everything that calls
    /// into it. Type inference generalizes one component at a time.
    pub fn sccs(&self) -> Vec<Vec<DefnRef>> {
        struct Tarjan<'a> {
            prog: &'a Program,
            index: usize,
            indices: std::collections::HashMap<DefnRef, usize>,
            lowlinks: std::collections::HashMap<DefnRef, usize>,
            stack: Vec<DefnRef>,
            on_stack: HashSet<DefnRef>,
            out: Vec<Vec<DefnRef>>,
        }
        impl<'a> Tarjan<'a> {
            fn strongconnect(&mut self, v: DefnRef) {
                self.indices.insert(v, self.index);
                self.lowlinks.insert(v, self.index);
                self.index += 1;
                self.stack.push(v);
                self.on_stack.insert(v);
                for w in self.prog.dependencies_of(v) {
                    if !self.indices.contains_key(&w) {
                        self.strongconnect(w);
                        let wl = self.lowlinks[&w];
                        let vl = self.lowlinks[&v];
                        self.lowlinks.insert(v, vl.min(wl));
                    } else if self.on_stack.contains(&w) {
                        let wi = self.indices[&w];
                        let vl = self.lowlinks[&v];
                        self.lowlinks.insert(v, vl.min(wi));
                    }
                }
                if self.lowlinks[&v] == self.indices[&v] {
                    let mut scc = Vec::new();
                    loop {
                        let w = self.stack.pop().unwrap();
                        self.on_stack.remove(&w);
                        scc.push(w);
                        if w == v {
                            break;
                        }
                    }
                    scc.reverse();
                    self.out.push(scc);
                }
            }
        }

        let mut t = Tarjan {
            prog: self,
            index: 0,
            indices: std::collections::HashMap::new(),
            lowlinks: std::collections::HashMap::new(),
            stack: Vec::new(),
            on_stack: HashSet::new(),
            out: Vec::new(),
        };
        let roots: Vec<DefnRef> = self
            .top_ids()
            .into_iter()
            .map(DefnRef::Top)
            .chain(self.block_ids().into_iter().map(DefnRef::Block))
            .chain(self.closure_ids().into_iter().map(DefnRef::Closure))
            .collect();
        for r in roots {
            if !t.indices.contains_key(&r) {
                t.strongconnect(r);
            }
        }
        t.out
    }

    /// The definitions reachable from the entry points.
    pub fn reachable(&self) -> HashSet<DefnRef> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        for t in self.entries() {
            self.visit(DefnRef::Top(t), &mut visited, &mut order);
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Const;

    #[test]
    fn dependency_order_is_leaves_first() {
        let mut prog = Program::new();
        let leaf = prog.add_block(Vec::new(), Code::Done(Tail::Return(Vec::new())));
        let caller = prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(leaf, Vec::new()))),
        );
        let order = prog.dependency_order();
        let li = order.iter().position(|d| *d == DefnRef::Block(leaf)).unwrap();
        let ci = order.iter().position(|d| *d == DefnRef::Block(caller)).unwrap();
        assert!(li < ci);
    }

    #[test]
    fn occurrences_count_calls_in_all_positions() {
        let mut prog = Program::new();
        let leaf = prog.add_block(Vec::new(), Code::Done(Tail::Return(Vec::new())));
        prog.add_block(
            Vec::new(),
            Code::If {
                cond: Atom::Lit(Const::Flag(true)),
                if_true: BlockCall::new(leaf, Vec::new()),
                if_false: BlockCall::new(leaf, Vec::new()),
            },
        );
        prog.count_occurrences();
        assert_eq!(prog.block(leaf).occurrences, 2);
    }

    #[test]
    fn static_atoms_require_a_static_top() {
        let mut prog = Program::new();
        let t = prog.add_top_anon(Tail::Return(vec![Atom::Lit(Const::Word(1))]));
        let a = Atom::Top(Top::Def { top: t, index: 0 });
        assert!(!prog.atom_is_static(&a));
        prog.top_mut(t).is_static = true;
        assert!(prog.atom_is_static(&a));
        assert!(prog.atom_is_static(&Atom::Lit(Const::Word(0))));
    }
}
