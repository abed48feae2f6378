//! Atoms: the leaf operands of MIL tails.
//!
//! An atom is a temporary, a reference to a top-level definition or
//! external, or a literal constant. Temporaries are shared handles with
//! identity; the temporary named `_` is the wildcard, which is never read.

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::defns::{ExtId, TopId};
use crate::types::{IdSource, Type};

// ============================================================================
// Temporaries
// ============================================================================

/// A temporary variable, identified by its shared handle.
#[derive(Debug, Clone)]
pub struct Temp(Rc<TempData>);

#[derive(Debug)]
pub struct TempData {
    pub name: String,
    pub ty: RefCell<Type>,
}

impl Temp {
    /// A fresh temporary with a fresh (kind `*`) type variable.
    pub fn fresh(ids: &mut IdSource) -> Temp {
        let name = format!("t{}", ids.fresh_temp_num());
        let ty = ids.fresh_tvar(crate::kind::Kind::Star);
        Temp(Rc::new(TempData { name, ty: RefCell::new(ty) }))
    }

    /// A fresh temporary with a known type.
    pub fn with_type(ids: &mut IdSource, ty: Type) -> Temp {
        let name = format!("t{}", ids.fresh_temp_num());
        Temp(Rc::new(TempData { name, ty: RefCell::new(ty) }))
    }

    /// The wildcard temporary: a binder whose value is dead.
    pub fn wild(ty: Type) -> Temp {
        Temp(Rc::new(TempData { name: "_".to_string(), ty: RefCell::new(ty) }))
    }

    /// A list of fresh temporaries.
    pub fn make_temps(ids: &mut IdSource, n: usize) -> Vec<Temp> {
        (0..n).map(|_| Temp::fresh(ids)).collect()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_live(&self) -> bool {
        self.0.name != "_"
    }

    /// A dead replacement for this temporary, keeping its type.
    pub fn not_live(&self) -> Temp {
        Temp::wild(self.ty())
    }

    pub fn ty(&self) -> Type {
        self.0.ty.borrow().clone()
    }

    pub fn set_ty(&self, ty: Type) {
        *self.0.ty.borrow_mut() = ty;
    }

    /// Reset this temporary's type to a fresh variable for re-inference.
    pub fn fresh_type(&self, ids: &mut IdSource) -> Type {
        let t = ids.fresh_tvar(crate::kind::Kind::Star);
        self.set_ty(t.clone());
        t
    }

    /// A fresh temporary sharing this one's type, used when renaming
    /// parameters during inlining and specialization.
    pub fn new_param(&self, ids: &mut IdSource) -> Temp {
        Temp::with_type(ids, self.ty())
    }

    pub fn is_in(&self, vs: &[Temp]) -> bool {
        vs.iter().any(|v| v == self)
    }

    /// Positional lookup from the end of an alpha environment, so the most
    /// recent binding of a temporary wins.
    pub fn alpha_index(&self, env: &[Temp]) -> Option<usize> {
        env.iter().rposition(|v| v == self)
    }
}

impl PartialEq for Temp {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Temp {}

impl Hash for Temp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.name)
    }
}

// ============================================================================
// Literal constants and top references
// ============================================================================

/// A literal constant operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Const {
    Word(i64),
    Flag(bool),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::Word(n) => write!(f, "{}", n),
            Const::Flag(b) => write!(f, "{}", b),
        }
    }
}

/// A reference to a module-scope value: one component of a top-level
/// definition, or an external.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Top {
    Def { top: TopId, index: usize },
    Ext(ExtId),
}

// ============================================================================
// Atoms
// ============================================================================

#[derive(Debug, Clone)]
pub enum Atom {
    Var(Temp),
    Top(Top),
    Lit(Const),
}

impl Atom {
    pub fn same_atom(&self, other: &Atom) -> bool {
        match (self, other) {
            (Atom::Var(a), Atom::Var(b)) => a == b,
            (Atom::Top(a), Atom::Top(b)) => a == b,
            (Atom::Lit(a), Atom::Lit(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_temp(&self) -> Option<&Temp> {
        match self {
            Atom::Var(t) => Some(t),
            _ => None,
        }
    }

    /// Add the live temporary mentioned by this atom to the list, keeping
    /// entries unique. Wildcards and constants contribute nothing.
    pub fn add_vars(&self, vs: &mut Vec<Temp>) {
        if let Atom::Var(t) = self {
            if t.is_live() && !t.is_in(vs) {
                vs.push(t.clone());
            }
        }
    }

    pub fn add_vars_of(atoms: &[Atom], vs: &mut Vec<Temp>) {
        for a in atoms {
            a.add_vars(vs);
        }
    }

    /// Apply a temporary substitution to this atom.
    pub fn apply(&self, s: &TempSubst) -> Atom {
        match self {
            Atom::Var(t) => s.apply_temp(t),
            a => a.clone(),
        }
    }

    pub fn apply_all(atoms: &[Atom], s: &TempSubst) -> Vec<Atom> {
        atoms.iter().map(|a| a.apply(s)).collect()
    }

    /// Alpha equivalence of atoms: temporaries compare by their positional
    /// index in the environments; unbound temporaries must be identical.
    pub fn alpha_atom(&self, env: &[Temp], other: &Atom, oenv: &[Temp]) -> bool {
        match (self, other) {
            (Atom::Var(a), Atom::Var(b)) => {
                let ia = a.alpha_index(env);
                let ib = b.alpha_index(oenv);
                ia == ib && (ia.is_some() || a == b)
            }
            _ => self.same_atom(other),
        }
    }

    pub fn alpha_atoms(xs: &[Atom], env: &[Temp], ys: &[Atom], oenv: &[Temp]) -> bool {
        xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| x.alpha_atom(env, y, oenv))
    }

    /// A summary contribution that is stable under alpha renaming.
    pub fn summary(&self) -> i64 {
        match self {
            Atom::Var(_) => 17,
            Atom::Top(Top::Def { top, index }) => {
                101 + 7 * u32::from(top.into_raw()) as i64 + *index as i64
            }
            Atom::Top(Top::Ext(e)) => 201 + 7 * u32::from(e.into_raw()) as i64,
            Atom::Lit(Const::Word(n)) => 301 + n,
            Atom::Lit(Const::Flag(b)) => {
                if *b {
                    401
                } else {
                    402
                }
            }
        }
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Var(t) => write!(f, "{}", t),
            Atom::Top(Top::Def { top, index }) => {
                write!(f, "g{}.{}", u32::from(top.into_raw()), index)
            }
            Atom::Top(Top::Ext(e)) => write!(f, "e{}", u32::from(e.into_raw())),
            Atom::Lit(c) => write!(f, "{}", c),
        }
    }
}

// ============================================================================
// Temp substitutions
// ============================================================================

/// A persistent (copy-on-extend) substitution from temporaries to atoms.
///
/// Extensions share the tail of the previous substitution, so the chains
/// built during inlining and specialization stay cheap; application
/// dereferences lazily at the leaves.
#[derive(Debug, Clone, Default)]
pub struct TempSubst(Option<Rc<SubstNode>>);

#[derive(Debug)]
struct SubstNode {
    from: Temp,
    to: Atom,
    rest: TempSubst,
}

impl TempSubst {
    pub fn empty() -> TempSubst {
        TempSubst(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn extend(&self, from: Temp, to: Atom) -> TempSubst {
        TempSubst(Some(Rc::new(SubstNode { from, to, rest: self.clone() })))
    }

    /// Extend with a parallel binding of each temporary to the matching atom.
    pub fn extend_pairs(&self, from: &[Temp], to: &[Atom]) -> TempSubst {
        debug_assert_eq!(from.len(), to.len());
        from.iter()
            .zip(to)
            .fold(self.clone(), |s, (v, a)| s.extend(v.clone(), a.clone()))
    }

    /// The atom this substitution maps a temporary to; identity if unbound.
    pub fn apply_temp(&self, t: &Temp) -> Atom {
        let mut node = &self.0;
        while let Some(n) = node {
            if &n.from == t {
                return n.to.clone();
            }
            node = &n.rest.0;
        }
        Atom::Var(t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdSource;

    #[test]
    fn wildcards_are_not_live_and_never_collected() {
        let mut ids = IdSource::new();
        let t = Temp::fresh(&mut ids);
        let w = t.not_live();
        assert!(t.is_live());
        assert!(!w.is_live());

        let mut vs = Vec::new();
        Atom::Var(w).add_vars(&mut vs);
        Atom::Var(t.clone()).add_vars(&mut vs);
        Atom::Var(t.clone()).add_vars(&mut vs);
        assert_eq!(vs.len(), 1);
        assert!(t.is_in(&vs));
    }

    #[test]
    fn subst_is_persistent_and_lazy() {
        let mut ids = IdSource::new();
        let a = Temp::fresh(&mut ids);
        let b = Temp::fresh(&mut ids);
        let s0 = TempSubst::empty();
        let s1 = s0.extend(a.clone(), Atom::Lit(Const::Word(1)));
        let s2 = s1.extend(b.clone(), Atom::Var(a.clone()));

        // the older substitution is untouched by the extension
        assert!(s1.apply_temp(&b).same_atom(&Atom::Var(b.clone())));
        assert!(s2.apply_temp(&b).same_atom(&Atom::Var(a.clone())));
        assert!(s2.apply_temp(&a).same_atom(&Atom::Lit(Const::Word(1))));
    }

    #[test]
    fn later_bindings_shadow_earlier_ones() {
        let mut ids = IdSource::new();
        let a = Temp::fresh(&mut ids);
        let s = TempSubst::empty()
            .extend(a.clone(), Atom::Lit(Const::Word(1)))
            .extend(a.clone(), Atom::Lit(Const::Word(2)));
        assert!(s.apply_temp(&a).same_atom(&Atom::Lit(Const::Word(2))));
    }

    #[test]
    fn alpha_atoms_compare_positionally() {
        let mut ids = IdSource::new();
        let x = Temp::fresh(&mut ids);
        let y = Temp::fresh(&mut ids);
        let env1 = vec![x.clone()];
        let env2 = vec![y.clone()];
        assert!(Atom::Var(x.clone()).alpha_atom(&env1, &Atom::Var(y.clone()), &env2));
        // unbound temporaries only match themselves
        assert!(!Atom::Var(x.clone()).alpha_atom(&[], &Atom::Var(y), &[]));
        assert!(Atom::Var(x.clone()).alpha_atom(&[], &Atom::Var(x), &[]));
    }
}
