//! A canonicalizing store for type expressions.
//!
//! Canonicalization walks a type spine, pushing each (already canonical)
//! argument onto an explicit stack, and then asks the set for the canonical
//! instance of `(head, argc)`. Two structurally equal types map to the same
//! representative, so later passes can compare types by reference.

use std::collections::HashMap;
use std::rc::Rc;

use crate::types::{AllocType, BlockType, Scheme, TLit, Tycon, Type};

/// Heads other than type constructors and literals, used as bucket keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OtherKey {
    Var(usize),
    Gen(usize),
}

/// Shallow reference equality for canonical types.
///
/// Canonical representatives share their component cells, so one level of
/// pointer comparison decides equality of whole canonical types.
pub fn ref_eq(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Ap(f1, a1), Type::Ap(f2, a2)) => Rc::ptr_eq(f1, f2) && Rc::ptr_eq(a1, a2),
        (Type::Con(c), Type::Con(d)) => c == d,
        (Type::Lit(l), Type::Lit(m)) => l == m,
        (Type::Var(v), Type::Var(w)) => Rc::ptr_eq(v, w),
        (Type::Gen(i), Type::Gen(j)) => i == j,
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct TypeSet {
    /// Canonical types grouped by their head constructor.
    tycon_instances: HashMap<Tycon, Vec<Type>>,
    /// Canonical types grouped by other (variable or generic) heads.
    other_instances: HashMap<OtherKey, Vec<Type>>,
    /// Canonical type literals by value.
    lits: HashMap<TLit, Type>,
    /// Argument stack used while walking spines.
    stack: Vec<Type>,
}

impl TypeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the canonical representative of a type.
    pub fn canon_type(&mut self, t: &Type) -> Type {
        self.canon_walk(t, 0)
    }

    fn canon_walk(&mut self, t: &Type, args: usize) -> Type {
        match t.resolve() {
            Type::Ap(f, a) => {
                let ca = self.canon_type(&a);
                self.stack.push(ca);
                self.canon_walk(&f, args + 1)
            }
            Type::Con(c) => {
                if let Some((arity, _, expansion)) = c.as_synonym() {
                    if args >= arity {
                        // the top of the stack holds the synonym parameters
                        let params: Vec<Type> =
                            (0..arity).map(|_| self.stack.pop().unwrap()).collect();
                        let body = expansion.subst_gens(&params);
                        return self.canon_walk(&body, args - arity);
                    }
                }
                self.canon_tycon(c, args)
            }
            Type::Lit(l) => {
                if args != 0 {
                    log::debug!("kind error: type literal applied to arguments");
                }
                self.canon_lit(l)
            }
            Type::Var(v) => {
                let key = OtherKey::Var(Rc::as_ptr(&v) as *const () as usize);
                self.canon_other(key, Type::Var(v), args)
            }
            Type::Gen(i) => self.canon_other(OtherKey::Gen(i), Type::Gen(i), args),
        }
    }

    /// Canonical instance of a type with constructor `c` at the head and
    /// `args` arguments on the stack.
    fn canon_tycon(&mut self, c: Tycon, args: usize) -> Type {
        if let Some(t) = self.find_match(self.tycon_instances.get(&c), args) {
            self.stack.truncate(self.stack.len() - args);
            return t;
        }
        let t = self.rebuild(Type::Con(c.clone()), args);
        self.tycon_instances.entry(c).or_default().push(t.clone());
        t
    }

    /// Canonical instance for a variable or generic head. With no
    /// arguments the head is already its own representative.
    fn canon_other(&mut self, key: OtherKey, head: Type, args: usize) -> Type {
        if args == 0 {
            return head;
        }
        if let Some(t) = self.find_match(self.other_instances.get(&key), args) {
            self.stack.truncate(self.stack.len() - args);
            return t;
        }
        let t = self.rebuild(head, args);
        self.other_instances.entry(key).or_default().push(t.clone());
        t
    }

    /// Canonical literal for a given value.
    fn canon_lit(&mut self, l: TLit) -> Type {
        self.lits.entry(l.clone()).or_insert_with(|| Type::Lit(l)).clone()
    }

    /// Scan a bucket for an entry whose arguments match the top of the
    /// stack. The stack holds the first argument on top.
    fn find_match(&self, bucket: Option<&Vec<Type>>, args: usize) -> Option<Type> {
        let bucket = bucket?;
        let top = self.stack.len();
        'cands: for cand in bucket {
            let (_, cargs) = cand.spine();
            if cargs.len() != args {
                continue;
            }
            for (i, ca) in cargs.iter().enumerate() {
                if !ref_eq(ca, &self.stack[top - 1 - i]) {
                    continue 'cands;
                }
            }
            return Some(cand.clone());
        }
        None
    }

    /// Build a canonical representative by popping `args` arguments.
    fn rebuild(&mut self, head: Type, args: usize) -> Type {
        let mut t = head;
        for _ in 0..args {
            let a = self.stack.pop().unwrap();
            t = t.ap(a);
        }
        t
    }

    // ------------------------------------------------------------------------
    // Canonical forms of compound type values
    // ------------------------------------------------------------------------

    pub fn canon_scheme(&mut self, s: &Scheme) -> Scheme {
        Scheme { generics: s.generics.clone(), body: self.canon_type(&s.body) }
    }

    pub fn canon_alloc_type(&mut self, a: &AllocType) -> AllocType {
        AllocType {
            generics: a.generics.clone(),
            stored: a.stored.iter().map(|t| self.canon_type(t)).collect(),
            result: self.canon_type(&a.result),
        }
    }

    pub fn canon_block_type(&mut self, b: &BlockType) -> BlockType {
        BlockType {
            generics: b.generics.clone(),
            dom: self.canon_type(&b.dom),
            rng: self.canon_type(&b.rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::Kind;
    use crate::types::IdSource;

    #[test]
    fn structurally_equal_types_share_a_representative() {
        let mut set = TypeSet::new();
        let t1 = Type::milfun(Type::tuple(vec![Type::word()]), Type::tuple(vec![Type::flag()]));
        let t2 = Type::milfun(Type::tuple(vec![Type::word()]), Type::tuple(vec![Type::flag()]));
        let c1 = set.canon_type(&t1);
        let c2 = set.canon_type(&t2);
        assert!(ref_eq(&c1, &c2));
    }

    #[test]
    fn distinct_types_get_distinct_representatives() {
        let mut set = TypeSet::new();
        let c1 = set.canon_type(&Type::bit(8));
        let c2 = set.canon_type(&Type::bit(9));
        assert!(!ref_eq(&c1, &c2));
    }

    #[test]
    fn synonyms_canonicalize_to_their_expansion() {
        let id_syn = Tycon::synonym("Id", 1, 0, Type::Gen(0));
        let wrap = Tycon::synonym("Wrap", 1, 1, Type::Con(id_syn).ap(Type::Gen(0)));
        let mut set = TypeSet::new();
        let via_syn = set.canon_type(&Type::Con(wrap).ap(Type::word()));
        let direct = set.canon_type(&Type::word());
        assert!(ref_eq(&via_syn, &direct));
    }

    #[test]
    fn literals_are_interned_by_value() {
        let mut set = TypeSet::new();
        let a = set.canon_type(&Type::nat(42));
        let b = set.canon_type(&Type::nat(42));
        assert!(ref_eq(&a, &b));
    }

    #[test]
    fn bound_variables_canonicalize_through_their_link() {
        let mut ids = IdSource::new();
        let v = ids.fresh_tvar(Kind::Star);
        v.unify(&Type::word()).unwrap();
        let mut set = TypeSet::new();
        let cv = set.canon_type(&v);
        let cw = set.canon_type(&Type::word());
        assert!(ref_eq(&cv, &cw));
    }
}
