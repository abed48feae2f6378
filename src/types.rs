//! Type expressions for MIL programs.
//!
//! Types are built from constructors, left-spined applications, mutable
//! unification variables, quantified generic indices, and type-level
//! literals. Synonym constructors carry an expansion and an integer level;
//! the level breaks ties during equality and unification so that the side
//! with the user's preferred normal form is kept unexpanded.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::errors::Failure;
use crate::kind::Kind;
use crate::obdd::Pat;

/// Number of bits in a machine word on the compilation target.
pub const WORD_SIZE: u64 = 32;

/// A unification variable identifier.
pub type TyvarId = u32;

// ============================================================================
// Fresh identifier supply
// ============================================================================

/// The per-compilation supply of fresh identifiers.
///
/// One `IdSource` is created for each program so that repeated compilations
/// in a single process start from a clean slate.
#[derive(Debug, Clone, Default)]
pub struct IdSource {
    tvars: u32,
    temps: u32,
    blocks: u32,
    closures: u32,
    tops: u32,
}

impl IdSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh unbound type variable of the given kind.
    pub fn fresh_tvar(&mut self, kind: Kind) -> Type {
        let id = self.tvars;
        self.tvars += 1;
        Type::Var(Rc::new(RefCell::new(TVar::Unbound { id, kind })))
    }

    pub fn fresh_temp_num(&mut self) -> u32 {
        let n = self.temps;
        self.temps += 1;
        n
    }

    pub fn fresh_block_name(&mut self) -> String {
        let n = self.blocks;
        self.blocks += 1;
        format!("b{}", n)
    }

    pub fn fresh_closure_name(&mut self) -> String {
        let n = self.closures;
        self.closures += 1;
        format!("k{}", n)
    }

    pub fn fresh_top_name(&mut self) -> String {
        let n = self.tops;
        self.tops += 1;
        format!("s{}", n)
    }
}

// ============================================================================
// Type constructors
// ============================================================================

/// A type constructor, shared by reference.
///
/// Built-in constructors (tuples, the MIL arrow, and the primitive
/// bit-level types) compare structurally so that independently constructed
/// handles are interchangeable; data names and synonyms have identity.
#[derive(Debug, Clone)]
pub struct Tycon(Rc<TyconData>);

#[derive(Debug)]
pub struct TyconData {
    pub id: String,
    pub kind: Kind,
    pub body: TyconBody,
}

#[derive(Debug)]
pub enum TyconBody {
    /// A user-declared algebraic data type.
    Data,
    /// The constructor of `n`-ary result tuples.
    Tuple(usize),
    /// The MIL function space between result tuples.
    Arrow,
    /// A machine word.
    Word,
    /// A boolean flag.
    Flag,
    /// `Bit n`: a bit vector of width `n`.
    Bit,
    /// `Ix n`: an index bounded by `n`.
    Ix,
    /// `ARef n a`: an aligned reference to an area of type `a`.
    ARef,
    /// A type synonym with the given arity, level, and expansion.
    ///
    /// The expansion uses `Type::Gen(i)` for the synonym's parameters.
    Synonym { arity: usize, level: usize, expansion: Type },
}

impl Tycon {
    pub fn data(id: impl Into<String>, kind: Kind) -> Tycon {
        Tycon(Rc::new(TyconData { id: id.into(), kind, body: TyconBody::Data }))
    }

    pub fn synonym(id: impl Into<String>, arity: usize, level: usize, expansion: Type) -> Tycon {
        let kind = Kind::fun_n(Kind::Star, arity, Kind::Star);
        Tycon(Rc::new(TyconData {
            id: id.into(),
            kind,
            body: TyconBody::Synonym { arity, level, expansion },
        }))
    }

    pub fn tuple(n: usize) -> Tycon {
        Tycon(Rc::new(TyconData {
            id: format!("Tuple{}", n),
            kind: Kind::fun_n(Kind::Star, n, Kind::Tuple),
            body: TyconBody::Tuple(n),
        }))
    }

    pub fn arrow() -> Tycon {
        Tycon(Rc::new(TyconData {
            id: "->>".to_string(),
            kind: Kind::fun(Kind::Tuple, Kind::fun(Kind::Tuple, Kind::Star)),
            body: TyconBody::Arrow,
        }))
    }

    pub fn word() -> Tycon {
        Tycon(Rc::new(TyconData { id: "Word".to_string(), kind: Kind::Star, body: TyconBody::Word }))
    }

    pub fn flag() -> Tycon {
        Tycon(Rc::new(TyconData { id: "Flag".to_string(), kind: Kind::Star, body: TyconBody::Flag }))
    }

    pub fn bit() -> Tycon {
        Tycon(Rc::new(TyconData {
            id: "Bit".to_string(),
            kind: Kind::fun(Kind::Nat, Kind::Star),
            body: TyconBody::Bit,
        }))
    }

    pub fn ix() -> Tycon {
        Tycon(Rc::new(TyconData {
            id: "Ix".to_string(),
            kind: Kind::fun(Kind::Nat, Kind::Star),
            body: TyconBody::Ix,
        }))
    }

    pub fn aref() -> Tycon {
        Tycon(Rc::new(TyconData {
            id: "ARef".to_string(),
            kind: Kind::fun(Kind::Nat, Kind::fun(Kind::Star, Kind::Star)),
            body: TyconBody::ARef,
        }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn kind(&self) -> &Kind {
        &self.0.kind
    }

    pub fn body(&self) -> &TyconBody {
        &self.0.body
    }

    /// The arity, level, and expansion of a synonym constructor.
    pub fn as_synonym(&self) -> Option<(usize, usize, &Type)> {
        match &self.0.body {
            TyconBody::Synonym { arity, level, expansion } => Some((*arity, *level, expansion)),
            _ => None,
        }
    }

    pub fn tuple_arity(&self) -> Option<usize> {
        match self.0.body {
            TyconBody::Tuple(n) => Some(n),
            _ => None,
        }
    }
}

impl PartialEq for Tycon {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0.body, &other.0.body) {
            (TyconBody::Tuple(n), TyconBody::Tuple(m)) => n == m,
            (TyconBody::Arrow, TyconBody::Arrow) => true,
            (TyconBody::Word, TyconBody::Word) => true,
            (TyconBody::Flag, TyconBody::Flag) => true,
            (TyconBody::Bit, TyconBody::Bit) => true,
            (TyconBody::Ix, TyconBody::Ix) => true,
            (TyconBody::ARef, TyconBody::ARef) => true,
            _ => Rc::ptr_eq(&self.0, &other.0),
        }
    }
}

impl Eq for Tycon {}

impl Hash for Tycon {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0.body {
            TyconBody::Tuple(n) => (1u8, *n).hash(state),
            TyconBody::Arrow => 2u8.hash(state),
            TyconBody::Word => 3u8.hash(state),
            TyconBody::Flag => 4u8.hash(state),
            TyconBody::Bit => 5u8.hash(state),
            TyconBody::Ix => 6u8.hash(state),
            TyconBody::ARef => 7u8.hash(state),
            _ => (0u8, Rc::as_ptr(&self.0) as usize).hash(state),
        }
    }
}

impl fmt::Display for Tycon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.id)
    }
}

// ============================================================================
// Constructor functions
// ============================================================================

/// A data constructor function.
///
/// Each constructor knows its declaration-order tag, the total number of
/// constructors in its data type (so that single-constructor newtypes can
/// be recognized without a back reference), and its allocation type.
#[derive(Debug, Clone)]
pub struct Cfun(Rc<CfunData>);

#[derive(Debug)]
pub struct CfunData {
    pub id: String,
    pub tag: usize,
    pub num_cfuns: usize,
    pub alloc_type: AllocType,
}

impl Cfun {
    pub fn new(id: impl Into<String>, tag: usize, num_cfuns: usize, alloc_type: AllocType) -> Cfun {
        Cfun(Rc::new(CfunData { id: id.into(), tag, num_cfuns, alloc_type }))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn tag(&self) -> usize {
        self.0.tag
    }

    pub fn arity(&self) -> usize {
        self.0.alloc_type.stored.len()
    }

    pub fn alloc_type(&self) -> &AllocType {
        &self.0.alloc_type
    }

    /// A newtype constructor wraps a single field of a single-constructor
    /// data type, so allocating or selecting through it is the identity.
    pub fn is_newtype(&self) -> bool {
        self.0.num_cfuns == 1 && self.arity() == 1
    }
}

impl PartialEq for Cfun {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Cfun {}

impl Hash for Cfun {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for Cfun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.id)
    }
}

/// Declare an algebraic data type, returning its constructor and the
/// constructor functions in declaration order.
///
/// Constructor fields refer to the type parameters as `Type::Gen(i)`.
pub fn define_data(
    id: impl Into<String>,
    params: Vec<Kind>,
    ctors: Vec<(String, Vec<Type>)>,
) -> (Tycon, Vec<Cfun>) {
    let id = id.into();
    let kind = params.iter().rev().fold(Kind::Star, |acc, k| Kind::fun(k.clone(), acc));
    let tycon = Tycon::data(id, kind);
    let result = (0..params.len()).fold(Type::Con(tycon.clone()), |acc, i| acc.ap(Type::Gen(i)));
    let num = ctors.len();
    let cfuns = ctors
        .into_iter()
        .enumerate()
        .map(|(tag, (cid, stored))| {
            let at = AllocType { generics: params.clone(), stored, result: result.clone() };
            Cfun::new(cid, tag, num, at)
        })
        .collect();
    (tycon, cfuns)
}

// ============================================================================
// Type expressions
// ============================================================================

/// A unification variable: unbound with a kind, or a link to its binding.
#[derive(Debug)]
pub enum TVar {
    Unbound { id: TyvarId, kind: Kind },
    Link(Type),
}

/// A type-level literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TLit {
    Nat(u64),
    Lab(String),
}

#[derive(Debug, Clone)]
pub enum Type {
    /// A unification variable, possibly linked to its binding.
    Var(Rc<RefCell<TVar>>),
    /// A generic index bound by an enclosing scheme.
    Gen(usize),
    /// A type constructor.
    Con(Tycon),
    /// A left-spined type application.
    Ap(Rc<Type>, Rc<Type>),
    /// A type-level literal; literals never take arguments.
    Lit(TLit),
}

impl Type {
    pub fn ap(self, arg: Type) -> Type {
        Type::Ap(Rc::new(self), Rc::new(arg))
    }

    pub fn nat(n: u64) -> Type {
        Type::Lit(TLit::Nat(n))
    }

    pub fn word() -> Type {
        Type::Con(Tycon::word())
    }

    pub fn flag() -> Type {
        Type::Con(Tycon::flag())
    }

    pub fn bit(n: u64) -> Type {
        Type::Con(Tycon::bit()).ap(Type::nat(n))
    }

    pub fn ix(n: u64) -> Type {
        Type::Con(Tycon::ix()).ap(Type::nat(n))
    }

    /// The result tuple type with the given components.
    pub fn tuple(ts: Vec<Type>) -> Type {
        let n = ts.len();
        ts.into_iter().fold(Type::Con(Tycon::tuple(n)), |acc, t| acc.ap(t))
    }

    /// The MIL function type `dom ->> rng` between two tuple types.
    pub fn milfun(dom: Type, rng: Type) -> Type {
        Type::Con(Tycon::arrow()).ap(dom).ap(rng)
    }

    /// Follow links at the root of this type.
    pub fn resolve(&self) -> Type {
        match self {
            Type::Var(v) => match &*v.borrow() {
                TVar::Link(t) => t.resolve(),
                TVar::Unbound { .. } => self.clone(),
            },
            _ => self.clone(),
        }
    }

    /// Decompose a type into its head and arguments in application order.
    pub fn spine(&self) -> (Type, Vec<Type>) {
        let mut args = Vec::new();
        let mut t = self.resolve();
        while let Type::Ap(f, a) = t {
            args.push(a.as_ref().clone());
            t = f.resolve();
        }
        args.reverse();
        (t, args)
    }

    /// Rebuild an application spine.
    pub fn from_spine(head: Type, args: &[Type]) -> Type {
        args.iter().fold(head, |acc, a| acc.ap(a.clone()))
    }

    /// The constructor at the head of this type, if there is one.
    pub fn head_tycon(&self) -> Option<Tycon> {
        match self.spine().0 {
            Type::Con(c) => Some(c),
            _ => None,
        }
    }

    /// The components of a known tuple type.
    pub fn tuple_components(&self) -> Option<Vec<Type>> {
        let (head, args) = self.spine();
        match head {
            Type::Con(c) => match c.tuple_arity() {
                Some(n) if n == args.len() => Some(args),
                _ => None,
            },
            _ => None,
        }
    }

    /// The domain and range of a known MIL function type.
    pub fn milfun_components(&self) -> Option<(Type, Type)> {
        let (head, args) = self.spine();
        match head {
            Type::Con(c) if matches!(c.body(), TyconBody::Arrow) && args.len() == 2 => {
                Some((args[0].clone(), args[1].clone()))
            }
            _ => None,
        }
    }

    /// Substitute generic indices, leaving everything else intact.
    pub fn subst_gens(&self, subst: &[Type]) -> Type {
        match self.resolve() {
            Type::Gen(i) => subst.get(i).cloned().unwrap_or(Type::Gen(i)),
            Type::Ap(f, a) => f.subst_gens(subst).ap(a.subst_gens(subst)),
            t => t,
        }
    }

    /// Expand a synonym head over the given argument spine, or decline when
    /// the head is not a synonym or is undersaturated.
    fn expand_spine(head: &Type, args: &[Type]) -> Option<Type> {
        let c = match head {
            Type::Con(c) => c,
            _ => return None,
        };
        let (arity, _, expansion) = c.as_synonym()?;
        if args.len() < arity {
            return None;
        }
        let body = expansion.subst_gens(&args[..arity]);
        Some(Type::from_spine(body, &args[arity..]))
    }

    fn head_level(head: &Type) -> Option<usize> {
        match head {
            Type::Con(c) => c.as_synonym().map(|(_, level, _)| level),
            _ => None,
        }
    }

    fn heads_equal(a: &Type, b: &Type) -> bool {
        match (a, b) {
            (Type::Var(x), Type::Var(y)) => Rc::ptr_eq(x, y),
            (Type::Gen(i), Type::Gen(j)) => i == j,
            (Type::Con(c), Type::Con(d)) => c == d,
            (Type::Lit(l), Type::Lit(m)) => l == m,
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Equality
    // ------------------------------------------------------------------------

    /// Test whether two types are equal after optional synonym expansion.
    ///
    /// When both heads are synonyms the side with the greater level is
    /// expanded; at equal levels both sides expand; a synonym facing a
    /// non-synonym is expanded.
    pub fn same(&self, other: &Type) -> bool {
        let a = self.resolve();
        let b = other.resolve();
        if let (Type::Var(x), Type::Var(y)) = (&a, &b) {
            return Rc::ptr_eq(x, y);
        }
        if matches!(a, Type::Var(_)) || matches!(b, Type::Var(_)) {
            return false;
        }
        let (ha, aa) = a.spine();
        let (hb, ab) = b.spine();
        if Type::heads_equal(&ha, &hb) && aa.len() == ab.len() {
            return aa.iter().zip(&ab).all(|(x, y)| x.same(y));
        }
        match (Type::head_level(&ha), Type::head_level(&hb)) {
            (Some(la), Some(lb)) if la == lb => {
                match (Type::expand_spine(&ha, &aa), Type::expand_spine(&hb, &ab)) {
                    (Some(ea), Some(eb)) => ea.same(&eb),
                    _ => false,
                }
            }
            (Some(la), Some(lb)) if la > lb => {
                Type::expand_spine(&ha, &aa).map_or(false, |ea| ea.same(&b))
            }
            (Some(_), Some(_)) => Type::expand_spine(&hb, &ab).map_or(false, |eb| a.same(&eb)),
            (Some(_), None) => Type::expand_spine(&ha, &aa).map_or(false, |ea| ea.same(&b)),
            (None, Some(_)) => Type::expand_spine(&hb, &ab).map_or(false, |eb| a.same(&eb)),
            (None, None) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Unification
    // ------------------------------------------------------------------------

    /// Check whether the variable with the given id occurs in this type.
    pub fn occurs(&self, id: TyvarId) -> bool {
        match self.resolve() {
            Type::Var(v) => match &*v.borrow() {
                TVar::Unbound { id: vid, .. } => *vid == id,
                TVar::Link(_) => unreachable!("resolve follows links"),
            },
            Type::Ap(f, a) => f.occurs(id) || a.occurs(id),
            Type::Con(_) | Type::Gen(_) | Type::Lit(_) => false,
        }
    }

    fn bind(cell: &Rc<RefCell<TVar>>, t: &Type) -> Result<(), Failure> {
        let (id, kind) = match &*cell.borrow() {
            TVar::Unbound { id, kind } => (*id, kind.clone()),
            TVar::Link(_) => return Err(Failure::Internal("binding a bound variable".into())),
        };
        if t.occurs(id) {
            return Err(Failure::OccursCheck(id, t.clone()));
        }
        let tk = t.kind();
        if tk != kind {
            return Err(Failure::KindMismatch(kind, tk));
        }
        *cell.borrow_mut() = TVar::Link(t.clone());
        Ok(())
    }

    /// Symmetric unification.
    ///
    /// Variable bindings update the link cell after an occurs check; bound
    /// variables are transparently dereferenced at the root on every step.
    pub fn unify(&self, other: &Type) -> Result<(), Failure> {
        let a = self.resolve();
        let b = other.resolve();
        match (&a, &b) {
            (Type::Var(x), Type::Var(y)) if Rc::ptr_eq(x, y) => return Ok(()),
            (Type::Var(x), _) => return Type::bind(x, &b),
            (_, Type::Var(y)) => return Type::bind(y, &a),
            _ => {}
        }
        let (ha, aa) = a.spine();
        let (hb, ab) = b.spine();
        if Type::heads_equal(&ha, &hb) && aa.len() == ab.len() {
            for (x, y) in aa.iter().zip(&ab) {
                x.unify(y)?;
            }
            return Ok(());
        }
        let mismatch = || Failure::TypeMismatch { expected: a.clone(), found: b.clone() };
        match (Type::head_level(&ha), Type::head_level(&hb)) {
            (Some(la), Some(lb)) if la == lb => {
                let ea = Type::expand_spine(&ha, &aa).ok_or_else(mismatch)?;
                let eb = Type::expand_spine(&hb, &ab).ok_or_else(mismatch)?;
                ea.unify(&eb)
            }
            (Some(la), Some(lb)) if la > lb => {
                Type::expand_spine(&ha, &aa).ok_or_else(mismatch)?.unify(&b)
            }
            (Some(_), Some(_)) => a.unify(&Type::expand_spine(&hb, &ab).ok_or_else(mismatch)?),
            (Some(_), None) => Type::expand_spine(&ha, &aa).ok_or_else(mismatch)?.unify(&b),
            (None, Some(_)) => a.unify(&Type::expand_spine(&hb, &ab).ok_or_else(mismatch)?),
            (None, None) => Err(mismatch()),
        }
    }

    /// One-directional unification: bind only variables on the receiver
    /// side so that `other` is left untouched. The specializer relies on
    /// this to instantiate a copy's fresh skeleton against a memoized
    /// instance type without disturbing the instance.
    ///
    /// A failed match may leave bindings behind; callers match freshly
    /// instantiated, unshared variables, so no rollback is performed.
    pub fn match_onto(&self, other: &Type) -> bool {
        let a = self.resolve();
        let b = other.resolve();
        match (&a, &b) {
            (Type::Var(x), Type::Var(y)) if Rc::ptr_eq(x, y) => return true,
            (Type::Var(x), _) => return Type::bind(x, &b).is_ok(),
            (_, Type::Var(_)) => return false,
            _ => {}
        }
        let (ha, aa) = a.spine();
        let (hb, ab) = b.spine();
        if Type::heads_equal(&ha, &hb) && aa.len() == ab.len() {
            return aa.iter().zip(&ab).all(|(x, y)| x.match_onto(y));
        }
        match (Type::head_level(&ha), Type::head_level(&hb)) {
            (Some(la), Some(lb)) if la == lb => {
                match (Type::expand_spine(&ha, &aa), Type::expand_spine(&hb, &ab)) {
                    (Some(ea), Some(eb)) => ea.match_onto(&eb),
                    _ => false,
                }
            }
            (Some(la), Some(lb)) if la > lb => {
                Type::expand_spine(&ha, &aa).map_or(false, |ea| ea.match_onto(&b))
            }
            (Some(_), Some(_)) => Type::expand_spine(&hb, &ab).map_or(false, |eb| a.match_onto(&eb)),
            (Some(_), None) => Type::expand_spine(&ha, &aa).map_or(false, |ea| ea.match_onto(&b)),
            (None, Some(_)) => Type::expand_spine(&hb, &ab).map_or(false, |eb| a.match_onto(&eb)),
            (None, None) => false,
        }
    }

    // ------------------------------------------------------------------------
    // Kind and size queries
    // ------------------------------------------------------------------------

    /// The kind of a (kind-correct) type, found by walking the head spine.
    pub fn kind(&self) -> Kind {
        match self.resolve() {
            Type::Var(v) => match &*v.borrow() {
                TVar::Unbound { kind, .. } => kind.clone(),
                TVar::Link(_) => unreachable!("resolve follows links"),
            },
            // Generic indices are only kinded relative to a scheme; bodies
            // are kind checked after instantiation.
            Type::Gen(_) => Kind::Star,
            Type::Con(c) => c.kind().clone(),
            Type::Lit(TLit::Nat(_)) => Kind::Nat,
            Type::Lit(TLit::Lab(_)) => Kind::Lab,
            Type::Ap(f, _) => match f.kind() {
                Kind::Fun(_, r) => r.as_ref().clone(),
                _ => Kind::Star,
            },
        }
    }

    /// Reduce a natural number type to its literal value, expanding
    /// synonyms at the head as needed.
    pub fn as_nat(&self) -> Option<u64> {
        let (head, args) = self.spine();
        if let Some(e) = Type::expand_spine(&head, &args) {
            return e.as_nat();
        }
        match head {
            Type::Lit(TLit::Nat(n)) if args.is_empty() => Some(n),
            _ => None,
        }
    }

    /// The bit-level width of this type as a canonical nat type, or `None`
    /// when the type has no bit-level representation.
    pub fn bit_size(&self) -> Option<Type> {
        let (head, args) = self.spine();
        if let Some(e) = Type::expand_spine(&head, &args) {
            return e.bit_size();
        }
        let c = match head {
            Type::Con(c) => c,
            _ => return None,
        };
        match c.body() {
            TyconBody::Word => Some(Type::nat(WORD_SIZE)),
            TyconBody::Flag => Some(Type::nat(1)),
            TyconBody::Bit if args.len() == 1 => args[0].as_nat().map(Type::nat),
            TyconBody::Ix if args.len() == 1 => Some(Type::nat(WORD_SIZE)),
            TyconBody::ARef if args.len() == 2 => Some(Type::nat(WORD_SIZE)),
            _ => None,
        }
    }

    /// The byte-level width of this type, or `None` when it has no
    /// byte-level representation.
    pub fn byte_size(&self) -> Option<Type> {
        let bits = self.bit_size()?.as_nat()?;
        Some(Type::nat((bits + 7) / 8))
    }

    /// The set of legal bit patterns for values of this type.
    pub fn bit_pat(&self) -> Option<Pat> {
        let (head, args) = self.spine();
        if let Some(e) = Type::expand_spine(&head, &args) {
            return e.bit_pat();
        }
        let c = match head {
            Type::Con(c) => c,
            _ => return None,
        };
        match c.body() {
            TyconBody::Word => Some(Pat::all(WORD_SIZE as usize)),
            TyconBody::Flag => Some(Pat::all(1)),
            TyconBody::Bit if args.len() == 1 => args[0].as_nat().map(|n| Pat::all(n as usize)),
            TyconBody::Ix if args.len() == 1 => {
                args[0].as_nat().map(|n| Pat::below(WORD_SIZE as usize, n))
            }
            // references are word sized and never null
            TyconBody::ARef if args.len() == 2 => Some(Pat::exact(WORD_SIZE as usize, 0).not()),
            _ => None,
        }
    }

    /// Collect the unbound type variables of this type, in first-use order.
    pub fn tvars(&self, acc: &mut Vec<Rc<RefCell<TVar>>>) {
        match self.resolve() {
            Type::Var(v) => {
                if !acc.iter().any(|w| Rc::ptr_eq(w, &v)) {
                    acc.push(v);
                }
            }
            Type::Ap(f, a) => {
                f.tvars(acc);
                a.tvars(acc);
            }
            _ => {}
        }
    }

    /// Rebuild this type with all root links chased away, replacing the
    /// listed variables by generic indices.
    pub(crate) fn skeleton(&self, gens: &[Rc<RefCell<TVar>>]) -> Type {
        match self.resolve() {
            Type::Var(v) => match gens.iter().position(|w| Rc::ptr_eq(w, &v)) {
                Some(i) => Type::Gen(i),
                None => Type::Var(v),
            },
            Type::Ap(f, a) => f.skeleton(gens).ap(a.skeleton(gens)),
            t => t,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.resolve();
        // tuples and arrows get their own syntax
        if let Some(ts) = t.tuple_components() {
            write!(f, "[")?;
            for (i, c) in ts.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            return write!(f, "]");
        }
        if let Some((d, r)) = t.milfun_components() {
            return write!(f, "{} ->> {}", d, r);
        }
        match &t {
            Type::Var(v) => match &*v.borrow() {
                TVar::Unbound { id, .. } => write!(f, "t{}", id),
                TVar::Link(_) => unreachable!(),
            },
            Type::Gen(i) => write!(f, "{}", (b'a' + (*i % 26) as u8) as char),
            Type::Con(c) => write!(f, "{}", c),
            Type::Lit(TLit::Nat(n)) => write!(f, "{}", n),
            Type::Lit(TLit::Lab(s)) => write!(f, "#{}", s),
            Type::Ap(g, a) => {
                write!(f, "{} ", g)?;
                match a.resolve() {
                    Type::Ap(_, _) => write!(f, "({})", a),
                    _ => write!(f, "{}", a),
                }
            }
        }
    }
}

// ============================================================================
// Schemes and allocation types
// ============================================================================

/// A universally quantified type with kinded bound variables.
#[derive(Debug, Clone)]
pub struct Scheme {
    pub generics: Vec<Kind>,
    pub body: Type,
}

impl Scheme {
    pub fn mono(body: Type) -> Scheme {
        Scheme { generics: Vec::new(), body }
    }

    pub fn is_quantified(&self) -> bool {
        !self.generics.is_empty()
    }

    /// Replace the quantified variables with fresh unification variables.
    pub fn instantiate(&self, ids: &mut IdSource) -> Type {
        if self.generics.is_empty() {
            return self.body.clone();
        }
        let fresh: Vec<Type> = self.generics.iter().map(|k| ids.fresh_tvar(k.clone())).collect();
        self.body.subst_gens(&fresh)
    }

    /// Quantify the given variables of a type, in order.
    pub fn generalize(ty: &Type, gens: &[Rc<RefCell<TVar>>]) -> Scheme {
        let generics = gens
            .iter()
            .map(|v| match &*v.borrow() {
                TVar::Unbound { kind, .. } => kind.clone(),
                TVar::Link(_) => Kind::Star,
            })
            .collect();
        Scheme { generics, body: ty.skeleton(gens) }
    }

    /// Alpha equivalence of schemes: equal kinds and equal bodies under the
    /// shared generic numbering.
    pub fn alpha_equiv(&self, other: &Scheme) -> bool {
        self.generics == other.generics && self.body.same(&other.body)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.generics.is_empty() {
            write!(f, "forall")?;
            for i in 0..self.generics.len() {
                write!(f, " {}", (b'a' + (i % 26) as u8) as char)?;
            }
            write!(f, ". ")?;
        }
        write!(f, "{}", self.body)
    }
}

/// The type of an allocator: stored (closure-captured) component types
/// and the type of the allocated result.
#[derive(Debug, Clone)]
pub struct AllocType {
    pub generics: Vec<Kind>,
    pub stored: Vec<Type>,
    pub result: Type,
}

impl AllocType {
    pub fn mono(stored: Vec<Type>, result: Type) -> AllocType {
        AllocType { generics: Vec::new(), stored, result }
    }

    pub fn is_quantified(&self) -> bool {
        !self.generics.is_empty()
    }

    /// Instantiate the quantified variables, sharing them between the
    /// stored components and the result.
    pub fn instantiate(&self, ids: &mut IdSource) -> (Vec<Type>, Type) {
        if self.generics.is_empty() {
            return (self.stored.clone(), self.result.clone());
        }
        let fresh: Vec<Type> = self.generics.iter().map(|k| ids.fresh_tvar(k.clone())).collect();
        (
            self.stored.iter().map(|t| t.subst_gens(&fresh)).collect(),
            self.result.subst_gens(&fresh),
        )
    }

    pub fn alpha_equiv(&self, other: &AllocType) -> bool {
        self.generics == other.generics
            && self.stored.len() == other.stored.len()
            && self.stored.iter().zip(&other.stored).all(|(a, b)| a.same(b))
            && self.result.same(&other.result)
    }

    /// Drop the stored components whose flag is unset.
    pub fn remove_stored(&self, used: &[bool]) -> AllocType {
        let stored = self
            .stored
            .iter()
            .zip(used)
            .filter(|(_, u)| **u)
            .map(|(t, _)| t.clone())
            .collect();
        AllocType { generics: self.generics.clone(), stored, result: self.result.clone() }
    }
}

impl fmt::Display for AllocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, t) in self.stored.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, "}} {}", self.result)
    }
}

/// The type of a block: a domain tuple and a range tuple.
#[derive(Debug, Clone)]
pub struct BlockType {
    pub generics: Vec<Kind>,
    pub dom: Type,
    pub rng: Type,
}

impl BlockType {
    pub fn mono(dom: Type, rng: Type) -> BlockType {
        BlockType { generics: Vec::new(), dom, rng }
    }

    pub fn is_quantified(&self) -> bool {
        !self.generics.is_empty()
    }

    pub fn instantiate(&self, ids: &mut IdSource) -> (Type, Type) {
        if self.generics.is_empty() {
            return (self.dom.clone(), self.rng.clone());
        }
        let fresh: Vec<Type> = self.generics.iter().map(|k| ids.fresh_tvar(k.clone())).collect();
        (self.dom.subst_gens(&fresh), self.rng.subst_gens(&fresh))
    }

    pub fn alpha_equiv(&self, other: &BlockType) -> bool {
        self.generics == other.generics && self.dom.same(&other.dom) && self.rng.same(&other.rng)
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >>= {}", self.dom, self.rng)
    }
}

/// A substitution on type variables, used when specializing definitions.
#[derive(Debug, Clone, Default)]
pub struct TVarSubst {
    map: HashMap<TyvarId, Type>,
}

impl TVarSubst {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, id: TyvarId, t: Type) {
        self.map.insert(id, t);
    }

    pub fn apply(&self, t: &Type) -> Type {
        match t.resolve() {
            Type::Var(v) => {
                let id = match &*v.borrow() {
                    TVar::Unbound { id, .. } => *id,
                    TVar::Link(_) => unreachable!(),
                };
                self.map.get(&id).cloned().unwrap_or(Type::Var(v))
            }
            Type::Ap(f, a) => self.apply(&f).ap(self.apply(&a)),
            t => t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> IdSource {
        IdSource::new()
    }

    #[test]
    fn resolve_follows_links() {
        let mut ids = ids();
        let v = ids.fresh_tvar(Kind::Star);
        v.unify(&Type::word()).unwrap();
        assert!(matches!(v.resolve(), Type::Con(_)));
        assert!(v.same(&Type::word()));
    }

    #[test]
    fn occurs_check_rejects_cyclic_binding() {
        let mut ids = ids();
        let v = ids.fresh_tvar(Kind::Star);
        let cyclic = Type::milfun(Type::tuple(vec![v.clone()]), Type::tuple(vec![]));
        assert!(matches!(v.unify(&cyclic), Err(Failure::OccursCheck(_, _))));
    }

    #[test]
    fn kind_mismatch_is_detected() {
        let mut ids = ids();
        let v = ids.fresh_tvar(Kind::Nat);
        assert!(matches!(v.unify(&Type::word()), Err(Failure::KindMismatch(_, _))));
        assert!(v.unify(&Type::nat(8)).is_ok());
    }

    #[test]
    fn synonym_levels_control_expansion() {
        // type Id a = a (level 0); type Wrap a = Id a (level 1)
        let id_syn = Tycon::synonym("Id", 1, 0, Type::Gen(0));
        let wrap = Tycon::synonym("Wrap", 1, 1, Type::Con(id_syn.clone()).ap(Type::Gen(0)));
        let wrapped = Type::Con(wrap).ap(Type::word());
        assert!(wrapped.same(&Type::word()));
        assert!(Type::word().same(&wrapped));
        let ided = Type::Con(id_syn).ap(Type::word());
        assert!(wrapped.same(&ided));
    }

    #[test]
    fn unify_is_symmetric_and_idempotent() {
        let mut ids = ids();
        let a = ids.fresh_tvar(Kind::Star);
        let b = ids.fresh_tvar(Kind::Star);
        a.unify(&b).unwrap();
        b.unify(&a).unwrap();
        a.unify(&Type::flag()).unwrap();
        assert!(b.same(&Type::flag()));
        b.unify(&a).unwrap();
    }

    #[test]
    fn match_binds_only_receiver_vars() {
        let mut ids = ids();
        let v = ids.fresh_tvar(Kind::Star);
        let pat = Type::milfun(Type::tuple(vec![v.clone()]), Type::tuple(vec![v.clone()]));
        let target = Type::milfun(Type::tuple(vec![Type::word()]), Type::tuple(vec![Type::word()]));
        assert!(pat.match_onto(&target));
        assert!(v.same(&Type::word()));

        let mut ids2 = IdSource::new();
        let w = ids2.fresh_tvar(Kind::Star);
        assert!(!Type::word().match_onto(&w));
    }

    #[test]
    fn bit_sizes_dispatch_on_head() {
        assert_eq!(Type::word().bit_size().and_then(|t| t.as_nat()), Some(WORD_SIZE));
        assert_eq!(Type::flag().bit_size().and_then(|t| t.as_nat()), Some(1));
        assert_eq!(Type::bit(12).bit_size().and_then(|t| t.as_nat()), Some(12));
        assert_eq!(Type::ix(100).bit_size().and_then(|t| t.as_nat()), Some(WORD_SIZE));
        assert_eq!(Type::word().byte_size().and_then(|t| t.as_nat()), Some(WORD_SIZE / 8));
        assert!(Type::tuple(vec![]).bit_size().is_none());
    }

    #[test]
    fn bit_pats_describe_legal_values() {
        let p = Type::ix(5).bit_pat().unwrap();
        assert!(p.includes(4));
        assert!(!p.includes(5));
        assert!(Type::bit(3).bit_pat().unwrap().is_all());
    }

    #[test]
    fn generalize_then_instantiate_round_trips() {
        let mut ids = ids();
        let v = ids.fresh_tvar(Kind::Star);
        let ty = Type::milfun(Type::tuple(vec![v.clone()]), Type::tuple(vec![v.clone()]));
        let mut gens = Vec::new();
        ty.tvars(&mut gens);
        let scheme = Scheme::generalize(&ty, &gens);
        assert!(scheme.is_quantified());
        assert_eq!(scheme.generics.len(), 1);

        let inst = scheme.instantiate(&mut ids);
        let (dom, rng) = inst.milfun_components().unwrap();
        let d = dom.tuple_components().unwrap().remove(0);
        let r = rng.tuple_components().unwrap().remove(0);
        d.unify(&Type::word()).unwrap();
        assert!(r.same(&Type::word()));
    }

    #[test]
    fn define_data_numbers_tags_in_declaration_order() {
        let (_, cfuns) = define_data(
            "Maybe",
            vec![Kind::Star],
            vec![("Nothing".to_string(), vec![]), ("Just".to_string(), vec![Type::Gen(0)])],
        );
        assert_eq!(cfuns[0].tag(), 0);
        assert_eq!(cfuns[1].tag(), 1);
        assert_eq!(cfuns[1].arity(), 1);
        assert!(!cfuns[1].is_newtype());
    }
}
