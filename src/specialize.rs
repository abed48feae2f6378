//! Monomorphizing specialization.
//!
//! Driven by the entry points and their declared monomorphic types, the
//! specializer walks the reachable definitions and emits a fresh,
//! monomorphic copy of each polymorphic definition for every type it is
//! used at. Instances are memoized on the pair of the original definition
//! and the instantiated type, so repeated demands share one copy. An entry
//! point that is still quantified is an error.
//!
//! Each specialized body is copied with fresh temporaries and checked by
//! local inference against its monomorphic type; the types this solves for
//! the body's call sites decide which specialized callees to demand.

use crate::atom::{Atom, Temp, TempSubst, Top};
use crate::code::{Alt, Code};
use crate::defns::{BlockId, ClosureId, ExtId, Program, TopId, TopLhs};
use crate::errors::Failure;
use crate::kind::Kind;
use crate::tail::{BlockCall, Tail};
use crate::types::{AllocType, BlockType, IdSource, Scheme, TVar, Type};

/// Specialize a type-checked program to its entry points, producing a
/// monomorphic program.
pub fn specialize(src: &Program) -> Result<Program, Failure> {
    let mut ctx = SpecCtx {
        src,
        out: Program::new(),
        blocks: Vec::new(),
        closures: Vec::new(),
        tops: Vec::new(),
        exts: Vec::new(),
    };
    let entries = src.entries();
    if entries.is_empty() {
        log::debug!("no entry points; specialization produces an empty program");
    }
    for t in entries {
        ctx.specialize_entry(t)?;
    }
    Ok(ctx.out)
}

struct SpecCtx<'a> {
    src: &'a Program,
    out: Program,
    /// Memo tables: (original, instantiated type, specialized copy).
    blocks: Vec<(BlockId, BlockType, BlockId)>,
    closures: Vec<(ClosureId, AllocType, ClosureId)>,
    tops: Vec<(TopId, Vec<Type>, TopId)>,
    exts: Vec<(ExtId, Type, ExtId)>,
}

/// One callee or top reference discovered while checking a body, in
/// traversal order, with the type instance solved for that site.
enum Site {
    Block(BlockId, Type, Type),
    Closure(ClosureId, Vec<Type>, Type),
    TopRef(TopId, usize, Type),
    ExtRef(ExtId, Type),
}

impl<'a> SpecCtx<'a> {
    fn specialize_entry(&mut self, t: TopId) -> Result<(), Failure> {
        let top = self.src.top(t);
        let mut types = Vec::new();
        for lhs in &top.lhs {
            let declared = lhs
                .declared
                .as_ref()
                .ok_or_else(|| Failure::Scope(lhs.name.clone()))?;
            if declared.is_quantified() {
                return Err(Failure::PolymorphicEntrypoint { id: lhs.name.clone() });
            }
            types.push(declared.body.clone());
        }
        let nt = self.specialized_top(t, types)?;
        // entry points keep their original names so the emitted module
        // exports the expected symbols
        let names: Vec<String> = self.src.top(t).lhs.iter().map(|l| l.name.clone()).collect();
        for (lhs, name) in self.out.top_mut(nt).lhs.iter_mut().zip(names) {
            lhs.name = name;
        }
        self.out.top_mut(nt).is_entry = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Memoized specialization of each definition form
    // ------------------------------------------------------------------------

    fn specialized_block(&mut self, b: BlockId, inst: BlockType) -> Result<BlockId, Failure> {
        if let Some((_, _, nb)) =
            self.blocks.iter().find(|(ob, t, _)| *ob == b && t.alpha_equiv(&inst))
        {
            return Ok(*nb);
        }
        let orig = self.src.block(b);
        log::debug!("specializing block {} at {}", orig.name, inst);

        // copy the body with fresh, freshly typed temporaries; instances
        // get fresh names so several can coexist in the output
        let mut ids = std::mem::take(&mut self.out.ids);
        let name = ids.fresh_block_name();
        let (params, s) = freshen_temps(&orig.params, &mut ids);
        let code = copy_code(&orig.code, &s, &mut ids);

        // the placeholder is registered before the body is checked so that
        // recursive demands at the same type find it
        let nb = self.out.add_block_named(name, params.clone(), code);
        self.out.block_mut(nb).declared = Some(inst.clone());
        self.blocks.push((b, inst.clone(), nb));

        // locally infer the copied body at the instance type. The copy's
        // skeleton holds only fresh, unshared variables, so one-directional
        // matching instantiates it without disturbing the memoized instance.
        let dom = Type::tuple(params.iter().map(|p| p.fresh_type(&mut ids)).collect());
        if !dom.match_onto(&inst.dom) {
            return Err(Failure::TypeMismatch { expected: inst.dom.clone(), found: dom });
        }
        let mut sites = Vec::new();
        let code = self.out.take_block_code(nb);
        self.check_code(&code, &inst.rng, &mut ids, &mut sites)?;
        self.out.ids = ids;

        // resolve every site to a specialized definition
        let mut queue = sites.into_iter();
        let code = self.rewrite_code(code, &mut queue)?;
        self.out.put_block_code(nb, code);
        Ok(nb)
    }

    fn specialized_closure(
        &mut self,
        k: ClosureId,
        inst: AllocType,
    ) -> Result<ClosureId, Failure> {
        if let Some((_, _, nk)) =
            self.closures.iter().find(|(ok, t, _)| *ok == k && t.alpha_equiv(&inst))
        {
            return Ok(*nk);
        }
        let orig = self.src.closure(k);
        log::debug!("specializing closure {} at {}", orig.name, inst);

        let mut ids = std::mem::take(&mut self.out.ids);
        let name = ids.fresh_closure_name();
        let (params, s1) = freshen_temps(&orig.params, &mut ids);
        let (args, s) = freshen_temps_under(&orig.args, &s1, &mut ids);
        let tail = orig.tail.apply(&s);

        let nk = self.out.add_closure_named(name, params.clone(), args.clone(), tail);
        self.out.closure_mut(nk).declared = Some(inst.clone());
        self.closures.push((k, inst.clone(), nk));

        // stored parameters take the instance's stored types; invocation
        // arguments come from the instance's function type
        if inst.stored.len() != params.len() {
            return Err(Failure::Internal("stored arity changed during specialization".into()));
        }
        for (p, t) in params.iter().zip(&inst.stored) {
            p.set_ty(t.clone());
        }
        let (adom, rng) = inst
            .result
            .milfun_components()
            .ok_or_else(|| Failure::Internal("closure instance is not a function".into()))?;
        // as for blocks, the fresh argument skeleton is matched onto the
        // instance rather than unified with it
        let arg_tys = Type::tuple(args.iter().map(|a| a.fresh_type(&mut ids)).collect());
        if !arg_tys.match_onto(&adom) {
            return Err(Failure::TypeMismatch { expected: adom, found: arg_tys });
        }

        let mut sites = Vec::new();
        let tail = std::mem::replace(&mut self.out.closure_mut(nk).tail, Tail::Return(Vec::new()));
        self.check_tail(&tail, &mut ids, &mut sites)?.unify(&rng)?;
        self.out.ids = ids;

        let mut queue = sites.into_iter();
        let tail = self.rewrite_tail(tail, &mut queue)?;
        self.out.put_closure_tail(nk, tail);
        Ok(nk)
    }

    fn specialized_top(&mut self, t: TopId, types: Vec<Type>) -> Result<TopId, Failure> {
        if let Some((_, _, nt)) = self.tops.iter().find(|(ot, ts, _)| {
            *ot == t && ts.len() == types.len() && ts.iter().zip(&types).all(|(a, b)| a.same(b))
        }) {
            return Ok(*nt);
        }
        let orig = self.src.top(t);

        // instances get fresh component names; entry points are renamed
        // back to their originals afterwards
        let mut ids = std::mem::take(&mut self.out.ids);
        let lhs: Vec<TopLhs> = orig
            .lhs
            .iter()
            .zip(&types)
            .map(|(_, ty)| TopLhs {
                name: ids.fresh_top_name(),
                declared: Some(Scheme::mono(ty.clone())),
                defining: Some(ty.clone()),
            })
            .collect();
        self.out.ids = ids;
        let nt = self.out.add_top(lhs, orig.tail.clone());
        self.out.top_mut(nt).is_static = orig.is_static;
        self.tops.push((t, types.clone(), nt));

        let mut ids = std::mem::take(&mut self.out.ids);
        let mut sites = Vec::new();
        let tail = self.out.take_top_tail(nt);
        let inferred = self.check_tail(&tail, &mut ids, &mut sites)?;
        inferred.unify(&Type::tuple(types))?;
        self.out.ids = ids;

        let mut queue = sites.into_iter();
        let tail = self.rewrite_tail(tail, &mut queue)?;
        self.out.put_top_tail(nt, tail);
        Ok(nt)
    }

    fn specialized_ext(&mut self, e: ExtId, ty: Type) -> Result<ExtId, Failure> {
        if let Some((_, _, ne)) = self.exts.iter().find(|(oe, t, _)| *oe == e && t.same(&ty)) {
            return Ok(*ne);
        }
        let orig = self.src.external(e);
        // further instances of one external take a suffixed symbol name
        let instances = self.exts.iter().filter(|(oe, _, _)| *oe == e).count();
        let name = if instances == 0 {
            orig.name.clone()
        } else {
            format!("{}_{}", orig.name, instances)
        };
        let ne = self.out.add_external(name, Scheme::mono(ty.clone()));
        self.exts.push((e, ty, ne));
        Ok(ne)
    }

    // ------------------------------------------------------------------------
    // Local inference over a copied body, recording site instances
    // ------------------------------------------------------------------------

    fn check_code(
        &self,
        code: &Code,
        rng: &Type,
        ids: &mut IdSource,
        sites: &mut Vec<Site>,
    ) -> Result<(), Failure> {
        match code {
            Code::Bind { vs, tail, rest } => {
                let t = self.check_tail(tail, ids, sites)?;
                let vts: Vec<Type> = vs.iter().map(|v| v.fresh_type(ids)).collect();
                t.unify(&Type::tuple(vts))?;
                self.check_code(rest, rng, ids, sites)
            }
            Code::Done(t) => self.check_tail(t, ids, sites)?.unify(rng),
            Code::Case { scrutinee, alts, default } => {
                let sty = self.check_atom(scrutinee, ids, sites)?;
                for alt in alts {
                    let (_, result) = alt.cfun.alloc_type().instantiate(ids);
                    sty.unify(&result)?;
                    self.check_call(&alt.call, rng, ids, sites)?;
                }
                if let Some(d) = default {
                    self.check_call(d, rng, ids, sites)?;
                }
                Ok(())
            }
            Code::If { cond, if_true, if_false } => {
                self.check_atom(cond, ids, sites)?.unify(&Type::flag())?;
                self.check_call(if_true, rng, ids, sites)?;
                self.check_call(if_false, rng, ids, sites)
            }
        }
    }

    fn check_call(
        &self,
        bc: &BlockCall,
        rng: &Type,
        ids: &mut IdSource,
        sites: &mut Vec<Site>,
    ) -> Result<(), Failure> {
        let t = self.check_tail(&Tail::BlockCall(bc.clone()), ids, sites)?;
        t.unify(rng)
    }

    fn check_tail(
        &self,
        tail: &Tail,
        ids: &mut IdSource,
        sites: &mut Vec<Site>,
    ) -> Result<Type, Failure> {
        match tail {
            Tail::Return(atoms) => {
                let ts = self.check_atoms(atoms, ids, sites)?;
                Ok(Type::tuple(ts))
            }
            Tail::Enter { f, args } => {
                let tf = self.check_atom(f, ids, sites)?;
                let rng = ids.fresh_tvar(Kind::Tuple);
                let dom = Type::tuple(self.check_atoms(args, ids, sites)?);
                tf.unify(&Type::milfun(dom, rng.clone()))?;
                Ok(rng)
            }
            Tail::BlockCall(bc) => {
                let declared = self
                    .src
                    .block(bc.block)
                    .declared
                    .clone()
                    .ok_or_else(|| Failure::Scope(self.src.block(bc.block).name.clone()))?;
                let (dom, rng) = declared.instantiate(ids);
                dom.unify(&Type::tuple(self.check_atoms(&bc.args, ids, sites)?))?;
                sites.push(Site::Block(bc.block, dom, rng.clone()));
                Ok(rng)
            }
            Tail::PrimCall { prim, args } => {
                let (dom, rng) = prim.block_type().instantiate(ids);
                dom.unify(&Type::tuple(self.check_atoms(args, ids, sites)?))?;
                Ok(rng)
            }
            Tail::Sel { cfun, index, from } => {
                let (stored, result) = cfun.alloc_type().instantiate(ids);
                self.check_atom(from, ids, sites)?.unify(&result)?;
                let field = stored
                    .get(*index)
                    .cloned()
                    .ok_or_else(|| Failure::Internal("selector index out of range".into()))?;
                Ok(Type::tuple(vec![field]))
            }
            Tail::DataAlloc { cfun, args } => {
                let (stored, result) = cfun.alloc_type().instantiate(ids);
                Type::tuple(stored).unify(&Type::tuple(self.check_atoms(args, ids, sites)?))?;
                Ok(Type::tuple(vec![result]))
            }
            Tail::ClosAlloc { closure, args } => {
                let declared = self
                    .src
                    .closure(*closure)
                    .declared
                    .clone()
                    .ok_or_else(|| Failure::Scope(self.src.closure(*closure).name.clone()))?;
                let (stored, result) = declared.instantiate(ids);
                Type::tuple(stored.clone())
                    .unify(&Type::tuple(self.check_atoms(args, ids, sites)?))?;
                sites.push(Site::Closure(*closure, stored, result.clone()));
                Ok(Type::tuple(vec![result]))
            }
        }
    }

    fn check_atoms(
        &self,
        atoms: &[Atom],
        ids: &mut IdSource,
        sites: &mut Vec<Site>,
    ) -> Result<Vec<Type>, Failure> {
        atoms.iter().map(|a| self.check_atom(a, ids, sites)).collect()
    }

    fn check_atom(
        &self,
        a: &Atom,
        ids: &mut IdSource,
        sites: &mut Vec<Site>,
    ) -> Result<Type, Failure> {
        match a {
            Atom::Var(t) => Ok(t.ty()),
            Atom::Lit(crate::atom::Const::Word(_)) => Ok(Type::word()),
            Atom::Lit(crate::atom::Const::Flag(_)) => Ok(Type::flag()),
            Atom::Top(Top::Def { top, index }) => {
                let lhs = &self.src.top(*top).lhs[*index];
                let scheme =
                    lhs.declared.as_ref().ok_or_else(|| Failure::Scope(lhs.name.clone()))?;
                let ty = scheme.instantiate(ids);
                sites.push(Site::TopRef(*top, *index, ty.clone()));
                Ok(ty)
            }
            Atom::Top(Top::Ext(e)) => {
                let ty = self.src.external(*e).declared.instantiate(ids);
                sites.push(Site::ExtRef(*e, ty.clone()));
                Ok(ty)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Rewriting sites to specialized definitions
    // ------------------------------------------------------------------------

    fn rewrite_code(
        &mut self,
        code: Code,
        sites: &mut std::vec::IntoIter<Site>,
    ) -> Result<Code, Failure> {
        match code {
            Code::Bind { vs, tail, rest } => {
                let tail = self.rewrite_tail(tail, sites)?;
                let rest = self.rewrite_code(*rest, sites)?;
                Ok(Code::Bind { vs, tail, rest: Box::new(rest) })
            }
            Code::Done(t) => Ok(Code::Done(self.rewrite_tail(t, sites)?)),
            Code::Case { scrutinee, alts, default } => {
                let scrutinee = self.rewrite_atom(scrutinee, sites)?;
                let mut nalts = Vec::new();
                for alt in alts {
                    let call = self.rewrite_call(alt.call, sites)?;
                    nalts.push(Alt { cfun: alt.cfun, call });
                }
                let default = match default {
                    Some(d) => Some(self.rewrite_call(d, sites)?),
                    None => None,
                };
                Ok(Code::Case { scrutinee, alts: nalts, default })
            }
            Code::If { cond, if_true, if_false } => {
                let cond = self.rewrite_atom(cond, sites)?;
                let if_true = self.rewrite_call(if_true, sites)?;
                let if_false = self.rewrite_call(if_false, sites)?;
                Ok(Code::If { cond, if_true, if_false })
            }
        }
    }

    fn rewrite_call(
        &mut self,
        bc: BlockCall,
        sites: &mut std::vec::IntoIter<Site>,
    ) -> Result<BlockCall, Failure> {
        match self.rewrite_tail(Tail::BlockCall(bc), sites)? {
            Tail::BlockCall(bc) => Ok(bc),
            _ => Err(Failure::Internal("block call rewrote to a different form".into())),
        }
    }

    fn rewrite_tail(
        &mut self,
        tail: Tail,
        sites: &mut std::vec::IntoIter<Site>,
    ) -> Result<Tail, Failure> {
        match tail {
            Tail::Return(atoms) => Ok(Tail::Return(self.rewrite_atoms(atoms, sites)?)),
            Tail::Enter { f, args } => Ok(Tail::Enter {
                f: self.rewrite_atom(f, sites)?,
                args: self.rewrite_atoms(args, sites)?,
            }),
            Tail::BlockCall(bc) => {
                let args = self.rewrite_atoms(bc.args, sites)?;
                match sites.next() {
                    Some(Site::Block(orig, dom, rng)) if orig == bc.block => {
                        let inst = BlockType::mono(monomorphize(&dom), monomorphize(&rng));
                        let nb = self.specialized_block(orig, inst)?;
                        Ok(Tail::BlockCall(BlockCall::new(nb, args)))
                    }
                    _ => Err(Failure::Internal("site list out of step at block call".into())),
                }
            }
            Tail::PrimCall { prim, args } => {
                Ok(Tail::PrimCall { prim, args: self.rewrite_atoms(args, sites)? })
            }
            Tail::Sel { cfun, index, from } => {
                Ok(Tail::Sel { cfun, index, from: self.rewrite_atom(from, sites)? })
            }
            Tail::DataAlloc { cfun, args } => {
                Ok(Tail::DataAlloc { cfun, args: self.rewrite_atoms(args, sites)? })
            }
            Tail::ClosAlloc { closure, args } => {
                let args = self.rewrite_atoms(args, sites)?;
                match sites.next() {
                    Some(Site::Closure(orig, stored, result)) if orig == closure => {
                        let inst = AllocType::mono(
                            stored.iter().map(monomorphize).collect(),
                            monomorphize(&result),
                        );
                        let nk = self.specialized_closure(orig, inst)?;
                        Ok(Tail::ClosAlloc { closure: nk, args })
                    }
                    _ => Err(Failure::Internal("site list out of step at closure".into())),
                }
            }
        }
    }

    fn rewrite_atoms(
        &mut self,
        atoms: Vec<Atom>,
        sites: &mut std::vec::IntoIter<Site>,
    ) -> Result<Vec<Atom>, Failure> {
        atoms.into_iter().map(|a| self.rewrite_atom(a, sites)).collect()
    }

    fn rewrite_atom(
        &mut self,
        a: Atom,
        sites: &mut std::vec::IntoIter<Site>,
    ) -> Result<Atom, Failure> {
        match a {
            Atom::Top(Top::Def { top, index }) => match sites.next() {
                Some(Site::TopRef(orig, i, ty)) if orig == top && i == index => {
                    let types = self.top_component_types(orig, index, &ty);
                    let nt = self.specialized_top(orig, types)?;
                    Ok(Atom::Top(Top::Def { top: nt, index }))
                }
                _ => Err(Failure::Internal("site list out of step at top reference".into())),
            },
            Atom::Top(Top::Ext(e)) => match sites.next() {
                Some(Site::ExtRef(orig, ty)) if orig == e => {
                    let ne = self.specialized_ext(orig, monomorphize(&ty))?;
                    Ok(Atom::Top(Top::Ext(ne)))
                }
                _ => Err(Failure::Internal("site list out of step at external".into())),
            },
            a => Ok(a),
        }
    }

    /// The component types to demand for a top-level, given the solved
    /// type of one referenced component. Components whose schemes are
    /// monomorphic keep their declared types; other components of a
    /// multi-result top must share the demanded instantiation, which only
    /// single-component tops support here.
    fn top_component_types(&self, t: TopId, index: usize, ty: &Type) -> Vec<Type> {
        self.src
            .top(t)
            .lhs
            .iter()
            .enumerate()
            .map(|(i, l)| {
                if i == index {
                    monomorphize(ty)
                } else {
                    monomorphize(&l.declared.clone().map(|s| s.body).unwrap_or(Type::word()))
                }
            })
            .collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Fresh copies of a parameter list, with a substitution mapping the
/// originals to the copies.
fn freshen_temps(ts: &[Temp], ids: &mut IdSource) -> (Vec<Temp>, TempSubst) {
    freshen_temps_under(ts, &TempSubst::empty(), ids)
}

fn freshen_temps_under(ts: &[Temp], s: &TempSubst, ids: &mut IdSource) -> (Vec<Temp>, TempSubst) {
    let fresh: Vec<Temp> = ts.iter().map(|_| Temp::fresh(ids)).collect();
    let atoms: Vec<Atom> = fresh.iter().cloned().map(Atom::Var).collect();
    (fresh, s.extend_pairs(ts, &atoms))
}

/// Copy a code sequence, freshening every binder.
fn copy_code(code: &Code, s: &TempSubst, ids: &mut IdSource) -> Code {
    code.apply_freshening(s, ids)
}

/// Zonk a solved type, defaulting any variable that inference left
/// unconstrained; the result is ground.
fn monomorphize(t: &Type) -> Type {
    match t.resolve() {
        Type::Var(v) => {
            let kind = match &*v.borrow() {
                TVar::Unbound { kind, .. } => kind.clone(),
                TVar::Link(_) => unreachable!(),
            };
            match kind {
                Kind::Nat => Type::nat(0),
                Kind::Tuple => Type::tuple(Vec::new()),
                _ => Type::word(),
            }
        }
        Type::Ap(f, a) => monomorphize(&f).ap(monomorphize(&a)),
        t => t,
    }
}

/// After specialization, no definition reachable from an entry point may
/// keep a quantified type.
pub fn assert_monomorphic(prog: &Program) -> Result<(), Failure> {
    for (_, b) in prog.blocks.iter() {
        if b.declared.as_ref().map_or(false, |t| t.is_quantified()) {
            return Err(Failure::Internal(format!("block {} is still polymorphic", b.name)));
        }
    }
    for (_, k) in prog.closures.iter() {
        if k.declared.as_ref().map_or(false, |t| t.is_quantified()) {
            return Err(Failure::Internal(format!("closure {} is still polymorphic", k.name)));
        }
    }
    for (_, t) in prog.tops.iter() {
        for l in &t.lhs {
            if l.declared.as_ref().map_or(false, |s| s.is_quantified()) {
                return Err(Failure::Internal(format!("{} is still polymorphic", l.name)));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Const;
    use crate::errors::Handler;

    /// Build `id[x] = return [x]` plus an entry `main = id(5)` and check
    /// that specialization produces a Word instance.
    #[test]
    fn polymorphic_block_is_instantiated_at_word() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x = Temp::fresh(&mut ids);
        prog.ids = ids;
        let b = prog.add_block(vec![x.clone()], Code::Done(Tail::Return(vec![Atom::Var(x)])));

        let main = prog.add_top_anon(Tail::BlockCall(BlockCall::new(
            b,
            vec![Atom::Lit(Const::Word(5))],
        )));
        let mut handler = Handler::new();
        crate::infer::type_check(&mut prog, &mut handler).unwrap();
        prog.top_mut(main).is_entry = true;

        let out = specialize(&prog).unwrap();
        assert_monomorphic(&out).unwrap();
        assert_eq!(out.block_ids().len(), 1);
        let nb = out.block_ids()[0];
        let bt = out.block(nb).declared.clone().unwrap();
        let dom = bt.dom.tuple_components().unwrap();
        assert!(dom[0].same(&Type::word()));
    }

    #[test]
    fn two_instances_of_one_block_are_memoized_separately() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x = Temp::fresh(&mut ids);
        let u = Temp::fresh(&mut ids);
        let w = Temp::fresh(&mut ids);
        prog.ids = ids;
        let b = prog.add_block(vec![x.clone()], Code::Done(Tail::Return(vec![Atom::Var(x)])));

        // main = u <- b(5); w <- b(true); return [u, w]
        let main = prog.add_top(
            vec![TopLhs::new("m0"), TopLhs::new("m1")],
            Tail::Return(vec![Atom::Var(u.clone()), Atom::Var(w.clone())]),
        );
        // tails of top levels are single tails, so stage through blocks
        let stage = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![u.clone()],
                tail: Tail::BlockCall(BlockCall::new(b, vec![Atom::Lit(Const::Word(5))])),
                rest: Box::new(Code::Bind {
                    vs: vec![w.clone()],
                    tail: Tail::BlockCall(BlockCall::new(b, vec![Atom::Lit(Const::Flag(true))])),
                    rest: Box::new(Code::Done(Tail::Return(vec![
                        Atom::Var(u.clone()),
                        Atom::Var(w.clone()),
                    ]))),
                }),
            },
        );
        prog.put_top_tail(main, Tail::BlockCall(BlockCall::new(stage, Vec::new())));

        let mut handler = Handler::new();
        crate::infer::type_check(&mut prog, &mut handler).unwrap();
        prog.top_mut(main).is_entry = true;

        let out = specialize(&prog).unwrap();
        assert_monomorphic(&out).unwrap();
        // one copy of the stage block and two instances of the identity
        assert_eq!(out.block_ids().len(), 3);

        // demanding the same instance twice reuses the memoized copy, so
        // a Word and a Flag instance both exist exactly once
        let mut word_doms = 0;
        let mut flag_doms = 0;
        for nb in out.block_ids() {
            if let Some(bt) = &out.block(nb).declared {
                if let Some(ts) = bt.dom.tuple_components() {
                    if ts.len() == 1 && ts[0].same(&Type::word()) {
                        word_doms += 1;
                    }
                    if ts.len() == 1 && ts[0].same(&Type::flag()) {
                        flag_doms += 1;
                    }
                }
            }
        }
        assert_eq!(word_doms, 1);
        assert_eq!(flag_doms, 1);
    }
}
