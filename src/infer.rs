//! Type inference over MIL definitions.
//!
//! Inference proceeds in three passes over the definitions: skeleton types
//! are installed first (instantiating declared types where present), then
//! every body is checked by unification, and finally the remaining free
//! type variables are generalized into the declared types. A definition
//! whose types are all declared can recover from a checking failure: the
//! failure is reported through the handler and the rest of the program is
//! still checked.

use std::cell::RefCell;
use std::rc::Rc;

use crate::atom::{Atom, Const, Temp, Top};
use crate::code::Code;
use crate::defns::{BlockId, ClosureId, Program, TopId};
use crate::errors::{Failure, Handler};
use crate::kind::Kind;
use crate::tail::Tail;
use crate::types::{AllocType, BlockType, IdSource, Scheme, TVar, Type};

/// Type check a whole program in place.
pub fn type_check(prog: &mut Program, handler: &mut Handler) -> Result<(), Failure> {
    let mut ids = std::mem::take(&mut prog.ids);
    let result = type_check_with(prog, &mut ids, handler);
    prog.ids = ids;
    result
}

fn type_check_with(
    prog: &mut Program,
    ids: &mut IdSource,
    handler: &mut Handler,
) -> Result<(), Failure> {
    set_initial_types(prog, ids)?;
    // bodies are checked and generalized one strongly connected component
    // at a time, leaves first, so callers see their callees' schemes
    for scc in prog.sccs() {
        for d in &scc {
            check_defn(prog, ids, handler, *d)?;
        }
        for d in &scc {
            generalize_defn(prog, handler, *d)?;
        }
    }
    Ok(())
}

fn check_defn(
    prog: &mut Program,
    ids: &mut IdSource,
    handler: &mut Handler,
    d: crate::defns::DefnRef,
) -> Result<(), Failure> {
    match d {
        crate::defns::DefnRef::Block(b) => check_block(prog, ids, handler, b),
        crate::defns::DefnRef::Closure(k) => check_closure(prog, ids, handler, k),
        crate::defns::DefnRef::Top(t) => check_top(prog, ids, handler, t),
        crate::defns::DefnRef::Ext(_) => Ok(()),
    }
}

fn generalize_defn(
    prog: &mut Program,
    handler: &mut Handler,
    d: crate::defns::DefnRef,
) -> Result<(), Failure> {
    match d {
        crate::defns::DefnRef::Block(b) => generalize_block(prog, handler, b),
        crate::defns::DefnRef::Closure(k) => generalize_closure(prog, k),
        crate::defns::DefnRef::Top(t) => generalize_top(prog, t),
        crate::defns::DefnRef::Ext(_) => Ok(()),
    }
}

// ============================================================================
// Pass 1: skeleton types
// ============================================================================

fn set_initial_types(prog: &mut Program, ids: &mut IdSource) -> Result<(), Failure> {
    for b in prog.block_ids() {
        set_initial_block(prog, ids, b)?;
    }
    for k in prog.closure_ids() {
        set_initial_closure(prog, ids, k)?;
    }
    for t in prog.top_ids() {
        set_initial_top(prog, ids, t)?;
    }
    Ok(())
}

fn set_initial_block(prog: &mut Program, ids: &mut IdSource, b: BlockId) -> Result<(), Failure> {
    let params: Vec<Type> =
        prog.block(b).params.iter().map(|p| p.fresh_type(ids)).collect();
    let dom = Type::tuple(params);
    let rng = ids.fresh_tvar(Kind::Tuple);
    if let Some(declared) = prog.block(b).declared.clone() {
        let (ddom, drng) = declared.instantiate(ids);
        ddom.unify(&dom)?;
        drng.unify(&rng)?;
    }
    prog.block_mut(b).defining = Some((dom, rng));
    Ok(())
}

fn set_initial_closure(prog: &mut Program, ids: &mut IdSource, k: ClosureId) -> Result<(), Failure> {
    let stored: Vec<Type> =
        prog.closure(k).params.iter().map(|p| p.fresh_type(ids)).collect();
    let args: Vec<Type> = prog.closure(k).args.iter().map(|a| a.fresh_type(ids)).collect();
    let rng = ids.fresh_tvar(Kind::Tuple);
    let result = Type::milfun(Type::tuple(args), rng);
    if let Some(declared) = prog.closure(k).declared.clone() {
        let (dstored, dresult) = declared.instantiate(ids);
        if dstored.len() != stored.len() {
            return Err(Failure::TypeMismatch {
                expected: Type::tuple(dstored),
                found: Type::tuple(stored),
            });
        }
        for (d, s) in dstored.iter().zip(&stored) {
            d.unify(s)?;
        }
        dresult.unify(&result)?;
    }
    prog.closure_mut(k).defining = Some((stored, result));
    Ok(())
}

fn set_initial_top(prog: &mut Program, ids: &mut IdSource, t: TopId) -> Result<(), Failure> {
    let mut defs = Vec::new();
    for lhs in &prog.top(t).lhs {
        defs.push(match &lhs.declared {
            Some(s) => s.instantiate(ids),
            None => ids.fresh_tvar(Kind::Star),
        });
    }
    for (lhs, d) in prog.top_mut(t).lhs.iter_mut().zip(defs) {
        lhs.defining = Some(d);
    }
    Ok(())
}

// ============================================================================
// Pass 2: body checking
// ============================================================================

fn check_block(
    prog: &mut Program,
    ids: &mut IdSource,
    handler: &mut Handler,
    b: BlockId,
) -> Result<(), Failure> {
    let Some(rng) = prog.block(b).defining.as_ref().map(|(_, r)| r.clone()) else {
        return Ok(());
    };
    let result = {
        let code = &prog.blocks[b].code;
        infer_code(prog, ids, code, &rng)
    };
    if let Err(f) = result {
        // recovery is only possible when the types were declared up front
        if prog.block(b).declared.is_some() {
            handler.report(f);
            prog.block_mut(b).defining = None;
        } else {
            return Err(f);
        }
    }
    Ok(())
}

fn check_closure(
    prog: &mut Program,
    ids: &mut IdSource,
    handler: &mut Handler,
    k: ClosureId,
) -> Result<(), Failure> {
    let result = {
        let defn = &prog.closures[k];
        let Some(rng) = defn
            .defining
            .as_ref()
            .and_then(|(_, r)| r.milfun_components())
            .map(|(_, rng)| rng)
        else {
            return Ok(());
        };
        infer_tail(prog, ids, &defn.tail).and_then(|t| t.unify(&rng))
    };
    if let Err(f) = result {
        if prog.closure(k).declared.is_some() {
            handler.report(f);
            prog.closure_mut(k).defining = None;
        } else {
            return Err(f);
        }
    }
    Ok(())
}

fn check_top(
    prog: &mut Program,
    ids: &mut IdSource,
    handler: &mut Handler,
    t: TopId,
) -> Result<(), Failure> {
    let result = {
        let defn = &prog.tops[t];
        let expected =
            Type::tuple(defn.lhs.iter().map(|l| l.defining.clone().unwrap()).collect());
        infer_tail(prog, ids, &defn.tail).and_then(|ty| ty.unify(&expected))
    };
    if let Err(f) = result {
        if prog.top(t).lhs.iter().all(|l| l.declared.is_some()) {
            handler.report(f);
        } else {
            return Err(f);
        }
    }
    Ok(())
}

/// The type of an atom when read as an operand.
pub fn atom_type(prog: &Program, ids: &mut IdSource, a: &Atom) -> Result<Type, Failure> {
    match a {
        Atom::Var(t) => Ok(t.ty()),
        Atom::Lit(Const::Word(_)) => Ok(Type::word()),
        Atom::Lit(Const::Flag(_)) => Ok(Type::flag()),
        Atom::Top(Top::Def { top, index }) => {
            let lhs = prog
                .top(*top)
                .lhs
                .get(*index)
                .ok_or_else(|| Failure::Internal("top component index out of range".into()))?;
            match (&lhs.declared, &lhs.defining) {
                (Some(s), _) => Ok(s.instantiate(ids)),
                (None, Some(t)) => Ok(t.clone()),
                (None, None) => Err(Failure::Scope(lhs.name.clone())),
            }
        }
        Atom::Top(Top::Ext(e)) => Ok(prog.external(*e).declared.instantiate(ids)),
    }
}

fn atom_types(prog: &Program, ids: &mut IdSource, atoms: &[Atom]) -> Result<Vec<Type>, Failure> {
    atoms.iter().map(|a| atom_type(prog, ids, a)).collect()
}

/// The result tuple type of a tail.
pub fn infer_tail(prog: &Program, ids: &mut IdSource, tail: &Tail) -> Result<Type, Failure> {
    match tail {
        Tail::Return(atoms) => Ok(Type::tuple(atom_types(prog, ids, atoms)?)),
        Tail::Enter { f, args } => {
            let tf = atom_type(prog, ids, f)?;
            let rng = ids.fresh_tvar(Kind::Tuple);
            tf.unify(&Type::milfun(Type::tuple(atom_types(prog, ids, args)?), rng.clone()))?;
            Ok(rng)
        }
        Tail::BlockCall(bc) => {
            let (dom, rng) = block_call_types(prog, ids, bc.block)?;
            dom.unify(&Type::tuple(atom_types(prog, ids, &bc.args)?))?;
            Ok(rng)
        }
        Tail::PrimCall { prim, args } => {
            let (dom, rng) = prim.block_type().instantiate(ids);
            dom.unify(&Type::tuple(atom_types(prog, ids, args)?))?;
            Ok(rng)
        }
        Tail::Sel { cfun, index, from } => {
            let (stored, result) = cfun.alloc_type().instantiate(ids);
            atom_type(prog, ids, from)?.unify(&result)?;
            let field = stored
                .get(*index)
                .cloned()
                .ok_or_else(|| Failure::Internal("selector index out of range".into()))?;
            Ok(Type::tuple(vec![field]))
        }
        Tail::DataAlloc { cfun, args } => {
            let (stored, result) = cfun.alloc_type().instantiate(ids);
            Type::tuple(stored).unify(&Type::tuple(atom_types(prog, ids, args)?))?;
            Ok(Type::tuple(vec![result]))
        }
        Tail::ClosAlloc { closure, args } => {
            let (stored, result) = closure_alloc_types(prog, ids, *closure)?;
            Type::tuple(stored).unify(&Type::tuple(atom_types(prog, ids, args)?))?;
            Ok(Type::tuple(vec![result]))
        }
    }
}

fn block_call_types(prog: &Program, ids: &mut IdSource, b: BlockId) -> Result<(Type, Type), Failure> {
    let blk = prog.block(b);
    match (&blk.declared, &blk.defining) {
        (Some(bt), _) => Ok(bt.instantiate(ids)),
        (None, Some((dom, rng))) => Ok((dom.clone(), rng.clone())),
        (None, None) => Err(Failure::Scope(blk.name.clone())),
    }
}

fn closure_alloc_types(
    prog: &Program,
    ids: &mut IdSource,
    k: ClosureId,
) -> Result<(Vec<Type>, Type), Failure> {
    let defn = prog.closure(k);
    match (&defn.declared, &defn.defining) {
        (Some(at), _) => Ok(at.instantiate(ids)),
        (None, Some((stored, result))) => Ok((stored.clone(), result.clone())),
        (None, None) => Err(Failure::Scope(defn.name.clone())),
    }
}

/// Check a code sequence against the expected result tuple type.
pub fn infer_code(
    prog: &Program,
    ids: &mut IdSource,
    code: &Code,
    rng: &Type,
) -> Result<(), Failure> {
    match code {
        Code::Bind { vs, tail, rest } => {
            let t = infer_tail(prog, ids, tail)?;
            let vts: Vec<Type> = vs.iter().map(|v| v.fresh_type(ids)).collect();
            t.unify(&Type::tuple(vts))?;
            infer_code(prog, ids, rest, rng)
        }
        Code::Done(t) => infer_tail(prog, ids, t)?.unify(rng),
        Code::Case { scrutinee, alts, default } => {
            let sty = atom_type(prog, ids, scrutinee)?;
            for alt in alts {
                let (_, result) = alt.cfun.alloc_type().instantiate(ids);
                sty.unify(&result)?;
                let (dom, arng) = block_call_types(prog, ids, alt.call.block)?;
                dom.unify(&Type::tuple(atom_types(prog, ids, &alt.call.args)?))?;
                arng.unify(rng)?;
            }
            if let Some(d) = default {
                let (dom, drng) = block_call_types(prog, ids, d.block)?;
                dom.unify(&Type::tuple(atom_types(prog, ids, &d.args)?))?;
                drng.unify(rng)?;
            }
            Ok(())
        }
        Code::If { cond, if_true, if_false } => {
            atom_type(prog, ids, cond)?.unify(&Type::flag())?;
            for branch in [if_true, if_false] {
                let (dom, brng) = block_call_types(prog, ids, branch.block)?;
                dom.unify(&Type::tuple(atom_types(prog, ids, &branch.args)?))?;
                brng.unify(rng)?;
            }
            Ok(())
        }
    }
}

// ============================================================================
// Pass 3: generalization
// ============================================================================

fn generalize_block(prog: &mut Program, handler: &mut Handler, b: BlockId) -> Result<(), Failure> {
    let Some((dom, rng)) = prog.block(b).defining.clone() else { return Ok(()) };
    let mut gens = Vec::new();
    dom.tvars(&mut gens);
    rng.tvars(&mut gens);
    let inferred = BlockType {
        generics: generic_kinds(&gens),
        dom: dom.skeleton(&gens),
        rng: rng.skeleton(&gens),
    };
    log::debug!("inferred {} :: {}", prog.block(b).name, inferred);
    let blk = prog.block_mut(b);
    match &blk.declared {
        None => blk.declared = Some(inferred),
        Some(declared) => {
            if !declared.alpha_equiv(&inferred) {
                return Err(Failure::DeclaredTooGeneral {
                    id: blk.name.clone(),
                    declared: declared.to_string(),
                    inferred: inferred.to_string(),
                });
            }
        }
    }
    find_ambig_tvars(prog, b, &gens, handler);
    Ok(())
}

fn generalize_closure(prog: &mut Program, k: ClosureId) -> Result<(), Failure> {
    let Some((stored, result)) = prog.closure(k).defining.clone() else { return Ok(()) };
    let mut gens = Vec::new();
    for s in &stored {
        s.tvars(&mut gens);
    }
    result.tvars(&mut gens);
    let inferred = AllocType {
        generics: generic_kinds(&gens),
        stored: stored.iter().map(|s| s.skeleton(&gens)).collect(),
        result: result.skeleton(&gens),
    };
    log::debug!("inferred {} :: {}", prog.closure(k).name, inferred);
    let defn = prog.closure_mut(k);
    match &defn.declared {
        None => defn.declared = Some(inferred),
        Some(declared) => {
            if !declared.alpha_equiv(&inferred) {
                return Err(Failure::DeclaredTooGeneral {
                    id: defn.name.clone(),
                    declared: declared.to_string(),
                    inferred: inferred.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn generalize_top(prog: &mut Program, t: TopId) -> Result<(), Failure> {
    for i in 0..prog.top(t).lhs.len() {
        let Some(defining) = prog.top(t).lhs[i].defining.clone() else { continue };
        let mut gens = Vec::new();
        defining.tvars(&mut gens);
        let inferred = Scheme::generalize(&defining, &gens);
        let lhs = &mut prog.top_mut(t).lhs[i];
        match &lhs.declared {
            None => lhs.declared = Some(inferred),
            Some(declared) => {
                if !declared.alpha_equiv(&inferred) {
                    return Err(Failure::DeclaredTooGeneral {
                        id: lhs.name.clone(),
                        declared: declared.to_string(),
                        inferred: inferred.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn generic_kinds(gens: &[Rc<RefCell<TVar>>]) -> Vec<Kind> {
    gens.iter()
        .map(|v| match &*v.borrow() {
            TVar::Unbound { kind, .. } => kind.clone(),
            TVar::Link(_) => Kind::Star,
        })
        .collect()
}

/// Report type variables that appear in a block body but not in its
/// signature; these are ambiguous but do not abort checking.
fn find_ambig_tvars(
    prog: &Program,
    b: BlockId,
    gens: &[Rc<RefCell<TVar>>],
    handler: &mut Handler,
) {
    fn walk(code: &Code, acc: &mut Vec<Rc<RefCell<TVar>>>) {
        if let Code::Bind { vs, rest, .. } = code {
            for v in vs {
                v.ty().tvars(acc);
            }
            walk(rest, acc);
        }
    }
    let mut body_vars = Vec::new();
    walk(&prog.block(b).code, &mut body_vars);
    let extras: Vec<String> = body_vars
        .iter()
        .filter(|v| !gens.iter().any(|g| Rc::ptr_eq(g, v)))
        .map(|v| match &*v.borrow() {
            TVar::Unbound { id, .. } => format!("t{}", id),
            TVar::Link(_) => String::new(),
        })
        .filter(|s| !s.is_empty())
        .collect();
    if !extras.is_empty() {
        handler.report(Failure::AmbiguousTypeVariable {
            id: prog.block(b).name.clone(),
            vars: extras.join(", "),
        });
    }
}

/// Set the declared scheme for a top-level component, reporting a second
/// annotation for the same name as an error.
pub fn set_top_declared(
    prog: &mut Program,
    handler: &mut Handler,
    t: TopId,
    index: usize,
    scheme: Scheme,
) {
    let lhs = &mut prog.top_mut(t).lhs[index];
    if lhs.declared.is_some() {
        handler.report(Failure::MultipleDeclarations(lhs.name.clone()));
        return;
    }
    lhs.declared = Some(scheme);
}

/// Scope check: every temporary read by a definition body must be bound
/// by a parameter or an enclosing bind.
pub fn check_scope(prog: &Program) -> Result<(), Failure> {
    fn check_code(code: &Code, bound: &mut Vec<Temp>) -> Result<(), Failure> {
        match code {
            Code::Bind { vs, tail, rest } => {
                check_tail(tail, bound)?;
                bound.extend(vs.iter().cloned());
                check_code(rest, bound)
            }
            Code::Done(t) => check_tail(t, bound),
            Code::Case { scrutinee, alts, default } => {
                check_atom(scrutinee, bound)?;
                for alt in alts {
                    for a in &alt.call.args {
                        check_atom(a, bound)?;
                    }
                }
                if let Some(d) = default {
                    for a in &d.args {
                        check_atom(a, bound)?;
                    }
                }
                Ok(())
            }
            Code::If { cond, if_true, if_false } => {
                check_atom(cond, bound)?;
                for a in if_true.args.iter().chain(&if_false.args) {
                    check_atom(a, bound)?;
                }
                Ok(())
            }
        }
    }
    fn check_tail(tail: &Tail, bound: &[Temp]) -> Result<(), Failure> {
        for a in tail.atoms() {
            check_atom(&a, bound)?;
        }
        Ok(())
    }
    fn check_atom(a: &Atom, bound: &[Temp]) -> Result<(), Failure> {
        match a {
            Atom::Var(t) if !t.is_live() => {
                Err(Failure::Internal("wildcard read as an operand".into()))
            }
            Atom::Var(t) if !t.is_in(bound) => Err(Failure::Scope(t.name().to_string())),
            _ => Ok(()),
        }
    }

    for (_, b) in prog.blocks.iter() {
        let mut bound = b.params.clone();
        check_code(&b.code, &mut bound)?;
    }
    for (_, k) in prog.closures.iter() {
        let mut bound = k.params.clone();
        bound.extend(k.args.iter().cloned());
        check_tail(&k.tail, &bound)?;
    }
    for (_, t) in prog.tops.iter() {
        check_tail(&t.tail, &[])?;
    }
    Ok(())
}
