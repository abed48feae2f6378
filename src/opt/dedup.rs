//! Coalescing of duplicate definitions.
//!
//! Definitions are grouped by their alpha-stable summary; within a bucket,
//! alpha-equivalent blocks and top-levels are merged by rewriting the
//! later one into a call to (or return of) the retained one. Closure
//! definitions with equal bodies are merged by redirecting their
//! allocation sites. Buckets are scanned in declaration order, so the
//! first definition of each equivalence class survives. Declared types
//! are compared through a shared canonicalizing set, so equal types are
//! a reference equality test.

use std::collections::HashMap;

use crate::atom::{Atom, Top};
use crate::code::Code;
use crate::defns::{BlockId, ClosureId, Program, TopId};
use crate::tail::{BlockCall, Tail};
use crate::types::{AllocType, BlockType, Scheme};
use crate::tyset::{ref_eq, TypeSet};

/// Merge duplicate definitions; returns whether anything changed.
pub fn eliminate_duplicates(prog: &mut Program) -> bool {
    // one canonicalizing set per run; every type comparison below goes
    // through it
    let mut types = TypeSet::new();
    let mut changed = false;
    changed |= dedup_blocks(prog, &mut types);
    changed |= dedup_tops(prog, &mut types);
    changed |= dedup_closures(prog, &mut types);
    changed
}

// ----------------------------------------------------------------------------
// Canonical type comparison
// ----------------------------------------------------------------------------

fn block_types_equal(types: &mut TypeSet, a: &Option<BlockType>, b: &Option<BlockType>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => {
            x.generics == y.generics && {
                let cx = types.canon_block_type(x);
                let cy = types.canon_block_type(y);
                ref_eq(&cx.dom, &cy.dom) && ref_eq(&cx.rng, &cy.rng)
            }
        }
        // definitions minted since the last checking pass carry no type yet
        (None, None) => true,
        _ => false,
    }
}

fn schemes_equal(types: &mut TypeSet, a: &Option<Scheme>, b: &Option<Scheme>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => {
            x.generics == y.generics
                && ref_eq(&types.canon_scheme(x).body, &types.canon_scheme(y).body)
        }
        (None, None) => true,
        _ => false,
    }
}

fn alloc_types_equal(types: &mut TypeSet, a: &Option<AllocType>, b: &Option<AllocType>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => {
            x.generics == y.generics && x.stored.len() == y.stored.len() && {
                let cx = types.canon_alloc_type(x);
                let cy = types.canon_alloc_type(y);
                cx.stored.iter().zip(&cy.stored).all(|(s, t)| ref_eq(s, t))
                    && ref_eq(&cx.result, &cy.result)
            }
        }
        (None, None) => true,
        _ => false,
    }
}

fn dedup_blocks(prog: &mut Program, types: &mut TypeSet) -> bool {
    let mut buckets: HashMap<i64, Vec<BlockId>> = HashMap::new();
    let mut changed = false;
    for b in prog.block_ids() {
        let blk = prog.block(b);
        // forwarders produced by earlier merges are not candidates
        if let Code::Done(Tail::BlockCall(bc)) = &blk.code {
            let forwards = bc.args.len() == blk.params.len()
                && bc
                    .args
                    .iter()
                    .zip(&blk.params)
                    .all(|(a, p)| matches!(a, Atom::Var(t) if t == p));
            if forwards {
                continue;
            }
        }
        let summary = blk.code.summary();
        let bucket = buckets.entry(summary).or_default();
        let mut merged = false;
        for &kept in bucket.iter() {
            if blocks_alpha_equiv(prog, types, kept, b) {
                log::debug!(
                    "merging duplicate block {} into {}",
                    prog.block(b).name,
                    prog.block(kept).name
                );
                let args: Vec<Atom> =
                    prog.block(b).params.iter().cloned().map(Atom::Var).collect();
                prog.put_block_code(b, Code::Done(Tail::BlockCall(BlockCall::new(kept, args))));
                changed = true;
                merged = true;
                break;
            }
        }
        if !merged {
            bucket.push(b);
        }
    }
    changed
}

fn blocks_alpha_equiv(prog: &Program, types: &mut TypeSet, a: BlockId, b: BlockId) -> bool {
    if a == b {
        return false;
    }
    let ba = prog.block(a);
    let bb = prog.block(b);
    ba.params.len() == bb.params.len()
        && block_types_equal(types, &ba.declared, &bb.declared)
        && ba.code.alpha_code(&ba.params, &bb.code, &bb.params)
}

fn dedup_tops(prog: &mut Program, types: &mut TypeSet) -> bool {
    let mut buckets: HashMap<i64, Vec<TopId>> = HashMap::new();
    let mut changed = false;
    for t in prog.top_ids() {
        let top = prog.top(t);
        if matches!(&top.tail, Tail::Return(atoms) if atoms.iter().all(|a| matches!(a, Atom::Top(_))))
        {
            continue;
        }
        let summary = top.tail.summary();
        let bucket = buckets.entry(summary).or_default();
        let mut merged = false;
        for &kept in bucket.iter() {
            if tops_alpha_equiv(prog, types, kept, t) {
                log::debug!("merging duplicate top-level into {}", prog.top(kept).lhs[0].name);
                let n = prog.top(t).lhs.len();
                let atoms: Vec<Atom> =
                    (0..n).map(|i| Atom::Top(Top::Def { top: kept, index: i })).collect();
                prog.put_top_tail(t, Tail::Return(atoms));
                // the forwarder's value is only static if the target is
                prog.top_mut(t).is_static = false;
                changed = true;
                merged = true;
                break;
            }
        }
        if !merged {
            bucket.push(t);
        }
    }
    changed
}

fn tops_alpha_equiv(prog: &Program, types: &mut TypeSet, a: TopId, b: TopId) -> bool {
    if a == b {
        return false;
    }
    let ta = prog.top(a);
    let tb = prog.top(b);
    ta.lhs.len() == tb.lhs.len()
        && ta
            .lhs
            .iter()
            .zip(&tb.lhs)
            .all(|(x, y)| schemes_equal(types, &x.declared, &y.declared))
        && ta.tail.alpha_tail(&[], &tb.tail, &[])
}

fn dedup_closures(prog: &mut Program, types: &mut TypeSet) -> bool {
    let mut buckets: HashMap<i64, Vec<ClosureId>> = HashMap::new();
    let mut remap: HashMap<ClosureId, ClosureId> = HashMap::new();
    for k in prog.closure_ids() {
        let summary = prog.closure(k).tail.summary();
        let bucket = buckets.entry(summary).or_default();
        let mut merged = false;
        for &kept in bucket.iter() {
            if closures_alpha_equiv(prog, types, kept, k) {
                log::debug!(
                    "merging duplicate closure {} into {}",
                    prog.closure(k).name,
                    prog.closure(kept).name
                );
                remap.insert(k, kept);
                merged = true;
                break;
            }
        }
        if !merged {
            bucket.push(k);
        }
    }
    if remap.is_empty() {
        return false;
    }
    redirect_clos_allocs(prog, &remap);
    true
}

fn closures_alpha_equiv(prog: &Program, types: &mut TypeSet, a: ClosureId, b: ClosureId) -> bool {
    if a == b {
        return false;
    }
    let ka = prog.closure(a);
    let kb = prog.closure(b);
    if ka.params.len() != kb.params.len() || ka.args.len() != kb.args.len() {
        return false;
    }
    if !alloc_types_equal(types, &ka.declared, &kb.declared) {
        return false;
    }
    let mut env_a = ka.params.clone();
    env_a.extend(ka.args.iter().cloned());
    let mut env_b = kb.params.clone();
    env_b.extend(kb.args.iter().cloned());
    ka.tail.alpha_tail(&env_a, &kb.tail, &env_b)
}

/// Point every allocation of a merged closure at the retained one.
fn redirect_clos_allocs(prog: &mut Program, remap: &HashMap<ClosureId, ClosureId>) {
    fn fix_tail(remap: &HashMap<ClosureId, ClosureId>, tail: Tail) -> Tail {
        match tail {
            Tail::ClosAlloc { closure, args } => {
                let closure = remap.get(&closure).copied().unwrap_or(closure);
                Tail::ClosAlloc { closure, args }
            }
            t => t,
        }
    }
    fn fix_code(remap: &HashMap<ClosureId, ClosureId>, code: Code) -> Code {
        match code {
            Code::Bind { vs, tail, rest } => Code::Bind {
                vs,
                tail: fix_tail(remap, tail),
                rest: Box::new(fix_code(remap, *rest)),
            },
            Code::Done(t) => Code::Done(fix_tail(remap, t)),
            code => code,
        }
    }
    for b in prog.block_ids() {
        let code = prog.take_block_code(b);
        let code = fix_code(remap, code);
        prog.put_block_code(b, code);
    }
    for k in prog.closure_ids() {
        let tail = prog.take_closure_tail(k);
        let tail = fix_tail(remap, tail);
        prog.put_closure_tail(k, tail);
    }
    for t in prog.top_ids() {
        let tail = prog.take_top_tail(t);
        let tail = fix_tail(remap, tail);
        prog.put_top_tail(t, tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Const, Temp};

    #[test]
    fn alpha_equivalent_blocks_merge_into_the_first() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x1 = Temp::fresh(&mut ids);
        let x2 = Temp::fresh(&mut ids);
        prog.ids = ids;

        let first = prog.add_block(
            vec![x1.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(x1), Atom::Lit(Const::Word(1))])),
        );
        let second = prog.add_block(
            vec![x2.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(x2), Atom::Lit(Const::Word(1))])),
        );
        assert!(eliminate_duplicates(&mut prog));
        match &prog.block(second).code {
            Code::Done(Tail::BlockCall(bc)) => assert_eq!(bc.block, first),
            c => panic!("blocks not merged: {}", c),
        }
        // the retained block is untouched
        assert!(matches!(&prog.block(first).code, Code::Done(Tail::Return(_))));
        // and a second pass settles
        assert!(!eliminate_duplicates(&mut prog));
    }

    #[test]
    fn equal_bodies_with_different_types_do_not_merge() {
        use crate::types::{BlockType, Type};
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x1 = Temp::fresh(&mut ids);
        let x2 = Temp::fresh(&mut ids);
        prog.ids = ids;

        let a = prog.add_block(vec![x1.clone()], Code::Done(Tail::Return(vec![Atom::Var(x1)])));
        let b = prog.add_block(vec![x2.clone()], Code::Done(Tail::Return(vec![Atom::Var(x2)])));
        let word_ty =
            BlockType::mono(Type::tuple(vec![Type::word()]), Type::tuple(vec![Type::word()]));
        let flag_ty =
            BlockType::mono(Type::tuple(vec![Type::flag()]), Type::tuple(vec![Type::flag()]));
        prog.block_mut(a).declared = Some(word_ty.clone());
        prog.block_mut(b).declared = Some(flag_ty);
        // alpha-equal bodies, but the canonical types disagree
        assert!(!eliminate_duplicates(&mut prog));
        assert!(matches!(&prog.block(b).code, Code::Done(Tail::Return(_))));

        // with agreeing canonical types the merge goes through
        prog.block_mut(b).declared = Some(word_ty);
        assert!(eliminate_duplicates(&mut prog));
        assert!(matches!(&prog.block(b).code, Code::Done(Tail::BlockCall(_))));
    }

    #[test]
    fn different_constants_do_not_merge() {
        let mut prog = Program::new();
        let a = prog.add_block(
            Vec::new(),
            Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(1))])),
        );
        let b = prog.add_block(
            Vec::new(),
            Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(2))])),
        );
        assert!(!eliminate_duplicates(&mut prog));
        assert!(matches!(&prog.block(a).code, Code::Done(Tail::Return(_))));
        assert!(matches!(&prog.block(b).code, Code::Done(Tail::Return(_))));
    }

    #[test]
    fn closure_allocation_sites_are_redirected() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let a1 = Temp::fresh(&mut ids);
        let a2 = Temp::fresh(&mut ids);
        prog.ids = ids;

        let k1 = prog.add_closure(Vec::new(), vec![a1.clone()], Tail::Return(vec![Atom::Var(a1)]));
        let k2 = prog.add_closure(Vec::new(), vec![a2.clone()], Tail::Return(vec![Atom::Var(a2)]));
        let site = prog.add_block(
            Vec::new(),
            Code::Done(Tail::ClosAlloc { closure: k2, args: Vec::new() }),
        );
        assert!(eliminate_duplicates(&mut prog));
        match &prog.block(site).code {
            Code::Done(Tail::ClosAlloc { closure, .. }) => assert_eq!(*closure, k1),
            c => panic!("allocation not redirected: {}", c),
        }
    }
}
