//! Inlining of block calls.
//!
//! Prefix inlining replaces a block call on the right hand side of a bind
//! with a renamed copy of the callee's body; suffix inlining does the same
//! for a call in tail position. Both require the callee to be
//! non-recursive in the sense that no chain of unguarded tail calls leads
//! back to it, and both respect a small budget: tiny bodies always inline,
//! and a block with a single calling occurrence inlines regardless of
//! size. Goto blocks (a body that is nothing but another call) are
//! bypassed wherever they appear.

use crate::atom::TempSubst;
use crate::code::Code;
use crate::defns::{BlockId, Program};
use crate::tail::{BlockCall, Tail};
use crate::types::IdSource;

/// Bodies of at most this many code nodes inline without further checks.
pub const INLINE_LINES: usize = 2;

/// Run one round of inlining over every definition.
pub fn inline_pass(prog: &mut Program) -> bool {
    prog.count_occurrences();
    let mut ids = std::mem::take(&mut prog.ids);
    let mut changed = false;

    for b in prog.block_ids() {
        // goto blocks stay gotos: call sites bypass them, and inlining
        // their target into them would only undo duplicate coalescing
        if as_goto(prog, b).is_some() {
            continue;
        }
        let code = prog.take_block_code(b);
        let (code, c) = inline_code(prog, &mut ids, b, code);
        prog.put_block_code(b, code);
        changed |= c;
    }
    for k in prog.closure_ids() {
        let tail = prog.take_closure_tail(k);
        let (tail, c) = inline_tail(prog, &mut ids, tail);
        prog.put_closure_tail(k, tail);
        changed |= c;
    }
    for t in prog.top_ids() {
        let tail = prog.take_top_tail(t);
        let (tail, c) = inline_tail(prog, &mut ids, tail);
        prog.put_top_tail(t, tail);
        changed |= c;
    }

    prog.ids = ids;
    changed
}

fn inline_code(prog: &Program, ids: &mut IdSource, src: BlockId, code: Code) -> (Code, bool) {
    match code {
        Code::Bind { vs, tail, rest } => {
            let (rest, mut changed) = inline_code(prog, ids, src, *rest);
            if let Tail::BlockCall(bc) = &tail {
                if let Some(inlined) = prefix_inline(prog, ids, bc, &vs, &rest) {
                    log::debug!("prefix inlining call to {}", prog.block(bc.block).name);
                    return (inlined, true);
                }
            }
            let (tail, c) = bypass_goto_tail(prog, tail);
            changed |= c;
            (Code::Bind { vs, tail, rest: Box::new(rest) }, changed)
        }
        Code::Done(tail) => {
            if let Tail::BlockCall(bc) = &tail {
                if let Some(inlined) = suffix_inline(prog, ids, src, bc) {
                    log::debug!("suffix inlining call to {}", prog.block(bc.block).name);
                    return (inlined, true);
                }
            }
            let (tail, c) = bypass_goto_tail(prog, tail);
            (Code::Done(tail), c)
        }
        Code::Case { scrutinee, alts, default } => {
            let mut changed = false;
            let alts = alts
                .into_iter()
                .map(|mut alt| {
                    let (call, c) = bypass_goto_call(prog, alt.call);
                    alt.call = call;
                    changed |= c;
                    alt
                })
                .collect();
            let default = default.map(|d| {
                let (d, c) = bypass_goto_call(prog, d);
                changed |= c;
                d
            });
            (Code::Case { scrutinee, alts, default }, changed)
        }
        Code::If { cond, if_true, if_false } => {
            let (if_true, c1) = bypass_goto_call(prog, if_true);
            let (if_false, c2) = bypass_goto_call(prog, if_false);
            (Code::If { cond, if_true, if_false }, c1 || c2)
        }
    }
}

/// Inline a call in bind position: the callee body must be straight-line
/// so its final tail can feed the bind.
fn prefix_inline(
    prog: &Program,
    ids: &mut IdSource,
    bc: &BlockCall,
    vs: &[crate::atom::Temp],
    rest: &Code,
) -> Option<Code> {
    let callee = prog.block(bc.block);
    if !callee.code.is_straight_line() {
        return None;
    }
    if callee.params.len() != bc.args.len() {
        return None;
    }
    if !(callee.code.size() <= INLINE_LINES || callee.occurrences == 1) {
        return None;
    }
    if reaches_unguarded(prog, bc.block, bc.block) {
        return None;
    }
    let s = TempSubst::empty().extend_pairs(&callee.params, &bc.args);
    let body = callee.code.apply_freshening(&s, ids);
    Some(splice(body, vs, rest))
}

/// Attach `vs <- final tail; rest` to the end of a straight-line body.
fn splice(body: Code, vs: &[crate::atom::Temp], rest: &Code) -> Code {
    match body {
        Code::Bind { vs: bs, tail, rest: r } => {
            Code::Bind { vs: bs, tail, rest: Box::new(splice(*r, vs, rest)) }
        }
        Code::Done(t) => Code::Bind { vs: vs.to_vec(), tail: t, rest: Box::new(rest.clone()) },
        other => other,
    }
}

/// Inline a call in tail position, replacing it with a renamed copy of the
/// callee's body.
fn suffix_inline(prog: &Program, ids: &mut IdSource, src: BlockId, bc: &BlockCall) -> Option<Code> {
    if bc.block == src {
        return None;
    }
    let callee = prog.block(bc.block);
    if callee.params.len() != bc.args.len() {
        return None;
    }
    if !(callee.code.size() <= INLINE_LINES || callee.occurrences == 1) {
        return None;
    }
    // an unguarded tail-call chain back to the source or to the callee
    // itself would inline forever
    if reaches_unguarded(prog, bc.block, src) || reaches_unguarded(prog, bc.block, bc.block) {
        return None;
    }
    let s = TempSubst::empty().extend_pairs(&callee.params, &bc.args);
    Some(callee.code.apply_freshening(&s, ids))
}

/// Whether a chain of unguarded tail calls starting at `from` can reach
/// `target`. Case and If branches guard against the loop, so only the
/// terminal tails of straight-line bodies are followed.
pub fn reaches_unguarded(prog: &Program, from: BlockId, target: BlockId) -> bool {
    let mut visited = Vec::new();
    let mut cur = from;
    loop {
        match final_tail_call(&prog.block(cur).code) {
            Some(next) => {
                if next == target {
                    return true;
                }
                if visited.contains(&next) {
                    return false;
                }
                visited.push(next);
                cur = next;
            }
            None => return false,
        }
    }
}

fn final_tail_call(code: &Code) -> Option<BlockId> {
    match code {
        Code::Bind { rest, .. } => final_tail_call(rest),
        Code::Done(Tail::BlockCall(bc)) => Some(bc.block),
        _ => None,
    }
}

/// A goto block has no purpose beyond renaming: its whole body is a single
/// call. Calls to one are redirected to its target.
fn as_goto(prog: &Program, b: BlockId) -> Option<&BlockCall> {
    match &prog.block(b).code {
        Code::Done(Tail::BlockCall(bc)) => Some(bc),
        _ => None,
    }
}

fn bypass_goto_call(prog: &Program, call: BlockCall) -> (BlockCall, bool) {
    let mut call = call;
    let mut changed = false;
    let mut hops = Vec::new();
    while let Some(target) = as_goto(prog, call.block) {
        if call.block == target.block || hops.contains(&call.block) {
            break;
        }
        hops.push(call.block);
        let params = &prog.block(call.block).params;
        if params.len() != call.args.len() {
            break;
        }
        let s = TempSubst::empty().extend_pairs(params, &call.args);
        call = target.apply(&s);
        changed = true;
    }
    (call, changed)
}

fn bypass_goto_tail(prog: &Program, tail: Tail) -> (Tail, bool) {
    match tail {
        Tail::BlockCall(bc) => {
            let (bc, changed) = bypass_goto_call(prog, bc);
            (Tail::BlockCall(bc), changed)
        }
        t => (t, false),
    }
}

/// Skip goto blocks in the tail of a closure or top-level definition, and
/// replace a call to a block whose body is a single tail with that tail.
fn inline_tail(prog: &Program, _ids: &mut IdSource, tail: Tail) -> (Tail, bool) {
    let (tail, mut changed) = bypass_goto_tail(prog, tail);
    if let Tail::BlockCall(bc) = &tail {
        let callee = prog.block(bc.block);
        if callee.params.len() == bc.args.len() {
            if let Code::Done(t) = &callee.code {
                if !matches!(t, Tail::BlockCall(_)) {
                    let s = TempSubst::empty().extend_pairs(&callee.params, &bc.args);
                    return (t.apply(&s), true);
                }
            }
        }
    }
    (tail, changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, Const, Temp};

    #[test]
    fn prefix_inline_splices_small_bodies() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let p = Temp::fresh(&mut ids);
        let v = Temp::fresh(&mut ids);
        prog.ids = ids;
        // callee: b0[p] = return [p]
        let callee = prog.add_block(vec![p.clone()], Code::Done(Tail::Return(vec![Atom::Var(p)])));
        // caller: b1[] = v <- b0(42); return [v]
        let caller = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![v.clone()],
                tail: Tail::BlockCall(BlockCall::new(callee, vec![Atom::Lit(Const::Word(42))])),
                rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(v)]))),
            },
        );
        assert!(inline_pass(&mut prog));
        // the call is gone: v is bound directly to the constant
        match &prog.block(caller).code {
            Code::Bind { tail, .. } => match tail {
                Tail::Return(atoms) => {
                    assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(42))))
                }
                t => panic!("call not inlined: {}", t),
            },
            c => panic!("unexpected shape: {}", c),
        }
    }

    #[test]
    fn self_recursive_blocks_are_not_inlined() {
        let mut prog = Program::new();
        // b0[] = b0()  (a direct loop)
        let b = prog.add_block(Vec::new(), Code::Done(Tail::Return(Vec::new())));
        prog.put_block_code(b, Code::Done(Tail::BlockCall(BlockCall::new(b, Vec::new()))));
        let caller = prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(b, Vec::new()))),
        );
        inline_pass(&mut prog);
        // the caller still calls b (possibly after goto bypassing to b itself)
        match &prog.block(caller).code {
            Code::Done(Tail::BlockCall(bc)) => assert_eq!(bc.block, b),
            c => panic!("unexpected shape: {}", c),
        }
    }

    #[test]
    fn goto_chains_are_bypassed_in_branches() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let a = Temp::fresh(&mut ids);
        let b = Temp::fresh(&mut ids);
        let c = Temp::fresh(&mut ids);
        prog.ids = ids;

        // target is over the inline budget and multiply used, so the goto
        // in front of it survives as a goto and gets bypassed
        let target = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![a.clone()],
                tail: Tail::Return(vec![Atom::Lit(Const::Word(1))]),
                rest: Box::new(Code::Bind {
                    vs: vec![b.clone()],
                    tail: Tail::Return(vec![Atom::Lit(Const::Word(2))]),
                    rest: Box::new(Code::Bind {
                        vs: vec![c.clone()],
                        tail: Tail::Return(vec![Atom::Lit(Const::Word(3))]),
                        rest: Box::new(Code::Done(Tail::Return(vec![
                            Atom::Var(a),
                            Atom::Var(b),
                            Atom::Var(c),
                        ]))),
                    }),
                }),
            },
        );
        let goto = prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(target, Vec::new()))),
        );
        prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(target, Vec::new()))),
        );
        let cond = prog.add_block(
            Vec::new(),
            Code::If {
                cond: Atom::Lit(Const::Flag(true)),
                if_true: BlockCall::new(goto, Vec::new()),
                if_false: BlockCall::new(goto, Vec::new()),
            },
        );
        assert!(inline_pass(&mut prog));
        match &prog.block(cond).code {
            Code::If { if_true, if_false, .. } => {
                assert_eq!(if_true.block, target);
                assert_eq!(if_false.block, target);
            }
            c => panic!("unexpected shape: {}", c),
        }
    }
}
