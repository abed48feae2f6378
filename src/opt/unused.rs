//! Unused argument elimination.
//!
//! For every block and closure definition, a bitmap of used argument
//! positions is computed to a fixpoint across the whole program: a call
//! contributes an argument only when the callee has already been shown to
//! use that position, so the used sets grow monotonically from nothing. A
//! parameter is used when it appears in the body's used set and is not a
//! later duplicate of an earlier parameter. After the fixpoint, parameter
//! lists, caller argument lists, and the stored components of declared
//! closure types are rewritten in lockstep.

use crate::code::Code;
use crate::defns::{BlockId, ClosureId, Program};
use crate::tail::Tail;

/// Run the analysis and rewrite; returns whether anything changed.
pub fn remove_unused_args(prog: &mut Program) -> bool {
    for b in prog.block_ids() {
        prog.block_mut(b).clear_used_args();
    }
    for k in prog.closure_ids() {
        prog.closure_mut(k).clear_used_args();
    }

    // fixpoint: marking an argument used in one definition can make
    // arguments of its callers used in turn
    loop {
        let mut grew = false;
        for b in prog.block_ids() {
            grew |= count_used_block(prog, b);
        }
        for k in prog.closure_ids() {
            grew |= count_used_closure(prog, k);
        }
        if !grew {
            break;
        }
    }

    let changed = prog
        .block_ids()
        .iter()
        .any(|b| prog.block(*b).num_used_args < prog.block(*b).params.len())
        || prog
            .closure_ids()
            .iter()
            .any(|k| prog.closure(*k).num_used_args < prog.closure(*k).params.len());
    if changed {
        rewrite_calls(prog);
        trim_params(prog);
    }

    // leave full bitmaps behind so later queries see every argument used
    for b in prog.block_ids() {
        let n = prog.block(b).params.len();
        let blk = prog.block_mut(b);
        blk.used_args = Some(vec![true; n]);
        blk.num_used_args = n;
    }
    for k in prog.closure_ids() {
        let n = prog.closure(k).params.len();
        let defn = prog.closure_mut(k);
        defn.used_args = Some(vec![true; n]);
        defn.num_used_args = n;
    }
    changed
}

/// A parameter that repeats an earlier one can be dropped; callers pass
/// the same value twice.
fn duplicated(i: usize, params: &[crate::atom::Temp]) -> bool {
    params[..i].iter().any(|p| *p == params[i])
}

fn count_used_block(prog: &mut Program, b: BlockId) -> bool {
    let mut used = Vec::new();
    prog.block(b).code.used_vars(prog, &mut used);
    let params = prog.block(b).params.clone();
    let mut newly = Vec::new();
    {
        let bitmap = prog.block(b).used_args.as_deref();
        for (i, p) in params.iter().enumerate() {
            let marked = bitmap.map_or(false, |m| m[i]);
            if !marked && p.is_live() && p.is_in(&used) && !duplicated(i, &params) {
                newly.push(i);
            }
        }
    }
    if newly.is_empty() {
        return false;
    }
    let blk = prog.block_mut(b);
    let bitmap = blk.used_args.get_or_insert_with(|| vec![false; params.len()]);
    for i in newly {
        bitmap[i] = true;
        blk.num_used_args += 1;
    }
    true
}

fn count_used_closure(prog: &mut Program, k: ClosureId) -> bool {
    let mut used = Vec::new();
    prog.closure(k).tail.used_vars(prog, &mut used);
    let params = prog.closure(k).params.clone();
    let mut newly = Vec::new();
    {
        let bitmap = prog.closure(k).used_args.as_deref();
        for (i, p) in params.iter().enumerate() {
            let marked = bitmap.map_or(false, |m| m[i]);
            if !marked && p.is_live() && p.is_in(&used) && !duplicated(i, &params) {
                newly.push(i);
            }
        }
    }
    if newly.is_empty() {
        return false;
    }
    let defn = prog.closure_mut(k);
    let bitmap = defn.used_args.get_or_insert_with(|| vec![false; params.len()]);
    for i in newly {
        bitmap[i] = true;
        defn.num_used_args += 1;
    }
    true
}

/// Rewrite every call site, dropping arguments in unused positions.
fn rewrite_calls(prog: &mut Program) {
    fn rewrite_tail(prog: &Program, tail: Tail) -> Tail {
        match tail {
            Tail::BlockCall(mut bc) => {
                if let Some(nargs) = prog.block(bc.block).remove_unused_args(&bc.args) {
                    bc.args = nargs;
                }
                Tail::BlockCall(bc)
            }
            Tail::ClosAlloc { closure, args } => {
                match prog.closure(closure).remove_unused_args(&args) {
                    Some(nargs) => Tail::ClosAlloc { closure, args: nargs },
                    None => Tail::ClosAlloc { closure, args },
                }
            }
            t => t,
        }
    }
    fn rewrite_code(prog: &Program, code: Code) -> Code {
        match code {
            Code::Bind { vs, tail, rest } => Code::Bind {
                vs,
                tail: rewrite_tail(prog, tail),
                rest: Box::new(rewrite_code(prog, *rest)),
            },
            Code::Done(t) => Code::Done(rewrite_tail(prog, t)),
            Code::Case { scrutinee, alts, default } => Code::Case {
                scrutinee,
                alts: alts
                    .into_iter()
                    .map(|mut alt| {
                        if let Some(nargs) =
                            prog.block(alt.call.block).remove_unused_args(&alt.call.args)
                        {
                            alt.call.args = nargs;
                        }
                        alt
                    })
                    .collect(),
                default: default.map(|mut d| {
                    if let Some(nargs) = prog.block(d.block).remove_unused_args(&d.args) {
                        d.args = nargs;
                    }
                    d
                }),
            },
            Code::If { cond, mut if_true, mut if_false } => {
                if let Some(nargs) = prog.block(if_true.block).remove_unused_args(&if_true.args) {
                    if_true.args = nargs;
                }
                if let Some(nargs) = prog.block(if_false.block).remove_unused_args(&if_false.args)
                {
                    if_false.args = nargs;
                }
                Code::If { cond, if_true, if_false }
            }
        }
    }

    for b in prog.block_ids() {
        let code = prog.take_block_code(b);
        let code = rewrite_code(prog, code);
        prog.put_block_code(b, code);
    }
    for k in prog.closure_ids() {
        let tail = prog.take_closure_tail(k);
        let tail = rewrite_tail(prog, tail);
        prog.put_closure_tail(k, tail);
    }
    for t in prog.top_ids() {
        let tail = prog.take_top_tail(t);
        let tail = rewrite_tail(prog, tail);
        prog.put_top_tail(t, tail);
    }
}

/// Trim parameter lists and declared types to the used positions.
fn trim_params(prog: &mut Program) {
    for b in prog.block_ids() {
        let blk = prog.block(b);
        if blk.num_used_args >= blk.params.len() {
            continue;
        }
        let bitmap = blk.used_args.clone().unwrap_or_else(|| vec![false; blk.params.len()]);
        log::debug!(
            "removing {} unused argument(s) from {}",
            blk.params.len() - blk.num_used_args,
            blk.name
        );
        let blk = prog.block_mut(b);
        let params = std::mem::take(&mut blk.params);
        blk.params = params
            .into_iter()
            .enumerate()
            .filter(|(i, _)| bitmap.get(*i).copied().unwrap_or(false))
            .map(|(_, p)| p)
            .collect();
        if let Some(bt) = blk.declared.take() {
            blk.declared = Some(match bt.dom.tuple_components() {
                Some(components) => {
                    let dom = crate::types::Type::tuple(
                        components
                            .into_iter()
                            .enumerate()
                            .filter(|(i, _)| bitmap.get(*i).copied().unwrap_or(false))
                            .map(|(_, t)| t)
                            .collect(),
                    );
                    crate::types::BlockType { generics: bt.generics, dom, rng: bt.rng }
                }
                None => bt,
            });
        }
    }
    for k in prog.closure_ids() {
        let defn = prog.closure(k);
        if defn.num_used_args >= defn.params.len() {
            continue;
        }
        let bitmap = defn.used_args.clone().unwrap_or_else(|| vec![false; defn.params.len()]);
        log::debug!(
            "rewrote closure definition {} to eliminate {} unused field(s)",
            defn.name,
            defn.params.len() - defn.num_used_args
        );
        let defn = prog.closure_mut(k);
        let params = std::mem::take(&mut defn.params);
        defn.params = params
            .into_iter()
            .enumerate()
            .filter(|(i, _)| bitmap.get(*i).copied().unwrap_or(false))
            .map(|(_, p)| p)
            .collect();
        if let Some(at) = defn.declared.take() {
            defn.declared = Some(at.remove_stored(&bitmap));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{Atom, Const, Temp};
    use crate::tail::BlockCall;

    #[test]
    fn unused_middle_argument_is_dropped_everywhere() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x = Temp::fresh(&mut ids);
        let y = Temp::fresh(&mut ids);
        let z = Temp::fresh(&mut ids);
        prog.ids = ids;

        // b0[x, y, z] = return [x, z]
        let b = prog.add_block(
            vec![x.clone(), y, z.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(x), Atom::Var(z)])),
        );
        let caller = prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(
                b,
                vec![
                    Atom::Lit(Const::Word(1)),
                    Atom::Lit(Const::Word(2)),
                    Atom::Lit(Const::Word(3)),
                ],
            ))),
        );
        assert!(remove_unused_args(&mut prog));
        assert_eq!(prog.block(b).params.len(), 2);
        match &prog.block(caller).code {
            Code::Done(Tail::BlockCall(bc)) => {
                assert_eq!(bc.args.len(), 2);
                assert!(bc.args[0].same_atom(&Atom::Lit(Const::Word(1))));
                assert!(bc.args[1].same_atom(&Atom::Lit(Const::Word(3))));
            }
            c => panic!("unexpected shape: {}", c),
        }
        // a second run finds nothing more to do
        assert!(!remove_unused_args(&mut prog));
    }

    #[test]
    fn duplicate_parameters_count_as_unused() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let x = Temp::fresh(&mut ids);
        prog.ids = ids;

        // b0[x, x] = return [x]: the second position repeats the first
        let b = prog.add_block(
            vec![x.clone(), x.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(x)])),
        );
        prog.add_block(
            Vec::new(),
            Code::Done(Tail::BlockCall(BlockCall::new(
                b,
                vec![Atom::Lit(Const::Word(5)), Atom::Lit(Const::Word(5))],
            ))),
        );
        assert!(remove_unused_args(&mut prog));
        assert_eq!(prog.block(b).params.len(), 1);
    }

    #[test]
    fn closure_stored_fields_shrink() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let a = Temp::fresh(&mut ids);
        let bpar = Temp::fresh(&mut ids);
        let c = Temp::fresh(&mut ids);
        let arg = Temp::fresh(&mut ids);
        prog.ids = ids;

        // k{a, b, c} [arg] = return [a, c, arg]
        let k = prog.add_closure(
            vec![a.clone(), bpar, c.clone()],
            vec![arg.clone()],
            Tail::Return(vec![Atom::Var(a), Atom::Var(c), Atom::Var(arg)]),
        );
        let site = prog.add_block(
            Vec::new(),
            Code::Done(Tail::ClosAlloc {
                closure: k,
                args: vec![
                    Atom::Lit(Const::Word(1)),
                    Atom::Lit(Const::Word(2)),
                    Atom::Lit(Const::Word(3)),
                ],
            }),
        );
        assert!(remove_unused_args(&mut prog));
        assert_eq!(prog.closure(k).params.len(), 2);
        match &prog.block(site).code {
            Code::Done(Tail::ClosAlloc { args, .. }) => {
                assert_eq!(args.len(), 2);
                assert!(args[1].same_atom(&Atom::Lit(Const::Word(3))));
            }
            c => panic!("unexpected shape: {}", c),
        }
    }
}
