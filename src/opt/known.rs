//! Known-constructor specialization of blocks and closures.
//!
//! When the flow facts show that an argument of a block call or closure
//! allocation is a particular data allocation, a specialized callee is
//! derived: its parameters are the remaining unknown arguments plus the
//! fields of the eliminated allocations, and its body starts with
//! initializers that rebuild the eliminated values before continuing with
//! the renamed original body. Derived definitions are cached per original
//! and keyed by the pattern of known constructors, so repeated requests
//! share one derived callee.

use crate::atom::{Atom, Temp, TempSubst};
use crate::code::Code;
use crate::defns::{BlockId, ClosureId, KnownPattern, Program};
use crate::opt::flow::{atom_fact, Facts};
use crate::tail::{BlockCall, Tail};
use crate::types::{Cfun, IdSource};

/// The statically known allocation at one argument position.
pub type KnownCall = Option<(Cfun, Vec<Atom>)>;

/// Identify the arguments whose facts are data allocations. Declines when
/// nothing is known, since the derived definition would be identical to
/// the original.
pub fn collect_calls(prog: &Program, args: &[Atom], facts: &Facts) -> Option<Vec<KnownCall>> {
    let mut any = false;
    let calls: Vec<KnownCall> = args
        .iter()
        .map(|a| {
            match atom_fact(prog, facts, a).and_then(|t| t.look_for_data_alloc()) {
                Some((cf, fargs)) => {
                    any = true;
                    Some((cf.clone(), fargs.to_vec()))
                }
                None => None,
            }
        })
        .collect();
    if any {
        Some(calls)
    } else {
        None
    }
}

fn pattern_of(calls: &[KnownCall]) -> KnownPattern {
    calls.iter().map(|c| c.as_ref().map(|(cf, _)| cf.clone())).collect()
}

/// Replace each known argument with the fields of its allocation, leaving
/// unknown arguments in place.
fn specialized_args(args: &[Atom], calls: &[KnownCall]) -> Vec<Atom> {
    let mut out = Vec::new();
    for (a, c) in args.iter().zip(calls) {
        match c {
            None => out.push(a.clone()),
            Some((_, fargs)) => out.extend(fargs.iter().cloned()),
        }
    }
    out
}

/// Fresh temporaries for the fields of a known allocation, typed from the
/// constructor when it is monomorphic.
fn field_temps(ids: &mut IdSource, cf: &Cfun, n: usize) -> Vec<Temp> {
    (0..n)
        .map(|j| {
            if cf.alloc_type().generics.is_empty() {
                Temp::with_type(ids, cf.alloc_type().stored[j].clone())
            } else {
                Temp::fresh(ids)
            }
        })
        .collect()
}

// ============================================================================
// Closure allocations
// ============================================================================

/// Rewrite `ClosAlloc(k, args)` using the known allocations among `args`,
/// or decline.
pub fn rewrite_clos_alloc(
    prog: &mut Program,
    k: ClosureId,
    args: &[Atom],
    facts: &Facts,
) -> Option<Tail> {
    let calls = collect_calls(prog, args, facts)?;
    let nk = derive_closure(prog, k, &calls)?;
    log::debug!(
        "deriving specialized closure {} for {}",
        prog.closure(nk).name,
        prog.closure(k).name
    );
    Some(Tail::ClosAlloc { closure: nk, args: specialized_args(args, &calls) })
}

fn derive_closure(prog: &mut Program, k: ClosureId, calls: &[KnownCall]) -> Option<ClosureId> {
    let pattern = pattern_of(calls);
    if let Some((_, nk)) = prog.closure(k).derived.iter().find(|(p, _)| *p == pattern) {
        return Some(*nk);
    }

    let orig_params = prog.closure(k).params.clone();
    let orig_args = prog.closure(k).args.clone();
    if orig_params.len() != calls.len() {
        return None;
    }

    let mut ids = std::mem::take(&mut prog.ids);

    // fresh names for the invocation arguments avoid naming conflicts
    let newargs: Vec<Temp> = orig_args.iter().map(|a| a.new_param(&mut ids)).collect();
    let newarg_atoms: Vec<Atom> = newargs.iter().cloned().map(Atom::Var).collect();
    let mut s = TempSubst::empty().extend_pairs(&orig_args, &newarg_atoms);

    // parameters for the derived closure: unknown positions get a renamed
    // copy of the original parameter, known positions expand into field
    // temporaries; the eliminated values are rebuilt by initializers so
    // the body sees them unchanged
    let mut kparams: Vec<Temp> = Vec::new();
    let mut inits: Vec<(Temp, Cfun, Vec<Temp>)> = Vec::new();
    for (i, c) in calls.iter().enumerate() {
        match c {
            None => {
                let p = orig_params[i].new_param(&mut ids);
                s = s.extend(orig_params[i].clone(), Atom::Var(p.clone()));
                kparams.push(p);
            }
            Some((cf, cargs)) => {
                let ts = field_temps(&mut ids, cf, cargs.len());
                let d = orig_params[i].new_param(&mut ids);
                s = s.extend(orig_params[i].clone(), Atom::Var(d.clone()));
                kparams.extend(ts.iter().cloned());
                inits.push((d, cf.clone(), ts));
            }
        }
    }

    let bparams: Vec<Temp> = kparams.iter().chain(newargs.iter()).cloned().collect();
    let mut bcode = Code::Done(prog.closure(k).tail.apply(&s));
    for (d, cf, ts) in inits.into_iter().rev() {
        bcode = Code::Bind {
            vs: vec![d],
            tail: Tail::DataAlloc { cfun: cf, args: ts.into_iter().map(Atom::Var).collect() },
            rest: Box::new(bcode),
        };
    }
    prog.ids = ids;

    let bparam_atoms: Vec<Atom> = bparams.iter().cloned().map(Atom::Var).collect();
    let b = prog.add_block(bparams, bcode);
    let nk = prog.add_closure(kparams, newargs, Tail::BlockCall(BlockCall::new(b, bparam_atoms)));
    prog.closure_mut(k).derived.push((pattern, nk));
    Some(nk)
}

// ============================================================================
// Block calls
// ============================================================================

/// Rewrite a block call using the known allocations among its arguments,
/// or decline.
pub fn rewrite_block_call(
    prog: &mut Program,
    bc: &BlockCall,
    facts: &Facts,
) -> Option<BlockCall> {
    let calls = collect_calls(prog, &bc.args, facts)?;
    let nb = derive_block(prog, bc.block, &calls)?;
    log::debug!(
        "deriving specialized block {} for {}",
        prog.block(nb).name,
        prog.block(bc.block).name
    );
    Some(BlockCall::new(nb, specialized_args(&bc.args, &calls)))
}

fn derive_block(prog: &mut Program, b: BlockId, calls: &[KnownCall]) -> Option<BlockId> {
    let pattern = pattern_of(calls);
    if let Some((_, nb)) = prog.block(b).derived.iter().find(|(p, _)| *p == pattern) {
        return Some(*nb);
    }

    let orig_params = prog.block(b).params.clone();
    if orig_params.len() != calls.len() {
        return None;
    }

    let mut ids = std::mem::take(&mut prog.ids);
    let mut nparams: Vec<Temp> = Vec::new();
    let mut s = TempSubst::empty();
    let mut inits: Vec<(Temp, Cfun, Vec<Temp>)> = Vec::new();
    for (i, c) in calls.iter().enumerate() {
        match c {
            None => {
                let p = orig_params[i].new_param(&mut ids);
                s = s.extend(orig_params[i].clone(), Atom::Var(p.clone()));
                nparams.push(p);
            }
            Some((cf, cargs)) => {
                let ts = field_temps(&mut ids, cf, cargs.len());
                let d = orig_params[i].new_param(&mut ids);
                s = s.extend(orig_params[i].clone(), Atom::Var(d.clone()));
                nparams.extend(ts.iter().cloned());
                inits.push((d, cf.clone(), ts));
            }
        }
    }
    let mut code = prog.block(b).code.apply_freshening(&s, &mut ids);
    for (d, cf, ts) in inits.into_iter().rev() {
        code = Code::Bind {
            vs: vec![d],
            tail: Tail::DataAlloc { cfun: cf, args: ts.into_iter().map(Atom::Var).collect() },
            rest: Box::new(code),
        };
    }
    prog.ids = ids;

    let nb = prog.add_block(nparams, code);
    prog.block_mut(b).derived.push((pattern, nb));
    Some(nb)
}
