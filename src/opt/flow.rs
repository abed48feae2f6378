//! Fact propagation and rewriting.
//!
//! A fact records that a temporary was bound by a repeatable,
//! non-self-referential tail. Facts thread forward through the binds of a
//! code sequence and drive the local rewrites: entering a known closure
//! allocation, selecting from a known data allocation, shorting a case on
//! a known constructor, and deriving known-constructor specializations of
//! callees. A final liveness sweep renames dead binders to wildcards and
//! drops effect-free binds whose results are dead.

use crate::atom::{Atom, Const, Temp, TempSubst};
use crate::code::Code;
use crate::defns::Program;
use crate::opt::known;
use crate::tail::Tail;

/// The facts in scope at a program point, newest last.
pub type Facts = Vec<(Temp, Tail)>;

/// The tail a temporary is known to have been bound by, if any.
pub fn lookup_fact<'a>(facts: &'a Facts, t: &Temp) -> Option<&'a Tail> {
    facts.iter().rev().find(|(v, _)| v == t).map(|(_, tl)| tl)
}

/// The tail an atom is known to evaluate to: a recorded fact for a
/// temporary, or the defining tail of a single-component top-level whose
/// value is repeatable.
pub fn atom_fact<'a>(prog: &'a Program, facts: &'a Facts, a: &Atom) -> Option<&'a Tail> {
    match a {
        Atom::Var(t) => lookup_fact(facts, t),
        Atom::Top(crate::atom::Top::Def { top, index: 0 }) => {
            let tl = prog.top(*top);
            if tl.lhs.len() == 1 && tl.tail.is_repeatable() {
                Some(&tl.tail)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Run fact propagation and the liveness sweep over every definition.
pub fn flow_pass(prog: &mut Program) -> bool {
    let mut changed = false;
    for b in prog.block_ids() {
        let code = prog.take_block_code(b);
        let mut facts = Vec::new();
        let (code, c1) = rewrite_code(prog, code, &mut facts);
        let (code, _, c2) = wildcard_dead(code);
        prog.put_block_code(b, code);
        changed |= c1 | c2;
    }
    for k in prog.closure_ids() {
        let tail = prog.take_closure_tail(k);
        let t2 = tail.clone().remove_newtype_cfun();
        changed |= !t2.same_tail(&tail);
        prog.put_closure_tail(k, t2);
    }
    for t in prog.top_ids() {
        let tail = prog.take_top_tail(t);
        let t2 = tail.clone().remove_newtype_cfun();
        changed |= !t2.same_tail(&tail);
        prog.put_top_tail(t, t2);
    }
    changed
}

fn rewrite_code(prog: &mut Program, code: Code, facts: &mut Facts) -> (Code, bool) {
    match code {
        Code::Bind { vs, tail, rest } => {
            let (tail, c1) = rewrite_tail(prog, tail, facts);
            // copy propagation: a bind of a plain return substitutes its
            // atoms directly into the continuation
            if let Tail::Return(atoms) = &tail {
                if atoms.len() == vs.len() {
                    let s = TempSubst::empty().extend_pairs(&vs, atoms);
                    let mut ids = std::mem::take(&mut prog.ids);
                    let rest = rest.apply_freshening(&s, &mut ids);
                    prog.ids = ids;
                    let (rest, _) = rewrite_code(prog, rest, facts);
                    return (rest, true);
                }
            }
            // a new binding of any of these temporaries kills facts that
            // mention them
            facts.retain(|(t, tl)| !t.is_in(&vs) && !tl.contains_any(&vs));
            if vs.len() == 1 && vs[0].is_live() && tail.is_repeatable() && !tail.contains(&vs[0])
            {
                facts.push((vs[0].clone(), tail.clone()));
            }
            let (rest, c2) = rewrite_code(prog, *rest, facts);
            (Code::Bind { vs, tail, rest: Box::new(rest) }, c1 || c2)
        }
        Code::Done(t) => {
            let (t, c) = rewrite_tail(prog, t, facts);
            (Code::Done(t), c)
        }
        Code::Case { scrutinee, alts, default } => {
            // shorting requires a data allocation fact for the scrutinee
            if let Some((cf, _)) =
                atom_fact(prog, facts, &scrutinee).and_then(|t| t.look_for_data_alloc())
            {
                // alternatives are considered in their lexical order, with
                // constructor tags deciding the match
                let cf = cf.clone();
                if let Some(alt) = alts.iter().find(|alt| alt.cfun == cf) {
                    log::debug!("shorting case to {}", alt.call);
                    return (Code::Done(Tail::BlockCall(alt.call.clone())), true);
                }
                if let Some(d) = default {
                    log::debug!("shorting case to default {}", d);
                    return (Code::Done(Tail::BlockCall(d)), true);
                }
            }
            (Code::Case { scrutinee, alts, default }, false)
        }
        Code::If { cond, if_true, if_false } => {
            if let Atom::Lit(Const::Flag(b)) = cond {
                let taken = if b { if_true } else { if_false };
                return (Code::Done(Tail::BlockCall(taken)), true);
            }
            (Code::If { cond, if_true, if_false }, false)
        }
    }
}

fn rewrite_tail(prog: &mut Program, tail: Tail, facts: &Facts) -> (Tail, bool) {
    let t0 = tail.clone().remove_newtype_cfun();
    let simplified = !t0.same_tail(&tail);
    match &t0 {
        // entering a known closure allocation runs the callee body on the
        // stored plus supplied arguments
        Tail::Enter { f, args } => {
            let known_alloc = atom_fact(prog, facts, f)
                .and_then(|t| t.look_for_clos_alloc())
                .map(|(k, sargs)| (k, sargs.to_vec()));
            if let Some((k, sargs)) = known_alloc {
                let nt = prog.closure(k).with_args(&sargs, args);
                log::debug!("entering known closure {}", prog.closure(k).name);
                return (nt, true);
            }
        }
        // selecting from a known data allocation yields the stored field
        Tail::Sel { cfun, index, from } => {
            let known_alloc = atom_fact(prog, facts, from)
                .and_then(|t| t.look_for_data_alloc())
                .map(|(cf, fargs)| (cf.clone(), fargs.to_vec()));
            if let Some((cf, fargs)) = known_alloc {
                if cf == *cfun && *index < fargs.len() {
                    return (Tail::Return(vec![fargs[*index].clone()]), true);
                }
            }
        }
        Tail::ClosAlloc { closure, args } => {
            let args = args.clone();
            if let Some(nt) = known::rewrite_clos_alloc(prog, *closure, &args, facts) {
                return (nt, true);
            }
        }
        Tail::BlockCall(bc) => {
            let bc = bc.clone();
            if let Some(nbc) = known::rewrite_block_call(prog, &bc, facts) {
                return (Tail::BlockCall(nbc), true);
            }
        }
        _ => {}
    }
    (t0, simplified)
}

/// Liveness sweep: rename dead binders to wildcards and drop binds whose
/// results are all dead when the tail has no effect. Returns the new code,
/// its live variables, and whether anything changed.
fn wildcard_dead(code: Code) -> (Code, Vec<Temp>, bool) {
    match code {
        Code::Bind { vs, tail, rest } => {
            let (rest, mut live, mut changed) = wildcard_dead(*rest);
            let any_live = vs.iter().any(|v| v.is_live() && v.is_in(&live));
            if !any_live && tail.has_no_effect() {
                return (rest, live, true);
            }
            let vs: Vec<Temp> = vs
                .into_iter()
                .map(|v| {
                    if v.is_live() && !v.is_in(&live) {
                        changed = true;
                        v.not_live()
                    } else {
                        v
                    }
                })
                .collect();
            live.retain(|t| !t.is_in(&vs));
            tail.liveness(&mut live);
            (Code::Bind { vs, tail, rest: Box::new(rest) }, live, changed)
        }
        Code::Done(t) => {
            let mut live = Vec::new();
            t.liveness(&mut live);
            (Code::Done(t), live, false)
        }
        code @ (Code::Case { .. } | Code::If { .. }) => {
            let live = code.free_vars();
            (code, live, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::Alt;
    use crate::tail::BlockCall;
    use crate::types::define_data;

    #[test]
    fn case_shorts_to_the_matching_alternative() {
        let (_, cfuns) = define_data(
            "Maybe",
            vec![crate::kind::Kind::Star],
            vec![("Nothing".to_string(), vec![]), ("Just".to_string(), vec![crate::types::Type::Gen(0)])],
        );
        let just = cfuns[1].clone();
        let nothing = cfuns[0].clone();

        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let v = Temp::fresh(&mut ids);
        prog.ids = ids;

        let b1 = prog.add_block(Vec::new(), Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(1))])));
        let b2 = prog.add_block(Vec::new(), Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(2))])));
        let scrut = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![v.clone()],
                tail: Tail::DataAlloc { cfun: just.clone(), args: vec![Atom::Lit(Const::Word(7))] },
                rest: Box::new(Code::Case {
                    scrutinee: Atom::Var(v),
                    alts: vec![
                        Alt { cfun: nothing, call: BlockCall::new(b2, Vec::new()) },
                        Alt { cfun: just, call: BlockCall::new(b1, Vec::new()) },
                    ],
                    default: None,
                }),
            },
        );
        assert!(flow_pass(&mut prog));
        // the case collapsed to a direct call of b1; the dead allocation
        // was swept away
        match &prog.block(scrut).code {
            Code::Done(Tail::BlockCall(bc)) => assert_eq!(bc.block, b1),
            c => panic!("case not shorted: {}", c),
        }
    }

    #[test]
    fn enter_of_known_closure_runs_the_body() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let stored = Temp::fresh(&mut ids);
        let arg = Temp::fresh(&mut ids);
        let v = Temp::fresh(&mut ids);
        let r = Temp::fresh(&mut ids);
        prog.ids = ids;

        // k{stored} [arg] = return [stored, arg]
        let k = prog.add_closure(
            vec![stored.clone()],
            vec![arg.clone()],
            Tail::Return(vec![Atom::Var(stored), Atom::Var(arg)]),
        );
        let caller = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![v.clone()],
                tail: Tail::ClosAlloc { closure: k, args: vec![Atom::Lit(Const::Word(9))] },
                rest: Box::new(Code::Bind {
                    vs: vec![r.clone(), r.not_live()],
                    tail: Tail::Enter { f: Atom::Var(v), args: vec![Atom::Lit(Const::Word(42))] },
                    rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(r)]))),
                }),
            },
        );
        assert!(flow_pass(&mut prog));
        // the enter was replaced by the closure body on the stored and
        // supplied arguments, and copy propagation finished the job
        match &prog.block(caller).code {
            Code::Done(Tail::Return(atoms)) => {
                assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(9))));
            }
            c => panic!("enter was not rewritten: {}", c),
        }
    }

    #[test]
    fn sel_from_known_allocation_returns_the_field() {
        // two fields, so the constructor is not a newtype and the select
        // path is exercised
        let (_, cfuns) = define_data(
            "Pair",
            vec![],
            vec![(
                "MkPair".to_string(),
                vec![crate::types::Type::word(), crate::types::Type::word()],
            )],
        );
        let pair = cfuns[0].clone();

        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let v = Temp::fresh(&mut ids);
        let w = Temp::fresh(&mut ids);
        prog.ids = ids;

        let b = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![v.clone()],
                tail: Tail::DataAlloc {
                    cfun: pair.clone(),
                    args: vec![Atom::Lit(Const::Word(3)), Atom::Lit(Const::Word(4))],
                },
                rest: Box::new(Code::Bind {
                    vs: vec![w.clone()],
                    tail: Tail::Sel { cfun: pair, index: 1, from: Atom::Var(v) },
                    rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(w)]))),
                }),
            },
        );
        assert!(flow_pass(&mut prog));
        // the select collapsed to the stored field, copy propagation
        // substituted it through, and the allocation died
        match &prog.block(b).code {
            Code::Done(Tail::Return(atoms)) => {
                assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(4))));
            }
            c => panic!("select not rewritten: {}", c),
        }
    }
}
