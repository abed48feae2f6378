//! Static allocator hoisting.
//!
//! An allocator whose arguments are all static (literals or references to
//! already-hoisted top-levels) is extracted into a fresh static top-level,
//! and the original tail becomes a return of the new reference. The pass
//! runs to a local fixpoint so that nested constant structures collapse
//! from the leaves upward.

use crate::atom::{Atom, Top};
use crate::code::Code;
use crate::defns::Program;
use crate::tail::Tail;

/// Hoist static allocators everywhere; returns whether anything changed.
pub fn lift_static_allocators(prog: &mut Program) -> bool {
    let mut changed = false;
    loop {
        let mut round = false;

        // a top-level that already holds a static allocator (or a literal)
        // just becomes static in place
        for t in prog.top_ids() {
            let top = prog.top(t);
            if top.is_static || top.lhs.len() != 1 {
                continue;
            }
            let is_static = match &top.tail {
                tail if tail.is_allocator() => {
                    tail.atoms().iter().all(|a| prog.atom_is_static(a))
                }
                Tail::Return(atoms) => {
                    atoms.len() == 1 && matches!(atoms[0], Atom::Lit(_))
                }
                _ => false,
            };
            if is_static {
                prog.top_mut(t).is_static = true;
                round = true;
            }
        }

        for b in prog.block_ids() {
            let code = prog.take_block_code(b);
            let (code, c) = lift_in_code(prog, code);
            prog.put_block_code(b, code);
            round |= c;
        }
        for k in prog.closure_ids() {
            let tail = prog.take_closure_tail(k);
            let (tail, c) = lift_tail(prog, tail);
            prog.put_closure_tail(k, tail);
            round |= c;
        }
        for t in prog.top_ids() {
            // only non-static tops are rewritten; static ones are the
            // hoisting targets and must stay as allocators
            if prog.top(t).is_static {
                continue;
            }
            let tail = prog.take_top_tail(t);
            let (tail, c) = lift_tail(prog, tail);
            prog.put_top_tail(t, tail);
            round |= c;
        }

        changed |= round;
        if !round {
            return changed;
        }
    }
}

fn lift_in_code(prog: &mut Program, code: Code) -> (Code, bool) {
    match code {
        Code::Bind { vs, tail, rest } => {
            let (tail, c1) = lift_tail(prog, tail);
            let (rest, c2) = lift_in_code(prog, *rest);
            (Code::Bind { vs, tail, rest: Box::new(rest) }, c1 || c2)
        }
        Code::Done(t) => {
            let (t, c) = lift_tail(prog, t);
            (Code::Done(t), c)
        }
        code => (code, false),
    }
}

/// Replace a static allocator with a reference to a fresh static
/// top-level holding it.
fn lift_tail(prog: &mut Program, tail: Tail) -> (Tail, bool) {
    if tail.is_allocator() && tail.atoms().iter().all(|a| prog.atom_is_static(a)) {
        let top = prog.add_top_anon(tail);
        prog.top_mut(top).is_static = true;
        log::debug!("lifting static allocator to top-level {}", prog.top(top).lhs[0].name);
        (Tail::Return(vec![Atom::Top(Top::Def { top, index: 0 })]), true)
    } else {
        (tail, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Const;
    use crate::types::{AllocType, Cfun, Tycon, Type};

    #[test]
    fn nested_constants_collapse_into_three_top_levels() {
        // recursive data types are assembled by hand around their tycon
        let list = Tycon::data("List", crate::kind::Kind::fun(crate::kind::Kind::Star, crate::kind::Kind::Star));
        let list_a = Type::Con(list).ap(Type::Gen(0));
        let nil = Cfun::new(
            "Nil",
            0,
            2,
            AllocType { generics: vec![crate::kind::Kind::Star], stored: vec![], result: list_a.clone() },
        );
        let cons = Cfun::new(
            "Cons",
            1,
            2,
            AllocType {
                generics: vec![crate::kind::Kind::Star],
                stored: vec![Type::Gen(0), list_a.clone()],
                result: list_a,
            },
        );

        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let a = crate::atom::Temp::fresh(&mut ids);
        let b = crate::atom::Temp::fresh(&mut ids);
        prog.ids = ids;

        // v <- Nil(); w <- Cons(2, v); done Cons(1, w)
        let blk = prog.add_block(
            Vec::new(),
            Code::Bind {
                vs: vec![a.clone()],
                tail: Tail::DataAlloc { cfun: nil, args: vec![] },
                rest: Box::new(Code::Bind {
                    vs: vec![b.clone()],
                    tail: Tail::DataAlloc {
                        cfun: cons.clone(),
                        args: vec![Atom::Lit(Const::Word(2)), Atom::Var(a)],
                    },
                    rest: Box::new(Code::Done(Tail::DataAlloc {
                        cfun: cons,
                        args: vec![Atom::Lit(Const::Word(1)), Atom::Var(b)],
                    })),
                }),
            },
        );

        // hoisting alone only lifts the Nil (the other allocators read
        // temporaries); a flow round propagates the new static references
        let mut rounds = 0;
        loop {
            let h = lift_static_allocators(&mut prog);
            let f = crate::opt::flow::flow_pass(&mut prog);
            rounds += 1;
            if !(h || f) || rounds > 5 {
                break;
            }
        }

        assert_eq!(prog.top_ids().len(), 3);
        assert!(prog.top_ids().iter().all(|t| prog.top(*t).is_static));
        // the block is left returning the outermost constant
        match &prog.block(blk).code {
            Code::Done(Tail::Return(atoms)) => {
                assert!(matches!(atoms[0], Atom::Top(_)));
            }
            c => panic!("allocators not hoisted: {}", c),
        }
    }
}
