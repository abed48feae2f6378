//! End-to-end scenarios for the optimizer pipeline.

use milc::atom::{Atom, Const, Temp};
use milc::code::{Alt, Code};
use milc::defns::Program;
use milc::errors::Handler;
use milc::kind::Kind;
use milc::tail::{BlockCall, Tail};
use milc::types::{define_data, AllocType, Cfun, Tycon, Type};

fn maybe_word() -> (Cfun, Cfun) {
    let (_, cfuns) = define_data(
        "Maybe",
        vec![],
        vec![("Nothing".to_string(), vec![]), ("Just".to_string(), vec![Type::word()])],
    );
    (cfuns[0].clone(), cfuns[1].clone())
}

fn checked(prog: &mut Program) {
    let mut handler = Handler::new();
    milc::infer::check_scope(prog).unwrap();
    milc::infer::type_check(prog, &mut handler).unwrap();
    assert!(!handler.has_errors());
}

/// A closure allocated and entered in the same block collapses to the
/// closure's body with the argument substituted in.
#[test]
fn known_closure_enter_rewrites_to_the_body() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    let v = Temp::fresh(&mut ids);
    let r = Temp::fresh(&mut ids);
    prog.ids = ids;

    // k{} [x] = return [x]
    let k = prog.add_closure(Vec::new(), vec![x.clone()], Tail::Return(vec![Atom::Var(x)]));
    // main[] = v <- k{}; r <- v @ [42]; return [r]
    let main = prog.add_block(
        Vec::new(),
        Code::Bind {
            vs: vec![v.clone()],
            tail: Tail::ClosAlloc { closure: k, args: Vec::new() },
            rest: Box::new(Code::Bind {
                vs: vec![r.clone()],
                tail: Tail::Enter { f: Atom::Var(v), args: vec![Atom::Lit(Const::Word(42))] },
                rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(r)]))),
            }),
        },
    );
    checked(&mut prog);
    milc::opt::optimize(&mut prog);

    match &prog.block(main).code {
        Code::Done(Tail::Return(atoms)) => {
            assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(42))));
        }
        c => panic!("enter survived optimization: {}", c),
    }
}

/// A case on a known constructor shorts to the matching alternative, and
/// the field flows through the select in the alternative's body.
#[test]
fn case_on_known_constructor_shorts_and_flows() {
    let (nothing, just) = maybe_word();
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let v = Temp::fresh(&mut ids);
    let p = Temp::fresh(&mut ids);
    let y = Temp::fresh(&mut ids);
    prog.ids = ids;

    // b1[p] = y <- Just 0 p; return [y]
    let b1 = prog.add_block(
        vec![p.clone()],
        Code::Bind {
            vs: vec![y.clone()],
            tail: Tail::Sel { cfun: just.clone(), index: 0, from: Atom::Var(p) },
            rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(y)]))),
        },
    );
    // b2[] = return [0]
    let b2 = prog.add_block(
        Vec::new(),
        Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(0))])),
    );
    // main[] = v <- Just(7); case v of Just -> b1(v); Nothing -> b2()
    let main = prog.add_block(
        Vec::new(),
        Code::Bind {
            vs: vec![v.clone()],
            tail: Tail::DataAlloc { cfun: just.clone(), args: vec![Atom::Lit(Const::Word(7))] },
            rest: Box::new(Code::Case {
                scrutinee: Atom::Var(v.clone()),
                alts: vec![
                    Alt { cfun: just, call: BlockCall::new(b1, vec![Atom::Var(v)]) },
                    Alt { cfun: nothing, call: BlockCall::new(b2, Vec::new()) },
                ],
                default: None,
            }),
        },
    );
    checked(&mut prog);
    milc::opt::optimize(&mut prog);

    // the allocation, case, call, and select all collapse to the field
    match &prog.block(main).code {
        Code::Done(Tail::Return(atoms)) => {
            assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(7))));
        }
        c => panic!("case survived optimization: {}", c),
    }
}

/// Building `Cons 1 (Cons 2 Nil)` out of constants leaves three static
/// top-levels and no allocator with all-static arguments anywhere.
#[test]
fn nested_constant_allocations_hoist_to_three_top_levels() {
    let list = Tycon::data("List", Kind::fun(Kind::Star, Kind::Star));
    let list_a = Type::Con(list).ap(Type::Gen(0));
    let nil = Cfun::new(
        "Nil",
        0,
        2,
        AllocType { generics: vec![Kind::Star], stored: vec![], result: list_a.clone() },
    );
    let cons = Cfun::new(
        "Cons",
        1,
        2,
        AllocType {
            generics: vec![Kind::Star],
            stored: vec![Type::Gen(0), list_a.clone()],
            result: list_a,
        },
    );

    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let a = Temp::fresh(&mut ids);
    let b = Temp::fresh(&mut ids);
    prog.ids = ids;

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
    checked(&mut prog);
    milc::opt::optimize(&mut prog);

    assert_eq!(prog.top_ids().len(), 3);
    assert!(prog.top_ids().iter().all(|t| prog.top(*t).is_static));

    // the caller uses the outermost constant
    match &prog.block(blk).code {
        Code::Done(Tail::Return(atoms)) => assert!(matches!(atoms[0], Atom::Top(_))),
        c => panic!("allocations survived hoisting: {}", c),
    }

    // no allocator anywhere still has all-static arguments in a block body
    for b in prog.block_ids() {
        let mut code = &prog.block(b).code;
        loop {
            let tail = match code {
                Code::Bind { tail, rest, .. } => {
                    let t = tail;
                    code = rest;
                    t
                }
                Code::Done(t) => {
                    assert_static_free(&prog, t);
                    break;
                }
                _ => break,
            };
            assert_static_free(&prog, tail);
        }
    }
}

fn assert_static_free(prog: &Program, tail: &Tail) {
    if tail.is_allocator() {
        assert!(
            !tail.atoms().iter().all(|a| prog.atom_is_static(a)),
            "allocator with all-static arguments survived hoisting: {}",
            tail
        );
    }
}

/// `b[x, y, z] = return [x, z]` loses its middle argument, callers lose
/// theirs, and a closure capturing an unused field drops a slot.
#[test]
fn unused_arguments_are_dropped_in_lockstep() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    let y = Temp::fresh(&mut ids);
    let z = Temp::fresh(&mut ids);
    let ca = Temp::fresh(&mut ids);
    let cb = Temp::fresh(&mut ids);
    let cc = Temp::fresh(&mut ids);
    let arg = Temp::fresh(&mut ids);
    prog.ids = ids;

    let b = prog.add_block(
        vec![x.clone(), y.clone(), z.clone()],
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
    // k{ca, cb, cc} [arg] = return [ca, cc, arg]: cb is dead weight
    let k = prog.add_closure(
        vec![ca.clone(), cb.clone(), cc.clone()],
        vec![arg.clone()],
        Tail::Return(vec![Atom::Var(ca), Atom::Var(cc), Atom::Var(arg)]),
    );
    let site = prog.add_block(
        Vec::new(),
        Code::Done(Tail::ClosAlloc {
            closure: k,
            args: vec![
                Atom::Lit(Const::Word(4)),
                Atom::Lit(Const::Word(5)),
                Atom::Lit(Const::Word(6)),
            ],
        }),
    );
    checked(&mut prog);
    milc::opt::optimize(&mut prog);

    assert_eq!(prog.block(b).params.len(), 2);
    assert_eq!(prog.closure(k).params.len(), 2);

    match &prog.block(caller).code {
        Code::Done(Tail::Return(atoms)) => {
            // the call itself was small enough to inline afterwards
            assert!(atoms[0].same_atom(&Atom::Lit(Const::Word(1))));
            assert!(atoms[1].same_atom(&Atom::Lit(Const::Word(3))));
        }
        Code::Done(Tail::BlockCall(bc)) => {
            assert_eq!(bc.args.len(), 2);
            assert!(bc.args[0].same_atom(&Atom::Lit(Const::Word(1))));
            assert!(bc.args[1].same_atom(&Atom::Lit(Const::Word(3))));
        }
        c => panic!("unexpected caller shape: {}", c),
    }
    match &prog.block(site).code {
        Code::Done(Tail::ClosAlloc { args, .. }) => {
            assert_eq!(args.len(), 2);
            assert!(args[0].same_atom(&Atom::Lit(Const::Word(4))));
            assert!(args[1].same_atom(&Atom::Lit(Const::Word(6))));
        }
        c => panic!("unexpected allocation shape: {}", c),
    }
}

/// After dedup, only one of two alpha-equivalent blocks keeps its body;
/// the other forwards to it.
#[test]
fn duplicate_blocks_survive_only_once() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x1 = Temp::fresh(&mut ids);
    let x2 = Temp::fresh(&mut ids);
    prog.ids = ids;

    let first = prog.add_block(
        vec![x1.clone()],
        Code::Done(Tail::Return(vec![Atom::Var(x1), Atom::Lit(Const::Word(9))])),
    );
    let second = prog.add_block(
        vec![x2.clone()],
        Code::Done(Tail::Return(vec![Atom::Var(x2), Atom::Lit(Const::Word(9))])),
    );
    checked(&mut prog);
    milc::opt::optimize(&mut prog);

    let keeps_body = |b| matches!(&prog.block(b).code, Code::Done(Tail::Return(_)));
    assert!(keeps_body(first));
    assert!(!keeps_body(second) || prog.block(second).params.is_empty());
    // and the survivors are no longer alpha equivalent
    let pa = &prog.block(first).params;
    let pb = &prog.block(second).params;
    assert!(!prog.block(first).code.alpha_code(pa, &prog.block(second).code, pb));
}

/// Synonym levels: `Wrap Word` and `Word` are the same type and share a
/// canonical representative.
#[test]
fn synonym_levels_identify_wrapped_types() {
    let id_syn = Tycon::synonym("Id", 1, 0, Type::Gen(0));
    let wrap = Tycon::synonym("Wrap", 1, 1, Type::Con(id_syn).ap(Type::Gen(0)));
    let wrapped = Type::Con(wrap).ap(Type::word());
    assert!(wrapped.same(&Type::word()));

    let mut set = milc::tyset::TypeSet::new();
    let c1 = set.canon_type(&wrapped);
    let c2 = set.canon_type(&Type::word());
    assert!(milc::tyset::ref_eq(&c1, &c2));
}

/// Wildcards never appear as operands, and free variables of every block
/// body are covered by its parameters.
#[test]
fn optimizer_output_stays_well_scoped() {
    let (nothing, just) = maybe_word();
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let v = Temp::fresh(&mut ids);
    let p = Temp::fresh(&mut ids);
    let y = Temp::fresh(&mut ids);
    prog.ids = ids;

    let b1 = prog.add_block(
        vec![p.clone()],
        Code::Bind {
            vs: vec![y.clone()],
            tail: Tail::Sel { cfun: just.clone(), index: 0, from: Atom::Var(p) },
            rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(y)]))),
        },
    );
    let b2 = prog.add_block(Vec::new(), Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(0))])));
    prog.add_block(
        Vec::new(),
        Code::Bind {
            vs: vec![v.clone()],
            tail: Tail::DataAlloc { cfun: just.clone(), args: vec![Atom::Lit(Const::Word(7))] },
            rest: Box::new(Code::Case {
                scrutinee: Atom::Var(v.clone()),
                alts: vec![
                    Alt { cfun: just, call: BlockCall::new(b1, vec![Atom::Var(v)]) },
                    Alt { cfun: nothing, call: BlockCall::new(b2, Vec::new()) },
                ],
                default: None,
            }),
        },
    );
    checked(&mut prog);
    milc::opt::optimize(&mut prog);
    milc::infer::check_scope(&prog).unwrap();
}
