//! Specialization and lowering, end to end.

use milc::atom::{Atom, Const, Temp};
use milc::code::{Alt, Code};
use milc::defns::Program;
use milc::errors::{Failure, Handler};
use milc::llvm;
use milc::tail::{BlockCall, Tail};
use milc::types::{define_data, Scheme, Type};

/// An entry point whose type stays quantified after generalization is
/// rejected.
#[test]
fn polymorphic_entrypoints_are_rejected() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    prog.ids = ids;

    // idk{} [x] = return [x], allocated at top level: the inferred scheme
    // is quantified
    let k = prog.add_closure(Vec::new(), vec![x.clone()], Tail::Return(vec![Atom::Var(x)]));
    let main = prog.add_top_anon(Tail::ClosAlloc { closure: k, args: Vec::new() });

    let mut handler = Handler::new();
    milc::infer::type_check(&mut prog, &mut handler).unwrap();
    prog.top_mut(main).is_entry = true;

    match milc::specialize::specialize(&prog) {
        Err(Failure::PolymorphicEntrypoint { .. }) => {}
        other => panic!("expected a polymorphic entrypoint failure, got {:?}", other.err()),
    }
}

/// The whole pipeline on a tiny program: the entry collapses to a static
/// constant and the module still declares the external allocator.
#[test]
fn compile_entries_produces_a_module() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    prog.ids = ids;

    let b = prog.add_block(vec![x.clone()], Code::Done(Tail::Return(vec![Atom::Var(x)])));
    let main = prog.add_top_anon(Tail::BlockCall(BlockCall::new(
        b,
        vec![Atom::Lit(Const::Word(5))],
    )));
    let name = prog.top(main).lhs[0].name.clone();

    let mut handler = Handler::new();
    let module =
        milc::compile_entries(&mut prog, &[(name, Type::word())], &mut handler).unwrap();
    assert!(module.find("alloc").is_some());
}

/// A data allocation with a runtime argument expands to a call of the
/// external `alloc` symbol inside the block's function.
#[test]
fn runtime_allocation_calls_alloc() {
    let (_, cfuns) = define_data(
        "Maybe",
        vec![],
        vec![("Nothing".to_string(), vec![]), ("Just".to_string(), vec![Type::word()])],
    );
    let just = cfuns[1].clone();

    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    let d = Temp::fresh(&mut ids);
    prog.ids = ids;

    let e = prog.add_external("input", Scheme::mono(Type::word()));
    // b[x] = d <- Just(x); return [d]
    let b = prog.add_block(
        vec![x.clone()],
        Code::Bind {
            vs: vec![d.clone()],
            tail: Tail::DataAlloc { cfun: just.clone(), args: vec![Atom::Var(x)] },
            rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(d)]))),
        },
    );
    let main = prog.add_top_anon(Tail::BlockCall(BlockCall::new(
        b,
        vec![Atom::Top(milc::atom::Top::Ext(e))],
    )));
    let name = prog.top(main).lhs[0].name.clone();
    let entry_ty = just.alloc_type().result.clone();

    let mut handler = Handler::new();
    let module = milc::compile_entries(&mut prog, &[(name, entry_ty)], &mut handler).unwrap();

    // some emitted function calls alloc
    let mut saw_alloc = false;
    for defn in &module.defns {
        if let llvm::Defn::Func(f) = defn {
            for bb in &f.blocks {
                let mut code = &bb.code;
                loop {
                    match code {
                        llvm::Code::Op(_, rhs, rest) => {
                            if let llvm::Rhs::Call(_, callee, _) = rhs {
                                if callee.name() == Some("alloc") {
                                    saw_alloc = true;
                                }
                            }
                            code = rest;
                        }
                        llvm::Code::Store(_, _, rest) => code = rest,
                        _ => break,
                    }
                }
            }
        }
    }
    assert!(saw_alloc, "no call to the external allocator was emitted");
}

/// A case over an unknown scrutinee lowers to a tag load and a switch.
#[test]
fn case_lowers_to_a_switch_on_the_tag() {
    let (maybe_tycon, cfuns) = define_data(
        "Maybe",
        vec![],
        vec![("Nothing".to_string(), vec![]), ("Just".to_string(), vec![Type::word()])],
    );
    let nothing = cfuns[0].clone();
    let just = cfuns[1].clone();

    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let p = Temp::fresh(&mut ids);
    let y = Temp::fresh(&mut ids);
    prog.ids = ids;

    let e = prog.add_external("scrut", Scheme::mono(Type::Con(maybe_tycon)));
    let scrut = Atom::Top(milc::atom::Top::Ext(e));

    // b1[p] = y <- Just 0 p; return [y]
    let b1 = prog.add_block(
        vec![p.clone()],
        Code::Bind {
            vs: vec![y.clone()],
            tail: Tail::Sel { cfun: just.clone(), index: 0, from: Atom::Var(p) },
            rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(y)]))),
        },
    );
    let b2 = prog.add_block(
        Vec::new(),
        Code::Done(Tail::Return(vec![Atom::Lit(Const::Word(0))])),
    );
    let dispatch = prog.add_block(
        Vec::new(),
        Code::Case {
            scrutinee: scrut.clone(),
            alts: vec![
                Alt { cfun: just, call: BlockCall::new(b1, vec![scrut]) },
                Alt { cfun: nothing, call: BlockCall::new(b2, Vec::new()) },
            ],
            default: None,
        },
    );
    let main = prog.add_top_anon(Tail::BlockCall(BlockCall::new(dispatch, Vec::new())));
    let name = prog.top(main).lhs[0].name.clone();

    let mut handler = Handler::new();
    let module = milc::compile_entries(&mut prog, &[(name, Type::word())], &mut handler).unwrap();

    let mut saw_switch = false;
    let mut switch_cases = 0;
    for defn in &module.defns {
        if let llvm::Defn::Func(f) = defn {
            for bb in &f.blocks {
                let mut code = &bb.code;
                loop {
                    match code {
                        llvm::Code::Op(_, _, rest) | llvm::Code::Store(_, _, rest) => code = rest,
                        llvm::Code::Switch(_, cases, _) => {
                            saw_switch = true;
                            switch_cases = cases.len();
                            break;
                        }
                        _ => break,
                    }
                }
            }
        }
    }
    assert!(saw_switch, "case did not lower to a switch");
    assert_eq!(switch_cases, 2);
}

/// The init function runs initializers in dependency order and reuses
/// earlier results through the initializer list.
#[test]
fn init_function_orders_and_reuses_results() {
    let mut prog = Program::new();
    let mut ids = std::mem::take(&mut prog.ids);
    let x = Temp::fresh(&mut ids);
    prog.ids = ids;

    let e = prog.add_external("seed", Scheme::mono(Type::word()));
    let b = prog.add_block(vec![x.clone()], Code::Done(Tail::Return(vec![Atom::Var(x)])));
    let first = prog.add_top_anon(Tail::BlockCall(BlockCall::new(
        b,
        vec![Atom::Top(milc::atom::Top::Ext(e))],
    )));
    let second = prog.add_top_anon(Tail::Return(vec![Atom::Top(milc::atom::Top::Def {
        top: first,
        index: 0,
    })]));
    let name = prog.top(second).lhs[0].name.clone();

    let mut handler = Handler::new();
    let module = milc::compile_entries(&mut prog, &[(name, Type::word())], &mut handler).unwrap();

    let init = module
        .defns
        .iter()
        .find_map(|d| match d {
            llvm::Defn::Func(f) if f.name == "milc_init" => Some(f),
            _ => None,
        })
        .expect("missing init function");

    // the second store reuses the first result: no load between stores
    let mut stores = 0;
    let mut loads_after_first_store = 0;
    let mut code = &init.blocks[0].code;
    loop {
        match code {
            llvm::Code::Op(_, rhs, rest) => {
                if stores > 0 && matches!(rhs, llvm::Rhs::Load(_)) {
                    loads_after_first_store += 1;
                }
                code = rest;
            }
            llvm::Code::Store(_, _, rest) => {
                stores += 1;
                code = rest;
            }
            _ => break,
        }
    }
    assert_eq!(stores, 2);
    assert_eq!(loads_after_first_store, 0);
}
