//! Representation transformation.
//!
//! Some types are represented by a vector of machine words rather than by
//! themselves: a 64-bit `Bit` vector needs two words on the 32-bit target,
//! an index or reference needs one, and a zero-width value needs none.
//! This pass splits every parameter, argument, and select whose type has
//! such a representation into the corresponding word vector, keeping
//! callers and callees in lockstep through a `RepEnv` that maps each
//! original temporary to its replacement vector.

use std::collections::HashMap;

use crate::atom::{Atom, Temp};
use crate::code::{Alt, Code};
use crate::defns::Program;
use crate::tail::{BlockCall, Tail};
use crate::types::{IdSource, TyconBody, Type, WORD_SIZE};

/// The flat representation of a type, or `None` when the type is
/// represented as itself.
pub fn rep_calc(ty: &Type) -> Option<Vec<Type>> {
    let (head, args) = ty.spine();
    let c = match head {
        Type::Con(c) => c,
        _ => return None,
    };
    if c.as_synonym().is_some() {
        let (h, a) = ty.spine();
        return expand_for_rep(&h, &a).as_ref().and_then(rep_calc);
    }
    match c.body() {
        TyconBody::Bit if args.len() == 1 => {
            let n = args[0].as_nat()?;
            let words = ((n + WORD_SIZE - 1) / WORD_SIZE) as usize;
            Some(vec![Type::word(); words])
        }
        TyconBody::Ix if args.len() == 1 => Some(vec![Type::word()]),
        TyconBody::ARef if args.len() == 2 => Some(vec![Type::word()]),
        _ => None,
    }
}

fn expand_for_rep(head: &Type, args: &[Type]) -> Option<Type> {
    let c = match head {
        Type::Con(c) => c.clone(),
        _ => return None,
    };
    let (arity, _, expansion) = c.as_synonym()?;
    if args.len() < arity {
        return None;
    }
    Some(Type::from_spine(expansion.subst_gens(&args[..arity]), &args[arity..]))
}

/// The number of slots a value of this type occupies after the transform.
fn slot_count(ty: &Type) -> usize {
    rep_calc(ty).map(|r| r.len()).unwrap_or(1)
}

/// Map from an original temporary to its replacement vector.
pub type RepEnv = HashMap<Temp, Vec<Temp>>;

/// Replacement vectors for a parameter list, or `None` when no parameter
/// changes representation.
fn reps_of(vs: &[Temp], ids: &mut IdSource) -> Option<Vec<Option<Vec<Temp>>>> {
    let mut any = false;
    let reps: Vec<Option<Vec<Temp>>> = vs
        .iter()
        .map(|v| {
            rep_calc(&v.ty()).map(|tys| {
                any = true;
                tys.into_iter().map(|t| Temp::with_type(ids, t)).collect()
            })
        })
        .collect();
    if any {
        Some(reps)
    } else {
        None
    }
}

/// The updated parameter list from a previous `reps_of` result.
fn rep_params(vs: Vec<Temp>, reps: &Option<Vec<Option<Vec<Temp>>>>) -> Vec<Temp> {
    match reps {
        None => vs,
        Some(reps) => {
            let mut out = Vec::new();
            for (v, r) in vs.into_iter().zip(reps) {
                match r {
                    None => out.push(v),
                    Some(ts) => out.extend(ts.iter().cloned()),
                }
            }
            out
        }
    }
}

fn extend_env(env: &mut RepEnv, vs: &[Temp], reps: &Option<Vec<Option<Vec<Temp>>>>) {
    if let Some(reps) = reps {
        for (v, r) in vs.iter().zip(reps) {
            if let Some(ts) = r {
                env.insert(v.clone(), ts.clone());
            }
        }
    }
}

/// Expand one atom to its representation vector.
fn rep_atom(env: &RepEnv, a: &Atom) -> Vec<Atom> {
    match a {
        Atom::Var(t) => match env.get(t) {
            Some(ts) => ts.iter().cloned().map(Atom::Var).collect(),
            None => vec![a.clone()],
        },
        _ => vec![a.clone()],
    }
}

fn rep_atoms(env: &RepEnv, atoms: &[Atom]) -> Vec<Atom> {
    atoms.iter().flat_map(|a| rep_atom(env, a)).collect()
}

// ============================================================================
// The pass
// ============================================================================

/// Apply the representation transformation to a monomorphic program.
pub fn rep_transform(prog: &mut Program) {
    let mut ids = std::mem::take(&mut prog.ids);

    for k in prog.closure_ids() {
        let mut env = RepEnv::new();
        let params = prog.closure(k).params.clone();
        let preps = reps_of(&params, &mut ids);
        extend_env(&mut env, &params, &preps);
        let args = prog.closure(k).args.clone();
        let areps = reps_of(&args, &mut ids);
        extend_env(&mut env, &args, &areps);

        let defn = prog.closure_mut(k);
        defn.params = rep_params(std::mem::take(&mut defn.params), &preps);
        defn.args = rep_params(std::mem::take(&mut defn.args), &areps);
        if let Some(at) = defn.declared.take() {
            let stored = at.stored.iter().flat_map(rep_types).collect();
            defn.declared = Some(crate::types::AllocType {
                generics: at.generics,
                stored,
                result: at.result,
            });
        }
        let tail = prog.take_closure_tail(k);
        let tail = rep_tail(&env, tail);
        prog.put_closure_tail(k, tail);
    }

    for b in prog.block_ids() {
        let mut env = RepEnv::new();
        let params = prog.block(b).params.clone();
        let preps = reps_of(&params, &mut ids);
        extend_env(&mut env, &params, &preps);
        let blk = prog.block_mut(b);
        blk.params = rep_params(std::mem::take(&mut blk.params), &preps);

        let code = prog.take_block_code(b);
        let code = rep_code(&mut env, code, &mut ids);
        prog.put_block_code(b, code);
    }

    for t in prog.top_ids() {
        let env = RepEnv::new();
        let tail = prog.take_top_tail(t);
        let tail = rep_tail(&env, tail);
        prog.put_top_tail(t, tail);
    }

    prog.ids = ids;
}

/// The representation vector of a type, as types; identity when unchanged.
fn rep_types(ty: &Type) -> Vec<Type> {
    rep_calc(ty).unwrap_or_else(|| vec![ty.clone()])
}

fn rep_code(env: &mut RepEnv, code: Code, ids: &mut IdSource) -> Code {
    match code {
        Code::Bind { vs, tail, rest } => {
            // a select into a field that was spread over several slots
            // becomes one select per slot
            if let Tail::Sel { cfun, index, from } = &tail {
                if vs.len() == 1 {
                    let stored = &cfun.alloc_type().stored;
                    let base: usize = stored[..*index].iter().map(slot_count).sum();
                    let field_slots = stored.get(*index).map(slot_count).unwrap_or(1);
                    if field_slots != 1 || base != *index {
                        let reps = reps_of(&vs, ids);
                        let news = match &reps {
                            Some(r) => r[0].clone().unwrap_or_else(|| vs.clone()),
                            None => vs.clone(),
                        };
                        extend_env(env, &vs, &reps);
                        let rest = rep_code(env, *rest, ids);
                        let mut out = rest;
                        for (slot, v) in news.iter().enumerate().rev() {
                            out = Code::Bind {
                                vs: vec![v.clone()],
                                tail: Tail::Sel {
                                    cfun: cfun.clone(),
                                    index: base + slot,
                                    from: from.clone(),
                                },
                                rest: Box::new(out),
                            };
                        }
                        return out;
                    }
                }
            }
            let reps = reps_of(&vs, ids);
            extend_env(env, &vs, &reps);
            let tail = rep_tail(env, tail);
            let vs = rep_params(vs, &reps);
            let rest = rep_code(env, *rest, ids);
            Code::Bind { vs, tail, rest: Box::new(rest) }
        }
        Code::Done(t) => Code::Done(rep_tail(env, t)),
        Code::Case { scrutinee, alts, default } => Code::Case {
            scrutinee,
            alts: alts
                .into_iter()
                .map(|alt| Alt { cfun: alt.cfun, call: rep_call(env, alt.call) })
                .collect(),
            default: default.map(|d| rep_call(env, d)),
        },
        Code::If { cond, if_true, if_false } => Code::If {
            cond,
            if_true: rep_call(env, if_true),
            if_false: rep_call(env, if_false),
        },
    }
}

fn rep_call(env: &RepEnv, bc: BlockCall) -> BlockCall {
    BlockCall { block: bc.block, args: rep_atoms(env, &bc.args) }
}

fn rep_tail(env: &RepEnv, tail: Tail) -> Tail {
    match tail {
        Tail::Return(atoms) => Tail::Return(rep_atoms(env, &atoms)),
        Tail::Enter { f, args } => Tail::Enter {
            f: rep_atom(env, &f).into_iter().next().unwrap_or(f),
            args: rep_atoms(env, &args),
        },
        Tail::BlockCall(bc) => Tail::BlockCall(rep_call(env, bc)),
        Tail::PrimCall { prim, args } => Tail::PrimCall { prim, args: rep_atoms(env, &args) },
        Tail::Sel { cfun, index, from } => {
            // selects whose layout is undisturbed pass through; spread
            // fields are handled at the bind that consumes them
            let base: usize = cfun.alloc_type().stored[..index].iter().map(slot_count).sum();
            Tail::Sel { cfun, index: base, from }
        }
        Tail::DataAlloc { cfun, args } => {
            Tail::DataAlloc { cfun, args: rep_atoms(env, &args) }
        }
        Tail::ClosAlloc { closure, args } => {
            Tail::ClosAlloc { closure, args: rep_atoms(env, &args) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Const;
    use crate::types::define_data;

    #[test]
    fn bit64_splits_into_two_words_lo_hi() {
        let r = rep_calc(&Type::bit(64)).unwrap();
        assert_eq!(r.len(), 2);
        assert!(r[0].same(&Type::word()));
        assert!(r[1].same(&Type::word()));

        assert_eq!(rep_calc(&Type::bit(32)).unwrap().len(), 1);
        assert_eq!(rep_calc(&Type::bit(0)).unwrap().len(), 0);
        assert!(rep_calc(&Type::word()).is_none());
    }

    #[test]
    fn parameters_split_in_stable_order() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let wide = Temp::with_type(&mut ids, Type::bit(64));
        let plain = Temp::with_type(&mut ids, Type::word());
        prog.ids = ids;

        let b = prog.add_block(
            vec![wide.clone(), plain.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(wide), Atom::Var(plain.clone())])),
        );
        rep_transform(&mut prog);

        // one 64-bit parameter became two word parameters; the word
        // parameter is untouched and last
        let params = &prog.block(b).params;
        assert_eq!(params.len(), 3);
        assert_eq!(params[2], plain);
        match &prog.block(b).code {
            Code::Done(Tail::Return(atoms)) => {
                assert_eq!(atoms.len(), 3);
                assert!(atoms[0].same_atom(&Atom::Var(params[0].clone())));
                assert!(atoms[1].same_atom(&Atom::Var(params[1].clone())));
            }
            c => panic!("unexpected shape: {}", c),
        }
    }

    #[test]
    fn sel_into_a_spread_field_becomes_two_selects() {
        let (_, cfuns) = define_data(
            "WidePair",
            vec![],
            vec![("MkWide".to_string(), vec![Type::bit(64), Type::word()])],
        );
        let wide = cfuns[0].clone();

        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let p = Temp::with_type(&mut ids, wide.alloc_type().result.clone());
        let v = Temp::with_type(&mut ids, Type::bit(64));
        let w = Temp::with_type(&mut ids, Type::word());
        prog.ids = ids;

        // b[p] = v <- Sel MkWide 0 p; w <- Sel MkWide 1 p; return [w, v]
        let b = prog.add_block(
            vec![p.clone()],
            Code::Bind {
                vs: vec![v.clone()],
                tail: Tail::Sel { cfun: wide.clone(), index: 0, from: Atom::Var(p.clone()) },
                rest: Box::new(Code::Bind {
                    vs: vec![w.clone()],
                    tail: Tail::Sel { cfun: wide.clone(), index: 1, from: Atom::Var(p) },
                    rest: Box::new(Code::Done(Tail::Return(vec![Atom::Var(w), Atom::Var(v)]))),
                }),
            },
        );
        rep_transform(&mut prog);

        // the first select became two selects at slots 0 and 1, and the
        // second select moved to slot 2
        let mut sels = Vec::new();
        let mut code = &prog.block(b).code;
        loop {
            match code {
                Code::Bind { tail, rest, .. } => {
                    if let Tail::Sel { index, .. } = tail {
                        sels.push(*index);
                    }
                    code = rest;
                }
                Code::Done(Tail::Return(atoms)) => {
                    assert_eq!(atoms.len(), 3);
                    break;
                }
                c => panic!("unexpected shape: {}", c),
            }
        }
        assert_eq!(sels, vec![0, 1, 2]);
    }

    #[test]
    fn zero_width_values_vanish_from_argument_lists() {
        let mut prog = Program::new();
        let mut ids = std::mem::take(&mut prog.ids);
        let z = Temp::with_type(&mut ids, Type::bit(0));
        let x = Temp::with_type(&mut ids, Type::word());
        prog.ids = ids;

        let b = prog.add_block(
            vec![z.clone(), x.clone()],
            Code::Done(Tail::Return(vec![Atom::Var(x)])),
        );
        rep_transform(&mut prog);
        assert_eq!(prog.block(b).params.len(), 1);
    }
}
