//! Property-based tests for the MIL type system and IR invariants
//!
//! These verify the properties the optimizer leans on:
//! - Unification symmetry and idempotence
//! - Equality agrees with canonicalization (reference equality in the set)
//! - Alpha renaming preserves summaries, and alpha equivalence implies
//!   equal summaries
//! - Bit pattern diagrams agree with numeric comparison

use proptest::prelude::*;

use milc::atom::{Atom, Const, Temp, TempSubst};
use milc::code::Code;
use milc::obdd::Pat;
use milc::tail::Tail;
use milc::types::{IdSource, Tycon, Type};
use milc::tyset::{ref_eq, TypeSet};

// ============================================================================
// Type generators
// ============================================================================

/// Generate a ground type built from structurally comparable heads, with
/// occasional synonym wrappers of differing levels.
fn arb_ground_type(depth: usize) -> BoxedStrategy<Type> {
    if depth == 0 {
        prop_oneof![
            Just(Type::word()),
            Just(Type::flag()),
            (0u64..65).prop_map(Type::bit),
            (1u64..300).prop_map(Type::ix),
        ]
        .boxed()
    } else {
        prop_oneof![
            4 => arb_ground_type(0),
            2 => (arb_ground_type(depth - 1), arb_ground_type(depth - 1)).prop_map(|(a, b)| {
                Type::milfun(Type::tuple(vec![a]), Type::tuple(vec![b]))
            }),
            1 => prop::collection::vec(arb_ground_type(depth - 1), 0..=2)
                .prop_map(Type::tuple),
            // type Id a = a, at level 0
            1 => arb_ground_type(depth - 1).prop_map(|t| {
                Type::Con(Tycon::synonym("Id", 1, 0, Type::Gen(0))).ap(t)
            }),
            // type Wrap a = Id a, at level 1
            1 => arb_ground_type(depth - 1).prop_map(|t| {
                let id = Tycon::synonym("Id", 1, 0, Type::Gen(0));
                Type::Con(Tycon::synonym("Wrap", 1, 1, Type::Con(id).ap(Type::Gen(0)))).ap(t)
            }),
        ]
        .boxed()
    }
}

proptest! {
    #[test]
    fn unification_is_symmetric(t1 in arb_ground_type(3), t2 in arb_ground_type(3)) {
        let forward = t1.unify(&t2).is_ok();
        let backward = t2.unify(&t1).is_ok();
        prop_assert_eq!(forward, backward);
        // ground types unify exactly when they are equal
        prop_assert_eq!(forward, t1.same(&t2));
    }

    #[test]
    fn unification_is_idempotent(t in arb_ground_type(3)) {
        let mut ids = IdSource::new();
        let v = ids.fresh_tvar(milc::Kind::Star);
        if t.kind() == milc::Kind::Star {
            v.unify(&t).unwrap();
            // repeating the same unification is a no-op
            v.unify(&t).unwrap();
            t.unify(&v).unwrap();
            prop_assert!(v.same(&t));
        }
    }

    #[test]
    fn equality_agrees_with_canonicalization(
        t1 in arb_ground_type(3),
        t2 in arb_ground_type(3),
    ) {
        let mut set = TypeSet::new();
        let c1 = set.canon_type(&t1);
        let c2 = set.canon_type(&t2);
        prop_assert_eq!(t1.same(&t2), ref_eq(&c1, &c2));
    }

    #[test]
    fn canonicalization_is_stable(t in arb_ground_type(3)) {
        let mut set = TypeSet::new();
        let c1 = set.canon_type(&t);
        let c2 = set.canon_type(&t);
        let c3 = set.canon_type(&c1);
        prop_assert!(ref_eq(&c1, &c2));
        prop_assert!(ref_eq(&c1, &c3));
    }
}

// ============================================================================
// Alpha equivalence and summaries
// ============================================================================

/// Build a straight-line code sequence over the given parameters from a
/// shape seed: a chain of returns, selects, and constant binds.
fn build_code(params: &[Temp], consts: &[i64], ids: &mut IdSource) -> Code {
    let ret: Vec<Atom> = params.iter().cloned().map(Atom::Var).collect();
    let mut code = Code::Done(Tail::Return(ret));
    for c in consts {
        let v = Temp::fresh(ids);
        code = Code::Bind {
            vs: vec![v],
            tail: Tail::Return(vec![Atom::Lit(Const::Word(*c))]),
            rest: Box::new(code),
        };
    }
    code
}

proptest! {
    #[test]
    fn alpha_renaming_preserves_summaries(
        nparams in 0usize..4,
        consts in prop::collection::vec(-100i64..100, 0..5),
    ) {
        let mut ids = IdSource::new();
        let params = Temp::make_temps(&mut ids, nparams);
        let code = build_code(&params, &consts, &mut ids);

        // rename every parameter and binder
        let fresh = Temp::make_temps(&mut ids, nparams);
        let atoms: Vec<Atom> = fresh.iter().cloned().map(Atom::Var).collect();
        let s = TempSubst::empty().extend_pairs(&params, &atoms);
        let renamed = code.apply_freshening(&s, &mut ids);

        prop_assert_eq!(code.summary(), renamed.summary());
        prop_assert!(code.alpha_code(&params, &renamed, &fresh));
    }

    #[test]
    fn alpha_equivalent_codes_have_equal_summaries(
        nparams in 0usize..4,
        consts in prop::collection::vec(-100i64..100, 0..5),
    ) {
        // two independently built copies of the same shape are alpha
        // equivalent, and so must agree on their summary
        let mut ids = IdSource::new();
        let p1 = Temp::make_temps(&mut ids, nparams);
        let c1 = build_code(&p1, &consts, &mut ids);
        let p2 = Temp::make_temps(&mut ids, nparams);
        let c2 = build_code(&p2, &consts, &mut ids);

        prop_assert!(c1.alpha_code(&p1, &c2, &p2));
        prop_assert_eq!(c1.summary(), c2.summary());
    }

    #[test]
    fn distinct_constants_are_not_alpha_equivalent(
        nparams in 0usize..3,
        c in -100i64..100,
    ) {
        let mut ids = IdSource::new();
        let p1 = Temp::make_temps(&mut ids, nparams);
        let c1 = build_code(&p1, &[c], &mut ids);
        let p2 = Temp::make_temps(&mut ids, nparams);
        let c2 = build_code(&p2, &[c + 1], &mut ids);
        prop_assert!(!c1.alpha_code(&p1, &c2, &p2));
    }
}

// ============================================================================
// Bit patterns
// ============================================================================

proptest! {
    #[test]
    fn below_matches_comparison(width in 1usize..16, bound in 0u64..70000, v in 0u64..70000) {
        let p = Pat::below(width, bound);
        if v < (1 << width) {
            prop_assert_eq!(p.includes(v), v < bound);
        }
    }

    #[test]
    fn exact_accepts_one_pattern(width in 1usize..16, bits in 0u64..70000, v in 0u64..70000) {
        if bits < (1 << width) && v < (1 << width) {
            let p = Pat::exact(width, bits);
            prop_assert_eq!(p.includes(v), v == bits);
        }
    }

    #[test]
    fn and_or_not_are_pointwise(width in 1usize..10, a in 0u64..1024, b in 0u64..1024, v in 0u64..1024) {
        if a < (1 << width) && b < (1 << width) && v < (1 << width) {
            let pa = Pat::below(width, a);
            let pb = Pat::exact(width, b);
            prop_assert_eq!(pa.and(&pb).includes(v), pa.includes(v) && pb.includes(v));
            prop_assert_eq!(pa.or(&pb).includes(v), pa.includes(v) || pb.includes(v));
            prop_assert_eq!(pa.not().includes(v), !pa.includes(v));
        }
    }

    #[test]
    fn ix_patterns_bound_their_values(n in 1u64..1000, v in 0u64..1000) {
        let p = Type::ix(n).bit_pat().unwrap();
        prop_assert_eq!(p.includes(v), v < n);
    }
}
