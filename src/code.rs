//! Code sequences: binds, cases, conditionals, and terminal tails.
//!
//! A `Code` value is a straight-line sequence of binds ending in a tail,
//! a case analysis whose alternatives are block calls, or a conditional.
//! The result arity of a sequence is that of its final tail.

use std::fmt;

use crate::atom::{Atom, Temp, TempSubst};
use crate::defns::DefnRef;
use crate::tail::{BlockCall, Tail};
use crate::types::{Cfun, IdSource};

/// One alternative of a case: a constructor and the call taken on a match.
#[derive(Debug, Clone)]
pub struct Alt {
    pub cfun: Cfun,
    pub call: BlockCall,
}

#[derive(Debug, Clone)]
pub enum Code {
    /// `vs <- tail; rest`
    Bind { vs: Vec<Temp>, tail: Tail, rest: Box<Code> },
    /// A terminal tail.
    Done(Tail),
    /// Case analysis on a data value, dispatching to block calls.
    Case { scrutinee: Atom, alts: Vec<Alt>, default: Option<BlockCall> },
    /// Conditional branch on a flag.
    If { cond: Atom, if_true: BlockCall, if_false: BlockCall },
}

impl Code {
    /// The number of code nodes, used by the inlining budget.
    pub fn size(&self) -> usize {
        match self {
            Code::Bind { rest, .. } => 1 + rest.size(),
            Code::Done(_) => 1,
            Code::Case { .. } | Code::If { .. } => 1,
        }
    }

    /// The terminal tail of a straight-line sequence.
    pub fn as_done(&self) -> Option<&Tail> {
        match self {
            Code::Done(t) => Some(t),
            _ => None,
        }
    }

    /// Whether this code is a straight-line sequence (no case or if).
    pub fn is_straight_line(&self) -> bool {
        match self {
            Code::Bind { rest, .. } => rest.is_straight_line(),
            Code::Done(_) => true,
            Code::Case { .. } | Code::If { .. } => false,
        }
    }

    /// The free (live) temporaries of this code, every argument counted.
    pub fn free_vars(&self) -> Vec<Temp> {
        let mut vs = Vec::new();
        self.add_free_vars(&mut vs);
        vs
    }

    fn add_free_vars(&self, vs: &mut Vec<Temp>) {
        match self {
            Code::Bind { vs: bound, tail, rest } => {
                rest.add_free_vars(vs);
                vs.retain(|v| !v.is_in(bound));
                tail.add_vars(vs);
            }
            Code::Done(t) => t.add_vars(vs),
            Code::Case { scrutinee, alts, default } => {
                scrutinee.add_vars(vs);
                for alt in alts {
                    alt.call.add_vars(vs);
                }
                if let Some(d) = default {
                    d.add_vars(vs);
                }
            }
            Code::If { cond, if_true, if_false } => {
                cond.add_vars(vs);
                if_true.add_vars(vs);
                if_false.add_vars(vs);
            }
        }
    }

    /// The used temporaries of this code, with block call and closure
    /// allocation arguments filtered by their callee's bitmap.
    pub fn used_vars(&self, prog: &crate::defns::Program, vs: &mut Vec<Temp>) {
        match self {
            Code::Bind { vs: bound, tail, rest } => {
                rest.used_vars(prog, vs);
                vs.retain(|v| !v.is_in(bound));
                tail.used_vars(prog, vs);
            }
            Code::Done(t) => t.used_vars(prog, vs),
            Code::Case { scrutinee, alts, default } => {
                scrutinee.add_vars(vs);
                for alt in alts {
                    alt.call.used_vars(prog, vs);
                }
                if let Some(d) = default {
                    d.used_vars(prog, vs);
                }
            }
            Code::If { cond, if_true, if_false } => {
                cond.add_vars(vs);
                if_true.used_vars(prog, vs);
                if_false.used_vars(prog, vs);
            }
        }
    }

    /// Add the definitions mentioned anywhere in this code.
    pub fn dependencies(&self, ds: &mut Vec<DefnRef>) {
        match self {
            Code::Bind { tail, rest, .. } => {
                tail.dependencies(ds);
                rest.dependencies(ds);
            }
            Code::Done(t) => t.dependencies(ds),
            Code::Case { scrutinee, alts, default } => {
                Tail::Return(vec![scrutinee.clone()]).dependencies(ds);
                for alt in alts {
                    Tail::BlockCall(alt.call.clone()).dependencies(ds);
                }
                if let Some(d) = default {
                    Tail::BlockCall(d.clone()).dependencies(ds);
                }
            }
            Code::If { cond, if_true, if_false } => {
                Tail::Return(vec![cond.clone()]).dependencies(ds);
                Tail::BlockCall(if_true.clone()).dependencies(ds);
                Tail::BlockCall(if_false.clone()).dependencies(ds);
            }
        }
    }

    /// Apply a substitution, freshening every binder so the result shares
    /// no temporaries with the original. Used to copy block bodies.
    pub fn apply_freshening(&self, s: &TempSubst, ids: &mut IdSource) -> Code {
        match self {
            Code::Bind { vs, tail, rest } => {
                let tail = tail.apply(s);
                let fresh: Vec<Temp> = vs
                    .iter()
                    .map(|v| if v.is_live() { v.new_param(ids) } else { v.clone() })
                    .collect();
                let s = s.extend_pairs(vs, &fresh.iter().cloned().map(Atom::Var).collect::<Vec<_>>());
                Code::Bind { vs: fresh, tail, rest: Box::new(rest.apply_freshening(&s, ids)) }
            }
            Code::Done(t) => Code::Done(t.apply(s)),
            Code::Case { scrutinee, alts, default } => Code::Case {
                scrutinee: scrutinee.apply(s),
                alts: alts
                    .iter()
                    .map(|alt| Alt { cfun: alt.cfun.clone(), call: alt.call.apply(s) })
                    .collect(),
                default: default.as_ref().map(|d| d.apply(s)),
            },
            Code::If { cond, if_true, if_false } => Code::If {
                cond: cond.apply(s),
                if_true: if_true.apply(s),
                if_false: if_false.apply(s),
            },
        }
    }

    /// An integer summary that agrees on alpha equivalent code sequences.
    pub fn summary(&self) -> i64 {
        match self {
            Code::Bind { vs, tail, rest } => tail
                .summary()
                .wrapping_mul(17)
                .wrapping_add(vs.len() as i64)
                .wrapping_mul(33)
                .wrapping_add(rest.summary()),
            Code::Done(t) => t.summary().wrapping_mul(29),
            Code::Case { alts, default, .. } => {
                let mut s = 5i64;
                for alt in alts {
                    s = s
                        .wrapping_mul(33)
                        .wrapping_add(alt.cfun.tag() as i64)
                        .wrapping_add(alt.call.summary());
                }
                if let Some(d) = default {
                    s = s.wrapping_mul(33).wrapping_add(d.summary());
                }
                s
            }
            Code::If { if_true, if_false, .. } => if_true
                .summary()
                .wrapping_mul(33)
                .wrapping_add(if_false.summary())
                .wrapping_mul(7),
        }
    }

    /// Test two code sequences for alpha equivalence. Binders extend the
    /// environments positionally.
    pub fn alpha_code(&self, env: &[Temp], other: &Code, oenv: &[Temp]) -> bool {
        match (self, other) {
            (
                Code::Bind { vs: v1, tail: t1, rest: r1 },
                Code::Bind { vs: v2, tail: t2, rest: r2 },
            ) => {
                if v1.len() != v2.len() || !t1.alpha_tail(env, t2, oenv) {
                    return false;
                }
                let mut env1 = env.to_vec();
                env1.extend(v1.iter().cloned());
                let mut env2 = oenv.to_vec();
                env2.extend(v2.iter().cloned());
                r1.alpha_code(&env1, r2, &env2)
            }
            (Code::Done(t1), Code::Done(t2)) => t1.alpha_tail(env, t2, oenv),
            (
                Code::Case { scrutinee: s1, alts: a1, default: d1 },
                Code::Case { scrutinee: s2, alts: a2, default: d2 },
            ) => {
                s1.alpha_atom(env, s2, oenv)
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2).all(|(x, y)| {
                        x.cfun == y.cfun && x.call.alpha(env, &y.call, oenv)
                    })
                    && match (d1, d2) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.alpha(env, y, oenv),
                        _ => false,
                    }
            }
            (
                Code::If { cond: c1, if_true: t1, if_false: f1 },
                Code::If { cond: c2, if_true: t2, if_false: f2 },
            ) => {
                c1.alpha_atom(env, c2, oenv)
                    && t1.alpha(env, t2, oenv)
                    && f1.alpha(env, f2, oenv)
            }
            _ => false,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Code::Bind { vs, tail, rest } => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "] <- {}; {}", tail, rest)
            }
            Code::Done(t) => write!(f, "{}", t),
            Code::Case { scrutinee, alts, default } => {
                write!(f, "case {} of", scrutinee)?;
                for alt in alts {
                    write!(f, " {} -> {};", alt.cfun, alt.call)?;
                }
                if let Some(d) = default {
                    write!(f, " _ -> {}", d)?;
                }
                Ok(())
            }
            Code::If { cond, if_true, if_false } => {
                write!(f, "if {} then {} else {}", cond, if_true, if_false)
            }
        }
    }
}
