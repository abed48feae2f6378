//! milc - an optimizing back-end for MIL, a monadic intermediate language
//!
//! Programs are built from blocks, closure definitions, top-level
//! bindings, and externals over a typed, call-oriented representation. A
//! pipeline of semantics-preserving transformations (inlining, fact
//! propagation, unused argument elimination, duplicate coalescing, static
//! allocator hoisting) runs to a fixpoint; the result is monomorphized
//! from its entry points, representation-transformed, and lowered to an
//! LLVM-shaped module.

pub mod atom;
pub mod code;
pub mod defns;
pub mod errors;
pub mod infer;
pub mod kind;
pub mod llvm;
pub mod lower;
pub mod obdd;
pub mod opt;
pub mod rep;
pub mod specialize;
pub mod tail;
pub mod types;
pub mod tyset;

pub use atom::{Atom, Const, Temp, TempSubst, Top};
pub use code::{Alt, Code};
pub use defns::{Block, BlockId, ClosureDefn, ClosureId, DefnRef, ExtId, Program, TopId, TopLhs};
pub use errors::{Failure, Handler};
pub use kind::Kind;
pub use tail::{BlockCall, Prim, Tail};
pub use types::{AllocType, BlockType, Cfun, Scheme, Tycon, Type};
pub use tyset::TypeSet;

/// Compile a program: scope and type checking, the optimizer fixpoint,
/// then one round of specialization, representation transformation, and
/// lowering. Entry points must already be marked and monomorphically
/// typed; a program with no entry points is lowered whole.
pub fn compile(prog: &mut Program, handler: &mut Handler) -> Result<llvm::Module, Failure> {
    infer::check_scope(prog)?;
    infer::type_check(prog, handler)?;
    handler.abort_on_errors()?;

    opt::optimize(prog);

    // definitions minted by the optimizer (derived specializations,
    // hoisted constants) are typed by a second checking pass
    infer::type_check(prog, handler)?;
    handler.abort_on_errors()?;

    if prog.entries().is_empty() {
        rep::rep_transform(prog);
        lower::lower(prog)
    } else {
        let mut mono = specialize::specialize(prog)?;
        specialize::assert_monomorphic(&mono)?;
        rep::rep_transform(&mut mono);
        lower::lower(&mono)
    }
}

/// Compile with a list of entry-point identifiers and their declared
/// monomorphic types. Each name must match a top-level component; a
/// quantified entry type is rejected during specialization.
pub fn compile_entries(
    prog: &mut Program,
    entries: &[(String, Type)],
    handler: &mut Handler,
) -> Result<llvm::Module, Failure> {
    for (name, ty) in entries {
        let mut found = false;
        for t in prog.top_ids() {
            for i in 0..prog.top(t).lhs.len() {
                if prog.top(t).lhs[i].name == *name {
                    let scheme = Scheme::mono(ty.clone());
                    match &prog.top(t).lhs[i].declared {
                        Some(existing) if !existing.alpha_equiv(&scheme) => {
                            handler.report(Failure::MultipleDeclarations(name.clone()));
                        }
                        _ => prog.top_mut(t).lhs[i].declared = Some(scheme),
                    }
                    prog.top_mut(t).is_entry = true;
                    found = true;
                }
            }
        }
        if !found {
            return Err(Failure::Scope(name.clone()));
        }
    }
    compile(prog, handler)
}
