//! Failure values and the diagnostic sink shared by every pipeline stage.
//!
//! Type inference and specialization report problems as `Failure` values;
//! the optimizer never raises a user-visible error (a transformation that
//! cannot apply simply declines). A `Handler` collects reported failures so
//! that checking can continue past recoverable problems.

use std::fmt;

use thiserror::Error;

use crate::kind::Kind;
use crate::types::Type;

/// An error (or warning) produced while checking or transforming a program.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: Type, found: Type },

    #[error("kind mismatch: {0} does not match {1}")]
    KindMismatch(Kind, Kind),

    #[error("occurs check failed: t{0} occurs in {1}")]
    OccursCheck(u32, Type),

    #[error("\"{id}\" has a polymorphic type so it cannot be used as an entrypoint")]
    PolymorphicEntrypoint { id: String },

    #[error("identifier \"{0}\" is not in scope")]
    Scope(String),

    #[error("multiple type annotations for \"{0}\"")]
    MultipleDeclarations(String),

    #[error("definition \"{id}\" has ambiguous type variables {vars}")]
    AmbiguousTypeVariable { id: String, vars: String },

    #[error("declared type \"{declared}\" for \"{id}\" is more general than inferred type \"{inferred}\"")]
    DeclaredTooGeneral {
        id: String,
        declared: String,
        inferred: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Failure {
    /// Warning-class failures are reported but do not abort compilation.
    pub fn is_warning(&self) -> bool {
        matches!(self, Failure::AmbiguousTypeVariable { .. })
    }
}

/// A sink for reported failures.
///
/// Definitions whose types are all declared can recover from a type error
/// (the error is reported here and checking moves on to the next
/// definition); everything else propagates a `Failure` directly.
#[derive(Debug, Default)]
pub struct Handler {
    reported: Vec<Failure>,
    errors: usize,
}

impl Handler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, counting it as an error unless it is warning-class.
    pub fn report(&mut self, f: Failure) {
        if !f.is_warning() {
            self.errors += 1;
        }
        log::debug!("reported: {}", f);
        self.reported.push(f);
    }

    pub fn error_count(&self) -> usize {
        self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    /// All failures reported so far, warnings included, in report order.
    pub fn failures(&self) -> &[Failure] {
        &self.reported
    }

    /// Abort with the first reported error if there was one.
    pub fn abort_on_errors(&mut self) -> Result<(), Failure> {
        match self.reported.iter().find(|f| !f.is_warning()) {
            Some(f) => Err(f.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Display for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s), {} report(s)", self.errors, self.reported.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_do_not_count_as_errors() {
        let mut h = Handler::new();
        h.report(Failure::AmbiguousTypeVariable {
            id: "f".to_string(),
            vars: "t0".to_string(),
        });
        assert!(!h.has_errors());
        assert!(h.abort_on_errors().is_ok());

        h.report(Failure::Scope("g".to_string()));
        assert!(h.has_errors());
        assert!(h.abort_on_errors().is_err());
        assert_eq!(h.failures().len(), 2);
    }
}
