//! Derivation rules for handles and the request object they carry.

mod generation;
mod statement;

pub use generation::{plan_derivation, DeriveFlags, Generation, StatementPlan};
pub use statement::{Setting, SharedStatement, Statement};

pub(crate) use statement::lock;
