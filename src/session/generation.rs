use std::fmt;

use crate::config::NowFn;
use crate::logging::SqlLogLevel;
use crate::pool::QueryContext;

/// Where a handle sits in its lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Freshly opened, or derived with `new_db`.
    Root,
    /// Derived without copying; shares its parent's request object.
    SharedClone,
    /// Owns a request object nobody else holds.
    IsolatedClone,
}

/// What a derivation does with the parent's request object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementPlan {
    /// New empty request object carrying only the parent's target and context.
    Fresh,
    /// Same request object, by reference.
    Share,
    /// Full structural copy.
    Copy,
}

/// Session options for [`Db::session`](crate::db::Db::session).
///
/// Scalar options are copied into the derived handle's config by value.
/// `context`, `prepare_stmt`, `skip_hooks` and `isolate` also force the
/// derived handle onto a request object of its own.
#[derive(Clone, Default)]
pub struct DeriveFlags {
    pub dry_run: bool,
    pub prepare_stmt: bool,
    pub new_db: bool,
    /// Derive an operation instance right away.
    pub initialized: bool,
    pub skip_hooks: bool,
    pub skip_default_transaction: bool,
    pub disable_nested_transaction: bool,
    pub allow_global_update: bool,
    pub full_save_associations: bool,
    pub propagate_unscoped: bool,
    pub query_fields: bool,
    pub context: Option<QueryContext>,
    pub sql_log: Option<SqlLogLevel>,
    pub now_fn: Option<NowFn>,
    pub create_batch_size: usize,
    /// Copy-on-write without changing anything else.
    pub isolate: bool,
}

impl DeriveFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_context(context: QueryContext) -> Self {
        Self {
            context: Some(context),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn isolated() -> Self {
        Self {
            isolate: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn requires_isolation(&self) -> bool {
        self.context.is_some() || self.prepare_stmt || self.skip_hooks || self.isolate
    }
}

impl fmt::Debug for DeriveFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeriveFlags")
            .field("dry_run", &self.dry_run)
            .field("prepare_stmt", &self.prepare_stmt)
            .field("new_db", &self.new_db)
            .field("initialized", &self.initialized)
            .field("skip_hooks", &self.skip_hooks)
            .field("context", &self.context.is_some())
            .field("sql_log", &self.sql_log)
            .field("isolate", &self.isolate)
            .finish_non_exhaustive()
    }
}

/// Decide the derived handle's generation and what happens to the request
/// object.
///
/// | parent | isolation flag | plan  | child                       |
/// |--------|----------------|-------|-----------------------------|
/// | Root   | any            | Fresh | IsolatedClone               |
/// | clone  | no             | Share | SharedClone                 |
/// | clone  | yes            | Copy  | IsolatedClone               |
///
/// `new_db` overrides the child tag to `Root`.
#[must_use]
pub fn plan_derivation(current: Generation, flags: &DeriveFlags) -> (Generation, StatementPlan) {
    let plan = match current {
        Generation::Root => StatementPlan::Fresh,
        Generation::SharedClone | Generation::IsolatedClone => {
            if flags.requires_isolation() {
                StatementPlan::Copy
            } else {
                StatementPlan::Share
            }
        }
    };
    let next = if flags.new_db {
        Generation::Root
    } else {
        match plan {
            StatementPlan::Share => Generation::SharedClone,
            StatementPlan::Fresh | StatementPlan::Copy => Generation::IsolatedClone,
        }
    };
    (next, plan)
}
