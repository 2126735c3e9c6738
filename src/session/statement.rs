use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clause::{Builder, Clause, ClauseInterface, Column};
use crate::pool::{ConnTarget, QueryContext};
use crate::types::RowValues;

/// Per-operation value stored by [`Db::set`](crate::db::Db::set).
pub type Setting = Arc<dyn Any + Send + Sync>;

/// Request object handed between a handle and its derivations.
pub type SharedStatement = Arc<Mutex<Statement>>;

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// The in-flight request state of one handle: where it dispatches, under
/// which context, and the SQL assembled so far.
pub struct Statement {
    id: u64,
    pub target: ConnTarget,
    pub context: QueryContext,
    pub clauses: BTreeMap<String, Clause>,
    pub vars: Vec<RowValues>,
    pub sql: String,
    settings: HashMap<String, Setting>,
    pub skip_hooks: bool,
    pub unscoped: bool,
    pub rows_affected: u64,
}

impl Statement {
    #[must_use]
    pub fn new(target: ConnTarget, context: QueryContext) -> Self {
        Self {
            id: NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed),
            target,
            context,
            clauses: BTreeMap::new(),
            vars: Vec::with_capacity(8),
            sql: String::new(),
            settings: HashMap::new(),
            skip_hooks: false,
            unscoped: false,
            rows_affected: 0,
        }
    }

    /// Identity of this request object; copies get a new one.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Empty request object on the same target and context.
    #[must_use]
    pub fn fresh(&self, propagate_unscoped: bool) -> Self {
        let mut stmt = Statement::new(self.target.clone(), self.context.clone());
        stmt.skip_hooks = self.skip_hooks;
        if propagate_unscoped {
            stmt.unscoped = self.unscoped;
        }
        stmt
    }

    /// Structural copy: clauses, vars, SQL and settings are duplicated.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            id: NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed),
            target: self.target.clone(),
            context: self.context.clone(),
            clauses: self.clauses.clone(),
            vars: self.vars.clone(),
            sql: self.sql.clone(),
            settings: self.settings.clone(),
            skip_hooks: self.skip_hooks,
            unscoped: self.unscoped,
            rows_affected: self.rows_affected,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Setting) {
        self.settings.insert(key.into(), value);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Setting> {
        self.settings.get(key)
    }

    /// Setting key scoped to this request object only.
    #[must_use]
    pub fn instance_key(&self, key: &str) -> String {
        format!("{:x}:{key}", self.id)
    }

    /// Merge `clause` into the slot with the same name.
    pub fn add_clause<C: ClauseInterface>(&mut self, clause: C) {
        let name = clause.name().to_owned();
        let slot = self
            .clauses
            .entry(name.clone())
            .or_insert_with(|| Clause::new(name));
        clause.merge_clause(slot);
    }

    /// Render the named clauses, in order, onto `sql`/`vars`.
    pub fn build(&mut self, names: &[&str]) {
        let clauses = std::mem::take(&mut self.clauses);
        let mut first = true;
        for name in names {
            if let Some(clause) = clauses.get(*name) {
                if !first {
                    self.write_char(' ');
                }
                first = false;
                clause.build(self);
            }
        }
        self.clauses = clauses;
    }

    /// Forget SQL and vars built so far, keeping clauses and settings.
    pub fn reset_sql(&mut self) {
        self.sql.clear();
        self.vars.clear();
    }
}

impl Builder for Statement {
    fn write_str(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn write_char(&mut self, c: char) {
        self.sql.push(c);
    }

    fn write_quoted(&mut self, column: &Column) {
        if column.raw {
            self.sql.push_str(&column.name);
        } else {
            if let Some(table) = &column.table {
                push_quoted(&mut self.sql, table);
                self.sql.push('.');
            }
            push_quoted(&mut self.sql, &column.name);
        }
        if let Some(alias) = &column.alias {
            self.sql.push_str(" AS ");
            push_quoted(&mut self.sql, alias);
        }
    }

    fn add_var(&mut self, value: RowValues) {
        self.vars.push(value);
        self.sql.push('?');
    }
}

fn push_quoted(sql: &mut String, ident: &str) {
    sql.push('"');
    sql.push_str(&ident.replace('"', "\"\""));
    sql.push('"');
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("target", &self.target.kind())
            .field("clauses", &self.clauses.keys().collect::<Vec<_>>())
            .field("sql", &self.sql)
            .field("vars", &self.vars.len())
            .field("settings", &self.settings.len())
            .field("skip_hooks", &self.skip_hooks)
            .field("unscoped", &self.unscoped)
            .finish()
    }
}

/// Lock a shared request object, recovering from poisoning.
pub(crate) fn lock(stmt: &SharedStatement) -> MutexGuard<'_, Statement> {
    stmt.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clause::{Expr, Named, Select};
    use crate::test_utils::MockPool;

    fn statement() -> Statement {
        Statement::new(
            ConnTarget::Pool(Arc::new(MockPool::new())),
            QueryContext::new(),
        )
    }

    #[test]
    fn build_renders_clauses_in_order() {
        let mut stmt = statement();
        stmt.add_clause(Named::new("WHERE", Expr::new("age > ?", vec![18_i64.into()])));
        stmt.add_clause(Select::columns(["id", "name"]));
        stmt.add_clause(Named::new("FROM", Expr::new("users", vec![])));
        stmt.build(&["SELECT", "FROM", "WHERE", "LIMIT"]);

        assert_eq!(stmt.sql, "SELECT \"id\",\"name\" FROM users WHERE age > ?");
        assert_eq!(stmt.vars, vec![RowValues::Int(18)]);
    }

    #[test]
    fn copy_is_independent() {
        let mut original = statement();
        original.add_clause(Select::columns(["id"]));
        original.set("k", Arc::new(1_u32));

        let mut copy = original.copy();
        copy.add_clause(Select::columns(["name"]));
        copy.set("k", Arc::new(2_u32));
        copy.vars.push(RowValues::Null);

        assert_ne!(copy.id(), original.id());
        assert!(original.vars.is_empty());
        let kept = original.get("k").and_then(|v| v.downcast_ref::<u32>());
        assert_eq!(kept, Some(&1));
        assert_ne!(original.clauses, copy.clauses);
    }

    #[test]
    fn fresh_drops_request_state() {
        let mut parent = statement();
        parent.add_clause(Select::columns(["id"]));
        parent.skip_hooks = true;
        parent.unscoped = true;
        parent.set("k", Arc::new("v"));

        let child = parent.fresh(false);
        assert!(child.clauses.is_empty());
        assert!(child.get("k").is_none());
        assert!(child.skip_hooks);
        assert!(!child.unscoped);
        assert!(parent.fresh(true).unscoped);
    }
}
