//! Minimal clause layer: named clauses merged onto a statement and rendered
//! in a caller-chosen order into SQL text plus positional arguments.

use crate::types::RowValues;

/// Sink that clauses render into.
pub trait Builder {
    fn write_str(&mut self, s: &str);

    fn write_char(&mut self, c: char);

    /// Write an identifier, quoted for the target dialect.
    fn write_quoted(&mut self, column: &Column);

    /// Bind a value and write its placeholder.
    fn add_var(&mut self, value: RowValues);
}

/// Something that can merge itself into the [`Clause`] of the same name.
pub trait ClauseInterface {
    fn name(&self) -> &str;

    fn merge_clause(self, clause: &mut Clause);
}

/// A column reference. `raw` columns are written without quoting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Column {
    pub table: Option<String>,
    pub name: String,
    pub alias: Option<String>,
    pub raw: bool,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn raw(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }
}

/// Raw SQL with `?` placeholders filled from `vars` in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expr {
    pub sql: String,
    pub vars: Vec<RowValues>,
}

impl Expr {
    #[must_use]
    pub fn new(sql: impl Into<String>, vars: Vec<RowValues>) -> Self {
        Self {
            sql: sql.into(),
            vars,
        }
    }

    pub fn build(&self, builder: &mut dyn Builder) {
        let mut vars = self.vars.iter();
        for c in self.sql.chars() {
            if c == '?' {
                if let Some(value) = vars.next() {
                    builder.add_var(value.clone());
                    continue;
                }
            }
            builder.write_char(c);
        }
    }
}

/// `SELECT` column list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub distinct: bool,
    pub columns: Vec<Column>,
    /// Replaces the column list entirely when set.
    pub expression: Option<Box<Expression>>,
}

impl Select {
    #[must_use]
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Column::new).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn build(&self, builder: &mut dyn Builder) {
        if self.columns.is_empty() {
            builder.write_char('*');
            return;
        }
        if self.distinct {
            builder.write_str("DISTINCT ");
        }
        for (idx, column) in self.columns.iter().enumerate() {
            if idx > 0 {
                builder.write_char(',');
            }
            builder.write_quoted(column);
        }
    }
}

impl ClauseInterface for Select {
    fn name(&self) -> &str {
        "SELECT"
    }

    fn merge_clause(self, clause: &mut Clause) {
        match self.expression {
            Some(expression) => {
                clause.expression = Some(match *expression {
                    Expression::Expr(mut expr) if self.distinct => {
                        expr.sql = format!("DISTINCT {}", expr.sql);
                        Expression::Expr(expr)
                    }
                    other => other,
                });
            }
            None => clause.expression = Some(Expression::Select(self)),
        }
    }
}

/// Expressions written with `", "` between them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommaExpression {
    pub exprs: Vec<Expression>,
}

impl CommaExpression {
    pub fn build(&self, builder: &mut dyn Builder) {
        for (idx, expr) in self.exprs.iter().enumerate() {
            if idx > 0 {
                builder.write_str(", ");
            }
            expr.build(builder);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Expr(Expr),
    Select(Select),
    Comma(CommaExpression),
    Column(Column),
}

impl Expression {
    pub fn build(&self, builder: &mut dyn Builder) {
        match self {
            Expression::Expr(expr) => expr.build(builder),
            Expression::Select(select) => select.build(builder),
            Expression::Comma(comma) => comma.build(builder),
            Expression::Column(column) => builder.write_quoted(column),
        }
    }
}

impl From<Expr> for Expression {
    fn from(expr: Expr) -> Self {
        Expression::Expr(expr)
    }
}

/// Any named clause whose expression replaces the previous one on merge,
/// for clauses this module has no dedicated type for (`FROM`, `WHERE`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Named {
    pub name: String,
    pub expression: Expression,
}

impl Named {
    #[must_use]
    pub fn new(name: impl Into<String>, expression: impl Into<Expression>) -> Self {
        Self {
            name: name.into(),
            expression: expression.into(),
        }
    }
}

impl ClauseInterface for Named {
    fn name(&self) -> &str {
        &self.name
    }

    fn merge_clause(self, clause: &mut Clause) {
        clause.expression = Some(self.expression);
    }
}

/// A clause slot on a statement, keyed by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Clause {
    pub name: String,
    pub expression: Option<Expression>,
}

impl Clause {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expression: None,
        }
    }

    pub fn build(&self, builder: &mut dyn Builder) {
        if let Some(expression) = &self.expression {
            if !self.name.is_empty() {
                builder.write_str(&self.name);
                builder.write_char(' ');
            }
            expression.build(builder);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Sql {
        sql: String,
        vars: Vec<RowValues>,
    }

    impl Builder for Sql {
        fn write_str(&mut self, s: &str) {
            self.sql.push_str(s);
        }

        fn write_char(&mut self, c: char) {
            self.sql.push(c);
        }

        fn write_quoted(&mut self, column: &Column) {
            self.sql.push_str(&format!("`{}`", column.name));
        }

        fn add_var(&mut self, value: RowValues) {
            self.vars.push(value);
            self.sql.push('?');
        }
    }

    fn render(clause: &Clause) -> String {
        let mut sql = Sql::default();
        clause.build(&mut sql);
        sql.sql
    }

    #[test]
    fn select_star_without_columns() {
        let mut clause = Clause::new("SELECT");
        Select::default().merge_clause(&mut clause);
        assert_eq!(render(&clause), "SELECT *");
    }

    #[test]
    fn distinct_columns() {
        let mut clause = Clause::new("SELECT");
        Select::columns(["id", "name"]).distinct().merge_clause(&mut clause);
        assert_eq!(render(&clause), "SELECT DISTINCT `id`,`name`");
    }

    #[test]
    fn distinct_prefixes_raw_expression() {
        let mut clause = Clause::new("SELECT");
        Select {
            distinct: true,
            expression: Some(Box::new(Expr::new("COALESCE(a, ?)", vec![1_i64.into()]).into())),
            ..Select::default()
        }
        .merge_clause(&mut clause);

        let mut sql = Sql::default();
        clause.build(&mut sql);
        assert_eq!(sql.sql, "SELECT DISTINCT COALESCE(a, ?)");
        assert_eq!(sql.vars, vec![RowValues::Int(1)]);
    }

    #[test]
    fn comma_expression_joins() {
        let comma = CommaExpression {
            exprs: vec![
                Expr::new("a = ?", vec![1_i64.into()]).into(),
                Expression::Column(Column::new("b")),
            ],
        };
        let mut sql = Sql::default();
        comma.build(&mut sql);
        assert_eq!(sql.sql, "a = ?, `b`");
    }
}
