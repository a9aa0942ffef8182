use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A scalar value: literal, bound argument or result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
}

impl Value {
    /// Returns `true` for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value; integer-looking text is accepted.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Stable textual form used for hashing, independent of literal vs bound origin.
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Integer(v) => Some(v.to_string()),
            Value::Real(v) => Some(format!("{v:?}")),
            Value::Text(s) => Some(s.clone()),
        }
    }

    /// SQL comparison. `NULL` compares with nothing; numbers compare across
    /// integer/real, and integer-looking text compares as a number.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Integer(a), Integer(b)) => Some(a.cmp(b)),
            (Integer(a), Real(b)) => (*a as f64).partial_cmp(b),
            (Real(a), Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Real(a), Real(b)) => a.partial_cmp(b),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Integer(a), Text(_)) => other.as_i64().map(|b| a.cmp(&b)),
            (Text(_), Integer(b)) => self.as_i64().map(|a| a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v:?}"),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// Value expression: a literal or a positional placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    /// Literal value written in the statement.
    Literal(Value),
    /// `?` placeholder, numbered from zero in order of appearance.
    Placeholder(usize),
}

impl Expr {
    /// Resolve against bound arguments. `None` when the argument is missing.
    pub fn bind<'a>(&'a self, args: &'a [Value]) -> Option<&'a Value> {
        match self {
            Expr::Literal(v) => Some(v),
            Expr::Placeholder(i) => args.get(*i),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Placeholder(_) => write!(f, "?"),
        }
    }
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    NotEq,
    /// `<`
    Lt,
    /// `<=`
    LtEq,
    /// `>`
    Gt,
    /// `>=`
    GtEq,
}

impl CmpOp {
    /// Whether an ordering satisfies the operator.
    pub fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::NotEq => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::LtEq => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::GtEq => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        };
        f.write_str(s)
    }
}

/// Filter clause of `SELECT`/`UPDATE`/`DELETE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Predicate {
    /// `column op value`.
    Compare {
        /// Column name.
        column: String,
        /// Operator.
        op: CmpOp,
        /// Right-hand side.
        value: Expr,
    },
    /// `column IS [NOT] NULL`.
    IsNull {
        /// Column name.
        column: String,
        /// `true` for `IS NOT NULL`.
        negated: bool,
    },
    /// Conjunction.
    And(Box<Predicate>, Box<Predicate>),
    /// Disjunction.
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Top-level `AND` conjuncts; an `OR` node is returned as a single conjunct.
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(l, r) => {
                let mut out = l.conjuncts();
                out.extend(r.conjuncts());
                out
            }
            other => vec![other],
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => write!(f, "{column} {op} {value}"),
            Predicate::IsNull { column, negated } => {
                if *negated {
                    write!(f, "{column} IS NOT NULL")
                } else {
                    write!(f, "{column} IS NULL")
                }
            }
            Predicate::And(l, r) => write!(f, "({l} AND {r})"),
            Predicate::Or(l, r) => write!(f, "({l} OR {r})"),
        }
    }
}

/// Column definition of `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared type as written, e.g. `varchar(255)`.
    pub data_type: String,
    /// `PRIMARY KEY` column.
    pub primary_key: bool,
    /// `AUTOINCREMENT` requested.
    pub autoincrement: bool,
    /// `NOT NULL` constraint.
    pub not_null: bool,
    /// `UNIQUE` constraint.
    pub unique: bool,
    /// `DEFAULT` literal.
    pub default: Option<Value>,
}

impl ColumnDef {
    /// Integer primary keys are filled in by the engine when omitted or `NULL`.
    pub fn is_integer_primary_key(&self) -> bool {
        self.primary_key && self.data_type.to_ascii_lowercase().contains("int")
    }
}

impl fmt::Display for ColumnDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.data_type)?;
        if self.not_null {
            write!(f, " NOT NULL")?;
        }
        if self.primary_key {
            write!(f, " PRIMARY KEY")?;
        }
        if self.autoincrement {
            write!(f, " AUTOINCREMENT")?;
        }
        if self.unique {
            write!(f, " UNIQUE")?;
        }
        if let Some(d) = &self.default {
            write!(f, " DEFAULT {d}")?;
        }
        Ok(())
    }
}

/// `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateTable {
    /// Table name.
    pub table: String,
    /// `IF NOT EXISTS` given.
    pub if_not_exists: bool,
    /// Column definitions in declaration order.
    pub columns: Vec<ColumnDef>,
}

/// Single-row `INSERT`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insert {
    /// Table name.
    pub table: String,
    /// Explicit column list; empty means table order.
    pub columns: Vec<String>,
    /// One expression per column.
    pub values: Vec<Expr>,
}

impl Insert {
    /// Position of a column in the explicit column list.
    pub fn column_position(&self, column: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Projection item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SelectItem {
    /// Asterisk.
    Star,
    /// Named column.
    Column(String),
}

/// `ORDER BY` clause.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderBy {
    /// Sort column.
    pub column: String,
    /// Descending order.
    pub descending: bool,
}

/// `SELECT`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Select {
    /// Table name.
    pub table: String,
    /// Projection items, `*` or columns.
    pub projection: Vec<SelectItem>,
    /// `WHERE` clause.
    pub filter: Option<Predicate>,
    /// `ORDER BY` clause.
    pub order_by: Option<OrderBy>,
    /// `LIMIT` clause.
    pub limit: Option<u64>,
}

/// `UPDATE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Update {
    /// Table name.
    pub table: String,
    /// `SET column = expr` pairs.
    pub assignments: Vec<(String, Expr)>,
    /// `WHERE` clause.
    pub filter: Option<Predicate>,
}

/// `DELETE`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delete {
    /// Table name.
    pub table: String,
    /// `WHERE` clause.
    pub filter: Option<Predicate>,
}

/// Top-level SQL statement enumeration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Statement {
    /// `CREATE TABLE` statement.
    CreateTable(CreateTable),
    /// `DROP TABLE` statement.
    DropTable {
        /// Table name.
        table: String,
        /// `IF EXISTS` given.
        if_exists: bool,
    },
    /// `TRUNCATE TABLE` statement.
    Truncate {
        /// Table name.
        table: String,
    },
    /// `SELECT` statement.
    Select(Select),
    /// `INSERT` statement.
    Insert(Insert),
    /// `UPDATE` statement.
    Update(Update),
    /// `DELETE` statement.
    Delete(Delete),
}

/// Routing-relevant statement category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    /// Schema change.
    Ddl,
    /// Read.
    Select,
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
}

impl StatementKind {
    /// Anything except `SELECT` changes shard state.
    pub fn is_write(self) -> bool {
        !matches!(self, StatementKind::Select)
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatementKind::Ddl => "ddl",
            StatementKind::Select => "select",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

impl Statement {
    /// Statement category.
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::CreateTable(_) | Statement::DropTable { .. } | Statement::Truncate { .. } => {
                StatementKind::Ddl
            }
            Statement::Select(_) => StatementKind::Select,
            Statement::Insert(_) => StatementKind::Insert,
            Statement::Update(_) => StatementKind::Update,
            Statement::Delete(_) => StatementKind::Delete,
        }
    }

    /// Number of `?` placeholders, i.e. arguments expected when binding.
    pub fn placeholder_count(&self) -> usize {
        fn expr(e: &Expr) -> usize {
            match e {
                Expr::Placeholder(i) => i + 1,
                Expr::Literal(_) => 0,
            }
        }
        fn pred(p: &Predicate) -> usize {
            match p {
                Predicate::Compare { value, .. } => expr(value),
                Predicate::IsNull { .. } => 0,
                Predicate::And(l, r) | Predicate::Or(l, r) => pred(l).max(pred(r)),
            }
        }
        let filter = |f: &Option<Predicate>| f.as_ref().map_or(0, pred);
        match self {
            Statement::Insert(i) => i.values.iter().map(expr).max().unwrap_or(0),
            Statement::Update(u) => u
                .assignments
                .iter()
                .map(|(_, e)| expr(e))
                .max()
                .unwrap_or(0)
                .max(filter(&u.filter)),
            Statement::Select(s) => filter(&s.filter),
            Statement::Delete(d) => filter(&d.filter),
            _ => 0,
        }
    }

    /// Target table.
    pub fn table(&self) -> &str {
        match self {
            Statement::CreateTable(c) => &c.table,
            Statement::DropTable { table, .. } | Statement::Truncate { table } => table,
            Statement::Select(s) => &s.table,
            Statement::Insert(i) => &i.table,
            Statement::Update(u) => &u.table,
            Statement::Delete(d) => &d.table,
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Star => f.write_str("*"),
            SelectItem::Column(c) => f.write_str(c),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::CreateTable(c) => {
                write!(f, "CREATE TABLE ")?;
                if c.if_not_exists {
                    write!(f, "IF NOT EXISTS ")?;
                }
                write!(f, "{} (", c.table)?;
                write_list(f, &c.columns)?;
                write!(f, ")")
            }
            Statement::DropTable { table, if_exists } => {
                if *if_exists {
                    write!(f, "DROP TABLE IF EXISTS {table}")
                } else {
                    write!(f, "DROP TABLE {table}")
                }
            }
            Statement::Truncate { table } => write!(f, "TRUNCATE TABLE {table}"),
            Statement::Select(s) => {
                write!(f, "SELECT ")?;
                write_list(f, &s.projection)?;
                write!(f, " FROM {}", s.table)?;
                if let Some(p) = &s.filter {
                    write!(f, " WHERE {p}")?;
                }
                if let Some(o) = &s.order_by {
                    write!(f, " ORDER BY {}", o.column)?;
                    if o.descending {
                        write!(f, " DESC")?;
                    }
                }
                if let Some(n) = s.limit {
                    write!(f, " LIMIT {n}")?;
                }
                Ok(())
            }
            Statement::Insert(i) => {
                write!(f, "INSERT INTO {}", i.table)?;
                if !i.columns.is_empty() {
                    write!(f, " (")?;
                    write_list(f, &i.columns)?;
                    write!(f, ")")?;
                }
                write!(f, " VALUES (")?;
                write_list(f, &i.values)?;
                write!(f, ")")
            }
            Statement::Update(u) => {
                write!(f, "UPDATE {} SET ", u.table)?;
                for (i, (col, expr)) in u.assignments.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{col} = {expr}")?;
                }
                if let Some(p) = &u.filter {
                    write!(f, " WHERE {p}")?;
                }
                Ok(())
            }
            Statement::Delete(d) => {
                write!(f, "DELETE FROM {}", d.table)?;
                if let Some(p) = &d.filter {
                    write!(f, " WHERE {p}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_literal_escapes_quotes() {
        assert_eq!(Value::from("o'neil").to_string(), "'o''neil'");
    }

    #[test]
    fn integer_text_compares_numerically() {
        let a = Value::Integer(10);
        assert_eq!(a.sql_cmp(&Value::from("10")), Some(Ordering::Equal));
        assert_eq!(a.sql_cmp(&Value::Null), None);
        assert_eq!(a.sql_cmp(&Value::Real(10.5)), Some(Ordering::Less));
    }

    #[test]
    fn counts_placeholders_across_clauses() {
        let stmt = crate::parse("update t set a = ? where id = ? or id = ?").unwrap();
        assert_eq!(stmt.placeholder_count(), 3);
        let stmt = crate::parse("select * from t").unwrap();
        assert_eq!(stmt.placeholder_count(), 0);
    }

    #[test]
    fn conjuncts_stop_at_or() {
        let eq = |c: &str| Predicate::Compare {
            column: c.into(),
            op: CmpOp::Eq,
            value: Expr::Literal(Value::Integer(1)),
        };
        let p = Predicate::And(
            Box::new(eq("a")),
            Box::new(Predicate::Or(Box::new(eq("b")), Box::new(eq("c")))),
        );
        let parts = p.conjuncts();
        assert_eq!(parts.len(), 2);
        assert!(matches!(parts[1], Predicate::Or(..)));
    }
}
