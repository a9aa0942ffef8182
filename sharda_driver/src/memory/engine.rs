//! Table storage and statement evaluation for the in-memory engine.
use std::collections::{BTreeMap, HashMap};

use sharda_parser::{
    ColumnDef, CreateTable, Delete, Expr, Insert, Predicate, Select, SelectItem, Statement,
    Update, Value,
};

use crate::{DriverError, ExecResult, Result, Rows, StatementOutput};

#[derive(Debug, Clone)]
pub(crate) struct Table {
    columns: Vec<ColumnDef>,
    rows: BTreeMap<u64, Vec<Value>>,
    next_row: u64,
    /// Highest integer primary key ever assigned; ids are never reused.
    seq: i64,
}

impl Table {
    fn new(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            rows: BTreeMap::new(),
            next_row: 1,
            seq: 0,
        }
    }

    fn column(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DriverError::Rejected(format!("no such column: {name}")))
    }

    fn pk(&self) -> Option<usize> {
        self.columns.iter().position(ColumnDef::is_integer_primary_key)
    }

    /// Constraint checks for `row`, ignoring the row stored under `skip`.
    fn check(&self, row: &[Value], skip: Option<u64>) -> Result<()> {
        for (i, col) in self.columns.iter().enumerate() {
            let value = &row[i];
            if value.is_null() {
                if col.not_null {
                    return Err(DriverError::Constraint(format!("NOT NULL constraint failed: {}", col.name)));
                }
                continue;
            }
            if col.primary_key || col.unique {
                let clash = self
                    .rows
                    .iter()
                    .filter(|(id, _)| Some(**id) != skip)
                    .any(|(_, other)| other[i] == *value);
                if clash {
                    return Err(DriverError::Constraint(format!("UNIQUE constraint failed: {}", col.name)));
                }
            }
        }
        Ok(())
    }
}

/// Reverse operation recorded by a transaction.
#[derive(Debug)]
pub(crate) enum Undo {
    Insert { table: String, row: u64 },
    Update { table: String, row: u64, old: Vec<Value> },
    Delete { table: String, row: u64, old: Vec<Value> },
    Create { table: String },
    Replace { table: String, old: Table },
}

#[derive(Debug, Default)]
pub(crate) struct State {
    tables: HashMap<String, Table>,
}

fn bind(expr: &Expr, args: &[Value]) -> Result<Value> {
    expr.bind(args)
        .cloned()
        .ok_or_else(|| DriverError::Rejected("missing bound argument".into()))
}

fn eval(pred: &Predicate, table: &Table, row: &[Value], args: &[Value]) -> Result<bool> {
    Ok(match pred {
        Predicate::Compare { column, op, value } => {
            let left = &row[table.column(column)?];
            let right = bind(value, args)?;
            left.sql_cmp(&right).map_or(false, |ord| op.holds(ord))
        }
        Predicate::IsNull { column, negated } => row[table.column(column)?].is_null() != *negated,
        Predicate::And(l, r) => eval(l, table, row, args)? && eval(r, table, row, args)?,
        Predicate::Or(l, r) => eval(l, table, row, args)? || eval(r, table, row, args)?,
    })
}

fn matching(table: &Table, filter: &Option<Predicate>, args: &[Value]) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for (id, row) in &table.rows {
        let hit = match filter {
            Some(p) => eval(p, table, row, args)?,
            None => true,
        };
        if hit {
            ids.push(*id);
        }
    }
    Ok(ids)
}

fn done(rows_affected: u64, last_insert_id: Option<i64>) -> StatementOutput {
    StatementOutput::Exec(ExecResult {
        rows_affected,
        last_insert_id,
    })
}

impl State {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| DriverError::Rejected(format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .ok_or_else(|| DriverError::Rejected(format!("no such table: {name}")))
    }

    pub(crate) fn table_len(&self, name: &str) -> Option<usize> {
        self.tables.get(&name.to_ascii_lowercase()).map(|t| t.rows.len())
    }

    pub(crate) fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute `stmt` atomically; when `undo` is given, record how to reverse it.
    ///
    /// A failing statement leaves no partial changes behind.
    pub(crate) fn execute(
        &mut self,
        stmt: &Statement,
        args: &[Value],
        undo: Option<&mut Vec<Undo>>,
    ) -> Result<StatementOutput> {
        let expected = stmt.placeholder_count();
        if args.len() != expected {
            return Err(DriverError::Rejected(format!(
                "expected {expected} arguments, got {}",
                args.len()
            )));
        }
        let mut log = Vec::new();
        match self.apply(stmt, args, &mut log) {
            Ok(out) => {
                if let Some(undo) = undo {
                    undo.extend(log);
                }
                Ok(out)
            }
            Err(e) => {
                self.undo(log);
                Err(e)
            }
        }
    }

    fn apply(&mut self, stmt: &Statement, args: &[Value], undo: &mut Vec<Undo>) -> Result<StatementOutput> {
        match stmt {
            Statement::CreateTable(ct) => self.create(ct, undo),
            Statement::DropTable { table, if_exists } => {
                let key = table.to_ascii_lowercase();
                match self.tables.remove(&key) {
                    Some(old) => undo.push(Undo::Replace { table: key, old }),
                    None if *if_exists => {}
                    None => return Err(DriverError::Rejected(format!("no such table: {table}"))),
                }
                Ok(done(0, None))
            }
            Statement::Truncate { table } => {
                let t = self.table_mut(table)?;
                let emptied = Table {
                    columns: t.columns.clone(),
                    rows: BTreeMap::new(),
                    next_row: t.next_row,
                    seq: t.seq,
                };
                let old = std::mem::replace(t, emptied);
                let affected = old.rows.len() as u64;
                undo.push(Undo::Replace {
                    table: table.to_ascii_lowercase(),
                    old,
                });
                Ok(done(affected, None))
            }
            Statement::Insert(ins) => self.insert(ins, args, undo),
            Statement::Select(sel) => self.select(sel, args),
            Statement::Update(upd) => self.update(upd, args, undo),
            Statement::Delete(del) => self.delete(del, args, undo),
        }
    }

    fn create(&mut self, ct: &CreateTable, undo: &mut Vec<Undo>) -> Result<StatementOutput> {
        let key = ct.table.to_ascii_lowercase();
        if self.tables.contains_key(&key) {
            if ct.if_not_exists {
                return Ok(done(0, None));
            }
            return Err(DriverError::Rejected(format!("table {} already exists", ct.table)));
        }
        self.tables.insert(key.clone(), Table::new(ct.columns.clone()));
        undo.push(Undo::Create { table: key });
        Ok(done(0, None))
    }

    fn insert(&mut self, ins: &Insert, args: &[Value], undo: &mut Vec<Undo>) -> Result<StatementOutput> {
        let table = self.table_mut(&ins.table)?;
        let positions: Vec<usize> = if ins.columns.is_empty() {
            if ins.values.len() != table.columns.len() {
                return Err(DriverError::Rejected(format!(
                    "table {} has {} columns but {} values were supplied",
                    ins.table,
                    table.columns.len(),
                    ins.values.len()
                )));
            }
            (0..table.columns.len()).collect()
        } else {
            ins.columns
                .iter()
                .map(|c| table.column(c))
                .collect::<Result<_>>()?
        };
        let mut row: Vec<Value> = table
            .columns
            .iter()
            .map(|c| c.default.clone().unwrap_or(Value::Null))
            .collect();
        for (pos, expr) in positions.iter().zip(&ins.values) {
            row[*pos] = bind(expr, args)?;
        }
        let mut last_insert_id = None;
        if let Some(pk) = table.pk() {
            let id = match &row[pk] {
                Value::Null => table.seq + 1,
                v => v
                    .as_i64()
                    .ok_or_else(|| DriverError::Constraint("datatype mismatch for integer primary key".into()))?,
            };
            row[pk] = Value::Integer(id);
            last_insert_id = Some(id);
        }
        table.check(&row, None)?;
        if let Some(id) = last_insert_id {
            table.seq = table.seq.max(id);
        }
        let row_id = table.next_row;
        table.next_row += 1;
        table.rows.insert(row_id, row);
        undo.push(Undo::Insert {
            table: ins.table.to_ascii_lowercase(),
            row: row_id,
        });
        Ok(done(1, Some(last_insert_id.unwrap_or(row_id as i64))))
    }

    fn select(&self, sel: &Select, args: &[Value]) -> Result<StatementOutput> {
        let table = self.table(&sel.table)?;
        let mut projection = Vec::new();
        for item in &sel.projection {
            match item {
                SelectItem::Star => projection.extend(0..table.columns.len()),
                SelectItem::Column(c) => projection.push(table.column(c)?),
            }
        }
        let mut rows: Vec<&Vec<Value>> = matching(table, &sel.filter, args)?
            .iter()
            .filter_map(|id| table.rows.get(id))
            .collect();
        if let Some(order) = &sel.order_by {
            let idx = table.column(&order.column)?;
            rows.sort_by(|a, b| {
                let ord = a[idx]
                    .sql_cmp(&b[idx])
                    .unwrap_or_else(|| a[idx].is_null().cmp(&b[idx].is_null()).reverse());
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = sel.limit {
            rows.truncate(limit as usize);
        }
        Ok(StatementOutput::Rows(Rows {
            columns: projection.iter().map(|i| table.columns[*i].name.clone()).collect(),
            rows: rows
                .into_iter()
                .map(|r| projection.iter().map(|i| r[*i].clone()).collect())
                .collect(),
        }))
    }

    fn update(&mut self, upd: &Update, args: &[Value], undo: &mut Vec<Undo>) -> Result<StatementOutput> {
        let table = self.table_mut(&upd.table)?;
        let mut assignments = Vec::with_capacity(upd.assignments.len());
        for (column, expr) in &upd.assignments {
            assignments.push((table.column(column)?, bind(expr, args)?));
        }
        let ids = matching(table, &upd.filter, args)?;
        for id in &ids {
            let old = table.rows[id].clone();
            let mut new = old.clone();
            for (idx, value) in &assignments {
                new[*idx] = value.clone();
            }
            table.check(&new, Some(*id))?;
            table.rows.insert(*id, new);
            undo.push(Undo::Update {
                table: upd.table.to_ascii_lowercase(),
                row: *id,
                old,
            });
        }
        Ok(done(ids.len() as u64, None))
    }

    fn delete(&mut self, del: &Delete, args: &[Value], undo: &mut Vec<Undo>) -> Result<StatementOutput> {
        let table = self.table_mut(&del.table)?;
        let ids = matching(table, &del.filter, args)?;
        for id in &ids {
            if let Some(old) = table.rows.remove(id) {
                undo.push(Undo::Delete {
                    table: del.table.to_ascii_lowercase(),
                    row: *id,
                    old,
                });
            }
        }
        Ok(done(ids.len() as u64, None))
    }

    /// Apply undo records, newest first.
    pub(crate) fn undo(&mut self, log: Vec<Undo>) {
        for entry in log.into_iter().rev() {
            match entry {
                Undo::Insert { table, row } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.remove(&row);
                    }
                }
                Undo::Update { table, row, old } | Undo::Delete { table, row, old } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.rows.insert(row, old);
                    }
                }
                Undo::Create { table } => {
                    self.tables.remove(&table);
                }
                Undo::Replace { table, old } => {
                    self.tables.insert(table, old);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharda_parser::parse;

    fn run(state: &mut State, sql: &str, args: &[Value]) -> Result<StatementOutput> {
        state.execute(&parse(sql).unwrap(), args, None)
    }

    fn last_id(out: StatementOutput) -> i64 {
        out.exec().unwrap().last_insert_id.unwrap()
    }

    #[test]
    fn autoincrement_never_reuses_ids() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key autoincrement, v text)", &[]).unwrap();
        assert_eq!(last_id(run(&mut state, "insert into t (id, v) values (null, 'a')", &[]).unwrap()), 1);
        assert_eq!(last_id(run(&mut state, "insert into t (v) values ('b')", &[]).unwrap()), 2);
        run(&mut state, "delete from t where id = 2", &[]).unwrap();
        assert_eq!(last_id(run(&mut state, "insert into t (v) values ('c')", &[]).unwrap()), 3);
        assert_eq!(
            last_id(run(&mut state, "insert into t (id, v) values (10, 'd')", &[]).unwrap()),
            10
        );
        assert_eq!(last_id(run(&mut state, "insert into t (v) values (?)", &["e".into()]).unwrap()), 11);
    }

    #[test]
    fn constraints_are_enforced() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key, v text not null)", &[]).unwrap();
        run(&mut state, "insert into t (id, v) values (1, 'a')", &[]).unwrap();
        assert!(matches!(
            run(&mut state, "insert into t (id, v) values (1, 'b')", &[]),
            Err(DriverError::Constraint(_))
        ));
        assert!(matches!(
            run(&mut state, "insert into t (id) values (2)", &[]),
            Err(DriverError::Constraint(_))
        ));
        assert!(matches!(
            run(&mut state, "insert into missing (id) values (2)", &[]),
            Err(DriverError::Rejected(_))
        ));
    }

    #[test]
    fn select_filters_orders_and_limits() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key, uid integer)", &[]).unwrap();
        for uid in [5, 3, 5, 9] {
            run(&mut state, "insert into t (uid) values (?)", &[Value::Integer(uid)]).unwrap();
        }
        let out = run(&mut state, "select id from t where uid = 5 or uid = 9 order by id desc limit 2", &[]).unwrap();
        let rows = out.rows().unwrap();
        assert_eq!(rows.columns, vec!["id"]);
        assert_eq!(rows.rows, vec![vec![Value::Integer(4)], vec![Value::Integer(3)]]);
    }

    #[test]
    fn argument_count_must_match() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key)", &[]).unwrap();
        assert!(matches!(
            run(&mut state, "select * from t where id = ?", &[]),
            Err(DriverError::Rejected(_))
        ));
    }

    #[test]
    fn failing_statement_leaves_no_partial_changes() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key, v integer unique)", &[]).unwrap();
        for (id, v) in [(1, 10), (2, 20), (3, 30)] {
            run(&mut state, "insert into t (id, v) values (?, ?)", &[Value::Integer(id), Value::Integer(v)]).unwrap();
        }
        assert!(matches!(
            run(&mut state, "update t set v = 5 where id > 1", &[]),
            Err(DriverError::Constraint(_))
        ));
        let out = run(&mut state, "select id, v from t order by id", &[]).unwrap();
        let expected: Vec<Vec<Value>> = [(1, 10), (2, 20), (3, 30)]
            .iter()
            .map(|&(id, v)| vec![Value::Integer(id), Value::Integer(v)])
            .collect();
        assert_eq!(out.rows().unwrap().rows, expected);

        let mut log = Vec::new();
        state
            .execute(&parse("delete from t where id = 1").unwrap(), &[], Some(&mut log))
            .unwrap();
        assert!(state
            .execute(&parse("update t set v = 7 where id > 1").unwrap(), &[], Some(&mut log))
            .is_err());
        assert_eq!(log.len(), 1);
        state.undo(log);
        assert_eq!(state.table_len("t"), Some(3));
    }

    #[test]
    fn undo_restores_previous_state() {
        let mut state = State::default();
        run(&mut state, "create table t (id integer primary key, v text)", &[]).unwrap();
        run(&mut state, "insert into t (v) values ('keep')", &[]).unwrap();
        let mut log = Vec::new();
        for sql in [
            "insert into t (v) values ('new')",
            "update t set v = 'changed' where id = 1",
            "delete from t where id = 1",
            "create table u (id integer primary key)",
            "truncate t",
        ] {
            state.execute(&parse(sql).unwrap(), &[], Some(&mut log)).unwrap();
        }
        state.undo(log);
        let out = run(&mut state, "select v from t", &[]).unwrap();
        assert_eq!(out.rows().unwrap().rows, vec![vec![Value::from("keep")]]);
        assert_eq!(state.table_names(), vec!["t"]);
    }
}
