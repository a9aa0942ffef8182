//! Extracts routing facts from a parsed statement.
use sharda_parser::{CmpOp, Expr, Insert, Predicate, Statement, StatementKind, Value};
use sharda_topology::ShardingRule;

use crate::algorithm::KeyError;
use crate::RouteError;

/// Where a generated id must be written into an `INSERT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSlot {
    /// Literal `NULL` at this value position.
    Literal(usize),
    /// Placeholder bound to `NULL`; holds the argument index.
    Placeholder(usize),
    /// Id column absent from the column list.
    Omitted,
}

/// Routing facts of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub table: String,
    pub kind: StatementKind,
    pub shard_key: Option<Value>,
    /// Set when the statement needs a sequencer-generated id.
    pub id_slot: Option<IdSlot>,
}

impl Classification {
    pub fn needs_generated_id(&self) -> bool {
        self.id_slot.is_some()
    }
}

fn unsupported(msg: impl Into<String>) -> RouteError {
    RouteError::Unsupported(msg.into())
}

fn bound<'a>(expr: &'a Expr, args: &'a [Value]) -> Result<&'a Value, RouteError> {
    expr.bind(args).ok_or_else(|| match expr {
        Expr::Placeholder(i) => unsupported(format!("no argument bound for placeholder {}", i + 1)),
        Expr::Literal(_) => unsupported("unbindable expression"),
    })
}

/// Classify `stmt` under `rule`, reading placeholder values from `args`.
pub fn classify(stmt: &Statement, rule: &ShardingRule, args: &[Value]) -> Result<Classification, RouteError> {
    let mut class = Classification {
        table: rule.table.clone(),
        kind: stmt.kind(),
        shard_key: None,
        id_slot: None,
    };
    match stmt {
        Statement::Insert(ins) => {
            class.id_slot = id_slot(ins, rule, args)?;
            let generated_key = rule.shards_by_sequence() && class.id_slot.is_some();
            if rule.is_sharded() && !generated_key {
                class.shard_key = Some(insert_key(ins, rule, args)?);
            }
        }
        Statement::Select(sel) => class.shard_key = filter_key(sel.filter.as_ref(), rule, args)?,
        Statement::Update(upd) => {
            if upd.assignments.iter().any(|(col, _)| rule.is_shard_key(col)) {
                return Err(unsupported(format!(
                    "UPDATE of shard key column on table {}",
                    rule.table
                )));
            }
            class.shard_key = filter_key(upd.filter.as_ref(), rule, args)?;
        }
        Statement::Delete(del) => class.shard_key = filter_key(del.filter.as_ref(), rule, args)?,
        Statement::CreateTable(_) | Statement::DropTable { .. } | Statement::Truncate { .. } => {}
    }
    Ok(class)
}

fn id_slot(ins: &Insert, rule: &ShardingRule, args: &[Value]) -> Result<Option<IdSlot>, RouteError> {
    let Some(seq) = &rule.sequencer else {
        return Ok(None);
    };
    if ins.columns.is_empty() {
        return Err(unsupported(format!(
            "INSERT into {} must list its columns",
            rule.table
        )));
    }
    let Some(pos) = ins.column_position(&seq.column) else {
        return Ok(Some(IdSlot::Omitted));
    };
    Ok(match &ins.values[pos] {
        Expr::Literal(Value::Null) => Some(IdSlot::Literal(pos)),
        Expr::Literal(_) => None,
        Expr::Placeholder(i) => {
            let value = bound(&ins.values[pos], args)?;
            value.is_null().then_some(IdSlot::Placeholder(*i))
        }
    })
}

fn insert_key(ins: &Insert, rule: &ShardingRule, args: &[Value]) -> Result<Value, RouteError> {
    let key = rule.shard_key.as_deref().unwrap_or_default();
    let pos = ins.column_position(key).ok_or_else(|| {
        unsupported(format!(
            "INSERT into {} must set shard key column {key}",
            rule.table
        ))
    })?;
    let value = bound(&ins.values[pos], args)?;
    if value.is_null() {
        return Err(RouteError::InvalidShardKey {
            table: rule.table.clone(),
            source: KeyError::Null,
        });
    }
    Ok(value.clone())
}

/// Key from an equality on the shard key among the top-level `AND` conjuncts.
fn filter_key(filter: Option<&Predicate>, rule: &ShardingRule, args: &[Value]) -> Result<Option<Value>, RouteError> {
    let (Some(filter), true) = (filter, rule.is_sharded()) else {
        return Ok(None);
    };
    for conjunct in filter.conjuncts() {
        if let Predicate::Compare {
            column,
            op: CmpOp::Eq,
            value,
        } = conjunct
        {
            if rule.is_shard_key(column) {
                let v = bound(value, args)?;
                // `key = NULL` matches nothing; leave it to a broadcast.
                if !v.is_null() {
                    return Ok(Some(v.clone()));
                }
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sharda_parser::parse;
    use sharda_topology::{Algorithm, SequencerRule};

    fn rule(shard_key: Option<&str>, sequencer: Option<&str>) -> ShardingRule {
        ShardingRule {
            table: "t".into(),
            cluster: "main".into(),
            shard_key: shard_key.map(Into::into),
            algorithm: Algorithm::Modulo,
            sequencer: sequencer.map(|c| SequencerRule { column: c.into() }),
            home_shard: 0,
        }
    }

    fn run(sql: &str, rule: &ShardingRule, args: &[Value]) -> Result<Classification, RouteError> {
        classify(&parse(sql).unwrap(), rule, args)
    }

    #[test]
    fn insert_reads_key_from_literal_and_argument() {
        let r = rule(Some("user_id"), None);
        let c = run("insert into t (id, user_id) values (null, 10)", &r, &[]).unwrap();
        assert_eq!(c.kind, StatementKind::Insert);
        assert_eq!(c.shard_key, Some(Value::Integer(10)));
        assert_eq!(c.id_slot, None);
        let c = run("insert into t (user_id) values (?)", &r, &[Value::Integer(10)]).unwrap();
        assert_eq!(c.shard_key, Some(Value::Integer(10)));
    }

    #[test]
    fn insert_flags_generated_id() {
        let r = rule(Some("user_id"), Some("id"));
        let c = run("insert into t (id, user_id) values (null, 10)", &r, &[]).unwrap();
        assert_eq!(c.id_slot, Some(IdSlot::Literal(0)));
        assert_eq!(c.shard_key, Some(Value::Integer(10)));

        let c = run("insert into t (id, user_id) values (?, ?)", &r, &[Value::Null, 3.into()]).unwrap();
        assert_eq!(c.id_slot, Some(IdSlot::Placeholder(0)));

        let c = run("insert into t (user_id) values (4)", &r, &[]).unwrap();
        assert_eq!(c.id_slot, Some(IdSlot::Omitted));

        let c = run("insert into t (id, user_id) values (7, 4)", &r, &[]).unwrap();
        assert!(!c.needs_generated_id());
    }

    #[test]
    fn generated_id_as_shard_key_defers_the_key() {
        let r = rule(Some("id"), Some("id"));
        let c = run("insert into t (id, name) values (null, 'a')", &r, &[]).unwrap();
        assert!(c.needs_generated_id());
        assert_eq!(c.shard_key, None);
    }

    #[test]
    fn insert_without_key_is_rejected() {
        let r = rule(Some("user_id"), None);
        assert!(matches!(
            run("insert into t (id) values (1)", &r, &[]),
            Err(RouteError::Unsupported(_))
        ));
        assert!(matches!(
            run("insert into t (id, user_id) values (1, null)", &r, &[]),
            Err(RouteError::InvalidShardKey { source: KeyError::Null, .. })
        ));
        assert!(matches!(
            run("insert into t (user_id) values (?)", &r, &[]),
            Err(RouteError::Unsupported(_))
        ));
    }

    #[test]
    fn filters_provide_key_through_and_only() {
        let r = rule(Some("user_id"), None);
        let c = run("select * from t where name = 'a' and user_id = ?", &r, &[5.into()]).unwrap();
        assert_eq!(c.shard_key, Some(Value::Integer(5)));
        let c = run("select * from t where user_id = 1 or user_id = 2", &r, &[]).unwrap();
        assert_eq!(c.shard_key, None);
        let c = run("delete from t where user_id > 3", &r, &[]).unwrap();
        assert_eq!(c.shard_key, None);
        let c = run("update t set name = 'x' where USER_ID = 9", &r, &[]).unwrap();
        assert_eq!(c.shard_key, Some(Value::Integer(9)));
    }

    #[test]
    fn unsharded_tables_never_carry_a_key() {
        let r = rule(None, None);
        let c = run("select * from t where user_id = 1", &r, &[]).unwrap();
        assert_eq!(c.shard_key, None);
        let c = run("create table t (id integer primary key)", &r, &[]).unwrap();
        assert_eq!(c.kind, StatementKind::Ddl);
    }

    #[test]
    fn updating_the_shard_key_is_unsupported() {
        let r = rule(Some("user_id"), None);
        assert!(matches!(
            run("update t set user_id = 2 where user_id = 1", &r, &[]),
            Err(RouteError::Unsupported(_))
        ));
    }
}
