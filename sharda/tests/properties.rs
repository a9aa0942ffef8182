use std::sync::{Arc, Mutex};

use sharda::memory::MemoryDriver;
use sharda::{CancellationToken, ErrorKind, ShardTopology, ShardedDb, ShardedDbBuilder, Value};

const TOPOLOGY: &str = r#"
clusters:
  - name: main
    shards:
      - { name: main_0, driver: memory, dsn: main_0 }
      - { name: main_1, driver: memory, dsn: main_1 }
sequencer:
  driver: memory
  dsn: seq
tables:
  users:
    cluster: main
    shard: 1
    sequencer: { column: id }
  user_items:
    cluster: main
    shard_key: user_id
    algorithm: modulo
  user_decks:
    cluster: main
    shard_key: user_id
    algorithm: modulo
    sequencer: { column: id }
  user_stages:
    cluster: main
  ledgers:
    cluster: main
    shard_key: account_id
    algorithm: range
    ranges:
      - { start: 0, end: 100, shard: 0 }
      - { start: 100, end: 200, shard: 5 }
"#;

const SCHEMA: &[&str] = &[
    "create table users (id integer primary key, name text)",
    "create table user_items (id integer primary key autoincrement, user_id integer not null, name text)",
    "create table user_decks (id integer primary key, user_id integer not null, name text)",
    "create table user_stages (id integer primary key autoincrement, name text)",
];

struct Harness {
    db: ShardedDb,
    driver: Arc<MemoryDriver>,
}

impl Harness {
    fn shard_len(&self, ordinal: usize, table: &str) -> Option<usize> {
        self.driver.database(&format!("main_{ordinal}")).table_len(table)
    }
}

async fn harness_with(configure: impl FnOnce(ShardedDbBuilder) -> ShardedDbBuilder) -> Harness {
    let topology = ShardTopology::from_yaml_str(TOPOLOGY).unwrap();
    let driver = Arc::new(MemoryDriver::default());
    let builder = ShardedDb::builder(topology).driver(driver.clone());
    let db = configure(builder).build().await.unwrap();
    for ddl in SCHEMA {
        db.execute(ddl, &[]).await.unwrap();
    }
    Harness { db, driver }
}

async fn harness() -> Harness {
    harness_with(|b| b).await
}

#[tokio::test]
async fn unsharded_table_autoincrements_on_its_home_shard() {
    let h = harness().await;
    for expected in 1..=3 {
        let out = h
            .db
            .execute("insert into user_stages (id, name) values (null, ?)", &[format!("stage{expected}").into()])
            .await
            .unwrap();
        assert_eq!(out.last_insert_id, Some(expected));
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].shard.ordinal, 0);
    }
    assert_eq!(h.shard_len(0, "user_stages"), Some(3));
    assert_eq!(h.shard_len(1, "user_stages"), None);
}

#[tokio::test]
async fn generated_ids_increase_per_table_and_are_never_reused() {
    let h = harness().await;
    let mut users = Vec::new();
    let mut decks = Vec::new();
    for i in 0..4i64 {
        let out = h
            .db
            .execute("insert into users (id, name) values (null, ?)", &[format!("u{i}").into()])
            .await
            .unwrap();
        users.push(out.last_insert_id.unwrap());
        let out = h
            .db
            .execute(
                "insert into user_decks (id, user_id, name) values (?, ?, 'deck')",
                &[Value::Null, Value::Integer(i)],
            )
            .await
            .unwrap();
        decks.push(out.last_insert_id.unwrap());
    }
    assert_eq!(users, vec![1, 2, 3, 4]);
    assert_eq!(decks, vec![1, 2, 3, 4]);

    let out = h.db.execute("select id, name from users where id = 3", &[]).await.unwrap();
    assert_eq!(out.rows().cloned().collect::<Vec<_>>(), vec![vec![Value::Integer(3), Value::from("u2")]]);
    assert_eq!(h.shard_len(1, "users"), Some(4));
    assert_eq!(h.shard_len(0, "users"), None);

    assert_eq!(h.shard_len(0, "user_decks"), Some(2));
    assert_eq!(h.shard_len(1, "user_decks"), Some(2));
    let out = h
        .db
        .execute("select id, user_id from user_decks where user_id = ?", &[Value::Integer(3)])
        .await
        .unwrap();
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].shard.ordinal, 1);
    assert_eq!(out.rows().cloned().collect::<Vec<_>>(), vec![vec![Value::Integer(4), Value::Integer(3)]]);
}

#[tokio::test]
async fn rows_follow_their_shard_key() {
    let h = harness().await;
    for user_id in 1..=4i64 {
        h.db
            .execute("insert into user_items (user_id, name) values (?, 'sword')", &[user_id.into()])
            .await
            .unwrap();
    }
    assert_eq!(h.shard_len(0, "user_items"), Some(2));
    assert_eq!(h.shard_len(1, "user_items"), Some(2));

    let out = h
        .db
        .execute("select user_id from user_items where user_id = ? and name = 'sword'", &[Value::Integer(3)])
        .await
        .unwrap();
    assert_eq!(out.results.len(), 1);
    assert_eq!(out.results[0].shard.ordinal, 1);
    assert_eq!(out.row_count(), 1);

    let out = h.db.execute("update user_items set name = 'axe' where user_id = 2", &[]).await.unwrap();
    assert_eq!(out.rows_affected, 1);
    assert_eq!(out.results[0].shard.ordinal, 0);
}

#[tokio::test]
async fn unkeyed_statements_reach_every_shard_in_order() {
    let h = harness().await;
    assert_eq!(h.shard_len(0, "user_items"), Some(0));
    assert_eq!(h.shard_len(1, "user_items"), Some(0));
    for user_id in [10i64, 11] {
        h.db
            .execute("insert into user_items (user_id) values (?)", &[user_id.into()])
            .await
            .unwrap();
    }

    let out = h.db.execute("select user_id from user_items", &[]).await.unwrap();
    let ordinals: Vec<_> = out.results.iter().map(|r| r.shard.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1]);
    assert_eq!(out.columns(), Some(&["user_id".to_string()][..]));
    assert_eq!(
        out.rows().cloned().collect::<Vec<_>>(),
        vec![vec![Value::Integer(10)], vec![Value::Integer(11)]]
    );

    let out = h.db.execute("delete from user_items where name is null", &[]).await.unwrap();
    assert_eq!(out.rows_affected, 2);
}

#[tokio::test]
async fn rollback_leaves_nothing_behind() {
    let h = harness().await;
    let mut tx = h.db.begin();
    for user_id in 1..=2i64 {
        tx.execute("insert into user_items (user_id) values (?)", &[user_id.into()])
            .await
            .unwrap();
    }
    assert_eq!(tx.shards().len(), 2);
    tx.rollback().await.unwrap();
    assert_eq!(h.shard_len(0, "user_items"), Some(0));
    assert_eq!(h.shard_len(1, "user_items"), Some(0));
}

type Events = Arc<Mutex<Vec<String>>>;

fn recording(builder: ShardedDbBuilder, events: &Events) -> ShardedDbBuilder {
    let ok = events.clone();
    let failed = events.clone();
    builder.after_commit(
        move |info| ok.lock().unwrap().push(format!("ok {}", info.shards.len())),
        move |_, critical, log| failed.lock().unwrap().push(format!("fail critical={critical} entries={}", log.len())),
    )
}

#[tokio::test]
async fn commit_applies_everywhere_and_reports_once() {
    let events: Events = Arc::default();
    let h = harness_with(|b| recording(b, &events)).await;
    let mut tx = h.db.begin();
    tx.execute("insert into user_items (user_id) values (1)", &[]).await.unwrap();
    tx.execute("insert into user_items (user_id) values (2)", &[]).await.unwrap();
    tx.execute("insert into users (id, name) values (null, 'amy')", &[]).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(*events.lock().unwrap(), vec!["ok 2"]);
    assert_eq!(h.shard_len(0, "user_items"), Some(1));
    assert_eq!(h.shard_len(1, "user_items"), Some(1));
    assert_eq!(h.shard_len(1, "users"), Some(1));
}

#[tokio::test]
async fn failure_after_a_committed_shard_is_critical() {
    let events: Events = Arc::default();
    let h = harness_with(|b| recording(b, &events)).await;
    let mut tx = h.db.begin();
    tx.execute("insert into user_items (user_id) values (2)", &[]).await.unwrap();
    tx.execute("insert into user_items (user_id) values (3)", &[]).await.unwrap();
    h.driver.database("main_1").fail_next_commit();

    let err: sharda::Error = tx.commit().await.unwrap_err().into();
    assert_eq!(err.kind(), ErrorKind::CriticalPartialCommit);
    assert!(err.is_critical());
    assert_eq!(err.shard().map(|s| s.ordinal), Some(1));
    assert_eq!(*events.lock().unwrap(), vec!["fail critical=true entries=1"]);
    // The committed prefix stays; the failed shard rolled back locally.
    assert_eq!(h.shard_len(0, "user_items"), Some(1));
    assert_eq!(h.shard_len(1, "user_items"), Some(0));
}

#[tokio::test]
async fn vetoed_commit_rolls_back_every_shard() {
    let events: Events = Arc::default();
    let h = harness_with(|b| {
        recording(b, &events).before_commit(|_, log| {
            if log.iter().any(|e| e.sql.contains("forbidden")) {
                Err("forbidden item".into())
            } else {
                Ok(())
            }
        })
    })
    .await;
    let mut tx = h.db.begin();
    tx.execute("insert into user_items (user_id, name) values (1, 'forbidden')", &[])
        .await
        .unwrap();
    tx.execute("insert into user_items (user_id) values (2)", &[]).await.unwrap();

    let err: sharda::Error = tx.commit().await.unwrap_err().into();
    assert_eq!(err.kind(), ErrorKind::HookRejected);
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(h.shard_len(0, "user_items"), Some(0));
    assert_eq!(h.shard_len(1, "user_items"), Some(0));
}

#[tokio::test]
async fn prepared_statement_matches_literal_form() {
    let h = harness().await;
    for user_id in 1..=4i64 {
        h.db
            .execute("insert into user_items (user_id, name) values (?, ?)", &[user_id.into(), format!("i{user_id}").into()])
            .await
            .unwrap();
    }
    let stmt = h.db.prepare("select name from user_items where user_id = ?").unwrap();
    for user_id in 1..=4i64 {
        let prepared = stmt.execute(&[user_id.into()]).await.unwrap();
        let literal = h
            .db
            .execute(&format!("select name from user_items where user_id = {user_id}"), &[])
            .await
            .unwrap();
        assert_eq!(prepared.rows().collect::<Vec<_>>(), literal.rows().collect::<Vec<_>>());
        assert_eq!(prepared.results[0].shard, literal.results[0].shard);
    }

    let insert = h.db.prepare("insert into users (id, name) values (?, ?)").unwrap();
    let out = insert.execute(&[Value::Null, "zed".into()]).await.unwrap();
    assert_eq!(out.last_insert_id, Some(1));

    let mut tx = h.db.begin();
    insert.execute_in(&mut tx, &[Value::Null, "yan".into()]).await.unwrap();
    tx.commit().await.unwrap();
    assert_eq!(h.shard_len(1, "users"), Some(2));
}

#[tokio::test]
async fn unreachable_counter_store_writes_nothing() {
    let h = harness().await;
    h.driver.database("seq").set_unavailable(true);
    let err = h
        .db
        .execute("insert into users (id, name) values (null, 'bob')", &[])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Sequencer);
    assert_eq!(h.shard_len(1, "users"), Some(0));

    h.driver.database("seq").set_unavailable(false);
    let out = h
        .db
        .execute("insert into users (id, name) values (null, 'bob')", &[])
        .await
        .unwrap();
    assert_eq!(out.last_insert_id, Some(1));
}

#[tokio::test]
async fn partial_broadcast_reports_both_sides() {
    let h = harness().await;
    h.driver.database("main_1").fail_next_statement();
    let err = h.db.execute("delete from user_items", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialBroadcast);
    assert_eq!(err.shard().map(|s| s.ordinal), Some(1));
    let partial = err.partial_broadcast().unwrap();
    assert_eq!(partial.succeeded.results.len(), 1);
    assert_eq!(partial.succeeded.results[0].shard.ordinal, 0);
    assert_eq!(partial.failures.len(), 1);
}

#[tokio::test]
async fn classification_and_routing_failures_run_nothing() {
    let h = harness().await;
    for sql in [
        "select count(*) from user_items",
        "select * from user_items join users",
        "update user_items set user_id = 2 where user_id = 1",
        "insert into users values (null, 'anon')",
    ] {
        let err = h.db.execute(sql, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedQuery, "{sql}");
    }

    let err = h
        .db
        .execute("insert into user_items (user_id) values (?)", &[Value::Null])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Routing);

    let err = h.db.execute("select * from ledgers where account_id = 150", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Routing);

    let err = h.db.execute("select * from missing", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(h.shard_len(0, "user_items"), Some(0));
}

#[tokio::test]
async fn unregistered_driver_fails_the_build() {
    let yaml = TOPOLOGY.replace("{ name: main_1, driver: memory", "{ name: main_1, driver: postgres");
    let topology = ShardTopology::from_yaml_str(&yaml).unwrap();
    let err = ShardedDb::builder(topology)
        .driver(Arc::new(MemoryDriver::default()))
        .build()
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test]
async fn cancelled_statements_do_not_run() {
    let h = harness().await;
    let token = CancellationToken::new();
    let stmt = h
        .db
        .prepare_with_cancel("insert into user_items (user_id) values (?)", token.clone())
        .unwrap();
    stmt.execute(&[Value::Integer(1)]).await.unwrap();
    token.cancel();
    let err = stmt.execute(&[Value::Integer(2)]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(h.shard_len(0, "user_items"), Some(0));
    assert_eq!(h.shard_len(1, "user_items"), Some(1));

    let err = h
        .db
        .prepare_with_cancel("select * from user_items", token)
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}
