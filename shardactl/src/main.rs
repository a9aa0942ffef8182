use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use directories::BaseDirs;
use rustyline::{error::ReadlineError, DefaultEditor};
use sharda::memory::MemoryDriver;
use sharda::{LogicalTransaction, Outcome, ShardedDb, StatementOutput, Value};
use sharda_log::{LogConfig, LogGuard};
use sharda_shard::Router;
use sharda_topology::ShardTopology;
use tokio::runtime::Runtime;
use tracing::debug;

/// Sharda operator tool.
#[derive(Parser)]
#[command(name = "shardactl", author, version, about = "Sharda topology and routing tool", long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Options {
    /// Topology file (default: $HOME/.sharda.yml).
    #[arg(long, global = true)]
    topology: Option<PathBuf>,

    /// Log filter directives.
    #[arg(long = "log-level", global = true, default_value = "warn")]
    log_level: String,

    /// Write rotated log files here instead of stdout.
    #[arg(long = "log-dir", global = true)]
    log_dir: Option<PathBuf>,

    /// Log as JSON.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the topology and print its layout.
    Check,

    /// Show where a statement would run, without running it.
    Route {
        sql: String,
        /// Placeholder arguments in order: integers, reals, `null` or text.
        #[arg(long = "arg")]
        args: Vec<String>,
    },

    /// Interactive shell over in-memory shards laid out like the topology.
    Shell {
        /// Execute these statements and exit.
        #[arg(short = 'e', long = "exec")]
        exec: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log = sharda_log::init(&LogConfig {
        level: cli.opts.log_level.clone(),
        dir: cli.opts.log_dir.clone(),
        json: cli.opts.json,
    })?;
    let topology = load_topology(cli.opts.topology)?;

    match cli.command.unwrap_or(Commands::Shell { exec: Vec::new() }) {
        Commands::Check => check(&topology),
        Commands::Route { sql, args } => route(topology, &sql, &args),
        Commands::Shell { exec } => {
            let rt = Runtime::new()?;
            let mut shell = Shell::start(&rt, topology, log)?;
            if exec.is_empty() {
                shell.interactive()
            } else {
                for line in exec {
                    shell.handle(&line)?;
                }
                Ok(())
            }
        }
    }
}

fn load_topology(path: Option<PathBuf>) -> anyhow::Result<ShardTopology> {
    let path = path
        .or_else(|| BaseDirs::new().map(|b| b.home_dir().join(".sharda.yml")))
        .ok_or_else(|| anyhow!("no --topology given and no home directory"))?;
    ShardTopology::load(&path).with_context(|| format!("loading topology {}", path.display()))
}

fn check(topology: &ShardTopology) -> anyhow::Result<()> {
    for cluster in topology.cluster_names() {
        println!("cluster {cluster}");
        for shard in topology.shards_in_order(cluster)? {
            println!("  [{}] {} driver={} dsn={}", shard.id.ordinal, shard.name, shard.driver, shard.dsn);
        }
    }
    if let Some(store) = topology.sequencer_store() {
        println!("sequencer driver={} dsn={}", store.driver, store.dsn);
    }
    for rule in topology.rules() {
        let key = rule.shard_key.as_deref().unwrap_or("-");
        let seq = rule.sequencer.as_ref().map_or("-", |s| s.column.as_str());
        if rule.is_sharded() {
            println!("table {} cluster={} key={key} algorithm={:?} sequencer={seq}", rule.table, rule.cluster, rule.algorithm);
        } else {
            println!("table {} cluster={} shard={} sequencer={seq}", rule.table, rule.cluster, rule.home_shard);
        }
    }
    println!("topology ok");
    Ok(())
}

/// Read a command-line argument as the narrowest value it spells.
fn parse_arg(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Value::Real(f);
    }
    Value::Text(raw.trim_matches('\'').to_string())
}

fn route(topology: ShardTopology, sql: &str, raw_args: &[String]) -> anyhow::Result<()> {
    let args: Vec<Value> = raw_args.iter().map(|a| parse_arg(a)).collect();
    let router = Router::new(Arc::new(topology), None);
    let dry = router.classify_only(sql, &args)?;
    let class = &dry.classification;
    println!("table={} kind={}", class.table, class.kind);
    if let Some(key) = &class.shard_key {
        println!("shard key={key}");
    }
    if class.needs_generated_id() {
        println!("needs generated id");
    }
    match dry.route {
        Some(route) => {
            let names: Vec<_> = route.shards().iter().map(|s| s.name.as_str()).collect();
            let mode = if route.is_broadcast() { "broadcast" } else { "single" };
            println!("{mode}: {}", names.join(", "));
        }
        None => println!("shard depends on the generated id"),
    }
    Ok(())
}

/// Memory databases standing in for every driver the topology names.
fn memory_db(rt: &Runtime, topology: ShardTopology) -> anyhow::Result<ShardedDb> {
    let mut drivers: BTreeSet<String> = topology.all_shards().map(|s| s.driver.clone()).collect();
    if let Some(store) = topology.sequencer_store() {
        drivers.insert(store.driver.clone());
    }
    let mut builder = ShardedDb::builder(topology);
    for name in drivers {
        builder = builder.driver(Arc::new(MemoryDriver::with_name(name)));
    }
    Ok(rt.block_on(builder.build())?)
}

struct Shell<'rt> {
    rt: &'rt Runtime,
    db: ShardedDb,
    tx: Option<LogicalTransaction>,
    log: LogGuard,
}

impl<'rt> Shell<'rt> {
    fn start(rt: &'rt Runtime, topology: ShardTopology, log: LogGuard) -> anyhow::Result<Self> {
        let db = memory_db(rt, topology)?;
        Ok(Self { rt, db, tx: None, log })
    }

    fn interactive(&mut self) -> anyhow::Result<()> {
        let mut rl = DefaultEditor::new()?;
        println!("in-memory shards; `begin`, `commit`, `rollback`, `\\log <filter>`, `\\q` to quit");
        loop {
            let prompt = if self.tx.is_some() { "sharda*> " } else { "sharda> " };
            match rl.readline(prompt) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.eq_ignore_ascii_case("exit") || trimmed == "\\q" {
                        break;
                    }
                    if trimmed.is_empty() {
                        continue;
                    }
                    if let Err(e) = rl.add_history_entry(trimmed) {
                        debug!(error = %e, "history entry not recorded");
                    }
                    if let Err(e) = self.handle(trimmed) {
                        eprintln!("error: {e:#}");
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("readline error: {err}");
                    break;
                }
            }
        }
        if let Some(tx) = self.tx.take() {
            self.rt.block_on(tx.rollback())?;
            println!("open transaction rolled back");
        }
        Ok(())
    }

    fn handle(&mut self, line: &str) -> anyhow::Result<()> {
        let line = line.trim().trim_end_matches(';');
        if let Some(filter) = line.strip_prefix("\\log ") {
            return self.log.set_level(filter.trim());
        }
        match line.to_ascii_lowercase().as_str() {
            "begin" => {
                if self.tx.is_some() {
                    return Err(anyhow!("transaction already open"));
                }
                let tx = self.db.begin();
                println!("{} started", tx.id());
                self.tx = Some(tx);
            }
            "commit" => {
                let tx = self.tx.take().ok_or_else(|| anyhow!("no open transaction"))?;
                let id = tx.id();
                self.rt.block_on(tx.commit()).map_err(sharda::Error::from)?;
                println!("{id} committed");
            }
            "rollback" => {
                let tx = self.tx.take().ok_or_else(|| anyhow!("no open transaction"))?;
                let id = tx.id();
                self.rt.block_on(tx.rollback()).map_err(sharda::Error::from)?;
                println!("{id} rolled back");
            }
            _ => {
                let outcome = match &mut self.tx {
                    Some(tx) => self.rt.block_on(tx.execute(line, &[])).map_err(sharda::Error::from)?,
                    None => self.rt.block_on(self.db.execute(line, &[]))?,
                };
                print_outcome(&outcome);
            }
        }
        Ok(())
    }
}

fn print_outcome(outcome: &Outcome) {
    for result in &outcome.results {
        match &result.output {
            StatementOutput::Rows(rows) => {
                println!("-- {}", result.shard);
                println!("{}", rows.columns.join(" | "));
                for row in &rows.rows {
                    let cells: Vec<String> = row.iter().map(Value::to_string).collect();
                    println!("{}", cells.join(" | "));
                }
            }
            StatementOutput::Exec(_) => {}
        }
    }
    if outcome.results.iter().any(|r| r.output.exec().is_some()) {
        match outcome.last_insert_id {
            Some(id) => println!("ok, {} row(s) affected, last insert id {id}", outcome.rows_affected),
            None => println!("ok, {} row(s) affected", outcome.rows_affected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPOLOGY: &str = r#"
clusters:
  - name: main
    shards:
      - { name: a, driver: pg, dsn: a }
      - { name: b, driver: pg, dsn: b }
sequencer: { driver: counters, dsn: seq }
tables:
  users:
    cluster: main
    shard: 1
    sequencer: { column: id }
  items:
    cluster: main
    shard_key: owner
    algorithm: modulo
"#;

    #[test]
    fn arguments_take_their_narrowest_type() {
        assert_eq!(parse_arg("NULL"), Value::Null);
        assert_eq!(parse_arg("42"), Value::Integer(42));
        assert_eq!(parse_arg("1.5"), Value::Real(1.5));
        assert_eq!(parse_arg("'bob'"), Value::Text("bob".into()));
    }

    #[test]
    fn shell_runs_against_memory_shards() {
        let rt = Runtime::new().unwrap();
        let topology = ShardTopology::from_yaml_str(TOPOLOGY).unwrap();
        let db = memory_db(&rt, topology).unwrap();
        rt.block_on(async {
            db.execute("create table users (id integer primary key, name text)", &[]).await.unwrap();
            db.execute("create table items (id integer primary key autoincrement, owner integer)", &[])
                .await
                .unwrap();
            let out = db.execute("insert into users (id, name) values (null, 'ann')", &[]).await.unwrap();
            assert_eq!(out.last_insert_id, Some(1));
            let mut tx = db.begin();
            tx.execute("insert into items (owner) values (3)", &[]).await.unwrap();
            tx.commit().await.unwrap();
            let out = db.execute("select owner from items", &[]).await.unwrap();
            assert_eq!(out.results.len(), 2);
            assert_eq!(out.row_count(), 1);
        });
    }

    #[test]
    fn route_reports_without_running() {
        let topology = ShardTopology::from_yaml_str(TOPOLOGY).unwrap();
        route(topology, "select * from items where owner = ?", &["7".into()]).unwrap();
        let topology = ShardTopology::from_yaml_str(TOPOLOGY).unwrap();
        assert!(route(topology, "select count(*) from items", &[]).is_err());
    }
}
