use std::env;
use std::fs::metadata;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use chunkdb::btree::Direction;
use chunkdb::key::Value;
use chunkdb::table::{ChunkDb, ColumnSpec, Row};
use chunkdb::ChunkDbError;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database directory (created on first use)
    database: String,

    /// Owner namespace for tables
    #[arg(short, long, default_value = "admin")]
    owner: String,

    #[command(subcommand)]
    parameter: Option<Parameter>,
}

#[derive(Debug, Subcommand)]
enum Parameter {
    /// Create a table from a JSON column list
    CreateTable {
        name: String,
        /// e.g. [{"name":"id","primary":true,"type":"integer","index":"ordered-tree"}]
        columns: String,
        #[arg(long, default_value_t = 0.0)]
        bid: f64,
        #[arg(long, default_value_t = 1)]
        replication: i64,
        #[arg(long, default_value_t = 0)]
        encrypted: i64,
    },
    /// Write a JSON row, replacing any row with the same primary key
    Put { table: String, row: String },
    /// Write a JSON row, failing if the primary key already exists
    Insert { table: String, row: String },
    /// Fetch a row by primary key
    Get { table: String, key: String },
    /// Delete a row by primary key
    Delete { table: String, key: String },
    /// Scan an ordered column
    Scan {
        table: String,
        column: String,
        /// Direction (Descending or Ascending)
        direction: Option<Direction>,
    },
    /// Show a table's columns
    Info { table: String },
    /// Interactive Help
    Help,
}

fn get_history_file() -> Option<PathBuf> {
    dirs::preference_dir()
        .and_then(|mut base| {
            base.push("chunkdb-store");
            // Note: Not create_dir_all(), because we don't want to create
            // preference dirs if they don't exist.
            if metadata(base.clone()).ok().is_none() {
                std::fs::create_dir(base.clone()).ok()?
            }
            Some(base)
        })
        .map(|mut base| {
            base.push("history.txt");
            base
        })
}

/// Primary keys arrive as plain text: anything that parses as a JSON number
/// is numeric, everything else is a string key.
fn parse_key(input: &str) -> Value {
    serde_json::from_str::<Value>(input).unwrap_or_else(|_| Value::Text(input.to_string()))
}

fn parse_line(line: &str) -> Option<Parameter> {
    let mut words = line.splitn(2, char::is_whitespace);
    let command = words.next()?;
    let rest = words.next().unwrap_or("").trim();
    let split_rest = || -> Option<(String, String)> {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let first = parts.next()?.to_string();
        let second = parts.next()?.trim().to_string();
        if first.is_empty() || second.is_empty() {
            return None;
        }
        Some((first, second))
    };
    match command.to_ascii_lowercase().as_str() {
        "create-table" => {
            let (name, columns) = split_rest()?;
            Some(Parameter::CreateTable {
                name,
                columns,
                bid: 0.0,
                replication: 1,
                encrypted: 0,
            })
        }
        "put" => {
            let (table, row) = split_rest()?;
            Some(Parameter::Put { table, row })
        }
        "insert" => {
            let (table, row) = split_rest()?;
            Some(Parameter::Insert { table, row })
        }
        "get" => {
            let (table, key) = split_rest()?;
            Some(Parameter::Get { table, key })
        }
        "delete" => {
            let (table, key) = split_rest()?;
            Some(Parameter::Delete { table, key })
        }
        "scan" => {
            let mut parts = rest.split_whitespace();
            let table = parts.next()?.to_string();
            let column = parts.next()?.to_string();
            let direction = match parts.next() {
                Some(word) => Some(word.parse::<Direction>().ok()?),
                None => None,
            };
            Some(Parameter::Scan {
                table,
                column,
                direction,
            })
        }
        "info" => {
            if rest.is_empty() {
                return None;
            }
            Some(Parameter::Info {
                table: rest.to_string(),
            })
        }
        "help" => Some(Parameter::Help),
        _ => None,
    }
}

async fn process_parameter(db: &ChunkDb, owner: &str, parameter: &Parameter) -> Result<()> {
    match parameter {
        Parameter::CreateTable {
            name,
            columns,
            bid,
            replication,
            encrypted,
        } => {
            let columns: Vec<ColumnSpec> = serde_json::from_str(columns)?;
            db.create_table(owner, name, &columns, *bid, *replication, *encrypted)
                .await?;
            println!("created: {name}");
        }
        Parameter::Put { table, row } => {
            let row: Row = serde_json::from_str(row)?;
            db.put(owner, table, &row).await?;
            println!("ok");
        }
        Parameter::Insert { table, row } => {
            let row: Row = serde_json::from_str(row)?;
            db.insert(owner, table, &row).await?;
            println!("ok");
        }
        Parameter::Get { table, key } => match db.get(owner, table, &parse_key(key)).await? {
            Some(row) => println!("{}", serde_json::to_string(&row)?),
            None => println!("not found"),
        },
        Parameter::Delete { table, key } => {
            if db.delete(owner, table, &parse_key(key)).await? {
                println!("deleted: {key}");
            } else {
                println!("not found");
            }
        }
        Parameter::Scan {
            table,
            column,
            direction,
        } => {
            let direction = match direction {
                Some(direction) => *direction,
                None => Direction::Ascending,
            };
            let mut records = 0usize;
            db.scan(owner, table, column, direction, |key, value| {
                println!("{records}: {key} -> {value}");
                records += 1;
                ControlFlow::Continue(())
            })
            .await?;
            println!("{records} records");
        }
        Parameter::Info { table } => {
            let table = db.open_table(owner, table).await?;
            for column in table.table_info().await {
                let primary = if column.primary { " (primary)" } else { "" };
                println!(
                    "{}: {:?} via {:?}{primary}",
                    column.name, column.column_type, column.index_kind
                );
            }
        }
        Parameter::Help => {
            let help = Cli::command().render_help().to_string();

            let mut print_it = false;

            for line in help.lines() {
                if line.starts_with("Arguments:") {
                    print_it = false;
                }
                if print_it && !line.is_empty() {
                    println!("{line}");
                }
                if line.starts_with("Commands:") {
                    print_it = true;
                }
            }
        }
    }
    Ok(())
}

async fn interactive(db: ChunkDb, owner: &str) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.load_history(&file_location) {
            println!("error loading history: {e}");
        }
    }
    println!("terminate with ctrl-c or ctrl-d");
    loop {
        let readline = rl.readline("chunkdb: ");
        match readline {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Some(parameter) => {
                        if let Err(e) = process_parameter(&db, owner, &parameter).await {
                            println!("error: {e:#}");
                        }
                    }
                    None => println!(
                        "usage: create-table <name> <columns-json> | put <table> <row-json> | \
                         insert <table> <row-json> | get <table> <key> | delete <table> <key> | \
                         scan <table> <column> [<direction>] | info <table> | help"
                    ),
                }
                rl.add_history_entry(line.as_str())?;
            }
            Err(ReadlineError::Interrupted) => {
                println!("terminating...");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("terminating...");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
    if let Some(file_location) = get_history_file() {
        if let Err(e) = rl.save_history(&file_location) {
            println!("error saving history: {e}");
        }
    }
    Ok(())
}

/// Exit codes per the wire contract: 1 io-error, 2 not-found,
/// 3 duplicate-key, 4 invalid-request, 5 invalid-schema.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(db_err) = err.downcast_ref::<ChunkDbError>() {
        return db_err.exit_code();
    }
    // Malformed JSON input is an invalid request, not an I/O failure.
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return 4;
    }
    1
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "chunkdb.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    let db = match ChunkDb::open(&cli.database).await {
        Ok(db) => db,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::from(exit_code(&err));
        }
    };

    let result = match &cli.parameter {
        Some(parameter) => process_parameter(&db, &cli.owner, parameter).await,
        None => interactive(db, &cli.owner).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}
