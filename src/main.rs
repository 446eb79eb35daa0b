use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use askql::agent::DataAgent;
use askql::config::{AppConfig, StoreKind};
use askql::conversation::Conversation;
use askql::export;
use askql::load::build_database;
use askql::{Guard, GuardError, GuardedResult};

/// Ask questions of the Olist dataset in plain language. Model-written SQL
/// only ever runs as one bounded, read-only SELECT.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (default: <config dir>/askql/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more (-v info, -vv debug). RUST_LOG applies otherwise.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question
    Ask {
        question: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Interactive session; earlier questions are kept as context
    Chat,
    /// Guard text without executing it and print the resulting SQL
    Check {
        /// Model output to check (stdin when omitted)
        text: Option<String>,
    },
    /// Guard and execute SQL text directly, without a model
    Run {
        /// Statement or model output (stdin when omitted)
        text: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Print the schema description sent to the model
    Schema,
    /// Build the SQLite dataset from the Olist CSV files
    Load {
        #[arg(long)]
        csv_dir: PathBuf,
        #[arg(long, default_value = "olist.db")]
        out_db: PathBuf,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Load { csv_dir, out_db } => {
            let report = build_database(&csv_dir, &out_db)?;
            for (table, rows) in &report.tables {
                println!("{:<40} {:>9} rows", table, rows);
            }
            for file in &report.skipped {
                eprintln!("skipped missing {}", file);
            }
            println!("Built {}", out_db.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { text } => {
            let raw = input_text(text)?;
            let guard = Guard::new(config.policy()?);
            match guard.prepare(&raw) {
                Ok(stmt) => {
                    println!("{}", stmt.sql);
                    if stmt.display != stmt.sql {
                        println!("\n{}", stmt.display);
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_failure(&err, OutputFormat::Table)),
            }
        }
        Command::Run { text, format } => {
            let raw = input_text(text)?;
            resolve_password(&mut config)?;
            let guard = Guard::new(config.policy()?);
            let store = config.data_store();
            match guard.run(&raw, store.as_ref(), config.query.timeout()).await {
                Ok(done) => {
                    print_result(&done, format)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_failure(&err, format)),
            }
        }
        Command::Schema => {
            resolve_password(&mut config)?;
            let store = config.data_store();
            let schema = store
                .describe_schema()
                .await
                .with_context(|| format!("Failed to describe {}", store.label()))?;
            println!("{}", schema);
            Ok(ExitCode::SUCCESS)
        }
        Command::Ask { question, format } => {
            resolve_password(&mut config)?;
            let agent = DataAgent::from_config(&config)?;
            let mut conversation = Conversation::new();
            let reply = agent.answer(&question, &mut conversation).await;
            match reply.outcome {
                Ok(done) => {
                    print_result(&done, format)?;
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => Ok(report_failure(&err, format)),
            }
        }
        Command::Chat => {
            resolve_password(&mut config)?;
            let agent = DataAgent::from_config(&config)?;
            chat(&agent).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn chat(agent: &DataAgent) -> Result<()> {
    let mut conversation = Conversation::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    eprintln!(
        "askql on {} via {}. Empty line or 'exit' to quit, ':clear' to forget context.",
        agent.store().label(),
        agent.model().provider()
    );
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        match question {
            "" | "exit" | "quit" => break,
            ":clear" => {
                conversation.clear();
                continue;
            }
            _ => {}
        }

        let reply = agent.answer(question, &mut conversation).await;
        match reply.outcome {
            Ok(done) => print_result(&done, OutputFormat::Table)?,
            Err(err) => {
                report_failure(&err, OutputFormat::Table);
            }
        }
        println!();
    }
    Ok(())
}

fn input_text(text: Option<String>) -> Result<String> {
    match text {
        Some(text) => Ok(text),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// PGPASSWORD is already applied by the config loader; prompt otherwise.
fn resolve_password(config: &mut AppConfig) -> Result<()> {
    let pg = &mut config.store.postgres;
    if config.store.kind == StoreKind::Postgres && pg.password.is_empty() {
        let prompt = format!("Password for {}: ", pg.display_string());
        pg.password = rpassword::read_password_from_tty(Some(&prompt))?;
    }
    Ok(())
}

fn print_result(done: &GuardedResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}\n", done.statement.display);
            if done.result.is_empty() {
                println!("No rows returned.");
            } else {
                print!("{}", export::to_table(&done.result));
            }
        }
        OutputFormat::Csv => print!("{}", export::to_csv(&done.result)?),
        OutputFormat::Json => println!("{}", export::to_json(&done.result, &done.statement.sql)?),
    }
    Ok(())
}

fn report_failure(err: &GuardError, format: OutputFormat) -> ExitCode {
    let failure = err.to_failure();
    if format == OutputFormat::Json {
        if let Ok(json) = serde_json::to_string_pretty(&failure) {
            println!("{}", json);
        }
    } else {
        eprintln!("{}: {}", failure.kind, failure.message);
        if let Some(sql) = &failure.offending_sql {
            eprintln!("\n{}", sql);
        }
    }
    ExitCode::from(1)
}
